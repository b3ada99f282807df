// Asynchronous provisioning pipeline: payloads, store, queue and worker
pub mod events;
pub mod queue;
pub mod store;
pub mod worker;

pub use events::*;
pub use queue::{JobPublisher, QUEUE_NAME};
pub use store::{ActiveJob, JobStore, MemoryJobStore, RedisJobStore};
pub use worker::ProvisioningWorker;
