// Kernel — infrastructure the HTTP surface and background tasks share.
//
// Everything here talks to an external system (container daemon, broker,
// Redis, image registry) or orchestrates those that do. Business rules about
// what an instance looks like live in `instance`; HTTP concerns stay out.

pub mod cleanup;
pub mod infra;
pub mod instance;
pub mod jobs;
pub mod registry;
pub mod runtime;

pub use instance::InstanceManager;
pub use jobs::{JobPublisher, JobStore, ProvisioningWorker, RedisJobStore};
pub use runtime::{RuntimeClient, RuntimeError};
