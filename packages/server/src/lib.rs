// Workflow-engine provisioning service
//
// Provisions one isolated workflow-engine container per subscriber behind a
// shared TLS-terminating reverse proxy. Creation runs asynchronously through
// a durable AMQP queue; progress is bridged to SSE followers via a TTL-bounded
// job store in Redis. The container daemon is the single source of truth for
// instance state — there is no separate database.

pub mod config;
pub mod kernel;
pub mod server;

pub use config::Config;
