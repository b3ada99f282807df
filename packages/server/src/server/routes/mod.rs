// HTTP routes
pub mod health;
pub mod info;
pub mod instances;
pub mod jobs;

pub use health::*;
pub use info::*;
pub use instances::*;
pub use jobs::*;
