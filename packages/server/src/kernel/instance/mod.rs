// Instance naming, projections and lifecycle operations
pub mod manager;
pub mod spec;

pub use manager::*;
pub use spec::*;
