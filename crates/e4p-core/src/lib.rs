//! e4p-core: shared types, config schema, and error taxonomy for the
//! E4P encryption engine.

pub mod config;
pub mod error;
pub mod types;

pub use config::E4pConfig;
pub use error::{E4pError, E4pResult};
pub use types::{Algorithm, TaskId, TaskStatus};
