pub mod config;
pub mod error;
pub mod types;

pub use error::{CapsuleError, CapsuleResult};
pub use types::{ItemId, OutgoingFile, ProgressFn};
