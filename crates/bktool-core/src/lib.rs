pub mod config;
pub mod error;
pub mod types;

pub use error::{BkError, BkResult};
pub use types::{EntryKind, FailurePolicy, Mode};
