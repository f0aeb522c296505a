pub mod error;
pub mod types;

pub use error::{FailureKind, MigrateError, Result, StorageError};
pub use types::{MigrationUnit, Payload, TargetConfig};
