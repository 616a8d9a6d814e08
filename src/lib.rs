pub mod cim;
pub mod config;
pub mod error;
pub mod logger;
pub mod migration;
pub mod mof;

pub use error::MigrateError;

pub type Result<T> = std::result::Result<T, MigrateError>;

// Convenience re-exports for the migration call sequence
pub use cim::{CimClient, CimConnection, CimInstanceName};
pub use migration::{MigrationSettings, MigrationType, VirtType};
