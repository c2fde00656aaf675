//! shelfsync core: catalog models, normalization, configuration, and the
//! SQLite store holding catalog records, the download queue, and the ledger.

pub mod config;
pub mod error;
pub mod models;
pub mod normalize;
pub mod storage;

pub use config::{AppConfig, BlobBackend};
pub use error::{CatalogError, ExitCode, Result};
pub use models::*;

pub use storage::database::{ConnectionPool, Database, open_database, open_in_memory};
pub use storage::repositories::{
    LedgerRepository, RecordRepository, Repository, SqliteLedgerRepository,
    SqliteRecordRepository, SqliteTaskRepository, TaskRepository,
};
