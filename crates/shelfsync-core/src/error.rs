use thiserror::Error;

/// All errors that can occur in shelfsync-core.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Record not found: {0}")]
    RecordNotFound(String),

    #[error("Task not found: {0}")]
    TaskNotFound(i64),

    #[error("Invalid task transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: i64,
        from: String,
        to: String,
    },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

/// Process exit codes used by the CLI and worker.
#[repr(i32)]
pub enum ExitCode {
    Success = 0,
    GeneralError = 1,
    NotFound = 2,
    InvalidArgs = 3,
    ConfigError = 4,
    NetworkError = 6,
}

pub type Result<T> = std::result::Result<T, CatalogError>;
