use thiserror::Error;

/// Failure kinds of a backup run. Each variant is scoped to the unit of work
/// it aborts: an entry, a connection, a single database or a retention scope.
#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Dump failed: {0}")]
    Dump(String),

    #[error("Compression failed: {0}")]
    Compression(String),

    #[error("Upload failed: {0}")]
    Upload(String),

    #[error("Retention failed: {0}")]
    Retention(String),

    #[error("Session termination failed: {0}")]
    Termination(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BackupError {
    pub fn kind(&self) -> &'static str {
        match self {
            BackupError::Config(_) => "config",
            BackupError::Connection(_) => "connection",
            BackupError::Dump(_) => "dump",
            BackupError::Compression(_) => "compression",
            BackupError::Upload(_) => "upload",
            BackupError::Retention(_) => "retention",
            BackupError::Termination(_) => "termination",
            BackupError::Io(_) => "io",
        }
    }
}

impl From<url::ParseError> for BackupError {
    fn from(err: url::ParseError) -> Self {
        BackupError::Config(format!("invalid PostgreSQL DSN: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
