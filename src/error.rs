use thiserror::Error;

/// Main error type for the coordination core
#[derive(Error, Debug)]
pub enum ForgeError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // State machine errors
    #[error("Invalid state transition: from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Unknown status: {0}")]
    UnknownStatus(String),

    // Validation errors
    #[error("Validation failed: {0}")]
    Validation(String),

    // Trading-execution client errors
    #[error("Execution client error: {0}")]
    Execution(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias for ForgeError
pub type Result<T> = std::result::Result<T, ForgeError>;
