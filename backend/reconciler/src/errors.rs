//! Application-wide error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReconcilerError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Engine error: {0}")]
    Engine(#[from] funding_engine::Error),

    #[error("Journal record error: {0}")]
    Record(String),
}

pub type Result<T> = std::result::Result<T, ReconcilerError>;
