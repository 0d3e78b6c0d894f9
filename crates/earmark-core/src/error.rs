use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid batch size: {0}")]
    InvalidBatchSize(usize),

    #[error("Invalid persist mode: {0}")]
    InvalidPersistMode(String),

    #[error("Invalid tag schema: {0}")]
    InvalidTagSchema(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
