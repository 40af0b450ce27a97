use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store backend error: {0}")]
    Backend(String),

    #[error("Already exists: {0}")]
    Duplicate(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;
