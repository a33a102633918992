use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Receipt not found or claim expired: {0}")]
    NotFound(String),

    #[error("Store is stopped")]
    Stopped,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
