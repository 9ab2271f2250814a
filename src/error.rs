use thiserror::Error;

#[derive(Error, Debug)]
pub enum DiscoError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Parsing error: {0}")]
    Parsing(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store already shut down")]
    ShutDown,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<reqwest::Error> for DiscoError {
    fn from(err: reqwest::Error) -> Self {
        DiscoError::Upstream(err.to_string())
    }
}

impl From<serde_json::Error> for DiscoError {
    fn from(err: serde_json::Error) -> Self {
        DiscoError::Parsing(err.to_string())
    }
}

impl From<tokio::task::JoinError> for DiscoError {
    fn from(err: tokio::task::JoinError) -> Self {
        DiscoError::Internal(err.to_string())
    }
}
