use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("configuration invalid: {0}")]
    ConfigInvalid(String),

    #[error("database error: {0}")]
    Database(String),
}

pub type RelayResult<T> = Result<T, RelayError>;
