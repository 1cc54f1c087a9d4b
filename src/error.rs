use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("config invalid: {0}")]
    InvalidConfig(String),
    #[error("directory unusable: {0}")]
    UnusableDirectory(String),
    #[error("lock store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("reporting api error: {0}")]
    Api(String),
}
