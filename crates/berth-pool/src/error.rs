use berth_common::error::CommonError;
use thiserror::Error;

pub type PoolResult<T> = Result<T, PoolError>;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("internal error: {0}")]
    InternalError(String),
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("configuration error: {0}")]
    CommonError(#[from] CommonError),
    #[error("no free port available in the configured worker port range")]
    OutOfPorts,
}
