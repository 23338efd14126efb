use thiserror::Error;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Failed to load configuration")]
    Settings(#[from] config::ConfigError),

    #[error(transparent)]
    Connector(#[from] cellar_common::Error),

    #[error("Unsupported store endpoint {0}")]
    UnsupportedEndpoint(String),

    #[error("Worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("An internal error occurred: {0}")]
    Internal(String),
}

impl From<cellar_common::ConfigError> for WorkerError {
    fn from(err: cellar_common::ConfigError) -> Self {
        WorkerError::Connector(cellar_common::Error::Config(err))
    }
}

pub type Result<T> = std::result::Result<T, WorkerError>;
