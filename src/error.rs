use crate::services::{broker::BrokerError, inference::InferenceError, storage::StorageError};

/// Fatal startup and steady-state errors. Any of these ends the process with
/// a non-zero exit status.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("configuration error: {0}")]
    Config(#[from] envy::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Model(#[from] InferenceError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("failed to install metrics exporter: {0}")]
    Metrics(String),
}
