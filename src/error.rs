use thiserror::Error;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("job already exists: {0}")]
    Conflict(String),

    #[error("job not found: {0}")]
    NotFound(String),

    /// Bounded blocking pop expired with the pending list empty.
    /// A normal signal, not a failure.
    #[error("queue timeout")]
    QueueTimeout,

    #[error("queue error: {0}")]
    Queue(#[from] redis::RedisError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("coordination error: {0}")]
    Coordination(#[from] etcd_client::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),
}

impl From<SchedulerError> for tonic::Status {
    fn from(err: SchedulerError) -> Self {
        match err {
            SchedulerError::InvalidInput(msg) => tonic::Status::invalid_argument(msg),
            SchedulerError::NotFound(id) => {
                tonic::Status::not_found(format!("job not found: {id}"))
            }
            SchedulerError::Conflict(id) => {
                tonic::Status::already_exists(format!("job already exists: {id}"))
            }
            other => tonic::Status::internal(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
