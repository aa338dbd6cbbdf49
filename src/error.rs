use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum GridError {
    #[error("Invalid job: {0}")]
    InvalidJob(String),

    #[error("Queue is closed to new submissions")]
    QueueClosed,

    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Not authorized: {0}")]
    NotAuthorized(String),

    #[error("Kill of job {job_id} timed out after {polls} polls")]
    KillTimeout { job_id: Uuid, polls: u32 },

    #[error("Database error: {0}")]
    Db(String),

    #[error("Bus error: {0}")]
    Bus(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, GridError>;
