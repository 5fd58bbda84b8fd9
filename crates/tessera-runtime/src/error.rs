use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("Scheduler is shutting down")]
    ShuttingDown,

    #[error("No tokio runtime available: {0}")]
    NoRuntime(String),
}
