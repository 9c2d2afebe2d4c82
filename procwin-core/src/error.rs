use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("Config Error - {0}")]
    Config(String),

    #[error("Aggregate Error - {0}")]
    Aggregate(String),

    #[error("Unsupported Error - {0}")]
    Unsupported(String),

    #[error("PaneInUse Error - pane starting at {start_millis} is still referenced by {refs} window(s)")]
    PaneInUse { start_millis: i64, refs: usize },

    #[error("Partition Error - {0}")]
    Partition(String),

    #[error("Metrics Error - {0}")]
    Metrics(String),
}

impl From<tokio::task::JoinError> for Error {
    fn from(value: tokio::task::JoinError) -> Self {
        Error::Partition(format!("partition task failed to join: {value}"))
    }
}
