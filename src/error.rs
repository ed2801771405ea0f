use thiserror::Error;

#[derive(Error, Debug)]
pub enum SmuError {
    /// Sample buffer over/underrun, or a write that could not be queued in time.
    #[error("dataflow error: {0}")]
    Dataflow(String),

    #[error("session error: {0}")]
    Session(String),

    #[error("invalid channel: {0}")]
    InvalidChannel(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SmuError {
    pub fn is_dataflow(&self) -> bool {
        matches!(self, SmuError::Dataflow(_))
    }
}
