use thiserror::Error;

pub type Result<T, E = TransportError> = core::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(String),
    #[error("timeout")]
    Timeout,
    #[error("invalid frame: {0}")]
    InvalidFrame(&'static str),
    #[error("bitrate {0} bit/s rejected by adapter")]
    BitrateRejected(u32),
    #[error("adapter not started")]
    NotStarted,
}

impl TransportError {
    /// `true` for the "no frame available yet" signal of a timed read.
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout)
    }
}
