use std::io;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("bad tag {0:?}")]
    BadTag(String),
    #[error("worker is not ready: {0} before setBundle")]
    NotReady(String),
    #[error("worker already initialized")]
    AlreadyInitialized,
    #[error("frame of {0} bytes exceeds the frame limit")]
    FrameTooLarge(usize),
    #[error("worker channel i/o: {0}")]
    Io(#[from] io::Error),
    #[error("frame encoding: {0}")]
    Cbor(#[from] serde_cbor::Error),
    #[error("worker {0} exited")]
    WorkerExited(String),
    #[error("worker reported: {0}")]
    Remote(String),
}

impl ProtocolError {
    /// True when the channel can no longer carry frames.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProtocolError::Malformed(_)
                | ProtocolError::FrameTooLarge(_)
                | ProtocolError::Io(_)
                | ProtocolError::Cbor(_)
                | ProtocolError::WorkerExited(_)
        )
    }
}
