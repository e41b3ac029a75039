//! Error types for buffer streams

use sluice_ipc::ChannelError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StreamError {
    /// The server refused or failed to create the stream
    #[error("can not create buffer stream: {0}")]
    Creation(String),

    /// A delivered buffer carried an error marker
    #[error("buffer stream received buffer with error: {0}")]
    BufferDelivery(String),

    /// The connection to the server is gone
    #[error("disconnected: no new buffers")]
    Disconnected,

    /// The caller broke the stream's contract
    #[error("invalid use of buffer stream: {0}")]
    Misuse(String),

    /// The platform could not import or map a buffer
    #[error("platform buffer error: {0}")]
    Platform(String),

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

impl StreamError {
    pub(crate) fn misuse(msg: impl Into<String>) -> Self {
        Self::Misuse(msg.into())
    }
}

pub type Result<T, E = StreamError> = std::result::Result<T, E>;
