use thiserror::Error;

/// Failures raised by platform session primitives
#[derive(Debug, Error)]
pub enum PlatformError {
    /// The session handle outlived the session (owning app exited, player vanished)
    #[error("media session {0} is no longer available")]
    StaleSession(String),

    #[error("platform media service unavailable: {0}")]
    Unavailable(String),

    #[error("platform command failed: {0}")]
    Command(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Failures while re-encoding artwork
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("bitmap of {width}x{height} does not match {len} bytes of RGBA data")]
    BitmapSize { width: u32, height: u32, len: usize },

    #[error(transparent)]
    Image(#[from] image::ImageError),
}

/// Errors that cross the command boundary to the embedding application
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum BridgeError {
    #[error("{0}")]
    InvalidArgument(String),

    #[error("method {0} is not implemented")]
    NotImplemented(String),

    #[error("media engine is not running")]
    EngineStopped,
}

impl BridgeError {
    /// Error code sent over the transport
    pub fn code(&self) -> &'static str {
        match self {
            BridgeError::InvalidArgument(_) => "INVALID_ARGUMENT",
            BridgeError::NotImplemented(_) => "NOT_IMPLEMENTED",
            BridgeError::EngineStopped => "ENGINE_STOPPED",
        }
    }
}
