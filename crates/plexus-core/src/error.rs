use thiserror::Error;

/// Errors produced by the plexus protocol and session layers.
#[derive(Debug, Error)]
pub enum PlexusError {
    #[error("connection rejected: {0}")]
    ConnectionRejected(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("encode error: {0}")]
    Encode(String),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("transport read error: {0}")]
    TransportRead(String),

    #[error("transport write error: {0}")]
    TransportWrite(String),

    #[error("registry closed")]
    RegistryClosed,

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl PlexusError {
    /// Whether a session can keep running after this error.
    ///
    /// Malformed or oversized inbound frames only cost the frame itself;
    /// everything else ends the pump that observed it.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Decode(_) | Self::FrameTooLarge { .. })
    }
}

impl From<serde_json::Error> for PlexusError {
    fn from(e: serde_json::Error) -> Self {
        PlexusError::Decode(e.to_string())
    }
}

impl From<ciborium::de::Error<std::io::Error>> for PlexusError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        PlexusError::Decode(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for PlexusError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        PlexusError::Encode(e.to_string())
    }
}

pub type PlexusResult<T> = Result<T, PlexusError>;
