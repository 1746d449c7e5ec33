//! Error types for consultation call sessions

/// Result type alias using the crate [`Error`]
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while setting up or running a call session
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Neither camera+microphone nor microphone alone could be opened
    #[error("Media unavailable: {0}")]
    MediaUnavailable(String),

    /// Generic signaling failure (message could not be produced or delivered)
    #[error("Signaling error: {0}")]
    SignalingError(String),

    /// Persistent channel (WebSocket) error
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    /// Relay REST call failed or returned a non-2xx status
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// Relay rejected the bearer token
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Relay rejected a room operation
    #[error("Room error: {0}")]
    RoomError(String),

    /// Every relay transport is exhausted
    #[error("Relay unavailable: {0}")]
    RelayUnavailable(String),

    /// SDP negotiation error (bad description, wrong signaling state)
    #[error("SDP negotiation error: {0}")]
    SdpError(String),

    /// ICE candidate error
    #[error("ICE candidate error: {0}")]
    IceCandidateError(String),

    /// Peer connection error
    #[error("Peer connection error: {0}")]
    PeerConnectionError(String),

    /// Operation timeout
    #[error("Operation timeout: {0}")]
    OperationTimeout(String),

    /// The session was already ended
    #[error("Session ended: {0}")]
    SessionEnded(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// WebRTC library error
    #[error("WebRTC error: {0}")]
    WebRtcError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Check if this error is worth retrying on the same transport
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::SignalingError(_)
                | Error::WebSocketError(_)
                | Error::HttpError(_)
                | Error::OperationTimeout(_)
                | Error::RelayUnavailable(_)
                | Error::Io(_)
        )
    }

    /// Check if this error prevents the session from starting at all
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::MediaUnavailable(_) | Error::InvalidConfig(_) | Error::SessionEnded(_)
        )
    }

    /// Check if this error counts toward the negotiation error threshold
    pub fn is_negotiation_error(&self) -> bool {
        matches!(
            self,
            Error::SdpError(_) | Error::IceCandidateError(_) | Error::PeerConnectionError(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::SerializationError(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::OperationTimeout(e.to_string())
        } else {
            Error::HttpError(e.to_string())
        }
    }
}

impl From<webrtc::Error> for Error {
    fn from(e: webrtc::Error) -> Self {
        Error::WebRtcError(e.to_string())
    }
}
