//! Error types for mesh bridge operations
//!
//! Errors are grouped by the layer that produces them:
//!
//! - **Transport** errors are link-level and retryable with backoff.
//! - **Codec** errors describe malformed frames; the decoder resynchronizes
//!   and the session continues.
//! - **AI service** errors come from the completion backend and are surfaced
//!   as notifications, never blocking mesh traffic.
//! - **Configuration** errors are fatal at connect time and are raised before
//!   any resource is acquired.

use thiserror::Error;

/// Main error type for mesh bridge operations
#[derive(Error, Debug)]
pub enum MeshError {
    // ===== Transport Errors =====
    /// Serial port not found
    #[error("Serial port not found: {0}")]
    PortNotFound(String),

    /// Link could not be opened
    #[error("Failed to open {target}: {reason}")]
    OpenFailed {
        /// Port path, socket address or BLE address
        target: String,
        /// Failure reason
        reason: String,
    },

    /// Link read error
    #[error("Link read error: {0}")]
    ReadError(String),

    /// Link write error
    #[error("Link write error: {0}")]
    WriteError(String),

    /// Link is not connected
    #[error("Link disconnected")]
    Disconnected,

    /// Connection timeout
    #[error("Connection timeout after {duration_ms}ms")]
    ConnectionTimeout {
        /// Timeout duration in milliseconds
        duration_ms: u64,
    },

    /// Write was not acknowledged by the link task in time
    #[error("Write acknowledgment timeout after {duration_ms}ms")]
    WriteTimeout {
        /// Timeout duration in milliseconds
        duration_ms: u64,
    },

    /// Reconnection attempts exhausted
    #[error("Reconnection failed after {attempts} attempts")]
    ReconnectExhausted {
        /// Number of attempts made
        attempts: u32,
    },

    // ===== Codec Errors =====
    /// Malformed frame (bad checksum, truncated, oversized)
    #[error("Malformed frame: {0}")]
    Malformed(String),

    /// Frame checksum mismatch
    #[error("Checksum mismatch: expected 0x{expected:04X}, got 0x{got:04X}")]
    ChecksumMismatch {
        /// Checksum carried by the frame
        expected: u16,
        /// Checksum computed over the payload
        got: u16,
    },

    /// Payload does not fit in a single frame
    #[error("Message too large: {size} bytes exceeds maximum of {max} bytes")]
    MessageTooLarge {
        /// Actual message size
        size: usize,
        /// Maximum allowed size
        max: usize,
    },

    // ===== AI Service Errors =====
    /// Completion backend unreachable
    #[error("Cannot connect to completion service at {url}: {reason}")]
    AiUnavailable {
        /// Endpoint that was tried
        url: String,
        /// Failure reason
        reason: String,
    },

    /// Configured model not installed on the backend
    #[error("Model '{0}' not found on completion service")]
    ModelNotFound(String),

    /// Completion backend returned an error status or an unusable body
    #[error("Completion service error: {0}")]
    AiService(String),

    /// Completion did not arrive within the configured timeout
    #[error("Completion timed out after {duration_ms}ms")]
    AiTimeout {
        /// Timeout duration in milliseconds
        duration_ms: u64,
    },

    /// Request was cancelled (session closed)
    #[error("AI request cancelled: {0}")]
    Cancelled(String),

    // ===== Registry Errors =====
    /// Message references a node the registry has never seen
    #[error("Unknown node: !{0:08x}")]
    UnknownNode(u32),

    /// Channel index outside the radio's channel table
    #[error("Invalid channel index: {0}")]
    InvalidChannel(u8),

    /// Message id not present in any channel history
    #[error("Unknown message: {0}")]
    UnknownMessage(u64),

    /// Delivery state change not allowed from the current state
    #[error("Invalid delivery transition: {from} -> {to}")]
    InvalidTransition {
        /// Current state
        from: String,
        /// Requested state
        to: String,
    },

    // ===== Configuration Errors =====
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Missing required configuration
    #[error("Missing required configuration: {0}")]
    MissingConfig(String),

    // ===== Session Errors =====
    /// No session is connected
    #[error("No active session")]
    NotConnected,

    /// A session is already connected
    #[error("Session already connected")]
    AlreadyConnected,

    // ===== General Errors =====
    /// Internal channel send error
    #[error("Channel send error: {0}")]
    ChannelError(String),

    /// Internal channel closed
    #[error("Channel closed")]
    ChannelClosed,

    /// IO error wrapper
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error wrapper
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl MeshError {
    /// Check if this error is recoverable by retrying the link
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            MeshError::ConnectionTimeout { .. }
                | MeshError::WriteTimeout { .. }
                | MeshError::Disconnected
                | MeshError::ReadError(_)
                | MeshError::WriteError(_)
                | MeshError::OpenFailed { .. }
                | MeshError::PortNotFound(_)
                | MeshError::Io(_)
        )
    }

    /// Check if this is a codec error (bad data from the radio)
    pub fn is_codec_error(&self) -> bool {
        matches!(
            self,
            MeshError::Malformed(_)
                | MeshError::ChecksumMismatch { .. }
                | MeshError::MessageTooLarge { .. }
        )
    }

    /// Check if this error came from the completion backend
    pub fn is_ai_error(&self) -> bool {
        matches!(
            self,
            MeshError::AiUnavailable { .. }
                | MeshError::ModelNotFound(_)
                | MeshError::AiService(_)
                | MeshError::AiTimeout { .. }
                | MeshError::Cancelled(_)
        )
    }

    /// Check if this is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            MeshError::InvalidConfig(_) | MeshError::MissingConfig(_)
        )
    }

    /// Get an error code for logging
    pub fn error_code(&self) -> &'static str {
        match self {
            MeshError::PortNotFound(_) => "PORT_NOT_FOUND",
            MeshError::OpenFailed { .. } => "OPEN_FAILED",
            MeshError::ReadError(_) => "READ_ERROR",
            MeshError::WriteError(_) => "WRITE_ERROR",
            MeshError::Disconnected => "DISCONNECTED",
            MeshError::ConnectionTimeout { .. } => "CONNECTION_TIMEOUT",
            MeshError::WriteTimeout { .. } => "WRITE_TIMEOUT",
            MeshError::ReconnectExhausted { .. } => "RECONNECT_EXHAUSTED",
            MeshError::Malformed(_) => "MALFORMED_FRAME",
            MeshError::ChecksumMismatch { .. } => "CHECKSUM_MISMATCH",
            MeshError::MessageTooLarge { .. } => "MESSAGE_TOO_LARGE",
            MeshError::AiUnavailable { .. } => "AI_UNAVAILABLE",
            MeshError::ModelNotFound(_) => "MODEL_NOT_FOUND",
            MeshError::AiService(_) => "AI_SERVICE_ERROR",
            MeshError::AiTimeout { .. } => "AI_TIMEOUT",
            MeshError::Cancelled(_) => "CANCELLED",
            MeshError::UnknownNode(_) => "UNKNOWN_NODE",
            MeshError::InvalidChannel(_) => "INVALID_CHANNEL",
            MeshError::UnknownMessage(_) => "UNKNOWN_MESSAGE",
            MeshError::InvalidTransition { .. } => "INVALID_TRANSITION",
            MeshError::InvalidConfig(_) => "INVALID_CONFIG",
            MeshError::MissingConfig(_) => "MISSING_CONFIG",
            MeshError::NotConnected => "NOT_CONNECTED",
            MeshError::AlreadyConnected => "ALREADY_CONNECTED",
            MeshError::ChannelError(_) => "CHANNEL_ERROR",
            MeshError::ChannelClosed => "CHANNEL_CLOSED",
            MeshError::Io(_) => "IO_ERROR",
            MeshError::Json(_) => "JSON_ERROR",
        }
    }
}

/// Result type alias for mesh bridge operations
pub type Result<T> = std::result::Result<T, MeshError>;

// Conversion from reqwest errors raised by the completion client
impl From<reqwest::Error> for MeshError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            MeshError::AiTimeout { duration_ms: 0 }
        } else if err.is_connect() {
            MeshError::AiUnavailable {
                url: err
                    .url()
                    .map(|u| u.to_string())
                    .unwrap_or_else(|| "unknown".to_string()),
                reason: err.to_string(),
            }
        } else {
            MeshError::AiService(err.to_string())
        }
    }
}

// Conversion from serialport error (only when serial feature is enabled)
#[cfg(feature = "serial")]
impl From<serialport::Error> for MeshError {
    fn from(err: serialport::Error) -> Self {
        match err.kind {
            serialport::ErrorKind::NoDevice => MeshError::PortNotFound(err.description),
            serialport::ErrorKind::Io(kind) => {
                MeshError::Io(std::io::Error::new(kind, err.description))
            }
            _ => MeshError::OpenFailed {
                target: String::new(),
                reason: err.description,
            },
        }
    }
}

// Conversion from tokio mpsc send error
impl<T> From<tokio::sync::mpsc::error::SendError<T>> for MeshError {
    fn from(err: tokio::sync::mpsc::error::SendError<T>) -> Self {
        MeshError::ChannelError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = MeshError::PortNotFound("/dev/ttyUSB0".to_string());
        assert_eq!(err.error_code(), "PORT_NOT_FOUND");
        assert_eq!(MeshError::ModelNotFound("x".into()).error_code(), "MODEL_NOT_FOUND");
    }

    #[test]
    fn test_taxonomy() {
        assert!(MeshError::Disconnected.is_retriable());
        assert!(MeshError::ConnectionTimeout { duration_ms: 5000 }.is_retriable());
        assert!(!MeshError::Malformed("short".into()).is_retriable());

        assert!(MeshError::ChecksumMismatch { expected: 1, got: 2 }.is_codec_error());
        assert!(!MeshError::Disconnected.is_codec_error());

        assert!(MeshError::AiTimeout { duration_ms: 10 }.is_ai_error());
        assert!(MeshError::MissingConfig("tcp host".into()).is_config_error());
        assert!(!MeshError::MissingConfig("tcp host".into()).is_retriable());
    }

    #[test]
    fn test_display() {
        let err = MeshError::MessageTooLarge { size: 600, max: 512 };
        assert!(err.to_string().contains("600"));
        assert!(err.to_string().contains("512"));
        assert_eq!(MeshError::UnknownNode(0xdeadbeef).to_string(), "Unknown node: !deadbeef");
    }
}
