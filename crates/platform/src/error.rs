//! Error types for skiff

use std::fmt;

/// Unified error type for all skiff operations
#[derive(Debug)]
pub enum SkiffError {
    /// I/O error on the underlying byte stream
    Io(std::io::Error),

    /// Configuration error
    Config(String),

    /// A message failed to parse: truncation, bad length, or an
    /// out-of-domain enumerant
    MalformedMessage(String),

    /// A message of the wrong type arrived during a strict protocol phase
    UnexpectedMessage {
        /// Message type byte that the current phase requires
        expected: u8,
        /// Message type byte that actually arrived
        got: u8,
    },

    /// A negotiation category had no algorithm common to both peers
    NoCommonAlgorithm(String),

    /// The host key failed signature verification or was refused by the
    /// configured checker
    HostKeyRejected(String),

    /// A key-exchange public value was outside its legal domain (DH value
    /// outside (0, p), EC point off-curve or at infinity)
    KexParameterOutOfBounds(String),

    /// A window adjustment would wrap the 32-bit window counter
    WindowOverflow,

    /// An inbound channel open could not be serviced (unknown forward,
    /// unparseable address, impossible packet size)
    ConnectionFailed(String),

    /// An inbound channel open named a channel type we do not support
    UnknownChannelType(String),

    /// The peer answered a global request with a failure
    RequestFailed,

    /// Operation on a channel that is already closed
    ChannelClosed,

    /// Cryptographic failure (key setup, MAC mismatch, signature malformed)
    Security(String),
}

impl fmt::Display for SkiffError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkiffError::Io(e) => write!(f, "IO error: {}", e),
            SkiffError::Config(msg) => write!(f, "Configuration error: {}", msg),
            SkiffError::MalformedMessage(msg) => write!(f, "Malformed message: {}", msg),
            SkiffError::UnexpectedMessage { expected, got } => {
                write!(f, "Unexpected message type {} (expected {})", got, expected)
            }
            SkiffError::NoCommonAlgorithm(category) => {
                write!(f, "No common algorithm for {}", category)
            }
            SkiffError::HostKeyRejected(msg) => write!(f, "Host key rejected: {}", msg),
            SkiffError::KexParameterOutOfBounds(msg) => {
                write!(f, "Key exchange parameter out of bounds: {}", msg)
            }
            SkiffError::WindowOverflow => write!(f, "Window adjustment overflows 32 bits"),
            SkiffError::ConnectionFailed(msg) => write!(f, "Connection failed: {}", msg),
            SkiffError::UnknownChannelType(name) => write!(f, "Unknown channel type: {}", name),
            SkiffError::RequestFailed => write!(f, "Global request failed"),
            SkiffError::ChannelClosed => write!(f, "Channel is closed"),
            SkiffError::Security(msg) => write!(f, "Security error: {}", msg),
        }
    }
}

impl std::error::Error for SkiffError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SkiffError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for SkiffError {
    fn from(err: std::io::Error) -> Self {
        SkiffError::Io(err)
    }
}

/// Result type for skiff operations
pub type SkiffResult<T> = Result<T, SkiffError>;
