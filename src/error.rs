use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::fmt;

/// Main error type for the Starling message bus
#[derive(Debug)]
pub enum StarlingError {
    /// Configuration errors: CLI values, missing peer addresses
    Config(String),

    /// Operation not permitted for this node's role (publisher/subscriber)
    Role(String),

    /// Peer transport failures
    Transport(TransportError),

    /// Payload encryption or decryption failures
    Crypto(String),

    /// Lamport clock cannot advance
    Clock(String),

    /// API/HTTP related errors
    Api(String),

    /// System I/O errors
    Io(std::io::Error),

    /// Serialization/deserialization errors
    Serialization(SerializationError),
}

/// Failure classes reported by a transport
#[derive(Debug)]
pub enum TransportError {
    /// Peer refused, reset, or did not answer within the RPC timeout
    Unavailable(String),

    /// Anything else: bad frames, unexpected responses
    Other(String),
}

/// Serialization related errors
#[derive(Debug)]
pub enum SerializationError {
    /// JSON serialization/deserialization errors
    Json(serde_json::Error),

    /// Binary wire encoding errors
    Encode(bincode::error::EncodeError),

    /// Binary wire decoding errors
    Decode(bincode::error::DecodeError),
}

impl fmt::Display for StarlingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StarlingError::Config(msg) => write!(f, "Configuration error: {}", msg),
            StarlingError::Role(msg) => write!(f, "Role error: {}", msg),
            StarlingError::Transport(err) => write!(f, "Transport error: {}", err),
            StarlingError::Crypto(msg) => write!(f, "Crypto error: {}", msg),
            StarlingError::Clock(msg) => write!(f, "Clock error: {}", msg),
            StarlingError::Api(msg) => write!(f, "API error: {}", msg),
            StarlingError::Io(err) => write!(f, "I/O error: {}", err),
            StarlingError::Serialization(err) => write!(f, "Serialization error: {}", err),
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Unavailable(msg) => write!(f, "unavailable: {}", msg),
            TransportError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl fmt::Display for SerializationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SerializationError::Json(err) => write!(f, "JSON: {}", err),
            SerializationError::Encode(err) => write!(f, "Binary encode: {}", err),
            SerializationError::Decode(err) => write!(f, "Binary decode: {}", err),
        }
    }
}

impl std::error::Error for StarlingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StarlingError::Io(err) => Some(err),
            StarlingError::Transport(err) => Some(err),
            StarlingError::Serialization(err) => Some(err),
            _ => None,
        }
    }
}

impl std::error::Error for TransportError {}

impl std::error::Error for SerializationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SerializationError::Json(err) => Some(err),
            SerializationError::Encode(err) => Some(err),
            SerializationError::Decode(err) => Some(err),
        }
    }
}

// Convenient type alias for Results using our error type
pub type Result<T> = std::result::Result<T, StarlingError>;

impl StarlingError {
    /// Get the appropriate HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            StarlingError::Config(_) => StatusCode::BAD_REQUEST,
            StarlingError::Role(_) => StatusCode::FORBIDDEN,
            StarlingError::Transport(_) => StatusCode::SERVICE_UNAVAILABLE,
            StarlingError::Crypto(_) => StatusCode::UNPROCESSABLE_ENTITY,
            StarlingError::Clock(_) => StatusCode::INTERNAL_SERVER_ERROR,
            StarlingError::Api(_) => StatusCode::BAD_REQUEST,
            StarlingError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            StarlingError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error type identifier
    pub fn error_type(&self) -> &'static str {
        match self {
            StarlingError::Config(_) => "configuration_error",
            StarlingError::Role(_) => "role_error",
            StarlingError::Transport(_) => "transport_error",
            StarlingError::Crypto(_) => "crypto_error",
            StarlingError::Clock(_) => "clock_error",
            StarlingError::Api(_) => "api_error",
            StarlingError::Io(_) => "io_error",
            StarlingError::Serialization(_) => "serialization_error",
        }
    }

    /// True for the transport failure class that marks a peer unavailable
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            StarlingError::Transport(TransportError::Unavailable(_))
        )
    }
}

// Axum IntoResponse implementation for HTTP error responses
impl IntoResponse for StarlingError {
    fn into_response(self) -> Response {
        let status_code = self.status_code();
        let error_response = json!({
            "error": {
                "code": status_code.as_u16(),
                "message": self.to_string(),
                "type": self.error_type(),
            }
        });

        (status_code, Json(error_response)).into_response()
    }
}

// Conversions from common error types
impl From<std::io::Error> for StarlingError {
    fn from(err: std::io::Error) -> Self {
        StarlingError::Io(err)
    }
}

impl From<serde_json::Error> for StarlingError {
    fn from(err: serde_json::Error) -> Self {
        StarlingError::Serialization(SerializationError::Json(err))
    }
}

impl From<bincode::error::EncodeError> for StarlingError {
    fn from(err: bincode::error::EncodeError) -> Self {
        StarlingError::Serialization(SerializationError::Encode(err))
    }
}

impl From<bincode::error::DecodeError> for StarlingError {
    fn from(err: bincode::error::DecodeError) -> Self {
        StarlingError::Serialization(SerializationError::Decode(err))
    }
}

impl From<TransportError> for StarlingError {
    fn from(err: TransportError) -> Self {
        StarlingError::Transport(err)
    }
}

impl From<SerializationError> for StarlingError {
    fn from(err: SerializationError) -> Self {
        StarlingError::Serialization(err)
    }
}

impl From<reqwest::Error> for StarlingError {
    fn from(err: reqwest::Error) -> Self {
        StarlingError::Api(err.to_string())
    }
}

// Helper macros for common error construction patterns
#[macro_export]
macro_rules! config_error {
    ($msg:expr) => {
        $crate::error::StarlingError::Config($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::StarlingError::Config(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! role_error {
    ($msg:expr) => {
        $crate::error::StarlingError::Role($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::StarlingError::Role(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! api_error {
    ($msg:expr) => {
        $crate::error::StarlingError::Api($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::StarlingError::Api(format!($fmt, $($arg)*))
    };
}
