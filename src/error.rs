//! Error types for tonpixo.

/// Top-level error type for the chat core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),
}

/// Failure class, logged next to [`Error::code`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Config,
    Validation,
    Transport,
    Protocol,
    Backend,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Config => "config",
            Self::Validation => "validation",
            Self::Transport => "transport",
            Self::Protocol => "protocol",
            Self::Backend => "backend",
        }
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::Config,
            Self::Validation(_) => ErrorKind::Validation,
            Self::Transport(_) => ErrorKind::Transport,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::Backend(_) => ErrorKind::Backend,
        }
    }

    /// Stable machine-readable code for log fields.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(ConfigError::InvalidValue { .. }) => "config.invalid_value",
            Self::Config(ConfigError::ParseError(_)) => "config.parse_failed",
            Self::Validation(ValidationError::InvalidAddress { .. }) => "validation.invalid_address",
            Self::Validation(ValidationError::InvalidLimit { .. }) => "validation.invalid_limit",
            Self::Transport(TransportError::Request { .. }) => "transport.request_failed",
            Self::Transport(TransportError::Status { .. }) => "transport.http_status",
            Self::Transport(TransportError::Decode { .. }) => "transport.decode_failed",
            Self::Transport(TransportError::Stream { .. }) => "transport.stream_interrupted",
            Self::Protocol(ProtocolError::MalformedFrame { .. }) => "protocol.malformed_frame",
            Self::Protocol(ProtocolError::InvalidEnvelope { .. }) => "protocol.invalid_envelope",
            Self::Backend(BackendError::Reported { .. }) => "backend.reported",
            Self::Backend(BackendError::MissingField { .. }) => "backend.missing_field",
        }
    }

}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),
}

/// User-correctable input problems.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("'{input}' is not a valid address: {reason}")]
    InvalidAddress { input: String, reason: String },

    #[error("'{input}' is not a valid item limit")]
    InvalidLimit { input: String },
}

/// Network or HTTP level failures talking to the backend.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Request to {endpoint} failed: {reason}")]
    Request { endpoint: String, reason: String },

    #[error("{endpoint} returned HTTP {status}: {body}")]
    Status {
        endpoint: String,
        status: u16,
        body: String,
    },

    #[error("Failed to decode response from {endpoint}: {reason}")]
    Decode { endpoint: String, reason: String },

    #[error("Stream interrupted: {reason}")]
    Stream { reason: String },
}

/// Malformed data on the token stream. Never fatal.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Malformed stream frame ({reason}): {line}")]
    MalformedFrame { line: String, reason: String },

    #[error("Invalid legacy stream envelope: {reason}")]
    InvalidEnvelope { reason: String },
}

/// Explicit error payloads returned by the backend.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("{message}")]
    Reported { message: String },

    #[error("Response from {endpoint} is missing '{field}'")]
    MissingField { endpoint: String, field: String },
}
