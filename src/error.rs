//! Error types for xcp
//!
//! Provides structured error handling with:
//! - Numeric error codes for machine parsing
//! - User-friendly messages with suggestions
//! - Exit codes for CLI
//!
//! Configuration-time failures are fatal and end the process. Failures on a
//! single relay connection are reported as [`Error::Transport`] and only ever
//! detach that connection.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for xcp operations
pub type Result<T> = std::result::Result<T, Error>;

/// Numeric error codes for machine parsing and documentation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    // Configuration errors (1xx)
    ConfigNotFound = 100,
    ConfigParseError = 101,
    ConfigValidation = 102,
    InvalidSessionName = 103,

    // IO errors (2xx)
    IoRead = 200,
    IoWrite = 201,
    IoPermission = 202,
    IoNotFound = 203,

    // Network setup errors (3xx)
    NoUsableInterface = 300,
    BindFailed = 301,
    SendFailed = 302,
    ConnectFailed = 303,

    // Protocol errors (4xx)
    ProtocolMalformed = 400,

    // Transport errors (5xx)
    TransportFailed = 500,
    TransportClosed = 501,

    // Relay errors (6xx)
    AlreadyAttached = 600,

    // Internal errors (9xx)
    InternalError = 900,
}

impl ErrorCode {
    /// Get the string code (e.g., "E100")
    pub fn as_str(&self) -> String {
        format!("E{}", *self as u16)
    }

    /// Get the exit code for CLI (maps to 1-125 range)
    pub fn exit_code(&self) -> i32 {
        match *self as u16 {
            100..=199 => 10, // Config errors
            200..=299 => 20, // IO errors
            300..=399 => 30, // Network setup errors
            400..=499 => 40, // Protocol errors
            500..=599 => 50, // Transport errors
            600..=699 => 60, // Relay errors
            900..=999 => 90, // Internal errors
            _ => 1,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Main error type for xcp
#[derive(Error, Debug)]
pub enum Error {
    // ─────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: PathBuf },

    /// Configuration parse error
    #[error("Failed to parse configuration: {message}")]
    ConfigParse {
        message: String,
        #[source]
        source: Option<toml::de::Error>,
    },

    /// Configuration validation error
    #[error("Configuration validation failed: {message}")]
    ConfigValidation { message: String, field: Option<String> },

    /// Session name is unusable (only the empty name is)
    #[error("Invalid session name '{name}': {reason}")]
    InvalidSessionName { name: String, reason: String },

    /// Generic configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    // ─────────────────────────────────────────────────────────────
    // IO Errors
    // ─────────────────────────────────────────────────────────────

    /// File write error
    #[error("Failed to write file: {path}")]
    IoWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML serialization error
    #[error("TOML serialization error: {0}")]
    Toml(#[from] toml::ser::Error),

    // ─────────────────────────────────────────────────────────────
    // Network Setup Errors
    // ─────────────────────────────────────────────────────────────

    /// No non-loopback IPv4 address could be found for discovery
    #[error("No usable network interface: {message}")]
    NoUsableInterface { message: String },

    /// A required socket could not be bound
    #[error("Failed to bind {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// A discovery datagram could not be sent
    #[error("Failed to send discovery datagram to {addr}: {source}")]
    SendFailed {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Connecting to a discovered manager failed
    #[error("Failed to connect to manager at {url}: {message}")]
    ConnectFailed { url: String, message: String },

    // ─────────────────────────────────────────────────────────────
    // Protocol Errors
    // ─────────────────────────────────────────────────────────────

    /// Malformed discovery datagram
    #[error("Malformed discovery datagram: {message}")]
    ProtocolMalformed { message: String },

    // ─────────────────────────────────────────────────────────────
    // Transport Errors
    // ─────────────────────────────────────────────────────────────

    /// Read or write failure on a single endpoint
    #[error("Transport error on endpoint {endpoint}: {message}")]
    Transport { endpoint: u64, message: String },

    /// WebSocket error on the follower side of a relay link
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// WebSocket error on a connection accepted by the relay server
    #[error("WebSocket error: {0}")]
    ServerSocket(#[from] axum::Error),

    // ─────────────────────────────────────────────────────────────
    // Relay Errors
    // ─────────────────────────────────────────────────────────────

    /// Endpoint attached twice to the same hub
    #[error("Endpoint {endpoint} is already attached to the relay hub")]
    AlreadyAttached { endpoint: u64 },

    // ─────────────────────────────────────────────────────────────
    // Internal Errors
    // ─────────────────────────────────────────────────────────────

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    // ─────────────────────────────────────────────────────────────
    // Error Classification
    // ─────────────────────────────────────────────────────────────

    /// Get the numeric error code
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::ConfigNotFound { .. } => ErrorCode::ConfigNotFound,
            Error::ConfigParse { .. } => ErrorCode::ConfigParseError,
            Error::ConfigValidation { .. } => ErrorCode::ConfigValidation,
            Error::InvalidSessionName { .. } => ErrorCode::InvalidSessionName,
            Error::Config(_) => ErrorCode::ConfigValidation,

            Error::IoWrite { .. } => ErrorCode::IoWrite,
            Error::Io(e) => match e.kind() {
                std::io::ErrorKind::NotFound => ErrorCode::IoNotFound,
                std::io::ErrorKind::PermissionDenied => ErrorCode::IoPermission,
                _ => ErrorCode::IoRead,
            },
            Error::Toml(_) => ErrorCode::ConfigParseError,

            Error::NoUsableInterface { .. } => ErrorCode::NoUsableInterface,
            Error::BindFailed { .. } => ErrorCode::BindFailed,
            Error::SendFailed { .. } => ErrorCode::SendFailed,
            Error::ConnectFailed { .. } => ErrorCode::ConnectFailed,

            Error::ProtocolMalformed { .. } => ErrorCode::ProtocolMalformed,

            Error::Transport { .. } => ErrorCode::TransportFailed,
            Error::WebSocket(e) => match e {
                tokio_tungstenite::tungstenite::Error::ConnectionClosed
                | tokio_tungstenite::tungstenite::Error::AlreadyClosed => {
                    ErrorCode::TransportClosed
                }
                _ => ErrorCode::TransportFailed,
            },
            Error::ServerSocket(_) => ErrorCode::TransportFailed,

            Error::AlreadyAttached { .. } => ErrorCode::AlreadyAttached,

            Error::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Check if the error is fatal (process should exit)
    ///
    /// Per-connection failures never are; they detach one endpoint.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ConfigNotFound { .. }
                | Error::ConfigParse { .. }
                | Error::ConfigValidation { .. }
                | Error::InvalidSessionName { .. }
                | Error::Config(_)
                | Error::NoUsableInterface { .. }
                | Error::BindFailed { .. }
                | Error::SendFailed { .. }
                | Error::Internal(_)
        )
    }

    /// Get the exit code for CLI
    pub fn exit_code(&self) -> i32 {
        self.code().exit_code()
    }

    // ─────────────────────────────────────────────────────────────
    // User-Friendly Messages
    // ─────────────────────────────────────────────────────────────

    /// Get a user-friendly suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Error::ConfigNotFound { .. } => Some(
                "Run 'xcp config init' to create a default configuration file."
            ),
            Error::ConfigParse { .. } => Some(
                "Check your configuration file syntax. Run 'xcp config validate' to see details."
            ),
            Error::ConfigValidation { .. } => Some(
                "Review the configuration file and fix the invalid values."
            ),
            Error::InvalidSessionName { .. } => Some(
                "Pass a non-empty session name, or leave it out to get a generated one."
            ),

            Error::NoUsableInterface { .. } => Some(
                "Connect to a network or pin an address with --interface (e.g. --interface 127.0.0.1)."
            ),
            Error::BindFailed { .. } => Some(
                "Another program may be using the port. Choose a different one with -p."
            ),
            Error::SendFailed { .. } => Some(
                "Multicast may be blocked on this network. Check firewall rules or use --group."
            ),
            Error::ConnectFailed { .. } => Some(
                "The manager answered discovery but refused the relay connection. Check its firewall."
            ),

            _ => None,
        }
    }

    /// Format the error for terminal display with colors
    pub fn format_for_terminal(&self) -> String {
        let code = self.code();
        let suggestion = self.suggestion();

        let mut output = format!(
            "\x1b[31mError [{}]\x1b[0m: {}\n",
            code.as_str(),
            self
        );

        if let Some(hint) = suggestion {
            output.push_str(&format!("\n\x1b[33mHint\x1b[0m: {}\n", hint));
        }

        output
    }

    /// Format the error for logging (no colors)
    pub fn format_for_log(&self) -> String {
        let code = self.code();
        format!("[{}] {}", code.as_str(), self)
    }
}

// ─────────────────────────────────────────────────────────────────
// Error Constructors (for ergonomic error creation)
// ─────────────────────────────────────────────────────────────────

impl Error {
    /// Create a config not found error
    pub fn config_not_found(path: impl Into<PathBuf>) -> Self {
        Error::ConfigNotFound { path: path.into() }
    }

    /// Create a config validation error
    pub fn config_validation(message: impl Into<String>) -> Self {
        Error::ConfigValidation {
            message: message.into(),
            field: None,
        }
    }

    /// Create a config validation error with field name
    pub fn config_field_invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::ConfigValidation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a malformed datagram error
    pub fn malformed(message: impl Into<String>) -> Self {
        Error::ProtocolMalformed {
            message: message.into(),
        }
    }

    /// Create a transport error for one endpoint
    pub fn transport(endpoint: u64, message: impl Into<String>) -> Self {
        Error::Transport {
            endpoint,
            message: message.into(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
