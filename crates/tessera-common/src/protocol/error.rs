use std::fmt;

use thiserror::Error;

use super::frame::Opcode;
use crate::config::ConfigError;

/// Violations of the frame format or of the request/response exchange.
///
/// These are transport-class failures: the connection that produced them can
/// no longer be trusted, so the request is retried on another node.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Frame body too large: {0} bytes (max {1} bytes)")]
    FrameTooLarge(usize, usize),

    #[error("Unknown opcode 0x{0:02x}")]
    UnknownOpcode(u8),

    #[error("Unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    #[error("Malformed frame: {0}")]
    Malformed(String),

    #[error("Unexpected {0:?} frame, expected {1}")]
    UnexpectedOpcode(Opcode, &'static str),
}

#[derive(Error, Debug)]
pub enum TesseraError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),

    #[error("Timeout after {0}ms")]
    Timeout(u64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TesseraError>;

/// How the engine treats a server-reported error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The request itself is wrong; retrying cannot help.
    Validation,
    /// The cluster could not serve the request right now; the retry policy decides.
    Capacity,
}

/// Error kinds carried by ERROR frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerErrorKind {
    ServerError,
    Protocol,
    BadCredentials,
    Unavailable,
    Overloaded,
    Bootstrapping,
    WriteTimeout,
    ReadTimeout,
    Syntax,
    Unauthorized,
    Invalid,
    ConfigError,
    AlreadyExists,
    Unprepared,
    Unknown(i32),
}

impl ServerErrorKind {
    pub fn from_code(code: i32) -> Self {
        match code {
            0x0000 => ServerErrorKind::ServerError,
            0x000A => ServerErrorKind::Protocol,
            0x0100 => ServerErrorKind::BadCredentials,
            0x1000 => ServerErrorKind::Unavailable,
            0x1001 => ServerErrorKind::Overloaded,
            0x1002 => ServerErrorKind::Bootstrapping,
            0x1100 => ServerErrorKind::WriteTimeout,
            0x1200 => ServerErrorKind::ReadTimeout,
            0x2000 => ServerErrorKind::Syntax,
            0x2100 => ServerErrorKind::Unauthorized,
            0x2200 => ServerErrorKind::Invalid,
            0x2300 => ServerErrorKind::ConfigError,
            0x2400 => ServerErrorKind::AlreadyExists,
            0x2500 => ServerErrorKind::Unprepared,
            other => ServerErrorKind::Unknown(other),
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            ServerErrorKind::ServerError => 0x0000,
            ServerErrorKind::Protocol => 0x000A,
            ServerErrorKind::BadCredentials => 0x0100,
            ServerErrorKind::Unavailable => 0x1000,
            ServerErrorKind::Overloaded => 0x1001,
            ServerErrorKind::Bootstrapping => 0x1002,
            ServerErrorKind::WriteTimeout => 0x1100,
            ServerErrorKind::ReadTimeout => 0x1200,
            ServerErrorKind::Syntax => 0x2000,
            ServerErrorKind::Unauthorized => 0x2100,
            ServerErrorKind::Invalid => 0x2200,
            ServerErrorKind::ConfigError => 0x2300,
            ServerErrorKind::AlreadyExists => 0x2400,
            ServerErrorKind::Unprepared => 0x2500,
            ServerErrorKind::Unknown(code) => *code,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            ServerErrorKind::ServerError
            | ServerErrorKind::Unavailable
            | ServerErrorKind::Overloaded
            | ServerErrorKind::Bootstrapping
            | ServerErrorKind::WriteTimeout
            | ServerErrorKind::ReadTimeout => ErrorClass::Capacity,
            _ => ErrorClass::Validation,
        }
    }
}

impl fmt::Display for ServerErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerErrorKind::Unknown(code) => write!(f, "Unknown(0x{:04x})", code),
            other => write!(f, "{:?}", other),
        }
    }
}
