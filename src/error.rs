//! Error types for the bitmap-index engine

use thiserror::Error;

pub type Result<T> = std::result::Result<T, GridError>;

#[derive(Error, Debug)]
pub enum GridError {
    #[error("Column {col} outside slice range {lo}..{hi}")]
    OutOfRange { col: u64, lo: u64, hi: u64 },

    #[error("Corrupt data: {0}")]
    Corrupt(String),

    #[error("Peer {host} unreachable: {reason}")]
    Unreachable { host: String, reason: String },

    #[error("Write-ahead log append failed: {0}")]
    WriteFailure(std::io::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Wire decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("Wire encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("Index '{0}' not found")]
    IndexNotFound(String),

    #[error("Frame '{0}' not found")]
    FrameNotFound(String),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl GridError {
    /// Get error code for wire protocol
    pub fn code(&self) -> &'static str {
        match self {
            GridError::OutOfRange { .. } => "OUT_OF_RANGE",
            GridError::Corrupt(_) => "CORRUPT",
            GridError::Unreachable { .. } => "UNREACHABLE",
            GridError::WriteFailure(_) => "WRITE_FAILURE",
            GridError::IndexNotFound(_) => "INDEX_NOT_FOUND",
            GridError::FrameNotFound(_) => "FRAME_NOT_FOUND",
            GridError::Protocol(_) => "PROTOCOL_ERROR",
            _ => "INTERNAL_ERROR",
        }
    }
}
