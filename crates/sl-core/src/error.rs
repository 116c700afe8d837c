//! Error types for Syncline

use thiserror::Error;

/// Core error type
#[derive(Error, Debug)]
pub enum SlError {
    #[error("Invalid parameter: {0}")]
    InvalidParam(String),

    #[error("Invalid sample rate: {0}")]
    InvalidSampleRate(u32),

    #[error("Invalid timecode: {0}")]
    InvalidTimecode(String),

    #[error("Buffer underrun")]
    BufferUnderrun,

    #[error("Buffer overrun")]
    BufferOverrun,

    #[error("Disk stream '{name}': {what}")]
    DiskStream { name: String, what: String },

    #[error("Sync source error: {0}")]
    SyncSource(String),

    #[error("Thread error: {0}")]
    Thread(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type alias
pub type SlResult<T> = Result<T, SlError>;
