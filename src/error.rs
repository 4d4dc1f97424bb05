//! Crate-wide error types
//!
//! Errors are grouped by the subsystem they originate from. Transient
//! conditions (a broken frame, a single failed encode, a slow client) are
//! handled inside their subsystem and never surface here; only errors that
//! invalidate the pipeline or prevent startup become `Error`.

use std::net::SocketAddr;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration, rejected before the pipeline starts
    #[error("config: {0}")]
    Config(#[from] ConfigError),

    /// Capture source failed permanently (non-persistent mode)
    #[error("capture source gone: {0}")]
    SourceGone(String),

    /// Encoder pool halted after CPU fallback also failed
    #[error("encoder pool halted: {0}")]
    EncoderFatal(String),

    /// Listen socket could not be acquired
    #[error("bind: {0}")]
    Bind(#[from] BindError),

    /// I/O error outside any more specific category
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration validation errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid resolution '{0}', expected WxH")]
    InvalidResolution(String),

    #[error("quality must be 1..=100, got {0}")]
    InvalidQuality(u8),

    #[error("drop-same-frames must be 0..=30, got {0}")]
    InvalidDropSame(u32),

    #[error("buffers must be >= 2, got {0}")]
    InvalidBuffers(u32),

    #[error("workers must be >= 1, got {0}")]
    InvalidWorkers(u32),

    #[error("unknown pixel format '{0}'")]
    UnknownFormat(String),

    #[error("unknown encoder type '{0}'")]
    UnknownEncoder(String),

    #[error("{0}")]
    Invalid(String),
}

/// Bind/listen failures
#[derive(Debug, thiserror::Error)]
pub enum BindError {
    #[error("failed to bind {addr}: {source}")]
    Tcp {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("failed to bind unix socket {path}: {source}")]
    Unix {
        path: String,
        source: std::io::Error,
    },
}

/// Errors reported by a capture source
///
/// These stay inside the capturer state machine; `Gone` only escalates to
/// `Error::SourceGone` when the capturer is not persistent.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// No frame arrived within the wait window
    #[error("grab timed out")]
    Timeout,

    /// The driver handed back an unusable (e.g. zero-byte) frame
    #[error("broken frame from source")]
    Broken,

    /// The device disappeared or reached EOF
    #[error("source gone: {0}")]
    Gone(String),

    /// Source geometry changed, re-negotiation required
    #[error("source geometry changed")]
    Resized,

    #[error("source io: {0}")]
    Io(#[from] std::io::Error),
}

/// Single-frame encoder errors
#[derive(Debug, thiserror::Error)]
pub enum EncoderError {
    /// Encoder cannot handle this geometry or pixel format
    #[error("unsupported input: {0}")]
    Unsupported(String),

    /// The compression step itself failed
    #[error("encode failed: {0}")]
    Failed(String),
}

impl Error {
    /// Process exit code for this error
    ///
    /// `0` clean shutdown, `1` generic fatal, `2` bad configuration,
    /// `3` bind/listen failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Config(_) => 2,
            Error::Bind(_) => 3,
            _ => 1,
        }
    }
}
