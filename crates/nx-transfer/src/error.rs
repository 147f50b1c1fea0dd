use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::session::SessionState;

/// Every way a transfer session can end other than clean completion.
#[derive(Debug, Error)]
pub enum TransferError {
    /// No handshake reply within the wait window. The caller may retry.
    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    /// The first exchanged datagram was not the expected handshake phrase.
    #[error("handshake rejected: expected {expected:?}, got {got:?}")]
    HandshakeRejected { expected: &'static str, got: String },

    #[error("failed to decode metadata: {reason} (raw: {raw:?})")]
    MetadataDecode { reason: String, raw: String },

    #[error("encoded metadata is {len} bytes, limit is {max}")]
    MetadataTooLarge { len: usize, max: usize },

    /// Stream transport metadata acknowledgment missing, wrong or timed out.
    #[error("acknowledgment failed: {0}")]
    Acknowledgment(String),

    #[error("transport error: {0}")]
    Transport(#[source] io::Error),

    /// Socket failure mid-payload. The partial file is left on disk.
    #[error("transport failed after {received} of {expected} bytes, partial file left at {}: {source}", path.display())]
    PartialTransfer {
        path: PathBuf,
        received: u64,
        expected: u64,
        #[source]
        source: io::Error,
    },

    /// The peer stopped sending before the declared size was reached.
    #[error("transfer truncated: received {received} of {expected} bytes into {}", path.display())]
    Truncated {
        path: PathBuf,
        received: u64,
        expected: u64,
    },

    /// Digest of the received file differs from the declared digest. The file
    /// is kept on disk.
    #[error("validation failed for {}: expected {expected} but got {computed}", path.display())]
    ValidationMismatch {
        path: PathBuf,
        expected: String,
        computed: String,
    },

    #[error("cannot bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("file error on {}: {source}", path.display())]
    File {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("refusing unsafe file name from peer: {0:?}")]
    UnsafeName(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid session transition {from:?} -> {to:?}")]
    InvalidTransition { from: SessionState, to: SessionState },

    #[error("transfer cancelled")]
    Cancelled,
}

impl TransferError {
    pub(crate) fn file(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::File {
            path: path.into(),
            source,
        }
    }

    /// Whether retrying the whole operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::HandshakeTimeout(_))
    }

    /// Reported outcome rather than a hard failure; the data is on disk.
    pub fn is_warning(&self) -> bool {
        matches!(self, Self::ValidationMismatch { .. })
    }

    /// Ends a repeating receive loop instead of moving to the next session.
    pub fn is_fatal_to_loop(&self) -> bool {
        matches!(self, Self::Bind { .. } | Self::InvalidConfig(_) | Self::Cancelled)
    }
}

/// Read timeouts surface as `WouldBlock` on Unix and `TimedOut` on Windows.
pub(crate) fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}
