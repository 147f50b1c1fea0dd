/// Structured logging of transfer milestones.
///
/// Sender and receiver report protocol events through a [`TransferLogger`]
/// so callers choose between tracing output, a UI feed, or nothing.

use std::fmt;
use std::net::SocketAddr;

/// Structured log entry for a transfer session.
#[derive(Debug, Clone)]
pub struct TransferLog {
    pub component: &'static str,
    pub session: u64,
    pub event: TransferEvent,
}

/// Transfer events that can be logged.
#[derive(Debug, Clone)]
pub enum TransferEvent {
    /// Receiver: socket bound, waiting for a peer
    Listening { addr: SocketAddr },
    /// Sender: handshake probe sent
    HandshakeSent { to: SocketAddr },
    /// Either side: handshake completed with peer
    HandshakeComplete { peer: SocketAddr },
    /// Stream: connection established
    Connected { peer: SocketAddr },
    MetadataSent { name: String, size: u64 },
    MetadataReceived { name: String, size: u64, from: SocketAddr },
    /// Stream: metadata acknowledged by receiver
    Acknowledged,
    /// Per-chunk progress
    ChunkMoved { bytes: u64, total: u64 },
    TransferComplete { bytes: u64, duration_ms: u64 },
    ValidationPassed { digest: String },
    ValidationMismatch { expected: String, computed: String },
    Error { message: String },
}

impl fmt::Display for TransferEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Listening { addr } => write!(f, "listening addr={}", addr),
            Self::HandshakeSent { to } => write!(f, "handshake_sent to={}", to),
            Self::HandshakeComplete { peer } => write!(f, "handshake_complete peer={}", peer),
            Self::Connected { peer } => write!(f, "connected peer={}", peer),
            Self::MetadataSent { name, size } => {
                write!(f, "metadata_sent name={:?} size={}", name, size)
            }
            Self::MetadataReceived { name, size, from } => {
                write!(f, "metadata_received name={:?} size={} from={}", name, size, from)
            }
            Self::Acknowledged => write!(f, "acknowledged"),
            Self::ChunkMoved { bytes, total } => write!(f, "chunk bytes={}/{}", bytes, total),
            Self::TransferComplete { bytes, duration_ms } => {
                write!(f, "transfer_complete bytes={} duration_ms={}", bytes, duration_ms)
            }
            Self::ValidationPassed { digest } => write!(f, "validation_passed digest={}", digest),
            Self::ValidationMismatch { expected, computed } => {
                write!(f, "validation_mismatch expected={} computed={}", expected, computed)
            }
            Self::Error { message } => write!(f, "error: {}", message),
        }
    }
}

/// Trait for transfer logging. Implementations can forward to `tracing`,
/// feed a UI, or discard entries.
pub trait TransferLogger: Send + Sync {
    fn log(&self, entry: TransferLog);
}

/// Logger that uses the `tracing` crate.
pub struct TracingLogger;

impl TransferLogger for TracingLogger {
    fn log(&self, entry: TransferLog) {
        match &entry.event {
            TransferEvent::ChunkMoved { .. } => {
                tracing::trace!(component = entry.component, session = entry.session, "{}", entry.event);
            }
            TransferEvent::ValidationMismatch { .. } => {
                tracing::warn!(component = entry.component, session = entry.session, "{}", entry.event);
            }
            TransferEvent::Error { .. } => {
                tracing::error!(component = entry.component, session = entry.session, "{}", entry.event);
            }
            TransferEvent::HandshakeSent { .. } | TransferEvent::Acknowledged => {
                tracing::debug!(component = entry.component, session = entry.session, "{}", entry.event);
            }
            _ => {
                tracing::info!(component = entry.component, session = entry.session, "{}", entry.event);
            }
        }
    }
}

/// No-op logger that discards all log entries.
pub struct NullLogger;

impl TransferLogger for NullLogger {
    fn log(&self, _entry: TransferLog) {}
}
