/// nx transfer: point-to-point file transfer over UDP or TCP.
///
/// Provides:
/// - Datagram handshake (`"handshake"` / `"ack"`) before a UDP transfer
/// - JSON metadata record (name, size, MD5 digest) sent as one unit
/// - `"ACK"` confirmation of metadata on TCP
/// - Fixed-size chunk streaming with per-chunk progress events
/// - Post-transfer MD5 validation on the receiver
/// - Repeating receive loop with cooperative cancellation
/// - Line-oriented UDP chat

pub mod chat;
pub mod digest;
pub mod engine;
pub mod error;
pub mod logging;
pub mod metadata;
pub mod progress;
pub mod protocol;
pub mod receiver;
pub mod sender;
pub mod session;
pub mod transport;

// Re-export key types for convenience.
pub use chat::{ChatMessage, receive_messages, send_messages};
pub use digest::{compute_digest, digests_equal};
pub use error::TransferError;
pub use logging::{NullLogger, TracingLogger, TransferEvent, TransferLog, TransferLogger};
pub use metadata::TransferMetadata;
pub use progress::{CancelToken, NullObserver, ProgressEvent, ProgressObserver, TransferStats};
pub use protocol::{
    DATAGRAM_READ_TIMEOUT, DEFAULT_CHUNK_SIZE, HANDSHAKE_TIMEOUT, MAX_DATAGRAM_PAYLOAD, Phrase,
};
pub use receiver::{
    Listening, LoopSummary, ReceiveReport, ReceivedFile, Receiver, ReceiverConfig,
};
pub use sender::{SendReport, SenderConfig, send_file};
pub use session::{SessionOutcome, SessionState, TransferSession};
pub use transport::{TransportKind, local_ip};
