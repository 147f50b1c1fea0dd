/// Wire constants for the nx transfer protocol.
///
/// ```text
/// Datagram:  [sender] "handshake" ──▶ [receiver]
///            [sender] ◀── "ack"       [receiver]
///            [sender] {metadata JSON} ──▶
///            [sender] chunk, chunk, ... ──▶   (one UDP payload per chunk)
///
/// Stream:    [sender] connect ──▶ accept [receiver]
///            [sender] {metadata JSON} ──▶
///            [sender] ◀── "ACK"
///            [sender] raw file bytes ──▶      (no framing)
/// ```
///
/// Chunks carry no sequence numbers. The stream path relies on TCP ordering;
/// the datagram path assumes in-order, lossless delivery and does not detect
/// reordering.

use std::fmt;
use std::time::Duration;

/// Default chunk size in bytes.
pub const DEFAULT_CHUNK_SIZE: usize = 1024;

/// Largest payload a single UDP datagram can carry over IPv4.
pub const MAX_DATAGRAM_PAYLOAD: usize = 65_507;

/// Size of the buffer used for control units (handshake, metadata, ACK).
pub const CONTROL_BUF: usize = 1024;

/// Longest encoded metadata record. It must fit in a single control read.
pub const METADATA_MAX: usize = CONTROL_BUF;

/// Sender wait for the handshake reply.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(500);

/// Datagram receiver wait between payload units once a transfer is running.
pub const DATAGRAM_READ_TIMEOUT: Duration = Duration::from_secs(3);

/// How often blocking waits wake up to check for cancellation.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// OS receive buffer requested for datagram sockets (4 MB).
pub const DATAGRAM_RECV_BUFFER: usize = 4 * 1024 * 1024;

/// Fixed literal payloads exchanged outside the metadata record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phrase {
    /// Sender liveness probe on the datagram transport.
    Handshake,
    /// Receiver reply to [`Phrase::Handshake`].
    HandshakeAck,
    /// Receiver confirmation of metadata on the stream transport.
    StreamAck,
    /// Terminates a chat receive loop.
    Exit,
}

impl Phrase {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Handshake => "handshake",
            Self::HandshakeAck => "ack",
            Self::StreamAck => "ACK",
            Self::Exit => "EXIT",
        }
    }

    pub const fn as_bytes(self) -> &'static [u8] {
        self.as_str().as_bytes()
    }

    /// Exact, case-sensitive comparison against a received payload.
    pub fn matches(self, payload: &[u8]) -> bool {
        payload == self.as_bytes()
    }
}

impl fmt::Display for Phrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Render a received control payload for error messages.
pub fn describe_payload(payload: &[u8]) -> String {
    const MAX_SHOWN: usize = 64;
    let shown = &payload[..payload.len().min(MAX_SHOWN)];
    let mut text = String::from_utf8_lossy(shown).into_owned();
    if payload.len() > MAX_SHOWN {
        text.push_str("...");
    }
    text
}
