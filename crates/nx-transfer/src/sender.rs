/// Sending side of a file transfer.
///
/// ```text
/// Datagram: metadata ─▶ handshake/ack ─▶ metadata unit ─▶ chunks
/// Stream:   metadata ─▶ connect ─▶ metadata unit ─▶ wait "ACK" ─▶ chunks
/// ```
///
/// Metadata (including the digest) is computed before any network traffic so
/// an unreadable source never reaches the peer.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::engine::send_chunks;
use crate::error::{TransferError, is_timeout};
use crate::logging::{TransferEvent, TransferLogger};
use crate::metadata::TransferMetadata;
use crate::progress::{CancelToken, ProgressObserver};
use crate::protocol::*;
use crate::session::{LoggedObserver, SessionLog, SessionState, TransferSession};
use crate::transport::{DatagramTransport, StreamTransport, Transport, TransportKind};

static NEXT_SEND_SESSION: AtomicU64 = AtomicU64::new(1);

/// Configuration for the sender.
#[derive(Clone)]
pub struct SenderConfig {
    pub kind: TransportKind,
    pub chunk_size: usize,
    /// Datagram only: wait for the `"ack"` reply.
    pub handshake_timeout: Duration,
    /// Stream only: bound on `connect`. `None` blocks.
    pub connect_timeout: Option<Duration>,
    /// Stream only: bound on the metadata `"ACK"` read. `None` blocks.
    pub ack_timeout: Option<Duration>,
    /// Stream only: bound on each payload write. `None` blocks.
    pub write_timeout: Option<Duration>,
    pub logger: Option<Arc<dyn TransferLogger>>,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::Datagram,
            chunk_size: DEFAULT_CHUNK_SIZE,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            connect_timeout: None,
            ack_timeout: None,
            write_timeout: None,
            logger: None,
        }
    }
}

impl SenderConfig {
    pub fn new(kind: TransportKind) -> Self {
        Self {
            kind,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), TransferError> {
        validate_chunk_size(self.kind, self.chunk_size)?;
        if self.kind == TransportKind::Datagram && self.handshake_timeout.is_zero() {
            return Err(TransferError::InvalidConfig(
                "handshake timeout must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

pub(crate) fn validate_chunk_size(kind: TransportKind, chunk_size: usize) -> Result<(), TransferError> {
    if chunk_size == 0 {
        return Err(TransferError::InvalidConfig("chunk size must be non-zero".into()));
    }
    if kind == TransportKind::Datagram && chunk_size > MAX_DATAGRAM_PAYLOAD {
        return Err(TransferError::InvalidConfig(format!(
            "chunk size {} exceeds the largest datagram payload ({})",
            chunk_size, MAX_DATAGRAM_PAYLOAD
        )));
    }
    Ok(())
}

/// Result of a completed send.
#[derive(Debug, Clone)]
pub struct SendReport {
    pub session: u64,
    pub kind: TransportKind,
    pub peer: SocketAddr,
    pub metadata: TransferMetadata,
    pub bytes_sent: u64,
    pub elapsed: Duration,
}

/// Send the file at `path` to `dest`. Blocks until the last chunk is written,
/// an error occurs, or `cancel` is raised between chunks.
pub fn send_file(
    path: &Path,
    dest: SocketAddr,
    config: &SenderConfig,
    observer: &dyn ProgressObserver,
    cancel: &CancelToken,
) -> Result<SendReport, TransferError> {
    config.validate()?;

    let id = NEXT_SEND_SESSION.fetch_add(1, Ordering::Relaxed);
    let log = SessionLog::new(config.logger.clone(), "sender", id);
    let mut session = TransferSession::new(id, config.kind);
    session.peer = Some(dest);

    match run_send(path, dest, config, observer, cancel, &mut session, &log) {
        Ok(report) => Ok(report),
        Err(e) => {
            log.fail(&mut session, &e);
            Err(e)
        }
    }
}

fn run_send(
    path: &Path,
    dest: SocketAddr,
    config: &SenderConfig,
    observer: &dyn ProgressObserver,
    cancel: &CancelToken,
    session: &mut TransferSession,
    log: &SessionLog,
) -> Result<SendReport, TransferError> {
    let started = Instant::now();
    let metadata = TransferMetadata::from_path(path)?;
    let encoded = metadata.encode()?;
    session.metadata = Some(metadata.clone());

    if cancel.is_cancelled() {
        return Err(TransferError::Cancelled);
    }

    let mut transport: Box<dyn Transport> = match config.kind {
        TransportKind::Datagram => {
            session.advance(SessionState::Handshaking)?;
            let transport = DatagramTransport::for_peer(dest)?;
            log.emit(TransferEvent::HandshakeSent { to: dest });
            handshake(&transport, dest, config.handshake_timeout)?;
            log.emit(TransferEvent::HandshakeComplete { peer: dest });

            session.advance(SessionState::ExchangingMetadata)?;
            transport.send_to(&encoded, dest).map_err(TransferError::Transport)?;
            log.emit(TransferEvent::MetadataSent {
                name: metadata.name.clone(),
                size: metadata.size,
            });
            // No acknowledgment on this path: chunks follow immediately.
            Box::new(transport)
        }
        TransportKind::Stream => {
            session.advance(SessionState::ExchangingMetadata)?;
            let mut transport = StreamTransport::connect(dest, config.connect_timeout)?;
            transport
                .set_write_timeout(config.write_timeout)
                .map_err(TransferError::Transport)?;
            log.emit(TransferEvent::Connected { peer: dest });

            transport.send_unit(&encoded).map_err(TransferError::Transport)?;
            log.emit(TransferEvent::MetadataSent {
                name: metadata.name.clone(),
                size: metadata.size,
            });
            await_ack(&mut transport, config.ack_timeout)?;
            log.emit(TransferEvent::Acknowledged);
            Box::new(transport)
        }
    };

    session.advance(SessionState::Streaming)?;
    let logged = LoggedObserver { inner: observer, log };
    let sent = send_chunks(
        transport.as_mut(),
        path,
        metadata.size,
        config.chunk_size,
        &logged,
        cancel,
    )?;
    session.bytes_transferred = sent;
    drop(transport);

    session.advance(SessionState::Done)?;
    let elapsed = started.elapsed();
    log.emit(TransferEvent::TransferComplete {
        bytes: sent,
        duration_ms: elapsed.as_millis() as u64,
    });

    Ok(SendReport {
        session: session.id,
        kind: config.kind,
        peer: dest,
        metadata,
        bytes_sent: sent,
        elapsed,
    })
}

/// Probe for a live datagram receiver. No retry: a timeout is returned to the
/// caller, who may repeat the whole operation.
pub fn handshake(transport: &DatagramTransport, dest: SocketAddr, timeout: Duration) -> Result<SocketAddr, TransferError> {
    transport
        .send_to(Phrase::Handshake.as_bytes(), dest)
        .map_err(TransferError::Transport)?;
    transport
        .set_read_timeout(Some(timeout))
        .map_err(TransferError::Transport)?;

    let mut buf = [0u8; CONTROL_BUF];
    let (n, from) = match transport.recv_from(&mut buf) {
        Ok(received) => received,
        Err(ref e) if is_timeout(e) => return Err(TransferError::HandshakeTimeout(timeout)),
        Err(e) => return Err(TransferError::Transport(e)),
    };
    if !Phrase::HandshakeAck.matches(&buf[..n]) {
        return Err(TransferError::HandshakeRejected {
            expected: Phrase::HandshakeAck.as_str(),
            got: describe_payload(&buf[..n]),
        });
    }
    Ok(from)
}

fn await_ack(transport: &mut StreamTransport, timeout: Option<Duration>) -> Result<(), TransferError> {
    transport
        .set_read_timeout(timeout)
        .map_err(TransferError::Transport)?;

    let mut buf = [0u8; CONTROL_BUF];
    let n = match transport.recv_unit(&mut buf) {
        Ok(0) => {
            return Err(TransferError::Acknowledgment(
                "connection closed before acknowledgment".into(),
            ));
        }
        Ok(n) => n,
        Err(ref e) if is_timeout(e) => {
            return Err(TransferError::Acknowledgment(format!(
                "no acknowledgment within {:?}",
                timeout.unwrap_or_default()
            )));
        }
        Err(e) => return Err(TransferError::Acknowledgment(e.to_string())),
    };
    if !Phrase::StreamAck.matches(&buf[..n]) {
        return Err(TransferError::Acknowledgment(format!(
            "expected {:?}, got {:?}",
            Phrase::StreamAck.as_str(),
            describe_payload(&buf[..n])
        )));
    }

    transport
        .set_read_timeout(None)
        .map_err(TransferError::Transport)
}
