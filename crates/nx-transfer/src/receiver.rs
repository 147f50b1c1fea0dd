/// Receiving side: single transfers and the repeating session loop.
///
/// ```text
/// listen() ──▶ accept_transfer() ──────────────────────────▶ validate()
///  bind        handshake (udp) / accept (tcp)                 MD5 of file
///              metadata ─▶ "ACK" (tcp) ─▶ chunks to disk       vs declared
/// ```
///
/// Each step owns its sockets and file handles; they are closed when the step
/// returns, on success or error.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::digest::{compute_digest, digests_equal};
use crate::engine::receive_chunks;
use crate::error::{TransferError, is_timeout};
use crate::logging::{TransferEvent, TransferLogger};
use crate::metadata::TransferMetadata;
use crate::progress::{CancelToken, ProgressObserver};
use crate::protocol::*;
use crate::sender::validate_chunk_size;
use crate::session::{LoggedObserver, SessionLog, SessionState, TransferSession};
use crate::transport::{DatagramTransport, StreamListener, Transport, TransportKind};

/// Configuration for the receiver.
#[derive(Clone)]
pub struct ReceiverConfig {
    pub kind: TransportKind,
    pub bind_addr: SocketAddr,
    pub save_dir: PathBuf,
    /// Stream read size. Datagram reads always accept a full UDP payload.
    pub chunk_size: usize,
    /// Datagram only: longest gap allowed between units once the handshake
    /// has completed.
    pub read_timeout: Duration,
    /// Stream only: bound on each read. `None` blocks.
    pub stream_read_timeout: Option<Duration>,
    /// How often idle waits (handshake, accept) check for cancellation.
    pub poll_interval: Duration,
    /// Fail sessions whose file name would escape `save_dir` instead of
    /// writing it verbatim.
    pub reject_unsafe_names: bool,
    pub logger: Option<Arc<dyn TransferLogger>>,
}

impl ReceiverConfig {
    pub fn new(kind: TransportKind, bind_addr: SocketAddr, save_dir: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            bind_addr,
            save_dir: save_dir.into(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            read_timeout: DATAGRAM_READ_TIMEOUT,
            stream_read_timeout: None,
            poll_interval: POLL_INTERVAL,
            reject_unsafe_names: false,
            logger: None,
        }
    }

    pub fn validate(&self) -> Result<(), TransferError> {
        validate_chunk_size(self.kind, self.chunk_size)?;
        if self.read_timeout.is_zero() || self.poll_interval.is_zero() {
            return Err(TransferError::InvalidConfig(
                "read timeout and poll interval must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Result of a verified transfer.
#[derive(Debug, Clone)]
pub struct ReceiveReport {
    pub session: u64,
    pub kind: TransportKind,
    pub peer: Option<SocketAddr>,
    pub metadata: TransferMetadata,
    pub path: PathBuf,
    pub bytes_received: u64,
    pub elapsed: Duration,
}

/// Counts from a repeating receive loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopSummary {
    pub completed: u64,
    pub mismatched: u64,
    pub failed: u64,
}

/// Accepts incoming transfers into one directory.
pub struct Receiver {
    config: ReceiverConfig,
    next_session: u64,
}

impl Receiver {
    pub fn new(config: ReceiverConfig) -> Result<Self, TransferError> {
        config.validate()?;
        Ok(Self {
            config,
            next_session: 1,
        })
    }

    pub fn config(&self) -> &ReceiverConfig {
        &self.config
    }

    /// Bind the configured endpoint and start a fresh session.
    pub fn listen(&mut self) -> Result<Listening, TransferError> {
        let id = self.next_session;
        self.next_session += 1;

        let endpoint = match self.config.kind {
            TransportKind::Datagram => Endpoint::Datagram(DatagramTransport::bind(self.config.bind_addr)?),
            TransportKind::Stream => Endpoint::Stream(StreamListener::bind(self.config.bind_addr)?),
        };
        let local_addr = endpoint.local_addr()?;

        let log = SessionLog::new(self.config.logger.clone(), "receiver", id);
        log.emit(TransferEvent::Listening { addr: local_addr });

        Ok(Listening {
            endpoint,
            local_addr,
            exchange: Exchange {
                config: self.config.clone(),
                session: TransferSession::new(id, self.config.kind),
                log,
            },
        })
    }

    /// One complete transfer: bind, receive, validate.
    pub fn receive_one(
        &mut self,
        observer: &dyn ProgressObserver,
        cancel: &CancelToken,
    ) -> Result<ReceiveReport, TransferError> {
        self.listen()?.accept_transfer(observer, cancel)?.validate()
    }

    /// Repeat [`Receiver::receive_one`] until cancelled.
    ///
    /// `on_session` sees every session result. Session failures move on to the
    /// next session; cancellation ends the loop cleanly and a bind failure
    /// ends it with an error.
    pub fn run_repeating(
        &mut self,
        observer: &dyn ProgressObserver,
        cancel: &CancelToken,
        mut on_session: impl FnMut(&Result<ReceiveReport, TransferError>),
    ) -> Result<LoopSummary, TransferError> {
        let mut summary = LoopSummary::default();
        while !cancel.is_cancelled() {
            let result = self.receive_one(observer, cancel);
            match &result {
                Ok(_) => summary.completed += 1,
                Err(e) if e.is_warning() => summary.mismatched += 1,
                Err(TransferError::Cancelled) => {}
                Err(_) => summary.failed += 1,
            }
            on_session(&result);

            match result {
                Err(TransferError::Cancelled) => break,
                Err(e) if e.is_fatal_to_loop() => return Err(e),
                _ => {}
            }
        }
        Ok(summary)
    }
}

enum Endpoint {
    Datagram(DatagramTransport),
    Stream(StreamListener),
}

impl Endpoint {
    fn local_addr(&self) -> Result<SocketAddr, TransferError> {
        match self {
            Self::Datagram(t) => t.local_addr(),
            Self::Stream(l) => l.local_addr(),
        }
        .map_err(TransferError::Transport)
    }
}

/// A bound endpoint waiting for one sender.
pub struct Listening {
    endpoint: Endpoint,
    local_addr: SocketAddr,
    exchange: Exchange,
}

impl Listening {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn session(&self) -> &TransferSession {
        &self.exchange.session
    }

    /// Run the exchange up to the end of the payload. The returned file has
    /// not been validated yet.
    pub fn accept_transfer(
        self,
        observer: &dyn ProgressObserver,
        cancel: &CancelToken,
    ) -> Result<ReceivedFile, TransferError> {
        let started = Instant::now();
        let Listening {
            endpoint,
            mut exchange,
            ..
        } = self;
        let result = match endpoint {
            Endpoint::Datagram(transport) => exchange.accept_datagram(transport, observer, cancel),
            Endpoint::Stream(listener) => exchange.accept_stream(listener, observer, cancel),
        };
        match result {
            Ok(path) => Ok(ReceivedFile {
                session: exchange.session,
                path,
                started,
                log: exchange.log,
            }),
            Err(e) => {
                exchange.log.fail(&mut exchange.session, &e);
                Err(e)
            }
        }
    }
}

/// Per-session receive state, separate from the socket it runs over.
struct Exchange {
    config: ReceiverConfig,
    session: TransferSession,
    log: SessionLog,
}

impl Exchange {
    fn accept_datagram(
        &mut self,
        mut transport: DatagramTransport,
        observer: &dyn ProgressObserver,
        cancel: &CancelToken,
    ) -> Result<PathBuf, TransferError> {
        self.session.advance(SessionState::Handshaking)?;
        let mut buf = [0u8; CONTROL_BUF];
        let (n, from) = transport.recv_from_cancellable(&mut buf, self.config.poll_interval, cancel)?;
        // The first datagram is consumed either way.
        if !Phrase::Handshake.matches(&buf[..n]) {
            return Err(TransferError::HandshakeRejected {
                expected: Phrase::Handshake.as_str(),
                got: describe_payload(&buf[..n]),
            });
        }
        transport
            .send_to(Phrase::HandshakeAck.as_bytes(), from)
            .map_err(TransferError::Transport)?;
        transport.set_peer(from);
        self.session.peer = Some(from);
        self.log.emit(TransferEvent::HandshakeComplete { peer: from });

        self.session.advance(SessionState::ExchangingMetadata)?;
        transport
            .set_read_timeout(Some(self.config.read_timeout))
            .map_err(TransferError::Transport)?;
        let (n, meta_from) = match transport.recv_from(&mut buf) {
            Ok(received) => received,
            Err(ref e) if is_timeout(e) => {
                return Err(TransferError::MetadataDecode {
                    reason: format!("no metadata within {:?}", self.config.read_timeout),
                    raw: String::new(),
                });
            }
            Err(e) => return Err(TransferError::Transport(e)),
        };
        let metadata = TransferMetadata::decode(&buf[..n])?;
        self.log.emit(TransferEvent::MetadataReceived {
            name: metadata.name.clone(),
            size: metadata.size,
            from: meta_from,
        });
        let path = self.destination(&metadata)?;
        self.session.metadata = Some(metadata);

        self.stream_payload(&mut transport, path, observer, cancel)
    }

    fn accept_stream(
        &mut self,
        listener: StreamListener,
        observer: &dyn ProgressObserver,
        cancel: &CancelToken,
    ) -> Result<PathBuf, TransferError> {
        let mut transport = listener.accept(self.config.poll_interval, cancel)?;
        // Backlog of one connection per session.
        drop(listener);
        let peer = transport.peer_addr();
        self.session.peer = peer;
        if let Some(peer) = peer {
            self.log.emit(TransferEvent::Connected { peer });
        }

        self.session.advance(SessionState::ExchangingMetadata)?;
        transport
            .set_read_timeout(self.config.stream_read_timeout)
            .map_err(TransferError::Transport)?;
        let mut buf = [0u8; CONTROL_BUF];
        let n = transport.recv_unit(&mut buf).map_err(TransferError::Transport)?;
        if n == 0 {
            return Err(TransferError::MetadataDecode {
                reason: "connection closed before metadata".into(),
                raw: String::new(),
            });
        }
        let metadata = TransferMetadata::decode(&buf[..n])?;
        if let Some(from) = peer {
            self.log.emit(TransferEvent::MetadataReceived {
                name: metadata.name.clone(),
                size: metadata.size,
                from,
            });
        }
        // Name policy runs before the ACK so a refused sender never streams.
        let path = self.destination(&metadata)?;
        transport
            .send_unit(Phrase::StreamAck.as_bytes())
            .map_err(TransferError::Transport)?;
        self.session.metadata = Some(metadata);

        let result = self.stream_payload(&mut transport, path, observer, cancel);
        transport.close();
        result
    }

    fn stream_payload<T: Transport>(
        &mut self,
        transport: &mut T,
        path: PathBuf,
        observer: &dyn ProgressObserver,
        cancel: &CancelToken,
    ) -> Result<PathBuf, TransferError> {
        let expected = self.session.metadata.as_ref().map_or(0, |m| m.size);
        self.session.advance(SessionState::Streaming)?;
        let logged = LoggedObserver {
            inner: observer,
            log: &self.log,
        };
        let received = receive_chunks(transport, &path, expected, self.config.chunk_size, &logged, cancel)?;
        self.session.bytes_transferred = received;
        Ok(path)
    }

    /// Destination path for the peer-supplied name.
    fn destination(&self, metadata: &TransferMetadata) -> Result<PathBuf, TransferError> {
        if !metadata.has_safe_name() {
            if self.config.reject_unsafe_names {
                return Err(TransferError::UnsafeName(metadata.name.clone()));
            }
            tracing::warn!(
                session = self.session.id,
                "peer-supplied file name {:?} escapes {}",
                metadata.name,
                self.config.save_dir.display()
            );
        }
        Ok(self.config.save_dir.join(&metadata.name))
    }
}

/// Payload written to disk, awaiting digest validation.
pub struct ReceivedFile {
    session: TransferSession,
    path: PathBuf,
    started: Instant,
    log: SessionLog,
}

impl ReceivedFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn metadata(&self) -> Option<&TransferMetadata> {
        self.session.metadata.as_ref()
    }

    pub fn session(&self) -> &TransferSession {
        &self.session
    }

    /// Compare the file's digest with the declared one. A mismatch keeps the
    /// file and reports both digests.
    pub fn validate(mut self) -> Result<ReceiveReport, TransferError> {
        match self.check() {
            Ok(report) => Ok(report),
            Err(e) => {
                self.log.fail(&mut self.session, &e);
                Err(e)
            }
        }
    }

    fn check(&mut self) -> Result<ReceiveReport, TransferError> {
        self.session.advance(SessionState::Validating)?;
        let metadata = self
            .session
            .metadata
            .clone()
            .ok_or(TransferError::InvalidTransition {
                from: SessionState::Validating,
                to: SessionState::Done,
            })?;
        let elapsed = self.started.elapsed();
        self.log.emit(TransferEvent::TransferComplete {
            bytes: self.session.bytes_transferred,
            duration_ms: elapsed.as_millis() as u64,
        });

        let computed = compute_digest(&self.path)?;
        if !digests_equal(&metadata.digest, &computed) {
            self.log.emit(TransferEvent::ValidationMismatch {
                expected: metadata.digest.clone(),
                computed: computed.clone(),
            });
            return Err(TransferError::ValidationMismatch {
                path: self.path.clone(),
                expected: metadata.digest,
                computed,
            });
        }
        self.log.emit(TransferEvent::ValidationPassed { digest: computed });
        self.session.advance(SessionState::Done)?;

        Ok(ReceiveReport {
            session: self.session.id,
            kind: self.session.kind,
            peer: self.session.peer,
            metadata,
            path: self.path.clone(),
            bytes_received: self.session.bytes_transferred,
            elapsed,
        })
    }
}
