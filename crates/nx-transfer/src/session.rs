/// Per-transfer session state.
///
/// ```text
/// Waiting ──▶ Handshaking ──▶ ExchangingMetadata ──▶ Streaming ──▶ Validating ──▶ Done
///    │         (datagram)            ▲                   │                        ▲
///    └───────── (stream) ────────────┘                   └──── (sender) ──────────┘
///
/// Every non-terminal state may move to Failed.
/// ```

use std::net::SocketAddr;
use std::sync::Arc;

use crate::error::TransferError;
use crate::logging::{TransferEvent, TransferLog, TransferLogger};
use crate::metadata::TransferMetadata;
use crate::progress::{ProgressEvent, ProgressObserver};
use crate::transport::TransportKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Waiting,
    Handshaking,
    ExchangingMetadata,
    Streaming,
    Validating,
    Done,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// Transition guard for the session state machine.
    pub fn can_advance_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (from, Failed) => !from.is_terminal(),
            (Waiting, Handshaking) | (Waiting, ExchangingMetadata) => true,
            (Handshaking, ExchangingMetadata) => true,
            (ExchangingMetadata, Streaming) => true,
            (Streaming, Validating) | (Streaming, Done) => true,
            (Validating, Done) => true,
            _ => false,
        }
    }
}

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    Pending,
    Complete,
    Failed,
    ValidationMismatch,
    Cancelled,
}

/// One file transfer, from first socket operation to final report.
#[derive(Debug, Clone)]
pub struct TransferSession {
    pub id: u64,
    pub kind: TransportKind,
    pub peer: Option<SocketAddr>,
    pub metadata: Option<TransferMetadata>,
    pub bytes_transferred: u64,
    state: SessionState,
    outcome: SessionOutcome,
}

impl TransferSession {
    pub fn new(id: u64, kind: TransportKind) -> Self {
        Self {
            id,
            kind,
            peer: None,
            metadata: None,
            bytes_transferred: 0,
            state: SessionState::Waiting,
            outcome: SessionOutcome::Pending,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn outcome(&self) -> SessionOutcome {
        self.outcome
    }

    pub fn advance(&mut self, next: SessionState) -> Result<(), TransferError> {
        if !self.state.can_advance_to(next) {
            return Err(TransferError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        tracing::trace!(session = self.id, "state {:?} -> {:?}", self.state, next);
        self.state = next;
        if next == SessionState::Done {
            self.outcome = SessionOutcome::Complete;
        }
        Ok(())
    }

    /// Record a failure. Terminal sessions keep their state.
    pub fn fail(&mut self, error: &TransferError) {
        if !self.state.is_terminal() {
            self.state = SessionState::Failed;
        }
        self.outcome = match error {
            TransferError::Cancelled => SessionOutcome::Cancelled,
            TransferError::ValidationMismatch { .. } => SessionOutcome::ValidationMismatch,
            _ => SessionOutcome::Failed,
        };
    }
}

/// Logger handle bound to one component and session.
#[derive(Clone)]
pub(crate) struct SessionLog {
    logger: Option<Arc<dyn TransferLogger>>,
    component: &'static str,
    session: u64,
}

impl SessionLog {
    pub(crate) fn new(logger: Option<Arc<dyn TransferLogger>>, component: &'static str, session: u64) -> Self {
        Self {
            logger,
            component,
            session,
        }
    }

    pub(crate) fn emit(&self, event: TransferEvent) {
        if let Some(ref logger) = self.logger {
            logger.log(TransferLog {
                component: self.component,
                session: self.session,
                event,
            });
        }
    }

    /// Mark the session failed and log the error. Cancellation is not an error.
    pub(crate) fn fail(&self, session: &mut TransferSession, error: &TransferError) {
        session.fail(error);
        match error {
            TransferError::Cancelled => {
                tracing::info!(component = self.component, session = self.session, "transfer cancelled");
            }
            TransferError::ValidationMismatch { .. } => {}
            other => self.emit(TransferEvent::Error {
                message: other.to_string(),
            }),
        }
    }
}

/// Forwards progress to the caller's observer and the session log.
pub(crate) struct LoggedObserver<'a> {
    pub(crate) inner: &'a dyn ProgressObserver,
    pub(crate) log: &'a SessionLog,
}

impl ProgressObserver for LoggedObserver<'_> {
    fn on_progress(&self, event: ProgressEvent) {
        self.log.emit(TransferEvent::ChunkMoved {
            bytes: event.bytes_transferred,
            total: event.total_bytes,
        });
        self.inner.on_progress(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SessionState::*;

    #[test]
    fn datagram_receiver_path_is_valid() {
        let mut s = TransferSession::new(1, TransportKind::Datagram);
        for next in [Handshaking, ExchangingMetadata, Streaming, Validating, Done] {
            s.advance(next).unwrap();
        }
        assert_eq!(s.outcome(), SessionOutcome::Complete);
    }

    #[test]
    fn stream_skips_handshake() {
        let mut s = TransferSession::new(1, TransportKind::Stream);
        s.advance(ExchangingMetadata).unwrap();
        s.advance(Streaming).unwrap();
        s.advance(Done).unwrap();
        assert_eq!(s.state(), Done);
    }

    #[test]
    fn skipping_metadata_is_rejected() {
        let mut s = TransferSession::new(1, TransportKind::Stream);
        let err = s.advance(Streaming).unwrap_err();
        assert!(matches!(
            err,
            TransferError::InvalidTransition { from: Waiting, to: Streaming }
        ));
        assert_eq!(s.state(), Waiting);
    }

    #[test]
    fn terminal_states_are_final() {
        assert!(!Done.can_advance_to(Failed));
        assert!(!Failed.can_advance_to(Waiting));
        assert!(Streaming.can_advance_to(Failed));
    }

    #[test]
    fn fail_records_outcome() {
        let mut s = TransferSession::new(7, TransportKind::Datagram);
        s.advance(Handshaking).unwrap();
        s.fail(&TransferError::Cancelled);
        assert_eq!(s.state(), Failed);
        assert_eq!(s.outcome(), SessionOutcome::Cancelled);
    }
}
