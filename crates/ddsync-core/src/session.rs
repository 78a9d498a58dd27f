//! Stop-and-wait sync session for one record kind on one peripheral.
//!
//! The session never touches the radio. Every transition returns a
//! [`SessionStep`] telling the owner what to do next, and the owner performs
//! the read or hands the batch upward.
//!
//! ```text
//!            start(ready)                on_value_received
//!   Idle ───────────────► AwaitingRecord ◄────────────┐ remaining > 0
//!    ▲                         │                      │  (Read)
//!    │                         └──────────────────────┘
//!    │  remaining <= 0 (Complete)
//!    ├──────────────────────────┤
//!    │  decode error, disconnect, read failure (Aborted)
//!    ├──────────────────────────┤
//!    │                          │ timeout (Aborted)
//!    │                          ▼
//!    │   late response,     Draining
//!    └── read failure, ◄────────┘
//!        disconnect
//! ```
//!
//! There is at most one outstanding read: a new read is requested only after
//! the previous response has been decoded, so records reach the batch in
//! device order exactly once. A timed-out read is still owed a response by
//! the transport, so the session drains it before a new batch may start.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use ddsync_types::SyncRecord;

/// Why a batch was discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    /// A response could not be decoded.
    Decode,
    /// The link went down mid-batch.
    Disconnected,
    /// The read could not be issued or the transport reported a read failure.
    Transport,
    /// No response arrived within the read timeout.
    TimedOut,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::Decode => write!(f, "undecodable record"),
            AbortReason::Disconnected => write!(f, "disconnected"),
            AbortReason::Transport => write!(f, "read failed"),
            AbortReason::TimedOut => write!(f, "read timed out"),
        }
    }
}

/// Why a request was ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The peripheral is not sync-ready.
    NotReady,
    /// A batch is already in flight.
    AlreadyInProgress,
    /// No read is outstanding.
    NotAwaiting,
    /// A timed-out read has not been answered yet.
    ReadOutstanding,
    /// The response belonged to a read that already timed out.
    StaleResponse,
}

/// What the owner of a session must do next.
#[derive(Debug, Clone, PartialEq)]
#[must_use]
pub enum SessionStep<R> {
    /// Issue exactly one read on the kind's characteristic.
    Read,
    /// The batch is complete; deliver it.
    Complete(Vec<R>),
    /// The batch was discarded.
    Aborted(AbortReason),
    /// The request was a no-op.
    Rejected(RejectReason),
}

/// Session state. The batch only exists while a read is outstanding.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionState<R> {
    /// No sync in progress.
    Idle,
    /// Waiting for the response to the single outstanding read.
    AwaitingRecord {
        /// Records received so far, in device order.
        batch: Vec<R>,
        /// When the outstanding read was requested.
        awaiting_since: Instant,
    },
    /// The batch timed out. Its last read is still outstanding and the
    /// response is discarded when it arrives.
    Draining,
}

/// Lightweight view of a session for status queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionStatus {
    /// No sync in progress.
    Idle,
    /// A batch is in flight.
    Syncing {
        /// Records received so far.
        records_received: usize,
    },
    /// Waiting out the response to a timed-out read.
    Draining,
}

/// Stop-and-wait sync state machine.
#[derive(Debug, Clone)]
pub struct SyncSession<R> {
    state: SessionState<R>,
}

impl<R> Default for SyncSession<R> {
    fn default() -> Self {
        Self {
            state: SessionState::Idle,
        }
    }
}

impl<R: SyncRecord> SyncSession<R> {
    /// A new idle session.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state.
    pub fn state(&self) -> &SessionState<R> {
        &self.state
    }

    /// Current state without the batch contents.
    pub fn status(&self) -> SessionStatus {
        match &self.state {
            SessionState::Idle => SessionStatus::Idle,
            SessionState::AwaitingRecord { batch, .. } => SessionStatus::Syncing {
                records_received: batch.len(),
            },
            SessionState::Draining => SessionStatus::Draining,
        }
    }

    /// Whether a batch is in flight.
    pub fn in_progress(&self) -> bool {
        matches!(self.state, SessionState::AwaitingRecord { .. })
    }

    /// Begin a batch if the readiness gate is open and nothing is in flight.
    pub fn start(&mut self, ready: bool) -> SessionStep<R> {
        if !ready {
            return SessionStep::Rejected(RejectReason::NotReady);
        }
        match self.state {
            SessionState::Idle => {}
            SessionState::AwaitingRecord { .. } => {
                return SessionStep::Rejected(RejectReason::AlreadyInProgress);
            }
            SessionState::Draining => return SessionStep::Rejected(RejectReason::ReadOutstanding),
        }
        self.state = SessionState::AwaitingRecord {
            batch: Vec::new(),
            awaiting_since: Instant::now(),
        };
        SessionStep::Read
    }

    /// Handle the response to the outstanding read.
    pub fn on_value_received(&mut self, raw: &[u8]) -> SessionStep<R> {
        let SessionStatus::Syncing { records_received } = self.status() else {
            return self.discard_response();
        };

        let envelope = match R::decode(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(
                    kind = %R::KIND,
                    received = records_received,
                    error = %e,
                    "Discarding batch after undecodable record"
                );
                self.state = SessionState::Idle;
                return SessionStep::Aborted(AbortReason::Decode);
            }
        };

        if envelope.is_last() {
            return match std::mem::replace(&mut self.state, SessionState::Idle) {
                SessionState::AwaitingRecord { mut batch, .. } => {
                    batch.push(envelope.record);
                    SessionStep::Complete(batch)
                }
                _ => SessionStep::Rejected(RejectReason::NotAwaiting),
            };
        }

        match &mut self.state {
            SessionState::AwaitingRecord {
                batch,
                awaiting_since,
            } => {
                batch.push(envelope.record);
                *awaiting_since = Instant::now();
                debug!(kind = %R::KIND, remaining = envelope.remaining, "Requesting next record");
                SessionStep::Read
            }
            _ => SessionStep::Rejected(RejectReason::NotAwaiting),
        }
    }

    /// A response arrived with no batch in flight.
    fn discard_response(&mut self) -> SessionStep<R> {
        match std::mem::replace(&mut self.state, SessionState::Idle) {
            SessionState::Draining => {
                debug!(kind = %R::KIND, "Discarding response to timed-out read");
                SessionStep::Rejected(RejectReason::StaleResponse)
            }
            _ => SessionStep::Rejected(RejectReason::NotAwaiting),
        }
    }

    /// The link went down. Any partial batch is discarded.
    pub fn on_disconnect(&mut self) -> SessionStep<R> {
        self.abort(AbortReason::Disconnected)
    }

    /// Discard any partial batch for the given reason.
    ///
    /// Also ends a drain: a failed read or a dropped link means the timed-out
    /// read will never be answered.
    pub fn abort(&mut self, reason: AbortReason) -> SessionStep<R> {
        match std::mem::replace(&mut self.state, SessionState::Idle) {
            SessionState::AwaitingRecord { .. } => SessionStep::Aborted(reason),
            _ => SessionStep::Rejected(RejectReason::NotAwaiting),
        }
    }

    /// Abort if the outstanding read has been pending longer than `limit`.
    ///
    /// The read stays outstanding at the transport, so the session drains
    /// instead of going idle. Returns `None` when nothing changed.
    pub fn check_timeout(&mut self, now: Instant, limit: Duration) -> Option<SessionStep<R>> {
        match &self.state {
            SessionState::AwaitingRecord { awaiting_since, .. }
                if now.saturating_duration_since(*awaiting_since) > limit =>
            {
                self.state = SessionState::Draining;
                Some(SessionStep::Aborted(AbortReason::TimedOut))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ddsync_types::codec::{encode_event, encode_reading};
    use ddsync_types::{Event, SensorReading};
    use time::OffsetDateTime;

    fn reading(id: &str) -> SensorReading {
        SensorReading {
            record_id: id.to_string(),
            timestamp: OffsetDateTime::UNIX_EPOCH,
            humidity: 40.0,
            temperature: 20.0,
        }
    }

    fn reading_bytes(id: &str, remaining: i64) -> Vec<u8> {
        encode_reading(&reading(id), remaining).unwrap()
    }

    #[test]
    fn test_start_requires_ready() {
        let mut session = SyncSession::<SensorReading>::new();
        assert_eq!(
            session.start(false),
            SessionStep::Rejected(RejectReason::NotReady)
        );
        assert_eq!(session.state(), &SessionState::Idle);
    }

    #[test]
    fn test_second_start_is_noop() {
        let mut session = SyncSession::<SensorReading>::new();
        assert_eq!(session.start(true), SessionStep::Read);
        assert_eq!(
            session.start(true),
            SessionStep::Rejected(RejectReason::AlreadyInProgress)
        );
        assert!(session.in_progress());
    }

    #[test]
    fn test_value_while_idle_is_ignored() {
        let mut session = SyncSession::<SensorReading>::new();
        assert_eq!(
            session.on_value_received(&reading_bytes("d-1", 0)),
            SessionStep::Rejected(RejectReason::NotAwaiting)
        );
        assert_eq!(session.status(), SessionStatus::Idle);
    }

    #[test]
    fn test_batch_in_device_order() {
        let mut session = SyncSession::<SensorReading>::new();
        assert_eq!(session.start(true), SessionStep::Read);
        assert_eq!(
            session.on_value_received(&reading_bytes("r1", 2)),
            SessionStep::Read
        );
        assert_eq!(
            session.status(),
            SessionStatus::Syncing {
                records_received: 1
            }
        );
        assert_eq!(
            session.on_value_received(&reading_bytes("r2", 1)),
            SessionStep::Read
        );
        let SessionStep::Complete(batch) = session.on_value_received(&reading_bytes("r3", 0))
        else {
            panic!("expected completed batch");
        };
        let ids: Vec<_> = batch.iter().map(|r| r.record_id.as_str()).collect();
        assert_eq!(ids, ["r1", "r2", "r3"]);
        assert_eq!(session.state(), &SessionState::Idle);
    }

    #[test]
    fn test_negative_remaining_terminates() {
        let mut session = SyncSession::<SensorReading>::new();
        let _ = session.start(true);
        let step = session.on_value_received(&reading_bytes("r1", -1));
        assert!(matches!(step, SessionStep::Complete(ref b) if b.len() == 1));
    }

    #[test]
    fn test_decode_failure_discards_batch() {
        let mut session = SyncSession::<SensorReading>::new();
        let _ = session.start(true);
        assert_eq!(
            session.on_value_received(&reading_bytes("r1", 1)),
            SessionStep::Read
        );
        assert_eq!(
            session.on_value_received(b"{\"data\":"),
            SessionStep::Aborted(AbortReason::Decode)
        );
        assert_eq!(session.state(), &SessionState::Idle);
        // A late response after abort is ignored.
        assert_eq!(
            session.on_value_received(&reading_bytes("r2", 0)),
            SessionStep::Rejected(RejectReason::NotAwaiting)
        );
    }

    #[test]
    fn test_wrong_kind_is_decode_failure() {
        let mut session = SyncSession::<Event>::new();
        let _ = session.start(true);
        assert_eq!(
            session.on_value_received(&reading_bytes("r1", 0)),
            SessionStep::Aborted(AbortReason::Decode)
        );
    }

    #[test]
    fn test_disconnect_mid_batch() {
        let mut session = SyncSession::<Event>::new();
        let _ = session.start(true);
        let event = Event {
            record_id: "e1".to_string(),
            timestamp: OffsetDateTime::UNIX_EPOCH,
            event_type: 1,
        };
        assert_eq!(
            session.on_value_received(&encode_event(&event, 3).unwrap()),
            SessionStep::Read
        );
        assert_eq!(
            session.on_disconnect(),
            SessionStep::Aborted(AbortReason::Disconnected)
        );
        assert_eq!(
            session.on_disconnect(),
            SessionStep::Rejected(RejectReason::NotAwaiting)
        );
    }

    #[test]
    fn test_restart_after_abort_starts_fresh() {
        let mut session = SyncSession::<SensorReading>::new();
        let _ = session.start(true);
        let _ = session.on_value_received(&reading_bytes("stale", 1));
        let _ = session.abort(AbortReason::Transport);

        assert_eq!(session.start(true), SessionStep::Read);
        let SessionStep::Complete(batch) = session.on_value_received(&reading_bytes("fresh", 0))
        else {
            panic!("expected completed batch");
        };
        assert_eq!(batch, vec![reading("fresh")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_aborts_outstanding_read() {
        let mut session = SyncSession::<SensorReading>::new();
        let limit = Duration::from_secs(10);
        assert!(session.check_timeout(Instant::now(), limit).is_none());

        let _ = session.start(true);
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(session.check_timeout(Instant::now(), limit).is_none());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(
            session.check_timeout(Instant::now(), limit),
            Some(SessionStep::Aborted(AbortReason::TimedOut))
        );
        assert!(!session.in_progress());
        assert_eq!(session.status(), SessionStatus::Draining);
        assert!(session.check_timeout(Instant::now(), limit).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_new_read_until_timed_out_read_answers() {
        let mut session = SyncSession::<SensorReading>::new();
        let limit = Duration::from_secs(5);
        let _ = session.start(true);
        tokio::time::advance(Duration::from_secs(6)).await;
        let _ = session.check_timeout(Instant::now(), limit);

        assert_eq!(
            session.start(true),
            SessionStep::Rejected(RejectReason::ReadOutstanding)
        );

        // The late answer is consumed without joining any batch.
        assert_eq!(
            session.on_value_received(&reading_bytes("r1", 2)),
            SessionStep::Rejected(RejectReason::StaleResponse)
        );
        assert_eq!(session.state(), &SessionState::Idle);

        assert_eq!(session.start(true), SessionStep::Read);
        assert_eq!(
            session.on_value_received(&reading_bytes("r2", 1)),
            SessionStep::Read
        );
        let SessionStep::Complete(batch) = session.on_value_received(&reading_bytes("r3", 0))
        else {
            panic!("expected completed batch");
        };
        let ids: Vec<_> = batch.iter().map(|r| r.record_id.as_str()).collect();
        assert_eq!(ids, ["r2", "r3"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_late_read_ends_drain() {
        let mut session = SyncSession::<Event>::new();
        let _ = session.start(true);
        tokio::time::advance(Duration::from_secs(11)).await;
        let _ = session.check_timeout(Instant::now(), Duration::from_secs(10));

        assert_eq!(
            session.abort(AbortReason::Transport),
            SessionStep::Rejected(RejectReason::NotAwaiting)
        );
        assert_eq!(session.start(true), SessionStep::Read);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_measured_per_read() {
        let mut session = SyncSession::<SensorReading>::new();
        let limit = Duration::from_secs(10);
        let _ = session.start(true);

        tokio::time::advance(Duration::from_secs(8)).await;
        assert_eq!(
            session.on_value_received(&reading_bytes("r1", 1)),
            SessionStep::Read
        );
        tokio::time::advance(Duration::from_secs(8)).await;
        assert!(session.check_timeout(Instant::now(), limit).is_none());
    }
}
