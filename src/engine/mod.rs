mod conflict;
mod error;
mod generator;
mod lock;
mod mutations;
mod queries;
mod reconcile;
mod store;
mod validator;

pub use conflict::{detect_conflict, windows_of, ConflictField, ConflictReport};
pub use error::{EngineError, ErrorKind};
pub use generator::{generate, Generated, Notice};
pub use lock::{LockTable, LockToken, ResourceLock};
pub use reconcile::{reconcile, upsert_exception, Reconciled};
pub use store::{InMemoryStore, SeriesStore, WalStore};
pub use validator::{parse_clock, parse_window, validate_span, ClockWindow, SessionPolicy};

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::config::Config;
use crate::model::*;

/// Source of "now" for the lead-time buffer.
pub type Clock = Arc<dyn Fn() -> NaiveDateTime + Send + Sync>;

/// A create or whole-series update, already typed at the system boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeriesRequest {
    pub rule: RecurrenceRule,
    pub room_id: Ulid,
    pub instructor_id: Ulid,
}

/// Result of a committed create or update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Booking {
    pub series_id: Ulid,
    pub sessions: Vec<Session>,
    pub notices: Vec<Notice>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BookingStage {
    Draft,
    Generated,
    Validated,
    ConflictChecked,
    Committed,
    Rejected,
}

/// Terminal outcome of a coordinator run, as handed to the service layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum BookingOutcome {
    Committed(Ulid),
    Rejected { kind: ErrorKind, detail: String },
}

impl BookingOutcome {
    pub fn from_result(result: &Result<Booking, EngineError>) -> Self {
        match result {
            Ok(booking) => BookingOutcome::Committed(booking.series_id),
            Err(e) => BookingOutcome::Rejected {
                kind: e.kind(),
                detail: e.to_string(),
            },
        }
    }
}

/// One linear run through the booking stages. Any failure jumps straight to
/// `Rejected`; nothing is persisted before `Committed`.
pub(crate) struct Pipeline {
    op: &'static str,
    stage: BookingStage,
    started: Instant,
}

impl Pipeline {
    pub(crate) fn start(op: &'static str) -> Self {
        debug!(op, stage = ?BookingStage::Draft, "booking pipeline started");
        Self {
            op,
            stage: BookingStage::Draft,
            started: Instant::now(),
        }
    }

    pub(crate) fn advance(&mut self, next: BookingStage) {
        debug_assert!(next > self.stage, "pipeline cannot move back from {:?} to {next:?}", self.stage);
        debug!(op = self.op, from = ?self.stage, to = ?next, "booking stage");
        self.stage = next;
    }

    pub(crate) fn finish<T>(mut self, result: Result<T, EngineError>) -> Result<T, EngineError> {
        let outcome = match &result {
            Ok(_) => {
                self.advance(BookingStage::Committed);
                "committed"
            }
            Err(e) => {
                let failed_at = self.stage;
                self.stage = BookingStage::Rejected;
                if e.is_retryable() {
                    warn!(op = self.op, ?failed_at, error = %e, "booking rejected, retryable");
                } else {
                    info!(op = self.op, ?failed_at, kind = e.kind().label(), error = %e, "booking rejected");
                }
                e.kind().label()
            }
        };
        metrics::counter!(crate::observability::BOOKINGS_TOTAL, "op" => self.op, "outcome" => outcome).increment(1);
        metrics::histogram!(crate::observability::BOOKING_DURATION_SECONDS, "op" => self.op)
            .record(self.started.elapsed().as_secs_f64());
        result
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineOptions {
    pub policy: SessionPolicy,
    pub lock_timeout: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            policy: SessionPolicy::default(),
            lock_timeout: Duration::from_secs(5),
        }
    }
}

impl From<&Config> for EngineOptions {
    fn from(config: &Config) -> Self {
        Self {
            policy: SessionPolicy {
                lead_time: chrono::Duration::minutes(config.lead_time_minutes),
                min_duration: chrono::Duration::minutes(config.min_session_minutes),
            },
            lock_timeout: Duration::from_millis(config.lock_timeout_ms),
        }
    }
}

/// The booking coordinator. Store and lock are injected; the engine holds no
/// other shared mutable state.
pub struct Engine {
    pub(super) store: Arc<dyn SeriesStore>,
    pub(super) locks: Arc<dyn ResourceLock>,
    pub(super) options: EngineOptions,
    clock: Clock,
}

impl Engine {
    pub fn new(store: Arc<dyn SeriesStore>, locks: Arc<dyn ResourceLock>, options: EngineOptions) -> Self {
        Self {
            store,
            locks,
            options,
            clock: Arc::new(|| chrono::Local::now().naive_local()),
        }
    }

    /// In-memory store and in-process lock table with default options.
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(InMemoryStore::new()),
            Arc::new(LockTable::new()),
            EngineOptions::default(),
        )
    }

    pub fn with_clock(mut self, clock: impl Fn() -> NaiveDateTime + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn now(&self) -> NaiveDateTime {
        (self.clock)()
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub(super) async fn lock(&self, keys: &[ResourceKey]) -> Result<LockToken, EngineError> {
        self.locks.acquire(keys, self.options.lock_timeout).await
    }

    /// Fail with `Conflict` if any other series occupies a candidate window.
    pub(super) async fn ensure_no_conflict(
        &self,
        candidates: &[Session],
        room_id: Ulid,
        instructor_id: Ulid,
        exclude: Option<Ulid>,
    ) -> Result<(), EngineError> {
        match self.check_conflicts(candidates, room_id, instructor_id, exclude).await? {
            Some(report) => Err(report.into()),
            None => Ok(()),
        }
    }
}
