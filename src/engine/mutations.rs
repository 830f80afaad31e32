use chrono::NaiveDateTime;
use tracing::{info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::generator::{generate, Notice};
use super::reconcile::{reconcile, upsert_exception};
use super::validator::validate_span;
use super::{detect_conflict, Booking, BookingStage, Engine, EngineError, Pipeline, SeriesRequest};

impl Engine {
    /// Generate, validate, conflict-check and commit a new series.
    pub async fn create_series(&self, request: SeriesRequest) -> Result<Booking, EngineError> {
        let mut run = Pipeline::start("create_series");
        let result = self.create_inner(request, &mut run).await;
        run.finish(result)
    }

    async fn create_inner(&self, request: SeriesRequest, run: &mut Pipeline) -> Result<Booking, EngineError> {
        let generated = generate(&request.rule, self.now(), &self.options.policy)?;
        run.advance(BookingStage::Generated);
        run.advance(BookingStage::Validated);

        let SeriesRequest { rule, room_id, instructor_id } = request;
        self.ensure_no_conflict(&generated.sessions, room_id, instructor_id, None)
            .await?;
        run.advance(BookingStage::ConflictChecked);

        let token = self
            .lock(&[ResourceKey::Room(room_id), ResourceKey::Instructor(instructor_id)])
            .await?;
        // Another request may have committed between the optimistic check and the lock.
        self.ensure_no_conflict(&generated.sessions, room_id, instructor_id, None)
            .await?;

        let series = ClassSeries {
            id: Ulid::new(),
            rule,
            room_id,
            instructor_id,
            sessions: generated.sessions.clone(),
            exceptions: Vec::new(),
        };
        let series_id = series.id;
        self.store.insert(series).await?;
        self.locks.release(token);

        info!(%series_id, sessions = generated.sessions.len(), "series created");
        Ok(Booking {
            series_id,
            sessions: generated.sessions,
            notices: generated.notices,
        })
    }

    /// Replay `create_series` while it fails with a retryable error.
    pub async fn create_series_retrying(&self, request: SeriesRequest, attempts: u32) -> Result<Booking, EngineError> {
        let mut attempt = 1;
        loop {
            match self.create_series(request.clone()).await {
                Err(e) if e.is_retryable() && attempt < attempts => {
                    warn!(attempt, error = %e, "retrying create_series");
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Regenerate a series from a new rule and reapply its stored exceptions.
    pub async fn update_series(&self, id: Ulid, request: SeriesRequest) -> Result<Booking, EngineError> {
        let mut run = Pipeline::start("update_series");
        let result = self.update_inner(id, request, &mut run).await;
        run.finish(result)
    }

    async fn update_inner(&self, id: Ulid, request: SeriesRequest, run: &mut Pipeline) -> Result<Booking, EngineError> {
        let existing = self.store.get(id).await?.ok_or(EngineError::SeriesNotFound(id))?;
        let generated = generate(&request.rule, self.now(), &self.options.policy)?;
        run.advance(BookingStage::Generated);
        run.advance(BookingStage::Validated);

        let SeriesRequest { rule, room_id, instructor_id } = request;
        let preview = reconcile(generated.sessions.clone(), &existing.exceptions);
        self.ensure_no_conflict(&preview.sessions, room_id, instructor_id, Some(id))
            .await?;
        run.advance(BookingStage::ConflictChecked);

        let token = self
            .lock(&[
                ResourceKey::Series(id),
                ResourceKey::Room(room_id),
                ResourceKey::Instructor(instructor_id),
            ])
            .await?;
        // Exceptions may have changed while we waited; reconcile against the stored record.
        let current = self.store.get(id).await?.ok_or(EngineError::SeriesNotFound(id))?;
        let reconciled = reconcile(generated.sessions, &current.exceptions);
        self.ensure_no_conflict(&reconciled.sessions, room_id, instructor_id, Some(id))
            .await?;

        let mut notices = generated.notices;
        for start in &reconciled.orphaned {
            warn!(series_id = %id, original_start = %start, "exception no longer matches a generated occurrence");
            notices.push(Notice::UnmatchedException(*start));
        }

        let series = ClassSeries {
            id,
            rule,
            room_id,
            instructor_id,
            sessions: reconciled.sessions.clone(),
            exceptions: current.exceptions,
        };
        self.store.replace(series).await?;
        self.locks.release(token);

        info!(series_id = %id, sessions = reconciled.sessions.len(), applied = reconciled.applied, "series updated");
        Ok(Booking {
            series_id: id,
            sessions: reconciled.sessions,
            notices,
        })
    }

    /// Move one occurrence, recording (or updating) a `Modified` exception
    /// under its original start.
    pub async fn edit_occurrence(
        &self,
        series_id: Ulid,
        current_start: NaiveDateTime,
        new_start: NaiveDateTime,
        new_end: NaiveDateTime,
        reason: impl Into<String>,
    ) -> Result<Session, EngineError> {
        let mut run = Pipeline::start("edit_occurrence");
        let result = self
            .edit_inner(series_id, current_start, new_start, new_end, reason.into(), &mut run)
            .await;
        run.finish(result)
    }

    async fn edit_inner(
        &self,
        series_id: Ulid,
        current_start: NaiveDateTime,
        new_start: NaiveDateTime,
        new_end: NaiveDateTime,
        reason: String,
        run: &mut Pipeline,
    ) -> Result<Session, EngineError> {
        check_reason(&reason)?;
        let span = validate_span(new_start, new_end, &self.options.policy)?;
        if self.options.policy.too_soon(new_start, self.now()) {
            return Err(EngineError::Range(format!(
                "occurrence at {new_start} starts inside the lead-time buffer"
            )));
        }
        run.advance(BookingStage::Validated);

        let (token, mut series) = self.lock_series(series_id, true).await?;
        let idx = series
            .position_of(current_start)
            .ok_or(EngineError::OccurrenceNotFound { series_id, start: current_start })?;
        let moved = Session {
            start: span.start,
            end: span.end,
            original_start: series.sessions[idx].original_start,
        };

        // Other series on either resource, plus this series' own remaining sessions.
        let mut existing = self
            .store
            .find_overlapping(Some(series.room_id), Some(series.instructor_id), Some(series_id), &[span])
            .await?;
        let mut siblings = series.clone();
        siblings.sessions.remove(idx);
        existing.push(siblings);
        if let Some(report) = detect_conflict(&[moved], series.room_id, series.instructor_id, &existing, None) {
            return Err(report.into());
        }
        run.advance(BookingStage::ConflictChecked);

        series.sessions[idx] = moved;
        series.sort_sessions();
        let updated = upsert_exception(
            &mut series.exceptions,
            SessionException {
                original_start: moved.original_start,
                status: ExceptionStatus::Modified,
                new_start: Some(moved.start),
                new_end: Some(moved.end),
                reason,
            },
        );
        self.store.replace(series).await?;
        self.locks.release(token);

        info!(%series_id, original_start = %moved.original_start, start = %moved.start, updated, "occurrence moved");
        Ok(moved)
    }

    /// Remove one occurrence, recording a `Cancelled` exception.
    pub async fn cancel_occurrence(
        &self,
        series_id: Ulid,
        current_start: NaiveDateTime,
        reason: impl Into<String>,
    ) -> Result<(), EngineError> {
        let reason = reason.into();
        check_reason(&reason)?;
        let (token, mut series) = self.lock_series(series_id, false).await?;
        let idx = series
            .position_of(current_start)
            .ok_or(EngineError::OccurrenceNotFound { series_id, start: current_start })?;
        let removed = series.sessions.remove(idx);
        upsert_exception(
            &mut series.exceptions,
            SessionException {
                original_start: removed.original_start,
                status: ExceptionStatus::Cancelled,
                new_start: None,
                new_end: None,
                reason,
            },
        );
        self.store.replace(series).await?;
        self.locks.release(token);

        info!(%series_id, original_start = %removed.original_start, "occurrence cancelled");
        Ok(())
    }

    /// Delete a series together with its sessions and exceptions.
    pub async fn delete_series(&self, id: Ulid) -> Result<(), EngineError> {
        let token = self.lock(&[ResourceKey::Series(id)]).await?;
        self.store.remove(id).await?;
        self.locks.release(token);
        info!(series_id = %id, "series deleted");
        Ok(())
    }

    /// Lock a series record (and optionally its resources) and read it
    /// under the lock, so the caller's read-modify-write is atomic.
    async fn lock_series(
        &self,
        series_id: Ulid,
        with_resources: bool,
    ) -> Result<(super::LockToken, ClassSeries), EngineError> {
        let before = self
            .store
            .get(series_id)
            .await?
            .ok_or(EngineError::SeriesNotFound(series_id))?;
        let mut keys = vec![ResourceKey::Series(series_id)];
        if with_resources {
            keys.extend(before.resource_keys());
        }
        let token = self.lock(&keys).await?;
        let series = self
            .store
            .get(series_id)
            .await?
            .ok_or(EngineError::SeriesNotFound(series_id))?;
        if with_resources && series.resource_keys() != before.resource_keys() {
            return Err(EngineError::Concurrency(format!(
                "series {series_id} was reassigned while waiting for its lock"
            )));
        }
        Ok((token, series))
    }
}

fn check_reason(reason: &str) -> Result<(), EngineError> {
    if reason.len() > MAX_REASON_LEN {
        return Err(EngineError::LimitExceeded("exception reason too long"));
    }
    Ok(())
}
