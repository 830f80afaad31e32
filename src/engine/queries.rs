use ulid::Ulid;

use crate::model::*;

use super::conflict::{detect_conflict, windows_of, ConflictReport};
use super::generator::{generate, Generated};
use super::{Engine, EngineError};

impl Engine {
    pub async fn get_series(&self, id: Ulid) -> Result<ClassSeries, EngineError> {
        self.store.get(id).await?.ok_or(EngineError::SeriesNotFound(id))
    }

    /// Every series booked on a room or instructor, ordered by first session.
    pub async fn series_for_resource(&self, key: ResourceKey) -> Result<Vec<ClassSeries>, EngineError> {
        let mut series = self.store.for_resource(key).await?;
        series.sort_by_key(|s| s.sessions.first().map(|first| first.start));
        Ok(series)
    }

    /// Sessions on a resource overlapping `window`, tagged with their series.
    pub async fn schedule(&self, key: ResourceKey, window: Span) -> Result<Vec<(Ulid, Session)>, EngineError> {
        let mut out: Vec<(Ulid, Session)> = self
            .store
            .for_resource(key)
            .await?
            .iter()
            .flat_map(|series| series.overlapping(&window).map(|s| (series.id, *s)).collect::<Vec<_>>())
            .collect();
        out.sort_by_key(|(_, s)| s.start);
        Ok(out)
    }

    /// Expand a rule as `create_series` would, without checking or committing.
    pub fn preview(&self, rule: &RecurrenceRule) -> Result<Generated, EngineError> {
        generate(rule, self.now(), &self.options.policy)
    }

    /// Run the conflict detector against committed series.
    pub async fn check_conflicts(
        &self,
        candidates: &[Session],
        room_id: Ulid,
        instructor_id: Ulid,
        exclude: Option<Ulid>,
    ) -> Result<Option<ConflictReport>, EngineError> {
        if candidates.is_empty() {
            return Ok(None);
        }
        let existing = self
            .store
            .find_overlapping(Some(room_id), Some(instructor_id), exclude, &windows_of(candidates))
            .await?;
        Ok(detect_conflict(candidates, room_id, instructor_id, &existing, exclude))
    }
}
