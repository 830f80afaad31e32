use std::collections::HashSet;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tracing::info;
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

use super::EngineError;

/// Persistence contract the coordinator consumes.
#[async_trait]
pub trait SeriesStore: Send + Sync {
    async fn insert(&self, series: ClassSeries) -> Result<(), EngineError>;

    async fn get(&self, id: Ulid) -> Result<Option<ClassSeries>, EngineError>;

    /// Overwrite an existing series record.
    async fn replace(&self, series: ClassSeries) -> Result<(), EngineError>;

    async fn remove(&self, id: Ulid) -> Result<ClassSeries, EngineError>;

    /// Series on `room_id` or `instructor_id` (other than `exclude`) with a
    /// stored session overlapping any of `windows`.
    async fn find_overlapping(
        &self,
        room_id: Option<Ulid>,
        instructor_id: Option<Ulid>,
        exclude: Option<Ulid>,
        windows: &[Span],
    ) -> Result<Vec<ClassSeries>, EngineError>;

    async fn for_resource(&self, key: ResourceKey) -> Result<Vec<ClassSeries>, EngineError>;
}

// ── In-memory store ──────────────────────────────────────

pub struct InMemoryStore {
    series: DashMap<Ulid, ClassSeries>,
    /// Room/instructor → series booked on it.
    by_resource: DashMap<ResourceKey, Vec<Ulid>>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            series: DashMap::new(),
            by_resource: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    pub fn snapshot(&self) -> Vec<ClassSeries> {
        self.series.iter().map(|e| e.value().clone()).collect()
    }

    fn index(&self, series: &ClassSeries) {
        for key in series.resource_keys() {
            let mut ids = self.by_resource.entry(key).or_default();
            if !ids.contains(&series.id) {
                ids.push(series.id);
            }
        }
    }

    fn unindex(&self, id: Ulid, keys: impl IntoIterator<Item = ResourceKey>) {
        for key in keys {
            let emptied = match self.by_resource.get_mut(&key) {
                Some(mut ids) => {
                    ids.retain(|other| *other != id);
                    ids.is_empty()
                }
                None => false,
            };
            if emptied {
                self.by_resource.remove_if(&key, |_, ids| ids.is_empty());
            }
        }
    }

    /// Apply a WAL event. Used for both live commits and replay.
    ///
    /// Readers must never observe a live series missing from the index of a
    /// resource it still holds: the record is stored first, new keys are
    /// indexed next, and only keys the series no longer uses are dropped.
    pub fn apply(&self, event: &Event) {
        match event {
            Event::SeriesCreated { series } | Event::SeriesUpdated { series } => {
                let mut series = series.clone();
                series.sort_sessions();
                let keys = series.resource_keys();
                let old = self.series.insert(series.id, series.clone());
                self.index(&series);
                if let Some(old) = old {
                    let stale = old.resource_keys().into_iter().filter(|k| !keys.contains(k));
                    self.unindex(old.id, stale);
                }
            }
            Event::SeriesDeleted { id, .. } => {
                if let Some((_, old)) = self.series.remove(id) {
                    self.unindex(old.id, old.resource_keys());
                }
            }
        }
    }

    fn ids_for(&self, key: ResourceKey) -> Vec<Ulid> {
        self.by_resource.get(&key).map(|ids| ids.clone()).unwrap_or_default()
    }

    fn get_sync(&self, id: Ulid) -> Option<ClassSeries> {
        self.series.get(&id).map(|e| e.value().clone())
    }

    fn find_overlapping_sync(
        &self,
        room_id: Option<Ulid>,
        instructor_id: Option<Ulid>,
        exclude: Option<Ulid>,
        windows: &[Span],
    ) -> Vec<ClassSeries> {
        let mut ids: Vec<Ulid> = Vec::new();
        if let Some(room) = room_id {
            ids.extend(self.ids_for(ResourceKey::Room(room)));
        }
        if let Some(instructor) = instructor_id {
            ids.extend(self.ids_for(ResourceKey::Instructor(instructor)));
        }
        let mut seen = HashSet::new();
        ids.retain(|id| Some(*id) != exclude && seen.insert(*id));

        ids.into_iter()
            .filter_map(|id| self.get_sync(id))
            .filter(|series| windows.iter().any(|w| series.overlapping(w).next().is_some()))
            .collect()
    }
}

#[async_trait]
impl SeriesStore for InMemoryStore {
    async fn insert(&self, series: ClassSeries) -> Result<(), EngineError> {
        if self.series.contains_key(&series.id) {
            return Err(EngineError::Input(format!("series {} already exists", series.id)));
        }
        self.apply(&Event::SeriesCreated { series });
        Ok(())
    }

    async fn get(&self, id: Ulid) -> Result<Option<ClassSeries>, EngineError> {
        Ok(self.get_sync(id))
    }

    async fn replace(&self, series: ClassSeries) -> Result<(), EngineError> {
        if !self.series.contains_key(&series.id) {
            return Err(EngineError::SeriesNotFound(series.id));
        }
        self.apply(&Event::SeriesUpdated { series });
        Ok(())
    }

    async fn remove(&self, id: Ulid) -> Result<ClassSeries, EngineError> {
        let series = self.get_sync(id).ok_or(EngineError::SeriesNotFound(id))?;
        self.apply(&Event::SeriesDeleted {
            id,
            room_id: series.room_id,
            instructor_id: series.instructor_id,
        });
        Ok(series)
    }

    async fn find_overlapping(
        &self,
        room_id: Option<Ulid>,
        instructor_id: Option<Ulid>,
        exclude: Option<Ulid>,
        windows: &[Span],
    ) -> Result<Vec<ClassSeries>, EngineError> {
        Ok(self.find_overlapping_sync(room_id, instructor_id, exclude, windows))
    }

    async fn for_resource(&self, key: ResourceKey) -> Result<Vec<ClassSeries>, EngineError> {
        Ok(self.ids_for(key).into_iter().filter_map(|id| self.get_sync(id)).collect())
    }
}

// ── Durable store: in-memory state behind a group-commit WAL ──

enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }
                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                respond_batch(batch, &result);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even on append error so partial bytes don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn respond_batch(batch: Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let result = wal.append_buffered(&event).and_then(|()| wal.flush_sync());
            let _ = response.send(result);
        }
    }
}

/// A [`SeriesStore`] that write-ahead logs every mutation before applying it,
/// and publishes committed events to a [`NotifyHub`].
pub struct WalStore {
    memory: InMemoryStore,
    wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
}

impl WalStore {
    /// Replay `wal_path` into memory and start the group-commit writer.
    /// Must be called inside a tokio runtime.
    pub fn open(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let memory = InMemoryStore::new();
        for event in &events {
            memory.apply(event);
        }
        info!(events = events.len(), series = memory.len(), "replayed WAL");
        metrics::gauge!(crate::observability::SERIES_ACTIVE).set(memory.len() as f64);
        Ok(Self { memory, wal_tx, notify })
    }

    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Storage("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Storage("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Storage(e.to_string()))
    }

    /// WAL-append + apply + notify in one call.
    async fn persist_and_apply(&self, event: Event) -> Result<(), EngineError> {
        self.wal_append(&event).await?;
        self.memory.apply(&event);
        for key in event.resource_keys() {
            self.notify.send(key, &event);
        }
        metrics::gauge!(crate::observability::SERIES_ACTIVE).set(self.memory.len() as f64);
        Ok(())
    }

    /// Rewrite the WAL with one `SeriesCreated` per live series.
    pub async fn compact(&self) -> Result<(), EngineError> {
        let events: Vec<Event> = self
            .memory
            .snapshot()
            .into_iter()
            .map(|series| Event::SeriesCreated { series })
            .collect();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::Storage("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Storage("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Storage(e.to_string()))
    }

    pub async fn appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Compact once the WAL has grown by `threshold` appends. Returns whether it ran.
    pub async fn compact_if_needed(&self, threshold: u64) -> Result<bool, EngineError> {
        let appends = self.appends_since_compact().await;
        if appends < threshold {
            return Ok(false);
        }
        self.compact().await?;
        info!(appends, "compacted WAL");
        Ok(true)
    }
}

#[async_trait]
impl SeriesStore for WalStore {
    async fn insert(&self, series: ClassSeries) -> Result<(), EngineError> {
        if self.memory.series.contains_key(&series.id) {
            return Err(EngineError::Input(format!("series {} already exists", series.id)));
        }
        self.persist_and_apply(Event::SeriesCreated { series }).await
    }

    async fn get(&self, id: Ulid) -> Result<Option<ClassSeries>, EngineError> {
        self.memory.get(id).await
    }

    async fn replace(&self, series: ClassSeries) -> Result<(), EngineError> {
        if !self.memory.series.contains_key(&series.id) {
            return Err(EngineError::SeriesNotFound(series.id));
        }
        self.persist_and_apply(Event::SeriesUpdated { series }).await
    }

    async fn remove(&self, id: Ulid) -> Result<ClassSeries, EngineError> {
        let series = self.memory.get_sync(id).ok_or(EngineError::SeriesNotFound(id))?;
        self.persist_and_apply(Event::SeriesDeleted {
            id,
            room_id: series.room_id,
            instructor_id: series.instructor_id,
        })
        .await?;
        Ok(series)
    }

    async fn find_overlapping(
        &self,
        room_id: Option<Ulid>,
        instructor_id: Option<Ulid>,
        exclude: Option<Ulid>,
        windows: &[Span],
    ) -> Result<Vec<ClassSeries>, EngineError> {
        self.memory.find_overlapping(room_id, instructor_id, exclude, windows).await
    }

    async fn for_resource(&self, key: ResourceKey) -> Result<Vec<ClassSeries>, EngineError> {
        self.memory.for_resource(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn series(room: Ulid, instructor: Ulid, sessions: Vec<Session>) -> ClassSeries {
        ClassSeries {
            id: Ulid::new(),
            rule: RecurrenceRule::new(RecurrenceKind::Single, NaiveDate::from_ymd_opt(2030, 1, 7).unwrap()),
            room_id: room,
            instructor_id: instructor,
            sessions,
            exceptions: Vec::new(),
        }
    }

    fn window(from: &str, to: &str) -> Span {
        Span::new(at("2030-01-07", from), at("2030-01-07", to))
    }

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("classbook_test_store");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn find_overlapping_matches_either_resource() {
        let store = InMemoryStore::new();
        let (room, instructor) = (Ulid::new(), Ulid::new());
        let s = |from, to| Session::new(at("2030-01-07", from), at("2030-01-07", to));
        let by_room = series(room, Ulid::new(), vec![s("09:00", "10:00")]);
        let by_instructor = series(Ulid::new(), instructor, vec![s("09:00", "10:00")]);
        let elsewhere = series(Ulid::new(), Ulid::new(), vec![s("09:00", "10:00")]);
        let later = series(room, instructor, vec![s("12:00", "13:00")]);
        for x in [&by_room, &by_instructor, &elsewhere, &later] {
            store.insert(x.clone()).await.unwrap();
        }

        let hits = store
            .find_overlapping(Some(room), Some(instructor), None, &[window("09:30", "10:30")])
            .await
            .unwrap();
        let mut ids: Vec<_> = hits.iter().map(|h| h.id).collect();
        ids.sort();
        let mut expected = vec![by_room.id, by_instructor.id];
        expected.sort();
        assert_eq!(ids, expected);

        let hits = store
            .find_overlapping(Some(room), None, Some(by_room.id), &[window("09:30", "10:30")])
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn same_room_and_instructor_listed_once() {
        let store = InMemoryStore::new();
        let (room, instructor) = (Ulid::new(), Ulid::new());
        let s = series(room, instructor, vec![Session::new(at("2030-01-07", "09:00"), at("2030-01-07", "10:00"))]);
        store.insert(s).await.unwrap();
        let hits = store
            .find_overlapping(Some(room), Some(instructor), None, &[window("09:00", "10:00")])
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn replace_moves_resource_index() {
        let store = InMemoryStore::new();
        let (old_room, new_room) = (Ulid::new(), Ulid::new());
        let mut s = series(old_room, Ulid::new(), Vec::new());
        store.insert(s.clone()).await.unwrap();
        s.room_id = new_room;
        store.replace(s.clone()).await.unwrap();

        assert!(store.for_resource(ResourceKey::Room(old_room)).await.unwrap().is_empty());
        assert_eq!(store.for_resource(ResourceKey::Room(new_room)).await.unwrap().len(), 1);
    }

    #[test]
    fn updates_never_hide_series_from_overlap_queries() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let store = Arc::new(InMemoryStore::new());
        let room = Ulid::new();
        let s = series(room, Ulid::new(), vec![Session::new(at("2030-01-07", "09:00"), at("2030-01-07", "10:00"))]);
        store.apply(&Event::SeriesCreated { series: s.clone() });

        let stop = Arc::new(AtomicBool::new(false));
        let writer = {
            let (store, stop, s) = (store.clone(), stop.clone(), s.clone());
            std::thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    store.apply(&Event::SeriesUpdated { series: s.clone() });
                }
            })
        };

        let mut misses = 0;
        for _ in 0..20_000 {
            if store.find_overlapping_sync(Some(room), None, None, &[window("09:30", "09:45")]).is_empty() {
                misses += 1;
            }
            if store.ids_for(ResourceKey::Room(room)).is_empty() {
                misses += 1;
            }
        }
        stop.store(true, Ordering::Relaxed);
        writer.join().unwrap();
        assert_eq!(misses, 0);
    }

    #[tokio::test]
    async fn delete_drops_empty_index_entries() {
        let store = InMemoryStore::new();
        let s = series(Ulid::new(), Ulid::new(), Vec::new());
        store.insert(s.clone()).await.unwrap();
        store.remove(s.id).await.unwrap();
        assert!(store.by_resource.is_empty());
    }

    #[tokio::test]
    async fn remove_unknown_is_not_found() {
        let store = InMemoryStore::new();
        let result = store.remove(Ulid::new()).await;
        assert!(matches!(result, Err(EngineError::SeriesNotFound(_))));
    }

    #[tokio::test]
    async fn wal_store_replays_after_reopen() {
        let path = test_wal_path("replay.wal");
        let room = Ulid::new();
        let kept = series(room, Ulid::new(), vec![Session::new(at("2030-01-07", "09:00"), at("2030-01-07", "10:00"))]);
        let dropped = series(room, Ulid::new(), Vec::new());
        {
            let store = WalStore::open(path.clone(), Arc::new(NotifyHub::new())).unwrap();
            store.insert(kept.clone()).await.unwrap();
            store.insert(dropped.clone()).await.unwrap();
            store.remove(dropped.id).await.unwrap();
        }

        let store = WalStore::open(path, Arc::new(NotifyHub::new())).unwrap();
        assert_eq!(store.get(kept.id).await.unwrap(), Some(kept));
        assert_eq!(store.get(dropped.id).await.unwrap(), None);
        assert_eq!(store.for_resource(ResourceKey::Room(room)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn compact_keeps_state_and_resets_counter() {
        let path = test_wal_path("compact.wal");
        let store = WalStore::open(path.clone(), Arc::new(NotifyHub::new())).unwrap();
        let mut s = series(Ulid::new(), Ulid::new(), Vec::new());
        store.insert(s.clone()).await.unwrap();
        for _ in 0..5 {
            s.exceptions.clear();
            store.replace(s.clone()).await.unwrap();
        }
        assert_eq!(store.appends_since_compact().await, 6);
        assert!(!store.compact_if_needed(10).await.unwrap());
        assert!(store.compact_if_needed(6).await.unwrap());
        assert_eq!(store.appends_since_compact().await, 0);

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, vec![Event::SeriesCreated { series: s }]);
    }

    #[tokio::test]
    async fn commits_are_published_to_both_resources() {
        let path = test_wal_path("notify.wal");
        let notify = Arc::new(NotifyHub::new());
        let store = WalStore::open(path, notify.clone()).unwrap();
        let s = series(Ulid::new(), Ulid::new(), Vec::new());
        let mut room_rx = notify.subscribe(ResourceKey::Room(s.room_id));
        let mut instructor_rx = notify.subscribe(ResourceKey::Instructor(s.instructor_id));

        store.insert(s.clone()).await.unwrap();
        let expected = Event::SeriesCreated { series: s };
        assert_eq!(room_rx.recv().await.unwrap(), expected);
        assert_eq!(instructor_rx.recv().await.unwrap(), expected);
    }
}
