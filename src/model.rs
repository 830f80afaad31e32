use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Half-open interval `[start, end)` in wall-clock time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl Span {
    pub fn new(start: NaiveDateTime, end: NaiveDateTime) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration(&self) -> chrono::Duration {
        self.end - self.start
    }

    /// Touching boundaries (`self.end == other.start`) do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// The shared part of two overlapping spans.
    pub fn intersection(&self, other: &Span) -> Option<Span> {
        if !self.overlaps(other) {
            return None;
        }
        Some(Span::new(self.start.max(other.start), self.end.min(other.end)))
    }
}

/// A wall-clock window in `HH:mm`, applied to every matching date of a rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeWindow {
    pub start_time_24h: String,
    pub end_time_24h: String,
}

impl TimeWindow {
    pub fn new(start: &str, end: &str) -> Self {
        Self {
            start_time_24h: start.to_string(),
            end_time_24h: end.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecurrenceKind {
    Single,
    Daily,
    Weekly,
    Monthly,
    CustomManual,
    CustomPattern,
}

/// How a series lays out its occurrences.
///
/// `selected_weekdays` uses `0 = Sunday … 6 = Saturday`. `manual_dates` stay
/// as `YYYY-MM-DD` strings: unparsable entries are skipped with a notice
/// rather than rejecting the whole rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecurrenceRule {
    #[serde(rename = "type")]
    pub kind: RecurrenceKind,
    pub series_start: NaiveDate,
    #[serde(default)]
    pub series_end: Option<NaiveDate>,
    #[serde(default)]
    pub interval_count: Option<u32>,
    #[serde(default)]
    pub selected_weekdays: Vec<u8>,
    #[serde(default)]
    pub selected_month_days: Vec<u8>,
    #[serde(default)]
    pub manual_dates: Vec<String>,
    pub time_windows: Vec<TimeWindow>,
}

impl RecurrenceRule {
    /// A rule of `kind` starting on `series_start`; everything else empty.
    pub fn new(kind: RecurrenceKind, series_start: NaiveDate) -> Self {
        Self {
            kind,
            series_start,
            series_end: None,
            interval_count: None,
            selected_weekdays: Vec::new(),
            selected_month_days: Vec::new(),
            manual_dates: Vec::new(),
            time_windows: Vec::new(),
        }
    }

    pub fn until(mut self, end: NaiveDate) -> Self {
        self.series_end = Some(end);
        self
    }

    pub fn every(mut self, interval: u32) -> Self {
        self.interval_count = Some(interval);
        self
    }

    pub fn on_weekdays(mut self, days: &[u8]) -> Self {
        self.selected_weekdays = days.to_vec();
        self
    }

    pub fn on_month_days(mut self, days: &[u8]) -> Self {
        self.selected_month_days = days.to_vec();
        self
    }

    pub fn on_dates(mut self, dates: &[&str]) -> Self {
        self.manual_dates = dates.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn at(mut self, start: &str, end: &str) -> Self {
        self.time_windows.push(TimeWindow::new(start, end));
        self
    }
}

/// One concrete occurrence. `original_start` is the start the rule generated
/// for it and stays fixed when a single-instance edit moves the occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub original_start: NaiveDateTime,
}

impl Session {
    pub fn new(start: NaiveDateTime, end: NaiveDateTime) -> Self {
        Self {
            start,
            end,
            original_start: start,
        }
    }

    pub fn span(&self) -> Span {
        Span::new(self.start, self.end)
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.span().overlaps(other)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExceptionStatus {
    Modified,
    Cancelled,
}

/// A recorded override for one occurrence, keyed by `original_start`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionException {
    pub original_start: NaiveDateTime,
    pub status: ExceptionStatus,
    pub new_start: Option<NaiveDateTime>,
    pub new_end: Option<NaiveDateTime>,
    pub reason: String,
}

/// A bookable resource, or a series itself when mutating its record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ResourceKey {
    Room(Ulid),
    Instructor(Ulid),
    Series(Ulid),
}

impl std::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKey::Room(id) => write!(f, "room {id}"),
            ResourceKey::Instructor(id) => write!(f, "instructor {id}"),
            ResourceKey::Series(id) => write!(f, "series {id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassSeries {
    pub id: Ulid,
    pub rule: RecurrenceRule,
    pub room_id: Ulid,
    pub instructor_id: Ulid,
    /// Materialized occurrences, sorted by `start`.
    pub sessions: Vec<Session>,
    pub exceptions: Vec<SessionException>,
}

impl ClassSeries {
    pub fn resource_keys(&self) -> [ResourceKey; 2] {
        [ResourceKey::Room(self.room_id), ResourceKey::Instructor(self.instructor_id)]
    }

    pub fn sort_sessions(&mut self) {
        self.sessions.sort_by_key(|s| s.start);
    }

    /// Return only sessions whose span overlaps the query window.
    /// Uses binary search to skip sessions starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Session> {
        let right_bound = self.sessions.partition_point(|s| s.start < query.end);
        self.sessions[..right_bound]
            .iter()
            .filter(move |s| s.end > query.start)
    }

    pub fn position_of(&self, start: NaiveDateTime) -> Option<usize> {
        self.sessions.iter().position(|s| s.start == start)
    }
}

/// The WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    SeriesCreated { series: ClassSeries },
    SeriesUpdated { series: ClassSeries },
    SeriesDeleted { id: Ulid, room_id: Ulid, instructor_id: Ulid },
}

impl Event {
    pub fn resource_keys(&self) -> [ResourceKey; 2] {
        match self {
            Event::SeriesCreated { series } | Event::SeriesUpdated { series } => series.resource_keys(),
            Event::SeriesDeleted { room_id, instructor_id, .. } => {
                [ResourceKey::Room(*room_id), ResourceKey::Instructor(*instructor_id)]
            }
        }
    }
}

#[cfg(test)]
pub(crate) fn at(date: &str, time: &str) -> NaiveDateTime {
    NaiveDateTime::parse_from_str(&format!("{date} {time}"), "%Y-%m-%d %H:%M").unwrap()
}
