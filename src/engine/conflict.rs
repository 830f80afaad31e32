use serde::Serialize;
use ulid::Ulid;

use crate::model::*;

/// Which request field the caller should change to resolve a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConflictField {
    Room,
    Instructor,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConflictReport {
    /// `Instructor` when both resources conflict.
    pub field: ConflictField,
    /// The room, the instructor, or both.
    pub resources: Vec<ResourceKey>,
    /// Exact overlap between the candidate and the existing session.
    pub window: Span,
    /// Series already holding `window` on `field`'s resource.
    pub series_id: Ulid,
    pub message: String,
}

impl std::fmt::Display for ConflictReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conflict: {}", self.message)
    }
}

#[derive(Debug, Clone, Copy)]
struct Hit {
    series_id: Ulid,
    window: Span,
}

impl Hit {
    fn earlier(current: Option<Hit>, candidate: Hit) -> Option<Hit> {
        match current {
            Some(h) if h.window.start <= candidate.window.start => Some(h),
            _ => Some(candidate),
        }
    }
}

/// Test every candidate against every stored occurrence of the series that
/// share a room or instructor with the request. `existing` is expected to be
/// the store's `find_overlapping` result but may be any superset.
pub fn detect_conflict(
    candidates: &[Session],
    room_id: Ulid,
    instructor_id: Ulid,
    existing: &[ClassSeries],
    exclude: Option<Ulid>,
) -> Option<ConflictReport> {
    let mut room_hit: Option<Hit> = None;
    let mut instructor_hit: Option<Hit> = None;

    for series in existing {
        if Some(series.id) == exclude {
            continue;
        }
        let same_room = series.room_id == room_id;
        let same_instructor = series.instructor_id == instructor_id;
        if !same_room && !same_instructor {
            continue;
        }
        for candidate in candidates {
            let span = candidate.span();
            for stored in series.overlapping(&span) {
                let Some(window) = stored.span().intersection(&span) else {
                    continue;
                };
                let hit = Hit { series_id: series.id, window };
                if same_room {
                    room_hit = Hit::earlier(room_hit, hit);
                }
                if same_instructor {
                    instructor_hit = Hit::earlier(instructor_hit, hit);
                }
            }
        }
    }

    let room = ResourceKey::Room(room_id);
    let instructor = ResourceKey::Instructor(instructor_id);
    let (field, resources, hit) = match (room_hit, instructor_hit) {
        (None, None) => return None,
        (Some(r), None) => (ConflictField::Room, vec![room], r),
        (None, Some(i)) => (ConflictField::Instructor, vec![instructor], i),
        (Some(_), Some(i)) => (ConflictField::Instructor, vec![room, instructor], i),
    };
    let names: Vec<String> = resources.iter().map(ToString::to_string).collect();
    let message = format!(
        "{} already booked from {} to {} by series {}",
        names.join(" and "),
        hit.window.start.format("%Y-%m-%d %H:%M"),
        hit.window.end.format("%H:%M"),
        hit.series_id,
    );
    metrics::counter!(crate::observability::CONFLICTS_TOTAL, "field" => field_label(field)).increment(1);
    Some(ConflictReport {
        field,
        resources,
        window: hit.window,
        series_id: hit.series_id,
        message,
    })
}

fn field_label(field: ConflictField) -> &'static str {
    match field {
        ConflictField::Room => "room",
        ConflictField::Instructor => "instructor",
    }
}

/// Every candidate span, for handing to `SeriesStore::find_overlapping`.
pub fn windows_of(candidates: &[Session]) -> Vec<Span> {
    candidates.iter().map(Session::span).collect()
}
