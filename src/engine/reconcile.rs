use std::collections::HashMap;

use chrono::NaiveDateTime;

use crate::model::*;

/// Regenerated sessions with the series' stored overrides applied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciled {
    pub sessions: Vec<Session>,
    /// Exceptions that matched a regenerated occurrence.
    pub applied: usize,
    /// Exceptions whose `original_start` no longer matches anything the rule produces.
    pub orphaned: Vec<NaiveDateTime>,
}

/// Apply `exceptions` over freshly generated sessions. The exception list
/// itself is left untouched; it stays on the series as override history.
pub fn reconcile(generated: Vec<Session>, exceptions: &[SessionException]) -> Reconciled {
    let by_start: HashMap<NaiveDateTime, &SessionException> =
        exceptions.iter().map(|e| (e.original_start, e)).collect();

    let mut applied = 0usize;
    let mut matched = Vec::new();
    let mut sessions = Vec::with_capacity(generated.len());
    for session in generated {
        let Some(exception) = by_start.get(&session.original_start) else {
            sessions.push(session);
            continue;
        };
        applied += 1;
        matched.push(session.original_start);
        match exception.status {
            ExceptionStatus::Cancelled => {}
            ExceptionStatus::Modified => sessions.push(Session {
                start: exception.new_start.unwrap_or(session.start),
                end: exception.new_end.unwrap_or(session.end),
                original_start: session.original_start,
            }),
        }
    }
    sessions.sort_by_key(|s| s.start);

    let orphaned = exceptions
        .iter()
        .map(|e| e.original_start)
        .filter(|start| !matched.contains(start))
        .collect();
    Reconciled { sessions, applied, orphaned }
}

/// Insert or replace the exception for `exception.original_start`.
/// Returns true if an existing record was updated in place.
pub fn upsert_exception(exceptions: &mut Vec<SessionException>, exception: SessionException) -> bool {
    match exceptions
        .iter_mut()
        .find(|e| e.original_start == exception.original_start)
    {
        Some(existing) => {
            *existing = exception;
            true
        }
        None => {
            exceptions.push(exception);
            false
        }
    }
}
