use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};

use crate::model::*;

use super::EngineError;

/// Duration and lead-time constraints every generated or edited session must meet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionPolicy {
    /// Minimum gap between "now" and a session's start.
    pub lead_time: Duration,
    pub min_duration: Duration,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            lead_time: Duration::minutes(30),
            min_duration: Duration::minutes(30),
        }
    }
}

impl SessionPolicy {
    /// True if a session starting at `start` is too close to `now` to be booked.
    pub fn too_soon(&self, start: NaiveDateTime, now: NaiveDateTime) -> bool {
        start < now + self.lead_time
    }
}

/// A time window with both ends parsed and checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl ClockWindow {
    /// Same calendar day; sessions never cross midnight.
    pub fn on(&self, date: NaiveDate) -> Session {
        Session::new(date.and_time(self.start), date.and_time(self.end))
    }
}

pub fn parse_clock(value: &str) -> Result<NaiveTime, EngineError> {
    let trimmed = value.trim();
    // %H would also accept "9:00"; require the zero-padded form.
    if trimmed.len() != 5 {
        return Err(EngineError::Input(format!("invalid time {value:?}, expected HH:mm")));
    }
    NaiveTime::parse_from_str(trimmed, "%H:%M")
        .map_err(|_| EngineError::Input(format!("invalid time {value:?}, expected HH:mm")))
}

pub fn parse_window(window: &TimeWindow, policy: &SessionPolicy) -> Result<ClockWindow, EngineError> {
    let start = parse_clock(&window.start_time_24h)?;
    let end = parse_clock(&window.end_time_24h)?;
    if end <= start {
        return Err(EngineError::Range(format!(
            "window {}-{} ends before it starts",
            window.start_time_24h, window.end_time_24h
        )));
    }
    if end - start < policy.min_duration {
        return Err(EngineError::Range(format!(
            "window {}-{} is shorter than {} minutes",
            window.start_time_24h,
            window.end_time_24h,
            policy.min_duration.num_minutes()
        )));
    }
    Ok(ClockWindow { start, end })
}

/// Checks for an explicit start/end pair, as supplied by single-instance edits.
pub fn validate_span(start: NaiveDateTime, end: NaiveDateTime, policy: &SessionPolicy) -> Result<Span, EngineError> {
    if end <= start {
        return Err(EngineError::Range(format!("session end {end} is not after start {start}")));
    }
    if end - start < policy.min_duration {
        return Err(EngineError::Range(format!(
            "session is shorter than {} minutes",
            policy.min_duration.num_minutes()
        )));
    }
    Ok(Span::new(start, end))
}
