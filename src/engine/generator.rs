use std::collections::HashSet;

use chrono::{Datelike, Days, NaiveDate, NaiveDateTime};
use serde::Serialize;
use tracing::debug;

use crate::limits::*;
use crate::model::*;

use super::validator::{parse_window, ClockWindow, SessionPolicy};
use super::EngineError;

/// Non-fatal diagnostics collected while expanding a rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Notice {
    /// A manual date that did not parse as `YYYY-MM-DD`; skipped.
    InvalidManualDate(String),
    /// A candidate inside the lead-time buffer; dropped.
    TooSoon(NaiveDateTime),
    /// A stored exception whose `original_start` the edited rule no longer produces.
    UnmatchedException(NaiveDateTime),
}

/// Output of [`generate`]: ordered sessions plus whatever was skipped on the way.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Generated {
    pub sessions: Vec<Session>,
    pub notices: Vec<Notice>,
}

/// Expand `rule` into concrete sessions, validating each one and dropping
/// those that start before `now + lead_time`.
pub fn generate(rule: &RecurrenceRule, now: NaiveDateTime, policy: &SessionPolicy) -> Result<Generated, EngineError> {
    if rule.time_windows.is_empty() {
        return Err(EngineError::Input("at least one time window is required".into()));
    }
    if rule.time_windows.len() > MAX_TIME_WINDOWS {
        return Err(EngineError::LimitExceeded("too many time windows"));
    }
    let windows = rule
        .time_windows
        .iter()
        .map(|w| parse_window(w, policy))
        .collect::<Result<Vec<_>, _>>()?;
    reject_overlapping_windows(&windows)?;

    let mut notices = Vec::new();
    let dates = match rule.kind {
        RecurrenceKind::Single => vec![rule.series_start],
        RecurrenceKind::CustomManual => {
            require_end(rule)?;
            manual_dates(rule, &mut notices)?
        }
        _ => walk(rule)?,
    };

    let mut sessions = Vec::with_capacity(dates.len() * windows.len());
    let mut dropped = 0usize;
    for date in dates {
        for window in &windows {
            let session = window.on(date);
            if policy.too_soon(session.start, now) {
                debug!(start = %session.start, "dropping session inside lead-time buffer");
                notices.push(Notice::TooSoon(session.start));
                dropped += 1;
                continue;
            }
            sessions.push(session);
            if sessions.len() > MAX_SESSIONS_PER_SERIES {
                return Err(EngineError::LimitExceeded("rule expands to too many sessions"));
            }
        }
    }

    if sessions.is_empty() {
        return Err(EngineError::EmptyResult { dropped });
    }
    sessions.sort_by_key(|s| s.start);
    sessions.dedup_by_key(|s| (s.start, s.end));
    metrics::histogram!(crate::observability::SESSIONS_GENERATED).record(sessions.len() as f64);
    Ok(Generated { sessions, notices })
}

/// Windows of one rule repeat on every date, so they must be pairwise disjoint.
fn reject_overlapping_windows(windows: &[ClockWindow]) -> Result<(), EngineError> {
    let mut sorted = windows.to_vec();
    sorted.sort_by_key(|w| (w.start, w.end));
    for pair in sorted.windows(2) {
        if pair[1].start < pair[0].end {
            return Err(EngineError::Input(format!(
                "time windows {}-{} and {}-{} overlap",
                pair[0].start.format("%H:%M"),
                pair[0].end.format("%H:%M"),
                pair[1].start.format("%H:%M"),
                pair[1].end.format("%H:%M"),
            )));
        }
    }
    Ok(())
}

fn require_end(rule: &RecurrenceRule) -> Result<NaiveDate, EngineError> {
    let end = rule
        .series_end
        .ok_or_else(|| EngineError::Input(format!("{:?} rule requires a series end date", rule.kind)))?;
    if end < rule.series_start {
        return Err(EngineError::Range(format!(
            "series start {} is after series end {end}",
            rule.series_start
        )));
    }
    if (end - rule.series_start).num_days() > MAX_SERIES_DAYS {
        return Err(EngineError::LimitExceeded("series spans too many days"));
    }
    Ok(end)
}

fn interval(rule: &RecurrenceRule) -> Result<i64, EngineError> {
    match rule.interval_count {
        None => Ok(1),
        Some(0) => Err(EngineError::Input("interval count must be at least 1".into())),
        Some(n) => Ok(i64::from(n)),
    }
}

/// Day-by-day cursor from `series_start` to `series_end` inclusive.
fn walk(rule: &RecurrenceRule) -> Result<Vec<NaiveDate>, EngineError> {
    let end = require_end(rule)?;
    let every = interval(rule)?;
    let weekdays: HashSet<u8> = rule.selected_weekdays.iter().copied().collect();
    let month_days: HashSet<u8> = rule.selected_month_days.iter().copied().collect();

    let mut dates = Vec::new();
    let mut cursor = rule.series_start;
    while cursor <= end {
        let days_since = (cursor - rule.series_start).num_days();
        let weekday = cursor.weekday().num_days_from_sunday() as u8;
        let matched = match rule.kind {
            RecurrenceKind::Daily => days_since % every == 0,
            RecurrenceKind::Weekly => (days_since / 7) % every == 0 && weekdays.contains(&weekday),
            RecurrenceKind::CustomPattern => {
                (days_since / 7) % every == 0 && (weekdays.is_empty() || weekdays.contains(&weekday))
            }
            RecurrenceKind::Monthly => month_day_matches(cursor, &month_days),
            RecurrenceKind::Single | RecurrenceKind::CustomManual => false,
        };
        if matched {
            dates.push(cursor);
        }
        cursor = match cursor.checked_add_days(Days::new(1)) {
            Some(next) => next,
            None => break,
        };
    }
    Ok(dates)
}

/// Selected days past the end of a short month fall back to its last day.
fn month_day_matches(date: NaiveDate, selected: &HashSet<u8>) -> bool {
    let day = date.day() as u8;
    if selected.contains(&day) {
        return true;
    }
    let last = last_day_of_month(date);
    day == last && selected.iter().any(|&d| d > last)
}

fn last_day_of_month(date: NaiveDate) -> u8 {
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)
        .and_then(|first| first.pred_opt())
        .map_or(31, |last| last.day() as u8)
}

fn manual_dates(rule: &RecurrenceRule, notices: &mut Vec<Notice>) -> Result<Vec<NaiveDate>, EngineError> {
    if rule.manual_dates.len() > MAX_MANUAL_DATES {
        return Err(EngineError::LimitExceeded("too many manual dates"));
    }
    let mut dates = Vec::with_capacity(rule.manual_dates.len());
    for raw in &rule.manual_dates {
        match NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d") {
            Ok(date) => dates.push(date),
            Err(_) => {
                debug!(value = %raw, "skipping unparsable manual date");
                notices.push(Notice::InvalidManualDate(raw.clone()));
            }
        }
    }
    Ok(dates)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn long_ago() -> NaiveDateTime {
        at("2000-01-01", "00:00")
    }

    fn starts(g: &Generated) -> Vec<NaiveDateTime> {
        g.sessions.iter().map(|s| s.start).collect()
    }

    fn run(rule: &RecurrenceRule) -> Result<Generated, EngineError> {
        generate(rule, long_ago(), &SessionPolicy::default())
    }

    #[test]
    fn daily_three_days() {
        let rule = RecurrenceRule::new(RecurrenceKind::Daily, d("2024-01-01"))
            .until(d("2024-01-03"))
            .every(1)
            .at("09:00", "10:00");
        let g = run(&rule).unwrap();
        assert_eq!(
            starts(&g),
            vec![at("2024-01-01", "09:00"), at("2024-01-02", "09:00"), at("2024-01-03", "09:00")]
        );
        assert!(g.sessions.iter().all(|s| s.end - s.start == chrono::Duration::hours(1)));
        assert!(g.notices.is_empty());
    }

    #[test]
    fn daily_interval_skips_days() {
        let rule = RecurrenceRule::new(RecurrenceKind::Daily, d("2024-01-01"))
            .until(d("2024-01-07"))
            .every(3)
            .at("09:00", "10:00");
        let g = run(&rule).unwrap();
        assert_eq!(
            starts(&g),
            vec![at("2024-01-01", "09:00"), at("2024-01-04", "09:00"), at("2024-01-07", "09:00")]
        );
    }

    #[test]
    fn biweekly_mondays() {
        let rule = RecurrenceRule::new(RecurrenceKind::Weekly, d("2024-01-01"))
            .until(d("2024-02-28"))
            .every(2)
            .on_weekdays(&[1])
            .at("09:00", "10:00");
        let g = run(&rule).unwrap();
        assert_eq!(
            starts(&g),
            vec![
                at("2024-01-01", "09:00"),
                at("2024-01-15", "09:00"),
                at("2024-01-29", "09:00"),
                at("2024-02-12", "09:00"),
                at("2024-02-26", "09:00"),
            ]
        );
    }

    #[test]
    fn weekly_without_weekdays_is_empty() {
        let rule = RecurrenceRule::new(RecurrenceKind::Weekly, d("2024-01-01"))
            .until(d("2024-01-31"))
            .at("09:00", "10:00");
        let err = run(&rule).unwrap_err();
        assert!(matches!(err, EngineError::EmptyResult { dropped: 0 }));
        assert_eq!(
            err.to_string(),
            "rule produced no bookable sessions (0 dropped inside the lead-time buffer)"
        );
    }

    #[test]
    fn custom_pattern_empty_weekdays_matches_every_day() {
        let rule = RecurrenceRule::new(RecurrenceKind::CustomPattern, d("2024-01-01"))
            .until(d("2024-01-05"))
            .at("09:00", "10:00");
        assert_eq!(run(&rule).unwrap().sessions.len(), 5);
    }

    #[test]
    fn custom_pattern_requires_end() {
        let rule = RecurrenceRule::new(RecurrenceKind::CustomPattern, d("2024-01-01")).at("09:00", "10:00");
        assert!(matches!(run(&rule), Err(EngineError::Input(_))));
    }

    #[test]
    fn monthly_31st_falls_back_in_february() {
        let rule = RecurrenceRule::new(RecurrenceKind::Monthly, d("2024-02-01"))
            .until(d("2024-02-29"))
            .on_month_days(&[31])
            .at("09:00", "10:00");
        assert_eq!(starts(&run(&rule).unwrap()), vec![at("2024-02-29", "09:00")]);

        let rule = RecurrenceRule::new(RecurrenceKind::Monthly, d("2023-02-01"))
            .until(d("2023-02-28"))
            .on_month_days(&[31])
            .at("09:00", "10:00");
        assert_eq!(starts(&run(&rule).unwrap()), vec![at("2023-02-28", "09:00")]);
    }

    #[test]
    fn monthly_fallback_does_not_double_book() {
        // 30 and 31 both land on Apr 30 once.
        let rule = RecurrenceRule::new(RecurrenceKind::Monthly, d("2024-04-01"))
            .until(d("2024-05-31"))
            .on_month_days(&[30, 31])
            .at("09:00", "10:00");
        assert_eq!(
            starts(&run(&rule).unwrap()),
            vec![at("2024-04-30", "09:00"), at("2024-05-30", "09:00"), at("2024-05-31", "09:00")]
        );
    }

    #[test]
    fn single_runs_once() {
        let rule = RecurrenceRule::new(RecurrenceKind::Single, d("2024-03-05"))
            .at("09:00", "10:00")
            .at("14:00", "15:00");
        let g = run(&rule).unwrap();
        assert_eq!(starts(&g), vec![at("2024-03-05", "09:00"), at("2024-03-05", "14:00")]);
    }

    #[test]
    fn single_ignores_missing_end() {
        let rule = RecurrenceRule::new(RecurrenceKind::Single, d("2024-03-05")).at("09:00", "10:00");
        assert!(rule.series_end.is_none());
        assert!(run(&rule).is_ok());
    }

    #[test]
    fn manual_dates_skip_invalid_with_notice() {
        let rule = RecurrenceRule::new(RecurrenceKind::CustomManual, d("2024-01-01"))
            .until(d("2024-12-31"))
            .on_dates(&["2024-05-02", "not-a-date", "2024-02-30", "2024-03-01"])
            .at("09:00", "10:00");
        let g = run(&rule).unwrap();
        assert_eq!(starts(&g), vec![at("2024-03-01", "09:00"), at("2024-05-02", "09:00")]);
        assert_eq!(
            g.notices,
            vec![
                Notice::InvalidManualDate("not-a-date".into()),
                Notice::InvalidManualDate("2024-02-30".into()),
            ]
        );
    }

    #[test]
    fn manual_duplicates_collapse() {
        let rule = RecurrenceRule::new(RecurrenceKind::CustomManual, d("2024-01-01"))
            .until(d("2024-12-31"))
            .on_dates(&["2024-05-02", "2024-05-02"])
            .at("09:00", "10:00");
        assert_eq!(run(&rule).unwrap().sessions.len(), 1);
    }

    #[test]
    fn empty_windows_is_input_error() {
        let rule = RecurrenceRule::new(RecurrenceKind::Daily, d("2024-01-01")).until(d("2024-01-03"));
        assert!(matches!(run(&rule), Err(EngineError::Input(_))));
    }

    #[test]
    fn missing_end_is_input_error() {
        let rule = RecurrenceRule::new(RecurrenceKind::Daily, d("2024-01-01")).at("09:00", "10:00");
        assert!(matches!(run(&rule), Err(EngineError::Input(_))));
    }

    #[test]
    fn start_after_end_is_range_error() {
        let rule = RecurrenceRule::new(RecurrenceKind::Daily, d("2024-01-05"))
            .until(d("2024-01-01"))
            .at("09:00", "10:00");
        assert!(matches!(run(&rule), Err(EngineError::Range(_))));
    }

    #[test]
    fn zero_interval_is_input_error() {
        let rule = RecurrenceRule::new(RecurrenceKind::Daily, d("2024-01-01"))
            .until(d("2024-01-05"))
            .every(0)
            .at("09:00", "10:00");
        assert!(matches!(run(&rule), Err(EngineError::Input(_))));
    }

    #[test]
    fn lead_time_drops_past_sessions() {
        let rule = RecurrenceRule::new(RecurrenceKind::Daily, d("2024-01-01"))
            .until(d("2024-01-03"))
            .at("09:00", "10:00");
        // 08:45 on Jan 2: Jan 1 is past and Jan 2 is inside the buffer.
        let g = generate(&rule, at("2024-01-02", "08:45"), &SessionPolicy::default()).unwrap();
        assert_eq!(starts(&g), vec![at("2024-01-03", "09:00")]);
        assert_eq!(
            g.notices,
            vec![Notice::TooSoon(at("2024-01-01", "09:00")), Notice::TooSoon(at("2024-01-02", "09:00"))]
        );
    }

    #[test]
    fn lead_time_emptying_everything_is_empty_result() {
        let rule = RecurrenceRule::new(RecurrenceKind::Daily, d("2024-01-01"))
            .until(d("2024-01-03"))
            .at("09:00", "10:00");
        let result = generate(&rule, at("2024-06-01", "00:00"), &SessionPolicy::default());
        assert!(matches!(result, Err(EngineError::EmptyResult { dropped: 3 })));
    }

    #[test]
    fn multiple_windows_stay_ordered_and_disjoint() {
        let rule = RecurrenceRule::new(RecurrenceKind::Daily, d("2024-01-01"))
            .until(d("2024-01-10"))
            .at("14:00", "15:00")
            .at("09:00", "10:00");
        let g = run(&rule).unwrap();
        assert_eq!(g.sessions.len(), 20);
        for pair in g.sessions.windows(2) {
            assert!(pair[0].start < pair[1].start);
            assert!(!pair[0].span().overlaps(&pair[1].span()));
        }
    }

    #[test]
    fn windows_sharing_a_start_are_rejected() {
        let rule = RecurrenceRule::new(RecurrenceKind::Daily, d("2024-01-01"))
            .until(d("2024-01-03"))
            .at("09:00", "10:00")
            .at("09:00", "11:00");
        assert!(matches!(run(&rule), Err(EngineError::Input(_))));
    }

    #[test]
    fn overlapping_windows_are_rejected_but_touching_ones_are_not() {
        let overlapping = RecurrenceRule::new(RecurrenceKind::Single, d("2024-01-01"))
            .at("10:30", "11:30")
            .at("09:00", "11:00");
        assert!(matches!(run(&overlapping), Err(EngineError::Input(_))));

        let touching = RecurrenceRule::new(RecurrenceKind::Single, d("2024-01-01"))
            .at("10:00", "11:00")
            .at("09:00", "10:00");
        assert_eq!(run(&touching).unwrap().sessions.len(), 2);
    }

    #[test]
    fn regeneration_is_idempotent() {
        let rule = RecurrenceRule::new(RecurrenceKind::Weekly, d("2024-01-01"))
            .until(d("2024-03-31"))
            .on_weekdays(&[1, 3, 5])
            .at("18:00", "19:30");
        assert_eq!(run(&rule).unwrap(), run(&rule).unwrap());
    }

    #[test]
    fn bad_window_is_rejected_before_walking() {
        let rule = RecurrenceRule::new(RecurrenceKind::Daily, d("2024-01-01"))
            .until(d("2024-01-03"))
            .at("9am", "10:00");
        assert!(matches!(run(&rule), Err(EngineError::Input(_))));
    }

    #[test]
    fn overlong_series_is_limited() {
        let rule = RecurrenceRule::new(RecurrenceKind::Daily, d("2024-01-01"))
            .until(d("2040-01-01"))
            .at("09:00", "10:00");
        assert!(matches!(run(&rule), Err(EngineError::LimitExceeded(_))));
    }

    #[test]
    fn last_day_of_month_handles_december_and_leap_years() {
        assert_eq!(last_day_of_month(d("2024-12-15")), 31);
        assert_eq!(last_day_of_month(d("2024-02-01")), 29);
        assert_eq!(last_day_of_month(d("2100-02-01")), 28);
        assert_eq!(last_day_of_month(d("2024-04-10")), 30);
    }
}
