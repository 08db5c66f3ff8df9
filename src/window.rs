//! Interval arithmetic over the engine's millisecond timeline.
//!
//! Wall-clock times (operating hours, peak windows) are anchored to a
//! calendar date and read as UTC.

use chrono::{Datelike, NaiveDate, NaiveTime, Weekday};

use crate::model::*;

/// Half-open overlap test: touching edges do not overlap.
pub fn overlaps(a_start: Ms, a_end: Ms, b_start: Ms, b_end: Ms) -> bool {
    a_start < b_end && b_start < a_end
}

pub fn day_of_week(date: NaiveDate) -> Weekday {
    date.weekday()
}

pub fn is_weekend(date: NaiveDate) -> bool {
    matches!(day_of_week(date), Weekday::Sat | Weekday::Sun)
}

/// Absolute instant of `time` on `date`.
pub fn at(date: NaiveDate, time: NaiveTime) -> Ms {
    date.and_time(time).and_utc().timestamp_millis()
}

pub fn start_of_day(date: NaiveDate) -> Ms {
    at(date, NaiveTime::MIN)
}

/// Span for a same-day request, or `None` if `start >= end`.
pub fn request_span(date: NaiveDate, start: NaiveTime, end: NaiveTime) -> Option<Span> {
    (start < end).then(|| Span::new(at(date, start), at(date, end)))
}

/// Why a window falls outside a space's opening hours.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HoursViolation {
    Blackout(NaiveDate),
    Closed(Weekday),
    OutsideHours { open: NaiveTime, close: NaiveTime },
}

impl std::fmt::Display for HoursViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HoursViolation::Blackout(date) => write!(f, "{date} is a blackout date"),
            HoursViolation::Closed(day) => write!(f, "space is closed on {day}"),
            HoursViolation::OutsideHours { open, close } => {
                write!(f, "outside operating hours {open}-{close}")
            }
        }
    }
}

pub fn hours_violation(
    space: &Space,
    date: NaiveDate,
    start: NaiveTime,
    end: NaiveTime,
) -> Option<HoursViolation> {
    if space.blackout_dates.contains(&date) {
        return Some(HoursViolation::Blackout(date));
    }
    let day = day_of_week(date);
    let hours = space.hours.for_day(day);
    if hours.closed {
        return Some(HoursViolation::Closed(day));
    }
    if start < hours.open || end > hours.close {
        return Some(HoursViolation::OutsideHours {
            open: hours.open,
            close: hours.close,
        });
    }
    None
}

pub fn within_operating_hours(
    space: &Space,
    date: NaiveDate,
    start: NaiveTime,
    end: NaiveTime,
) -> bool {
    hours_violation(space, date, start, end).is_none()
}

/// The bookable span of `date`, or `None` when closed or blacked out.
pub fn operating_span(space: &Space, date: NaiveDate) -> Option<Span> {
    if space.blackout_dates.contains(&date) {
        return None;
    }
    let hours = space.hours.for_day(day_of_week(date));
    if hours.closed || hours.open >= hours.close {
        return None;
    }
    Some(Span::new(at(date, hours.open), at(date, hours.close)))
}

/// Spans of `date` covered by a daily `[start, end)` window. A window with
/// `end <= start` wraps midnight and yields the evening and early-morning
/// pieces of the same date.
pub fn daily_window(date: NaiveDate, start: NaiveTime, end: NaiveTime) -> Vec<Span> {
    let day_start = start_of_day(date);
    let day_end = day_start + DAY_MS;
    if start < end {
        return vec![Span::new(at(date, start), at(date, end))];
    }
    let mut spans = Vec::with_capacity(2);
    if end > NaiveTime::MIN {
        spans.push(Span::new(day_start, at(date, end)));
    }
    spans.push(Span::new(at(date, start), day_end));
    spans
}

/// Split `span` at every cut point strictly inside it. Cuts need not be sorted.
pub fn split_at(span: Span, cuts: &[Ms]) -> Vec<Span> {
    let mut points: Vec<Ms> = cuts
        .iter()
        .copied()
        .filter(|&c| span.start < c && c < span.end)
        .collect();
    points.sort_unstable();
    points.dedup();

    let mut pieces = Vec::with_capacity(points.len() + 1);
    let mut cursor = span.start;
    for point in points {
        pieces.push(Span::new(cursor, point));
        cursor = point;
    }
    pieces.push(Span::new(cursor, span.end));
    pieces
}
