use chrono::{NaiveDate, NaiveTime};
use ulid::Ulid;

use crate::limits::MAX_SUGGESTIONS;
use crate::model::*;
use crate::store::BookingFilter;
use crate::window::{self, HoursViolation};

use super::{Engine, EngineError};

/// A requested window on one space, in the space's wall-clock terms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotRequest {
    pub space_id: Ulid,
    pub date: NaiveDate,
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl SlotRequest {
    pub fn span(&self) -> Result<Span, EngineError> {
        window::request_span(self.date, self.start, self.end)
            .ok_or_else(|| EngineError::Validation(format!(
                "start {} must be before end {}",
                self.start, self.end
            )))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unavailability {
    Hours(HoursViolation),
    InsufficientNotice { required_minutes: u32, lead_minutes: i64 },
    DurationOutOfRange { minutes: i64, min: u32, max: Option<u32> },
    Conflict { booking_code: String },
}

impl std::fmt::Display for Unavailability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Unavailability::Hours(v) => write!(f, "{v}"),
            Unavailability::InsufficientNotice {
                required_minutes,
                lead_minutes,
            } => write!(
                f,
                "requires {required_minutes} minutes notice, request is {lead_minutes} minutes ahead"
            ),
            Unavailability::DurationOutOfRange { minutes, min, max } => match max {
                Some(max) => write!(f, "duration {minutes}m outside [{min}m, {max}m]"),
                None => write!(f, "duration {minutes}m below minimum {min}m"),
            },
            Unavailability::Conflict { booking_code } => {
                write!(f, "overlaps booking {booking_code}")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Availability {
    Eligible,
    Unavailable(Unavailability),
}

impl Availability {
    pub fn is_eligible(&self) -> bool {
        matches!(self, Availability::Eligible)
    }
}

/// Decide whether `request` is bookable given the bookings already on the
/// space. Checks run in order: hours, notice, duration, conflicts.
pub fn evaluate(
    space: &Space,
    request: &SlotRequest,
    span: Span,
    now: Ms,
    existing: &[Booking],
) -> Availability {
    if let Some(v) = window::hours_violation(space, request.date, request.start, request.end) {
        return Availability::Unavailable(Unavailability::Hours(v));
    }

    let rules = &space.rules;
    let lead = span.start - now;
    if lead < Ms::from(rules.min_advance_minutes) * MINUTE_MS {
        return Availability::Unavailable(Unavailability::InsufficientNotice {
            required_minutes: rules.min_advance_minutes,
            lead_minutes: lead.div_euclid(MINUTE_MS),
        });
    }

    let minutes = span.duration_minutes();
    let too_short = minutes < i64::from(rules.min_duration_minutes);
    let too_long = rules
        .max_duration_minutes
        .is_some_and(|max| minutes > i64::from(max));
    if too_short || too_long {
        return Availability::Unavailable(Unavailability::DurationOutOfRange {
            minutes,
            min: rules.min_duration_minutes,
            max: rules.max_duration_minutes,
        });
    }

    let buffer = rules.buffer_ms();
    let padded = span.expand(buffer);
    for booking in existing.iter().filter(|b| b.status.is_active()) {
        if window::overlaps(padded.start, padded.end, booking.span.start, booking.span.end) {
            return Availability::Unavailable(Unavailability::Conflict {
                booking_code: booking.code.clone(),
            });
        }
    }

    Availability::Eligible
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

/// `base` minus `to_remove`; both sorted by start, `to_remove` disjoint.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(Span::new(current_start, current_end));
        }
    }

    result
}

/// Free windows of at least `min_duration` inside `open`, after removing
/// the buffered footprint of every active booking and anything before
/// `earliest_start`.
pub fn free_windows(
    open: Span,
    existing: &[Booking],
    buffer: Ms,
    earliest_start: Ms,
    min_duration: Ms,
) -> Vec<Span> {
    if earliest_start >= open.end {
        return Vec::new();
    }
    let open = Span::new(open.start.max(earliest_start), open.end);

    let mut blocked: Vec<Span> = existing
        .iter()
        .filter(|b| b.status.is_active())
        .map(|b| b.span.expand(buffer))
        .filter(|s| s.overlaps(&open))
        .collect();
    blocked.sort_by_key(|s| s.start);
    let blocked = merge_overlapping(&blocked);

    let mut free = subtract_intervals(&[open], &blocked);
    free.retain(|s| s.duration_ms() >= min_duration);
    free
}

impl Engine {
    /// Eligibility of a window against hours, notice, duration and the
    /// space's active bookings. Pre-check only; the store enforces
    /// exclusion again at insert time.
    pub async fn check_availability(&self, request: &SlotRequest) -> Result<Availability, EngineError> {
        let space = self.load_space(request.space_id).await?;
        let span = request.span()?;
        let existing = self
            .store
            .find_bookings(&BookingFilter::active_around(
                space.id,
                span,
                space.rules.buffer_ms(),
            ))
            .await?;

        let verdict = evaluate(&space, request, span, self.now(), &existing);
        let label = match &verdict {
            Availability::Eligible => "eligible",
            Availability::Unavailable(Unavailability::Conflict { .. }) => "conflict",
            Availability::Unavailable(_) => "rejected",
        };
        metrics::counter!(crate::observability::AVAILABILITY_CHECKS_TOTAL, "result" => label)
            .increment(1);
        Ok(verdict)
    }

    /// Alternative windows of `duration_minutes` on `date`, offered when a
    /// request is refused.
    pub async fn suggest_slots(
        &self,
        space_id: Ulid,
        date: NaiveDate,
        duration_minutes: u32,
    ) -> Result<Vec<Span>, EngineError> {
        let space = self.load_space(space_id).await?;
        let Some(open) = window::operating_span(&space, date) else {
            return Ok(Vec::new());
        };
        // Buffers reach across midnight, so select by span rather than date.
        let existing = self
            .store
            .find_bookings(&BookingFilter::active_around(
                space_id,
                open,
                space.rules.buffer_ms(),
            ))
            .await?;
        let earliest = self.now() + Ms::from(space.rules.min_advance_minutes) * MINUTE_MS;
        let duration = Ms::from(duration_minutes.max(space.rules.min_duration_minutes)) * MINUTE_MS;

        if space
            .rules
            .max_duration_minutes
            .is_some_and(|max| duration > Ms::from(max) * MINUTE_MS)
        {
            return Ok(Vec::new());
        }

        let mut free = free_windows(open, &existing, space.rules.buffer_ms(), earliest, duration);
        free.truncate(MAX_SUGGESTIONS);
        Ok(free)
    }
}
