//! Booking lifecycle.
//!
//! ```text
//! pending ──paid──▶ confirmed ──check_in──▶ checked_in ──check_out──▶ checked_out ──▶ completed
//!    │                 │   │
//!    └──cancel──▶ cancelled ◀─┘   └──grace elapsed──▶ no_show
//! ```
//!
//! Every transition is one compare-and-set against the status the caller
//! observed. A request from the wrong source status fails with
//! [`EngineError::InvalidTransition`]; nothing silently no-ops.

use std::collections::HashMap;

use ulid::Ulid;

use crate::limits::{CHECK_IN_LEAD_MS, MAX_CODE_ATTEMPTS, MAX_NOTES_LEN, MAX_REASON_LEN};
use crate::model::*;
use crate::payments::{PaymentEvent, RefundRequest};
use crate::store::{BookingFilter, BookingPatch, StoreError};

use super::availability::{evaluate, Availability, SlotRequest, Unavailability};
use super::pricing::quote;
use super::{Engine, EngineError};

#[derive(Debug, Clone)]
pub struct BookingRequest {
    pub slot: SlotRequest,
    pub customer_id: Ulid,
    pub promo_code: Option<String>,
    pub attendees: u32,
    pub notes: Option<String>,
}

/// Outcome of one sweep pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub no_shows: Vec<String>,
    pub expired_pending: Vec<String>,
    pub failures: usize,
}

const PAYMENT_WINDOW_ELAPSED: &str = "payment window elapsed";

fn booking_code(id: Ulid) -> String {
    let s = id.to_string();
    format!("BK-{}", &s[s.len() - 8..])
}

/// A confirmed booking may be checked in on `[start - 15m, start + grace]`,
/// both ends inclusive.
pub fn check_in_eligibility(booking: &Booking, grace: Ms, now: Ms) -> Result<(), EngineError> {
    if booking.status != BookingStatus::Confirmed {
        return Err(EngineError::InvalidTransition {
            from: booking.status,
            to: BookingStatus::CheckedIn,
        });
    }
    let opens_at = booking.span.start - CHECK_IN_LEAD_MS;
    let closed_at = booking.span.start + grace;
    if now < opens_at {
        return Err(EngineError::CheckInTooEarly { opens_at });
    }
    if now > closed_at {
        return Err(EngineError::CheckInWindowClosed { closed_at });
    }
    Ok(())
}

fn no_show_eligibility(booking: &Booking, grace: Ms, now: Ms) -> Result<(), EngineError> {
    if booking.status != BookingStatus::Confirmed {
        return Err(EngineError::InvalidTransition {
            from: booking.status,
            to: BookingStatus::NoShow,
        });
    }
    let closes_at = booking.span.start + grace;
    if now <= closes_at {
        return Err(EngineError::GraceWindowOpen { closes_at });
    }
    Ok(())
}

fn validate_request(request: &BookingRequest, space: &Space) -> Result<(), EngineError> {
    if request.attendees == 0 {
        return Err(EngineError::Validation("attendees must be at least 1".into()));
    }
    if request.attendees > space.capacity {
        return Err(EngineError::Validation(format!(
            "{} attendees exceed capacity {}",
            request.attendees, space.capacity
        )));
    }
    if request.notes.as_ref().is_some_and(|n| n.len() > MAX_NOTES_LEN) {
        return Err(EngineError::LimitExceeded("notes too long"));
    }
    Ok(())
}

impl Engine {
    /// Guarded update from `booking.status` through each state of `path`.
    /// The store sees one write carrying the final state; side effects run
    /// once per step.
    async fn transition(
        &self,
        booking: &Booking,
        path: &[BookingStatus],
        mut patch: BookingPatch,
    ) -> Result<Booking, EngineError> {
        let Some(&first) = path.first() else {
            return Ok(booking.clone());
        };
        let mut from = booking.status;
        for &to in path {
            if !from.can_transition_to(to) {
                return Err(EngineError::InvalidTransition { from, to });
            }
            from = to;
        }
        patch.status = Some(from);

        let updated = match self
            .store
            .update_booking(booking.id, &[booking.status], patch)
            .await
        {
            Ok(b) => b,
            Err(StoreError::StatusMismatch { current }) => {
                return Err(EngineError::InvalidTransition { from: current, to: first });
            }
            Err(e) => return Err(e.into()),
        };
        tracing::info!(
            "booking {} {} -> {}",
            updated.code,
            booking.status,
            updated.status
        );
        self.after_transition(&updated, Some(booking.status), path).await;
        Ok(updated)
    }

    /// Validate, price, redeem, insert. The new booking starts `pending`.
    ///
    /// A promo use is consumed only when the code actually discounts the
    /// quote, and is handed back if the insert loses the exclusion race.
    pub async fn create_booking(&self, request: BookingRequest) -> Result<Booking, EngineError> {
        let slot = &request.slot;
        let space = self.load_space(slot.space_id).await?;
        let span = slot.span()?;
        if span.duration_ms() > crate::limits::MAX_BOOKING_SPAN_MS {
            return Err(EngineError::LimitExceeded("booking span too wide"));
        }
        validate_request(&request, &space)?;

        let now = self.now();
        let existing = self
            .store
            .find_bookings(&BookingFilter::active_around(
                space.id,
                span,
                space.rules.buffer_ms(),
            ))
            .await?;
        match evaluate(&space, slot, span, now, &existing) {
            Availability::Eligible => {}
            Availability::Unavailable(Unavailability::Conflict { booking_code }) => {
                metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL).increment(1);
                return Err(EngineError::Conflict { booking_code });
            }
            Availability::Unavailable(reason) => return Err(EngineError::Unavailable(reason)),
        }

        let mut pricing = quote(&space.pricing, slot.date, span, None);
        let mut redeemed = None;
        if let Some(raw) = request.promo_code.as_deref() {
            let terms = self.lookup_promo(raw).await?;
            let trial = quote(&space.pricing, slot.date, span, Some(&terms));
            if trial.promo_code.is_some() {
                let terms = self.redeem_promo(raw).await?;
                pricing = quote(&space.pricing, slot.date, span, Some(&terms));
                redeemed = Some(terms.code);
            } else {
                tracing::debug!("promo {} below minimum order, not redeemed", terms.code);
            }
        }

        let mut booking = Booking {
            id: Ulid::new(),
            code: String::new(),
            space_id: space.id,
            customer_id: request.customer_id,
            date: slot.date,
            span,
            status: BookingStatus::Pending,
            pricing,
            payment_status: PaymentStatus::Pending,
            attendees: request.attendees,
            notes: request.notes.clone(),
            created_at: now,
            updated_at: now,
            checked_in_at: None,
            checked_in_by: None,
            checked_out_at: None,
            checked_out_by: None,
            cancellation: None,
        };

        let buffer = space.rules.buffer_ms();
        let mut inserted = false;
        for _ in 0..MAX_CODE_ATTEMPTS {
            booking.id = Ulid::new();
            booking.code = booking_code(booking.id);
            match self.store.insert_booking(booking.clone(), buffer).await {
                Ok(()) => {
                    inserted = true;
                    break;
                }
                Err(StoreError::DuplicateCode(code)) => {
                    tracing::debug!("booking code {code} taken, drawing another");
                }
                Err(e) => {
                    if let Some(code) = &redeemed {
                        self.release_promo(code).await;
                    }
                    if matches!(e, StoreError::Overlap { .. }) {
                        metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL).increment(1);
                    }
                    return Err(e.into());
                }
            }
        }
        if !inserted {
            if let Some(code) = &redeemed {
                self.release_promo(code).await;
            }
            return Err(EngineError::Storage("could not allocate a unique booking code".into()));
        }

        metrics::counter!(crate::observability::BOOKINGS_CREATED_TOTAL).increment(1);
        tracing::info!(
            "booking {} created on space {} ({} {})",
            booking.code,
            booking.space_id,
            booking.pricing.total_amount,
            booking.pricing.currency
        );
        self.after_transition(&booking, None, &[BookingStatus::Pending]).await;
        Ok(booking)
    }

    /// Callback from the payment collaborator.
    pub async fn apply_payment_event(
        &self,
        booking_id: Ulid,
        event: PaymentEvent,
    ) -> Result<Booking, EngineError> {
        let booking = self.load_booking(booking_id).await?;
        let now = self.now();
        match event {
            PaymentEvent::Paid => match booking.status {
                BookingStatus::Pending => {
                    let patch = BookingPatch {
                        payment_status: Some(PaymentStatus::Paid),
                        updated_at: now,
                        ..BookingPatch::default()
                    };
                    self.transition(&booking, &[BookingStatus::Confirmed], patch).await
                }
                BookingStatus::Confirmed if booking.payment_status == PaymentStatus::Paid => {
                    Ok(booking)
                }
                from => Err(EngineError::InvalidTransition {
                    from,
                    to: BookingStatus::Confirmed,
                }),
            },
            PaymentEvent::Failed => {
                let patch = BookingPatch {
                    payment_status: Some(PaymentStatus::Failed),
                    updated_at: now,
                    ..BookingPatch::default()
                };
                self.store
                    .update_booking(booking.id, &[BookingStatus::Pending], patch)
                    .await
                    .map_err(|e| match e {
                        StoreError::StatusMismatch { current } => EngineError::PaymentNotApplicable {
                            status: current,
                            payment: PaymentStatus::Failed,
                        },
                        other => other.into(),
                    })
            }
            PaymentEvent::Refunded => {
                let patch = BookingPatch {
                    payment_status: Some(PaymentStatus::Refunded),
                    updated_at: now,
                    ..BookingPatch::default()
                };
                Ok(self
                    .store
                    .update_booking(booking.id, &BookingStatus::ALL, patch)
                    .await?)
            }
        }
    }

    /// Staff check-in without a token.
    pub async fn check_in_booking(&self, booking_id: Ulid, staff_id: Ulid) -> Result<Booking, EngineError> {
        let booking = self.load_booking(booking_id).await?;
        let space = self.load_space(booking.space_id).await?;
        let now = self.now();
        check_in_eligibility(&booking, space.rules.grace_ms(), now)?;
        let patch = BookingPatch {
            checked_in: Some((now, staff_id)),
            updated_at: now,
            ..BookingPatch::default()
        };
        self.transition(&booking, &[BookingStatus::CheckedIn], patch).await
    }

    /// Records the check-out and completes the booking in one write.
    pub async fn check_out_booking(&self, booking_id: Ulid, staff_id: Ulid) -> Result<Booking, EngineError> {
        let booking = self.load_booking(booking_id).await?;
        if booking.status != BookingStatus::CheckedIn {
            return Err(EngineError::InvalidTransition {
                from: booking.status,
                to: BookingStatus::CheckedOut,
            });
        }
        let now = self.now();
        let patch = BookingPatch {
            checked_out: Some((now, staff_id)),
            updated_at: now,
            ..BookingPatch::default()
        };
        self.transition(
            &booking,
            &[BookingStatus::CheckedOut, BookingStatus::Completed],
            patch,
        )
        .await
    }

    /// Cancel a pending or confirmed booking. A redeemed promo use stays
    /// consumed. A cleared payment is handed to the collaborator for refund.
    pub async fn cancel(&self, booking_id: Ulid, reason: &str) -> Result<Booking, EngineError> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(EngineError::Validation("cancellation reason is empty".into()));
        }
        if reason.len() > MAX_REASON_LEN {
            return Err(EngineError::LimitExceeded("cancellation reason too long"));
        }
        let booking = self.load_booking(booking_id).await?;
        self.cancel_at(booking, reason, self.now()).await
    }

    async fn cancel_at(&self, booking: Booking, reason: &str, now: Ms) -> Result<Booking, EngineError> {
        let patch = BookingPatch {
            cancellation: Some(Cancellation {
                reason: reason.to_string(),
                at: now,
            }),
            updated_at: now,
            ..BookingPatch::default()
        };
        let cancelled = self
            .transition(&booking, &[BookingStatus::Cancelled], patch)
            .await?;

        if cancelled.payment_status == PaymentStatus::Paid {
            let policy = match self.store.find_space(cancelled.space_id).await {
                Ok(Some(space)) => space.cancellation_policy,
                _ => CancellationPolicy::default(),
            };
            let request = RefundRequest {
                booking_id: cancelled.id,
                booking_code: cancelled.code.clone(),
                customer_id: cancelled.customer_id,
                amount_paid: cancelled.pricing.total_amount,
                currency: cancelled.pricing.currency.clone(),
                policy,
                booking_start: cancelled.span.start,
                cancelled_at: now,
            };
            if let Err(e) = self.payments.request_refund(request).await {
                tracing::warn!("refund request for {} failed: {e}", cancelled.code);
            }
        }
        Ok(cancelled)
    }

    /// Mark a confirmed booking whose grace window has passed as a no-show.
    pub async fn mark_no_show(&self, booking_id: Ulid) -> Result<Booking, EngineError> {
        let booking = self.load_booking(booking_id).await?;
        let space = self.load_space(booking.space_id).await?;
        self.no_show_at(booking, space.rules.grace_ms(), self.now()).await
    }

    async fn no_show_at(&self, booking: Booking, grace: Ms, now: Ms) -> Result<Booking, EngineError> {
        no_show_eligibility(&booking, grace, now)?;
        let patch = BookingPatch {
            updated_at: now,
            ..BookingPatch::default()
        };
        self.transition(&booking, &[BookingStatus::NoShow], patch).await
    }

    /// One pass of the scheduled sweep as of `now`: confirmed bookings past
    /// their grace window become no-shows, and pending bookings older than
    /// the space's payment window are cancelled. Bookings another caller
    /// moved in the meantime are skipped.
    pub async fn sweep(&self, now: Ms) -> Result<SweepReport, EngineError> {
        let started = std::time::Instant::now();
        let mut report = SweepReport::default();
        let mut spaces: HashMap<Ulid, Option<Space>> = HashMap::new();

        let overdue = self
            .store
            .find_bookings(&BookingFilter {
                statuses: vec![BookingStatus::Confirmed],
                starts_before: Some(now),
                ..BookingFilter::default()
            })
            .await?;
        let pending = self
            .store
            .find_bookings(&BookingFilter {
                statuses: vec![BookingStatus::Pending],
                ..BookingFilter::default()
            })
            .await?;

        for booking in overdue {
            let Some(space) = self.cached_space(&mut spaces, booking.space_id).await else {
                continue;
            };
            if now <= booking.span.start + space.rules.grace_ms() {
                continue;
            }
            let code = booking.code.clone();
            match self.no_show_at(booking, space.rules.grace_ms(), now).await {
                Ok(_) => report.no_shows.push(code),
                Err(EngineError::InvalidTransition { .. }) => {
                    tracing::debug!("sweep skip {code}: already moved");
                }
                Err(e) => {
                    tracing::warn!("sweep: no-show for {code} failed: {e}");
                    report.failures += 1;
                }
            }
        }

        for booking in pending {
            let Some(space) = self.cached_space(&mut spaces, booking.space_id).await else {
                continue;
            };
            let Some(window) = space.rules.payment_window_minutes else {
                continue;
            };
            if now <= booking.created_at + Ms::from(window) * MINUTE_MS {
                continue;
            }
            let code = booking.code.clone();
            match self.cancel_at(booking, PAYMENT_WINDOW_ELAPSED, now).await {
                Ok(_) => report.expired_pending.push(code),
                Err(EngineError::InvalidTransition { .. }) => {
                    tracing::debug!("sweep skip {code}: already moved");
                }
                Err(e) => {
                    tracing::warn!("sweep: expiring {code} failed: {e}");
                    report.failures += 1;
                }
            }
        }

        metrics::histogram!(crate::observability::SWEEP_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        if !report.no_shows.is_empty() || !report.expired_pending.is_empty() {
            tracing::info!(
                "sweep: {} no-shows, {} expired pending",
                report.no_shows.len(),
                report.expired_pending.len()
            );
        }
        Ok(report)
    }

    async fn cached_space(&self, cache: &mut HashMap<Ulid, Option<Space>>, id: Ulid) -> Option<Space> {
        if let Some(entry) = cache.get(&id) {
            return entry.clone();
        }
        let space = match self.store.find_space(id).await {
            Ok(space) => space,
            Err(e) => {
                tracing::warn!("sweep: loading space {id} failed: {e}");
                None
            }
        };
        cache.insert(id, space.clone());
        space
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    const M: Ms = MINUTE_MS;
    const START: Ms = 1_000 * HOUR_MS;

    fn booking(status: BookingStatus) -> Booking {
        Booking {
            id: Ulid::new(),
            code: "BK-00000001".into(),
            space_id: Ulid::new(),
            customer_id: Ulid::new(),
            date: chrono::NaiveDate::from_ymd_opt(2026, 10, 19).unwrap(),
            span: Span::new(START, START + 2 * HOUR_MS),
            status,
            pricing: PriceBreakdown {
                currency: "USD".into(),
                segments: vec![],
                applied_rate: None,
                base_amount: Decimal::ZERO,
                discounts: vec![],
                discount_amount: Decimal::ZERO,
                tax_amount: Decimal::ZERO,
                setup_fee: Decimal::ZERO,
                security_deposit: Decimal::ZERO,
                total_amount: Decimal::ZERO,
                promo_code: None,
            },
            payment_status: PaymentStatus::Pending,
            attendees: 1,
            notes: None,
            created_at: 0,
            updated_at: 0,
            checked_in_at: None,
            checked_in_by: None,
            checked_out_at: None,
            checked_out_by: None,
            cancellation: None,
        }
    }

    #[test]
    fn codes_are_prefixed_and_short() {
        let code = booking_code(Ulid::new());
        assert!(code.starts_with("BK-"));
        assert_eq!(code.len(), 11);
    }

    #[test]
    fn check_in_window_is_inclusive() {
        let b = booking(BookingStatus::Confirmed);
        let grace = 30 * M;
        assert!(check_in_eligibility(&b, grace, START - 15 * M).is_ok());
        assert!(check_in_eligibility(&b, grace, START + 30 * M).is_ok());
        assert!(matches!(
            check_in_eligibility(&b, grace, START - 15 * M - 1_000),
            Err(EngineError::CheckInTooEarly { .. })
        ));
        assert!(matches!(
            check_in_eligibility(&b, grace, START + 30 * M + 1_000),
            Err(EngineError::CheckInWindowClosed { .. })
        ));
    }

    #[test]
    fn check_in_requires_confirmed() {
        let b = booking(BookingStatus::Pending);
        assert!(matches!(
            check_in_eligibility(&b, 30 * M, START),
            Err(EngineError::InvalidTransition {
                from: BookingStatus::Pending,
                to: BookingStatus::CheckedIn
            })
        ));
    }

    #[test]
    fn no_show_only_after_grace() {
        let b = booking(BookingStatus::Confirmed);
        assert!(matches!(
            no_show_eligibility(&b, 30 * M, START + 30 * M),
            Err(EngineError::GraceWindowOpen { .. })
        ));
        assert!(no_show_eligibility(&b, 30 * M, START + 30 * M + 1).is_ok());
        let b = booking(BookingStatus::CheckedIn);
        assert!(no_show_eligibility(&b, 30 * M, START + HOUR_MS).is_err());
    }
}
