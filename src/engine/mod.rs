mod availability;
mod error;
mod lifecycle;
mod pricing;
mod promo;
mod tokens;
#[cfg(test)]
mod tests;

pub use availability::{
    evaluate, free_windows, merge_overlapping, subtract_intervals, Availability, SlotRequest,
    Unavailability,
};
pub use error::{EngineError, ErrorKind};
pub use lifecycle::{check_in_eligibility, BookingRequest, SweepReport};
pub use pricing::quote;
pub use promo::PromoTerms;
pub use tokens::{TokenCheck, TokenClaims, TokenSigner};

use std::sync::Arc;

use chrono::Weekday;
use rust_decimal::Decimal;
use ulid::Ulid;

use crate::clock::Clock;
use crate::limits::{MAX_AMOUNT, MAX_MULTIPLIER};
use crate::model::*;
use crate::notify::NotifyHub;
use crate::payments::{LogOnlyPayments, PaymentCollaborator};
use crate::store::{BookingFilter, RecordStore, SpaceActivity};

/// The booking core. Holds no mutable state of its own: every decision reads
/// the record store and the injected clock, and every write is a single
/// guarded store operation.
pub struct Engine {
    pub(crate) store: Arc<dyn RecordStore>,
    clock: Arc<dyn Clock>,
    tokens: TokenSigner,
    payments: Arc<dyn PaymentCollaborator>,
    pub notify: Arc<NotifyHub>,
}

impl Engine {
    pub fn new(store: Arc<dyn RecordStore>, clock: Arc<dyn Clock>, tokens: TokenSigner) -> Self {
        Self {
            store,
            clock,
            tokens,
            payments: Arc::new(LogOnlyPayments),
            notify: Arc::new(NotifyHub::new()),
        }
    }

    pub fn with_payments(mut self, payments: Arc<dyn PaymentCollaborator>) -> Self {
        self.payments = payments;
        self
    }

    pub fn with_notify(mut self, notify: Arc<NotifyHub>) -> Self {
        self.notify = notify;
        self
    }

    pub fn now(&self) -> Ms {
        self.clock.now_ms()
    }

    // ── Spaces ───────────────────────────────────────────────

    /// Create or replace a space. Usage statistics are kept across edits.
    pub async fn upsert_space(&self, space: Space) -> Result<(), EngineError> {
        validate_space(&space)?;
        self.store.upsert_space(space).await?;
        Ok(())
    }

    pub async fn find_space(&self, id: Ulid) -> Result<Option<Space>, EngineError> {
        Ok(self.store.find_space(id).await?)
    }

    pub(crate) async fn load_space(&self, id: Ulid) -> Result<Space, EngineError> {
        self.store
            .find_space(id)
            .await?
            .ok_or(EngineError::SpaceNotFound(id))
    }

    // ── Bookings ─────────────────────────────────────────────

    pub async fn find_booking(&self, id: Ulid) -> Result<Option<Booking>, EngineError> {
        Ok(self.store.find_booking(id).await?)
    }

    pub async fn find_booking_by_code(&self, code: &str) -> Result<Option<Booking>, EngineError> {
        Ok(self.store.find_booking_by_code(code).await?)
    }

    pub async fn list_bookings(&self, filter: &BookingFilter) -> Result<Vec<Booking>, EngineError> {
        Ok(self.store.find_bookings(filter).await?)
    }

    pub(crate) async fn load_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.store
            .find_booking(id)
            .await?
            .ok_or_else(|| EngineError::BookingNotFound(id.to_string()))
    }

    /// Side effects of a committed transition, run in order for each step of
    /// `path`: publish the event, count it, bump the space's counters.
    pub(crate) async fn after_transition(
        &self,
        booking: &Booking,
        from: Option<BookingStatus>,
        path: &[BookingStatus],
    ) {
        let mut prev = from;
        for &to in path {
            self.notify.send(&BookingEvent {
                booking_id: booking.id,
                booking_code: booking.code.clone(),
                space_id: booking.space_id,
                customer_id: booking.customer_id,
                from: prev,
                to,
                at: booking.updated_at,
            });
            metrics::counter!(crate::observability::BOOKING_TRANSITIONS_TOTAL, "to" => to.as_str())
                .increment(1);

            let activity = match to {
                BookingStatus::CheckedIn => Some(SpaceActivity::CheckedIn),
                BookingStatus::CheckedOut => Some(SpaceActivity::CheckedOut),
                BookingStatus::NoShow => Some(SpaceActivity::NoShow),
                BookingStatus::Cancelled => Some(SpaceActivity::Cancelled),
                _ => None,
            };
            if let Some(activity) = activity
                && let Err(e) = self.store.record_space_activity(booking.space_id, activity).await
            {
                tracing::warn!("stats update for space {} failed: {e}", booking.space_id);
            }
            prev = Some(to);
        }
    }
}

fn validate_space(space: &Space) -> Result<(), EngineError> {
    if space.name.trim().is_empty() {
        return Err(EngineError::Validation("space name is empty".into()));
    }
    if space.capacity == 0 {
        return Err(EngineError::Validation("capacity must be at least 1".into()));
    }
    let mut weekday = Weekday::Mon;
    for _ in 0..7 {
        let day = space.hours.for_day(weekday);
        if !day.closed && day.open >= day.close {
            return Err(EngineError::Validation(format!(
                "{weekday}: opening {} is not before closing {}",
                day.open, day.close
            )));
        }
        weekday = weekday.succ();
    }
    validate_pricing(&space.pricing)?;
    if let Some(max) = space.rules.max_duration_minutes
        && max < space.rules.min_duration_minutes
    {
        return Err(EngineError::Validation(
            "max duration below min duration".into(),
        ));
    }
    Ok(())
}

fn validate_pricing(pricing: &PricingConfig) -> Result<(), EngineError> {
    check_amount("base price", pricing.base_price, MAX_AMOUNT)?;
    check_amount("setup fee", pricing.setup_fee, MAX_AMOUNT)?;
    check_amount("security deposit", pricing.security_deposit, MAX_AMOUNT)?;
    check_amount("tax percent", pricing.tax_percent, Decimal::ONE_HUNDRED)?;
    if let Some(m) = pricing.weekend_multiplier {
        check_amount("weekend multiplier", m, MAX_MULTIPLIER)?;
    }
    if let Some(peak) = &pricing.peak_hours {
        check_amount("peak multiplier", peak.multiplier, MAX_MULTIPLIER)?;
    }
    for block in &pricing.time_blocks {
        check_amount("time block price", block.price, MAX_AMOUNT)?;
    }
    for event in &pricing.special_events {
        check_amount("special event rate", event.rate, MAX_AMOUNT)?;
    }
    if let Some(pass) = &pricing.monthly_pass {
        check_amount("monthly pass price", pass.price, MAX_AMOUNT)?;
    }
    Ok(())
}

/// `amount` must lie in `[0, max]`.
pub(crate) fn check_amount(what: &str, amount: Decimal, max: Decimal) -> Result<(), EngineError> {
    if amount < Decimal::ZERO || amount > max {
        return Err(EngineError::Validation(format!(
            "{what} must be between 0 and {max}, got {amount}"
        )));
    }
    Ok(())
}
