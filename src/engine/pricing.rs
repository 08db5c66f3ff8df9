//! Quote computation.
//!
//! Amounts are carried at full `Decimal` precision through every step and
//! rounded half-up to cents once, when the breakdown is assembled.

use chrono::NaiveDate;
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;

use crate::model::*;
use crate::window;

use super::availability::SlotRequest;
use super::promo::PromoTerms;
use super::{Engine, EngineError};

fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

fn hours_in(span: &Span) -> Decimal {
    Decimal::from(span.duration_ms()) / Decimal::from(HOUR_MS)
}

/// Unit rate before multipliers, and the special event that set it, if any.
fn unit_rate(pricing: &PricingConfig, date: NaiveDate) -> (Decimal, Option<&str>) {
    match pricing.special_events.iter().find(|e| e.date == date) {
        Some(event) => (event.rate, Some(event.name.as_str())),
        None => (pricing.base_price, None),
    }
}

fn weekend_factor(pricing: &PricingConfig, date: NaiveDate) -> Decimal {
    match pricing.weekend_multiplier {
        Some(m) if window::is_weekend(date) => m,
        _ => Decimal::ONE,
    }
}

/// Split at peak boundaries and rate each piece: peak multiplier first, then
/// weekend, on top of the unit rate.
fn rate_hourly(pricing: &PricingConfig, date: NaiveDate, span: Span, rate: Decimal) -> Vec<RatedSegment> {
    let weekend = weekend_factor(pricing, date);
    let peak_spans = pricing
        .peak_hours
        .as_ref()
        .map(|p| window::daily_window(date, p.start, p.end))
        .unwrap_or_default();
    let cuts: Vec<Ms> = peak_spans.iter().flat_map(|p| [p.start, p.end]).collect();

    window::split_at(span, &cuts)
        .into_iter()
        .map(|piece| {
            let in_peak = peak_spans.iter().any(|p| p.contains_span(&piece));
            let mut unit = rate;
            if let (true, Some(peak)) = (in_peak, pricing.peak_hours.as_ref()) {
                unit *= peak.multiplier;
            }
            unit *= weekend;
            RatedSegment {
                span: piece,
                unit_rate: unit,
                amount: unit * hours_in(&piece),
            }
        })
        .collect()
}

fn rate_daily(pricing: &PricingConfig, date: NaiveDate, span: Span, rate: Decimal) -> RatedSegment {
    let days = ((span.duration_ms() + DAY_MS - 1) / DAY_MS).max(1);
    let unit = rate * weekend_factor(pricing, date);
    RatedSegment {
        span,
        unit_rate: unit,
        amount: unit * Decimal::from(days),
    }
}

fn discount_for(terms: &PromoTerms, base_amount: Decimal) -> Option<Decimal> {
    if terms.min_order_amount.is_some_and(|min| base_amount < min) {
        return None;
    }
    let amount = match terms.discount_type {
        DiscountType::Percentage => {
            let raw = base_amount * terms.value / dec!(100);
            match terms.max_discount_amount {
                Some(cap) => raw.min(cap),
                None => raw,
            }
        }
        DiscountType::Fixed => terms.value.min(base_amount),
    };
    Some(amount.max(Decimal::ZERO))
}

/// Price `span` on `date` under `pricing`. Pure: identical inputs always
/// produce identical breakdowns. A promo below its minimum order is dropped
/// and the quote proceeds undiscounted (`promo_code` stays `None`).
pub fn quote(
    pricing: &PricingConfig,
    date: NaiveDate,
    span: Span,
    promo: Option<&PromoTerms>,
) -> PriceBreakdown {
    let (rate, event_name) = unit_rate(pricing, date);
    let mut applied_rate = event_name.map(str::to_string);

    let segments = match pricing.rate_unit {
        RateUnit::Hourly => rate_hourly(pricing, date, span, rate),
        RateUnit::Daily => vec![rate_daily(pricing, date, span, rate)],
        RateUnit::MonthlyPass => {
            let price = pricing.monthly_pass.as_ref().map_or(rate, |p| p.price);
            vec![RatedSegment {
                span,
                unit_rate: price,
                amount: price,
            }]
        }
        RateUnit::TimeBlock => {
            let minutes = span.duration_minutes();
            let exact = span.duration_ms() % MINUTE_MS == 0;
            match pricing
                .time_blocks
                .iter()
                .find(|b| exact && i64::from(b.duration_minutes) == minutes)
            {
                Some(block) => {
                    applied_rate = Some(block.name.clone());
                    vec![RatedSegment {
                        span,
                        unit_rate: block.price,
                        amount: block.price,
                    }]
                }
                None => rate_hourly(pricing, date, span, rate),
            }
        }
    };
    let base_amount: Decimal = segments.iter().map(|s| s.amount).sum();

    let mut discounts = Vec::new();
    let mut promo_code = None;
    let mut discount = Decimal::ZERO;
    if let Some(terms) = promo
        && let Some(amount) = discount_for(terms, base_amount)
    {
        discounts.push(DiscountLine {
            code: terms.code.clone(),
            kind: terms.discount_type,
            amount: round_money(amount),
        });
        promo_code = Some(terms.code.clone());
        discount = amount;
    }

    let taxable = base_amount - discount;
    let tax = taxable * pricing.tax_percent / dec!(100);
    let total = round_money(taxable + tax + pricing.setup_fee);

    let base_amount = round_money(base_amount);
    let discount_amount = round_money(discount);
    let setup_fee = round_money(pricing.setup_fee);
    // Tax is the residual so the disclosed lines reconcile with the total.
    let tax_amount = (total - (base_amount - discount_amount) - setup_fee).max(Decimal::ZERO);

    PriceBreakdown {
        currency: pricing.currency.clone(),
        segments,
        applied_rate,
        base_amount,
        discounts,
        discount_amount,
        tax_amount,
        setup_fee,
        security_deposit: round_money(pricing.security_deposit),
        total_amount: total,
        promo_code,
    }
}

impl Engine {
    /// Quote without side effects: a supplied promo code is validated but
    /// not consumed.
    pub async fn price_quote(
        &self,
        request: &SlotRequest,
        promo_code: Option<&str>,
    ) -> Result<PriceBreakdown, EngineError> {
        let space = self.load_space(request.space_id).await?;
        let span = request.span()?;
        if span.duration_ms() > crate::limits::MAX_BOOKING_SPAN_MS {
            return Err(EngineError::LimitExceeded("booking span too wide"));
        }
        let terms = match promo_code {
            Some(code) => Some(self.lookup_promo(code).await?),
            None => None,
        };
        Ok(quote(&space.pricing, request.date, span, terms.as_ref()))
    }
}
