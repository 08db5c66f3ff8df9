use chrono::{NaiveDate, NaiveTime, Weekday};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only instant type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 60 * MINUTE_MS;
pub const DAY_MS: Ms = 24 * HOUR_MS;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn duration_minutes(&self) -> i64 {
        self.duration_ms() / MINUTE_MS
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Widen by `by` on both sides (buffer padding).
    pub fn expand(&self, by: Ms) -> Span {
        Span::new(self.start - by, self.end + by)
    }
}

// ── Spaces ───────────────────────────────────────────────────────

/// Opening hours for one day of the week.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayHours {
    pub open: NaiveTime,
    pub close: NaiveTime,
    pub closed: bool,
}

impl DayHours {
    pub fn open(open: NaiveTime, close: NaiveTime) -> Self {
        Self { open, close, closed: false }
    }

    pub fn closed() -> Self {
        Self {
            open: NaiveTime::MIN,
            close: NaiveTime::MIN,
            closed: true,
        }
    }
}

/// Operating-hours table indexed Monday..Sunday.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeeklyHours {
    days: [DayHours; 7],
}

impl WeeklyHours {
    pub fn every_day(open: NaiveTime, close: NaiveTime) -> Self {
        Self {
            days: [DayHours::open(open, close); 7],
        }
    }

    pub fn for_day(&self, day: Weekday) -> &DayHours {
        &self.days[day.num_days_from_monday() as usize]
    }

    pub fn set(&mut self, day: Weekday, hours: DayHours) {
        self.days[day.num_days_from_monday() as usize] = hours;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RateUnit {
    Hourly,
    Daily,
    TimeBlock,
    MonthlyPass,
}

/// Window of the day during which `multiplier` applies. `end <= start`
/// means the window runs past midnight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeakHours {
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub multiplier: Decimal,
}

/// Fixed-duration package sold at a flat price.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeBlock {
    pub name: String,
    pub duration_minutes: u32,
    pub price: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonthlyPass {
    pub price: Decimal,
    pub valid_days: u32,
}

/// Dated override that replaces the unit rate for bookings on `date`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecialEventRate {
    pub date: NaiveDate,
    pub name: String,
    pub rate: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricingConfig {
    pub base_price: Decimal,
    pub rate_unit: RateUnit,
    pub currency: String,
    pub peak_hours: Option<PeakHours>,
    pub weekend_multiplier: Option<Decimal>,
    pub time_blocks: Vec<TimeBlock>,
    pub monthly_pass: Option<MonthlyPass>,
    pub special_events: Vec<SpecialEventRate>,
    pub setup_fee: Decimal,
    pub security_deposit: Decimal,
    /// Percentage applied to the discounted base amount.
    pub tax_percent: Decimal,
}

impl PricingConfig {
    pub fn hourly(base_price: Decimal, currency: &str) -> Self {
        Self {
            base_price,
            rate_unit: RateUnit::Hourly,
            currency: currency.to_string(),
            peak_hours: None,
            weekend_multiplier: None,
            time_blocks: Vec::new(),
            monthly_pass: None,
            special_events: Vec::new(),
            setup_fee: Decimal::ZERO,
            security_deposit: Decimal::ZERO,
            tax_percent: Decimal::ZERO,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingRules {
    pub min_advance_minutes: u32,
    pub min_duration_minutes: u32,
    pub max_duration_minutes: Option<u32>,
    /// Padding on both sides of every booking.
    pub buffer_minutes: u32,
    pub check_in_grace_minutes: u32,
    /// Unpaid pending bookings older than this are cancelled by the sweep.
    pub payment_window_minutes: Option<u32>,
}

impl Default for BookingRules {
    fn default() -> Self {
        Self {
            min_advance_minutes: 0,
            min_duration_minutes: 30,
            max_duration_minutes: None,
            buffer_minutes: 0,
            check_in_grace_minutes: 30,
            payment_window_minutes: None,
        }
    }
}

impl BookingRules {
    pub fn buffer_ms(&self) -> Ms {
        Ms::from(self.buffer_minutes) * MINUTE_MS
    }

    pub fn grace_ms(&self) -> Ms {
        Ms::from(self.check_in_grace_minutes) * MINUTE_MS
    }
}

/// Carried on the space and handed to the payment collaborator on cancel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancellationPolicy {
    pub full_refund_hours_before: u32,
    pub partial_refund_hours_before: u32,
    pub partial_refund_percent: Decimal,
}

impl Default for CancellationPolicy {
    fn default() -> Self {
        Self {
            full_refund_hours_before: 24,
            partial_refund_hours_before: 0,
            partial_refund_percent: Decimal::ZERO,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceStats {
    pub active_check_ins: u32,
    pub completed: u64,
    pub no_shows: u64,
    pub cancellations: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Space {
    pub id: Ulid,
    pub owner_id: Ulid,
    pub name: String,
    pub category: String,
    pub capacity: u32,
    pub hours: WeeklyHours,
    pub blackout_dates: Vec<NaiveDate>,
    pub pricing: PricingConfig,
    pub rules: BookingRules,
    pub cancellation_policy: CancellationPolicy,
    pub stats: SpaceStats,
}

// ── Bookings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Confirmed,
    CheckedIn,
    CheckedOut,
    Completed,
    Cancelled,
    NoShow,
}

impl BookingStatus {
    /// Statuses that hold the space's calendar.
    pub const ACTIVE: [BookingStatus; 3] = [
        BookingStatus::Pending,
        BookingStatus::Confirmed,
        BookingStatus::CheckedIn,
    ];

    pub const ALL: [BookingStatus; 7] = [
        BookingStatus::Pending,
        BookingStatus::Confirmed,
        BookingStatus::CheckedIn,
        BookingStatus::CheckedOut,
        BookingStatus::Completed,
        BookingStatus::Cancelled,
        BookingStatus::NoShow,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::CheckedIn => "checked_in",
            BookingStatus::CheckedOut => "checked_out",
            BookingStatus::Completed => "completed",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::NoShow => "no_show",
        }
    }

    pub fn is_active(&self) -> bool {
        Self::ACTIVE.contains(self)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BookingStatus::Completed | BookingStatus::Cancelled | BookingStatus::NoShow
        )
    }

    pub fn can_transition_to(&self, next: BookingStatus) -> bool {
        use BookingStatus::*;
        matches!(
            (self, next),
            (Pending, Confirmed)
                | (Pending, Cancelled)
                | (Confirmed, CheckedIn)
                | (Confirmed, Cancelled)
                | (Confirmed, NoShow)
                | (CheckedIn, CheckedOut)
                | (CheckedOut, Completed)
        )
    }
}

impl std::fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentStatus {
    Pending,
    Paid,
    Failed,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Paid => "paid",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Refunded => "refunded",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiscountType {
    Percentage,
    Fixed,
}

/// One priced sub-interval of a booking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatedSegment {
    pub span: Span,
    pub unit_rate: Decimal,
    pub amount: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscountLine {
    pub code: String,
    pub kind: DiscountType,
    pub amount: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceBreakdown {
    pub currency: String,
    pub segments: Vec<RatedSegment>,
    /// Name of the time-block package or special event that set the price.
    pub applied_rate: Option<String>,
    pub base_amount: Decimal,
    pub discounts: Vec<DiscountLine>,
    pub discount_amount: Decimal,
    /// Whatever the rounded total leaves after base, discount and setup fee,
    /// so the disclosed lines add up to `total_amount`. May differ by a cent
    /// from the tax rounded on its own.
    pub tax_amount: Decimal,
    pub setup_fee: Decimal,
    /// Refundable; disclosed but not part of `total_amount`.
    pub security_deposit: Decimal,
    pub total_amount: Decimal,
    pub promo_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cancellation {
    pub reason: String,
    pub at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    /// Unique human-readable code, opaque to the engine.
    pub code: String,
    pub space_id: Ulid,
    pub customer_id: Ulid,
    pub date: NaiveDate,
    pub span: Span,
    pub status: BookingStatus,
    pub pricing: PriceBreakdown,
    pub payment_status: PaymentStatus,
    pub attendees: u32,
    pub notes: Option<String>,
    pub created_at: Ms,
    pub updated_at: Ms,
    pub checked_in_at: Option<Ms>,
    pub checked_in_by: Option<Ulid>,
    pub checked_out_at: Option<Ms>,
    pub checked_out_by: Option<Ulid>,
    pub cancellation: Option<Cancellation>,
}

// ── Promo codes ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromoCode {
    /// Always stored upper-case; see [`PromoCode::normalize`].
    pub code: String,
    pub discount_type: DiscountType,
    pub value: Decimal,
    pub min_order_amount: Option<Decimal>,
    pub max_discount_amount: Option<Decimal>,
    pub valid_from: Ms,
    pub valid_until: Ms,
    pub usage_limit: Option<u32>,
    pub used_count: u32,
    pub is_active: bool,
}

impl PromoCode {
    pub fn normalize(raw: &str) -> String {
        raw.trim().to_uppercase()
    }

    pub fn has_uses_left(&self) -> bool {
        self.usage_limit.is_none_or(|limit| self.used_count < limit)
    }

    pub fn is_valid_at(&self, now: Ms) -> bool {
        self.valid_from <= now && now <= self.valid_until
    }
}

// ── Log records ──────────────────────────────────────────────────

/// The event types, flat with no nesting. This is the WAL record format.
/// Booking records are written whole so replay is a plain upsert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    SpaceUpserted(Space),
    SpaceStatsUpdated { space_id: Ulid, stats: SpaceStats },
    PromoUpserted(PromoCode),
    PromoUsageChanged { code: String, used_count: u32 },
    BookingInserted(Booking),
    BookingUpdated(Booking),
}

/// Lifecycle notification published after every committed transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingEvent {
    pub booking_id: Ulid,
    pub booking_code: String,
    pub space_id: Ulid,
    pub customer_id: Ulid,
    pub from: Option<BookingStatus>,
    pub to: BookingStatus,
    pub at: Ms,
}
