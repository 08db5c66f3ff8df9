use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::model::{Ms, DAY_MS, HOUR_MS};

/// Longest single booking the engine will price or store.
pub const MAX_BOOKING_SPAN_MS: Ms = 31 * DAY_MS;

/// How far ahead of the start a staff member may check a customer in.
pub const CHECK_IN_LEAD_MS: Ms = 15 * 60_000;

pub const DEFAULT_TOKEN_TTL_MS: Ms = 24 * HOUR_MS;
/// Upper bound for a configured token lifetime.
pub const MAX_TOKEN_TTL_MS: Ms = 366 * DAY_MS;

/// Ceiling for any configured price, fee or rate. Together with
/// `MAX_MULTIPLIER` and `MAX_BOOKING_SPAN_MS` it keeps quote arithmetic far
/// from `Decimal` overflow.
pub const MAX_AMOUNT: Decimal = dec!(1000000000);
pub const MAX_MULTIPLIER: Decimal = dec!(100);

pub const MAX_PROMO_CODE_LEN: usize = 32;
pub const MAX_REASON_LEN: usize = 500;
pub const MAX_NOTES_LEN: usize = 2_000;
pub const MAX_TOKEN_LEN: usize = 4_096;

/// Attempts at drawing an unused booking code before giving up.
pub const MAX_CODE_ATTEMPTS: usize = 3;

pub const MAX_SUGGESTIONS: usize = 16;
