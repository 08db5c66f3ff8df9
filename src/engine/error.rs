use ulid::Ulid;

use crate::model::{BookingStatus, Ms, PaymentStatus};
use crate::store::StoreError;

use super::availability::Unavailability;

/// Coarse classification for callers mapping errors to status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Conflict,
    Eligibility,
    NotFound,
    Signature,
    ExpiredToken,
    Storage,
}

#[derive(Debug)]
pub enum EngineError {
    Validation(String),
    LimitExceeded(&'static str),
    Unavailable(Unavailability),
    Conflict { booking_code: String },
    PromoExhausted(String),
    PromoNotRedeemable { code: String, reason: &'static str },
    InvalidTransition { from: BookingStatus, to: BookingStatus },
    CheckInTooEarly { opens_at: Ms },
    CheckInWindowClosed { closed_at: Ms },
    GraceWindowOpen { closes_at: Ms },
    PaymentNotApplicable { status: BookingStatus, payment: PaymentStatus },
    TokenNotIssuable(BookingStatus),
    TokenRevoked(String),
    SpaceNotFound(Ulid),
    BookingNotFound(String),
    PromoNotFound(String),
    MalformedToken,
    InvalidSignature,
    ExpiredToken { expired_at: Ms },
    Storage(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Validation(_)
            | EngineError::LimitExceeded(_)
            | EngineError::Unavailable(_)
            | EngineError::PromoNotRedeemable { .. } => ErrorKind::Validation,
            EngineError::Conflict { .. } | EngineError::PromoExhausted(_) => ErrorKind::Conflict,
            EngineError::InvalidTransition { .. }
            | EngineError::CheckInTooEarly { .. }
            | EngineError::CheckInWindowClosed { .. }
            | EngineError::GraceWindowOpen { .. }
            | EngineError::PaymentNotApplicable { .. }
            | EngineError::TokenNotIssuable(_)
            | EngineError::TokenRevoked(_) => ErrorKind::Eligibility,
            EngineError::SpaceNotFound(_)
            | EngineError::BookingNotFound(_)
            | EngineError::PromoNotFound(_) => ErrorKind::NotFound,
            EngineError::MalformedToken | EngineError::InvalidSignature => ErrorKind::Signature,
            EngineError::ExpiredToken { .. } => ErrorKind::ExpiredToken,
            EngineError::Storage(_) => ErrorKind::Storage,
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(msg) => write!(f, "invalid request: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Unavailable(reason) => write!(f, "unavailable: {reason}"),
            EngineError::Conflict { booking_code } => {
                write!(f, "conflicts with booking {booking_code}")
            }
            EngineError::PromoExhausted(code) => write!(f, "promo code {code} is exhausted"),
            EngineError::PromoNotRedeemable { code, reason } => {
                write!(f, "promo code {code} cannot be redeemed: {reason}")
            }
            EngineError::InvalidTransition { from, to } => {
                write!(f, "invalid transition from {from} to {to}")
            }
            EngineError::CheckInTooEarly { opens_at } => {
                write!(f, "too early to check in; window opens at {opens_at}")
            }
            EngineError::CheckInWindowClosed { closed_at } => {
                write!(f, "check-in grace window closed at {closed_at}")
            }
            EngineError::GraceWindowOpen { closes_at } => {
                write!(f, "grace window still open until {closes_at}")
            }
            EngineError::PaymentNotApplicable { status, payment } => {
                write!(f, "cannot record payment {} on a {status} booking", payment.as_str())
            }
            EngineError::TokenNotIssuable(status) => {
                write!(f, "no check-in token for a {status} booking")
            }
            EngineError::TokenRevoked(code) => write!(f, "booking {code} was cancelled"),
            EngineError::SpaceNotFound(id) => write!(f, "space not found: {id}"),
            EngineError::BookingNotFound(key) => write!(f, "booking not found: {key}"),
            EngineError::PromoNotFound(code) => write!(f, "promo code not found: {code}"),
            EngineError::MalformedToken => write!(f, "malformed token"),
            EngineError::InvalidSignature => write!(f, "token signature mismatch"),
            EngineError::ExpiredToken { expired_at } => write!(f, "token expired at {expired_at}"),
            EngineError::Storage(e) => write!(f, "storage error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => EngineError::BookingNotFound(id.to_string()),
            StoreError::SpaceNotFound(id) => EngineError::SpaceNotFound(id),
            StoreError::PromoNotFound(code) => EngineError::PromoNotFound(code),
            StoreError::Overlap { booking_code } => EngineError::Conflict { booking_code },
            StoreError::UsageLimitReached(code) => EngineError::PromoExhausted(code),
            StoreError::PromoInactive(code) => EngineError::PromoNotRedeemable {
                code,
                reason: "inactive or outside its validity window",
            },
            other @ (StoreError::DuplicateCode(_)
            | StoreError::StatusMismatch { .. }
            | StoreError::Io(_)) => EngineError::Storage(other.to_string()),
        }
    }
}
