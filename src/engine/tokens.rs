//! Signed check-in tokens.
//!
//! A token is `base64url(json({claims, signature}))` where the signature is
//! HMAC-SHA256 over the JSON encoding of `claims`. Validation recomputes the
//! MAC over the decoded claims and compares in constant time before looking
//! at anything else.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use ulid::Ulid;

use crate::limits::MAX_TOKEN_LEN;
use crate::model::*;

use super::lifecycle::check_in_eligibility;
use super::{Engine, EngineError};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    pub booking_code: String,
    pub space_id: Ulid,
    pub customer_id: Ulid,
    pub issued_at: Ms,
    pub expires_at: Ms,
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    claims: TokenClaims,
    signature: String,
}

/// Holds the server secret. Cheap to share behind the engine.
pub struct TokenSigner {
    key: Vec<u8>,
    ttl: Ms,
}

impl TokenSigner {
    pub fn new(secret: impl AsRef<[u8]>, ttl: Ms) -> Self {
        Self {
            key: secret.as_ref().to_vec(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Ms {
        self.ttl
    }

    fn mac(&self, claims: &TokenClaims) -> Result<HmacSha256, EngineError> {
        let payload =
            serde_json::to_vec(claims).map_err(|e| EngineError::Storage(e.to_string()))?;
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|_| EngineError::Validation("unusable token secret".into()))?;
        mac.update(&payload);
        Ok(mac)
    }

    pub fn sign(&self, claims: TokenClaims) -> Result<String, EngineError> {
        let tag = self.mac(&claims)?.finalize().into_bytes();
        let envelope = Envelope {
            claims,
            signature: URL_SAFE_NO_PAD.encode(tag),
        };
        let json =
            serde_json::to_vec(&envelope).map_err(|e| EngineError::Storage(e.to_string()))?;
        Ok(URL_SAFE_NO_PAD.encode(json))
    }

    /// Decode and authenticate. Expiry is strict: a token is still good at
    /// exactly `expires_at`.
    pub fn verify(&self, token: &str, now: Ms) -> Result<TokenClaims, EngineError> {
        if token.len() > MAX_TOKEN_LEN {
            return Err(EngineError::MalformedToken);
        }
        let json = URL_SAFE_NO_PAD
            .decode(token.trim())
            .map_err(|_| EngineError::MalformedToken)?;
        let envelope: Envelope =
            serde_json::from_slice(&json).map_err(|_| EngineError::MalformedToken)?;
        let signature = URL_SAFE_NO_PAD
            .decode(&envelope.signature)
            .map_err(|_| EngineError::MalformedToken)?;

        self.mac(&envelope.claims)?
            .verify_slice(&signature)
            .map_err(|_| EngineError::InvalidSignature)?;

        if now > envelope.claims.expires_at {
            return Err(EngineError::ExpiredToken {
                expired_at: envelope.claims.expires_at,
            });
        }
        Ok(envelope.claims)
    }
}

/// What a scanned token allows right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenCheck {
    pub booking_id: Ulid,
    pub booking_code: String,
    pub status: BookingStatus,
    pub can_check_in: bool,
    pub can_check_out: bool,
}

fn rejection_label(e: &EngineError) -> &'static str {
    match e {
        EngineError::MalformedToken => "malformed",
        EngineError::InvalidSignature => "signature",
        EngineError::ExpiredToken { .. } => "expired",
        EngineError::TokenRevoked(_) => "revoked",
        EngineError::BookingNotFound(_) => "not_found",
        _ => "other",
    }
}

impl Engine {
    /// Issue a check-in token for a confirmed or checked-in booking.
    pub async fn issue_token(&self, booking_id: Ulid) -> Result<String, EngineError> {
        let booking = self.load_booking(booking_id).await?;
        if !matches!(
            booking.status,
            BookingStatus::Confirmed | BookingStatus::CheckedIn
        ) {
            return Err(EngineError::TokenNotIssuable(booking.status));
        }
        let issued_at = self.now();
        let token = self.tokens.sign(TokenClaims {
            booking_code: booking.code.clone(),
            space_id: booking.space_id,
            customer_id: booking.customer_id,
            issued_at,
            expires_at: issued_at + self.tokens.ttl(),
        })?;
        metrics::counter!(crate::observability::TOKENS_ISSUED_TOTAL).increment(1);
        tracing::debug!("issued token for {}", booking.code);
        Ok(token)
    }

    /// Authenticate a token and report which action is eligible now.
    pub async fn validate_token(&self, token: &str) -> Result<TokenCheck, EngineError> {
        let result = self.validate_token_inner(token).await;
        if let Err(e) = &result {
            metrics::counter!(crate::observability::TOKEN_REJECTIONS_TOTAL, "reason" => rejection_label(e))
                .increment(1);
        }
        result
    }

    async fn validate_token_inner(&self, token: &str) -> Result<TokenCheck, EngineError> {
        let now = self.now();
        let claims = self.tokens.verify(token, now)?;
        let booking = self
            .store
            .find_booking_by_code(&claims.booking_code)
            .await?
            .ok_or_else(|| EngineError::BookingNotFound(claims.booking_code.clone()))?;
        if booking.space_id != claims.space_id || booking.customer_id != claims.customer_id {
            return Err(EngineError::InvalidSignature);
        }
        if booking.status == BookingStatus::Cancelled {
            return Err(EngineError::TokenRevoked(booking.code));
        }

        let grace = match self.store.find_space(booking.space_id).await? {
            Some(space) => space.rules.grace_ms(),
            None => return Err(EngineError::SpaceNotFound(booking.space_id)),
        };
        Ok(TokenCheck {
            booking_id: booking.id,
            can_check_in: check_in_eligibility(&booking, grace, now).is_ok(),
            can_check_out: booking.status == BookingStatus::CheckedIn,
            status: booking.status,
            booking_code: booking.code,
        })
    }

    /// Token-driven check-in at the door.
    pub async fn check_in(&self, token: &str, staff_id: Ulid) -> Result<Booking, EngineError> {
        let check = self.validate_token(token).await?;
        self.check_in_booking(check.booking_id, staff_id).await
    }

    pub async fn check_out(&self, token: &str, staff_id: Ulid) -> Result<Booking, EngineError> {
        let check = self.validate_token(token).await?;
        self.check_out_booking(check.booking_id, staff_id).await
    }
}
