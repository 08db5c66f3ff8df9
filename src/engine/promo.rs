use rust_decimal::Decimal;

use crate::limits::{MAX_AMOUNT, MAX_PROMO_CODE_LEN};
use crate::model::{DiscountType, PromoCode};

use super::{check_amount, Engine, EngineError};

/// The discount-relevant subset of a promo code, as pricing consumes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromoTerms {
    pub code: String,
    pub discount_type: DiscountType,
    pub value: Decimal,
    pub min_order_amount: Option<Decimal>,
    pub max_discount_amount: Option<Decimal>,
}

impl From<&PromoCode> for PromoTerms {
    fn from(promo: &PromoCode) -> Self {
        Self {
            code: promo.code.clone(),
            discount_type: promo.discount_type,
            value: promo.value,
            min_order_amount: promo.min_order_amount,
            max_discount_amount: promo.max_discount_amount,
        }
    }
}

pub(super) fn normalize_code(raw: &str) -> Result<String, EngineError> {
    let code = PromoCode::normalize(raw);
    if code.is_empty() {
        return Err(EngineError::Validation("promo code is empty".into()));
    }
    if code.len() > MAX_PROMO_CODE_LEN {
        return Err(EngineError::LimitExceeded("promo code too long"));
    }
    Ok(code)
}

fn check_redeemable(promo: &PromoCode, now: i64) -> Result<(), EngineError> {
    if !promo.is_active {
        return Err(EngineError::PromoNotRedeemable {
            code: promo.code.clone(),
            reason: "inactive",
        });
    }
    if !promo.is_valid_at(now) {
        return Err(EngineError::PromoNotRedeemable {
            code: promo.code.clone(),
            reason: "outside its validity window",
        });
    }
    if !promo.has_uses_left() {
        return Err(EngineError::PromoExhausted(promo.code.clone()));
    }
    Ok(())
}

impl Engine {
    /// Read-only validation: the code exists, is active, is inside its
    /// validity window and has uses left. Consumes nothing.
    pub async fn lookup_promo(&self, raw: &str) -> Result<PromoTerms, EngineError> {
        let code = normalize_code(raw)?;
        let promo = self
            .store
            .find_promo(&code)
            .await?
            .ok_or(EngineError::PromoNotFound(code))?;
        check_redeemable(&promo, self.now())?;
        Ok(PromoTerms::from(&promo))
    }

    /// Atomically consume one use. Of N concurrent callers against a code
    /// with k uses left, exactly k succeed; the rest get `PromoExhausted`.
    pub async fn redeem_promo(&self, raw: &str) -> Result<PromoTerms, EngineError> {
        let code = normalize_code(raw)?;
        match self.store.increment_promo_usage(&code, self.now()).await {
            Ok(promo) => {
                metrics::counter!(crate::observability::PROMO_REDEMPTIONS_TOTAL, "result" => "redeemed")
                    .increment(1);
                tracing::debug!("promo {} redeemed ({} used)", promo.code, promo.used_count);
                Ok(PromoTerms::from(&promo))
            }
            Err(e) => {
                metrics::counter!(crate::observability::PROMO_REDEMPTIONS_TOTAL, "result" => "rejected")
                    .increment(1);
                Err(e.into())
            }
        }
    }

    /// Give back a use consumed by [`Engine::redeem_promo`] when the booking
    /// it was redeemed for never got written.
    pub(super) async fn release_promo(&self, code: &str) {
        if let Err(e) = self.store.release_promo_usage(code).await {
            tracing::warn!("failed to release promo {code}: {e}");
        }
    }

    /// Create or edit a promo code. An edit never changes how many uses are
    /// already consumed, and cannot lower the limit below that count.
    pub async fn upsert_promo(&self, promo: PromoCode) -> Result<(), EngineError> {
        let code = normalize_code(&promo.code)?;
        let max_value = match promo.discount_type {
            DiscountType::Percentage => Decimal::ONE_HUNDRED,
            DiscountType::Fixed => MAX_AMOUNT,
        };
        check_amount("promo value", promo.value, max_value)?;
        if let Some(min) = promo.min_order_amount {
            check_amount("minimum order", min, MAX_AMOUNT)?;
        }
        if let Some(cap) = promo.max_discount_amount {
            check_amount("maximum discount", cap, MAX_AMOUNT)?;
        }
        if let Some(limit) = promo.usage_limit
            && let Some(current) = self.store.find_promo(&code).await?
            && limit < current.used_count
        {
            return Err(EngineError::Validation(format!(
                "usage limit {limit} is below the {} uses already consumed",
                current.used_count
            )));
        }
        self.store.upsert_promo(promo).await?;
        Ok(())
    }
}
