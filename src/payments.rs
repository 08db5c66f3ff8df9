//! Boundary with the payment collaborator.
//!
//! Inbound: [`PaymentEvent`]s keyed by booking id drive the pending to
//! confirmed transition. Outbound: a [`RefundRequest`] on cancellation of a
//! paid booking. Refund amounts are the collaborator's business; the engine
//! only forwards the space's cancellation policy.

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use ulid::Ulid;

use crate::model::{CancellationPolicy, Ms};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentEvent {
    Paid,
    Failed,
    Refunded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefundRequest {
    pub booking_id: Ulid,
    pub booking_code: String,
    pub customer_id: Ulid,
    pub amount_paid: Decimal,
    pub currency: String,
    pub policy: CancellationPolicy,
    pub booking_start: Ms,
    pub cancelled_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentError(pub String);

impl std::fmt::Display for PaymentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "payment collaborator error: {}", self.0)
    }
}

impl std::error::Error for PaymentError {}

#[async_trait]
pub trait PaymentCollaborator: Send + Sync {
    async fn request_refund(&self, request: RefundRequest) -> Result<(), PaymentError>;
}

/// Records refund requests in the log and nothing else.
pub struct LogOnlyPayments;

#[async_trait]
impl PaymentCollaborator for LogOnlyPayments {
    async fn request_refund(&self, request: RefundRequest) -> Result<(), PaymentError> {
        tracing::info!(
            "refund requested for {} ({} {})",
            request.booking_code,
            request.amount_paid,
            request.currency
        );
        Ok(())
    }
}

/// Hands refund requests to a consumer task over a channel.
pub struct ChannelPayments {
    tx: mpsc::UnboundedSender<RefundRequest>,
}

impl ChannelPayments {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RefundRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl PaymentCollaborator for ChannelPayments {
    async fn request_refund(&self, request: RefundRequest) -> Result<(), PaymentError> {
        self.tx
            .send(request)
            .map_err(|_| PaymentError("refund consumer gone".into()))
    }
}
