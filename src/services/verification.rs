//! Converges callback and poll confirmations on the same commit.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use super::orders::{OrderService, PaymentCommit};
use crate::{
    auth::AuthUser,
    entities::order::{self, PaymentStatus},
    errors::ServiceError,
    events::{Event, EventSender},
    gateways::{
        to_minor_units, CallbackPayload, GatewayError, GatewayKind, GatewayRegistry,
        TransactionStatus, VerificationRequest, VerifiedTransaction,
    },
    metrics,
};

pub const UNABLE_TO_VERIFY: &str =
    "We could not confirm your payment yet. Please check your order history shortly.";

pub const CAPTURED_AFTER_FINAL: &str =
    "A payment was received for an order that is already closed; it will be refunded.";

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct VerificationOutcome {
    pub order_id: Uuid,
    pub order_number: String,
    pub success: bool,
    pub status: PaymentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl VerificationOutcome {
    fn from_order(order: &order::Model, message: Option<String>) -> Self {
        Self {
            order_id: order.id,
            order_number: order.order_number.clone(),
            success: order.payment_status == PaymentStatus::Paid,
            status: order.payment_status,
            message,
        }
    }
}

#[derive(Clone)]
pub struct PaymentVerifier {
    orders: OrderService,
    gateways: Arc<GatewayRegistry>,
    event_sender: Arc<EventSender>,
    poll_attempts: u32,
    poll_interval: Duration,
}

impl PaymentVerifier {
    pub fn new(
        orders: OrderService,
        gateways: Arc<GatewayRegistry>,
        event_sender: Arc<EventSender>,
        poll_attempts: u32,
        poll_interval: Duration,
    ) -> Self {
        Self {
            orders,
            gateways,
            event_sender,
            poll_attempts: poll_attempts.max(1),
            poll_interval,
        }
    }

    /// Server-to-server confirmation. Any signature problem leaves the order
    /// untouched.
    #[instrument(skip(self, payload))]
    pub async fn handle_callback(
        &self,
        gateway: GatewayKind,
        payload: CallbackPayload,
    ) -> Result<VerificationOutcome, ServiceError> {
        let verified = match self
            .gateways
            .verify_transaction(gateway, VerificationRequest::Callback(&payload))
            .await
        {
            Ok(verified) => verified,
            Err(GatewayError::InvalidSignature(reason)) => {
                metrics::increment_counter(metrics::CALLBACK_SIGNATURE_REJECTED);
                warn!(gateway = %gateway, %reason, "callback rejected: invalid signature");
                return Err(ServiceError::InvalidSignature(reason));
            }
            Err(err) => {
                warn!(gateway = %gateway, error = %err, "callback rejected");
                return Err(ServiceError::MalformedCallback(err.to_string()));
            }
        };

        let order = self
            .orders
            .find_by_gateway_reference(gateway, &verified.gateway_order_id)
            .await?
            .ok_or_else(|| {
                warn!(gateway = %gateway, gateway_order_id = %verified.gateway_order_id, "callback for unknown order");
                ServiceError::NotFound(format!(
                    "No order for gateway reference {}",
                    verified.gateway_order_id
                ))
            })?;

        self.apply(&order, verified).await
    }

    /// Client-triggered confirmation after the redirect; polls the gateway a
    /// bounded number of times.
    #[instrument(skip(self, user), fields(user_id = %user.user_id))]
    pub async fn verify_order(
        &self,
        user: &AuthUser,
        order_id: Uuid,
    ) -> Result<VerificationOutcome, ServiceError> {
        let order = self.orders.get_for_user(order_id, user).await?;

        if order.payment_status.is_terminal() {
            metrics::increment_counter(metrics::VERIFICATION_NOOP);
            return Ok(VerificationOutcome::from_order(&order, None));
        }
        if order.gateway_order_id.is_none() {
            return Ok(VerificationOutcome::from_order(
                &order,
                Some("Payment has not been initiated for this order".to_string()),
            ));
        }

        for attempt in 1..=self.poll_attempts {
            match self.verify_once(&order).await {
                Ok(Some(outcome)) => return Ok(outcome),
                Ok(None) => {}
                Err(
                    ServiceError::GatewayUnavailable(reason)
                    | ServiceError::GatewayRejected(reason)
                    | ServiceError::MalformedCallback(reason),
                ) => {
                    warn!(%order_id, attempt, %reason, "status poll failed");
                }
                Err(other) => return Err(other),
            }
            if attempt < self.poll_attempts {
                tokio::time::sleep(self.poll_interval).await;
            }
        }

        warn!(%order_id, attempts = self.poll_attempts, "payment verification exhausted; order left pending");
        metrics::increment_counter(metrics::VERIFICATION_EXHAUSTED);
        self.event_sender
            .send_or_log(Event::VerificationExhausted {
                order_id,
                attempts: self.poll_attempts,
            })
            .await;

        let current = self.orders.get(order_id).await?;
        let message = (!current.payment_status.is_terminal()).then(|| UNABLE_TO_VERIFY.to_string());
        Ok(VerificationOutcome::from_order(&current, message))
    }

    /// One status query. `Ok(None)` means the gateway has no definitive answer.
    pub async fn verify_once(
        &self,
        order: &order::Model,
    ) -> Result<Option<VerificationOutcome>, ServiceError> {
        let Some(gateway_order_id) = order.gateway_order_id.as_deref() else {
            return Ok(None);
        };

        let verified = self
            .gateways
            .verify_transaction(
                order.gateway,
                VerificationRequest::Poll {
                    gateway_order_id,
                    reference: order.id,
                },
            )
            .await
            .map_err(ServiceError::from)?;

        if verified.status == TransactionStatus::Pending {
            return Ok(None);
        }
        self.apply(order, verified).await.map(Some)
    }

    async fn apply(
        &self,
        order: &order::Model,
        verified: VerifiedTransaction,
    ) -> Result<VerificationOutcome, ServiceError> {
        let captured = match &verified.status {
            TransactionStatus::Succeeded { transaction_id, .. } => Some(transaction_id.clone()),
            _ => None,
        };
        if order.payment_status.is_terminal() {
            return self.settle_final(order, captured.as_deref()).await;
        }

        if let Some(reported) = verified.amount_minor {
            let expected = to_minor_units(order.total_amount).map_err(ServiceError::from)?;
            if reported != expected {
                error!(
                    order_id = %order.id,
                    expected,
                    reported,
                    "gateway amount does not match order total"
                );
                return Err(ServiceError::InvalidSignature(
                    "amount does not match order total".to_string(),
                ));
            }
        }

        let commit = match verified.status {
            TransactionStatus::Succeeded {
                transaction_id,
                proof,
            } => self.orders.commit_paid(order.id, &transaction_id, &proof).await?,
            TransactionStatus::Failed {
                transaction_id,
                reason,
            } => {
                self.orders
                    .commit_failed(order.id, transaction_id.as_deref(), &reason, false)
                    .await?
            }
            TransactionStatus::Pending => {
                return Ok(VerificationOutcome::from_order(
                    order,
                    Some("Payment is still being processed".to_string()),
                ))
            }
        };

        let message = match &commit {
            PaymentCommit::AlreadyFinal(current) => {
                return self.settle_final(current, captured.as_deref()).await;
            }
            PaymentCommit::CouponExhausted(_) => Some(
                "The coupon on this order is no longer available; the payment will be refunded"
                    .to_string(),
            ),
            _ => None,
        };
        Ok(VerificationOutcome::from_order(commit.order(), message))
    }

    /// A repeat of the committed transaction is a no-op. A capture under any
    /// other transaction id is recorded for refund.
    async fn settle_final(
        &self,
        order: &order::Model,
        captured: Option<&str>,
    ) -> Result<VerificationOutcome, ServiceError> {
        match captured {
            Some(transaction_id) if order.gateway_transaction_id.as_deref() != Some(transaction_id) => {
                let flagged = self
                    .orders
                    .flag_capture_after_final(order.id, transaction_id)
                    .await?;
                Ok(VerificationOutcome::from_order(
                    &flagged,
                    Some(CAPTURED_AFTER_FINAL.to_string()),
                ))
            }
            _ => {
                metrics::increment_counter(metrics::VERIFICATION_NOOP);
                info!(order_id = %order.id, status = %order.payment_status, "payment already final; verification is a no-op");
                Ok(VerificationOutcome::from_order(order, None))
            }
        }
    }
}
