use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use super::checkout::OrderDraft;
use super::orders::{OrderService, OrderView};
use crate::{
    config::AppConfig,
    entities::order::{self, PaymentStatus},
    errors::ServiceError,
    events::{Event, EventSender},
    gateways::{GatewayKind, GatewayRegistry, InitiationHandle, TransactionRequest},
    metrics,
};

#[derive(Debug, Clone)]
pub struct Dispatched {
    pub order: OrderView,
    pub handle: InitiationHandle,
    /// `true` when an existing pending order was re-dispatched.
    pub resumed: bool,
}

/// Creates the pending order first, then opens the gateway transaction for it.
#[derive(Clone)]
pub struct PaymentDispatcher {
    orders: OrderService,
    gateways: Arc<GatewayRegistry>,
    event_sender: Arc<EventSender>,
    config: Arc<AppConfig>,
}

impl PaymentDispatcher {
    pub fn new(
        orders: OrderService,
        gateways: Arc<GatewayRegistry>,
        event_sender: Arc<EventSender>,
        config: Arc<AppConfig>,
    ) -> Self {
        Self {
            orders,
            gateways,
            event_sender,
            config,
        }
    }

    /// `idempotency_key` becomes the order id. Re-sending the same key resumes
    /// the existing pending order and passes the same reference to the gateway.
    #[instrument(skip(self, draft), fields(user_id = %draft.user_id()))]
    pub async fn dispatch(
        &self,
        draft: &OrderDraft,
        gateway: GatewayKind,
        idempotency_key: Option<Uuid>,
    ) -> Result<Dispatched, ServiceError> {
        if !self.gateways.supports(gateway) {
            return Err(ServiceError::ValidationError(format!(
                "payment gateway '{}' is not enabled",
                gateway
            )));
        }

        let order_id = idempotency_key.unwrap_or_else(Uuid::new_v4);
        let (order, resumed) = match self.orders.find(order_id).await? {
            Some(existing) => (self.resume(existing, draft, gateway)?, true),
            None => match self.orders.create_pending(order_id, draft, gateway).await {
                Ok(_) => (self.orders.get(order_id).await?, false),
                // lost a race on the same key
                Err(ServiceError::DatabaseError(db_err)) => match self.orders.find(order_id).await? {
                    Some(existing) => (self.resume(existing, draft, gateway)?, true),
                    None => return Err(ServiceError::DatabaseError(db_err)),
                },
                Err(other) => return Err(other),
            },
        };

        if order.total_amount.is_zero() {
            return self.settle_without_gateway(order, resumed).await;
        }

        let request = TransactionRequest {
            reference: order.id,
            order_number: order.order_number.clone(),
            amount: order.total_amount,
            currency: order.currency.clone(),
            customer_id: order.user_id.clone(),
            customer_phone: Some(draft.shipping().phone.clone()).filter(|p| !p.is_empty()),
            existing_gateway_order_id: order.gateway_order_id.clone(),
            callback_url: self.config.callback_url(gateway.as_str()),
            return_url: self.config.payment_return_url.clone(),
        };

        match self.gateways.create_transaction(gateway, &request).await {
            Ok(created) => {
                let order = if order.gateway_order_id.as_deref() != Some(created.gateway_order_id.as_str()) {
                    self.orders
                        .record_gateway_order_id(order.id, &created.gateway_order_id)
                        .await?
                } else {
                    order
                };

                info!(
                    order_id = %order.id,
                    order_number = %order.order_number,
                    gateway = %gateway,
                    gateway_order_id = %created.gateway_order_id,
                    resumed,
                    "payment dispatched"
                );
                self.event_sender
                    .send_or_log(Event::PaymentDispatched {
                        order_id: order.id,
                        gateway: gateway.to_string(),
                        gateway_order_id: created.gateway_order_id,
                    })
                    .await;

                Ok(Dispatched {
                    order: self.orders.view(order).await?,
                    handle: created.handle,
                    resumed,
                })
            }
            Err(ServiceError::GatewayRejected(reason)) => {
                metrics::increment_counter(metrics::GATEWAY_REJECTED);
                warn!(order_id = %order.id, gateway = %gateway, %reason, "gateway rejected transaction");
                self.orders
                    .commit_failed(order.id, None, &format!("gateway rejected: {}", reason), false)
                    .await?;
                Err(ServiceError::GatewayRejected(reason))
            }
            Err(ServiceError::GatewayUnavailable(reason)) => {
                metrics::increment_counter(metrics::GATEWAY_UNAVAILABLE);
                error!(
                    order_id = %order.id,
                    gateway = %gateway,
                    %reason,
                    "gateway unavailable; order left pending for retry"
                );
                Err(ServiceError::GatewayUnavailable(reason))
            }
            // an unreadable create response says nothing about the transaction
            Err(ServiceError::MalformedCallback(reason)) => {
                metrics::increment_counter(metrics::GATEWAY_UNAVAILABLE);
                warn!(
                    order_id = %order.id,
                    gateway = %gateway,
                    %reason,
                    "unreadable gateway response; order left pending for retry"
                );
                Err(ServiceError::GatewayUnavailable(format!(
                    "{} returned an unreadable response",
                    gateway
                )))
            }
            Err(other) => Err(other),
        }
    }

    /// Nothing to collect, so the order is committed as paid with a local
    /// reference in place of a gateway transaction.
    async fn settle_without_gateway(
        &self,
        order: order::Model,
        resumed: bool,
    ) -> Result<Dispatched, ServiceError> {
        let reference = format!("zero_total_{}", order.id.simple());
        let committed = self
            .orders
            .commit_paid(order.id, &reference, "no payment required")
            .await?
            .into_order();

        metrics::increment_counter(metrics::ZERO_TOTAL_SETTLED);
        info!(
            order_id = %committed.id,
            order_number = %committed.order_number,
            payment_status = %committed.payment_status,
            "zero-total order settled without a gateway"
        );

        Ok(Dispatched {
            order: self.orders.view(committed).await?,
            handle: InitiationHandle::NoPaymentRequired,
            resumed,
        })
    }

    fn resume(
        &self,
        existing: order::Model,
        draft: &OrderDraft,
        gateway: GatewayKind,
    ) -> Result<order::Model, ServiceError> {
        if existing.user_id != draft.user_id() {
            return Err(ServiceError::Conflict(
                "idempotency key already used".to_string(),
            ));
        }
        if existing.gateway != gateway {
            return Err(ServiceError::Conflict(format!(
                "order {} was started with {}",
                existing.order_number, existing.gateway
            )));
        }
        if existing.payment_status != PaymentStatus::Pending {
            return Err(ServiceError::Conflict(format!(
                "order {} is already {}",
                existing.order_number, existing.payment_status
            )));
        }
        if existing.total_amount != draft.total_amount() {
            warn!(
                order_id = %existing.id,
                stored_total = %existing.total_amount,
                draft_total = %draft.total_amount(),
                "resuming order whose cart changed; keeping stored totals"
            );
        }
        Ok(existing)
    }
}
