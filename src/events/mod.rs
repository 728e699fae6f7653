use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Publishing is best effort; a closed channel never fails the caller.
    pub async fn send_or_log(&self, event: Event) {
        if let Err(e) = self.send(event).await {
            error!("{}", e);
        }
    }
}

/// Domain events emitted by the order core.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Event {
    OrderCreated {
        order_id: Uuid,
        order_number: String,
    },
    PaymentDispatched {
        order_id: Uuid,
        gateway: String,
        gateway_order_id: String,
    },
    PaymentSucceeded {
        order_id: Uuid,
        gateway_transaction_id: String,
    },
    PaymentFailed {
        order_id: Uuid,
        reason: String,
    },
    CouponRedeemed {
        code: String,
        order_id: Uuid,
    },
    /// The coupon ran out between checkout and payment confirmation.
    CouponExhaustedAtCommit {
        code: String,
        order_id: Uuid,
    },
    /// A gateway confirmed a capture for an order that was already final
    /// under another transaction.
    CaptureAfterFinal {
        order_id: Uuid,
        gateway_transaction_id: String,
        payment_status: String,
    },
    CartCleared {
        user_id: String,
    },
    VerificationExhausted {
        order_id: Uuid,
        attempts: u32,
    },
    FulfillmentStatusChanged {
        order_id: Uuid,
        old_status: String,
        new_status: String,
    },
    /// Fulfillment moved while payment is not confirmed.
    FulfillmentAnomaly {
        order_id: Uuid,
        payment_status: String,
        new_status: String,
    },
    OrderDeleted(Uuid),
}

pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        match &event {
            Event::CouponExhaustedAtCommit { code, order_id } => {
                warn!(%order_id, coupon = %code, "paid order lost its coupon; refund required");
            }
            Event::CaptureAfterFinal {
                order_id,
                gateway_transaction_id,
                payment_status,
            } => {
                error!(
                    %order_id,
                    %gateway_transaction_id,
                    %payment_status,
                    "capture on a finalized order; refund required"
                );
            }
            Event::FulfillmentAnomaly {
                order_id,
                payment_status,
                new_status,
            } => {
                warn!(
                    %order_id,
                    %payment_status,
                    %new_status,
                    "fulfillment changed on unpaid order; flagged for review"
                );
            }
            Event::VerificationExhausted { order_id, attempts } => {
                warn!(%order_id, attempts, "payment still unconfirmed");
            }
            other => info!(event = ?other, "domain event"),
        }
    }

    info!("Event channel closed; event processing loop stopped");
}
