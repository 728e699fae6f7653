//! Authoritative order ledger.
//!
//! Payment axis: `pending -> paid | failed`, written with compare-and-set on
//! the current payment status. Fulfillment axis: `processing -> delivered |
//! cancelled`, written only from the admin surface. Neither axis moves the
//! other.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::Expr, ActiveEnum, ActiveModelTrait, ColumnTrait, ConnectionTrait,
    DatabaseConnection, DatabaseTransaction, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, Set, TransactionTrait,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use super::cart::CartService;
use super::checkout::OrderDraft;
use super::coupons::CouponService;
use crate::{
    auth::AuthUser,
    entities::{
        order::{self, OrderStatus, PaymentStatus},
        order_item,
        order_number_sequence::{self, format_order_number},
    },
    errors::ServiceError,
    events::{Event, EventSender},
    gateways::GatewayKind,
    metrics,
};

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct OrderItemView {
    pub product_id: Uuid,
    pub name: String,
    pub quantity: i32,
    pub unit_price: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discount: Option<Decimal>,
    pub line_total: Decimal,
}

impl From<order_item::Model> for OrderItemView {
    fn from(item: order_item::Model) -> Self {
        Self {
            product_id: item.product_id,
            name: item.name,
            quantity: item.quantity,
            unit_price: item.unit_price,
            discount: item.discount,
            line_total: item.line_total,
        }
    }
}

/// Order as exposed over the API. The gateway proof stays internal.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct OrderView {
    pub id: Uuid,
    pub order_number: String,
    pub user_id: String,
    pub items: Vec<OrderItemView>,
    pub subtotal: Decimal,
    pub discount: Decimal,
    pub shipping_charges: Decimal,
    pub total_amount: Decimal,
    pub currency: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coupon_code: Option<String>,
    #[schema(value_type = Object)]
    pub shipping_address: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub order_status: OrderStatus,
    pub payment_status: PaymentStatus,
    pub gateway: GatewayKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway_order_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway_transaction_id: Option<String>,
    pub requires_review: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OrderView {
    pub fn new(order: order::Model, items: Vec<order_item::Model>) -> Self {
        Self {
            id: order.id,
            order_number: order.order_number,
            user_id: order.user_id,
            items: items.into_iter().map(OrderItemView::from).collect(),
            subtotal: order.subtotal,
            discount: order.discount,
            shipping_charges: order.shipping_charges,
            total_amount: order.total_amount,
            currency: order.currency,
            coupon_code: order.coupon_code,
            shipping_address: order.shipping_address,
            notes: order.notes,
            order_status: order.order_status,
            payment_status: order.payment_status,
            gateway: order.gateway,
            gateway_order_id: order.gateway_order_id,
            gateway_transaction_id: order.gateway_transaction_id,
            requires_review: order.requires_review,
            created_at: order.created_at,
            updated_at: order.updated_at,
        }
    }
}

/// Result of a payment-axis commit attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum PaymentCommit {
    /// This call moved the order out of `pending`.
    Committed(order::Model),
    /// Another caller finalized the order first; nothing changed.
    AlreadyFinal(order::Model),
    /// The coupon ran out before the paid commit; the order was failed instead.
    CouponExhausted(order::Model),
}

impl PaymentCommit {
    pub fn order(&self) -> &order::Model {
        match self {
            Self::Committed(o) | Self::AlreadyFinal(o) | Self::CouponExhausted(o) => o,
        }
    }

    pub fn into_order(self) -> order::Model {
        match self {
            Self::Committed(o) | Self::AlreadyFinal(o) | Self::CouponExhausted(o) => o,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FulfillmentTransition {
    NoOp,
    Apply,
}

/// Decides whether `current -> next` is allowed on the fulfillment axis.
pub fn plan_fulfillment_transition(
    current: OrderStatus,
    next: OrderStatus,
) -> Result<FulfillmentTransition, ServiceError> {
    if current == next {
        return Ok(FulfillmentTransition::NoOp);
    }
    if current.is_terminal() || next == OrderStatus::Processing {
        return Err(ServiceError::InvalidStatus(format!(
            "cannot move order from {} to {}",
            current, next
        )));
    }
    Ok(FulfillmentTransition::Apply)
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct FulfillmentUpdate {
    pub order: OrderView,
    pub changed: bool,
    /// Set when fulfillment moved on an order whose payment is not confirmed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anomaly: Option<String>,
}

#[derive(Clone)]
pub struct OrderService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
    carts: CartService,
    coupons: CouponService,
}

impl OrderService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: Arc<EventSender>,
        carts: CartService,
        coupons: CouponService,
    ) -> Self {
        Self {
            db,
            event_sender,
            carts,
            coupons,
        }
    }

    async fn next_order_number(&self, txn: &DatabaseTransaction) -> Result<String, ServiceError> {
        order_number_sequence::Entity::update_many()
            .col_expr(
                order_number_sequence::Column::LastValue,
                Expr::col(order_number_sequence::Column::LastValue).add(1),
            )
            .filter(order_number_sequence::Column::Name.eq(order_number_sequence::ORDERS))
            .exec(txn)
            .await?;

        let sequence = order_number_sequence::Entity::find_by_id(order_number_sequence::ORDERS)
            .one(txn)
            .await?
            .ok_or_else(|| ServiceError::InternalError("order number sequence missing".into()))?;
        Ok(format_order_number(sequence.last_value))
    }

    /// Persists a draft as a `pending` order with its frozen items.
    #[instrument(skip(self, draft), fields(user_id = %draft.user_id()))]
    pub async fn create_pending(
        &self,
        order_id: Uuid,
        draft: &OrderDraft,
        gateway: GatewayKind,
    ) -> Result<OrderView, ServiceError> {
        if !order::totals_consistent(
            draft.subtotal(),
            draft.discount(),
            draft.shipping_charges(),
            draft.total_amount(),
        ) {
            return Err(ServiceError::InternalError(
                "refusing to persist an order with inconsistent totals".into(),
            ));
        }

        let shipping_address = serde_json::to_value(draft.shipping())
            .map_err(|e| ServiceError::InternalError(format!("serializing address: {}", e)))?;

        let txn = self.db.begin().await?;
        let order_number = self.next_order_number(&txn).await?;
        let now = Utc::now();

        let order = order::ActiveModel {
            id: Set(order_id),
            order_number: Set(order_number.clone()),
            gateway_order_id: Set(None),
            user_id: Set(draft.user_id().to_string()),
            subtotal: Set(draft.subtotal()),
            discount: Set(draft.discount()),
            shipping_charges: Set(draft.shipping_charges()),
            total_amount: Set(draft.total_amount()),
            currency: Set(draft.currency().to_string()),
            coupon_code: Set(draft.coupon_code().map(str::to_string)),
            shipping_address: Set(shipping_address),
            notes: Set(draft.notes().map(str::to_string)),
            order_status: Set(OrderStatus::Processing),
            payment_status: Set(PaymentStatus::Pending),
            gateway: Set(gateway),
            gateway_transaction_id: Set(None),
            gateway_signature: Set(None),
            requires_review: Set(false),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&txn)
        .await?;

        let mut items = Vec::with_capacity(draft.items().len());
        for (position, item) in draft.items().iter().enumerate() {
            let row = order_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order_id),
                position: Set(position as i32),
                product_id: Set(item.product_id),
                name: Set(item.name.clone()),
                quantity: Set(item.quantity),
                unit_price: Set(item.unit_price),
                discount: Set(item.discount),
                line_total: Set(item.line_total),
            }
            .insert(&txn)
            .await?;
            items.push(row);
        }

        txn.commit().await?;

        metrics::increment_counter(metrics::ORDERS_CREATED);
        self.event_sender
            .send_or_log(Event::OrderCreated {
                order_id,
                order_number: order_number.clone(),
            })
            .await;
        info!(%order_id, order_number = %order_number, total = %order.total_amount, "pending order created");

        Ok(OrderView::new(order, items))
    }

    pub async fn find(&self, order_id: Uuid) -> Result<Option<order::Model>, ServiceError> {
        Ok(order::Entity::find_by_id(order_id).one(&*self.db).await?)
    }

    pub async fn get(&self, order_id: Uuid) -> Result<order::Model, ServiceError> {
        self.find(order_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))
    }

    async fn items_for<C: ConnectionTrait>(
        &self,
        conn: &C,
        order_id: Uuid,
    ) -> Result<Vec<order_item::Model>, ServiceError> {
        Ok(order_item::Entity::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .order_by_asc(order_item::Column::Position)
            .all(conn)
            .await?)
    }

    pub async fn view(&self, order: order::Model) -> Result<OrderView, ServiceError> {
        let items = self.items_for(&*self.db, order.id).await?;
        Ok(OrderView::new(order, items))
    }

    /// Owners see their own orders, admins see all; anything else is a 404.
    pub async fn get_for_user(&self, order_id: Uuid, user: &AuthUser) -> Result<order::Model, ServiceError> {
        let order = self.get(order_id).await?;
        if order.user_id != user.user_id && !user.is_admin() {
            return Err(ServiceError::NotFound(format!("Order {} not found", order_id)));
        }
        Ok(order)
    }

    #[instrument(skip(self))]
    pub async fn list_for_user(
        &self,
        user_id: &str,
        page: u64,
        per_page: u64,
    ) -> Result<(Vec<OrderView>, u64), ServiceError> {
        let paginator = order::Entity::find()
            .filter(order::Column::UserId.eq(user_id))
            .order_by_desc(order::Column::CreatedAt)
            .order_by_desc(order::Column::OrderNumber)
            .paginate(&*self.db, per_page.max(1));

        let total = paginator.num_items().await?;
        let orders = paginator.fetch_page(page.saturating_sub(1)).await?;

        let ids: Vec<Uuid> = orders.iter().map(|o| o.id).collect();
        let mut items_by_order: HashMap<Uuid, Vec<order_item::Model>> = HashMap::new();
        if !ids.is_empty() {
            for item in order_item::Entity::find()
                .filter(order_item::Column::OrderId.is_in(ids))
                .order_by_asc(order_item::Column::Position)
                .all(&*self.db)
                .await?
            {
                items_by_order.entry(item.order_id).or_default().push(item);
            }
        }

        let views = orders
            .into_iter()
            .map(|order| {
                let items = items_by_order.remove(&order.id).unwrap_or_default();
                OrderView::new(order, items)
            })
            .collect();
        Ok((views, total))
    }

    pub async fn find_by_gateway_reference(
        &self,
        gateway: GatewayKind,
        gateway_order_id: &str,
    ) -> Result<Option<order::Model>, ServiceError> {
        Ok(order::Entity::find()
            .filter(order::Column::Gateway.eq(gateway))
            .filter(order::Column::GatewayOrderId.eq(gateway_order_id))
            .one(&*self.db)
            .await?)
    }

    /// Pending orders with a gateway reference older than `older_than`.
    pub async fn pending_for_reconciliation(
        &self,
        older_than: DateTime<Utc>,
        limit: u64,
    ) -> Result<Vec<order::Model>, ServiceError> {
        use sea_orm::QuerySelect;
        Ok(order::Entity::find()
            .filter(order::Column::PaymentStatus.eq(PaymentStatus::Pending))
            .filter(order::Column::GatewayOrderId.is_not_null())
            .filter(order::Column::CreatedAt.lt(older_than))
            .order_by_asc(order::Column::CreatedAt)
            .limit(limit)
            .all(&*self.db)
            .await?)
    }

    /// Stores the gateway's order reference while the order is still pending.
    pub async fn record_gateway_order_id(
        &self,
        order_id: Uuid,
        gateway_order_id: &str,
    ) -> Result<order::Model, ServiceError> {
        order::Entity::update_many()
            .col_expr(
                order::Column::GatewayOrderId,
                Expr::value(Some(gateway_order_id.to_string())),
            )
            .col_expr(order::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(order::Column::Id.eq(order_id))
            .filter(order::Column::PaymentStatus.eq(PaymentStatus::Pending))
            .exec(&*self.db)
            .await?;
        self.get(order_id).await
    }

    /// `pending -> paid` together with the coupon redemption and cart clear,
    /// all in one transaction.
    #[instrument(skip(self, proof))]
    pub async fn commit_paid(
        &self,
        order_id: Uuid,
        transaction_id: &str,
        proof: &str,
    ) -> Result<PaymentCommit, ServiceError> {
        // the CAS is the first statement: SQLite read locks do not upgrade
        // under contention
        let txn = self.db.begin().await?;
        let updated = order::Entity::update_many()
            .col_expr(
                order::Column::PaymentStatus,
                Expr::value(PaymentStatus::Paid.into_value()),
            )
            .col_expr(
                order::Column::GatewayTransactionId,
                Expr::value(Some(transaction_id.to_string())),
            )
            .col_expr(
                order::Column::GatewaySignature,
                Expr::value(Some(proof.to_string())),
            )
            .col_expr(order::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(order::Column::Id.eq(order_id))
            .filter(order::Column::PaymentStatus.eq(PaymentStatus::Pending))
            .exec(&txn)
            .await?;

        if updated.rows_affected != 1 {
            txn.rollback().await?;
            return Ok(PaymentCommit::AlreadyFinal(self.get(order_id).await?));
        }

        let order = order::Entity::find_by_id(order_id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        if let Some(code) = order.coupon_code.as_deref() {
            if !self.coupons.redeem_within(&txn, code).await? {
                txn.rollback().await?;
                return self.fail_for_exhausted_coupon(order_id, code, transaction_id).await;
            }
        }

        let cleared = self.carts.clear_within(&txn, &order.user_id).await?;
        txn.commit().await?;

        metrics::increment_counter(metrics::PAYMENTS_PAID);
        info!(%order_id, transaction_id, cleared_lines = cleared, "payment committed");

        self.event_sender
            .send_or_log(Event::PaymentSucceeded {
                order_id,
                gateway_transaction_id: transaction_id.to_string(),
            })
            .await;
        if let Some(code) = order.coupon_code.clone() {
            self.event_sender
                .send_or_log(Event::CouponRedeemed { code, order_id })
                .await;
        }
        self.carts.notify_cleared(&order.user_id).await;

        Ok(PaymentCommit::Committed(self.get(order_id).await?))
    }

    async fn fail_for_exhausted_coupon(
        &self,
        order_id: Uuid,
        code: &str,
        transaction_id: &str,
    ) -> Result<PaymentCommit, ServiceError> {
        warn!(
            %order_id,
            coupon = code,
            transaction_id,
            "coupon exhausted at payment commit; order failed, refund required"
        );
        metrics::increment_counter(metrics::COUPON_EXHAUSTED_AT_COMMIT);
        self.event_sender
            .send_or_log(Event::CouponExhaustedAtCommit {
                code: code.to_string(),
                order_id,
            })
            .await;

        let reason = format!(
            "coupon {} was exhausted before payment {} was confirmed; refund required",
            code, transaction_id
        );
        Ok(
            match self
                .commit_failed(order_id, Some(transaction_id), &reason, true)
                .await?
            {
                PaymentCommit::Committed(order) => PaymentCommit::CouponExhausted(order),
                other => other,
            },
        )
    }

    /// `pending -> failed`. The row is kept as an audit record. `flag_review`
    /// sets `requires_review` in the same write.
    #[instrument(skip(self))]
    pub async fn commit_failed(
        &self,
        order_id: Uuid,
        transaction_id: Option<&str>,
        reason: &str,
        flag_review: bool,
    ) -> Result<PaymentCommit, ServiceError> {
        let order = self.get(order_id).await?;
        if order.payment_status.is_terminal() {
            return Ok(PaymentCommit::AlreadyFinal(order));
        }

        let note = match &order.notes {
            Some(existing) => format!("{}\n[payment] {}", existing, reason),
            None => format!("[payment] {}", reason),
        };

        let mut update = order::Entity::update_many()
            .col_expr(
                order::Column::PaymentStatus,
                Expr::value(PaymentStatus::Failed.into_value()),
            )
            .col_expr(order::Column::Notes, Expr::value(Some(note)))
            .col_expr(
                order::Column::RequiresReview,
                Expr::value(order.requires_review || flag_review),
            )
            .col_expr(order::Column::UpdatedAt, Expr::value(Utc::now()));
        if let Some(tx) = transaction_id {
            update = update.col_expr(
                order::Column::GatewayTransactionId,
                Expr::value(Some(tx.to_string())),
            );
        }
        let updated = update
            .filter(order::Column::Id.eq(order_id))
            .filter(order::Column::PaymentStatus.eq(PaymentStatus::Pending))
            .exec(&*self.db)
            .await?;

        if updated.rows_affected != 1 {
            return Ok(PaymentCommit::AlreadyFinal(self.get(order_id).await?));
        }

        metrics::increment_counter(metrics::PAYMENTS_FAILED);
        info!(%order_id, reason, "payment marked failed");
        self.event_sender
            .send_or_log(Event::PaymentFailed {
                order_id,
                reason: reason.to_string(),
            })
            .await;

        Ok(PaymentCommit::Committed(self.get(order_id).await?))
    }

    /// Records a verified capture that arrived after the order was already
    /// final under a different transaction. The payment status is left alone;
    /// the order is flagged so the capture can be refunded.
    #[instrument(skip(self))]
    pub async fn flag_capture_after_final(
        &self,
        order_id: Uuid,
        transaction_id: &str,
    ) -> Result<order::Model, ServiceError> {
        let order = self.get(order_id).await?;
        if order
            .notes
            .as_deref()
            .is_some_and(|notes| notes.contains(transaction_id))
        {
            // duplicate delivery of a capture already recorded
            return Ok(order);
        }

        let entry = format!(
            "[payment] {} captured after order was {}, refund required",
            transaction_id, order.payment_status
        );
        let note = match &order.notes {
            Some(existing) => format!("{}\n{}", existing, entry),
            None => entry,
        };

        order::Entity::update_many()
            .col_expr(order::Column::Notes, Expr::value(Some(note)))
            .col_expr(order::Column::RequiresReview, Expr::value(true))
            .col_expr(order::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(order::Column::Id.eq(order_id))
            .filter(order::Column::PaymentStatus.eq(order.payment_status))
            .exec(&*self.db)
            .await?;

        error!(
            %order_id,
            transaction_id,
            payment_status = %order.payment_status,
            "gateway captured a payment for a finalized order; refund required"
        );
        metrics::increment_counter(metrics::CAPTURE_AFTER_FINAL);
        self.event_sender
            .send_or_log(Event::CaptureAfterFinal {
                order_id,
                gateway_transaction_id: transaction_id.to_string(),
                payment_status: order.payment_status.to_string(),
            })
            .await;

        self.get(order_id).await
    }

    /// Admin-only fulfillment move. Unpaid orders are still moved but flagged.
    #[instrument(skip(self))]
    pub async fn update_fulfillment_status(
        &self,
        order_id: Uuid,
        new_status: OrderStatus,
    ) -> Result<FulfillmentUpdate, ServiceError> {
        let order = self.get(order_id).await?;

        if plan_fulfillment_transition(order.order_status, new_status)?
            == FulfillmentTransition::NoOp
        {
            return Ok(FulfillmentUpdate {
                order: self.view(order).await?,
                changed: false,
                anomaly: None,
            });
        }

        let old_status = order.order_status;
        let unpaid = order.payment_status != PaymentStatus::Paid;

        let updated = order::Entity::update_many()
            .col_expr(
                order::Column::OrderStatus,
                Expr::value(new_status.into_value()),
            )
            .col_expr(
                order::Column::RequiresReview,
                Expr::value(order.requires_review || unpaid),
            )
            .col_expr(order::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(order::Column::Id.eq(order_id))
            .filter(order::Column::OrderStatus.eq(old_status))
            .exec(&*self.db)
            .await?;

        if updated.rows_affected != 1 {
            return Err(ServiceError::Conflict(format!(
                "order {} changed status concurrently",
                order_id
            )));
        }

        info!(%order_id, from = %old_status, to = %new_status, "fulfillment status updated");
        self.event_sender
            .send_or_log(Event::FulfillmentStatusChanged {
                order_id,
                old_status: old_status.to_string(),
                new_status: new_status.to_string(),
            })
            .await;

        let anomaly = if unpaid {
            warn!(
                %order_id,
                payment_status = %order.payment_status,
                new_status = %new_status,
                "fulfillment moved on an order without confirmed payment; flagged for review"
            );
            metrics::increment_counter(metrics::FULFILLMENT_ANOMALIES);
            self.event_sender
                .send_or_log(Event::FulfillmentAnomaly {
                    order_id,
                    payment_status: order.payment_status.to_string(),
                    new_status: new_status.to_string(),
                })
                .await;
            Some(format!(
                "order marked {} while payment is {}; flagged for manual review",
                new_status, order.payment_status
            ))
        } else {
            None
        };

        let order = self.get(order_id).await?;
        Ok(FulfillmentUpdate {
            order: self.view(order).await?,
            changed: true,
            anomaly,
        })
    }

    /// Hard delete of the order and its items.
    #[instrument(skip(self))]
    pub async fn delete_order(&self, order_id: Uuid) -> Result<(), ServiceError> {
        let txn = self.db.begin().await?;

        order_item::Entity::delete_many()
            .filter(order_item::Column::OrderId.eq(order_id))
            .exec(&txn)
            .await?;
        let deleted = order::Entity::delete_by_id(order_id).exec(&txn).await?;

        if deleted.rows_affected == 0 {
            txn.rollback().await?;
            return Err(ServiceError::NotFound(format!("Order {} not found", order_id)));
        }
        txn.commit().await.map_err(|e| {
            error!(%order_id, error = %e, "order delete failed to commit");
            ServiceError::from(e)
        })?;

        info!(%order_id, "order deleted");
        self.event_sender
            .send_or_log(Event::OrderDeleted(order_id))
            .await;
        Ok(())
    }
}
