use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::OnConflict, ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection,
    EntityTrait, QueryFilter, QueryOrder, Set,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, instrument};
use utoipa::ToSchema;
use uuid::Uuid;

use super::catalog::ProductCatalog;
use crate::{
    entities::{cart, cart_item},
    errors::ServiceError,
    events::{Event, EventSender},
};

/// Upper bound for a single cart line.
pub const MAX_LINE_QUANTITY: i32 = 1000;

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct CartLine {
    pub id: Uuid,
    pub product_id: Uuid,
    pub name: String,
    pub unit_price: Decimal,
    pub quantity: i32,
    pub line_total: Decimal,
}

impl From<&cart_item::Model> for CartLine {
    fn from(item: &cart_item::Model) -> Self {
        Self {
            id: item.id,
            product_id: item.product_id,
            name: item.name.clone(),
            unit_price: item.unit_price,
            quantity: item.quantity,
            line_total: item.line_total(),
        }
    }
}

/// Derived totals. `discount` is zero until a coupon is applied at checkout.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct CartSummary {
    pub subtotal: Decimal,
    pub discount: Decimal,
    pub total: Decimal,
    pub item_count: i64,
}

impl CartSummary {
    pub fn with_discount(&self, discount: Decimal) -> Self {
        let discount = discount.clamp(Decimal::ZERO, self.subtotal);
        Self {
            discount,
            total: self.subtotal - discount,
            ..self.clone()
        }
    }
}

pub fn summarize(items: &[cart_item::Model]) -> CartSummary {
    let subtotal = items.iter().map(cart_item::Model::line_total).sum();
    CartSummary {
        subtotal,
        discount: Decimal::ZERO,
        total: subtotal,
        item_count: items.iter().map(|i| i64::from(i.quantity)).sum(),
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct CartView {
    pub id: Uuid,
    pub owner_id: String,
    pub items: Vec<CartLine>,
    #[schema(value_type = Option<Object>)]
    pub shipping_address: Option<serde_json::Value>,
    pub summary: CartSummary,
}

impl CartView {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Per-user cart store. Each user has at most one cart, created on first use.
#[derive(Clone)]
pub struct CartService {
    db: Arc<DatabaseConnection>,
    catalog: Arc<dyn ProductCatalog>,
    event_sender: Arc<EventSender>,
}

impl CartService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        catalog: Arc<dyn ProductCatalog>,
        event_sender: Arc<EventSender>,
    ) -> Self {
        Self {
            db,
            catalog,
            event_sender,
        }
    }

    async fn cart_for<C: ConnectionTrait>(
        &self,
        conn: &C,
        owner_id: &str,
    ) -> Result<cart::Model, ServiceError> {
        if let Some(existing) = cart::Entity::find()
            .filter(cart::Column::OwnerId.eq(owner_id))
            .one(conn)
            .await?
        {
            return Ok(existing);
        }

        let now = Utc::now();
        // a concurrent first request may win the insert
        cart::Entity::insert(cart::ActiveModel {
            id: Set(Uuid::new_v4()),
            owner_id: Set(owner_id.to_string()),
            shipping_address: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        })
        .on_conflict(
            OnConflict::column(cart::Column::OwnerId)
                .do_nothing()
                .to_owned(),
        )
        .exec_without_returning(conn)
        .await?;

        cart::Entity::find()
            .filter(cart::Column::OwnerId.eq(owner_id))
            .one(conn)
            .await?
            .ok_or_else(|| ServiceError::InternalError(format!("cart for {} vanished", owner_id)))
    }

    async fn view<C: ConnectionTrait>(
        &self,
        conn: &C,
        cart: cart::Model,
    ) -> Result<CartView, ServiceError> {
        let items = cart_item::Entity::find()
            .filter(cart_item::Column::CartId.eq(cart.id))
            .order_by_asc(cart_item::Column::CreatedAt)
            .order_by_asc(cart_item::Column::Id)
            .all(conn)
            .await?;

        Ok(CartView {
            id: cart.id,
            owner_id: cart.owner_id,
            summary: summarize(&items),
            items: items.iter().map(CartLine::from).collect(),
            shipping_address: cart.shipping_address,
        })
    }

    /// Current cart contents for `owner_id`, with the derived summary.
    #[instrument(skip(self))]
    pub async fn get(&self, owner_id: &str) -> Result<CartView, ServiceError> {
        let cart = self.cart_for(&*self.db, owner_id).await?;
        self.view(&*self.db, cart).await
    }

    pub async fn summary(&self, owner_id: &str) -> Result<CartSummary, ServiceError> {
        Ok(self.get(owner_id).await?.summary)
    }

    /// Adds a product, or bumps the quantity of its existing line.
    #[instrument(skip(self))]
    pub async fn add_item(
        &self,
        owner_id: &str,
        product_id: Uuid,
        quantity: i32,
    ) -> Result<CartView, ServiceError> {
        validate_quantity(quantity)?;

        let product = self
            .catalog
            .product(product_id)
            .await?
            .filter(|p| p.active)
            .ok_or_else(|| ServiceError::NotFound(format!("Product {} not found", product_id)))?;

        let cart = self.cart_for(&*self.db, owner_id).await?;
        let now = Utc::now();

        let existing = cart_item::Entity::find()
            .filter(cart_item::Column::CartId.eq(cart.id))
            .filter(cart_item::Column::ProductId.eq(product_id))
            .one(&*self.db)
            .await?;

        match existing {
            Some(item) => {
                let new_quantity = item
                    .quantity
                    .checked_add(quantity)
                    .filter(|q| *q <= MAX_LINE_QUANTITY)
                    .ok_or_else(|| {
                        ServiceError::ValidationError(format!(
                            "quantity cannot exceed {}",
                            MAX_LINE_QUANTITY
                        ))
                    })?;
                let mut item: cart_item::ActiveModel = item.into();
                item.quantity = Set(new_quantity);
                item.name = Set(product.name.clone());
                item.unit_price = Set(product.price);
                item.updated_at = Set(now);
                item.update(&*self.db).await?;
            }
            None => {
                cart_item::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    cart_id: Set(cart.id),
                    product_id: Set(product_id),
                    name: Set(product.name.clone()),
                    unit_price: Set(product.price),
                    quantity: Set(quantity),
                    created_at: Set(now),
                    updated_at: Set(now),
                }
                .insert(&*self.db)
                .await?;
            }
        }

        info!(owner_id, %product_id, quantity, "item added to cart");
        self.view(&*self.db, cart).await
    }

    #[instrument(skip(self))]
    pub async fn update_quantity(
        &self,
        owner_id: &str,
        item_id: Uuid,
        quantity: i32,
    ) -> Result<CartView, ServiceError> {
        validate_quantity(quantity)?;
        let cart = self.cart_for(&*self.db, owner_id).await?;
        let item = self.owned_item(&cart, item_id).await?;

        let mut item: cart_item::ActiveModel = item.into();
        item.quantity = Set(quantity);
        item.updated_at = Set(Utc::now());
        item.update(&*self.db).await?;

        self.view(&*self.db, cart).await
    }

    #[instrument(skip(self))]
    pub async fn remove_item(&self, owner_id: &str, item_id: Uuid) -> Result<CartView, ServiceError> {
        let cart = self.cart_for(&*self.db, owner_id).await?;
        let item = self.owned_item(&cart, item_id).await?;
        cart_item::Entity::delete_by_id(item.id)
            .exec(&*self.db)
            .await?;

        self.view(&*self.db, cart).await
    }

    pub async fn set_shipping_address(
        &self,
        owner_id: &str,
        address: serde_json::Value,
    ) -> Result<CartView, ServiceError> {
        let cart = self.cart_for(&*self.db, owner_id).await?;
        let mut active: cart::ActiveModel = cart.into();
        active.shipping_address = Set(Some(address));
        active.updated_at = Set(Utc::now());
        let cart = active.update(&*self.db).await?;

        self.view(&*self.db, cart).await
    }

    /// Empties the cart inside the caller's transaction. Only the payment
    /// commit calls this.
    pub async fn clear_within<C: ConnectionTrait>(
        &self,
        conn: &C,
        owner_id: &str,
    ) -> Result<u64, ServiceError> {
        let Some(cart) = cart::Entity::find()
            .filter(cart::Column::OwnerId.eq(owner_id))
            .one(conn)
            .await?
        else {
            return Ok(0);
        };

        let result = cart_item::Entity::delete_many()
            .filter(cart_item::Column::CartId.eq(cart.id))
            .exec(conn)
            .await?;
        Ok(result.rows_affected)
    }

    pub async fn notify_cleared(&self, owner_id: &str) {
        self.event_sender
            .send_or_log(Event::CartCleared {
                user_id: owner_id.to_string(),
            })
            .await;
    }

    async fn owned_item(
        &self,
        cart: &cart::Model,
        item_id: Uuid,
    ) -> Result<cart_item::Model, ServiceError> {
        cart_item::Entity::find_by_id(item_id)
            .filter(cart_item::Column::CartId.eq(cart.id))
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Cart item {} not found", item_id)))
    }
}

fn validate_quantity(quantity: i32) -> Result<(), ServiceError> {
    if quantity < 1 {
        return Err(ServiceError::ValidationError(
            "quantity must be at least 1".to_string(),
        ));
    }
    if quantity > MAX_LINE_QUANTITY {
        return Err(ServiceError::ValidationError(format!(
            "quantity cannot exceed {}",
            MAX_LINE_QUANTITY
        )));
    }
    Ok(())
}
