pub mod carts;
pub mod checkout;
pub mod common;
pub mod orders;
pub mod payments;

use sea_orm::DatabaseConnection;
use std::sync::Arc;

use crate::config::AppConfig;
use crate::events::EventSender;
use crate::gateways::GatewayRegistry;
use crate::services::{
    checkout::ShippingPolicy, CartService, CheckoutSessionBuilder, CouponService,
    OrderService, PaymentDispatcher, PaymentVerifier, ProductCatalog,
};

// Re-export AppState so handler modules can import it as crate::handlers::AppState
pub use crate::AppState;

/// Services layer that encapsulates business logic used by HTTP handlers
#[derive(Clone)]
pub struct AppServices {
    pub carts: Arc<CartService>,
    pub coupons: Arc<CouponService>,
    pub checkout: Arc<CheckoutSessionBuilder>,
    pub dispatcher: Arc<PaymentDispatcher>,
    pub verifier: Arc<PaymentVerifier>,
    pub orders: Arc<OrderService>,
    pub gateways: Arc<GatewayRegistry>,
}

impl AppServices {
    pub fn new(
        db: Arc<DatabaseConnection>,
        config: Arc<AppConfig>,
        event_sender: Arc<EventSender>,
        catalog: Arc<dyn ProductCatalog>,
        gateways: Arc<GatewayRegistry>,
    ) -> Self {
        let carts = CartService::new(db.clone(), catalog, event_sender.clone());
        let coupons = CouponService::new(db.clone());
        let orders = OrderService::new(
            db.clone(),
            event_sender.clone(),
            carts.clone(),
            coupons.clone(),
        );
        let checkout = CheckoutSessionBuilder::new(
            carts.clone(),
            coupons.clone(),
            ShippingPolicy::from_config(&config),
            config.currency.clone(),
        );
        let dispatcher = PaymentDispatcher::new(
            orders.clone(),
            gateways.clone(),
            event_sender.clone(),
            config.clone(),
        );
        let verifier = PaymentVerifier::new(
            orders.clone(),
            gateways.clone(),
            event_sender,
            config.verify_poll_attempts,
            config.verify_poll_interval(),
        );

        Self {
            carts: Arc::new(carts),
            coupons: Arc::new(coupons),
            checkout: Arc::new(checkout),
            dispatcher: Arc::new(dispatcher),
            verifier: Arc::new(verifier),
            orders: Arc::new(orders),
            gateways,
        }
    }
}
