// Collaborators
pub mod catalog;

// Cart and pricing
pub mod cart;
pub mod checkout;
pub mod coupons;

// Payment flow
pub mod dispatch;
pub mod verification;

// Order ledger
pub mod orders;
pub mod reconciliation;

pub use cart::CartService;
pub use catalog::{CatalogProduct, InMemoryCatalog, ProductCatalog};
pub use checkout::{CheckoutInput, CheckoutSessionBuilder, OrderDraft, ShippingDetails, ShippingPolicy};
pub use coupons::CouponService;
pub use dispatch::PaymentDispatcher;
pub use orders::OrderService;
pub use verification::PaymentVerifier;
