use chrono::Utc;
use lazy_static::lazy_static;
use regex::Regex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use super::cart::{CartService, CartView};
use super::coupons::{self, CouponService};
use crate::{config::AppConfig, entities::order, errors::ServiceError};

lazy_static! {
    static ref PHONE_REGEX: Regex = Regex::new(r"^\+?[0-9][0-9 \-]{8,14}[0-9]$").unwrap();
    static ref POSTAL_CODE_REGEX: Regex = Regex::new(r"^[A-Za-z0-9][A-Za-z0-9 \-]{2,9}$").unwrap();
}

/// Contact and delivery details captured at checkout.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, Validate, ToSchema)]
pub struct ShippingDetails {
    #[serde(default)]
    #[validate(length(min = 1, max = 100, message = "full name is required"))]
    pub full_name: String,
    #[serde(default)]
    #[validate(regex(path = "PHONE_REGEX", message = "contact number is invalid"))]
    pub phone: String,
    #[serde(default)]
    #[validate(email(message = "email is invalid"))]
    pub email: String,
    #[serde(default)]
    #[validate(length(min = 1, max = 200, message = "address is required"))]
    pub address_line1: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address_line2: Option<String>,
    #[serde(default)]
    #[validate(length(min = 1, max = 100, message = "city is required"))]
    pub city: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    #[validate(regex(path = "POSTAL_CODE_REGEX", message = "postal code is invalid"))]
    pub postal_code: String,
    #[serde(default = "default_country")]
    pub country: String,
}

fn default_country() -> String {
    "IN".to_string()
}

impl ShippingDetails {
    pub fn validated(self) -> Result<Self, ServiceError> {
        let trimmed = Self {
            full_name: self.full_name.trim().to_string(),
            phone: self.phone.trim().to_string(),
            email: self.email.trim().to_string(),
            address_line1: self.address_line1.trim().to_string(),
            city: self.city.trim().to_string(),
            postal_code: self.postal_code.trim().to_string(),
            ..self
        };
        trimmed.validate().map_err(|errors| {
            let mut fields: Vec<String> = errors
                .field_errors()
                .into_iter()
                .map(|(field, errs)| {
                    let message = errs
                        .first()
                        .and_then(|e| e.message.as_ref())
                        .map(|m| m.to_string())
                        .unwrap_or_else(|| "is invalid".to_string());
                    format!("{}: {}", field, message)
                })
                .collect();
            fields.sort();
            ServiceError::InvalidShipping(fields.join(", "))
        })?;
        Ok(trimmed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct DraftItem {
    pub product_id: Uuid,
    pub name: String,
    pub quantity: i32,
    pub unit_price: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discount: Option<Decimal>,
    pub line_total: Decimal,
}

/// Flat rate below the free-shipping threshold, free at or above it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShippingPolicy {
    pub flat_rate: Decimal,
    pub free_threshold: Decimal,
}

impl ShippingPolicy {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            flat_rate: config.shipping_flat_rate,
            free_threshold: config.free_shipping_threshold,
        }
    }

    pub fn charges(&self, discounted_subtotal: Decimal) -> Decimal {
        if discounted_subtotal >= self.free_threshold {
            Decimal::ZERO
        } else {
            self.flat_rate
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Totals {
    pub subtotal: Decimal,
    pub discount: Decimal,
    pub shipping_charges: Decimal,
    pub total_amount: Decimal,
}

pub fn compute_totals(subtotal: Decimal, discount: Decimal, policy: ShippingPolicy) -> Totals {
    let discount = discount.clamp(Decimal::ZERO, subtotal.max(Decimal::ZERO));
    let shipping_charges = policy.charges(subtotal - discount);
    Totals {
        subtotal,
        discount,
        shipping_charges,
        total_amount: subtotal - discount + shipping_charges,
    }
}

/// Frozen, server-priced snapshot of a cart. Built only by
/// [`CheckoutSessionBuilder`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderDraft {
    user_id: String,
    items: Vec<DraftItem>,
    totals: Totals,
    currency: String,
    coupon_code: Option<String>,
    shipping: ShippingDetails,
    notes: Option<String>,
}

impl OrderDraft {
    pub fn user_id(&self) -> &str {
        &self.user_id
    }
    pub fn items(&self) -> &[DraftItem] {
        &self.items
    }
    pub fn subtotal(&self) -> Decimal {
        self.totals.subtotal
    }
    pub fn discount(&self) -> Decimal {
        self.totals.discount
    }
    pub fn shipping_charges(&self) -> Decimal {
        self.totals.shipping_charges
    }
    pub fn total_amount(&self) -> Decimal {
        self.totals.total_amount
    }
    pub fn currency(&self) -> &str {
        &self.currency
    }
    pub fn coupon_code(&self) -> Option<&str> {
        self.coupon_code.as_deref()
    }
    pub fn shipping(&self) -> &ShippingDetails {
        &self.shipping
    }
    pub fn notes(&self) -> Option<&str> {
        self.notes.as_deref()
    }
}

/// Checkout inputs beyond the cart itself.
#[derive(Debug, Clone, Default)]
pub struct CheckoutInput {
    /// Falls back to the address saved on the cart.
    pub shipping: Option<ShippingDetails>,
    pub coupon_code: Option<String>,
    pub notes: Option<String>,
    /// Client-side total; compared and logged, never used.
    pub expected_total: Option<Decimal>,
}

#[derive(Clone)]
pub struct CheckoutSessionBuilder {
    carts: CartService,
    coupons: CouponService,
    policy: ShippingPolicy,
    currency: String,
}

impl CheckoutSessionBuilder {
    pub fn new(
        carts: CartService,
        coupons: CouponService,
        policy: ShippingPolicy,
        currency: String,
    ) -> Self {
        Self {
            carts,
            coupons,
            policy,
            currency,
        }
    }

    #[instrument(skip(self, input))]
    pub async fn build_draft(
        &self,
        user_id: &str,
        input: CheckoutInput,
    ) -> Result<OrderDraft, ServiceError> {
        let cart = self.carts.get(user_id).await?;
        if cart.is_empty() {
            return Err(ServiceError::EmptyCart);
        }

        let shipping = resolve_shipping(input.shipping, &cart)?.validated()?;

        let coupon_code = input
            .coupon_code
            .as_deref()
            .map(coupons::normalize_code)
            .filter(|code| !code.is_empty());

        let discount = match &coupon_code {
            Some(code) => {
                self.coupons
                    .evaluate(cart.summary.subtotal, code)
                    .await?
                    .into_result()?
                    .discount_amount
            }
            None => Decimal::ZERO,
        };

        let totals = compute_totals(cart.summary.subtotal, discount, self.policy);
        if !order::totals_consistent(
            totals.subtotal,
            totals.discount,
            totals.shipping_charges,
            totals.total_amount,
        ) {
            return Err(ServiceError::InternalError(format!(
                "inconsistent totals for cart {}",
                cart.id
            )));
        }

        if let Some(expected) = input.expected_total {
            if expected != totals.total_amount {
                warn!(
                    user_id,
                    client_total = %expected,
                    server_total = %totals.total_amount,
                    "client total differs from server pricing"
                );
            }
        }

        let items = cart
            .items
            .iter()
            .map(|line| DraftItem {
                product_id: line.product_id,
                name: line.name.clone(),
                quantity: line.quantity,
                unit_price: line.unit_price,
                discount: None,
                line_total: line.line_total,
            })
            .collect();

        info!(
            user_id,
            subtotal = %totals.subtotal,
            discount = %totals.discount,
            total = %totals.total_amount,
            at = %Utc::now(),
            "order draft built"
        );

        Ok(OrderDraft {
            user_id: user_id.to_string(),
            items,
            totals,
            currency: self.currency.clone(),
            coupon_code,
            shipping,
            notes: input
                .notes
                .map(|n| n.trim().to_string())
                .filter(|n| !n.is_empty()),
        })
    }
}

fn resolve_shipping(
    provided: Option<ShippingDetails>,
    cart: &CartView,
) -> Result<ShippingDetails, ServiceError> {
    if let Some(details) = provided {
        return Ok(details);
    }
    let saved = cart
        .shipping_address
        .clone()
        .ok_or_else(|| ServiceError::InvalidShipping("shipping address is required".into()))?;
    serde_json::from_value(saved)
        .map_err(|e| ServiceError::InvalidShipping(format!("saved address is unusable: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn policy() -> ShippingPolicy {
        ShippingPolicy {
            flat_rate: dec!(50),
            free_threshold: dec!(500),
        }
    }

    fn valid_shipping() -> ShippingDetails {
        ShippingDetails {
            full_name: "Asha Rao".into(),
            phone: "+919876543210".into(),
            email: "asha@example.com".into(),
            address_line1: "12 MG Road".into(),
            address_line2: None,
            city: "Bengaluru".into(),
            state: "KA".into(),
            postal_code: "560001".into(),
            country: "IN".into(),
        }
    }

    #[test]
    fn totals_without_coupon() {
        let totals = compute_totals(dec!(1100), Decimal::ZERO, policy());
        assert_eq!(totals.shipping_charges, Decimal::ZERO);
        assert_eq!(totals.total_amount, dec!(1100));
    }

    #[test]
    fn shipping_applies_below_threshold_after_discount() {
        let totals = compute_totals(dec!(600), dec!(200), policy());
        assert_eq!(totals.shipping_charges, dec!(50));
        assert_eq!(totals.total_amount, dec!(450));
    }

    #[test]
    fn discount_never_exceeds_subtotal() {
        let totals = compute_totals(dec!(100), dec!(500), policy());
        assert_eq!(totals.discount, dec!(100));
        assert_eq!(totals.total_amount, dec!(50));
    }

    #[test]
    fn valid_shipping_passes() {
        assert!(valid_shipping().validated().is_ok());
    }

    #[test]
    fn missing_contact_fields_fail() {
        let details = ShippingDetails {
            phone: "12".into(),
            email: "not-an-email".into(),
            ..valid_shipping()
        };
        match details.validated() {
            Err(ServiceError::InvalidShipping(msg)) => {
                assert!(msg.contains("email"));
                assert!(msg.contains("phone"));
            }
            other => panic!("expected InvalidShipping, got {:?}", other),
        }

        let details = ShippingDetails {
            full_name: "   ".into(),
            ..valid_shipping()
        };
        assert!(matches!(
            details.validated(),
            Err(ServiceError::InvalidShipping(_))
        ));
    }
}
