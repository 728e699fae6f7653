use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::warn;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    auth::AuthUser,
    entities::order::PaymentStatus,
    errors::ServiceError,
    gateways::{GatewayKind, InitiationHandle},
    services::{CheckoutInput, OrderDraft, ShippingDetails},
    ApiResponse, AppState,
};

pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

/// Line the client believes is in the cart. Only compared against the
/// server-side cart.
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct ClientCartLine {
    pub product_id: Uuid,
    pub quantity: i32,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CheckoutRequest {
    #[serde(default)]
    pub items: Option<Vec<ClientCartLine>>,
    /// Falls back to the address saved on the cart
    #[serde(default)]
    pub shipping_address: Option<ShippingDetails>,
    #[serde(default)]
    pub coupon_code: Option<String>,
    pub gateway: GatewayKind,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub expected_total: Option<Decimal>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CheckoutResponse {
    pub order_id: Uuid,
    pub order_number: String,
    pub subtotal: Decimal,
    pub discount: Decimal,
    pub shipping_charges: Decimal,
    pub total_amount: Decimal,
    pub currency: String,
    pub payment_status: PaymentStatus,
    pub gateway: GatewayKind,
    pub initiation_handle: InitiationHandle,
    /// `true` when the idempotency key matched an existing pending order
    pub resumed: bool,
}

fn idempotency_key(headers: &HeaderMap) -> Result<Option<Uuid>, ServiceError> {
    match headers.get(IDEMPOTENCY_KEY_HEADER) {
        None => Ok(None),
        Some(value) => value
            .to_str()
            .ok()
            .and_then(|v| Uuid::parse_str(v.trim()).ok())
            .map(Some)
            .ok_or_else(|| {
                ServiceError::ValidationError("Idempotency-Key must be a UUID".to_string())
            }),
    }
}

fn log_client_cart_mismatch(user_id: &str, client: &[ClientCartLine], draft: &OrderDraft) {
    let mut client_lines: Vec<(Uuid, i32)> =
        client.iter().map(|l| (l.product_id, l.quantity)).collect();
    let mut server_lines: Vec<(Uuid, i32)> = draft
        .items()
        .iter()
        .map(|i| (i.product_id, i.quantity))
        .collect();
    client_lines.sort();
    server_lines.sort();
    if client_lines != server_lines {
        warn!(
            user_id,
            client_lines = client_lines.len(),
            server_lines = server_lines.len(),
            "client cart differs from server cart; using server cart"
        );
    }
}

#[utoipa::path(
    post,
    path = "/api/v1/checkout",
    summary = "Start checkout",
    description = "Snapshots the caller's cart into a pending order and opens a payment with the chosen gateway. \
                   Send the same `Idempotency-Key` to retry safely after a gateway timeout.",
    request_body = CheckoutRequest,
    params(("Idempotency-Key" = Option<String>, Header, description = "UUID used as the order id")),
    responses(
        (status = 201, description = "Pending order created and payment initiated", body = ApiResponse<CheckoutResponse>),
        (status = 200, description = "Existing pending order re-dispatched", body = ApiResponse<CheckoutResponse>),
        (status = 400, description = "Empty cart, invalid shipping or invalid coupon", body = crate::errors::ErrorResponse),
        (status = 402, description = "Gateway rejected the transaction; order failed", body = crate::errors::ErrorResponse),
        (status = 409, description = "Idempotency key belongs to a different or finished order", body = crate::errors::ErrorResponse),
        (status = 502, description = "Gateway unavailable; order left pending", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Checkout"
)]
pub async fn checkout(
    State(state): State<AppState>,
    user: AuthUser,
    headers: HeaderMap,
    Json(payload): Json<CheckoutRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let key = idempotency_key(&headers)?;

    let draft = state
        .services
        .checkout
        .build_draft(
            &user.user_id,
            CheckoutInput {
                shipping: payload.shipping_address,
                coupon_code: payload.coupon_code,
                notes: payload.notes,
                expected_total: payload.expected_total,
            },
        )
        .await?;

    if let Some(items) = &payload.items {
        log_client_cart_mismatch(&user.user_id, items, &draft);
    }

    let dispatched = state
        .services
        .dispatcher
        .dispatch(&draft, payload.gateway, key)
        .await?;

    let order = dispatched.order;
    let status = if dispatched.resumed {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };

    Ok((
        status,
        Json(ApiResponse::success(CheckoutResponse {
            order_id: order.id,
            order_number: order.order_number,
            subtotal: order.subtotal,
            discount: order.discount,
            shipping_charges: order.shipping_charges,
            total_amount: order.total_amount,
            currency: order.currency,
            payment_status: order.payment_status,
            gateway: order.gateway,
            initiation_handle: dispatched.handle,
            resumed: dispatched.resumed,
        })),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotency_key_must_be_uuid() {
        let mut headers = HeaderMap::new();
        assert_eq!(idempotency_key(&headers).unwrap(), None);

        let key = Uuid::new_v4();
        headers.insert(IDEMPOTENCY_KEY_HEADER, key.to_string().parse().unwrap());
        assert_eq!(idempotency_key(&headers).unwrap(), Some(key));

        headers.insert(IDEMPOTENCY_KEY_HEADER, "retry-1".parse().unwrap());
        assert!(idempotency_key(&headers).is_err());
    }
}
