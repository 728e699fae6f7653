use axum::{
    body::Bytes,
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::info;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    auth::AuthUser,
    entities::order::PaymentStatus,
    errors::ServiceError,
    gateways::{CallbackPayload, GatewayKind},
    services::verification::VerificationOutcome,
    ApiResponse, ApiResult, AppState,
};

#[derive(Debug, Deserialize, ToSchema)]
pub struct VerifyPaymentRequest {
    pub order_id: Uuid,
}

/// Acknowledgement returned to the gateway. Not wrapped in `ApiResponse`.
#[derive(Debug, Serialize, ToSchema)]
pub struct CallbackAck {
    pub received: bool,
    pub order_id: Uuid,
    pub payment_status: PaymentStatus,
}

#[utoipa::path(
    post,
    path = "/api/v1/payments/callback/{gateway}",
    summary = "Gateway payment callback",
    description = "Server-to-server notification. The gateway signature is checked before any state change.",
    params(("gateway" = GatewayKind, Path, description = "razorpay or phonepe")),
    request_body(content = String, description = "Raw gateway payload"),
    responses(
        (status = 200, description = "Callback applied (or already applied)", body = CallbackAck),
        (status = 400, description = "Unknown gateway, malformed payload or failed signature check", body = crate::errors::ErrorResponse),
        (status = 404, description = "No order for the gateway reference", body = crate::errors::ErrorResponse),
    ),
    tag = "Payments"
)]
pub async fn payment_callback(
    State(state): State<AppState>,
    Path(gateway): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<CallbackAck>, ServiceError> {
    let gateway: GatewayKind = gateway.parse()?;
    let payload = CallbackPayload::new(&headers, body);

    let outcome = state
        .services
        .verifier
        .handle_callback(gateway, payload)
        .await?;

    info!(
        gateway = %gateway,
        order_id = %outcome.order_id,
        payment_status = %outcome.status,
        "payment callback processed"
    );

    Ok(Json(CallbackAck {
        received: true,
        order_id: outcome.order_id,
        payment_status: outcome.status,
    }))
}

#[utoipa::path(
    post,
    path = "/api/v1/payments/verify",
    summary = "Verify payment",
    description = "Asks the gateway for the transaction status after the shopper returns from the payment page. \
                   Polls a bounded number of times; a still-pending order is returned with an explanatory message.",
    request_body = VerifyPaymentRequest,
    responses(
        (status = 200, description = "Current payment outcome", body = ApiResponse<VerificationOutcome>),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Payments"
)]
pub async fn verify_payment(
    State(state): State<AppState>,
    user: AuthUser,
    Json(payload): Json<VerifyPaymentRequest>,
) -> ApiResult<VerificationOutcome> {
    let outcome = state
        .services
        .verifier
        .verify_order(&user, payload.order_id)
        .await?;
    Ok(Json(ApiResponse::success(outcome)))
}
