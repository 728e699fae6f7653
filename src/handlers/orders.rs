use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::info;
use utoipa::ToSchema;
use uuid::Uuid;

use super::common::{total_pages, PaginationParams};
use crate::{
    auth::AuthUser,
    entities::order::OrderStatus,
    errors::ServiceError,
    services::orders::{FulfillmentUpdate, OrderView},
    ApiResponse, ApiResult, AppState, PaginatedResponse,
};

/// `status` is taken as a plain string so that unknown values are reported
/// as an invalid status rather than a body rejection.
#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateOrderStatusRequest {
    #[schema(example = "delivered")]
    pub status: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct DeleteOrderResponse {
    pub deleted: bool,
    pub order_id: Uuid,
}

pub(crate) fn parse_order_status(raw: &str) -> Result<OrderStatus, ServiceError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "processing" => Ok(OrderStatus::Processing),
        "delivered" => Ok(OrderStatus::Delivered),
        "cancelled" | "canceled" => Ok(OrderStatus::Cancelled),
        other => Err(ServiceError::InvalidStatus(format!(
            "'{}' is not a fulfillment status",
            other
        ))),
    }
}

#[utoipa::path(
    get,
    path = "/api/v1/orders",
    summary = "List my orders",
    description = "Orders placed by the caller, newest first",
    params(PaginationParams),
    responses(
        (status = 200, description = "Orders retrieved", body = ApiResponse<PaginatedResponse<OrderView>>),
        (status = 401, description = "Unauthorized", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Orders"
)]
pub async fn list_orders(
    State(state): State<AppState>,
    user: AuthUser,
    Query(params): Query<PaginationParams>,
) -> ApiResult<PaginatedResponse<OrderView>> {
    let (page, per_page) = params.normalized();
    let (items, total) = state
        .services
        .orders
        .list_for_user(&user.user_id, page, per_page)
        .await?;

    Ok(Json(ApiResponse::success(PaginatedResponse {
        items,
        total,
        page,
        limit: per_page,
        total_pages: total_pages(total, per_page),
    })))
}

#[utoipa::path(
    get,
    path = "/api/v1/orders/{order_id}",
    summary = "Get order",
    params(("order_id" = Uuid, Path, description = "Order id")),
    responses(
        (status = 200, description = "Order retrieved", body = ApiResponse<OrderView>),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Orders"
)]
pub async fn get_order(
    State(state): State<AppState>,
    user: AuthUser,
    Path(order_id): Path<Uuid>,
) -> ApiResult<OrderView> {
    let orders = &state.services.orders;
    let order = orders.get_for_user(order_id, &user).await?;
    Ok(Json(ApiResponse::success(orders.view(order).await?)))
}

#[utoipa::path(
    patch,
    path = "/api/v1/orders/{order_id}/status",
    summary = "Update fulfillment status",
    description = "Admin only. Moves a processing order to delivered or cancelled. \
                   Orders without confirmed payment are moved but flagged for review.",
    params(("order_id" = Uuid, Path, description = "Order id")),
    request_body = UpdateOrderStatusRequest,
    responses(
        (status = 200, description = "Status applied or already current", body = ApiResponse<FulfillmentUpdate>),
        (status = 400, description = "Unknown status or forbidden transition", body = crate::errors::ErrorResponse),
        (status = 403, description = "Caller is not an admin", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
        (status = 409, description = "Concurrent status change", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Orders"
)]
pub async fn update_order_status(
    State(state): State<AppState>,
    user: AuthUser,
    Path(order_id): Path<Uuid>,
    Json(payload): Json<UpdateOrderStatusRequest>,
) -> ApiResult<FulfillmentUpdate> {
    let status = parse_order_status(&payload.status)?;
    let update = state
        .services
        .orders
        .update_fulfillment_status(order_id, status)
        .await?;

    info!(
        %order_id,
        admin = %user.user_id,
        status = %status,
        changed = update.changed,
        "admin updated fulfillment status"
    );
    Ok(Json(ApiResponse::success(update)))
}

#[utoipa::path(
    delete,
    path = "/api/v1/orders/{order_id}",
    summary = "Delete order",
    description = "Admin only. Removes the order and its line items.",
    params(("order_id" = Uuid, Path, description = "Order id")),
    responses(
        (status = 200, description = "Order deleted", body = ApiResponse<DeleteOrderResponse>),
        (status = 403, description = "Caller is not an admin", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Orders"
)]
pub async fn delete_order(
    State(state): State<AppState>,
    user: AuthUser,
    Path(order_id): Path<Uuid>,
) -> ApiResult<DeleteOrderResponse> {
    state.services.orders.delete_order(order_id).await?;
    info!(%order_id, admin = %user.user_id, "admin deleted order");
    Ok(Json(ApiResponse::success(DeleteOrderResponse {
        deleted: true,
        order_id,
    })))
}
