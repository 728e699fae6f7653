use axum::{
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use super::common::validate_input;
use crate::{
    auth::AuthUser,
    errors::ServiceError,
    services::{
        cart::{CartSummary, CartView},
        coupons::CouponApplication,
        ShippingDetails,
    },
    ApiResponse, ApiResult, AppState,
};

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct AddItemRequest {
    pub product_id: Uuid,
    #[serde(default = "default_quantity")]
    #[validate(range(min = 1, message = "quantity must be at least 1"))]
    pub quantity: i32,
}

fn default_quantity() -> i32 {
    1
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct UpdateQuantityRequest {
    #[validate(range(min = 1, message = "quantity must be at least 1"))]
    pub quantity: i32,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct CouponPreviewRequest {
    #[validate(length(min = 1, max = 50))]
    pub code: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CouponPreviewResponse {
    pub coupon: CouponApplication,
    /// Cart summary with the discount applied when the coupon is valid
    pub summary: CartSummary,
}

#[utoipa::path(
    get,
    path = "/api/v1/cart",
    summary = "Get cart",
    description = "The caller's cart with derived subtotal, total and item count",
    responses(
        (status = 200, description = "Cart retrieved", body = ApiResponse<CartView>),
        (status = 401, description = "Unauthorized", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Cart"
)]
pub async fn get_cart(State(state): State<AppState>, user: AuthUser) -> ApiResult<CartView> {
    let cart = state.services.carts.get(&user.user_id).await?;
    Ok(Json(ApiResponse::success(cart)))
}

#[utoipa::path(
    post,
    path = "/api/v1/cart/items",
    summary = "Add item to cart",
    description = "Adds a catalog product; increments the quantity if the product is already in the cart",
    request_body = AddItemRequest,
    responses(
        (status = 200, description = "Item added", body = ApiResponse<CartView>),
        (status = 400, description = "Invalid quantity", body = crate::errors::ErrorResponse),
        (status = 404, description = "Unknown product", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Cart"
)]
pub async fn add_item(
    State(state): State<AppState>,
    user: AuthUser,
    Json(payload): Json<AddItemRequest>,
) -> ApiResult<CartView> {
    validate_input(&payload)?;
    let cart = state
        .services
        .carts
        .add_item(&user.user_id, payload.product_id, payload.quantity)
        .await?;
    Ok(Json(ApiResponse::success(cart)))
}

#[utoipa::path(
    patch,
    path = "/api/v1/cart/items/{item_id}",
    summary = "Update cart item quantity",
    params(("item_id" = Uuid, Path, description = "Cart line id")),
    request_body = UpdateQuantityRequest,
    responses(
        (status = 200, description = "Quantity updated", body = ApiResponse<CartView>),
        (status = 400, description = "Invalid quantity", body = crate::errors::ErrorResponse),
        (status = 404, description = "Unknown cart item", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Cart"
)]
pub async fn update_item(
    State(state): State<AppState>,
    user: AuthUser,
    Path(item_id): Path<Uuid>,
    Json(payload): Json<UpdateQuantityRequest>,
) -> ApiResult<CartView> {
    validate_input(&payload)?;
    let cart = state
        .services
        .carts
        .update_quantity(&user.user_id, item_id, payload.quantity)
        .await?;
    Ok(Json(ApiResponse::success(cart)))
}

#[utoipa::path(
    delete,
    path = "/api/v1/cart/items/{item_id}",
    summary = "Remove cart item",
    params(("item_id" = Uuid, Path, description = "Cart line id")),
    responses(
        (status = 200, description = "Item removed", body = ApiResponse<CartView>),
        (status = 404, description = "Unknown cart item", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Cart"
)]
pub async fn remove_item(
    State(state): State<AppState>,
    user: AuthUser,
    Path(item_id): Path<Uuid>,
) -> ApiResult<CartView> {
    let cart = state
        .services
        .carts
        .remove_item(&user.user_id, item_id)
        .await?;
    Ok(Json(ApiResponse::success(cart)))
}

#[utoipa::path(
    put,
    path = "/api/v1/cart/shipping-address",
    summary = "Save shipping address",
    description = "Stores the address used by checkout when the request does not carry one",
    request_body = ShippingDetails,
    responses(
        (status = 200, description = "Address saved", body = ApiResponse<CartView>),
        (status = 400, description = "Invalid shipping details", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Cart"
)]
pub async fn set_shipping_address(
    State(state): State<AppState>,
    user: AuthUser,
    Json(payload): Json<ShippingDetails>,
) -> ApiResult<CartView> {
    let details = payload.validated()?;
    let address = serde_json::to_value(&details)
        .map_err(|e| ServiceError::InternalError(format!("serializing address: {}", e)))?;
    let cart = state
        .services
        .carts
        .set_shipping_address(&user.user_id, address)
        .await?;
    Ok(Json(ApiResponse::success(cart)))
}

#[utoipa::path(
    post,
    path = "/api/v1/coupons/preview",
    summary = "Preview coupon",
    description = "Evaluates a coupon against the caller's current cart without redeeming it",
    request_body = CouponPreviewRequest,
    responses(
        (status = 200, description = "Coupon evaluated; `valid` tells whether it applies", body = ApiResponse<CouponPreviewResponse>),
    ),
    security(("Bearer" = [])),
    tag = "Cart"
)]
pub async fn preview_coupon(
    State(state): State<AppState>,
    user: AuthUser,
    Json(payload): Json<CouponPreviewRequest>,
) -> ApiResult<CouponPreviewResponse> {
    validate_input(&payload)?;
    let summary = state.services.carts.summary(&user.user_id).await?;
    let coupon = state
        .services
        .coupons
        .evaluate(summary.subtotal, &payload.code)
        .await?;
    let summary = summary.with_discount(coupon.discount_amount);
    Ok(Json(ApiResponse::success(CouponPreviewResponse {
        coupon,
        summary,
    })))
}
