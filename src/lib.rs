//! Storefront API Library
//!
//! Order and payment orchestration core: carts, coupons, checkout sessions,
//! payment gateway dispatch and verification, and the order lifecycle.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

// Core modules
pub mod auth;
pub mod circuit_breaker;
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod gateways;
pub mod handlers;
pub mod metrics;
pub mod middleware_helpers;
pub mod openapi;
pub mod services;
pub mod tracing;

use axum::{
    extract::State,
    response::Json,
    routing::{delete, get, patch, post},
    Extension, Router,
};
use chrono::Utc;
use sea_orm::DatabaseConnection;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use utoipa::ToSchema;

use crate::auth::{AuthRouterExt, AuthService, ADMIN_ROLE};

// App state definition
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseConnection>,
    pub config: Arc<config::AppConfig>,
    pub event_sender: Arc<events::EventSender>,
    pub services: handlers::AppServices,
}

// Common response wrappers
#[derive(Serialize, ToSchema)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub message: Option<String>,
    pub errors: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<ResponseMeta>,
}

#[derive(Serialize, ToSchema)]
pub struct ResponseMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub timestamp: String,
}

impl ResponseMeta {
    fn capture() -> Self {
        Self {
            request_id: crate::tracing::current_request_id().map(|rid| rid.as_str().to_string()),
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

#[derive(Serialize, ToSchema)]
pub struct PaginatedResponse<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u64,
    pub limit: u64,
    pub total_pages: u64,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
            errors: None,
            meta: Some(ResponseMeta::capture()),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            message: Some(message),
            errors: None,
            meta: Some(ResponseMeta::capture()),
        }
    }
}


/// Standard API result type for JSON responses
pub type ApiResult<T> = Result<Json<ApiResponse<T>>, errors::ServiceError>;

/// Routes mounted under `/api/v1`.
pub fn api_v1_routes() -> Router<AppState> {
    // Shopper routes: any authenticated caller, scoped to their own data
    let shopper = Router::new()
        .route("/cart", get(handlers::carts::get_cart))
        .route("/cart/items", post(handlers::carts::add_item))
        .route(
            "/cart/items/:item_id",
            patch(handlers::carts::update_item).delete(handlers::carts::remove_item),
        )
        .route(
            "/cart/shipping-address",
            axum::routing::put(handlers::carts::set_shipping_address),
        )
        .route("/coupons/preview", post(handlers::carts::preview_coupon))
        .route("/checkout", post(handlers::checkout::checkout))
        .route("/payments/verify", post(handlers::payments::verify_payment))
        .route("/orders", get(handlers::orders::list_orders))
        .route("/orders/:order_id", get(handlers::orders::get_order))
        .with_auth();

    let admin = Router::new()
        .route(
            "/orders/:order_id/status",
            patch(handlers::orders::update_order_status),
        )
        .route("/orders/:order_id", delete(handlers::orders::delete_order))
        .with_role(ADMIN_ROLE);

    // Gateway callbacks are authenticated by signature, not by token
    let callbacks = Router::new().route(
        "/payments/callback/:gateway",
        post(handlers::payments::payment_callback),
    );

    Router::new()
        .route("/health", get(health_check))
        .merge(shopper)
        .merge(admin)
        .merge(callbacks)
}

/// Full application router: API, metrics and docs, with request-id and
/// tracing layers. Transport concerns like CORS are added by the binary.
pub fn app_router(state: AppState, auth_service: Arc<AuthService>) -> Router {
    Router::new()
        .route("/", get(|| async { "storefront-api up" }))
        .route("/metrics", get(metrics::metrics_handler))
        .nest("/api/v1", api_v1_routes())
        .merge(openapi::swagger_ui())
        .layer(crate::tracing::configure_http_tracing())
        // Read by the auth middleware on protected routes
        .layer(Extension(auth_service))
        .layer(axum::middleware::from_fn(
            middleware_helpers::request_id::request_id_middleware,
        ))
        .with_state(state)
}

async fn health_check(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<Value>>, errors::ServiceError> {
    let db_status = match state.db.ping().await {
        Ok(_) => "healthy",
        Err(err) => {
            ::tracing::warn!(error = %err, "database ping failed");
            "unhealthy"
        }
    };

    let health_data = json!({
        "status": db_status,
        "checks": {
            "database": db_status,
            "gateways": state.services.gateways.kinds(),
        },
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": Utc::now().to_rfc3339(),
    });

    Ok(Json(ApiResponse::success(health_data)))
}
