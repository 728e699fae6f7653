use utoipa::{
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
    Modify, OpenApi,
};
use utoipa_swagger_ui::SwaggerUi;

struct BearerAuth;

impl Modify for BearerAuth {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "Bearer",
            SecurityScheme::Http(
                HttpBuilder::new()
                    .scheme(HttpAuthScheme::Bearer)
                    .bearer_format("JWT")
                    .build(),
            ),
        );
    }
}

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Storefront API",
        version = "0.1.0",
        description = r#"
# Storefront order and payment API

Carts, coupons, checkout and order lifecycle for a single-currency storefront,
with payments taken through Razorpay or PhonePe.

## Authentication

Shopper and admin endpoints require a JWT:

```
Authorization: Bearer <your-jwt-token>
```

Gateway callbacks are unauthenticated and verified by signature instead.

## Idempotent checkout

`POST /checkout` accepts an `Idempotency-Key` header (a UUID). Retrying with the
same key re-dispatches the existing pending order instead of creating a new one.

## Error Handling

Errors share one body shape:

```json
{
  "error": "Bad Request",
  "code": "INVALID_COUPON",
  "message": "Invalid coupon: coupon has expired"
}
```
        "#,
    ),
    servers(
        (url = "http://localhost:8080", description = "Local development")
    ),
    tags(
        (name = "Cart", description = "Shopper cart and coupon preview"),
        (name = "Checkout", description = "Order creation and payment dispatch"),
        (name = "Payments", description = "Gateway callbacks and payment verification"),
        (name = "Orders", description = "Order history and admin fulfillment"),
    ),
    paths(
        // Cart
        crate::handlers::carts::get_cart,
        crate::handlers::carts::add_item,
        crate::handlers::carts::update_item,
        crate::handlers::carts::remove_item,
        crate::handlers::carts::set_shipping_address,
        crate::handlers::carts::preview_coupon,

        // Checkout
        crate::handlers::checkout::checkout,

        // Payments
        crate::handlers::payments::payment_callback,
        crate::handlers::payments::verify_payment,

        // Orders
        crate::handlers::orders::list_orders,
        crate::handlers::orders::get_order,
        crate::handlers::orders::update_order_status,
        crate::handlers::orders::delete_order,
    ),
    components(
        schemas(
            crate::errors::ErrorResponse,
            crate::gateways::GatewayKind,
            crate::gateways::InitiationHandle,
            crate::entities::order::OrderStatus,
            crate::entities::order::PaymentStatus,
            crate::services::cart::CartView,
            crate::services::ShippingDetails,
            crate::services::orders::OrderView,
            crate::handlers::checkout::CheckoutRequest,
            crate::handlers::checkout::CheckoutResponse,
            crate::handlers::payments::CallbackAck,
        )
    ),
    modifiers(&BearerAuth)
)]
pub struct ApiDocV1;

pub fn swagger_ui() -> SwaggerUi {
    SwaggerUi::new("/swagger-ui")
        .url("/api-docs/openapi.json", ApiDocV1::openapi())
        .config(utoipa_swagger_ui::Config::from("/api-docs/openapi.json").try_it_out_enabled(true))
}
