mod common;

use axum::http::{Method, StatusCode};
use chrono::{Duration, Utc};
use common::*;
use rust_decimal_macros::dec;
use serde_json::json;
use storefront_api::{entities::coupon::DiscountType, services::coupons::NewCoupon};
use uuid::Uuid;

#[tokio::test]
async fn cart_is_created_lazily_and_empty() {
    let app = TestApp::new().await;
    let (status, body) = app.as_user(SHOPPER, Method::GET, "/api/v1/cart", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["owner_id"], SHOPPER);
    assert_eq!(body["data"]["items"].as_array().unwrap().len(), 0);
    assert_eq!(decimal_of(&body["data"]["summary"]["total"]), dec!(0));
}

#[tokio::test]
async fn adding_the_same_product_increments_its_line() {
    let app = TestApp::new().await;
    app.add_to_cart(SHOPPER, CABLE, 1).await;
    let body = app.add_to_cart(SHOPPER, CABLE, 2).await;

    let items = body["data"]["items"].as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["quantity"], 3);
    assert_eq!(decimal_of(&items[0]["line_total"]), dec!(900));
    assert_eq!(body["data"]["summary"]["item_count"], 3);
}

#[tokio::test]
async fn summary_tracks_every_line() {
    let app = TestApp::new().await;
    app.add_to_cart(SHOPPER, HEADPHONES, 1).await;
    let body = app.add_to_cart(SHOPPER, CABLE, 2).await;

    let summary = &body["data"]["summary"];
    assert_eq!(decimal_of(&summary["subtotal"]), dec!(1100));
    assert_eq!(decimal_of(&summary["total"]), dec!(1100));
    assert_eq!(summary["item_count"], 3);
}

#[tokio::test]
async fn quantity_updates_and_removal() {
    let app = TestApp::new().await;
    let body = app.add_to_cart(SHOPPER, HEADPHONES, 1).await;
    let item_id = body["data"]["items"][0]["id"].as_str().unwrap().to_string();
    let uri = format!("/api/v1/cart/items/{}", item_id);

    let (status, body) = app
        .as_user(SHOPPER, Method::PATCH, &uri, Some(json!({ "quantity": 4 })))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(decimal_of(&body["data"]["summary"]["subtotal"]), dec!(2000));

    let (status, _) = app
        .as_user(SHOPPER, Method::PATCH, &uri, Some(json!({ "quantity": 0 })))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = app.as_user(SHOPPER, Method::DELETE, &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["data"]["items"].as_array().unwrap().is_empty());

    let (status, _) = app.as_user(SHOPPER, Method::DELETE, &uri, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn carts_are_private_to_their_owner() {
    let app = TestApp::new().await;
    let body = app.add_to_cart(SHOPPER, HEADPHONES, 1).await;
    let item_id = body["data"]["items"][0]["id"].as_str().unwrap().to_string();

    let (status, _) = app
        .as_user(
            OTHER_SHOPPER,
            Method::DELETE,
            &format!("/api/v1/cart/items/{}", item_id),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, other) = app.as_user(OTHER_SHOPPER, Method::GET, "/api/v1/cart", None).await;
    assert!(other["data"]["items"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn unknown_or_inactive_products_are_rejected() {
    let app = TestApp::new().await;
    let (status, _) = app
        .as_user(
            SHOPPER,
            Method::POST,
            "/api/v1/cart/items",
            Some(json!({ "product_id": Uuid::new_v4(), "quantity": 1 })),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let retired = Uuid::new_v4();
    app.catalog.upsert(storefront_api::services::CatalogProduct {
        id: retired,
        name: "Retired".to_string(),
        price: dec!(99),
        active: false,
    });
    let (status, _) = app
        .as_user(
            SHOPPER,
            Method::POST,
            "/api/v1/cart/items",
            Some(json!({ "product_id": retired })),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn cart_requires_a_token() {
    let app = TestApp::new().await;
    let (status, _) = app
        .request(Method::GET, "/api/v1/cart", None, None, &[])
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = app
        .request(
            Method::GET,
            "/api/v1/cart",
            None,
            None,
            &[("authorization", "Bearer not-a-jwt")],
        )
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn coupon_preview_reports_discount_without_redeeming() {
    let app = TestApp::new().await;
    app.seed_coupon("SAVE10", DiscountType::Percentage, dec!(10), 3).await;
    app.add_to_cart(SHOPPER, HEADPHONES, 1).await;
    app.add_to_cart(SHOPPER, CABLE, 2).await;

    let (status, body) = app
        .as_user(
            SHOPPER,
            Method::POST,
            "/api/v1/coupons/preview",
            Some(json!({ "code": "save10" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["data"]["coupon"]["valid"], true);
    assert_eq!(body["data"]["coupon"]["code"], "SAVE10");
    assert_eq!(decimal_of(&body["data"]["summary"]["discount"]), dec!(110));
    assert_eq!(decimal_of(&body["data"]["summary"]["total"]), dec!(990));
    assert_eq!(app.coupon_used_count("SAVE10").await, 0);
}

#[tokio::test]
async fn expired_coupon_preview_is_invalid() {
    let app = TestApp::new().await;
    let now = Utc::now();
    app.state
        .services
        .coupons
        .create(NewCoupon {
            code: "OLD".to_string(),
            discount_type: DiscountType::Fixed,
            value: dec!(50),
            valid_from: now - Duration::days(10),
            valid_until: now - Duration::days(1),
            usage_limit: 5,
        })
        .await
        .unwrap();
    app.add_to_cart(SHOPPER, CABLE, 1).await;

    let (status, body) = app
        .as_user(
            SHOPPER,
            Method::POST,
            "/api/v1/coupons/preview",
            Some(json!({ "code": "OLD" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["coupon"]["valid"], false);
    assert_eq!(body["data"]["coupon"]["reason"], "expired");
    assert_eq!(decimal_of(&body["data"]["summary"]["discount"]), dec!(0));
}

#[tokio::test]
async fn saved_shipping_address_is_used_by_checkout() {
    let app = TestApp::new().await;
    app.add_to_cart(SHOPPER, HEADPHONES, 1).await;

    let mut bad = shipping_address();
    bad["phone"] = json!("12");
    let (status, body) = app
        .as_user(SHOPPER, Method::PUT, "/api/v1/cart/shipping-address", Some(bad))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_SHIPPING");

    let (status, _) = app
        .as_user(
            SHOPPER,
            Method::PUT,
            "/api/v1/cart/shipping-address",
            Some(shipping_address()),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = app
        .as_user(
            SHOPPER,
            Method::POST,
            "/api/v1/checkout",
            Some(json!({ "gateway": "razorpay" })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");

    let order = app.order(order_id_of(&body)).await;
    assert_eq!(order.shipping_address["city"], "Bengaluru");
}

#[tokio::test]
async fn checkout_without_any_address_is_rejected() {
    let app = TestApp::new().await;
    app.add_to_cart(SHOPPER, HEADPHONES, 1).await;

    let (status, body) = app
        .as_user(
            SHOPPER,
            Method::POST,
            "/api/v1/checkout",
            Some(json!({ "gateway": "razorpay" })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_SHIPPING");
    assert_eq!(app.gateway.create_calls(), 0);
}
