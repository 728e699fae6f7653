use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::Bytes;
use rust_decimal_macros::dec;
use serde_json::json;
use storefront_api::{
    circuit_breaker::CircuitBreakerConfig,
    config::{PhonePeConfig, RazorpayConfig},
    gateways::{
        phonepe, razorpay, CallbackPayload, GatewayError, GatewayKind, GatewayRegistry,
        InitiationHandle, PaymentGateway, PhonePeGateway, RazorpayGateway, TransactionRequest,
        TransactionStatus, VerificationRequest,
    },
};
use uuid::Uuid;
use wiremock::{
    matchers::{body_partial_json, header_exists, method, path},
    Mock, MockServer, ResponseTemplate,
};

const KEY_SECRET: &str = "rzp_test_secret";
const SALT: &str = "phonepe-salt";
const MERCHANT: &str = "MERCHANTUAT";

fn razorpay_gateway(server: &MockServer) -> RazorpayGateway {
    RazorpayGateway::new(
        RazorpayConfig {
            key_id: "rzp_test_key".into(),
            key_secret: KEY_SECRET.into(),
            base_url: server.uri(),
        },
        Duration::from_secs(5),
    )
    .unwrap()
}

fn phonepe_gateway(server: &MockServer) -> PhonePeGateway {
    PhonePeGateway::new(
        PhonePeConfig {
            merchant_id: MERCHANT.into(),
            salt_key: SALT.into(),
            salt_index: 1,
            base_url: server.uri(),
        },
        Duration::from_secs(5),
    )
    .unwrap()
}

fn transaction(existing: Option<&str>) -> TransactionRequest {
    TransactionRequest {
        reference: Uuid::from_u128(0xabc),
        order_number: "ORD-000042".into(),
        amount: dec!(1100),
        currency: "INR".into(),
        customer_id: "shopper-1".into(),
        customer_phone: Some("9876543210".into()),
        existing_gateway_order_id: existing.map(str::to_string),
        callback_url: "https://shop.test/api/v1/payments/callback/phonepe".into(),
        return_url: "https://shop.test/orders".into(),
    }
}

fn poll(gateway_order_id: &str) -> VerificationRequest<'_> {
    VerificationRequest::Poll {
        gateway_order_id,
        reference: Uuid::from_u128(0xabc),
    }
}

#[tokio::test]
async fn razorpay_creates_an_embedded_session() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/orders"))
        .and(header_exists("authorization"))
        .and(body_partial_json(json!({ "amount": 110000, "currency": "INR" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "order_rzp_1",
            "amount": 110000,
            "currency": "INR",
            "status": "created",
        })))
        .expect(1)
        .mount(&server)
        .await;

    let created = razorpay_gateway(&server)
        .create_transaction(&transaction(None))
        .await
        .unwrap();

    assert_eq!(created.gateway_order_id, "order_rzp_1");
    assert_matches!(
        created.handle,
        InitiationHandle::EmbeddedSession { ref key_id, amount_minor: 110000, ref reference, .. }
            if key_id == "rzp_test_key" && reference == "ORD-000042"
    );
}

#[tokio::test]
async fn razorpay_reuses_an_existing_gateway_order() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/orders"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let created = razorpay_gateway(&server)
        .create_transaction(&transaction(Some("order_rzp_1")))
        .await
        .unwrap();
    assert_eq!(created.gateway_order_id, "order_rzp_1");
}

#[tokio::test]
async fn razorpay_http_failures_are_classified() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/orders"))
        .respond_with(ResponseTemplate::new(503).set_body_string("upstream down"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/orders"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": { "code": "BAD_REQUEST_ERROR", "description": "amount exceeds limit" }
        })))
        .mount(&server)
        .await;

    let gateway = razorpay_gateway(&server);
    assert_matches!(
        gateway.create_transaction(&transaction(None)).await,
        Err(GatewayError::Unavailable(_))
    );
    assert_matches!(
        gateway.create_transaction(&transaction(None)).await,
        Err(GatewayError::Rejected(msg)) if msg.contains("amount exceeds limit")
    );
}

#[tokio::test]
async fn razorpay_poll_reports_captured_payment() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/orders/order_rzp_1/payments"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "entity": "collection",
            "count": 2,
            "items": [
                { "id": "pay_a", "status": "failed", "amount": 110000, "error_description": "declined" },
                { "id": "pay_b", "status": "captured", "amount": 110000 },
            ],
        })))
        .mount(&server)
        .await;

    let verified = razorpay_gateway(&server)
        .verify_transaction(poll("order_rzp_1"))
        .await
        .unwrap();

    assert_eq!(verified.amount_minor, Some(110000));
    assert_matches!(
        verified.status,
        TransactionStatus::Succeeded { ref transaction_id, .. } if transaction_id == "pay_b"
    );
}

#[tokio::test]
async fn razorpay_poll_with_no_payments_is_pending() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/orders/order_rzp_1/payments"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "items": [] })))
        .mount(&server)
        .await;

    let verified = razorpay_gateway(&server)
        .verify_transaction(poll("order_rzp_1"))
        .await
        .unwrap();
    assert_eq!(verified.status, TransactionStatus::Pending);
}

#[tokio::test]
async fn razorpay_callback_signature_is_checked_locally() {
    let server = MockServer::start().await;
    let gateway = razorpay_gateway(&server);

    let good = CallbackPayload {
        headers: Default::default(),
        body: Bytes::from(
            json!({
                "razorpay_order_id": "order_rzp_1",
                "razorpay_payment_id": "pay_b",
                "razorpay_signature": razorpay::sign(KEY_SECRET, "order_rzp_1", "pay_b"),
            })
            .to_string(),
        ),
    };
    let verified = gateway
        .verify_transaction(VerificationRequest::Callback(&good))
        .await
        .unwrap();
    assert_eq!(verified.gateway_order_id, "order_rzp_1");

    let forged = CallbackPayload {
        headers: Default::default(),
        body: Bytes::from(
            json!({
                "razorpay_order_id": "order_rzp_1",
                "razorpay_payment_id": "pay_b",
                "razorpay_signature": razorpay::sign("wrong-secret", "order_rzp_1", "pay_b"),
            })
            .to_string(),
        ),
    };
    assert_matches!(
        gateway.verify_transaction(VerificationRequest::Callback(&forged)).await,
        Err(GatewayError::InvalidSignature(_))
    );

    // no network traffic for callbacks
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn phonepe_creates_a_redirect() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/pg/v1/pay"))
        .and(header_exists("x-verify"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "code": "PAYMENT_INITIATED",
            "message": "Payment initiated",
            "data": {
                "merchantId": MERCHANT,
                "merchantTransactionId": "000000000000000000000000000abc",
                "instrumentResponse": {
                    "type": "PAY_PAGE",
                    "redirectInfo": { "url": "https://pay.phonepe.test/abc", "method": "GET" }
                }
            }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let created = phonepe_gateway(&server)
        .create_transaction(&transaction(None))
        .await
        .unwrap();

    assert_eq!(created.gateway_order_id, "000000000000000000000000000abc");
    assert_eq!(
        created.handle,
        InitiationHandle::Redirect {
            url: "https://pay.phonepe.test/abc".into()
        }
    );

    // envelope is base64 JSON carrying the amount in paise
    let requests = server.received_requests().await.unwrap();
    let sent: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    let decoded = BASE64.decode(sent["request"].as_str().unwrap()).unwrap();
    let payload: serde_json::Value = serde_json::from_slice(&decoded).unwrap();
    assert_eq!(payload["amount"], 110000);
    assert_eq!(payload["merchantUserId"], "shopper1");
    assert_eq!(payload["mobileNumber"], "9876543210");
}

#[tokio::test]
async fn phonepe_unsuccessful_envelopes_are_classified() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/pg/v1/pay"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": false,
            "code": "INTERNAL_SERVER_ERROR",
            "message": "try again",
        })))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/pg/v1/pay"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": false,
            "code": "BAD_REQUEST",
            "message": "invalid mobile number",
        })))
        .mount(&server)
        .await;

    let gateway = phonepe_gateway(&server);
    assert_matches!(
        gateway.create_transaction(&transaction(None)).await,
        Err(GatewayError::Unavailable(_))
    );
    assert_matches!(
        gateway.create_transaction(&transaction(None)).await,
        Err(GatewayError::Rejected(msg)) if msg.starts_with("BAD_REQUEST")
    );
}

#[tokio::test]
async fn phonepe_status_codes_map_to_outcomes() {
    let server = MockServer::start().await;
    for (mtid, code) in [
        ("mt_paid", "PAYMENT_SUCCESS"),
        ("mt_declined", "PAYMENT_DECLINED"),
        ("mt_pending", "PAYMENT_PENDING"),
    ] {
        Mock::given(method("GET"))
            .and(path(format!("/pg/v1/status/{}/{}", MERCHANT, mtid)))
            .and(header_exists("x-verify"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": code == "PAYMENT_SUCCESS",
                "code": code,
                "message": code.to_lowercase(),
                "data": {
                    "merchantTransactionId": mtid,
                    "transactionId": format!("T-{}", mtid),
                    "amount": 110000,
                    "state": code,
                }
            })))
            .mount(&server)
            .await;
    }

    let gateway = phonepe_gateway(&server);

    let paid = gateway.verify_transaction(poll("mt_paid")).await.unwrap();
    assert_eq!(paid.amount_minor, Some(110000));
    assert_matches!(
        paid.status,
        TransactionStatus::Succeeded { ref transaction_id, .. } if transaction_id == "T-mt_paid"
    );

    let declined = gateway.verify_transaction(poll("mt_declined")).await.unwrap();
    assert_matches!(declined.status, TransactionStatus::Failed { .. });

    let pending = gateway.verify_transaction(poll("mt_pending")).await.unwrap();
    assert_eq!(pending.status, TransactionStatus::Pending);
}

#[tokio::test]
async fn phonepe_callback_checksum_is_verified() {
    let server = MockServer::start().await;
    let gateway = phonepe_gateway(&server);

    let response = BASE64.encode(
        json!({
            "success": true,
            "code": "PAYMENT_SUCCESS",
            "data": phonepe::TransactionData {
                merchant_transaction_id: "mt_paid".into(),
                transaction_id: Some("T-1".into()),
                amount: Some(110000),
                state: Some("COMPLETED".into()),
            },
        })
        .to_string(),
    );
    let body = Bytes::from(json!({ "response": response }).to_string());

    let signed = CallbackPayload {
        headers: [("x-verify".to_string(), phonepe::checksum(SALT, 1, &response))].into(),
        body: body.clone(),
    };
    let verified = gateway
        .verify_transaction(VerificationRequest::Callback(&signed))
        .await
        .unwrap();
    assert_eq!(verified.gateway_order_id, "mt_paid");
    assert_eq!(verified.amount_minor, Some(110000));

    let unsigned = CallbackPayload {
        headers: Default::default(),
        body: body.clone(),
    };
    assert_matches!(
        gateway.verify_transaction(VerificationRequest::Callback(&unsigned)).await,
        Err(GatewayError::InvalidSignature(_))
    );

    let wrong_salt = CallbackPayload {
        headers: [("x-verify".to_string(), phonepe::checksum("other", 1, &response))].into(),
        body,
    };
    assert_matches!(
        gateway.verify_transaction(VerificationRequest::Callback(&wrong_salt)).await,
        Err(GatewayError::InvalidSignature(_))
    );
}

#[tokio::test]
async fn registry_opens_the_circuit_after_repeated_outages() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/orders/order_rzp_1/payments"))
        .respond_with(ResponseTemplate::new(502))
        .expect(2)
        .mount(&server)
        .await;

    let registry = GatewayRegistry::new(
        Duration::from_secs(5),
        CircuitBreakerConfig {
            failure_threshold: 2,
            timeout: Duration::from_secs(60),
            success_threshold: 1,
        },
    )
    .register(Arc::new(razorpay_gateway(&server)));

    for _ in 0..3 {
        assert_matches!(
            registry
                .verify_transaction(GatewayKind::Razorpay, poll("order_rzp_1"))
                .await,
            Err(GatewayError::Unavailable(_))
        );
    }
    // third call short-circuits; `expect(2)` is checked on drop
}

#[tokio::test]
async fn registry_bounds_slow_gateways_with_its_timeout() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/orders/order_rzp_1/payments"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "items": [] }))
                .set_delay(Duration::from_secs(2)),
        )
        .mount(&server)
        .await;

    let registry = GatewayRegistry::new(Duration::from_millis(100), CircuitBreakerConfig::default())
        .register(Arc::new(razorpay_gateway(&server)));

    assert_matches!(
        registry
            .verify_transaction(GatewayKind::Razorpay, poll("order_rzp_1"))
            .await,
        Err(GatewayError::Unavailable(msg)) if msg.contains("no response")
    );
}

#[tokio::test]
async fn registry_rejects_gateways_that_are_not_enabled() {
    let registry = GatewayRegistry::new(Duration::from_secs(1), CircuitBreakerConfig::default());
    assert!(!registry.supports(GatewayKind::PhonePe));
    assert!(registry
        .create_transaction(GatewayKind::PhonePe, &transaction(None))
        .await
        .is_err());
}
