#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{Method, Request, StatusCode},
    Router,
};
use chrono::{Duration as ChronoDuration, Utc};
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha256;
use storefront_api::{
    auth::{AuthConfig, AuthService, ADMIN_ROLE},
    circuit_breaker::CircuitBreakerConfig,
    config::AppConfig,
    db,
    entities::coupon::{self, DiscountType},
    events::{self, EventSender},
    gateways::{
        constant_time_eq, CreatedTransaction, GatewayError, GatewayKind, GatewayRegistry,
        InitiationHandle, PaymentGateway, TransactionRequest, TransactionStatus,
        VerificationRequest, VerifiedTransaction,
    },
    handlers::AppServices,
    services::{coupons::NewCoupon, CatalogProduct, InMemoryCatalog},
    AppState,
};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tower::ServiceExt;
use uuid::Uuid;

pub const SHOPPER: &str = "shopper-1";
pub const OTHER_SHOPPER: &str = "shopper-2";
pub const ADMIN: &str = "admin-1";
pub const STUB_SECRET: &str = "stub-callback-secret";
pub const SIGNATURE_HEADER: &str = "x-stub-signature";

/// ₹500 product
pub const HEADPHONES: Uuid = Uuid::from_u128(0x5000);
/// ₹300 product
pub const CABLE: Uuid = Uuid::from_u128(0x3000);

type HmacSha256 = Hmac<Sha256>;

pub fn stub_signature(body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(STUB_SECRET.as_bytes()).expect("hmac key");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

#[derive(Default)]
struct StubState {
    /// reference -> gateway order id; one entry per external transaction
    transactions: HashMap<Uuid, String>,
    create_calls: usize,
    lose_responses: usize,
    reject_next: Option<String>,
    malformed_next: bool,
    poll_script: VecDeque<Result<TransactionStatus, GatewayError>>,
    poll_calls: usize,
}

#[derive(Deserialize)]
struct StubCallback {
    gateway_order_id: String,
    status: String,
    #[serde(default)]
    transaction_id: Option<String>,
    #[serde(default)]
    amount_minor: Option<i64>,
}

/// In-process gateway registered as Razorpay. Deduplicates by reference like
/// the real gateways do and signs callbacks with [`STUB_SECRET`].
#[derive(Default)]
pub struct StubGateway {
    state: Mutex<StubState>,
}

impl StubGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The next `n` creates reach the gateway but the response is lost.
    pub fn lose_next_responses(&self, n: usize) {
        self.state.lock().unwrap().lose_responses = n;
    }

    pub fn reject_next(&self, reason: &str) {
        self.state.lock().unwrap().reject_next = Some(reason.to_string());
    }

    /// The next create reaches the gateway but the reply cannot be parsed.
    pub fn garble_next_response(&self) {
        self.state.lock().unwrap().malformed_next = true;
    }

    pub fn script_polls(&self, answers: Vec<Result<TransactionStatus, GatewayError>>) {
        self.state.lock().unwrap().poll_script = answers.into();
    }

    pub fn external_transactions(&self) -> usize {
        self.state.lock().unwrap().transactions.len()
    }

    pub fn create_calls(&self) -> usize {
        self.state.lock().unwrap().create_calls
    }

    pub fn poll_calls(&self) -> usize {
        self.state.lock().unwrap().poll_calls
    }
}

#[async_trait]
impl PaymentGateway for StubGateway {
    fn kind(&self) -> GatewayKind {
        GatewayKind::Razorpay
    }

    async fn create_transaction(
        &self,
        request: &TransactionRequest,
    ) -> Result<CreatedTransaction, GatewayError> {
        let mut state = self.state.lock().unwrap();
        state.create_calls += 1;

        if let Some(reason) = state.reject_next.take() {
            return Err(GatewayError::Rejected(reason));
        }

        let gateway_order_id = state
            .transactions
            .entry(request.reference)
            .or_insert_with(|| format!("stub_order_{}", request.reference.simple()))
            .clone();

        if std::mem::take(&mut state.malformed_next) {
            return Err(GatewayError::Malformed("expected value at line 1 column 1".to_string()));
        }

        if state.lose_responses > 0 {
            state.lose_responses -= 1;
            return Err(GatewayError::Unavailable("response lost".to_string()));
        }

        Ok(CreatedTransaction {
            handle: InitiationHandle::Redirect {
                url: format!("https://stub.test/pay/{}", gateway_order_id),
            },
            gateway_order_id,
        })
    }

    async fn verify_transaction(
        &self,
        request: VerificationRequest<'_>,
    ) -> Result<VerifiedTransaction, GatewayError> {
        match request {
            VerificationRequest::Callback(payload) => {
                let signature = payload
                    .header(SIGNATURE_HEADER)
                    .ok_or_else(|| GatewayError::InvalidSignature("missing signature".into()))?;
                let expected = stub_signature(&payload.body);
                if !constant_time_eq(signature.as_bytes(), expected.as_bytes()) {
                    return Err(GatewayError::InvalidSignature("signature mismatch".into()));
                }

                let callback: StubCallback = serde_json::from_slice(&payload.body)
                    .map_err(|e| GatewayError::Malformed(e.to_string()))?;
                let status = match callback.status.as_str() {
                    "paid" => TransactionStatus::Succeeded {
                        transaction_id: callback
                            .transaction_id
                            .unwrap_or_else(|| "stub_txn".to_string()),
                        proof: signature.to_string(),
                    },
                    "failed" => TransactionStatus::Failed {
                        transaction_id: callback.transaction_id,
                        reason: "declined by stub".to_string(),
                    },
                    _ => TransactionStatus::Pending,
                };
                Ok(VerifiedTransaction {
                    gateway_order_id: callback.gateway_order_id,
                    status,
                    amount_minor: callback.amount_minor,
                })
            }
            VerificationRequest::Poll {
                gateway_order_id, ..
            } => {
                let mut state = self.state.lock().unwrap();
                state.poll_calls += 1;
                let status = state
                    .poll_script
                    .pop_front()
                    .unwrap_or(Ok(TransactionStatus::Pending))?;
                Ok(VerifiedTransaction {
                    gateway_order_id: gateway_order_id.to_string(),
                    status,
                    amount_minor: None,
                })
            }
        }
    }
}

pub fn test_config() -> AppConfig {
    let mut cfg = AppConfig::new(
        "sqlite::memory:".to_string(),
        "test_secret_key_for_testing_purposes_only_32chars".to_string(),
        "127.0.0.1".to_string(),
        18_080,
        "test".to_string(),
    );
    cfg.db_max_connections = 1;
    cfg.db_min_connections = 1;
    cfg.verify_poll_attempts = 3;
    cfg.verify_poll_interval_ms = 5;
    cfg
}

/// Pooled, file-backed SQLite so concurrent requests hold separate
/// connections. The directory lives as long as the returned guard.
pub fn pooled_test_config(max_connections: u32) -> (AppConfig, TempDir) {
    let dir = TempDir::new().expect("create test database dir");
    let mut cfg = test_config();
    cfg.database_url = format!("sqlite://{}?mode=rwc", dir.path().join("storefront.db").display());
    cfg.db_max_connections = max_connections;
    (cfg, dir)
}

/// Helper harness for spinning up an application backed by a SQLite database,
/// in memory unless built with [`TestApp::pooled`].
pub struct TestApp {
    router: Router,
    pub state: AppState,
    pub gateway: Arc<StubGateway>,
    pub catalog: Arc<InMemoryCatalog>,
    auth_service: Arc<AuthService>,
    _event_task: tokio::task::JoinHandle<()>,
    _db_dir: Option<TempDir>,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_config(test_config()).await
    }

    pub async fn pooled(max_connections: u32) -> Self {
        let (cfg, dir) = pooled_test_config(max_connections);
        let mut app = Self::with_config(cfg).await;
        app._db_dir = Some(dir);
        app
    }

    pub async fn with_config(cfg: AppConfig) -> Self {
        let pool = db::establish_connection_from_app_config(&cfg)
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");

        let db_arc = Arc::new(pool);
        let cfg = Arc::new(cfg);
        let (event_tx, event_rx) = mpsc::channel(256);
        let event_sender = Arc::new(EventSender::new(event_tx));
        let event_task = tokio::spawn(events::process_events(event_rx));

        let catalog = Arc::new(InMemoryCatalog::with_products([
            CatalogProduct {
                id: HEADPHONES,
                name: "Headphones".to_string(),
                price: dec!(500),
                active: true,
            },
            CatalogProduct {
                id: CABLE,
                name: "Cable".to_string(),
                price: dec!(300),
                active: true,
            },
        ]));

        let gateway = StubGateway::new();
        let gateways = Arc::new(
            GatewayRegistry::new(cfg.gateway_timeout(), CircuitBreakerConfig::default())
                .register(gateway.clone()),
        );

        let services = AppServices::new(
            db_arc.clone(),
            cfg.clone(),
            event_sender.clone(),
            catalog.clone(),
            gateways,
        );

        let state = AppState {
            db: db_arc,
            config: cfg.clone(),
            event_sender,
            services,
        };

        let auth_service = Arc::new(AuthService::new(AuthConfig::from(cfg.as_ref())));
        let router = storefront_api::app_router(state.clone(), auth_service.clone());

        Self {
            router,
            state,
            gateway,
            catalog,
            auth_service,
            _event_task: event_task,
            _db_dir: None,
        }
    }

    pub fn token(&self, user_id: &str) -> String {
        let roles: &[&str] = if user_id == ADMIN { &[ADMIN_ROLE] } else { &[] };
        self.auth_service
            .issue_token(user_id, roles)
            .expect("issue test token")
    }

    /// Sends a request and returns the status with the parsed JSON body
    /// (`Value::Null` for an empty body).
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        user: Option<&str>,
        headers: &[(&str, &str)],
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(user) = user {
            builder = builder.header("authorization", format!("Bearer {}", self.token(user)));
        }
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let body = match body {
            Some(json) => {
                builder = builder.header("content-type", "application/json");
                Body::from(serde_json::to_vec(&json).expect("serialize request body"))
            }
            None => Body::empty(),
        };

        let response = self
            .router
            .clone()
            .oneshot(builder.body(body).expect("build request"))
            .await
            .expect("router error during test request");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("response body bytes");
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, json)
    }

    pub async fn as_user(
        &self,
        user: &str,
        method: Method,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        self.request(method, uri, body, Some(user), &[]).await
    }

    pub async fn add_to_cart(&self, user: &str, product_id: Uuid, quantity: i32) -> Value {
        let (status, body) = self
            .as_user(
                user,
                Method::POST,
                "/api/v1/cart/items",
                Some(json!({ "product_id": product_id, "quantity": quantity })),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "add to cart failed: {body}");
        body
    }

    pub async fn checkout(
        &self,
        user: &str,
        coupon: Option<&str>,
        idempotency_key: Option<Uuid>,
    ) -> (StatusCode, Value) {
        let key = idempotency_key.map(|k| k.to_string());
        let mut headers = Vec::new();
        if let Some(key) = key.as_deref() {
            headers.push(("idempotency-key", key));
        }
        self.request(
            Method::POST,
            "/api/v1/checkout",
            Some(json!({
                "shipping_address": shipping_address(),
                "coupon_code": coupon,
                "gateway": "razorpay",
            })),
            Some(user),
            &headers,
        )
        .await
    }

    /// Posts a stub-signed callback for `gateway_order_id`.
    pub async fn callback(&self, payload: Value) -> (StatusCode, Value) {
        let body = serde_json::to_vec(&payload).expect("serialize callback");
        let signature = stub_signature(&body);
        self.raw_callback(body, &signature).await
    }

    pub async fn raw_callback(&self, body: Vec<u8>, signature: &str) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(Method::POST)
            .uri("/api/v1/payments/callback/razorpay")
            .header("content-type", "application/json")
            .header(SIGNATURE_HEADER, signature)
            .body(Body::from(body))
            .expect("build callback request");
        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during callback");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("callback body");
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    pub async fn seed_coupon(
        &self,
        code: &str,
        discount_type: DiscountType,
        value: Decimal,
        usage_limit: i32,
    ) -> coupon::Model {
        let now = Utc::now();
        self.state
            .services
            .coupons
            .create(NewCoupon {
                code: code.to_string(),
                discount_type,
                value,
                valid_from: now - ChronoDuration::days(1),
                valid_until: now + ChronoDuration::days(30),
                usage_limit,
            })
            .await
            .expect("seed coupon")
    }

    pub async fn coupon_used_count(&self, code: &str) -> i32 {
        self.state
            .services
            .coupons
            .find(code)
            .await
            .expect("coupon lookup")
            .expect("coupon exists")
            .used_count
    }

    pub async fn order(&self, order_id: Uuid) -> storefront_api::entities::order::Model {
        self.state
            .services
            .orders
            .get(order_id)
            .await
            .expect("order exists")
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self._event_task.abort();
    }
}

pub fn shipping_address() -> Value {
    json!({
        "full_name": "Asha Rao",
        "phone": "9876543210",
        "email": "asha@example.com",
        "address_line1": "12 MG Road",
        "city": "Bengaluru",
        "state": "Karnataka",
        "postal_code": "560001",
        "country": "IN"
    })
}

pub fn order_id_of(body: &Value) -> Uuid {
    body["data"]["order_id"]
        .as_str()
        .and_then(|s| Uuid::parse_str(s).ok())
        .expect("order_id in checkout response")
}

pub fn decimal_of(value: &Value) -> Decimal {
    match value {
        Value::String(s) => s.parse().expect("decimal string"),
        Value::Number(n) => n.to_string().parse().expect("decimal number"),
        other => panic!("not a decimal: {other}"),
    }
}
