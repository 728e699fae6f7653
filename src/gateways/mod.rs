//! Payment gateway capability and the adapters implementing it.
//!
//! The dispatcher and verifier only ever talk to [`PaymentGateway`]; each
//! supported processor is one adapter behind the closed [`GatewayKind`] set.

pub mod phonepe;
pub mod razorpay;

use async_trait::async_trait;
use axum::http::HeaderMap;
use bytes::Bytes;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{error, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerRegistry};
use crate::errors::ServiceError;
use crate::metrics;

pub use phonepe::PhonePeGateway;
pub use razorpay::RazorpayGateway;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    EnumIter,
    DeriveActiveEnum,
    ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
pub enum GatewayKind {
    /// Embedded checkout widget (cards, netbanking, UPI collect)
    #[sea_orm(string_value = "razorpay")]
    #[serde(rename = "razorpay")]
    Razorpay,
    /// Hosted redirect page (UPI intent, wallets)
    #[sea_orm(string_value = "phonepe")]
    #[serde(rename = "phonepe")]
    PhonePe,
}

impl GatewayKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Razorpay => "razorpay",
            Self::PhonePe => "phonepe",
        }
    }
}

impl fmt::Display for GatewayKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GatewayKind {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "razorpay" => Ok(Self::Razorpay),
            "phonepe" => Ok(Self::PhonePe),
            other => Err(ServiceError::ValidationError(format!(
                "unsupported payment gateway '{}'",
                other
            ))),
        }
    }
}

/// What a gateway needs to open a transaction for one order.
#[derive(Debug, Clone)]
pub struct TransactionRequest {
    /// Internal order id; doubles as the idempotency key sent to the gateway.
    pub reference: Uuid,
    pub order_number: String,
    pub amount: Decimal,
    pub currency: String,
    pub customer_id: String,
    pub customer_phone: Option<String>,
    /// Present when an earlier dispatch of the same order already got a
    /// gateway order id.
    pub existing_gateway_order_id: Option<String>,
    pub callback_url: String,
    pub return_url: String,
}

/// Opaque to the core: handed to the client as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InitiationHandle {
    Redirect {
        url: String,
    },
    EmbeddedSession {
        gateway_order_id: String,
        key_id: String,
        amount_minor: i64,
        currency: String,
        reference: String,
    },
    /// Zero-total order settled without contacting a gateway.
    NoPaymentRequired,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreatedTransaction {
    pub gateway_order_id: String,
    pub handle: InitiationHandle,
}

/// Raw callback as received over HTTP. Header names are lower-cased.
#[derive(Debug, Clone, Default)]
pub struct CallbackPayload {
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

impl CallbackPayload {
    pub fn new(headers: &HeaderMap, body: Bytes) -> Self {
        let headers = headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();
        Self { headers, body }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy)]
pub enum VerificationRequest<'a> {
    Callback(&'a CallbackPayload),
    Poll { gateway_order_id: &'a str, reference: Uuid },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionStatus {
    Succeeded {
        transaction_id: String,
        /// Signature or equivalent evidence kept on the order
        proof: String,
    },
    Failed {
        transaction_id: Option<String>,
        reason: String,
    },
    Pending,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedTransaction {
    pub gateway_order_id: String,
    pub status: TransactionStatus,
    /// Amount the gateway reports, when it reports one
    pub amount_minor: Option<i64>,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum GatewayError {
    /// Timeout, transport failure, 5xx, or an open circuit. Safe to retry.
    #[error("gateway unavailable: {0}")]
    Unavailable(String),
    /// The gateway refused the transaction itself.
    #[error("gateway rejected transaction: {0}")]
    Rejected(String),
    #[error("invalid signature: {0}")]
    InvalidSignature(String),
    #[error("malformed gateway payload: {0}")]
    Malformed(String),
}

impl GatewayError {
    fn trips_breaker(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl From<GatewayError> for ServiceError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Unavailable(msg) => ServiceError::GatewayUnavailable(msg),
            GatewayError::Rejected(msg) => ServiceError::GatewayRejected(msg),
            GatewayError::InvalidSignature(msg) => ServiceError::InvalidSignature(msg),
            GatewayError::Malformed(msg) => ServiceError::MalformedCallback(msg),
        }
    }
}

/// Two-method contract every gateway adapter implements.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn kind(&self) -> GatewayKind;

    /// Opens (or re-opens, for the same reference) a gateway transaction.
    async fn create_transaction(
        &self,
        request: &TransactionRequest,
    ) -> Result<CreatedTransaction, GatewayError>;

    /// Authenticates a callback or queries the gateway's status endpoint.
    async fn verify_transaction(
        &self,
        request: VerificationRequest<'_>,
    ) -> Result<VerifiedTransaction, GatewayError>;
}

/// Registered gateways, each call bounded by a timeout and a circuit breaker.
pub struct GatewayRegistry {
    gateways: HashMap<GatewayKind, Arc<dyn PaymentGateway>>,
    breakers: CircuitBreakerRegistry,
    timeout: Duration,
}

impl GatewayRegistry {
    pub fn new(timeout: Duration, breaker_config: CircuitBreakerConfig) -> Self {
        Self {
            gateways: HashMap::new(),
            breakers: CircuitBreakerRegistry::new(breaker_config),
            timeout,
        }
    }

    pub fn register(mut self, gateway: Arc<dyn PaymentGateway>) -> Self {
        self.gateways.insert(gateway.kind(), gateway);
        self
    }

    pub fn from_config(cfg: &crate::config::AppConfig) -> Result<Self, GatewayError> {
        let mut registry = Self::new(
            cfg.gateway_timeout(),
            CircuitBreakerConfig {
                failure_threshold: cfg.circuit_breaker_failure_threshold,
                timeout: Duration::from_secs(cfg.circuit_breaker_timeout_secs),
                success_threshold: 1,
            },
        );
        if let Some(razorpay) = &cfg.razorpay {
            registry = registry.register(Arc::new(RazorpayGateway::new(
                razorpay.clone(),
                cfg.gateway_timeout(),
            )?));
        }
        if let Some(phonepe) = &cfg.phonepe {
            registry = registry.register(Arc::new(PhonePeGateway::new(
                phonepe.clone(),
                cfg.gateway_timeout(),
            )?));
        }
        if registry.gateways.is_empty() {
            warn!("no payment gateways configured; checkout will reject every gateway choice");
        }
        Ok(registry)
    }

    pub fn supports(&self, kind: GatewayKind) -> bool {
        self.gateways.contains_key(&kind)
    }

    pub fn kinds(&self) -> Vec<GatewayKind> {
        let mut kinds: Vec<_> = self.gateways.keys().copied().collect();
        kinds.sort_by_key(|k| k.as_str());
        kinds
    }

    fn gateway(&self, kind: GatewayKind) -> Result<Arc<dyn PaymentGateway>, ServiceError> {
        self.gateways.get(&kind).cloned().ok_or_else(|| {
            ServiceError::ValidationError(format!("payment gateway '{}' is not enabled", kind))
        })
    }

    pub async fn create_transaction(
        &self,
        kind: GatewayKind,
        request: &TransactionRequest,
    ) -> Result<CreatedTransaction, ServiceError> {
        let gateway = self.gateway(kind)?;
        self.guarded(kind, || async move { gateway.create_transaction(request).await })
            .await
            .map_err(ServiceError::from)
    }

    /// Callback signatures are checked locally; polls go over the network.
    pub async fn verify_transaction(
        &self,
        kind: GatewayKind,
        request: VerificationRequest<'_>,
    ) -> Result<VerifiedTransaction, GatewayError> {
        let gateway = self.gateway(kind).map_err(|e| GatewayError::Malformed(e.to_string()))?;
        match request {
            VerificationRequest::Callback(_) => gateway.verify_transaction(request).await,
            VerificationRequest::Poll { .. } => {
                self.guarded(kind, || async move { gateway.verify_transaction(request).await })
                    .await
            }
        }
    }

    async fn guarded<F, Fut, R>(&self, kind: GatewayKind, f: F) -> Result<R, GatewayError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<R, GatewayError>>,
    {
        let breaker = self.breakers.get(kind.as_str());
        let timeout = self.timeout;
        let started = Instant::now();

        let result = breaker
            .call(GatewayError::trips_breaker, || async move {
                match tokio::time::timeout(timeout, f()).await {
                    Ok(result) => result,
                    Err(_) => Err(GatewayError::Unavailable(format!(
                        "no response within {:?}",
                        timeout
                    ))),
                }
            })
            .await;
        metrics::observe_duration(metrics::GATEWAY_CALL_SECONDS, started.elapsed());

        match result {
            Ok(value) => Ok(value),
            Err(CircuitBreakerError::CircuitOpen) => {
                error!(gateway = %kind, "circuit open; skipping gateway call");
                Err(GatewayError::Unavailable(format!(
                    "{} is temporarily unavailable",
                    kind
                )))
            }
            Err(CircuitBreakerError::Inner(err)) => Err(err),
        }
    }
}

/// Converts a major-unit amount to integer minor units (paise, cents).
pub fn to_minor_units(amount: Decimal) -> Result<i64, GatewayError> {
    if amount <= Decimal::ZERO {
        return Err(GatewayError::Rejected(format!(
            "amount must be positive, got {}",
            amount
        )));
    }
    (amount.round_dp(2) * Decimal::ONE_HUNDRED)
        .to_i64()
        .ok_or_else(|| GatewayError::Rejected(format!("amount {} out of range", amount)))
}

/// Maps a non-success HTTP status from a gateway API.
pub(crate) fn classify_http_failure(status: reqwest::StatusCode, body: &str) -> GatewayError {
    let detail = format!("HTTP {}: {}", status.as_u16(), truncate(body, 300));
    if status.is_server_error()
        || status == reqwest::StatusCode::TOO_MANY_REQUESTS
        || status == reqwest::StatusCode::UNAUTHORIZED
        || status == reqwest::StatusCode::FORBIDDEN
        || status == reqwest::StatusCode::REQUEST_TIMEOUT
    {
        GatewayError::Unavailable(detail)
    } else {
        GatewayError::Rejected(detail)
    }
}

pub(crate) fn transport_error(err: reqwest::Error) -> GatewayError {
    GatewayError::Unavailable(err.to_string())
}

pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
