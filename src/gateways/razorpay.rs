//! Embedded checkout-widget gateway.
//!
//! The server creates a gateway order, the client opens the widget with the
//! returned session, and the widget hands back
//! `razorpay_order_id|razorpay_payment_id` signed with the key secret.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;
use std::time::Duration;
use tracing::{debug, instrument};

use super::{
    classify_http_failure, to_minor_units, transport_error, CallbackPayload, CreatedTransaction,
    GatewayError, GatewayKind, InitiationHandle, PaymentGateway, TransactionRequest,
    TransactionStatus, VerificationRequest, VerifiedTransaction,
};
use crate::config::RazorpayConfig;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Deserialize)]
struct RazorpayOrder {
    id: String,
    amount: i64,
    currency: String,
}

#[derive(Debug, Deserialize)]
struct RazorpayPayment {
    id: String,
    status: String,
    #[serde(default)]
    amount: Option<i64>,
    #[serde(default)]
    error_description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PaymentCollection {
    #[serde(default)]
    items: Vec<RazorpayPayment>,
}

#[derive(Debug, Deserialize)]
struct SignedCallback {
    razorpay_order_id: String,
    razorpay_payment_id: String,
    razorpay_signature: String,
}

pub struct RazorpayGateway {
    client: reqwest::Client,
    config: RazorpayConfig,
}

impl RazorpayGateway {
    pub fn new(config: RazorpayConfig, timeout: Duration) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Unavailable(format!("http client: {}", e)))?;
        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    /// Hex HMAC-SHA256 of `order_id|payment_id` under the key secret.
    pub fn sign(&self, gateway_order_id: &str, payment_id: &str) -> String {
        sign(&self.config.key_secret, gateway_order_id, payment_id)
    }

    fn session(
        &self,
        gateway_order_id: String,
        amount_minor: i64,
        currency: String,
        request: &TransactionRequest,
    ) -> CreatedTransaction {
        CreatedTransaction {
            gateway_order_id: gateway_order_id.clone(),
            handle: InitiationHandle::EmbeddedSession {
                gateway_order_id,
                key_id: self.config.key_id.clone(),
                amount_minor,
                currency,
                reference: request.order_number.clone(),
            },
        }
    }

    fn verify_callback(&self, payload: &CallbackPayload) -> Result<VerifiedTransaction, GatewayError> {
        let callback = parse_callback(&payload.body)?;

        let signature = hex::decode(callback.razorpay_signature.trim())
            .map_err(|_| GatewayError::InvalidSignature("signature is not hex".into()))?;
        let mut mac = HmacSha256::new_from_slice(self.config.key_secret.as_bytes())
            .map_err(|e| GatewayError::InvalidSignature(e.to_string()))?;
        mac.update(
            format!(
                "{}|{}",
                callback.razorpay_order_id, callback.razorpay_payment_id
            )
            .as_bytes(),
        );
        mac.verify_slice(&signature)
            .map_err(|_| GatewayError::InvalidSignature("signature mismatch".into()))?;

        Ok(VerifiedTransaction {
            gateway_order_id: callback.razorpay_order_id,
            status: TransactionStatus::Succeeded {
                transaction_id: callback.razorpay_payment_id,
                proof: callback.razorpay_signature,
            },
            amount_minor: None,
        })
    }

    async fn poll(&self, gateway_order_id: &str) -> Result<VerifiedTransaction, GatewayError> {
        let response = self
            .client
            .get(self.url(&format!("/v1/orders/{}/payments", gateway_order_id)))
            .basic_auth(&self.config.key_id, Some(&self.config.key_secret))
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        let body = response.text().await.map_err(transport_error)?;
        if !status.is_success() {
            return Err(classify_http_failure(status, &body));
        }
        let payments: PaymentCollection = serde_json::from_str(&body)
            .map_err(|e| GatewayError::Malformed(format!("payments response: {}", e)))?;

        Ok(VerifiedTransaction {
            gateway_order_id: gateway_order_id.to_string(),
            status: status_from_payments(&payments.items),
            amount_minor: payments
                .items
                .iter()
                .find(|p| p.status == "captured")
                .and_then(|p| p.amount),
        })
    }
}

pub fn sign(key_secret: &str, gateway_order_id: &str, payment_id: &str) -> String {
    // HMAC accepts keys of any length
    let mut mac = match HmacSha256::new_from_slice(key_secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(format!("{}|{}", gateway_order_id, payment_id).as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// The widget posts JSON; the redirect flow posts a form.
fn parse_callback(body: &[u8]) -> Result<SignedCallback, GatewayError> {
    if let Ok(callback) = serde_json::from_slice::<SignedCallback>(body) {
        return Ok(callback);
    }

    let mut order_id = None;
    let mut payment_id = None;
    let mut signature = None;
    for (key, value) in url::form_urlencoded::parse(body) {
        match key.as_ref() {
            "razorpay_order_id" => order_id = Some(value.into_owned()),
            "razorpay_payment_id" => payment_id = Some(value.into_owned()),
            "razorpay_signature" => signature = Some(value.into_owned()),
            _ => {}
        }
    }
    match (order_id, payment_id, signature) {
        (Some(razorpay_order_id), Some(razorpay_payment_id), Some(razorpay_signature)) => {
            Ok(SignedCallback {
                razorpay_order_id,
                razorpay_payment_id,
                razorpay_signature,
            })
        }
        _ => Err(GatewayError::Malformed(
            "expected razorpay_order_id, razorpay_payment_id and razorpay_signature".into(),
        )),
    }
}

fn status_from_payments(payments: &[RazorpayPayment]) -> TransactionStatus {
    if let Some(captured) = payments.iter().find(|p| p.status == "captured") {
        return TransactionStatus::Succeeded {
            transaction_id: captured.id.clone(),
            proof: format!("status:{}", captured.status),
        };
    }
    // authorized or created payments may still capture
    if !payments.is_empty() && payments.iter().all(|p| p.status == "failed") {
        let last = payments.last();
        return TransactionStatus::Failed {
            transaction_id: last.map(|p| p.id.clone()),
            reason: last
                .and_then(|p| p.error_description.clone())
                .unwrap_or_else(|| "payment failed".to_string()),
        };
    }
    TransactionStatus::Pending
}

#[async_trait]
impl PaymentGateway for RazorpayGateway {
    fn kind(&self) -> GatewayKind {
        GatewayKind::Razorpay
    }

    #[instrument(skip(self, request), fields(order_id = %request.reference))]
    async fn create_transaction(
        &self,
        request: &TransactionRequest,
    ) -> Result<CreatedTransaction, GatewayError> {
        let amount_minor = to_minor_units(request.amount)?;

        if let Some(existing) = &request.existing_gateway_order_id {
            debug!(gateway_order_id = %existing, "reusing gateway order");
            return Ok(self.session(
                existing.clone(),
                amount_minor,
                request.currency.clone(),
                request,
            ));
        }

        let body = json!({
            "amount": amount_minor,
            "currency": request.currency,
            "receipt": request.reference.to_string(),
            "notes": {
                "order_id": request.reference.to_string(),
                "order_number": request.order_number,
            },
        });

        let response = self
            .client
            .post(self.url("/v1/orders"))
            .basic_auth(&self.config.key_id, Some(&self.config.key_secret))
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        let text = response.text().await.map_err(transport_error)?;
        if !status.is_success() {
            return Err(classify_http_failure(status, &text));
        }
        let order: RazorpayOrder = serde_json::from_str(&text)
            .map_err(|e| GatewayError::Malformed(format!("order response: {}", e)))?;

        debug!(gateway_order_id = %order.id, "gateway order created");
        Ok(self.session(order.id, order.amount, order.currency, request))
    }

    async fn verify_transaction(
        &self,
        request: VerificationRequest<'_>,
    ) -> Result<VerifiedTransaction, GatewayError> {
        match request {
            VerificationRequest::Callback(payload) => self.verify_callback(payload),
            VerificationRequest::Poll {
                gateway_order_id, ..
            } => self.poll(gateway_order_id).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn gateway(base_url: &str) -> RazorpayGateway {
        RazorpayGateway::new(
            RazorpayConfig {
                key_id: "rzp_test_key".into(),
                key_secret: "rzp_test_secret".into(),
                base_url: base_url.into(),
            },
            Duration::from_secs(2),
        )
        .unwrap()
    }

    fn callback(body: String) -> CallbackPayload {
        CallbackPayload {
            headers: Default::default(),
            body: Bytes::from(body),
        }
    }

    #[test]
    fn valid_signature_is_accepted() {
        let gw = gateway("http://unused");
        let signature = gw.sign("order_abc", "pay_123");
        let body = json!({
            "razorpay_order_id": "order_abc",
            "razorpay_payment_id": "pay_123",
            "razorpay_signature": signature,
        })
        .to_string();

        let verified = gw.verify_callback(&callback(body)).unwrap();
        assert_eq!(verified.gateway_order_id, "order_abc");
        assert!(matches!(
            verified.status,
            TransactionStatus::Succeeded { ref transaction_id, .. } if transaction_id == "pay_123"
        ));
    }

    #[test]
    fn tampered_payment_id_is_rejected() {
        let gw = gateway("http://unused");
        let signature = gw.sign("order_abc", "pay_123");
        let body = json!({
            "razorpay_order_id": "order_abc",
            "razorpay_payment_id": "pay_999",
            "razorpay_signature": signature,
        })
        .to_string();

        assert!(matches!(
            gw.verify_callback(&callback(body)),
            Err(GatewayError::InvalidSignature(_))
        ));
    }

    #[test]
    fn form_encoded_callback_is_parsed() {
        let gw = gateway("http://unused");
        let signature = gw.sign("order_abc", "pay_123");
        let body = format!(
            "razorpay_payment_id=pay_123&razorpay_order_id=order_abc&razorpay_signature={}",
            signature
        );
        assert!(gw.verify_callback(&callback(body)).is_ok());
    }

    #[test]
    fn missing_fields_are_malformed() {
        let gw = gateway("http://unused");
        let body = json!({ "razorpay_order_id": "order_abc" }).to_string();
        assert!(matches!(
            gw.verify_callback(&callback(body)),
            Err(GatewayError::Malformed(_))
        ));
    }

    #[test]
    fn payment_list_maps_to_status() {
        let failed = RazorpayPayment {
            id: "pay_1".into(),
            status: "failed".into(),
            amount: Some(100),
            error_description: Some("card declined".into()),
        };
        let captured = RazorpayPayment {
            id: "pay_2".into(),
            status: "captured".into(),
            amount: Some(100),
            error_description: None,
        };

        assert_eq!(status_from_payments(&[]), TransactionStatus::Pending);
        assert!(matches!(
            status_from_payments(std::slice::from_ref(&failed)),
            TransactionStatus::Failed { ref reason, .. } if reason == "card declined"
        ));
        assert!(matches!(
            status_from_payments(&[failed, captured]),
            TransactionStatus::Succeeded { ref transaction_id, .. } if transaction_id == "pay_2"
        ));
    }
}
