//! Redirect gateway (UPI intent, wallets).
//!
//! Requests are base64 JSON envelopes checksummed with the merchant salt:
//! `X-VERIFY: sha256(payload + path + salt) ### salt_index`.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::time::Duration;
use tracing::{debug, instrument};

use super::{
    classify_http_failure, constant_time_eq, to_minor_units, transport_error, CallbackPayload,
    CreatedTransaction, GatewayError, GatewayKind, InitiationHandle, PaymentGateway,
    TransactionRequest, TransactionStatus, VerificationRequest, VerifiedTransaction,
};
use crate::config::PhonePeConfig;

const PAY_PATH: &str = "/pg/v1/pay";
const VERIFY_HEADER: &str = "X-VERIFY";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", bound(deserialize = "T: Deserialize<'de>"))]
struct Envelope<T> {
    #[serde(default)]
    success: bool,
    code: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PayData {
    merchant_transaction_id: String,
    instrument_response: InstrumentResponse,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstrumentResponse {
    redirect_info: RedirectInfo,
}

#[derive(Debug, Deserialize)]
struct RedirectInfo {
    url: String,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionData {
    pub merchant_transaction_id: String,
    #[serde(default)]
    pub transaction_id: Option<String>,
    #[serde(default)]
    pub amount: Option<i64>,
    #[serde(default)]
    pub state: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CallbackBody {
    response: String,
}

pub struct PhonePeGateway {
    client: reqwest::Client,
    config: PhonePeConfig,
}

impl PhonePeGateway {
    pub fn new(config: PhonePeConfig, timeout: Duration) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Unavailable(format!("http client: {}", e)))?;
        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    /// `sha256hex(content + salt_key) + "###" + salt_index`
    pub fn checksum(&self, content: &str) -> String {
        checksum(&self.config.salt_key, self.config.salt_index, content)
    }

    fn status_path(&self, merchant_transaction_id: &str) -> String {
        format!(
            "/pg/v1/status/{}/{}",
            self.config.merchant_id, merchant_transaction_id
        )
    }

    fn verify_callback(&self, payload: &CallbackPayload) -> Result<VerifiedTransaction, GatewayError> {
        let body: CallbackBody = serde_json::from_slice(&payload.body)
            .map_err(|e| GatewayError::Malformed(format!("callback body: {}", e)))?;
        let provided = payload
            .header(VERIFY_HEADER)
            .ok_or_else(|| GatewayError::InvalidSignature("missing X-VERIFY header".into()))?;

        let expected = self.checksum(&body.response);
        if !constant_time_eq(provided.trim().as_bytes(), expected.as_bytes()) {
            return Err(GatewayError::InvalidSignature("checksum mismatch".into()));
        }

        let decoded = BASE64
            .decode(body.response.trim())
            .map_err(|e| GatewayError::Malformed(format!("response is not base64: {}", e)))?;
        let envelope: Envelope<TransactionData> = serde_json::from_slice(&decoded)
            .map_err(|e| GatewayError::Malformed(format!("decoded response: {}", e)))?;

        into_verified(envelope, provided.to_string())
    }

    async fn poll(&self, merchant_transaction_id: &str) -> Result<VerifiedTransaction, GatewayError> {
        let path = self.status_path(merchant_transaction_id);
        let response = self
            .client
            .get(self.url(&path))
            .header(VERIFY_HEADER, self.checksum(&path))
            .header("X-MERCHANT-ID", &self.config.merchant_id)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        let text = response.text().await.map_err(transport_error)?;
        if !status.is_success() {
            return Err(classify_http_failure(status, &text));
        }
        let envelope: Envelope<TransactionData> = serde_json::from_str(&text)
            .map_err(|e| GatewayError::Malformed(format!("status response: {}", e)))?;

        let mut verified = into_verified(envelope, format!("status:{}", merchant_transaction_id))?;
        if verified.gateway_order_id.is_empty() {
            verified.gateway_order_id = merchant_transaction_id.to_string();
        }
        Ok(verified)
    }
}

pub fn checksum(salt_key: &str, salt_index: u32, content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hasher.update(salt_key.as_bytes());
    format!("{}###{}", hex::encode(hasher.finalize()), salt_index)
}

fn into_verified(
    envelope: Envelope<TransactionData>,
    proof: String,
) -> Result<VerifiedTransaction, GatewayError> {
    let data = envelope.data.ok_or_else(|| {
        GatewayError::Malformed(format!("response {} carried no data", envelope.code))
    })?;

    let status = match envelope.code.as_str() {
        "PAYMENT_SUCCESS" => TransactionStatus::Succeeded {
            transaction_id: data
                .transaction_id
                .clone()
                .unwrap_or_else(|| data.merchant_transaction_id.clone()),
            proof,
        },
        "PAYMENT_ERROR" | "PAYMENT_DECLINED" | "TIMED_OUT" | "TRANSACTION_NOT_FOUND" => {
            TransactionStatus::Failed {
                transaction_id: data.transaction_id.clone(),
                reason: envelope
                    .message
                    .unwrap_or_else(|| envelope.code.to_lowercase()),
            }
        }
        _ => TransactionStatus::Pending,
    };

    Ok(VerifiedTransaction {
        gateway_order_id: data.merchant_transaction_id,
        status,
        amount_minor: data.amount,
    })
}

/// Merchant user ids must be alphanumeric and at most 36 characters.
fn merchant_user_id(customer_id: &str) -> String {
    customer_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(36)
        .collect()
}

#[async_trait]
impl PaymentGateway for PhonePeGateway {
    fn kind(&self) -> GatewayKind {
        GatewayKind::PhonePe
    }

    #[instrument(skip(self, request), fields(order_id = %request.reference))]
    async fn create_transaction(
        &self,
        request: &TransactionRequest,
    ) -> Result<CreatedTransaction, GatewayError> {
        let merchant_transaction_id = request
            .existing_gateway_order_id
            .clone()
            .unwrap_or_else(|| request.reference.simple().to_string());

        let mut payload = json!({
            "merchantId": self.config.merchant_id,
            "merchantTransactionId": merchant_transaction_id,
            "merchantUserId": merchant_user_id(&request.customer_id),
            "amount": to_minor_units(request.amount)?,
            "redirectUrl": format!("{}?order_id={}", request.return_url, request.reference),
            "redirectMode": "POST",
            "callbackUrl": request.callback_url,
            "paymentInstrument": { "type": "PAY_PAGE" },
        });
        if let Some(phone) = &request.customer_phone {
            payload["mobileNumber"] = json!(phone);
        }

        let encoded = BASE64.encode(payload.to_string());
        let x_verify = self.checksum(&format!("{}{}", encoded, PAY_PATH));

        let response = self
            .client
            .post(self.url(PAY_PATH))
            .header(VERIFY_HEADER, x_verify)
            .json(&json!({ "request": encoded }))
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        let text = response.text().await.map_err(transport_error)?;
        if !status.is_success() {
            return Err(classify_http_failure(status, &text));
        }
        let envelope: Envelope<PayData> = serde_json::from_str(&text)
            .map_err(|e| GatewayError::Malformed(format!("pay response: {}", e)))?;

        if !envelope.success {
            let detail = format!(
                "{}: {}",
                envelope.code,
                envelope.message.unwrap_or_default()
            );
            return Err(if envelope.code == "INTERNAL_SERVER_ERROR" {
                GatewayError::Unavailable(detail)
            } else {
                GatewayError::Rejected(detail)
            });
        }
        let data = envelope
            .data
            .ok_or_else(|| GatewayError::Malformed("pay response carried no data".into()))?;

        debug!(merchant_transaction_id = %data.merchant_transaction_id, "pay page created");
        Ok(CreatedTransaction {
            gateway_order_id: data.merchant_transaction_id,
            handle: InitiationHandle::Redirect {
                url: data.instrument_response.redirect_info.url,
            },
        })
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
