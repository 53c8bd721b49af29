//! Inbound provider webhooks: envelope decoding and signature checks.

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;

use crate::provider::ProviderImage;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-imagine-signature";

/// Event names carrying an image payload.
const IMAGE_EVENTS: [&str; 2] = ["images.items.update", "images.items.create"];

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("malformed webhook payload: {0}")]
    Malformed(String),
    #[error("webhook signature mismatch")]
    BadSignature,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEnvelope {
    pub event: String,
    pub payload: ProviderImage,
}

impl WebhookEnvelope {
    pub fn is_image_event(&self) -> bool {
        IMAGE_EVENTS.contains(&self.event.as_str())
    }
}

/// Decode a webhook body. Returns the envelope and the raw `payload` object.
pub fn parse(body: &[u8]) -> Result<(WebhookEnvelope, serde_json::Value), WebhookError> {
    let value: serde_json::Value =
        serde_json::from_slice(body).map_err(|e| WebhookError::Malformed(e.to_string()))?;
    let raw = value
        .get("payload")
        .cloned()
        .ok_or_else(|| WebhookError::Malformed("missing payload".to_string()))?;
    let envelope: WebhookEnvelope =
        serde_json::from_value(value).map_err(|e| WebhookError::Malformed(e.to_string()))?;
    if envelope.payload.id.is_empty() {
        return Err(WebhookError::Malformed("empty payload id".to_string()));
    }
    Ok((envelope, raw))
}

/// Check `header` (`sha256=<hex>` or bare hex) against HMAC-SHA256(secret, body).
pub fn verify_signature(secret: &str, body: &[u8], header: Option<&str>) -> Result<(), WebhookError> {
    let header = header.ok_or(WebhookError::BadSignature)?.trim();
    let hex_part = header.strip_prefix("sha256=").unwrap_or(header);
    let provided = hex::decode(hex_part).map_err(|_| WebhookError::BadSignature)?;

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| WebhookError::BadSignature)?;
    mac.update(body);
    mac.verify_slice(&provided)
        .map_err(|_| WebhookError::BadSignature)
}

/// Signature header value for `body`, as the provider would send it.
pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}
