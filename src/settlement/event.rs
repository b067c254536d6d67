use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::SettlementError;

/// Provider event type that carries a completed checkout
pub const CHECKOUT_PAID_EVENT: &str = "checkout_session.payment.paid";

/// Payment confirmation for one checkout session
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct PaymentConfirmedEvent {
    #[validate(length(min = 1, message = "payment_reference is required"))]
    pub payment_reference: String,
    #[validate(length(min = 1, message = "buyer_id is required"))]
    pub buyer_id: String,
    #[serde(default)]
    pub buyer_display_name: Option<String>,
    #[validate(length(min = 1, message = "at least one line item is required"))]
    pub line_items: Vec<EventLineItem>,
}

/// One purchased product with its upstream price breakdown (major units)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLineItem {
    pub product_id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub seller_id: String,
    pub quantity: i64,
    #[serde(with = "rust_decimal::serde::float")]
    pub unit_price_usd: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub unit_price_local: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub gross_local: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub platform_fee_local: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub seller_net_local: Decimal,
}

impl PaymentConfirmedEvent {
    /// Structural checks; run before any write
    pub fn check(&self) -> Result<(), SettlementError> {
        self.validate()
            .map_err(|e| SettlementError::Validation(e.to_string()))?;

        if self.payment_reference.trim().is_empty() {
            return Err(SettlementError::Validation(
                "payment_reference is required".to_string(),
            ));
        }

        for line in &self.line_items {
            if line.product_id.trim().is_empty() {
                return Err(SettlementError::Validation(
                    "line item without product_id".to_string(),
                ));
            }
            if line.seller_id.trim().is_empty() {
                return Err(SettlementError::InvalidLine {
                    product_id: line.product_id.clone(),
                    reason: "missing seller_id".to_string(),
                });
            }
            if line.quantity < 1 {
                return Err(SettlementError::InvalidLine {
                    product_id: line.product_id.clone(),
                    reason: format!("quantity must be at least 1, got {}", line.quantity),
                });
            }
        }

        Ok(())
    }
}

/// Provider webhook envelope: `data.attributes.{type, data}`
#[derive(Debug, Deserialize)]
pub struct WebhookEnvelope {
    pub data: WebhookData,
}

#[derive(Debug, Deserialize)]
pub struct WebhookData {
    pub attributes: WebhookAttributes,
}

#[derive(Debug, Deserialize)]
pub struct WebhookAttributes {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub data: Option<CheckoutSession>,
}

#[derive(Debug, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    pub attributes: CheckoutAttributes,
}

#[derive(Debug, Deserialize)]
pub struct CheckoutAttributes {
    pub metadata: CheckoutMetadata,
}

#[derive(Debug, Deserialize)]
pub struct CheckoutMetadata {
    pub user_id: String,
    #[serde(default)]
    pub username: Option<String>,
    /// Line item list, JSON-encoded into a string by the checkout creator
    pub items: serde_json::Value,
}

impl WebhookEnvelope {
    pub fn event_type(&self) -> &str {
        &self.data.attributes.event_type
    }

    /// `None` for event types that do not settle anything
    pub fn into_event(self) -> Result<Option<PaymentConfirmedEvent>, SettlementError> {
        if self.data.attributes.event_type != CHECKOUT_PAID_EVENT {
            return Ok(None);
        }

        let session = self.data.attributes.data.ok_or_else(|| {
            SettlementError::MalformedWebhook("paid event without checkout session".to_string())
        })?;
        let metadata = session.attributes.metadata;

        let line_items: Vec<EventLineItem> = match metadata.items {
            serde_json::Value::String(encoded) => serde_json::from_str(&encoded),
            other => serde_json::from_value(other),
        }
        .map_err(|e| SettlementError::MalformedWebhook(format!("invalid metadata.items: {}", e)))?;

        Ok(Some(PaymentConfirmedEvent {
            payment_reference: session.id,
            buyer_id: metadata.user_id,
            buyer_display_name: metadata.username,
            line_items,
        }))
    }
}
