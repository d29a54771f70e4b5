use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A validated order, as carried in the `OrderCreated` event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderPayload {
    pub order_id: u64,
    pub customer_id: u64,
    /// Serialized as a string so the amount survives the round trip exactly
    #[serde(with = "rust_decimal::serde::str")]
    pub total_amount: Decimal,
    pub items: Vec<OrderItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItem {
    pub sku: String,
    pub quantity: u64,
}

// ============================================================================
// Response bodies
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct AcceptedResponse {
    pub message: String,
    pub event_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub message: String,
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ValidationErrorResponse {
    pub message: String,
    pub errors: BTreeMap<String, Vec<String>>,
}
