use crate::models::OrderPayload;
use event_bus::{Clock, EventEnvelope};

pub const ORDER_CREATED: &str = "OrderCreated";
pub const ORDER_CREATED_SCHEMA_VERSION: u32 = 1;

/// Key that pins every event of one order to the same ordered lane
pub fn partition_key(order: &OrderPayload) -> String {
    order.order_id.to_string()
}

/// Wrap a validated order in its `OrderCreated` envelope
pub fn build_order_created(order: OrderPayload, clock: &dyn Clock) -> EventEnvelope<OrderPayload> {
    let key = partition_key(&order);
    EventEnvelope::new(ORDER_CREATED, key, order, clock)
        .with_schema_version(ORDER_CREATED_SCHEMA_VERSION)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OrderItem;
    use crate::validation::validate_order;
    use chrono::{TimeZone, Utc};
    use event_bus::{validate_envelope_fields, FixedClock};
    use rust_decimal::Decimal;
    use std::str::FromStr;

    fn order() -> OrderPayload {
        OrderPayload {
            order_id: 1001,
            customer_id: 42,
            total_amount: Decimal::from_str("99.99").unwrap(),
            items: vec![OrderItem {
                sku: "TSHIRT-BLK".to_string(),
                quantity: 1,
            }],
        }
    }

    fn clock() -> FixedClock {
        FixedClock(Utc.with_ymd_and_hms(2025, 3, 14, 9, 26, 53).unwrap())
    }

    #[test]
    fn test_build_order_created() {
        let envelope = build_order_created(order(), &clock());

        assert_eq!(envelope.event_type, "OrderCreated");
        assert_eq!(envelope.schema_version, 1);
        assert_eq!(envelope.partition_key, "1001");
        assert_eq!(envelope.timestamp, clock().0);
        assert_eq!(envelope.data, order());
    }

    #[test]
    fn test_wire_form() {
        let bytes = build_order_created(order(), &clock()).to_bytes().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

        assert!(validate_envelope_fields(&value).is_ok());
        assert_eq!(value["timestamp"], "2025-03-14T09:26:53Z");
        assert_eq!(value["data"]["total_amount"], "99.99");
        assert_eq!(value["data"]["items"][0]["quantity"], 1);
    }

    #[test]
    fn test_data_survives_validation_round_trip() {
        let bytes = build_order_created(order(), &clock()).to_bytes().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(validate_order(&value["data"]).unwrap(), order());
    }
}
