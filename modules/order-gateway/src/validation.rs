//! Order payload validation
//!
//! Checks an untyped JSON body against the order shape and reports every
//! offending field at once, keyed by its path (`order_id`, `items.0.sku`).
//! Messages follow the wording API clients of the order endpoint already
//! parse ("The order id field is required.").

use crate::models::{OrderItem, OrderPayload};
use rust_decimal::Decimal;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::str::FromStr;

/// All field errors found in one payload, in the order they were checked
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{}", self.summary())]
pub struct ValidationError {
    errors: Vec<(String, Vec<String>)>,
}

impl ValidationError {
    fn new() -> Self {
        Self { errors: Vec::new() }
    }

    fn add(&mut self, path: impl Into<String>, message: String) {
        let path = path.into();
        match self.errors.iter_mut().find(|(p, _)| *p == path) {
            Some((_, messages)) => messages.push(message),
            None => self.errors.push((path, vec![message])),
        }
    }

    fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Offending field paths in check order
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.errors.iter().map(|(path, _)| path.as_str())
    }

    pub fn messages(&self, path: &str) -> Option<&[String]> {
        self.errors
            .iter()
            .find(|(p, _)| p == path)
            .map(|(_, messages)| messages.as_slice())
    }

    pub fn to_map(&self) -> BTreeMap<String, Vec<String>> {
        self.errors.iter().cloned().collect()
    }

    /// First message, plus a count of the rest
    pub fn summary(&self) -> String {
        let total: usize = self.errors.iter().map(|(_, m)| m.len()).sum();
        let first = self
            .errors
            .first()
            .and_then(|(_, m)| m.first())
            .cloned()
            .unwrap_or_else(|| "The given data was invalid.".to_string());

        match total.saturating_sub(1) {
            0 => first,
            1 => format!("{} (and 1 more error)", first),
            n => format!("{} (and {} more errors)", first, n),
        }
    }
}

/// Validate an order body and build the typed payload
///
/// Unknown fields are ignored and do not appear in the result.
pub fn validate_order(body: &Value) -> Result<OrderPayload, ValidationError> {
    let empty = Map::new();
    let fields = body.as_object().unwrap_or(&empty);
    let mut errors = ValidationError::new();

    let order_id = positive_integer(fields.get("order_id"), "order_id", &mut errors);
    let customer_id = positive_integer(fields.get("customer_id"), "customer_id", &mut errors);
    let total_amount = amount(fields.get("total_amount"), "total_amount", &mut errors);
    let items = items(fields.get("items"), &mut errors);

    match (order_id, customer_id, total_amount, items) {
        (Some(order_id), Some(customer_id), Some(total_amount), Some(items)) if errors.is_empty() => {
            Ok(OrderPayload {
                order_id,
                customer_id,
                total_amount,
                items,
            })
        }
        _ => Err(errors),
    }
}

fn items(value: Option<&Value>, errors: &mut ValidationError) -> Option<Vec<OrderItem>> {
    let list = match present(value) {
        None => {
            errors.add("items", required("items"));
            return None;
        }
        Some(Value::Array(list)) if list.is_empty() => {
            errors.add("items", required("items"));
            return None;
        }
        Some(Value::Array(list)) => list,
        Some(_) => {
            errors.add("items", format!("The {} field must be an array.", attribute("items")));
            return None;
        }
    };

    let empty = Map::new();
    let mut items = Vec::with_capacity(list.len());
    for (i, item) in list.iter().enumerate() {
        let fields = item.as_object().unwrap_or(&empty);
        let sku = sku(fields.get("sku"), &format!("items.{}.sku", i), errors);
        let quantity = positive_integer(fields.get("quantity"), &format!("items.{}.quantity", i), errors);
        if let (Some(sku), Some(quantity)) = (sku, quantity) {
            items.push(OrderItem { sku, quantity });
        }
    }

    (items.len() == list.len()).then_some(items)
}

fn sku(value: Option<&Value>, path: &str, errors: &mut ValidationError) -> Option<String> {
    match present(value) {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.clone()),
        Some(Value::String(_)) | None => {
            errors.add(path, required(path));
            None
        }
        Some(_) => {
            errors.add(path, format!("The {} field must be a string.", attribute(path)));
            None
        }
    }
}

/// Integers as JSON numbers or integer-valued strings; no fractions or exponents
fn positive_integer(value: Option<&Value>, path: &str, errors: &mut ValidationError) -> Option<u64> {
    let value = match present(value) {
        Some(value) => value,
        None => {
            errors.add(path, required(path));
            return None;
        }
    };

    let parsed: Option<i128> = match value {
        Value::Number(n) => n
            .as_u64()
            .map(i128::from)
            .or_else(|| n.as_i64().map(i128::from)),
        Value::String(s) => s.trim().parse::<i128>().ok(),
        _ => None,
    };

    match parsed {
        None => {
            errors.add(path, format!("The {} field must be an integer.", attribute(path)));
            None
        }
        Some(n) if n <= 0 => {
            errors.add(path, format!("The {} field must be greater than 0.", attribute(path)));
            None
        }
        Some(n) => match u64::try_from(n) {
            Ok(n) => Some(n),
            Err(_) => {
                errors.add(path, format!("The {} field must be an integer.", attribute(path)));
                None
            }
        },
    }
}

fn amount(value: Option<&Value>, path: &str, errors: &mut ValidationError) -> Option<Decimal> {
    let value = match present(value) {
        Some(value) => value,
        None => {
            errors.add(path, required(path));
            return None;
        }
    };

    let text = match value {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.trim().to_string(),
        _ => String::new(),
    };
    let parsed = Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .ok();

    match parsed {
        None => {
            errors.add(path, format!("The {} field must be a number.", attribute(path)));
            None
        }
        Some(d) if d.is_sign_negative() && !d.is_zero() => {
            errors.add(path, format!("The {} field must be at least 0.", attribute(path)));
            None
        }
        Some(d) => Some(d.normalize()),
    }
}

/// Null counts as missing
fn present(value: Option<&Value>) -> Option<&Value> {
    value.filter(|v| !v.is_null())
}

fn required(path: &str) -> String {
    format!("The {} field is required.", attribute(path))
}

/// `total_amount` reads as "total amount"; nested paths stay as written
fn attribute(path: &str) -> String {
    if path.contains('.') {
        path.to_string()
    } else {
        path.replace('_', " ")
    }
}
