//! Mock order backend
//!
//! Stands in for a real order-management system. The agents never look inside
//! an [`Order`]; the tool adapters only serialize what the backend hands them.

use std::collections::HashSet;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{Result, StorefrontError};

/// A line on a past order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderItem {
    pub name: String,
    pub quantity: u32,
    pub price: f64,
}

/// Fulfilment state of an order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Processing,
    Shipped,
    Delivered,
}

/// A past order record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub order_number: String,
    pub date: NaiveDate,
    pub status: OrderStatus,
    pub items: Vec<OrderItem>,
    pub total: f64,
}

/// Contract the tool adapters rely on.
///
/// Both calls are synchronous lookups; whatever they return (or fail with) is
/// passed through to the runtime unchanged.
pub trait OrderBackend: Send + Sync + 'static {
    /// The customer's order history
    fn past_orders(&self) -> Result<Vec<Order>>;

    /// Submit a refund for `order_number`; the returned value is authoritative
    fn submit_refund_request(&self, order_number: &str) -> Result<Value>;
}

/// Canned orders served by [`MockOrderBackend::default`]
pub fn fixture_orders() -> Vec<Order> {
    vec![
        Order {
            order_number: "ORD-123".to_string(),
            date: NaiveDate::from_ymd_opt(2025, 3, 2).unwrap_or_default(),
            status: OrderStatus::Delivered,
            items: vec![
                OrderItem {
                    name: "Linen shirt".to_string(),
                    quantity: 1,
                    price: 49.5,
                },
                OrderItem {
                    name: "Chino trousers".to_string(),
                    quantity: 1,
                    price: 65.0,
                },
            ],
            total: 114.5,
        },
        Order {
            order_number: "ORD-456".to_string(),
            date: NaiveDate::from_ymd_opt(2025, 4, 18).unwrap_or_default(),
            status: OrderStatus::Shipped,
            items: vec![OrderItem {
                name: "Wool scarf".to_string(),
                quantity: 2,
                price: 24.0,
            }],
            total: 48.0,
        },
        Order {
            order_number: "ORD-789".to_string(),
            date: NaiveDate::from_ymd_opt(2025, 5, 6).unwrap_or_default(),
            status: OrderStatus::Processing,
            items: vec![OrderItem {
                name: "Canvas sneakers".to_string(),
                quantity: 1,
                price: 80.0,
            }],
            total: 80.0,
        },
    ]
}

/// Payload the mock returns for an accepted refund
pub fn refund_accepted(order_number: &str) -> Value {
    json!({
        "success": true,
        "order_number": order_number,
        "message": format!("Refund request for order {order_number} has been submitted."),
    })
}

/// In-memory backend with a fixed order list.
///
/// Refunds are accepted for any order number in the accepted set, which by
/// default is every fixture order.
#[derive(Debug, Clone)]
pub struct MockOrderBackend {
    orders: Vec<Order>,
    refundable: HashSet<String>,
}

impl Default for MockOrderBackend {
    fn default() -> Self {
        Self::new(fixture_orders())
    }
}

impl MockOrderBackend {
    /// Backend serving `orders`; every listed order is refundable.
    pub fn new(orders: Vec<Order>) -> Self {
        let refundable = orders.iter().map(|o| o.order_number.clone()).collect();
        Self { orders, refundable }
    }

    /// Also accept refunds for `order_number`, listed or not.
    pub fn accepting(mut self, order_number: impl Into<String>) -> Self {
        self.refundable.insert(order_number.into());
        self
    }
}

impl OrderBackend for MockOrderBackend {
    fn past_orders(&self) -> Result<Vec<Order>> {
        Ok(self.orders.clone())
    }

    fn submit_refund_request(&self, order_number: &str) -> Result<Value> {
        if self.refundable.contains(order_number) {
            Ok(refund_accepted(order_number))
        } else {
            Err(StorefrontError::UnknownOrder {
                order_number: order_number.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn fixture_serializes_to_known_shape() {
        let value = serde_json::to_value(&fixture_orders()[1]).unwrap();
        assert_eq!(
            value,
            json!({
                "order_number": "ORD-456",
                "date": "2025-04-18",
                "status": "shipped",
                "items": [{"name": "Wool scarf", "quantity": 2, "price": 24.0}],
                "total": 48.0
            })
        );
    }

    #[test]
    fn refunds_accepted_for_known_orders() {
        let backend = MockOrderBackend::default();
        let out = backend.submit_refund_request("ORD-123").unwrap();
        assert_eq!(out["success"], json!(true));
        assert_eq!(out["order_number"], json!("ORD-123"));
    }

    #[test]
    fn refunds_rejected_for_unknown_orders() {
        let backend = MockOrderBackend::default();
        let err = backend.submit_refund_request("ORD-000").unwrap_err();
        assert!(matches!(err, StorefrontError::UnknownOrder { .. }));
    }

    #[test]
    fn accepting_extends_refundable_set() {
        let backend = MockOrderBackend::new(vec![]).accepting("GIFT-1");
        assert!(backend.past_orders().unwrap().is_empty());
        assert!(backend.submit_refund_request("GIFT-1").is_ok());
    }
}
