use super::OrderGateway;
use crate::error::BrokerError;
use crate::models::{OrderAck, OrderRequest, OrderStatus, OrderUpdate};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Simulated broker that fills every order at its limit price
pub struct PaperGateway {
    next_id: AtomicU64,
    orders: Mutex<HashMap<String, (OrderRequest, OrderUpdate)>>,
}

impl PaperGateway {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            orders: Mutex::new(HashMap::new()),
        }
    }

    /// Every order placed so far, in placement order
    pub fn placed_orders(&self) -> Vec<OrderRequest> {
        let orders = self.orders.lock().unwrap_or_else(|e| e.into_inner());
        let mut placed: Vec<(u64, OrderRequest)> = orders
            .iter()
            .filter_map(|(id, (req, _))| {
                id.trim_start_matches("PAPER-")
                    .parse::<u64>()
                    .ok()
                    .map(|n| (n, req.clone()))
            })
            .collect();
        placed.sort_by_key(|(n, _)| *n);
        placed.into_iter().map(|(_, req)| req).collect()
    }
}

impl Default for PaperGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OrderGateway for PaperGateway {
    async fn place_order(&self, order: &OrderRequest) -> Result<OrderAck, BrokerError> {
        if order.quantity == 0 || !(order.price.is_finite() && order.price > 0.0) {
            return Err(BrokerError::Rejected(format!(
                "paper order rejected: qty {} @ {}",
                order.quantity, order.price
            )));
        }

        let order_id = format!("PAPER-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let update = OrderUpdate {
            order_id: order_id.clone(),
            status: OrderStatus::Traded,
            average_price: Some(order.price),
            filled_quantity: order.quantity,
            message: None,
        };

        tracing::info!(
            order_id = %order_id,
            side = %order.side,
            price = order.price,
            "📝 Paper fill"
        );

        self.orders
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(order_id.clone(), (order.clone(), update));

        Ok(OrderAck {
            order_id,
            status: OrderStatus::Traded,
        })
    }

    async fn order_status(&self, order_id: &str) -> Result<OrderUpdate, BrokerError> {
        self.orders
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(order_id)
            .map(|(_, update)| update.clone())
            .ok_or_else(|| BrokerError::Invalid(format!("unknown paper order {order_id}")))
    }

    async fn cancel_order(&self, order_id: &str) -> Result<OrderStatus, BrokerError> {
        let mut orders = self.orders.lock().unwrap_or_else(|e| e.into_inner());
        let (_, update) = orders
            .get_mut(order_id)
            .ok_or_else(|| BrokerError::Invalid(format!("unknown paper order {order_id}")))?;

        if update.status != OrderStatus::Traded {
            update.status = OrderStatus::Cancelled;
        }
        Ok(update.status)
    }
}
