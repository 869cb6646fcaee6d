use crate::error::BrokerError;
use crate::models::{
    Instrument, OrderAck, OrderRequest, OrderStatus, OrderType, OrderUpdate, ProductType, Side,
    Validity,
};
use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;

/// Anything that can take orders: the live broker or the paper simulator
#[async_trait]
pub trait OrderGateway: Send + Sync {
    async fn place_order(&self, order: &OrderRequest) -> Result<OrderAck, BrokerError>;

    async fn order_status(&self, order_id: &str) -> Result<OrderUpdate, BrokerError>;

    async fn cancel_order(&self, order_id: &str) -> Result<OrderStatus, BrokerError>;
}

/// Builds buffered limit orders and hands them to a gateway
#[derive(Clone)]
pub struct OrderSubmitter {
    gateway: Arc<dyn OrderGateway>,
    price_buffer: f64,
}

impl OrderSubmitter {
    pub fn new(gateway: Arc<dyn OrderGateway>, price_buffer: f64) -> Self {
        Self {
            gateway,
            price_buffer: price_buffer.max(0.0),
        }
    }

    pub fn gateway(&self) -> &Arc<dyn OrderGateway> {
        &self.gateway
    }

    /// Limit price a small buffer through the last traded price so the order
    /// crosses the spread. Rounded to 2 decimals and never below the buffer.
    pub fn limit_price(&self, last_price: f64, side: Side) -> f64 {
        let raw = match side {
            Side::Buy => last_price + self.price_buffer,
            Side::Sell => last_price - self.price_buffer,
        };
        let rounded = (raw * 100.0).round() / 100.0;
        rounded.max(self.price_buffer).max(0.01)
    }

    pub fn build_order(
        &self,
        instrument: &Instrument,
        quantity: u32,
        last_price: f64,
        side: Side,
    ) -> OrderRequest {
        OrderRequest {
            correlation_id: Uuid::new_v4().simple().to_string(),
            security_id: instrument.security_id.clone(),
            exchange_segment: instrument.exchange_segment.clone(),
            side,
            order_type: OrderType::Limit,
            product_type: ProductType::Intraday,
            validity: Validity::Day,
            quantity,
            price: self.limit_price(last_price, side),
        }
    }

    /// Submit a single LIMIT/INTRADAY/DAY order. Failures are not retried.
    pub async fn submit(
        &self,
        instrument: &Instrument,
        quantity: u32,
        last_price: f64,
        side: Side,
    ) -> Result<OrderAck, BrokerError> {
        if quantity == 0 {
            return Err(BrokerError::Invalid("quantity must be positive".into()));
        }
        if !(last_price.is_finite() && last_price > 0.0) {
            return Err(BrokerError::Invalid(format!(
                "no usable price for {}: {}",
                instrument.security_id, last_price
            )));
        }

        let order = self.build_order(instrument, quantity, last_price, side);
        tracing::info!(
            security_id = %order.security_id,
            side = %order.side,
            quantity = order.quantity,
            price = order.price,
            "📤 Placing order"
        );

        match self.gateway.place_order(&order).await {
            Ok(ack) => {
                tracing::info!(
                    order_id = %ack.order_id,
                    status = ?ack.status,
                    "✅ Order acknowledged"
                );
                Ok(ack)
            }
            Err(e) => {
                tracing::error!(security_id = %order.security_id, "❌ Order failed: {}", e);
                Err(e)
            }
        }
    }

    pub async fn status(&self, order_id: &str) -> Result<OrderUpdate, BrokerError> {
        self.gateway.order_status(order_id).await
    }

    pub async fn cancel(&self, order_id: &str) -> Result<OrderStatus, BrokerError> {
        self.gateway.cancel_order(order_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::PaperGateway;

    fn submitter() -> OrderSubmitter {
        OrderSubmitter::new(Arc::new(PaperGateway::new()), 0.05)
    }

    #[test]
    fn test_limit_price_buffer_and_rounding() {
        let s = submitter();
        assert_eq!(s.limit_price(100.0, Side::Buy), 100.05);
        assert_eq!(s.limit_price(100.0, Side::Sell), 99.95);
        assert_eq!(s.limit_price(123.456, Side::Buy), 123.51);
    }

    #[test]
    fn test_limit_price_floor() {
        let s = submitter();
        assert_eq!(s.limit_price(0.03, Side::Sell), 0.05);
    }

    #[test]
    fn test_fixed_order_shape() {
        let s = submitter();
        let order = s.build_order(&Instrument::new("49081", 50), 50, 100.0, Side::Buy);

        assert_eq!(order.order_type, OrderType::Limit);
        assert_eq!(order.product_type, ProductType::Intraday);
        assert_eq!(order.validity, Validity::Day);
        assert_eq!(order.exchange_segment, "NSE_FNO");
        assert!(!order.correlation_id.is_empty());
    }

    #[tokio::test]
    async fn test_submit_rejects_bad_inputs() {
        let s = submitter();
        let instrument = Instrument::new("49081", 50);

        assert!(matches!(
            s.submit(&instrument, 0, 100.0, Side::Buy).await,
            Err(BrokerError::Invalid(_))
        ));
        assert!(matches!(
            s.submit(&instrument, 50, f64::NAN, Side::Buy).await,
            Err(BrokerError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn test_submit_through_paper_gateway() {
        let s = submitter();
        let ack = s
            .submit(&Instrument::new("49081", 50), 50, 100.0, Side::Buy)
            .await
            .unwrap();

        let update = s.status(&ack.order_id).await.unwrap();
        assert_eq!(update.status, OrderStatus::Traded);
        assert_eq!(update.average_price, Some(100.05));
    }

    #[test]
    fn test_sell_entry_priced_below_last() {
        let s = submitter();
        let instrument = Instrument::new("49081", 50);

        let ack = tokio_test::block_on(s.submit(&instrument, 50, 80.0, Side::Sell)).unwrap();
        let update = tokio_test::block_on(s.status(&ack.order_id)).unwrap();

        assert_eq!(update.average_price, Some(79.95));
        assert_eq!(update.filled_quantity, 50);
    }
}
