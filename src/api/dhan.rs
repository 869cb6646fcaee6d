use crate::config::{BrokerConfig, Credentials};
use crate::error::BrokerError;
use crate::execution::OrderGateway;
use crate::models::{
    Candle, Instrument, OrderAck, OrderRequest, OrderStatus, OrderType, OrderUpdate, ProductType,
    Side, Validity,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use governor::{Quota, RateLimiter};
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;

const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 500;
const CHART_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

type DhanRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Dhan v2 REST client
///
/// Cloneable; all clones share the HTTP connection pool and rate limiter.
#[derive(Clone)]
pub struct DhanClient {
    client: Client,
    base_url: String,
    credentials: Credentials,
    rate_limiter: Arc<DhanRateLimiter>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PlaceOrderBody<'a> {
    dhan_client_id: &'a str,
    correlation_id: &'a str,
    transaction_type: Side,
    exchange_segment: &'a str,
    product_type: ProductType,
    order_type: OrderType,
    validity: Validity,
    security_id: &'a str,
    quantity: u32,
    disclosed_quantity: u32,
    price: f64,
    trigger_price: f64,
    after_market_order: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderResponse {
    order_id: String,
    order_status: OrderStatus,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderBookEntry {
    order_id: String,
    order_status: OrderStatus,
    #[serde(default)]
    average_traded_price: Option<f64>,
    #[serde(default)]
    filled_qty: Option<u32>,
    #[serde(default)]
    oms_error_description: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DhanErrorBody {
    #[serde(default)]
    error_code: Option<String>,
    #[serde(default)]
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LtpResponse {
    #[serde(default)]
    data: HashMap<String, HashMap<String, LtpEntry>>,
}

#[derive(Debug, Deserialize)]
struct LtpEntry {
    last_price: f64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct IntradayChartBody<'a> {
    security_id: &'a str,
    exchange_segment: &'a str,
    instrument: &'a str,
    interval: String,
    from_date: String,
    to_date: String,
}

#[derive(Debug, Deserialize)]
struct ChartResponse {
    #[serde(default)]
    open: Vec<f64>,
    #[serde(default)]
    high: Vec<f64>,
    #[serde(default)]
    low: Vec<f64>,
    #[serde(default)]
    close: Vec<f64>,
    #[serde(default)]
    timestamp: Vec<f64>,
}

/// Account details from `/profile`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub dhan_client_id: String,
    #[serde(default)]
    pub token_validity: Option<String>,
    #[serde(default)]
    pub active_segment: Option<String>,
}

impl DhanClient {
    pub fn new(config: &BrokerConfig, credentials: Credentials) -> Result<Self, BrokerError> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.request_timeout_secs))
            .build()?;

        let per_second = NonZeroU32::new(config.requests_per_second).unwrap_or(NonZeroU32::MIN);
        let rate_limiter = Arc::new(RateLimiter::direct(Quota::per_second(per_second)));

        Ok(Self {
            client,
            base_url: config.rest_url.trim_end_matches('/').to_string(),
            credentials,
            rate_limiter,
        })
    }

    pub fn client_id(&self) -> &str {
        &self.credentials.client_id
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.base_url, path))
            .header("access-token", &self.credentials.access_token)
            .header("client-id", &self.credentials.client_id)
            .header("Accept", "application/json")
    }

    /// Send once, rate limited. Non-2xx responses become errors.
    async fn send_once(&self, builder: RequestBuilder) -> Result<String, BrokerError> {
        self.rate_limiter.until_ready().await;

        let response = builder.send().await?;
        let status = response.status();
        let body = response.text().await?;

        if status.is_success() {
            Ok(body)
        } else {
            Err(error_from_response(status, body))
        }
    }

    /// Idempotent calls retry on 429, 5xx and transport errors with
    /// exponential backoff. Order placement never goes through here.
    async fn send_with_retry<T, F>(&self, make_request: F) -> Result<T, BrokerError>
    where
        T: DeserializeOwned,
        F: Fn() -> RequestBuilder,
    {
        let mut attempt = 1;
        loop {
            match self.send_once(make_request()).await {
                Ok(body) => return Ok(serde_json::from_str(&body)?),
                Err(e) if attempt < MAX_RETRIES && is_retryable(&e) => {
                    let backoff_ms = INITIAL_BACKOFF_MS * 2u64.pow(attempt - 1);
                    tracing::warn!(
                        "Dhan request failed: {}, retrying in {}ms (attempt {}/{})",
                        e,
                        backoff_ms,
                        attempt,
                        MAX_RETRIES
                    );
                    tokio::time::sleep(std::time::Duration::from_millis(backoff_ms)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Submit an order. A synchronous REJECTED status is surfaced as an error.
    pub async fn place_order(&self, order: &OrderRequest) -> Result<OrderAck, BrokerError> {
        if order.quantity == 0 {
            return Err(BrokerError::Invalid("quantity must be positive".into()));
        }
        if !(order.price.is_finite() && order.price > 0.0) {
            return Err(BrokerError::Invalid(format!("invalid price {}", order.price)));
        }

        let body = PlaceOrderBody {
            dhan_client_id: &self.credentials.client_id,
            correlation_id: &order.correlation_id,
            transaction_type: order.side,
            exchange_segment: &order.exchange_segment,
            product_type: order.product_type,
            order_type: order.order_type,
            validity: order.validity,
            security_id: &order.security_id,
            quantity: order.quantity,
            disclosed_quantity: 0,
            price: order.price,
            trigger_price: 0.0,
            after_market_order: false,
        };

        let text = self
            .send_once(self.request(Method::POST, "/orders").json(&body))
            .await?;
        let response: OrderResponse = serde_json::from_str(&text)?;

        if response.order_status == OrderStatus::Rejected {
            return Err(BrokerError::Rejected(format!(
                "order {} rejected on placement",
                response.order_id
            )));
        }

        Ok(OrderAck {
            order_id: response.order_id,
            status: response.order_status,
        })
    }

    pub async fn order_status(&self, order_id: &str) -> Result<OrderUpdate, BrokerError> {
        let path = format!("/orders/{order_id}");
        let value: Value = self
            .send_with_retry(|| self.request(Method::GET, &path))
            .await?;

        // Some API versions wrap the order in a single-element list
        let value = match value {
            Value::Array(mut items) if !items.is_empty() => items.swap_remove(0),
            other => other,
        };
        let entry: OrderBookEntry = serde_json::from_value(value)?;

        Ok(OrderUpdate {
            order_id: entry.order_id,
            status: entry.order_status,
            average_price: entry.average_traded_price.filter(|p| *p > 0.0),
            filled_quantity: entry.filled_qty.unwrap_or(0),
            message: entry.oms_error_description.filter(|m| !m.is_empty()),
        })
    }

    pub async fn cancel_order(&self, order_id: &str) -> Result<OrderStatus, BrokerError> {
        let path = format!("/orders/{order_id}");
        let response: OrderResponse = self
            .send_with_retry(|| self.request(Method::DELETE, &path))
            .await?;
        Ok(response.order_status)
    }

    /// Last traded price for each instrument, keyed by security id
    pub async fn get_ltp(&self, instruments: &[Instrument]) -> Result<HashMap<String, f64>, BrokerError> {
        if instruments.is_empty() {
            return Ok(HashMap::new());
        }

        let body = ltp_request_body(instruments);
        let response: LtpResponse = self
            .send_with_retry(|| self.request(Method::POST, "/marketfeed/ltp").json(&body))
            .await?;

        Ok(response
            .data
            .into_values()
            .flat_map(|segment| segment.into_iter())
            .map(|(id, entry)| (id, entry.last_price))
            .collect())
    }

    /// Intraday candles between two exchange-local times.
    ///
    /// Returned candles are stamped with their end time.
    pub async fn get_intraday_candles(
        &self,
        instrument: &Instrument,
        interval_minutes: u32,
        from: NaiveDateTime,
        to: NaiveDateTime,
    ) -> Result<Vec<Candle>, BrokerError> {
        let body = IntradayChartBody {
            security_id: &instrument.security_id,
            exchange_segment: &instrument.exchange_segment,
            instrument: &instrument.instrument_type,
            interval: interval_minutes.max(1).to_string(),
            from_date: from.format(CHART_DATE_FORMAT).to_string(),
            to_date: to.format(CHART_DATE_FORMAT).to_string(),
        };

        let response: ChartResponse = self
            .send_with_retry(|| self.request(Method::POST, "/charts/intraday").json(&body))
            .await?;

        candles_from_chart(&instrument.security_id, interval_minutes.max(1), response)
    }

    pub async fn get_profile(&self) -> Result<Profile, BrokerError> {
        self.send_with_retry(|| self.request(Method::GET, "/profile"))
            .await
    }
}

#[async_trait]
impl OrderGateway for DhanClient {
    async fn place_order(&self, order: &OrderRequest) -> Result<OrderAck, BrokerError> {
        DhanClient::place_order(self, order).await
    }

    async fn order_status(&self, order_id: &str) -> Result<OrderUpdate, BrokerError> {
        DhanClient::order_status(self, order_id).await
    }

    async fn cancel_order(&self, order_id: &str) -> Result<OrderStatus, BrokerError> {
        DhanClient::cancel_order(self, order_id).await
    }
}

fn error_from_response(status: StatusCode, body: String) -> BrokerError {
    if status.is_client_error() && status != StatusCode::TOO_MANY_REQUESTS {
        if let Ok(err) = serde_json::from_str::<DhanErrorBody>(&body) {
            if err.error_code.is_some() || err.error_message.is_some() {
                return BrokerError::Rejected(format!(
                    "{}: {}",
                    err.error_code.unwrap_or_else(|| status.as_str().to_string()),
                    err.error_message.unwrap_or_default()
                ));
            }
        }
    }

    BrokerError::Http {
        status: status.as_u16(),
        body,
    }
}

fn is_retryable(err: &BrokerError) -> bool {
    match err {
        BrokerError::Transport(_) => true,
        BrokerError::Http { status, .. } => *status == 429 || *status >= 500,
        _ => false,
    }
}

/// `{"NSE_FNO": [49081, 49082]}`. Numeric ids go out as numbers.
fn ltp_request_body(instruments: &[Instrument]) -> Value {
    let mut segments: Map<String, Value> = Map::new();

    for instrument in instruments {
        let id = match instrument.security_id.parse::<u64>() {
            Ok(n) => Value::from(n),
            Err(_) => Value::from(instrument.security_id.clone()),
        };
        let ids = segments
            .entry(instrument.exchange_segment.clone())
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(list) = ids {
            if !list.contains(&id) {
                list.push(id);
            }
        }
    }

    Value::Object(segments)
}

fn candles_from_chart(
    security_id: &str,
    interval_minutes: u32,
    chart: ChartResponse,
) -> Result<Vec<Candle>, BrokerError> {
    let len = chart.timestamp.len();
    if [chart.open.len(), chart.high.len(), chart.low.len(), chart.close.len()]
        .iter()
        .any(|l| *l != len)
    {
        return Err(BrokerError::Invalid(
            "chart arrays have mismatched lengths".into(),
        ));
    }

    let interval = Duration::minutes(interval_minutes as i64);
    let mut candles = Vec::with_capacity(len);

    for i in 0..len {
        let start = DateTime::<Utc>::from_timestamp(chart.timestamp[i] as i64, 0).ok_or_else(|| {
            BrokerError::Invalid(format!("chart timestamp out of range: {}", chart.timestamp[i]))
        })?;

        candles.push(Candle {
            instrument: security_id.to_string(),
            timestamp: start + interval,
            open: chart.open[i],
            high: chart.high[i],
            low: chart.low[i],
            close: chart.close[i],
        });
    }

    Ok(candles)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ltp_body_groups_by_segment() {
        let mut equity = Instrument::new("1333", 1);
        equity.exchange_segment = "NSE_EQ".to_string();
        let instruments = vec![
            Instrument::new("49081", 50),
            Instrument::new("49082", 50),
            Instrument::new("49081", 50),
            equity,
        ];

        let body = ltp_request_body(&instruments);
        assert_eq!(body["NSE_FNO"], serde_json::json!([49081, 49082]));
        assert_eq!(body["NSE_EQ"], serde_json::json!([1333]));
    }

    #[test]
    fn test_error_body_becomes_rejection() {
        let err = error_from_response(
            StatusCode::BAD_REQUEST,
            r#"{"errorType":"Order_Error","errorCode":"DH-906","errorMessage":"Insufficient funds"}"#
                .to_string(),
        );
        match err {
            BrokerError::Rejected(msg) => {
                assert!(msg.contains("DH-906"));
                assert!(msg.contains("Insufficient funds"));
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn test_server_error_is_retryable() {
        let err = error_from_response(StatusCode::BAD_GATEWAY, "upstream".to_string());
        assert!(is_retryable(&err));

        let err = error_from_response(StatusCode::TOO_MANY_REQUESTS, "{}".to_string());
        assert!(matches!(err, BrokerError::Http { status: 429, .. }));
        assert!(is_retryable(&err));

        assert!(!is_retryable(&BrokerError::Rejected("no".into())));
    }

    #[test]
    fn test_chart_candles_are_end_stamped() {
        let chart = ChartResponse {
            open: vec![100.0, 101.0],
            high: vec![102.0, 103.0],
            low: vec![99.0, 100.5],
            close: vec![101.0, 102.5],
            timestamp: vec![1_700_000_040.0, 1_700_000_100.0],
        };

        let candles = candles_from_chart("49081", 1, chart).unwrap();
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0].timestamp.timestamp(), 1_700_000_100);
        assert_eq!(candles[1].close, 102.5);
    }

    #[test]
    fn test_chart_length_mismatch_is_an_error() {
        let chart = ChartResponse {
            open: vec![100.0],
            high: vec![],
            low: vec![99.0],
            close: vec![101.0],
            timestamp: vec![1_700_000_040.0],
        };
        assert!(candles_from_chart("49081", 1, chart).is_err());
    }
}
