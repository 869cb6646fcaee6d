use chrono::NaiveDate;
use dhanbot::config::{BrokerConfig, Credentials};
use dhanbot::execution::{OrderSubmitter, PriceFeedManager, TickStore};
use dhanbot::models::{Instrument, OrderStatus, Side};
use dhanbot::{BrokerError, DhanClient};
use mockito::Matcher;
use serde_json::json;
use std::sync::Arc;

fn client_for(server: &mockito::ServerGuard) -> DhanClient {
    let config = BrokerConfig {
        rest_url: server.url(),
        ..Default::default()
    };
    DhanClient::new(&config, Credentials::new("1000000001", "test-access-token")).unwrap()
}

#[tokio::test]
async fn test_place_order_sends_limit_intraday_day() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/orders")
        .match_header("access-token", "test-access-token")
        .match_header("client-id", "1000000001")
        .match_body(Matcher::PartialJson(json!({
            "dhanClientId": "1000000001",
            "transactionType": "BUY",
            "exchangeSegment": "NSE_FNO",
            "productType": "INTRADAY",
            "orderType": "LIMIT",
            "validity": "DAY",
            "securityId": "49081",
            "quantity": 50,
            "price": 100.05
        })))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"orderId": "112111182198", "orderStatus": "PENDING"}"#)
        .expect(1)
        .create_async()
        .await;

    let submitter = OrderSubmitter::new(Arc::new(client_for(&server)), 0.05);
    let ack = submitter
        .submit(&Instrument::new("49081", 50), 50, 100.0, Side::Buy)
        .await
        .unwrap();

    assert_eq!(ack.order_id, "112111182198");
    assert_eq!(ack.status, OrderStatus::Pending);
    mock.assert_async().await;
}

#[tokio::test]
async fn test_rejected_order_is_not_retried() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/orders")
        .with_status(400)
        .with_header("content-type", "application/json")
        .with_body(
            r#"{"errorType": "Order_Error", "errorCode": "DH-906", "errorMessage": "Market is closed"}"#,
        )
        .expect(1)
        .create_async()
        .await;

    let client = client_for(&server);
    let submitter = OrderSubmitter::new(Arc::new(client), 0.05);
    let result = submitter
        .submit(&Instrument::new("49081", 50), 50, 100.0, Side::Sell)
        .await;

    match result {
        Err(BrokerError::Rejected(msg)) => assert!(msg.contains("Market is closed")),
        other => panic!("expected rejection, got {other:?}"),
    }
    mock.assert_async().await;
}

#[tokio::test]
async fn test_synchronous_rejected_status_is_an_error() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/orders")
        .with_status(200)
        .with_body(r#"{"orderId": "1", "orderStatus": "REJECTED"}"#)
        .create_async()
        .await;

    let client = client_for(&server);
    let submitter = OrderSubmitter::new(Arc::new(client), 0.05);
    assert!(matches!(
        submitter
            .submit(&Instrument::new("49081", 50), 50, 100.0, Side::Buy)
            .await,
        Err(BrokerError::Rejected(_))
    ));
}

#[tokio::test]
async fn test_order_status_traded() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/orders/112111182198")
        .with_status(200)
        .with_body(
            r#"{"dhanClientId": "1000000001", "orderId": "112111182198", "orderStatus": "TRADED",
                "transactionType": "BUY", "averageTradedPrice": 100.05, "filledQty": 50,
                "omsErrorDescription": ""}"#,
        )
        .create_async()
        .await;

    let update = client_for(&server)
        .order_status("112111182198")
        .await
        .unwrap();

    assert_eq!(update.status, OrderStatus::Traded);
    assert_eq!(update.average_price, Some(100.05));
    assert_eq!(update.filled_quantity, 50);
    assert_eq!(update.message, None);
}

#[tokio::test]
async fn test_order_status_rejected_carries_reason() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/orders/7")
        .with_status(200)
        .with_body(
            r#"[{"orderId": "7", "orderStatus": "REJECTED", "averageTradedPrice": 0,
                 "filledQty": 0, "omsErrorDescription": "RMS: margin shortfall"}]"#,
        )
        .create_async()
        .await;

    let update = client_for(&server).order_status("7").await.unwrap();
    assert!(update.status.is_terminal_failure());
    assert_eq!(update.average_price, None);
    assert_eq!(update.message.as_deref(), Some("RMS: margin shortfall"));
}

#[tokio::test]
async fn test_server_errors_are_retried_then_surface() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/orders/9")
        .with_status(503)
        .with_body("unavailable")
        .expect(3)
        .create_async()
        .await;

    let result = client_for(&server).order_status("9").await;
    assert!(matches!(result, Err(BrokerError::Http { status: 503, .. })));
    mock.assert_async().await;
}

#[tokio::test]
async fn test_cancel_order() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("DELETE", "/orders/42")
        .with_status(202)
        .with_body(r#"{"orderId": "42", "orderStatus": "CANCELLED"}"#)
        .create_async()
        .await;

    let status = client_for(&server).cancel_order("42").await.unwrap();
    assert_eq!(status, OrderStatus::Cancelled);
}

#[tokio::test]
async fn test_ltp_quotes() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/marketfeed/ltp")
        .match_body(Matcher::Json(json!({"NSE_FNO": [49081, 49082]})))
        .with_status(200)
        .with_body(
            r#"{"data": {"NSE_FNO": {"49081": {"last_price": 368.15},
                                     "49082": {"last_price": 12.5}}},
                "status": "success"}"#,
        )
        .create_async()
        .await;

    let prices = client_for(&server)
        .get_ltp(&[Instrument::new("49081", 50), Instrument::new("49082", 50)])
        .await
        .unwrap();

    assert_eq!(prices.len(), 2);
    assert_eq!(prices["49081"], 368.15);
}

#[tokio::test]
async fn test_intraday_candles() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/charts/intraday")
        .match_body(Matcher::PartialJson(json!({
            "securityId": "49081",
            "exchangeSegment": "NSE_FNO",
            "instrument": "OPTIDX",
            "interval": "1",
            "fromDate": "2024-03-01 09:15:00",
            "toDate": "2024-03-01 10:15:00"
        })))
        .with_status(200)
        .with_body(
            r#"{"open": [100.0, 101.0], "high": [101.5, 102.0], "low": [99.5, 100.5],
                "close": [101.0, 101.8], "volume": [10, 12],
                "timestamp": [1709264700, 1709264760]}"#,
        )
        .create_async()
        .await;

    let day = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
    let candles = client_for(&server)
        .get_intraday_candles(
            &Instrument::new("49081", 50),
            1,
            day.and_hms_opt(9, 15, 0).unwrap(),
            day.and_hms_opt(10, 15, 0).unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(candles.len(), 2);
    assert_eq!(candles[0].timestamp.timestamp(), 1_709_264_760);
    assert_eq!(candles[1].close, 101.8);
}

#[tokio::test]
async fn test_profile() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/profile")
        .match_header("access-token", "test-access-token")
        .with_status(200)
        .with_body(
            r#"{"dhanClientId": "1000000001", "tokenValidity": "30/03/2025 15:37",
                "activeSegment": "Equity, Derivative", "ddpi": "Active"}"#,
        )
        .create_async()
        .await;

    let profile = client_for(&server).get_profile().await.unwrap();
    assert_eq!(profile.dhan_client_id, "1000000001");
    assert_eq!(profile.token_validity.as_deref(), Some("30/03/2025 15:37"));
}

#[tokio::test]
async fn test_quote_fallback_fills_missing_prices() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/marketfeed/ltp")
        .match_body(Matcher::Json(json!({"NSE_FNO": [49082]})))
        .with_status(200)
        .with_body(r#"{"data": {"NSE_FNO": {"49082": {"last_price": 55.5}}}, "status": "success"}"#)
        .expect(1)
        .create_async()
        .await;

    let store = TickStore::new(100);
    let now = chrono::Utc::now();
    store.record("49081", now, 101.0).unwrap();

    let feed = PriceFeedManager::new(
        client_for(&server),
        store.clone(),
        Default::default(),
        chrono::Duration::minutes(1),
    );
    let prices = feed
        .latest_prices(&[Instrument::new("49081", 50), Instrument::new("49082", 50)], now)
        .await;

    assert_eq!(prices["49081"], 101.0);
    assert_eq!(prices["49082"], 55.5);
    assert_eq!(store.latest("49082").unwrap(), Some(55.5));
    mock.assert_async().await;
}

#[tokio::test]
async fn test_quote_fallback_refreshes_stale_prices() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/marketfeed/ltp")
        .match_body(Matcher::Json(json!({"NSE_FNO": [49081]})))
        .with_status(200)
        .with_body(r#"{"data": {"NSE_FNO": {"49081": {"last_price": 104.25}}}, "status": "success"}"#)
        .expect(1)
        .create_async()
        .await;

    let store = TickStore::new(100);
    let now = chrono::Utc::now();
    // Stream went quiet on 49081 five minutes ago; 49082 is current
    store.record("49081", now - chrono::Duration::minutes(5), 101.0).unwrap();
    store.record("49082", now - chrono::Duration::seconds(10), 55.5).unwrap();

    let feed = PriceFeedManager::new(
        client_for(&server),
        store.clone(),
        Default::default(),
        chrono::Duration::minutes(1),
    )
    .with_stale_after(chrono::Duration::seconds(60));
    let prices = feed
        .latest_prices(&[Instrument::new("49081", 50), Instrument::new("49082", 50)], now)
        .await;

    assert_eq!(prices["49081"], 104.25);
    assert_eq!(prices["49082"], 55.5);
    let refreshed = store.latest_tick("49081").unwrap().unwrap();
    assert_eq!(refreshed.price, 104.25);
    assert_eq!(refreshed.timestamp, now);
    mock.assert_async().await;
}

#[tokio::test]
async fn test_warm_up_seeds_store() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/charts/intraday")
        .with_status(200)
        .with_body(
            r#"{"open": [100.0, 101.0, 102.0], "high": [100.0, 101.0, 102.0],
                "low": [100.0, 101.0, 102.0], "close": [100.0, 101.0, 102.0],
                "timestamp": [1709264700, 1709264760, 1709264820]}"#,
        )
        .create_async()
        .await;

    let store = TickStore::new(100);
    let feed = PriceFeedManager::new(
        client_for(&server),
        store.clone(),
        Default::default(),
        chrono::Duration::minutes(1),
    );

    let now = chrono::DateTime::from_timestamp(1_709_265_000, 0).unwrap();
    let seeded = feed
        .warm_up(&[Instrument::new("49081", 50)], chrono::Duration::hours(1), now)
        .await;

    assert_eq!(seeded, 3);
    assert_eq!(store.latest("49081").unwrap(), Some(102.0));

    let candles = store
        .candles_at("49081", chrono::Duration::minutes(1), chrono::Duration::hours(1), now)
        .unwrap();
    assert_eq!(candles.len(), 3);
}

#[tokio::test]
async fn test_warm_up_failure_is_skipped() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/charts/intraday")
        .with_status(400)
        .with_body(r#"{"errorCode": "DH-905", "errorMessage": "Invalid date range"}"#)
        .create_async()
        .await;

    let store = TickStore::new(100);
    let feed = PriceFeedManager::new(
        client_for(&server),
        store.clone(),
        Default::default(),
        chrono::Duration::minutes(1),
    );

    let seeded = feed
        .warm_up(&[Instrument::new("49081", 50)], chrono::Duration::hours(1), chrono::Utc::now())
        .await;
    assert_eq!(seeded, 0);
    assert_eq!(store.tick_count("49081").unwrap(), 0);
}
