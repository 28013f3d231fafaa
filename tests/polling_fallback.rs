use market_data_sync::{
    AssetId, BackoffPolicy, ConnectionMethod, ConnectionState, HealthStatus, MarketDataBinding,
    MarketDataSync, Page, StoreSnapshot, SyncConfig,
};
use rust_decimal_macros::dec;
use serde_json::json;
use std::time::Duration;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct Upstreams {
    binance: MockServer,
    coingecko: MockServer,
}

async fn upstreams() -> Upstreams {
    let binance = MockServer::start().await;
    let coingecko = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/v3/exchangeInfo"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "symbols": [
                {"symbol": "BTCUSDT", "status": "TRADING"},
                {"symbol": "ETHUSDT", "status": "TRADING"}
            ]
        })))
        .mount(&binance)
        .await;

    Mock::given(method("GET"))
        .and(path("/coins/markets"))
        .and(query_param("page", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"id": "bitcoin", "symbol": "btc", "name": "Bitcoin", "current_price": 64000.0,
             "market_cap_rank": 1, "price_change_percentage_24h": 1.0},
            {"id": "ethereum", "symbol": "eth", "name": "Ethereum", "current_price": 3100.0,
             "market_cap_rank": 2, "price_change_percentage_24h": 2.0},
            {"id": "obscure", "symbol": "obs", "name": "Obscure", "current_price": 0.5,
             "market_cap_rank": 3, "price_change_percentage_24h": -3.0}
        ])))
        .mount(&coingecko)
        .await;

    Upstreams { binance, coingecko }
}

fn config(upstreams: &Upstreams) -> SyncConfig {
    SyncConfig {
        page_size: 3,
        max_reconnect_attempts: 2,
        poll_interval_secs: 1,
        backoff: BackoffPolicy {
            initial_ms: 10,
            max_ms: 20,
        },
        universe_size: 3,
        binance_api_url: upstreams.binance.uri(),
        coingecko_api_url: upstreams.coingecko.uri(),
        // nothing listens here, every stream connect is refused
        binance_ws_url: "ws://127.0.0.1:1".to_string(),
        ..SyncConfig::default()
    }
}

async fn wait_until<F>(binding: &MarketDataBinding, condition: F)
where
    F: Fn(&StoreSnapshot) -> bool,
{
    let mut rx = binding.watch();
    tokio::time::timeout(Duration::from_secs(10), async {
        while !condition(&**rx.borrow_and_update()) {
            rx.changed().await.unwrap();
        }
    })
    .await
    .expect("condition not reached");
}

#[tokio::test]
async fn test_unreachable_stream_falls_back_to_rest_polling() {
    let upstreams = upstreams().await;

    Mock::given(method("GET"))
        .and(path("/api/v3/ticker/24hr"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"symbol": "BTCUSDT", "lastPrice": "64000.50", "priceChangePercent": "1.10"},
            {"symbol": "ETHUSDT", "lastPrice": "3100.25", "priceChangePercent": "-0.40"}
        ])))
        .mount(&upstreams.binance)
        .await;

    // unmapped assets are priced by the secondary provider
    Mock::given(method("GET"))
        .and(path("/coins/markets"))
        .and(query_param("ids", "obscure"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"id": "obscure", "symbol": "obs", "name": "Obscure", "current_price": 0.5,
             "market_cap_rank": 3, "price_change_percentage_24h": -3.0}
        ])))
        .mount(&upstreams.coingecko)
        .await;

    let binding = MarketDataSync::new(config(&upstreams))
        .unwrap()
        .bootstrap()
        .await
        .unwrap();
    binding.start(Page(0)).await.unwrap();

    wait_until(&binding, |s| {
        s.status.state == ConnectionState::Failed && s.prices.len() == 3
    })
    .await;

    let status = binding.status();
    assert_eq!(status.method, ConnectionMethod::Polling);
    assert!(!status.is_connected);
    assert_eq!(status.reconnect_attempts, 2);

    let bitcoin = binding.price(&AssetId::new("bitcoin")).unwrap();
    assert_eq!(bitcoin.price, dec!(64000.50));
    assert_eq!(bitcoin.source, "binance");
    let obscure = binding.price(&AssetId::new("obscure")).unwrap();
    assert_eq!(obscure.price, dec!(0.5));
    assert_eq!(obscure.source, "coingecko");

    assert_eq!(binding.coverage(), 66.7);
    assert_eq!(binding.unmapped(), vec![AssetId::new("obscure")]);
    assert_eq!(binding.health_check().status, HealthStatus::Degraded);

    binding.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_rate_limited_polling_reports_error() {
    let upstreams = upstreams().await;

    Mock::given(method("GET"))
        .and(path("/api/v3/ticker/24hr"))
        .respond_with(ResponseTemplate::new(429))
        .mount(&upstreams.binance)
        .await;
    Mock::given(method("GET"))
        .and(path("/coins/markets"))
        .and(query_param("ids", "bitcoin,ethereum,obscure"))
        .respond_with(ResponseTemplate::new(429))
        .mount(&upstreams.coingecko)
        .await;

    let binding = MarketDataSync::new(config(&upstreams))
        .unwrap()
        .bootstrap()
        .await
        .unwrap();
    binding.start(Page(0)).await.unwrap();

    wait_until(&binding, |s| {
        s.status
            .last_error
            .as_deref()
            .is_some_and(|e| e.starts_with("poll failed"))
    })
    .await;

    let summary = binding.status_summary();
    assert_eq!(summary.label, "Polling");
    assert!(summary.last_error.unwrap().contains("Rate limit exceeded"));
    assert!(binding.prices().is_empty());
    assert_eq!(binding.health_check().status, HealthStatus::Unhealthy);

    binding.stop().await.unwrap();
    assert_eq!(binding.status().state, ConnectionState::Idle);
}

#[tokio::test]
async fn test_page_beyond_universe_is_rejected() {
    let upstreams = upstreams().await;
    let binding = MarketDataSync::new(config(&upstreams))
        .unwrap()
        .bootstrap()
        .await
        .unwrap();

    assert_eq!(binding.page_count(), 1);
    let err = binding.start(Page(1)).await.unwrap_err();
    assert_eq!(err.to_string(), "Page 1 is out of range (1 pages available)");
    assert_eq!(binding.status().state, ConnectionState::Idle);
}
