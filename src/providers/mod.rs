//! Upstream provider implementations

pub mod binance;
pub mod binance_stream;
pub mod coingecko;
pub mod failover;

pub use binance::BinanceRestProvider;
pub use binance_stream::BinanceStreamTransport;
pub use coingecko::CoinGeckoProvider;
pub use failover::FailoverSnapshotProvider;

use crate::{constants::USER_AGENT, error::ProviderError};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use std::time::Duration;

/// Builds the HTTP client shared by the REST providers
pub(crate) fn http_client(timeout: Duration) -> Result<Client, ProviderError> {
    Client::builder()
        .timeout(timeout)
        .user_agent(USER_AGENT)
        .build()
        .map_err(ProviderError::NetworkError)
}

/// Checks the status of a response and decodes its JSON body
pub(crate) async fn read_json<T: DeserializeOwned>(
    response: Response,
    provider: &str,
) -> Result<T, ProviderError> {
    // Check for rate limiting
    if response.status().as_u16() == 429 {
        return Err(ProviderError::RateLimitExceeded);
    }

    // Check for other errors
    if !response.status().is_success() {
        return Err(ProviderError::ApiError(format!(
            "HTTP {}: {}",
            response.status(),
            response.text().await.unwrap_or_default()
        )));
    }

    let response_text = response.text().await.map_err(ProviderError::NetworkError)?;

    serde_json::from_str(&response_text).map_err(|e| {
        ProviderError::InvalidResponse(format!(
            "Failed to parse {} response: {}. Response: {}",
            provider, e, response_text
        ))
    })
}

/// Maps reqwest timeouts onto the dedicated variant
pub(crate) fn send_error(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::Timeout
    } else {
        ProviderError::NetworkError(e)
    }
}
