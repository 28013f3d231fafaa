//! Default settings for the market data sync core
//!
//! These are the values `SyncConfig::default()` starts from. Every one of them
//! can be overridden at runtime through `SyncConfig` or the `MARKET_SYNC_*`
//! environment variables, so treat them as policy defaults rather than
//! upstream contracts.

/// Number of assets per subscription page
pub const DEFAULT_PAGE_SIZE: usize = 25;

/// Reconnect attempts before falling back to REST polling
pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// How often to poll REST snapshots while streaming is unavailable (in seconds)
pub const POLL_INTERVAL_SECS: u64 = 30;

/// Initial backoff delay between reconnect attempts (in milliseconds)
pub const INITIAL_BACKOFF_MS: u64 = 1000;

/// Maximum backoff delay between reconnect attempts (in milliseconds)
pub const MAX_BACKOFF_MS: u64 = 30000;

/// HTTP request timeout for catalog and snapshot fetches (in seconds)
pub const REQUEST_TIMEOUT_SECS: u64 = 10;

/// Quote asset appended to display symbols when building native symbols
pub const DEFAULT_QUOTE_ASSET: &str = "USDT";

/// How many ranked assets to load into the asset universe
pub const DEFAULT_UNIVERSE_SIZE: usize = 100;

/// Capacity of the store's event broadcast channel
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Capacity of the connection manager's command queue
pub const COMMAND_CHANNEL_CAPACITY: usize = 32;

/// Binance REST API base URL
pub const BINANCE_API_URL: &str = "https://api.binance.com";

/// Binance exchange info endpoint (symbol catalog)
pub const BINANCE_EXCHANGE_INFO_ENDPOINT: &str = "/api/v3/exchangeInfo";

/// Binance 24h ticker endpoint (price snapshots)
pub const BINANCE_TICKER_ENDPOINT: &str = "/api/v3/ticker/24hr";

/// Binance raw websocket endpoint
pub const BINANCE_WS_URL: &str = "wss://stream.binance.com:9443/ws";

/// CoinGecko API base URL
pub const COINGECKO_API_URL: &str = "https://api.coingecko.com/api/v3";

/// CoinGecko markets endpoint (ranked assets with prices)
pub const COINGECKO_MARKETS_ENDPOINT: &str = "/coins/markets";

/// User agent for HTTP requests
pub const USER_AGENT: &str = "market-data-sync/0.1.0";
