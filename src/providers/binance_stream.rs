//! Binance websocket transport for 24h ticker streams

use crate::{
    config::SyncConfig,
    error::ProviderError,
    provider::{StreamEvent, StreamSession, StreamTransport},
    types::{NativeSymbol, TickerUpdate},
};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Outgoing SUBSCRIBE / UNSUBSCRIBE request
#[derive(Debug, Serialize)]
struct WsRequest<'a> {
    method: &'a str,
    params: Vec<String>,
    id: u64,
}

/// 24h ticker payload; Binance uses single-letter keys
#[derive(Debug, Deserialize)]
struct TickerPayload {
    #[serde(rename = "e")]
    event: String,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "c")]
    last_price: String,
    #[serde(rename = "P")]
    change_percent: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WsInbound {
    /// Combined-stream wrapper
    Wrapped { data: TickerPayload },
    Ticker(TickerPayload),
    Response {
        id: u64,
        #[serde(default)]
        error: Option<serde_json::Value>,
    },
}

/// Decodes one text frame from the Binance stream
pub(crate) fn parse_message(text: &str) -> StreamEvent {
    let inbound = match serde_json::from_str::<WsInbound>(text) {
        Ok(inbound) => inbound,
        Err(_) => return StreamEvent::Malformed(text.to_string()),
    };

    match inbound {
        WsInbound::Response { id, error: None } => StreamEvent::SubscriptionAck { request_id: id },
        WsInbound::Response {
            id,
            error: Some(error),
        } => StreamEvent::Malformed(format!("request {} rejected: {}", id, error)),
        WsInbound::Wrapped { data } | WsInbound::Ticker(data) => parse_ticker(data, text),
    }
}

fn parse_ticker(payload: TickerPayload, raw: &str) -> StreamEvent {
    if payload.event != "24hrTicker" {
        return StreamEvent::Malformed(raw.to_string());
    }

    match (
        Decimal::from_str(&payload.last_price),
        Decimal::from_str(&payload.change_percent),
    ) {
        (Ok(price), Ok(change_24h)) => StreamEvent::Ticker(TickerUpdate {
            symbol: NativeSymbol::new(&payload.symbol),
            price,
            change_24h,
        }),
        _ => StreamEvent::Malformed(raw.to_string()),
    }
}

/// Opens websocket sessions against the Binance raw stream endpoint
pub struct BinanceStreamTransport {
    ws_url: String,
}

impl BinanceStreamTransport {
    pub fn new(config: &SyncConfig) -> Self {
        Self::with_url(&config.binance_ws_url)
    }

    pub fn with_url(ws_url: &str) -> Self {
        Self {
            ws_url: ws_url.to_string(),
        }
    }
}

#[async_trait]
impl StreamTransport for BinanceStreamTransport {
    async fn connect(&self) -> Result<Box<dyn StreamSession>, ProviderError> {
        tracing::info!(url = %self.ws_url, "Connecting to Binance stream");
        let (ws, _) = connect_async(self.ws_url.as_str()).await?;
        Ok(Box::new(BinanceStreamSession { ws }))
    }

    fn provider_name(&self) -> &'static str {
        "binance-ws"
    }
}

/// A live Binance websocket connection
pub struct BinanceStreamSession {
    ws: WsStream,
}

impl BinanceStreamSession {
    async fn send_request(
        &mut self,
        method: &str,
        symbols: &[NativeSymbol],
        request_id: u64,
    ) -> Result<(), ProviderError> {
        let request = WsRequest {
            method,
            params: symbols.iter().map(NativeSymbol::ticker_stream).collect(),
            id: request_id,
        };
        let body = serde_json::to_string(&request)
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

        tracing::debug!(method, request_id, streams = symbols.len(), "Sending stream request");
        self.ws.send(Message::Text(body.into())).await?;
        Ok(())
    }
}

#[async_trait]
impl StreamSession for BinanceStreamSession {
    async fn subscribe(
        &mut self,
        symbols: &[NativeSymbol],
        request_id: u64,
    ) -> Result<(), ProviderError> {
        self.send_request("SUBSCRIBE", symbols, request_id).await
    }

    async fn unsubscribe(
        &mut self,
        symbols: &[NativeSymbol],
        request_id: u64,
    ) -> Result<(), ProviderError> {
        self.send_request("UNSUBSCRIBE", symbols, request_id).await
    }

    async fn next_event(&mut self) -> Option<Result<StreamEvent, ProviderError>> {
        loop {
            match self.ws.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(parse_message(&text))),
                Ok(Message::Close(frame)) => {
                    tracing::info!(frame = ?frame, "Binance stream closed by server");
                    return None;
                }
                Ok(Message::Ping(data)) => {
                    tracing::trace!("Received ping: {:?}", data);
                }
                Ok(_) => {}
                Err(e) => return Some(Err(e.into())),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.ws.close(None).await {
            tracing::debug!(error = %e, "Error while closing Binance stream");
        }
    }
}
