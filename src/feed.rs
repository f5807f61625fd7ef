// =============================================================================
// Market Feed — public WebSocket to market.data snapshots
// =============================================================================
//
// Subscribes to the venue's top-of-book, trade, and ticker streams for one
// symbol and folds them into MarketSnapshot messages on the market-data
// subject. Each trade also updates a producer-side OFI accumulator (same
// 0.85 decay rule consumers use) and a spread-vs-range gauge.
//
// Runs until the stream disconnects or errors, then returns so that the
// caller (main.rs) can handle reconnection with a back-off sleep.
// =============================================================================

use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::bus::MessageBus;
use crate::market_data::OFI_DECAY;
use crate::metrics;
use crate::types::{MarketSnapshot, OrderSide};

pub const MAINNET_WS_URL: &str = "wss://stream.bybit.com/v5/public/linear";
pub const TESTNET_WS_URL: &str = "wss://stream-testnet.bybit.com/v5/public/linear";

/// Venue keep-alive interval.
const PING_INTERVAL: std::time::Duration = std::time::Duration::from_secs(20);

/// Rolling trade-price window used as the range proxy for the spread gauge.
const RANGE_WINDOW: usize = 100;

/// Mutable feed state for one symbol between venue events.
#[derive(Debug, Default)]
struct FeedState {
    best_bid: f64,
    best_ask: f64,
    bid_size: f64,
    ask_size: f64,
    last_price: f64,
    last_side: Option<OrderSide>,
    last_size: f64,
    funding_rate: f64,
    ofi: f64,
    recent_prices: VecDeque<f64>,
}

impl FeedState {
    fn snapshot(&self, symbol: &str) -> Option<MarketSnapshot> {
        // Nothing useful to publish before the first trade.
        let last_side = self.last_side?;
        Some(MarketSnapshot {
            symbol: symbol.to_string(),
            best_bid: self.best_bid,
            best_ask: self.best_ask,
            bid_size: self.bid_size,
            ask_size: self.ask_size,
            last_price: self.last_price,
            last_side,
            last_size: self.last_size,
            funding_rate: self.funding_rate,
            timestamp: Utc::now(),
            order_flow_imbalance: self.ofi,
        })
    }

    fn record_trade(&mut self, price: f64, size: f64, side: OrderSide) {
        self.last_price = price;
        self.last_size = size;
        self.last_side = Some(side);
        let signed = match side {
            OrderSide::Buy => size,
            OrderSide::Sell => -size,
        };
        self.ofi = OFI_DECAY * self.ofi + signed;

        self.recent_prices.push_back(price);
        while self.recent_prices.len() > RANGE_WINDOW {
            self.recent_prices.pop_front();
        }
    }

    /// Spread as a percentage of the recent trade range.
    fn spread_range_percent(&self) -> Option<f64> {
        if self.best_bid <= 0.0 || self.best_ask <= self.best_bid {
            return None;
        }
        let high = self.recent_prices.iter().cloned().fold(f64::MIN, f64::max);
        let low = self.recent_prices.iter().cloned().fold(f64::MAX, f64::min);
        let range = high - low;
        if range > 0.0 {
            Some((self.best_ask - self.best_bid) / range * 100.0)
        } else {
            None
        }
    }
}

/// Connect and stream one symbol until the socket drops.
pub async fn run_feed(
    ws_url: &str,
    symbol: &str,
    bus: Arc<dyn MessageBus>,
    market_subject: &str,
) -> Result<()> {
    info!(url = %ws_url, symbol, "connecting to market feed");
    let (ws_stream, _response) = connect_async(ws_url)
        .await
        .context("failed to connect to market feed WebSocket")?;
    let (mut write, mut read) = ws_stream.split();

    let subscribe = serde_json::json!({
        "op": "subscribe",
        "args": [
            format!("orderbook.1.{symbol}"),
            format!("publicTrade.{symbol}"),
            format!("tickers.{symbol}"),
        ],
    });
    write
        .send(Message::Text(subscribe.to_string()))
        .await
        .context("failed to send feed subscription")?;
    info!(symbol, "market feed subscribed");

    let mut state = FeedState::default();
    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.tick().await; // first tick fires immediately

    loop {
        tokio::select! {
            _ = ping.tick() => {
                let ping_msg = serde_json::json!({"op": "ping"}).to_string();
                write
                    .send(Message::Text(ping_msg))
                    .await
                    .context("feed ping failed")?;
            }
            incoming = read.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match apply_message(symbol, &text, &mut state) {
                            Ok(true) => {
                                publish_snapshot(symbol, &state, &bus, market_subject).await;
                            }
                            Ok(false) => {}
                            Err(e) => warn!(symbol, error = %e, "dropping malformed feed message"),
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(symbol, error = %e, "market feed read error");
                        return Err(e.into());
                    }
                    None => {
                        warn!(symbol, "market feed stream ended");
                        return Ok(());
                    }
                }
            }
        }
    }
}

async fn publish_snapshot(
    symbol: &str,
    state: &FeedState,
    bus: &Arc<dyn MessageBus>,
    market_subject: &str,
) {
    let Some(snapshot) = state.snapshot(symbol) else {
        return;
    };
    if let Some(pct) = state.spread_range_percent() {
        metrics::set_spread_atr_percent(symbol, pct);
    }
    match serde_json::to_vec(&snapshot) {
        Ok(payload) => {
            if let Err(e) = bus.publish(market_subject, payload).await {
                warn!(symbol, error = %e, "snapshot publication failed");
            }
        }
        Err(e) => warn!(symbol, error = %e, "snapshot serialisation failed"),
    }
}

/// Fold one venue message into the feed state. Returns `true` when the state
/// changed in a way worth publishing.
fn apply_message(symbol: &str, text: &str, state: &mut FeedState) -> Result<bool> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse feed JSON")?;

    let Some(topic) = root["topic"].as_str() else {
        // op acks, pongs, subscription confirmations
        debug!(symbol, "feed control message");
        return Ok(false);
    };

    if topic.starts_with("orderbook.1.") {
        let data = &root["data"];
        if let Some(level) = data["b"].as_array().and_then(|b| b.first()) {
            if let (Some(p), Some(s)) = (parse_level(level, 0), parse_level(level, 1)) {
                // Size 0 deletes the level in delta messages.
                if s > 0.0 {
                    state.best_bid = p;
                    state.bid_size = s;
                }
            }
        }
        if let Some(level) = data["a"].as_array().and_then(|a| a.first()) {
            if let (Some(p), Some(s)) = (parse_level(level, 0), parse_level(level, 1)) {
                if s > 0.0 {
                    state.best_ask = p;
                    state.ask_size = s;
                }
            }
        }
        return Ok(true);
    }

    if topic.starts_with("publicTrade.") {
        if let Some(trades) = root["data"].as_array() {
            for trade in trades {
                let price = trade["p"]
                    .as_str()
                    .and_then(|s| s.parse::<f64>().ok())
                    .unwrap_or(0.0);
                let size = trade["v"]
                    .as_str()
                    .and_then(|s| s.parse::<f64>().ok())
                    .unwrap_or(0.0);
                let side = match trade["S"].as_str() {
                    Some("Buy") => OrderSide::Buy,
                    Some("Sell") => OrderSide::Sell,
                    _ => continue,
                };
                if price > 0.0 && size > 0.0 {
                    state.record_trade(price, size, side);
                }
            }
        }
        return Ok(true);
    }

    if topic.starts_with("tickers.") {
        if let Some(rate) = root["data"]["fundingRate"]
            .as_str()
            .and_then(|s| s.parse::<f64>().ok())
        {
            state.funding_rate = rate;
        }
        // Funding alone is not worth a snapshot; it rides along with the
        // next book or trade update.
        return Ok(false);
    }

    Ok(false)
}

fn parse_level(level: &serde_json::Value, idx: usize) -> Option<f64> {
    level.get(idx)?.as_str()?.parse::<f64>().ok()
}
