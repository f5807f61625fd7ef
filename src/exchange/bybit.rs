// =============================================================================
// Bybit v5 REST API Client — HMAC-SHA256 signed requests
// =============================================================================
//
// SECURITY: the secret key is never logged or serialized. Signed requests
// carry the X-BAPI-* header set; the signature covers
// `timestamp + api_key + recv_window + payload` where payload is the query
// string for GETs and the JSON body for POSTs. A recv-window of 5 000 ms
// tolerates minor clock drift against the venue.
// =============================================================================

use anyhow::{Context, Result};
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, instrument, warn};

use crate::types::OrderSide;

use super::{
    BracketOrder, Candle, ClosedTrade, ExchangeClient, InstrumentInfo, MarginInfo, PositionInfo,
};

type HmacSha256 = Hmac<Sha256>;

/// Recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

pub const MAINNET_URL: &str = "https://api.bybit.com";
pub const TESTNET_URL: &str = "https://api-testnet.bybit.com";

/// Bybit v5 REST client for linear perpetuals.
#[derive(Clone)]
pub struct BybitClient {
    api_key: String,
    secret: String,
    base_url: String,
    client: reqwest::Client,
}

impl BybitClient {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    /// Create a new `BybitClient`.
    ///
    /// # Arguments
    /// * `api_key`  — API key, sent as a header only.
    /// * `secret`   — secret used exclusively for HMAC signing.
    /// * `testnet`  — select the testnet base URL.
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>, testnet: bool) -> Self {
        let base_url = if testnet { TESTNET_URL } else { MAINNET_URL };

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(15))
            .build()
            .expect("failed to build reqwest client");

        debug!(base_url, "BybitClient initialised");

        Self {
            api_key: api_key.into(),
            secret: secret.into(),
            base_url: base_url.to_string(),
            client,
        }
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// HMAC-SHA256 hex signature over `payload`.
    fn sign(&self, payload: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Current UNIX timestamp in milliseconds.
    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    /// Header set for a signed request whose signable payload is `payload`.
    fn signed_headers(&self, payload: &str) -> HeaderMap {
        let ts = Self::timestamp_ms();
        let prehash = format!("{ts}{}{RECV_WINDOW}{payload}", self.api_key);
        let signature = self.sign(&prehash);

        let mut headers = HeaderMap::new();
        let mut set = |name: &'static str, value: String| {
            if let Ok(v) = HeaderValue::from_str(&value) {
                headers.insert(name, v);
            }
        };
        set("X-BAPI-API-KEY", self.api_key.clone());
        set("X-BAPI-TIMESTAMP", ts.to_string());
        set("X-BAPI-RECV-WINDOW", RECV_WINDOW.to_string());
        set("X-BAPI-SIGN", signature);
        headers
    }

    /// GET a v5 endpoint and unwrap the `result` envelope, failing on any
    /// non-zero `retCode`.
    async fn get_v5(&self, path: &str, query: &str, signed: bool) -> Result<serde_json::Value> {
        let url = format!("{}{path}?{query}", self.base_url);
        let mut req = self.client.get(&url);
        if signed {
            req = req.headers(self.signed_headers(query));
        }

        let resp = req
            .send()
            .await
            .with_context(|| format!("GET {path} request failed"))?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .with_context(|| format!("failed to parse {path} response"))?;

        if !status.is_success() {
            anyhow::bail!("Bybit GET {path} returned {status}: {body}");
        }
        let ret_code = body["retCode"].as_i64().unwrap_or(-1);
        if ret_code != 0 {
            anyhow::bail!(
                "Bybit GET {path} retCode {ret_code}: {}",
                body["retMsg"].as_str().unwrap_or("?")
            );
        }
        Ok(body["result"].clone())
    }

    /// POST a v5 endpoint with a JSON body, signed.
    async fn post_v5(&self, path: &str, body: serde_json::Value) -> Result<serde_json::Value> {
        let body_str = serde_json::to_string(&body).context("failed to serialise request body")?;
        let url = format!("{}{path}", self.base_url);

        let resp = self
            .client
            .post(&url)
            .headers(self.signed_headers(&body_str))
            .header("Content-Type", "application/json")
            .body(body_str)
            .send()
            .await
            .with_context(|| format!("POST {path} request failed"))?;

        let status = resp.status();
        let payload: serde_json::Value = resp
            .json()
            .await
            .with_context(|| format!("failed to parse {path} response"))?;

        if !status.is_success() {
            anyhow::bail!("Bybit POST {path} returned {status}: {payload}");
        }
        let ret_code = payload["retCode"].as_i64().unwrap_or(-1);
        if ret_code != 0 {
            anyhow::bail!(
                "Bybit POST {path} retCode {ret_code}: {}",
                payload["retMsg"].as_str().unwrap_or("?")
            );
        }
        Ok(payload["result"].clone())
    }

    /// Parse a JSON value that may be either a string or a number into `f64`.
    fn parse_str_f64(val: &serde_json::Value) -> Result<f64> {
        if let Some(s) = val.as_str() {
            s.parse::<f64>()
                .with_context(|| format!("failed to parse '{s}' as f64"))
        } else if let Some(n) = val.as_f64() {
            Ok(n)
        } else {
            anyhow::bail!("expected string or number, got: {val}")
        }
    }

    /// Interval in milliseconds for a kline interval token ("1", "5", "60"...).
    fn interval_ms(interval: &str) -> i64 {
        match interval {
            "D" => 86_400_000,
            "W" => 604_800_000,
            other => other.parse::<i64>().unwrap_or(1) * 60_000,
        }
    }

    /// Map a "1m"/"5m"/"1h" style interval to Bybit's token.
    pub fn interval_token(interval: &str) -> String {
        match interval {
            "1m" => "1".into(),
            "3m" => "3".into(),
            "5m" => "5".into(),
            "15m" => "15".into(),
            "30m" => "30".into(),
            "1h" => "60".into(),
            "4h" => "240".into(),
            "1d" => "D".into(),
            other => other.trim_end_matches('m').to_string(),
        }
    }
}

#[async_trait::async_trait]
impl ExchangeClient for BybitClient {
    /// GET /v5/market/kline (public). The venue returns newest-first; this
    /// reverses to oldest-first and computes `confirmed` from elapsed time.
    #[instrument(skip(self), name = "bybit::klines")]
    async fn klines(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<Candle>> {
        let token = Self::interval_token(interval);
        let query = format!("category=linear&symbol={symbol}&interval={token}&limit={limit}");
        let result = self.get_v5("/v5/market/kline", &query, false).await?;

        let list = result["list"].as_array().context("kline list missing")?;
        let now_ms = Self::timestamp_ms() as i64;
        let span = Self::interval_ms(&token);

        let mut candles = Vec::with_capacity(list.len());
        for entry in list.iter().rev() {
            let arr = entry.as_array().context("kline entry is not an array")?;
            if arr.len() < 6 {
                warn!("skipping malformed kline entry with {} elements", arr.len());
                continue;
            }
            let start_ms = Self::parse_str_f64(&arr[0])? as i64;
            candles.push(Candle {
                start_ms,
                open: Self::parse_str_f64(&arr[1])?,
                high: Self::parse_str_f64(&arr[2])?,
                low: Self::parse_str_f64(&arr[3])?,
                close: Self::parse_str_f64(&arr[4])?,
                volume: Self::parse_str_f64(&arr[5])?,
                confirmed: start_ms + span <= now_ms,
            });
        }

        debug!(symbol, interval, count = candles.len(), "klines fetched");
        Ok(candles)
    }

    /// GET /v5/account/wallet-balance (signed).
    #[instrument(skip(self), name = "bybit::wallet_equity")]
    async fn wallet_equity(&self) -> Result<f64> {
        let result = self
            .get_v5("/v5/account/wallet-balance", "accountType=UNIFIED", true)
            .await?;

        let account = result["list"]
            .as_array()
            .and_then(|l| l.first())
            .context("wallet-balance list empty")?;
        let equity = Self::parse_str_f64(&account["totalEquity"])?;

        debug!(equity, "wallet equity fetched");
        Ok(equity)
    }

    /// GET /v5/position/list (signed). Sizes come back unsigned with a side
    /// label; this folds them into signed sizes.
    #[instrument(skip(self), name = "bybit::positions")]
    async fn positions(&self, symbol: &str) -> Result<Vec<PositionInfo>> {
        let query = format!("category=linear&symbol={symbol}");
        let result = self.get_v5("/v5/position/list", &query, true).await?;

        let list = result["list"].as_array().context("position list missing")?;
        let mut positions = Vec::new();
        for entry in list {
            let size = Self::parse_str_f64(&entry["size"]).unwrap_or(0.0);
            if size == 0.0 {
                continue;
            }
            let sign = match entry["side"].as_str() {
                Some("Buy") => 1.0,
                Some("Sell") => -1.0,
                _ => continue,
            };
            positions.push(PositionInfo {
                symbol: entry["symbol"].as_str().unwrap_or(symbol).to_string(),
                size: size * sign,
                entry_price: Self::parse_str_f64(&entry["avgPrice"]).unwrap_or(0.0),
                position_idx: entry["positionIdx"].as_u64().unwrap_or(0) as u8,
            });
        }

        debug!(symbol, count = positions.len(), "positions fetched");
        Ok(positions)
    }

    /// Margin ratio for one leg, from the position list entry's initial
    /// margin over its notional value.
    #[instrument(skip(self), name = "bybit::margin_info")]
    async fn margin_info(&self, symbol: &str, position_idx: u8) -> Result<MarginInfo> {
        let query = format!("category=linear&symbol={symbol}");
        let result = self.get_v5("/v5/position/list", &query, true).await?;

        let list = result["list"].as_array().context("position list missing")?;
        for entry in list {
            let idx = entry["positionIdx"].as_u64().unwrap_or(0) as u8;
            let size = Self::parse_str_f64(&entry["size"]).unwrap_or(0.0);
            if idx != position_idx || size == 0.0 {
                continue;
            }
            let im = Self::parse_str_f64(&entry["positionIM"]).unwrap_or(0.0);
            let value = Self::parse_str_f64(&entry["positionValue"]).unwrap_or(0.0);
            if value > 0.0 {
                return Ok(MarginInfo {
                    found: true,
                    margin_ratio: im / value,
                });
            }
        }
        Ok(MarginInfo {
            found: false,
            margin_ratio: 0.0,
        })
    }

    /// GET /v5/position/closed-pnl (signed), oldest first.
    #[instrument(skip(self), name = "bybit::closed_pnl")]
    async fn closed_pnl(&self, symbol: &str, since_ms: i64) -> Result<Vec<ClosedTrade>> {
        let query =
            format!("category=linear&symbol={symbol}&startTime={since_ms}&limit=100");
        let result = self.get_v5("/v5/position/closed-pnl", &query, true).await?;

        let list = result["list"].as_array().context("closed-pnl list missing")?;
        let mut trades = Vec::with_capacity(list.len());
        for entry in list.iter().rev() {
            trades.push(ClosedTrade {
                symbol: entry["symbol"].as_str().unwrap_or(symbol).to_string(),
                pnl: Self::parse_str_f64(&entry["closedPnl"]).unwrap_or(0.0),
                created_time_ms: Self::parse_str_f64(&entry["createdTime"]).unwrap_or(0.0) as i64,
                order_id: entry["orderId"].as_str().map(|s| s.to_string()),
            });
        }

        debug!(symbol, count = trades.len(), "closed pnl fetched");
        Ok(trades)
    }

    /// POST /v5/order/create (signed) — market entry with TP/SL attached.
    #[instrument(skip(self, order), name = "bybit::place_bracket_market")]
    async fn place_bracket_market(&self, order: &BracketOrder) -> Result<String> {
        let side = match order.side {
            OrderSide::Buy => "Buy",
            OrderSide::Sell => "Sell",
        };
        let mut body = serde_json::json!({
            "category": "linear",
            "symbol": order.symbol,
            "side": side,
            "orderType": "Market",
            "qty": format!("{}", order.qty),
            "positionIdx": order.position_idx,
            "orderLinkId": order.order_link_id,
            "reduceOnly": order.reduce_only,
        });
        if let Some(tp) = order.take_profit {
            body["takeProfit"] = serde_json::json!(format!("{tp}"));
            body["tpTriggerBy"] = serde_json::json!(order.trigger_by.to_string());
        }
        if let Some(sl) = order.stop_loss {
            body["stopLoss"] = serde_json::json!(format!("{sl}"));
            body["slTriggerBy"] = serde_json::json!(order.trigger_by.to_string());
        }

        let result = self.post_v5("/v5/order/create", body).await?;
        let order_id = result["orderId"]
            .as_str()
            .context("order response missing orderId")?
            .to_string();

        debug!(
            symbol = %order.symbol,
            side,
            qty = order.qty,
            order_id = %order_id,
            "bracket order placed"
        );
        Ok(order_id)
    }

    /// POST /v5/position/set-leverage (signed). The venue rejects a set to
    /// the current value with retCode 110043; that is treated as success.
    #[instrument(skip(self), name = "bybit::set_leverage")]
    async fn set_leverage(&self, symbol: &str, leverage: f64) -> Result<()> {
        let body = serde_json::json!({
            "category": "linear",
            "symbol": symbol,
            "buyLeverage": format!("{leverage}"),
            "sellLeverage": format!("{leverage}"),
        });

        match self.post_v5("/v5/position/set-leverage", body).await {
            Ok(_) => Ok(()),
            Err(e) if e.to_string().contains("110043") => {
                debug!(symbol, leverage, "leverage already set");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// GET /v5/market/instruments-info (public).
    #[instrument(skip(self), name = "bybit::instrument_info")]
    async fn instrument_info(&self, symbol: &str) -> Result<InstrumentInfo> {
        let query = format!("category=linear&symbol={symbol}");
        let result = self
            .get_v5("/v5/market/instruments-info", &query, false)
            .await?;

        let entry = result["list"]
            .as_array()
            .and_then(|l| l.first())
            .context("symbol not found in instruments-info response")?;
        let lot = &entry["lotSizeFilter"];

        Ok(InstrumentInfo {
            qty_step: Self::parse_str_f64(&lot["qtyStep"]).unwrap_or(0.001),
            min_qty: Self::parse_str_f64(&lot["minOrderQty"]).unwrap_or(0.001),
        })
    }
}

impl std::fmt::Debug for BybitClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BybitClient")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}
