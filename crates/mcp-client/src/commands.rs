//! Typed helpers for the MetaTrader commands the EA understands.

use serde::Serialize;
use serde_json::{json, Map, Value};

use mcp_core::McpResult;

use crate::client::McpClient;

/// MetaTrader order types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Buy,
    Sell,
    BuyLimit,
    SellLimit,
    BuyStop,
    SellStop,
}

impl std::str::FromStr for OrderType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().replace('-', "_").as_str() {
            "BUY" => Ok(Self::Buy),
            "SELL" => Ok(Self::Sell),
            "BUY_LIMIT" => Ok(Self::BuyLimit),
            "SELL_LIMIT" => Ok(Self::SellLimit),
            "BUY_STOP" => Ok(Self::BuyStop),
            "SELL_STOP" => Ok(Self::SellStop),
            other => Err(format!("unknown order type: {other}")),
        }
    }
}

/// Parameters of `open_order`. Unset price levels are omitted on the wire.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub order_type: OrderType,
    pub volume: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sl: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tp: Option<f64>,
    pub comment: String,
}

impl OrderRequest {
    pub fn new(symbol: impl Into<String>, order_type: OrderType, volume: f64) -> Self {
        Self {
            symbol: symbol.into(),
            order_type,
            volume,
            price: None,
            sl: None,
            tp: None,
            comment: String::new(),
        }
    }
}

fn modify_params(ticket: u64, price: Option<f64>, sl: Option<f64>, tp: Option<f64>) -> Value {
    let mut params = Map::new();
    params.insert("ticket".into(), json!(ticket));
    for (key, value) in [("price", price), ("sl", sl), ("tp", tp)] {
        if let Some(v) = value {
            params.insert(key.into(), json!(v));
        }
    }
    Value::Object(params)
}

impl McpClient {
    pub async fn get_account_info(&self) -> McpResult<Value> {
        self.send_command("get_account_info", json!({})).await
    }

    /// Current bid/ask for `symbol` (e.g. `EURUSD`).
    pub async fn get_price(&self, symbol: &str) -> McpResult<Value> {
        self.send_command("get_price", json!({ "symbol": symbol })).await
    }

    pub async fn open_order(&self, order: &OrderRequest) -> McpResult<Value> {
        self.send_command("open_order", serde_json::to_value(order)?).await
    }

    pub async fn close_order(&self, ticket: u64) -> McpResult<Value> {
        self.send_command("close_order", json!({ "ticket": ticket })).await
    }

    /// Change the price or stop levels of an order. `None` leaves a level untouched.
    pub async fn modify_order(
        &self,
        ticket: u64,
        price: Option<f64>,
        sl: Option<f64>,
        tp: Option<f64>,
    ) -> McpResult<Value> {
        self.send_command("modify_order", modify_params(ticket, price, sl, tp))
            .await
    }

    pub async fn get_orders(&self) -> McpResult<Value> {
        self.send_command("get_orders", json!({})).await
    }

    /// The last `bars` bars of `symbol` on `timeframe` (`M1`, `H1`, `D1`, ...).
    pub async fn get_history(&self, symbol: &str, timeframe: &str, bars: u32) -> McpResult<Value> {
        self.send_command(
            "get_history",
            json!({ "symbol": symbol, "timeframe": timeframe, "bars": bars }),
        )
        .await
    }
}
