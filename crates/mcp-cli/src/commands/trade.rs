//! Shortcuts for the common MetaTrader commands.

use anyhow::Result;
use mcp_client::{OrderRequest, OrderType};

use super::{print_reply, Target};

pub async fn run_price(target: &Target, symbol: &str) -> Result<()> {
    let client = target.connect().await?;
    let reply = client.get_price(symbol).await?;
    client.disconnect().await;
    print_reply(&reply)
}

pub async fn run_account(target: &Target) -> Result<()> {
    let client = target.connect().await?;
    let reply = client.get_account_info().await?;
    client.disconnect().await;
    print_reply(&reply)
}

pub async fn run_orders(target: &Target) -> Result<()> {
    let client = target.connect().await?;
    let reply = client.get_orders().await?;
    client.disconnect().await;
    print_reply(&reply)
}

pub async fn run_history(target: &Target, symbol: &str, timeframe: &str, bars: u32) -> Result<()> {
    let client = target.connect().await?;
    let reply = client.get_history(symbol, timeframe, bars).await?;
    client.disconnect().await;
    print_reply(&reply)
}

pub async fn run_open(target: &Target, order: &OrderRequest) -> Result<()> {
    let client = target.connect().await?;
    let reply = client.open_order(order).await?;
    client.disconnect().await;
    print_reply(&reply)
}

pub async fn run_close(target: &Target, ticket: u64) -> Result<()> {
    let client = target.connect().await?;
    let reply = client.close_order(ticket).await?;
    client.disconnect().await;
    print_reply(&reply)
}

pub async fn run_modify(
    target: &Target,
    ticket: u64,
    price: Option<f64>,
    sl: Option<f64>,
    tp: Option<f64>,
) -> Result<()> {
    if price.is_none() && sl.is_none() && tp.is_none() {
        anyhow::bail!("nothing to modify: pass --price, --sl or --tp");
    }
    let client = target.connect().await?;
    let reply = client.modify_order(ticket, price, sl, tp).await?;
    client.disconnect().await;
    print_reply(&reply)
}

/// Build an order from CLI arguments.
pub fn order_from_args(
    symbol: &str,
    order_type: &str,
    volume: f64,
    price: Option<f64>,
    sl: Option<f64>,
    tp: Option<f64>,
    comment: Option<String>,
) -> Result<OrderRequest> {
    let order_type: OrderType = order_type.parse().map_err(anyhow::Error::msg)?;
    if volume <= 0.0 {
        anyhow::bail!("volume must be positive");
    }
    let mut order = OrderRequest::new(symbol, order_type, volume);
    order.price = price;
    order.sl = sl;
    order.tp = tp;
    order.comment = comment.unwrap_or_default();
    Ok(order)
}
