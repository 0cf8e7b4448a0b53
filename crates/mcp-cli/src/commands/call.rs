//! `mcp call <command>`: send an arbitrary command.
//!
//! Parameters come from `--params '<json object>'` and repeated
//! `-P key=value` flags; flags win over the JSON object.

use anyhow::{Context, Result};
use serde_json::{Map, Value};

use super::{print_reply, Target};

/// Merge `--params` and `-P` pairs into one parameter object.
pub fn build_params(json: Option<&str>, pairs: &[String]) -> Result<Value> {
    let mut params = match json {
        Some(text) => match serde_json::from_str::<Value>(text).context("invalid --params JSON")? {
            Value::Object(map) => map,
            _ => anyhow::bail!("--params must be a JSON object"),
        },
        None => Map::new(),
    };

    for pair in pairs {
        let (key, value) = parse_pair(pair)?;
        params.insert(key, value);
    }
    Ok(Value::Object(params))
}

/// Parse `key=value`. The value is read as JSON when it parses (numbers,
/// booleans, quoted strings), otherwise taken as a plain string.
fn parse_pair(pair: &str) -> Result<(String, Value)> {
    let Some((key, raw)) = pair.split_once('=') else {
        anyhow::bail!("expected key=value, got '{pair}'");
    };
    let key = key.trim();
    if key.is_empty() {
        anyhow::bail!("empty parameter name in '{pair}'");
    }
    let value = serde_json::from_str::<Value>(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok((key.to_string(), value))
}

pub async fn run(target: &Target, command: &str, params: Value) -> Result<()> {
    let client = target.connect().await?;
    let reply = client
        .send_command(command, params)
        .await
        .with_context(|| format!("command '{command}' failed"))?;
    client.disconnect().await;
    print_reply(&reply)
}
