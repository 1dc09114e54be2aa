//! Symbol universe resolution: configured allow-list, or live exchange markets,
//! falling back to a REST `exchangeInfo` call, then applying exclude/extra overrides
//! (spec §4.3). Grounded on the teacher's `retriever.rs` batch-fetch style for the
//! shape of a REST call wrapped in a typed error, generalized from a single hardcoded
//! symbol to a resolved set.

use crate::error::{DatacatError, Result};
use serde::Deserialize;

const EXCHANGE_INFO_URL: &str = "https://fapi.binance.com/fapi/v1/exchangeInfo";

#[derive(Debug, Deserialize)]
struct ExchangeInfo {
    symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Deserialize)]
struct SymbolInfo {
    status: String,
    #[serde(rename = "contractType")]
    contract_type: String,
    #[serde(rename = "quoteAsset")]
    quote_asset: String,
    #[serde(rename = "baseAsset")]
    base_asset: String,
}

/// Resolves the final symbol set a run should collect for, per spec §4.3:
/// 1. if `groups` (an explicit allow-list) is set, use it verbatim (still uppercased);
/// 2. else load markets from the exchange client, keeping TRADING perpetual
///    USDT-margined ones and deriving `<base>USDT`;
/// 3. if step 2 fails (network/parse), fall back to a direct REST call against
///    `exchangeInfo`;
/// 4. apply `exclude` (removed) then `extra` (added) on top of either source.
pub async fn resolve(
    client: &reqwest::Client,
    groups: &Option<Vec<String>>,
    exclude: &[String],
    extra: &[String],
) -> Result<Vec<String>> {
    let mut base = match groups {
        Some(list) if !list.is_empty() => list.iter().map(|s| s.to_uppercase()).collect(),
        _ => match load_markets(client).await {
            Ok(symbols) => symbols,
            Err(e) => {
                tracing::warn!(error = %e, "loading markets from the exchange client failed, falling back to direct exchangeInfo REST call");
                fetch_exchange_info_direct(client).await?
            }
        },
    };

    base.retain(|s| !exclude.contains(s));
    for extra_symbol in extra {
        let upper = extra_symbol.to_uppercase();
        if !base.contains(&upper) {
            base.push(upper);
        }
    }
    base.sort();
    base.dedup();
    Ok(base)
}

/// Primary resolution path (spec §4.3 step 2): load markets from the exchange
/// client, keep the ones that are perpetual, linear, settled in USDT, and derive
/// `<base>USDT` from their base/quote assets.
async fn load_markets(client: &reqwest::Client) -> Result<Vec<String>> {
    let resp = client
        .get(EXCHANGE_INFO_URL)
        .send()
        .await
        .map_err(|e| DatacatError::external(format!("exchangeInfo request failed: {e}")))?;

    if !resp.status().is_success() {
        return Err(DatacatError::external(format!(
            "exchangeInfo returned status {}",
            resp.status()
        )));
    }

    let info: ExchangeInfo = resp
        .json()
        .await
        .map_err(|e| DatacatError::external(format!("exchangeInfo decode failed: {e}")))?;

    Ok(info
        .symbols
        .into_iter()
        .filter(|s| s.status == "TRADING" && s.contract_type == "PERPETUAL" && s.quote_asset == "USDT")
        .map(|s| format!("{}USDT", s.base_asset))
        .collect())
}

/// Fallback path (spec §4.3 step 3): a direct, loosely-typed REST call against the
/// same `exchangeInfo` endpoint, used only when `load_markets` itself fails. Reads
/// the raw JSON rather than the strict `ExchangeInfo` shape so a field this crate
/// doesn't otherwise rely on (e.g. a renamed `baseAsset`) can't take this fallback
/// down with the primary path.
async fn fetch_exchange_info_direct(client: &reqwest::Client) -> Result<Vec<String>> {
    let resp = client
        .get(EXCHANGE_INFO_URL)
        .send()
        .await
        .map_err(|e| DatacatError::external(format!("exchangeInfo fallback request failed: {e}")))?;

    if !resp.status().is_success() {
        return Err(DatacatError::external(format!(
            "exchangeInfo fallback returned status {}",
            resp.status()
        )));
    }

    let value: serde_json::Value = resp
        .json()
        .await
        .map_err(|e| DatacatError::external(format!("exchangeInfo fallback decode failed: {e}")))?;

    let symbols = value
        .get("symbols")
        .and_then(|s| s.as_array())
        .ok_or_else(|| DatacatError::external("exchangeInfo fallback missing `symbols` array"))?;

    Ok(symbols
        .iter()
        .filter(|s| {
            s.get("status").and_then(|v| v.as_str()) == Some("TRADING")
                && s.get("contractType").and_then(|v| v.as_str()) == Some("PERPETUAL")
                && s.get("quoteAsset").and_then(|v| v.as_str()) == Some("USDT")
        })
        .filter_map(|s| s.get("symbol").and_then(|v| v.as_str()).map(str::to_string))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allow_list_is_used_verbatim_modulo_case() {
        let client = reqwest::Client::new();
        let groups = Some(vec!["btcusdt".to_string(), "ETHUSDT".to_string()]);
        let resolved = resolve(&client, &groups, &[], &[]).await.unwrap();
        assert_eq!(resolved, vec!["BTCUSDT", "ETHUSDT"]);
    }

    #[tokio::test]
    async fn exclude_then_extra_is_applied_on_the_allow_list() {
        let client = reqwest::Client::new();
        let groups = Some(vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]);
        let resolved = resolve(
            &client,
            &groups,
            &["ETHUSDT".to_string()],
            &["solusdt".to_string()],
        )
        .await
        .unwrap();
        assert_eq!(resolved, vec!["BTCUSDT", "SOLUSDT"]);
    }
}
