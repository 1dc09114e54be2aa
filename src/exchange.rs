//! Shared REST client for `fapi.binance.com`, wired through the rate limiter so every
//! endpoint a collector calls obeys the same token bucket and ban clock (spec §4.1,
//! §4.4). Grounded on `cooprefr-bettersys/rust-backend`'s `reqwest::Client` + rustls
//! setup and on the teacher's pattern of one thin client struct per external service.

use crate::error::{DatacatError, Result};
use crate::rate_limiter::RateLimiter;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const FAPI_BASE: &str = "https://fapi.binance.com";

/// `parse_ban(error_text) -> epoch_ms`: extracts `banned until <unix_ms>` from an
/// HTTP 418 body if present; otherwise falls back to *now + 60s* (spec §4.1).
fn parse_ban(text: &str) -> i64 {
    if let Some(idx) = text.find("banned until ") {
        let rest = &text[idx + "banned until ".len()..];
        let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
        if let Ok(ms) = digits.parse::<i64>() {
            return ms;
        }
    }
    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64;
    now_ms + 60_000
}

pub struct ExchangeClient {
    http: reqwest::Client,
    limiter: Arc<RateLimiter>,
}

impl ExchangeClient {
    pub fn new(limiter: Arc<RateLimiter>, http_proxy: &Option<String>) -> Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(Duration::from_secs(10));
        if let Some(proxy) = http_proxy {
            let proxy = reqwest::Proxy::all(proxy)
                .map_err(|e| DatacatError::config(format!("invalid HTTP_PROXY: {e}")))?;
            builder = builder.proxy(proxy);
        }
        let http = builder
            .build()
            .map_err(|e| DatacatError::config(format!("failed to build http client: {e}")))?;
        Ok(Self { http, limiter })
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Issues a GET against `fapi.binance.com`, acquiring a rate-limit token first and
    /// recording a ban on 418/429 before surfacing the error (spec §4.1, §8 S5).
    pub async fn get_fapi(&self, path: &str, query: &[(&str, String)]) -> Result<reqwest::Response> {
        let url = format!("{FAPI_BASE}{path}");
        self.get_raw(&url, query).await
    }

    /// Issues a rate-limited GET against an arbitrary absolute URL (used for archive
    /// downloads, which live on a different host than `fapi.binance.com` but still
    /// share this process's token bucket and ban clock).
    pub async fn get_raw(&self, url: &str, query: &[(&str, String)]) -> Result<reqwest::Response> {
        let _permit = self.limiter.acquire().await?;
        let resp = self
            .http
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(|e| DatacatError::external(format!("request to {url} failed: {e}")))?;

        let status = resp.status();
        if status.as_u16() == 418 {
            let body = resp.text().await.unwrap_or_default();
            let until_ms = parse_ban(&body);
            self.limiter.set_ban_until(until_ms)?;
            return Err(DatacatError::external(format!(
                "{url} banned (status 418) until {until_ms}"
            )));
        }
        if status.as_u16() == 429 {
            let retry_after = resp
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(60);
            self.limiter.record_ban(Duration::from_secs(retry_after))?;
            return Err(DatacatError::external(format!(
                "{url} rate-limited (status 429), retry after {retry_after}s"
            )));
        }

        Ok(resp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn client_builds_without_a_proxy() {
        let dir = tempfile::tempdir().unwrap();
        let limiter = Arc::new(RateLimiter::new(dir.path(), 1200, 20).unwrap());
        let client = ExchangeClient::new(limiter, &None);
        assert!(client.is_ok());
    }

    #[test]
    fn parse_ban_extracts_the_unix_ms_deadline_per_scenario_s5() {
        let body = "{\"code\":-1003,\"msg\":\"banned until 1800000000000\"}";
        assert_eq!(parse_ban(body), 1_800_000_000_000);
    }

    #[test]
    fn parse_ban_falls_back_to_now_plus_60s_without_a_deadline() {
        let now_ms = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_millis() as i64;
        let fallback = parse_ban("some unrelated error body");
        assert!(fallback >= now_ms + 59_000 && fallback <= now_ms + 61_000);
    }
}
