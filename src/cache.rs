//! Outbound client for the upstream cache service (spec.md §6 "Outbound
//! calls to the cache"). The cache's own implementation is out of scope;
//! only its `get`/`get_rate` contract is consumed.

use anyhow::{Context, Result};
use serde::Serialize;

use crate::model::CacheRows;

#[derive(Debug, Serialize)]
struct GetRequest<'a> {
    node: &'a [String],
    oidmatch: &'a str,
}

#[derive(Debug, Serialize)]
struct GetRateRequest<'a> {
    node: &'a [String],
    period: u32,
    oidmatch: &'a str,
}

#[derive(Debug, serde::Deserialize)]
struct GetResponse {
    results: CacheRows,
}

/// The upstream cache's RPC contract, behind a trait so the pipeline can be
/// exercised against a canned fixture in tests.
#[async_trait::async_trait]
pub trait CacheClient: Send + Sync {
    async fn get(&self, nodes: &[String], oidmatch: &str) -> Result<CacheRows>;
    async fn get_rate(&self, nodes: &[String], period: u32, oidmatch: &str) -> Result<CacheRows>;
}

/// HTTP-backed implementation: posts the request shape from spec.md §6 to a
/// configurable base URL and decodes the `{results: {...}}` response.
pub struct HttpCacheClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpCacheClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        HttpCacheClient {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait::async_trait]
impl CacheClient for HttpCacheClient {
    async fn get(&self, nodes: &[String], oidmatch: &str) -> Result<CacheRows> {
        let url = format!("{}/get", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(&GetRequest {
                node: nodes,
                oidmatch,
            })
            .send()
            .await
            .context("cache get request failed")?
            .error_for_status()
            .context("cache get returned an error status")?
            .json::<GetResponse>()
            .await
            .context("cache get returned malformed JSON")?;
        Ok(resp.results)
    }

    async fn get_rate(&self, nodes: &[String], period: u32, oidmatch: &str) -> Result<CacheRows> {
        let url = format!("{}/get_rate", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(&GetRateRequest {
                node: nodes,
                period,
                oidmatch,
            })
            .send()
            .await
            .context("cache get_rate request failed")?
            .error_for_status()
            .context("cache get_rate returned an error status")?
            .json::<GetResponse>()
            .await
            .context("cache get_rate returned malformed JSON")?;
        Ok(resp.results)
    }
}
