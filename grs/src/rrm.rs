//! Outbound client for one Resource Region Manager.
//!
//! Two calls: an initial list of the region's node inventory, and a watch
//! that streams node events from a composite resource version onwards. The
//! watch uses POST because the composite version body can hold hundreds of
//! partition entries, which do not fit in query parameters.

use std::time::Duration;

use futures::StreamExt;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::stream::JsonStreamDecoder;
use crate::types::{NodeEvent, ResourceVersionMap, WatchRequest};

pub const DEFAULT_LIST_TIMEOUT: Duration = Duration::from_secs(2 * 60);
pub const DEFAULT_WATCH_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Default page size: list the whole region in one page.
pub const DEFAULT_LIST_LIMIT: usize = 1_000_000;

#[derive(Error, Debug)]
pub enum RrmError {
    #[error("request to region manager failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("region manager returned {0}")]
    Status(StatusCode),
    #[error("failed to decode region manager response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("requested resource version is too old")]
    VersionTooOld,
}

/// List response body: node events grouped per resource partition, the
/// composite version they run up to, and the total event count.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ResponseFromRrm {
    #[serde(default)]
    pub region_node_events: Vec<Vec<NodeEvent>>,
    #[serde(default)]
    pub rv_map: ResourceVersionMap,
    #[serde(default)]
    pub length: u64,
}

#[derive(Debug, Clone)]
pub struct RrmConfig {
    pub service_url: String,
    pub list_timeout: Duration,
    pub watch_timeout: Duration,
}

impl RrmConfig {
    pub fn new(service_url: impl Into<String>) -> Self {
        Self {
            service_url: service_url.into(),
            list_timeout: DEFAULT_LIST_TIMEOUT,
            watch_timeout: DEFAULT_WATCH_TIMEOUT,
        }
    }
}

pub struct RrmClient {
    http: reqwest::Client,
    config: RrmConfig,
}

impl RrmClient {
    pub fn new(config: RrmConfig) -> Result<Self, RrmError> {
        let http = reqwest::Client::builder().build()?;
        Ok(Self { http, config })
    }

    fn resource_url(&self) -> String {
        format!("{}/resource", self.config.service_url.trim_end_matches('/'))
    }

    /// Fetch the region's inventory as node events grouped by partition.
    pub async fn list(
        &self,
        limit: usize,
    ) -> Result<(Vec<Vec<NodeEvent>>, ResourceVersionMap, u64), RrmError> {
        let response = self
            .http
            .get(self.resource_url())
            .query(&[("limit", limit)])
            .timeout(self.config.list_timeout)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(RrmError::Status(response.status()));
        }
        let body: ResponseFromRrm = response.json().await?;
        Ok((body.region_node_events, body.rv_map, body.length))
    }

    /// Open a watch stream resuming from the given composite version. The
    /// region manager answers 410 when the version fell off its history, in
    /// which case the caller must list again.
    pub async fn watch(
        &self,
        resource_versions: &ResourceVersionMap,
    ) -> Result<NodeEventStream, RrmError> {
        let response = self
            .http
            .post(self.resource_url())
            .query(&[("watch", "true")])
            .json(&WatchRequest {
                resource_versions: resource_versions.clone(),
            })
            .timeout(self.config.watch_timeout)
            .send()
            .await?;
        match response.status() {
            StatusCode::GONE => Err(RrmError::VersionTooOld),
            status if !status.is_success() => Err(RrmError::Status(status)),
            _ => Ok(NodeEventStream {
                body: response.bytes_stream().boxed(),
                decoder: JsonStreamDecoder::new(),
            }),
        }
    }
}

/// One watch connection: decodes node events out of the chunked body as they
/// arrive. Ends when the region manager closes the connection.
pub struct NodeEventStream {
    body: futures::stream::BoxStream<'static, reqwest::Result<bytes::Bytes>>,
    decoder: JsonStreamDecoder,
}

impl NodeEventStream {
    pub async fn next(&mut self) -> Option<Result<NodeEvent, RrmError>> {
        loop {
            match self.decoder.next::<NodeEvent>() {
                Ok(Some(event)) => return Some(Ok(event)),
                Ok(None) => {}
                Err(err) => return Some(Err(err.into())),
            }
            match self.body.next().await {
                Some(Ok(chunk)) => self.decoder.push(&chunk),
                Some(Err(err)) => return Some(Err(err.into())),
                None => return None,
            }
        }
    }
}
