//! Thin client SDK over the service API: register, list the assigned node
//! subset, and watch its event stream.

use std::time::Duration;

use futures::StreamExt;
use reqwest::header;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::stream::JsonStreamDecoder;
use crate::types::{
    ClientInfo, ClientRegistrationRequest, ClientRegistrationResponse, LogicalNode, NodeEvent,
    ResourceRequest, ResourceVersionMap, WatchRequest, WATCH_CHANNEL_SIZE,
};

#[derive(Error, Debug)]
pub enum SdkError {
    #[error("request to service failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("service returned {0}")]
    Status(StatusCode),
    #[error("failed to decode service response: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct GrsClientConfig {
    pub service_url: String,
    pub request_timeout: Duration,
    /// Friendly name, distinct from the id the service assigns.
    pub friendly_name: String,
    /// Where this client runs.
    pub region: String,
    pub total_machines: usize,
}

impl GrsClientConfig {
    pub fn new(service_url: impl Into<String>, total_machines: usize) -> Self {
        Self {
            service_url: service_url.into(),
            request_timeout: Duration::from_secs(30 * 60),
            friendly_name: "testclient".to_string(),
            region: "Beijing".to_string(),
            total_machines,
        }
    }
}

pub struct GrsClient {
    http: reqwest::Client,
    config: GrsClientConfig,
}

impl GrsClient {
    pub fn new(config: GrsClientConfig) -> Result<Self, SdkError> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self { http, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.config.service_url.trim_end_matches('/'))
    }

    pub async fn register(&self) -> Result<ClientRegistrationResponse, SdkError> {
        let request = ClientRegistrationRequest {
            initial_requested_resource: ResourceRequest {
                total_machines: self.config.total_machines,
            },
            client_info: ClientInfo {
                client_name: self.config.friendly_name.clone(),
                region: self.config.region.clone(),
            },
        };
        let response = self
            .http
            .post(self.url("/client"))
            .json(&request)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(SdkError::Status(response.status()));
        }
        Ok(response.json().await?)
    }

    /// Fetch the assigned node subset. Reassembles chunked responses by
    /// decoding consecutive JSON arrays off the stream, and derives the
    /// composite resource version to watch from as the max version per
    /// partition over the received nodes.
    pub async fn list(
        &self,
        client_id: &str,
    ) -> Result<(Vec<LogicalNode>, ResourceVersionMap), SdkError> {
        let response = self
            .http
            .get(self.url(&format!("/resource/{client_id}")))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(SdkError::Status(response.status()));
        }

        let mut body = response.bytes_stream();
        let mut decoder = JsonStreamDecoder::new();
        let mut nodes = Vec::new();
        let mut crv = ResourceVersionMap::new();
        loop {
            while let Some(batch) = decoder.next::<Vec<LogicalNode>>()? {
                for node in batch {
                    crv.merge_max(node.location(), node.resource_version_u64());
                    nodes.push(node);
                }
            }
            match body.next().await {
                Some(chunk) => decoder.push(&chunk?),
                None => break,
            }
        }
        Ok((nodes, crv))
    }

    /// Open a watch from the given composite version. Events arrive on the
    /// returned watcher's channel; the channel closes on transport error or
    /// when the server ends the stream (e.g. after a forced resync).
    pub async fn watch(
        &self,
        client_id: &str,
        resource_versions: &ResourceVersionMap,
    ) -> Result<NodeWatcher, SdkError> {
        let response = self
            .http
            .get(self.url(&format!("/resource/{client_id}?watch=true")))
            .json(&WatchRequest {
                resource_versions: resource_versions.clone(),
            })
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(SdkError::Status(response.status()));
        }

        let (sender, receiver) = mpsc::channel(WATCH_CHANNEL_SIZE);
        let mut body = response.bytes_stream();
        let task = tokio::spawn(async move {
            let mut decoder = JsonStreamDecoder::new();
            'reading: while let Some(chunk) = body.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        warn!("watch transport failed: {}", err);
                        break;
                    }
                };
                decoder.push(&chunk);
                loop {
                    match decoder.next::<NodeEvent>() {
                        Ok(Some(event)) => {
                            if sender.send(event).await.is_err() {
                                break 'reading;
                            }
                        }
                        Ok(None) => break,
                        Err(err) => {
                            warn!("failed to decode watch event: {}", err);
                            break 'reading;
                        }
                    }
                }
            }
            // Dropping the sender closes the watcher's channel.
        });

        Ok(NodeWatcher { receiver, task })
    }
}

pub struct NodeWatcher {
    receiver: mpsc::Receiver<NodeEvent>,
    task: JoinHandle<()>,
}

impl NodeWatcher {
    /// Next event, or `None` once the stream is closed.
    pub async fn recv(&mut self) -> Option<NodeEvent> {
        self.receiver.recv().await
    }

    pub fn stop(&mut self) {
        self.task.abort();
        self.receiver.close();
    }
}

impl Drop for NodeWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}
