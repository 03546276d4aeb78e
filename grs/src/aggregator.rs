//! Multi-region ingestion: one task per Resource Region Manager URL, each
//! running an initial list followed by an incremental watch, feeding every
//! event into the distributor.
//!
//! Delivery from a region is at-least-once: list retries and watch
//! reconnects can replay events, which the distributor discards by resource
//! version, so the loops here only have to care about making progress.

use std::cmp;
use std::sync::Arc;
use std::time::Duration;

use health::{HealthHandle, HealthRegistry};
use metrics::counter;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::distributor::EventProcessor;
use crate::rrm::{
    RrmClient, RrmConfig, RrmError, DEFAULT_LIST_LIMIT, DEFAULT_LIST_TIMEOUT,
    DEFAULT_WATCH_TIMEOUT,
};
use crate::types::{Checkpoint, NodeEvent};

pub const BACKOFF_INITIAL: Duration = Duration::from_millis(100);
pub const BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Deadline in seconds for a region loop to report liveness before the
/// health check considers it stalled.
const REGION_LIVENESS_SECONDS: i64 = 120;

/// Doubling backoff for reconnect attempts, reset after any success.
pub(crate) struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub(crate) fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    pub(crate) fn next(&mut self) -> Duration {
        let delay = self.current;
        self.current = cmp::min(self.current * 2, self.max);
        delay
    }

    pub(crate) fn reset(&mut self) {
        self.current = self.initial;
    }
}

pub struct Aggregator {
    urls: Vec<String>,
    processor: Arc<dyn EventProcessor>,
    list_timeout: Duration,
    watch_timeout: Duration,
}

impl Aggregator {
    pub fn new(urls: Vec<String>, processor: Arc<dyn EventProcessor>) -> Self {
        Self {
            urls,
            processor,
            list_timeout: DEFAULT_LIST_TIMEOUT,
            watch_timeout: DEFAULT_WATCH_TIMEOUT,
        }
    }

    pub fn with_timeouts(mut self, list_timeout: Duration, watch_timeout: Duration) -> Self {
        self.list_timeout = list_timeout;
        self.watch_timeout = watch_timeout;
        self
    }

    /// Spawn one ingestion task per region. Returns the task handles; the
    /// tasks run until the process exits.
    pub async fn run(&self, liveness: &HealthRegistry) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(self.urls.len());
        for url in &self.urls {
            info!(url = %url, "starting ingestion for region");
            let handle = liveness
                .register(
                    format!("region:{url}"),
                    chrono::Duration::seconds(REGION_LIVENESS_SECONDS),
                )
                .await;
            let mut config = RrmConfig::new(url.clone());
            config.list_timeout = self.list_timeout;
            config.watch_timeout = self.watch_timeout;
            let processor = self.processor.clone();
            handles.push(tokio::spawn(region_loop(config, processor, handle)));
        }
        handles
    }
}

async fn region_loop(config: RrmConfig, processor: Arc<dyn EventProcessor>, liveness: HealthHandle) {
    let url = config.service_url.clone();
    let client = match RrmClient::new(config) {
        Ok(client) => client,
        Err(err) => {
            warn!(url = %url, "failed to construct region client: {}", err);
            return;
        }
    };
    let mut backoff = Backoff::new(BACKOFF_INITIAL, BACKOFF_MAX);

    loop {
        // Initial list, retried until the region answers.
        let (groups, _, length) = match client.list(DEFAULT_LIST_LIMIT).await {
            Ok(listed) => {
                backoff.reset();
                listed
            }
            Err(err) => {
                warn!(url = %url, "list from region failed: {}", err);
                counter!("grs_aggregator_list_failures_total").increment(1);
                tokio::time::sleep(backoff.next()).await;
                continue;
            }
        };
        debug!(url = %url, length, partitions = groups.len(), "listed region inventory");

        let events: Vec<NodeEvent> = groups
            .into_iter()
            .flatten()
            .map(stamp_received)
            .collect();
        counter!("grs_aggregator_events_ingested_total").increment(events.len() as u64);
        // Resume the watch from what the store actually admitted, not from
        // what the region claims; both converge but this survives replays.
        let (_, mut crv) = processor.process_events(events);
        liveness.report_healthy().await;

        // Watch until the cursor goes stale, then fall back to a fresh list.
        'watching: loop {
            let mut stream = match client.watch(&crv).await {
                Ok(stream) => {
                    backoff.reset();
                    stream
                }
                Err(RrmError::VersionTooOld) => {
                    info!(url = %url, "watch version too old, falling back to list");
                    break 'watching;
                }
                Err(err) => {
                    warn!(url = %url, "watch connect to region failed: {}", err);
                    tokio::time::sleep(backoff.next()).await;
                    continue 'watching;
                }
            };

            loop {
                match stream.next().await {
                    Some(Ok(event)) => {
                        counter!("grs_aggregator_events_ingested_total").increment(1);
                        let (_, new_crv) = processor.process_events(vec![stamp_received(event)]);
                        crv = new_crv;
                        liveness.report_healthy().await;
                    }
                    Some(Err(err)) => {
                        warn!(url = %url, "watch stream from region failed: {}", err);
                        counter!("grs_aggregator_watch_failures_total").increment(1);
                        tokio::time::sleep(backoff.next()).await;
                        continue 'watching;
                    }
                    None => {
                        info!(url = %url, "watch stream from region ended, reconnecting");
                        continue 'watching;
                    }
                }
            }
        }
    }
}

fn stamp_received(mut event: NodeEvent) -> NodeEvent {
    event.set_checkpoint(Checkpoint::AggregatorReceived);
    event
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_max_and_resets() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(500));
        assert_eq!(backoff.next(), Duration::from_millis(100));
        assert_eq!(backoff.next(), Duration::from_millis(200));
        assert_eq!(backoff.next(), Duration::from_millis(400));
        assert_eq!(backoff.next(), Duration::from_millis(500));
        assert_eq!(backoff.next(), Duration::from_millis(500));
        backoff.reset();
        assert_eq!(backoff.next(), Duration::from_millis(100));
    }
}
