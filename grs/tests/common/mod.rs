#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use grs::distributor::{EventProcessor, ResourceDistributor};
use grs::router;
use grs::types::{
    LogicalNode, NodeEvent, NodeGeoInfo, RegionName, ResourcePartitionName,
};
use health::HealthRegistry;

pub fn node(region: u16, partition: u16, id: &str, rv: u64) -> LogicalNode {
    LogicalNode {
        id: id.to_string(),
        resource_version: rv.to_string(),
        geo_info: NodeGeoInfo {
            region: RegionName(region),
            resource_partition: ResourcePartitionName(partition),
            ..Default::default()
        },
        last_updated_time: Utc::now(),
        ..Default::default()
    }
}

pub fn added(region: u16, partition: u16, id: &str, rv: u64) -> NodeEvent {
    NodeEvent::added(node(region, partition, id, rv))
}

pub fn modified(region: u16, partition: u16, id: &str, rv: u64) -> NodeEvent {
    NodeEvent::modified(node(region, partition, id, rv))
}

pub fn deleted(region: u16, partition: u16, id: &str, rv: u64) -> NodeEvent {
    NodeEvent::deleted(node(region, partition, id, rv))
}

/// Seed `count` nodes into one partition, with ids `r{region}p{partition}-n{i}`
/// and resource versions 1..=count.
pub fn seed_partition(
    distributor: &ResourceDistributor,
    region: u16,
    partition: u16,
    count: usize,
) {
    let events: Vec<NodeEvent> = (1..=count)
        .map(|i| {
            added(
                region,
                partition,
                &format!("r{region}p{partition}-n{i}"),
                i as u64,
            )
        })
        .collect();
    let (ok, _) = distributor.process_events(events);
    assert!(ok);
}

/// Poll until `check` passes or a 5 second deadline expires.
pub async fn wait_for<F>(what: &str, check: F)
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn recv_timeout<T>(
    what: &str,
    fut: impl std::future::Future<Output = Option<T>>,
) -> Option<T> {
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
}

pub struct ServerHandle {
    pub addr: SocketAddr,
    pub distributor: Arc<ResourceDistributor>,
}

impl ServerHandle {
    /// Serve the real router on an OS-assigned port, sharing the distributor
    /// with the test so it can inject events directly.
    pub async fn start(distributor: Arc<ResourceDistributor>, chunk_size: usize) -> Self {
        let liveness = HealthRegistry::new("liveness");
        let app = router::router(distributor.clone(), liveness, chunk_size, false);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind test listener");
        let addr = listener.local_addr().expect("failed to read listener addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("test server failed");
        });
        Self { addr, distributor }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }
}
