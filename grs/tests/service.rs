use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use reqwest::StatusCode;
use serde_json::json;

use grs::distributor::{EventProcessor, ResourceDistributor};
use grs::sdk::{GrsClient, GrsClientConfig, SdkError};
use grs::stream::JsonStreamDecoder;
use grs::types::{EventType, Location, LogicalNode};

use crate::common::{modified, recv_timeout, seed_partition, ServerHandle};
mod common;

const CHUNK_SIZE: usize = 500;

async fn server_with_nodes(partitions: &[(u16, u16, usize)]) -> ServerHandle {
    let distributor = Arc::new(ResourceDistributor::default());
    for (region, partition, count) in partitions {
        seed_partition(&distributor, *region, *partition, *count);
    }
    ServerHandle::start(distributor, CHUNK_SIZE).await
}

fn sdk(server: &ServerHandle, machines: usize) -> GrsClient {
    GrsClient::new(GrsClientConfig::new(server.url(), machines)).expect("failed to build sdk")
}

#[tokio::test]
async fn register_then_list_returns_the_assignment() -> Result<()> {
    let server = server_with_nodes(&[(0, 0, 60), (0, 1, 40)]).await;
    let client = sdk(&server, 10);

    let registration = client.register().await?;
    assert!(registration.client_id.starts_with("client-"));
    assert_eq!(registration.granted_resource.total_machines, 10);

    let (nodes, crv) = client.list(&registration.client_id).await?;
    assert_eq!(nodes.len(), 10);
    let ids: HashSet<&str> = nodes.iter().map(|n| n.id.as_str()).collect();
    assert_eq!(ids.len(), 10);
    assert!(!crv.is_empty());
    Ok(())
}

#[tokio::test]
async fn register_with_zero_machines_is_rejected() -> Result<()> {
    let server = server_with_nodes(&[(0, 0, 10)]).await;

    let response = reqwest::Client::new()
        .post(format!("{}/client", server.url()))
        .json(&json!({
            "InitialRequestedResource": {"TotalMachines": 0},
            "ClientInfo": {"ClientName": "greedy", "Region": "Beijing"},
        }))
        .send()
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // Same through the SDK.
    let client = sdk(&server, 0);
    assert!(matches!(
        client.register().await,
        Err(SdkError::Status(status)) if status == StatusCode::BAD_REQUEST
    ));
    Ok(())
}

#[tokio::test]
async fn register_past_capacity_is_unavailable() -> Result<()> {
    let server = server_with_nodes(&[(0, 0, 10)]).await;

    sdk(&server, 10).register().await?;
    assert!(matches!(
        sdk(&server, 5).register().await,
        Err(SdkError::Status(status)) if status == StatusCode::SERVICE_UNAVAILABLE
    ));
    Ok(())
}

#[tokio::test]
async fn list_for_unknown_client_is_not_found() -> Result<()> {
    let server = server_with_nodes(&[(0, 0, 10)]).await;
    assert!(matches!(
        sdk(&server, 1).list("client-unknown").await,
        Err(SdkError::Status(status)) if status == StatusCode::NOT_FOUND
    ));
    Ok(())
}

// A list bigger than one chunk arrives as successive JSON arrays whose
// concatenation is the full assignment.
#[tokio::test]
async fn chunked_list_is_complete() -> Result<()> {
    let server = server_with_nodes(&[(0, 0, 1200)]).await;
    let client = sdk(&server, 1200);
    let registration = client.register().await?;

    let (nodes, _) = client.list(&registration.client_id).await?;
    let ids: HashSet<&str> = nodes.iter().map(|n| n.id.as_str()).collect();
    assert_eq!(ids.len(), 1200);

    // Count the JSON arrays on the raw stream.
    let body = reqwest::Client::new()
        .get(format!("{}/resource/{}", server.url(), registration.client_id))
        .send()
        .await?
        .bytes()
        .await?;
    let mut decoder = JsonStreamDecoder::new();
    decoder.push(&body);
    let mut arrays = 0;
    let mut total = 0;
    while let Some(batch) = decoder.next::<Vec<LogicalNode>>()? {
        arrays += 1;
        total += batch.len();
    }
    assert_eq!(total, 1200);
    assert_eq!(arrays, 1200_usize.div_ceil(CHUNK_SIZE));
    Ok(())
}

// Reduced-scale version of the seeding scenario: multiple regions and
// partitions, a large assignment, unique ids, predictable chunk count.
#[tokio::test]
async fn large_multi_region_list() -> Result<()> {
    let mut layout = Vec::new();
    for region in 0..5 {
        for partition in 0..2 {
            layout.push((region, partition, 400));
        }
    }
    let server = server_with_nodes(&layout).await;

    let client = sdk(&server, 2500);
    let registration = client.register().await?;
    let (nodes, crv) = client.list(&registration.client_id).await?;

    assert_eq!(nodes.len(), 2500);
    let ids: HashSet<&str> = nodes.iter().map(|n| n.id.as_str()).collect();
    assert_eq!(ids.len(), 2500);
    // 4000 nodes over 10 equal partitions: 250 nodes from each.
    for region in 0..5 {
        for partition in 0..2 {
            let location = Location::new(region, partition);
            let count = nodes.iter().filter(|n| n.location() == location).count();
            assert_eq!(count, 250);
            assert!(crv.get(location).is_some());
        }
    }
    Ok(())
}

#[tokio::test]
async fn watch_streams_events_for_assigned_nodes() -> Result<()> {
    let server = server_with_nodes(&[(0, 0, 5)]).await;
    let client = sdk(&server, 5);
    let registration = client.register().await?;
    let (nodes, crv) = client.list(&registration.client_id).await?;

    let mut watcher = client.watch(&registration.client_id, &crv).await?;

    let target = nodes[0].id.clone();
    server
        .distributor
        .process_events(vec![modified(0, 0, &target, 10), modified(0, 0, &target, 11)]);

    let first = recv_timeout("rv 10", watcher.recv()).await.unwrap();
    assert_eq!(first.event_type, EventType::Modified);
    assert_eq!(first.node.as_ref().unwrap().id, target);
    assert_eq!(first.resource_version(), 10);

    let second = recv_timeout("rv 11", watcher.recv()).await.unwrap();
    assert_eq!(second.resource_version(), 11);

    watcher.stop();
    Ok(())
}

#[tokio::test]
async fn watch_rejects_malformed_version_body() -> Result<()> {
    let server = server_with_nodes(&[(0, 0, 5)]).await;
    let client = sdk(&server, 5);
    let registration = client.register().await?;
    client.list(&registration.client_id).await?;

    let response = reqwest::Client::new()
        .get(format!(
            "{}/resource/{}?watch=true",
            server.url(),
            registration.client_id
        ))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn unregister_is_not_implemented() -> Result<()> {
    let server = server_with_nodes(&[(0, 0, 5)]).await;
    let response = reqwest::Client::new()
        .delete(format!("{}/client/client-whatever", server.url()))
        .send()
        .await?;
    assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);
    Ok(())
}

#[tokio::test]
async fn writes_on_resource_paths_are_rejected() -> Result<()> {
    let server = server_with_nodes(&[(0, 0, 5)]).await;
    let http = reqwest::Client::new();
    for request in [
        http.put(format!("{}/resource/client-x", server.url())),
        http.patch(format!("{}/resource/client-x", server.url())),
    ] {
        let response = request.send().await?;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }
    Ok(())
}
