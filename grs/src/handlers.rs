use std::convert::Infallible;
use std::fmt::Display;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::HeaderMap;
use axum::response::Response;
use bytes::Bytes;
use futures::stream;
use metrics::counter;
use serde::Deserialize;
use uuid::Uuid;

use crate::api::ServiceError;
use crate::codec::Codec;
use crate::router::AppState;
use crate::types::{
    Client, ClientRegistrationRequest, ClientRegistrationResponse, WatchRequest, CLIENT_ID_PREFIX,
    MAX_TOTAL_MACHINES_PER_REQUEST, MIN_TOTAL_MACHINES_PER_REQUEST,
};

#[derive(Deserialize, Default)]
pub struct ResourceQuery {
    pub watch: Option<String>,
}

/// POST /client: allocate a client id, validate the machine range and
/// reserve the grant. The initial request is either denied or granted in
/// full.
pub async fn register_client(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ServiceError> {
    let codec = Codec::negotiate(&headers);
    let request: ClientRegistrationRequest = codec
        .decode(&body)
        .map_err(|err| ServiceError::RequestDecoding(err.to_string()))?;

    let requested = request.initial_requested_resource.total_machines;
    if !(MIN_TOTAL_MACHINES_PER_REQUEST..=MAX_TOTAL_MACHINES_PER_REQUEST).contains(&requested) {
        return Err(ServiceError::InvalidResourceRequest(requested));
    }

    let client = Client {
        client_id: format!("{}-{}", CLIENT_ID_PREFIX, Uuid::new_v4()),
        resource: request.initial_requested_resource,
        client_info: request.client_info,
    };
    state.distributor.register_client(client.clone())?;

    tracing::info!(
        client_id = %client.client_id,
        requested,
        client_name = %client.client_info.client_name,
        "registered client"
    );

    let response = ClientRegistrationResponse {
        client_id: client.client_id,
        granted_resource: client.resource,
    };
    encoded_response(&codec, &response)
}

/// DELETE /client/{id}.
pub async fn unregister_client(Path(_client_id): Path<String>) -> ServiceError {
    ServiceError::NotImplemented
}

/// GET /resource/{clientid}: plain list of the client's assigned nodes, or
/// the watch stream when `?watch=true`.
pub async fn resource(
    State(state): State<AppState>,
    Path(client_id): Path<String>,
    Query(query): Query<ResourceQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ServiceError> {
    let codec = Codec::negotiate(&headers);
    if query.watch.as_deref() == Some("true") {
        serve_watch(state, client_id, codec, body)
    } else {
        serve_list(state, client_id, codec)
    }
}

/// Encode the node list, splitting it into successive JSON arrays of at most
/// `chunk_size` nodes when it exceeds one chunk. The client reassembles by
/// decoding consecutive JSON values off the stream.
fn serve_list(state: AppState, client_id: String, codec: Codec) -> Result<Response, ServiceError> {
    let (nodes, _) = state.distributor.list_nodes_for_client(&client_id)?;
    counter!("grs_list_requests_total").increment(1);
    tracing::debug!(client_id = %client_id, nodes = nodes.len(), "serving node list");

    if nodes.len() <= state.chunk_size {
        return encoded_response(&codec, &nodes);
    }

    let mut chunks = Vec::with_capacity(nodes.len().div_ceil(state.chunk_size));
    for chunk in nodes.chunks(state.chunk_size) {
        chunks.push(Bytes::from(codec.encode(&chunk).map_err(internal)?));
    }
    let body = Body::from_stream(stream::iter(chunks.into_iter().map(Ok::<_, Infallible>)));
    Response::builder()
        .header(CONTENT_TYPE, codec.content_type())
        .header("X-Content-Type-Options", "nosniff")
        .body(body)
        .map_err(internal)
}

/// Stream node events for the client, one JSON value per message. The
/// request body carries the composite resource version to resume from.
fn serve_watch(
    state: AppState,
    client_id: String,
    codec: Codec,
    body: Bytes,
) -> Result<Response, ServiceError> {
    let request: WatchRequest = if body.is_empty() {
        WatchRequest::default()
    } else {
        codec
            .decode(&body)
            .map_err(|err| ServiceError::RequestDecoding(err.to_string()))?
    };

    let session = state
        .distributor
        .watch(&client_id, &request.resource_versions)?;
    counter!("grs_watch_requests_total").increment(1);
    tracing::debug!(client_id = %client_id, "serving watch");

    let stream = stream::unfold(session, move |mut session| async move {
        let first = session.recv().await?;
        // Drain whatever is already queued so one write flushes a batch.
        let mut events = vec![first];
        while let Some(event) = session.try_recv() {
            events.push(event);
        }
        let mut buf: Vec<u8> = Vec::new();
        for event in &events {
            match codec.encode(event.as_ref()) {
                Ok(bytes) => {
                    buf.extend_from_slice(&bytes);
                    buf.push(b'\n');
                    event.observe_latency();
                }
                Err(err) => {
                    tracing::error!("failed to encode watch event: {}", err);
                    return None;
                }
            }
        }
        Some((Ok::<Bytes, Infallible>(Bytes::from(buf)), session))
    });

    Response::builder()
        .header(CONTENT_TYPE, codec.content_type())
        .body(Body::from_stream(stream))
        .map_err(internal)
}

fn encoded_response<T: serde::Serialize>(
    codec: &Codec,
    value: &T,
) -> Result<Response, ServiceError> {
    let body = codec.encode(value).map_err(internal)?;
    Response::builder()
        .header(CONTENT_TYPE, codec.content_type())
        .body(Body::from(body))
        .map_err(internal)
}

fn internal<E: Display>(err: E) -> ServiceError {
    ServiceError::Internal(err.to_string())
}
