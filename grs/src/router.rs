use std::future::ready;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    routing::{delete, get, post},
    Router,
};
use health::HealthRegistry;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::distributor::ResourceDistributor;
use crate::handlers;
use crate::prometheus::{setup_metrics_recorder, track_metrics};

/// Read/write deadline for the non-streaming request paths. Streaming bodies
/// (list chunks, watch) are exempt: the layer only bounds producing the
/// response head.
const HTTP_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone)]
pub struct AppState {
    pub distributor: Arc<ResourceDistributor>,
    pub chunk_size: usize,
}

async fn index() -> &'static str {
    "global-resource-service"
}

pub fn router(
    distributor: Arc<ResourceDistributor>,
    liveness: HealthRegistry,
    chunk_size: usize,
    metrics: bool,
) -> Router {
    let state = AppState {
        distributor,
        chunk_size,
    };

    let router = Router::new()
        .route("/", get(index))
        .route("/client", post(handlers::register_client))
        .route("/client/:client_id", delete(handlers::unregister_client))
        // PUT/PATCH and friends fall through to the 405 the method router
        // produces.
        .route("/resource/:client_id", get(handlers::resource))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(liveness.get_status())))
        .layer(TimeoutLayer::new(HTTP_TIMEOUT))
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(track_metrics))
        .with_state(state);

    // Don't install metrics unless asked to: installing a global recorder
    // when the crate is used as a library (during tests etc) does not work
    // well.
    if metrics {
        let recorder_handle = setup_metrics_recorder();

        router.route("/metrics", get(move || ready(recorder_handle.render())))
    } else {
        router
    }
}
