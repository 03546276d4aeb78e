use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::distributor::DistributorError;

/// Error taxonomy of the service API. Each kind maps to one HTTP status;
/// transient ingestion errors never reach clients, they are retried inside
/// the aggregator.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("failed to decode request: {0}")]
    RequestDecoding(String),

    #[error("requested machine count {0} is out of range")]
    InvalidResourceRequest(usize),
    #[error("client {0} is already registered")]
    AlreadyRegistered(String),

    #[error("unknown client: {0}")]
    UnknownClient(String),

    #[error("not enough free nodes to satisfy the request")]
    CapacityExceeded,

    #[error("not implemented")]
    NotImplemented,

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<DistributorError> for ServiceError {
    fn from(err: DistributorError) -> Self {
        match err {
            DistributorError::InvalidRequest(requested) => {
                ServiceError::InvalidResourceRequest(requested)
            }
            DistributorError::AlreadyRegistered(client_id) => {
                ServiceError::AlreadyRegistered(client_id)
            }
            DistributorError::UnknownClient(client_id) => ServiceError::UnknownClient(client_id),
            DistributorError::CapacityExceeded { .. } => ServiceError::CapacityExceeded,
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        match self {
            ServiceError::RequestDecoding(_)
            | ServiceError::InvalidResourceRequest(_)
            | ServiceError::AlreadyRegistered(_) => (StatusCode::BAD_REQUEST, self.to_string()),

            ServiceError::UnknownClient(_) => (StatusCode::NOT_FOUND, self.to_string()),

            ServiceError::CapacityExceeded => (StatusCode::SERVICE_UNAVAILABLE, self.to_string()),

            ServiceError::NotImplemented => (StatusCode::NOT_IMPLEMENTED, self.to_string()),

            ServiceError::Internal(_) => {
                tracing::error!("request failed: {}", self);
                (StatusCode::INTERNAL_SERVER_ERROR, self.to_string())
            }
        }
        .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_map_to_expected_statuses() {
        let cases = [
            (
                ServiceError::RequestDecoding("bad json".into()),
                StatusCode::BAD_REQUEST,
            ),
            (
                ServiceError::InvalidResourceRequest(0),
                StatusCode::BAD_REQUEST,
            ),
            (
                ServiceError::UnknownClient("client-nope".into()),
                StatusCode::NOT_FOUND,
            ),
            (
                ServiceError::CapacityExceeded,
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (ServiceError::NotImplemented, StatusCode::NOT_IMPLEMENTED),
            (
                ServiceError::Internal("boom".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(err.into_response().status(), status);
        }
    }
}
