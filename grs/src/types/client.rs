use serde::{Deserialize, Serialize};

use super::version::ResourceVersionMap;

/// Resources granted to (or requested by) one client, as a machine count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResourceRequest {
    pub total_machines: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ClientInfo {
    /// Friendly name, distinct from the assigned client id.
    pub client_name: String,
    /// Where the client itself runs.
    pub region: String,
}

/// A registered scheduler-like consumer of the service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Client {
    pub client_id: String,
    pub resource: ResourceRequest,
    pub client_info: ClientInfo,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ClientRegistrationRequest {
    pub initial_requested_resource: ResourceRequest,
    pub client_info: ClientInfo,
}

/// The initial resource request is either denied or granted in full.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ClientRegistrationResponse {
    pub client_id: String,
    pub granted_resource: ResourceRequest,
}

/// Body of a watch call: the composite resource version to resume from. It
/// travels in the request body because it can hold hundreds of partition
/// entries, which do not fit in query parameters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WatchRequest {
    pub resource_versions: ResourceVersionMap,
}
