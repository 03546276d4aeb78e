pub mod client;
pub mod event;
pub mod node;
pub mod version;

pub use client::{
    Client, ClientInfo, ClientRegistrationRequest, ClientRegistrationResponse, ResourceRequest,
    WatchRequest,
};
pub use event::{Checkpoint, EventType, NodeEvent};
pub use node::{LogicalNode, NodeGeoInfo, NodeResource, NodeSpecialHardwareInfo, NodeTaints};
pub use version::{Location, ParseLocationError, RegionName, ResourcePartitionName, ResourceVersionMap};

/// Prefix of every client id handed out at registration.
pub const CLIENT_ID_PREFIX: &str = "client";

/// Machine count a single registration is allowed to request, inclusive.
pub const MIN_TOTAL_MACHINES_PER_REQUEST: usize = 1;
pub const MAX_TOTAL_MACHINES_PER_REQUEST: usize = 25_000;

/// Capacity of the per-watcher outbound event channel. A watcher that lets
/// this many events pile up is considered a slow consumer and gets resynced.
pub const WATCH_CHANNEL_SIZE: usize = 100;
