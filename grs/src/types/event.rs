use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::node::LogicalNode;
use super::version::ResourceVersionMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "ADDED")]
    Added,
    #[serde(rename = "MODIFIED")]
    Modified,
    #[serde(rename = "DELETED")]
    Deleted,
    #[serde(rename = "BOOKMARK")]
    Bookmark,
    #[serde(rename = "ERROR")]
    Error,
}

impl EventType {
    /// True for the event types that change node state in the store.
    pub fn is_node_change(&self) -> bool {
        matches!(self, EventType::Added | EventType::Modified | EventType::Deleted)
    }
}

/// Stages an event passes through on its way from a region to a client.
/// Indexes into the checkpoint array of a [`NodeEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checkpoint {
    AggregatorReceived = 0,
    DistributorReceived = 1,
    DistributorSending = 2,
    SerializerSent = 3,
}

const CHECKPOINT_COUNT: usize = 4;

static CHECKPOINTS_ENABLED: AtomicBool = AtomicBool::new(false);

/// Toggle per-event latency checkpoints process-wide. Off by default; the
/// extra timestamps cost a clock read per stage per event.
pub fn enable_checkpoints(enabled: bool) {
    CHECKPOINTS_ENABLED.store(enabled, Ordering::Relaxed);
}

pub fn checkpoints_enabled() -> bool {
    CHECKPOINTS_ENABLED.load(Ordering::Relaxed)
}

/// A change to one logical node, or a synthetic marker on the event stream.
///
/// BOOKMARK events carry no node: they advance the watcher's composite
/// resource version and signal that a slow consumer must re-list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<LogicalNode>,

    /// Latest per-partition resource versions, set on BOOKMARK events only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_versions: Option<ResourceVersionMap>,

    #[serde(skip)]
    checkpoints: Option<Box<[Option<DateTime<Utc>>; CHECKPOINT_COUNT]>>,
}

impl NodeEvent {
    pub fn new(event_type: EventType, node: LogicalNode) -> Self {
        Self {
            event_type,
            node: Some(node),
            resource_versions: None,
            checkpoints: None,
        }
    }

    pub fn added(node: LogicalNode) -> Self {
        Self::new(EventType::Added, node)
    }

    pub fn modified(node: LogicalNode) -> Self {
        Self::new(EventType::Modified, node)
    }

    pub fn deleted(node: LogicalNode) -> Self {
        Self::new(EventType::Deleted, node)
    }

    pub fn bookmark(resource_versions: ResourceVersionMap) -> Self {
        Self {
            event_type: EventType::Bookmark,
            node: None,
            resource_versions: Some(resource_versions),
            checkpoints: None,
        }
    }

    /// Resource version of the carried node, zero when there is none.
    pub fn resource_version(&self) -> u64 {
        self.node
            .as_ref()
            .map(LogicalNode::resource_version_u64)
            .unwrap_or(0)
    }

    /// Record the time the event reached the given stage. No-op unless
    /// checkpoints are enabled process-wide.
    pub fn set_checkpoint(&mut self, checkpoint: Checkpoint) {
        if !checkpoints_enabled() {
            return;
        }
        let checkpoints = self
            .checkpoints
            .get_or_insert_with(|| Box::new([None; CHECKPOINT_COUNT]));
        checkpoints[checkpoint as usize] = Some(Utc::now());
    }

    pub fn checkpoint(&self, checkpoint: Checkpoint) -> Option<DateTime<Utc>> {
        self.checkpoints
            .as_ref()
            .and_then(|cps| cps[checkpoint as usize])
    }

    /// Report stage-to-stage latencies for this event to the metrics
    /// recorder. Called once per event at the end of the delivery path.
    pub fn observe_latency(&self) {
        let Some(received) = self.checkpoint(Checkpoint::AggregatorReceived) else {
            return;
        };
        for (checkpoint, stage) in [
            (Checkpoint::DistributorReceived, "distributor_received"),
            (Checkpoint::DistributorSending, "distributor_sending"),
            (Checkpoint::SerializerSent, "serializer_sent"),
        ] {
            if let Some(at) = self.checkpoint(checkpoint) {
                let elapsed = (at - received).num_milliseconds().max(0) as f64 / 1000.0;
                metrics::histogram!("grs_event_stage_latency_seconds", "stage" => stage)
                    .record(elapsed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::node::NodeGeoInfo;
    use super::super::version::Location;
    use super::*;

    fn node(rv: &str) -> LogicalNode {
        LogicalNode {
            id: "node-1".to_string(),
            resource_version: rv.to_string(),
            geo_info: NodeGeoInfo {
                region: super::super::version::RegionName(0),
                resource_partition: super::super::version::ResourcePartitionName(1),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn event_type_wire_names() {
        assert_eq!(
            serde_json::to_string(&EventType::Added).unwrap(),
            "\"ADDED\""
        );
        assert_eq!(
            serde_json::from_str::<EventType>("\"BOOKMARK\"").unwrap(),
            EventType::Bookmark
        );
    }

    #[test]
    fn event_json_round_trips() {
        let event = NodeEvent::modified(node("8"));
        let encoded = serde_json::to_string(&event).unwrap();
        let decoded: NodeEvent = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.event_type, EventType::Modified);
        assert_eq!(decoded.node, event.node);
        assert_eq!(decoded.resource_version(), 8);
    }

    #[test]
    fn bookmark_carries_versions_and_no_node() {
        let mut rvs = ResourceVersionMap::new();
        rvs.set(Location::new(0, 1), 99);
        let encoded = serde_json::to_value(NodeEvent::bookmark(rvs.clone())).unwrap();
        assert_eq!(encoded["type"], "BOOKMARK");
        assert!(encoded.get("node").is_none());

        let decoded: NodeEvent = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded.resource_versions, Some(rvs));
    }

    #[test]
    fn checkpoints_disabled_by_default() {
        let mut event = NodeEvent::added(node("1"));
        event.set_checkpoint(Checkpoint::AggregatorReceived);
        assert!(event.checkpoint(Checkpoint::AggregatorReceived).is_none());
    }
}
