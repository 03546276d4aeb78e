use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::version::{Location, RegionName, ResourcePartitionName};

/// Node location info for application placement. Region and resource
/// partition are required; data center, availability zone and fault domain
/// are optional hints for fine-tuned placement.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeGeoInfo {
    pub region: RegionName,
    #[serde(rename = "rp")]
    pub resource_partition: ResourcePartitionName,

    #[serde(rename = "dc", default, skip_serializing_if = "String::is_empty")]
    pub data_center: String,
    #[serde(rename = "az", default, skip_serializing_if = "String::is_empty")]
    pub availability_zone: String,
    #[serde(rename = "fd", default, skip_serializing_if = "String::is_empty")]
    pub fault_domain: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeTaints {
    /// Do not allow new pods to schedule onto the node unless they tolerate
    /// the taint. Enforced by the scheduler.
    pub no_schedule: bool,
    /// Evict any already-running pods that do not tolerate the taint.
    pub no_execute: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSpecialHardwareInfo {
    #[serde(rename = "hasgpu")]
    pub has_gpu: bool,
    #[serde(rename = "hasfpga")]
    pub has_fpga: bool,
}

/// Resources on the node that schedulers can place workloads against.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeResource {
    pub milli_cpu: i64,
    pub memory: i64,
    pub ephemeral_storage: i64,
    // Stored explicitly as an int to avoid conversions on the hot path.
    pub allowed_pod_number: i32,
    /// Scalar resources such as GPU or FPGA counts.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub scalar_resources: HashMap<String, i64>,
}

/// The abstraction of a node in the resource clusters: the minimum set of
/// information a scheduler needs to place workloads in the region-less
/// platform.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogicalNode {
    /// Node UUID from its resource partition cluster.
    pub id: String,

    /// The resource version assigned by the resource partition cluster.
    /// Decimal string on the wire, monotonic within the partition.
    pub resource_version: String,

    pub geo_info: NodeGeoInfo,

    pub taints: NodeTaints,

    pub special_hardware_types: NodeSpecialHardwareInfo,

    pub allocatable_resource: NodeResource,

    /// Short form of the node condition array: each bit is one condition.
    pub conditions: i32,

    /// Whether the node is reserved at the resource partition cluster level.
    pub reserved: bool,

    /// Category of the node, such as highend, lowend, medium.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub machine_type: String,

    /// When the node status was last updated in its resource partition.
    pub last_updated_time: DateTime<Utc>,
}

impl LogicalNode {
    pub fn location(&self) -> Location {
        Location {
            region: self.geo_info.region,
            resource_partition: self.geo_info.resource_partition,
        }
    }

    /// Numeric form of the resource version. A malformed version is logged
    /// and mapped to zero, which every watermark check treats as stale.
    pub fn resource_version_u64(&self) -> u64 {
        match self.resource_version.parse::<u64>() {
            Ok(rv) => rv,
            Err(_) => {
                tracing::error!(
                    "unable to convert resource version {} to u64",
                    self.resource_version
                );
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_json_diff::assert_json_include;
    use serde_json::json;

    use super::*;

    fn sample_node() -> LogicalNode {
        LogicalNode {
            id: "8f9d2c1e-0000-4000-8000-000000000001".to_string(),
            resource_version: "12".to_string(),
            geo_info: NodeGeoInfo {
                region: RegionName(1),
                resource_partition: ResourcePartitionName(4),
                data_center: "dc-1".to_string(),
                ..Default::default()
            },
            taints: NodeTaints {
                no_schedule: true,
                no_execute: false,
            },
            special_hardware_types: NodeSpecialHardwareInfo {
                has_gpu: true,
                has_fpga: false,
            },
            allocatable_resource: NodeResource {
                milli_cpu: 8000,
                memory: 32 << 30,
                ephemeral_storage: 100 << 30,
                allowed_pod_number: 110,
                scalar_resources: HashMap::from([("nvidia.com/gpu".to_string(), 2)]),
            },
            conditions: 0b1,
            reserved: false,
            machine_type: "highend".to_string(),
            last_updated_time: Utc::now(),
        }
    }

    #[test]
    fn node_json_round_trips() {
        let node = sample_node();
        let encoded = serde_json::to_string(&node).unwrap();
        let decoded: LogicalNode = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, node);
    }

    #[test]
    fn node_wire_field_names() {
        let encoded = serde_json::to_value(sample_node()).unwrap();
        assert_json_include!(
            actual: encoded,
            expected: json!({
                "id": "8f9d2c1e-0000-4000-8000-000000000001",
                "resource_version": "12",
                "geo_info": {"region": 1, "rp": 4, "dc": "dc-1"},
                "taints": {"no_schedule": true, "no_execute": false},
                "special_hardware_types": {"hasgpu": true, "hasfpga": false},
                "allocatable_resource": {"milli_cpu": 8000, "allowed_pod_number": 110},
            })
        );
    }

    #[test]
    fn malformed_resource_version_maps_to_zero() {
        let node = LogicalNode {
            resource_version: "not-a-number".to_string(),
            ..sample_node()
        };
        assert_eq!(node.resource_version_u64(), 0);
    }
}
