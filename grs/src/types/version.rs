use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Region identifiers are small integers for cheap hashing and comparison.
/// The known deployments enumerate them from zero; the type leaves room for
/// growth without a schema change.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct RegionName(pub u16);

/// Finest-grained location subdivision within a region.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ResourcePartitionName(pub u16);

/// A (region, resource partition) pair. Every node, event queue and resource
/// version is keyed by one of these.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Location {
    pub region: RegionName,
    pub resource_partition: ResourcePartitionName,
}

impl Location {
    pub const fn new(region: u16, resource_partition: u16) -> Self {
        Self {
            region: RegionName(region),
            resource_partition: ResourcePartitionName(resource_partition),
        }
    }
}

/// The composite text form used as JSON object key, since JSON object keys
/// must be strings.
impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.region.0, self.resource_partition.0)
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("{0:?} is not a valid region/partition key")]
pub struct ParseLocationError(String);

impl FromStr for Location {
    type Err = ParseLocationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (region, partition) = s
            .split_once('/')
            .ok_or_else(|| ParseLocationError(s.to_owned()))?;
        let region = region
            .parse::<u16>()
            .map_err(|_| ParseLocationError(s.to_owned()))?;
        let partition = partition
            .parse::<u16>()
            .map_err(|_| ParseLocationError(s.to_owned()))?;
        Ok(Location::new(region, partition))
    }
}

/// The composite resource version: one resource version per location. This is
/// the cursor clients exchange with the service to resume a watch, and the
/// watermark the aggregator resumes each region watch from.
///
/// Values only move forward through [`ResourceVersionMap::merge_max`]; within
/// a partition they follow the order events were admitted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceVersionMap(HashMap<Location, u64>);

impl ResourceVersionMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, location: Location) -> Option<u64> {
        self.0.get(&location).copied()
    }

    pub fn set(&mut self, location: Location, rv: u64) {
        self.0.insert(location, rv);
    }

    /// Raise the entry for `location` to `rv` if it is higher than what we
    /// already hold.
    pub fn merge_max(&mut self, location: Location, rv: u64) {
        let entry = self.0.entry(location).or_insert(rv);
        if *entry < rv {
            *entry = rv;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Location, u64)> + '_ {
        self.0.iter().map(|(loc, rv)| (*loc, *rv))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(Location, u64)> for ResourceVersionMap {
    fn from_iter<T: IntoIterator<Item = (Location, u64)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Serialize for ResourceVersionMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (location, rv) in &self.0 {
            map.serialize_entry(&location.to_string(), rv)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for ResourceVersionMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct RvMapVisitor;

        impl<'de> Visitor<'de> for RvMapVisitor {
            type Value = ResourceVersionMap;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a map of \"region/partition\" keys to resource versions")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut map = HashMap::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((key, rv)) = access.next_entry::<String, u64>()? {
                    let location = key.parse::<Location>().map_err(serde::de::Error::custom)?;
                    map.insert(location, rv);
                }
                Ok(ResourceVersionMap(map))
            }
        }

        deserializer.deserialize_map(RvMapVisitor)
    }
}
