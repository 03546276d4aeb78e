//! The distributor owns the global node store and fans events out to
//! registered clients.
//!
//! State is sharded by (region, resource partition): each partition guards
//! its node set, event queue and registered watchers behind one mutex, and
//! cross-partition operations take partition locks in location order. The
//! client registry sits behind a single reader/writer lock, acquired before
//! any partition lock. Assignment sets and the node location index are leaf
//! locks, never held while acquiring the ones above.

pub mod event_queue;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use metrics::counter;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use crate::types::{
    Checkpoint, Client, EventType, Location, LogicalNode, NodeEvent, ResourceVersionMap,
    MAX_TOTAL_MACHINES_PER_REQUEST, MIN_TOTAL_MACHINES_PER_REQUEST, WATCH_CHANNEL_SIZE,
};
use self::event_queue::{EventQueue, EventRange, DEFAULT_EVENT_QUEUE_CAPACITY};

#[derive(Error, Debug)]
pub enum DistributorError {
    #[error("requested machine count {0} is out of range")]
    InvalidRequest(usize),
    #[error("client {0} is already registered")]
    AlreadyRegistered(String),
    #[error("unknown client: {0}")]
    UnknownClient(String),
    #[error("cannot grant {requested} machines, only {free} free")]
    CapacityExceeded { requested: usize, free: usize },
}

/// Seam between the aggregator and the distributor: anything that can absorb
/// a batch of node events and report the resulting per-partition watermarks.
pub trait EventProcessor: Send + Sync {
    /// Apply a batch of events. Events at or below the current per-partition
    /// watermark are silently ignored, so re-ingestion of duplicates is safe.
    /// Returns whether every event was well-formed, plus the updated
    /// max-RV-per-partition composite version.
    fn process_events(&self, events: Vec<NodeEvent>) -> (bool, ResourceVersionMap);
}

/// The node subset granted to one client. `ids` is the flat membership used
/// to filter event delivery, `by_location` the per-partition breakdown used
/// by list and unregistration. Filled in on the client's first list call and
/// stable afterwards, modulo backfill after deletions.
#[derive(Default)]
struct Assignment {
    computed: bool,
    ids: HashSet<String>,
    by_location: HashMap<Location, HashSet<String>>,
}

struct ClientEntry {
    client: Client,
    assignment: Arc<RwLock<Assignment>>,
}

struct Watcher {
    client_id: String,
    sender: mpsc::Sender<Arc<NodeEvent>>,
    assignment: Arc<RwLock<Assignment>>,
    cancelled: AtomicBool,
    distributor: Weak<ResourceDistributor>,
}

impl Watcher {
    /// Returns true on the first cancellation.
    fn cancel(&self) -> bool {
        !self.cancelled.swap(true, Ordering::SeqCst)
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn wants(&self, node_id: &str) -> bool {
        self.assignment
            .read()
            .expect("poisoned assignment lock")
            .ids
            .contains(node_id)
    }

    /// Queue one event for this watcher. A full channel means the consumer
    /// fell behind: the watcher is cancelled and a resync is scheduled, which
    /// detaches it everywhere, emits a BOOKMARK with the latest composite
    /// version and lets the channel close.
    fn deliver(self: &Arc<Self>, event: Arc<NodeEvent>) {
        if self.is_cancelled() {
            return;
        }
        match self.sender.try_send(event) {
            Ok(()) => {
                counter!("grs_watch_events_delivered_total").increment(1);
            }
            Err(TrySendError::Full(_)) => {
                if self.cancel() {
                    warn!(
                        client_id = %self.client_id,
                        "watch consumer too slow, forcing resync"
                    );
                    counter!("grs_watch_resyncs_total").increment(1);
                    if let Some(distributor) = self.distributor.upgrade() {
                        let watcher = self.clone();
                        tokio::spawn(async move {
                            distributor.detach_watcher(&watcher);
                            let crv = distributor.current_resource_versions();
                            // Waits for the consumer to free a slot; aborted
                            // by the send error once the receiver is dropped.
                            drop(watcher.sender.send(Arc::new(NodeEvent::bookmark(crv))).await);
                        });
                    }
                }
            }
            Err(TrySendError::Closed(_)) => {
                self.cancel();
            }
        }
    }
}

/// A live watch registration. Dropping the session (client disconnect or
/// explicit stop) detaches the watcher and closes its channel exactly once.
pub struct WatchSession {
    receiver: mpsc::Receiver<Arc<NodeEvent>>,
    watcher: Weak<Watcher>,
    distributor: Arc<ResourceDistributor>,
}

impl WatchSession {
    pub async fn recv(&mut self) -> Option<Arc<NodeEvent>> {
        self.receiver.recv().await
    }

    /// Non-blocking receive, used to drain the queue between flushes.
    pub fn try_recv(&mut self) -> Option<Arc<NodeEvent>> {
        self.receiver.try_recv().ok()
    }
}

impl Drop for WatchSession {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.upgrade() {
            watcher.cancel();
            self.distributor.detach_watcher(&watcher);
        }
    }
}

struct PartitionState {
    /// Latest version of each node, plus the insertion order assignment
    /// selection walks.
    nodes: HashMap<String, LogicalNode>,
    order: Vec<String>,
    /// How many clients hold each node. Nodes absent from the map are free.
    assigned: HashMap<String, usize>,
    queue: EventQueue,
    watchers: Vec<Arc<Watcher>>,
}

struct Partition {
    state: Mutex<PartitionState>,
}

impl Partition {
    fn new(queue_capacity: usize) -> Self {
        Self {
            state: Mutex::new(PartitionState {
                nodes: HashMap::new(),
                order: Vec::new(),
                assigned: HashMap::new(),
                queue: EventQueue::new(queue_capacity),
                watchers: Vec::new(),
            }),
        }
    }
}

pub struct ResourceDistributor {
    /// BTreeMap so that iteration visits partitions in location order, which
    /// is also the lock acquisition order.
    partitions: RwLock<BTreeMap<Location, Arc<Partition>>>,
    clients: RwLock<HashMap<String, ClientEntry>>,
    /// Node id to current partition, for cross-partition move detection.
    node_index: RwLock<HashMap<String, Location>>,
    queue_capacity: usize,
}

impl Default for ResourceDistributor {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_QUEUE_CAPACITY)
    }
}

impl ResourceDistributor {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            partitions: RwLock::new(BTreeMap::new()),
            clients: RwLock::new(HashMap::new()),
            node_index: RwLock::new(HashMap::new()),
            queue_capacity,
        }
    }

    /// Register a client and reserve its machine count against the free
    /// node pool. The actual node subset is picked lazily on first list.
    pub fn register_client(&self, client: Client) -> Result<(), DistributorError> {
        let requested = client.resource.total_machines;
        if !(MIN_TOTAL_MACHINES_PER_REQUEST..=MAX_TOTAL_MACHINES_PER_REQUEST).contains(&requested)
        {
            return Err(DistributorError::InvalidRequest(requested));
        }

        let mut clients = self.clients.write().expect("poisoned client registry");
        if clients.contains_key(&client.client_id) {
            return Err(DistributorError::AlreadyRegistered(client.client_id));
        }

        let reserved: usize = clients
            .values()
            .map(|entry| entry.client.resource.total_machines)
            .sum();
        let free = self.total_nodes().saturating_sub(reserved);
        if requested > free {
            return Err(DistributorError::CapacityExceeded { requested, free });
        }

        debug!(client_id = %client.client_id, requested, "registering client");
        clients.insert(
            client.client_id.clone(),
            ClientEntry {
                client,
                assignment: Arc::new(RwLock::new(Assignment::default())),
            },
        );
        counter!("grs_clients_registered_total").increment(1);
        Ok(())
    }

    /// Drop a client: release its reserved nodes and cancel its watchers.
    pub fn unregister_client(&self, client_id: &str) -> Result<(), DistributorError> {
        let entry = {
            let mut clients = self.clients.write().expect("poisoned client registry");
            clients
                .remove(client_id)
                .ok_or_else(|| DistributorError::UnknownClient(client_id.to_owned()))?
        };

        let by_location = {
            let assignment = entry.assignment.read().expect("poisoned assignment lock");
            assignment.by_location.clone()
        };

        let partitions = self.partitions.read().expect("poisoned partition map");
        for (location, ids) in by_location {
            if let Some(partition) = partitions.get(&location) {
                let mut state = partition.state.lock().expect("poisoned partition state");
                for id in ids {
                    if let Some(count) = state.assigned.get_mut(&id) {
                        *count -= 1;
                        if *count == 0 {
                            state.assigned.remove(&id);
                        }
                    }
                }
            }
        }
        for partition in partitions.values() {
            let mut state = partition.state.lock().expect("poisoned partition state");
            state.watchers.retain(|watcher| {
                if watcher.client_id == client_id {
                    watcher.cancel();
                    false
                } else {
                    true
                }
            });
        }
        Ok(())
    }

    /// Return a defensive copy of the client's assigned nodes and the
    /// composite version to start the subsequent watch from: the max
    /// resource version per partition among the assigned nodes. The
    /// assignment is computed on the first call and stable afterwards.
    pub fn list_nodes_for_client(
        &self,
        client_id: &str,
    ) -> Result<(Vec<LogicalNode>, ResourceVersionMap), DistributorError> {
        {
            let clients = self.clients.read().expect("poisoned client registry");
            let entry = clients
                .get(client_id)
                .ok_or_else(|| DistributorError::UnknownClient(client_id.to_owned()))?;
            let assignment = entry.assignment.read().expect("poisoned assignment lock");
            if assignment.computed {
                let by_location = assignment.by_location.clone();
                drop(assignment);
                drop(clients);
                return Ok(self.collect_assigned(&by_location));
            }
        }

        // First list for this client: compute the assignment under the
        // registry write lock, which serializes allocation decisions.
        let clients = self.clients.write().expect("poisoned client registry");
        let entry = clients
            .get(client_id)
            .ok_or_else(|| DistributorError::UnknownClient(client_id.to_owned()))?;
        {
            let assignment = entry.assignment.read().expect("poisoned assignment lock");
            if assignment.computed {
                let by_location = assignment.by_location.clone();
                drop(assignment);
                drop(clients);
                return Ok(self.collect_assigned(&by_location));
            }
        }

        let plan = self.plan_assignment(entry.client.resource.total_machines);
        let by_location = {
            let mut assignment = entry.assignment.write().expect("poisoned assignment lock");
            for (location, ids) in &plan {
                assignment
                    .by_location
                    .entry(*location)
                    .or_default()
                    .extend(ids.iter().cloned());
                assignment.ids.extend(ids.iter().cloned());
            }
            assignment.computed = true;
            assignment.by_location.clone()
        };
        drop(clients);

        Ok(self.collect_assigned(&by_location))
    }

    /// Start a watch for a client. Replays queued events past the given
    /// composite version that touch the client's assignment, then stays
    /// live. Per-partition delivery order equals admission order; there is
    /// no ordering across partitions.
    pub fn watch(
        self: &Arc<Self>,
        client_id: &str,
        resource_versions: &ResourceVersionMap,
    ) -> Result<WatchSession, DistributorError> {
        let assignment = {
            let clients = self.clients.read().expect("poisoned client registry");
            clients
                .get(client_id)
                .ok_or_else(|| DistributorError::UnknownClient(client_id.to_owned()))?
                .assignment
                .clone()
        };

        let (sender, receiver) = mpsc::channel(WATCH_CHANNEL_SIZE);
        let watcher = Arc::new(Watcher {
            client_id: client_id.to_owned(),
            sender,
            assignment,
            cancelled: AtomicBool::new(false),
            distributor: Arc::downgrade(self),
        });

        // Snapshot the partition list so no map lock is held across the
        // replay; partitions created afterwards cannot hold assigned nodes.
        let partition_list: Vec<(Location, Arc<Partition>)> = {
            let partitions = self.partitions.read().expect("poisoned partition map");
            partitions
                .iter()
                .map(|(location, partition)| (*location, partition.clone()))
                .collect()
        };
        for (location, partition) in partition_list {
            let mut state = partition.state.lock().expect("poisoned partition state");
            let from = resource_versions.get(location).unwrap_or(0);
            match state.queue.range_from(from) {
                EventRange::ResyncRequired => {
                    // The client's cursor fell off the queue: tell it to
                    // re-list instead of replaying a hole.
                    drop(state);
                    warn!(
                        client_id,
                        location = %location,
                        from,
                        "watch cursor older than retained events, forcing resync"
                    );
                    counter!("grs_watch_resyncs_total").increment(1);
                    watcher.cancel();
                    self.detach_watcher(&watcher);
                    let crv = self.current_resource_versions();
                    drop(watcher.sender.try_send(Arc::new(NodeEvent::bookmark(crv))));
                    return Ok(WatchSession {
                        receiver,
                        watcher: Arc::downgrade(&watcher),
                        distributor: self.clone(),
                    });
                }
                EventRange::Events(events) => {
                    for event in events {
                        let Some(node) = &event.node else { continue };
                        if watcher.wants(&node.id) {
                            watcher.deliver(event);
                            if watcher.is_cancelled() {
                                break;
                            }
                        }
                    }
                    if watcher.is_cancelled() {
                        break;
                    }
                    // Register only after the replay so that live fan-out
                    // cannot interleave with it out of order.
                    state.watchers.push(watcher.clone());
                }
            }
        }

        Ok(WatchSession {
            receiver,
            watcher: Arc::downgrade(&watcher),
            distributor: self.clone(),
        })
    }

    pub fn total_nodes(&self) -> usize {
        let partitions = self.partitions.read().expect("poisoned partition map");
        partitions
            .values()
            .map(|partition| {
                partition
                    .state
                    .lock()
                    .expect("poisoned partition state")
                    .nodes
                    .len()
            })
            .sum()
    }

    /// Latest admitted resource version per partition.
    pub fn current_resource_versions(&self) -> ResourceVersionMap {
        let partitions = self.partitions.read().expect("poisoned partition map");
        let mut crv = ResourceVersionMap::new();
        for (location, partition) in partitions.iter() {
            let state = partition.state.lock().expect("poisoned partition state");
            let latest = state.queue.latest_rv();
            if latest > 0 {
                crv.set(*location, latest);
            }
        }
        crv
    }

    fn apply_events(&self, events: Vec<NodeEvent>) -> (bool, ResourceVersionMap) {
        let mut ok = true;

        let mut groups: BTreeMap<Location, Vec<NodeEvent>> = BTreeMap::new();
        for mut event in events {
            event.set_checkpoint(Checkpoint::DistributorReceived);
            let location = event.node.as_ref().map(LogicalNode::location);
            match location {
                Some(location) if event.event_type.is_node_change() => {
                    groups.entry(location).or_default().push(event);
                }
                _ => {
                    debug!(event_type = ?event.event_type, "ignoring event without node change");
                }
            }
        }

        // Cross-partition cleanups are deferred until the source partition
        // lock is released, to keep lock acquisition in location order.
        let mut relocations: Vec<(String, Location)> = Vec::new();
        let mut deleted_assigned: Vec<(Location, String)> = Vec::new();

        for (location, mut group) in groups {
            group.sort_by_key(NodeEvent::resource_version);
            let partition = self.partition(location);
            let mut state = partition.state.lock().expect("poisoned partition state");

            for mut event in group {
                let rv = event.resource_version();
                if rv == 0 {
                    warn!(location = %location, "dropping event with unusable resource version");
                    ok = false;
                    continue;
                }
                if rv <= state.queue.latest_rv() {
                    counter!("grs_events_duplicate_total").increment(1);
                    continue;
                }
                let Some(node) = event.node.clone() else {
                    continue;
                };

                match event.event_type {
                    EventType::Added | EventType::Modified => {
                        let previous = self
                            .node_index
                            .write()
                            .expect("poisoned node index")
                            .insert(node.id.clone(), location);
                        if let Some(previous) = previous {
                            if previous != location {
                                // A node's partition is immutable; treat the
                                // move as delete-from-old plus add-here.
                                warn!(
                                    node_id = %node.id,
                                    from = %previous,
                                    to = %location,
                                    "node changed partition"
                                );
                                relocations.push((node.id.clone(), previous));
                            }
                        }
                        if !state.nodes.contains_key(&node.id) {
                            state.order.push(node.id.clone());
                        }
                        state.nodes.insert(node.id.clone(), node.clone());
                    }
                    EventType::Deleted => {
                        self.node_index
                            .write()
                            .expect("poisoned node index")
                            .remove(&node.id);
                        if state.nodes.remove(&node.id).is_some() {
                            state.order.retain(|id| id != &node.id);
                        }
                        if state.assigned.remove(&node.id).is_some() {
                            deleted_assigned.push((location, node.id.clone()));
                        }
                    }
                    EventType::Bookmark | EventType::Error => {}
                }

                event.set_checkpoint(Checkpoint::DistributorSending);
                let event = Arc::new(event);
                state.queue.append(rv, event.clone());
                counter!("grs_events_processed_total").increment(1);

                // Fan out under the partition lock so delivery order per
                // partition matches admission order.
                let watchers = std::mem::take(&mut state.watchers);
                let mut kept = Vec::with_capacity(watchers.len());
                for watcher in watchers {
                    if watcher.is_cancelled() {
                        continue;
                    }
                    if watcher.wants(&node.id) {
                        watcher.deliver(event.clone());
                    }
                    if !watcher.is_cancelled() {
                        kept.push(watcher);
                    }
                }
                state.watchers = kept;
            }
        }

        for (node_id, old_location) in relocations {
            let partitions = self.partitions.read().expect("poisoned partition map");
            if let Some(partition) = partitions.get(&old_location) {
                let mut state = partition.state.lock().expect("poisoned partition state");
                if state.nodes.remove(&node_id).is_some() {
                    state.order.retain(|id| id != &node_id);
                }
            }
        }

        for (location, node_id) in deleted_assigned {
            self.backfill(location, &node_id);
        }

        (ok, self.current_resource_versions())
    }

    /// Replace a deleted assigned node in every affected client assignment,
    /// drawing from the same partition. Free nodes are preferred; when none
    /// remain the least-shared assigned node is handed out, so assignments
    /// can overlap.
    fn backfill(&self, location: Location, deleted_id: &str) {
        let clients = self.clients.read().expect("poisoned client registry");
        let partitions = self.partitions.read().expect("poisoned partition map");
        let Some(partition) = partitions.get(&location) else {
            return;
        };

        for entry in clients.values() {
            let holds = {
                let assignment = entry.assignment.read().expect("poisoned assignment lock");
                assignment.computed && assignment.ids.contains(deleted_id)
            };
            if !holds {
                continue;
            }

            let replacement = {
                let mut state = partition.state.lock().expect("poisoned partition state");
                let assignment = entry.assignment.read().expect("poisoned assignment lock");
                let candidate = state
                    .order
                    .iter()
                    .filter(|id| !assignment.ids.contains(*id))
                    .min_by_key(|id| state.assigned.get(*id).copied().unwrap_or(0))
                    .cloned();
                drop(assignment);
                if let Some(id) = &candidate {
                    *state.assigned.entry(id.clone()).or_insert(0) += 1;
                }
                candidate
            };

            let mut assignment = entry.assignment.write().expect("poisoned assignment lock");
            assignment.ids.remove(deleted_id);
            if let Some(ids) = assignment.by_location.get_mut(&location) {
                ids.remove(deleted_id);
            }
            if let Some(new_id) = replacement {
                debug!(
                    client_id = %entry.client.client_id,
                    deleted_id,
                    new_id = %new_id,
                    "backfilled deleted node"
                );
                assignment.ids.insert(new_id.clone());
                assignment
                    .by_location
                    .entry(location)
                    .or_default()
                    .insert(new_id);
            }
        }
    }

    /// Pick `requested` nodes across partitions, proportionally to each
    /// partition's free node count, rounded by largest remainder. Selection
    /// within a partition follows insertion order. Assignment counts are
    /// bumped as part of the plan.
    fn plan_assignment(&self, requested: usize) -> Vec<(Location, Vec<String>)> {
        let partitions = self.partitions.read().expect("poisoned partition map");

        let free: Vec<(Location, Vec<String>)> = partitions
            .iter()
            .map(|(location, partition)| {
                let state = partition.state.lock().expect("poisoned partition state");
                let ids: Vec<String> = state
                    .order
                    .iter()
                    .filter(|id| !state.assigned.contains_key(*id))
                    .cloned()
                    .collect();
                (*location, ids)
            })
            .collect();

        let total_free: usize = free.iter().map(|(_, ids)| ids.len()).sum();
        let target = requested.min(total_free);
        if target == 0 {
            return Vec::new();
        }

        let mut counts: Vec<usize> = free
            .iter()
            .map(|(_, ids)| target * ids.len() / total_free)
            .collect();
        let mut leftover = target - counts.iter().sum::<usize>();

        let mut by_remainder: Vec<usize> = (0..free.len()).collect();
        by_remainder.sort_by_key(|&i| std::cmp::Reverse((target * free[i].1.len()) % total_free));
        for i in by_remainder {
            if leftover == 0 {
                break;
            }
            if counts[i] < free[i].1.len() {
                counts[i] += 1;
                leftover -= 1;
            }
        }

        let mut plan = Vec::new();
        for (i, (location, ids)) in free.into_iter().enumerate() {
            let take = counts[i];
            if take == 0 {
                continue;
            }
            let partition = partitions
                .get(&location)
                .expect("partition disappeared during planning");
            let mut state = partition.state.lock().expect("poisoned partition state");
            // Nodes deleted since the snapshot are skipped.
            let chosen: Vec<String> = ids
                .into_iter()
                .take(take)
                .filter(|id| state.nodes.contains_key(id))
                .collect();
            for id in &chosen {
                *state.assigned.entry(id.clone()).or_insert(0) += 1;
            }
            plan.push((location, chosen));
        }
        plan
    }

    fn collect_assigned(
        &self,
        by_location: &HashMap<Location, HashSet<String>>,
    ) -> (Vec<LogicalNode>, ResourceVersionMap) {
        let partitions = self.partitions.read().expect("poisoned partition map");
        let mut nodes = Vec::new();
        let mut crv = ResourceVersionMap::new();
        for (location, ids) in by_location {
            let Some(partition) = partitions.get(location) else {
                continue;
            };
            let state = partition.state.lock().expect("poisoned partition state");
            for id in ids {
                if let Some(node) = state.nodes.get(id) {
                    crv.merge_max(*location, node.resource_version_u64());
                    nodes.push(node.clone());
                }
            }
        }
        (nodes, crv)
    }

    fn partition(&self, location: Location) -> Arc<Partition> {
        {
            let partitions = self.partitions.read().expect("poisoned partition map");
            if let Some(partition) = partitions.get(&location) {
                return partition.clone();
            }
        }
        let mut partitions = self.partitions.write().expect("poisoned partition map");
        partitions
            .entry(location)
            .or_insert_with(|| Arc::new(Partition::new(self.queue_capacity)))
            .clone()
    }

    fn detach_watcher(&self, watcher: &Arc<Watcher>) {
        let partitions = self.partitions.read().expect("poisoned partition map");
        for partition in partitions.values() {
            let mut state = partition.state.lock().expect("poisoned partition state");
            state.watchers.retain(|other| !Arc::ptr_eq(other, watcher));
        }
    }
}

impl EventProcessor for ResourceDistributor {
    fn process_events(&self, events: Vec<NodeEvent>) -> (bool, ResourceVersionMap) {
        self.apply_events(events)
    }
}
