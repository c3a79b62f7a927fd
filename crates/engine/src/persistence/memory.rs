//! In-memory implementation of FlowNodeStore
//!
//! Records live in hash maps behind one `RwLock`. Every record key carries a
//! version counter; transactions remember the versions they read and commit
//! only if none moved. Creating or deleting a flow node also bumps the
//! version of its process's child set, which is what guards queries such as
//! "find the open gateway named X" against concurrent creation.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::trace;
use uuid::Uuid;

use super::store::*;
use crate::model::{
    BusinessDataRef, DataContainer, FlowNodeInstance, ProcessInstance, WaitingEvent,
};

type DataKey = (DataContainer, String);

/// Versioned unit of conflict detection
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum RecordKey {
    Process(Uuid),
    FlowNode(Uuid),
    /// Membership of a process instance's flow node set
    Children(Uuid),
    WaitingEvent(Uuid),
    Data(DataContainer, String),
    BusinessData(DataContainer, String),
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Process(id) => write!(f, "process_instance {id}"),
            Self::FlowNode(id) => write!(f, "flow_node {id}"),
            Self::Children(id) => write!(f, "flow nodes of {id}"),
            Self::WaitingEvent(id) => write!(f, "waiting_event {id}"),
            Self::Data(c, n) => write!(f, "data {c}/{n}"),
            Self::BusinessData(c, n) => write!(f, "business_data {c}/{n}"),
        }
    }
}

#[derive(Default)]
struct Tables {
    processes: HashMap<Uuid, ProcessInstance>,
    flow_nodes: HashMap<Uuid, FlowNodeInstance>,
    waiting_events: HashMap<Uuid, WaitingEvent>,
    data: HashMap<DataKey, Value>,
    business_data: HashMap<DataKey, BusinessDataRef>,
    versions: HashMap<RecordKey, u64>,
}

impl Tables {
    fn version(&self, key: &RecordKey) -> u64 {
        self.versions.get(key).copied().unwrap_or(0)
    }

    fn bump(&mut self, key: RecordKey) {
        *self.versions.entry(key).or_insert(0) += 1;
    }
}

struct Shared {
    tables: RwLock<Tables>,
    unavailable: AtomicU32,
    conflicts: AtomicU32,
    commits: AtomicU64,
}

/// Decrement `counter` if positive, reporting whether it was
fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// In-memory implementation of FlowNodeStore
///
/// Provides the same optimistic semantics a database-backed store must offer,
/// plus fault injection hooks for tests.
///
/// # Example
///
/// ```
/// use flownode_engine::InMemoryFlowNodeStore;
///
/// let store = InMemoryFlowNodeStore::new();
/// assert_eq!(store.commit_count(), 0);
/// ```
#[derive(Clone)]
pub struct InMemoryFlowNodeStore {
    shared: Arc<Shared>,
}

impl InMemoryFlowNodeStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                tables: RwLock::new(Tables::default()),
                unavailable: AtomicU32::new(0),
                conflicts: AtomicU32::new(0),
                commits: AtomicU64::new(0),
            }),
        }
    }

    /// Fail the next `count` `begin` calls with `StoreError::Unavailable`
    pub fn inject_unavailable(&self, count: u32) {
        self.shared.unavailable.fetch_add(count, Ordering::SeqCst);
    }

    /// Fail the next `count` commits with a concurrency conflict
    pub fn inject_conflicts(&self, count: u32) {
        self.shared.conflicts.fetch_add(count, Ordering::SeqCst);
    }

    /// Number of successful commits
    pub fn commit_count(&self) -> u64 {
        self.shared.commits.load(Ordering::SeqCst)
    }

    pub fn process_instance(&self, id: Uuid) -> Option<ProcessInstance> {
        self.shared.tables.read().processes.get(&id).cloned()
    }

    pub fn process_instance_count(&self) -> usize {
        self.shared.tables.read().processes.len()
    }

    pub fn flow_node(&self, id: Uuid) -> Option<FlowNodeInstance> {
        self.shared.tables.read().flow_nodes.get(&id).cloned()
    }

    /// Flow nodes of a process instance ordered by id
    pub fn flow_nodes_of(&self, process_instance_id: Uuid) -> Vec<FlowNodeInstance> {
        let tables = self.shared.tables.read();
        let mut nodes: Vec<_> = tables
            .flow_nodes
            .values()
            .filter(|n| n.parent_process_instance_id == process_instance_id)
            .cloned()
            .collect();
        nodes.sort_by_key(|n| n.id);
        nodes
    }

    pub fn waiting_events(&self) -> Vec<WaitingEvent> {
        let tables = self.shared.tables.read();
        let mut events: Vec<_> = tables.waiting_events.values().cloned().collect();
        events.sort_by_key(|e| e.id);
        events
    }

    pub fn data(&self, container: DataContainer, name: &str) -> Option<Value> {
        self.shared
            .tables
            .read()
            .data
            .get(&(container, name.to_string()))
            .cloned()
    }

    pub fn business_data(&self, container: DataContainer, name: &str) -> Option<BusinessDataRef> {
        self.shared
            .tables
            .read()
            .business_data
            .get(&(container, name.to_string()))
            .cloned()
    }
}

impl Default for InMemoryFlowNodeStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FlowNodeStore for InMemoryFlowNodeStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        if take_one(&self.shared.unavailable) {
            return Err(StoreError::Unavailable("injected outage".into()));
        }
        Ok(Box::new(InMemoryTransaction::new(Arc::clone(&self.shared))))
    }
}

/// Pending writes and observed versions of one transaction.
///
/// `None` in an overlay map marks a deletion.
struct InMemoryTransaction {
    shared: Arc<Shared>,
    read_set: HashMap<RecordKey, u64>,
    processes: HashMap<Uuid, Option<ProcessInstance>>,
    flow_nodes: HashMap<Uuid, Option<FlowNodeInstance>>,
    waiting_events: HashMap<Uuid, Option<WaitingEvent>>,
    data: HashMap<DataKey, Option<Value>>,
    business_data: HashMap<DataKey, Option<BusinessDataRef>>,
    closed: bool,
}

impl InMemoryTransaction {
    fn new(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            read_set: HashMap::new(),
            processes: HashMap::new(),
            flow_nodes: HashMap::new(),
            waiting_events: HashMap::new(),
            data: HashMap::new(),
            business_data: HashMap::new(),
            closed: false,
        }
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed {
            Err(StoreError::TransactionClosed)
        } else {
            Ok(())
        }
    }

    /// Remember the first version seen for `key`
    fn observe(read_set: &mut HashMap<RecordKey, u64>, tables: &Tables, key: RecordKey) {
        let version = tables.version(&key);
        read_set.entry(key).or_insert(version);
    }

    fn read_process(&mut self, id: Uuid) -> Result<Option<ProcessInstance>, StoreError> {
        self.ensure_open()?;
        if let Some(entry) = self.processes.get(&id) {
            return Ok(entry.clone());
        }
        let tables = self.shared.tables.read();
        Self::observe(&mut self.read_set, &tables, RecordKey::Process(id));
        Ok(tables.processes.get(&id).cloned())
    }

    fn read_flow_node(&mut self, id: Uuid) -> Result<Option<FlowNodeInstance>, StoreError> {
        self.ensure_open()?;
        if let Some(entry) = self.flow_nodes.get(&id) {
            return Ok(entry.clone());
        }
        let tables = self.shared.tables.read();
        Self::observe(&mut self.read_set, &tables, RecordKey::FlowNode(id));
        Ok(tables.flow_nodes.get(&id).cloned())
    }

    fn read_waiting_event(&mut self, id: Uuid) -> Result<Option<WaitingEvent>, StoreError> {
        self.ensure_open()?;
        if let Some(entry) = self.waiting_events.get(&id) {
            return Ok(entry.clone());
        }
        let tables = self.shared.tables.read();
        Self::observe(&mut self.read_set, &tables, RecordKey::WaitingEvent(id));
        Ok(tables.waiting_events.get(&id).cloned())
    }

    /// Flow nodes of a process, merged with pending writes
    fn scan_flow_nodes(&mut self, query: &FlowNodeQuery) -> Result<Vec<FlowNodeInstance>, StoreError> {
        self.ensure_open()?;
        let tables = self.shared.tables.read();
        Self::observe(
            &mut self.read_set,
            &tables,
            RecordKey::Children(query.process_instance_id),
        );

        let mut found = BTreeMap::new();
        for node in tables.flow_nodes.values() {
            if self.flow_nodes.contains_key(&node.id) || !query.matches(node) {
                continue;
            }
            Self::observe(&mut self.read_set, &tables, RecordKey::FlowNode(node.id));
            found.insert(node.id, node.clone());
        }
        for node in self.flow_nodes.values().flatten() {
            if query.matches(node) {
                found.insert(node.id, node.clone());
            }
        }
        Ok(found.into_values().collect())
    }

    fn scan_waiting_events(&mut self, query: &WaitingEventQuery) -> Result<Vec<WaitingEvent>, StoreError> {
        self.ensure_open()?;
        let tables = self.shared.tables.read();
        let mut found = BTreeMap::new();
        for event in tables.waiting_events.values() {
            if self.waiting_events.contains_key(&event.id) || !query.matches(event) {
                continue;
            }
            Self::observe(&mut self.read_set, &tables, RecordKey::WaitingEvent(event.id));
            found.insert(event.id, event.clone());
        }
        for event in self.waiting_events.values().flatten() {
            if query.matches(event) {
                found.insert(event.id, event.clone());
            }
        }
        Ok(found.into_values().collect())
    }

    fn read_data(&mut self, key: DataKey) -> Result<Option<Value>, StoreError> {
        self.ensure_open()?;
        if let Some(entry) = self.data.get(&key) {
            return Ok(entry.clone());
        }
        let tables = self.shared.tables.read();
        Self::observe(
            &mut self.read_set,
            &tables,
            RecordKey::Data(key.0, key.1.clone()),
        );
        Ok(tables.data.get(&key).cloned())
    }

    fn read_business_data(&mut self, key: DataKey) -> Result<Option<BusinessDataRef>, StoreError> {
        self.ensure_open()?;
        if let Some(entry) = self.business_data.get(&key) {
            return Ok(entry.clone());
        }
        let tables = self.shared.tables.read();
        Self::observe(
            &mut self.read_set,
            &tables,
            RecordKey::BusinessData(key.0, key.1.clone()),
        );
        Ok(tables.business_data.get(&key).cloned())
    }

    fn scan_data(&mut self, container: DataContainer) -> Result<BTreeMap<String, Value>, StoreError> {
        self.ensure_open()?;
        let tables = self.shared.tables.read();
        let mut found = BTreeMap::new();
        for ((c, name), value) in &tables.data {
            let key = (*c, name.clone());
            if *c != container || self.data.contains_key(&key) {
                continue;
            }
            Self::observe(&mut self.read_set, &tables, RecordKey::Data(*c, name.clone()));
            found.insert(name.clone(), value.clone());
        }
        for ((c, name), value) in &self.data {
            if *c != container {
                continue;
            }
            match value {
                Some(v) => found.insert(name.clone(), v.clone()),
                None => found.remove(name),
            };
        }
        Ok(found)
    }

    fn scan_business_data(
        &mut self,
        container: DataContainer,
    ) -> Result<BTreeMap<String, BusinessDataRef>, StoreError> {
        self.ensure_open()?;
        let tables = self.shared.tables.read();
        let mut found = BTreeMap::new();
        for ((c, name), reference) in &tables.business_data {
            let key = (*c, name.clone());
            if *c != container || self.business_data.contains_key(&key) {
                continue;
            }
            Self::observe(
                &mut self.read_set,
                &tables,
                RecordKey::BusinessData(*c, name.clone()),
            );
            found.insert(name.clone(), reference.clone());
        }
        for ((c, name), reference) in &self.business_data {
            if *c != container {
                continue;
            }
            match reference {
                Some(r) => found.insert(name.clone(), r.clone()),
                None => found.remove(name),
            };
        }
        Ok(found)
    }

    /// Stage the removal of a process and everything it owns
    fn stage_process_delete(&mut self, id: Uuid) -> Result<(), StoreError> {
        if self.read_process(id)?.is_none() {
            return Err(StoreError::ProcessInstanceNotFound(id));
        }
        let nodes = self.scan_flow_nodes(&FlowNodeQuery::new(id))?;

        let tables = self.shared.tables.read();
        let mut containers = vec![DataContainer::Process(id)];
        for node in &nodes {
            containers.push(DataContainer::FlowNode(node.id));
            self.flow_nodes.insert(node.id, None);
        }
        for event in tables.waiting_events.values() {
            if event.parent_process_instance_id == id {
                self.waiting_events.insert(event.id, None);
            }
        }
        for event in self.waiting_events.values_mut() {
            if event.as_ref().is_some_and(|e| e.parent_process_instance_id == id) {
                *event = None;
            }
        }
        for key in tables.data.keys().filter(|k| containers.contains(&k.0)) {
            self.data.insert(key.clone(), None);
        }
        for key in tables.business_data.keys().filter(|k| containers.contains(&k.0)) {
            self.business_data.insert(key.clone(), None);
        }
        for (key, value) in self.data.iter_mut() {
            if containers.contains(&key.0) {
                *value = None;
            }
        }
        for (key, value) in self.business_data.iter_mut() {
            if containers.contains(&key.0) {
                *value = None;
            }
        }
        self.processes.insert(id, None);
        Ok(())
    }

    fn apply(&mut self) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.closed = true;

        if take_one(&self.shared.conflicts) {
            return Err(StoreError::ConcurrencyConflict {
                record: "injected".into(),
                expected: 0,
                actual: 1,
            });
        }

        let mut tables = self.shared.tables.write();
        for (key, seen) in &self.read_set {
            let actual = tables.version(key);
            if actual != *seen {
                trace!(record = %key, expected = seen, actual, "commit rejected");
                return Err(StoreError::ConcurrencyConflict {
                    record: key.to_string(),
                    expected: *seen,
                    actual,
                });
            }
        }

        for (id, entry) in self.processes.drain() {
            tables.bump(RecordKey::Process(id));
            match entry {
                Some(process) => tables.processes.insert(id, process),
                None => tables.processes.remove(&id),
            };
        }

        for (id, entry) in self.flow_nodes.drain() {
            tables.bump(RecordKey::FlowNode(id));
            match entry {
                Some(node) => {
                    if !tables.flow_nodes.contains_key(&id) {
                        tables.bump(RecordKey::Children(node.parent_process_instance_id));
                    }
                    tables.flow_nodes.insert(id, node);
                }
                None => {
                    if let Some(old) = tables.flow_nodes.remove(&id) {
                        tables.bump(RecordKey::Children(old.parent_process_instance_id));
                    }
                }
            }
        }

        for (id, entry) in self.waiting_events.drain() {
            tables.bump(RecordKey::WaitingEvent(id));
            match entry {
                Some(event) => tables.waiting_events.insert(id, event),
                None => tables.waiting_events.remove(&id),
            };
        }

        for (key, entry) in self.data.drain() {
            tables.bump(RecordKey::Data(key.0, key.1.clone()));
            match entry {
                Some(value) => tables.data.insert(key, value),
                None => tables.data.remove(&key),
            };
        }

        for (key, entry) in self.business_data.drain() {
            tables.bump(RecordKey::BusinessData(key.0, key.1.clone()));
            match entry {
                Some(reference) => tables.business_data.insert(key, reference),
                None => tables.business_data.remove(&key),
            };
        }

        self.shared.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn discard(&mut self) {
        self.closed = true;
        self.read_set.clear();
        self.processes.clear();
        self.flow_nodes.clear();
        self.waiting_events.clear();
        self.data.clear();
        self.business_data.clear();
    }
}

#[async_trait]
impl StoreTransaction for InMemoryTransaction {
    async fn get_process_instance(&mut self, id: Uuid) -> Result<ProcessInstance, StoreError> {
        self.read_process(id)?
            .ok_or(StoreError::ProcessInstanceNotFound(id))
    }

    async fn insert_process_instance(&mut self, process: ProcessInstance) -> Result<(), StoreError> {
        if self.read_process(process.id)?.is_some() {
            return Err(StoreError::Duplicate(format!("process instance {}", process.id)));
        }
        self.processes.insert(process.id, Some(process));
        Ok(())
    }

    async fn update_process_instance(&mut self, process: &ProcessInstance) -> Result<(), StoreError> {
        if self.read_process(process.id)?.is_none() {
            return Err(StoreError::ProcessInstanceNotFound(process.id));
        }
        self.processes.insert(process.id, Some(process.clone()));
        Ok(())
    }

    async fn delete_process_instance(&mut self, id: Uuid) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.stage_process_delete(id)
    }

    async fn get_flow_node(&mut self, id: Uuid) -> Result<FlowNodeInstance, StoreError> {
        self.read_flow_node(id)?.ok_or(StoreError::FlowNodeNotFound(id))
    }

    async fn find_flow_nodes(
        &mut self,
        query: &FlowNodeQuery,
    ) -> Result<Vec<FlowNodeInstance>, StoreError> {
        self.scan_flow_nodes(query)
    }

    async fn insert_flow_node(&mut self, node: FlowNodeInstance) -> Result<(), StoreError> {
        if self.read_flow_node(node.id)?.is_some() {
            return Err(StoreError::Duplicate(format!("flow node {}", node.id)));
        }
        self.flow_nodes.insert(node.id, Some(node));
        Ok(())
    }

    async fn update_flow_node(&mut self, node: &FlowNodeInstance) -> Result<(), StoreError> {
        if self.read_flow_node(node.id)?.is_none() {
            return Err(StoreError::FlowNodeNotFound(node.id));
        }
        self.flow_nodes.insert(node.id, Some(node.clone()));
        Ok(())
    }

    async fn insert_waiting_event(&mut self, event: WaitingEvent) -> Result<(), StoreError> {
        if self.read_waiting_event(event.id)?.is_some() {
            return Err(StoreError::Duplicate(format!("waiting event {}", event.id)));
        }
        self.waiting_events.insert(event.id, Some(event));
        Ok(())
    }

    async fn get_waiting_event(&mut self, id: Uuid) -> Result<WaitingEvent, StoreError> {
        self.read_waiting_event(id)?
            .ok_or(StoreError::WaitingEventNotFound(id))
    }

    async fn find_waiting_events(
        &mut self,
        query: &WaitingEventQuery,
    ) -> Result<Vec<WaitingEvent>, StoreError> {
        self.scan_waiting_events(query)
    }

    async fn update_waiting_event(&mut self, event: &WaitingEvent) -> Result<(), StoreError> {
        if self.read_waiting_event(event.id)?.is_none() {
            return Err(StoreError::WaitingEventNotFound(event.id));
        }
        self.waiting_events.insert(event.id, Some(event.clone()));
        Ok(())
    }

    async fn delete_waiting_events_of(
        &mut self,
        flow_node_instance_id: Uuid,
    ) -> Result<usize, StoreError> {
        let events =
            self.scan_waiting_events(&WaitingEventQuery::for_flow_node(flow_node_instance_id))?;
        for event in &events {
            self.waiting_events.insert(event.id, None);
        }
        Ok(events.len())
    }

    async fn get_data(
        &mut self,
        container: DataContainer,
        name: &str,
    ) -> Result<Option<Value>, StoreError> {
        self.read_data((container, name.to_string()))
    }

    async fn set_data(
        &mut self,
        container: DataContainer,
        name: &str,
        value: Value,
    ) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.data.insert((container, name.to_string()), Some(value));
        Ok(())
    }

    async fn list_data(
        &mut self,
        container: DataContainer,
    ) -> Result<BTreeMap<String, Value>, StoreError> {
        self.scan_data(container)
    }

    async fn get_business_data(
        &mut self,
        container: DataContainer,
        name: &str,
    ) -> Result<Option<BusinessDataRef>, StoreError> {
        self.read_business_data((container, name.to_string()))
    }

    async fn set_business_data(
        &mut self,
        container: DataContainer,
        name: &str,
        reference: BusinessDataRef,
    ) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.business_data
            .insert((container, name.to_string()), Some(reference));
        Ok(())
    }

    async fn list_business_data(
        &mut self,
        container: DataContainer,
    ) -> Result<BTreeMap<String, BusinessDataRef>, StoreError> {
        self.scan_business_data(container)
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        let result = self.apply();
        if result.is_err() {
            self.discard();
        }
        result
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.discard();
        Ok(())
    }
}
