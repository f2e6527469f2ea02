use crate::{StoreError, StoreResult};
use async_trait::async_trait;
use hypervisor_common::{canonical_hypervisor_id, facts, Consumer, Owner};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

/// Source of units of work. One reconciliation run uses exactly one.
#[async_trait]
pub trait ConsumerStore: Send + Sync {
    async fn begin(&self) -> StoreResult<Box<dyn UnitOfWork>>;
}

/// A transaction against the consumer store.
///
/// Writes are only visible to other units of work after `commit`. Dropping a
/// unit of work without committing discards its writes.
#[async_trait]
pub trait UnitOfWork: Send {
    async fn owner(&mut self, owner_key: &str) -> StoreResult<Option<Owner>>;

    /// Hypervisor consumers of `owner` whose identity is in `hypervisor_ids` or whose
    /// system uuid fact is in `system_uuids`. Both sets hold lower-cased values.
    async fn host_consumers(
        &mut self,
        owner: &Owner,
        hypervisor_ids: &BTreeSet<String>,
        system_uuids: &BTreeSet<String>,
    ) -> StoreResult<HostConsumerMap>;

    /// Registered guest consumers of `owner` keyed by their virt uuid. `guest_ids` is lower-cased.
    async fn guest_consumers(
        &mut self,
        owner: &Owner,
        guest_ids: &BTreeSet<String>,
    ) -> StoreResult<GuestConsumerMap>;

    async fn consumers_by_reporter(
        &mut self,
        owner: &Owner,
        reporter_id: &str,
    ) -> StoreResult<Vec<Consumer>>;

    /// Persists a new consumer and returns it with its generated id.
    async fn create(&mut self, consumer: Consumer) -> StoreResult<Consumer>;

    /// Bulk write of scalar and identity data. Stored guest lists are left alone.
    async fn update_attributes(&mut self, consumers: &[Consumer]) -> StoreResult<()>;

    /// Bulk write that also replaces each consumer's guest list.
    async fn update_guest_memberships(&mut self, consumers: &[Consumer]) -> StoreResult<()>;

    async fn commit(self: Box<Self>) -> StoreResult<()>;

    async fn rollback(self: Box<Self>) -> StoreResult<()>;
}

/// Known host consumers of one owner, addressable by hypervisor id or system uuid.
#[derive(Debug, Clone, Default)]
pub struct HostConsumerMap {
    consumers: HashMap<String, Consumer>,
    by_hypervisor_id: HashMap<String, String>,
    by_system_uuid: HashMap<String, String>,
}

impl HostConsumerMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, consumer: Consumer) {
        if let Some(id) = &consumer.hypervisor_id {
            self.by_hypervisor_id
                .insert(id.hypervisor_id.clone(), consumer.uuid.clone());
        }
        if let Some(system_uuid) = consumer.system_uuid() {
            self.by_system_uuid
                .insert(system_uuid.to_lowercase(), consumer.uuid.clone());
        }
        self.consumers.insert(consumer.uuid.clone(), consumer);
    }

    pub fn get(&self, uuid: &str) -> Option<&Consumer> {
        self.consumers.get(uuid)
    }

    pub fn by_hypervisor_id(&self, hypervisor_id: &str) -> Option<&Consumer> {
        self.by_hypervisor_id
            .get(&canonical_hypervisor_id(hypervisor_id))
            .and_then(|uuid| self.consumers.get(uuid))
    }

    pub fn by_system_uuid(&self, system_uuid: &str) -> Option<&Consumer> {
        self.by_system_uuid
            .get(&system_uuid.to_lowercase())
            .and_then(|uuid| self.consumers.get(uuid))
    }

    pub fn len(&self) -> usize {
        self.consumers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.consumers.is_empty()
    }
}

/// Registered guest consumers keyed by lower-cased guest id.
#[derive(Debug, Clone, Default)]
pub struct GuestConsumerMap {
    guests: HashMap<String, Consumer>,
}

impl GuestConsumerMap {
    pub fn insert(&mut self, guest_id: &str, consumer: Consumer) {
        self.guests.insert(guest_id.to_lowercase(), consumer);
    }

    pub fn get(&self, guest_id: &str) -> Option<&Consumer> {
        self.guests.get(&guest_id.to_lowercase())
    }

    pub fn len(&self) -> usize {
        self.guests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.guests.is_empty()
    }
}

// --- In-memory store for development/testing ---

/// Serializable image of an [`InMemoryStore`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSnapshot {
    #[serde(default)]
    pub owners: Vec<Owner>,
    #[serde(default)]
    pub consumers: Vec<Consumer>,
}

/// Call counters, useful to check how many round trips a run made.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub host_lookups: usize,
    pub guest_lookups: usize,
    pub creates: usize,
    pub attribute_updates: usize,
    pub membership_updates: usize,
    pub commits: usize,
    pub rollbacks: usize,
}

#[derive(Debug, Default)]
struct Counters {
    host_lookups: AtomicUsize,
    guest_lookups: AtomicUsize,
    creates: AtomicUsize,
    attribute_updates: AtomicUsize,
    membership_updates: AtomicUsize,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
}

impl Counters {
    fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Default)]
struct Faults {
    rejected_creates: HashMap<String, String>,
    bulk_update_failure: Option<String>,
}

#[derive(Debug, Clone, Default)]
struct StoreState {
    owners: HashMap<String, Owner>,
    consumers: BTreeMap<String, Consumer>,
    versions: HashMap<String, u64>,
}

#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<RwLock<StoreState>>,
    faults: Arc<RwLock<Faults>>,
    counters: Arc<Counters>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        let mut state = StoreState::default();
        for owner in snapshot.owners {
            state.owners.insert(owner.key.clone(), owner);
        }
        for mut consumer in snapshot.consumers {
            let id = consumer.id.get_or_insert_with(new_consumer_id).clone();
            state.consumers.insert(id, consumer);
        }
        Self {
            state: Arc::new(RwLock::new(state)),
            ..Default::default()
        }
    }

    pub async fn snapshot(&self) -> StoreSnapshot {
        let state = self.state.read().await;
        let mut owners: Vec<Owner> = state.owners.values().cloned().collect();
        owners.sort_by(|a, b| a.key.cmp(&b.key));
        StoreSnapshot {
            owners,
            consumers: state.consumers.values().cloned().collect(),
        }
    }

    pub async fn add_owner(&self, owner: Owner) {
        self.state
            .write()
            .await
            .owners
            .insert(owner.key.clone(), owner);
    }

    /// Seeds a consumer outside of any unit of work, assigning an id if it has none.
    pub async fn insert_consumer(&self, mut consumer: Consumer) -> Consumer {
        let id = consumer.id.get_or_insert_with(new_consumer_id).clone();
        self.state
            .write()
            .await
            .consumers
            .insert(id, consumer.clone());
        consumer
    }

    pub async fn consumer(&self, uuid: &str) -> Option<Consumer> {
        self.state
            .read()
            .await
            .consumers
            .values()
            .find(|c| c.uuid == uuid)
            .cloned()
    }

    pub async fn consumers(&self, owner_key: &str) -> Vec<Consumer> {
        self.state
            .read()
            .await
            .consumers
            .values()
            .filter(|c| c.owner_key == owner_key)
            .cloned()
            .collect()
    }

    /// Makes every create of a consumer with this name fail with `message`.
    pub async fn reject_create(&self, name: &str, message: &str) {
        self.faults
            .write()
            .await
            .rejected_creates
            .insert(name.to_string(), message.to_string());
    }

    /// Makes every bulk update fail with `message`.
    pub async fn fail_bulk_updates(&self, message: &str) {
        self.faults.write().await.bulk_update_failure = Some(message.to_string());
    }

    pub fn stats(&self) -> StoreStats {
        let c = &self.counters;
        StoreStats {
            host_lookups: c.host_lookups.load(Ordering::SeqCst),
            guest_lookups: c.guest_lookups.load(Ordering::SeqCst),
            creates: c.creates.load(Ordering::SeqCst),
            attribute_updates: c.attribute_updates.load(Ordering::SeqCst),
            membership_updates: c.membership_updates.load(Ordering::SeqCst),
            commits: c.commits.load(Ordering::SeqCst),
            rollbacks: c.rollbacks.load(Ordering::SeqCst),
        }
    }
}

#[async_trait]
impl ConsumerStore for InMemoryStore {
    async fn begin(&self) -> StoreResult<Box<dyn UnitOfWork>> {
        let state = self.state.read().await;
        Ok(Box::new(InMemoryUnitOfWork {
            shared: self.state.clone(),
            counters: self.counters.clone(),
            faults: self.faults.read().await.clone(),
            owners: state.owners.clone(),
            view: state.consumers.clone(),
            base_versions: state.versions.clone(),
            dirty: BTreeSet::new(),
            touched_owners: BTreeSet::new(),
        }))
    }
}

/// Works on a private copy of the store; `commit` publishes the touched
/// consumers if no other unit of work committed changes to the same owners first.
struct InMemoryUnitOfWork {
    shared: Arc<RwLock<StoreState>>,
    counters: Arc<Counters>,
    faults: Faults,
    owners: HashMap<String, Owner>,
    view: BTreeMap<String, Consumer>,
    base_versions: HashMap<String, u64>,
    dirty: BTreeSet<String>,
    touched_owners: BTreeSet<String>,
}

impl InMemoryUnitOfWork {
    fn owned_by<'a>(&'a self, owner: &'a Owner) -> impl Iterator<Item = &'a Consumer> + 'a {
        self.view.values().filter(move |c| c.owner_key == owner.key)
    }

    fn check_bulk(&self, consumers: &[Consumer]) -> StoreResult<()> {
        if let Some(message) = &self.faults.bulk_update_failure {
            return Err(StoreError::Backend(message.clone()));
        }
        for consumer in consumers {
            match &consumer.id {
                Some(id) if self.view.contains_key(id) => {}
                _ => {
                    return Err(StoreError::Rejected(format!(
                        "Consumer {} has not been persisted",
                        consumer.uuid
                    )))
                }
            }
        }
        self.check_identities(consumers)
    }

    /// A hypervisor id may be held by at most one consumer per owner.
    fn check_identities(&self, written: &[Consumer]) -> StoreResult<()> {
        let overlay: HashMap<&str, &Consumer> = written
            .iter()
            .filter_map(|c| c.id.as_deref().map(|id| (id, c)))
            .collect();
        let owners: BTreeSet<&str> = written.iter().map(|c| c.owner_key.as_str()).collect();

        for owner_key in owners {
            let stored = self
                .view
                .iter()
                .filter(|(id, _)| !overlay.contains_key(id.as_str()))
                .map(|(_, c)| c);
            let mut holders: HashMap<&str, &str> = HashMap::new();
            for consumer in stored.chain(overlay.values().copied()) {
                if consumer.owner_key != owner_key || !consumer.is_hypervisor() {
                    continue;
                }
                let Some(identity) = &consumer.hypervisor_id else {
                    continue;
                };
                if let Some(holder) = holders.insert(&identity.hypervisor_id, &consumer.uuid) {
                    return Err(StoreError::Rejected(format!(
                        "Hypervisor id {} is used by both {} and {} in owner {}",
                        identity.hypervisor_id, holder, consumer.uuid, owner_key
                    )));
                }
            }
        }
        Ok(())
    }

    fn stage(&mut self, consumer: Consumer, id: String) {
        self.touched_owners.insert(consumer.owner_key.clone());
        self.dirty.insert(id.clone());
        self.view.insert(id, consumer);
    }
}

#[async_trait]
impl UnitOfWork for InMemoryUnitOfWork {
    async fn owner(&mut self, owner_key: &str) -> StoreResult<Option<Owner>> {
        Ok(self.owners.get(owner_key).cloned())
    }

    async fn host_consumers(
        &mut self,
        owner: &Owner,
        hypervisor_ids: &BTreeSet<String>,
        system_uuids: &BTreeSet<String>,
    ) -> StoreResult<HostConsumerMap> {
        Counters::bump(&self.counters.host_lookups);
        let mut map = HostConsumerMap::new();
        for consumer in self.owned_by(owner).filter(|c| c.is_hypervisor()) {
            let by_id = consumer
                .hypervisor_id
                .as_ref()
                .is_some_and(|h| hypervisor_ids.contains(&h.hypervisor_id));
            let by_uuid = consumer
                .system_uuid()
                .is_some_and(|u| system_uuids.contains(&u.to_lowercase()));
            if by_id || by_uuid {
                map.insert(consumer.clone());
            }
        }
        debug!(owner = %owner.key, found = map.len(), "Loaded host consumers");
        Ok(map)
    }

    async fn guest_consumers(
        &mut self,
        owner: &Owner,
        guest_ids: &BTreeSet<String>,
    ) -> StoreResult<GuestConsumerMap> {
        Counters::bump(&self.counters.guest_lookups);
        let mut map = GuestConsumerMap::default();
        for consumer in self.owned_by(owner) {
            if let Some(virt_uuid) = consumer.fact(facts::VIRT_UUID) {
                if guest_ids.contains(&virt_uuid.to_lowercase()) {
                    map.insert(virt_uuid, consumer.clone());
                }
            }
        }
        Ok(map)
    }

    async fn consumers_by_reporter(
        &mut self,
        owner: &Owner,
        reporter_id: &str,
    ) -> StoreResult<Vec<Consumer>> {
        Ok(self
            .owned_by(owner)
            .filter(|c| c.is_hypervisor() && c.reporter_id() == Some(reporter_id))
            .cloned()
            .collect())
    }

    async fn create(&mut self, mut consumer: Consumer) -> StoreResult<Consumer> {
        Counters::bump(&self.counters.creates);
        if let Some(message) = self.faults.rejected_creates.get(&consumer.name) {
            return Err(StoreError::Rejected(message.clone()));
        }
        if self.view.values().any(|c| c.uuid == consumer.uuid) {
            return Err(StoreError::Rejected(format!(
                "Consumer with uuid {} already exists",
                consumer.uuid
            )));
        }
        let id = new_consumer_id();
        consumer.id = Some(id.clone());
        self.check_identities(std::slice::from_ref(&consumer))?;
        self.stage(consumer.clone(), id);
        Ok(consumer)
    }

    async fn update_attributes(&mut self, consumers: &[Consumer]) -> StoreResult<()> {
        Counters::bump(&self.counters.attribute_updates);
        self.check_bulk(consumers)?;
        for consumer in consumers {
            let Some(id) = consumer.id.clone() else { continue };
            let mut updated = consumer.clone();
            if let Some(stored) = self.view.get(&id) {
                updated.guest_ids = stored.guest_ids.clone();
            }
            self.stage(updated, id);
        }
        Ok(())
    }

    async fn update_guest_memberships(&mut self, consumers: &[Consumer]) -> StoreResult<()> {
        Counters::bump(&self.counters.membership_updates);
        self.check_bulk(consumers)?;
        for consumer in consumers {
            let Some(id) = consumer.id.clone() else { continue };
            self.stage(consumer.clone(), id);
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let mut state = self.shared.write().await;
        for owner_key in &self.touched_owners {
            let current = state.versions.get(owner_key).copied().unwrap_or(0);
            let base = self.base_versions.get(owner_key).copied().unwrap_or(0);
            if current != base {
                return Err(StoreError::Conflict {
                    owner_key: owner_key.clone(),
                });
            }
        }
        for id in &self.dirty {
            if let Some(consumer) = self.view.get(id) {
                state.consumers.insert(id.clone(), consumer.clone());
            }
        }
        for owner_key in &self.touched_owners {
            *state.versions.entry(owner_key.clone()).or_insert(0) += 1;
        }
        Counters::bump(&self.counters.commits);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        Counters::bump(&self.counters.rollbacks);
        debug!(discarded = self.dirty.len(), "Rolled back unit of work");
        Ok(())
    }
}

fn new_consumer_id() -> String {
    Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use hypervisor_common::HypervisorId;

    fn host(uuid: &str, hypervisor_id: &str) -> Consumer {
        Consumer::hypervisor(uuid, uuid, "admin")
            .unwrap()
            .with_hypervisor_id(HypervisorId::new(hypervisor_id, None))
    }

    #[tokio::test]
    async fn test_writes_invisible_until_commit() {
        let store = InMemoryStore::new();
        store.add_owner(Owner::new("admin")).await;

        let mut uow = store.begin().await.unwrap();
        let created = uow.create(host("h1", "hyp-1")).await.unwrap();
        assert!(created.id.is_some());
        assert!(store.consumer("h1").await.is_none());

        uow.commit().await.unwrap();
        assert_eq!(store.consumer("h1").await.unwrap().id, created.id);
    }

    #[tokio::test]
    async fn test_rollback_discards_writes() {
        let store = InMemoryStore::new();
        let mut uow = store.begin().await.unwrap();
        uow.create(host("h1", "hyp-1")).await.unwrap();
        uow.rollback().await.unwrap();

        assert!(store.consumers("admin").await.is_empty());
        assert_eq!(store.stats().rollbacks, 1);
    }

    #[tokio::test]
    async fn test_concurrent_commit_on_same_owner_conflicts() {
        let store = InMemoryStore::new();
        let mut first = store.begin().await.unwrap();
        let mut second = store.begin().await.unwrap();
        first.create(host("h1", "hyp-1")).await.unwrap();
        second.create(host("h2", "hyp-2")).await.unwrap();

        first.commit().await.unwrap();
        let err = second.commit().await.unwrap_err();
        assert_eq!(
            err,
            StoreError::Conflict {
                owner_key: "admin".to_string()
            }
        );
        assert!(store.consumer("h2").await.is_none());
    }

    #[tokio::test]
    async fn test_host_lookup_by_id_and_system_uuid() {
        let store = InMemoryStore::new();
        let owner = Owner::new("admin");
        store.add_owner(owner.clone()).await;
        store.insert_consumer(host("h1", "HYP-1")).await;
        store
            .insert_consumer(host("h2", "hyp-2").with_fact(facts::SYSTEM_UUID, "MyUuid"))
            .await;
        store.insert_consumer(host("h3", "hyp-3")).await;

        let mut uow = store.begin().await.unwrap();
        let ids = BTreeSet::from(["hyp-1".to_string()]);
        let uuids = BTreeSet::from(["myuuid".to_string()]);
        let map = uow.host_consumers(&owner, &ids, &uuids).await.unwrap();

        assert_eq!(map.len(), 2);
        assert_eq!(map.by_hypervisor_id("Hyp-1").unwrap().uuid, "h1");
        assert_eq!(map.by_system_uuid("MYUUID").unwrap().uuid, "h2");
        assert!(map.get("h3").is_none());
        assert_eq!(store.stats().host_lookups, 1);
    }

    #[tokio::test]
    async fn test_attribute_update_keeps_guests() {
        let store = InMemoryStore::new();
        let stored = store
            .insert_consumer(host("h1", "hyp-1").with_guest("GUEST_A"))
            .await;

        let mut changed = stored.clone();
        changed.guest_ids.clear();
        changed.name = "renamed".to_string();

        let mut uow = store.begin().await.unwrap();
        uow.update_attributes(&[changed]).await.unwrap();
        uow.commit().await.unwrap();

        let after = store.consumer("h1").await.unwrap();
        assert_eq!(after.name, "renamed");
        assert_eq!(after.guest_id_strings(), vec!["GUEST_A"]);
    }

    #[tokio::test]
    async fn test_bulk_update_of_unsaved_consumer_is_rejected() {
        let store = InMemoryStore::new();
        let mut uow = store.begin().await.unwrap();
        let err = uow
            .update_guest_memberships(&[host("h1", "hyp-1")])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Rejected(_)));
    }

    #[tokio::test]
    async fn test_hypervisor_id_is_unique_per_owner() {
        let store = InMemoryStore::new();
        let x = store.insert_consumer(host("x", "a")).await;
        store.insert_consumer(host("y", "b")).await;

        let mut uow = store.begin().await.unwrap();
        let err = uow.create(host("z", "B")).await.unwrap_err();
        assert!(matches!(err, StoreError::Rejected(ref m) if m.contains("Hypervisor id b")));

        let mut moved = x.clone();
        moved.hypervisor_id = Some(HypervisorId::new("b", None));
        let err = uow.update_attributes(&[moved]).await.unwrap_err();
        assert!(matches!(err, StoreError::Rejected(_)));

        // Another owner may reuse the id.
        let other = Consumer::hypervisor("w", "w", "other-org")
            .unwrap()
            .with_hypervisor_id(HypervisorId::new("b", None));
        assert!(uow.create(other).await.is_ok());
    }

    #[tokio::test]
    async fn test_ids_can_swap_within_one_batch() {
        let store = InMemoryStore::new();
        let mut x = store.insert_consumer(host("x", "a")).await;
        let mut y = store.insert_consumer(host("y", "b")).await;
        x.hypervisor_id = Some(HypervisorId::new("b", None));
        y.hypervisor_id = Some(HypervisorId::new("a", None));

        let mut uow = store.begin().await.unwrap();
        uow.update_attributes(&[x, y]).await.unwrap();
        uow.commit().await.unwrap();
        assert_eq!(
            store.consumer("x").await.unwrap().hypervisor_id.unwrap().hypervisor_id,
            "b"
        );
    }

    #[tokio::test]
    async fn test_snapshot_round_trip_keeps_ids() {
        let store = InMemoryStore::new();
        store.add_owner(Owner::new("admin")).await;
        let seeded = store.insert_consumer(host("h1", "hyp-1")).await;

        let restored = InMemoryStore::from_snapshot(store.snapshot().await);
        assert_eq!(restored.consumer("h1").await.unwrap().id, seeded.id);
        assert_eq!(restored.snapshot().await.owners.len(), 1);
    }
}
