//! Versioned resource store over an embedded single-writer database.
//!
//! One table per resource kind plus a metadata table; values are the
//! canonical JSON encoding of the resource. Child kinds additionally
//! maintain a `<namespace>/<devnetRef>/<name>` secondary index for
//! parent-scoped lookups and cascade deletion.
//!
//! Every mutation runs inside the database's single-writer transaction and
//! publishes a change event to the watch hub after commit, in commit order.

mod watch;

pub use watch::{EventType, ResourceEvent};

use std::path::Path;
use std::sync::Mutex;

use redb::{Database, ReadableTable, TableDefinition};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::debug;

use crate::error::{Error, Result};
use crate::resources::{Node, Resource, ResourceKind, Transaction, Upgrade};

use watch::WatchHub;

const DEVNETS: TableDefinition<&str, &[u8]> = TableDefinition::new("devnets");
const NODES: TableDefinition<&str, &[u8]> = TableDefinition::new("nodes");
const UPGRADES: TableDefinition<&str, &[u8]> = TableDefinition::new("upgrades");
const TRANSACTIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("transactions");
const META: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");

const NODES_BY_DEVNET: TableDefinition<&str, &[u8]> = TableDefinition::new("nodes_by_devnet");
const UPGRADES_BY_DEVNET: TableDefinition<&str, &[u8]> =
    TableDefinition::new("upgrades_by_devnet");
const TRANSACTIONS_BY_DEVNET: TableDefinition<&str, &[u8]> =
    TableDefinition::new("transactions_by_devnet");

const SCHEMA_VERSION: &[u8] = b"1";

fn table_def(kind: ResourceKind) -> TableDefinition<'static, &'static str, &'static [u8]> {
    match kind {
        ResourceKind::Devnet => DEVNETS,
        ResourceKind::Node => NODES,
        ResourceKind::Upgrade => UPGRADES,
        ResourceKind::Transaction => TRANSACTIONS,
    }
}

fn index_def(
    kind: ResourceKind,
) -> Option<TableDefinition<'static, &'static str, &'static [u8]>> {
    match kind {
        ResourceKind::Devnet => None,
        ResourceKind::Node => Some(NODES_BY_DEVNET),
        ResourceKind::Upgrade => Some(UPGRADES_BY_DEVNET),
        ResourceKind::Transaction => Some(TRANSACTIONS_BY_DEVNET),
    }
}

/// The single source of ground truth for all resources.
pub struct Store {
    db: Database,
    hub: WatchHub,
    /// Serializes mutation + event publish so subscribers observe commit
    /// order. The database already serializes writers; this extends the
    /// critical section over the fan-out.
    write_lock: Mutex<()>,
}

impl Store {
    /// Open (or create) the store file. The file is locked exclusively by
    /// the embedded database; a second daemon instance fails here.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let db = Database::create(path)?;

        // Create all tables up front so reads never race table creation.
        let txn = db.begin_write()?;
        {
            txn.open_table(DEVNETS)?;
            txn.open_table(NODES)?;
            txn.open_table(UPGRADES)?;
            txn.open_table(TRANSACTIONS)?;
            txn.open_table(NODES_BY_DEVNET)?;
            txn.open_table(UPGRADES_BY_DEVNET)?;
            txn.open_table(TRANSACTIONS_BY_DEVNET)?;
            let mut meta = txn.open_table(META)?;
            if meta.get("schema_version")?.is_none() {
                meta.insert("schema_version", SCHEMA_VERSION)?;
            }
        }
        txn.commit()?;

        Ok(Self {
            db,
            hub: WatchHub::default(),
            write_lock: Mutex::new(()),
        })
    }

    // ------------------------------------------------------------------
    // CRUD
    // ------------------------------------------------------------------

    /// Insert a new resource. Generation is forced to 1 and both
    /// timestamps to now, regardless of what the caller supplied.
    pub fn create<R: Resource>(&self, mut resource: R) -> Result<R> {
        let now = chrono::Utc::now();
        {
            let meta = resource.meta_mut();
            meta.generation = 1;
            meta.created_at = now;
            meta.updated_at = now;
        }
        let key = resource.key();
        let value = serde_json::to_vec(&resource)?;

        let _guard = self.write_lock.lock().expect("store write lock poisoned");
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(table_def(R::KIND))?;
            if table.get(key.as_str())?.is_some() {
                return Err(Error::AlreadyExists {
                    kind: R::KIND.as_str(),
                    key,
                });
            }
            table.insert(key.as_str(), value.as_slice())?;

            if let (Some(def), Some(parent)) = (index_def(R::KIND), resource.parent_ref()) {
                let mut index = txn.open_table(def)?;
                let index_key = index_key(&resource.meta().namespace, parent, &resource.meta().name);
                index.insert(index_key.as_str(), key.as_bytes())?;
            }
        }
        txn.commit()?;
        debug!(kind = %R::KIND, %key, "created resource");

        self.hub.publish(ResourceEvent {
            event_type: EventType::Added,
            key,
            resource: resource.clone(),
        });
        Ok(resource)
    }

    pub fn get<R: Resource>(&self, namespace: &str, name: &str) -> Result<R> {
        let key = format!("{namespace}/{name}");
        let txn = self.db.begin_read()?;
        let table = txn.open_table(table_def(R::KIND))?;
        let value = table.get(key.as_str())?.ok_or(Error::NotFound {
            kind: R::KIND.as_str(),
            key: key.clone(),
        })?;
        Ok(serde_json::from_slice(value.value())?)
    }

    /// Replace a resource under optimistic concurrency: the incoming
    /// generation must equal the stored one, or the write is rejected
    /// with a conflict and nothing is applied.
    pub fn update<R: Resource>(&self, mut resource: R) -> Result<R> {
        let key = resource.key();

        let _guard = self.write_lock.lock().expect("store write lock poisoned");
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(table_def(R::KIND))?;
            let stored_bytes = table
                .get(key.as_str())?
                .map(|g| g.value().to_vec())
                .ok_or(Error::NotFound {
                    kind: R::KIND.as_str(),
                    key: key.clone(),
                })?;
            let stored: R = serde_json::from_slice(&stored_bytes)?;

            let stored_gen = stored.meta().generation;
            if resource.meta().generation != stored_gen {
                return Err(Error::Conflict {
                    kind: R::KIND.as_str(),
                    key,
                    stored: stored_gen,
                    requested: resource.meta().generation,
                });
            }

            {
                let meta = resource.meta_mut();
                meta.generation = stored_gen + 1;
                meta.created_at = stored.meta().created_at;
                meta.updated_at = chrono::Utc::now();
            }
            let value = serde_json::to_vec(&resource)?;
            table.insert(key.as_str(), value.as_slice())?;

            // Re-point the parent index if the reference moved.
            if let Some(def) = index_def(R::KIND) {
                let old_parent = stored.parent_ref().map(str::to_string);
                let new_parent = resource.parent_ref().map(str::to_string);
                if old_parent != new_parent {
                    let mut index = txn.open_table(def)?;
                    let meta = resource.meta();
                    if let Some(old) = old_parent {
                        index.remove(index_key(&meta.namespace, &old, &meta.name).as_str())?;
                    }
                    if let Some(new) = new_parent {
                        index.insert(
                            index_key(&meta.namespace, &new, &meta.name).as_str(),
                            key.as_bytes(),
                        )?;
                    }
                }
            }
        }
        txn.commit()?;
        debug!(kind = %R::KIND, %key, generation = resource.meta().generation, "updated resource");

        self.hub.publish(ResourceEvent {
            event_type: EventType::Modified,
            key,
            resource: resource.clone(),
        });
        Ok(resource)
    }

    /// Read-modify-write with a bounded retry on generation conflicts.
    /// Used by controllers whose status writes may race spec updates.
    pub fn update_with<R, F>(&self, namespace: &str, name: &str, mut mutate: F) -> Result<R>
    where
        R: Resource,
        F: FnMut(&mut R),
    {
        const MAX_ATTEMPTS: usize = 5;
        let mut last_err = None;
        for _ in 0..MAX_ATTEMPTS {
            let mut resource: R = self.get(namespace, name)?;
            mutate(&mut resource);
            match self.update(resource) {
                Ok(updated) => return Ok(updated),
                Err(e @ Error::Conflict { .. }) => last_err = Some(e),
                Err(e) => return Err(e),
            }
        }
        Err(last_err.expect("conflict retry exhausted without error"))
    }

    /// List resources, optionally restricted to one namespace.
    pub fn list<R: Resource>(&self, namespace: Option<&str>) -> Result<Vec<R>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(table_def(R::KIND))?;
        let mut out = Vec::new();
        match namespace {
            Some(ns) => {
                let prefix = format!("{ns}/");
                for entry in table.range(prefix.as_str()..)? {
                    let (k, v) = entry?;
                    if !k.value().starts_with(&prefix) {
                        break;
                    }
                    out.push(serde_json::from_slice(v.value())?);
                }
            }
            None => {
                for entry in table.iter()? {
                    let (_, v) = entry?;
                    out.push(serde_json::from_slice(v.value())?);
                }
            }
        }
        Ok(out)
    }

    /// Delete one resource. Not-found is surfaced distinctly from success.
    pub fn delete<R: Resource>(&self, namespace: &str, name: &str) -> Result<()> {
        let key = format!("{namespace}/{name}");

        let _guard = self.write_lock.lock().expect("store write lock poisoned");
        let txn = self.db.begin_write()?;
        let removed: R = {
            let mut table = txn.open_table(table_def(R::KIND))?;
            let bytes = table
                .remove(key.as_str())?
                .map(|g| g.value().to_vec())
                .ok_or(Error::NotFound {
                    kind: R::KIND.as_str(),
                    key: key.clone(),
                })?;
            let removed: R = serde_json::from_slice(&bytes)?;

            if let (Some(def), Some(parent)) = (index_def(R::KIND), removed.parent_ref()) {
                let mut index = txn.open_table(def)?;
                index.remove(index_key(namespace, parent, name).as_str())?;
            }
            removed
        };
        txn.commit()?;
        debug!(kind = %R::KIND, %key, "deleted resource");

        self.hub.publish(ResourceEvent {
            event_type: EventType::Deleted,
            key,
            resource: removed,
        });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Parent-scoped helpers
    // ------------------------------------------------------------------

    fn list_by_devnet<R: Resource>(&self, namespace: &str, devnet: &str) -> Result<Vec<R>> {
        let def = index_def(R::KIND).ok_or(Error::Unsupported("parent-scoped list"))?;
        let txn = self.db.begin_read()?;
        let index = txn.open_table(def)?;
        let table = txn.open_table(table_def(R::KIND))?;

        let prefix = format!("{namespace}/{devnet}/");
        let mut out = Vec::new();
        for entry in index.range(prefix.as_str()..)? {
            let (k, primary) = entry?;
            if !k.value().starts_with(&prefix) {
                break;
            }
            let primary_key = String::from_utf8_lossy(primary.value()).into_owned();
            if let Some(v) = table.get(primary_key.as_str())? {
                out.push(serde_json::from_slice(v.value())?);
            }
        }
        Ok(out)
    }

    fn delete_by_devnet<R: Resource>(&self, namespace: &str, devnet: &str) -> Result<usize> {
        let def = index_def(R::KIND).ok_or(Error::Unsupported("parent-scoped delete"))?;

        let _guard = self.write_lock.lock().expect("store write lock poisoned");
        let txn = self.db.begin_write()?;
        let removed: Vec<R> = {
            let mut index = txn.open_table(def)?;
            let mut table = txn.open_table(table_def(R::KIND))?;

            let prefix = format!("{namespace}/{devnet}/");
            let mut index_keys = Vec::new();
            for entry in index.range(prefix.as_str()..)? {
                let (k, primary) = entry?;
                if !k.value().starts_with(&prefix) {
                    break;
                }
                index_keys.push((
                    k.value().to_string(),
                    String::from_utf8_lossy(primary.value()).into_owned(),
                ));
            }

            let mut removed = Vec::new();
            for (index_key, primary_key) in index_keys {
                index.remove(index_key.as_str())?;
                if let Some(bytes) = table
                    .remove(primary_key.as_str())?
                    .map(|g| g.value().to_vec())
                {
                    removed.push(serde_json::from_slice::<R>(&bytes)?);
                }
            }
            removed
        };
        txn.commit()?;

        let count = removed.len();
        for resource in removed {
            self.hub.publish(ResourceEvent {
                event_type: EventType::Deleted,
                key: resource.key(),
                resource,
            });
        }
        debug!(kind = %R::KIND, namespace, devnet, count, "cascade-deleted children");
        Ok(count)
    }

    pub fn list_nodes_by_devnet(&self, namespace: &str, devnet: &str) -> Result<Vec<Node>> {
        self.list_by_devnet(namespace, devnet)
    }

    pub fn list_upgrades_by_devnet(&self, namespace: &str, devnet: &str) -> Result<Vec<Upgrade>> {
        self.list_by_devnet(namespace, devnet)
    }

    pub fn list_transactions_by_devnet(
        &self,
        namespace: &str,
        devnet: &str,
    ) -> Result<Vec<Transaction>> {
        self.list_by_devnet(namespace, devnet)
    }

    pub fn delete_nodes_by_devnet(&self, namespace: &str, devnet: &str) -> Result<usize> {
        self.delete_by_devnet::<Node>(namespace, devnet)
    }

    pub fn delete_upgrades_by_devnet(&self, namespace: &str, devnet: &str) -> Result<usize> {
        self.delete_by_devnet::<Upgrade>(namespace, devnet)
    }

    pub fn delete_transactions_by_devnet(&self, namespace: &str, devnet: &str) -> Result<usize> {
        self.delete_by_devnet::<Transaction>(namespace, devnet)
    }

    // ------------------------------------------------------------------
    // Watch
    // ------------------------------------------------------------------

    /// Subscribe to changes of one kind. The current contents are replayed
    /// as `Added` events before any live event; delivery is independent per
    /// subscriber and never blocks writers.
    pub fn watch<R: Resource>(&self) -> Result<UnboundedReceiver<ResourceEvent<R>>> {
        // Holding the write lock pins the replay snapshot: no mutation can
        // commit (and publish) between the list and the registration.
        let _guard = self.write_lock.lock().expect("store write lock poisoned");
        let replay = self.list::<R>(None)?;
        Ok(self.hub.subscribe(replay))
    }
}

fn index_key(namespace: &str, devnet: &str, name: &str) -> String {
    format!("{namespace}/{devnet}/{name}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::{
        Devnet, DevnetSpec, Node, NodeRole, NodeSpec, Upgrade, UpgradeSpec,
    };

    fn scratch_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("state.redb")).unwrap();
        (dir, store)
    }

    fn devnet(name: &str, namespace: &str) -> Devnet {
        Devnet::new(
            name,
            namespace,
            DevnetSpec {
                plugin: "stable".to_string(),
                validators: 1,
                ..Default::default()
            },
        )
    }

    fn node(name: &str, namespace: &str, devnet: &str, index: u32) -> Node {
        Node::new(
            name,
            namespace,
            NodeSpec {
                devnet_ref: devnet.to_string(),
                namespace_ref: namespace.to_string(),
                index,
                role: NodeRole::Validator,
                home_dir: format!("/tmp/{name}"),
                ..Default::default()
            },
        )
    }

    #[test]
    fn generation_starts_at_one_and_increments() {
        let (_dir, store) = scratch_store();
        let created = store.create(devnet("d1", "default")).unwrap();
        assert_eq!(created.meta.generation, 1);

        let mut current = created;
        for expected in 2..=5 {
            current.spec.full_nodes += 1;
            current = store.update(current).unwrap();
            assert_eq!(current.meta.generation, expected);
        }
    }

    #[test]
    fn stale_generation_is_rejected() {
        let (_dir, store) = scratch_store();
        store.create(devnet("d1", "default")).unwrap();

        // Two clients read at generation 1.
        let mut first: Devnet = store.get("default", "d1").unwrap();
        let mut second: Devnet = store.get("default", "d1").unwrap();

        first.spec.full_nodes = 1;
        store.update(first).unwrap();

        second.spec.full_nodes = 2;
        let err = store.update(second).unwrap_err();
        assert!(matches!(err, Error::Conflict { stored: 2, requested: 1, .. }));

        // The first write stands; generation is 2, not 3.
        let stored: Devnet = store.get("default", "d1").unwrap();
        assert_eq!(stored.meta.generation, 2);
        assert_eq!(stored.spec.full_nodes, 1);
    }

    #[test]
    fn create_duplicate_is_already_exists() {
        let (_dir, store) = scratch_store();
        store.create(devnet("d1", "default")).unwrap();
        let err = store.create(devnet("d1", "default")).unwrap_err();
        assert!(matches!(err, Error::AlreadyExists { .. }));
    }

    #[test]
    fn delete_missing_is_not_found() {
        let (_dir, store) = scratch_store();
        let err = store.delete::<Devnet>("default", "nope").unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[test]
    fn list_is_namespace_scoped() {
        let (_dir, store) = scratch_store();
        store.create(devnet("d1", "team-a")).unwrap();
        store.create(devnet("d2", "team-a")).unwrap();
        store.create(devnet("d1", "team-b")).unwrap();

        let team_a: Vec<Devnet> = store.list(Some("team-a")).unwrap();
        assert_eq!(team_a.len(), 2);
        let all: Vec<Devnet> = store.list(None).unwrap();
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn parent_scoped_lookups_and_cascade() {
        let (_dir, store) = scratch_store();
        store.create(devnet("d1", "default")).unwrap();
        store.create(devnet("d2", "default")).unwrap();
        store.create(node("d1-node-0", "default", "d1", 0)).unwrap();
        store.create(node("d1-node-1", "default", "d1", 1)).unwrap();
        store.create(node("d2-node-0", "default", "d2", 0)).unwrap();
        store
            .create(Upgrade::new(
                "u1",
                "default",
                UpgradeSpec {
                    devnet_ref: "d1".to_string(),
                    upgrade_name: "v2".to_string(),
                    ..Default::default()
                },
            ))
            .unwrap();

        assert_eq!(store.list_nodes_by_devnet("default", "d1").unwrap().len(), 2);
        assert_eq!(store.list_nodes_by_devnet("default", "d2").unwrap().len(), 1);

        assert_eq!(store.delete_nodes_by_devnet("default", "d1").unwrap(), 2);
        assert_eq!(store.delete_upgrades_by_devnet("default", "d1").unwrap(), 1);
        assert!(store.list_nodes_by_devnet("default", "d1").unwrap().is_empty());

        // d2's child is untouched.
        assert_eq!(store.list_nodes_by_devnet("default", "d2").unwrap().len(), 1);

        // Cascade is idempotent.
        assert_eq!(store.delete_nodes_by_devnet("default", "d1").unwrap(), 0);
    }

    #[tokio::test]
    async fn watch_replays_then_streams() {
        let (_dir, store) = scratch_store();
        store.create(devnet("d1", "default")).unwrap();
        store.create(devnet("d2", "default")).unwrap();
        store.create(devnet("d3", "default")).unwrap();

        let mut rx = store.watch::<Devnet>().unwrap();

        // Exactly one Added per stored resource, before anything else.
        let mut replayed = Vec::new();
        for _ in 0..3 {
            let event = rx.recv().await.unwrap();
            assert_eq!(event.event_type, EventType::Added);
            replayed.push(event.key);
        }
        replayed.sort();
        assert_eq!(replayed, vec!["default/d1", "default/d2", "default/d3"]);

        let mut d1: Devnet = store.get("default", "d1").unwrap();
        d1.spec.full_nodes = 3;
        store.update(d1).unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, EventType::Modified);
        assert_eq!(event.key, "default/d1");
        assert_eq!(event.resource.spec.full_nodes, 3);

        store.delete::<Devnet>("default", "d2").unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, EventType::Deleted);
        assert_eq!(event.key, "default/d2");
    }

    #[test]
    fn update_with_retries_to_success() {
        let (_dir, store) = scratch_store();
        store.create(devnet("d1", "default")).unwrap();
        let updated = store
            .update_with::<Devnet, _>("default", "d1", |d| {
                d.status.ready_nodes = 2;
            })
            .unwrap();
        assert_eq!(updated.status.ready_nodes, 2);
        assert_eq!(updated.meta.generation, 2);
    }
}
