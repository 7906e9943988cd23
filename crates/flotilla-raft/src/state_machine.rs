//! Raft state machine: the in-memory object store.
//!
//! Committed entries carry store-action batches; applying one runs the
//! same validation and mutation path on every member, so the store is a
//! deterministic function of the entry sequence. The store itself is
//! volatile; durability comes from the redb log plus the snapshot blob
//! persisted here. On restart the latest snapshot is restored into the
//! store before openraft replays the remaining log.

use std::collections::BTreeSet;
use std::io::Cursor;
use std::sync::Arc;

use openraft::storage::{RaftSnapshotBuilder, RaftStateMachine};
use openraft::{
    BasicNode, Entry, EntryPayload, ErrorSubject, ErrorVerb, LogId, Snapshot, SnapshotMeta,
    StorageError, StoredMembership,
};
use redb::{Database, TableDefinition};
use tracing::{info, warn};

use flotilla_store::{RaftMemberRecord, Store, StoreSnapshot};

use crate::node_map::NodeIdMap;
use crate::typ::{Request, Response, TypeConfig};

/// Persisted snapshot: "meta" → SnapshotMeta JSON, "data" → payload blob.
const SNAPSHOT: TableDefinition<&str, &[u8]> = TableDefinition::new("sm_snapshot");

const META_KEY: &str = "meta";
const DATA_KEY: &str = "data";

fn read_err(e: impl std::fmt::Display) -> StorageError<u64> {
    StorageError::from_io_error(
        ErrorSubject::StateMachine,
        ErrorVerb::Read,
        std::io::Error::other(e.to_string()),
    )
}

fn write_err(e: impl std::fmt::Display) -> StorageError<u64> {
    StorageError::from_io_error(
        ErrorSubject::StateMachine,
        ErrorVerb::Write,
        std::io::Error::other(e.to_string()),
    )
}

/// State machine applying committed batches into the object store.
pub struct StateMachine {
    store: Store,
    db: Arc<Database>,
    node_map: Arc<NodeIdMap>,
    last_applied: Option<LogId<u64>>,
    membership: StoredMembership<u64, BasicNode>,
    /// Raft ids removed by membership changes; carried in snapshots so a
    /// restarted member keeps refusing them.
    removed: BTreeSet<u64>,
}

impl StateMachine {
    /// Create the state machine, restoring the persisted snapshot into
    /// the store if one exists.
    pub fn new(
        db: Arc<Database>,
        store: Store,
        node_map: Arc<NodeIdMap>,
    ) -> Result<Self, StorageError<u64>> {
        let txn = db.begin_write().map_err(write_err)?;
        txn.open_table(SNAPSHOT).map_err(write_err)?;
        txn.commit().map_err(write_err)?;

        let mut sm = Self {
            store,
            db,
            node_map,
            last_applied: None,
            membership: StoredMembership::default(),
            removed: BTreeSet::new(),
        };

        if let Some((meta, data)) = sm.load_snapshot()? {
            let snapshot: StoreSnapshot = serde_json::from_slice(&data).map_err(read_err)?;
            sm.store.restore(&snapshot);
            sm.removed = snapshot.removed_members.iter().copied().collect();
            sm.last_applied = meta.last_log_id;
            sm.membership = meta.last_membership;
            info!(
                applied = ?sm.last_applied,
                "state machine restored from persisted snapshot"
            );
        }

        Ok(sm)
    }

    /// Raft ids that were removed from the cluster and may not rejoin.
    pub fn removed_members(&self) -> BTreeSet<u64> {
        self.removed.clone()
    }

    fn persist_snapshot(
        &self,
        meta: &SnapshotMeta<u64, BasicNode>,
        data: &[u8],
    ) -> Result<(), StorageError<u64>> {
        let meta_bytes = serde_json::to_vec(meta).map_err(write_err)?;
        let txn = self.db.begin_write().map_err(write_err)?;
        {
            let mut table = txn.open_table(SNAPSHOT).map_err(write_err)?;
            table.insert(META_KEY, meta_bytes.as_slice()).map_err(write_err)?;
            table.insert(DATA_KEY, data).map_err(write_err)?;
        }
        txn.commit().map_err(write_err)?;
        Ok(())
    }

    #[allow(clippy::type_complexity)]
    fn load_snapshot(
        &self,
    ) -> Result<Option<(SnapshotMeta<u64, BasicNode>, Vec<u8>)>, StorageError<u64>> {
        let txn = self.db.begin_read().map_err(read_err)?;
        let table = txn.open_table(SNAPSHOT).map_err(read_err)?;

        let meta = match table.get(META_KEY).map_err(read_err)? {
            Some(guard) => serde_json::from_slice(guard.value()).map_err(read_err)?,
            None => return Ok(None),
        };
        let data = match table.get(DATA_KEY).map_err(read_err)? {
            Some(guard) => guard.value().to_vec(),
            None => return Ok(None),
        };
        Ok(Some((meta, data)))
    }

    /// Current membership as member records for the snapshot payload.
    fn member_records(&self) -> Vec<RaftMemberRecord> {
        self.membership
            .membership()
            .nodes()
            .map(|(raft_id, node)| RaftMemberRecord {
                raft_id: *raft_id,
                node_id: self
                    .node_map
                    .node_id_for(*raft_id)
                    .unwrap_or_default(),
                addr: node.addr.clone(),
            })
            .collect()
    }

    fn build_store_snapshot(&self) -> StoreSnapshot {
        let mut snapshot = self.store.snapshot();
        snapshot.members = self.member_records();
        snapshot.removed_members = self.removed.iter().copied().collect();
        snapshot
    }

    fn track_removed(&mut self, new_membership: &StoredMembership<u64, BasicNode>) {
        let old_ids: BTreeSet<u64> = self
            .membership
            .membership()
            .nodes()
            .map(|(id, _)| *id)
            .collect();
        let new_ids: BTreeSet<u64> = new_membership
            .membership()
            .nodes()
            .map(|(id, _)| *id)
            .collect();
        for id in old_ids.difference(&new_ids) {
            self.removed.insert(*id);
        }
    }
}

impl RaftStateMachine<TypeConfig> for StateMachine {
    type SnapshotBuilder = SmSnapshotBuilder;

    async fn applied_state(
        &mut self,
    ) -> Result<(Option<LogId<u64>>, StoredMembership<u64, BasicNode>), StorageError<u64>> {
        Ok((self.last_applied, self.membership.clone()))
    }

    async fn apply<I>(&mut self, entries: I) -> Result<Vec<Response>, StorageError<u64>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + Send,
        I::IntoIter: Send,
    {
        let mut responses = Vec::new();

        for entry in entries {
            self.last_applied = Some(entry.log_id);

            match entry.payload {
                EntryPayload::Blank => {
                    responses.push(Response {
                        applied: true,
                        error: None,
                    });
                }
                EntryPayload::Normal(Request { actions }) => {
                    match self.store.apply_actions(&actions) {
                        Ok(()) => responses.push(Response {
                            applied: true,
                            error: None,
                        }),
                        // A rejected batch is rejected identically on every
                        // member; the entry is consumed either way.
                        Err(err) => {
                            warn!(
                                index = entry.log_id.index,
                                error = %err,
                                "committed batch rejected by store"
                            );
                            responses.push(Response {
                                applied: false,
                                error: Some(err.to_string()),
                            });
                        }
                    }
                }
                EntryPayload::Membership(membership) => {
                    let stored = StoredMembership::new(Some(entry.log_id), membership);
                    self.track_removed(&stored);
                    self.membership = stored;
                    responses.push(Response {
                        applied: true,
                        error: None,
                    });
                }
            }
        }

        Ok(responses)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        SmSnapshotBuilder {
            snapshot: self.build_store_snapshot(),
            meta: SnapshotMeta {
                last_log_id: self.last_applied,
                last_membership: self.membership.clone(),
                snapshot_id: snapshot_id(self.last_applied),
            },
            db: Arc::clone(&self.db),
        }
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Box<Cursor<Vec<u8>>>, StorageError<u64>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<u64, BasicNode>,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), StorageError<u64>> {
        let data = snapshot.into_inner();
        let store_snapshot: StoreSnapshot = serde_json::from_slice(&data).map_err(read_err)?;

        self.store.restore(&store_snapshot);
        self.removed = store_snapshot.removed_members.iter().copied().collect();
        self.last_applied = meta.last_log_id;
        self.membership = meta.last_membership.clone();
        self.persist_snapshot(meta, &data)?;

        info!(
            applied = ?meta.last_log_id,
            tasks = store_snapshot.tasks.len(),
            "snapshot installed"
        );
        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<TypeConfig>>, StorageError<u64>> {
        match self.load_snapshot()? {
            Some((meta, data)) => Ok(Some(Snapshot {
                meta,
                snapshot: Box::new(Cursor::new(data)),
            })),
            None => Ok(None),
        }
    }
}

/// Snapshot builder carrying a point-in-time copy of the store.
pub struct SmSnapshotBuilder {
    snapshot: StoreSnapshot,
    meta: SnapshotMeta<u64, BasicNode>,
    db: Arc<Database>,
}

impl RaftSnapshotBuilder<TypeConfig> for SmSnapshotBuilder {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError<u64>> {
        let data = serde_json::to_vec(&self.snapshot).map_err(write_err)?;

        let meta_bytes = serde_json::to_vec(&self.meta).map_err(write_err)?;
        let txn = self.db.begin_write().map_err(write_err)?;
        {
            let mut table = txn.open_table(SNAPSHOT).map_err(write_err)?;
            table.insert(META_KEY, meta_bytes.as_slice()).map_err(write_err)?;
            table.insert(DATA_KEY, data.as_slice()).map_err(write_err)?;
        }
        txn.commit().map_err(write_err)?;

        Ok(Snapshot {
            meta: self.meta.clone(),
            snapshot: Box::new(Cursor::new(data)),
        })
    }
}

fn snapshot_id(last: Option<LogId<u64>>) -> String {
    match last {
        Some(log_id) => format!("snap-{}-{}", log_id.leader_id, log_id.index),
        None => "snap-empty".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_store::{
        Annotations, Meta, Service, ServiceSpec, StoreAction, StoreObject,
    };
    use openraft::CommittedLeaderId;
    use redb::backends::InMemoryBackend;

    fn test_db() -> Arc<Database> {
        let backend = InMemoryBackend::new();
        Arc::new(Database::builder().create_with_backend(backend).unwrap())
    }

    fn test_sm(db: Arc<Database>) -> StateMachine {
        let store = Store::new();
        let node_map = Arc::new(NodeIdMap::new(Arc::clone(&db)).unwrap());
        StateMachine::new(db, store, node_map).unwrap()
    }

    fn create_service_entry(index: u64, name: &str) -> Entry<TypeConfig> {
        let svc = Service {
            id: format!("svc-{name}"),
            meta: Meta {
                annotations: Annotations::named(name),
                ..Meta::default()
            },
            spec: ServiceSpec::default(),
            endpoint: None,
        };
        Entry {
            log_id: LogId::new(CommittedLeaderId::new(1, 1), index),
            payload: EntryPayload::Normal(Request {
                actions: vec![StoreAction::Create(svc.into_object())],
            }),
        }
    }

    #[tokio::test]
    async fn fresh_state_machine_is_empty() {
        let mut sm = test_sm(test_db());
        let (applied, _) = sm.applied_state().await.unwrap();
        assert!(applied.is_none());
    }

    #[tokio::test]
    async fn apply_writes_into_store() {
        let mut sm = test_sm(test_db());
        let store = sm.store.clone();

        let responses = sm.apply([create_service_entry(1, "web")]).await.unwrap();
        assert!(responses[0].applied);

        let svc = store.view(|tx| tx.get_by_name::<Service>("web"));
        assert!(svc.is_some());

        let (applied, _) = sm.applied_state().await.unwrap();
        assert_eq!(applied.unwrap().index, 1);
    }

    #[tokio::test]
    async fn rejected_batch_is_consumed_not_fatal() {
        let mut sm = test_sm(test_db());

        let responses = sm
            .apply([create_service_entry(1, "web"), create_service_entry(2, "web")])
            .await
            .unwrap();

        assert!(responses[0].applied);
        assert!(!responses[1].applied);
        assert!(responses[1].error.as_ref().unwrap().contains("web"));

        // The entry still advanced the applied index.
        let (applied, _) = sm.applied_state().await.unwrap();
        assert_eq!(applied.unwrap().index, 2);
    }

    #[tokio::test]
    async fn snapshot_restores_into_fresh_member() {
        let db = test_db();
        let mut sm = test_sm(Arc::clone(&db));
        sm.apply([create_service_entry(1, "web")]).await.unwrap();

        let mut builder = sm.get_snapshot_builder().await;
        let snapshot = builder.build_snapshot().await.unwrap();

        let mut fresh = test_sm(test_db());
        fresh
            .install_snapshot(&snapshot.meta, snapshot.snapshot)
            .await
            .unwrap();

        let svc = fresh.store.view(|tx| tx.get_by_name::<Service>("web"));
        assert!(svc.is_some());
        let (applied, _) = fresh.applied_state().await.unwrap();
        assert_eq!(applied.unwrap().index, 1);
    }

    #[tokio::test]
    async fn restart_restores_persisted_snapshot() {
        let db = test_db();
        {
            let mut sm = test_sm(Arc::clone(&db));
            sm.apply([create_service_entry(1, "web")]).await.unwrap();
            let mut builder = sm.get_snapshot_builder().await;
            builder.build_snapshot().await.unwrap();
        }

        // Same database, fresh store: the snapshot must rehydrate it.
        let sm = test_sm(db);
        let svc = sm.store.view(|tx| tx.get_by_name::<Service>("web"));
        assert!(svc.is_some());
    }

    #[tokio::test]
    async fn current_snapshot_roundtrips() {
        let db = test_db();
        let mut sm = test_sm(Arc::clone(&db));
        sm.apply([create_service_entry(1, "web")]).await.unwrap();

        assert!(sm.get_current_snapshot().await.unwrap().is_none());

        let mut builder = sm.get_snapshot_builder().await;
        builder.build_snapshot().await.unwrap();

        let current = sm.get_current_snapshot().await.unwrap().unwrap();
        assert_eq!(current.meta.last_log_id.unwrap().index, 1);
    }
}
