//! Durable Raft log backed by redb.
//!
//! Entries, the vote, the committed index and the purge mark all live in
//! one redb database under the manager's `raft/` state directory. Every
//! append commits a redb write transaction before acknowledging, which
//! is the write-ahead guarantee the rest of the system leans on: an
//! acknowledged entry survives a crash.

use std::fmt::Debug;
use std::ops::RangeBounds;
use std::sync::Arc;

use openraft::storage::{LogFlushed, LogState, RaftLogReader, RaftLogStorage};
use openraft::{Entry, ErrorSubject, ErrorVerb, LogId, StorageError, Vote};
use redb::{Database, ReadableTable, TableDefinition};
use tracing::debug;

use crate::typ::TypeConfig;

/// Log entries: index → JSON-encoded entry.
const ENTRIES: TableDefinition<u64, &[u8]> = TableDefinition::new("log_entries");

/// Hard state: name → JSON bytes.
const HARD_STATE: TableDefinition<&str, &[u8]> = TableDefinition::new("log_hard_state");

const VOTE_KEY: &str = "vote";
const COMMITTED_KEY: &str = "committed";
const PURGED_KEY: &str = "purged";

fn read_err(e: impl std::fmt::Display) -> StorageError<u64> {
    StorageError::from_io_error(
        ErrorSubject::Logs,
        ErrorVerb::Read,
        std::io::Error::other(e.to_string()),
    )
}

fn write_err(e: impl std::fmt::Display) -> StorageError<u64> {
    StorageError::from_io_error(
        ErrorSubject::Logs,
        ErrorVerb::Write,
        std::io::Error::other(e.to_string()),
    )
}

/// Raft log storage. Clones share the same database.
#[derive(Clone)]
pub struct LogStore {
    db: Arc<Database>,
}

impl LogStore {
    /// Open the log tables in the given database, creating them if absent.
    pub fn new(db: Arc<Database>) -> Result<Self, StorageError<u64>> {
        let txn = db.begin_write().map_err(write_err)?;
        txn.open_table(ENTRIES).map_err(write_err)?;
        txn.open_table(HARD_STATE).map_err(write_err)?;
        txn.commit().map_err(write_err)?;
        Ok(Self { db })
    }

    fn put_hard_state(&self, key: &str, data: &[u8]) -> Result<(), StorageError<u64>> {
        let txn = self.db.begin_write().map_err(write_err)?;
        {
            let mut table = txn.open_table(HARD_STATE).map_err(write_err)?;
            table.insert(key, data).map_err(write_err)?;
        }
        txn.commit().map_err(write_err)?;
        Ok(())
    }

    fn get_hard_state(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError<u64>> {
        let txn = self.db.begin_read().map_err(read_err)?;
        let table = txn.open_table(HARD_STATE).map_err(read_err)?;
        Ok(table
            .get(key)
            .map_err(read_err)?
            .map(|guard| guard.value().to_vec()))
    }

    /// Delete the entry range `[from, to)`; unbounded `to` removes the tail.
    fn delete_range(&self, from: u64, to: Option<u64>) -> Result<usize, StorageError<u64>> {
        let txn = self.db.begin_write().map_err(write_err)?;
        let removed;
        {
            let mut table = txn.open_table(ENTRIES).map_err(write_err)?;
            let keys: Vec<u64> = match to {
                Some(to) => table.range(from..to),
                None => table.range(from..),
            }
            .map_err(write_err)?
            .map(|item| item.map(|(k, _)| k.value()))
            .collect::<Result<_, _>>()
            .map_err(write_err)?;

            removed = keys.len();
            for key in keys {
                table.remove(key).map_err(write_err)?;
            }
        }
        txn.commit().map_err(write_err)?;
        Ok(removed)
    }
}

impl RaftLogReader<TypeConfig> for LogStore {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + Send>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, StorageError<u64>> {
        let txn = self.db.begin_read().map_err(read_err)?;
        let table = txn.open_table(ENTRIES).map_err(read_err)?;

        let mut entries = Vec::new();
        for item in table.range(range).map_err(read_err)? {
            let (_, value) = item.map_err(read_err)?;
            entries.push(serde_json::from_slice(value.value()).map_err(read_err)?);
        }
        Ok(entries)
    }
}

impl RaftLogStorage<TypeConfig> for LogStore {
    type LogReader = LogStore;

    async fn get_log_state(&mut self) -> Result<LogState<TypeConfig>, StorageError<u64>> {
        let last_log_id = {
            let txn = self.db.begin_read().map_err(read_err)?;
            let table = txn.open_table(ENTRIES).map_err(read_err)?;
            let last = match table.last().map_err(read_err)? {
                Some((_, value)) => {
                    let entry: Entry<TypeConfig> =
                        serde_json::from_slice(value.value()).map_err(read_err)?;
                    Some(entry.log_id)
                }
                None => None,
            };
            last
        };

        let last_purged_log_id = match self.get_hard_state(PURGED_KEY)? {
            Some(data) => Some(serde_json::from_slice::<LogId<u64>>(&data).map_err(read_err)?),
            None => None,
        };

        Ok(LogState {
            last_purged_log_id,
            last_log_id: last_log_id.or(last_purged_log_id),
        })
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        self.clone()
    }

    async fn save_vote(&mut self, vote: &Vote<u64>) -> Result<(), StorageError<u64>> {
        let data = serde_json::to_vec(vote).map_err(write_err)?;
        self.put_hard_state(VOTE_KEY, &data)?;
        debug!(term = vote.leader_id().term, "vote saved");
        Ok(())
    }

    async fn read_vote(&mut self) -> Result<Option<Vote<u64>>, StorageError<u64>> {
        match self.get_hard_state(VOTE_KEY)? {
            Some(data) => Ok(Some(serde_json::from_slice(&data).map_err(read_err)?)),
            None => Ok(None),
        }
    }

    async fn append<I>(
        &mut self,
        entries: I,
        callback: LogFlushed<TypeConfig>,
    ) -> Result<(), StorageError<u64>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + Send,
        I::IntoIter: Send,
    {
        let txn = self.db.begin_write().map_err(write_err)?;
        {
            let mut table = txn.open_table(ENTRIES).map_err(write_err)?;
            for entry in entries {
                let data = serde_json::to_vec(&entry).map_err(write_err)?;
                table
                    .insert(entry.log_id.index, data.as_slice())
                    .map_err(write_err)?;
            }
        }
        txn.commit().map_err(write_err)?;

        // Durable: the write transaction has committed.
        callback.log_io_completed(Ok(()));
        Ok(())
    }

    async fn truncate(&mut self, log_id: LogId<u64>) -> Result<(), StorageError<u64>> {
        let removed = self.delete_range(log_id.index, None)?;
        debug!(index = log_id.index, removed, "log truncated");
        Ok(())
    }

    async fn purge(&mut self, log_id: LogId<u64>) -> Result<(), StorageError<u64>> {
        // Record the purge mark first so a crash between the two writes
        // over-reports rather than under-reports the purged range.
        let data = serde_json::to_vec(&log_id).map_err(write_err)?;
        self.put_hard_state(PURGED_KEY, &data)?;

        let removed = self.delete_range(0, Some(log_id.index + 1))?;
        debug!(index = log_id.index, removed, "log purged");
        Ok(())
    }

    async fn save_committed(
        &mut self,
        committed: Option<LogId<u64>>,
    ) -> Result<(), StorageError<u64>> {
        if let Some(log_id) = committed {
            let data = serde_json::to_vec(&log_id).map_err(write_err)?;
            self.put_hard_state(COMMITTED_KEY, &data)?;
        }
        Ok(())
    }

    async fn read_committed(&mut self) -> Result<Option<LogId<u64>>, StorageError<u64>> {
        match self.get_hard_state(COMMITTED_KEY)? {
            Some(data) => Ok(Some(serde_json::from_slice(&data).map_err(read_err)?)),
            None => Ok(None),
        }
    }
}
