//! StateStore: redb-backed persistence for the Zoekt orchestrator.
//!
//! Records are JSON-serialized into `u64`-keyed tables. Workers do all of
//! their reads and writes for one invocation inside a single
//! [`StateStore::write`] closure, so a scoped bulk update is atomic: the
//! eligibility check and the mutation see the same snapshot, and a failure
//! anywhere aborts the whole batch.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// A persisted domain type with a `u64` primary key.
pub trait Record: Serialize + DeserializeOwned {
    const TABLE: TableDefinition<'static, u64, &'static [u8]>;
    /// Sequence name used when allocating ids.
    const KIND: &'static str;

    fn id(&self) -> u64;
    fn set_id(&mut self, id: u64);
}

macro_rules! record {
    ($ty:ty, $table:expr, $kind:literal) => {
        impl Record for $ty {
            const TABLE: TableDefinition<'static, u64, &'static [u8]> = $table;
            const KIND: &'static str = $kind;

            fn id(&self) -> u64 {
                self.id
            }

            fn set_id(&mut self, id: u64) {
                self.id = id;
            }
        }
    };
}

record!(Node, NODES, "nodes");
record!(EnabledNamespace, ENABLED_NAMESPACES, "enabled_namespaces");
record!(Replica, REPLICAS, "replicas");
record!(Index, INDICES, "indices");
record!(Repository, REPOSITORIES, "repositories");
record!(Task, TASKS, "tasks");
record!(Project, PROJECTS, "projects");
record!(Namespace, NAMESPACES, "namespaces");

/// Read access shared by read-only and read-write transactions.
pub trait Snapshot {
    fn all<R: Record>(&self) -> StateResult<Vec<R>>;
    fn get<R: Record>(&self, id: u64) -> StateResult<Option<R>>;

    fn filter<R: Record, F: Fn(&R) -> bool>(&self, predicate: F) -> StateResult<Vec<R>> {
        Ok(self.all::<R>()?.into_iter().filter(|r| predicate(r)).collect())
    }

    fn exists<R: Record>(&self, id: u64) -> StateResult<bool> {
        Ok(self.get::<R>(id)?.is_some())
    }
}

fn decode_all<R: Record>(table: &impl ReadableTable<u64, &'static [u8]>) -> StateResult<Vec<R>> {
    let mut results = Vec::new();
    for entry in table.iter().map_err(map_err!(Read))? {
        let (_, value) = entry.map_err(map_err!(Read))?;
        let record: R = serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
        results.push(record);
    }
    Ok(results)
}

fn decode_one<R: Record>(
    table: &impl ReadableTable<u64, &'static [u8]>,
    id: u64,
) -> StateResult<Option<R>> {
    match table.get(id).map_err(map_err!(Read))? {
        Some(guard) => {
            let record: R =
                serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
            Ok(Some(record))
        }
        None => Ok(None),
    }
}

/// A read-only snapshot of the store.
pub struct ReadTx {
    txn: redb::ReadTransaction,
}

impl Snapshot for ReadTx {
    fn all<R: Record>(&self) -> StateResult<Vec<R>> {
        let table = self.txn.open_table(R::TABLE).map_err(map_err!(Table))?;
        decode_all(&table)
    }

    fn get<R: Record>(&self, id: u64) -> StateResult<Option<R>> {
        let table = self.txn.open_table(R::TABLE).map_err(map_err!(Table))?;
        decode_one(&table, id)
    }
}

/// A read-write transaction. Nothing is visible to other readers until the
/// enclosing [`StateStore::write`] closure returns `Ok`.
pub struct WriteTx {
    txn: redb::WriteTransaction,
}

impl Snapshot for WriteTx {
    fn all<R: Record>(&self) -> StateResult<Vec<R>> {
        let table = self.txn.open_table(R::TABLE).map_err(map_err!(Table))?;
        decode_all(&table)
    }

    fn get<R: Record>(&self, id: u64) -> StateResult<Option<R>> {
        let table = self.txn.open_table(R::TABLE).map_err(map_err!(Table))?;
        decode_one(&table, id)
    }
}

impl WriteTx {
    /// Allocate an id for `record` and store it.
    pub fn insert<R: Record>(&self, mut record: R) -> StateResult<R> {
        let id = self.next_id(R::KIND)?;
        record.set_id(id);
        self.put(&record)?;
        Ok(record)
    }

    /// Insert or overwrite `record` under its current id.
    pub fn put<R: Record>(&self, record: &R) -> StateResult<()> {
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let mut table = self.txn.open_table(R::TABLE).map_err(map_err!(Table))?;
        table
            .insert(record.id(), value.as_slice())
            .map_err(map_err!(Write))?;
        Ok(())
    }

    /// Delete a record by id. Returns true if it existed.
    pub fn remove<R: Record>(&self, id: u64) -> StateResult<bool> {
        let mut table = self.txn.open_table(R::TABLE).map_err(map_err!(Table))?;
        let existed = table.remove(id).map_err(map_err!(Write))?.is_some();
        Ok(existed)
    }

    /// Delete every listed id, returning how many existed.
    pub fn remove_many<R: Record>(&self, ids: &[u64]) -> StateResult<usize> {
        let mut table = self.txn.open_table(R::TABLE).map_err(map_err!(Table))?;
        let mut removed = 0;
        for id in ids {
            if table.remove(*id).map_err(map_err!(Write))?.is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn next_id(&self, kind: &str) -> StateResult<u64> {
        let mut table = self.txn.open_table(SEQUENCES).map_err(map_err!(Table))?;
        let current = table
            .get(kind)
            .map_err(map_err!(Read))?
            .map(|guard| guard.value())
            .unwrap_or(0);
        let next = current + 1;
        table.insert(kind, next).map_err(map_err!(Write))?;
        Ok(next)
    }

    /// Set `key` to expire at `expires_at` unless an unexpired mark exists.
    /// Returns true if the mark was set.
    pub fn set_mark_if_absent(&self, key: &str, now: u64, expires_at: u64) -> StateResult<bool> {
        let mut table = self
            .txn
            .open_table(SCHEDULE_MARKS)
            .map_err(map_err!(Table))?;
        let current = table
            .get(key)
            .map_err(map_err!(Read))?
            .map(|guard| guard.value());
        if current.is_some_and(|until| until > now) {
            return Ok(false);
        }
        table.insert(key, expires_at).map_err(map_err!(Write))?;
        Ok(true)
    }

    pub fn clear_mark(&self, key: &str) -> StateResult<bool> {
        let mut table = self
            .txn
            .open_table(SCHEDULE_MARKS)
            .map_err(map_err!(Table))?;
        let existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        Ok(existed)
    }
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        for table in [
            NODES,
            ENABLED_NAMESPACES,
            REPLICAS,
            INDICES,
            REPOSITORIES,
            TASKS,
            PROJECTS,
            NAMESPACES,
        ] {
            txn.open_table(table).map_err(map_err!(Table))?;
        }
        txn.open_table(SEQUENCES).map_err(map_err!(Table))?;
        txn.open_table(SCHEDULE_MARKS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Run `f` in one write transaction, committing only if it succeeds.
    pub fn write<T>(&self, f: impl FnOnce(&WriteTx) -> StateResult<T>) -> StateResult<T> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let tx = WriteTx { txn };
        match f(&tx) {
            Ok(value) => {
                tx.txn.commit().map_err(map_err!(Transaction))?;
                Ok(value)
            }
            Err(e) => {
                tx.txn.abort().map_err(map_err!(Transaction))?;
                Err(e)
            }
        }
    }

    /// Run `f` against a consistent read-only snapshot.
    pub fn read<T>(&self, f: impl FnOnce(&ReadTx) -> StateResult<T>) -> StateResult<T> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        f(&ReadTx { txn })
    }

    // ── Single-record conveniences ─────────────────────────────────

    pub fn get<R: Record>(&self, id: u64) -> StateResult<Option<R>> {
        self.read(|tx| tx.get(id))
    }

    pub fn all<R: Record>(&self) -> StateResult<Vec<R>> {
        self.read(|tx| tx.all())
    }

    pub fn insert<R: Record>(&self, record: R) -> StateResult<R> {
        let record = self.write(|tx| tx.insert(record))?;
        debug!(kind = R::KIND, id = record.id(), "record inserted");
        Ok(record)
    }

    pub fn put<R: Record>(&self, record: &R) -> StateResult<()> {
        self.write(|tx| tx.put(record))
    }

    pub fn remove<R: Record>(&self, id: u64) -> StateResult<bool> {
        self.write(|tx| tx.remove::<R>(id))
    }

    /// Fetch a record that must exist.
    pub fn require<R: Record>(&self, id: u64) -> StateResult<R> {
        self.get(id)?
            .ok_or_else(|| StateError::NotFound(format!("{} {id}", R::KIND)))
    }
}
