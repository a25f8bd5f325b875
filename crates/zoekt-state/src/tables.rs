//! redb table definitions for the Zoekt orchestration store.
//!
//! Record tables use `u64` id keys and `&[u8]` values (JSON-serialized
//! domain types). Ids are allocated from the `sequences` table, keyed by
//! record kind.

use redb::TableDefinition;

pub const NODES: TableDefinition<u64, &[u8]> = TableDefinition::new("nodes");

pub const ENABLED_NAMESPACES: TableDefinition<u64, &[u8]> =
    TableDefinition::new("enabled_namespaces");

pub const REPLICAS: TableDefinition<u64, &[u8]> = TableDefinition::new("replicas");

pub const INDICES: TableDefinition<u64, &[u8]> = TableDefinition::new("indices");

pub const REPOSITORIES: TableDefinition<u64, &[u8]> = TableDefinition::new("repositories");

pub const TASKS: TableDefinition<u64, &[u8]> = TableDefinition::new("tasks");

/// Host-owned projects, keyed by project id.
pub const PROJECTS: TableDefinition<u64, &[u8]> = TableDefinition::new("projects");

/// Host-owned namespaces, keyed by namespace id.
pub const NAMESPACES: TableDefinition<u64, &[u8]> = TableDefinition::new("namespaces");

/// Last allocated id per record kind.
pub const SEQUENCES: TableDefinition<&str, u64> = TableDefinition::new("sequences");

/// Scheduling cache keys mapped to their expiry (Unix seconds).
pub const SCHEDULE_MARKS: TableDefinition<&str, u64> = TableDefinition::new("schedule_marks");
