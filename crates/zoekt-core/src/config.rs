//! zoekt.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ZoektConfig {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub gates: GatesConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub data_dir: PathBuf,
    /// Seconds between cron ticks of the scheduling worker.
    pub schedule_interval_secs: u64,
    /// Maximum number of event handlers running at once.
    pub worker_concurrency: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/zoekt"),
            schedule_interval_secs: 60,
            worker_concurrency: 8,
        }
    }
}

/// Host-application switches, read once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatesConfig {
    pub licensed_and_indexing_enabled: bool,
    pub indexing_paused: bool,
    pub saas: bool,
    pub auto_index_root_namespace: bool,
}

impl Default for GatesConfig {
    fn default() -> Self {
        Self {
            licensed_and_indexing_enabled: true,
            indexing_paused: false,
            saas: false,
            auto_index_root_namespace: false,
        }
    }
}

/// Batch sizes, ceilings and thresholds shared by every worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub batch_size: usize,
    pub initial_indexing_insert_limit: usize,
    pub initial_indexing_per_node: usize,
    /// Pending-task ceiling for `index_repo` tasks.
    pub index_task_ceiling: usize,
    /// Pending-task ceiling for `delete_repo` tasks.
    pub delete_task_ceiling: usize,
    pub max_evictions_per_node: usize,
    /// Replicas provisioned for each enabled namespace.
    pub replica_count: usize,
    /// Upper bound on the indices one replica may be split into.
    pub max_indices_per_replica: usize,
    pub repositories_per_index_batch: usize,
    pub repository_retries: u32,
    pub task_retries: u32,
    /// When false, nodes are never marked lost regardless of heartbeat age.
    pub mark_lost_enabled: bool,
    pub lost_node_threshold_secs: u64,
    pub online_threshold_secs: u64,
    pub expired_subscription_grace_days: u64,
    pub default_concurrency_limit: u32,
    pub max_concurrency_limit: u32,
    pub cpu_to_tasks_ratio: f64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            initial_indexing_insert_limit: 5000,
            initial_indexing_per_node: 10,
            index_task_ceiling: 5000,
            delete_task_ceiling: 5000,
            max_evictions_per_node: 10,
            replica_count: 1,
            max_indices_per_replica: 5,
            repositories_per_index_batch: 1000,
            repository_retries: 3,
            task_retries: 5,
            mark_lost_enabled: true,
            lost_node_threshold_secs: 12 * 60 * 60,
            online_threshold_secs: 60,
            expired_subscription_grace_days: 30,
            default_concurrency_limit: 20,
            max_concurrency_limit: 200,
            cpu_to_tasks_ratio: 1.0,
        }
    }
}

impl LimitsConfig {
    /// Heartbeat age after which a node counts as lost, or `None` while
    /// lost marking is switched off.
    pub fn lost_node_threshold(&self) -> Option<u64> {
        self.mark_lost_enabled.then_some(self.lost_node_threshold_secs)
    }
}

impl ZoektConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ZoektConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load the file if it exists, falling back to defaults.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_empty_uses_defaults() {
        let config: ZoektConfig = toml::from_str("").unwrap();
        assert_eq!(config.limits.batch_size, 1000);
        assert_eq!(config.limits.lost_node_threshold(), Some(43200));
        assert_eq!(config.limits.replica_count, 1);
        assert_eq!(config.limits.max_indices_per_replica, 5);
        assert!(config.gates.licensed_and_indexing_enabled);
        assert!(!config.gates.saas);
    }

    #[test]
    fn parse_partial_sections() {
        let toml_str = r#"
[gates]
saas = true
indexing_paused = true

[limits]
batch_size = 50
index_task_ceiling = 10
"#;
        let config: ZoektConfig = toml::from_str(toml_str).unwrap();
        assert!(config.gates.saas);
        assert!(config.gates.indexing_paused);
        assert_eq!(config.limits.batch_size, 50);
        assert_eq!(config.limits.index_task_ceiling, 10);
        assert_eq!(config.limits.repository_retries, 3);
        assert_eq!(config.daemon.schedule_interval_secs, 60);
    }

    #[test]
    fn round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("zoekt.toml");
        let mut config = ZoektConfig::default();
        config.limits.max_evictions_per_node = 2;
        std::fs::write(&path, config.to_toml_string().unwrap()).unwrap();

        let loaded = ZoektConfig::from_file(&path).unwrap();
        assert_eq!(loaded.limits.max_evictions_per_node, 2);
    }

    #[test]
    fn lost_marking_can_be_disabled() {
        let toml_str = r#"
[limits]
mark_lost_enabled = false
"#;
        let config: ZoektConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.limits.lost_node_threshold(), None);

        let reparsed: ZoektConfig = toml::from_str(&config.to_toml_string().unwrap()).unwrap();
        assert!(!reparsed.limits.mark_lost_enabled);
        assert_eq!(reparsed.limits.lost_node_threshold(), None);
        assert_eq!(reparsed.limits.lost_node_threshold_secs, 43200);
    }

    #[test]
    fn missing_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let config = ZoektConfig::load_or_default(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.daemon.worker_concurrency, 8);
    }
}
