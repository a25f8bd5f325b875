//! Capability gates injected into workers.

use crate::config::GatesConfig;

/// Host-application switches consulted by the scheduler and workers.
pub trait Gates: Send + Sync {
    fn licensed_and_indexing_enabled(&self) -> bool;
    fn indexing_paused(&self) -> bool;
    fn saas(&self) -> bool;
    fn auto_index_root_namespace(&self) -> bool;
}

/// Gates fixed at construction time, usually from `[gates]` in zoekt.toml.
#[derive(Debug, Clone, Default)]
pub struct StaticGates {
    config: GatesConfig,
}

impl StaticGates {
    pub fn new(config: GatesConfig) -> Self {
        Self { config }
    }

    pub fn saas() -> Self {
        Self::new(GatesConfig {
            saas: true,
            ..GatesConfig::default()
        })
    }

    pub fn paused() -> Self {
        Self::new(GatesConfig {
            indexing_paused: true,
            ..GatesConfig::default()
        })
    }

    pub fn disabled() -> Self {
        Self::new(GatesConfig {
            licensed_and_indexing_enabled: false,
            ..GatesConfig::default()
        })
    }
}

impl Gates for StaticGates {
    fn licensed_and_indexing_enabled(&self) -> bool {
        self.config.licensed_and_indexing_enabled
    }

    fn indexing_paused(&self) -> bool {
        self.config.indexing_paused
    }

    fn saas(&self) -> bool {
        self.config.saas
    }

    fn auto_index_root_namespace(&self) -> bool {
        self.config.auto_index_root_namespace
    }
}
