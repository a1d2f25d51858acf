use thiserror::Error;

use crate::config::KnobConfig;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("settings backend failed: {0}")]
    Backend(String),
    #[error("settings document is malformed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Persisted key-value settings. `save` writes and commits in one step.
pub trait SettingsStore: Send {
    fn load(&self) -> Result<KnobConfig, StoreError>;
    fn save(&mut self, config: &KnobConfig) -> Result<(), StoreError>;
}

/// Keeps the serialized document in memory.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    document: Option<String>,
    commits: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: &KnobConfig) -> Result<Self, StoreError> {
        Ok(Self {
            document: Some(serde_json::to_string(config)?),
            commits: 0,
        })
    }

    pub fn commits(&self) -> usize {
        self.commits
    }
}

impl SettingsStore for MemoryStore {
    fn load(&self) -> Result<KnobConfig, StoreError> {
        match &self.document {
            Some(raw) => Ok(serde_json::from_str(raw)?),
            None => Ok(KnobConfig::default()),
        }
    }

    fn save(&mut self, config: &KnobConfig) -> Result<(), StoreError> {
        self.document = Some(serde_json::to_string(config)?);
        self.commits += 1;
        Ok(())
    }
}

/// Loads and sanitizes the stored config, falling back to defaults when the
/// document cannot be read. Repairs are written back.
pub fn load_or_default(store: &mut dyn SettingsStore) -> KnobConfig {
    let mut config = store.load().unwrap_or_else(|err| {
        log::warn!("failed to load settings: {err:#}");
        KnobConfig::default()
    });

    if config.sanitize() {
        log::warn!("stored settings were repaired during load");
        if let Err(err) = store.save(&config) {
            log::warn!("failed to persist repaired settings: {err:#}");
        }
    }

    config
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn empty_store_loads_defaults() {
        let store = MemoryStore::new();
        assert_eq!(store.load().unwrap(), KnobConfig::default());
    }

    #[test]
    fn repaired_config_is_committed() {
        let mut config = KnobConfig::default();
        config.power.power_save_timeout_ms = config.power.deep_sleep_timeout_ms;
        let mut store = MemoryStore::with_config(&config).unwrap();

        let loaded = load_or_default(&mut store);

        assert_eq!(loaded.power, KnobConfig::default().power);
        assert_eq!(store.commits(), 1);
        assert_eq!(store.load().unwrap(), loaded);
    }
}
