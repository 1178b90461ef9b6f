//! Guild Configuration Persistence
//!
//! TigerStyle: One JSON snapshot per data directory, replaced atomically.
//!
//! Only administrator-set configuration survives a restart. Entity data is
//! re-fetched lazily on the next run.

use crate::entity::{GuildConfig, Snowflake};
use crate::store::EntityStore;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

// =============================================================================
// TigerStyle Constants
// =============================================================================

/// Snapshot file name inside the data directory
pub const CONFIG_FILE_NAME: &str = "guild_config.json";

/// Current snapshot format version
pub const SNAPSHOT_VERSION: u32 = 1;

// =============================================================================
// Snapshot Format
// =============================================================================

/// One guild's saved settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuildConfigRecord {
    pub guild_id: Snowflake,
    #[serde(flatten)]
    pub config: GuildConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    #[serde(default)]
    pub guilds: Vec<GuildConfigRecord>,
}

// =============================================================================
// Config Store
// =============================================================================

/// Durable storage for per-guild configuration. Clones share one write
/// lock, so saves from the periodic task and from `configure` never
/// interleave on the temp file.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl ConfigStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            path: data_dir.as_ref().join(CONFIG_FILE_NAME),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Saved configuration keyed by guild. A missing file is an empty map.
    pub fn load(&self) -> Result<HashMap<Snowflake, GuildConfig>, PersistError> {
        if !self.path.exists() {
            tracing::info!(path = %self.path.display(), "No saved guild configuration");
            return Ok(HashMap::new());
        }

        let content = fs::read_to_string(&self.path)?;
        let snapshot: ConfigSnapshot = serde_json::from_str(&content)?;

        if snapshot.version != SNAPSHOT_VERSION {
            return Err(PersistError::UnsupportedVersion {
                found: snapshot.version,
                expected: SNAPSHOT_VERSION,
            });
        }

        let configs: HashMap<_, _> = snapshot
            .guilds
            .into_iter()
            .map(|record| (record.guild_id, record.config))
            .collect();

        tracing::info!(
            "Loaded configuration for {} guilds (saved {})",
            configs.len(),
            snapshot.saved_at.to_rfc3339()
        );
        Ok(configs)
    }

    /// Write every known guild's configuration. Returns the record count.
    pub fn save(&self, store: &EntityStore) -> Result<usize, PersistError> {
        let snapshot = ConfigSnapshot {
            version: SNAPSHOT_VERSION,
            saved_at: Utc::now(),
            guilds: store
                .config_snapshot()
                .into_iter()
                .map(|(guild_id, config)| GuildConfigRecord { guild_id, config })
                .collect(),
        };
        let count = snapshot.guilds.len();
        let content = serde_json::to_string_pretty(&snapshot)?;

        let _guard = self.write_lock.lock();
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Write-then-rename so a crash mid-save leaves the old file intact.
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, content)?;
        fs::rename(&tmp_path, &self.path)?;

        tracing::debug!(path = %self.path.display(), guilds = count, "Saved guild configuration");
        Ok(count)
    }
}

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("unsupported snapshot version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{CachedGuild, RawGuild};
    use tempfile::TempDir;

    fn id(raw: u64) -> Snowflake {
        Snowflake::new(raw).unwrap()
    }

    #[test]
    fn test_missing_file_loads_empty() {
        let temp = TempDir::new().unwrap();
        let store = ConfigStore::new(temp.path());
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_save_and_reload() {
        let temp = TempDir::new().unwrap();
        let config_store = ConfigStore::new(temp.path());

        let mut saved = HashMap::new();
        saved.insert(
            id(300),
            GuildConfig {
                verify_ephemeral: false,
                ..GuildConfig::default()
            },
        );
        let entities = EntityStore::with_saved_config(saved);
        let guild = entities
            .insert_guild(CachedGuild::from_raw(
                RawGuild {
                    id: id(100),
                    name: "Lobby".to_string(),
                    system_channel_id: Some(id(200)),
                },
                GuildConfig::default(),
            ))
            .into_entry();
        guild.update_config(|config| config.verified_role_id = Some(id(7)));

        assert_eq!(config_store.save(&entities).unwrap(), 2);
        assert!(!config_store.path().with_extension("json.tmp").exists());

        let loaded = config_store.load().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[&id(100)].verified_role_id, Some(id(7)));
        assert_eq!(loaded[&id(100)].welcome_channel_id, Some(id(200)));
        assert!(!loaded[&id(300)].verify_ephemeral);
    }

    #[test]
    fn test_concurrent_saves_from_clones() {
        let temp = TempDir::new().unwrap();
        let config_store = ConfigStore::new(temp.path());
        let entities = Arc::new(EntityStore::new());
        entities.insert_guild(CachedGuild::from_raw(
            RawGuild {
                id: id(100),
                name: "Lobby".to_string(),
                system_channel_id: None,
            },
            GuildConfig::default(),
        ));

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let config_store = config_store.clone();
                let entities = Arc::clone(&entities);
                std::thread::spawn(move || {
                    (0..200)
                        .filter(|_| config_store.save(&entities).is_err())
                        .count()
                })
            })
            .collect();

        let failed: usize = workers.into_iter().map(|w| w.join().unwrap()).sum();
        assert_eq!(failed, 0);

        let loaded = config_store.load().unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(loaded.contains_key(&id(100)));
    }

    #[test]
    fn test_rejects_unknown_version() {
        let temp = TempDir::new().unwrap();
        let store = ConfigStore::new(temp.path());
        fs::write(
            store.path(),
            r#"{"version": 9, "saved_at": "2024-01-01T00:00:00Z", "guilds": []}"#,
        )
        .unwrap();

        let err = store.load().unwrap_err();
        assert!(matches!(err, PersistError::UnsupportedVersion { found: 9, .. }));
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let temp = TempDir::new().unwrap();
        let store = ConfigStore::new(temp.path());
        fs::write(store.path(), "not json").unwrap();
        assert!(matches!(store.load(), Err(PersistError::Serialization(_))));
    }
}
