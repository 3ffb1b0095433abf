// SPDX-License-Identifier: AGPL-3.0
// LAN Shuttle Core - Settings persistence
//
// Settings are stored in a local JSON file.
// No cloud sync, no tracking, just simple local persistence.

use crate::types::{AppSettings, ShuttleError};
use parking_lot::RwLock;
use std::fs;
use std::path::{Path, PathBuf};

/// Platform config directory for LAN Shuttle files, created on demand
pub(crate) fn config_file(name: &str) -> Result<PathBuf, ShuttleError> {
    let config_dir = directories::ProjectDirs::from("com", "lanshuttle", "lan-shuttle")
        .ok_or_else(|| ShuttleError::FileIo("Could not determine config directory".to_string()))?
        .config_dir()
        .to_path_buf();

    fs::create_dir_all(&config_dir)
        .map_err(|e| ShuttleError::FileIo(format!("Failed to create config dir: {}", e)))?;

    Ok(config_dir.join(name))
}

/// In-memory cache of settings, persisted to disk on changes
pub struct SettingsStore {
    settings: RwLock<AppSettings>,
    file_path: PathBuf,
}

impl SettingsStore {
    /// Load from the platform config directory
    pub fn new() -> Result<Self, ShuttleError> {
        Self::with_path(config_file("settings.json")?)
    }

    /// Load from `file_path`, writing defaults there if it does not exist yet
    pub fn with_path(file_path: impl Into<PathBuf>) -> Result<Self, ShuttleError> {
        let file_path = file_path.into();
        tracing::info!("Settings file path: {:?}", file_path);

        let settings = if file_path.exists() {
            tracing::info!("Loading settings from disk");
            let content = fs::read_to_string(&file_path)
                .map_err(|e| ShuttleError::FileIo(format!("Failed to read settings: {}", e)))?;

            serde_json::from_str(&content).unwrap_or_else(|e| {
                tracing::warn!("Failed to parse settings, using defaults: {}", e);
                AppSettings::default()
            })
        } else {
            tracing::info!("No settings file found, using defaults");
            AppSettings::default()
        };

        let store = Self {
            settings: RwLock::new(settings),
            file_path,
        };

        if !store.file_path.exists() {
            tracing::info!("Creating initial settings file");
            store.persist()?;
        }

        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }

    fn persist(&self) -> Result<(), ShuttleError> {
        let content = serde_json::to_string_pretty(&*self.settings.read()).map_err(|e| {
            ShuttleError::Serialization(format!("Failed to serialize settings: {}", e))
        })?;

        if let Some(parent) = self.file_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| ShuttleError::FileIo(format!("Failed to create config dir: {}", e)))?;
        }
        fs::write(&self.file_path, content)
            .map_err(|e| ShuttleError::FileIo(format!("Failed to write settings: {}", e)))?;

        Ok(())
    }

    /// Get current settings
    pub fn get(&self) -> AppSettings {
        self.settings.read().clone()
    }

    /// Replace settings and persist them. Settings that would produce an
    /// unusable engine configuration are refused.
    pub fn update(&self, new_settings: AppSettings) -> Result<(), ShuttleError> {
        new_settings.to_engine_config().validate()?;
        tracing::info!(
            "Updating settings, port {} discovery {}",
            new_settings.port,
            new_settings.discovery_port
        );
        *self.settings.write() = new_settings;

        let result = self.persist();
        if result.is_ok() {
            tracing::info!("Settings persisted successfully");
        } else {
            tracing::error!("Failed to persist settings: {:?}", result);
        }
        result
    }
}
