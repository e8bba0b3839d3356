//! Persisted client-side state (spec.md §6.5): user preferences that outlive
//! a single run (theme, window geometry, the `adb` path override) and the
//! known-device registry, both resolved through `dirs` the way the teacher
//! resolves its own on-disk config path, and both layered the same
//! `#[serde(default = "...")]`-per-field way as `mirror_wire::config`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ClientError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControllerSettings {
    #[serde(default = "default_adb_path")]
    pub adb_path: String,
    #[serde(default)]
    pub auto_connect: bool,
    #[serde(default = "default_theme")]
    pub theme: String,
    #[serde(default = "default_window_size")]
    pub window_size: (u32, u32),
    #[serde(default)]
    pub fullscreen: bool,
    #[serde(default)]
    pub window_position: Option<(i32, i32)>,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            adb_path: default_adb_path(),
            auto_connect: false,
            theme: default_theme(),
            window_size: default_window_size(),
            fullscreen: false,
            window_position: None,
        }
    }
}

fn default_adb_path() -> String {
    "adb".to_string()
}
fn default_theme() -> String {
    "system".to_string()
}
fn default_window_size() -> (u32, u32) {
    (1280, 800)
}

impl ControllerSettings {
    /// `<config_dir>/mirrorctl/settings.toml`, matching the directory the
    /// teacher's own config layer would resolve `dirs::config_dir()` to.
    pub fn default_path() -> Result<PathBuf, ClientError> {
        let base = dirs::config_dir().ok_or_else(|| ClientError::InvalidParams("could not resolve a config directory".to_string()))?;
        Ok(base.join("mirrorctl").join("settings.toml"))
    }

    pub fn load(path: &Path) -> Result<Self, ClientError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path).map_err(|e| ClientError::InvalidParams(format!("failed to read settings: {e}")))?;
        toml::from_str(&contents).map_err(|e| ClientError::InvalidParams(format!("failed to parse settings: {e}")))
    }

    pub fn save(&self, path: &Path) -> Result<(), ClientError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ClientError::InvalidParams(format!("failed to create settings directory: {e}")))?;
        }
        let contents = toml::to_string_pretty(self).map_err(|e| ClientError::InvalidParams(format!("failed to serialize settings: {e}")))?;
        std::fs::write(path, contents).map_err(|e| ClientError::InvalidParams(format!("failed to write settings: {e}")))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RegisteredDeviceStatus {
    Unknown,
    Online,
    Offline,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceRegistryEntry {
    pub id: String,
    pub name: String,
    pub model: String,
    pub manufacturer: String,
    pub status: RegisteredDeviceStatus,
    pub connected: bool,
    pub ip_address: Option<String>,
    pub port: Option<u16>,
}

/// The set of devices the controller has ever seen, persisted as a JSON
/// array keyed by device id so re-launching the controller can show
/// previously paired devices before discovery or a connection attempt
/// refreshes their live status.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    entries: HashMap<String, DeviceRegistryEntry>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `<data_dir>/mirrorctl/devices.json`.
    pub fn default_path() -> Result<PathBuf, ClientError> {
        let base = dirs::data_dir().ok_or_else(|| ClientError::InvalidParams("could not resolve a data directory".to_string()))?;
        Ok(base.join("mirrorctl").join("devices.json"))
    }

    pub fn load(path: &Path) -> Result<Self, ClientError> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let contents = std::fs::read_to_string(path).map_err(|e| ClientError::InvalidParams(format!("failed to read device registry: {e}")))?;
        let list: Vec<DeviceRegistryEntry> =
            serde_json::from_str(&contents).map_err(|e| ClientError::InvalidParams(format!("failed to parse device registry: {e}")))?;
        Ok(Self { entries: list.into_iter().map(|e| (e.id.clone(), e)).collect() })
    }

    pub fn save(&self, path: &Path) -> Result<(), ClientError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ClientError::InvalidParams(format!("failed to create device registry directory: {e}")))?;
        }
        let mut list: Vec<&DeviceRegistryEntry> = self.entries.values().collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        let contents = serde_json::to_string_pretty(&list).map_err(|e| ClientError::InvalidParams(format!("failed to serialize device registry: {e}")))?;
        std::fs::write(path, contents).map_err(|e| ClientError::InvalidParams(format!("failed to write device registry: {e}")))
    }

    pub fn upsert(&mut self, entry: DeviceRegistryEntry) {
        self.entries.insert(entry.id.clone(), entry);
    }

    pub fn get(&self, id: &str) -> Option<&DeviceRegistryEntry> {
        self.entries.get(id)
    }

    pub fn remove(&mut self, id: &str) -> Option<DeviceRegistryEntry> {
        self.entries.remove(id)
    }

    pub fn all(&self) -> Vec<&DeviceRegistryEntry> {
        let mut list: Vec<&DeviceRegistryEntry> = self.entries.values().collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entry(id: &str) -> DeviceRegistryEntry {
        DeviceRegistryEntry {
            id: id.to_string(),
            name: "Pixel".to_string(),
            model: "Pixel 8".to_string(),
            manufacturer: "Google".to_string(),
            status: RegisteredDeviceStatus::Unknown,
            connected: false,
            ip_address: None,
            port: None,
        }
    }

    #[test]
    fn settings_round_trip_through_toml() {
        let tmp = std::env::temp_dir().join(format!("mirrorctl-settings-test-{}.toml", uuid::Uuid::new_v4()));
        let mut settings = ControllerSettings::default();
        settings.theme = "dark".to_string();
        settings.window_size = (1920, 1080);
        settings.save(&tmp).unwrap();
        let loaded = ControllerSettings::load(&tmp).unwrap();
        assert_eq!(loaded, settings);
        std::fs::remove_file(&tmp).unwrap();
    }

    #[test]
    fn settings_load_missing_file_returns_defaults() {
        let missing = std::env::temp_dir().join(format!("mirrorctl-settings-missing-{}.toml", uuid::Uuid::new_v4()));
        let loaded = ControllerSettings::load(&missing).unwrap();
        assert_eq!(loaded, ControllerSettings::default());
    }

    #[test]
    fn device_registry_round_trips_and_sorts_by_id() {
        let tmp = std::env::temp_dir().join(format!("mirrorctl-devices-test-{}.json", uuid::Uuid::new_v4()));
        let mut registry = DeviceRegistry::new();
        registry.upsert(sample_entry("zzz"));
        registry.upsert(sample_entry("aaa"));
        registry.save(&tmp).unwrap();

        let loaded = DeviceRegistry::load(&tmp).unwrap();
        let ids: Vec<&str> = loaded.all().iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["aaa", "zzz"]);
        std::fs::remove_file(&tmp).unwrap();
    }

    #[test]
    fn device_registry_remove_is_reflected_in_all() {
        let mut registry = DeviceRegistry::new();
        registry.upsert(sample_entry("dev1"));
        assert!(registry.get("dev1").is_some());
        registry.remove("dev1");
        assert!(registry.all().is_empty());
    }
}
