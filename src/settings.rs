//! Persisted key-value settings
//!
//! A flat JSON object of string keys to string values in the app data
//! directory. Writes go to a temp file that is renamed over the original, so a
//! crash mid-write leaves the previous document intact.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use tokio::sync::Mutex;

use crate::error::Result;

pub const LAST_SELECTED_MODEL_KEY: &str = "last_selected_model";
pub const TRANSCRIPT_KEY_KEY: &str = "transcript_key";

pub struct SettingsStore {
    path: PathBuf,
    values: Mutex<BTreeMap<String, String>>,
}

impl SettingsStore {
    /// Open the document at `path`; missing or unreadable files start empty
    pub async fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let values = match tokio::fs::read_to_string(&path).await {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!("Failed to parse settings file {}: {}, starting empty", path.display(), e);
                BTreeMap::new()
            }),
            Err(_) => {
                info!("No settings file at {}, starting empty", path.display());
                BTreeMap::new()
            }
        };

        Self {
            path,
            values: Mutex::new(values),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        self.values.lock().await.get(key).cloned()
    }

    pub async fn set(&self, key: &str, value: impl Into<String>) -> Result<()> {
        let mut values = self.values.lock().await;
        values.insert(key.to_string(), value.into());
        self.persist(&values).await
    }

    pub async fn remove(&self, key: &str) -> Result<()> {
        let mut values = self.values.lock().await;
        if values.remove(key).is_none() {
            return Ok(());
        }
        self.persist(&values).await
    }

    async fn persist(&self, values: &BTreeMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(values)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!("Settings saved to {}", self.path.display());
        Ok(())
    }

    pub async fn last_selected_model(&self) -> Option<String> {
        self.get(LAST_SELECTED_MODEL_KEY).await
    }

    pub async fn set_last_selected_model(&self, id: &str) -> Result<()> {
        self.set(LAST_SELECTED_MODEL_KEY, id).await
    }

    /// Opaque key material for transcript storage
    pub async fn key_material(&self) -> Option<Vec<u8>> {
        let encoded = self.get(TRANSCRIPT_KEY_KEY).await?;
        match hex::decode(&encoded) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!("Stored key material is not valid hex: {}", e);
                None
            }
        }
    }

    pub async fn set_key_material(&self, key: &[u8]) -> Result<()> {
        self.set(TRANSCRIPT_KEY_KEY, hex::encode(key)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_missing_file_starts_empty() {
        let dir = tempdir().unwrap();
        let store = SettingsStore::open(dir.path().join("settings.json")).await;
        assert!(store.last_selected_model().await.is_none());
        assert!(store.key_material().await.is_none());
    }

    #[tokio::test]
    async fn test_values_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let store = SettingsStore::open(&path).await;
        store.set_last_selected_model("alpha").await.unwrap();
        store.set_key_material(&[0xde, 0xad, 0xbe, 0xef]).await.unwrap();

        let reopened = SettingsStore::open(&path).await;
        assert_eq!(reopened.last_selected_model().await.as_deref(), Some("alpha"));
        assert_eq!(reopened.key_material().await.unwrap(), vec![0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(reopened.get(TRANSCRIPT_KEY_KEY).await.as_deref(), Some("deadbeef"));
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_remove_key() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let store = SettingsStore::open(&path).await;
        store.set("theme", "dark").await.unwrap();
        store.remove("theme").await.unwrap();
        store.remove("theme").await.unwrap();

        let reopened = SettingsStore::open(&path).await;
        assert!(reopened.get("theme").await.is_none());
    }

    #[tokio::test]
    async fn test_malformed_file_starts_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();

        let store = SettingsStore::open(&path).await;
        assert!(store.get(LAST_SELECTED_MODEL_KEY).await.is_none());
    }

    #[tokio::test]
    async fn test_invalid_key_material_is_ignored() {
        let dir = tempdir().unwrap();
        let store = SettingsStore::open(dir.path().join("settings.json")).await;
        store.set(TRANSCRIPT_KEY_KEY, "zz").await.unwrap();
        assert!(store.key_material().await.is_none());
    }
}
