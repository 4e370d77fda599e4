//! Durable storage for the configured relay list.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Mutex,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Key-value collaborator the fleet uses to persist its relay URLs.
#[async_trait]
pub trait RelayListStore: Send + Sync {
    /// Previously saved URLs, empty when nothing has been saved yet.
    async fn load_relays(&self) -> Result<Vec<String>>;

    async fn save_relays(&self, urls: &[String]) -> Result<()>;
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct RelayListFile {
    relays: Vec<String>,
}

/// JSON file backed relay list (`relays.json` under the data directory).
#[derive(Debug, Clone)]
pub struct FileRelayStore {
    path: PathBuf,
}

impl FileRelayStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store located at `<data_dir>/relays.json`.
    pub fn in_dir(data_dir: &Path) -> Self {
        Self::new(data_dir.join("relays.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn read_list(path: &Path) -> Result<Vec<String>> {
    if !path.exists() {
        return Ok(vec![]);
    }
    let data = fs::read_to_string(path)?;
    let file: RelayListFile = serde_json::from_str(&data)?;
    Ok(file.relays)
}

fn write_list(path: &Path, urls: &[String]) -> Result<()> {
    let parent = path.parent().ok_or_else(|| {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "missing parent directory for relay list",
        ))
    })?;
    fs::create_dir_all(parent)?;
    let data = serde_json::to_string_pretty(&RelayListFile {
        relays: urls.to_vec(),
    })?;
    let tmp = tempfile::NamedTempFile::new_in(parent)?;
    fs::write(tmp.path(), data)?;
    tmp.persist(path).map_err(|e| Error::Io(e.error))?;
    Ok(())
}

#[async_trait]
impl RelayListStore for FileRelayStore {
    async fn load_relays(&self) -> Result<Vec<String>> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || read_list(&path)).await?
    }

    async fn save_relays(&self, urls: &[String]) -> Result<()> {
        let path = self.path.clone();
        let urls = urls.to_vec();
        tokio::task::spawn_blocking(move || write_list(&path, &urls)).await?
    }
}

/// Volatile relay list, for tests and embedders without storage.
#[derive(Debug, Default)]
pub struct MemoryRelayStore {
    relays: Mutex<Vec<String>>,
}

impl MemoryRelayStore {
    pub fn new(initial: Vec<String>) -> Self {
        Self {
            relays: Mutex::new(initial),
        }
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.relays.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl RelayListStore for MemoryRelayStore {
    async fn load_relays(&self) -> Result<Vec<String>> {
        Ok(self.snapshot())
    }

    async fn save_relays(&self, urls: &[String]) -> Result<()> {
        *self.relays.lock().unwrap_or_else(|e| e.into_inner()) = urls.to_vec();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn missing_file_loads_empty() {
        let dir = TempDir::new().unwrap();
        let store = FileRelayStore::in_dir(dir.path());
        assert!(store.load_relays().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn saves_and_reloads_in_order() {
        let dir = TempDir::new().unwrap();
        let store = FileRelayStore::in_dir(&dir.path().join("nested"));
        let urls = vec!["wss://b.example".to_string(), "wss://a.example".to_string()];
        store.save_relays(&urls).await.unwrap();
        assert!(store.path().exists());
        assert_eq!(store.load_relays().await.unwrap(), urls);

        store.save_relays(&urls[..1]).await.unwrap();
        assert_eq!(store.load_relays().await.unwrap(), vec!["wss://b.example"]);
    }

    #[tokio::test]
    async fn corrupt_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let store = FileRelayStore::in_dir(dir.path());
        fs::write(store.path(), "not json").unwrap();
        assert!(store.load_relays().await.is_err());
    }

    #[tokio::test]
    async fn memory_store_round_trip() {
        let store = MemoryRelayStore::default();
        store.save_relays(&["wss://x".into()]).await.unwrap();
        assert_eq!(store.load_relays().await.unwrap(), vec!["wss://x"]);
    }
}
