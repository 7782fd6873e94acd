//! Registry held in memory, optionally mirrored to a JSON snapshot file.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::{debug, info};
use tokio::sync::RwLock;

use super::Registry;
use crate::error::RegistryError;
use crate::types::Entry;

#[derive(Default)]
pub struct MemoryRegistry {
    entries: RwLock<BTreeMap<String, Entry>>,
    snapshot: Option<PathBuf>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a registry persisted at `path`, loading any existing snapshot.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let path = path.into();
        let entries = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let list: Vec<Entry> = serde_json::from_slice(&bytes)?;
                list.into_iter()
                    .map(|entry| (entry.address.clone(), entry))
                    .collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => return Err(io_error(&path, source)),
        };
        info!(
            "Loaded {} registry entries from {}",
            entries.len(),
            path.display()
        );
        Ok(Self {
            entries: RwLock::new(entries),
            snapshot: Some(path),
        })
    }

    /// Persists `next` and only then makes it the live map, so a failed
    /// write leaves memory and disk agreeing on the previous state.
    async fn commit(
        &self,
        entries: &mut BTreeMap<String, Entry>,
        next: BTreeMap<String, Entry>,
    ) -> Result<(), RegistryError> {
        self.persist(&next).await?;
        *entries = next;
        Ok(())
    }

    /// Rewrites the snapshot through a temporary file so a crash never leaves
    /// a truncated registry behind.
    async fn persist(&self, entries: &BTreeMap<String, Entry>) -> Result<(), RegistryError> {
        let Some(path) = &self.snapshot else {
            return Ok(());
        };
        let list: Vec<&Entry> = entries.values().collect();
        let bytes = serde_json::to_vec_pretty(&list)?;
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|source| io_error(&tmp, source))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|source| io_error(path, source))?;
        debug!("Registry snapshot written to {}", path.display());
        Ok(())
    }
}

fn io_error(path: &Path, source: std::io::Error) -> RegistryError {
    RegistryError::Io {
        path: path.display().to_string(),
        source,
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn add(&self, entry: Entry) -> Result<bool, RegistryError> {
        let mut entries = self.entries.write().await;
        if entries.contains_key(&entry.address) {
            debug!("{} already registered, not adding again", entry.address);
            return Ok(false);
        }
        let mut next = entries.clone();
        next.insert(entry.address.clone(), entry);
        self.commit(&mut *entries, next).await?;
        Ok(true)
    }

    async fn delete(&self, address: &str) -> Result<(), RegistryError> {
        let mut entries = self.entries.write().await;
        match entries.get(address) {
            Some(entry) if entry.immutable => {
                return Err(RegistryError::Immutable(address.to_string()))
            }
            Some(_) => {}
            None => return Ok(()),
        }
        let mut next = entries.clone();
        next.remove(address);
        self.commit(&mut *entries, next).await
    }

    async fn query(&self, address: &str) -> Result<bool, RegistryError> {
        Ok(self.entries.read().await.contains_key(address))
    }

    async fn query_immutable(&self, address: &str) -> Result<bool, RegistryError> {
        Ok(self
            .entries
            .read()
            .await
            .get(address)
            .is_some_and(|entry| entry.immutable))
    }

    async fn query_all(&self) -> Result<Vec<Entry>, RegistryError> {
        Ok(self.entries.read().await.values().cloned().collect())
    }

    async fn query_distinct_domain_names(&self) -> Result<Vec<String>, RegistryError> {
        let entries = self.entries.read().await;
        let names: BTreeSet<String> = entries
            .values()
            .filter(|entry| !entry.immutable)
            .filter_map(|entry| entry.origin.domain().map(str::to_string))
            .collect();
        Ok(names.into_iter().collect())
    }
}
