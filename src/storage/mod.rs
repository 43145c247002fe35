// src/storage/mod.rs - Durable storage behind the caches
use crate::error::{Result, VigilError};
use async_trait::async_trait;
use dashmap::DashMap;
use std::path::Path;

pub mod dao;
pub mod manager;

pub use dao::{CachePersistenceDao, StoreDao};
pub use manager::{BatchPersistenceManager, PersistenceSettings};

// Base storage trait
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn write(&self, data: &[u8], key: &str) -> Result<()>;
    async fn read(&self, key: &str) -> Result<Vec<u8>>;
    async fn delete(&self, key: &str) -> Result<()>;
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
    async fn exists(&self, key: &str) -> Result<bool>;
}

/// One file per key under a base directory
pub struct LocalStorage {
    base_path: std::path::PathBuf,
}

impl LocalStorage {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        std::fs::create_dir_all(&path)?;
        Ok(Self {
            base_path: path.as_ref().to_path_buf(),
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }
}

#[async_trait]
impl StorageBackend for LocalStorage {
    async fn write(&self, data: &[u8], key: &str) -> Result<()> {
        let path = self.base_path.join(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Write then rename so readers never see a torn file
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn read(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.base_path.join(key);
        Ok(tokio::fs::read(path).await?)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.base_path.join(key);
        tokio::fs::remove_file(path).await?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut entries = Vec::new();
        let prefix_path = self.base_path.join(prefix);
        if !tokio::fs::try_exists(&prefix_path).await? {
            return Ok(entries);
        }

        let mut dir = tokio::fs::read_dir(prefix_path).await?;
        while let Some(entry) = dir.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                entries.push(name.to_string());
            }
        }
        entries.sort();
        Ok(entries)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let path = self.base_path.join(key);
        Ok(tokio::fs::try_exists(path).await?)
    }
}

/// Volatile backend used when no storage path is configured
#[derive(Default)]
pub struct MemoryStorage {
    entries: DashMap<String, Vec<u8>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageBackend for MemoryStorage {
    async fn write(&self, data: &[u8], key: &str) -> Result<()> {
        self.entries.insert(key.to_string(), data.to_vec());
        Ok(())
    }

    async fn read(&self, key: &str) -> Result<Vec<u8>> {
        self.entries
            .get(key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| VigilError::Persistence(format!("no stored entry {}", key)))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let dir = format!("{}/", prefix.trim_end_matches('/'));
        let mut names: Vec<String> = self
            .entries
            .iter()
            .filter_map(|entry| entry.key().strip_prefix(&dir).map(str::to_string))
            .collect();
        names.sort();
        Ok(names)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.entries.contains_key(key))
    }
}
