//! Revisioned metadata service interface
//!
//! A generic mapping from string key to opaque bytes with optimistic
//! concurrency. Catalogs group per-entity keys so a whole family (all
//! checkpoint records of one replication, all replication specs) can be
//! listed or dropped together.

use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

/// Opaque revision token for optimistic concurrency
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Revision(pub u64);

/// One stored entry with its revision
#[derive(Debug, Clone)]
pub struct MetadataEntry {
    /// Entry key
    pub key: String,
    /// Opaque value bytes
    pub value: Vec<u8>,
    /// Revision at read time
    pub rev: Revision,
}

/// Revisioned key → bytes store
#[async_trait]
pub trait MetadataService: Send + Sync {
    /// Read a value and its revision; `NotFound` when absent
    async fn get(&self, key: &str) -> Result<(Vec<u8>, Revision)>;

    /// Create a new entry; `Conflict` when the key already exists
    async fn add(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Replace an entry; a stale revision fails with `Conflict`
    async fn set(&self, key: &str, value: Vec<u8>, rev: Option<Revision>) -> Result<()>;

    /// Delete an entry; a stale revision fails with `Conflict`
    async fn delete(&self, key: &str, rev: Option<Revision>) -> Result<()>;

    /// Create a new entry and register it under a catalog
    async fn add_with_catalog(&self, catalog: &str, key: &str, value: Vec<u8>) -> Result<()>;

    /// Delete an entry and deregister it from a catalog
    async fn delete_with_catalog(
        &self,
        catalog: &str,
        key: &str,
        rev: Option<Revision>,
    ) -> Result<()>;

    /// All entries registered under a catalog
    async fn get_all_from_catalog(&self, catalog: &str) -> Result<Vec<MetadataEntry>>;

    /// All keys registered under a catalog
    async fn get_all_keys_from_catalog(&self, catalog: &str) -> Result<Vec<String>>;
}

#[derive(Default)]
struct MemState {
    entries: HashMap<String, (Vec<u8>, u64)>,
    catalogs: HashMap<String, HashSet<String>>,
    next_rev: u64,
}

/// In-memory metadata service
///
/// Keeps the same revision semantics as a durable backend: every write bumps
/// a store-wide revision counter, and `set`/`delete` with a stale revision
/// fail with `Conflict`.
#[derive(Default)]
pub struct MemMetadataService {
    state: Mutex<MemState>,
}

impl MemMetadataService {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

impl MemState {
    fn check_rev(&self, key: &str, rev: Option<Revision>) -> Result<()> {
        let current = self
            .entries
            .get(key)
            .ok_or_else(|| Error::NotFound(key.to_string()))?
            .1;
        match rev {
            Some(Revision(r)) if r != current => Err(Error::Conflict(format!(
                "stale revision for {}: have {}, stored {}",
                key, r, current
            ))),
            _ => Ok(()),
        }
    }

    fn bump(&mut self) -> u64 {
        self.next_rev += 1;
        self.next_rev
    }
}

#[async_trait]
impl MetadataService for MemMetadataService {
    async fn get(&self, key: &str) -> Result<(Vec<u8>, Revision)> {
        let state = self.state.lock();
        state
            .entries
            .get(key)
            .map(|(value, rev)| (value.clone(), Revision(*rev)))
            .ok_or_else(|| Error::NotFound(key.to_string()))
    }

    async fn add(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let mut state = self.state.lock();
        if state.entries.contains_key(key) {
            return Err(Error::Conflict(format!("{} already exists", key)));
        }
        let rev = state.bump();
        state.entries.insert(key.to_string(), (value, rev));
        Ok(())
    }

    async fn set(&self, key: &str, value: Vec<u8>, rev: Option<Revision>) -> Result<()> {
        let mut state = self.state.lock();
        state.check_rev(key, rev)?;
        let next = state.bump();
        state.entries.insert(key.to_string(), (value, next));
        Ok(())
    }

    async fn delete(&self, key: &str, rev: Option<Revision>) -> Result<()> {
        let mut state = self.state.lock();
        state.check_rev(key, rev)?;
        state.entries.remove(key);
        Ok(())
    }

    async fn add_with_catalog(&self, catalog: &str, key: &str, value: Vec<u8>) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.entries.contains_key(key) {
                return Err(Error::Conflict(format!("{} already exists", key)));
            }
            let rev = state.bump();
            state.entries.insert(key.to_string(), (value, rev));
            state
                .catalogs
                .entry(catalog.to_string())
                .or_default()
                .insert(key.to_string());
        }
        Ok(())
    }

    async fn delete_with_catalog(
        &self,
        catalog: &str,
        key: &str,
        rev: Option<Revision>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.check_rev(key, rev)?;
        state.entries.remove(key);
        if let Some(members) = state.catalogs.get_mut(catalog) {
            members.remove(key);
        }
        Ok(())
    }

    async fn get_all_from_catalog(&self, catalog: &str) -> Result<Vec<MetadataEntry>> {
        let state = self.state.lock();
        let mut entries = Vec::new();
        if let Some(members) = state.catalogs.get(catalog) {
            for key in members {
                if let Some((value, rev)) = state.entries.get(key) {
                    entries.push(MetadataEntry {
                        key: key.clone(),
                        value: value.clone(),
                        rev: Revision(*rev),
                    });
                }
            }
        }
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }

    async fn get_all_keys_from_catalog(&self, catalog: &str) -> Result<Vec<String>> {
        let state = self.state.lock();
        let mut keys: Vec<String> = state
            .catalogs
            .get(catalog)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let svc = MemMetadataService::new();
        assert!(matches!(svc.get("nope").await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_add_get_set_cycle() {
        let svc = MemMetadataService::new();
        svc.add("k", b"v1".to_vec()).await.unwrap();
        let (value, rev) = svc.get("k").await.unwrap();
        assert_eq!(value, b"v1");

        svc.set("k", b"v2".to_vec(), Some(rev)).await.unwrap();
        let (value, rev2) = svc.get("k").await.unwrap();
        assert_eq!(value, b"v2");
        assert_ne!(rev, rev2);
    }

    #[tokio::test]
    async fn test_stale_revision_conflicts() {
        let svc = MemMetadataService::new();
        svc.add("k", b"v1".to_vec()).await.unwrap();
        let (_, rev) = svc.get("k").await.unwrap();
        svc.set("k", b"v2".to_vec(), Some(rev)).await.unwrap();

        let result = svc.set("k", b"v3".to_vec(), Some(rev)).await;
        assert!(matches!(result, Err(Error::Conflict(_))));
    }

    #[tokio::test]
    async fn test_add_existing_conflicts() {
        let svc = MemMetadataService::new();
        svc.add("k", b"v".to_vec()).await.unwrap();
        assert!(matches!(
            svc.add("k", b"v".to_vec()).await,
            Err(Error::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_catalog_listing() {
        let svc = MemMetadataService::new();
        svc.add_with_catalog("specs", "specs/a", b"1".to_vec())
            .await
            .unwrap();
        svc.add_with_catalog("specs", "specs/b", b"2".to_vec())
            .await
            .unwrap();
        svc.add("unrelated", b"3".to_vec()).await.unwrap();

        let entries = svc.get_all_from_catalog("specs").await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].key, "specs/a");

        svc.delete_with_catalog("specs", "specs/a", None)
            .await
            .unwrap();
        let keys = svc.get_all_keys_from_catalog("specs").await.unwrap();
        assert_eq!(keys, vec!["specs/b".to_string()]);
    }
}
