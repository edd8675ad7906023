use super::MetadataStore;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use utilities::result::Result;

struct Entry {
    fields: HashMap<String, String>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// In process stand-in for the real key-value collaborator. TTLs are
/// honored lazily on access.
#[derive(Default)]
pub struct MemoryMetadataStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn hset_bulk(&self, key: &str, fields: &[(String, String)]) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        if entries.get(key).is_some_and(Entry::expired) {
            entries.remove(key);
        }
        let entry = entries.entry(key.to_owned()).or_insert_with(|| Entry {
            fields: HashMap::new(),
            expires_at: None,
        });
        for (field, value) in fields {
            entry.fields.insert(field.clone(), value.clone());
        }
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let entries = self.entries.lock().unwrap();
        Ok(entries
            .get(key)
            .filter(|e| !e.expired())
            .and_then(|e| e.fields.get(field).cloned()))
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let entries = self.entries.lock().unwrap();
        Ok(entries
            .get(key)
            .filter(|e| !e.expired())
            .map(|e| e.fields.clone())
            .unwrap_or_default())
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get_mut(key) {
            Some(entry) if !entry.expired() => Ok(entry.fields.remove(field).is_some()),
            _ => Ok(false),
        }
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let mut entries = self.entries.lock().unwrap();
        let existed = entries
            .remove(key)
            .map(|e| !e.expired())
            .unwrap_or(false);
        Ok(existed)
    }

    async fn expire(&self, key: &str, seconds: u64) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(key) {
            entry.expires_at = Some(Instant::now() + Duration::from_secs(seconds));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(field: &str, value: &str) -> (String, String) {
        (field.to_owned(), value.to_owned())
    }

    #[tokio::test]
    async fn field_operations_behave_like_a_hash() {
        let store = MemoryMetadataStore::new();
        store
            .hset_bulk("file:a", &[pair("chunk:0", "s1|p1"), pair("chunk:1", "s2|p2")])
            .await
            .unwrap();
        assert_eq!(
            store.hget("file:a", "chunk:0").await.unwrap(),
            Some("s1|p1".to_owned())
        );
        assert_eq!(store.hget("file:a", "chunk:9").await.unwrap(), None);
        assert_eq!(store.hgetall("file:a").await.unwrap().len(), 2);
        assert!(store.hdel("file:a", "chunk:1").await.unwrap());
        assert!(!store.hdel("file:a", "chunk:1").await.unwrap());
        assert!(store.del("file:a").await.unwrap());
        assert!(store.hgetall("file:a").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn expired_keys_vanish() {
        let store = MemoryMetadataStore::new();
        store
            .hset_bulk("file:a", &[pair("chunk:0", "s1|p1")])
            .await
            .unwrap();
        store.expire("file:a", 0).await.unwrap();
        assert_eq!(store.hget("file:a", "chunk:0").await.unwrap(), None);
        assert!(store.hgetall("file:a").await.unwrap().is_empty());
    }
}
