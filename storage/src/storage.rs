use async_trait::async_trait;
use std::path::PathBuf;
use utilities::result::Result;

/// Backend local name of one chunk replica, derived from who stores it and
/// which slice of which file it is. Keeping this a pure function is what lets
/// a replica be found again without consulting metadata.
pub fn chunk_key(server: &str, filename: &str, chunk_id: u64) -> String {
    format!("{server}_{filename}_chunk_{chunk_id}")
}

#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Persists one chunk under its key. The write lands completely or not at
    /// all, a partially written replica must never become visible.
    async fn write(&self, chunk_key: &str, data: &[u8]) -> Result<PathBuf>;
    async fn read(&self, chunk_key: &str) -> Result<Vec<u8>>;
    async fn delete(&self, chunk_key: &str) -> Result<bool>;
    async fn exists(&self, chunk_key: &str) -> bool;
    async fn available_chunks(&self) -> Result<Vec<String>>;
}

#[cfg(test)]
pub mod tests {
    use super::*;

    pub async fn storage_test(store: impl ChunkStore) -> Result<()> {
        let key = chunk_key("10.0.0.1:8080", "test_chunk.bin", 0);
        let original_data = b"hello world";

        let path = store.write(&key, original_data).await?;
        assert!(path.ends_with(&key));
        assert!(store.exists(&key).await);

        let available = store.available_chunks().await?;
        assert_eq!(available, vec![key.clone()]);

        let read_back = store.read(&key).await?;
        assert_eq!(read_back, original_data);

        assert!(store.delete(&key).await?);
        assert!(!store.exists(&key).await);
        let available = store.available_chunks().await?;
        assert!(available.is_empty());
        // deleting again reports that nothing was there
        assert!(!store.delete(&key).await?);
        Ok(())
    }

    #[test]
    fn chunk_keys_are_deterministic() {
        assert_eq!(
            chunk_key("127.0.0.1:8080", "notes.txt", 3),
            "127.0.0.1:8080_notes.txt_chunk_3"
        );
        assert_eq!(
            chunk_key("127.0.0.1:8080", "notes.txt", 3),
            chunk_key("127.0.0.1:8080", "notes.txt", 3)
        );
    }
}
