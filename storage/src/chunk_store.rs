use crate::storage::ChunkStore;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{error, info, instrument};
use utilities::result::Result;

/// File backed chunk store. Writes land in a staging directory first and are
/// renamed into the root, so readers only ever see complete chunks.
#[derive(Clone)]
pub struct FileChunkStore {
    root: PathBuf,
}

impl FileChunkStore {
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("staged"))
            .await
            .map_err(|e| format!("error while creating chunk root {}: {e}", root.display()))?;
        info!(root = %root.display(), "chunk store ready");
        Ok(Self { root })
    }

    fn committed_path(&self, chunk_key: &str) -> PathBuf {
        self.root.join(chunk_key)
    }

    fn staged_path(&self, chunk_key: &str) -> PathBuf {
        self.root.join("staged").join(chunk_key)
    }

    fn check_key(chunk_key: &str) -> Result<()> {
        if chunk_key.is_empty() || chunk_key.contains('/') {
            return Err(format!("invalid chunk key: {chunk_key:?}").into());
        }
        Ok(())
    }
}

#[async_trait]
impl ChunkStore for FileChunkStore {
    #[instrument(name = "chunk_store_write", skip(self, data), fields(bytes = data.len()))]
    async fn write(&self, chunk_key: &str, data: &[u8]) -> Result<PathBuf> {
        Self::check_key(chunk_key)?;
        let staged = self.staged_path(chunk_key);
        let committed = self.committed_path(chunk_key);
        if let Err(e) = fs::write(&staged, data).await {
            // leave nothing half written behind
            let _ = fs::remove_file(&staged).await;
            return Err(format!("error while staging chunk {chunk_key}: {e}").into());
        }
        if let Err(e) = fs::rename(&staged, &committed).await {
            let _ = fs::remove_file(&staged).await;
            return Err(format!("error while committing chunk {chunk_key}: {e}").into());
        }
        Ok(committed)
    }

    #[instrument(name = "chunk_store_read", skip(self))]
    async fn read(&self, chunk_key: &str) -> Result<Vec<u8>> {
        Self::check_key(chunk_key)?;
        fs::read(self.committed_path(chunk_key))
            .await
            .map_err(|e| format!("error while reading chunk {chunk_key}: {e}").into())
    }

    async fn delete(&self, chunk_key: &str) -> Result<bool> {
        Self::check_key(chunk_key)?;
        let path = self.committed_path(chunk_key);
        let exists = match fs::try_exists(&path).await {
            Ok(v) => v,
            Err(e) => {
                error!("error while checking if chunk exist e : {}", e);
                false
            }
        };
        if exists {
            fs::remove_file(&path)
                .await
                .map_err(|e| format!("error while deleting chunk {chunk_key}: {e}"))?;
        }
        Ok(exists)
    }

    async fn exists(&self, chunk_key: &str) -> bool {
        fs::try_exists(self.committed_path(chunk_key))
            .await
            .unwrap_or(false)
    }

    #[instrument(name = "chunk_store_available", skip(self))]
    async fn available_chunks(&self) -> Result<Vec<String>> {
        let mut dir_entries = fs::read_dir(&self.root).await?;
        let mut chunk_keys = vec![];
        while let Some(entry) = dir_entries.next_entry().await? {
            let is_dir = entry
                .file_type()
                .await
                .map_err(|e| format!("error while checking entry type: {e}"))?
                .is_dir();
            if !is_dir {
                chunk_keys.push(
                    entry
                        .file_name()
                        .into_string()
                        .map_err(|_| "invalid chunk file name")?,
                );
            }
        }
        Ok(chunk_keys)
    }
}
