use crate::metadata::{self, MetadataStore};
use crate::transport::ChunkTransport;
use std::path::Path;
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{error, info, instrument};
use utilities::result::Result;

/// Rebuilds a file from its recorded placement: one replica per chunk id,
/// ascending order, byte for byte.
pub struct FileReconstructor {
    metadata: Arc<dyn MetadataStore>,
    transport: Arc<dyn ChunkTransport>,
}

impl FileReconstructor {
    pub fn new(metadata: Arc<dyn MetadataStore>, transport: Arc<dyn ChunkTransport>) -> Self {
        Self {
            metadata,
            transport,
        }
    }

    pub async fn file_exists(&self, filename: &str) -> Result<bool> {
        Ok(!metadata::load_placement(self.metadata.as_ref(), filename)
            .await?
            .is_empty())
    }

    /// A chunk id with no readable replica is fatal for the download and
    /// the partial output is removed.
    #[instrument(name = "reconstruct_file", skip(self, output_path))]
    pub async fn reconstruct(&self, filename: &str, output_path: &Path) -> Result<()> {
        let placement = metadata::load_placement(self.metadata.as_ref(), filename).await?;
        if placement.is_empty() {
            return Err(format!("no chunks found for file: {filename}").into());
        }
        // ids must run 0..n with no holes or the concatenation is garbage
        for (expected, chunk_id) in placement.keys().enumerate() {
            if *chunk_id != expected as u64 {
                return Err(format!(
                    "placement for {filename} is missing chunk {expected}, refusing to reconstruct"
                )
                .into());
            }
        }

        let mut output = fs::File::create(output_path)
            .await
            .map_err(|e| format!("failed to create output file {}: {e}", output_path.display()))?;
        for (chunk_id, location) in &placement {
            match self
                .transport
                .fetch(&location.server, filename, *chunk_id)
                .await
            {
                Ok(data) => {
                    output.write_all(&data).await.map_err(|e| {
                        format!("failed to write chunk {chunk_id} to output: {e}")
                    })?;
                }
                Err(e) => {
                    error!(chunk_id, server = %location.server, error = %e, "chunk replica unreadable, aborting download");
                    drop(output);
                    let _ = fs::remove_file(output_path).await;
                    return Err(
                        format!("failed to read chunk {chunk_id} of {filename}: {e}").into()
                    );
                }
            }
        }
        output.flush().await?;
        info!(filename, chunks = placement.len(), "file reconstructed");
        Ok(())
    }
}
