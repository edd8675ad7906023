use crate::health_tracker::HealthTracker;
use crate::metadata::{self, MetadataStore};
use crate::registry::FileRegistry;
use crate::transport::ChunkTransport;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use std::sync::{Arc, Mutex};
use tracing::{error, info, instrument, warn};
use utilities::result::Result;

/// Brings chunks that lived on a failed server back up to strength.
///
/// The metadata records one replica per chunk, so a chunk can lose copies
/// on the failed server while its record points elsewhere. Every chunk of
/// every registered file is therefore probed: surviving copies are found at
/// the deterministic backend path on each healthy server, topped up onto
/// servers that do not hold one yet, and the record is repointed whenever
/// it references a server that no longer serves the chunk.
pub struct ReReplicator {
    metadata: Arc<dyn MetadataStore>,
    transport: Arc<dyn ChunkTransport>,
    tracker: Arc<HealthTracker>,
    registry: Arc<FileRegistry>,
    replication: usize,
    rng: Mutex<StdRng>,
}

impl ReReplicator {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        transport: Arc<dyn ChunkTransport>,
        tracker: Arc<HealthTracker>,
        registry: Arc<FileRegistry>,
        replication: usize,
        rng: StdRng,
    ) -> Self {
        Self {
            metadata,
            transport,
            tracker,
            registry,
            replication,
            rng: Mutex::new(rng),
        }
    }

    #[instrument(name = "handle_server_failure", skip(self))]
    pub async fn handle_server_failure(&self, failed_server_id: u64) -> Result<()> {
        let failed_ip = self
            .tracker
            .server_ip(failed_server_id)
            .ok_or_else(|| format!("unknown server id {failed_server_id}"))?;
        let healthy: Vec<String> = self
            .tracker
            .healthy_server_ips()
            .into_iter()
            .filter(|(id, _)| *id != failed_server_id)
            .map(|(_, ip)| ip)
            .collect();
        if healthy.is_empty() {
            warn!(failed_server_id, "no healthy servers left, cannot re-replicate");
            return Ok(());
        }
        info!(failed_server_id, %failed_ip, "re-replicating chunks off failed server");

        let mut restored = 0usize;
        for filename in self.registry.snapshot() {
            let placement = metadata::load_placement(self.metadata.as_ref(), &filename).await?;
            for (chunk_id, location) in placement {
                match self
                    .restore_chunk(&filename, chunk_id, &location.server, &healthy)
                    .await
                {
                    Ok(()) => restored += 1,
                    Err(e) => {
                        error!(%filename, chunk_id, error = %e, "failed to restore chunk");
                    }
                }
            }
        }
        info!(failed_server_id, restored, "re-replication pass finished");
        Ok(())
    }

    /// Copies one chunk back to full strength and repoints its metadata if
    /// the recorded replica is gone.
    async fn restore_chunk(
        &self,
        filename: &str,
        chunk_id: u64,
        recorded_server: &str,
        healthy: &[String],
    ) -> Result<()> {
        // probe for survivors; replica paths derive from (server, file, id)
        let mut holders = Vec::new();
        let mut spares = Vec::new();
        let mut data = None;
        for server in healthy {
            match self.transport.fetch(server, filename, chunk_id).await {
                Ok(bytes) => {
                    if data.is_none() {
                        data = Some(bytes);
                    }
                    holders.push(server.clone());
                }
                Err(_) => spares.push(server.clone()),
            }
        }
        let Some(data) = data else {
            return Err(format!(
                "chunk {chunk_id} of {filename} has no surviving replica on any healthy server"
            )
            .into());
        };

        let want = self.replication.min(healthy.len());
        {
            let mut rng = self.rng.lock().unwrap();
            spares.shuffle(&mut *rng);
        }
        for spare in spares {
            if holders.len() >= want {
                break;
            }
            match self
                .transport
                .store(&spare, filename, chunk_id, &data)
                .await
            {
                Ok(_) => holders.push(spare),
                Err(e) => {
                    warn!(%filename, chunk_id, server = %spare, error = %e, "replacement write failed");
                }
            }
        }

        // records pointing at a holder can stand, anything else moves to a
        // healthy holder; path derivation gives the backend path without
        // another round trip
        if holders.iter().any(|h| h == recorded_server) {
            return Ok(());
        }
        let new_home = holders
            .first()
            .ok_or_else(|| format!("no writable replacement for chunk {chunk_id} of {filename}"))?;
        let path = storage::storage::chunk_key(new_home, filename, chunk_id);
        let field = metadata::chunk_field(chunk_id);
        let value = metadata::encode_loc(new_home, &path)?;
        self.metadata
            .hset_bulk(&metadata::file_key(filename), &[(field, value)])
            .await?;
        Ok(())
    }
}
