use crate::transport::ChunkTransport;
use rand::Rng;
use rand::seq::SliceRandom;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{info, instrument, warn};
use utilities::result::Result;

pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024 * 1024;
pub const DEFAULT_REPLICATION_FACTOR: usize = 3;

/// One successfully placed replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkInfo {
    pub chunk_id: u64,
    pub server_ip: String,
    pub file_path: String,
    pub size: u64,
    pub checksum: String,
}

/// Base 31 polynomial over the unsigned bytes, wrapping at word size,
/// rendered as lowercase hex. Fine for spotting corruption, not for
/// adversaries; swap in a real digest if that ever matters.
pub fn polynomial_checksum(data: &[u8]) -> String {
    let mut hash: u64 = 0;
    for &byte in data {
        hash = hash.wrapping_mul(31).wrapping_add(byte as u64);
    }
    format!("{hash:x}")
}

/// Splits files into fixed chunks and spreads each one across a replica
/// set picked by uniform shuffle. The rng comes from the caller so tests
/// can pin the selection.
pub struct PlacementEngine {
    transport: Arc<dyn ChunkTransport>,
    chunk_size: usize,
    replication: usize,
}

impl PlacementEngine {
    pub fn new(transport: Arc<dyn ChunkTransport>, chunk_size: usize, replication: usize) -> Self {
        Self {
            transport,
            chunk_size,
            replication,
        }
    }

    /// Best effort placement: a replica write that fails is logged and left
    /// out of the result, callers re-invoke if fewer than R replicas of a
    /// chunk matter to them.
    #[instrument(name = "split_and_store", skip(self, source, rng, candidates))]
    pub async fn split_and_store<R: Rng>(
        &self,
        source: &mut (impl AsyncRead + Unpin),
        filename: &str,
        candidates: &[String],
        rng: &mut R,
    ) -> Result<Vec<ChunkInfo>> {
        if candidates.is_empty() {
            return Err(format!("no candidate cluster servers to place {filename} on").into());
        }
        if let Some(bad) = candidates.iter().find(|s| s.contains('|')) {
            return Err(format!("server identifier {bad:?} contains the '|' delimiter").into());
        }
        let mut chunks = Vec::new();
        let mut chunk_id: u64 = 0;
        loop {
            let data = read_one_chunk(source, self.chunk_size).await?;
            if data.is_empty() {
                break;
            }
            let checksum = polynomial_checksum(&data);
            let replica_set = self.select_replicas(candidates, rng);
            for server in replica_set {
                match self
                    .transport
                    .store(&server, filename, chunk_id, &data)
                    .await
                {
                    Ok(path) => chunks.push(ChunkInfo {
                        chunk_id,
                        server_ip: server,
                        file_path: path,
                        size: data.len() as u64,
                        checksum: checksum.clone(),
                    }),
                    Err(e) => {
                        warn!(%server, chunk_id, error = %e, "replica write failed, leaving it out of the placement");
                    }
                }
            }
            chunk_id += 1;
        }
        info!(
            filename,
            chunks = chunk_id,
            replicas = chunks.len(),
            "file split and stored"
        );
        Ok(chunks)
    }

    fn select_replicas<R: Rng>(&self, candidates: &[String], rng: &mut R) -> Vec<String> {
        let mut shuffled = candidates.to_vec();
        shuffled.shuffle(rng);
        shuffled.truncate(self.replication.min(candidates.len()));
        shuffled
    }
}

/// Reads up to `chunk_size` bytes, short only at end of file.
async fn read_one_chunk(
    source: &mut (impl AsyncRead + Unpin),
    chunk_size: usize,
) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; chunk_size];
    let mut filled = 0;
    while filled < chunk_size {
        let n = source
            .read(&mut buf[filled..])
            .await
            .map_err(|e| format!("error while reading source file: {e}"))?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{ChunkTransport, LocalChunkTransport};
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::collections::HashMap;
    use std::io::Cursor;
    use storage::chunk_store::FileChunkStore;

    #[test]
    fn checksum_matches_the_known_vector() {
        // ((97 * 31) + 98) * 31 + 99
        assert_eq!(polynomial_checksum(b"abc"), "17862");
        assert_eq!(polynomial_checksum(b""), "0");
        assert_ne!(polynomial_checksum(b"abc"), polynomial_checksum(b"acb"));
    }

    #[test]
    fn checksum_wraps_instead_of_overflowing() {
        let big = vec![0xffu8; 64 * 1024];
        // just has to terminate and be stable
        assert_eq!(polynomial_checksum(&big), polynomial_checksum(&big));
    }

    async fn engine_over_tempdir(
        dir: &tempfile::TempDir,
        chunk_size: usize,
        replication: usize,
    ) -> PlacementEngine {
        let store = FileChunkStore::new(dir.path().join("chunks")).await.unwrap();
        PlacementEngine::new(
            Arc::new(LocalChunkTransport::new(store)),
            chunk_size,
            replication,
        )
    }

    fn servers() -> Vec<String> {
        vec!["s1".to_owned(), "s2".to_owned(), "s3".to_owned()]
    }

    #[tokio::test]
    async fn every_chunk_gets_full_replication_and_matching_checksums() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_over_tempdir(&dir, 100, 3).await;
        let data: Vec<u8> = (0..250u32).map(|i| (i % 256) as u8).collect();
        let mut rng = StdRng::seed_from_u64(7);

        let chunks = engine
            .split_and_store(&mut Cursor::new(data), "f.bin", &servers(), &mut rng)
            .await
            .unwrap();

        // 250 bytes in 100 byte chunks: ids 0,1,2 with the last one short
        let mut by_chunk: HashMap<u64, Vec<&ChunkInfo>> = HashMap::new();
        for chunk in &chunks {
            by_chunk.entry(chunk.chunk_id).or_default().push(chunk);
        }
        assert_eq!(by_chunk.len(), 3);
        for (chunk_id, replicas) in &by_chunk {
            assert_eq!(replicas.len(), 3, "chunk {chunk_id}");
            let servers: std::collections::HashSet<_> =
                replicas.iter().map(|c| c.server_ip.as_str()).collect();
            assert_eq!(servers.len(), 3, "replicas must land on distinct servers");
            let checksums: std::collections::HashSet<_> =
                replicas.iter().map(|c| c.checksum.as_str()).collect();
            assert_eq!(checksums.len(), 1, "replica checksums must agree");
            let expected = if *chunk_id == 2 { 50 } else { 100 };
            assert!(replicas.iter().all(|c| c.size == expected));
        }
    }

    #[tokio::test]
    async fn replication_caps_at_the_candidate_count() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_over_tempdir(&dir, 1024, 3).await;
        let mut rng = StdRng::seed_from_u64(1);
        let chunks = engine
            .split_and_store(
                &mut Cursor::new(b"tiny".to_vec()),
                "f.bin",
                &["only".to_owned()],
                &mut rng,
            )
            .await
            .unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].server_ip, "only");
    }

    #[tokio::test]
    async fn empty_source_produces_no_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_over_tempdir(&dir, 1024, 3).await;
        let mut rng = StdRng::seed_from_u64(1);
        let chunks = engine
            .split_and_store(&mut Cursor::new(Vec::new()), "f.bin", &servers(), &mut rng)
            .await
            .unwrap();
        assert!(chunks.is_empty());
    }

    #[tokio::test]
    async fn delimiter_in_a_server_name_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_over_tempdir(&dir, 1024, 3).await;
        let mut rng = StdRng::seed_from_u64(1);
        let res = engine
            .split_and_store(
                &mut Cursor::new(b"data".to_vec()),
                "f.bin",
                &["bad|server".to_owned()],
                &mut rng,
            )
            .await;
        assert!(res.is_err());
    }

    /// Transport that refuses one server, to exercise the soft failure path.
    struct FlakyTransport {
        inner: LocalChunkTransport,
        down: String,
    }

    #[async_trait::async_trait]
    impl ChunkTransport for FlakyTransport {
        async fn store(
            &self,
            server: &str,
            filename: &str,
            chunk_id: u64,
            data: &[u8],
        ) -> Result<String> {
            if server == self.down {
                return Err(format!("{server} is down").into());
            }
            self.inner.store(server, filename, chunk_id, data).await
        }

        async fn fetch(&self, server: &str, filename: &str, chunk_id: u64) -> Result<Vec<u8>> {
            if server == self.down {
                return Err(format!("{server} is down").into());
            }
            self.inner.fetch(server, filename, chunk_id).await
        }
    }

    #[tokio::test]
    async fn failed_replica_writes_are_soft() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileChunkStore::new(dir.path().join("chunks")).await.unwrap();
        let transport = FlakyTransport {
            inner: LocalChunkTransport::new(store),
            down: "s2".to_owned(),
        };
        let engine = PlacementEngine::new(Arc::new(transport), 1024, 3);
        let mut rng = StdRng::seed_from_u64(3);

        let chunks = engine
            .split_and_store(&mut Cursor::new(b"data".to_vec()), "f.bin", &servers(), &mut rng)
            .await
            .unwrap();
        // the s2 replica is simply missing, nothing failed hard
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.server_ip != "s2"));
    }
}
