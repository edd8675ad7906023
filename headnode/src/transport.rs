use async_trait::async_trait;
use storage::chunk_store::FileChunkStore;
use storage::storage::{ChunkStore, chunk_key};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use utilities::result::Result;

/// How chunk bytes get onto and off a cluster server. Stores are
/// all-or-nothing per replica, fetches return exactly what was written.
#[async_trait]
pub trait ChunkTransport: Send + Sync {
    /// Writes one replica, returning the backend local path it landed at.
    async fn store(&self, server: &str, filename: &str, chunk_id: u64, data: &[u8])
        -> Result<String>;
    async fn fetch(&self, server: &str, filename: &str, chunk_id: u64) -> Result<Vec<u8>>;
}

/// Single host simulation: every "server" maps into one shared chunk root,
/// the server name only feeds the key derivation.
pub struct LocalChunkTransport {
    store: FileChunkStore,
}

impl LocalChunkTransport {
    pub fn new(store: FileChunkStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ChunkTransport for LocalChunkTransport {
    async fn store(
        &self,
        server: &str,
        filename: &str,
        chunk_id: u64,
        data: &[u8],
    ) -> Result<String> {
        let key = chunk_key(server, filename, chunk_id);
        let path = self.store.write(&key, data).await?;
        Ok(path.to_string_lossy().into_owned())
    }

    async fn fetch(&self, server: &str, filename: &str, chunk_id: u64) -> Result<Vec<u8>> {
        self.store
            .read(&chunk_key(server, filename, chunk_id))
            .await
    }
}

const MODE_STORE: u8 = 1;
const MODE_FETCH: u8 = 2;

// matches the split size, nothing legitimate is bigger
const MAX_CHUNK_BYTES: u64 = 64 * 1024 * 1024;

/// Talks to the cluster servers' chunk services, one connection per
/// operation the way the rest of the grid does its chunk moves.
#[derive(Default)]
pub struct TcpChunkTransport {}

impl TcpChunkTransport {
    pub fn new() -> Self {
        Self::default()
    }

    async fn open(server: &str) -> Result<TcpStream> {
        TcpStream::connect(server)
            .await
            .map_err(|e| format!("error while connecting to cluster server {server}: {e}").into())
    }

    async fn send_key(stream: &mut TcpStream, mode: u8, key: &str) -> Result<()> {
        stream.write_u8(mode).await?;
        stream.write_u16(key.len() as u16).await?;
        stream.write_all(key.as_bytes()).await?;
        Ok(())
    }
}

#[async_trait]
impl ChunkTransport for TcpChunkTransport {
    async fn store(
        &self,
        server: &str,
        filename: &str,
        chunk_id: u64,
        data: &[u8],
    ) -> Result<String> {
        let key = chunk_key(server, filename, chunk_id);
        let mut stream = Self::open(server).await?;
        Self::send_key(&mut stream, MODE_STORE, &key).await?;
        stream.write_u64(data.len() as u64).await?;
        stream.write_all(data).await?;
        stream.flush().await?;
        let written = stream.read_u64().await?;
        if written != data.len() as u64 {
            return Err(format!(
                "cluster server {server} persisted {written} of {} bytes for chunk {key}",
                data.len()
            )
            .into());
        }
        Ok(key)
    }

    async fn fetch(&self, server: &str, filename: &str, chunk_id: u64) -> Result<Vec<u8>> {
        let key = chunk_key(server, filename, chunk_id);
        let mut stream = Self::open(server).await?;
        Self::send_key(&mut stream, MODE_FETCH, &key).await?;
        let len = stream.read_u64().await?;
        if len == 0 {
            return Err(format!("cluster server {server} has no chunk {key}").into());
        }
        if len > MAX_CHUNK_BYTES {
            return Err(format!("cluster server {server} announced absurd chunk size {len}").into());
        }
        let mut data = vec![0u8; len as usize];
        stream.read_exact(&mut data).await?;
        Ok(data)
    }
}
