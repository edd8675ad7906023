use std::sync::Arc;
use storage::chunk_store::FileChunkStore;
use storage::storage::ChunkStore;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, trace};
use utilities::result::Result;
use utilities::shutdown::Shutdown;

pub const MODE_STORE: u8 = 1;
pub const MODE_FETCH: u8 = 2;

// one chunk per request, anything bigger than the split size is bogus
const MAX_CHUNK_BYTES: u64 = 64 * 1024 * 1024;

/// TCP front for the local chunk store. One request per connection: a mode
/// byte, a length prefixed chunk key, then the chunk bytes (store) or the
/// chunk bytes back (fetch). Store replies with the byte count it persisted,
/// 0 meaning the write did not happen.
pub struct ChunkService {
    listener: TcpListener,
    store: Arc<FileChunkStore>,
}

impl ChunkService {
    pub async fn bind(addr: &str, store: Arc<FileChunkStore>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| format!("failed to bind chunk service on {addr}: {e}"))?;
        info!(%addr, "chunk service listening");
        Ok(Self { listener, store })
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self, shutdown: Shutdown) -> Result<()> {
        let mut stop = shutdown.subscribe();
        loop {
            tokio::select! {
                _ = stop.changed() => break,
                res = self.listener.accept() => {
                    let (stream, peer) = match res {
                        Ok(v) => v,
                        Err(e) => {
                            error!(error = %e, "error while accepting chunk connection");
                            continue;
                        }
                    };
                    trace!(%peer, "accepted chunk connection");
                    let store = self.store.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, store).await {
                            error!(%peer, error = %e, "error while handling chunk request");
                        }
                    });
                }
            }
        }
        Ok(())
    }
}

async fn handle_connection(mut stream: TcpStream, store: Arc<FileChunkStore>) -> Result<()> {
    let mode = stream.read_u8().await?;
    let key_len = stream.read_u16().await? as usize;
    let mut key = vec![0u8; key_len];
    stream.read_exact(&mut key).await?;
    let key = String::from_utf8(key).map_err(|e| format!("chunk key is not utf-8: {e}"))?;

    match mode {
        MODE_STORE => {
            let len = stream.read_u64().await?;
            if len == 0 || len > MAX_CHUNK_BYTES {
                stream.write_u64(0).await?;
                return Err(format!("refusing chunk {key} of {len} bytes").into());
            }
            let mut data = vec![0u8; len as usize];
            stream.read_exact(&mut data).await?;
            match store.write(&key, &data).await {
                Ok(_) => {
                    trace!(%key, bytes = len, "chunk stored");
                    stream.write_u64(len).await?;
                }
                Err(e) => {
                    error!(%key, error = %e, "error while writing chunk to store");
                    stream.write_u64(0).await?;
                }
            }
        }
        MODE_FETCH => match store.read(&key).await {
            Ok(data) => {
                stream.write_u64(data.len() as u64).await?;
                stream.write_all(&data).await?;
                stream.flush().await?;
            }
            Err(_) => {
                // absent chunk, the head probes for replicas so this is routine
                stream.write_u64(0).await?;
            }
        },
        m => {
            return Err(format!("accepted request for chunk {key} with unknown mode {m}").into());
        }
    }
    Ok(())
}
