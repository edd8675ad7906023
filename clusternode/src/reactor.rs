use std::future::Future;
use tokio::net::TcpStream;
use tokio::runtime::Builder;
use tokio::task::LocalSet;
use tracing::error;
use utilities::result::Result;

/// Single threaded cooperative scheduler for the cluster server side.
///
/// Every task spawned here runs on one thread and yields only at readiness
/// suspension points: `readable()`/`writable()` on a socket (after draining
/// with `try_read`/`try_write` until `WouldBlock`) or a timer. `run` returns
/// once every task has finished. A task that resolves to an error takes the
/// process down, nothing on this side is expected to outlive a broken
/// invariant.
pub struct Reactor {
    rt: tokio::runtime::Runtime,
    local: LocalSet,
}

impl Reactor {
    pub fn new() -> Result<Self> {
        let rt = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| format!("failed to build reactor runtime: {e}"))?;
        Ok(Self {
            rt,
            local: LocalSet::new(),
        })
    }

    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = Result<()>> + 'static,
    {
        self.local.spawn_local(async move {
            if let Err(e) = task.await {
                error!(error = %e, "reactor task failed");
                std::process::exit(1);
            }
        });
    }

    pub fn run(self) {
        self.rt.block_on(self.local);
    }
}

/// Non blocking connect. The runtime parks us on writability until the
/// connect completes and surfaces SO_ERROR as the result.
pub async fn connect(addr: &str) -> Result<TcpStream> {
    TcpStream::connect(addr)
        .await
        .map_err(|e| format!("error while connecting to {addr}: {e}").into())
}

/// Writes the whole buffer, continuing from the short-write offset and
/// suspending on `WouldBlock`. The caller being the sole writer on the
/// stream is what keeps frames contiguous on the wire.
pub async fn send_all(stream: &TcpStream, data: &[u8]) -> std::io::Result<()> {
    let mut offset = 0;
    while offset < data.len() {
        match stream.try_write(&data[offset..]) {
            Ok(0) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "connection closed mid frame",
                ));
            }
            Ok(n) => offset += n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                stream.writable().await?;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
