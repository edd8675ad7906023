use crate::metrics::{ErrorKind, ReceiverMetrics};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, Notify, mpsc};
use tokio::time::interval;
use tracing::{debug, error, info, warn};
use utilities::result::Result;
use utilities::shutdown::Shutdown;
use wire::frame::{self, FrameDecoder, ParseError};
use wire::heartbeat::Heartbeat;

/// Receives parsed heartbeats from receiver workers. Calls for one
/// connection arrive in wire order.
pub trait HeartbeatSink: Send + Sync + 'static {
    fn on_heartbeat(&self, hb: Heartbeat);
}

#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    pub bind_addr: String,
    /// 0 means one worker per hardware thread
    pub workers: usize,
    pub client_timeout: Duration,
    pub sweep_interval: Duration,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:9000".to_owned(),
            workers: 0,
            client_timeout: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

type ConnId = u64;

/// Per connection state, owned by the connections table. The socket closes
/// when the last handle drops.
struct ClientInfo {
    id: ConnId,
    stream: TcpStream,
    address: String,
    last_heartbeat: StdMutex<Instant>,
    decoder: StdMutex<FrameDecoder>,
    /// readiness watcher parks here until the draining worker is done
    rearm: Notify,
    closed: AtomicBool,
}

/// Heartbeat listener with one acceptor, a worker pool fed by a ready
/// queue, and a janitor that expires idle connections.
///
/// Readiness is one-shot per connection: a watcher enqueues the connection
/// when readable and does not subscribe again until the worker that drained
/// it to `WouldBlock` re-arms it. That is also what keeps frames of one
/// connection in order.
pub struct HeartbeatReceiver {
    config: ReceiverConfig,
    listener: StdMutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    clients: RwLock<HashMap<ConnId, Arc<ClientInfo>>>,
    next_id: AtomicU64,
    metrics: Arc<ReceiverMetrics>,
    sink: Arc<dyn HeartbeatSink>,
    shutdown: Shutdown,
}

impl HeartbeatReceiver {
    /// Binds the listening socket. Failing here is fatal for the process,
    /// callers propagate the error up.
    pub async fn bind(
        config: ReceiverConfig,
        sink: Arc<dyn HeartbeatSink>,
        shutdown: Shutdown,
    ) -> Result<Arc<Self>> {
        let listener = TcpListener::bind(&config.bind_addr).await.map_err(|e| {
            format!(
                "failed to bind heartbeat listener on {}: {e}",
                config.bind_addr
            )
        })?;
        let local_addr = listener.local_addr()?;
        Ok(Arc::new(Self {
            config,
            listener: StdMutex::new(Some(listener)),
            local_addr,
            clients: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            metrics: Arc::new(ReceiverMetrics::default()),
            sink,
            shutdown,
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn metrics(&self) -> Arc<ReceiverMetrics> {
        self.metrics.clone()
    }

    pub fn reset_metrics(&self) {
        self.metrics.reset();
    }

    pub fn active_connections(&self) -> usize {
        self.clients.read().unwrap().len()
    }

    pub fn stop(&self) {
        self.shutdown.trigger();
    }

    /// Spawns the acceptor, the workers and the janitor. Calling it twice
    /// does nothing.
    pub fn start(self: &Arc<Self>) {
        let listener = match self.listener.lock().unwrap().take() {
            Some(l) => l,
            None => return,
        };
        let workers = if self.config.workers == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            self.config.workers
        };
        let (ready_tx, ready_rx) = mpsc::unbounded_channel::<ConnId>();
        let ready_rx = Arc::new(Mutex::new(ready_rx));

        for _ in 0..workers {
            let receiver = Arc::clone(self);
            let ready_rx = Arc::clone(&ready_rx);
            tokio::spawn(async move { receiver.worker_loop(ready_rx).await });
        }
        {
            let receiver = Arc::clone(self);
            tokio::spawn(async move { receiver.acceptor_loop(listener, ready_tx).await });
        }
        {
            let receiver = Arc::clone(self);
            tokio::spawn(async move { receiver.janitor_loop().await });
        }
        info!(addr = %self.local_addr, workers, "heartbeat receiver started");
    }

    async fn acceptor_loop(
        self: Arc<Self>,
        listener: TcpListener,
        ready_tx: mpsc::UnboundedSender<ConnId>,
    ) {
        let mut stop = self.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = stop.changed() => break,
                res = listener.accept() => match res {
                    Ok((stream, peer)) => self.admit(stream, peer.to_string(), &ready_tx),
                    Err(e) => {
                        // one bad accept never takes the receiver down
                        self.metrics.record_error(ErrorKind::Accept);
                        error!(error = %e, "accept failed");
                    }
                }
            }
        }
        // stop accepting, then drop every connection we still own
        let ids: Vec<ConnId> = self.clients.read().unwrap().keys().copied().collect();
        for id in ids {
            self.remove_client(id);
        }
        info!("acceptor stopped");
    }

    fn admit(self: &Arc<Self>, stream: TcpStream, address: String, ready_tx: &mpsc::UnboundedSender<ConnId>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let client = Arc::new(ClientInfo {
            id,
            stream,
            address: address.clone(),
            last_heartbeat: StdMutex::new(Instant::now()),
            decoder: StdMutex::new(FrameDecoder::new()),
            rearm: Notify::new(),
            closed: AtomicBool::new(false),
        });
        self.clients.write().unwrap().insert(id, client.clone());
        self.metrics
            .total_clients_connected
            .fetch_add(1, Ordering::Relaxed);
        self.metrics
            .active_connections
            .fetch_add(1, Ordering::Relaxed);
        debug!(%address, id, "new heartbeat connection");
        tokio::spawn(watch_readiness(
            client,
            ready_tx.clone(),
            self.shutdown.clone(),
        ));
    }

    async fn worker_loop(self: Arc<Self>, ready_rx: Arc<Mutex<mpsc::UnboundedReceiver<ConnId>>>) {
        let mut stop = self.shutdown.subscribe();
        loop {
            let id = {
                let mut rx = ready_rx.lock().await;
                tokio::select! {
                    _ = stop.changed() => {
                        // drain whatever is already queued before leaving
                        while let Ok(id) = rx.try_recv() {
                            self.process_ready(id).await;
                        }
                        return;
                    }
                    id = rx.recv() => match id {
                        Some(id) => id,
                        None => return,
                    },
                }
            };
            self.process_ready(id).await;
        }
    }

    /// Drains one ready connection to `WouldBlock`, feeding the streaming
    /// decoder and handing parsed heartbeats to the sink.
    async fn process_ready(&self, id: ConnId) {
        let client = { self.clients.read().unwrap().get(&id).cloned() };
        let Some(client) = client else {
            return; // already removed
        };
        let started = Instant::now();
        let mut retire = false;
        let mut buf = [0u8; 4096];
        loop {
            match client.stream.try_read(&mut buf) {
                Ok(0) => {
                    // peer closed its write side
                    retire = true;
                    break;
                }
                Ok(n) => {
                    self.metrics
                        .total_bytes_received
                        .fetch_add(n as u64, Ordering::Relaxed);
                    if !self.consume(&client, &buf[..n]) {
                        retire = true;
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    let kind = if e.kind() == std::io::ErrorKind::ConnectionReset {
                        ErrorKind::ConnectionReset
                    } else {
                        ErrorKind::Io
                    };
                    self.metrics.record_error(kind);
                    warn!(address = %client.address, error = %e, "read failed, dropping connection");
                    retire = true;
                    break;
                }
            }
        }
        if retire {
            self.remove_client(id);
        } else {
            *client.last_heartbeat.lock().unwrap() = Instant::now();
            client.rearm.notify_one();
        }
        let elapsed = started.elapsed();
        self.metrics
            .total_processing_time_ns
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
        self.metrics.processing_time.observe(elapsed);
    }

    /// Runs freshly read bytes through the connection's decoder. Returns
    /// false when the connection has to go.
    fn consume(&self, client: &ClientInfo, bytes: &[u8]) -> bool {
        let frames = {
            let mut decoder = client.decoder.lock().unwrap();
            decoder.feed(bytes);
            let mut frames = Vec::new();
            loop {
                match decoder.next_frame() {
                    Ok(Some(payload)) => frames.push(payload),
                    Ok(None) => break,
                    Err(e) => {
                        let kind = match e {
                            ParseError::Oversized(_) => ErrorKind::OversizedFrame,
                            _ => ErrorKind::Decode,
                        };
                        self.metrics.record_error(kind);
                        warn!(address = %client.address, error = %e, "bad frame, dropping connection");
                        return false;
                    }
                }
            }
            frames
        };
        for payload in frames {
            self.metrics
                .total_received_messages
                .fetch_add(1, Ordering::Relaxed);
            match frame::decode_payload(&payload) {
                Ok(hb) => self.sink.on_heartbeat(hb),
                Err(e) => {
                    self.metrics.record_error(ErrorKind::Decode);
                    warn!(address = %client.address, error = %e, "undecodable heartbeat, dropping connection");
                    return false;
                }
            }
        }
        true
    }

    /// Ages out connections that went quiet. Each removal takes the
    /// exclusive lock on its own, long scans never block the workers.
    async fn janitor_loop(self: Arc<Self>) {
        let mut ticker = interval(self.config.sweep_interval);
        let mut stop = self.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = stop.changed() => break,
                _ = ticker.tick() => {
                    let stale: Vec<ConnId> = {
                        let clients = self.clients.read().unwrap();
                        clients
                            .iter()
                            .filter(|(_, c)| {
                                c.last_heartbeat.lock().unwrap().elapsed() > self.config.client_timeout
                            })
                            .map(|(id, _)| *id)
                            .collect()
                    };
                    for id in stale {
                        debug!(id, "expiring idle heartbeat connection");
                        self.remove_client(id);
                    }
                }
            }
        }
        info!("janitor stopped");
    }

    fn remove_client(&self, id: ConnId) {
        let removed = self.clients.write().unwrap().remove(&id);
        if let Some(client) = removed {
            client.closed.store(true, Ordering::Release);
            // wake the watcher so it notices and lets go of its handle
            client.rearm.notify_one();
            self.metrics
                .active_connections
                .fetch_sub(1, Ordering::Relaxed);
            debug!(address = %client.address, id, "heartbeat connection closed");
        }
    }
}

/// The tokio rendition of an edge-triggered one-shot subscription: wait for
/// readability, hand the connection to the workers, then stay parked until
/// the drain re-arms us.
async fn watch_readiness(
    client: Arc<ClientInfo>,
    ready_tx: mpsc::UnboundedSender<ConnId>,
    shutdown: Shutdown,
) {
    let mut stop = shutdown.subscribe();
    loop {
        if client.closed.load(Ordering::Acquire) {
            break;
        }
        tokio::select! {
            _ = stop.changed() => break,
            res = client.stream.readable() => {
                if let Err(e) = res {
                    // surface the failure through the worker's read
                    debug!(address = %client.address, error = %e, "readiness wait failed");
                }
                if ready_tx.send(client.id).is_err() {
                    break;
                }
                tokio::select! {
                    _ = client.rearm.notified() => {}
                    _ = stop.changed() => break,
                }
            }
        }
    }
}
