use crate::reactor::send_all;
use crate::resource::ResourceSampler;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::sleep;
use tracing::{info, trace};
use utilities::result::Result;
use wire::frame;
use wire::heartbeat::{Heartbeat, Timestamp};

/// Emits one heartbeat frame per interval over a single connection.
///
/// Returns only on a terminal send failure; reconnecting is the supervisor's
/// job, not ours.
pub struct HeartbeatSender {
    server_id: u64,
    ip: String,
    interval: Duration,
    sampler: Arc<dyn ResourceSampler>,
}

impl HeartbeatSender {
    pub fn new(
        server_id: u64,
        ip: String,
        interval: Duration,
        sampler: Arc<dyn ResourceSampler>,
    ) -> Self {
        Self {
            server_id,
            ip,
            interval,
            sampler,
        }
    }

    pub async fn run(&self, stream: &TcpStream) -> Result<()> {
        info!(server_id = self.server_id, "starting heartbeat emission");
        loop {
            let usage = self.sampler.sample();
            let hb = Heartbeat {
                server_id: self.server_id,
                ip: self.ip.clone(),
                timestamp: Some(Timestamp::now()),
                cpu_usage: usage.cpu_usage,
                storage_used: usage.storage_used,
                storage_total: usage.storage_total,
                network_bandwidth: usage.network_bandwidth,
            };
            let frame = frame::encode(&hb)?;
            send_all(stream, &frame)
                .await
                .map_err(|e| format!("error while sending heartbeat frame: {e}"))?;
            trace!(server_id = self.server_id, "heartbeat sent");
            sleep(self.interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::connect;
    use crate::resource::{ResourceUsage, StaticSampler};
    use tokio::io::AsyncReadExt;
    use wire::frame::FrameDecoder;

    #[tokio::test]
    async fn emits_decodable_frames_on_the_interval() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let collector = tokio::spawn(async move {
            let (mut peer, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            peer.read_to_end(&mut received).await.unwrap();
            received
        });

        let sampler = Arc::new(StaticSampler::new(ResourceUsage {
            cpu_usage: 40.0,
            storage_used: 10.0,
            storage_total: 100.0,
            network_bandwidth: 1_000.0,
        }));
        let sender = HeartbeatSender::new(7, "127.0.0.1".to_owned(), Duration::from_millis(10), sampler);
        let stream = connect(&addr.to_string()).await.unwrap();
        // let a few ticks through, then hang up our side
        let _ = tokio::time::timeout(Duration::from_millis(35), sender.run(&stream)).await;
        drop(stream);

        let bytes = collector.await.unwrap();
        let mut decoder = FrameDecoder::new();
        decoder.feed(&bytes);
        let mut seen = Vec::new();
        while let Some(payload) = decoder.next_frame().unwrap() {
            seen.push(frame::decode_payload(&payload).unwrap());
        }
        assert!(!seen.is_empty());
        for hb in &seen {
            assert_eq!(hb.server_id, 7);
            assert_eq!(hb.ip, "127.0.0.1");
            assert_eq!(hb.cpu_usage, 40.0);
            assert!(hb.timestamp.is_some());
        }
    }

    #[tokio::test]
    async fn hangup_surfaces_as_an_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stream = connect(&addr.to_string()).await.unwrap();
        // accept then immediately close the peer
        let (peer, _) = listener.accept().await.unwrap();
        drop(peer);
        drop(listener);

        let sender = HeartbeatSender::new(
            1,
            "127.0.0.1".to_owned(),
            Duration::from_millis(5),
            Arc::new(StaticSampler::default()),
        );
        let res = tokio::time::timeout(Duration::from_secs(2), sender.run(&stream)).await;
        match res {
            Ok(Err(_)) => {}
            other => panic!("expected a send error, got {other:?}"),
        }
    }
}
