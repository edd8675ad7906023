use headnode::health_tracker::{HealthTracker, TrackerConfig};
use headnode::metadata::memory::MemoryMetadataStore;
use headnode::metadata::{self, MetadataStore};
use headnode::placement::PlacementEngine;
use headnode::reconstructor::FileReconstructor;
use headnode::registry::FileRegistry;
use headnode::rereplicator::ReReplicator;
use headnode::transport::{ChunkTransport, LocalChunkTransport};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::collections::{HashMap, HashSet};
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use storage::chunk_store::FileChunkStore;
use wire::heartbeat::{Heartbeat, Timestamp};

fn test_file_contents() -> Vec<u8> {
    let mut contents = Vec::new();
    contents.extend_from_slice(b"This is a test file for the distributed storage system.\n");
    for i in 0..1000 {
        contents.extend_from_slice(
            format!("Line {i}: Lorem ipsum dolor sit amet, consectetur adipiscing elit.\n")
                .as_bytes(),
        );
    }
    contents
}

fn servers() -> Vec<String> {
    vec!["s1".to_owned(), "s2".to_owned(), "s3".to_owned()]
}

async fn grid_over(
    dir: &tempfile::TempDir,
) -> (Arc<dyn MetadataStore>, Arc<dyn ChunkTransport>) {
    let store = FileChunkStore::new(dir.path().join("chunks")).await.unwrap();
    let metadata: Arc<dyn MetadataStore> = Arc::new(MemoryMetadataStore::new());
    let transport: Arc<dyn ChunkTransport> = Arc::new(LocalChunkTransport::new(store));
    (metadata, transport)
}

#[tokio::test]
async fn upload_download_round_trip_is_byte_exact() {
    let dir = tempfile::tempdir().unwrap();
    let (metadata, transport) = grid_over(&dir).await;
    let contents = test_file_contents();

    // 16 KiB chunks force several chunk ids out of the ~66 KiB file
    let engine = PlacementEngine::new(transport.clone(), 16 * 1024, 3);
    let mut rng = StdRng::seed_from_u64(42);
    let chunks = engine
        .split_and_store(
            &mut Cursor::new(contents.clone()),
            "test_file.txt",
            &servers(),
            &mut rng,
        )
        .await
        .unwrap();
    assert!(!chunks.is_empty());
    metadata::save_placement(metadata.as_ref(), "test_file.txt", &chunks, 3600)
        .await
        .unwrap();

    let reconstructor = FileReconstructor::new(metadata, transport);
    assert!(reconstructor.file_exists("test_file.txt").await.unwrap());
    let out_path = dir.path().join("downloaded_test_file.txt");
    reconstructor
        .reconstruct("test_file.txt", &out_path)
        .await
        .unwrap();

    let downloaded = tokio::fs::read(&out_path).await.unwrap();
    assert_eq!(downloaded, contents);
}

#[tokio::test]
async fn reconstruction_gap_is_fatal_and_removes_partial_output() {
    let dir = tempfile::tempdir().unwrap();
    let (metadata, transport) = grid_over(&dir).await;

    let engine = PlacementEngine::new(transport.clone(), 1024, 2);
    let mut rng = StdRng::seed_from_u64(5);
    let data: Vec<u8> = (0..4000u32).map(|i| (i % 251) as u8).collect();
    let chunks = engine
        .split_and_store(&mut Cursor::new(data), "gappy.bin", &servers(), &mut rng)
        .await
        .unwrap();
    metadata::save_placement(metadata.as_ref(), "gappy.bin", &chunks, 0)
        .await
        .unwrap();
    // punch chunk 1 out of the record
    assert!(metadata::delete_entry(metadata.as_ref(), "gappy.bin#chunk:1")
        .await
        .unwrap());

    let reconstructor = FileReconstructor::new(metadata, transport);
    let out_path = dir.path().join("gappy.out");
    let res = reconstructor.reconstruct("gappy.bin", &out_path).await;
    assert!(res.is_err());
    assert!(!out_path.exists());
}

#[tokio::test]
async fn unreadable_replica_aborts_and_cleans_up() {
    let dir = tempfile::tempdir().unwrap();
    let (metadata, transport) = grid_over(&dir).await;

    let engine = PlacementEngine::new(transport.clone(), 1024, 1);
    let mut rng = StdRng::seed_from_u64(6);
    let data = vec![7u8; 2048];
    let chunks = engine
        .split_and_store(&mut Cursor::new(data), "lost.bin", &servers(), &mut rng)
        .await
        .unwrap();
    metadata::save_placement(metadata.as_ref(), "lost.bin", &chunks, 0)
        .await
        .unwrap();
    // repoint chunk 0 at a server that never stored it
    let orphan = metadata::encode_loc("s9", "nowhere").unwrap();
    metadata
        .hset_bulk("file:lost.bin", &[("chunk:0".to_owned(), orphan)])
        .await
        .unwrap();

    let reconstructor = FileReconstructor::new(metadata, transport);
    let out_path = dir.path().join("lost.out");
    assert!(reconstructor.reconstruct("lost.bin", &out_path).await.is_err());
    assert!(!out_path.exists());
}

fn heartbeat_from(server_id: u64, ip: &str) -> Heartbeat {
    Heartbeat {
        server_id,
        ip: ip.to_owned(),
        timestamp: Some(Timestamp::now()),
        cpu_usage: 1.0,
        storage_used: 0.0,
        storage_total: 1.0,
        network_bandwidth: 0.0,
    }
}

#[tokio::test]
async fn server_failure_restores_replication_and_repoints_metadata() {
    let dir = tempfile::tempdir().unwrap();
    let (metadata, transport) = grid_over(&dir).await;

    // place with R=2 over three servers so every chunk leaves one spare
    let engine = PlacementEngine::new(transport.clone(), 1024, 2);
    let mut rng = StdRng::seed_from_u64(11);
    let data: Vec<u8> = (0..5000u32).map(|i| (i % 199) as u8).collect();
    let chunks = engine
        .split_and_store(&mut Cursor::new(data.clone()), "precious.bin", &servers(), &mut rng)
        .await
        .unwrap();
    metadata::save_placement(metadata.as_ref(), "precious.bin", &chunks, 0)
        .await
        .unwrap();
    let registry = Arc::new(FileRegistry::new());
    registry.register("precious.bin");

    // all three servers check in, then s1 goes dark
    let tracker = Arc::new(HealthTracker::new(TrackerConfig {
        heartbeat_timeout: Duration::from_nanos(1),
        max_missed_heartbeats: 3,
    }));
    tracker.on_heartbeat(&heartbeat_from(1, "s1"));
    tracker.on_heartbeat(&heartbeat_from(2, "s2"));
    tracker.on_heartbeat(&heartbeat_from(3, "s3"));
    std::thread::sleep(Duration::from_millis(2));
    for _ in 0..3 {
        tracker.sweep();
    }
    // the sweep downed everyone; revive the survivors
    tracker.on_heartbeat(&heartbeat_from(2, "s2"));
    tracker.on_heartbeat(&heartbeat_from(3, "s3"));
    assert!(!tracker.is_server_healthy(1));

    let rereplicator = ReReplicator::new(
        metadata.clone(),
        transport.clone(),
        tracker,
        registry,
        2,
        StdRng::seed_from_u64(13),
    );
    rereplicator.handle_server_failure(1).await.unwrap();

    // metadata no longer references the failed server
    let placement = metadata::load_placement(metadata.as_ref(), "precious.bin")
        .await
        .unwrap();
    let referenced: HashSet<&str> = placement.values().map(|l| l.server.as_str()).collect();
    assert!(!referenced.contains("s1"));

    // every chunk is fetchable from two healthy servers
    for chunk_id in placement.keys() {
        let mut copies = 0;
        for server in ["s2", "s3"] {
            if transport.fetch(server, "precious.bin", *chunk_id).await.is_ok() {
                copies += 1;
            }
        }
        assert_eq!(copies, 2, "chunk {chunk_id} should be back to full strength");
    }

    // and the file still reconstructs byte for byte
    let reconstructor = FileReconstructor::new(metadata, transport);
    let out_path = dir.path().join("precious.out");
    reconstructor
        .reconstruct("precious.bin", &out_path)
        .await
        .unwrap();
    assert_eq!(tokio::fs::read(&out_path).await.unwrap(), data);
}

#[tokio::test]
async fn placement_cardinality_holds_per_chunk() {
    let dir = tempfile::tempdir().unwrap();
    let (_metadata, transport) = grid_over(&dir).await;
    let engine = PlacementEngine::new(transport, 512, 3);
    let mut rng = StdRng::seed_from_u64(21);
    let data = vec![3u8; 2000];
    let chunks = engine
        .split_and_store(&mut Cursor::new(data), "card.bin", &servers(), &mut rng)
        .await
        .unwrap();

    let mut by_chunk: HashMap<u64, Vec<&str>> = HashMap::new();
    for chunk in &chunks {
        by_chunk
            .entry(chunk.chunk_id)
            .or_default()
            .push(chunk.server_ip.as_str());
    }
    assert_eq!(by_chunk.len(), 4); // 2000 bytes in 512 byte chunks
    for replicas in by_chunk.values() {
        assert!(!replicas.is_empty() && replicas.len() <= 3);
        let distinct: HashSet<_> = replicas.iter().collect();
        assert_eq!(distinct.len(), replicas.len());
    }
}
