//! End-to-end transfer tests against an in-memory tracker and peer network
//!
//! Run with: cargo test -p nebula-client --test end_to_end

mod common;

use common::{init_tracing, test_config, write_file, FakeNetwork, FakeTracker, KIB};
use nebula_client::{
    ClientEngine, DirSummary, DownloadOutcome, TransferEvent, TransferKind, UploadOutcome,
};
use nebula_core::{ContentHash, NebulaError};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn engine(root: &Path, tracker: &Arc<FakeTracker>, network: &Arc<FakeNetwork>) -> ClientEngine {
    ClientEngine::new(test_config(root), tracker.clone(), network.clone()).unwrap()
}

fn scratch_is_empty(root: &Path) -> bool {
    match std::fs::read_dir(root.join("scratch")) {
        Ok(mut entries) => entries.next().is_none(),
        Err(_) => true,
    }
}

#[tokio::test]
async fn test_replica_roundtrip() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let tracker = FakeTracker::new(6, 0);
    let network = FakeNetwork::new();
    let engine = engine(dir.path(), &tracker, &network);

    let source = dir.path().join("report.pdf");
    let data = write_file(&source, 20 * KIB);
    let hash = ContentHash::compute(&data);

    let outcome = engine.upload_file(&source, "/").await.unwrap();
    assert_eq!(outcome, UploadOutcome::Replicated { peers: 5 });
    assert_eq!(network.total_pieces(), 5);
    assert_eq!(tracker.commits.load(Ordering::SeqCst), 1);

    let dest = dir.path().join("restored/report.pdf");
    let outcome = engine
        .download_file(hash, data.len() as u64, &dest)
        .await
        .unwrap();
    assert_eq!(outcome, DownloadOutcome::Replica);
    assert_eq!(std::fs::read(&dest).unwrap(), data);
    assert!(scratch_is_empty(dir.path()));
}

#[tokio::test]
async fn test_inline_file_never_touches_peers() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let tracker = FakeTracker::new(6, 0);
    let network = FakeNetwork::new();
    let engine = engine(dir.path(), &tracker, &network);

    let source = dir.path().join("notes.txt");
    let data = write_file(&source, KIB);

    let outcome = engine.upload_file(&source, "/").await.unwrap();
    assert_eq!(outcome, UploadOutcome::Inline);
    assert_eq!(network.stores.load(Ordering::SeqCst), 0);
    assert_eq!(tracker.commits.load(Ordering::SeqCst), 0);

    let dest = dir.path().join("out/notes.txt");
    let outcome = engine
        .download_file(ContentHash::compute(&data), data.len() as u64, &dest)
        .await
        .unwrap();
    assert_eq!(outcome, DownloadOutcome::Inline);
    assert_eq!(std::fs::read(&dest).unwrap(), data);
    assert_eq!(network.retrieves.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_erasure_two_partitions_survive_parity_losses() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let tracker = FakeTracker::new(8, 0);
    let network = FakeNetwork::new();
    let engine = engine(dir.path(), &tracker, &network);

    // Just over one partition: splits into two equal halves
    let source = dir.path().join("video.mp4");
    let data = write_file(&source, 259 * KIB);
    let hash = ContentHash::compute(&data);
    let size = data.len() as u64;

    let outcome = engine.upload_file(&source, "/").await.unwrap();
    assert_eq!(
        outcome,
        UploadOutcome::ErasureCoded {
            partitions: 2,
            shards: 12
        }
    );
    assert!(scratch_is_empty(dir.path()));

    let partitions = tracker.committed(&hash).unwrap();
    assert_eq!(partitions.len(), 2);
    for partition in &partitions {
        assert_eq!(partition.data_blocks(), 4);
        assert_eq!(partition.parity_blocks(), 2);
        // (259 KiB / 2) / 4 data shards
        assert!(partition.blocks.iter().all(|b| b.size == 33152));
    }

    let first = &partitions[0].blocks;
    for seq in [0, 5] {
        assert!(network.drop_piece(&first[seq].store_nodes[0], &first[seq].hash));
    }
    let dest = dir.path().join("restored.mp4");
    let outcome = engine.download_file(hash, size, &dest).await.unwrap();
    assert_eq!(outcome, DownloadOutcome::ErasureCoded { partitions: 2 });
    assert_eq!(std::fs::read(&dest).unwrap(), data);

    assert!(network.drop_piece(&first[1].store_nodes[0], &first[1].hash));
    let lost = dir.path().join("lost.mp4");
    let err = engine.download_file(hash, size, &lost).await.unwrap_err();
    assert!(matches!(
        err,
        NebulaError::Irrecoverable {
            partition: 0,
            failed: 3,
            parity: 2
        }
    ));
    assert!(!lost.exists());
    assert!(scratch_is_empty(dir.path()));
}

#[tokio::test]
async fn test_too_few_reachable_peers() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let tracker = FakeTracker::new(6, 0);
    let network = FakeNetwork::new();
    for i in 0..4 {
        network.set_down(&format!("node{}", i));
    }
    let engine = engine(dir.path(), &tracker, &network);

    let source = dir.path().join("a.bin");
    write_file(&source, 20 * KIB);
    let err = engine.upload_file(&source, "/").await.unwrap_err();
    assert!(matches!(
        err,
        NebulaError::InsufficientPeers {
            reachable: 2,
            required: 3
        }
    ));
    assert_eq!(network.total_pieces(), 0);
    assert_eq!(tracker.commits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_failed_replica_retried_on_backup_peer() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let tracker = FakeTracker::new(7, 0);
    let network = FakeNetwork::new();
    network.fail_stores("node1");
    let engine = engine(dir.path(), &tracker, &network);

    let source = dir.path().join("a.bin");
    let data = write_file(&source, 20 * KIB);
    let hash = ContentHash::compute(&data);

    let outcome = engine.upload_file(&source, "/").await.unwrap();
    assert_eq!(outcome, UploadOutcome::Replicated { peers: 5 });
    assert_eq!(network.pieces_on("node1"), 0);
    assert_eq!(network.pieces_on("node5"), 1);
    assert_eq!(network.pieces_on("node6"), 0);

    let partitions = tracker.committed(&hash).unwrap();
    let nodes = &partitions[0].blocks[0].store_nodes;
    assert_eq!(nodes.len(), 5);
    assert!(nodes.contains(&"node5".to_string()));
    assert!(!nodes.contains(&"node1".to_string()));

    // five primaries plus one backup attempt
    let key = source.to_string_lossy().into_owned();
    let entry = engine.ledger().entry(&key).unwrap();
    assert_eq!(entry.total, 6 * data.len() as u64);
    assert_eq!(entry.transferred, entry.total);
}

#[tokio::test]
async fn test_failed_shard_moves_to_spare() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let tracker = FakeTracker::new(6, 2);
    let network = FakeNetwork::new();
    network.fail_stores("node2");
    let engine = engine(dir.path(), &tracker, &network);

    let source = dir.path().join("a.bin");
    let data = write_file(&source, 100 * KIB);
    let hash = ContentHash::compute(&data);

    let outcome = engine.upload_file(&source, "/").await.unwrap();
    assert_eq!(
        outcome,
        UploadOutcome::ErasureCoded {
            partitions: 1,
            shards: 6
        }
    );
    let partitions = tracker.committed(&hash).unwrap();
    let blocks = &partitions[0].blocks;
    assert_eq!(blocks[2].store_nodes, vec!["spare0".to_string()]);
    assert_eq!(network.pieces_on("spare1"), 0);

    let dest = dir.path().join("b.bin");
    engine
        .download_file(hash, data.len() as u64, &dest)
        .await
        .unwrap();
    assert_eq!(std::fs::read(&dest).unwrap(), data);
}

#[tokio::test]
async fn test_spare_used_once_then_upload_fails() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let tracker = FakeTracker::new(6, 1);
    let network = FakeNetwork::new();
    network.fail_stores("node2");
    network.fail_stores("node4");
    let engine = engine(dir.path(), &tracker, &network);

    let source = dir.path().join("a.bin");
    write_file(&source, 100 * KIB);
    let err = engine.upload_file(&source, "/").await.unwrap_err();
    assert!(matches!(err, NebulaError::PeerTransport { .. }));
    assert_eq!(network.pieces_on("spare0"), 1);
    assert_eq!(tracker.commits.load(Ordering::SeqCst), 0);
    assert!(scratch_is_empty(dir.path()));
}

#[tokio::test]
async fn test_expired_credentials_refreshed_once() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let tracker = FakeTracker::new(6, 0);
    let network = FakeNetwork::new();
    let engine = engine(dir.path(), &tracker, &network);

    let source = dir.path().join("a.bin");
    let data = write_file(&source, 20 * KIB);

    tracker.expire_credentials();
    engine.upload_file(&source, "/").await.unwrap();
    assert_eq!(tracker.refreshes.load(Ordering::SeqCst), 1);

    tracker.expire_credentials();
    let dest = dir.path().join("b.bin");
    engine
        .download_file(ContentHash::compute(&data), data.len() as u64, &dest)
        .await
        .unwrap();
    assert_eq!(tracker.refreshes.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_matching_local_copy_is_not_downloaded() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let tracker = FakeTracker::new(6, 0);
    let network = FakeNetwork::new();
    let engine = engine(dir.path(), &tracker, &network);

    let source = dir.path().join("a.bin");
    let data = write_file(&source, 20 * KIB);
    let hash = ContentHash::compute(&data);
    engine.upload_file(&source, "/").await.unwrap();

    let dest = dir.path().join("b.bin");
    engine
        .download_file(hash, data.len() as u64, &dest)
        .await
        .unwrap();
    let retrieves = network.retrieves.load(Ordering::SeqCst);

    let outcome = engine
        .download_file(hash, data.len() as u64, &dest)
        .await
        .unwrap();
    assert_eq!(outcome, DownloadOutcome::AlreadyPresent);
    assert_eq!(network.retrieves.load(Ordering::SeqCst), retrieves);
}

#[tokio::test]
async fn test_slow_shard_is_abandoned() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let tracker = FakeTracker::new(6, 0);
    let network = FakeNetwork::new();
    let engine = engine(dir.path(), &tracker, &network);

    let source = dir.path().join("a.bin");
    let data = write_file(&source, 100 * KIB);
    let hash = ContentHash::compute(&data);
    engine.upload_file(&source, "/").await.unwrap();

    // Holder of the last parity shard stops responding
    network.hang("node5");
    let dest = dir.path().join("b.bin");
    let outcome = tokio::time::timeout(
        Duration::from_secs(10),
        engine.download_file(hash, data.len() as u64, &dest),
    )
    .await
    .expect("download waited on a straggler")
    .unwrap();
    assert_eq!(outcome, DownloadOutcome::ErasureCoded { partitions: 1 });
    assert_eq!(std::fs::read(&dest).unwrap(), data);
    assert!(scratch_is_empty(dir.path()));
}

#[tokio::test]
async fn test_directory_roundtrip() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let tracker = FakeTracker::new(8, 0);
    let network = FakeNetwork::new();
    let engine = engine(dir.path(), &tracker, &network);

    let album = dir.path().join("album");
    let files = [
        ("a.txt", 20 * KIB),
        ("sub/b.bin", 100 * KIB),
        ("sub/deeper/empty.txt", 0),
        ("sub/deeper/note.txt", KIB),
    ];
    let contents: Vec<_> = files
        .iter()
        .map(|(rel, size)| write_file(&album.join(rel), *size))
        .collect();

    let summary = engine.upload_dir(&album, "/").await.unwrap();
    assert_eq!(
        summary,
        DirSummary {
            files: 4,
            folders: 3
        }
    );
    let names: Vec<_> = tracker
        .listing("/album")
        .into_iter()
        .map(|e| (e.name, e.is_folder))
        .collect();
    assert_eq!(
        names,
        vec![("a.txt".to_string(), false), ("sub".to_string(), true)]
    );

    let restored = dir.path().join("restored");
    let summary = engine.download_dir("/album", &restored).await.unwrap();
    assert_eq!(
        summary,
        DirSummary {
            files: 4,
            folders: 3
        }
    );
    for ((rel, _), data) in files.iter().zip(&contents) {
        assert_eq!(&std::fs::read(restored.join(rel)).unwrap(), data, "{}", rel);
    }
}

#[tokio::test]
async fn test_failed_listing_starts_no_downloads() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let tracker = FakeTracker::new(8, 0);
    let network = FakeNetwork::new();
    let engine = engine(dir.path(), &tracker, &network);

    let album = dir.path().join("album");
    write_file(&album.join("a.txt"), 20 * KIB);
    write_file(&album.join("sub/b.bin"), 20 * KIB);
    engine.upload_dir(&album, "/").await.unwrap();

    tracker.fail_listing("/album/sub");
    let retrieves = network.retrieves.load(Ordering::SeqCst);
    let restored = dir.path().join("restored");
    let result = engine.download_dir("/album", &restored).await;
    assert!(matches!(result, Err(NebulaError::Tracker(_))));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(network.retrieves.load(Ordering::SeqCst), retrieves);
    assert!(!restored.join("a.txt").exists());
    assert!(scratch_is_empty(dir.path()));
}

#[tokio::test]
async fn test_shutdown_cancels_hung_upload() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let tracker = FakeTracker::new(6, 0);
    let network = FakeNetwork::new();
    for i in 0..6 {
        network.hang(&format!("node{}", i));
    }
    let engine = engine(dir.path(), &tracker, &network);

    let source = dir.path().join("a.bin");
    write_file(&source, 100 * KIB);

    let upload_returned = AtomicBool::new(false);
    let (result, returned_before_shutdown) =
        tokio::time::timeout(Duration::from_secs(10), async {
            tokio::join!(
                async {
                    let result = engine.upload_file(&source, "/").await;
                    upload_returned.store(true, Ordering::SeqCst);
                    result
                },
                async {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    engine.shutdown().await;
                    upload_returned.load(Ordering::SeqCst)
                }
            )
        })
        .await
        .expect("shutdown did not release hung transfers");

    assert!(matches!(result, Err(NebulaError::Cancelled)));
    assert!(returned_before_shutdown, "shutdown returned before the upload");
    assert!(engine.is_shutdown());
    assert_eq!(tracker.commits.load(Ordering::SeqCst), 0);
    assert!(scratch_is_empty(dir.path()));
    assert!(matches!(
        engine.upload_file(&source, "/").await,
        Err(NebulaError::Cancelled)
    ));
}

#[tokio::test]
async fn test_progress_events() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let tracker = FakeTracker::new(6, 0);
    let network = FakeNetwork::new();
    let (engine, mut events) =
        ClientEngine::with_events(test_config(dir.path()), tracker.clone(), network.clone())
            .unwrap();

    let source = dir.path().join("a.bin");
    write_file(&source, 20 * KIB);
    let key = source.to_string_lossy().into_owned();

    engine.upload_file(&source, "/").await.unwrap();
    assert_eq!(engine.get_progress(&[key.clone()])[&key], 1.0);
    assert!(engine.get_progress(&["unknown".to_string()]).is_empty());

    match events.recv().await.unwrap() {
        TransferEvent::Done {
            kind,
            key: done,
            error,
        } => {
            assert_eq!(kind, TransferKind::Upload);
            assert_eq!(done, key);
            assert!(error.is_none());
        }
        other => panic!("unexpected event {:?}", other),
    }

    let reporter = engine.spawn_progress_reporter().unwrap();
    let message = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match events.recv().await {
                Some(TransferEvent::Progress(m)) if m.key == key => return m,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .unwrap();
    assert!(message.done);
    assert_eq!(message.progress, 1.0);

    // Completion is reported once
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(engine.ledger().drain_unsent().iter().all(|m| m.key != key));

    engine.shutdown().await;
    reporter.await.unwrap();
}
