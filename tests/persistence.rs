//! Durability scenarios: partition round-trips across restarts, crash-safe
//! ID allocation, corruption handling, and flush policies.

mod common;

use common::*;
use spyglass::data::Value;
use spyglass::importer::BLOCK_SIZE;
use spyglass::query::{Expr, RelOp};
use spyglass::status::Verbosity;
use std::time::Duration;

fn eq_int(v: i64) -> Expr {
    Expr::field("x", RelOp::Eq, Value::Int(v))
}

#[tokio::test]
async fn partitions_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let layout = int_layout();

    {
        let (importer, _) =
            spyglass::importer::spawn(dir.path(), Duration::from_secs(60)).unwrap();
        let (index, index_task) =
            spyglass::index::spawn(index_config(dir.path(), 9)).unwrap();
        importer.register(index.slice_sender()).await.unwrap();

        ingest(&importer, int_slice(&layout, &[1, 2, 3, 1, 2, 3, 1, 2, 3])).await;
        wait_for_rows(&index, "test", 9).await;
        let listener = index.subscribe_flush().await.unwrap();
        listener.await.unwrap();

        importer.shutdown().await.unwrap();
        index.shutdown().await.unwrap();
        index_task.await.unwrap().unwrap();
    }

    // Fresh index over the same directory: lookups must be identical.
    let (index, _) = spyglass::index::spawn(index_config(dir.path(), 9)).unwrap();
    for (value, expected) in [(1, vec![0u64, 3, 6]), (2, vec![1, 4, 7]), (4, vec![])] {
        let hits = query_all(&index, eq_int(value)).await;
        let ones: Vec<u64> = hits.ones().collect();
        assert_eq!(ones, expected, "lookup(eq, {}) after reload", value);
    }
    // A second pass hits the partition cache instead of disk.
    let hits = query_all(&index, eq_int(3)).await;
    assert_eq!(hits.ones().collect::<Vec<u64>>(), vec![2, 5, 8]);
}

#[tokio::test]
async fn meta_index_rebuilds_from_partition_headers() {
    let dir = tempfile::tempdir().unwrap();
    let layout = int_layout();

    {
        let (importer, _) =
            spyglass::importer::spawn(dir.path(), Duration::from_secs(60)).unwrap();
        let (index, _) = spyglass::index::spawn(index_config(dir.path(), 3)).unwrap();
        importer.register(index.slice_sender()).await.unwrap();
        ingest(&importer, int_slice(&layout, &[4, 5, 6])).await;
        wait_for_rows(&index, "test", 3).await;
        let listener = index.subscribe_flush().await.unwrap();
        listener.await.unwrap();
        importer.shutdown().await.unwrap();
        index.shutdown().await.unwrap();
    }

    // Simulate an unclean shutdown that lost the index descriptor.
    std::fs::remove_file(dir.path().join("index.bin")).unwrap();

    let (index, _) = spyglass::index::spawn(index_config(dir.path(), 3)).unwrap();
    let hits = query_all(&index, eq_int(5)).await;
    assert_eq!(hits.ones().collect::<Vec<u64>>(), vec![1]);
}

#[tokio::test]
async fn crashed_importer_never_reuses_ids() {
    let dir = tempfile::tempdir().unwrap();
    let layout = int_layout();

    let (importer, task) =
        spyglass::importer::spawn(dir.path(), Duration::from_secs(60)).unwrap();
    let (sub_tx, mut sub_rx) = tokio::sync::mpsc::channel(8);
    importer.register(sub_tx).await.unwrap();
    ingest(&importer, int_slice(&layout, &[1, 2, 3])).await;
    let stamped = sub_rx.recv().await.unwrap();
    assert_eq!(stamped.offset(), 0);
    // Hard kill: no clean-shutdown write of `next`.
    task.abort();
    let _ = task.await;
    drop(importer);

    let (importer, _) =
        spyglass::importer::spawn(dir.path(), Duration::from_secs(60)).unwrap();
    let (sub_tx, mut sub_rx) = tokio::sync::mpsc::channel(8);
    importer.register(sub_tx).await.unwrap();
    ingest(&importer, int_slice(&layout, &[4])).await;
    let stamped = sub_rx.recv().await.unwrap();
    // The whole first block is discarded; IDs resume at its boundary.
    assert_eq!(stamped.offset(), BLOCK_SIZE);

    let status = importer.status(Verbosity::Detailed).await.unwrap();
    assert_eq!(
        status["importer"]["ids.block.next"].as_str().unwrap(),
        (BLOCK_SIZE + 1).to_string()
    );
}

#[tokio::test]
async fn delay_flush_until_shutdown_suppresses_periodic_writes() {
    let dir = tempfile::tempdir().unwrap();
    let layout = int_layout();

    let (importer, _) =
        spyglass::importer::spawn(dir.path(), Duration::from_secs(60)).unwrap();
    let mut config = index_config(dir.path(), 3);
    config.delay_flush_until_shutdown = true;
    let (index, index_task) = spyglass::index::spawn(config).unwrap();
    importer.register(index.slice_sender()).await.unwrap();

    ingest(&importer, int_slice(&layout, &[1, 2, 3])).await;
    wait_for_rows(&index, "test", 3).await;
    let listener = index.subscribe_flush().await.unwrap();
    listener.await.unwrap();
    // The partition is on disk, the descriptor is not.
    assert!(!dir.path().join("index.bin").exists());

    index.shutdown().await.unwrap();
    index_task.await.unwrap().unwrap();
    assert!(dir.path().join("index.bin").exists());
}

#[tokio::test]
async fn corrupted_partition_drops_out_of_queries() {
    let dir = tempfile::tempdir().unwrap();
    let layout = int_layout();
    let mut sealed = Vec::new();

    {
        let (importer, _) =
            spyglass::importer::spawn(dir.path(), Duration::from_secs(60)).unwrap();
        let (index, _) = spyglass::index::spawn(index_config(dir.path(), 3)).unwrap();
        importer.register(index.slice_sender()).await.unwrap();
        // Two sealed partitions with the same values.
        for _ in 0..2 {
            ingest(&importer, int_slice(&layout, &[9, 8, 9])).await;
        }
        wait_for_rows(&index, "test", 6).await;
        let listener = index.subscribe_flush().await.unwrap();
        listener.await.unwrap();
        importer.shutdown().await.unwrap();
        index.shutdown().await.unwrap();
    }

    for entry in std::fs::read_dir(dir.path()).unwrap() {
        let entry = entry.unwrap();
        if entry.path().is_dir() {
            sealed.push(entry.path());
        }
    }
    assert_eq!(sealed.len(), 2);
    // Wreck one partition's column file.
    std::fs::write(sealed[0].join("0.col"), b"garbage").unwrap();

    let (index, _) = spyglass::index::spawn(index_config(dir.path(), 3)).unwrap();
    let response = index.query(eq_int(9)).await.unwrap();
    // Both partitions qualify; only the intact one can answer.
    assert_eq!(response.total, 2);
    let hits = query_all(&index, eq_int(9)).await;
    assert_eq!(hits.count_ones(), 2);
}

#[tokio::test]
async fn lru_cache_reloads_evicted_partitions() {
    let dir = tempfile::tempdir().unwrap();
    let layout = int_layout();

    {
        let (importer, _) =
            spyglass::importer::spawn(dir.path(), Duration::from_secs(60)).unwrap();
        let (index, _) = spyglass::index::spawn(index_config(dir.path(), 2)).unwrap();
        importer.register(index.slice_sender()).await.unwrap();
        for v in [10i64, 20, 30] {
            ingest(&importer, int_slice(&layout, &[v, v])).await;
        }
        wait_for_rows(&index, "test", 6).await;
        let listener = index.subscribe_flush().await.unwrap();
        listener.await.unwrap();
        importer.shutdown().await.unwrap();
        index.shutdown().await.unwrap();
    }

    // A cache of one forces load-evict-reload churn across queries.
    let mut config = index_config(dir.path(), 2);
    config.max_inmem_partitions = 1;
    let (index, _) = spyglass::index::spawn(config).unwrap();
    for (value, expected) in [(10i64, vec![0u64, 1]), (20, vec![2, 3]), (30, vec![4, 5])]
    {
        let hits = query_all(&index, eq_int(value)).await;
        assert_eq!(hits.ones().collect::<Vec<u64>>(), expected);
    }
    // Revisit the first partition after eviction.
    let hits = query_all(&index, eq_int(10)).await;
    assert_eq!(hits.ones().collect::<Vec<u64>>(), vec![0, 1]);
}
