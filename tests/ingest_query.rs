//! End-to-end ingest and query scenarios through the importer and index
//! actors.

mod common;

use common::*;
use spyglass::bitmap::Bitmap;
use spyglass::data::{Attribute, Field, Layout, Value, ValueType};
use spyglass::query::{Expr, RelOp};
use std::sync::Arc;
use std::time::Duration;

const SEC: i64 = 1_000_000_000;

fn eq_int(path: &str, v: i64) -> Expr {
    Expr::field(path, RelOp::Eq, Value::Int(v))
}

async fn spawn_pipeline(
    dir: &std::path::Path,
    partition_capacity: u64,
    taste_partitions: usize,
) -> (
    spyglass::importer::ImporterHandle,
    spyglass::index::IndexHandle,
) {
    let (importer, _) =
        spyglass::importer::spawn(dir, Duration::from_secs(60)).unwrap();
    let mut config = index_config(dir, partition_capacity);
    config.taste_partitions = taste_partitions;
    let (index, _) = spyglass::index::spawn(config).unwrap();
    importer.register(index.slice_sender()).await.unwrap();
    importer.register_index(index.clone()).await.unwrap();
    (importer, index)
}

#[tokio::test]
async fn ingest_and_lookup_integers() {
    let dir = tempfile::tempdir().unwrap();
    let (importer, index) = spawn_pipeline(dir.path(), 100, 5).await;
    let layout = int_layout();

    ingest(&importer, int_slice(&layout, &[1, 2, 3, 1, 2, 3, 1, 2, 3])).await;
    wait_for_rows(&index, "test", 9).await;

    let cases = [
        (1, vec![0u64, 3, 6]),
        (2, vec![1, 4, 7]),
        (3, vec![2, 5, 8]),
        (4, vec![]),
    ];
    for (value, expected) in cases {
        let hits = query_all(&index, eq_int("x", value)).await;
        let ones: Vec<u64> = hits.ones().collect();
        assert_eq!(ones, expected, "lookup(eq, {})", value);
    }
}

#[tokio::test]
async fn skip_attribute_suppresses_hits() {
    let dir = tempfile::tempdir().unwrap();
    let (importer, index) = spawn_pipeline(dir.path(), 100, 5).await;
    let layout = Arc::new(Layout::new(
        "test",
        vec![Field::new("x", ValueType::Int).with_attr(Attribute::new("skip"))],
    ));

    ingest(&importer, int_slice(&layout, &[1, 1, 1])).await;
    wait_for_rows(&index, "test", 3).await;

    let hits = query_all(&index, eq_int("x", 1)).await;
    assert_eq!(hits.count_ones(), 0);
}

#[tokio::test]
async fn address_lookup_across_slices() {
    let dir = tempfile::tempdir().unwrap();
    let (importer, index) = spawn_pipeline(dir.path(), 100, 5).await;
    let layout = conn_layout();

    // 20 connection rows; the needle address sits at 1, 3, 7, 14, 16.
    let needle = "192.168.1.103";
    let positions = [1u64, 3, 7, 14, 16];
    let mut rows: Vec<(i64, String, &str)> = (0..20)
        .map(|i| (i as i64 * SEC, format!("10.0.0.{}", i + 1), "tcp"))
        .collect();
    for &pos in &positions {
        rows[pos as usize].1 = needle.to_string();
    }
    // Split into three slices to cross slice boundaries.
    for chunk in rows.chunks(7) {
        let borrowed: Vec<(i64, &str, &str)> = chunk
            .iter()
            .map(|(ts, addr, proto)| (*ts, addr.as_str(), *proto))
            .collect();
        ingest(&importer, conn_slice(&layout, &borrowed)).await;
    }
    wait_for_rows(&index, "conn", 20).await;

    let expr = Expr::field(
        "id.orig_h",
        RelOp::Eq,
        Value::Addr(needle.parse().unwrap()),
    );
    let hits = query_all(&index, expr).await;
    let ones: Vec<u64> = hits.ones().collect();
    assert_eq!(ones, positions);
}

#[tokio::test]
async fn taste_and_more_over_sealed_partitions() {
    let dir = tempfile::tempdir().unwrap();
    // Partitions of three rows, initial taste of one.
    let (importer, index) = spawn_pipeline(dir.path(), 3, 1).await;
    let layout = int_layout();

    for _ in 0..3 {
        ingest(&importer, int_slice(&layout, &[1, 2, 3])).await;
    }
    wait_for_rows(&index, "test", 9).await;

    let mut response = index.query(eq_int("x", 1)).await.unwrap();
    assert_eq!(response.total, 3);
    assert_eq!(response.scheduled, 1);
    assert!(!response.id.is_nil());

    let mut acc = Bitmap::new();
    let (_, first) = response.hits.recv().await.unwrap();
    acc = &acc | &first;
    index.more(response.id, 2).await.unwrap();
    for _ in 0..2 {
        let (_, hits) = response.hits.recv().await.unwrap();
        acc = &acc | &hits;
    }
    let ones: Vec<u64> = acc.ones().collect();
    assert_eq!(ones, vec![0, 3, 6]);
}

#[tokio::test]
async fn partition_hit_bitmaps_are_disjoint() {
    let dir = tempfile::tempdir().unwrap();
    let (importer, index) = spawn_pipeline(dir.path(), 3, 5).await;
    let layout = int_layout();

    for _ in 0..3 {
        ingest(&importer, int_slice(&layout, &[7, 7, 7])).await;
    }
    wait_for_rows(&index, "test", 9).await;

    let mut response = index.query(eq_int("x", 7)).await.unwrap();
    let mut batches = Vec::new();
    for _ in 0..response.total {
        let (uuid, hits) = response.hits.recv().await.unwrap();
        batches.push((uuid, hits));
    }
    // Every partition produced hits in its own disjoint ID range.
    for (i, (_, a)) in batches.iter().enumerate() {
        for (_, b) in batches.iter().skip(i + 1) {
            assert_eq!((a & b).count_ones(), 0);
        }
    }
    let total: u64 = batches.iter().map(|(_, b)| b.count_ones()).sum();
    assert_eq!(total, 9);
}

#[tokio::test]
async fn cancellation_drops_remaining_results() {
    let dir = tempfile::tempdir().unwrap();
    let (importer, index) = spawn_pipeline(dir.path(), 3, 1).await;
    let layout = int_layout();

    for _ in 0..3 {
        ingest(&importer, int_slice(&layout, &[5, 5, 5])).await;
    }
    wait_for_rows(&index, "test", 9).await;

    let mut response = index.query(eq_int("x", 5)).await.unwrap();
    assert_eq!(response.scheduled, 1);
    let first = response.hits.recv().await;
    assert!(first.is_some());

    // Zero partitions requested: the client drops the rest.
    index.more(response.id, 0).await.unwrap();
    assert!(response.hits.recv().await.is_none());
}

#[tokio::test]
async fn synopsis_pruning_skips_partitions() {
    let dir = tempfile::tempdir().unwrap();
    let (importer, index) = spawn_pipeline(dir.path(), 3, 5).await;
    let layout = conn_layout();

    // First partition covers 4s..=6s, second 14s..=16s.
    for base in [4i64, 14] {
        let rows: Vec<(i64, &str, &str)> = (0..3)
            .map(|i| ((base + i) * SEC, "10.0.0.1", "udp"))
            .collect();
        ingest(&importer, conn_slice(&layout, &rows)).await;
    }
    wait_for_rows(&index, "conn", 6).await;

    let late = Expr::field("ts", RelOp::Gt, Value::Time(10 * SEC));
    let response = index.query(late.clone()).await.unwrap();
    assert_eq!(response.total, 1, "early partition must be pruned");

    let hits = query_all(&index, late).await;
    let ones: Vec<u64> = hits.ones().collect();
    assert_eq!(ones, vec![3, 4, 5]);

    let never = Expr::field("ts", RelOp::Lt, Value::Time(0));
    let response = index.query(never).await.unwrap();
    assert_eq!(response.total, 0);
}

#[tokio::test]
async fn type_clash_returns_partial_results() {
    let dir = tempfile::tempdir().unwrap();
    let (importer, index) = spawn_pipeline(dir.path(), 100, 5).await;
    let layout = conn_layout();

    let rows = [(SEC, "10.0.0.1", "tcp"), (2 * SEC, "10.0.0.2", "udp")];
    ingest(&importer, conn_slice(&layout, &rows)).await;
    wait_for_rows(&index, "conn", 2).await;

    // The int predicate clashes with every column; the string side still
    // answers.
    let expr = Expr::or(vec![
        Expr::pred(
            spyglass::query::Extractor::Type(ValueType::Int),
            RelOp::Eq,
            Value::Int(1),
        ),
        Expr::field("proto", RelOp::Eq, Value::Str("udp".into())),
    ]);
    let hits = query_all(&index, expr).await;
    let ones: Vec<u64> = hits.ones().collect();
    assert_eq!(ones, vec![1]);
}

#[tokio::test]
async fn status_reports_pipeline_state() {
    let dir = tempfile::tempdir().unwrap();
    let (importer, index) = spawn_pipeline(dir.path(), 100, 5).await;
    let layout = int_layout();

    ingest(&importer, int_slice(&layout, &[1, 2, 3])).await;
    wait_for_rows(&index, "test", 3).await;

    let status = index.status(spyglass::status::Verbosity::Debug).await.unwrap();
    let index_status = &status["index"];
    assert_eq!(
        index_status["statistics"]["layouts"]["test"]["count"].as_u64(),
        Some(3)
    );
    assert_eq!(index_status["workers.total"].as_u64(), Some(2));
    assert!(index_status["partitions"]["active"]["rows"].as_u64() == Some(3));

    let importer_status = importer
        .status(spyglass::status::Verbosity::Detailed)
        .await
        .unwrap();
    assert_eq!(
        importer_status["importer"]["ids.block.next"].as_str(),
        Some("3")
    );
}

#[tokio::test]
async fn glob_match_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let (importer, index) = spawn_pipeline(dir.path(), 100, 5).await;
    let layout = conn_layout();

    let rows = [
        (SEC, "10.0.0.1", "tcp"),
        (2 * SEC, "10.0.0.2", "udp"),
        (3 * SEC, "10.0.0.3", "tls"),
    ];
    ingest(&importer, conn_slice(&layout, &rows)).await;
    wait_for_rows(&index, "conn", 3).await;

    let expr = Expr::field("proto", RelOp::Match, Value::Str("t*".into()));
    let hits = query_all(&index, expr).await;
    let ones: Vec<u64> = hits.ones().collect();
    assert_eq!(ones, vec![0, 2]);

    // Negated match evaluates as the complement.
    let expr = Expr::negate(Expr::field(
        "proto",
        RelOp::Match,
        Value::Str("t*".into()),
    ));
    let hits = query_all(&index, expr).await;
    let ones: Vec<u64> = hits.ones().collect();
    assert_eq!(ones, vec![1]);
}

#[tokio::test]
async fn flush_subscription_fires_after_seal() {
    let dir = tempfile::tempdir().unwrap();
    let (importer, index) = spawn_pipeline(dir.path(), 3, 5).await;
    let layout = int_layout();

    ingest(&importer, int_slice(&layout, &[1, 2, 3])).await;
    wait_for_rows(&index, "test", 3).await;

    // The importer delegates flush subscriptions to the index.
    let listener = importer.subscribe_flush().await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), listener)
        .await
        .expect("flush notification timed out")
        .unwrap();
    assert!(dir.path().join("index.bin").exists());
}
