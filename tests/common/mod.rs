//! Shared helpers for end-to-end tests.
#![allow(dead_code)]

use spyglass::bitmap::Bitmap;
use spyglass::data::{Attribute, Field, Layout, Slice, SliceBuilder, Value, ValueType};
use spyglass::importer::ImporterHandle;
use spyglass::index::{IndexConfig, IndexHandle, QueryResponse};
use spyglass::query::Expr;
use spyglass::status::Verbosity;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub fn index_config(dir: &Path, partition_capacity: u64) -> IndexConfig {
    IndexConfig {
        dir: dir.to_path_buf(),
        partition_capacity,
        max_inmem_partitions: 10,
        taste_partitions: 5,
        num_workers: 2,
        delay_flush_until_shutdown: false,
    }
}

pub fn int_layout() -> Arc<Layout> {
    Arc::new(Layout::new(
        "test",
        vec![Field::new("x", ValueType::Int)],
    ))
}

pub fn conn_layout() -> Arc<Layout> {
    Arc::new(Layout::new(
        "conn",
        vec![
            Field::new("ts", ValueType::Time)
                .with_attr(Attribute::new("timestamp")),
            Field::new("id.orig_h", ValueType::Addr),
            Field::new("proto", ValueType::String),
        ],
    ))
}

pub fn int_slice(layout: &Arc<Layout>, values: &[i64]) -> Slice {
    let mut builder = SliceBuilder::new(Arc::clone(layout));
    for &v in values {
        builder.push_row(vec![Value::Int(v)]).unwrap();
    }
    builder.finish()
}

pub fn conn_slice(layout: &Arc<Layout>, rows: &[(i64, &str, &str)]) -> Slice {
    let mut builder = SliceBuilder::new(Arc::clone(layout));
    for (ts, addr, proto) in rows {
        builder
            .push_row(vec![
                Value::Time(*ts),
                Value::Addr(addr.parse().unwrap()),
                Value::Str(proto.to_string()),
            ])
            .unwrap();
    }
    builder.finish()
}

/// Polls the index status until the layout has ingested `rows` rows.
pub async fn wait_for_rows(index: &IndexHandle, layout: &str, rows: u64) {
    for _ in 0..500 {
        let status = index.status(Verbosity::Detailed).await.unwrap();
        let count = status["index"]["statistics"]["layouts"][layout]["count"]
            .as_u64()
            .unwrap_or(0);
        if count >= rows {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("layout {} never reached {} rows", layout, rows);
}

/// Feeds a slice through the importer and lets the pipeline settle.
pub async fn ingest(importer: &ImporterHandle, slice: Slice) {
    importer.ingest(slice).await.unwrap();
}

/// Drives a query to completion, requesting the remaining partitions in
/// batches of two, and unions every hit bitmap.
pub async fn query_all(index: &IndexHandle, expr: Expr) -> Bitmap {
    let mut response: QueryResponse = index.query(expr).await.unwrap();
    let mut acc = Bitmap::new();
    let mut received = 0u32;
    let mut outstanding = response.scheduled;
    loop {
        if outstanding == 0 {
            if response.id.is_nil() || received >= response.total {
                break;
            }
            let batch = (response.total - received).min(2);
            index.more(response.id, batch).await.unwrap();
            outstanding = batch;
        }
        match response.hits.recv().await {
            Some((_, hits)) => {
                acc = &acc | &hits;
                received += 1;
                outstanding = outstanding.saturating_sub(1);
            }
            None => break,
        }
    }
    acc
}
