//! Spyglass: a telemetry search engine.
//!
//! Structured security and network event records stream in through the
//! importer, which stamps them with dense monotonic event IDs from a
//! crash-recoverable ID block. The index organizes them into
//! column-oriented partitions backed by per-column bitmap indexes and
//! persists sealed partitions to disk. Queries are expression trees:
//! candidate partitions are pruned via per-column synopses, then each
//! surviving partition is evaluated by intersecting bitmaps, yielding the
//! matching event IDs.
//!
//! # Example
//!
//! ```no_run
//! use spyglass::data::{Field, Layout, SliceBuilder, Value, ValueType};
//! use spyglass::index::{self, IndexConfig};
//! use spyglass::query::{Expr, RelOp};
//! use std::sync::Arc;
//!
//! # async fn run() -> spyglass::error::Result<()> {
//! let (index, _task) = index::spawn(IndexConfig {
//!     dir: "spyglass.db".into(),
//!     partition_capacity: 1 << 20,
//!     max_inmem_partitions: 10,
//!     taste_partitions: 5,
//!     num_workers: 4,
//!     delay_flush_until_shutdown: false,
//! })?;
//!
//! let layout = Arc::new(Layout::new(
//!     "conn",
//!     vec![Field::new("id.orig_h", ValueType::Addr)],
//! ));
//! let mut builder = SliceBuilder::new(Arc::clone(&layout));
//! builder.push_row(vec![Value::Addr("192.168.1.103".parse().unwrap())])?;
//! index.slice_sender().send(Arc::new(builder.finish())).await.ok();
//!
//! let expr = Expr::field(
//!     "id.orig_h",
//!     RelOp::Eq,
//!     Value::Addr("192.168.1.103".parse().unwrap()),
//! );
//! let mut response = index.query(expr).await?;
//! while let Some((partition, hits)) = response.hits.recv().await {
//!     println!("{}: {}", partition, hits);
//! }
//! # Ok(())
//! # }
//! ```

pub mod bitmap;
pub mod config;
pub mod data;
pub mod error;
pub mod importer;
pub mod index;
pub mod query;
pub mod status;
pub mod vindex;

pub use bitmap::Bitmap;
pub use config::Config;
pub use data::{Layout, Slice, Value, ValueType};
pub use error::{Error, Result};
pub use query::{Expr, RelOp};
