//! Reader interface: the seam between format parsers and the importer.
//!
//! Parsers (syslog, connection logs, synthetic data) live outside this
//! crate and implement [`Reader`]; the pump drives one reader and feeds
//! its slices into the importer until the input ends or an event cap is
//! reached.

use super::ImporterHandle;
use crate::data::{Layout, Slice};
use crate::error::{Error, Result};
use std::sync::Arc;

/// Outcome of one read call that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// At least one slice was produced.
    Ok,
    /// The input is exhausted.
    EndOfInput,
    /// The batch timeout elapsed with at least one event produced.
    Timeout,
}

pub trait Reader: Send {
    fn name(&self) -> &str;

    /// The layouts this reader produces.
    fn schema(&self) -> Vec<Arc<Layout>>;

    /// Replaces the reader's schema, e.g. with user-provided layouts.
    fn set_schema(&mut self, layouts: Vec<Arc<Layout>>) -> Result<()>;

    /// Produces up to `max_events` events as slices of at most
    /// `max_slice_size` rows, handing each to `consumer`. Returns after
    /// at least one slice or after the reader's batch timeout.
    fn read(
        &mut self,
        max_events: usize,
        max_slice_size: usize,
        consumer: &mut dyn FnMut(Slice),
    ) -> Result<ReadOutcome>;

    /// Rebinds the reader to a new input stream.
    fn reset(&mut self, input: Box<dyn std::io::Read + Send>);
}

/// Batch size the pump requests per read call.
const READ_BATCH: usize = 65_536;

/// Rows per slice the pump asks readers for.
const SLICE_SIZE: usize = 4_096;

/// Drives a reader into the importer. `max_events = 0` means unlimited.
pub async fn pump(
    mut reader: Box<dyn Reader>,
    importer: ImporterHandle,
    max_events: u64,
) -> Result<u64> {
    let mut produced = 0u64;
    loop {
        let budget = if max_events == 0 {
            READ_BATCH
        } else {
            let remaining = max_events.saturating_sub(produced);
            if remaining == 0 {
                tracing::info!(reader = reader.name(), produced, "event cap reached");
                return Ok(produced);
            }
            remaining.min(READ_BATCH as u64) as usize
        };
        let mut batch = Vec::new();
        let outcome = reader.read(budget, SLICE_SIZE, &mut |slice| {
            batch.push(slice);
        });
        for slice in batch {
            produced += slice.rows() as u64;
            importer.ingest(slice).await?;
        }
        match outcome {
            Ok(ReadOutcome::Ok) | Ok(ReadOutcome::Timeout) => continue,
            Ok(ReadOutcome::EndOfInput) => {
                tracing::info!(reader = reader.name(), produced, "input exhausted");
                return Ok(produced);
            }
            Err(err @ Error::Format(_)) => {
                tracing::warn!(reader = reader.name(), %err, "reader failed");
                return Err(err);
            }
            Err(err) => return Err(err),
        }
    }
}
