//! Importer: assigns dense monotonic event IDs and fans slices out.
//!
//! The importer owns the crash-recoverable ID block `[next, end)` persisted
//! in `current_id_block`. Every inbound slice gets a contiguous ID range
//! stamped into its offset and is then forwarded to all subscribers.
//! Subscriber channels are bounded, so a slow consumer backpressures the
//! importer and, through it, the readers.

pub mod reader;

use crate::data::Slice;
use crate::error::{Error, Result};
use crate::status::Verbosity;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};

/// ID block granularity: 8 Mi events.
pub const BLOCK_SIZE: u64 = 8 * (1 << 20);

/// Reserved sentinel; never assigned to an event.
pub const MAX_ID: u64 = u64::MAX;

pub const ID_BLOCK_FILE: &str = "current_id_block";

/// How much block state a write persists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteMode {
    /// Block boundary only, after issuing a new block.
    BoundaryOnly,
    /// Boundary plus position, on clean shutdown.
    WithNext,
}

/// The persistent ID block `[next, end)`.
#[derive(Debug)]
pub struct IdBlock {
    dir: PathBuf,
    next: u64,
    end: u64,
}

impl IdBlock {
    /// Reads (or initializes) the persisted block and advances the
    /// boundary by one block before any ID is handed out, so a crash
    /// cannot reuse IDs that were allocated but never committed.
    pub fn open(dir: &Path) -> Result<Self> {
        let path = dir.join(ID_BLOCK_FILE);
        let (end, next) = if path.exists() {
            let text = fs::read_to_string(&path)?;
            let mut parts = text.split_whitespace();
            let end: u64 = parts
                .next()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| {
                    Error::Parse(format!("unreadable id block file {}", path.display()))
                })?;
            match parts.next().and_then(|s| s.parse().ok()) {
                Some(next) => (end, next),
                None => {
                    tracing::warn!(
                        file = %path.display(),
                        "no next id in state file; irregular shutdown detected"
                    );
                    (end, end)
                }
            }
        } else {
            (0, 0)
        };
        let mut block = IdBlock {
            dir: dir.to_path_buf(),
            next,
            end,
        };
        block.end += BLOCK_SIZE;
        block.advance_block(0)?;
        Ok(block)
    }

    pub fn next(&self) -> u64 {
        self.next
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    pub fn available(&self) -> u64 {
        MAX_ID - self.next
    }

    /// First ID of a fresh contiguous range of length `k`.
    pub fn next_id(&mut self, k: u64) -> Result<u64> {
        if self.next + k >= self.end {
            self.advance_block(k)?;
        }
        let first = self.next;
        self.next += k;
        debug_assert!(self.next < self.end);
        Ok(first)
    }

    /// Grows the block until `next + required < end` and persists the new
    /// boundary before any ID from it is handed out.
    fn advance_block(&mut self, required: u64) -> Result<()> {
        while self.next + required >= self.end {
            self.end += BLOCK_SIZE;
        }
        self.write_state(WriteMode::BoundaryOnly)
    }

    fn write_state(&self, mode: WriteMode) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(ID_BLOCK_FILE);
        let mut file = fs::File::create(&path)?;
        match mode {
            WriteMode::BoundaryOnly => write!(file, "{}", self.end)?,
            WriteMode::WithNext => write!(file, "{} {}", self.end, self.next)?,
        }
        file.sync_all()?;
        tracing::debug!(
            end = self.end,
            next = self.next,
            with_next = mode == WriteMode::WithNext,
            "persisted id block"
        );
        Ok(())
    }

    /// Clean-shutdown write: persists both boundary and position.
    pub fn persist(&self) -> Result<()> {
        self.write_state(WriteMode::WithNext)
    }
}

/// Messages accepted by the importer task.
pub enum ImporterMsg {
    Ingest(Slice),
    Register(mpsc::Sender<Arc<Slice>>),
    RegisterIndex(crate::index::IndexHandle),
    SubscribeFlush {
        reply: oneshot::Sender<Result<oneshot::Receiver<()>>>,
    },
    Status {
        verbosity: Verbosity,
        reply: oneshot::Sender<serde_json::Value>,
    },
    Shutdown {
        reply: oneshot::Sender<Result<()>>,
    },
}

#[derive(Clone)]
pub struct ImporterHandle {
    tx: mpsc::Sender<ImporterMsg>,
}

impl ImporterHandle {
    /// Feeds one slice in; awaits channel credit when the importer is
    /// backed up.
    pub async fn ingest(&self, slice: Slice) -> Result<()> {
        self.tx
            .send(ImporterMsg::Ingest(slice))
            .await
            .map_err(|_| Error::Unspecified("importer is gone".into()))
    }

    /// Registers a downstream subscriber (index, archive, exporter).
    pub async fn register(&self, subscriber: mpsc::Sender<Arc<Slice>>) -> Result<()> {
        self.tx
            .send(ImporterMsg::Register(subscriber))
            .await
            .map_err(|_| Error::Unspecified("importer is gone".into()))
    }

    /// Remembers the index so that flush subscriptions can be delegated.
    pub async fn register_index(&self, index: crate::index::IndexHandle) -> Result<()> {
        self.tx
            .send(ImporterMsg::RegisterIndex(index))
            .await
            .map_err(|_| Error::Unspecified("importer is gone".into()))
    }

    /// Subscribes to flush notifications, delegated to the index.
    pub async fn subscribe_flush(&self) -> Result<oneshot::Receiver<()>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ImporterMsg::SubscribeFlush { reply })
            .await
            .map_err(|_| Error::Unspecified("importer is gone".into()))?;
        rx.await
            .map_err(|_| Error::Unspecified("importer dropped flush request".into()))?
    }

    pub async fn status(&self, verbosity: Verbosity) -> Result<serde_json::Value> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ImporterMsg::Status { verbosity, reply })
            .await
            .map_err(|_| Error::Unspecified("importer is gone".into()))?;
        rx.await
            .map_err(|_| Error::Unspecified("importer dropped status request".into()))
    }

    /// Clean shutdown: persists the full block state.
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ImporterMsg::Shutdown { reply })
            .await
            .map_err(|_| Error::Unspecified("importer is gone".into()))?;
        rx.await
            .map_err(|_| Error::Unspecified("importer dropped shutdown request".into()))?
    }
}

/// Throughput measurement between telemetry ticks.
#[derive(Debug, Default)]
struct Measurement {
    events: u64,
}

/// Consecutive batches that hit a full subscriber channel before the
/// congestion is logged once.
const CONGESTION_REPORTING_THRESHOLD: u64 = 100;

struct ImporterState {
    block: IdBlock,
    subscribers: Vec<mpsc::Sender<Arc<Slice>>>,
    index: Option<crate::index::IndexHandle>,
    measurement: Measurement,
    last_report: Instant,
    congested_batches: u64,
}

impl ImporterState {
    async fn stamp_and_forward(&mut self, mut slice: Slice) -> Result<()> {
        let events = slice.rows() as u64;
        debug_assert!(events <= self.block.available());
        slice.set_offset(self.block.next_id(events)?);
        let slice = Arc::new(slice);
        let mut congested = false;
        for subscriber in &self.subscribers {
            match subscriber.try_send(Arc::clone(&slice)) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(payload)) => {
                    congested = true;
                    // Block until the subscriber grants credit.
                    let _ = subscriber.send(payload).await;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    tracing::debug!("dropping slice for closed subscriber");
                }
            }
        }
        if congested {
            if self.congested_batches == CONGESTION_REPORTING_THRESHOLD {
                tracing::debug!("importer is currently congested downstream");
            }
            self.congested_batches += 1;
        } else {
            if self.congested_batches > CONGESTION_REPORTING_THRESHOLD {
                tracing::debug!(
                    batches = self.congested_batches,
                    "importer congestion resolved"
                );
            }
            self.congested_batches = 0;
        }
        self.measurement.events += events;
        Ok(())
    }

    fn send_report(&mut self) {
        let now = Instant::now();
        if self.measurement.events > 0 {
            let elapsed = now.duration_since(self.last_report);
            let rate = self.measurement.events as f64 / elapsed.as_secs_f64();
            if rate.is_finite() {
                tracing::debug!(
                    events = self.measurement.events,
                    elapsed_ms = elapsed.as_millis() as u64,
                    rate_per_sec = rate as u64,
                    "importer throughput"
                );
            }
            self.measurement = Measurement::default();
        }
        self.last_report = now;
    }

    fn status(&self, verbosity: Verbosity) -> serde_json::Value {
        let mut importer = serde_json::Map::new();
        if verbosity >= Verbosity::Detailed {
            // Stringified to survive signed 64-bit status transports.
            importer.insert(
                "ids.available".into(),
                self.block.available().to_string().into(),
            );
            importer.insert(
                "ids.block.next".into(),
                self.block.next().to_string().into(),
            );
            importer.insert(
                "ids.block.end".into(),
                self.block.end().to_string().into(),
            );
        }
        if verbosity >= Verbosity::Debug {
            importer.insert(
                "subscribers".into(),
                (self.subscribers.len() as u64).into(),
            );
        }
        serde_json::json!({ "importer": importer })
    }
}

/// Spawns the importer task. The returned handle is the only way in; the
/// task quits with an error if block persistence fails.
pub fn spawn(
    dir: &Path,
    telemetry_interval: Duration,
) -> Result<(ImporterHandle, tokio::task::JoinHandle<Result<()>>)> {
    let block = IdBlock::open(dir)?;
    let (tx, mut rx) = mpsc::channel::<ImporterMsg>(64);
    let mut state = ImporterState {
        block,
        subscribers: Vec::new(),
        index: None,
        measurement: Measurement::default(),
        last_report: Instant::now(),
        congested_batches: 0,
    };
    let task = tokio::spawn(async move {
        let mut telemetry = tokio::time::interval(telemetry_interval);
        telemetry.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                message = rx.recv() => match message {
                    Some(ImporterMsg::Ingest(slice)) => {
                        if let Err(err) = state.stamp_and_forward(slice).await {
                            // Block persistence failures are fatal.
                            tracing::error!(%err, "importer quits");
                            return Err(err);
                        }
                    }
                    Some(ImporterMsg::Register(subscriber)) => {
                        tracing::debug!("importer registers a new sink");
                        state.subscribers.push(subscriber);
                    }
                    Some(ImporterMsg::RegisterIndex(index)) => {
                        state.index = Some(index);
                    }
                    Some(ImporterMsg::SubscribeFlush { reply }) => {
                        let result = match &state.index {
                            Some(index) => index.subscribe_flush().await,
                            None => Err(Error::Unspecified(
                                "no index registered for flush subscriptions".into(),
                            )),
                        };
                        let _ = reply.send(result);
                    }
                    Some(ImporterMsg::Status { verbosity, reply }) => {
                        let _ = reply.send(state.status(verbosity));
                    }
                    Some(ImporterMsg::Shutdown { reply }) => {
                        state.send_report();
                        let result = state.block.persist();
                        let _ = reply.send(result);
                        return Ok(());
                    }
                    None => {
                        // All handles dropped: persist and stop.
                        state.send_report();
                        return state.block.persist();
                    }
                },
                _ = telemetry.tick() => state.send_report(),
            }
        }
    });
    Ok((ImporterHandle { tx }, task))
}
