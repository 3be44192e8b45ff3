//! The index actor: partition lifecycle and query dispatch.
//!
//! Slices stream in from the importer and land in the single active
//! partition; a full partition seals, persists asynchronously, and is
//! replaced. Sealed-and-persisted partitions are loadable through an LRU
//! cache. Queries are pruned against the meta-index, then evaluated one
//! partition at a time by evaluator tasks gated on a bounded worker pool.

pub mod cache;
pub mod column;
pub mod meta;
pub mod partition;
pub mod synopsis;

use crate::bitmap::Bitmap;
use crate::data::Slice;
use crate::error::{Error, Result};
use crate::query::expr::Expr;
use crate::status::Verbosity;
use cache::{PartitionCache, PartitionHandle};
use meta::{MetaIndex, PartitionSynopsis};
use parking_lot::RwLock;
use partition::Partition;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinSet;
use uuid::Uuid;

pub const INDEX_VERSION: u32 = 1;
pub const INDEX_FILE: &str = "index.bin";

/// Capacity of the slice channel from the importer; this is the credit
/// the index grants upstream.
const SLICE_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct IndexConfig {
    pub dir: PathBuf,
    pub partition_capacity: u64,
    pub max_inmem_partitions: usize,
    pub taste_partitions: usize,
    pub num_workers: usize,
    pub delay_flush_until_shutdown: bool,
}

/// First reply to a query: identity, candidate count, and the stream of
/// per-partition hit bitmaps over the global event ID space. The nil
/// query ID means everything was scheduled up front and no `more` call
/// is needed.
pub struct QueryResponse {
    pub id: Uuid,
    pub total: u32,
    pub scheduled: u32,
    pub hits: mpsc::Receiver<(Uuid, Bitmap)>,
}

enum IndexMsg {
    Query {
        expr: Expr,
        reply: oneshot::Sender<QueryResponse>,
    },
    More {
        query_id: Uuid,
        count: u32,
    },
    SubscribeFlush {
        listener: oneshot::Sender<()>,
    },
    Status {
        verbosity: Verbosity,
        reply: oneshot::Sender<serde_json::Value>,
    },
    Flush {
        reply: oneshot::Sender<Result<()>>,
    },
    Shutdown {
        reply: oneshot::Sender<Result<()>>,
    },
}

#[derive(Clone)]
pub struct IndexHandle {
    control: mpsc::Sender<IndexMsg>,
    slices: mpsc::Sender<Arc<Slice>>,
}

impl IndexHandle {
    /// The inbound slice channel, for registration with the importer.
    pub fn slice_sender(&self) -> mpsc::Sender<Arc<Slice>> {
        self.slices.clone()
    }

    pub async fn query(&self, expr: Expr) -> Result<QueryResponse> {
        let (reply, rx) = oneshot::channel();
        self.control
            .send(IndexMsg::Query { expr, reply })
            .await
            .map_err(|_| Error::Unspecified("index is gone".into()))?;
        rx.await
            .map_err(|_| Error::Unspecified("index dropped query".into()))
    }

    /// Requests `count` more partitions for a pending query; zero cancels
    /// the remainder.
    pub async fn more(&self, query_id: Uuid, count: u32) -> Result<()> {
        self.control
            .send(IndexMsg::More { query_id, count })
            .await
            .map_err(|_| Error::Unspecified("index is gone".into()))
    }

    /// Resolves once every sealed partition has reached disk.
    pub async fn subscribe_flush(&self) -> Result<oneshot::Receiver<()>> {
        let (listener, rx) = oneshot::channel();
        self.control
            .send(IndexMsg::SubscribeFlush { listener })
            .await
            .map_err(|_| Error::Unspecified("index is gone".into()))?;
        Ok(rx)
    }

    pub async fn status(&self, verbosity: Verbosity) -> Result<serde_json::Value> {
        let (reply, rx) = oneshot::channel();
        self.control
            .send(IndexMsg::Status { verbosity, reply })
            .await
            .map_err(|_| Error::Unspecified("index is gone".into()))?;
        rx.await
            .map_err(|_| Error::Unspecified("index dropped status request".into()))
    }

    pub async fn flush(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.control
            .send(IndexMsg::Flush { reply })
            .await
            .map_err(|_| Error::Unspecified("index is gone".into()))?;
        rx.await
            .map_err(|_| Error::Unspecified("index dropped flush request".into()))?
    }

    /// Seals and persists the active partition, writes the descriptor,
    /// and stops the task.
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.control
            .send(IndexMsg::Shutdown { reply })
            .await
            .map_err(|_| Error::Unspecified("index is gone".into()))?;
        rx.await
            .map_err(|_| Error::Unspecified("index dropped shutdown request".into()))?
    }
}

struct PendingQuery {
    expr: Expr,
    remaining: Vec<Uuid>,
    hits: mpsc::Sender<(Uuid, Bitmap)>,
}

struct IndexState {
    config: IndexConfig,
    active: Option<PartitionHandle>,
    unpersisted: HashMap<Uuid, PartitionHandle>,
    passive_cache: PartitionCache,
    persisted_partitions: BTreeSet<Uuid>,
    meta: MetaIndex,
    pending: HashMap<Uuid, PendingQuery>,
    workers: Arc<Semaphore>,
    flush_listeners: Vec<oneshot::Sender<()>>,
    /// Rows ingested per layout name.
    layout_stats: BTreeMap<String, u64>,
    last_flush_error: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct IndexDescriptor {
    version: u32,
    partitions: Vec<Uuid>,
    meta: MetaIndex,
    layouts: BTreeMap<String, u64>,
}

impl IndexState {
    /// Reads the descriptor and reconstructs the meta-index from the
    /// partition headers on disk.
    fn load_from_disk(config: &IndexConfig) -> Result<(MetaIndex, BTreeSet<Uuid>, BTreeMap<String, u64>)> {
        let mut meta = MetaIndex::new();
        let mut persisted = BTreeSet::new();
        let mut layout_stats = BTreeMap::new();
        let index_file = config.dir.join(INDEX_FILE);
        if index_file.exists() {
            let bytes = fs::read(&index_file)?;
            let descriptor: IndexDescriptor = serde_json::from_slice(&bytes)
                .map_err(|e| Error::corruption(format!("index descriptor: {}", e)))?;
            if descriptor.version != INDEX_VERSION {
                return Err(Error::corruption(format!(
                    "index format version {} unsupported (expected {})",
                    descriptor.version, INDEX_VERSION
                )));
            }
            layout_stats = descriptor.layouts;
            for uuid in descriptor.partitions {
                if !config.dir.join(uuid.to_string()).exists() {
                    tracing::warn!(
                        partition = %uuid,
                        "partition in the index state but not on disk; possibly an unclean shutdown"
                    );
                }
            }
        } else if config.dir.exists() {
            tracing::info!(dir = %config.dir.display(), "no index state found, starting fresh");
        }
        // The partition headers are the source of truth for the
        // meta-index.
        if config.dir.exists() {
            for entry in fs::read_dir(&config.dir)? {
                let entry = entry?;
                let Ok(uuid) = entry.file_name().to_string_lossy().parse::<Uuid>()
                else {
                    continue;
                };
                match Partition::load_header(&entry.path(), uuid) {
                    Ok((synopsis, rows)) => {
                        tracing::debug!(partition = %uuid, rows, "recovered partition header");
                        meta.update(uuid, synopsis);
                        persisted.insert(uuid);
                    }
                    Err(err) => {
                        tracing::warn!(partition = %uuid, %err, "skipping unreadable partition");
                    }
                }
            }
        }
        Ok((meta, persisted, layout_stats))
    }

    fn create_active(&mut self, capacity: u64) -> PartitionHandle {
        let uuid = Uuid::new_v4();
        tracing::debug!(partition = %uuid, capacity, "created new active partition");
        let handle = Arc::new(RwLock::new(Partition::new(uuid, capacity)));
        self.active = Some(Arc::clone(&handle));
        handle
    }

    /// Routes one slice into the active partition, sealing and replacing
    /// it when full.
    fn ingest(&mut self, slice: &Slice, persists: &mut JoinSet<(Uuid, Result<()>)>) -> Result<()> {
        let rows = slice.rows() as u64;
        *self
            .layout_stats
            .entry(slice.layout().name.clone())
            .or_insert(0) += rows;
        let needs_fresh = match &self.active {
            Some(handle) => handle.read().remaining_capacity() < rows,
            None => true,
        };
        if needs_fresh {
            if self.active.is_some() {
                self.seal_active(persists);
            }
            let capacity = self.config.partition_capacity.max(rows);
            if rows > self.config.partition_capacity {
                tracing::warn!(
                    rows,
                    capacity = self.config.partition_capacity,
                    "slice exceeds the configured partition capacity"
                );
            }
            self.create_active(capacity);
        }
        let handle = self.active.as_ref().expect("active partition").clone();
        {
            let mut active = handle.write();
            active.register_layout(Arc::clone(slice.layout()))?;
            active.add(slice)?;
            self.meta
                .update(active.uuid(), PartitionSynopsis::of(&active));
        }
        let full = handle.read().remaining_capacity() == 0;
        if full {
            self.seal_active(persists);
        }
        Ok(())
    }

    /// Seals the active partition and starts its persist task.
    fn seal_active(&mut self, persists: &mut JoinSet<(Uuid, Result<()>)>) {
        let Some(handle) = self.active.take() else {
            return;
        };
        let uuid = {
            let mut partition = handle.write();
            partition.seal();
            partition.uuid()
        };
        tracing::debug!(partition = %uuid, "sealed active partition");
        self.unpersisted.insert(uuid, Arc::clone(&handle));
        let dir = self.config.dir.join(uuid.to_string());
        persists.spawn_blocking(move || {
            let result = handle.write().persist(&dir);
            (uuid, result)
        });
    }

    fn on_persist_done(&mut self, uuid: Uuid, result: Result<()>) {
        match result {
            Ok(()) => {
                tracing::debug!(partition = %uuid, "persisted partition");
                self.unpersisted.remove(&uuid);
                self.persisted_partitions.insert(uuid);
                if !self.config.delay_flush_until_shutdown {
                    if let Err(err) = self.flush_to_disk() {
                        tracing::error!(%err, "failed to flush index state");
                        self.last_flush_error = Some(err.to_string());
                    }
                }
            }
            Err(err) => {
                // The partition stays unpersisted; ingest continues into
                // the new active partition.
                tracing::error!(partition = %uuid, %err, "failed to persist partition");
                self.last_flush_error = Some(err.to_string());
            }
        }
        self.notify_flush_listeners();
    }

    fn notify_flush_listeners(&mut self) {
        if !self.unpersisted.is_empty() || self.flush_listeners.is_empty() {
            return;
        }
        tracing::debug!(
            listeners = self.flush_listeners.len(),
            "notifying flush listeners"
        );
        for listener in self.flush_listeners.drain(..) {
            let _ = listener.send(());
        }
    }

    /// Writes the index descriptor: persisted UUIDs (including those
    /// still in flight), the meta-index blob, and layout statistics.
    fn flush_to_disk(&self) -> Result<()> {
        fs::create_dir_all(&self.config.dir)?;
        let mut partitions: Vec<Uuid> =
            self.persisted_partitions.iter().copied().collect();
        // In-flight partitions may or may not reach disk before a hard
        // shutdown; stale entries are dropped again on load.
        partitions.extend(self.unpersisted.keys().copied());
        let descriptor = IndexDescriptor {
            version: INDEX_VERSION,
            partitions,
            meta: self.meta.clone(),
            layouts: self.layout_stats.clone(),
        };
        let bytes = serde_json::to_vec(&descriptor)
            .map_err(|e| Error::Unspecified(format!("index descriptor encoding: {}", e)))?;
        fs::write(self.config.dir.join(INDEX_FILE), bytes)?;
        Ok(())
    }

    fn is_resident(&self, uuid: &Uuid) -> bool {
        self.active
            .as_ref()
            .map(|handle| handle.read().uuid() == *uuid)
            .unwrap_or(false)
            || self.unpersisted.contains_key(uuid)
            || self.passive_cache.contains(uuid)
    }

    /// Finds the partition handle for a candidate, loading passive
    /// partitions through the cache.
    fn acquire(&mut self, uuid: Uuid) -> Result<PartitionHandle> {
        if let Some(handle) = &self.active {
            if handle.read().uuid() == uuid {
                return Ok(Arc::clone(handle));
            }
        }
        if let Some(handle) = self.unpersisted.get(&uuid) {
            return Ok(Arc::clone(handle));
        }
        if !self.persisted_partitions.contains(&uuid) {
            return Err(Error::Unspecified(format!(
                "partition {} is not available",
                uuid
            )));
        }
        let dir = self.config.dir.join(uuid.to_string());
        self.passive_cache
            .get_or_load(uuid, || Partition::load(&dir, uuid))
    }

    /// Starts a query: prune, order candidates (resident first), and
    /// schedule the initial taste.
    fn handle_query(&mut self, expr: Expr, reply: oneshot::Sender<QueryResponse>) {
        let expr = expr.normalize();
        let candidates = self.meta.lookup(&expr);
        let total = candidates.len() as u32;
        if candidates.is_empty() {
            tracing::debug!(query = %expr, "no partitions qualify");
            let (_, hits) = mpsc::channel(1);
            let _ = reply.send(QueryResponse {
                id: Uuid::nil(),
                total: 0,
                scheduled: 0,
                hits,
            });
            return;
        }
        // Prefer partitions already in memory, keeping UUID order within
        // each group for reproducibility.
        let (resident, cold): (Vec<Uuid>, Vec<Uuid>) = candidates
            .into_iter()
            .partition(|uuid| self.is_resident(uuid));
        let mut ordered = resident;
        ordered.extend(cold);

        let scheduled = (self.config.taste_partitions.max(1) as u32).min(total);
        let (hits_tx, hits_rx) = mpsc::channel(total.max(1) as usize);
        let first: Vec<Uuid> = ordered.drain(..scheduled as usize).collect();
        for uuid in first {
            self.spawn_evaluator(uuid, &expr, hits_tx.clone());
        }
        let query_id = if ordered.is_empty() {
            // Everything is scheduled; the client never needs to ask for
            // more.
            Uuid::nil()
        } else {
            let id = Uuid::new_v4();
            self.pending.insert(
                id,
                PendingQuery {
                    expr: expr.clone(),
                    remaining: ordered,
                    hits: hits_tx,
                },
            );
            id
        };
        tracing::debug!(query = %expr, total, scheduled, "scheduled query");
        let _ = reply.send(QueryResponse {
            id: query_id,
            total,
            scheduled,
            hits: hits_rx,
        });
    }

    fn handle_more(&mut self, query_id: Uuid, count: u32) {
        if count == 0 {
            // The client drops further results.
            if self.pending.remove(&query_id).is_some() {
                tracing::debug!(query = %query_id, "dropped remaining results");
            }
            return;
        }
        let Some(mut pending) = self.pending.remove(&query_id) else {
            tracing::warn!(query = %query_id, "request for unknown query");
            return;
        };
        let take = (count as usize).min(pending.remaining.len());
        let batch: Vec<Uuid> = pending.remaining.drain(..take).collect();
        for uuid in batch {
            let expr = pending.expr.clone();
            let hits = pending.hits.clone();
            self.spawn_evaluator(uuid, &expr, hits);
        }
        if !pending.remaining.is_empty() {
            self.pending.insert(query_id, pending);
        }
    }

    /// Pairs one evaluator with a worker permit. Excess evaluators wait
    /// for the pool; corrupted partitions drop out of the candidate set.
    fn spawn_evaluator(
        &mut self,
        uuid: Uuid,
        expr: &Expr,
        hits: mpsc::Sender<(Uuid, Bitmap)>,
    ) {
        let handle = match self.acquire(uuid) {
            Ok(handle) => handle,
            Err(err) => {
                tracing::error!(partition = %uuid, %err, "cannot evaluate partition");
                return;
            }
        };
        let workers = Arc::clone(&self.workers);
        let expr = expr.clone();
        tokio::spawn(async move {
            let Ok(_permit) = workers.acquire_owned().await else {
                return;
            };
            let evaluation = crate::query::eval::evaluate(&handle, &expr);
            // A gone receiver means the client cancelled; drop the result.
            let _ = hits.send((uuid, evaluation.global_hits())).await;
        });
    }

    fn status(&self, verbosity: Verbosity) -> serde_json::Value {
        let mut index = serde_json::Map::new();
        if verbosity >= Verbosity::Detailed {
            let mut statistics = serde_json::Map::new();
            let layouts: serde_json::Map<String, serde_json::Value> = self
                .layout_stats
                .iter()
                .map(|(name, count)| (name.clone(), serde_json::json!({ "count": count })))
                .collect();
            statistics.insert("layouts".into(), layouts.into());
            index.insert("statistics".into(), statistics.into());
            index.insert(
                "queries.pending".into(),
                (self.pending.len() as u64).into(),
            );
            index.insert(
                "workers.idle".into(),
                (self.workers.available_permits() as u64).into(),
            );
            index.insert(
                "workers.total".into(),
                (self.config.num_workers as u64).into(),
            );
        }
        if verbosity >= Verbosity::Debug {
            let mut partitions = serde_json::Map::new();
            if let Some(handle) = &self.active {
                let active = handle.read();
                partitions.insert(
                    "active".into(),
                    serde_json::json!({
                        "uuid": active.uuid().to_string(),
                        "rows": active.rows(),
                        "capacity": active.capacity(),
                    }),
                );
            }
            partitions.insert(
                "unpersisted".into(),
                self.unpersisted
                    .keys()
                    .map(|u| u.to_string())
                    .collect::<Vec<_>>()
                    .into(),
            );
            partitions.insert(
                "cached".into(),
                serde_json::json!({
                    "size": self.passive_cache.len(),
                    "capacity": self.passive_cache.capacity(),
                }),
            );
            partitions.insert(
                "persisted".into(),
                (self.persisted_partitions.len() as u64).into(),
            );
            index.insert("partitions".into(), partitions.into());
            if let Some(err) = &self.last_flush_error {
                index.insert("last-flush-error".into(), err.clone().into());
            }
        }
        serde_json::json!({ "index": index })
    }
}

/// Spawns the index task. Startup reads persisted state; an unreadable
/// descriptor is a corruption error surfaced to the caller before the
/// task starts.
pub fn spawn(
    config: IndexConfig,
) -> Result<(IndexHandle, tokio::task::JoinHandle<Result<()>>)> {
    let (meta, persisted_partitions, layout_stats) = IndexState::load_from_disk(&config)?;
    tracing::info!(
        dir = %config.dir.display(),
        partitions = persisted_partitions.len(),
        capacity = config.partition_capacity,
        "index initialized"
    );
    let (control_tx, mut control_rx) = mpsc::channel::<IndexMsg>(64);
    let (slice_tx, mut slice_rx) = mpsc::channel::<Arc<Slice>>(SLICE_CHANNEL_CAPACITY);
    let mut state = IndexState {
        passive_cache: PartitionCache::new(config.max_inmem_partitions),
        workers: Arc::new(Semaphore::new(config.num_workers.max(1))),
        config,
        active: None,
        unpersisted: HashMap::new(),
        persisted_partitions,
        meta,
        pending: HashMap::new(),
        flush_listeners: Vec::new(),
        layout_stats,
        last_flush_error: None,
    };
    let task = tokio::spawn(async move {
        let mut persists: JoinSet<(Uuid, Result<()>)> = JoinSet::new();
        let mut shutdown_reply: Option<oneshot::Sender<Result<()>>> = None;
        let mut slices_open = true;
        loop {
            tokio::select! {
                Some(done) = persists.join_next(), if !persists.is_empty() => {
                    match done {
                        Ok((uuid, result)) => state.on_persist_done(uuid, result),
                        Err(err) => tracing::error!(%err, "persist task panicked"),
                    }
                    if shutdown_reply.is_some() && persists.is_empty() {
                        break;
                    }
                }
                message = control_rx.recv(), if shutdown_reply.is_none() => match message {
                    Some(IndexMsg::Query { expr, reply }) => state.handle_query(expr, reply),
                    Some(IndexMsg::More { query_id, count }) => state.handle_more(query_id, count),
                    Some(IndexMsg::SubscribeFlush { listener }) => {
                        state.flush_listeners.push(listener);
                        state.notify_flush_listeners();
                    }
                    Some(IndexMsg::Status { verbosity, reply }) => {
                        let _ = reply.send(state.status(verbosity));
                    }
                    Some(IndexMsg::Flush { reply }) => {
                        let _ = reply.send(state.flush_to_disk());
                    }
                    Some(IndexMsg::Shutdown { reply }) => {
                        state.seal_active(&mut persists);
                        if persists.is_empty() {
                            let _ = reply.send(state.flush_to_disk());
                            return Ok(());
                        }
                        shutdown_reply = Some(reply);
                    }
                    None => {
                        state.seal_active(&mut persists);
                        while let Some(done) = persists.join_next().await {
                            if let Ok((uuid, result)) = done {
                                state.on_persist_done(uuid, result);
                            }
                        }
                        return state.flush_to_disk();
                    }
                },
                slice = slice_rx.recv(), if slices_open && shutdown_reply.is_none() => {
                    match slice {
                        Some(slice) => {
                            if let Err(err) = state.ingest(&slice, &mut persists) {
                                tracing::error!(%err, "failed to ingest slice");
                            }
                        }
                        None => slices_open = false,
                    }
                }
            }
        }
        // Deferred shutdown completion: all persists have drained.
        let result = state.flush_to_disk();
        if let Some(reply) = shutdown_reply {
            let _ = reply.send(result);
        }
        Ok(())
    });
    Ok((
        IndexHandle {
            control: control_tx,
            slices: slice_tx,
        },
        task,
    ))
}
