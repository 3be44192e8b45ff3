//! Partitions: bitmap-indexed columnar units covering a contiguous ID
//! range.
//!
//! A partition starts *active* (single writer), seals into *unpersisted*
//! when full, and becomes *passive* once every column file plus the
//! descriptor sits on disk. Persisted files are immutable. Multiple
//! layouts may share a partition; columns of the other layouts receive
//! nulls for a slice's rows so that every column index agrees on the row
//! count.

use super::column::ColumnIndex;
use super::synopsis::Synopsis;
use crate::bitmap::Bitmap;
use crate::data::{Field, Layout, Slice, ATTR_SKIP};
use crate::error::{Error, Result};
use crate::query::expr::{Expr, Extractor, Predicate};
use crate::vindex::Options;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

pub const PARTITION_VERSION: u32 = 1;
pub const DESCRIPTOR_FILE: &str = "partition.bin";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionState {
    Active,
    Unpersisted,
    Passive,
}

/// One column of the partition's flat column space.
#[derive(Debug)]
pub struct ColumnEntry {
    /// Qualified path `<layout>.<field>`.
    pub qualified: String,
    pub field: Field,
    pub column: ColumnIndex,
    pub synopsis: Synopsis,
}

#[derive(Debug)]
pub struct Partition {
    uuid: Uuid,
    capacity: u64,
    min_id: u64,
    rows: u64,
    state: PartitionState,
    layouts: Vec<Arc<Layout>>,
    /// Flat column space: all fields of all registered layouts, in
    /// registration order. Column files are named by position here.
    columns: Vec<ColumnEntry>,
    index_options: Options,
}

impl Partition {
    pub fn new(uuid: Uuid, capacity: u64) -> Self {
        Partition {
            uuid,
            capacity,
            min_id: 0,
            rows: 0,
            state: PartitionState::Active,
            layouts: Vec::new(),
            columns: Vec::new(),
            index_options: Options::new(),
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn state(&self) -> PartitionState {
        self.state
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn min_id(&self) -> u64 {
        self.min_id
    }

    /// The half-open event ID interval this partition covers.
    pub fn id_range(&self) -> (u64, u64) {
        (self.min_id, self.min_id + self.rows)
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn remaining_capacity(&self) -> u64 {
        self.capacity.saturating_sub(self.rows)
    }

    pub fn layouts(&self) -> &[Arc<Layout>] {
        &self.layouts
    }

    pub fn columns(&self) -> &[ColumnEntry] {
        &self.columns
    }

    pub fn has_layout(&self, layout: &Layout) -> bool {
        self.layouts.iter().any(|l| l.name == layout.name)
    }

    /// Records a layout, creating a column index per leaf field. Must
    /// happen before the first slice of that layout arrives.
    pub fn register_layout(&mut self, layout: Arc<Layout>) -> Result<()> {
        if self.state != PartitionState::Active {
            return Err(Error::Unspecified(format!(
                "partition {} no longer accepts layouts",
                self.uuid
            )));
        }
        if self.has_layout(&layout) {
            return Ok(());
        }
        for field in &layout.fields {
            let mut column =
                ColumnIndex::new(field.clone(), self.min_id, &self.index_options)?;
            // Columns registered after rows of other layouts landed start
            // with nulls for those rows.
            column.pad(self.rows);
            self.columns.push(ColumnEntry {
                qualified: format!("{}.{}", layout.name, field.name),
                field: field.clone(),
                column,
                synopsis: Synopsis::for_field(field),
            });
        }
        self.layouts.push(layout);
        Ok(())
    }

    /// Appends a slice. Preconditions: the partition is active, the
    /// slice's layout is registered, and the slice fits the remaining
    /// capacity.
    pub fn add(&mut self, slice: &Slice) -> Result<()> {
        if self.state != PartitionState::Active {
            return Err(Error::Unspecified(format!(
                "partition {} is sealed",
                self.uuid
            )));
        }
        if slice.rows() as u64 > self.remaining_capacity() {
            return Err(Error::Unspecified(format!(
                "slice of {} rows exceeds remaining capacity {}",
                slice.rows(),
                self.remaining_capacity()
            )));
        }
        let layout = slice.layout();
        if !self.has_layout(layout) {
            return Err(Error::Unspecified(format!(
                "layout {} not registered with partition {}",
                layout.name, self.uuid
            )));
        }
        if self.rows == 0 {
            self.min_id = slice.offset();
            for entry in &mut self.columns {
                entry.column.rebase(self.min_id);
            }
        }
        let after = self.rows + slice.rows() as u64;
        let mut cursor = 0;
        for registered in self.layouts.clone() {
            let owns_slice = registered.name == layout.name;
            for k in 0..registered.arity() {
                let entry = &mut self.columns[cursor];
                if owns_slice {
                    entry.column.add(slice, k)?;
                    for row in 0..slice.rows() {
                        entry.synopsis.add(slice.value(row, k));
                    }
                } else {
                    entry.column.pad(after);
                }
                cursor += 1;
            }
        }
        self.rows = after;
        Ok(())
    }

    /// Stops accepting writes; the partition is flushing from now on.
    pub fn seal(&mut self) {
        if self.state == PartitionState::Active {
            self.state = PartitionState::Unpersisted;
        }
    }

    /// Evaluates a normalized expression against this partition.
    pub fn lookup(&self, expr: &Expr) -> Bitmap {
        let mut result = self.eval(expr);
        result.pad_to(self.rows);
        result
    }

    fn eval(&self, expr: &Expr) -> Bitmap {
        match expr {
            Expr::Pred(pred) => self.eval_predicate(pred),
            Expr::Conj(children) => {
                let mut acc = Bitmap::filled(self.rows, true);
                for child in children {
                    acc = &acc & &self.eval(child);
                    if acc.count_ones() == 0 {
                        break;
                    }
                }
                acc
            }
            Expr::Disj(children) => {
                let mut acc = Bitmap::filled(self.rows, false);
                for child in children {
                    acc = &acc | &self.eval(child);
                }
                acc
            }
            Expr::Neg(inner) => {
                let mut hits = self.eval(inner);
                hits.pad_to(self.rows);
                !&hits
            }
        }
    }

    fn eval_predicate(&self, pred: &Predicate) -> Bitmap {
        let mut acc = Bitmap::filled(self.rows, false);
        for entry in self.matching_columns(&pred.extractor) {
            match entry.column.lookup(pred.op, &pred.operand) {
                Ok(hits) => acc = &acc | &hits,
                Err(err) if matches!(err, Error::TypeClash { .. }) => {
                    // A clashing predicate contributes no hits; the rest
                    // of the expression still evaluates.
                    tracing::debug!(column = %entry.qualified, %err, "predicate skipped");
                }
                Err(err) => {
                    tracing::warn!(column = %entry.qualified, %err, "column lookup failed");
                }
            }
        }
        acc
    }

    fn matching_columns<'a>(
        &'a self,
        extractor: &'a Extractor,
    ) -> impl Iterator<Item = &'a ColumnEntry> {
        self.columns.iter().filter(move |entry| match extractor {
            Extractor::Field(path) => {
                entry.qualified == *path
                    || entry.field.name == *path
                    || entry.qualified.ends_with(&format!(".{}", path))
            }
            Extractor::Type(ty) => {
                entry.field.ty == *ty && !entry.field.has_attr(ATTR_SKIP)
            }
            Extractor::Attr(name) => entry.field.has_attr(name),
        })
    }

    /// Per-column synopses, in flat order, for the meta-index.
    pub fn synopses(&self) -> Vec<(String, Synopsis)> {
        self.columns
            .iter()
            .map(|entry| (entry.qualified.clone(), entry.synopsis.clone()))
            .collect()
    }

    /// Writes every column file plus the descriptor. On success the
    /// partition is passive; on failure it stays unpersisted and no
    /// partial state counts as persisted.
    pub fn persist(&mut self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        let mut column_files = Vec::with_capacity(self.columns.len());
        for (flat_index, entry) in self.columns.iter().enumerate() {
            let name = format!("{}.col", flat_index);
            entry.column.write_to(&dir.join(&name))?;
            column_files.push(name);
        }
        let descriptor = PartitionDescriptor {
            version: PARTITION_VERSION,
            uuid: self.uuid,
            min_id: self.min_id,
            rows: self.rows,
            layouts: self.layouts.iter().map(|l| (**l).clone()).collect(),
            synopses: self.columns.iter().map(|e| e.synopsis.clone()).collect(),
            column_files,
        };
        let bytes = serde_json::to_vec(&descriptor)
            .map_err(|e| Error::Unspecified(format!("descriptor encoding: {}", e)))?;
        fs::write(dir.join(DESCRIPTOR_FILE), bytes)?;
        self.state = PartitionState::Passive;
        Ok(())
    }

    /// Reads only the descriptor: enough to rebuild the meta-index entry
    /// without loading any column file.
    pub fn load_header(
        dir: &Path,
        expected: Uuid,
    ) -> Result<(super::meta::PartitionSynopsis, u64)> {
        let descriptor = read_descriptor(dir, expected)?;
        let fields = descriptor
            .layouts
            .iter()
            .flat_map(|layout| {
                layout.fields.iter().map(move |field| {
                    (format!("{}.{}", layout.name, field.name), field.clone())
                })
            })
            .zip(descriptor.synopses.iter().cloned())
            .map(|((qualified, field), synopsis)| super::meta::FieldSynopsis {
                qualified,
                field,
                synopsis,
            })
            .collect();
        Ok((
            super::meta::PartitionSynopsis {
                layouts: descriptor.layouts.iter().map(|l| l.name.clone()).collect(),
                fields,
            },
            descriptor.rows,
        ))
    }

    /// Loads a passive partition from its directory.
    pub fn load(dir: &Path, expected: Uuid) -> Result<Self> {
        let descriptor = read_descriptor(dir, expected)?;
        let fields: Vec<(String, Field)> = descriptor
            .layouts
            .iter()
            .flat_map(|layout| {
                layout.fields.iter().map(move |field| {
                    (format!("{}.{}", layout.name, field.name), field.clone())
                })
            })
            .collect();
        if fields.len() != descriptor.column_files.len()
            || fields.len() != descriptor.synopses.len()
        {
            return Err(Error::corruption(
                "descriptor column count does not match layouts",
            ));
        }
        let mut columns = Vec::with_capacity(fields.len());
        for (((qualified, field), file), synopsis) in fields
            .into_iter()
            .zip(&descriptor.column_files)
            .zip(descriptor.synopses)
        {
            let column = ColumnIndex::read_from(&dir.join(file), field.clone())?;
            if column.len() != descriptor.rows {
                return Err(Error::corruption(format!(
                    "column {} covers {} rows, partition has {}",
                    qualified,
                    column.len(),
                    descriptor.rows
                )));
            }
            columns.push(ColumnEntry {
                qualified,
                field,
                column,
                synopsis,
            });
        }
        Ok(Partition {
            uuid: descriptor.uuid,
            capacity: descriptor.rows,
            min_id: descriptor.min_id,
            rows: descriptor.rows,
            state: PartitionState::Passive,
            layouts: descriptor.layouts.into_iter().map(Arc::new).collect(),
            columns,
            index_options: Options::new(),
        })
    }
}

fn read_descriptor(dir: &Path, expected: Uuid) -> Result<PartitionDescriptor> {
    let bytes = fs::read(dir.join(DESCRIPTOR_FILE))?;
    let descriptor: PartitionDescriptor = serde_json::from_slice(&bytes)
        .map_err(|e| Error::corruption(format!("partition descriptor: {}", e)))?;
    if descriptor.version != PARTITION_VERSION {
        return Err(Error::corruption(format!(
            "partition format version {} unsupported (expected {})",
            descriptor.version, PARTITION_VERSION
        )));
    }
    if descriptor.uuid != expected {
        return Err(Error::corruption(format!(
            "partition claims uuid {} but directory is {}",
            descriptor.uuid, expected
        )));
    }
    Ok(descriptor)
}

#[derive(Serialize, Deserialize)]
struct PartitionDescriptor {
    version: u32,
    uuid: Uuid,
    min_id: u64,
    rows: u64,
    layouts: Vec<Layout>,
    /// Per-column synopses, in flat order.
    synopses: Vec<Synopsis>,
    /// Column file names, in flat order.
    column_files: Vec<String>,
}
