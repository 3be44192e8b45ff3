//! Per-partition query evaluation.
//!
//! An evaluator is transient: it runs one normalized expression against
//! one partition handle and produces that partition's hit bitmap. Workers
//! execute evaluators serially; the bounded pool lives in the index.

use crate::bitmap::Bitmap;
use crate::index::cache::PartitionHandle;
use crate::query::expr::Expr;
use uuid::Uuid;

/// The result of evaluating one partition.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub partition: Uuid,
    pub hits: Bitmap,
    /// Global ID of the partition's first row, for translating hit
    /// positions back to event IDs.
    pub min_id: u64,
}

/// Runs the expression against one partition under a read lock.
pub fn evaluate(handle: &PartitionHandle, expr: &Expr) -> Evaluation {
    let partition = handle.read();
    Evaluation {
        partition: partition.uuid(),
        hits: partition.lookup(expr),
        min_id: partition.min_id(),
    }
}

impl Evaluation {
    /// Hit positions as absolute event IDs.
    pub fn event_ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.hits.ones().map(move |pos| self.min_id + pos)
    }

    /// The hits as a bitmap over the global event ID space.
    pub fn global_hits(&self) -> Bitmap {
        self.hits.with_offset(self.min_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Field, Layout, SliceBuilder, Value, ValueType};
    use crate::index::partition::Partition;
    use crate::query::expr::{Expr, RelOp};
    use parking_lot::RwLock;
    use std::sync::Arc;

    #[test]
    fn test_evaluate_translates_ids() {
        let layout = Arc::new(Layout::new(
            "test",
            vec![Field::new("x", ValueType::Int)],
        ));
        let mut partition = Partition::new(Uuid::new_v4(), 100);
        partition.register_layout(Arc::clone(&layout)).unwrap();
        let mut builder = SliceBuilder::new(Arc::clone(&layout));
        for v in [10, 20, 10] {
            builder.push_row(vec![Value::Int(v)]).unwrap();
        }
        let mut slice = builder.finish();
        slice.set_offset(5000);
        partition.add(&slice).unwrap();

        let handle: PartitionHandle = Arc::new(RwLock::new(partition));
        let expr = Expr::field("x", RelOp::Eq, Value::Int(10)).normalize();
        let eval = evaluate(&handle, &expr);
        assert_eq!(eval.hits.count_ones(), 2);
        let ids: Vec<u64> = eval.event_ids().collect();
        assert_eq!(ids, vec![5000, 5002]);
    }
}
