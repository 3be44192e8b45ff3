//! Meta-index: per-partition synopses and expression pruning.
//!
//! Kept entirely in memory, persisted as a blob inside the index
//! descriptor, and reconstructable from partition descriptors. A lookup
//! folds the expression over each partition's synopses with Kleene logic
//! and keeps every partition that is not a definite `No`.

use super::partition::Partition;
use super::synopsis::{Synopsis, Tri};
use crate::data::{Field, ATTR_SKIP};
use crate::query::expr::{Expr, Extractor, Predicate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSynopsis {
    /// Qualified path `<layout>.<field>`.
    pub qualified: String,
    pub field: Field,
    pub synopsis: Synopsis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionSynopsis {
    pub layouts: Vec<String>,
    pub fields: Vec<FieldSynopsis>,
}

impl PartitionSynopsis {
    pub fn of(partition: &Partition) -> Self {
        PartitionSynopsis {
            layouts: partition
                .layouts()
                .iter()
                .map(|l| l.name.clone())
                .collect(),
            fields: partition
                .columns()
                .iter()
                .map(|entry| FieldSynopsis {
                    qualified: entry.qualified.clone(),
                    field: entry.field.clone(),
                    synopsis: entry.synopsis.clone(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetaIndex {
    partitions: BTreeMap<Uuid, PartitionSynopsis>,
}

impl MetaIndex {
    pub fn new() -> Self {
        MetaIndex::default()
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    /// Replaces the synopsis snapshot for a partition.
    pub fn update(&mut self, uuid: Uuid, synopsis: PartitionSynopsis) {
        self.partitions.insert(uuid, synopsis);
    }

    pub fn remove(&mut self, uuid: &Uuid) {
        self.partitions.remove(uuid);
    }

    pub fn contains(&self, uuid: &Uuid) -> bool {
        self.partitions.contains_key(uuid)
    }

    /// Candidate partitions for an expression, in UUID order.
    pub fn lookup(&self, expr: &Expr) -> Vec<Uuid> {
        self.partitions
            .iter()
            .filter(|(_, synopsis)| check(synopsis, expr).qualifies())
            .map(|(uuid, _)| *uuid)
            .collect()
    }
}

fn check(partition: &PartitionSynopsis, expr: &Expr) -> Tri {
    match expr {
        Expr::Pred(pred) => check_predicate(partition, pred),
        Expr::Conj(children) => children
            .iter()
            .map(|child| check(partition, child))
            .fold(Tri::Yes, Tri::and),
        Expr::Disj(children) => children
            .iter()
            .map(|child| check(partition, child))
            .fold(Tri::No, Tri::or),
        Expr::Neg(inner) => match check(partition, inner) {
            Tri::Yes => Tri::No,
            Tri::No => Tri::Yes,
            Tri::Maybe => Tri::Maybe,
        },
    }
}

fn check_predicate(partition: &PartitionSynopsis, pred: &Predicate) -> Tri {
    let mut verdict = None;
    for field in matching_fields(partition, &pred.extractor) {
        let this = field.synopsis.check(pred.op, &pred.operand);
        verdict = Some(match verdict {
            Some(prior) => Tri::or(prior, this),
            None => this,
        });
        if verdict == Some(Tri::Yes) {
            break;
        }
    }
    // No matching field means the predicate cannot produce hits here.
    verdict.unwrap_or(Tri::No)
}

fn matching_fields<'a>(
    partition: &'a PartitionSynopsis,
    extractor: &'a Extractor,
) -> impl Iterator<Item = &'a FieldSynopsis> {
    partition.fields.iter().filter(move |entry| match extractor {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Value, ValueType};
    use crate::query::expr::RelOp;

    const SEC: i64 = 1_000_000_000;

    fn time_partition(uuid: Uuid, times: &[i64]) -> (Uuid, PartitionSynopsis) {
        let field = Field::new("ts", ValueType::Time);
        let mut synopsis = Synopsis::for_field(&field);
        for &t in times {
            synopsis.add(&Value::Time(t));
        }
        (
            uuid,
            PartitionSynopsis {
                layouts: vec!["conn".into()],
                fields: vec![FieldSynopsis {
                    qualified: "conn.ts".into(),
                    field,
                    synopsis,
                }],
            },
        )
    }

    fn ts_pred(op: RelOp, seconds: i64) -> Expr {
        Expr::field("ts", op, Value::Time(seconds * SEC))
    }

    #[test]
    fn test_empty_meta_index_returns_nothing() {
        let meta = MetaIndex::new();
        assert!(meta.lookup(&ts_pred(RelOp::Eq, 1)).is_empty());
    }

    #[test]
    fn test_time_pruning() {
        let mut meta = MetaIndex::new();
        let uuid = Uuid::new_v4();
        let (id, synopsis) = time_partition(uuid, &[4 * SEC, 7 * SEC]);
        meta.update(id, synopsis);

        assert!(meta.lookup(&ts_pred(RelOp::Lt, 0)).is_empty());
        assert_eq!(meta.lookup(&ts_pred(RelOp::Gt, 0)), vec![uuid]);
        assert!(meta.lookup(&ts_pred(RelOp::Eq, 9)).is_empty());
        assert_eq!(meta.lookup(&ts_pred(RelOp::Eq, 7)), vec![uuid]);
    }

    #[test]
    fn test_conjunction_prunes() {
        let mut meta = MetaIndex::new();
        let uuid = Uuid::new_v4();
        let (id, synopsis) = time_partition(uuid, &[4 * SEC, 7 * SEC]);
        meta.update(id, synopsis);

        // Both conjuncts must qualify.
        let expr = Expr::and(vec![ts_pred(RelOp::Gt, 0), ts_pred(RelOp::Eq, 9)]);
        assert!(meta.lookup(&expr).is_empty());
        let expr = Expr::and(vec![ts_pred(RelOp::Gt, 0), ts_pred(RelOp::Eq, 5)]);
        assert_eq!(meta.lookup(&expr), vec![uuid]);
    }

    #[test]
    fn test_disjunction_includes() {
        let mut meta = MetaIndex::new();
        let uuid = Uuid::new_v4();
        let (id, synopsis) = time_partition(uuid, &[4 * SEC, 7 * SEC]);
        meta.update(id, synopsis);

        let expr = Expr::or(vec![ts_pred(RelOp::Eq, 9), ts_pred(RelOp::Eq, 5)]);
        assert_eq!(meta.lookup(&expr), vec![uuid]);
    }

    #[test]
    fn test_absent_field_prunes() {
        let mut meta = MetaIndex::new();
        let uuid = Uuid::new_v4();
        let (id, synopsis) = time_partition(uuid, &[4 * SEC]);
        meta.update(id, synopsis);

        let expr = Expr::field("nonexistent", RelOp::Eq, Value::Int(1));
        assert!(meta.lookup(&expr).is_empty());
        // But its negation matches everything.
        let neg = Expr::Neg(Box::new(Expr::field(
            "nonexistent",
            RelOp::Eq,
            Value::Int(1),
        )));
        assert_eq!(meta.lookup(&neg), vec![uuid]);
    }

    #[test]
    fn test_type_extractor() {
        let mut meta = MetaIndex::new();
        let uuid = Uuid::new_v4();
        let (id, synopsis) = time_partition(uuid, &[4 * SEC]);
        meta.update(id, synopsis);

        let hit = Expr::pred(
            Extractor::Type(ValueType::Time),
            RelOp::Ge,
            Value::Time(0),
        );
        assert_eq!(meta.lookup(&hit), vec![uuid]);
        let miss = Expr::pred(
            Extractor::Type(ValueType::Addr),
            RelOp::Eq,
            Value::Addr("10.0.0.1".parse().unwrap()),
        );
        assert!(meta.lookup(&miss).is_empty());
    }

    #[test]
    fn test_candidates_in_uuid_order() {
        let mut meta = MetaIndex::new();
        let mut uuids: Vec<Uuid> = (0..8).map(|_| Uuid::new_v4()).collect();
        for &uuid in &uuids {
            let (id, synopsis) = time_partition(uuid, &[SEC]);
            meta.update(id, synopsis);
        }
        uuids.sort();
        assert_eq!(meta.lookup(&ts_pred(RelOp::Ge, 0)), uuids);
    }

    #[test]
    fn test_serde_roundtrip() {
        let mut meta = MetaIndex::new();
        let uuid = Uuid::new_v4();
        let (id, synopsis) = time_partition(uuid, &[4 * SEC, 7 * SEC]);
        meta.update(id, synopsis);
        let json = serde_json::to_string(&meta).unwrap();
        let decoded: MetaIndex = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.lookup(&ts_pred(RelOp::Eq, 7)), vec![uuid]);
    }
}
