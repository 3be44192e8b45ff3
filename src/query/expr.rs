//! Query expression AST and normalization.
//!
//! The parser lives outside this crate; queries arrive as trees of
//! predicates under conjunction, disjunction, and negation. Before
//! evaluation an expression is normalized: negations are pushed down to
//! the predicates via De Morgan and operator duals, nested connectives of
//! the same kind are flattened, children are sorted canonically, and
//! duplicates are dropped.

use crate::data::{Value, ValueType};
use std::fmt;

/// Relational operator of a predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    Ni,
    Match,
}

impl RelOp {
    /// The dual operator under negation, if one exists. `match` has no
    /// dual; its negation stays a leaf-level complement.
    pub fn negate(self) -> Option<RelOp> {
        match self {
            RelOp::Eq => Some(RelOp::Ne),
            RelOp::Ne => Some(RelOp::Eq),
            RelOp::Lt => Some(RelOp::Ge),
            RelOp::Le => Some(RelOp::Gt),
            RelOp::Gt => Some(RelOp::Le),
            RelOp::Ge => Some(RelOp::Lt),
            RelOp::In => Some(RelOp::Ni),
            RelOp::Ni => Some(RelOp::In),
            RelOp::Match => None,
        }
    }
}

impl fmt::Display for RelOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RelOp::Eq => "==",
            RelOp::Ne => "!=",
            RelOp::Lt => "<",
            RelOp::Le => "<=",
            RelOp::Gt => ">",
            RelOp::Ge => ">=",
            RelOp::In => "in",
            RelOp::Ni => "!in",
            RelOp::Match => "~",
        };
        f.write_str(s)
    }
}

/// The left-hand side of a predicate: a concrete field path, all columns
/// of a semantic type, or all fields carrying an attribute.
#[derive(Debug, Clone, PartialEq)]
pub enum Extractor {
    Field(String),
    Type(ValueType),
    Attr(String),
}

impl fmt::Display for Extractor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Extractor::Field(path) => f.write_str(path),
            Extractor::Type(ty) => write!(f, ":{}", ty),
            Extractor::Attr(name) => write!(f, "#{}", name),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    pub extractor: Extractor,
    pub op: RelOp,
    pub operand: Value,
}

impl Predicate {
    pub fn new(extractor: Extractor, op: RelOp, operand: Value) -> Self {
        Predicate {
            extractor,
            op,
            operand,
        }
    }

    /// Shorthand for a field predicate.
    pub fn field(path: impl Into<String>, op: RelOp, operand: Value) -> Self {
        Predicate::new(Extractor::Field(path.into()), op, operand)
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.extractor, self.op, self.operand)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Pred(Predicate),
    Conj(Vec<Expr>),
    Disj(Vec<Expr>),
    Neg(Box<Expr>),
}

impl Expr {
    pub fn pred(extractor: Extractor, op: RelOp, operand: Value) -> Self {
        Expr::Pred(Predicate::new(extractor, op, operand))
    }

    pub fn field(path: impl Into<String>, op: RelOp, operand: Value) -> Self {
        Expr::Pred(Predicate::field(path, op, operand))
    }

    pub fn and(exprs: Vec<Expr>) -> Self {
        Expr::Conj(exprs)
    }

    pub fn or(exprs: Vec<Expr>) -> Self {
        Expr::Disj(exprs)
    }

    pub fn negate(expr: Expr) -> Self {
        Expr::Neg(Box::new(expr))
    }

    /// Normalizes into negation normal form with flattened, canonically
    /// ordered, deduplicated connectives.
    pub fn normalize(self) -> Expr {
        let pushed = push_negations(self, false);
        flatten(pushed)
    }

    /// All predicates of the normalized tree, in order.
    pub fn predicates(&self) -> Vec<&Predicate> {
        let mut out = Vec::new();
        self.collect_predicates(&mut out);
        out
    }

    fn collect_predicates<'a>(&'a self, out: &mut Vec<&'a Predicate>) {
        match self {
            Expr::Pred(p) => out.push(p),
            Expr::Conj(xs) | Expr::Disj(xs) => {
                for x in xs {
                    x.collect_predicates(out);
                }
            }
            Expr::Neg(x) => x.collect_predicates(out),
        }
    }
}

fn push_negations(expr: Expr, negated: bool) -> Expr {
    match expr {
        Expr::Pred(p) => {
            if !negated {
                return Expr::Pred(p);
            }
            match p.op.negate() {
                Some(dual) => Expr::Pred(Predicate::new(p.extractor, dual, p.operand)),
                None => Expr::Neg(Box::new(Expr::Pred(p))),
            }
        }
        Expr::Neg(inner) => push_negations(*inner, !negated),
        Expr::Conj(xs) => {
            let children = xs
                .into_iter()
                .map(|x| push_negations(x, negated))
                .collect();
            if negated {
                Expr::Disj(children)
            } else {
                Expr::Conj(children)
            }
        }
        Expr::Disj(xs) => {
            let children = xs
                .into_iter()
                .map(|x| push_negations(x, negated))
                .collect();
            if negated {
                Expr::Conj(children)
            } else {
                Expr::Disj(children)
            }
        }
    }
}

fn flatten(expr: Expr) -> Expr {
    match expr {
        Expr::Conj(xs) => rebuild(xs, true),
        Expr::Disj(xs) => rebuild(xs, false),
        other => other,
    }
}

fn rebuild(children: Vec<Expr>, conj: bool) -> Expr {
    let mut flat = Vec::new();
    for child in children {
        match flatten(child) {
            Expr::Conj(inner) if conj => flat.extend(inner),
            Expr::Disj(inner) if !conj => flat.extend(inner),
            other => flat.push(other),
        }
    }
    flat.sort_by_key(|e| e.to_string());
    flat.dedup_by_key(|e| e.to_string());
    if flat.len() == 1 {
        return flat.into_iter().next().unwrap();
    }
    if conj {
        Expr::Conj(flat)
    } else {
        Expr::Disj(flat)
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Pred(p) => write!(f, "{}", p),
            Expr::Conj(xs) => write_connective(f, xs, " && "),
            Expr::Disj(xs) => write_connective(f, xs, " || "),
            Expr::Neg(x) => write!(f, "! {}", x),
        }
    }
}

fn write_connective(f: &mut fmt::Formatter<'_>, xs: &[Expr], sep: &str) -> fmt::Result {
    write!(f, "(")?;
    for (i, x) in xs.iter().enumerate() {
        if i > 0 {
            f.write_str(sep)?;
        }
        write!(f, "{}", x)?;
    }
    write!(f, ")")
}
