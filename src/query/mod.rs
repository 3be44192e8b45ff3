pub mod eval;
pub mod expr;

pub use eval::{evaluate, Evaluation};
pub use expr::{Expr, Extractor, Predicate, RelOp};
