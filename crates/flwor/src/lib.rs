//! A FLWOR clause pipeline for XQuery-style engines: For / Let / Where /
//! OrderBy / GroupBy / Window / Count clauses plus a return expression,
//! compiled through a fixpoint rewrite optimizer and evaluated as a lazy,
//! pull-based tuple stream.
//!
//! ```
//! use flwor::expr::{CmpOp, Expr};
//! use flwor::pipeline::{Clause, For, Let, Pipeline, Where};
//! use flwor::runtime::{CompileContext, QueryContext};
//! use flwor::types::{ItemType, SeqType};
//! use flwor::var::VarScope;
//! use flwor::xdm::AtomicValue;
//!
//! // for $x in (1, 2, 3) let $y := $x * 2 where $y > 2 return $y
//! let mut scope = VarScope::new();
//! let x = scope.declare("x", SeqType::one(ItemType::Integer));
//! let y = scope.declare("y", SeqType::zero_or_more(ItemType::Integer));
//! let pipeline = Pipeline::new(
//!     vec![
//!         Clause::For(For::new(x.clone(), Expr::int_seq([1, 2, 3]))),
//!         Clause::Let(Let::new(y.clone(), Expr::mul(Expr::var(&x), Expr::int(2)))),
//!         Clause::Where(Where::new(Expr::cmp(CmpOp::Gt, Expr::var(&y), Expr::int(2)))),
//!     ],
//!     Expr::var(&y),
//! );
//!
//! let compiled = pipeline.compile(&mut CompileContext::new()).unwrap();
//! let out = flwor::evaluate(&compiled, &QueryContext::new()).unwrap();
//! assert_eq!(out, vec![AtomicValue::Integer(4), AtomicValue::Integer(6)]);
//! ```

pub mod collation;
pub mod expr;
pub mod functions;
pub mod pipeline;
pub mod runtime;
pub mod types;
pub mod var;
pub mod xdm;

pub use expr::{ArithOp, CmpOp, Expr, Flag};
pub use pipeline::{Clause, Pipeline};
pub use runtime::{CompileContext, Error, ErrorCode, QueryContext, QueryContextBuilder};
pub use types::{ItemType, Occurrence, SeqType};
pub use var::{Var, VarId, VarScope};
pub use xdm::{AtomicValue, Sequence, SequenceStream};

/// Evaluates a compiled expression, materializing the full result sequence.
///
/// For large results or early termination, prefer [`evaluate_stream`].
pub fn evaluate(expr: &Expr, qc: &QueryContext) -> Result<Sequence, Error> {
    expr.stream(qc)?.materialize()
}

/// Evaluates a compiled expression as a lazy stream. Items are produced on
/// demand; errors inside the sequence surface while pulling.
#[must_use = "streams are lazy and do nothing unless consumed"]
pub fn evaluate_stream(expr: &Expr, qc: &QueryContext) -> Result<SequenceStream, Error> {
    expr.stream(qc)
}
