//! The FLWOR pipeline: an ordered clause sequence plus a return expression.
//!
//! A pipeline is built once, compiled (rewritten in place to fixpoint) once,
//! and evaluated any number of times as a lazy tuple stream. Compilation may
//! replace the pipeline wholesale: with its bare return expression, with a
//! guard conditional, or with the empty sequence.

pub mod clause;
mod eval;
mod optimizer;
pub mod usage;

pub use clause::{Aggregate, Clause, Count, For, GroupBy, GroupSpec, Let, OrderBy, SortKey, Where, Window, WindowCond};

use crate::expr::{Expr, Flag};
use crate::pipeline::usage::{VarUsage, mul_size};
use crate::runtime::{CompileContext, Error, QueryContext};
use crate::types::{Occurrence, SeqType};
use crate::var::VarId;
use crate::xdm::SequenceStream;
use core::fmt;
use itertools::Itertools;
use std::collections::HashSet;

#[derive(Debug, Clone)]
pub struct Pipeline {
    pub clauses: Vec<Clause>,
    pub ret: Expr,
}

impl Pipeline {
    pub fn new(clauses: Vec<Clause>, ret: Expr) -> Self {
        Self { clauses, ret }
    }

    /// Compiles the pipeline: local clause compilation, the fixpoint rewrite
    /// loop, and the finishing passes. Returns the expression that replaces
    /// the pipeline — usually the pipeline itself, but possibly its bare
    /// return expression, a guard conditional, or the empty sequence.
    pub fn compile(self, cx: &mut CompileContext) -> Result<Expr, Error> {
        self.optimize(cx)
    }

    /// Statically known result cardinality, or `None`.
    pub fn calc_size(&self) -> Option<u64> {
        let output = self.ret.size();
        if output == Some(0) {
            return Some(0);
        }
        let mut tuples = Some(1);
        for clause in &self.clauses {
            tuples = clause.calc_size(tuples);
            if tuples == Some(0) {
                return Some(0);
            }
        }
        mul_size(tuples, output)
    }

    pub fn uses(&self, flag: Flag) -> bool {
        if flag == Flag::Var && !self.clauses.is_empty() {
            return true;
        }
        self.clauses.iter().any(|c| c.uses(flag)) || self.ret.uses(flag)
    }

    /// Usage of a variable from clause position `from` (inclusive) through
    /// the return expression, scaled by each intervening clause's fan-out.
    pub fn count_uses(&self, id: VarId, from: usize) -> VarUsage {
        let mut mult = Some(1);
        let mut usage = VarUsage::Never;
        for clause in &self.clauses[from..] {
            usage = usage.plus(clause.count_var(id).times(mult));
            mult = mul_size(mult, clause.fanout());
        }
        usage.plus(self.ret.count_var(id).times(mult))
    }

    pub(crate) fn collect_free_vars(&self, out: &mut HashSet<VarId>) {
        for clause in &self.clauses {
            clause.collect_free_vars(out);
        }
        self.ret.collect_free_vars(out);
        // Locally declared variables are not free.
        for clause in &self.clauses {
            for var in clause.declared_vars() {
                out.remove(&var.id);
            }
        }
    }

    /// Substitutes a variable everywhere; `None` when nothing changed.
    pub(crate) fn substitute(&self, id: VarId, replacement: &Expr) -> Option<Pipeline> {
        let mut copy = self.clone();
        let mut changed = false;
        for clause in &mut copy.clauses {
            changed |= clause.inline(id, replacement);
        }
        if let Some(ret) = copy.ret.substitute(id, replacement) {
            copy.ret = ret;
            changed = true;
        }
        changed.then_some(copy)
    }

    pub fn seq_type(&self) -> SeqType {
        let ret = self.ret.seq_type();
        match self.calc_size() {
            Some(1) => SeqType { item: ret.item, occ: Occurrence::One },
            _ => SeqType::zero_or_more(ret.item),
        }
    }

    /// True when the pipeline uses only for, let, and where clauses.
    pub(crate) fn is_flwr(&self) -> bool {
        self.clauses.iter().all(|c| matches!(c, Clause::For(_) | Clause::Let(_) | Clause::Where(_)))
    }

    /// Lazy evaluation: one advance of the clause chain per surviving tuple,
    /// concatenating the return expression's stream for each.
    pub fn stream(&self, qc: &QueryContext) -> SequenceStream {
        eval::pipeline_stream(self.clone(), qc.clone())
    }
}

impl fmt::Display for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.clauses.is_empty() {
            return write!(f, "return {}", self.ret);
        }
        write!(f, "{} return {}", self.clauses.iter().join(" "), self.ret)
    }
}
