//! The clause variants of the pipeline, as a closed tagged union.
//!
//! Every operation the optimizer needs — sizing, fan-out, variable
//! accounting, substitution, skippability — dispatches by pattern matching
//! here. A clause owns the variables it declares and the sub-expressions it
//! evaluates; it may only reference variables declared strictly before it.

use crate::expr::{Expr, Flag};
use crate::pipeline::usage::{VarUsage, mul_size};
use crate::runtime::{CompileContext, Error};
use crate::var::{Var, VarId};
use crate::xdm::AtomicValue;
use core::fmt;
use itertools::Itertools;
use smallvec::SmallVec;
use std::collections::HashSet;

/// `for $var [at $pos] in source` — one binding per source item.
#[derive(Debug, Clone)]
pub struct For {
    pub var: Var,
    /// Positional variable: 1-based index within the current source.
    pub pos: Option<Var>,
    /// Score variable; binds 0.0 (no scoring subsystem).
    pub score: Option<Var>,
    pub source: Expr,
    /// `allowing empty`: an empty source still emits one tuple with the
    /// variable bound to the empty sequence.
    pub allow_empty: bool,
    /// Predicate absorbed from a following Where; filters source items
    /// before the binding is exposed and before positions are assigned.
    pub filter: Option<Expr>,
}

impl For {
    pub fn new(var: Var, source: Expr) -> Self {
        Self { var, pos: None, score: None, source, allow_empty: false, filter: None }
    }

    pub fn with_pos(mut self, pos: Var) -> Self {
        self.pos = Some(pos);
        self
    }

    pub fn allowing_empty(mut self) -> Self {
        self.allow_empty = true;
        self
    }

    /// Per-tuple fan-out, if statically known.
    fn source_size(&self) -> Option<u64> {
        if self.filter.is_some() {
            return None;
        }
        let size = self.source.size()?;
        Some(if self.allow_empty { size.max(1) } else { size })
    }
}

/// `let $var := expr` — binds the whole value once per tuple.
#[derive(Debug, Clone)]
pub struct Let {
    pub var: Var,
    pub expr: Expr,
    /// `let score $var := expr`; binds 0.0 (no scoring subsystem).
    pub score: bool,
}

impl Let {
    pub fn new(var: Var, expr: Expr) -> Self {
        Self { var, expr, score: false }
    }
}

/// `where pred` — discards tuples whose predicate is false.
#[derive(Debug, Clone)]
pub struct Where {
    pub pred: Expr,
}

impl Where {
    pub fn new(pred: Expr) -> Self {
        Self { pred }
    }
}

/// One `order by` key.
#[derive(Debug, Clone)]
pub struct SortKey {
    pub expr: Expr,
    pub descending: bool,
    pub empty_least: bool,
    pub collation: Option<String>,
}

impl SortKey {
    pub fn new(expr: Expr) -> Self {
        Self { expr, descending: false, empty_least: true, collation: None }
    }

    pub fn descending(mut self) -> Self {
        self.descending = true;
        self
    }

    pub fn empty_greatest(mut self) -> Self {
        self.empty_least = false;
        self
    }
}

/// `order by keys` — materializes all tuples, re-emits them sorted.
/// `refs` lists the variables whose bindings must survive the reordering;
/// dead entries are cleaned by the optimizer.
#[derive(Debug, Clone)]
pub struct OrderBy {
    pub refs: Vec<Var>,
    pub keys: Vec<SortKey>,
}

impl OrderBy {
    pub fn new(refs: Vec<Var>, keys: Vec<SortKey>) -> Self {
        Self { refs, keys }
    }
}

/// One grouping key: declares `var` and groups by the atomized value of
/// `expr`.
#[derive(Debug, Clone)]
pub struct GroupSpec {
    pub var: Var,
    pub expr: Expr,
    pub collation: Option<String>,
}

impl GroupSpec {
    pub fn new(var: Var, expr: Expr) -> Self {
        Self { var, expr, collation: None }
    }
}

/// A non-grouped variable carried across the grouping boundary: the
/// post-group variable holds the concatenation of the pre-group bindings of
/// all member tuples.
#[derive(Debug, Clone)]
pub struct Aggregate {
    pub pre: Var,
    pub post: Var,
}

/// `group by specs` — merges tuples with equal key vectors.
#[derive(Debug, Clone)]
pub struct GroupBy {
    pub specs: Vec<GroupSpec>,
    pub aggregates: Vec<Aggregate>,
}

impl GroupBy {
    pub fn new(specs: Vec<GroupSpec>, aggregates: Vec<Aggregate>) -> Self {
        Self { specs, aggregates }
    }
}

/// Start or end condition of a window: optional item/pos variables visible
/// to the predicate (and, for end conditions, to everything downstream).
#[derive(Debug, Clone)]
pub struct WindowCond {
    pub item: Option<Var>,
    pub pos: Option<Var>,
    pub pred: Expr,
}

impl WindowCond {
    pub fn new(pred: Expr) -> Self {
        Self { item: None, pos: None, pred }
    }

    pub fn with_item(mut self, item: Var) -> Self {
        self.item = Some(item);
        self
    }

    pub fn with_pos(mut self, pos: Var) -> Self {
        self.pos = Some(pos);
        self
    }
}

/// `for tumbling|sliding window $var in source start ... end ...`.
#[derive(Debug, Clone)]
pub struct Window {
    pub sliding: bool,
    pub var: Var,
    pub source: Expr,
    pub start: WindowCond,
    pub end: Option<WindowCond>,
    /// `only end`: windows whose end condition never holds are dropped.
    pub only_end: bool,
}

/// `count $var` — passes tuples through, binding a 1-based running counter.
#[derive(Debug, Clone)]
pub struct Count {
    pub var: Var,
}

#[derive(Debug, Clone)]
pub enum Clause {
    For(For),
    Let(Let),
    Where(Where),
    OrderBy(OrderBy),
    GroupBy(GroupBy),
    Window(Window),
    Count(Count),
}

impl Clause {
    /// All variables this clause declares, in declaration order.
    pub fn declared_vars(&self) -> SmallVec<[&Var; 4]> {
        let mut out = SmallVec::new();
        match self {
            Clause::For(f) => {
                out.push(&f.var);
                out.extend(f.pos.as_ref());
                out.extend(f.score.as_ref());
            }
            Clause::Let(l) => out.push(&l.var),
            Clause::Where(_) => {}
            Clause::OrderBy(_) => {}
            Clause::GroupBy(g) => {
                out.extend(g.specs.iter().map(|s| &s.var));
                out.extend(g.aggregates.iter().map(|a| &a.post));
            }
            Clause::Window(w) => {
                out.push(&w.var);
                out.extend(w.start.item.as_ref());
                out.extend(w.start.pos.as_ref());
                if let Some(end) = &w.end {
                    out.extend(end.item.as_ref());
                    out.extend(end.pos.as_ref());
                }
            }
            Clause::Count(c) => out.push(&c.var),
        }
        out
    }

    pub fn declares(&self, id: VarId) -> bool {
        self.declared_vars().iter().any(|v| v.id == id)
    }

    /// Variable identities read by this clause's sub-expressions.
    pub fn free_vars(&self) -> HashSet<VarId> {
        let mut out = HashSet::new();
        self.collect_free_vars(&mut out);
        out
    }

    pub(crate) fn collect_free_vars(&self, out: &mut HashSet<VarId>) {
        self.for_each_expr(&mut |e| e.collect_free_vars(out));
    }

    pub fn uses(&self, flag: Flag) -> bool {
        let mut found = false;
        self.for_each_expr(&mut |e| found |= e.uses(flag));
        found
    }

    /// Lexical usage of a variable inside this clause's sub-expressions.
    pub(crate) fn count_var(&self, id: VarId) -> VarUsage {
        let mut usage = VarUsage::Never;
        self.for_each_expr(&mut |e| usage = usage.plus(e.count_var(id)));
        usage
    }

    fn for_each_expr(&self, f: &mut dyn FnMut(&Expr)) {
        match self {
            Clause::For(c) => {
                f(&c.source);
                if let Some(p) = &c.filter {
                    f(p);
                }
            }
            Clause::Let(c) => f(&c.expr),
            Clause::Where(c) => f(&c.pred),
            Clause::OrderBy(c) => {
                for k in &c.keys {
                    f(&k.expr);
                }
            }
            Clause::GroupBy(c) => {
                for s in &c.specs {
                    f(&s.expr);
                }
            }
            Clause::Window(c) => {
                f(&c.source);
                f(&c.start.pred);
                if let Some(end) = &c.end {
                    f(&end.pred);
                }
            }
            Clause::Count(_) => {}
        }
    }

    fn map_exprs(&mut self, f: &mut dyn FnMut(Expr) -> Result<Expr, Error>) -> Result<(), Error> {
        use std::mem::replace;
        match self {
            Clause::For(c) => {
                c.source = f(replace(&mut c.source, Expr::Empty))?;
                if let Some(p) = c.filter.take() {
                    c.filter = Some(f(p)?);
                }
            }
            Clause::Let(c) => c.expr = f(replace(&mut c.expr, Expr::Empty))?,
            Clause::Where(c) => c.pred = f(replace(&mut c.pred, Expr::Empty))?,
            Clause::OrderBy(c) => {
                for k in &mut c.keys {
                    k.expr = f(replace(&mut k.expr, Expr::Empty))?;
                }
            }
            Clause::GroupBy(c) => {
                for s in &mut c.specs {
                    s.expr = f(replace(&mut s.expr, Expr::Empty))?;
                }
            }
            Clause::Window(c) => {
                c.source = f(replace(&mut c.source, Expr::Empty))?;
                c.start.pred = f(replace(&mut c.start.pred, Expr::Empty))?;
                if let Some(end) = &mut c.end {
                    end.pred = f(replace(&mut end.pred, Expr::Empty))?;
                }
            }
            Clause::Count(_) => {}
        }
        Ok(())
    }

    /// Local compilation: constant-folds every sub-expression.
    pub(crate) fn compile(&mut self, cx: &mut CompileContext) -> Result<(), Error> {
        self.map_exprs(&mut |e| e.optimize(cx))
    }

    /// Substitutes a variable in every sub-expression. Returns whether
    /// anything changed.
    pub(crate) fn inline(&mut self, id: VarId, replacement: &Expr) -> bool {
        let mut changed = false;
        self.map_exprs(&mut |e| {
            Ok(match e.substitute(id, replacement) {
                Some(new) => {
                    changed = true;
                    new
                }
                None => e,
            })
        })
        .expect("substitution cannot fail");
        changed
    }

    /// Number of outgoing tuples for `incoming` incoming ones, if statically
    /// known. Zero absorbs; unknown poisons.
    pub fn calc_size(&self, incoming: Option<u64>) -> Option<u64> {
        match self {
            Clause::For(f) => mul_size(incoming, f.source_size()),
            Clause::Let(_) | Clause::Count(_) | Clause::OrderBy(_) => incoming,
            // Constant predicates are normalized to boolean literals during
            // local compilation.
            Clause::Where(w) => match &w.pred {
                Expr::Literal(AtomicValue::Boolean(true)) => incoming,
                Expr::Literal(AtomicValue::Boolean(false)) => Some(0),
                _ => match incoming {
                    Some(0) => Some(0),
                    _ => None,
                },
            },
            Clause::GroupBy(_) => match incoming {
                Some(n) if n <= 1 => Some(n),
                _ => None,
            },
            Clause::Window(_) => match incoming {
                Some(0) => Some(0),
                _ => None,
            },
        }
    }

    /// Per-tuple output multiplicity used to scale variable-usage counts.
    /// Unlike [`calc_size`](Clause::calc_size), a filtering clause reports 1:
    /// it can evaluate a downstream reference at most once per tuple.
    pub(crate) fn fanout(&self) -> Option<u64> {
        match self {
            Clause::For(f) => f.source_size(),
            Clause::Window(_) => None,
            _ => Some(1),
        }
    }

    /// Whether `moving` may be relocated above this clause: true when this
    /// clause declares no variable the moving clause references.
    pub fn skippable(&self, moving: &Clause) -> bool {
        let read = moving.free_vars();
        !self.declared_vars().iter().any(|v| read.contains(&v.id))
    }

    /// Drops projection components that are dead according to `live`.
    /// Sort keys and grouping keys are semantics-bearing and never dropped.
    pub(crate) fn clean(&mut self, live: &HashSet<VarId>) -> bool {
        match self {
            Clause::OrderBy(o) => {
                let before = o.refs.len();
                o.refs.retain(|v| live.contains(&v.id));
                o.refs.len() != before
            }
            Clause::GroupBy(g) => {
                let before = g.aggregates.len();
                g.aggregates.retain(|a| live.contains(&a.post.id));
                g.aggregates.len() != before
            }
            _ => false,
        }
    }
}

impl fmt::Display for Clause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Clause::For(c) => {
                write!(f, "for {}", c.var)?;
                if let Some(p) = &c.pos {
                    write!(f, " at {}", p)?;
                }
                if c.allow_empty {
                    write!(f, " allowing empty")?;
                }
                write!(f, " in {}", c.source)?;
                if let Some(p) = &c.filter {
                    write!(f, "[{}]", p)?;
                }
                Ok(())
            }
            Clause::Let(c) => {
                if c.score {
                    write!(f, "let score {} := {}", c.var, c.expr)
                } else {
                    write!(f, "let {} := {}", c.var, c.expr)
                }
            }
            Clause::Where(c) => write!(f, "where {}", c.pred),
            Clause::OrderBy(c) => {
                let keys = c
                    .keys
                    .iter()
                    .map(|k| {
                        format!(
                            "{}{}",
                            k.expr,
                            if k.descending { " descending" } else { "" }
                        )
                    })
                    .join(", ");
                write!(f, "order by {}", keys)
            }
            Clause::GroupBy(c) => {
                write!(f, "group by {}", c.specs.iter().map(|s| format!("{} := {}", s.var, s.expr)).join(", "))
            }
            Clause::Window(c) => {
                write!(
                    f,
                    "for {} window {} in {} start when {}",
                    if c.sliding { "sliding" } else { "tumbling" },
                    c.var,
                    c.source,
                    c.start.pred
                )?;
                if let Some(end) = &c.end {
                    write!(f, " {}end when {}", if c.only_end { "only " } else { "" }, end.pred)?;
                }
                Ok(())
            }
            Clause::Count(c) => write!(f, "count {}", c.var),
        }
    }
}
