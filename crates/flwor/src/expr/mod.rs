//! The closed expression algebra the pipeline operates over.
//!
//! The pipeline itself treats expressions opaquely through a narrow contract:
//! static type ([`Expr::seq_type`]), static cardinality ([`Expr::size`]),
//! effect flags ([`Expr::uses`]), lazy evaluation ([`Expr::stream`]),
//! substitution with a no-change sentinel ([`Expr::substitute`]) and free
//! variable collection ([`Expr::free_vars`]). The variants below are the
//! minimum algebra needed to exercise every clause and rewrite rule.

use crate::pipeline::Pipeline;
use crate::pipeline::usage::VarUsage;
use crate::runtime::{CompileContext, Error, FunctionDef, FunctionRegistry};
use crate::types::{ItemType, Occurrence, SeqType};
use crate::var::{Var, VarId};
use crate::xdm::{AtomicValue, Sequence};
use core::fmt;
use itertools::Itertools;
use std::collections::HashSet;
use std::rc::Rc;

pub mod eval;

/// Queryable effect and dependency flags.
///
/// Every rewrite rule is gated on these: NDT pins evaluation count and
/// order, CNS pins construction identity, CTX blocks inlining across
/// context boundaries, UPD blocks dead-code collapse, VAR reports variable
/// dependencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flag {
    /// Context-dependent.
    Ctx,
    /// Non-deterministic: may yield different results across calls.
    Ndt,
    /// Constructs new identity-bearing values.
    Cns,
    /// Performs updates.
    Upd,
    /// Contains variable references.
    Var,
}

impl Flag {
    pub(crate) fn bit(self) -> u8 {
        match self {
            Flag::Ctx => 1,
            Flag::Ndt => 1 << 1,
            Flag::Cns => 1 << 2,
            Flag::Upd => 1 << 3,
            Flag::Var => 1 << 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    IDiv,
    Mod,
}

impl ArithOp {
    fn symbol(&self) -> &'static str {
        match self {
            ArithOp::Add => "+",
            ArithOp::Sub => "-",
            ArithOp::Mul => "*",
            ArithOp::Div => "div",
            ArithOp::IDiv => "idiv",
            ArithOp::Mod => "mod",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    fn symbol(&self) -> &'static str {
        match self {
            CmpOp::Eq => "=",
            CmpOp::Ne => "!=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
        }
    }
}

#[derive(Debug, Clone)]
pub enum Expr {
    /// The empty sequence `()`.
    Empty,
    Literal(AtomicValue),
    /// Sequence concatenation `(a, b, ...)`.
    Seq(Vec<Expr>),
    /// Integer range `a to b`.
    Range(Box<Expr>, Box<Expr>),
    VarRef(Var),
    Arith { op: ArithOp, lhs: Box<Expr>, rhs: Box<Expr> },
    /// General comparison: existential over both operand sequences.
    Cmp { op: CmpOp, lhs: Box<Expr>, rhs: Box<Expr> },
    And(Vec<Expr>),
    Or(Vec<Expr>),
    If { cond: Box<Expr>, then_branch: Box<Expr>, else_branch: Box<Expr> },
    Call { func: Rc<FunctionDef>, args: Vec<Expr> },
    Pipeline(Box<Pipeline>),
}

impl Expr {
    pub fn int(i: i64) -> Expr {
        Expr::Literal(AtomicValue::Integer(i))
    }

    pub fn double(d: f64) -> Expr {
        Expr::Literal(AtomicValue::Double(d))
    }

    pub fn boolean(b: bool) -> Expr {
        Expr::Literal(AtomicValue::Boolean(b))
    }

    pub fn string(s: &str) -> Expr {
        Expr::Literal(AtomicValue::string(s))
    }

    pub fn var(var: &Var) -> Expr {
        Expr::VarRef(var.clone())
    }

    pub fn seq(items: Vec<Expr>) -> Expr {
        Expr::Seq(items)
    }

    /// Literal integer sequence `(a, b, ...)`.
    pub fn int_seq(values: impl IntoIterator<Item = i64>) -> Expr {
        Expr::Seq(values.into_iter().map(Expr::int).collect())
    }

    pub fn range(start: Expr, end: Expr) -> Expr {
        Expr::Range(Box::new(start), Box::new(end))
    }

    pub fn arith(op: ArithOp, lhs: Expr, rhs: Expr) -> Expr {
        Expr::Arith { op, lhs: Box::new(lhs), rhs: Box::new(rhs) }
    }

    pub fn add(lhs: Expr, rhs: Expr) -> Expr {
        Expr::arith(ArithOp::Add, lhs, rhs)
    }

    pub fn mul(lhs: Expr, rhs: Expr) -> Expr {
        Expr::arith(ArithOp::Mul, lhs, rhs)
    }

    pub fn cmp(op: CmpOp, lhs: Expr, rhs: Expr) -> Expr {
        Expr::Cmp { op, lhs: Box::new(lhs), rhs: Box::new(rhs) }
    }

    pub fn gt(lhs: Expr, rhs: Expr) -> Expr {
        Expr::cmp(CmpOp::Gt, lhs, rhs)
    }

    pub fn eq(lhs: Expr, rhs: Expr) -> Expr {
        Expr::cmp(CmpOp::Eq, lhs, rhs)
    }

    pub fn if_then_else(cond: Expr, then_branch: Expr, else_branch: Expr) -> Expr {
        Expr::If { cond: Box::new(cond), then_branch: Box::new(then_branch), else_branch: Box::new(else_branch) }
    }

    /// Resolves `name` against the registry and builds a call expression.
    pub fn call(registry: &FunctionRegistry, name: &str, args: Vec<Expr>) -> Result<Expr, Error> {
        let func = registry.resolve(name, args.len())?;
        Ok(Expr::Call { func, args })
    }

    /// Static result type.
    pub fn seq_type(&self) -> SeqType {
        match self {
            Expr::Empty => SeqType::zero_or_more(ItemType::AnyAtomic),
            Expr::Literal(v) => SeqType::one(ItemType::of(v)),
            Expr::Seq(items) => {
                let item = items.iter().map(|e| e.seq_type().item).reduce(ItemType::union).unwrap_or(ItemType::AnyAtomic);
                let occ = if items.iter().all(|e| matches!(e.seq_type().occ, Occurrence::One | Occurrence::OneOrMore))
                    && !items.is_empty()
                {
                    Occurrence::OneOrMore
                } else {
                    Occurrence::ZeroOrMore
                };
                SeqType { item, occ }
            }
            Expr::Range(..) => SeqType::zero_or_more(ItemType::Integer),
            Expr::VarRef(var) => var.declared,
            Expr::Arith { lhs, rhs, .. } => {
                let item = lhs.seq_type().item.union(rhs.seq_type().item);
                let item = if item.is_numeric() { item } else { ItemType::AnyAtomic };
                SeqType::zero_or_one(item)
            }
            Expr::Cmp { .. } | Expr::And(_) | Expr::Or(_) => SeqType::one(ItemType::Boolean),
            Expr::If { then_branch, else_branch, .. } => {
                let t = then_branch.seq_type();
                let e = else_branch.seq_type();
                SeqType { item: t.item.union(e.item), occ: if t.occ == e.occ { t.occ } else { Occurrence::ZeroOrMore } }
            }
            Expr::Call { .. } => SeqType::ANY,
            Expr::Pipeline(p) => p.seq_type(),
        }
    }

    /// Static result cardinality; `None` when unknown.
    pub fn size(&self) -> Option<u64> {
        match self {
            Expr::Empty => Some(0),
            Expr::Literal(_) => Some(1),
            Expr::Seq(items) => items.iter().map(Expr::size).try_fold(0u64, |acc, s| Some(acc + s?)),
            Expr::Range(start, end) => match (start.as_ref(), end.as_ref()) {
                (Expr::Literal(AtomicValue::Integer(a)), Expr::Literal(AtomicValue::Integer(b))) => {
                    Some(if b < a { 0 } else { (b - a) as u64 + 1 })
                }
                _ => None,
            },
            Expr::VarRef(var) => var.declared.size(),
            Expr::Arith { lhs, rhs, .. } => match (lhs.size(), rhs.size()) {
                (Some(0), _) | (_, Some(0)) => Some(0),
                (Some(1), Some(1)) => Some(1),
                _ => None,
            },
            Expr::Cmp { .. } | Expr::And(_) | Expr::Or(_) => Some(1),
            Expr::If { then_branch, else_branch, .. } => {
                let t = then_branch.size();
                (t == else_branch.size()).then_some(t).flatten()
            }
            Expr::Call { .. } => None,
            Expr::Pipeline(p) => p.calc_size(),
        }
    }

    /// Whether the expression (transitively) carries the given flag.
    pub fn uses(&self, flag: Flag) -> bool {
        match self {
            Expr::Empty | Expr::Literal(_) => false,
            Expr::VarRef(_) => flag == Flag::Var,
            Expr::Seq(items) | Expr::And(items) | Expr::Or(items) => items.iter().any(|e| e.uses(flag)),
            Expr::Range(lhs, rhs) | Expr::Arith { lhs, rhs, .. } | Expr::Cmp { lhs, rhs, .. } => {
                lhs.uses(flag) || rhs.uses(flag)
            }
            Expr::If { cond, then_branch, else_branch } => {
                cond.uses(flag) || then_branch.uses(flag) || else_branch.uses(flag)
            }
            Expr::Call { func, args } => func.uses(flag) || args.iter().any(|e| e.uses(flag)),
            Expr::Pipeline(p) => p.uses(flag),
        }
    }

    /// Identities of all variables referenced anywhere below this node.
    pub fn free_vars(&self) -> HashSet<VarId> {
        let mut out = HashSet::new();
        self.collect_free_vars(&mut out);
        out
    }

    pub(crate) fn collect_free_vars(&self, out: &mut HashSet<VarId>) {
        match self {
            Expr::Empty | Expr::Literal(_) => {}
            Expr::VarRef(var) => {
                out.insert(var.id);
            }
            Expr::Seq(items) | Expr::And(items) | Expr::Or(items) => {
                for e in items {
                    e.collect_free_vars(out);
                }
            }
            Expr::Range(lhs, rhs) | Expr::Arith { lhs, rhs, .. } | Expr::Cmp { lhs, rhs, .. } => {
                lhs.collect_free_vars(out);
                rhs.collect_free_vars(out);
            }
            Expr::If { cond, then_branch, else_branch } => {
                cond.collect_free_vars(out);
                then_branch.collect_free_vars(out);
                else_branch.collect_free_vars(out);
            }
            Expr::Call { args, .. } => {
                for e in args {
                    e.collect_free_vars(out);
                }
            }
            Expr::Pipeline(p) => p.collect_free_vars(out),
        }
    }

    /// Lexical usage count of one variable. Conditional branches are summed,
    /// which errs on the side of `Multiple` and therefore blocks rather than
    /// enables rewrites.
    pub(crate) fn count_var(&self, id: VarId) -> VarUsage {
        match self {
            Expr::Empty | Expr::Literal(_) => VarUsage::Never,
            Expr::VarRef(var) => {
                if var.id == id {
                    VarUsage::Once
                } else {
                    VarUsage::Never
                }
            }
            Expr::Seq(items) | Expr::And(items) | Expr::Or(items) => {
                items.iter().fold(VarUsage::Never, |acc, e| acc.plus(e.count_var(id)))
            }
            Expr::Range(lhs, rhs) | Expr::Arith { lhs, rhs, .. } | Expr::Cmp { lhs, rhs, .. } => {
                lhs.count_var(id).plus(rhs.count_var(id))
            }
            Expr::If { cond, then_branch, else_branch } => {
                cond.count_var(id).plus(then_branch.count_var(id)).plus(else_branch.count_var(id))
            }
            Expr::Call { args, .. } => args.iter().fold(VarUsage::Never, |acc, e| acc.plus(e.count_var(id))),
            Expr::Pipeline(p) => p.count_uses(id, 0),
        }
    }

    /// Substitutes every reference to `id` with `replacement`. Returns
    /// `None` when nothing below this node changed.
    pub fn substitute(&self, id: VarId, replacement: &Expr) -> Option<Expr> {
        match self {
            Expr::Empty | Expr::Literal(_) => None,
            Expr::VarRef(var) => (var.id == id).then(|| replacement.clone()),
            Expr::Seq(items) => subst_vec(items, id, replacement).map(Expr::Seq),
            Expr::And(items) => subst_vec(items, id, replacement).map(Expr::And),
            Expr::Or(items) => subst_vec(items, id, replacement).map(Expr::Or),
            Expr::Range(lhs, rhs) => {
                subst_pair(lhs, rhs, id, replacement).map(|(l, r)| Expr::Range(Box::new(l), Box::new(r)))
            }
            Expr::Arith { op, lhs, rhs } => subst_pair(lhs, rhs, id, replacement)
                .map(|(l, r)| Expr::Arith { op: *op, lhs: Box::new(l), rhs: Box::new(r) }),
            Expr::Cmp { op, lhs, rhs } => subst_pair(lhs, rhs, id, replacement)
                .map(|(l, r)| Expr::Cmp { op: *op, lhs: Box::new(l), rhs: Box::new(r) }),
            Expr::If { cond, then_branch, else_branch } => {
                let c = cond.substitute(id, replacement);
                let t = then_branch.substitute(id, replacement);
                let e = else_branch.substitute(id, replacement);
                if c.is_none() && t.is_none() && e.is_none() {
                    return None;
                }
                Some(Expr::If {
                    cond: Box::new(c.unwrap_or_else(|| (**cond).clone())),
                    then_branch: Box::new(t.unwrap_or_else(|| (**then_branch).clone())),
                    else_branch: Box::new(e.unwrap_or_else(|| (**else_branch).clone())),
                })
            }
            Expr::Call { func, args } => {
                subst_vec(args, id, replacement).map(|args| Expr::Call { func: Rc::clone(func), args })
            }
            Expr::Pipeline(p) => p.substitute(id, replacement).map(|p| Expr::Pipeline(Box::new(p))),
        }
    }

    /// The materialized constant value, if this expression is one.
    pub fn as_const(&self) -> Option<Sequence> {
        match self {
            Expr::Empty => Some(Vec::new()),
            Expr::Literal(v) => Some(vec![v.clone()]),
            Expr::Seq(items) => {
                let mut out = Vec::with_capacity(items.len());
                for e in items {
                    out.extend(e.as_const()?);
                }
                Some(out)
            }
            _ => None,
        }
    }

    /// Whether splicing this expression into another position preserves
    /// every externally observable behavior. Function calls delegate to the
    /// resolution collaborator's own answer.
    pub fn safe_to_inline(&self) -> bool {
        match self {
            Expr::Empty | Expr::Literal(_) | Expr::VarRef(_) => true,
            Expr::Call { func, args } => func.inlineable() && args.iter().all(Expr::safe_to_inline),
            Expr::Seq(items) | Expr::And(items) | Expr::Or(items) => items.iter().all(Expr::safe_to_inline),
            Expr::Range(lhs, rhs) | Expr::Arith { lhs, rhs, .. } | Expr::Cmp { lhs, rhs, .. } => {
                lhs.safe_to_inline() && rhs.safe_to_inline()
            }
            Expr::If { cond, then_branch, else_branch } => {
                cond.safe_to_inline() && then_branch.safe_to_inline() && else_branch.safe_to_inline()
            }
            Expr::Pipeline(p) => {
                !(p.uses(Flag::Ndt) || p.uses(Flag::Cns) || p.uses(Flag::Ctx) || p.uses(Flag::Upd))
            }
        }
    }

    /// Cheap to re-evaluate: a literal, a variable reference, or one
    /// arithmetic/comparison step over those. Used by the inlining pass.
    pub(crate) fn is_cheap(&self) -> bool {
        fn is_leaf(e: &Expr) -> bool {
            matches!(e, Expr::Empty | Expr::Literal(_) | Expr::VarRef(_))
        }
        match self {
            Expr::Empty | Expr::Literal(_) | Expr::VarRef(_) => true,
            Expr::Arith { lhs, rhs, .. } | Expr::Cmp { lhs, rhs, .. } => is_leaf(lhs) && is_leaf(rhs),
            _ => false,
        }
    }

    /// Local simplification: constant folding and nested-pipeline
    /// compilation, bottom-up. Folding a constant sub-expression can raise
    /// the same evaluation error the expression would raise at run time.
    pub fn optimize(self, cx: &mut CompileContext) -> Result<Expr, Error> {
        Ok(match self {
            Expr::Empty | Expr::Literal(_) | Expr::VarRef(_) => self,
            Expr::Seq(items) => {
                let mut out = Vec::with_capacity(items.len());
                for e in items {
                    match e.optimize(cx)? {
                        Expr::Empty => {}
                        Expr::Seq(inner) => out.extend(inner),
                        other => out.push(other),
                    }
                }
                match out.len() {
                    0 => Expr::Empty,
                    1 => out.into_iter().next().expect("singleton checked"),
                    _ => Expr::Seq(out),
                }
            }
            Expr::Range(start, end) => {
                let start = start.optimize(cx)?;
                let end = end.optimize(cx)?;
                if let (Expr::Literal(AtomicValue::Integer(a)), Expr::Literal(AtomicValue::Integer(b))) =
                    (&start, &end)
                {
                    if b < a {
                        return Ok(Expr::Empty);
                    }
                    if a == b {
                        return Ok(Expr::int(*a));
                    }
                }
                Expr::range(start, end)
            }
            Expr::Arith { op, lhs, rhs } => {
                let lhs = lhs.optimize(cx)?;
                let rhs = rhs.optimize(cx)?;
                if let (Some(a), Some(b)) = (lhs.as_const(), rhs.as_const()) {
                    return match eval::arith_value(op, &a, &b)? {
                        Some(v) => Ok(Expr::Literal(v)),
                        None => Ok(Expr::Empty),
                    };
                }
                Expr::arith(op, lhs, rhs)
            }
            Expr::Cmp { op, lhs, rhs } => {
                let lhs = lhs.optimize(cx)?;
                let rhs = rhs.optimize(cx)?;
                if let (Some(a), Some(b)) = (lhs.as_const(), rhs.as_const()) {
                    return Ok(Expr::boolean(eval::general_cmp_const(op, &a, &b)?));
                }
                Expr::cmp(op, lhs, rhs)
            }
            Expr::And(items) => fold_connective(items, cx, true)?,
            Expr::Or(items) => fold_connective(items, cx, false)?,
            Expr::If { cond, then_branch, else_branch } => {
                let cond = cond.optimize(cx)?;
                if let Some(c) = cond.as_const() {
                    let branch = if crate::xdm::ebv(&c)? { then_branch } else { else_branch };
                    return branch.optimize(cx);
                }
                Expr::If {
                    cond: Box::new(cond),
                    then_branch: Box::new(then_branch.optimize(cx)?),
                    else_branch: Box::new(else_branch.optimize(cx)?),
                }
            }
            Expr::Call { func, args } => {
                let args = args.into_iter().map(|a| a.optimize(cx)).collect::<Result<Vec<_>, _>>()?;
                Expr::Call { func, args }
            }
            Expr::Pipeline(p) => p.compile(cx)?,
        })
    }
}

fn subst_vec(items: &[Expr], id: VarId, replacement: &Expr) -> Option<Vec<Expr>> {
    let changed: Vec<Option<Expr>> = items.iter().map(|e| e.substitute(id, replacement)).collect();
    if changed.iter().all(Option::is_none) {
        return None;
    }
    Some(
        items
            .iter()
            .zip(changed)
            .map(|(orig, new)| new.unwrap_or_else(|| orig.clone()))
            .collect(),
    )
}

fn subst_pair(lhs: &Expr, rhs: &Expr, id: VarId, replacement: &Expr) -> Option<(Expr, Expr)> {
    let l = lhs.substitute(id, replacement);
    let r = rhs.substitute(id, replacement);
    if l.is_none() && r.is_none() {
        return None;
    }
    Some((l.unwrap_or_else(|| lhs.clone()), r.unwrap_or_else(|| rhs.clone())))
}

// Shared folding for and/or: neutral constants are dropped, an absorbing
// constant short-circuits once the other operands are values too.
fn fold_connective(items: Vec<Expr>, cx: &mut CompileContext, is_and: bool) -> Result<Expr, Error> {
    let mut out = Vec::with_capacity(items.len());
    let mut absorbed = false;
    for e in items {
        let e = e.optimize(cx)?;
        if let Some(c) = e.as_const() {
            let truth = crate::xdm::ebv(&c)?;
            if truth == is_and {
                continue; // neutral element
            }
            absorbed = true;
            continue;
        }
        out.push(e);
    }
    if absorbed && out.is_empty() {
        return Ok(Expr::boolean(!is_and));
    }
    if absorbed {
        // Absorbing constant present but non-constant operands remain; keep
        // them for their effects and re-attach the constant.
        out.push(Expr::boolean(!is_and));
    }
    Ok(match out.len() {
        0 => Expr::boolean(is_and),
        1 => out.into_iter().next().expect("singleton checked"),
        _ => {
            if is_and {
                Expr::And(out)
            } else {
                Expr::Or(out)
            }
        }
    })
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Empty => f.write_str("()"),
            Expr::Literal(v) => write!(f, "{}", v),
            Expr::Seq(items) => write!(f, "({})", items.iter().join(", ")),
            Expr::Range(start, end) => write!(f, "{} to {}", start, end),
            Expr::VarRef(var) => write!(f, "{}", var),
            Expr::Arith { op, lhs, rhs } => write!(f, "{} {} {}", lhs, op.symbol(), rhs),
            Expr::Cmp { op, lhs, rhs } => write!(f, "{} {} {}", lhs, op.symbol(), rhs),
            Expr::And(items) => write!(f, "({})", items.iter().join(" and ")),
            Expr::Or(items) => write!(f, "({})", items.iter().join(" or ")),
            Expr::If { cond, then_branch, else_branch } => {
                write!(f, "if ({}) then {} else {}", cond, then_branch, else_branch)
            }
            Expr::Call { func, args } => write!(f, "{}({})", func.name, args.iter().join(", ")),
            Expr::Pipeline(p) => write!(f, "({})", p),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::var::VarScope;

    #[test]
    fn folding_arithmetic() {
        let mut cx = CompileContext::new();
        let e = Expr::mul(Expr::int(6), Expr::int(7)).optimize(&mut cx).unwrap();
        assert!(matches!(e, Expr::Literal(AtomicValue::Integer(42))));
    }

    #[test]
    fn folding_surfaces_evaluation_errors() {
        let mut cx = CompileContext::new();
        let err = Expr::arith(ArithOp::IDiv, Expr::int(1), Expr::int(0)).optimize(&mut cx).unwrap_err();
        assert_eq!(err.code, crate::runtime::ErrorCode::FOAR0001);
    }

    #[test]
    fn substitute_reports_no_change() {
        let mut scope = VarScope::new();
        let x = scope.declare("x", SeqType::one(ItemType::Integer));
        let y = scope.declare("y", SeqType::one(ItemType::Integer));
        let e = Expr::add(Expr::var(&x), Expr::int(1));
        assert!(e.substitute(y.id, &Expr::int(9)).is_none());
        let replaced = e.substitute(x.id, &Expr::int(9)).unwrap();
        assert_eq!(replaced.as_const(), None); // still an arith node
        assert!(replaced.free_vars().is_empty());
    }

    #[test]
    fn range_size_is_static_for_literals() {
        assert_eq!(Expr::range(Expr::int(3), Expr::int(7)).size(), Some(5));
        assert_eq!(Expr::range(Expr::int(7), Expr::int(3)).size(), Some(0));
    }
}
