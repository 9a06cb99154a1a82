//! Expression evaluation against a [`QueryContext`].
//!
//! Sequence-shaped variants (ranges, concatenations, nested pipelines)
//! evaluate to lazy streams; scalar operators materialize their (at most
//! singleton) operands directly.

use super::{ArithOp, CmpOp, Expr};
use crate::collation::{Collation, CodepointCollation, resolve_collation};
use crate::runtime::{CallCtx, Error, ErrorCode, QueryContext};
use crate::xdm::{AtomicValue, ItemResult, Sequence, SequenceCursor, SequenceStream};
use rust_decimal::Decimal;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};

impl Expr {
    /// Lazy evaluation. Errors inside the sequence surface while pulling;
    /// errors in scalar operands surface immediately.
    pub fn stream(&self, qc: &QueryContext) -> Result<SequenceStream, Error> {
        match self {
            Expr::Empty => Ok(SequenceStream::empty()),
            Expr::Literal(v) => Ok(SequenceStream::from_item(v.clone())),
            Expr::Seq(items) => Ok(SequenceStream::new(SeqConcatCursor {
                qc: qc.clone(),
                parts: items.clone(),
                idx: 0,
                current: None,
            })),
            Expr::Range(start, end) => {
                let Some(a) = integer_operand(start, qc)? else { return Ok(SequenceStream::empty()) };
                let Some(b) = integer_operand(end, qc)? else { return Ok(SequenceStream::empty()) };
                Ok(SequenceStream::new(RangeCursor { next: a, end: b }))
            }
            Expr::VarRef(var) => Ok(SequenceStream::from_vec(qc.get(var)?)),
            Expr::Pipeline(p) => Ok(p.stream(qc)),
            _ => Ok(SequenceStream::from_vec(self.value(qc)?)),
        }
    }

    /// Materialized evaluation.
    pub fn value(&self, qc: &QueryContext) -> Result<Sequence, Error> {
        match self {
            Expr::Arith { op, lhs, rhs } => {
                let a = lhs.value(qc)?;
                let b = rhs.value(qc)?;
                Ok(arith_value(*op, &a, &b)?.into_iter().collect())
            }
            Expr::Cmp { op, lhs, rhs } => {
                let a = lhs.value(qc)?;
                let b = rhs.value(qc)?;
                let collation = resolve_collation(qc, None)?;
                Ok(vec![AtomicValue::Boolean(general_cmp(*op, &a, &b, collation.as_ref())?)])
            }
            Expr::And(items) => {
                for e in items {
                    if !e.ebv(qc)? {
                        return Ok(vec![AtomicValue::Boolean(false)]);
                    }
                }
                Ok(vec![AtomicValue::Boolean(true)])
            }
            Expr::Or(items) => {
                for e in items {
                    if e.ebv(qc)? {
                        return Ok(vec![AtomicValue::Boolean(true)]);
                    }
                }
                Ok(vec![AtomicValue::Boolean(false)])
            }
            Expr::If { cond, then_branch, else_branch } => {
                if cond.ebv(qc)? {
                    then_branch.value(qc)
                } else {
                    else_branch.value(qc)
                }
            }
            Expr::Call { func, args } => {
                let mut argv = Vec::with_capacity(args.len());
                for a in args {
                    argv.push(a.value(qc)?);
                }
                (func.imp)(&CallCtx { qc }, &argv)
            }
            _ => self.stream(qc)?.materialize(),
        }
    }

    /// Effective boolean value, pulling at most two items.
    pub fn ebv(&self, qc: &QueryContext) -> Result<bool, Error> {
        let mut stream = self.stream(qc)?;
        let Some(first) = stream.next().transpose()? else {
            return Ok(false);
        };
        match stream.next() {
            None => Ok(first.ebv()),
            Some(Err(e)) => Err(e),
            Some(Ok(_)) => Err(Error::from_code(
                ErrorCode::FORG0006,
                "effective boolean value of a sequence with more than one item",
            )),
        }
    }
}

// Singleton-or-empty integer operand (range bounds).
fn integer_operand(expr: &Expr, qc: &QueryContext) -> Result<Option<i64>, Error> {
    let seq = expr.value(qc)?;
    match seq.as_slice() {
        [] => Ok(None),
        [AtomicValue::Integer(i)] => Ok(Some(*i)),
        [AtomicValue::Untyped(s)] => s
            .trim()
            .parse::<i64>()
            .map(Some)
            .map_err(|_| Error::from_code(ErrorCode::FORG0001, format!("cannot cast '{s}' to integer"))),
        [other] => Err(Error::from_code(ErrorCode::XPTY0004, format!("range bound must be an integer, got {other}"))),
        _ => Err(Error::from_code(ErrorCode::FORG0006, "range bound must be a singleton")),
    }
}

struct RangeCursor {
    next: i64,
    end: i64,
}

impl SequenceCursor for RangeCursor {
    fn next_item(&mut self) -> Option<ItemResult> {
        if self.next > self.end {
            return None;
        }
        let v = self.next;
        self.next += 1;
        Some(Ok(AtomicValue::Integer(v)))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = usize::try_from(self.end - self.next + 1).unwrap_or(0);
        (remaining, Some(remaining))
    }
}

// Streams `(a, b, ...)` part by part without materializing the tail.
struct SeqConcatCursor {
    qc: QueryContext,
    parts: Vec<Expr>,
    idx: usize,
    current: Option<SequenceStream>,
}

impl SequenceCursor for SeqConcatCursor {
    fn next_item(&mut self) -> Option<ItemResult> {
        loop {
            if let Some(current) = &mut self.current {
                if let Some(item) = current.next() {
                    return Some(item);
                }
                self.current = None;
            }
            let part = self.parts.get(self.idx)?;
            self.idx += 1;
            match part.stream(&self.qc) {
                Ok(stream) => self.current = Some(stream),
                Err(e) => {
                    self.idx = self.parts.len();
                    return Some(Err(e));
                }
            }
        }
    }
}

#[derive(Clone, Copy)]
enum Num {
    Integer(i64),
    Decimal(Decimal),
    Double(f64),
}

fn numeric_operand(v: &AtomicValue) -> Result<Num, Error> {
    match v {
        AtomicValue::Integer(i) => Ok(Num::Integer(*i)),
        AtomicValue::Decimal(d) => Ok(Num::Decimal(*d)),
        AtomicValue::Double(d) => Ok(Num::Double(*d)),
        AtomicValue::Untyped(s) => s
            .trim()
            .parse::<f64>()
            .map(Num::Double)
            .map_err(|_| Error::from_code(ErrorCode::FORG0001, format!("cannot cast '{s}' to a number"))),
        other => Err(Error::from_code(ErrorCode::XPTY0004, format!("arithmetic on non-numeric operand {other}"))),
    }
}

fn decimal_of(n: Num) -> Decimal {
    match n {
        Num::Integer(i) => Decimal::from(i),
        Num::Decimal(d) => d,
        Num::Double(d) => Decimal::from_f64(d).unwrap_or_default(),
    }
}

fn double_of(n: Num) -> f64 {
    match n {
        Num::Integer(i) => i as f64,
        Num::Decimal(d) => d.to_f64().unwrap_or(f64::NAN),
        Num::Double(d) => d,
    }
}

/// Arithmetic over singleton-or-empty operands. An empty operand yields the
/// empty result (`Ok(None)`).
pub(crate) fn arith_value(op: ArithOp, lhs: &[AtomicValue], rhs: &[AtomicValue]) -> Result<Option<AtomicValue>, Error> {
    let (a, b) = match (lhs, rhs) {
        ([], _) | (_, []) => return Ok(None),
        ([a], [b]) => (a, b),
        _ => return Err(Error::from_code(ErrorCode::FORG0006, "arithmetic operand is not a singleton")),
    };
    let a = numeric_operand(a)?;
    let b = numeric_operand(b)?;
    apply_arith(op, a, b).map(Some)
}

fn apply_arith(op: ArithOp, a: Num, b: Num) -> Result<AtomicValue, Error> {
    // Promote: double wins, then decimal, then integer.
    if matches!(a, Num::Double(_)) || matches!(b, Num::Double(_)) {
        let (x, y) = (double_of(a), double_of(b));
        let r = match op {
            ArithOp::Add => x + y,
            ArithOp::Sub => x - y,
            ArithOp::Mul => x * y,
            ArithOp::Div => x / y,
            ArithOp::IDiv => {
                if y == 0.0 {
                    return Err(Error::from_code(ErrorCode::FOAR0001, "integer division by zero"));
                }
                return Ok(AtomicValue::Integer((x / y).trunc() as i64));
            }
            ArithOp::Mod => x % y,
        };
        return Ok(AtomicValue::Double(r));
    }
    if matches!(a, Num::Decimal(_)) || matches!(b, Num::Decimal(_)) || op == ArithOp::Div {
        let (x, y) = (decimal_of(a), decimal_of(b));
        let r = match op {
            ArithOp::Add => x.checked_add(y),
            ArithOp::Sub => x.checked_sub(y),
            ArithOp::Mul => x.checked_mul(y),
            ArithOp::Div | ArithOp::Mod if y.is_zero() => {
                return Err(Error::from_code(ErrorCode::FOAR0001, "division by zero"));
            }
            ArithOp::Div => x.checked_div(y),
            ArithOp::Mod => x.checked_rem(y),
            ArithOp::IDiv => {
                if y.is_zero() {
                    return Err(Error::from_code(ErrorCode::FOAR0001, "integer division by zero"));
                }
                let q = x.checked_div(y).ok_or_else(overflow)?;
                return q
                    .trunc()
                    .to_i64()
                    .map(AtomicValue::Integer)
                    .ok_or_else(overflow);
            }
        };
        return r.map(AtomicValue::Decimal).ok_or_else(overflow);
    }
    let (Num::Integer(x), Num::Integer(y)) = (a, b) else {
        unreachable!("numeric promotion covered every pairing");
    };
    let r = match op {
        ArithOp::Add => x.checked_add(y),
        ArithOp::Sub => x.checked_sub(y),
        ArithOp::Mul => x.checked_mul(y),
        ArithOp::Div => unreachable!("integer div handled as decimal division"),
        ArithOp::IDiv | ArithOp::Mod if y == 0 => {
            return Err(Error::from_code(ErrorCode::FOAR0001, "integer division by zero"));
        }
        ArithOp::IDiv => x.checked_div(y),
        ArithOp::Mod => x.checked_rem(y),
    };
    r.map(AtomicValue::Integer).ok_or_else(overflow)
}

fn overflow() -> Error {
    Error::from_code(ErrorCode::FOAR0002, "numeric overflow")
}

/// General comparison: true when any pair of operand items satisfies `op`.
pub(crate) fn general_cmp(
    op: CmpOp,
    lhs: &[AtomicValue],
    rhs: &[AtomicValue],
    collation: &dyn Collation,
) -> Result<bool, Error> {
    for a in lhs {
        for b in rhs {
            if cmp_pair(op, a, b, collation)? {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

/// Compile-time comparison folding; collation-sensitive data falls back to
/// codepoint order, matching the static default.
pub(crate) fn general_cmp_const(op: CmpOp, lhs: &[AtomicValue], rhs: &[AtomicValue]) -> Result<bool, Error> {
    general_cmp(op, lhs, rhs, &CodepointCollation)
}

fn cmp_pair(op: CmpOp, a: &AtomicValue, b: &AtomicValue, collation: &dyn Collation) -> Result<bool, Error> {
    use AtomicValue as V;
    use core::cmp::Ordering;

    let ordering: Option<Ordering> = match (a, b) {
        (V::Boolean(x), V::Boolean(y)) => Some(x.cmp(y)),
        (V::String(x) | V::Untyped(x), V::String(y) | V::Untyped(y)) => Some(collation.compare(x, y)),
        _ if a.is_numeric() || b.is_numeric() => {
            let x = numeric_operand(a)?;
            let y = numeric_operand(b)?;
            match (x, y) {
                (Num::Integer(i), Num::Integer(j)) => Some(i.cmp(&j)),
                (Num::Double(_), _) | (_, Num::Double(_)) => double_of(x).partial_cmp(&double_of(y)),
                _ => Some(decimal_of(x).cmp(&decimal_of(y))),
            }
        }
        _ => {
            return Err(Error::from_code(
                ErrorCode::XPTY0004,
                format!("cannot compare {a} with {b}"),
            ));
        }
    };

    // NaN: every comparison is false except !=.
    let Some(ordering) = ordering else {
        return Ok(op == CmpOp::Ne);
    };
    Ok(match op {
        CmpOp::Eq => ordering == Ordering::Equal,
        CmpOp::Ne => ordering != Ordering::Equal,
        CmpOp::Lt => ordering == Ordering::Less,
        CmpOp::Le => ordering != Ordering::Greater,
        CmpOp::Gt => ordering == Ordering::Greater,
        CmpOp::Ge => ordering != Ordering::Less,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int(i: i64) -> AtomicValue {
        AtomicValue::Integer(i)
    }

    #[test]
    fn integer_div_produces_decimal() {
        let r = arith_value(ArithOp::Div, &[int(1)], &[int(2)]).unwrap().unwrap();
        assert_eq!(r, AtomicValue::Decimal(Decimal::new(5, 1)));
    }

    #[test]
    fn empty_operand_yields_empty() {
        assert_eq!(arith_value(ArithOp::Add, &[], &[int(1)]).unwrap(), None);
    }

    #[test]
    fn general_comparison_is_existential() {
        let lhs = [int(1), int(5)];
        let rhs = [int(4)];
        assert!(general_cmp_const(CmpOp::Gt, &lhs, &rhs).unwrap());
        assert!(!general_cmp_const(CmpOp::Eq, &lhs, &rhs).unwrap());
    }

    #[test]
    fn untyped_coerces_to_number_against_numerics() {
        let lhs = [AtomicValue::untyped("10")];
        assert!(general_cmp_const(CmpOp::Gt, &lhs, &[int(9)]).unwrap());
    }

    #[test]
    fn nan_compares_unequal() {
        let nan = [AtomicValue::Double(f64::NAN)];
        assert!(!general_cmp_const(CmpOp::Eq, &nan, &nan).unwrap());
        assert!(general_cmp_const(CmpOp::Ne, &nan, &nan).unwrap());
    }

    #[test]
    fn range_streams_lazily() {
        let qc = QueryContext::new();
        let mut s = Expr::range(Expr::int(1), Expr::int(1_000_000_000)).stream(&qc).unwrap();
        assert_eq!(s.next().unwrap().unwrap(), int(1));
        assert_eq!(s.next().unwrap().unwrap(), int(2));
    }
}
