//! Default function registry: a small set of sequence, numeric, and string
//! builtins with declared effect flags. `random()` is the stock
//! non-deterministic function; everything else is pure.

use crate::expr::eval::{arith_value, general_cmp};
use crate::expr::{ArithOp, CmpOp, Flag};
use crate::collation::resolve_collation;
use crate::runtime::{Error, ErrorCode, FunctionRegistry};
use crate::xdm::{AtomicValue, Sequence, ebv};
use compact_str::CompactString;
use std::sync::atomic::{AtomicU64, Ordering};

pub fn default_function_registry() -> FunctionRegistry {
    let mut reg = FunctionRegistry::new();

    reg.register_pure("count", 1, |_, args| Ok(vec![AtomicValue::Integer(args[0].len() as i64)]));

    reg.register_pure("exists", 1, |_, args| Ok(vec![AtomicValue::Boolean(!args[0].is_empty())]));

    reg.register_pure("empty", 1, |_, args| Ok(vec![AtomicValue::Boolean(args[0].is_empty())]));

    reg.register_pure("not", 1, |_, args| Ok(vec![AtomicValue::Boolean(!ebv(&args[0])?)]));

    reg.register_pure("sum", 1, |_, args| {
        let mut acc = AtomicValue::Integer(0);
        for item in &args[0] {
            acc = arith_value(ArithOp::Add, &[acc], std::slice::from_ref(item))?
                .expect("singleton operands always produce a value");
        }
        Ok(vec![acc])
    });

    reg.register_pure("avg", 1, |_, args| {
        if args[0].is_empty() {
            return Ok(Vec::new());
        }
        let mut acc = AtomicValue::Integer(0);
        for item in &args[0] {
            acc = arith_value(ArithOp::Add, &[acc], std::slice::from_ref(item))?
                .expect("singleton operands always produce a value");
        }
        let n = AtomicValue::Integer(args[0].len() as i64);
        Ok(arith_value(ArithOp::Div, &[acc], &[n])?.into_iter().collect())
    });

    reg.register_pure("min", 1, |ctx, args| extremum(ctx, &args[0], CmpOp::Lt));

    reg.register_pure("max", 1, |ctx, args| extremum(ctx, &args[0], CmpOp::Gt));

    reg.register_pure("abs", 1, |_, args| {
        singleton_numeric(&args[0], "abs", |v| match v {
            AtomicValue::Integer(i) => AtomicValue::Integer(i.abs()),
            AtomicValue::Decimal(d) => AtomicValue::Decimal(d.abs()),
            AtomicValue::Double(d) => AtomicValue::Double(d.abs()),
            _ => unreachable!("guarded by singleton_numeric"),
        })
    });

    reg.register_pure("round", 1, |_, args| {
        singleton_numeric(&args[0], "round", |v| match v {
            AtomicValue::Integer(i) => AtomicValue::Integer(*i),
            AtomicValue::Decimal(d) => AtomicValue::Decimal(d.round()),
            AtomicValue::Double(d) => AtomicValue::Double(d.round()),
            _ => unreachable!("guarded by singleton_numeric"),
        })
    });

    reg.register("concat", 2, None, &[], |_, args| {
        let mut out = CompactString::default();
        for arg in args {
            match arg.as_slice() {
                [] => {}
                [v] => out.push_str(&v.string_value()),
                _ => {
                    return Err(Error::from_code(ErrorCode::FORG0006, "concat argument is not a singleton"));
                }
            }
        }
        Ok(vec![AtomicValue::String(out)])
    });

    reg.register_pure("string-length", 1, |_, args| match args[0].as_slice() {
        [] => Ok(vec![AtomicValue::Integer(0)]),
        [v] => Ok(vec![AtomicValue::Integer(v.string_value().chars().count() as i64)]),
        _ => Err(Error::from_code(ErrorCode::FORG0006, "string-length argument is not a singleton")),
    });

    // Linear-congruential step; deliberately not seedable from the context.
    let state = AtomicU64::new(0x2545_F491_4F6C_DD1D);
    reg.register("random", 0, Some(0), &[Flag::Ndt], move |_, _| {
        let next = state
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |s| {
                Some(s.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1_442_695_040_888_963_407))
            })
            .expect("fetch_update closure never returns None");
        Ok(vec![AtomicValue::Double((next >> 11) as f64 / (1u64 << 53) as f64)])
    });

    reg
}

fn extremum(ctx: &crate::runtime::CallCtx, seq: &Sequence, op: CmpOp) -> Result<Sequence, Error> {
    let collation = resolve_collation(ctx.qc, None)?;
    let mut best: Option<AtomicValue> = None;
    for item in seq {
        match &best {
            None => best = Some(item.clone()),
            Some(b) => {
                if general_cmp(op, std::slice::from_ref(item), std::slice::from_ref(b), collation.as_ref())? {
                    best = Some(item.clone());
                }
            }
        }
    }
    Ok(best.into_iter().collect())
}

fn singleton_numeric(
    seq: &Sequence,
    name: &str,
    f: impl Fn(&AtomicValue) -> AtomicValue,
) -> Result<Sequence, Error> {
    match seq.as_slice() {
        [] => Ok(Vec::new()),
        [v] if v.is_numeric() => Ok(vec![f(v)]),
        [v] => Err(Error::from_code(ErrorCode::XPTY0004, format!("{name}() requires a numeric argument, got {v}"))),
        _ => Err(Error::from_code(ErrorCode::FORG0006, format!("{name}() argument is not a singleton"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::CallCtx;
    use crate::runtime::QueryContext;

    fn call(name: &str, args: &[Sequence]) -> Result<Sequence, Error> {
        let qc = QueryContext::new();
        let reg = default_function_registry();
        let def = reg.resolve(name, args.len()).unwrap();
        (def.imp)(&CallCtx { qc: &qc }, args)
    }

    #[test]
    fn sum_over_mixed_numerics() {
        let out = call("sum", &[vec![AtomicValue::Integer(1), AtomicValue::Double(2.5)]]).unwrap();
        assert_eq!(out, vec![AtomicValue::Double(3.5)]);
    }

    #[test]
    fn min_max_and_empty() {
        let seq = vec![AtomicValue::Integer(4), AtomicValue::Integer(1), AtomicValue::Integer(9)];
        assert_eq!(call("min", &[seq.clone()]).unwrap(), vec![AtomicValue::Integer(1)]);
        assert_eq!(call("max", &[seq]).unwrap(), vec![AtomicValue::Integer(9)]);
        assert_eq!(call("min", &[Vec::new()]).unwrap(), Vec::new());
    }

    #[test]
    fn random_is_flagged_ndt() {
        let reg = default_function_registry();
        let def = reg.resolve("random", 0).unwrap();
        assert!(def.uses(Flag::Ndt));
        assert!(!def.inlineable());
    }
}
