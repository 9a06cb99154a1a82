//! Rewrite-optimizer tests: the fixpoint passes, the finishing passes, and
//! the semantic-preservation properties that gate them.

use flwor::expr::{Expr, Flag};
use flwor::pipeline::{Clause, Count, For, Let, Pipeline, Where};
use flwor::runtime::{CompileContext, FunctionRegistry, QueryContext, QueryContextBuilder};
use flwor::types::{ItemType, SeqType};
use flwor::var::{Var, VarScope};
use flwor::xdm::AtomicValue;
use flwor::{evaluate, functions::default_function_registry};
use rstest::rstest;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

fn ints(values: &[i64]) -> Vec<AtomicValue> {
    values.iter().copied().map(AtomicValue::Integer).collect()
}

fn item_var(scope: &mut VarScope, name: &str) -> Var {
    scope.declare(name, SeqType::one(ItemType::Integer))
}

fn compile(pipeline: Pipeline) -> Expr {
    pipeline.compile(&mut CompileContext::new()).unwrap()
}

/// Registry with an observable non-deterministic function `tick()`.
fn registry_with_tick() -> (Rc<FunctionRegistry>, Arc<AtomicU64>) {
    let counter = Arc::new(AtomicU64::new(0));
    let mut reg = default_function_registry();
    let shared = Arc::clone(&counter);
    reg.register("tick", 0, Some(0), &[Flag::Ndt], move |_, _| {
        Ok(vec![AtomicValue::Integer(shared.fetch_add(1, Ordering::SeqCst) as i64)])
    });
    (Rc::new(reg), counter)
}

#[rstest]
fn let_is_inlined_and_where_pushed_into_for() {
    let mut scope = VarScope::new();
    let x = item_var(&mut scope, "x");
    let y = scope.declare("y", SeqType::zero_or_more(ItemType::Integer));
    let pipeline = Pipeline::new(
        vec![
            Clause::For(For::new(x.clone(), Expr::int_seq([1, 2, 3]))),
            Clause::Let(Let::new(y.clone(), Expr::mul(Expr::var(&x), Expr::int(2)))),
            Clause::Where(Where::new(Expr::gt(Expr::var(&y), Expr::int(2)))),
        ],
        Expr::var(&y),
    );

    let compiled = compile(pipeline);
    let Expr::Pipeline(p) = &compiled else {
        panic!("expected the pipeline to survive, got {compiled}");
    };
    assert!(!p.clauses.iter().any(|c| matches!(c, Clause::Let(_))), "let must be inlined: {p}");
    assert!(matches!(p.clauses.first(), Some(Clause::For(_))));

    let out = evaluate(&compiled, &QueryContext::new()).unwrap();
    assert_eq!(out, ints(&[4, 6]));
}

#[rstest]
fn singleton_for_collapses_to_bare_return() {
    let mut scope = VarScope::new();
    let x = item_var(&mut scope, "x");
    let pipeline =
        Pipeline::new(vec![Clause::For(For::new(x.clone(), Expr::seq(vec![Expr::int(1)])))], Expr::var(&x));

    let compiled = compile(pipeline);
    assert!(
        matches!(compiled, Expr::Literal(AtomicValue::Integer(1))),
        "expected a bare literal, got {compiled}"
    );
}

#[rstest]
fn constant_false_where_empties_the_pipeline() {
    let mut scope = VarScope::new();
    let x = item_var(&mut scope, "x");
    let pipeline = Pipeline::new(
        vec![
            Clause::For(For::new(x.clone(), Expr::int_seq([1, 2]))),
            Clause::Where(Where::new(Expr::boolean(false))),
        ],
        Expr::var(&x),
    );

    let compiled = compile(pipeline);
    assert!(matches!(compiled, Expr::Empty), "expected the empty sequence, got {compiled}");
    assert_eq!(evaluate(&compiled, &QueryContext::new()).unwrap(), Vec::new());
}

#[rstest]
fn nested_pipeline_source_flattens() {
    let mut scope = VarScope::new();
    let y = item_var(&mut scope, "y");
    let x = item_var(&mut scope, "x");
    let inner =
        Pipeline::new(vec![Clause::For(For::new(y.clone(), Expr::int_seq([1, 2])))], Expr::var(&y));
    let outer = Pipeline::new(
        vec![Clause::For(For::new(x.clone(), Expr::Pipeline(Box::new(inner))))],
        Expr::mul(Expr::var(&x), Expr::int(10)),
    );

    let compiled = compile(outer);
    let Expr::Pipeline(p) = &compiled else {
        panic!("expected a pipeline, got {compiled}");
    };
    assert_eq!(p.clauses.len(), 1);
    assert!(matches!(p.clauses[0], Clause::For(_)));
    assert_eq!(evaluate(&compiled, &QueryContext::new()).unwrap(), ints(&[10, 20]));
}

#[rstest]
fn nested_pipeline_with_filter_flattens_to_one_for() {
    let mut scope = VarScope::new();
    let y = item_var(&mut scope, "y");
    let x = item_var(&mut scope, "x");
    let inner = Pipeline::new(
        vec![
            Clause::For(For::new(y.clone(), Expr::int_seq([1, 2, 3]))),
            Clause::Where(Where::new(Expr::gt(Expr::var(&y), Expr::int(1)))),
        ],
        Expr::var(&y),
    );
    let outer = Pipeline::new(
        vec![Clause::For(For::new(x.clone(), Expr::Pipeline(Box::new(inner))))],
        Expr::mul(Expr::var(&x), Expr::int(10)),
    );

    let compiled = compile(outer);
    let Expr::Pipeline(p) = &compiled else {
        panic!("expected a pipeline, got {compiled}");
    };
    assert_eq!(p.clauses.len(), 1, "inner clauses should splice and the binding collapse: {p}");
    assert_eq!(evaluate(&compiled, &QueryContext::new()).unwrap(), ints(&[20, 30]));
}

#[rstest]
fn for_to_let_demotion_preserves_outputs() {
    let mut scope = VarScope::new();
    let x = item_var(&mut scope, "x");
    let z = item_var(&mut scope, "z");
    let pipeline = Pipeline::new(
        vec![
            Clause::For(For::new(x.clone(), Expr::seq(vec![Expr::int(42)]))),
            Clause::For(For::new(z.clone(), Expr::int_seq([1, 2]))),
        ],
        Expr::add(Expr::var(&x), Expr::var(&z)),
    );

    let qc = QueryContext::new();
    let unoptimized = pipeline.stream(&qc).materialize().unwrap();
    let compiled = compile(pipeline);
    assert_eq!(evaluate(&compiled, &qc).unwrap(), unoptimized);
    assert_eq!(unoptimized, ints(&[43, 44]));
}

#[rstest]
fn dead_let_elimination_preserves_outputs() {
    let mut scope = VarScope::new();
    let x = item_var(&mut scope, "x");
    let unused = item_var(&mut scope, "unused");
    let pipeline = Pipeline::new(
        vec![
            Clause::For(For::new(x.clone(), Expr::int_seq([1, 2]))),
            Clause::Let(Let::new(unused, Expr::mul(Expr::var(&x), Expr::int(3)))),
        ],
        Expr::var(&x),
    );

    let qc = QueryContext::new();
    let unoptimized = pipeline.stream(&qc).materialize().unwrap();
    let compiled = compile(pipeline);
    assert_eq!(evaluate(&compiled, &qc).unwrap(), unoptimized);
    assert_eq!(unoptimized, ints(&[1, 2]));
}

#[rstest]
fn ndt_let_survives_even_when_unused() {
    let (reg, counter) = registry_with_tick();
    let mut scope = VarScope::new();
    let x = item_var(&mut scope, "x");
    let t = item_var(&mut scope, "t");
    let pipeline = Pipeline::new(
        vec![
            Clause::For(For::new(x.clone(), Expr::int_seq([1, 2, 3]))),
            Clause::Let(Let::new(t, Expr::call(&reg, "tick", vec![]).unwrap())),
        ],
        Expr::var(&x),
    );

    let compiled = compile(pipeline);
    let Expr::Pipeline(p) = &compiled else {
        panic!("expected a pipeline, got {compiled}");
    };
    assert!(p.clauses.iter().any(|c| matches!(c, Clause::Let(_))), "NDT let must not be removed: {p}");

    let qc = QueryContextBuilder::new().with_functions(Rc::clone(&reg)).build();
    evaluate(&compiled, &qc).unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 3);
}

#[rstest]
fn where_hoist_refused_over_ndt_clause() {
    let (reg, counter) = registry_with_tick();
    let mut scope = VarScope::new();
    let x = item_var(&mut scope, "x");
    let t = item_var(&mut scope, "t");
    let pipeline = Pipeline::new(
        vec![
            Clause::For(For::new(x.clone(), Expr::int_seq([1, 2, 3]))),
            Clause::Let(Let::new(t, Expr::call(&reg, "tick", vec![]).unwrap())),
            Clause::Where(Where::new(Expr::gt(Expr::var(&x), Expr::int(1)))),
        ],
        Expr::var(&x),
    );

    let compiled = compile(pipeline);
    let Expr::Pipeline(p) = &compiled else {
        panic!("expected a pipeline, got {compiled}");
    };
    // The where must stay below the non-deterministic let.
    assert!(matches!(p.clauses[0], Clause::For(_)));
    assert!(matches!(p.clauses[1], Clause::Let(_)));
    assert!(matches!(p.clauses[2], Clause::Where(_)), "hoist past an NDT clause must be refused: {p}");

    let qc = QueryContextBuilder::new().with_functions(Rc::clone(&reg)).build();
    assert_eq!(evaluate(&compiled, &qc).unwrap(), ints(&[2, 3]));
    // The let still ran once per incoming tuple.
    assert_eq!(counter.load(Ordering::SeqCst), 3);
}

#[rstest]
fn leading_where_becomes_a_guard() {
    let mut scope = VarScope::new();
    let g = item_var(&mut scope, "g");
    let x = item_var(&mut scope, "x");
    let pipeline = Pipeline::new(
        vec![
            Clause::Where(Where::new(Expr::gt(Expr::var(&g), Expr::int(0)))),
            Clause::For(For::new(x.clone(), Expr::int_seq([1, 2]))),
        ],
        Expr::var(&x),
    );

    let compiled = compile(pipeline);
    assert!(matches!(compiled, Expr::If { .. }), "expected a guard conditional, got {compiled}");

    let hit = QueryContextBuilder::new().with_variable(&g, ints(&[5])).build();
    assert_eq!(evaluate(&compiled, &hit).unwrap(), ints(&[1, 2]));
    let miss = QueryContextBuilder::new().with_variable(&g, ints(&[0])).build();
    assert_eq!(evaluate(&compiled, &miss).unwrap(), Vec::new());
}

#[rstest]
fn consecutive_wheres_merge_into_a_conjunction() {
    let mut scope = VarScope::new();
    let x = item_var(&mut scope, "x");
    let p = item_var(&mut scope, "p");
    // The positional variable blocks absorption into the for.
    let pipeline = Pipeline::new(
        vec![
            Clause::For(For::new(x.clone(), Expr::int_seq([1, 2, 3, 4, 5])).with_pos(p)),
            Clause::Where(Where::new(Expr::gt(Expr::var(&x), Expr::int(1)))),
            Clause::Where(Where::new(Expr::cmp(flwor::expr::CmpOp::Lt, Expr::var(&x), Expr::int(5)))),
        ],
        Expr::var(&x),
    );

    let compiled = compile(pipeline);
    let Expr::Pipeline(p) = &compiled else {
        panic!("expected a pipeline, got {compiled}");
    };
    let wheres: Vec<_> = p.clauses.iter().filter(|c| matches!(c, Clause::Where(_))).collect();
    assert_eq!(wheres.len(), 1, "wheres must merge: {p}");
    let Clause::Where(wh) = wheres[0] else { unreachable!() };
    assert!(matches!(wh.pred, Expr::And(_)));
    assert_eq!(evaluate(&compiled, &QueryContext::new()).unwrap(), ints(&[2, 3, 4]));
}

#[rstest]
fn lets_slide_above_loops_they_do_not_depend_on() {
    let mut scope = VarScope::new();
    let g = item_var(&mut scope, "g");
    let x = item_var(&mut scope, "x");
    let k = item_var(&mut scope, "k");
    let z = item_var(&mut scope, "z");
    // $k depends only on the external $g; it is neither cheap nor single-use,
    // so it survives and slides above the outer loop.
    let k_body = Expr::add(Expr::add(Expr::var(&g), Expr::var(&g)), Expr::var(&g));
    let pipeline = Pipeline::new(
        vec![
            Clause::For(For::new(x.clone(), Expr::int_seq([1, 2]))),
            Clause::Let(Let::new(k.clone(), k_body)),
            Clause::For(For::new(z.clone(), Expr::int_seq([1, 2]))),
        ],
        Expr::add(Expr::var(&k), Expr::var(&z)),
    );

    let compiled = compile(pipeline);
    let Expr::Pipeline(p) = &compiled else {
        panic!("expected a pipeline, got {compiled}");
    };
    assert!(matches!(p.clauses[0], Clause::Let(_)), "let should slide to the top: {p}");

    let qc = QueryContextBuilder::new().with_variable(&g, ints(&[2])).build();
    assert_eq!(evaluate(&compiled, &qc).unwrap(), ints(&[7, 8, 7, 8]));
}

#[rstest]
fn calc_size_matches_runtime_length() {
    let mut scope = VarScope::new();
    let x = item_var(&mut scope, "x");
    let z = item_var(&mut scope, "z");
    let c = item_var(&mut scope, "c");
    let pipeline = Pipeline::new(
        vec![
            Clause::For(For::new(x.clone(), Expr::int_seq([1, 2, 3]))),
            Clause::For(For::new(z.clone(), Expr::int_seq([4, 5]))),
            Clause::Count(Count { var: c.clone() }),
        ],
        Expr::var(&c),
    );

    let compiled = compile(pipeline);
    let Expr::Pipeline(p) = &compiled else {
        panic!("expected a pipeline, got {compiled}");
    };
    let size = p.calc_size().expect("statically known size");
    let out = evaluate(&compiled, &QueryContext::new()).unwrap();
    assert_eq!(out.len() as u64, size);
    assert_eq!(size, 6);
}

#[rstest]
fn determinism_without_ndt() {
    let mut scope = VarScope::new();
    let x = item_var(&mut scope, "x");
    let pipeline = Pipeline::new(
        vec![
            Clause::For(For::new(x.clone(), Expr::int_seq([3, 1, 2]))),
            Clause::Where(Where::new(Expr::gt(Expr::var(&x), Expr::int(1)))),
        ],
        Expr::var(&x),
    );

    let compiled = compile(pipeline);
    let qc = QueryContext::new();
    let a = evaluate(&compiled, &qc).unwrap();
    let b = evaluate(&compiled, &qc).unwrap();
    assert_eq!(a, b);
}

#[rstest]
fn rewrite_diagnostics_fire_per_applied_pass() {
    let mut scope = VarScope::new();
    let x = item_var(&mut scope, "x");
    let y = scope.declare("y", SeqType::zero_or_more(ItemType::Integer));
    let pipeline = Pipeline::new(
        vec![
            Clause::For(For::new(x.clone(), Expr::int_seq([1, 2, 3]))),
            Clause::Let(Let::new(y.clone(), Expr::mul(Expr::var(&x), Expr::int(2)))),
            Clause::Where(Where::new(Expr::gt(Expr::var(&y), Expr::int(2)))),
        ],
        Expr::var(&y),
    );

    let notes: Rc<RefCell<Vec<String>>> = Rc::default();
    let sink = Rc::clone(&notes);
    let mut cx = CompileContext::with_listener(Rc::new(move |pass, _clause| {
        sink.borrow_mut().push(pass.to_string());
    }));
    pipeline.compile(&mut cx).unwrap();

    let notes = notes.borrow();
    assert!(notes.iter().any(|p| p == "inline-let"), "saw: {notes:?}");
    assert!(notes.iter().any(|p| p == "absorb-where"), "saw: {notes:?}");
}

#[rstest]
fn fixpoint_terminates_on_deep_let_chains() {
    let mut scope = VarScope::new();
    let x = item_var(&mut scope, "x");
    let mut clauses = vec![Clause::For(For::new(x.clone(), Expr::int_seq([1, 2])))];
    let mut prev = x;
    for i in 0..40 {
        let v = scope.declare(format!("v{i}"), SeqType::zero_or_more(ItemType::Integer));
        clauses.push(Clause::Let(Let::new(v.clone(), Expr::add(Expr::var(&prev), Expr::var(&prev)))));
        prev = v;
    }
    let pipeline = Pipeline::new(clauses, Expr::var(&prev));

    let compiled = compile(pipeline);
    let out = evaluate(&compiled, &QueryContext::new()).unwrap();
    // 1 * 2^40 and 2 * 2^40
    assert_eq!(out, ints(&[1 << 40, 2 << 40]));
}
