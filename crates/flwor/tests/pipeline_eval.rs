//! Evaluation-protocol tests: the pull-based clause chain, lazy return
//! streaming, positional and counting bindings, and error propagation.

use flwor::expr::{ArithOp, CmpOp, Expr};
use flwor::pipeline::{Clause, Count, For, Let, Pipeline, Where};
use flwor::runtime::{ErrorCode, QueryContext};
use flwor::types::{ItemType, SeqType};
use flwor::var::{Var, VarScope};
use flwor::xdm::AtomicValue;
use rstest::rstest;

fn ints(values: &[i64]) -> Vec<AtomicValue> {
    values.iter().copied().map(AtomicValue::Integer).collect()
}

fn item_var(scope: &mut VarScope, name: &str) -> Var {
    scope.declare(name, SeqType::one(ItemType::Integer))
}

#[rstest]
fn for_let_where_chain() {
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

    let out = pipeline.stream(&QueryContext::new()).materialize().unwrap();
    assert_eq!(out, ints(&[4, 6]));
}

#[rstest]
fn return_sequences_concatenate_in_order() {
    let mut scope = VarScope::new();
    let x = item_var(&mut scope, "x");
    let pipeline = Pipeline::new(
        vec![Clause::For(For::new(x.clone(), Expr::int_seq([1, 2])))],
        Expr::seq(vec![Expr::var(&x), Expr::mul(Expr::var(&x), Expr::int(10))]),
    );

    let out = pipeline.stream(&QueryContext::new()).materialize().unwrap();
    assert_eq!(out, ints(&[1, 10, 2, 20]));
}

#[rstest]
fn chain_pulls_lazily_through_large_sources() {
    let mut scope = VarScope::new();
    let x = item_var(&mut scope, "x");
    let pipeline = Pipeline::new(
        vec![Clause::For(For::new(x.clone(), Expr::range(Expr::int(1), Expr::int(999_999_999))))],
        Expr::var(&x),
    );

    let out: Vec<_> = pipeline
        .stream(&QueryContext::new())
        .take(3)
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    assert_eq!(out, ints(&[1, 2, 3]));
}

#[rstest]
fn positional_variable_counts_source_items() {
    let mut scope = VarScope::new();
    let x = item_var(&mut scope, "x");
    let p = item_var(&mut scope, "p");
    let pipeline = Pipeline::new(
        vec![Clause::For(For::new(x, Expr::int_seq([5, 6, 7])).with_pos(p.clone()))],
        Expr::var(&p),
    );

    let out = pipeline.stream(&QueryContext::new()).materialize().unwrap();
    assert_eq!(out, ints(&[1, 2, 3]));
}

#[rstest]
fn count_clause_numbers_surviving_tuples() {
    let mut scope = VarScope::new();
    let x = item_var(&mut scope, "x");
    let c = item_var(&mut scope, "c");
    let pipeline = Pipeline::new(
        vec![
            Clause::For(For::new(x.clone(), Expr::int_seq([5, 10, 15, 20]))),
            Clause::Where(Where::new(Expr::gt(Expr::var(&x), Expr::int(5)))),
            Clause::Count(Count { var: c.clone() }),
        ],
        Expr::var(&c),
    );

    // The counter numbers tuples after the filter, starting at 1.
    let out = pipeline.stream(&QueryContext::new()).materialize().unwrap();
    assert_eq!(out, ints(&[1, 2, 3]));
}

#[rstest]
fn count_state_is_fresh_per_stream() {
    let mut scope = VarScope::new();
    let x = item_var(&mut scope, "x");
    let c = item_var(&mut scope, "c");
    let pipeline = Pipeline::new(
        vec![
            Clause::For(For::new(x, Expr::int_seq([7, 8]))),
            Clause::Count(Count { var: c.clone() }),
        ],
        Expr::var(&c),
    );

    let qc = QueryContext::new();
    let first = pipeline.stream(&qc).materialize().unwrap();
    let second = pipeline.stream(&qc).materialize().unwrap();
    assert_eq!(first, second);
}

#[rstest]
fn allowing_empty_emits_one_empty_bound_tuple() {
    let mut scope = VarScope::new();
    let x = scope.declare("x", SeqType::zero_or_one(ItemType::Integer));
    let p = item_var(&mut scope, "p");
    let pipeline = Pipeline::new(
        vec![Clause::For(For::new(x, Expr::Empty).with_pos(p.clone()).allowing_empty())],
        Expr::var(&p),
    );

    // One tuple, positional variable bound to 0.
    let out = pipeline.stream(&QueryContext::new()).materialize().unwrap();
    assert_eq!(out, ints(&[0]));
}

#[rstest]
fn where_discards_until_predicate_holds() {
    let mut scope = VarScope::new();
    let x = item_var(&mut scope, "x");
    let pipeline = Pipeline::new(
        vec![
            Clause::For(For::new(x.clone(), Expr::range(Expr::int(1), Expr::int(10)))),
            Clause::Where(Where::new(Expr::eq(
                Expr::arith(ArithOp::Mod, Expr::var(&x), Expr::int(2)),
                Expr::int(0),
            ))),
        ],
        Expr::var(&x),
    );

    let out = pipeline.stream(&QueryContext::new()).materialize().unwrap();
    assert_eq!(out, ints(&[2, 4, 6, 8, 10]));
}

#[rstest]
fn first_evaluation_error_aborts_the_run() {
    let mut scope = VarScope::new();
    let x = item_var(&mut scope, "x");
    let pipeline = Pipeline::new(
        vec![Clause::For(For::new(x.clone(), Expr::int_seq([0, 1, 2])))],
        Expr::arith(ArithOp::IDiv, Expr::int(10), Expr::var(&x)),
    );

    let mut stream = pipeline.stream(&QueryContext::new());
    let first = stream.next().unwrap();
    assert_eq!(first.unwrap_err().code, ErrorCode::FOAR0001);
    // The stream is drained after the error.
    assert!(stream.next().is_none());
}

#[rstest]
fn type_checked_binding_is_enforced() {
    let mut scope = VarScope::new();
    let s = scope.declare_checked("s", SeqType::one(ItemType::Integer));
    let pipeline = Pipeline::new(
        vec![Clause::Let(Let::new(s.clone(), Expr::string("nope")))],
        Expr::var(&s),
    );

    let err = pipeline.stream(&QueryContext::new()).materialize().unwrap_err();
    assert_eq!(err.code, ErrorCode::XPTY0004);
}

#[rstest]
fn empty_clause_list_evaluates_return_once() {
    let pipeline = Pipeline::new(Vec::new(), Expr::int_seq([1, 2]));
    let out = pipeline.stream(&QueryContext::new()).materialize().unwrap();
    assert_eq!(out, ints(&[1, 2]));
}

#[rstest]
fn comparison_is_existential_over_sequences() {
    let mut scope = VarScope::new();
    let x = scope.declare("x", SeqType::zero_or_more(ItemType::Integer));
    let pipeline = Pipeline::new(
        vec![
            Clause::Let(Let::new(x.clone(), Expr::int_seq([1, 5]))),
            Clause::Where(Where::new(Expr::cmp(CmpOp::Gt, Expr::var(&x), Expr::int(4)))),
        ],
        Expr::string("kept"),
    );

    let out = pipeline.stream(&QueryContext::new()).materialize().unwrap();
    assert_eq!(out, vec![AtomicValue::string("kept")]);
}
