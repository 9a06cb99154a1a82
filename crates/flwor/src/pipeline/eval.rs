//! The evaluator chain: one state machine per clause, threaded by an
//! `advance(index)` protocol that pulls tuples from upstream on demand.
//!
//! A "tuple" is never materialized — it is the aggregate of all variable
//! slots in the [`QueryContext`] at one instant. Each clause state machine
//! writes exactly the slots its clause declares. OrderBy, GroupBy, and
//! Window are the materialization points: they drain their upstream into a
//! clause-owned buffer before emitting anything.

use super::clause::{Clause, GroupSpec, SortKey, Window, WindowCond};
use super::Pipeline;
use crate::collation::{Collation, resolve_collation};
use crate::runtime::{Error, ErrorCode, QueryContext};
use crate::var::Var;
use crate::xdm::{AtomicValue, ItemResult, Sequence, SequenceCursor, SequenceStream};
use core::cmp::Ordering;
use std::collections::VecDeque;
use std::mem;
use std::rc::Rc;
use std::sync::Arc;

pub(super) fn pipeline_stream(pipeline: Pipeline, qc: QueryContext) -> SequenceStream {
    SequenceStream::new(PipelineCursor {
        eval: PipelineEval::new(Rc::new(pipeline), qc),
        current: None,
        drained: false,
    })
}

/// Per-clause evaluation state. `Taken` marks a slot whose state is
/// temporarily moved out while its clause advances.
enum ClauseState {
    Taken,
    For { source: Option<SequenceStream>, pos: i64, emitted_any: bool },
    Let,
    Where,
    Count { n: i64 },
    OrderBy { buffer: Option<VecDeque<Vec<Sequence>>> },
    GroupBy { groups: Option<VecDeque<GroupTuple>> },
    Window { pending: VecDeque<WindowTuple> },
}

struct GroupTuple {
    keys: Vec<Option<AtomicValue>>,
    aggs: Vec<Sequence>,
}

struct WindowTuple {
    items: Sequence,
    start_item: AtomicValue,
    start_pos: i64,
    end_item: AtomicValue,
    end_pos: i64,
}

struct PipelineEval {
    pipeline: Rc<Pipeline>,
    qc: QueryContext,
    states: Vec<ClauseState>,
    started: bool,
}

impl PipelineEval {
    fn new(pipeline: Rc<Pipeline>, qc: QueryContext) -> Self {
        let states = pipeline
            .clauses
            .iter()
            .map(|c| match c {
                Clause::For(_) => ClauseState::For { source: None, pos: 0, emitted_any: false },
                Clause::Let(_) => ClauseState::Let,
                Clause::Where(_) => ClauseState::Where,
                Clause::Count(_) => ClauseState::Count { n: 0 },
                Clause::OrderBy(_) => ClauseState::OrderBy { buffer: None },
                Clause::GroupBy(_) => ClauseState::GroupBy { groups: None },
                Clause::Window(_) => ClauseState::Window { pending: VecDeque::new() },
            })
            .collect();
        Self { pipeline, qc, states, started: false }
    }

    /// One step of the whole chain: true when a new tuple is ready.
    fn advance_chain(&mut self) -> Result<bool, Error> {
        match self.states.len() {
            0 => Ok(self.start()),
            n => self.advance(n - 1),
        }
    }

    /// The initial evaluator: yields exactly one (empty) tuple.
    fn start(&mut self) -> bool {
        !mem::replace(&mut self.started, true)
    }

    fn pull_upstream(&mut self, idx: usize) -> Result<bool, Error> {
        if idx == 0 {
            Ok(self.start())
        } else {
            self.advance(idx - 1)
        }
    }

    fn advance(&mut self, idx: usize) -> Result<bool, Error> {
        let mut state = mem::replace(&mut self.states[idx], ClauseState::Taken);
        let result = self.step(idx, &mut state);
        self.states[idx] = state;
        result
    }

    fn step(&mut self, idx: usize, state: &mut ClauseState) -> Result<bool, Error> {
        let pipeline = Rc::clone(&self.pipeline);
        match (&pipeline.clauses[idx], state) {
            (Clause::For(f), ClauseState::For { source, pos, emitted_any }) => loop {
                if let Some(src) = source {
                    loop {
                        let Some(item) = src.next().transpose()? else {
                            break;
                        };
                        if let Some(filter) = &f.filter {
                            // The filter sees the candidate binding; rejected
                            // items are skipped before positions are assigned.
                            self.qc.bind(&f.var, vec![item.clone()])?;
                            if !filter.ebv(&self.qc)? {
                                continue;
                            }
                        }
                        *pos += 1;
                        *emitted_any = true;
                        self.qc.bind(&f.var, vec![item])?;
                        if let Some(p) = &f.pos {
                            self.qc.bind(p, vec![AtomicValue::Integer(*pos)])?;
                        }
                        if let Some(s) = &f.score {
                            self.qc.bind(s, vec![AtomicValue::Double(0.0)])?;
                        }
                        return Ok(true);
                    }
                    *source = None;
                    if f.allow_empty && !*emitted_any {
                        *emitted_any = true;
                        self.qc.bind(&f.var, Vec::new())?;
                        if let Some(p) = &f.pos {
                            self.qc.bind(p, vec![AtomicValue::Integer(0)])?;
                        }
                        if let Some(s) = &f.score {
                            self.qc.bind(s, vec![AtomicValue::Double(0.0)])?;
                        }
                        return Ok(true);
                    }
                }
                if !self.pull_upstream(idx)? {
                    return Ok(false);
                }
                *source = Some(f.source.stream(&self.qc)?);
                *pos = 0;
                *emitted_any = false;
            },

            (Clause::Let(l), ClauseState::Let) => {
                if !self.pull_upstream(idx)? {
                    return Ok(false);
                }
                let value = l.expr.value(&self.qc)?;
                if l.score {
                    self.qc.bind(&l.var, vec![AtomicValue::Double(0.0)])?;
                } else {
                    self.qc.bind(&l.var, value)?;
                }
                Ok(true)
            }

            (Clause::Where(w), ClauseState::Where) => loop {
                if !self.pull_upstream(idx)? {
                    return Ok(false);
                }
                if w.pred.ebv(&self.qc)? {
                    return Ok(true);
                }
            },

            (Clause::Count(c), ClauseState::Count { n }) => {
                if !self.pull_upstream(idx)? {
                    return Ok(false);
                }
                *n += 1;
                self.qc.bind(&c.var, vec![AtomicValue::Integer(*n)])?;
                Ok(true)
            }

            (Clause::OrderBy(ob), ClauseState::OrderBy { buffer }) => {
                if buffer.is_none() {
                    *buffer = Some(self.materialize_sorted(idx, &ob.refs, &ob.keys)?);
                }
                match buffer.as_mut().expect("buffer filled above").pop_front() {
                    Some(vals) => {
                        for (var, val) in ob.refs.iter().zip(vals) {
                            self.qc.bind(var, val)?;
                        }
                        Ok(true)
                    }
                    None => Ok(false),
                }
            }

            (Clause::GroupBy(gb), ClauseState::GroupBy { groups }) => {
                if groups.is_none() {
                    *groups = Some(self.materialize_groups(idx, &gb.specs, &gb.aggregates)?);
                }
                match groups.as_mut().expect("groups filled above").pop_front() {
                    Some(group) => {
                        for (spec, key) in gb.specs.iter().zip(group.keys) {
                            self.qc.bind(&spec.var, key.into_iter().collect())?;
                        }
                        for (agg, values) in gb.aggregates.iter().zip(group.aggs) {
                            self.qc.bind(&agg.post, values)?;
                        }
                        Ok(true)
                    }
                    None => Ok(false),
                }
            }

            (Clause::Window(w), ClauseState::Window { pending }) => loop {
                if let Some(t) = pending.pop_front() {
                    self.qc.bind(&w.var, t.items)?;
                    bind_cond(&self.qc, &w.start, &t.start_item, t.start_pos)?;
                    if let Some(end) = &w.end {
                        bind_cond(&self.qc, end, &t.end_item, t.end_pos)?;
                    }
                    return Ok(true);
                }
                if !self.pull_upstream(idx)? {
                    return Ok(false);
                }
                let items = w.source.value(&self.qc)?;
                *pending = compute_windows(w, &items, &self.qc)?;
            },

            (_, ClauseState::Taken) => unreachable!("clause state advanced re-entrantly"),
            _ => unreachable!("clause state desynchronized from clause list"),
        }
    }

    /// Drains the upstream, snapshotting the projected bindings per tuple,
    /// and returns them sorted by the key sequence.
    fn materialize_sorted(
        &mut self,
        idx: usize,
        refs: &[Var],
        keys: &[SortKey],
    ) -> Result<VecDeque<Vec<Sequence>>, Error> {
        let collations: Vec<Arc<dyn Collation>> = keys
            .iter()
            .map(|k| resolve_collation(&self.qc, k.collation.as_deref()))
            .collect::<Result<_, _>>()?;
        let mut families: Vec<Option<KeyFamily>> = vec![None; keys.len()];
        let mut rows: Vec<(Vec<Option<AtomicValue>>, Vec<Sequence>)> = Vec::new();
        while self.pull_upstream(idx)? {
            let mut row_keys = Vec::with_capacity(keys.len());
            for (k, key) in keys.iter().enumerate() {
                let value = atomize_key(key.expr.value(&self.qc)?)?;
                if let Some(v) = &value {
                    check_family(&mut families[k], v)?;
                }
                row_keys.push(value);
            }
            let vals = refs.iter().map(|r| self.qc.get(r)).collect::<Result<Vec<_>, _>>()?;
            rows.push((row_keys, vals));
        }
        // Stable sort: tuples with fully equal keys keep their input order.
        rows.sort_by(|a, b| {
            for (k, key) in keys.iter().enumerate() {
                let ord = order_keys(&a.0[k], &b.0[k], key, collations[k].as_ref());
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        });
        Ok(rows.into_iter().map(|(_, vals)| vals).collect())
    }

    /// Drains the upstream, merging tuples with equal key vectors. Groups
    /// keep first-appearance order; aggregates concatenate in input order.
    fn materialize_groups(
        &mut self,
        idx: usize,
        specs: &[GroupSpec],
        aggregates: &[super::clause::Aggregate],
    ) -> Result<VecDeque<GroupTuple>, Error> {
        let collations: Vec<Arc<dyn Collation>> = specs
            .iter()
            .map(|s| resolve_collation(&self.qc, s.collation.as_deref()))
            .collect::<Result<_, _>>()?;
        let mut groups: Vec<GroupTuple> = Vec::new();
        while self.pull_upstream(idx)? {
            let mut keys = Vec::with_capacity(specs.len());
            for spec in specs {
                keys.push(atomize_key(spec.expr.value(&self.qc)?)?);
            }
            let found = groups.iter().position(|g| {
                g.keys
                    .iter()
                    .zip(&keys)
                    .enumerate()
                    .all(|(k, (a, b))| keys_equal(a, b, collations[k].as_ref()))
            });
            let group = match found {
                Some(at) => &mut groups[at],
                None => {
                    groups.push(GroupTuple { keys, aggs: vec![Vec::new(); aggregates.len()] });
                    groups.last_mut().expect("just pushed")
                }
            };
            for (slot, agg) in group.aggs.iter_mut().zip(aggregates) {
                slot.extend(self.qc.get(&agg.pre)?);
            }
        }
        Ok(groups.into())
    }
}

// Broad value family of a sort key column; mixing families is a type error.
#[derive(Clone, Copy, PartialEq)]
enum KeyFamily {
    Numeric,
    String,
    Boolean,
}

fn family_of(v: &AtomicValue) -> KeyFamily {
    match v {
        AtomicValue::Boolean(_) => KeyFamily::Boolean,
        AtomicValue::String(_) | AtomicValue::Untyped(_) => KeyFamily::String,
        _ => KeyFamily::Numeric,
    }
}

fn check_family(slot: &mut Option<KeyFamily>, v: &AtomicValue) -> Result<(), Error> {
    let fam = family_of(v);
    match slot {
        None => {
            *slot = Some(fam);
            Ok(())
        }
        Some(existing) if *existing == fam => Ok(()),
        Some(_) => Err(Error::from_code(ErrorCode::XPTY0004, format!("sort keys of incomparable types ({v})"))),
    }
}

/// A grouping or sort key must atomize to zero or one item.
fn atomize_key(seq: Sequence) -> Result<Option<AtomicValue>, Error> {
    let mut it = seq.into_iter();
    let first = it.next();
    if it.next().is_some() {
        return Err(Error::from_code(ErrorCode::XPTY0004, "key evaluated to more than one item"));
    }
    Ok(first)
}

/// Orders two key values. Empty sorts per the key's empty-least flag; NaN
/// sorts below every number; descending reverses the whole comparison.
fn order_keys(a: &Option<AtomicValue>, b: &Option<AtomicValue>, key: &SortKey, collation: &dyn Collation) -> Ordering {
    let base = match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => {
            if key.empty_least {
                Ordering::Less
            } else {
                Ordering::Greater
            }
        }
        (Some(_), None) => {
            if key.empty_least {
                Ordering::Greater
            } else {
                Ordering::Less
            }
        }
        (Some(x), Some(y)) => order_values(x, y, collation),
    };
    if key.descending { base.reverse() } else { base }
}

fn order_values(x: &AtomicValue, y: &AtomicValue, collation: &dyn Collation) -> Ordering {
    use AtomicValue as V;
    match (x, y) {
        (V::Boolean(a), V::Boolean(b)) => a.cmp(b),
        (V::String(a) | V::Untyped(a), V::String(b) | V::Untyped(b)) => collation.compare(a, b),
        (V::Integer(a), V::Integer(b)) => a.cmp(b),
        _ => {
            let a = x.as_double().unwrap_or(f64::NAN);
            let b = y.as_double().unwrap_or(f64::NAN);
            match (a.is_nan(), b.is_nan()) {
                (true, true) => Ordering::Equal,
                (true, false) => Ordering::Less,
                (false, true) => Ordering::Greater,
                (false, false) => a.partial_cmp(&b).expect("both finite-or-infinite"),
            }
        }
    }
}

/// Key equality for grouping. NaN groups with NaN; families never mix.
fn keys_equal(a: &Option<AtomicValue>, b: &Option<AtomicValue>, collation: &dyn Collation) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(x), Some(y)) => {
            if family_of(x) != family_of(y) {
                return false;
            }
            order_values(x, y, collation) == Ordering::Equal
        }
        _ => false,
    }
}

fn bind_cond(qc: &QueryContext, cond: &WindowCond, item: &AtomicValue, pos: i64) -> Result<(), Error> {
    if let Some(v) = &cond.item {
        qc.bind(v, vec![item.clone()])?;
    }
    if let Some(v) = &cond.pos {
        qc.bind(v, vec![AtomicValue::Integer(pos)])?;
    }
    Ok(())
}

/// Computes all qualifying windows over one evaluation of the source
/// sequence. Condition variables are bound while probing the predicates and
/// re-bound per emitted window.
fn compute_windows(w: &Window, items: &Sequence, qc: &QueryContext) -> Result<VecDeque<WindowTuple>, Error> {
    let n = items.len();
    let mut out = VecDeque::new();
    let holds = |cond: &WindowCond, i: usize| -> Result<bool, Error> {
        bind_cond(qc, cond, &items[i], i as i64 + 1)?;
        cond.pred.ebv(qc)
    };
    let make = |first: usize, last: usize| WindowTuple {
        items: items[first..=last].to_vec(),
        start_item: items[first].clone(),
        start_pos: first as i64 + 1,
        end_item: items[last].clone(),
        end_pos: last as i64 + 1,
    };

    if w.sliding {
        for i in 0..n {
            if !holds(&w.start, i)? {
                continue;
            }
            let mut closed = None;
            if let Some(end) = &w.end {
                for j in i..n {
                    if holds(end, j)? {
                        closed = Some(j);
                        break;
                    }
                }
            }
            match closed {
                Some(j) => out.push_back(make(i, j)),
                None => {
                    if !w.only_end && n > 0 {
                        out.push_back(make(i, n - 1));
                    }
                }
            }
        }
        return Ok(out);
    }

    // Tumbling: windows never overlap. Without an end condition a window
    // runs until just before the next start (or the end of the sequence).
    let mut i = 0;
    while i < n {
        if !holds(&w.start, i)? {
            i += 1;
            continue;
        }
        if let Some(end) = &w.end {
            let mut closed = None;
            for j in i..n {
                if holds(end, j)? {
                    closed = Some(j);
                    break;
                }
            }
            match closed {
                Some(j) => {
                    out.push_back(make(i, j));
                    i = j + 1;
                }
                None => {
                    if !w.only_end {
                        out.push_back(make(i, n - 1));
                    }
                    i = n;
                }
            }
        } else {
            let mut j = i + 1;
            while j < n && !holds(&w.start, j)? {
                j += 1;
            }
            out.push_back(make(i, j - 1));
            i = j;
        }
    }
    Ok(out)
}

/// The outer driver: one chain advance per surviving tuple, then the return
/// expression's stream is drained before the next advance.
struct PipelineCursor {
    eval: PipelineEval,
    current: Option<SequenceStream>,
    drained: bool,
}

impl SequenceCursor for PipelineCursor {
    fn next_item(&mut self) -> Option<ItemResult> {
        loop {
            if let Some(current) = &mut self.current {
                if let Some(item) = current.next() {
                    return Some(item);
                }
                self.current = None;
            }
            if self.drained {
                return None;
            }
            match self.eval.advance_chain() {
                Ok(true) => {
                    let pipeline = Rc::clone(&self.eval.pipeline);
                    match pipeline.ret.stream(&self.eval.qc) {
                        Ok(stream) => self.current = Some(stream),
                        Err(e) => {
                            self.drained = true;
                            return Some(Err(e));
                        }
                    }
                }
                Ok(false) => {
                    self.drained = true;
                    return None;
                }
                Err(e) => {
                    self.drained = true;
                    return Some(Err(e));
                }
            }
        }
    }
}
