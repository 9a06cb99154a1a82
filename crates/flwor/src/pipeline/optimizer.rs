//! The fixpoint rewrite optimizer.
//!
//! `Pipeline::optimize` applies the rewrite passes round-robin until one full
//! round changes nothing, then runs the finishing passes (where-merging,
//! size-based collapse, leading-where hoisting). All passes operate on
//! indices recomputed per pass; clause removal and insertion go through
//! `Vec` splicing, so no cursor can dangle.

use super::clause::{Clause, Count, For, Let, Where};
use super::{Pipeline, usage::VarUsage};
use crate::expr::{Expr, Flag};
use crate::runtime::{CompileContext, Error};
use crate::var::VarId;
use crate::xdm::AtomicValue;
use std::mem;

/// Backstop for the fixpoint loop. Each pass only reports a change when it
/// actually altered the clause list, so the cap is unreachable short of a
/// rule interaction bug.
const MAX_ROUNDS: usize = 64;

impl Pipeline {
    pub(super) fn optimize(mut self, cx: &mut CompileContext) -> Result<Expr, Error> {
        self.compile_local(cx)?;

        let mut rounds = 0;
        loop {
            let mut changed = self.for_to_let(cx);
            changed |= self.inline_lets(cx)?;
            changed |= self.clean_dead_projections(cx);
            changed |= self.slide_lets_out(cx);
            changed |= self.optimize_where(cx)?;

            if self.clauses.is_empty() {
                cx.note("empty-pipeline", &self.ret);
                return Ok(self.ret);
            }

            changed |= self.flatten(cx)?;

            if !changed {
                break;
            }
            rounds += 1;
            if rounds >= MAX_ROUNDS {
                tracing::warn!(rounds, "optimizer fixpoint cap reached; keeping last consistent state");
                break;
            }
        }

        self.merge_wheres();

        if self.calc_size() == Some(0) && !self.uses(Flag::Ndt) && !self.uses(Flag::Upd) {
            cx.note("collapse-empty", &self);
            return Ok(Expr::Empty);
        }

        if matches!(self.clauses.first(), Some(Clause::Where(_))) {
            let Clause::Where(wh) = self.clauses.remove(0) else {
                unreachable!("first clause checked to be a where");
            };
            cx.note("where-to-if", &wh.pred);
            let then_branch = if self.clauses.is_empty() { self.ret } else { Expr::Pipeline(Box::new(self)) };
            return Ok(Expr::if_then_else(wh.pred, then_branch, Expr::Empty));
        }

        Ok(Expr::Pipeline(Box::new(self)))
    }

    /// Local clause compilation: fold every sub-expression, split
    /// conjunctive where predicates, normalize constant predicates to
    /// boolean literals.
    fn compile_local(&mut self, cx: &mut CompileContext) -> Result<(), Error> {
        let mut i = 0;
        while i < self.clauses.len() {
            self.clauses[i].compile(cx)?;
            if let Clause::Where(wh) = &mut self.clauses[i] {
                if let Expr::And(_) = &wh.pred {
                    let Clause::Where(wh) = self.clauses.remove(i) else {
                        unreachable!("clause checked to be a where");
                    };
                    let Expr::And(parts) = wh.pred else {
                        unreachable!("predicate checked to be a conjunction");
                    };
                    for (k, part) in parts.into_iter().enumerate() {
                        self.clauses.insert(i + k, Clause::Where(Where::new(part)));
                    }
                    continue;
                }
                normalize_const_pred(wh)?;
            }
            i += 1;
        }
        self.ret = mem::replace(&mut self.ret, Expr::Empty).optimize(cx)?;
        Ok(())
    }

    /// Rewrites For clauses over statically-singleton sources to Lets.
    fn for_to_let(&mut self, cx: &mut CompileContext) -> bool {
        let mut changed = false;
        for i in (0..self.clauses.len()).rev() {
            let Clause::For(f) = &self.clauses[i] else { continue };
            if f.pos.is_some() || f.score.is_some() || f.filter.is_some() {
                continue;
            }
            let demotable = match f.source.size() {
                Some(1) => true,
                Some(0) => f.allow_empty,
                _ => false,
            };
            if demotable {
                cx.note("for-to-let", &self.clauses[i]);
                let Clause::For(f) = mem::replace(&mut self.clauses[i], Clause::Where(Where::new(Expr::Empty)))
                else {
                    unreachable!("clause checked to be a for");
                };
                self.clauses[i] = Clause::Let(Let::new(f.var, f.source));
                changed = true;
            }
        }
        changed
    }

    /// Removes dead Lets and inlines cheap or single-use ones.
    fn inline_lets(&mut self, cx: &mut CompileContext) -> Result<bool, Error> {
        let mut changed = false;
        let mut i = 0;
        while i < self.clauses.len() {
            let Clause::Let(lt) = &self.clauses[i] else {
                i += 1;
                continue;
            };
            let id = lt.var.id;
            let plain = !lt.score && !lt.var.check_type;

            if plain && matches!(lt.expr, Expr::VarRef(_)) {
                cx.note("inline-let", &self.clauses[i]);
                let Clause::Let(lt) = self.clauses.remove(i) else {
                    unreachable!("clause checked to be a let");
                };
                self.inline_from(i, id, &lt.expr, cx)?;
                changed = true;
                continue;
            }
            if lt.expr.uses(Flag::Ndt) {
                i += 1;
                continue;
            }
            let usage = self.count_uses(id, i + 1);
            let Clause::Let(lt) = &self.clauses[i] else {
                unreachable!("index untouched since the match above");
            };
            if usage == VarUsage::Never {
                cx.note("remove-unused-let", &self.clauses[i]);
                self.clauses.remove(i);
                changed = true;
                continue;
            }
            let inlinable = plain && !lt.expr.uses(Flag::Ctx) && lt.expr.safe_to_inline();
            let once = usage == VarUsage::Once;
            let cheap = lt.expr.is_cheap() && !lt.expr.uses(Flag::Cns);
            if inlinable && (once || cheap) {
                cx.note("inline-let", &self.clauses[i]);
                let Clause::Let(lt) = self.clauses.remove(i) else {
                    unreachable!("clause checked to be a let");
                };
                self.inline_from(i, id, &lt.expr, cx)?;
                changed = true;
                continue;
            }
            i += 1;
        }
        Ok(changed)
    }

    /// Substitutes `id := replacement` from clause position `from` through
    /// the return expression, re-folding whatever the substitution touched.
    fn inline_from(&mut self, from: usize, id: VarId, replacement: &Expr, cx: &mut CompileContext) -> Result<(), Error> {
        for clause in &mut self.clauses[from..] {
            if clause.inline(id, replacement) {
                clause.compile(cx)?;
            }
        }
        if let Some(ret) = self.ret.substitute(id, replacement) {
            self.ret = ret.optimize(cx)?;
        }
        Ok(())
    }

    /// Drops projection components (OrderBy refs, GroupBy aggregates) that
    /// nothing downstream reads, walking a live-variable set backward from
    /// the return expression.
    fn clean_dead_projections(&mut self, cx: &mut CompileContext) -> bool {
        let mut live = self.ret.free_vars();
        let mut changed = false;
        for i in (0..self.clauses.len()).rev() {
            if self.clauses[i].clean(&live) {
                cx.note("clean-dead-projections", &self.clauses[i]);
                changed = true;
            }
            self.clauses[i].collect_free_vars(&mut live);
        }
        changed
    }

    /// Moves Lets above clauses they do not depend on, to just below the
    /// highest skippable For or Window. Lets carrying non-determinism or
    /// construction effects never move.
    fn slide_lets_out(&mut self, cx: &mut CompileContext) -> bool {
        let mut changed = false;
        let mut i = 1;
        while i < self.clauses.len() {
            let candidate = matches!(self.clauses[i], Clause::Let(_))
                && !self.clauses[i].uses(Flag::Ndt)
                && !self.clauses[i].uses(Flag::Cns);
            if candidate {
                let mut insert = None;
                for j in (0..i).rev() {
                    if !self.clauses[j].skippable(&self.clauses[i]) {
                        break;
                    }
                    // Inserting directly above the highest For or Window
                    // avoids redundant relocation in later rounds.
                    if matches!(self.clauses[j], Clause::For(_) | Clause::Window(_)) {
                        insert = Some(j);
                    }
                }
                if let Some(j) = insert {
                    let clause = self.clauses.remove(i);
                    cx.note("slide-let", &clause);
                    self.clauses.insert(j, clause);
                    changed = true;
                }
            }
            i += 1;
        }
        changed
    }

    /// Hoists Where clauses as early as legally possible, removes
    /// constant-true ones, and absorbs predicates into a directly preceding
    /// For as a source filter.
    fn optimize_where(&mut self, cx: &mut CompileContext) -> Result<bool, Error> {
        let mut changed = false;
        let mut i = 0;
        while i < self.clauses.len() {
            let eligible = matches!(&self.clauses[i], Clause::Where(w) if !w.pred.uses(Flag::Ndt));
            if !eligible {
                i += 1;
                continue;
            }

            let is_const = {
                let Clause::Where(wh) = &mut self.clauses[i] else {
                    unreachable!("clause checked to be a where");
                };
                normalize_const_pred(wh)?;
                match &wh.pred {
                    Expr::Literal(AtomicValue::Boolean(b)) => Some(*b),
                    _ => None,
                }
            };
            match is_const {
                // Always false: no results are possible; finishing passes
                // collapse the pipeline.
                Some(false) => break,
                Some(true) => {
                    cx.note("remove-where", &self.clauses[i]);
                    self.clauses.remove(i);
                    changed = true;
                    continue;
                }
                None => {}
            }

            // Wheres are moved whenever anything other than another Where
            // can be skipped; counting Where-only hops as progress would
            // loop forever. Clauses carrying non-determinism or construction
            // effects are never skipped: filtering earlier would change how
            // often they evaluate.
            let mut insert = None;
            for j in (0..i).rev() {
                if !self.clauses[j].skippable(&self.clauses[i])
                    || self.clauses[j].uses(Flag::Ndt)
                    || self.clauses[j].uses(Flag::Cns)
                {
                    break;
                }
                if !matches!(self.clauses[j], Clause::Where(_)) {
                    insert = Some(j);
                }
            }
            if let Some(j) = insert {
                let clause = self.clauses.remove(i);
                cx.note("hoist-where", &clause);
                self.clauses.insert(j, clause);
                changed = true;
            }

            let new_pos = insert.unwrap_or(i);
            let mut absorbed = false;
            let mut b4 = new_pos;
            while b4 > 0 {
                b4 -= 1;
                match &self.clauses[b4] {
                    Clause::For(f) => {
                        if f.pos.is_none() && f.score.is_none() && !f.allow_empty {
                            let Clause::Where(wh) = self.clauses.remove(new_pos) else {
                                unreachable!("new_pos tracks the moved where");
                            };
                            cx.note("absorb-where", &wh.pred);
                            let Clause::For(f) = &mut self.clauses[b4] else {
                                unreachable!("clause checked to be a for");
                            };
                            f.filter = Some(match f.filter.take() {
                                Some(prev) => Expr::And(vec![prev, wh.pred]),
                                None => wh.pred,
                            });
                            absorbed = true;
                            changed = true;
                        }
                        break;
                    }
                    Clause::Where(w) if !w.pred.uses(Flag::Ndt) => continue,
                    _ => break,
                }
            }

            if absorbed && insert.is_none() {
                // The where vanished from position i; the next clause moved up.
                continue;
            }
            i += 1;
        }
        Ok(changed)
    }

    /// The three flattening rules, mutually exclusive per round.
    fn flatten(&mut self, cx: &mut CompileContext) -> Result<bool, Error> {
        // (a) `... for $x in E return $x`  ==>  `... return E`
        if let (Expr::VarRef(v), Some(Clause::For(f))) = (&self.ret, self.clauses.last())
            && f.var.id == v.id
            && !f.var.check_type
            && f.pos.is_none()
            && f.score.is_none()
            && f.filter.is_none()
            && !f.allow_empty
        {
            let Some(Clause::For(f)) = self.clauses.pop() else {
                unreachable!("last clause checked to be a for");
            };
            cx.note("flatten-return", &f.var);
            self.ret = f.source;
            return Ok(true);
        }

        // (b) a leading For over a nested pipeline splices the inner clauses
        // in front, preserving a positional binding as a Count clause.
        if let Some(Clause::For(f)) = self.clauses.first()
            && !f.allow_empty
            && matches!(f.source, Expr::Pipeline(_))
        {
            let Clause::For(f) = self.clauses.remove(0) else {
                unreachable!("first clause checked to be a for");
            };
            let Expr::Pipeline(sub) = f.source else {
                unreachable!("source checked to be a pipeline");
            };
            let sub = *sub;
            cx.note("flatten-for", &f.var);
            let mut spliced = sub.clauses;
            spliced.push(Clause::For(For {
                var: f.var,
                pos: None,
                score: f.score,
                source: sub.ret,
                allow_empty: false,
                filter: f.filter,
            }));
            if let Some(pos) = f.pos {
                spliced.push(Clause::Count(Count { var: pos }));
            }
            spliced.append(&mut self.clauses);
            self.clauses = spliced;
            return Ok(true);
        }

        // (c) a return expression that is itself a for/let/where pipeline is
        // appended in place.
        if let Expr::Pipeline(sub) = &self.ret
            && sub.is_flwr()
        {
            let Expr::Pipeline(sub) = mem::replace(&mut self.ret, Expr::Empty) else {
                unreachable!("return checked to be a pipeline");
            };
            let sub = *sub;
            cx.note("flatten-nested", &sub);
            self.clauses.extend(sub.clauses);
            self.ret = sub.ret;
            return Ok(true);
        }

        Ok(false)
    }

    /// Merges consecutive Where clauses into one conjunction. A literal
    /// false predicate stops the merge; the size-based collapse handles it.
    fn merge_wheres(&mut self) {
        let mut prev: Option<usize> = None;
        let mut i = 0;
        while i < self.clauses.len() {
            match &self.clauses[i] {
                Clause::Where(wh) => {
                    if matches!(wh.pred, Expr::Literal(AtomicValue::Boolean(false))) {
                        return;
                    }
                    if let Some(p) = prev {
                        let Clause::Where(wh) = self.clauses.remove(i) else {
                            unreachable!("clause checked to be a where");
                        };
                        let Clause::Where(merged) = &mut self.clauses[p] else {
                            unreachable!("prev always indexes a where");
                        };
                        let old = mem::replace(&mut merged.pred, Expr::Empty);
                        merged.pred = match old {
                            Expr::And(mut parts) => {
                                parts.push(wh.pred);
                                Expr::And(parts)
                            }
                            other => Expr::And(vec![other, wh.pred]),
                        };
                    } else {
                        prev = Some(i);
                        i += 1;
                    }
                }
                _ => {
                    prev = None;
                    i += 1;
                }
            }
        }
    }
}

// A constant predicate becomes its effective boolean value; failures here
// are ordinary evaluation errors surfaced at compile time.
fn normalize_const_pred(wh: &mut Where) -> Result<(), Error> {
    if matches!(wh.pred, Expr::Literal(AtomicValue::Boolean(_))) {
        return Ok(());
    }
    if let Some(c) = wh.pred.as_const() {
        wh.pred = Expr::boolean(crate::xdm::ebv(&c)?);
    }
    Ok(())
}
