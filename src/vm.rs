// Copyright 2014-2015 The Rust Project Developers. See the COPYRIGHT
// file at the top-level directory of this distribution and at
// http://rust-lang.org/COPYRIGHT.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The backtracking matcher: a two-phase (forward-step / backtrack-pop)
//! interpreter over the compiled opcode vector. There is no recursive
//! descent through the pattern; every choice the matcher can revisit is an
//! explicit entry on `events`, and a nested assertion runs its own private
//! event stack rather than borrowing the caller's.

use std::collections::HashMap;

use crate::captures::Captures;
use crate::classify;
use crate::opcode::{NameId, OpIdx, Opcode, Quantifier, RangeTarget};

/// Returned by a bracket observer to let the caller abort a match in
/// progress, e.g. because a group's captured text failed an external check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Control {
    Continue,
    Cancel,
}

/// Notified every time a capturing group (named or positional) closes
/// during the search, before the matcher decides whether to keep going.
pub trait BracketObserver {
    fn on_close(&mut self, index: Option<u32>, name: Option<NameId>, start: usize, end: usize) -> Control;
}

/// An observer that never cancels, used when the caller supplies none.
pub struct NullObserver;

impl BracketObserver for NullObserver {
    fn on_close(&mut self, _index: Option<u32>, _name: Option<NameId>, _start: usize, _end: usize) -> Control {
        Control::Continue
    }
}

#[derive(Clone, Copy, Debug)]
enum CapIndex {
    Positional(u32),
    Named(NameId),
}

enum Event {
    CaptureUndo { index: CapIndex, old: (isize, isize) },
    IterUndo { open: OpIdx, old: u32 },
    Choice(Resume, usize),
}

#[derive(Clone, Copy)]
enum Resume {
    /// Resume ordinary sequential execution at `pc`.
    At(OpIdx),
    /// Resume the decision loop for a quantified leaf/back-reference that
    /// has already consumed `count` repetitions.
    RangeMore { pc: OpIdx, count: u32 },
    /// Force one more iteration of a quantified group's body (the lazy
    /// retry path — see `force_group_iteration`).
    GroupMore { open: OpIdx },
    /// A `\O` cut: popping this ends the whole attempt, not just this choice.
    Cut,
}

pub enum Outcome {
    Matched { end: usize },
    NoMatch,
    Canceled,
}

pub struct Vm<'p, 't> {
    prog: &'p [Opcode],
    text: &'t [u16],
    /// The `\A`/data-origin position: fixed for the lifetime of one call,
    /// independent of where a `search` candidate start happens to be.
    origin: usize,
    /// Exclusive upper bound of the matching window (`\Z`/data-end).
    end_bound: usize,
    case_insensitive: bool,
    captures: &'p mut Captures,
    observer: &'p mut dyn BracketObserver,
    events: Vec<Event>,
    iter_counts: HashMap<OpIdx, u32>,
}

impl<'p, 't> Vm<'p, 't> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        prog: &'p [Opcode],
        text: &'t [u16],
        origin: usize,
        end_bound: usize,
        case_insensitive: bool,
        captures: &'p mut Captures,
        observer: &'p mut dyn BracketObserver,
    ) -> Self {
        Vm {
            prog,
            text,
            origin,
            end_bound,
            case_insensitive,
            captures,
            observer,
            events: Vec::new(),
            iter_counts: HashMap::new(),
        }
    }

    /// Runs the whole program starting at `start_pc` (normally `0`, the
    /// implicit outer group) from `pos`. Succeeds when execution reaches
    /// `Opcode::RegexpEnd`.
    pub fn run(&mut self, start_pc: OpIdx, pos: usize) -> Outcome {
        let end_pc = self.prog.len() - 1;
        match self.drive(start_pc, pos, end_pc, None) {
            Some((_pos, canceled)) if canceled => Outcome::Canceled,
            Some((end, _)) => Outcome::Matched { end },
            None => Outcome::NoMatch,
        }
    }

    /// Runs the body of an assertion (a `LookAhead`/`NotLookAhead`/
    /// `LookBehind`/`NotLookBehind`'s interior), stopping when execution
    /// reaches `done_pc` (the assertion's own `CloseAssertion`).
    ///
    /// When `require_pos` is `Some`, the body must end at exactly that text
    /// position for the run to count as successful (used by lookbehind).
    fn run_assertion_body(&mut self, start_pc: OpIdx, pos: usize, done_pc: OpIdx, require_pos: Option<usize>) -> bool {
        let mark = self.events.len();
        match self.drive(start_pc, pos, done_pc, require_pos) {
            Some((_, canceled)) => {
                if canceled {
                    // A cancellation inside an assertion aborts only the
                    // assertion's own search for a witness.
                    self.unwind_to(mark);
                    return false;
                }
                // Leave `mark..` on the stack: the assertion's own
                // successful choices never get replayed (lookaround is
                // first-witness-wins), but its capture writes persist.
                self.events.truncate(mark);
                true
            }
            None => {
                self.unwind_to(mark);
                false
            }
        }
    }

    fn unwind_to(&mut self, mark: usize) {
        while self.events.len() > mark {
            if let Some(Event::CaptureUndo { index, old }) = self.events.pop() {
                self.restore_capture(index, old);
            }
        }
    }

    /// The forward-step / backtrack-pop loop, shared by the top-level run
    /// and every nested assertion. Returns `Some((pos, canceled))` when
    /// `done_pc` is reached (and, if `require_pos` is set, only when the
    /// final position matches it); `None` once every choice is exhausted.
    fn drive(
        &mut self,
        start_pc: OpIdx,
        start_pos: usize,
        done_pc: OpIdx,
        require_pos: Option<usize>,
    ) -> Option<(usize, bool)> {
        let mut pc = start_pc;
        let mut pos = start_pos;
        let mut pending_count: Option<u32> = None;
        loop {
            if pc == done_pc {
                if require_pos.map_or(true, |want| want == pos) {
                    return Some((pos, false));
                } else if !self.backtrack(&mut pc, &mut pos, &mut pending_count) {
                    return None;
                } else {
                    continue;
                }
            }
            match self.step(pc, pos, pending_count.take()) {
                StepResult::Advance(npc, npos, carried_count) => {
                    pc = npc;
                    pos = npos;
                    pending_count = carried_count;
                }
                StepResult::Canceled => return Some((pos, true)),
                StepResult::Fail => {
                    if !self.backtrack(&mut pc, &mut pos, &mut pending_count) {
                        return None;
                    }
                }
            }
        }
    }

    fn backtrack(&mut self, pc: &mut OpIdx, pos: &mut usize, pending_count: &mut Option<u32>) -> bool {
        loop {
            match self.events.pop() {
                None => return false,
                Some(Event::CaptureUndo { index, old }) => self.restore_capture(index, old),
                Some(Event::IterUndo { open, old }) => {
                    self.iter_counts.insert(open, old);
                }
                Some(Event::Choice(resume, saved_pos)) => match resume {
                    Resume::Cut => return false,
                    Resume::At(npc) => {
                        *pc = npc;
                        *pos = saved_pos;
                        return true;
                    }
                    // A lazy quantifier's retry means "consume one more
                    // repetition, then resume the decision loop" — not
                    // "ask the same question again", which would just
                    // reproduce this exact choice forever.
                    Resume::RangeMore { pc: npc, count } => match self.consume_one(npc, saved_pos) {
                        Some(new_pos) => {
                            *pc = npc;
                            *pos = new_pos;
                            *pending_count = Some(count + 1);
                            return true;
                        }
                        None => continue,
                    },
                    Resume::GroupMore { open } => {
                        match self.force_group_iteration(open, saved_pos) {
                            StepResult::Advance(npc, npos, _) => {
                                *pc = npc;
                                *pos = npos;
                                *pending_count = None;
                                return true;
                            }
                            _ => unreachable!("forcing a group iteration always advances"),
                        }
                    }
                },
            }
        }
    }

    fn restore_capture(&mut self, index: CapIndex, old: (isize, isize)) {
        match index {
            CapIndex::Positional(i) => self.captures.set_raw(i as usize, old),
            CapIndex::Named(n) => self.captures.set_raw_named(n, old),
        }
    }

    fn set_capture(&mut self, index: CapIndex, value: (isize, isize)) {
        let old = match index {
            CapIndex::Positional(i) => self.captures.raw(i as usize),
            CapIndex::Named(n) => self.captures.raw_named(n),
        };
        self.events.push(Event::CaptureUndo { index, old });
        match index {
            CapIndex::Positional(i) => self.captures.set_raw(i as usize, value),
            CapIndex::Named(n) => self.captures.set_raw_named(n, value),
        }
    }

    /// Reads the code unit that would be consumed at `pos`, honoring the
    /// matching window's exclusive end.
    fn code_unit_at(&self, pos: usize) -> Option<u16> {
        if pos >= self.end_bound {
            return None;
        }
        self.text.get(pos).copied()
    }

    /// Reads a neighboring code unit for a zero-width assertion, ignoring
    /// the matching window (line/word boundaries look at the real buffer,
    /// only `\A`/`\Z` are pinned to `origin`/`end_bound`).
    fn raw_unit_at(&self, pos: usize) -> Option<u16> {
        self.text.get(pos).copied()
    }

    fn matches_target(&self, target: &RangeTarget, cu: u16) -> bool {
        match target {
            RangeTarget::Any => cu != b'\n' as u16,
            RangeTarget::AnyAll => true,
            RangeTarget::Symbol(s) => cu == *s,
            RangeTarget::NotSymbol(s) => cu != *s,
            RangeTarget::SymbolCi(s) => classify::to_lower(cu) == *s,
            RangeTarget::NotSymbolCi(s) => classify::to_lower(cu) != *s,
            RangeTarget::CharType(t) => classify::check_type(*t, cu),
            RangeTarget::NotCharType(t) => !classify::check_type(*t, cu),
            RangeTarget::Class(set) => set.contains(cu),
        }
    }

    fn at_word_boundary(&self, pos: usize) -> bool {
        let before = pos.checked_sub(1).and_then(|p| self.raw_unit_at(p)).map_or(false, classify::is_word);
        let after = self.raw_unit_at(pos).map_or(false, classify::is_word);
        before != after
    }

    /// Executes exactly one opcode and returns where to continue, or why it
    /// failed. `resumed_count`, when `Some`, means this call is a backtrack
    /// re-entry into a quantifier's decision loop that had already consumed
    /// that many repetitions.
    fn step(&mut self, pc: OpIdx, pos: usize, resumed_count: Option<u32>) -> StepResult {
        match &self.prog[pc] {
            Opcode::DataStart => cond(pos == self.origin, pc + 1, pos),
            Opcode::DataEnd => cond(pos == self.end_bound, pc + 1, pos),
            Opcode::LineStart => {
                cond(pos == self.origin || (pos > 0 && self.raw_unit_at(pos - 1) == Some(b'\n' as u16)), pc + 1, pos)
            }
            Opcode::LineEnd => cond(pos == self.end_bound || self.raw_unit_at(pos) == Some(b'\n' as u16), pc + 1, pos),
            Opcode::WordBound => cond(self.at_word_boundary(pos), pc + 1, pos),
            Opcode::NotWordBound => cond(!self.at_word_boundary(pos), pc + 1, pos),
            Opcode::NoReturn => {
                self.events.push(Event::Choice(Resume::Cut, pos));
                StepResult::Advance(pc + 1, pos, None)
            }

            Opcode::Any | Opcode::AnyAll | Opcode::Symbol(_) | Opcode::NotSymbol(_) | Opcode::SymbolCi(_)
            | Opcode::NotSymbolCi(_) | Opcode::CharType(_) | Opcode::NotCharType(_) | Opcode::Class(_) => {
                let target = leaf_target(&self.prog[pc]);
                match self.code_unit_at(pos) {
                    Some(cu) if self.matches_target(&target, cu) => StepResult::Advance(pc + 1, pos + 1, None),
                    _ => StepResult::Fail,
                }
            }

            Opcode::Range(r) => self.step_range(pc, pos, r.quant, &r.target, resumed_count),

            Opcode::BackRef(b) => {
                let span = self.captures.get(b.index as usize);
                self.step_backref(pc, pos, b.quant, span, resumed_count)
            }
            Opcode::NamedBackRef(b) => {
                let span = self.captures.get_named_raw(b.name);
                self.step_backref(pc, pos, b.quant, span, resumed_count)
            }

            Opcode::Open(o) => {
                let index = o.index;
                let quant = o.quant;
                let mate = o.mate;
                self.enter_group(pc, pos, CapIndex::Positional(index.unwrap_or(u32::MAX)), index.is_some(), quant, mate, resumed_count)
            }
            Opcode::NamedOpen(o) => {
                let name = o.name;
                let quant = o.quant;
                let mate = o.mate;
                self.enter_group(pc, pos, CapIndex::Named(name), true, quant, mate, resumed_count)
            }

            Opcode::Close(c) => self.leave_group(pc, pos, c.mate),
            Opcode::NamedClose(c) => self.leave_group(pc, pos, c.mate),

            Opcode::Alternative(_) => StepResult::Advance(pc + 1, pos, None),

            Opcode::LookAhead(a) => {
                let ok = self.run_assertion_body(pc + 1, pos, a.mate, None);
                cond(ok, a.mate + 1, pos)
            }
            Opcode::NotLookAhead(a) => {
                let ok = self.run_assertion_body(pc + 1, pos, a.mate, None);
                cond(!ok, a.mate + 1, pos)
            }
            Opcode::LookBehind(a) => {
                let width = a.fixed_width.unwrap_or(0) as usize;
                if pos < self.origin + width {
                    return StepResult::Fail;
                }
                let ok = self.run_assertion_body(pc + 1, pos - width, a.mate, Some(pos));
                cond(ok, a.mate + 1, pos)
            }
            Opcode::NotLookBehind(a) => {
                let width = a.fixed_width.unwrap_or(0) as usize;
                let ok = pos >= self.origin + width && self.run_assertion_body(pc + 1, pos - width, a.mate, Some(pos));
                cond(!ok, a.mate + 1, pos)
            }
            Opcode::CloseAssertion(_) => StepResult::Advance(pc + 1, pos, None),

            Opcode::RegexpEnd => StepResult::Advance(pc, pos, None),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn enter_group(
        &mut self,
        open_pc: OpIdx,
        pos: usize,
        index: CapIndex,
        has_slot: bool,
        quant: Option<Quantifier>,
        mate: OpIdx,
        resumed_count: Option<u32>,
    ) -> StepResult {
        match quant {
            None => {
                if has_slot {
                    self.mark_group_start(index, pos);
                }
                StepResult::Advance(open_pc + 1, pos, None)
            }
            Some(q) => {
                let count = match resumed_count {
                    Some(c) => c,
                    None => {
                        // A fresh pass through this static opener: its
                        // `iter_counts` entry may still hold the count left
                        // over from a prior pass (e.g. an outer repetition
                        // re-entering this same group), so reset it rather
                        // than let `leave_group` read the stale value.
                        let old = self.iter_counts.insert(open_pc, 0).unwrap_or(0);
                        self.events.push(Event::IterUndo { open: open_pc, old });
                        0
                    }
                };
                if count < q.min {
                    if has_slot {
                        self.mark_group_start(index, pos);
                    }
                    StepResult::Advance(open_pc + 1, pos, None)
                } else if !q.lazy {
                    if !q.max.is_reached(count) {
                        self.events.push(Event::Choice(Resume::At(mate + 1), pos));
                        if has_slot {
                            self.mark_group_start(index, pos);
                        }
                        StepResult::Advance(open_pc + 1, pos, None)
                    } else {
                        StepResult::Advance(mate + 1, pos, None)
                    }
                } else {
                    if !q.max.is_reached(count) {
                        self.events.push(Event::Choice(Resume::GroupMore { open: open_pc }, pos));
                    }
                    StepResult::Advance(mate + 1, pos, None)
                }
            }
        }
    }

    /// Consumes one repetition of a quantified leaf or back-reference at
    /// `pos`, without touching `events` — used only to replay a lazy
    /// quantifier's "try one more" choice.
    fn consume_one(&self, pc: OpIdx, pos: usize) -> Option<usize> {
        match &self.prog[pc] {
            Opcode::Range(r) => {
                let cu = self.code_unit_at(pos)?;
                self.matches_target(&r.target, cu).then_some(pos + 1)
            }
            Opcode::BackRef(b) => self.consume_backref(self.captures.get(b.index as usize), pos),
            Opcode::NamedBackRef(b) => self.consume_backref(self.captures.get_named_raw(b.name), pos),
            _ => None,
        }
    }

    fn consume_backref(&self, span: Option<(usize, usize)>, pos: usize) -> Option<usize> {
        let (start, end) = span?;
        let width = end - start;
        if pos + width > self.end_bound {
            return None;
        }
        let matches = (0..width)
            .all(|k| classify::code_unit_eq(self.text[pos + k], self.text[start + k], self.case_insensitive));
        matches.then_some(pos + width)
    }

    /// Forces one more iteration of a quantified group's body, bypassing
    /// the usual stop/continue decision — used only to replay a lazy
    /// group's "try one more" choice.
    fn force_group_iteration(&mut self, open_pc: OpIdx, pos: usize) -> StepResult {
        let (index, has_slot) = match &self.prog[open_pc] {
            Opcode::Open(o) => (CapIndex::Positional(o.index.unwrap_or(u32::MAX)), o.index.is_some()),
            Opcode::NamedOpen(o) => (CapIndex::Named(o.name), true),
            _ => unreachable!("a GroupMore choice always points at a group opener"),
        };
        if has_slot {
            self.mark_group_start(index, pos);
        }
        StepResult::Advance(open_pc + 1, pos, None)
    }

    fn mark_group_start(&mut self, index: CapIndex, pos: usize) {
        let old = match index {
            CapIndex::Positional(i) if i != u32::MAX => Some(self.captures.raw(i as usize)),
            CapIndex::Named(n) => Some(self.captures.raw_named(n)),
            _ => None,
        };
        if let Some(old) = old {
            self.events.push(Event::CaptureUndo { index, old });
            let new_value = (pos as isize, old.1);
            match index {
                CapIndex::Positional(i) => self.captures.set_raw(i as usize, new_value),
                CapIndex::Named(n) => self.captures.set_raw_named(n, new_value),
                _ => {}
            }
        }
    }

    fn leave_group(&mut self, close_pc: OpIdx, pos: usize, open_pc: OpIdx) -> StepResult {
        let (index, has_slot) = match &self.prog[open_pc] {
            Opcode::Open(o) => (CapIndex::Positional(o.index.unwrap_or(u32::MAX)), o.index.is_some()),
            Opcode::NamedOpen(o) => (CapIndex::Named(o.name), true),
            _ => unreachable!("close opcode's mate is always an opener"),
        };
        if has_slot {
            let start = match index {
                CapIndex::Positional(i) => self.captures.raw(i as usize).0,
                CapIndex::Named(n) => self.captures.raw_named(n).0,
            };
            self.set_capture(index, (start, pos as isize));
            let control = {
                let (idx_num, name) = match index {
                    CapIndex::Positional(i) => (Some(i), None),
                    CapIndex::Named(n) => (None, Some(n)),
                };
                self.observer.on_close(idx_num, name, start.max(0) as usize, pos)
            };
            if control == Control::Cancel {
                return StepResult::Canceled;
            }
        }

        let quant = match &self.prog[open_pc] {
            Opcode::Open(o) => o.quant,
            Opcode::NamedOpen(o) => o.quant,
            _ => None,
        };
        match quant {
            None => StepResult::Advance(close_pc + 1, pos, None),
            Some(q) => {
                let count = self.iter_counts.get(&open_pc).copied().unwrap_or(0);
                let new_count = count + 1;
                self.events.push(Event::IterUndo { open: open_pc, old: count });
                self.iter_counts.insert(open_pc, new_count);
                // Re-enter the group's decision loop at its own `Open`
                // opcode, now having completed `new_count` iterations.
                StepResult::Advance(open_pc, pos, None)
                    .with_pending(new_count)
            }
        }
    }

    fn step_range(
        &mut self,
        pc: OpIdx,
        pos: usize,
        quant: Quantifier,
        target: &RangeTarget,
        resumed_count: Option<u32>,
    ) -> StepResult {
        let count = resumed_count.unwrap_or(0);
        if count < quant.min {
            match self.code_unit_at(pos) {
                Some(cu) if self.matches_target(target, cu) => {
                    StepResult::Advance(pc, pos + 1, None).with_pending(count + 1)
                }
                _ => StepResult::Fail,
            }
        } else if !quant.lazy {
            if !quant.max.is_reached(count) {
                if let Some(cu) = self.code_unit_at(pos) {
                    if self.matches_target(target, cu) {
                        self.events.push(Event::Choice(Resume::At(pc + 1), pos));
                        return StepResult::Advance(pc, pos + 1, None).with_pending(count + 1);
                    }
                }
            }
            StepResult::Advance(pc + 1, pos, None)
        } else {
            if !quant.max.is_reached(count) {
                self.events.push(Event::Choice(Resume::RangeMore { pc, count }, pos));
            }
            StepResult::Advance(pc + 1, pos, None)
        }
    }

    fn step_backref(
        &mut self,
        pc: OpIdx,
        pos: usize,
        quant: Option<Quantifier>,
        span: Option<(usize, usize)>,
        resumed_count: Option<u32>,
    ) -> StepResult {
        let (start, end) = match span {
            Some(s) => s,
            None => return StepResult::Fail,
        };
        let width = end - start;
        let matches_once = |this: &Self, at: usize| -> bool {
            if at + width > this.end_bound {
                return false;
            }
            (0..width).all(|k| {
                classify::code_unit_eq(this.text[at + k], this.text[start + k], this.case_insensitive)
            })
        };
        match quant {
            None => {
                if matches_once(self, pos) {
                    StepResult::Advance(pc + 1, pos + width, None)
                } else {
                    StepResult::Fail
                }
            }
            Some(q) => {
                let count = resumed_count.unwrap_or(0);
                if count < q.min {
                    if matches_once(self, pos) {
                        StepResult::Advance(pc, pos + width, None).with_pending(count + 1)
                    } else {
                        StepResult::Fail
                    }
                } else if !q.lazy {
                    if !q.max.is_reached(count) && matches_once(self, pos) {
                        self.events.push(Event::Choice(Resume::At(pc + 1), pos));
                        StepResult::Advance(pc, pos + width, None).with_pending(count + 1)
                    } else {
                        StepResult::Advance(pc + 1, pos, None)
                    }
                } else {
                    if !q.max.is_reached(count) {
                        self.events.push(Event::Choice(Resume::RangeMore { pc, count }, pos));
                    }
                    StepResult::Advance(pc + 1, pos, None)
                }
            }
        }
    }
}

fn cond(ok: bool, pc: OpIdx, pos: usize) -> StepResult {
    if ok {
        StepResult::Advance(pc, pos, None)
    } else {
        StepResult::Fail
    }
}

fn leaf_target(op: &Opcode) -> RangeTarget {
    match op {
        Opcode::Any => RangeTarget::Any,
        Opcode::AnyAll => RangeTarget::AnyAll,
        Opcode::Symbol(s) => RangeTarget::Symbol(*s),
        Opcode::NotSymbol(s) => RangeTarget::NotSymbol(*s),
        Opcode::SymbolCi(s) => RangeTarget::SymbolCi(*s),
        Opcode::NotSymbolCi(s) => RangeTarget::NotSymbolCi(*s),
        Opcode::CharType(t) => RangeTarget::CharType(*t),
        Opcode::NotCharType(t) => RangeTarget::NotCharType(*t),
        Opcode::Class(set) => RangeTarget::Class(set.clone()),
        _ => unreachable!("leaf_target called on a non-leaf opcode"),
    }
}

enum StepResult {
    /// Continue at `(pc, pos)`. The optional count is carried into the next
    /// call to `step` as `resumed_count`, letting a quantifier's decision
    /// loop recurse into itself without the driver knowing it's special.
    Advance(OpIdx, usize, Option<u32>),
    Fail,
    Canceled,
}

impl StepResult {
    fn with_pending(self, count: u32) -> StepResult {
        match self {
            StepResult::Advance(pc, pos, _) => StepResult::Advance(pc, pos, Some(count)),
            other => other,
        }
    }
}
