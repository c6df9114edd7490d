// Copyright 2014-2015 The Rust Project Developers. See the COPYRIGHT
// file at the top-level directory of this distribution and at
// http://rust-lang.org/COPYRIGHT.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! `CompiledPattern`: the public match-time surface, wiring the compiler,
//! the optimizer and the backtracking VM together. The four entry points
//! (`match_at`, `match_ex`, `search`, `search_ex`) and their fast paths are
//! grounded directly in the source engine's `RegExp::Match`/`MatchEx`/
//! `Search`/`SearchEx`.

use std::collections::HashMap;

use crate::captures::Captures;
use crate::compiler::{self, CompileFlags};
use crate::error::{CompileError, MatchError, MatchOutcome};
use crate::opcode::{NameId, Opcode};
use crate::optimizer;
use crate::uniset::UniSet;
use crate::vm::{BracketObserver, NullObserver, Outcome, Vm};

/// A compiled pattern: an opcode graph plus the bookkeeping the matcher and
/// its two optimizer passes need. Cheap to `Clone` (see DESIGN.md) since
/// every cross-reference inside `ops` is a plain index, not a pointer.
#[derive(Clone)]
pub struct CompiledPattern {
    original: String,
    ops: Vec<Opcode>,
    capture_count: u32,
    max_backref: u32,
    names: Vec<String>,
    name_to_id: HashMap<String, NameId>,
    has_named_brackets: bool,
    has_lookahead: bool,
    case_insensitive: bool,
    min_length: usize,
    first: Option<UniSet>,
}

impl CompiledPattern {
    /// Compiles a bare pattern body under `flags`.
    pub fn compile(pattern: &str, flags: CompileFlags) -> Result<CompiledPattern, CompileError> {
        let units: Vec<u16> = pattern.encode_utf16().collect();
        Self::from_units(pattern, &units, flags)
    }

    /// Compiles `pattern`, first peeling off a Perl-style `/body/flags`
    /// delimiter if one is present (flags found there are merged on top of
    /// `base`).
    pub fn compile_delimited(pattern: &str, base: CompileFlags) -> Result<CompiledPattern, CompileError> {
        let (units, flags) = compiler::split_delimited(pattern, base)?;
        Self::from_units(pattern, &units, flags)
    }

    fn from_units(original: &str, units: &[u16], flags: CompileFlags) -> Result<CompiledPattern, CompileError> {
        let compiled = compiler::compile(units, flags)?;
        let info = optimizer::analyze(&compiled.ops);
        Ok(CompiledPattern {
            original: original.to_string(),
            ops: compiled.ops,
            capture_count: compiled.capture_count,
            max_backref: compiled.max_backref,
            names: compiled.names,
            name_to_id: compiled.name_to_id,
            has_named_brackets: compiled.has_named_brackets,
            has_lookahead: compiled.has_lookahead,
            case_insensitive: flags.ignore_case,
            min_length: info.min_length,
            first: info.first,
        })
    }

    /// The pattern text this was compiled from.
    pub fn as_str(&self) -> &str {
        &self.original
    }

    /// Number of capturing groups, not counting the implicit whole-match
    /// group 0.
    pub fn capture_count(&self) -> u32 {
        self.capture_count
    }

    /// Names of every `(?{name}...)` group, in definition order.
    pub fn capture_names(&self) -> &[String] {
        &self.names
    }

    /// Allocates a `Captures` sized correctly for this pattern: one
    /// positional slot per capturing group (plus group 0), and one named
    /// slot per `(?{name}...)` group.
    pub fn alloc_captures(&self) -> Captures {
        Captures::new(self.capture_count.max(self.max_backref) as usize + 1, self.names.len())
    }

    /// Reads a named group's span out of `captures`, `None` if the pattern
    /// has no group by that name or the group didn't participate.
    pub fn named_capture(&self, captures: &Captures, name: &str) -> Option<(usize, usize)> {
        let id = *self.name_to_id.get(name)?;
        captures.get_named_raw(id)
    }

    fn check_capacity(&self, captures: &Captures) -> Result<(), MatchError> {
        let needed = self.capture_count.max(self.max_backref) as usize + 1;
        if captures.len() < needed {
            return Err(MatchError::NotEnoughMatches { needed });
        }
        if self.has_named_brackets && captures.named_len() < self.names.len() {
            return Err(MatchError::NoStorageForNamedBrackets);
        }
        Ok(())
    }

    /// Anchored match: the pattern is tried once, starting exactly at `pos`,
    /// which also serves as the `\A`/`^` anchor position. `end` is the
    /// exclusive upper bound of the text the match is allowed to consume.
    pub fn match_at(&self, text: &[u16], pos: usize, end: usize, captures: &mut Captures) -> Result<MatchOutcome, MatchError> {
        self.match_ex_with_observer(text, pos, pos, end, captures, &mut NullObserver)
    }

    /// Like [`match_at`](Self::match_at), but `\A`/`^`/lookbehind anchor to
    /// `data_origin` while the attempt itself still begins at `text_start`
    /// (which may differ, e.g. when matching a sub-window of a larger
    /// buffer without losing the buffer's true origin).
    pub fn match_ex(
        &self,
        text: &[u16],
        data_origin: usize,
        text_start: usize,
        end: usize,
        captures: &mut Captures,
    ) -> Result<MatchOutcome, MatchError> {
        self.match_ex_with_observer(text, data_origin, text_start, end, captures, &mut NullObserver)
    }

    /// As [`match_ex`](Self::match_ex), notifying `observer` every time a
    /// capturing group closes.
    pub fn match_ex_with_observer(
        &self,
        text: &[u16],
        data_origin: usize,
        text_start: usize,
        end: usize,
        captures: &mut Captures,
        observer: &mut dyn BracketObserver,
    ) -> Result<MatchOutcome, MatchError> {
        self.check_capacity(captures)?;
        captures.clear();

        if self.min_length > 0 && end.saturating_sub(data_origin) < self.min_length {
            return Ok(MatchOutcome::NoMatch);
        }
        if let Some(first) = &self.first {
            match text.get(text_start) {
                Some(&cu) if first.contains(cu) => {}
                _ => return Ok(MatchOutcome::NoMatch),
            }
        }

        let tempend = match optimizer::trim_tail(&self.ops, self.has_lookahead, self.case_insensitive, text, data_origin, end) {
            Some(e) => e,
            None => return Ok(MatchOutcome::NoMatch),
        };
        if tempend < text_start {
            return Ok(MatchOutcome::NoMatch);
        }

        Ok(self.run_inner(text, data_origin, text_start, tempend, captures, observer))
    }

    /// Unanchored search over `[start, end)`: tries successive starting
    /// positions until one matches or the window is exhausted.
    pub fn search(&self, text: &[u16], start: usize, end: usize, captures: &mut Captures) -> Result<MatchOutcome, MatchError> {
        self.search_ex_with_observer(text, start, start, end, captures, &mut NullObserver)
    }

    /// Like [`search`](Self::search), with `\A`/`^`/lookbehind anchored to
    /// `data_origin` for every candidate starting position tried, rather
    /// than to each candidate itself.
    pub fn search_ex(
        &self,
        text: &[u16],
        data_origin: usize,
        text_start: usize,
        end: usize,
        captures: &mut Captures,
    ) -> Result<MatchOutcome, MatchError> {
        self.search_ex_with_observer(text, data_origin, text_start, end, captures, &mut NullObserver)
    }

    /// As [`search_ex`](Self::search_ex), notifying `observer` every time a
    /// capturing group closes.
    pub fn search_ex_with_observer(
        &self,
        text: &[u16],
        data_origin: usize,
        text_start: usize,
        end: usize,
        captures: &mut Captures,
        observer: &mut dyn BracketObserver,
    ) -> Result<MatchOutcome, MatchError> {
        self.check_capacity(captures)?;

        let tempend = match optimizer::trim_tail(&self.ops, self.has_lookahead, self.case_insensitive, text, data_origin, end) {
            Some(e) => e,
            None => return Ok(MatchOutcome::NoMatch),
        };
        if tempend < data_origin || (self.min_length > 0 && tempend.saturating_sub(data_origin) < self.min_length) {
            return Ok(MatchOutcome::NoMatch);
        }

        // Two fast paths mirroring the source engine: a pattern anchored at
        // the data origin can only ever match once, at `text_start`; a
        // pattern that is nothing but `\Z` needs no VM at all.
        if let Opcode::Open(root) = &self.ops[0] {
            if root.next_alt.is_none() {
                if matches!(self.ops.get(1), Some(Opcode::DataStart)) {
                    captures.clear();
                    return Ok(self.run_inner(text, data_origin, text_start, tempend, captures, observer));
                }
                if matches!(self.ops.get(1), Some(Opcode::DataEnd)) && matches!(self.ops.get(2), Some(Opcode::Close(_))) {
                    captures.clear();
                    captures.set_raw(0, (tempend as isize, tempend as isize));
                    return Ok(MatchOutcome::Matched);
                }
            }
        }

        let mut pos = text_start;
        loop {
            if let Some(first) = &self.first {
                while pos < tempend && !first.contains(text[pos]) {
                    pos += 1;
                }
            }
            captures.clear();
            match self.run_inner(text, data_origin, pos, tempend, captures, observer) {
                MatchOutcome::NoMatch => {}
                other => return Ok(other),
            }
            if pos >= tempend {
                return Ok(MatchOutcome::NoMatch);
            }
            pos += 1;
        }
    }

    fn run_inner(
        &self,
        text: &[u16],
        origin: usize,
        pos: usize,
        end_bound: usize,
        captures: &mut Captures,
        observer: &mut dyn BracketObserver,
    ) -> MatchOutcome {
        let mut vm = Vm::new(&self.ops, text, origin, end_bound, self.case_insensitive, captures, observer);
        match vm.run(0, pos) {
            Outcome::Matched { .. } => {
                captures.normalize_in_place();
                MatchOutcome::Matched
            }
            Outcome::NoMatch => MatchOutcome::NoMatch,
            Outcome::Canceled => MatchOutcome::Canceled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utf16(s: &str) -> Vec<u16> {
        s.encode_utf16().collect()
    }

    fn compile(pattern: &str) -> CompiledPattern {
        CompiledPattern::compile(pattern, CompileFlags::default()).unwrap()
    }

    #[test]
    fn literal_search_finds_substring() {
        let p = compile("world");
        let text = utf16("hello world");
        let mut caps = p.alloc_captures();
        let outcome = p.search(&text, 0, text.len(), &mut caps).unwrap();
        assert!(outcome.is_match());
        assert_eq!(caps.get(0), Some((6, 11)));
    }

    #[test]
    fn search_reports_no_match() {
        let p = compile("xyz");
        let text = utf16("hello world");
        let mut caps = p.alloc_captures();
        let outcome = p.search(&text, 0, text.len(), &mut caps).unwrap();
        assert!(!outcome.is_match());
    }

    #[test]
    fn capturing_groups_populate_in_order() {
        let p = compile(r"(\w+)@(\w+)");
        let text = utf16("user@host");
        let mut caps = p.alloc_captures();
        p.search(&text, 0, text.len(), &mut caps).unwrap();
        assert_eq!(caps.get(1), Some((0, 4)));
        assert_eq!(caps.get(2), Some((5, 9)));
    }

    #[test]
    fn named_group_readable_by_name() {
        let p = compile(r"(?{year}\d{4})-(?{month}\d{2})");
        let text = utf16("2026-07");
        let mut caps = p.alloc_captures();
        p.search(&text, 0, text.len(), &mut caps).unwrap();
        assert_eq!(p.named_capture(&caps, "year"), Some((0, 4)));
        assert_eq!(p.named_capture(&caps, "month"), Some((5, 7)));
    }

    #[test]
    fn data_start_anchor_only_tried_once() {
        let p = compile("^ab");
        let text = utf16("xxabab");
        let mut caps = p.alloc_captures();
        let outcome = p.search(&text, 0, text.len(), &mut caps).unwrap();
        assert!(!outcome.is_match());
    }

    #[test]
    fn match_at_requires_anchor_at_pos() {
        let p = compile("ab");
        let text = utf16("xxabab");
        let mut caps = p.alloc_captures();
        assert!(!p.match_at(&text, 0, text.len(), &mut caps).unwrap().is_match());
        assert!(p.match_at(&text, 2, text.len(), &mut caps).unwrap().is_match());
        assert_eq!(caps.get(0), Some((2, 4)));
    }

    #[test]
    fn match_ex_anchors_caret_to_data_origin_not_text_start() {
        let p = compile("^ab");
        let text = utf16("abab");
        let mut caps = p.alloc_captures();
        // `^` checks pos == data_origin, not pos == text_start.
        let outcome = p.match_ex(&text, 0, 2, text.len(), &mut caps).unwrap();
        assert!(!outcome.is_match());
        let outcome = p.match_ex(&text, 0, 0, text.len(), &mut caps).unwrap();
        assert!(outcome.is_match());
    }

    #[test]
    fn backreference_round_trips() {
        let p = compile(r"(\w+)-\1");
        let mut caps = p.alloc_captures();
        let text = utf16("echo-echo");
        assert!(p.search(&text, 0, text.len(), &mut caps).unwrap().is_match());
        let text_no = utf16("echo-other");
        let mut caps2 = p.alloc_captures();
        assert!(!p.search(&text_no, 0, text_no.len(), &mut caps2).unwrap().is_match());
    }

    #[test]
    fn lookbehind_gates_match_position() {
        let p = compile(r"(?<=\$)\d+");
        let text = utf16("price: $42 not 7");
        let mut caps = p.alloc_captures();
        assert!(p.search(&text, 0, text.len(), &mut caps).unwrap().is_match());
        assert_eq!(caps.get(0), Some((8, 10)));
    }

    #[test]
    fn not_enough_capture_slots_errors() {
        let p = compile(r"(a)(b)\2");
        let mut caps = Captures::new(1, 0);
        let text = utf16("ab");
        let err = p.search(&text, 0, text.len(), &mut caps).unwrap_err();
        assert!(matches!(err, MatchError::NotEnoughMatches { .. }));
    }

    #[test]
    fn case_insensitive_flag_folds_literals() {
        let p = CompiledPattern::compile("hello", CompileFlags { ignore_case: true, ..Default::default() }).unwrap();
        let text = utf16("HELLO");
        let mut caps = p.alloc_captures();
        assert!(p.search(&text, 0, text.len(), &mut caps).unwrap().is_match());
    }

    #[test]
    fn delimited_pattern_extracts_flags() {
        let p = CompiledPattern::compile_delimited("/hello/i", CompileFlags::default()).unwrap();
        let text = utf16("HELLO");
        let mut caps = p.alloc_captures();
        assert!(p.search(&text, 0, text.len(), &mut caps).unwrap().is_match());
    }

    #[test]
    fn nested_repetition_reenters_inner_group_with_a_clean_count() {
        // The inner `(?:a){0,2}` must not carry over the iteration count
        // left by the outer group's first pass when the outer group is
        // forced into its second repetition.
        let p = compile(r"(?:(?:a){0,2}b){2}");
        let text = utf16("aabaab");
        let mut caps = p.alloc_captures();
        let outcome = p.search(&text, 0, text.len(), &mut caps).unwrap();
        assert!(outcome.is_match());
        assert_eq!(caps.get(0), Some((0, 6)));
    }
}
