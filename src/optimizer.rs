// Copyright 2014-2015 The Rust Project Developers. See the COPYRIGHT
// file at the top-level directory of this distribution and at
// http://rust-lang.org/COPYRIGHT.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Three cheap passes over a compiled opcode vector, run once after compile:
//! a minimum-match-length lower bound, a first-character set, and a
//! tail-trim. None of these change match semantics; they only let `search`
//! and `match` reject hopeless inputs or positions without running the VM.

use crate::classify;
use crate::opcode::{OpIdx, Opcode, RangeTarget};
use crate::uniset::UniSet;

/// Bundled result of the three passes, stored on the compiled pattern.
pub struct OptimizeInfo {
    pub min_length: usize,
    /// `None` when the pattern could start with effectively any code unit,
    /// or when the leading structure was too ambiguous to pin down (mirrors
    /// the source engine giving up rather than building an imprecise set).
    pub first: Option<UniSet>,
}

pub fn analyze(ops: &[Opcode]) -> OptimizeInfo {
    OptimizeInfo { min_length: compute_min_length(ops), first: compute_first_set(ops) }
}

/// Lower bound on the number of code units any match can consume. Zero-width
/// opcodes, anchors, and back-references contribute nothing (a back-reference
/// may match the empty captured span), so this is a safe underestimate, not
/// an exact count.
pub fn compute_min_length(ops: &[Opcode]) -> usize {
    if ops.is_empty() {
        return 0;
    }
    min_width_concat(ops, 0, ops.len())
}

fn min_width_concat(ops: &[Opcode], start: usize, end: usize) -> usize {
    let mut width = 0usize;
    let mut i = start;
    while i < end {
        match &ops[i] {
            Opcode::LineStart
            | Opcode::LineEnd
            | Opcode::DataStart
            | Opcode::DataEnd
            | Opcode::WordBound
            | Opcode::NotWordBound
            | Opcode::NoReturn
            | Opcode::BackRef(_)
            | Opcode::NamedBackRef(_) => {
                i += 1;
            }
            op if op.is_unit_width() => {
                width += 1;
                i += 1;
            }
            Opcode::Range(r) => {
                width += r.quant.min as usize;
                i += 1;
            }
            Opcode::Open(o) => {
                let inner = min_width_body(ops, i + 1, o.mate);
                width += match o.quant {
                    Some(q) => inner * q.min as usize,
                    None => inner,
                };
                i = o.mate + 1;
            }
            Opcode::NamedOpen(o) => {
                let inner = min_width_body(ops, i + 1, o.mate);
                width += match o.quant {
                    Some(q) => inner * q.min as usize,
                    None => inner,
                };
                i = o.mate + 1;
            }
            Opcode::LookAhead(a) | Opcode::NotLookAhead(a) | Opcode::LookBehind(a) | Opcode::NotLookBehind(a) => {
                i = a.mate + 1;
            }
            Opcode::Close(_) | Opcode::NamedClose(_) | Opcode::CloseAssertion(_) | Opcode::RegexpEnd => {
                i += 1;
            }
            Opcode::Alternative(_) => unreachable!("caller splits on alternation boundaries"),
        }
    }
    width
}

/// Width of a body that may fork at top-level `|`: the true minimum is
/// whichever arm demands the least.
fn min_width_body(ops: &[Opcode], start: usize, end: usize) -> usize {
    let mut arm_start = start;
    let mut min_w: Option<usize> = None;
    let mut i = start;
    while i <= end {
        let at_boundary = i == end;
        let alt_here = !at_boundary && matches!(ops[i], Opcode::Alternative(_));
        if at_boundary || alt_here {
            let w = min_width_concat(ops, arm_start, i);
            min_w = Some(match min_w {
                None => w,
                Some(m) => m.min(w),
            });
            if at_boundary {
                break;
            }
            arm_start = i + 1;
            i += 1;
            continue;
        }
        i = skip_item(ops, i);
    }
    min_w.unwrap_or(0)
}

fn skip_item(ops: &[Opcode], i: usize) -> usize {
    match &ops[i] {
        Opcode::Open(o) => o.mate + 1,
        Opcode::NamedOpen(o) => o.mate + 1,
        Opcode::LookAhead(a) | Opcode::NotLookAhead(a) | Opcode::LookBehind(a) | Opcode::NotLookBehind(a) => a.mate + 1,
        _ => i + 1,
    }
}

/// Walks the single leftmost path through the pattern, following alternation
/// arms one at a time, collecting every code unit that could legally be the
/// very first one consumed. Gives up (`None`) on a complement opcode
/// (`not-symbol`, `any`, ...), an optional top-level item, or reaching the
/// end of the pattern without a mandatory consuming opcode — all cases where
/// a precise first set can't be pinned down cheaply.
pub fn compute_first_set(ops: &[Opcode]) -> Option<UniSet> {
    let mut jumps: Vec<OpIdx> = Vec::new();
    let mut set = UniSet::new();
    let mut i: OpIdx = 0;

    loop {
        if i >= ops.len() {
            return None;
        }
        match &ops[i] {
            Opcode::CharType(t) => add_type_members(&mut set, *t, false),
            Opcode::NotCharType(t) => add_type_members(&mut set, *t, true),
            Opcode::Symbol(s) => set.set(*s),
            Opcode::SymbolCi(s) => {
                set.set(*s);
                set.set(classify::to_upper(*s));
            }
            Opcode::Class(c) => merge_class(&mut set, c),

            Opcode::Open(o) => {
                if let Some(q) = o.quant {
                    if q.min == 0 {
                        return None;
                    }
                }
                if let Some(next) = o.next_alt {
                    jumps.push(next);
                }
                i += 1;
                continue;
            }
            Opcode::NamedOpen(o) => {
                if let Some(q) = o.quant {
                    if q.min == 0 {
                        return None;
                    }
                }
                if let Some(next) = o.next_alt {
                    jumps.push(next);
                }
                i += 1;
                continue;
            }
            Opcode::Close(_) | Opcode::NamedClose(_) => {
                i += 1;
                continue;
            }
            Opcode::Alternative(_) => return None,

            Opcode::Range(r) => {
                match &r.target {
                    RangeTarget::Symbol(s) => set.set(*s),
                    RangeTarget::SymbolCi(s) => {
                        set.set(*s);
                        set.set(classify::to_upper(*s));
                    }
                    RangeTarget::CharType(t) => add_type_members(&mut set, *t, false),
                    RangeTarget::NotCharType(t) => add_type_members(&mut set, *t, true),
                    RangeTarget::Class(c) => merge_class(&mut set, c),
                    RangeTarget::Any | RangeTarget::AnyAll | RangeTarget::NotSymbol(_) | RangeTarget::NotSymbolCi(_) => {
                        return None;
                    }
                }
                if r.quant.min == 0 {
                    i += 1;
                    continue;
                }
            }

            Opcode::NotSymbol(_)
            | Opcode::NotSymbolCi(_)
            | Opcode::Any
            | Opcode::AnyAll
            | Opcode::BackRef(_)
            | Opcode::NamedBackRef(_)
            | Opcode::LineStart
            | Opcode::LineEnd
            | Opcode::DataStart
            | Opcode::DataEnd
            | Opcode::WordBound
            | Opcode::NotWordBound
            | Opcode::NoReturn
            | Opcode::LookAhead(_)
            | Opcode::NotLookAhead(_)
            | Opcode::LookBehind(_)
            | Opcode::NotLookBehind(_)
            | Opcode::CloseAssertion(_)
            | Opcode::RegexpEnd => return None,
        }

        match jumps.pop() {
            Some(alt_idx) => {
                if let Opcode::Alternative(a) = &ops[alt_idx] {
                    if let Some(next) = a.next_alt {
                        jumps.push(next);
                    }
                }
                i = alt_idx + 1;
            }
            None => return Some(set),
        }
    }
}

fn add_type_members(set: &mut UniSet, type_bit: u8, negate: bool) {
    for cu in 0u32..=0xFFFF {
        let cu = cu as u16;
        if classify::check_type(type_bit, cu) != negate {
            set.set(cu);
        }
    }
}

fn merge_class(set: &mut UniSet, other: &UniSet) {
    for cu in 0u32..=0xFFFF {
        let cu = cu as u16;
        if other.contains(cu) {
            set.set(cu);
        }
    }
}

/// Shrinks `[start, end)` from the tail when the pattern has no lookahead,
/// no top-level alternation, and its last real opcode is a single-unit-width
/// test: scans backward from `end` for the last position that opcode could
/// match and reports one past it. Returns `None` when no such position
/// exists at all (the pattern cannot match anywhere in the window).
pub fn trim_tail(
    ops: &[Opcode],
    has_lookahead: bool,
    case_insensitive: bool,
    text: &[u16],
    start: usize,
    end: usize,
) -> Option<usize> {
    if has_lookahead || ops.is_empty() || end <= start {
        return Some(end);
    }
    let root = match &ops[0] {
        Opcode::Open(o) => o,
        _ => return Some(end),
    };
    if root.next_alt.is_some() || root.mate == 0 {
        return Some(end);
    }

    let mut idx = root.mate - 1;
    loop {
        match &ops[idx] {
            Opcode::Close(c) => {
                match &ops[c.mate] {
                    Opcode::Open(o) if o.next_alt.is_none() && o.quant.is_none() => {}
                    _ => return Some(end),
                }
                if idx == 0 {
                    return Some(end);
                }
                idx -= 1;
            }
            _ => break,
        }
    }

    let found = match &ops[idx] {
        Opcode::Symbol(s) => scan_back(text, start, end, |cu| cu == *s),
        Opcode::NotSymbol(s) => scan_back(text, start, end, |cu| cu != *s),
        Opcode::SymbolCi(s) => scan_back(text, start, end, |cu| classify::to_lower(cu) == *s),
        Opcode::NotSymbolCi(s) => scan_back(text, start, end, |cu| classify::to_lower(cu) != *s),
        Opcode::CharType(t) => scan_back(text, start, end, |cu| classify::check_type(*t, cu)),
        Opcode::NotCharType(t) => scan_back(text, start, end, |cu| !classify::check_type(*t, cu)),
        Opcode::Class(set) => scan_back(text, start, end, |cu| set.contains(cu)),
        Opcode::Range(r) if r.quant.min > 0 => match &r.target {
            RangeTarget::Symbol(s) => scan_back(text, start, end, |cu| {
                if case_insensitive { classify::to_lower(cu) == *s } else { cu == *s }
            }),
            RangeTarget::NotSymbol(s) => scan_back(text, start, end, |cu| {
                if case_insensitive { classify::to_lower(cu) != *s } else { cu != *s }
            }),
            RangeTarget::CharType(t) => scan_back(text, start, end, |cu| classify::check_type(*t, cu)),
            RangeTarget::NotCharType(t) => scan_back(text, start, end, |cu| !classify::check_type(*t, cu)),
            RangeTarget::Class(set) => scan_back(text, start, end, |cu| set.contains(cu)),
            _ => return Some(end),
        },
        _ => return Some(end),
    };
    found
}

fn scan_back(text: &[u16], start: usize, end: usize, pred: impl Fn(u16) -> bool) -> Option<usize> {
    let mut tail = end;
    while tail > start {
        if pred(text[tail - 1]) {
            return Some(tail);
        }
        tail -= 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{self, CompileFlags};

    fn utf16(s: &str) -> Vec<u16> {
        s.encode_utf16().collect()
    }

    fn compile(pattern: &str) -> Vec<Opcode> {
        compiler::compile(&utf16(pattern), CompileFlags::default()).unwrap().ops
    }

    #[test]
    fn min_length_literal() {
        assert_eq!(compute_min_length(&compile("abc")), 3);
    }

    #[test]
    fn min_length_quantifiers() {
        assert_eq!(compute_min_length(&compile("a+")), 1);
        assert_eq!(compute_min_length(&compile("a*")), 0);
        assert_eq!(compute_min_length(&compile("a{2,5}")), 2);
    }

    #[test]
    fn min_length_alternation_takes_shortest_arm() {
        assert_eq!(compute_min_length(&compile("a|bc")), 1);
    }

    #[test]
    fn first_set_literal() {
        let set = compute_first_set(&compile("abc")).unwrap();
        assert!(set.contains(b'a' as u16));
        assert!(!set.contains(b'b' as u16));
    }

    #[test]
    fn first_set_alternation_unions_arms() {
        let set = compute_first_set(&compile("a|b")).unwrap();
        assert!(set.contains(b'a' as u16));
        assert!(set.contains(b'b' as u16));
    }

    #[test]
    fn first_set_gives_up_on_leading_dot() {
        assert!(compute_first_set(&compile(".abc")).is_none());
    }

    #[test]
    fn first_set_gives_up_on_optional_leading_group() {
        assert!(compute_first_set(&compile("a?bc")).is_none());
    }

    #[test]
    fn tail_trim_finds_last_literal_occurrence() {
        let ops = compile("c");
        let text = utf16("xabcxxx");
        let trimmed = trim_tail(&ops, false, false, &text, 0, text.len()).unwrap();
        assert_eq!(trimmed, 4);
    }

    #[test]
    fn tail_trim_reports_no_match_when_absent() {
        let ops = compile("z");
        let text = utf16("xabcxxx");
        assert!(trim_tail(&ops, false, false, &text, 0, text.len()).is_none());
    }

    #[test]
    fn tail_trim_skipped_for_lookahead() {
        let ops = compile("a(?=b)");
        let text = utf16("xaybz");
        let trimmed = trim_tail(&ops, true, false, &text, 0, text.len()).unwrap();
        assert_eq!(trimmed, text.len());
    }
}
