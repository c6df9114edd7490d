// Copyright 2014-2015 The Rust Project Developers. See the COPYRIGHT
// file at the top-level directory of this distribution and at
// http://rust-lang.org/COPYRIGHT.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The six concrete scenarios from SPEC_FULL.md's testable-properties
//! section, plus a handful of direct siblings (the negative case each
//! scenario implies).

use uniregex::{CompileFlags, CompiledPattern};

fn utf16(s: &str) -> Vec<u16> {
    s.encode_utf16().collect()
}

fn search(pattern: &str, text: &str) -> (CompiledPattern, bool, Option<(usize, usize)>) {
    let p = CompiledPattern::compile(pattern, CompileFlags::default()).unwrap();
    let t = utf16(text);
    let mut caps = p.alloc_captures();
    let matched = p.search(&t, 0, t.len(), &mut caps).unwrap().is_match();
    let g0 = caps.get(0);
    (p, matched, g0)
}

#[test]
fn scenario_1_lazy_star_then_literal() {
    let (_, matched, g0) = search("a*?ca", "abca");
    assert!(matched);
    assert_eq!(g0, Some((2, 4)));
}

#[test]
fn scenario_2_class_run_then_digits() {
    let p = CompiledPattern::compile(r"([A-Z]+)[- ]?(\d+)", CompileFlags::default()).unwrap();
    let text = utf16("order AB-42!");
    let mut caps = p.alloc_captures();
    assert!(p.search(&text, 0, text.len(), &mut caps).unwrap().is_match());
    assert_eq!(caps.get(0), Some((6, 11)));
    assert_eq!(caps.get(1), Some((6, 8)));
    assert_eq!(caps.get(2), Some((9, 11)));
}

#[test]
fn scenario_3_named_group_and_named_backref() {
    let p = CompiledPattern::compile(r"(?{tag}[a-z]+)=\p{tag}", CompileFlags::default()).unwrap();
    let text = utf16("k=k, x=y");
    let mut caps = p.alloc_captures();
    assert!(p.search(&text, 0, text.len(), &mut caps).unwrap().is_match());
    assert_eq!(caps.get(0), Some((0, 3)));
    assert_eq!(p.named_capture(&caps, "tag"), Some((0, 1)));

    let no_text = utf16("x=y");
    let mut caps2 = p.alloc_captures();
    assert!(!p.search(&no_text, 0, no_text.len(), &mut caps2).unwrap().is_match());
}

#[test]
fn scenario_4_lookbehind_gates_match() {
    let (p, matched, g0) = search(r"(?<=foo)bar", "xfoobar");
    assert!(matched);
    assert_eq!(g0, Some((4, 7)));

    let text = utf16("xfobar");
    let mut caps = p.alloc_captures();
    assert!(!p.search(&text, 0, text.len(), &mut caps).unwrap().is_match());
}

#[test]
fn scenario_5_greedy_vs_lazy_bounded_quantifier() {
    let greedy = CompiledPattern::compile(r"\d{2,4}", CompileFlags::default()).unwrap();
    let text = utf16("12345");
    let mut caps = greedy.alloc_captures();
    assert!(greedy.match_at(&text, 0, text.len(), &mut caps).unwrap().is_match());
    assert_eq!(caps.get(0), Some((0, 4)));

    let lazy = CompiledPattern::compile(r"\d{2,4}?", CompileFlags::default()).unwrap();
    let mut caps2 = lazy.alloc_captures();
    assert!(lazy.match_at(&text, 0, text.len(), &mut caps2).unwrap().is_match());
    assert_eq!(caps2.get(0), Some((0, 2)));
}

#[test]
fn scenario_6_alternation_backtracks_into_second_arm() {
    let (_, matched, g0) = search("a(b|bc)c", "abcc");
    assert!(matched);
    assert_eq!(g0, Some((0, 4)));
}

#[test]
fn scenario_6_capture_reflects_backtracked_arm() {
    let p = CompiledPattern::compile("a(b|bc)c", CompileFlags::default()).unwrap();
    let text = utf16("abcc");
    let mut caps = p.alloc_captures();
    assert!(p.search(&text, 0, text.len(), &mut caps).unwrap().is_match());
    assert_eq!(caps.get(1), Some((1, 3)));
}
