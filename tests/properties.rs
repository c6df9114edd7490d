// Copyright 2014-2015 The Rust Project Developers. See the COPYRIGHT
// file at the top-level directory of this distribution and at
// http://rust-lang.org/COPYRIGHT.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Property-based fuzzing of SPEC_FULL.md §8's testable invariants:
//! capture well-formedness, search monotonicity, back-reference round
//! trip, case folding, the minimum-length lower bound, idempotence and
//! quantifier bounds.

use quickcheck::{quickcheck, Arbitrary, Gen};
use uniregex::{CompileFlags, CompiledPattern};

/// A short run of lowercase ASCII letters, used as the alphabet for
/// generated text and patterns so we never hand the compiler invalid
/// regex syntax.
#[derive(Clone, Debug)]
struct Letters(String);

impl Arbitrary for Letters {
    fn arbitrary(g: &mut Gen) -> Letters {
        let len = u8::arbitrary(g) % 8;
        let s: String = (0..len)
            .map(|_| {
                let c = u8::arbitrary(g) % 26;
                (b'a' + c) as char
            })
            .collect();
        Letters(s)
    }
}

fn utf16(s: &str) -> Vec<u16> {
    s.encode_utf16().collect()
}

quickcheck! {
    fn capture_well_formedness(word: Letters, noise: Letters) -> bool {
        if word.0.is_empty() {
            return true;
        }
        let p = CompiledPattern::compile(&format!("({})+", word.0), CompileFlags::default()).unwrap();
        let text = utf16(&format!("{}{}", noise.0, word.0.repeat(2)));
        let mut caps = p.alloc_captures();
        if !p.search(&text, 0, text.len(), &mut caps).unwrap().is_match() {
            return true;
        }
        (0..=p.capture_count() as usize).all(|i| match caps.get(i) {
            None => true,
            Some((s, e)) => s <= e && e <= text.len(),
        })
    }

    fn search_monotonicity(word: Letters, gap: Letters) -> bool {
        if word.0.is_empty() {
            return true;
        }
        let p = CompiledPattern::compile(&word.0, CompileFlags::default()).unwrap();
        let text = utf16(&format!("{}{}{}", word.0, gap.0, word.0));
        let mut first_caps = p.alloc_captures();
        let found_first = p.search(&text, 0, text.len(), &mut first_caps).unwrap().is_match();
        if !found_first {
            return true;
        }
        let (s, _e) = first_caps.get(0).unwrap();
        let mut second_caps = p.alloc_captures();
        let found_second = p.search(&text, s + 1, text.len(), &mut second_caps).unwrap().is_match();
        if !found_second {
            return true;
        }
        let (s2, _) = second_caps.get(0).unwrap();
        s2 >= s + 1
    }

    fn backreference_round_trip(word: Letters) -> bool {
        if word.0.is_empty() {
            return true;
        }
        let p = CompiledPattern::compile(r"(\w+)-\1", CompileFlags::default()).unwrap();
        let text = utf16(&format!("{}-{}", word.0, word.0));
        let mut caps = p.alloc_captures();
        let matched = p.search(&text, 0, text.len(), &mut caps).unwrap().is_match();
        matched && caps.get(1) == Some((0, word.0.len()))
    }

    fn case_folding_matches_lowercased_pair(word: Letters, text: Letters) -> bool {
        if word.0.is_empty() {
            return true;
        }
        let ci = CompiledPattern::compile(&word.0, CompileFlags { ignore_case: true, ..Default::default() }).unwrap();
        let plain = CompiledPattern::compile(&word.0.to_lowercase(), CompileFlags::default()).unwrap();
        let upper_text = utf16(&format!("{}{}", text.0, word.0.to_uppercase()));
        let lower_text = utf16(&format!("{}{}", text.0, word.0.to_lowercase()));
        let mut a = ci.alloc_captures();
        let mut b = plain.alloc_captures();
        let left = ci.search(&upper_text, 0, upper_text.len(), &mut a).unwrap().is_match();
        let right = plain.search(&lower_text, 0, lower_text.len(), &mut b).unwrap().is_match();
        left == right
    }

    fn min_length_rejects_short_input(word: Letters) -> bool {
        if word.0.len() < 2 {
            return true;
        }
        let p = CompiledPattern::compile(&word.0, CompileFlags::default()).unwrap();
        let short = utf16(&word.0[..word.0.len() - 1]);
        let mut caps = p.alloc_captures();
        !p.search(&short, 0, short.len(), &mut caps).unwrap().is_match()
    }

    fn compiling_twice_is_idempotent(word: Letters, text: Letters) -> bool {
        if word.0.is_empty() {
            return true;
        }
        let a = CompiledPattern::compile(&word.0, CompileFlags::default()).unwrap();
        let b = CompiledPattern::compile(&word.0, CompileFlags::default()).unwrap();
        let t = utf16(&text.0);
        let mut caps_a = a.alloc_captures();
        let mut caps_b = b.alloc_captures();
        let ra = a.search(&t, 0, t.len(), &mut caps_a).unwrap();
        let rb = b.search(&t, 0, t.len(), &mut caps_b).unwrap();
        ra == rb && caps_a.get(0) == caps_b.get(0)
    }

    fn quantifier_bounds_are_respected(count: u8) -> bool {
        let k = (count % 6) as usize;
        let p = CompiledPattern::compile("a{2,4}", CompileFlags::default()).unwrap();
        let text = utf16(&"a".repeat(k));
        let mut caps = p.alloc_captures();
        let matched = p.match_at(&text, 0, text.len(), &mut caps).unwrap().is_match();
        if k < 2 {
            !matched
        } else {
            matched && caps.get(0).map_or(false, |(s, e)| {
                let len = e - s;
                (2..=4).contains(&len)
            })
        }
    }
}
