// Copyright 2014-2015 The Rust Project Developers. See the COPYRIGHT
// file at the top-level directory of this distribution and at
// http://rust-lang.org/COPYRIGHT.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The compiler: a single linear pass turning validated pattern text into a
//! flat `Vec<Opcode>`. Cross-references (bracket mates, alternation chains)
//! are resolved as they're discovered, the way the source engine resolves
//! pointers in place rather than in a later fix-up pass.

use std::collections::HashMap;

use crate::classify::{self, char_type};
use crate::error::{CompileError, ErrorKind};
use crate::opcode::{
    Alternative, Assertion, AssertionClose, BackRefOp, Bound, BracketClose, BracketOpen, NameId,
    NamedBackRefOp, NamedBracketClose, NamedBracketOpen, OpIdx, Opcode, Quantifier, RangeOp,
    RangeTarget,
};
use crate::sizer::{self, MAX_DEPTH};
use crate::uniset::UniSet;

/// Compile-time options, one bit per Perl-style flag letter.
#[derive(Clone, Copy, Debug, Default)]
pub struct CompileFlags {
    pub ignore_case: bool,
    pub multiline: bool,
    pub dot_all: bool,
    pub extended: bool,
    pub strict: bool,
    /// Swap the delimiter and escape characters, the way `OP_CPPMODE`
    /// lets a pattern use `\` as its delimiter and `/` as its escape.
    pub cpp_mode: bool,
}

impl CompileFlags {
    fn delimiter_chars(self) -> (u16, u16) {
        if self.cpp_mode {
            (b'\\' as u16, b'/' as u16)
        } else {
            (b'/' as u16, b'\\' as u16)
        }
    }
}

/// Parses `pattern`, possibly extracting a leading/trailing Perl-style
/// `/body/flags` wrapper, and returns the flags merged with any caller-
/// supplied defaults plus the body as owned UTF-16.
///
/// A pattern with no leading delimiter is taken as a bare body with the
/// caller's flags used unchanged.
pub fn split_delimited(pattern: &str, base: CompileFlags) -> Result<(Vec<u16>, CompileFlags), CompileError> {
    let units: Vec<u16> = pattern.encode_utf16().collect();
    let (delim, _escape) = base.delimiter_chars();
    if units.first().copied() != Some(delim) {
        return Ok((units, base));
    }
    let mut end = None;
    let mut i = 1;
    while i < units.len() {
        if units[i] == delim {
            end = Some(i);
            break;
        }
        if units[i] == base.delimiter_chars().1 && i + 1 < units.len() {
            i += 2;
            continue;
        }
        i += 1;
    }
    let end = end.ok_or_else(|| CompileError::new(ErrorKind::Syntax, units.len()))?;
    let body = units[1..end].to_vec();
    let mut flags = base;
    for &f in &units[end + 1..] {
        match f as u8 as char {
            'i' => flags.ignore_case = true,
            'm' => flags.multiline = true,
            's' => flags.dot_all = true,
            'x' => flags.extended = true,
            'o' => flags.cpp_mode = true,
            _ => return Err(CompileError::new(ErrorKind::Options, units.len())),
        }
    }
    Ok((body, flags))
}

/// One emitted opcode plus bookkeeping produced by a successful compile.
pub struct CompiledProgram {
    pub ops: Vec<Opcode>,
    pub capture_count: u32,
    pub max_backref: u32,
    pub names: Vec<String>,
    pub name_to_id: HashMap<String, NameId>,
    pub has_named_brackets: bool,
    pub has_lookahead: bool,
}

struct Compiler<'a> {
    src: &'a [u16],
    flags: CompileFlags,
    ops: Vec<Opcode>,
    stack: Vec<OpIdx>,
    closed: Vec<bool>,
    brcount: u32,
    max_backref: u32,
    names: Vec<String>,
    name_to_id: HashMap<String, NameId>,
    closed_names: std::collections::HashSet<NameId>,
    has_named_brackets: bool,
    has_lookahead: bool,
}

fn is_hex_digit(cu: u16) -> bool {
    matches!(cu as u8 as char, '0'..='9' | 'a'..='f' | 'A'..='F') && cu <= 0x7f
}

fn hex_value(cu: u16) -> u32 {
    let c = cu as u8 as char;
    c.to_digit(16).unwrap()
}

pub fn compile(pattern: &[u16], flags: CompileFlags) -> Result<CompiledProgram, CompileError> {
    let sized = sizer::size_pattern(pattern)?;
    let mut c = Compiler {
        src: pattern,
        flags,
        ops: Vec::with_capacity(sized.slots),
        stack: vec![0],
        closed: vec![false; sized.capture_count as usize + 1],
        brcount: 0,
        max_backref: 0,
        names: Vec::new(),
        name_to_id: HashMap::new(),
        closed_names: std::collections::HashSet::new(),
        has_named_brackets: false,
        has_lookahead: false,
    };
    c.run()?;
    Ok(CompiledProgram {
        ops: c.ops,
        capture_count: c.brcount,
        max_backref: c.max_backref,
        names: c.names,
        name_to_id: c.name_to_id,
        has_named_brackets: c.has_named_brackets,
        has_lookahead: c.has_lookahead,
    })
}

impl<'a> Compiler<'a> {
    fn err(&self, kind: ErrorKind, pos: usize) -> CompileError {
        CompileError::new(kind, pos)
    }

    fn push(&mut self, op: Opcode) -> OpIdx {
        let idx = self.ops.len();
        self.ops.push(op);
        idx
    }

    fn run(&mut self) -> Result<(), CompileError> {
        // Slot 0: the implicit whole-match group.
        self.push(Opcode::Open(BracketOpen {
            index: Some(0),
            mate: 0,
            next_alt: None,
            quant: None,
        }));

        let n = self.src.len();
        let mut i = 0;
        let mut in_quote = false;

        while i < n {
            let c = self.src[i];

            if in_quote && c != b'\\' as u16 {
                self.emit_literal(c);
                i += 1;
                continue;
            }

            if c == b'\\' as u16 {
                i += 1;
                if i >= n {
                    return Err(self.err(ErrorKind::Syntax, i));
                }
                if in_quote && self.src[i] != b'E' as u16 {
                    self.emit_literal(b'\\' as u16);
                    self.emit_literal(self.src[i]);
                    i += 1;
                    continue;
                }
                i = self.compile_escape(i, &mut in_quote)?;
                continue;
            }

            i = self.compile_char(i)?;
        }

        // Close the implicit group, linking any trailing alternation chain.
        while self.stack.len() > 1 {
            let top = *self.stack.last().unwrap();
            if let Opcode::Alternative(_) = &self.ops[top] {
                let close_idx = self.ops.len();
                if let Opcode::Alternative(a) = &mut self.ops[top] {
                    a.end_index = close_idx;
                }
                self.stack.pop();
            } else {
                break;
            }
        }
        let close_idx = self.push(Opcode::Close(BracketClose { mate: 0 }));
        if let Opcode::Open(o) = &mut self.ops[0] {
            o.mate = close_idx;
        }
        if let Opcode::Close(cl) = &mut self.ops[close_idx] {
            cl.mate = 0;
        }
        self.push(Opcode::RegexpEnd);
        Ok(())
    }

    fn emit_literal(&mut self, cu: u16) {
        if self.flags.ignore_case {
            let lower = classify::to_lower(cu);
            if classify::to_upper(lower) == lower {
                self.push(Opcode::Symbol(lower));
            } else {
                self.push(Opcode::SymbolCi(lower));
            }
        } else {
            self.push(Opcode::Symbol(cu));
        }
    }

    /// Handles the character after a recognized `\`. Returns the index of
    /// the next unconsumed character.
    fn compile_escape(&mut self, mut i: usize, in_quote: &mut bool) -> Result<usize, CompileError> {
        let n = self.src.len();
        let e = self.src[i];
        match e as u8 as char {
            'Q' => {
                *in_quote = true;
                return Ok(i + 1);
            }
            'E' => {
                *in_quote = false;
                return Ok(i + 1);
            }
            'b' => {
                self.push(Opcode::WordBound);
            }
            'B' => {
                self.push(Opcode::NotWordBound);
            }
            'd' => {
                self.push(Opcode::CharType(char_type::DIGIT));
            }
            'D' => {
                self.push(Opcode::NotCharType(char_type::DIGIT));
            }
            's' => {
                self.push(Opcode::CharType(char_type::SPACE));
            }
            'S' => {
                self.push(Opcode::NotCharType(char_type::SPACE));
            }
            'w' => {
                self.push(Opcode::CharType(char_type::WORD));
            }
            'W' => {
                self.push(Opcode::NotCharType(char_type::WORD));
            }
            'u' => {
                self.push(Opcode::CharType(char_type::UPPER));
            }
            'U' => {
                self.push(Opcode::NotCharType(char_type::UPPER));
            }
            'l' => {
                self.push(Opcode::CharType(char_type::LOWER));
            }
            'L' => {
                self.push(Opcode::NotCharType(char_type::LOWER));
            }
            'i' => {
                self.push(Opcode::CharType(char_type::ALPHA));
            }
            'I' => {
                self.push(Opcode::NotCharType(char_type::ALPHA));
            }
            'A' => {
                self.push(Opcode::DataStart);
            }
            'Z' => {
                self.push(Opcode::DataEnd);
            }
            'n' => self.emit_literal(b'\n' as u16),
            'r' => self.emit_literal(b'\r' as u16),
            't' => self.emit_literal(b'\t' as u16),
            'f' => self.emit_literal(0x0c),
            'e' => self.emit_literal(0x1b),
            'O' => {
                self.push(Opcode::NoReturn);
            }
            'p' => {
                i += 1;
                if i >= n || self.src[i] != b'{' as u16 {
                    return Err(self.err(ErrorKind::Syntax, i));
                }
                i += 1;
                let start = i;
                while i < n && self.src[i] != b'}' as u16 {
                    i += 1;
                }
                if i >= n || i == start {
                    return Err(self.err(ErrorKind::Syntax, i));
                }
                let name = decode_utf16_lossy(&self.src[start..i]);
                let id = *self
                    .name_to_id
                    .get(&name)
                    .ok_or_else(|| self.err(ErrorKind::ReferenceToUndefinedNamedBracket, start))?;
                if !self.closed_names.contains(&id) {
                    return Err(self.err(ErrorKind::ReferenceToUndefinedNamedBracket, start));
                }
                self.push(Opcode::NamedBackRef(NamedBackRefOp { name: id, quant: None }));
                return Ok(i + 1);
            }
            'x' => {
                i += 1;
                if i >= n || !is_hex_digit(self.src[i]) {
                    return Err(self.err(ErrorKind::Syntax, i));
                }
                let mut value = hex_value(self.src[i]);
                let mut digits = 1;
                while digits < 4 && i + 1 < n && is_hex_digit(self.src[i + 1]) {
                    i += 1;
                    digits += 1;
                    value = (value << 4) | hex_value(self.src[i]);
                }
                self.emit_literal(value as u16);
                return Ok(i + 1);
            }
            c if c.is_ascii_digit() && c != '0' => {
                let start = i;
                let mut value: u32 = 0;
                while i < n && (self.src[i] as u8 as char).is_ascii_digit() {
                    value = value * 10 + (self.src[i] - b'0' as u16) as u32;
                    i += 1;
                }
                let index = value;
                if index == 0
                    || index > self.brcount
                    || !self.closed.get(index as usize).copied().unwrap_or(false)
                {
                    return Err(self.err(ErrorKind::InvalidBackRef, start));
                }
                if index > self.max_backref {
                    self.max_backref = index;
                }
                self.push(Opcode::BackRef(BackRefOp { index, quant: None }));
                return Ok(i);
            }
            c => {
                if self.flags.strict && c.is_ascii_alphabetic() {
                    return Err(self.err(ErrorKind::InvalidEscape, i));
                }
                self.emit_literal(e);
            }
        }
        Ok(i + 1)
    }

    fn compile_char(&mut self, i: usize) -> Result<usize, CompileError> {
        let c = self.src[i];
        match c as u8 as char {
            '.' => {
                if self.flags.dot_all {
                    self.push(Opcode::AnyAll);
                } else {
                    self.push(Opcode::Any);
                }
                Ok(i + 1)
            }
            '^' => {
                if self.flags.multiline {
                    self.push(Opcode::LineStart);
                } else {
                    self.push(Opcode::DataStart);
                }
                Ok(i + 1)
            }
            '$' => {
                if self.flags.multiline {
                    self.push(Opcode::LineEnd);
                } else {
                    self.push(Opcode::DataEnd);
                }
                Ok(i + 1)
            }
            '|' => {
                let top = *self.stack.last().unwrap();
                let new_idx = self.ops.len();
                match &mut self.ops[top] {
                    Opcode::Alternative(a) => a.next_alt = Some(new_idx),
                    Opcode::Open(o) => o.next_alt = Some(new_idx),
                    Opcode::NamedOpen(o) => o.next_alt = Some(new_idx),
                    Opcode::LookAhead(a) | Opcode::NotLookAhead(a) | Opcode::LookBehind(a) | Opcode::NotLookBehind(a) => {
                        a.next_alt = Some(new_idx)
                    }
                    _ => unreachable!("stack frame is always a group or assertion opener"),
                }
                if self.stack.len() >= MAX_DEPTH {
                    return Err(self.err(ErrorKind::MaxDepth, i));
                }
                self.push(Opcode::Alternative(Alternative { next_alt: None, end_index: 0 }));
                self.stack.push(new_idx);
                Ok(i + 1)
            }
            '(' => self.compile_group_open(i),
            ')' => self.compile_group_close(i),
            '[' => self.compile_class(i),
            '+' | '*' | '?' | '{' => self.compile_quantifier(i),
            ' ' | '\t' | '\n' | '\r' if self.flags.extended => Ok(i + 1),
            _ => {
                self.emit_literal(c);
                Ok(i + 1)
            }
        }
    }

    fn compile_group_open(&mut self, mut i: usize) -> Result<usize, CompileError> {
        let n = self.src.len();
        if self.stack.len() >= MAX_DEPTH {
            return Err(self.err(ErrorKind::MaxDepth, i));
        }
        if i + 1 < n && self.src[i + 1] == b'?' as u16 {
            i += 2;
            if i >= n {
                return Err(self.err(ErrorKind::Syntax, i));
            }
            match self.src[i] as u8 as char {
                ':' => {
                    let idx = self.push(Opcode::Open(BracketOpen {
                        index: None,
                        mate: 0,
                        next_alt: None,
                        quant: None,
                    }));
                    self.stack.push(idx);
                    Ok(i + 1)
                }
                '=' | '!' => {
                    self.has_lookahead = true;
                    let negative = self.src[i] == b'!' as u16;
                    let idx = self.push(assertion_open(negative, false));
                    self.stack.push(idx);
                    Ok(i + 1)
                }
                '<' => {
                    i += 1;
                    if i >= n {
                        return Err(self.err(ErrorKind::Syntax, i));
                    }
                    let negative = match self.src[i] as u8 as char {
                        '=' => false,
                        '!' => true,
                        _ => return Err(self.err(ErrorKind::Syntax, i)),
                    };
                    let idx = self.push(assertion_open(negative, true));
                    self.stack.push(idx);
                    Ok(i + 1)
                }
                '{' => {
                    self.has_named_brackets = true;
                    i += 1;
                    let start = i;
                    while i < n && self.src[i] != b'}' as u16 {
                        i += 1;
                    }
                    if i >= n || i == start {
                        return Err(self.err(ErrorKind::Brackets, start));
                    }
                    let name = decode_utf16_lossy(&self.src[start..i]);
                    let id = *self
                        .name_to_id
                        .entry(name.clone())
                        .or_insert_with(|| {
                            self.names.push(name);
                            (self.names.len() - 1) as NameId
                        });
                    let idx = self.push(Opcode::NamedOpen(NamedBracketOpen {
                        name: id,
                        mate: 0,
                        next_alt: None,
                        quant: None,
                    }));
                    self.stack.push(idx);
                    Ok(i + 1)
                }
                _ => Err(self.err(ErrorKind::Syntax, i)),
            }
        } else {
            self.brcount += 1;
            if self.brcount as usize >= self.closed.len() {
                self.closed.push(false);
            }
            let idx = self.push(Opcode::Open(BracketOpen {
                index: Some(self.brcount),
                mate: 0,
                next_alt: None,
                quant: None,
            }));
            self.stack.push(idx);
            Ok(i + 1)
        }
    }

    fn compile_group_close(&mut self, i: usize) -> Result<usize, CompileError> {
        if self.stack.len() <= 1 {
            return Err(self.err(ErrorKind::Brackets, i));
        }
        let close_idx = self.ops.len();
        while let Opcode::Alternative(_) = &self.ops[*self.stack.last().unwrap()] {
            let top = self.stack.pop().unwrap();
            if let Opcode::Alternative(a) = &mut self.ops[top] {
                a.end_index = close_idx;
            }
        }
        let open_idx = self.stack.pop().unwrap();
        match &self.ops[open_idx] {
            Opcode::Open(o) => {
                let index = o.index;
                self.ops.push(Opcode::Close(BracketClose { mate: open_idx }));
                if let Opcode::Open(o) = &mut self.ops[open_idx] {
                    o.mate = close_idx;
                }
                if let Some(n) = index {
                    if n > 0 {
                        self.closed[n as usize] = true;
                    }
                }
            }
            Opcode::NamedOpen(o) => {
                let name = o.name;
                self.ops.push(Opcode::NamedClose(NamedBracketClose { mate: open_idx }));
                if let Opcode::NamedOpen(o) = &mut self.ops[open_idx] {
                    o.mate = close_idx;
                }
                self.closed_names.insert(name);
            }
            Opcode::LookBehind(_) | Opcode::NotLookBehind(_) => {
                let body_len = calc_body_width(&self.ops, open_idx + 1, close_idx);
                let body_len = body_len.ok_or_else(|| self.err(ErrorKind::VariableLengthLookBehind, i))?;
                self.ops.push(Opcode::CloseAssertion(AssertionClose { mate: open_idx }));
                if let Opcode::LookBehind(a) | Opcode::NotLookBehind(a) = &mut self.ops[open_idx] {
                    a.mate = close_idx;
                    a.fixed_width = Some(body_len);
                }
            }
            Opcode::LookAhead(_) | Opcode::NotLookAhead(_) => {
                self.ops.push(Opcode::CloseAssertion(AssertionClose { mate: open_idx }));
                if let Opcode::LookAhead(a) | Opcode::NotLookAhead(a) = &mut self.ops[open_idx] {
                    a.mate = close_idx;
                }
            }
            _ => unreachable!("stack frame below an alternation chain is always an opener"),
        }
        Ok(i + 1)
    }

    fn compile_class(&mut self, mut i: usize) -> Result<usize, CompileError> {
        let n = self.src.len();
        i += 1;
        let mut negative = false;
        if i < n && self.src[i] == b'^' as u16 {
            negative = true;
            i += 1;
        }
        let mut set = UniSet::new();
        let mut last_char: Option<u16> = None;
        let mut class_size: u32 = 0;

        while i < n && self.src[i] != b']' as u16 {
            if self.src[i] == b'\\' as u16 {
                i += 1;
                if i >= n {
                    return Err(self.err(ErrorKind::Syntax, i));
                }
                last_char = None;
                let mut type_bit = 0u8;
                let mut not_type = false;
                match self.src[i] as u8 as char {
                    'd' => type_bit = char_type::DIGIT,
                    'D' => {
                        type_bit = char_type::DIGIT;
                        not_type = true;
                    }
                    'w' => type_bit = char_type::WORD,
                    'W' => {
                        type_bit = char_type::WORD;
                        not_type = true;
                    }
                    's' => type_bit = char_type::SPACE,
                    'S' => {
                        type_bit = char_type::SPACE;
                        not_type = true;
                    }
                    'l' => type_bit = char_type::LOWER,
                    'L' => {
                        type_bit = char_type::LOWER;
                        not_type = true;
                    }
                    'u' => type_bit = char_type::UPPER,
                    'U' => {
                        type_bit = char_type::UPPER;
                        not_type = true;
                    }
                    'i' => type_bit = char_type::ALPHA,
                    'I' => {
                        type_bit = char_type::ALPHA;
                        not_type = true;
                    }
                    'n' => last_char = Some(b'\n' as u16),
                    'r' => last_char = Some(b'\r' as u16),
                    't' => last_char = Some(b'\t' as u16),
                    'f' => last_char = Some(0x0c),
                    'e' => last_char = Some(0x1b),
                    'x' => {
                        i += 1;
                        if i >= n || !is_hex_digit(self.src[i]) {
                            return Err(self.err(ErrorKind::Syntax, i));
                        }
                        let mut value = hex_value(self.src[i]);
                        let mut digits = 1;
                        while digits < 4 && i + 1 < n && is_hex_digit(self.src[i + 1]) {
                            i += 1;
                            digits += 1;
                            value = (value << 4) | hex_value(self.src[i]);
                        }
                        last_char = Some(value as u16);
                    }
                    c => {
                        if self.flags.strict && c.is_ascii_alphabetic() {
                            return Err(self.err(ErrorKind::InvalidEscape, i));
                        }
                        last_char = Some(self.src[i]);
                    }
                }
                if type_bit != 0 {
                    if not_type {
                        set.add_not_type(type_bit);
                    } else {
                        set.add_type(type_bit);
                    }
                    class_size = 257;
                } else if let Some(lc) = last_char {
                    set_class_char(&mut set, lc, self.flags.ignore_case);
                    class_size += 1;
                }
                i += 1;
                continue;
            }

            if self.src[i] == b'-' as u16 && last_char.is_some() && i + 1 < n && self.src[i + 1] != b']' as u16 {
                let mut to = self.src[i + 1];
                let mut step = 2;
                if to == b'\\' as u16 && i + 2 < n && self.src[i + 2] as u8 as char == 'x' {
                    let mut j = i + 3;
                    if j >= n || !is_hex_digit(self.src[j]) {
                        return Err(self.err(ErrorKind::Syntax, j));
                    }
                    let mut value = hex_value(self.src[j]);
                    let mut digits = 1;
                    while digits < 4 && j + 1 < n && is_hex_digit(self.src[j + 1]) {
                        j += 1;
                        digits += 1;
                        value = (value << 4) | hex_value(self.src[j]);
                    }
                    to = value as u16;
                    step = j - i + 1;
                }
                let from = last_char.unwrap();
                if to < from {
                    return Err(self.err(ErrorKind::InvalidRange, i));
                }
                for cu in from..=to {
                    set_class_char(&mut set, cu, self.flags.ignore_case);
                    class_size += 1;
                    if cu == u16::MAX {
                        break;
                    }
                }
                i += step;
                last_char = None;
                continue;
            }

            last_char = Some(self.src[i]);
            set_class_char(&mut set, self.src[i], self.flags.ignore_case);
            class_size += 1;
            i += 1;
        }
        if i >= n {
            return Err(self.err(ErrorKind::Brackets, i));
        }

        if negative && class_size > 1 {
            set.set_negative(true);
        }

        if class_size == 1 {
            let lc = last_char.unwrap();
            if self.flags.ignore_case {
                let folded = classify::to_lower(lc);
                if negative {
                    self.push(Opcode::NotSymbolCi(folded));
                } else {
                    self.push(Opcode::SymbolCi(folded));
                }
            } else if negative {
                self.push(Opcode::NotSymbol(lc));
            } else {
                self.push(Opcode::Symbol(lc));
            }
        } else {
            self.push(Opcode::Class(Box::new(set)));
        }
        Ok(i + 1)
    }

    fn compile_quantifier(&mut self, mut i: usize) -> Result<usize, CompileError> {
        let n = self.src.len();
        let c = self.src[i];
        let (min, max): (u32, Bound) = match c as u8 as char {
            '+' => (1, Bound::Unbounded),
            '*' => (0, Bound::Unbounded),
            '?' => (0, Bound::Bounded(1)),
            '{' => {
                i += 1;
                let save = i;
                let min = parse_num(self.src, &mut i).ok_or_else(|| self.err(ErrorKind::InvalidRange, save))?;
                let mut max = Bound::Bounded(min);
                if i < n && self.src[i] == b',' as u16 {
                    i += 1;
                    if i < n && self.src[i] == b'}' as u16 {
                        max = Bound::Unbounded;
                    } else {
                        let m = parse_num(self.src, &mut i).ok_or_else(|| self.err(ErrorKind::InvalidRange, save))?;
                        if m < min {
                            return Err(self.err(ErrorKind::InvalidRange, save));
                        }
                        max = Bound::Bounded(m);
                    }
                }
                if i >= n || self.src[i] != b'}' as u16 {
                    return Err(self.err(ErrorKind::InvalidRange, save));
                }
                (min, max)
            }
            _ => unreachable!(),
        };
        let mut lazy = false;
        if i + 1 < n && self.src[i + 1] == b'?' as u16 {
            lazy = true;
            i += 1;
        }
        let quant = Quantifier { min, max, lazy };

        let last_idx = self
            .ops
            .len()
            .checked_sub(1)
            .ok_or_else(|| self.err(ErrorKind::InvalidQuantifiersCombination, i))?;
        self.apply_quantifier(last_idx, quant, i)?;
        Ok(i + 1)
    }

    fn apply_quantifier(&mut self, idx: OpIdx, quant: Quantifier, pos: usize) -> Result<(), CompileError> {
        let target_idx = match &self.ops[idx] {
            Opcode::Close(c) => c.mate,
            Opcode::NamedClose(c) => c.mate,
            _ => idx,
        };
        let replaced = match &self.ops[target_idx] {
            Opcode::LineStart
            | Opcode::LineEnd
            | Opcode::DataStart
            | Opcode::DataEnd
            | Opcode::WordBound
            | Opcode::NotWordBound => return Err(self.err(ErrorKind::InvalidQuantifiersCombination, pos)),
            Opcode::Any => Some(Opcode::Range(RangeOp { quant, target: RangeTarget::Any })),
            Opcode::AnyAll => Some(Opcode::Range(RangeOp { quant, target: RangeTarget::AnyAll })),
            Opcode::Symbol(cu) => Some(Opcode::Range(RangeOp { quant, target: RangeTarget::Symbol(*cu) })),
            Opcode::NotSymbol(cu) => Some(Opcode::Range(RangeOp { quant, target: RangeTarget::NotSymbol(*cu) })),
            Opcode::SymbolCi(cu) => Some(Opcode::Range(RangeOp { quant, target: RangeTarget::SymbolCi(*cu) })),
            Opcode::NotSymbolCi(cu) => {
                Some(Opcode::Range(RangeOp { quant, target: RangeTarget::NotSymbolCi(*cu) }))
            }
            Opcode::CharType(t) => Some(Opcode::Range(RangeOp { quant, target: RangeTarget::CharType(*t) })),
            Opcode::NotCharType(t) => {
                Some(Opcode::Range(RangeOp { quant, target: RangeTarget::NotCharType(*t) }))
            }
            Opcode::Class(set) => {
                let set = set.clone();
                Some(Opcode::Range(RangeOp { quant, target: RangeTarget::Class(set) }))
            }
            Opcode::BackRef(b) => {
                let mut b = b.clone();
                b.quant = Some(quant);
                Some(Opcode::BackRef(b))
            }
            Opcode::NamedBackRef(b) => {
                let mut b = b.clone();
                b.quant = Some(quant);
                Some(Opcode::NamedBackRef(b))
            }
            Opcode::Open(_) | Opcode::NamedOpen(_) => {
                if target_idx == idx {
                    return Err(self.err(ErrorKind::InvalidQuantifiersCombination, pos));
                }
                None
            }
            _ => return Err(self.err(ErrorKind::InvalidQuantifiersCombination, pos)),
        };
        if let Some(op) = replaced {
            self.ops[target_idx] = op;
        } else {
            match &mut self.ops[target_idx] {
                Opcode::Open(o) => o.quant = Some(quant),
                Opcode::NamedOpen(o) => o.quant = Some(quant),
                _ => unreachable!(),
            }
        }
        Ok(())
    }
}

fn assertion_open(negative: bool, behind: bool) -> Opcode {
    let a = Assertion { mate: 0, next_alt: None, fixed_width: None };
    match (negative, behind) {
        (false, false) => Opcode::LookAhead(a),
        (true, false) => Opcode::NotLookAhead(a),
        (false, true) => Opcode::LookBehind(a),
        (true, true) => Opcode::NotLookBehind(a),
    }
}

fn set_class_char(set: &mut UniSet, cu: u16, ignore_case: bool) {
    if ignore_case {
        set.set(classify::to_lower(cu));
        set.set(classify::to_upper(cu));
    } else {
        set.set(cu);
    }
}

fn parse_num(src: &[u16], i: &mut usize) -> Option<u32> {
    let start = *i;
    let mut value: u32 = 0;
    while *i < src.len() && (src[*i] as u8 as char).is_ascii_digit() {
        value = value.saturating_mul(10).saturating_add((src[*i] - b'0' as u16) as u32);
        *i += 1;
    }
    if *i == start {
        None
    } else {
        Some(value)
    }
}

fn decode_utf16_lossy(units: &[u16]) -> String {
    String::from_utf16_lossy(units)
}

/// Width of a body that may contain top-level alternation: every arm must
/// agree, matching the source engine's rejection of e.g. `(?<=a|bb)`.
fn calc_body_width(ops: &[Opcode], start: usize, end: usize) -> Option<u32> {
    let mut arm_start = start;
    let mut width = None;
    let mut i = start;
    while i <= end {
        let at_boundary = i == end;
        let alt_here = !at_boundary && matches!(ops[i], Opcode::Alternative(_));
        if at_boundary || alt_here {
            let arm_width = calc_concat_width(ops, arm_start, i)?;
            match width {
                None => width = Some(arm_width),
                Some(w) if w == arm_width => {}
                Some(_) => return None,
            }
            if at_boundary {
                break;
            }
            arm_start = i + 1;
            i += 1;
            continue;
        }
        i = skip_item(ops, i);
    }
    width
}

/// Width of a single concatenated run with no top-level alternation.
fn calc_concat_width(ops: &[Opcode], start: usize, end: usize) -> Option<u32> {
    let mut width: u32 = 0;
    let mut i = start;
    while i < end {
        match &ops[i] {
            Opcode::LineStart
            | Opcode::LineEnd
            | Opcode::DataStart
            | Opcode::DataEnd
            | Opcode::WordBound
            | Opcode::NotWordBound
            | Opcode::NoReturn => {
                i += 1;
            }
            op if op.is_unit_width() => {
                width += 1;
                i += 1;
            }
            Opcode::Open(o) => {
                let inner = calc_body_width(ops, i + 1, o.mate)?;
                width += match o.quant {
                    Some(q) => match q.max {
                        Bound::Bounded(m) if m == q.min => inner * q.min,
                        _ => return None,
                    },
                    None => inner,
                };
                i = o.mate + 1;
            }
            Opcode::NamedOpen(o) => {
                let inner = calc_body_width(ops, i + 1, o.mate)?;
                width += match o.quant {
                    Some(q) => match q.max {
                        Bound::Bounded(m) if m == q.min => inner * q.min,
                        _ => return None,
                    },
                    None => inner,
                };
                i = o.mate + 1;
            }
            Opcode::LookAhead(a) | Opcode::NotLookAhead(a) | Opcode::LookBehind(a) | Opcode::NotLookBehind(a) => {
                i = a.mate + 1;
            }
            Opcode::Range(r) => match r.quant.max {
                // A bounded range with min == max repeats a unit-width
                // target a fixed number of times; anything wider (lazy
                // bound mismatch aside) or unbounded is not fixed-width.
                Bound::Bounded(m) if m == r.quant.min => {
                    width += r.quant.min;
                    i += 1;
                }
                _ => return None,
            },
            // A back-reference's width depends on what its target group
            // actually captured at match time, which a lookbehind's
            // fixed-width check cannot know ahead of time, regardless of
            // whether the back-reference itself is quantified.
            Opcode::BackRef(_) | Opcode::NamedBackRef(_) => return None,
            Opcode::Close(_) | Opcode::NamedClose(_) | Opcode::CloseAssertion(_) | Opcode::RegexpEnd => {
                i += 1;
            }
            Opcode::Alternative(_) => unreachable!("caller splits on alternation boundaries"),
        }
    }
    Some(width)
}

/// Advances past one top-level item (used only to find alternation
/// boundaries in `calc_body_width`, which never needs the item's width).
fn skip_item(ops: &[Opcode], i: usize) -> usize {
    match &ops[i] {
        Opcode::Open(o) => o.mate + 1,
        Opcode::NamedOpen(o) => o.mate + 1,
        Opcode::LookAhead(a) | Opcode::NotLookAhead(a) | Opcode::LookBehind(a) | Opcode::NotLookBehind(a) => {
            a.mate + 1
        }
        _ => i + 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utf16(s: &str) -> Vec<u16> {
        s.encode_utf16().collect()
    }

    fn compile_default(pattern: &str) -> CompiledProgram {
        compile(&utf16(pattern), CompileFlags::default()).unwrap()
    }

    #[test]
    fn literal_pattern_compiles() {
        let p = compile_default("abc");
        assert!(matches!(p.ops[0], Opcode::Open(_)));
        assert!(matches!(p.ops[1], Opcode::Symbol(_)));
        assert!(matches!(p.ops.last(), Some(Opcode::RegexpEnd)));
    }

    #[test]
    fn quantifier_promotes_in_place() {
        let p = compile_default("a*");
        assert!(matches!(p.ops[1], Opcode::Range(_)));
    }

    #[test]
    fn capturing_group_count() {
        let p = compile_default("(a)(?:b)(c)");
        assert_eq!(p.capture_count, 2);
    }

    #[test]
    fn backref_to_open_group_errors() {
        let err = compile(&utf16("(a\\1)"), CompileFlags::default()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidBackRef);
    }

    #[test]
    fn backref_to_closed_group_ok() {
        let p = compile_default("(a)\\1");
        assert_eq!(p.max_backref, 1);
    }

    #[test]
    fn named_group_backref() {
        let p = compile_default("(?{x}a)\\p{x}");
        assert!(p.has_named_brackets);
    }

    #[test]
    fn undefined_named_backref_errors() {
        let err = compile(&utf16("\\p{x}"), CompileFlags::default()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ReferenceToUndefinedNamedBracket);
    }

    #[test]
    fn unbalanced_group_errors() {
        let err = compile(&utf16("(a"), CompileFlags::default()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Brackets);
    }

    #[test]
    fn fixed_width_lookbehind_ok() {
        let p = compile_default("(?<=abc)d");
        assert!(p.ops.iter().any(|op| matches!(op, Opcode::LookBehind(a) if a.fixed_width == Some(3))));
    }

    #[test]
    fn variable_width_lookbehind_errors() {
        let err = compile(&utf16("(?<=a*)b"), CompileFlags::default()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::VariableLengthLookBehind);
    }

    #[test]
    fn bounded_equal_range_in_lookbehind_is_fixed_width() {
        let p = compile_default("(?<=a{3,3})b");
        assert!(p.ops.iter().any(|op| matches!(op, Opcode::LookBehind(a) if a.fixed_width == Some(3))));
    }

    #[test]
    fn unbounded_range_in_lookbehind_errors() {
        let err = compile(&utf16("(?<=a{2,})b"), CompileFlags::default()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::VariableLengthLookBehind);
    }

    #[test]
    fn backref_in_lookbehind_errors() {
        let err = compile(&utf16("(a)(?<=\\1)b"), CompileFlags::default()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::VariableLengthLookBehind);
    }

    #[test]
    fn character_class_with_range() {
        let p = compile_default("[a-z]");
        assert!(matches!(p.ops[1], Opcode::Class(_)));
    }

    #[test]
    fn single_char_class_demoted_to_symbol() {
        let p = compile_default("[a]");
        assert!(matches!(p.ops[1], Opcode::Symbol(_)));
    }

    #[test]
    fn alternation_links_arms() {
        let p = compile_default("a|b|c");
        let alt_count = p.ops.iter().filter(|op| matches!(op, Opcode::Alternative(_))).count();
        assert_eq!(alt_count, 2);
    }
}
