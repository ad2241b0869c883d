// Lunar Patterns
// Backtracking matcher for string patterns over byte strings

use crate::error::{LuaError, LuaResult};

const MAX_CAPTURES: usize = 32;
const MAX_RECURSION: usize = 200;
const SPECIALS: &[u8] = b"^$*+?.([%-";

/// A captured span, or a position capture `()`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capture {
    Span(usize, usize),
    Position(usize),
}

#[derive(Clone, Copy)]
enum CaptureLen {
    Open,
    Closed(usize),
    Position,
}

struct MatchState<'a> {
    source: &'a [u8],
    pattern: &'a [u8],
    depth: usize,
    captures: Vec<(usize, CaptureLen)>,
}

/// Whether `pattern` contains no magic characters
pub fn is_plain(pattern: &[u8]) -> bool {
    !pattern.iter().any(|b| SPECIALS.contains(b))
}

/// Finds the first match at or after `init`; returns the span and its captures
pub fn find(source: &[u8], pattern: &[u8], init: usize) -> LuaResult<Option<(usize, usize, Vec<Capture>)>> {
    let (anchored, pattern) = match pattern.first() {
        Some(b'^') => (true, &pattern[1..]),
        _ => (false, pattern),
    };
    let mut start = init;
    loop {
        let mut state = MatchState::new(source, pattern);
        if let Some(end) = state.do_match(start, 0)? {
            let captures = state.finish()?;
            return Ok(Some((start, end, captures)));
        }
        start += 1;
        if anchored || start > source.len() {
            return Ok(None);
        }
    }
}

/// Match anchored exactly at `start`, used by `gmatch` and `gsub`
pub fn match_at(source: &[u8], pattern: &[u8], start: usize) -> LuaResult<Option<(usize, Vec<Capture>)>> {
    let mut state = MatchState::new(source, pattern);
    match state.do_match(start, 0)? {
        Some(end) => {
            let captures = state.finish()?;
            Ok(Some((end, captures)))
        }
        None => Ok(None),
    }
}

impl<'a> MatchState<'a> {
    fn new(source: &'a [u8], pattern: &'a [u8]) -> Self {
        Self {
            source,
            pattern,
            depth: 0,
            captures: Vec::new(),
        }
    }

    /// Captures of a successful match; empty when the pattern has none
    fn finish(&self) -> LuaResult<Vec<Capture>> {
        self.captures
            .iter()
            .map(|&(begin, len)| match len {
                CaptureLen::Closed(n) => Ok(Capture::Span(begin, begin + n)),
                CaptureLen::Position => Ok(Capture::Position(begin)),
                CaptureLen::Open => Err(LuaError::runtime("unfinished capture")),
            })
            .collect()
    }

    fn do_match(&mut self, s: usize, p: usize) -> LuaResult<Option<usize>> {
        self.depth += 1;
        if self.depth > MAX_RECURSION {
            return Err(LuaError::runtime("pattern too complex"));
        }
        let result = self.match_here(s, p);
        self.depth -= 1;
        result
    }

    fn match_here(&mut self, mut s: usize, mut p: usize) -> LuaResult<Option<usize>> {
        let pattern = self.pattern;
        loop {
            if p >= pattern.len() {
                return Ok(Some(s));
            }
            match pattern[p] {
                b'(' => {
                    return if pattern.get(p + 1) == Some(&b')') {
                        self.start_capture(s, p + 2, CaptureLen::Position)
                    } else {
                        self.start_capture(s, p + 1, CaptureLen::Open)
                    };
                }
                b')' => return self.end_capture(s, p + 1),
                b'$' if p + 1 == pattern.len() => {
                    return Ok((s == self.source.len()).then_some(s));
                }
                b'%' if pattern.get(p + 1) == Some(&b'b') => {
                    match self.match_balance(s, p + 2)? {
                        Some(next) => {
                            s = next;
                            p += 4;
                            continue;
                        }
                        None => return Ok(None),
                    }
                }
                b'%' if pattern.get(p + 1) == Some(&b'f') => {
                    p += 2;
                    if pattern.get(p) != Some(&b'[') {
                        return Err(LuaError::runtime("missing '[' after '%f' in pattern"));
                    }
                    let end = self.class_end(p)?;
                    let previous = if s == 0 { 0 } else { self.source[s - 1] };
                    let current = self.source.get(s).copied().unwrap_or(0);
                    if !self.match_set(previous, p, end - 1) && self.match_set(current, p, end - 1) {
                        p = end;
                        continue;
                    }
                    return Ok(None);
                }
                b'%' if pattern.get(p + 1).is_some_and(u8::is_ascii_digit) => {
                    match self.match_back_reference(s, pattern[p + 1])? {
                        Some(next) => {
                            s = next;
                            p += 2;
                            continue;
                        }
                        None => return Ok(None),
                    }
                }
                _ => {}
            }

            let end = self.class_end(p)?;
            let matches = s < self.source.len() && self.single_match(self.source[s], p, end);
            match pattern.get(end) {
                Some(b'?') => {
                    if matches {
                        if let Some(result) = self.do_match(s + 1, end + 1)? {
                            return Ok(Some(result));
                        }
                    }
                    p = end + 1;
                }
                Some(b'+') => {
                    return if matches {
                        self.max_expand(s + 1, p, end)
                    } else {
                        Ok(None)
                    };
                }
                Some(b'*') => return self.max_expand(s, p, end),
                Some(b'-') => return self.min_expand(s, p, end),
                _ => {
                    if !matches {
                        return Ok(None);
                    }
                    s += 1;
                    p = end;
                }
            }
        }
    }

    fn start_capture(&mut self, s: usize, p: usize, len: CaptureLen) -> LuaResult<Option<usize>> {
        if self.captures.len() >= MAX_CAPTURES {
            return Err(LuaError::runtime("too many captures"));
        }
        self.captures.push((s, len));
        let result = self.do_match(s, p)?;
        if result.is_none() {
            self.captures.pop();
        }
        Ok(result)
    }

    fn end_capture(&mut self, s: usize, p: usize) -> LuaResult<Option<usize>> {
        let open = self
            .captures
            .iter()
            .rposition(|(_, len)| matches!(len, CaptureLen::Open))
            .ok_or_else(|| LuaError::runtime("invalid pattern capture"))?;
        let begin = self.captures[open].0;
        self.captures[open].1 = CaptureLen::Closed(s - begin);
        let result = self.do_match(s, p)?;
        if result.is_none() {
            self.captures[open].1 = CaptureLen::Open;
        }
        Ok(result)
    }

    fn match_balance(&self, s: usize, p: usize) -> LuaResult<Option<usize>> {
        let (Some(&open), Some(&close)) = (self.pattern.get(p), self.pattern.get(p + 1)) else {
            return Err(LuaError::runtime("missing arguments to '%b'"));
        };
        if self.source.get(s) != Some(&open) {
            return Ok(None);
        }
        let mut depth = 1;
        let mut i = s + 1;
        while i < self.source.len() {
            let c = self.source[i];
            if c == close {
                depth -= 1;
                if depth == 0 {
                    return Ok(Some(i + 1));
                }
            } else if c == open {
                depth += 1;
            }
            i += 1;
        }
        Ok(None)
    }

    fn match_back_reference(&self, s: usize, digit: u8) -> LuaResult<Option<usize>> {
        let slot = digit.checked_sub(b'1').and_then(|i| self.captures.get(usize::from(i)));
        let (begin, len) = match slot {
            Some(&(begin, CaptureLen::Closed(len))) => (begin, len),
            _ => {
                return Err(LuaError::runtime(format!(
                    "invalid capture index %{}",
                    char::from(digit)
                )))
            }
        };
        let captured = &self.source[begin..begin + len];
        if self.source[s..].starts_with(captured) {
            Ok(Some(s + len))
        } else {
            Ok(None)
        }
    }

    fn max_expand(&mut self, s: usize, p: usize, end: usize) -> LuaResult<Option<usize>> {
        let mut count = 0;
        while s + count < self.source.len() && self.single_match(self.source[s + count], p, end) {
            count += 1;
        }
        loop {
            if let Some(result) = self.do_match(s + count, end + 1)? {
                return Ok(Some(result));
            }
            if count == 0 {
                return Ok(None);
            }
            count -= 1;
        }
    }

    fn min_expand(&mut self, mut s: usize, p: usize, end: usize) -> LuaResult<Option<usize>> {
        loop {
            if let Some(result) = self.do_match(s, end + 1)? {
                return Ok(Some(result));
            }
            if s < self.source.len() && self.single_match(self.source[s], p, end) {
                s += 1;
            } else {
                return Ok(None);
            }
        }
    }

    /// Index just past the single-character class starting at `p`
    fn class_end(&self, p: usize) -> LuaResult<usize> {
        let pattern = self.pattern;
        match pattern[p] {
            b'%' => {
                if p + 1 >= pattern.len() {
                    return Err(LuaError::runtime("malformed pattern (ends with '%')"));
                }
                Ok(p + 2)
            }
            b'[' => {
                let mut i = p + 1;
                if pattern.get(i) == Some(&b'^') {
                    i += 1;
                }
                // a ']' right after the opening bracket is literal
                loop {
                    let Some(&c) = pattern.get(i) else {
                        return Err(LuaError::runtime("malformed pattern (missing ']')"));
                    };
                    i += 1;
                    if c == b'%' {
                        i += 1;
                    } else if c == b']' && i > p + 2 + usize::from(pattern[p + 1] == b'^') {
                        return Ok(i);
                    }
                }
            }
            _ => Ok(p + 1),
        }
    }

    fn single_match(&self, c: u8, p: usize, end: usize) -> bool {
        match self.pattern[p] {
            b'.' => true,
            b'%' => match_class(c, self.pattern[p + 1]),
            b'[' => self.match_set(c, p, end - 1),
            literal => literal == c,
        }
    }

    /// `[...]` set between `p` (the '[') and `end` (the ']')
    fn match_set(&self, c: u8, p: usize, end: usize) -> bool {
        let pattern = self.pattern;
        let mut i = p + 1;
        let negate = pattern.get(i) == Some(&b'^');
        if negate {
            i += 1;
        }
        while i < end {
            if pattern[i] == b'%' && i + 1 < end {
                if match_class(c, pattern[i + 1]) {
                    return !negate;
                }
                i += 2;
            } else if i + 2 < end && pattern[i + 1] == b'-' {
                if pattern[i] <= c && c <= pattern[i + 2] {
                    return !negate;
                }
                i += 3;
            } else {
                if pattern[i] == c {
                    return !negate;
                }
                i += 1;
            }
        }
        negate
    }
}

fn match_class(c: u8, class: u8) -> bool {
    let matched = match class.to_ascii_lowercase() {
        b'a' => c.is_ascii_alphabetic(),
        b'd' => c.is_ascii_digit(),
        b'l' => c.is_ascii_lowercase(),
        b's' => c.is_ascii_whitespace() || c == 0x0b,
        b'u' => c.is_ascii_uppercase(),
        b'w' => c.is_ascii_alphanumeric(),
        b'x' => c.is_ascii_hexdigit(),
        b'p' => c.is_ascii_punctuation(),
        b'c' => c.is_ascii_control(),
        b'g' => c.is_ascii_graphic(),
        _ => return class == c,
    };
    if class.is_ascii_uppercase() {
        !matched
    } else {
        matched
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span(source: &str, pattern: &str) -> Option<(usize, usize)> {
        find(source.as_bytes(), pattern.as_bytes(), 0)
            .unwrap()
            .map(|(s, e, _)| (s, e))
    }

    #[test]
    fn classes_quantifiers_and_anchors() {
        assert_eq!(span("hello world", "o w"), Some((4, 7)));
        assert_eq!(span("abc123", "%d+"), Some((3, 6)));
        assert_eq!(span("  x", "^%s*"), Some((0, 2)));
        assert_eq!(span("abc", "^b"), None);
        assert_eq!(span("key = value", "%w+$"), Some((6, 11)));
        assert_eq!(span("aaa", "a-b"), None);
        assert_eq!(span("<<a>>", "<.->"), Some((0, 4)));
        assert_eq!(span("color colour", "colou?r"), Some((0, 5)));
    }

    #[test]
    fn sets_and_balanced_matches() {
        assert_eq!(span("x = [1, 2]", "[%d,]+"), Some((5, 7)));
        assert_eq!(span("f(a(b)c) d", "%b()"), Some((1, 8)));
        assert_eq!(span("THE (quick) fox", "%f[%a]%a+"), Some((0, 3)));
        assert_eq!(span("a]b", "[]]"), Some((1, 2)));
        assert_eq!(span("abc", "[^a]"), Some((1, 2)));
    }

    #[test]
    fn captures_and_back_references() {
        let (_, _, caps) = find(b"name=lunar", b"(%w+)=(%w+)", 0).unwrap().unwrap();
        assert_eq!(caps, vec![Capture::Span(0, 4), Capture::Span(5, 10)]);
        let (_, _, caps) = find(b"abc", b"()b()", 0).unwrap().unwrap();
        assert_eq!(caps, vec![Capture::Position(1), Capture::Position(2)]);
        assert_eq!(span("say \"hi\" now", "([\"']).-%1"), Some((4, 8)));
    }

    #[test]
    fn malformed_patterns_are_errors() {
        assert!(find(b"abc", b"[a", 0).is_err());
        assert!(find(b"abc", b"%", 0).is_err());
        assert!(find(b"abc", b"(a", 0).is_err());
        assert!(is_plain(b"hello"));
        assert!(!is_plain(b"a.b"));
    }
}
