// Lunar Scanner (Lexer)
// Converts Lua source code into tokens

use crate::error::{LuaError, LuaResult, Span};
use crate::lexer::token::{Token, TokenKind};

/// Scanner that tokenizes Lua source code
pub struct Scanner {
    source: Vec<char>,
    tokens: Vec<Token>,
    start: usize,
    current: usize,
    line: usize,
    column: usize,
    start_line: usize,
    start_column: usize,
    chunk: String,
    /// `goto` is a plain identifier before Lua 5.2
    goto_keyword: bool,
}

impl Scanner {
    pub fn new(source: &str, chunk: impl Into<String>) -> Self {
        Self {
            source: source.chars().collect(),
            tokens: Vec::new(),
            start: 0,
            current: 0,
            line: 1,
            column: 1,
            start_line: 1,
            start_column: 1,
            chunk: chunk.into(),
            goto_keyword: true,
        }
    }

    pub fn with_goto_keyword(mut self, enabled: bool) -> Self {
        self.goto_keyword = enabled;
        self
    }

    /// Scan all tokens from the source
    pub fn scan_tokens(&mut self) -> LuaResult<Vec<Token>> {
        self.skip_shebang();

        while !self.is_at_end() {
            self.start = self.current;
            self.start_line = self.line;
            self.start_column = self.column;
            self.scan_token()?;
        }

        self.tokens.push(Token::new(
            TokenKind::Eof,
            "",
            Span::single(self.line, self.column, self.current),
        ));

        Ok(std::mem::take(&mut self.tokens))
    }

    fn skip_shebang(&mut self) {
        if self.peek() == '#' {
            while !self.is_at_end() && self.peek() != '\n' {
                self.advance();
            }
        }
    }

    fn scan_token(&mut self) -> LuaResult<()> {
        let c = self.advance();

        match c {
            ' ' | '\t' | '\r' | '\x0b' | '\x0c' => {}
            '\n' => self.newline(),

            '(' => self.add_token(TokenKind::LeftParen),
            ')' => self.add_token(TokenKind::RightParen),
            '{' => self.add_token(TokenKind::LeftBrace),
            '}' => self.add_token(TokenKind::RightBrace),
            ']' => self.add_token(TokenKind::RightBracket),
            ';' => self.add_token(TokenKind::Semicolon),
            ',' => self.add_token(TokenKind::Comma),
            '+' => self.add_token(TokenKind::Plus),
            '*' => self.add_token(TokenKind::Star),
            '%' => self.add_token(TokenKind::Percent),
            '^' => self.add_token(TokenKind::Caret),
            '#' => self.add_token(TokenKind::Hash),
            '&' => self.add_token(TokenKind::Ampersand),
            '|' => self.add_token(TokenKind::Pipe),

            '-' => {
                if self.match_char('-') {
                    self.comment()?;
                } else {
                    self.add_token(TokenKind::Minus);
                }
            }
            '[' => match self.long_bracket_level() {
                Some(level) => {
                    let text = self.long_bracket(level, "string")?;
                    self.add_token(TokenKind::String(text.into_bytes()));
                }
                None => self.add_token(TokenKind::LeftBracket),
            },
            '=' => {
                let kind = if self.match_char('=') {
                    TokenKind::EqualEqual
                } else {
                    TokenKind::Equal
                };
                self.add_token(kind);
            }
            '<' => {
                let kind = if self.match_char('=') {
                    TokenKind::LessEqual
                } else if self.match_char('<') {
                    TokenKind::LessLess
                } else {
                    TokenKind::Less
                };
                self.add_token(kind);
            }
            '>' => {
                let kind = if self.match_char('=') {
                    TokenKind::GreaterEqual
                } else if self.match_char('>') {
                    TokenKind::GreaterGreater
                } else {
                    TokenKind::Greater
                };
                self.add_token(kind);
            }
            '~' => {
                let kind = if self.match_char('=') {
                    TokenKind::TildeEqual
                } else {
                    TokenKind::Tilde
                };
                self.add_token(kind);
            }
            ':' => {
                let kind = if self.match_char(':') {
                    TokenKind::ColonColon
                } else {
                    TokenKind::Colon
                };
                self.add_token(kind);
            }
            '/' => {
                let kind = if self.match_char('/') {
                    TokenKind::SlashSlash
                } else {
                    TokenKind::Slash
                };
                self.add_token(kind);
            }
            '.' => {
                if self.peek().is_ascii_digit() {
                    self.number()?;
                } else if self.match_char('.') {
                    if self.match_char('.') {
                        self.add_token(TokenKind::DotDotDot);
                    } else {
                        self.add_token(TokenKind::DotDot);
                    }
                } else {
                    self.add_token(TokenKind::Dot);
                }
            }
            '"' | '\'' => self.string(c)?,

            _ => {
                if c.is_ascii_digit() {
                    self.number()?;
                } else if c.is_alphabetic() || c == '_' {
                    self.identifier();
                } else {
                    return Err(self.error(&format!("unexpected symbol near '{}'", c)));
                }
            }
        }

        Ok(())
    }

    fn comment(&mut self) -> LuaResult<()> {
        if self.peek() == '[' {
            self.advance();
            if let Some(level) = self.long_bracket_level() {
                self.long_bracket(level, "comment")?;
                return Ok(());
            }
        }
        while self.peek() != '\n' && !self.is_at_end() {
            self.advance();
        }
        Ok(())
    }

    /// After an opening '[', checks for `=*[` and returns the bracket level
    fn long_bracket_level(&self) -> Option<usize> {
        let mut i = self.current;
        while i < self.source.len() && self.source[i] == '=' {
            i += 1;
        }
        if i < self.source.len() && self.source[i] == '[' {
            Some(i - self.current)
        } else {
            None
        }
    }

    fn long_bracket(&mut self, level: usize, what: &str) -> LuaResult<String> {
        for _ in 0..=level {
            self.advance();
        }
        // A newline right after the opening bracket is skipped
        if self.peek() == '\r' {
            self.advance();
        }
        if self.peek() == '\n' {
            self.advance();
            self.newline();
        }

        let mut text = String::new();
        loop {
            if self.is_at_end() {
                return Err(self
                    .error(&format!("unfinished long {} near '<eof>'", what))
                    .premature());
            }
            let c = self.advance();
            if c == ']' && self.closes_long_bracket(level) {
                for _ in 0..=level {
                    self.advance();
                }
                return Ok(text);
            }
            if c == '\n' {
                self.newline();
            }
            text.push(c);
        }
    }

    fn closes_long_bracket(&self, level: usize) -> bool {
        let mut i = self.current;
        for _ in 0..level {
            if i >= self.source.len() || self.source[i] != '=' {
                return false;
            }
            i += 1;
        }
        i < self.source.len() && self.source[i] == ']'
    }

    fn string(&mut self, quote_char: char) -> LuaResult<()> {
        let mut bytes: Vec<u8> = Vec::new();

        loop {
            if self.is_at_end() {
                return Err(self.error("unfinished string near '<eof>'").premature());
            }
            let c = self.advance();
            if c == quote_char {
                break;
            }
            match c {
                '\n' | '\r' => {
                    let partial = String::from_utf8_lossy(&bytes).to_string();
                    return Err(self.error(&format!(
                        "unfinished string near '{}{}'",
                        quote_char, partial
                    )));
                }
                '\\' => self.escape(&mut bytes)?,
                _ => push_char(&mut bytes, c),
            }
        }

        self.add_token(TokenKind::String(bytes));
        Ok(())
    }

    fn escape(&mut self, bytes: &mut Vec<u8>) -> LuaResult<()> {
        if self.is_at_end() {
            return Err(self.error("unfinished string near '<eof>'").premature());
        }
        let c = self.advance();
        match c {
            'n' => bytes.push(b'\n'),
            't' => bytes.push(b'\t'),
            'r' => bytes.push(b'\r'),
            'a' => bytes.push(0x07),
            'b' => bytes.push(0x08),
            'f' => bytes.push(0x0c),
            'v' => bytes.push(0x0b),
            '\\' => bytes.push(b'\\'),
            '"' => bytes.push(b'"'),
            '\'' => bytes.push(b'\''),
            '\n' => {
                self.newline();
                bytes.push(b'\n');
            }
            '\r' => {
                self.match_char('\n');
                self.newline();
                bytes.push(b'\n');
            }
            'x' => {
                let mut value = 0u32;
                for _ in 0..2 {
                    let h = self.advance();
                    let digit = h
                        .to_digit(16)
                        .ok_or_else(|| self.error("hexadecimal digit expected"))?;
                    value = value * 16 + digit;
                }
                bytes.push(value as u8);
            }
            'z' => {
                while !self.is_at_end() && self.peek().is_whitespace() {
                    if self.advance() == '\n' {
                        self.newline();
                    }
                }
            }
            'u' => {
                if !self.match_char('{') {
                    return Err(self.error("missing '{' in \\u{xxxx}"));
                }
                let mut value = 0u32;
                let mut digits = 0;
                while self.peek().is_ascii_hexdigit() {
                    value = value
                        .checked_mul(16)
                        .and_then(|v| v.checked_add(self.peek().to_digit(16).unwrap_or(0)))
                        .ok_or_else(|| self.error("UTF-8 value too large"))?;
                    self.advance();
                    digits += 1;
                }
                if digits == 0 || !self.match_char('}') {
                    return Err(self.error("missing '}' in \\u{xxxx}"));
                }
                let ch = char::from_u32(value).ok_or_else(|| self.error("UTF-8 value too large"))?;
                push_char(bytes, ch);
            }
            d if d.is_ascii_digit() => {
                let mut value = d.to_digit(10).unwrap_or(0);
                for _ in 0..2 {
                    match self.peek().to_digit(10) {
                        Some(n) => {
                            value = value * 10 + n;
                            self.advance();
                        }
                        None => break,
                    }
                }
                if value > 255 {
                    return Err(self.error("decimal escape too large"));
                }
                bytes.push(value as u8);
            }
            other => {
                return Err(self.error(&format!("invalid escape sequence '\\{}'", other)));
            }
        }
        Ok(())
    }

    fn number(&mut self) -> LuaResult<()> {
        let mut text: String = self.source[self.start..self.current].iter().collect();
        let is_hex = text == "0" && (self.peek() == 'x' || self.peek() == 'X');
        if is_hex {
            text.push(self.advance());
        }

        let mut exponent_sign_allowed = false;
        loop {
            let c = self.peek();
            if exponent_sign_allowed && (c == '+' || c == '-') {
                exponent_sign_allowed = false;
            } else if c.is_ascii_digit() || c == '.' || (is_hex && c.is_ascii_hexdigit()) {
                exponent_sign_allowed = false;
                if is_hex && (c == 'e' || c == 'E') && text.contains(['p', 'P']) {
                    break;
                }
            } else if (!is_hex && (c == 'e' || c == 'E')) || (is_hex && (c == 'p' || c == 'P')) {
                exponent_sign_allowed = true;
            } else {
                break;
            }
            text.push(self.advance());
        }

        if self.peek().is_alphanumeric() || self.peek() == '_' {
            while self.peek().is_alphanumeric() || self.peek() == '_' {
                text.push(self.advance());
            }
            return Err(self.error(&format!("malformed number near '{}'", text)));
        }

        let kind = parse_number(&text)
            .ok_or_else(|| self.error(&format!("malformed number near '{}'", text)))?;
        self.add_token(kind);
        Ok(())
    }

    fn identifier(&mut self) {
        while self.peek().is_alphanumeric() || self.peek() == '_' {
            self.advance();
        }

        let text: String = self.source[self.start..self.current].iter().collect();
        let kind = match TokenKind::keyword(&text) {
            Some(TokenKind::Goto) if !self.goto_keyword => TokenKind::Name(text),
            Some(kind) => kind,
            None => TokenKind::Name(text),
        };
        self.add_token(kind);
    }

    // Helper methods
    fn newline(&mut self) {
        self.line += 1;
        self.column = 1;
    }

    fn is_at_end(&self) -> bool {
        self.current >= self.source.len()
    }

    fn advance(&mut self) -> char {
        if self.is_at_end() {
            return '\0';
        }
        let c = self.source[self.current];
        self.current += 1;
        self.column += 1;
        c
    }

    fn peek(&self) -> char {
        if self.is_at_end() {
            '\0'
        } else {
            self.source[self.current]
        }
    }

    fn match_char(&mut self, expected: char) -> bool {
        if self.is_at_end() || self.source[self.current] != expected {
            false
        } else {
            self.current += 1;
            self.column += 1;
            true
        }
    }

    fn add_token(&mut self, kind: TokenKind) {
        let lexeme: String = self.source[self.start..self.current].iter().collect();
        let span = Span::from_positions(
            self.start_line,
            self.start_column,
            self.line,
            self.column,
        );
        self.tokens.push(Token::new(kind, lexeme, span));
    }

    fn error(&self, message: &str) -> LuaError {
        LuaError::syntax(
            message,
            Span::from_positions(self.start_line, self.start_column, self.line, self.column),
            &self.chunk,
        )
    }
}

fn push_char(bytes: &mut Vec<u8>, c: char) {
    let mut buf = [0u8; 4];
    bytes.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
}

/// Parse a Lua numeric literal: decimal or hex, integer or float
pub fn parse_number(text: &str) -> Option<TokenKind> {
    let lower = text.to_ascii_lowercase();
    if let Some(hex) = lower.strip_prefix("0x") {
        if hex.contains('.') || hex.contains('p') {
            return parse_hex_float(hex).map(TokenKind::Float);
        }
        if hex.is_empty() {
            return None;
        }
        // Hex integers wrap around on overflow
        let mut value: u64 = 0;
        for c in hex.chars() {
            value = value.wrapping_mul(16).wrapping_add(c.to_digit(16)? as u64);
        }
        return Some(TokenKind::Integer(value as i64));
    }

    if lower.contains(['.', 'e', 'n', 'i']) {
        if lower.contains(['n', 'i']) {
            return None;
        }
        return lower.parse::<f64>().ok().map(TokenKind::Float);
    }

    match lower.parse::<i64>() {
        Ok(n) => Some(TokenKind::Integer(n)),
        Err(_) => lower.parse::<f64>().ok().map(TokenKind::Float),
    }
}

fn parse_hex_float(hex: &str) -> Option<f64> {
    let (mantissa, exponent) = match hex.split_once('p') {
        Some((m, e)) => (m, e.parse::<i32>().ok()?),
        None => (hex, 0),
    };
    let (int_part, frac_part) = match mantissa.split_once('.') {
        Some((i, f)) => (i, f),
        None => (mantissa, ""),
    };
    if int_part.is_empty() && frac_part.is_empty() {
        return None;
    }
    let mut value = 0f64;
    for c in int_part.chars() {
        value = value * 16.0 + c.to_digit(16)? as f64;
    }
    let mut scale = 1.0 / 16.0;
    for c in frac_part.chars() {
        value += c.to_digit(16)? as f64 * scale;
        scale /= 16.0;
    }
    Some(value * 2f64.powi(exponent))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        Scanner::new(source, "test")
            .scan_tokens()
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn scans_operators_and_keywords() {
        assert_eq!(
            kinds("local x <const> = a // b ~= c"),
            vec![
                TokenKind::Local,
                TokenKind::Name("x".into()),
                TokenKind::Less,
                TokenKind::Name("const".into()),
                TokenKind::Greater,
                TokenKind::Equal,
                TokenKind::Name("a".into()),
                TokenKind::SlashSlash,
                TokenKind::Name("b".into()),
                TokenKind::TildeEqual,
                TokenKind::Name("c".into()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn numbers_keep_integer_and_float_subtypes() {
        assert_eq!(
            kinds("3 3.0 0x10 1e2 .5 0x1p4 0xA.8"),
            vec![
                TokenKind::Integer(3),
                TokenKind::Float(3.0),
                TokenKind::Integer(16),
                TokenKind::Float(100.0),
                TokenKind::Float(0.5),
                TokenKind::Float(16.0),
                TokenKind::Float(10.5),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn decimal_overflow_becomes_float() {
        assert_eq!(
            kinds("9223372036854775808")[0],
            TokenKind::Float(9223372036854775808.0)
        );
        assert_eq!(kinds("0xffffffffffffffff")[0], TokenKind::Integer(-1));
    }

    #[test]
    fn malformed_number_is_a_syntax_error() {
        let err = Scanner::new("x = 3abc", "test").scan_tokens().unwrap_err();
        assert!(err.message.contains("malformed number"));
    }

    #[test]
    fn string_escapes_produce_bytes() {
        assert_eq!(
            kinds(r#"'a\n\65\x42\u{48}\z
                   c'"#)[0],
            TokenKind::String(b"a\nABHc".to_vec())
        );
    }

    #[test]
    fn long_strings_and_comments() {
        let tokens = kinds("--[==[ skipped ]] still ]==] x = [[\nline1\nline2]]");
        assert_eq!(tokens[0], TokenKind::Name("x".into()));
        assert_eq!(tokens[2], TokenKind::String(b"line1\nline2".to_vec()));
    }

    #[test]
    fn unfinished_long_string_is_premature() {
        let err = Scanner::new("x = [[ never closed", "test").scan_tokens().unwrap_err();
        assert!(err.premature_eof);
        assert!(err.message.contains("unfinished long string"));
    }

    #[test]
    fn goto_is_a_name_when_disabled() {
        let tokens = Scanner::new("goto", "test")
            .with_goto_keyword(false)
            .scan_tokens()
            .unwrap();
        assert_eq!(tokens[0].kind, TokenKind::Name("goto".into()));
    }

    #[test]
    fn spans_track_lines() {
        let tokens = Scanner::new("a\n  b", "test").scan_tokens().unwrap();
        assert_eq!(tokens[1].span.start.line, 2);
        assert_eq!(tokens[1].span.start.column, 3);
    }

    #[test]
    fn shebang_line_is_skipped() {
        assert_eq!(kinds("#!/usr/bin/lua\nreturn")[0], TokenKind::Return);
    }
}
