//! Tokeniser (C1, §4.1).
//!
//! A character-by-character scan tracking byte offsets, with escape
//! handling and an explicit unterminated-string failure, covering
//! interpolated strings, numeric-suffix literals, and the full operator
//! set. Produces a `Vec<Token>` eagerly rather than lazily — the parser
//! rewinds by moving an index into that vector instead of re-lexing.

use crate::ast::Decimal;
use crate::diagnostics::{CompileError, CompileResult};
use crate::location::Location;
use crate::token::{keyword_kind, Literal, Token, TokenKind};

/// One open interpolated string (§4.1 "Interpolated string state machine").
struct StringState {
    triple: bool,
    newlines_allowed: bool,
    /// The `nestedBraces` depth recorded when this string's live `${…}`
    /// block was opened; the tokeniser re-enters string-content mode when
    /// `nested_braces` falls back to `close_level - 1`.
    close_level: u32,
}

pub struct Lexer<'s> {
    source: &'s str,
    chars: Vec<(usize, char)>,
    pos: usize,
    tokens: Vec<Token>,
    in_string: bool,
    nested_braces: u32,
    string_states: Vec<StringState>,
    /// Depth of unclosed `( [ {` (code-mode grouping only, not string
    /// interpolation braces) — governs whether a bare newline is a
    /// statement separator or must be swallowed as insignificant
    /// whitespace (§4.2 "distinguish statement-level newlines...").
    group_depth: u32,
    last_emitted_is_newline: bool,
}

impl<'s> Lexer<'s> {
    pub fn new(source: &'s str) -> Self {
        Lexer {
            source,
            chars: source.char_indices().collect(),
            pos: 0,
            tokens: Vec::new(),
            in_string: false,
            nested_braces: 0,
            string_states: Vec::new(),
            group_depth: 0,
            last_emitted_is_newline: false,
        }
    }

    pub fn tokenize(source: &'s str) -> CompileResult<Vec<Token>> {
        let mut lexer = Lexer::new(source);
        lexer.run()?;
        Ok(lexer.tokens)
    }

    fn byte_offset(&self) -> u32 {
        self.chars.get(self.pos).map(|(i, _)| *i as u32).unwrap_or(self.source.len() as u32)
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).map(|(_, c)| *c)
    }

    fn peek_at(&self, n: usize) -> Option<char> {
        self.chars.get(self.pos + n).map(|(_, c)| *c)
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.peek();
        if c.is_some() {
            self.pos += 1;
        }
        c
    }

    fn error(&self, message: impl Into<String>, at: u32) -> CompileError {
        CompileError::new(message, Location::new(at, 1))
    }

    fn push(&mut self, kind: TokenKind, start: u32) {
        let end = self.byte_offset();
        self.last_emitted_is_newline = kind == TokenKind::Newline;
        self.tokens.push(Token::new(kind, Location::new(start, end - start)));
    }

    fn push_literal(&mut self, kind: TokenKind, start: u32, literal: Literal) {
        let end = self.byte_offset();
        self.tokens.push(Token::with_literal(kind, Location::new(start, end - start), literal));
    }

    fn run(&mut self) -> CompileResult<()> {
        while self.pos < self.chars.len() {
            if self.in_string {
                self.scan_string_content()?;
            } else {
                self.scan_code()?;
            }
        }
        if self.nested_braces != 0 || !self.string_states.is_empty() {
            return Err(self.error(
                "unterminated interpolated string expression",
                self.byte_offset(),
            ));
        }
        self.push(TokenKind::Eof, self.byte_offset());
        Ok(())
    }

    // ---- code mode -----------------------------------------------------

    fn scan_code(&mut self) -> CompileResult<()> {
        let start = self.byte_offset();
        let c = match self.advance() {
            Some(c) => c,
            None => return Ok(()),
        };
        match c {
            ' ' | '\t' | '\r' => Ok(()),
            '\n' => {
                if self.group_depth == 0 && !self.last_emitted_is_newline {
                    self.push(TokenKind::Newline, start);
                } else {
                    self.last_emitted_is_newline = self.group_depth == 0;
                }
                Ok(())
            }
            '/' if self.peek() == Some('/') => {
                while let Some(c) = self.peek() {
                    if c == '\n' {
                        break;
                    }
                    self.advance();
                }
                Ok(())
            }
            '/' if self.peek() == Some('*') => {
                self.advance();
                loop {
                    match self.advance() {
                        None => return Err(self.error("unterminated block comment", start)),
                        Some('*') if self.peek() == Some('/') => {
                            self.advance();
                            return Ok(());
                        }
                        _ => {}
                    }
                }
            }
            '0'..='9' => self.scan_number(start),
            '\'' => self.begin_string(start, false),
            '"' => self.begin_string(start, true),
            '{' => {
                self.nested_braces += 1;
                self.group_depth += 1;
                self.push(TokenKind::LeftBrace, start);
                Ok(())
            }
            '}' => {
                self.nested_braces = self.nested_braces.saturating_sub(1);
                self.group_depth = self.group_depth.saturating_sub(1);
                self.push(TokenKind::RightBrace, start);
                if let Some(state) = self.string_states.last() {
                    if self.nested_braces + 1 == state.close_level {
                        self.in_string = true;
                    }
                }
                Ok(())
            }
            '(' => {
                self.group_depth += 1;
                self.push(TokenKind::LeftParen, start);
                Ok(())
            }
            ')' => {
                self.group_depth = self.group_depth.saturating_sub(1);
                self.push(TokenKind::RightParen, start);
                Ok(())
            }
            '[' => {
                self.group_depth += 1;
                self.push(TokenKind::LeftSquare, start);
                Ok(())
            }
            ']' => {
                self.group_depth = self.group_depth.saturating_sub(1);
                self.push(TokenKind::RightSquare, start);
                Ok(())
            }
            ',' => {
                self.push(TokenKind::Comma, start);
                Ok(())
            }
            ';' => {
                self.push(TokenKind::Semicolon, start);
                Ok(())
            }
            ':' => {
                self.push(TokenKind::Colon, start);
                Ok(())
            }
            '.' => {
                // "a.1.2.b": a leading digit right after `.` is a dotted
                // path segment, never the start of a decimal literal in the
                // *previous* number (handled in scan_number); this token is
                // just a plain `.`.
                self.push(TokenKind::Dot, start);
                Ok(())
            }
            '+' => {
                if self.peek() == Some('+') {
                    self.advance();
                    self.push(TokenKind::PlusPlus, start);
                } else if self.peek() == Some('=') {
                    self.advance();
                    self.push(TokenKind::PlusEqual, start);
                } else {
                    self.push(TokenKind::Plus, start);
                }
                Ok(())
            }
            '-' => {
                if self.peek() == Some('-') {
                    self.advance();
                    self.push(TokenKind::MinusMinus, start);
                } else if self.peek() == Some('=') {
                    self.advance();
                    self.push(TokenKind::MinusEqual, start);
                } else if self.peek() == Some('>') {
                    self.advance();
                    self.push(TokenKind::Arrow, start);
                } else {
                    self.push(TokenKind::Minus, start);
                }
                Ok(())
            }
            '*' => {
                if self.peek() == Some('=') {
                    self.advance();
                    self.push(TokenKind::StarEqual, start);
                } else {
                    self.push(TokenKind::Star, start);
                }
                Ok(())
            }
            '/' => {
                if self.peek() == Some('=') {
                    self.advance();
                    self.push(TokenKind::SlashEqual, start);
                } else {
                    self.push(TokenKind::Slash, start);
                }
                Ok(())
            }
            '%' => {
                if self.peek() == Some('=') {
                    self.advance();
                    self.push(TokenKind::PercentEqual, start);
                } else {
                    self.push(TokenKind::Percent, start);
                }
                Ok(())
            }
            '=' => {
                if self.peek() == Some('=') {
                    self.advance();
                    self.push(TokenKind::EqualEqual, start);
                } else {
                    self.push(TokenKind::Equal, start);
                }
                Ok(())
            }
            '!' => self.scan_bang(start),
            '<' => {
                if self.peek() == Some('=') && self.peek_at(1) == Some('>') {
                    self.advance();
                    self.advance();
                    self.push(TokenKind::LessEqualGreater, start);
                } else if self.peek() == Some('=') {
                    self.advance();
                    self.push(TokenKind::LessEqual, start);
                } else {
                    self.push(TokenKind::Less, start);
                }
                Ok(())
            }
            '>' => {
                if self.peek() == Some('=') {
                    self.advance();
                    self.push(TokenKind::GreaterEqual, start);
                } else {
                    self.push(TokenKind::Greater, start);
                }
                Ok(())
            }
            '&' if self.peek() == Some('&') => {
                self.advance();
                self.push(TokenKind::AmpAmp, start);
                Ok(())
            }
            '|' if self.peek() == Some('|') => {
                self.advance();
                self.push(TokenKind::PipePipe, start);
                Ok(())
            }
            '?' => {
                if self.peek() == Some('.') {
                    self.advance();
                    self.push(TokenKind::QuestionDot, start);
                } else if self.peek() == Some('[') {
                    self.advance();
                    self.push(TokenKind::QuestionSquare, start);
                } else if self.peek() == Some(':') {
                    self.advance();
                    self.push(TokenKind::QuestionColon, start);
                } else if self.peek() == Some('=') {
                    self.advance();
                    self.push(TokenKind::QuestionEqual, start);
                } else {
                    self.push(TokenKind::Question, start);
                }
                Ok(())
            }
            c if is_identifier_start(c) => self.scan_identifier(start, c),
            other => Err(self.error(format!("unexpected character '{other}'"), start)),
        }
    }

    fn scan_bang(&mut self, start: u32) -> CompileResult<()> {
        // `!instanceof` / `!in`: a `!` immediately (modulo whitespace)
        // followed by one of these two keywords forms a single negated
        // operator token (§6 keyword list: `!instanceof`, `!in`).
        let save = self.pos;
        let mut lookahead = self.pos;
        while matches!(self.chars.get(lookahead).map(|(_, c)| *c), Some(' ') | Some('\t')) {
            lookahead += 1;
        }
        let word_start = lookahead;
        while matches!(self.chars.get(lookahead).map(|(_, c)| *c), Some(c) if c.is_alphanumeric() || c == '_')
        {
            lookahead += 1;
        }
        let word: String = self.chars[word_start..lookahead].iter().map(|(_, c)| *c).collect();
        if word == "instanceof" || word == "in" {
            self.pos = lookahead;
            self.push(
                if word == "instanceof" { TokenKind::NotInstanceof } else { TokenKind::NotIn },
                start,
            );
            return Ok(());
        }
        self.pos = save;
        if self.peek() == Some('=') {
            self.advance();
            self.push(TokenKind::BangEqual, start);
        } else {
            self.push(TokenKind::Bang, start);
        }
        Ok(())
    }

    fn scan_identifier(&mut self, start: u32, first: char) -> CompileResult<()> {
        let mut text = String::new();
        text.push(first);
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' {
                text.push(c);
                self.advance();
            } else {
                break;
            }
        }
        match keyword_kind(&text) {
            Some(TokenKind::True) => self.push_literal(TokenKind::True, start, Literal::Bool(true)),
            Some(TokenKind::False) => self.push_literal(TokenKind::False, start, Literal::Bool(false)),
            Some(TokenKind::Null) => self.push_literal(TokenKind::Null, start, Literal::Null),
            Some(kind) => self.push(kind, start),
            None => self.push(TokenKind::Identifier, start),
        }
        Ok(())
    }

    fn scan_number(&mut self, start: u32) -> CompileResult<()> {
        let mut digits = String::new();
        digits.push(self.chars[self.pos - 1].1);
        while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
            digits.push(self.advance().unwrap());
        }

        let prev_is_dot = self
            .tokens
            .last()
            .map(|t| t.kind == TokenKind::Dot)
            .unwrap_or(false);

        let mut is_decimal = false;
        let mut fraction = String::new();
        if !prev_is_dot && self.peek() == Some('.') && matches!(self.peek_at(1), Some(c) if c.is_ascii_digit())
        {
            self.advance(); // consume '.'
            is_decimal = true;
            while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
                fraction.push(self.advance().unwrap());
            }
        }

        let suffix = self.peek();
        match suffix {
            Some('L') if !is_decimal => {
                self.advance();
                let value: i64 = digits
                    .parse()
                    .map_err(|_| self.error("Number too large for long constant", start))?;
                self.push_literal(TokenKind::LongConst, start, Literal::Long(value));
            }
            Some('D') => {
                self.advance();
                let text = if is_decimal { format!("{digits}.{fraction}") } else { digits };
                let value: f64 = text
                    .parse()
                    .map_err(|_| self.error("Number too large for double constant", start))?;
                self.push_literal(TokenKind::DoubleConst, start, Literal::Double(value));
            }
            _ if is_decimal => {
                let scale = fraction.len() as u32;
                let unscaled: i128 = format!("{digits}{fraction}")
                    .parse()
                    .map_err(|_| self.error("Number too large for Decimal constant", start))?;
                self.push_literal(
                    TokenKind::DecimalConst,
                    start,
                    Literal::Decimal(Decimal::new(unscaled, scale)),
                );
            }
            _ => {
                let value: i32 = digits
                    .parse()
                    .map_err(|_| self.error("Number too large for int constant", start))?;
                self.push_literal(TokenKind::IntConst, start, Literal::Int(value));
            }
        }
        Ok(())
    }

    // ---- strings ---------------------------------------------------------

    fn begin_string(&mut self, start: u32, interpolated: bool) -> CompileResult<()> {
        let quote = if interpolated { '"' } else { '\'' };
        let triple = self.peek() == Some(quote) && self.peek_at(1) == Some(quote);
        if triple {
            self.advance();
            self.advance();
        }
        if interpolated {
            self.push(TokenKind::ExprStringStart, start);
            self.string_states.push(StringState {
                triple,
                newlines_allowed: triple,
                close_level: 0,
            });
            self.in_string = true;
            Ok(())
        } else {
            self.scan_plain_string(start, triple)
        }
    }

    /// Single-quoted strings never interpolate; they still honour the
    /// triple-quote newline rule and escape table.
    fn scan_plain_string(&mut self, start: u32, triple: bool) -> CompileResult<()> {
        let mut text = String::new();
        loop {
            if self.is_closing_quote('\'', triple) {
                self.consume_closing_quote(triple);
                self.push_literal(TokenKind::StringConst, start, Literal::String(text));
                return Ok(());
            }
            match self.advance() {
                None => return Err(self.error("unterminated string literal", start)),
                Some('\n') if !triple => {
                    return Err(self.error("newline not allowed in single-quoted string", self.byte_offset() - 1));
                }
                Some('\n') => text.push('\n'),
                Some('\\') => text.push(self.scan_escape(start)?),
                Some(c) => text.push(c),
            }
        }
    }

    fn is_closing_quote(&self, quote: char, triple: bool) -> bool {
        if self.peek() != Some(quote) {
            return false;
        }
        if !triple {
            return true;
        }
        self.peek_at(1) == Some(quote) && self.peek_at(2) == Some(quote)
    }

    fn consume_closing_quote(&mut self, triple: bool) {
        self.advance();
        if triple {
            self.advance();
            self.advance();
        }
    }

    fn scan_escape(&mut self, string_start: u32) -> CompileResult<char> {
        match self.advance() {
            None => Err(self.error("unterminated escape sequence at end of input", string_start)),
            Some('t') => Ok('\t'),
            Some('b') => Ok('\u{8}'),
            Some('n') => Ok('\n'),
            Some('r') => Ok('\r'),
            Some('f') => Ok('\u{c}'),
            Some(other) => Ok(other),
        }
    }

    /// Scans literal text of the topmost open interpolated string until a
    /// `$` (embedded identifier or `{`) or the closing quote sequence.
    fn scan_string_content(&mut self) -> CompileResult<()> {
        let string_start = self.byte_offset();
        let (triple, all_enclosing_triple) = {
            let state = self.string_states.last().expect("in_string implies a state");
            let all_triple = self.string_states.iter().all(|s| s.triple);
            (state.triple, all_triple)
        };
        let mut text = String::new();
        let mut text_start = self.byte_offset();
        loop {
            if self.is_closing_quote('"', triple) {
                if !text.is_empty() {
                    self.push_literal(TokenKind::StringConst, text_start, Literal::String(std::mem::take(&mut text)));
                }
                self.consume_closing_quote(triple);
                self.push(TokenKind::ExprStringEnd, self.byte_offset());
                self.string_states.pop();
                self.in_string = false;
                return Ok(());
            }
            match self.peek() {
                None => return Err(self.error("unterminated string literal", string_start)),
                Some('\n') => {
                    if triple && all_enclosing_triple {
                        text.push(self.advance().unwrap());
                    } else {
                        return Err(self.error("newline not allowed in this string literal", self.byte_offset()));
                    }
                }
                Some('\\') => {
                    self.advance();
                    text.push(self.scan_escape(string_start)?);
                }
                Some('$') => {
                    if !text.is_empty() {
                        self.push_literal(TokenKind::StringConst, text_start, Literal::String(std::mem::take(&mut text)));
                    }
                    self.advance();
                    self.scan_dollar()?;
                    if !self.in_string {
                        // `${` switched us to code mode; resume there.
                        return Ok(());
                    }
                    text_start = self.byte_offset();
                }
                Some(c) => {
                    if text.is_empty() {
                        text_start = self.byte_offset();
                    }
                    text.push(c);
                    self.advance();
                }
            }
        }
    }

    fn scan_dollar(&mut self) -> CompileResult<()> {
        let dollar_start = self.byte_offset() - 1;
        match self.peek() {
            Some('{') => {
                self.advance();
                self.nested_braces += 1;
                self.group_depth += 1;
                if let Some(state) = self.string_states.last_mut() {
                    state.close_level = self.nested_braces;
                }
                self.push(TokenKind::LeftBrace, dollar_start + 1);
                self.in_string = false;
                Ok(())
            }
            Some(c) if is_identifier_start(c) => {
                let ident_start = self.byte_offset();
                self.advance();
                self.scan_identifier(ident_start, c)
            }
            _ => Err(self.error(
                "'$' in an interpolated string must be followed by an identifier or '{'",
                dollar_start,
            )),
        }
    }
}

fn is_identifier_start(c: char) -> bool {
    c.is_alphabetic() || c == '_'
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        Lexer::tokenize(source).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn tokenizes_a_simple_arithmetic_expression() {
        let kinds = kinds("1 + 2L * 3.0D");
        assert_eq!(
            kinds,
            vec![
                TokenKind::IntConst,
                TokenKind::Plus,
                TokenKind::LongConst,
                TokenKind::Star,
                TokenKind::DoubleConst,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn unsuffixed_decimal_point_literal_is_decimal_not_double() {
        let tokens = Lexer::tokenize("3.14").unwrap();
        assert_eq!(tokens[0].kind, TokenKind::DecimalConst);
    }

    #[test]
    fn dotted_path_after_integer_does_not_become_a_decimal() {
        let kinds = kinds("a.1.2.b");
        assert_eq!(
            kinds,
            vec![
                TokenKind::Identifier,
                TokenKind::Dot,
                TokenKind::IntConst,
                TokenKind::Dot,
                TokenKind::IntConst,
                TokenKind::Dot,
                TokenKind::Identifier,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn string_interpolation_emits_the_documented_token_sequence() {
        // S2: `"answer = ${x * 14}"`
        let kinds = kinds(r#""answer = ${x * 14}""#);
        assert_eq!(
            kinds,
            vec![
                TokenKind::ExprStringStart,
                TokenKind::StringConst,
                TokenKind::LeftBrace,
                TokenKind::Identifier,
                TokenKind::Star,
                TokenKind::IntConst,
                TokenKind::RightBrace,
                TokenKind::ExprStringEnd,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn bare_dollar_identifier_interpolation() {
        let kinds = kinds(r#""hi $name!""#);
        assert_eq!(
            kinds,
            vec![
                TokenKind::ExprStringStart,
                TokenKind::StringConst,
                TokenKind::Identifier,
                TokenKind::StringConst,
                TokenKind::ExprStringEnd,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn triple_quoted_allows_embedded_newline() {
        let tokens = Lexer::tokenize("\"\"\"line1\nline2\"\"\"").unwrap();
        assert_eq!(tokens[1].kind, TokenKind::StringConst);
    }

    #[test]
    fn single_quoted_rejects_embedded_newline() {
        let err = Lexer::tokenize("\"line1\nline2\"").unwrap_err();
        assert!(err.message.contains("newline"));
    }

    #[test]
    fn unterminated_string_is_a_compile_error() {
        let err = Lexer::tokenize("\"abc").unwrap_err();
        assert!(err.message.contains("unterminated"));
    }

    #[test]
    fn unterminated_block_comment_is_a_compile_error() {
        let err = Lexer::tokenize("/* never closed").unwrap_err();
        assert!(err.message.contains("comment"));
    }

    #[test]
    fn not_instanceof_and_not_in_bind_as_single_operators() {
        assert_eq!(kinds("x !instanceof Foo"), vec![
            TokenKind::Identifier,
            TokenKind::NotInstanceof,
            TokenKind::Identifier,
            TokenKind::Eof,
        ]);
        assert_eq!(kinds("x !in y"), vec![
            TokenKind::Identifier,
            TokenKind::NotIn,
            TokenKind::Identifier,
            TokenKind::Eof,
        ]);
    }

    #[test]
    fn newline_inside_parens_is_not_a_statement_separator() {
        let kinds = kinds("(1 +\n2)");
        assert!(!kinds.contains(&TokenKind::Newline));
    }

    #[test]
    fn statement_level_newline_collapses_runs() {
        let kinds = kinds("1\n\n\n2");
        assert_eq!(
            kinds,
            vec![TokenKind::IntConst, TokenKind::Newline, TokenKind::IntConst, TokenKind::Eof]
        );
    }

    #[test]
    fn token_round_trip_reproduces_source_modulo_trivia() {
        let source = "var x = 1 + 2 // comment\n";
        let tokens = Lexer::tokenize(source).unwrap();
        for t in &tokens {
            if t.kind == TokenKind::Eof {
                continue;
            }
            let text = t.text(source);
            assert!(source[t.location.offset as usize..].starts_with(text));
        }
    }
}
