//! The scanner.
//!
//! One token per call, one token of lookahead, and the previous token kind
//! retained for implicit semicolon insertion. The lexer is `Clone`: the
//! parser snapshots it (cursor state included) to disambiguate constructs
//! that need bounded backtracking, such as type casts versus composite
//! literals.

use std::rc::Rc;

use velac_util::{CompileError, CompileResult, DebugInfo, Interner};

use crate::cursor::Cursor;
use crate::token::{Tok, Token};

#[derive(Clone)]
pub struct Lexer {
    cursor: Cursor,
    pub file_name: Rc<str>,
    /// Current token (the single token of lookahead).
    pub tok: Token,
    /// Kind of the token before `tok`, for implicit semicolon insertion.
    prev_tok: Tok,
    /// Debug record the code generator snapshots per instruction.
    pub debug: DebugInfo,
}

impl Lexer {
    /// Creates a lexer over an in-memory source buffer. The first token is
    /// not scanned yet; call [`Lexer::next`] once before parsing.
    pub fn new(file_name: Rc<str>, source: Rc<str>) -> Self {
        Self {
            cursor: Cursor::new(source),
            debug: DebugInfo::new(Rc::clone(&file_name)),
            file_name,
            tok: Token::default(),
            prev_tok: Tok::None,
        }
    }

    /// Builds a compile error at the current token position.
    pub fn error(&self, msg: impl Into<String>) -> CompileError {
        CompileError::new(
            self.file_name.as_ref(),
            self.debug.fn_name.as_ref(),
            self.tok.line.max(1),
            self.tok.pos.max(1),
            msg,
        )
    }

    /// Advances to the next token, converting a newline into an implicit
    /// semicolon iff the previous token can end a statement.
    pub fn next(&mut self, interner: &mut Interner) -> CompileResult<()> {
        loop {
            self.next_with_eoln(interner)?;
            if self.tok.kind == Tok::Eoln && self.prev_tok.ends_statement() {
                self.tok.kind = Tok::ImplicitSemicolon;
            }
            self.prev_tok = self.tok.kind;
            if self.tok.kind != Tok::Eoln {
                return Ok(());
            }
        }
    }

    /// Advances to the next token, converting a newline into an implicit
    /// semicolon unconditionally. Used after constructs that always close
    /// a statement, such as composite type declarations.
    pub fn next_forced_semicolon(&mut self, interner: &mut Interner) -> CompileResult<()> {
        self.next_with_eoln(interner)?;
        if self.tok.kind == Tok::Eoln {
            self.tok.kind = Tok::ImplicitSemicolon;
        }
        self.prev_tok = self.tok.kind;
        Ok(())
    }

    /// True if the current token has the given kind. An implicit semicolon
    /// satisfies a check for an explicit one.
    pub fn check(&self, kind: Tok) -> bool {
        self.tok.kind == kind || (self.tok.kind == Tok::ImplicitSemicolon && kind == Tok::Semicolon)
    }

    /// Requires the current token to have the given kind and advances past
    /// it. A semicolon is optional immediately before `)`, `}`, and the
    /// end of the file.
    pub fn eat(&mut self, kind: Tok, interner: &mut Interner) -> CompileResult<()> {
        if !self.check(kind) {
            if kind == Tok::Semicolon
                && matches!(self.tok.kind, Tok::RPar | Tok::RBrace | Tok::Eof)
            {
                return Ok(());
            }
            return Err(self.error(format!(
                "Unexpected {}, expected {}",
                self.tok.kind.spelling(),
                kind.spelling()
            )));
        }
        self.next(interner)
    }

    fn next_with_eoln(&mut self, interner: &mut Interner) -> CompileResult<()> {
        self.skip_spaces_and_comments();

        self.tok = Token {
            line: self.cursor.line(),
            pos: self.cursor.column(),
            ..Token::default()
        };
        self.debug.line = self.cursor.line();

        let ch = self.cursor.current();
        if ch.is_ascii_alphabetic() || ch == b'_' {
            self.scan_keyword_or_ident(interner)
        } else if ch.is_ascii_digit() || ch == b'.' {
            self.scan_number()?;
            if self.tok.kind == Tok::None {
                self.scan_operator()?;
            }
            Ok(())
        } else if ch == b'\'' {
            self.scan_char_literal()
        } else if ch == b'"' || ch == b'`' {
            self.scan_str_literal(interner)
        } else if ch == 0 {
            self.tok.kind = Tok::Eof;
            Ok(())
        } else {
            self.scan_operator()
        }
    }

    fn skip_spaces_and_comments(&mut self) {
        loop {
            match self.cursor.current() {
                b' ' | b'\t' | b'\r' => {
                    self.cursor.advance();
                }
                b'/' => match self.cursor.byte_at(1) {
                    b'/' => {
                        while self.cursor.current() != 0 && self.cursor.current() != b'\n' {
                            self.cursor.advance();
                        }
                    }
                    b'*' => {
                        self.cursor.advance();
                        self.cursor.advance();
                        loop {
                            match self.cursor.current() {
                                0 => break,
                                b'*' if self.cursor.byte_at(1) == b'/' => {
                                    self.cursor.advance();
                                    self.cursor.advance();
                                    break;
                                }
                                _ => {
                                    self.cursor.advance();
                                }
                            }
                        }
                    }
                    _ => break,
                },
                _ => break,
            }
        }
    }

    fn scan_keyword_or_ident(&mut self, interner: &mut Interner) -> CompileResult<()> {
        let start = self.cursor.position();
        while {
            let ch = self.cursor.current();
            ch.is_ascii_alphanumeric() || ch == b'_'
        } {
            self.cursor.advance();
        }
        let name = self.cursor.text(start, self.cursor.position());
        match Tok::keyword(name) {
            Some(kw) => self.tok.kind = kw,
            None => {
                self.tok.kind = Tok::Ident;
                let name = name.to_owned();
                self.tok.name = interner.intern(&name);
            }
        }
        Ok(())
    }

    fn scan_digit(ch: u8, base: u32) -> Option<u64> {
        (ch as char).to_digit(base).map(|d| d as u64)
    }

    /// Scans a digit sequence with `_` separators. Overflow on a fractional
    /// part silently stops accumulating; elsewhere it is an error.
    fn scan_digit_seq(&mut self, base: u32, is_frac: bool) -> CompileResult<(u64, u32)> {
        if Self::scan_digit(self.cursor.current(), base).is_none() {
            return Err(self.error("Invalid number"));
        }

        let mut result: u64 = 0;
        let mut len: u32 = 0;
        let mut skip_digits = false;

        while let Some(digit) = Self::scan_digit(self.cursor.current(), base) {
            match result.checked_mul(base as u64).and_then(|r| r.checked_add(digit)) {
                Some(new_result) if !skip_digits => {
                    result = new_result;
                    len += 1;
                }
                Some(_) => {}
                None => {
                    if is_frac {
                        skip_digits = true;
                    } else {
                        return Err(self.error("Number is too large"));
                    }
                }
            }
            self.cursor.advance();

            if self.cursor.current() == b'_' {
                if Self::scan_digit(self.cursor.byte_at(1), base).is_some() {
                    self.cursor.advance();
                } else {
                    return Err(self.error("_ must be placed between digits"));
                }
            }
        }
        Ok((result, len))
    }

    fn scan_number(&mut self) -> CompileResult<()> {
        let mut base = 10u32;
        if self.cursor.current() == b'0' && matches!(self.cursor.byte_at(1), b'x' | b'X') {
            self.cursor.advance();
            self.cursor.advance();
            self.cursor.advance_if(b'_');
            base = 16;
        }

        // A lone dot is not a number; let the operator scanner have it.
        if self.cursor.current() == b'.' && Self::scan_digit(self.cursor.byte_at(1), 10).is_none() {
            return Ok(());
        }

        let mut whole = 0u64;
        if !(self.cursor.current() == b'.' && base == 10) {
            whole = self.scan_digit_seq(base, false)?.0;
        }

        let mut is_real = false;
        let mut frac = 0u64;
        let mut frac_len = 0u32;
        let mut expon = 0u64;
        let mut exp_negative = false;

        if base == 10 {
            if self.cursor.advance_if(b'.') {
                is_real = true;
                if Self::scan_digit(self.cursor.current(), 10).is_some() {
                    (frac, frac_len) = self.scan_digit_seq(10, true)?;
                }
            }
            if self.cursor.advance_if(b'e') || self.cursor.advance_if(b'E') {
                is_real = true;
                if self.cursor.advance_if(b'-') {
                    exp_negative = true;
                } else {
                    self.cursor.advance_if(b'+');
                }
                expon = self.scan_digit_seq(10, false)?.0;
            }
        }

        if is_real {
            let mut val = whole as f64 + frac as f64 / 10f64.powi(frac_len as i32);
            if exp_negative {
                val /= 10f64.powi(expon as i32);
            } else {
                val *= 10f64.powi(expon as i32);
            }
            if !val.is_finite() {
                return Err(self.error("Number is too large"));
            }
            self.tok.kind = Tok::RealNumber;
            self.tok.real_val = val;
        } else {
            self.tok.kind = Tok::IntNumber;
            self.tok.uint_val = whole;
        }
        Ok(())
    }

    /// Decodes one (possibly escaped) character. The cursor must stand on
    /// the character itself; it is consumed entirely. Returns the decoded
    /// byte and whether an escape was used.
    fn scan_esc_char(&mut self) -> CompileResult<(u8, bool)> {
        let ch = self.cursor.advance();
        if ch != b'\\' {
            return Ok((ch, false));
        }
        let esc = self.cursor.advance();
        let decoded = match esc {
            b'0' => 0,
            b'a' => 0x07,
            b'b' => 0x08,
            b'f' => 0x0c,
            b'n' => b'\n',
            b'r' => b'\r',
            b't' => b'\t',
            b'v' => 0x0b,
            b'x' => {
                let mut hex: u32 = 0;
                let mut digits = 0;
                while let Some(d) = Self::scan_digit(self.cursor.current(), 16) {
                    hex = hex.saturating_mul(16).saturating_add(d as u32);
                    digits += 1;
                    self.cursor.advance();
                }
                if digits == 0 || hex > 0xff {
                    return Err(self.error("Illegal character code"));
                }
                hex as u8
            }
            other => other,
        };
        Ok((decoded, true))
    }

    fn scan_char_literal(&mut self) -> CompileResult<()> {
        self.cursor.advance(); // opening quote
        let (ch, _) = self.scan_esc_char()?;
        if self.cursor.advance() != b'\'' {
            return Err(self.error("Invalid character literal"));
        }
        self.tok.kind = Tok::CharLiteral;
        self.tok.uint_val = ch as u64;
        Ok(())
    }

    /// Scans a string body into `sink` and returns the decoded length. With
    /// `sink` absent this is the size-prediction pass, so the real pass can
    /// reserve the exact buffer once.
    fn scan_str_body(&mut self, mut sink: Option<&mut String>) -> CompileResult<usize> {
        let multi_line = self.cursor.advance() == b'`';
        let mut size = 0usize;
        loop {
            match self.cursor.current() {
                0 => return Err(self.error("Unterminated string")),
                b'`' if multi_line => {
                    self.cursor.advance();
                    break;
                }
                b'"' if !multi_line => {
                    self.cursor.advance();
                    break;
                }
                b'\r' if multi_line => {
                    self.cursor.advance();
                }
                b'\n' if !multi_line => return Err(self.error("Unterminated string")),
                b'\\' if !multi_line => {
                    let (ch, _) = self.scan_esc_char()?;
                    if let Some(s) = sink.as_mut() {
                        s.push(ch as char);
                    }
                    size += 1;
                }
                other => {
                    self.cursor.advance();
                    if let Some(s) = sink.as_mut() {
                        s.push(other as char);
                    }
                    size += 1;
                }
            }
        }
        Ok(size)
    }

    fn scan_str_literal(&mut self, interner: &mut Interner) -> CompileResult<()> {
        let mut lookahead = self.cursor.clone();
        std::mem::swap(&mut self.cursor, &mut lookahead);
        let size = self.scan_str_body(None)?;
        std::mem::swap(&mut self.cursor, &mut lookahead);

        let mut value = String::with_capacity(size);
        self.scan_str_body(Some(&mut value))?;

        self.tok.kind = Tok::StrLiteral;
        self.tok.str_val = interner.intern(&value);
        Ok(())
    }

    fn scan_operator(&mut self) -> CompileResult<()> {
        let ch = self.cursor.advance();
        self.tok.kind = match ch {
            b'+' => {
                if self.cursor.advance_if(b'=') {
                    Tok::PlusEq
                } else if self.cursor.advance_if(b'+') {
                    Tok::PlusPlus
                } else {
                    Tok::Plus
                }
            }
            b'-' => {
                if self.cursor.advance_if(b'=') {
                    Tok::MinusEq
                } else if self.cursor.advance_if(b'-') {
                    Tok::MinusMinus
                } else {
                    Tok::Minus
                }
            }
            b'*' => {
                if self.cursor.advance_if(b'=') {
                    Tok::MulEq
                } else {
                    Tok::Mul
                }
            }
            b'/' => {
                if self.cursor.advance_if(b'=') {
                    Tok::DivEq
                } else {
                    Tok::Div
                }
            }
            b'%' => {
                if self.cursor.advance_if(b'=') {
                    Tok::ModEq
                } else {
                    Tok::Mod
                }
            }
            b'&' => {
                if self.cursor.advance_if(b'=') {
                    Tok::AndEq
                } else if self.cursor.advance_if(b'&') {
                    Tok::AndAnd
                } else {
                    Tok::And
                }
            }
            b'|' => {
                if self.cursor.advance_if(b'=') {
                    Tok::OrEq
                } else if self.cursor.advance_if(b'|') {
                    Tok::OrOr
                } else {
                    Tok::Or
                }
            }
            b'~' => {
                if self.cursor.advance_if(b'=') {
                    Tok::XorEq
                } else {
                    Tok::Xor
                }
            }
            b'<' => {
                if self.cursor.advance_if(b'<') {
                    if self.cursor.advance_if(b'=') {
                        Tok::ShlEq
                    } else {
                        Tok::Shl
                    }
                } else if self.cursor.advance_if(b'=') {
                    Tok::LessEq
                } else {
                    Tok::Less
                }
            }
            b'>' => {
                if self.cursor.advance_if(b'>') {
                    if self.cursor.advance_if(b'=') {
                        Tok::ShrEq
                    } else {
                        Tok::Shr
                    }
                } else if self.cursor.advance_if(b'=') {
                    Tok::GreaterEq
                } else {
                    Tok::Greater
                }
            }
            b'=' => {
                if self.cursor.advance_if(b'=') {
                    Tok::EqEq
                } else {
                    Tok::Eq
                }
            }
            b'?' => Tok::Question,
            b'!' => {
                if self.cursor.advance_if(b'=') {
                    Tok::NotEq
                } else {
                    Tok::Not
                }
            }
            b'(' => Tok::LPar,
            b')' => Tok::RPar,
            b'[' => Tok::LBracket,
            b']' => Tok::RBracket,
            b'{' => Tok::LBrace,
            b'}' => Tok::RBrace,
            b'^' => Tok::Caret,
            b',' => Tok::Comma,
            b';' => Tok::Semicolon,
            b':' => {
                if self.cursor.advance_if(b'=') {
                    Tok::ColonEq
                } else if self.cursor.advance_if(b':') {
                    Tok::ColonColon
                } else {
                    Tok::Colon
                }
            }
            b'.' => {
                if self.cursor.advance_if(b'.') {
                    Tok::Ellipsis
                } else {
                    Tok::Period
                }
            }
            b'\n' => Tok::Eoln,
            _ => return Err(self.error("Unexpected character or end of file")),
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan_kinds(source: &str) -> Vec<Tok> {
        let mut interner = Interner::new();
        let mut lex = Lexer::new(Rc::from("test.vl"), Rc::from(source));
        let mut kinds = Vec::new();
        loop {
            lex.next(&mut interner).unwrap();
            kinds.push(lex.tok.kind);
            if lex.tok.kind == Tok::Eof {
                return kinds;
            }
        }
    }

    fn scan_one(source: &str) -> (Token, Interner) {
        let mut interner = Interner::new();
        let mut lex = Lexer::new(Rc::from("test.vl"), Rc::from(source));
        lex.next(&mut interner).unwrap();
        (lex.tok.clone(), interner)
    }

    fn scan_err(source: &str) -> String {
        let mut interner = Interner::new();
        let mut lex = Lexer::new(Rc::from("test.vl"), Rc::from(source));
        loop {
            match lex.next(&mut interner) {
                Ok(()) if lex.tok.kind == Tok::Eof => panic!("expected an error"),
                Ok(()) => {}
                Err(err) => return err.msg,
            }
        }
    }

    #[test]
    fn test_keywords_and_idents() {
        assert_eq!(
            scan_kinds("fn main"),
            vec![Tok::Fn, Tok::Ident, Tok::Eof]
        );
    }

    #[test]
    fn test_maximal_munch_operators() {
        assert_eq!(
            scan_kinds("<<= << <= < :: := .. ."),
            vec![
                Tok::ShlEq,
                Tok::Shl,
                Tok::LessEq,
                Tok::Less,
                Tok::ColonColon,
                Tok::ColonEq,
                Tok::Ellipsis,
                Tok::Period,
                Tok::Eof
            ]
        );
    }

    #[test]
    fn test_implicit_semicolon_after_statement_enders() {
        // ident, literal, ), ], }, ^, ++, --, break, continue, return, str
        for src in [
            "x\n", "42\n", "3.5\n", "'a'\n", "\"s\"\n", ")\n", "]\n", "}\n", "^\n", "++\n",
            "--\n", "break\n", "continue\n", "return\n", "str\n",
        ] {
            let kinds = scan_kinds(src);
            assert!(
                kinds.contains(&Tok::ImplicitSemicolon),
                "no implicit semicolon in {src:?}: {kinds:?}"
            );
        }
    }

    #[test]
    fn test_no_implicit_semicolon_after_operators() {
        for src in ["+\n", "(\n", "{\n", ",\n", "==\n", "if\n"] {
            let kinds = scan_kinds(src);
            assert!(
                !kinds.contains(&Tok::ImplicitSemicolon),
                "unexpected implicit semicolon in {src:?}: {kinds:?}"
            );
        }
    }

    #[test]
    fn test_blank_lines_are_skipped() {
        assert_eq!(scan_kinds("\n\n\n"), vec![Tok::Eof]);
    }

    #[test]
    fn test_decimal_number() {
        let (tok, _) = scan_one("1_234");
        assert_eq!(tok.kind, Tok::IntNumber);
        assert_eq!(tok.uint_val, 1234);
    }

    #[test]
    fn test_hex_number() {
        let (tok, _) = scan_one("0xFF_FF");
        assert_eq!(tok.kind, Tok::IntNumber);
        assert_eq!(tok.uint_val, 0xffff);
    }

    #[test]
    fn test_real_number() {
        let (tok, _) = scan_one("2.5e-3");
        assert_eq!(tok.kind, Tok::RealNumber);
        assert!((tok.real_val - 0.0025).abs() < 1e-12);
    }

    #[test]
    fn test_leading_dot_real() {
        let (tok, _) = scan_one(".5");
        assert_eq!(tok.kind, Tok::RealNumber);
        assert!((tok.real_val - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_int_overflow_is_error() {
        assert_eq!(scan_err("99999999999999999999"), "Number is too large");
    }

    #[test]
    fn test_fractional_overflow_truncates() {
        let (tok, _) = scan_one("1.99999999999999999999999");
        assert_eq!(tok.kind, Tok::RealNumber);
        assert!(tok.real_val < 2.0);
    }

    #[test]
    fn test_misplaced_underscore() {
        assert_eq!(scan_err("1_"), "_ must be placed between digits");
    }

    #[test]
    fn test_char_literal_escapes() {
        let (tok, _) = scan_one("'\\n'");
        assert_eq!(tok.kind, Tok::CharLiteral);
        assert_eq!(tok.uint_val, b'\n' as u64);

        let (tok, _) = scan_one("'\\x41'");
        assert_eq!(tok.uint_val, b'A' as u64);
    }

    #[test]
    fn test_bad_char_code() {
        assert_eq!(scan_err("'\\x1FF'"), "Illegal character code");
    }

    #[test]
    fn test_str_literal() {
        let (tok, interner) = scan_one("\"ab\\tcd\"");
        assert_eq!(tok.kind, Tok::StrLiteral);
        assert_eq!(interner.resolve(tok.str_val), "ab\tcd");
    }

    #[test]
    fn test_unterminated_str() {
        assert_eq!(scan_err("\"abc\ndef\""), "Unterminated string");
    }

    #[test]
    fn test_multiline_str_strips_cr() {
        let (tok, interner) = scan_one("`ab\r\ncd`");
        assert_eq!(interner.resolve(tok.str_val), "ab\ncd");
    }

    #[test]
    fn test_comments_are_skipped() {
        assert_eq!(
            scan_kinds("a // comment\n/* block\ncomment */ b"),
            vec![Tok::Ident, Tok::ImplicitSemicolon, Tok::Ident, Tok::Eof]
        );
    }

    #[test]
    fn test_token_positions() {
        let mut interner = Interner::new();
        let mut lex = Lexer::new(Rc::from("test.vl"), Rc::from("a\n  b"));
        lex.next(&mut interner).unwrap();
        assert_eq!((lex.tok.line, lex.tok.pos), (1, 1));
        lex.next(&mut interner).unwrap(); // implicit semicolon
        lex.next(&mut interner).unwrap();
        assert_eq!((lex.tok.line, lex.tok.pos), (2, 3));
    }

    #[test]
    fn test_eat_allows_missing_semicolon_before_closers() {
        let mut interner = Interner::new();
        let mut lex = Lexer::new(Rc::from("test.vl"), Rc::from("}"));
        lex.next(&mut interner).unwrap();
        assert!(lex.eat(Tok::Semicolon, &mut interner).is_ok());
        assert_eq!(lex.tok.kind, Tok::RBrace);
    }
}
