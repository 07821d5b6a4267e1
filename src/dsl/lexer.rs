//! Tokenizer for the query DSL (spec.md §6 grammar). A hand-rolled
//! single-pass scanner rather than the crate's older generic
//! parser-combinator (`parsec/`): the grammar is small and fixed, so a
//! direct recursive-descent parser over a flat token stream reads more
//! plainly than composing combinators. Byte offsets (not line/col pairs)
//! back `QueryParseError::position` since queries are short, single-line
//! strings in practice.

use crate::error::{Error, Result};

#[derive(Clone, Debug, PartialEq)]
pub enum TokKind {
    Ident(String),
    Str(String),
    Num(f64),
    Pipe,     // |
    Gt,       // >
    LBrace,   // {
    RBrace,   // }
    Semi,     // ;
    LParen,   // (
    RParen,   // )
    Comma,    // ,
    EqEq,     // ==
    NotEq,    // !=
    Assign,   // =
    Star,     // *
    PlusTag,  // +tag
    MinusTag, // -tag
    Eof,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Token {
    pub kind: TokKind,
    pub pos: usize,
}

pub struct Lexer<'a> {
    src: &'a str,
    bytes: &'a [u8],
    cursor: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(src: &'a str) -> Lexer<'a> {
        Lexer {
            src,
            bytes: src.as_bytes(),
            cursor: 0,
        }
    }

    fn peek_byte(&self) -> Option<u8> {
        self.bytes.get(self.cursor).copied()
    }

    fn peek_at(&self, off: usize) -> Option<u8> {
        self.bytes.get(self.cursor + off).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let b = self.peek_byte();
        if b.is_some() {
            self.cursor += 1;
        }
        b
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek_byte(), Some(b) if b.is_ascii_whitespace()) {
            self.cursor += 1;
        }
    }

    fn err(&self, reason: impl Into<String>, suggestion: impl Into<String>) -> Error {
        Error::QueryParseError {
            reason: reason.into(),
            position: self.cursor,
            suggestion: suggestion.into(),
        }
    }

    fn read_ident(&mut self) -> String {
        let start = self.cursor;
        while matches!(self.peek_byte(), Some(b) if b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        {
            self.cursor += 1;
        }
        self.src[start..self.cursor].to_string()
    }

    fn read_number(&mut self) -> Result<f64> {
        let start = self.cursor;
        if matches!(self.peek_byte(), Some(b'+') | Some(b'-')) {
            self.cursor += 1;
        }
        let mut saw_digit = false;
        while matches!(self.peek_byte(), Some(b) if b.is_ascii_digit()) {
            self.cursor += 1;
            saw_digit = true;
        }
        if self.peek_byte() == Some(b'.') {
            self.cursor += 1;
            while matches!(self.peek_byte(), Some(b) if b.is_ascii_digit()) {
                self.cursor += 1;
                saw_digit = true;
            }
        }
        if !saw_digit {
            return Err(self.err("malformed number literal", "expected digits after sign"));
        }
        self.src[start..self.cursor]
            .parse()
            .map_err(|_| self.err("malformed number literal", "expected a decimal number"))
    }

    fn read_string(&mut self) -> Result<String> {
        self.cursor += 1; // opening quote
        let mut out = String::new();
        loop {
            match self.bump() {
                None => return Err(self.err("unterminated string literal", "add a closing \"")),
                Some(b'"') => return Ok(out),
                Some(b'\\') => match self.bump() {
                    Some(b'n') => out.push('\n'),
                    Some(b't') => out.push('\t'),
                    Some(b'"') => out.push('"'),
                    Some(b'\\') => out.push('\\'),
                    Some(c) => out.push(c as char),
                    None => return Err(self.err("unterminated escape sequence", "add a closing \"")),
                },
                Some(c) if c.is_ascii() => out.push(c as char),
                Some(_) => {
                    // multi-byte UTF-8: fall back to char-based decode of the rest.
                    let rest = &self.src[self.cursor - 1..];
                    let ch = rest.chars().next().unwrap();
                    out.push(ch);
                    self.cursor += ch.len_utf8() - 1;
                }
            }
        }
    }

    pub fn next_token(&mut self) -> Result<Token> {
        self.skip_ws();
        let pos = self.cursor;
        let kind = match self.peek_byte() {
            None => TokKind::Eof,
            Some(b'|') => {
                self.cursor += 1;
                TokKind::Pipe
            }
            Some(b'>') => {
                self.cursor += 1;
                TokKind::Gt
            }
            Some(b'{') => {
                self.cursor += 1;
                TokKind::LBrace
            }
            Some(b'}') => {
                self.cursor += 1;
                TokKind::RBrace
            }
            Some(b';') => {
                self.cursor += 1;
                TokKind::Semi
            }
            Some(b'(') => {
                self.cursor += 1;
                TokKind::LParen
            }
            Some(b')') => {
                self.cursor += 1;
                TokKind::RParen
            }
            Some(b',') => {
                self.cursor += 1;
                TokKind::Comma
            }
            Some(b'*') => {
                self.cursor += 1;
                TokKind::Star
            }
            Some(b'"') => TokKind::Str(self.read_string()?),
            Some(b'=') => {
                self.cursor += 1;
                if self.peek_byte() == Some(b'=') {
                    self.cursor += 1;
                    TokKind::EqEq
                } else {
                    TokKind::Assign
                }
            }
            Some(b'!') => {
                self.cursor += 1;
                if self.peek_byte() == Some(b'=') {
                    self.cursor += 1;
                    TokKind::NotEq
                } else {
                    return Err(self.err("unexpected '!'", "did you mean '!='?"));
                }
            }
            Some(b'+') if matches!(self.peek_at(1), Some(b) if b.is_ascii_alphabetic()) => {
                self.cursor += 1;
                let word = self.read_ident();
                if word == "tag" {
                    TokKind::PlusTag
                } else {
                    return Err(self.err("unexpected '+'", "only '+tag(...)' uses a leading '+'"));
                }
            }
            Some(b'-') if matches!(self.peek_at(1), Some(b) if b.is_ascii_alphabetic()) => {
                self.cursor += 1;
                let word = self.read_ident();
                if word == "tag" {
                    TokKind::MinusTag
                } else {
                    return Err(self.err("unexpected '-'", "only '-tag(...)' uses a leading '-'"));
                }
            }
            Some(b) if b.is_ascii_digit() || b == b'-' || b == b'+' => TokKind::Num(self.read_number()?),
            Some(b) if b.is_ascii_lowercase() => TokKind::Ident(self.read_ident()),
            Some(b) => {
                return Err(self.err(
                    format!("unexpected character {:?}", b as char),
                    "identifiers must start with a lowercase letter",
                ))
            }
        };
        Ok(Token { kind, pos })
    }

    pub fn tokenize(mut self) -> Result<Vec<Token>> {
        let mut out = Vec::new();
        loop {
            let tok = self.next_token()?;
            let done = tok.kind == TokKind::Eof;
            out.push(tok);
            if done {
                return Ok(out);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokKind> {
        Lexer::new(src)
            .tokenize()
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn test_tokenize_simple_pipeline() {
        let got = kinds(r#"| person == "ada" > language"#);
        assert_eq!(
            got,
            vec![
                TokKind::Pipe,
                TokKind::Ident("person".into()),
                TokKind::EqEq,
                TokKind::Str("ada".into()),
                TokKind::Gt,
                TokKind::Ident("language".into()),
                TokKind::Eof,
            ]
        );
    }

    #[test]
    fn test_tokenize_overlay_block() {
        let got = kinds(r#"with { +tag(rel,"x") as r; link(r,r) }"#);
        assert!(got.contains(&TokKind::PlusTag));
        assert!(got.contains(&TokKind::Ident("link".into())));
    }

    #[test]
    fn test_unterminated_string_errors() {
        assert!(Lexer::new(r#"| person == "ada"#).tokenize().is_err());
    }

    #[test]
    fn test_number_forms() {
        let got = kinds("-3.5 1 +2");
        assert_eq!(got[0], TokKind::Num(-3.5));
        assert_eq!(got[1], TokKind::Num(1.0));
        assert_eq!(got[2], TokKind::Num(2.0));
    }
}
