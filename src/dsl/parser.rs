//! Recursive-descent parser over the `lexer` token stream, producing the
//! `ast::Query` consumed by `plan.rs`. Implements spec.md §6's grammar plus
//! the `let NAME = ( query )` prelude, inlined at parse time.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::types::Ttype;

use super::ast::*;
use super::lexer::{Lexer, TokKind, Token};

/// Matches the DSL grammar's own `IDENT` length bound. The write path's
/// configured `max_ttype_bytes` is enforced separately in `tx.rs`; this is
/// only a parse-time sanity cap on type-filter tokens.
const IDENT_PARSE_MAX_BYTES: usize = 64;

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos]
    }

    fn peek_kind(&self) -> &TokKind {
        &self.peek().kind
    }

    fn peek2_kind(&self) -> &TokKind {
        &self.tokens[(self.pos + 1).min(self.tokens.len() - 1)].kind
    }

    fn bump(&mut self) -> Token {
        let tok = self.tokens[self.pos].clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    fn peek_is_ident(&self, word: &str) -> bool {
        matches!(self.peek_kind(), TokKind::Ident(s) if s == word)
    }

    fn err(&self, reason: impl Into<String>, suggestion: impl Into<String>) -> Error {
        Error::QueryParseError {
            reason: reason.into(),
            position: self.peek().pos,
            suggestion: suggestion.into(),
        }
    }

    fn expect_kind(&mut self, kind: TokKind, what: &str) -> Result<Token> {
        if *self.peek_kind() == kind {
            Ok(self.bump())
        } else {
            Err(self.err(format!("expected {}", what), format!("insert {}", what)))
        }
    }

    fn expect_plain_ident(&mut self) -> Result<String> {
        match self.peek_kind().clone() {
            TokKind::Ident(s) => {
                self.bump();
                Ok(s)
            }
            _ => Err(self.err("expected an identifier", "use a lowercase name")),
        }
    }

    fn expect_ttype(&mut self) -> Result<Ttype> {
        let name = self.expect_plain_ident()?;
        Ttype::parse(&name, IDENT_PARSE_MAX_BYTES)
            .map_err(|_| self.err(format!("invalid ttype {:?}", name), "ttype must match ^[a-z][a-z0-9-]*$"))
    }

    fn expect_str(&mut self) -> Result<String> {
        match self.peek_kind().clone() {
            TokKind::Str(s) => {
                self.bump();
                Ok(s)
            }
            _ => Err(self.err("expected a string literal", "wrap the value in double quotes")),
        }
    }

    fn parse_ref(&mut self) -> Result<OverlayRef> {
        match self.peek_kind().clone() {
            TokKind::LParen => {
                self.bump();
                let ttype = self.expect_ttype()?;
                self.expect_kind(TokKind::Comma, "','")?;
                let val = self.expect_str()?;
                self.expect_kind(TokKind::RParen, "')'")?;
                Ok(OverlayRef::Identity(ttype, val))
            }
            TokKind::Ident(name) => {
                self.bump();
                Ok(OverlayRef::Name(name))
            }
            _ => Err(self.err("expected a tag reference", "use NAME or (ttype, \"val\")")),
        }
    }

    fn parse_overlay_stmt(&mut self) -> Result<OverlayStmt> {
        match self.peek_kind().clone() {
            TokKind::PlusTag => {
                self.bump();
                self.expect_kind(TokKind::LParen, "'('")?;
                let ttype = self.expect_ttype()?;
                self.expect_kind(TokKind::Comma, "','")?;
                let val = self.expect_str()?;
                self.expect_kind(TokKind::RParen, "')'")?;
                let bind = if self.peek_is_ident("as") {
                    self.bump();
                    Some(self.expect_plain_ident()?)
                } else {
                    None
                };
                Ok(OverlayStmt::AddTag { ttype, val, bind })
            }
            TokKind::MinusTag => {
                self.bump();
                self.expect_kind(TokKind::LParen, "'('")?;
                let ttype = self.expect_ttype()?;
                self.expect_kind(TokKind::Comma, "','")?;
                let val = self.expect_str()?;
                self.expect_kind(TokKind::RParen, "')'")?;
                Ok(OverlayStmt::RemTag { ttype, val })
            }
            TokKind::Ident(name) if name == "link" => {
                self.bump();
                self.expect_kind(TokKind::LParen, "'('")?;
                let a = self.parse_ref()?;
                self.expect_kind(TokKind::Comma, "','")?;
                let b = self.parse_ref()?;
                self.expect_kind(TokKind::RParen, "')'")?;
                Ok(OverlayStmt::Link(a, b))
            }
            TokKind::Ident(name) if name == "unlink" => {
                self.bump();
                self.expect_kind(TokKind::LParen, "'('")?;
                let a = self.parse_ref()?;
                self.expect_kind(TokKind::Comma, "','")?;
                let b = self.parse_ref()?;
                self.expect_kind(TokKind::RParen, "')'")?;
                Ok(OverlayStmt::Unlink(a, b))
            }
            _ => Err(self.err(
                "expected an overlay statement",
                "use +tag(...), -tag(...), link(...), or unlink(...)",
            )),
        }
    }

    fn parse_overlay_block(&mut self) -> Result<OverlayBlock> {
        self.expect_kind(TokKind::LBrace, "'{'")?;
        let mut stmts = Vec::new();
        if *self.peek_kind() != TokKind::RBrace {
            loop {
                stmts.push(self.parse_overlay_stmt()?);
                if *self.peek_kind() == TokKind::Semi {
                    self.bump();
                    if *self.peek_kind() == TokKind::RBrace {
                        break;
                    }
                    continue;
                }
                break;
            }
        }
        self.expect_kind(TokKind::RBrace, "'}'")?;
        Ok(OverlayBlock { stmts })
    }

    fn parse_expr(&mut self) -> Result<Expr> {
        match self.peek_kind().clone() {
            TokKind::Str(s) => {
                self.bump();
                Ok(Expr::Str(s))
            }
            TokKind::Num(n) => {
                self.bump();
                Ok(Expr::Num(n))
            }
            TokKind::Ident(name) => {
                if *self.peek2_kind() == TokKind::LParen {
                    Ok(Expr::FunCall(self.parse_funcall()?))
                } else {
                    self.bump();
                    Ok(Expr::Name(name))
                }
            }
            _ => Err(self.err("expected a value", "use a string, number, name, or function call")),
        }
    }

    fn parse_funcall(&mut self) -> Result<FunCall> {
        let name = self.expect_plain_ident()?;
        self.expect_kind(TokKind::LParen, "'('")?;
        let mut args = Vec::new();
        if *self.peek_kind() != TokKind::RParen {
            args.push(self.parse_expr()?);
            while *self.peek_kind() == TokKind::Comma {
                self.bump();
                args.push(self.parse_expr()?);
            }
        }
        self.expect_kind(TokKind::RParen, "')'")?;
        Ok(FunCall { name, args })
    }

    fn parse_predicate(&mut self) -> Result<Predicate> {
        match self.peek_kind().clone() {
            TokKind::EqEq => {
                self.bump();
                Ok(Predicate::Compare(Compare::Eq(self.expect_str()?)))
            }
            TokKind::NotEq => {
                self.bump();
                Ok(Predicate::Compare(Compare::Ne(self.expect_str()?)))
            }
            TokKind::Ident(_) => Ok(Predicate::FunCall(self.parse_funcall()?)),
            _ => Err(self.err("expected a predicate", "use ==, !=, or a function call")),
        }
    }

    fn parse_conjunction(&mut self) -> Result<Vec<Predicate>> {
        let mut preds = vec![self.parse_predicate()?];
        while self.peek_is_ident("and") {
            self.bump();
            preds.push(self.parse_predicate()?);
        }
        Ok(preds)
    }

    fn parse_disjunction(&mut self) -> Result<ValueFilter> {
        let mut disjuncts = vec![self.parse_conjunction()?];
        while self.peek_is_ident("or") {
            self.bump();
            disjuncts.push(self.parse_conjunction()?);
        }
        Ok(ValueFilter { disjuncts })
    }

    fn try_parse_value_filter(&mut self) -> Result<Option<ValueFilter>> {
        match self.peek_kind().clone() {
            TokKind::EqEq => {
                self.bump();
                Ok(Some(ValueFilter::single(Predicate::Compare(Compare::Eq(
                    self.expect_str()?,
                )))))
            }
            TokKind::NotEq => {
                self.bump();
                Ok(Some(ValueFilter::single(Predicate::Compare(Compare::Ne(
                    self.expect_str()?,
                )))))
            }
            TokKind::LParen => {
                self.bump();
                let vf = self.parse_disjunction()?;
                self.expect_kind(TokKind::RParen, "')'")?;
                Ok(Some(vf))
            }
            TokKind::Ident(_) if *self.peek2_kind() == TokKind::LParen => Ok(Some(
                ValueFilter::single(Predicate::FunCall(self.parse_funcall()?)),
            )),
            _ => Ok(None),
        }
    }

    fn parse_one_step(&mut self, lets: &HashMap<String, Vec<Step>>) -> Result<Vec<Step>> {
        match self.peek_kind().clone() {
            TokKind::Star => {
                self.bump();
                Ok(vec![Step::Any])
            }
            TokKind::Ident(name) => {
                if let Some(bound) = lets.get(&name) {
                    self.bump();
                    Ok(bound.clone())
                } else {
                    let ttype = self.expect_ttype()?;
                    let value_filter = self.try_parse_value_filter()?;
                    Ok(vec![Step::TypeFilter { ttype, value_filter }])
                }
            }
            _ => Err(self.err(
                "expected a step",
                "use a ttype name, '*', or a name bound by 'let'",
            )),
        }
    }

    fn parse_steps(&mut self, lets: &HashMap<String, Vec<Step>>) -> Result<Vec<Step>> {
        let mut out = self.parse_one_step(lets)?;
        while *self.peek_kind() == TokKind::Gt {
            self.bump();
            out.extend(self.parse_one_step(lets)?);
        }
        Ok(out)
    }

    fn parse_query_body(&mut self, lets: &HashMap<String, Vec<Step>>) -> Result<Query> {
        let overlay = if self.peek_is_ident("with") {
            self.bump();
            Some(self.parse_overlay_block()?)
        } else {
            None
        };
        self.expect_kind(TokKind::Pipe, "'|'")?;
        let steps = self.parse_steps(lets)?;
        Ok(Query { overlay, steps })
    }
}

/// Parse a full query string, including any `let` prelude.
pub fn parse(src: &str) -> Result<Query> {
    let tokens = Lexer::new(src).tokenize()?;
    let mut p = Parser { tokens, pos: 0 };

    let mut lets: HashMap<String, Vec<Step>> = HashMap::new();
    while p.peek_is_ident("let") {
        p.bump();
        let name = p.expect_plain_ident()?;
        p.expect_kind(TokKind::Assign, "'='")?;
        p.expect_kind(TokKind::LParen, "'('")?;
        let sub = p.parse_query_body(&HashMap::new())?;
        if sub.overlay.is_some() {
            return Err(p.err(
                "let-bound queries cannot declare an overlay block",
                "move 'with { ... }' into the main query",
            ));
        }
        p.expect_kind(TokKind::RParen, "')'")?;
        lets.insert(name, sub.steps);
    }

    let query = p.parse_query_body(&lets)?;
    p.expect_kind(TokKind::Eof, "end of query")?;
    Ok(query)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_scenario_1_pipeline() {
        let q = parse(r#"| person == "ada" > rel == "speaks" > language"#).unwrap();
        assert_eq!(q.steps.len(), 3);
        assert!(q.overlay.is_none());
        match &q.steps[0] {
            Step::TypeFilter { ttype, value_filter } => {
                assert_eq!(ttype.as_str(), "person");
                assert!(matches!(
                    value_filter,
                    Some(ValueFilter { disjuncts }) if disjuncts == &vec![vec![Predicate::Compare(Compare::Eq("ada".into()))]]
                ));
            }
            _ => panic!("expected TypeFilter"),
        }
    }

    #[test]
    fn test_parse_overlay_block_with_bind_and_link() {
        let q = parse(r#"with { +tag(rel,"excludes-provider") as r; link(r, r) } | person"#);
        // self-link via the bound name is a plan/exec-time semantic error,
        // not a parse error: the parser doesn't resolve `as NAME` bindings.
        let q = q.unwrap();
        let overlay = q.overlay.unwrap();
        assert_eq!(overlay.stmts.len(), 2);
        assert!(matches!(&overlay.stmts[0], OverlayStmt::AddTag { bind: Some(n), .. } if n == "r"));
    }

    #[test]
    fn test_parse_rejects_let_with_overlay() {
        let err = parse(r#"let x = ( with { +tag(a,"b") } | a ) | x"#);
        assert!(err.is_err());
    }

    #[test]
    fn test_let_prelude_inlines_steps() {
        let q = parse(r#"let py = ( | language == "python" ) | person > py"#).unwrap();
        assert_eq!(q.steps.len(), 2);
        assert!(matches!(&q.steps[1], Step::TypeFilter { ttype, .. } if ttype.as_str() == "language"));
    }

    #[test]
    fn test_group_conjunction() {
        let q = parse(r#"| language (startswith("py") and regex("^p.*"))"#).unwrap();
        match &q.steps[0] {
            Step::TypeFilter { value_filter: Some(vf), .. } => {
                assert_eq!(vf.disjuncts.len(), 1);
                assert_eq!(vf.disjuncts[0].len(), 2);
            }
            other => panic!("expected a value filter, got {:?}", other),
        }
    }

    #[test]
    fn test_group_disjunction() {
        let q = parse(r#"| language (startswith("py") or startswith("go"))"#).unwrap();
        match &q.steps[0] {
            Step::TypeFilter { value_filter: Some(vf), .. } => {
                assert_eq!(vf.disjuncts.len(), 2);
            }
            other => panic!("expected a value filter, got {:?}", other),
        }
    }

    #[test]
    fn test_wildcard_step() {
        let q = parse("| person > *").unwrap();
        assert_eq!(q.steps, vec![
            Step::TypeFilter { ttype: Ttype::parse("person", 64).unwrap(), value_filter: None },
            Step::Any,
        ]);
    }

    #[test]
    fn test_parse_error_carries_position() {
        let err = parse("| 123abc").unwrap_err();
        match err {
            Error::QueryParseError { position, .. } => assert_eq!(position, 2),
            other => panic!("expected QueryParseError, got {:?}", other),
        }
    }
}
