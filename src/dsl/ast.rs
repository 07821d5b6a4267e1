//! AST produced by `dsl::parser`, consumed by `plan.rs`. Mirrors the
//! grammar in spec.md §6 directly: a `Query` is an optional overlay block
//! followed by a pipeline of `Step`s.

use crate::types::Ttype;

/// An expression: a literal, a bound name (resolved at parse time via the
/// `let` prelude, never left dangling in the returned AST), or a nested
/// function call.
#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Str(String),
    Num(f64),
    /// A bare `NAME` argument, e.g. the key-function name in
    /// `match_first(keyfunc)`. Distinct from `Str` so `exec.rs` can tell a
    /// quoted literal from an identifier reference.
    Name(String),
    FunCall(FunCall),
}

#[derive(Clone, Debug, PartialEq)]
pub struct FunCall {
    pub name: String,
    pub args: Vec<Expr>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Compare {
    Eq(String),
    Ne(String),
}

/// A predicate: either a `Compare` against the tag's value, or a builtin
/// function call evaluated by `exec.rs`.
#[derive(Clone, Debug, PartialEq)]
pub enum Predicate {
    Compare(Compare),
    FunCall(FunCall),
}

/// Boolean tree of predicates: `disjunction := conjunction { 'or' conjunction }`.
#[derive(Clone, Debug, PartialEq)]
pub struct ValueFilter {
    /// Outer list is OR'd together; each inner list is AND'd together.
    pub disjuncts: Vec<Vec<Predicate>>,
}

impl ValueFilter {
    pub fn single(p: Predicate) -> ValueFilter {
        ValueFilter {
            disjuncts: vec![vec![p]],
        }
    }
}

/// One stage of the `|  a > b > c` pipeline.
#[derive(Clone, Debug, PartialEq)]
pub enum Step {
    /// `*` — keep every neighbor, no type restriction.
    Any,
    /// `IDENT [value_filter]`.
    TypeFilter {
        ttype: Ttype,
        value_filter: Option<ValueFilter>,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub enum OverlayStmt {
    AddTag {
        ttype: Ttype,
        val: String,
        bind: Option<String>,
    },
    RemTag {
        ttype: Ttype,
        val: String,
    },
    Link(OverlayRef, OverlayRef),
    Unlink(OverlayRef, OverlayRef),
}

/// `ref := NAME | '(' IDENT ',' STRING ')'`. `Name` is resolved against
/// this same overlay block's own `as NAME` bindings at plan time.
#[derive(Clone, Debug, PartialEq)]
pub enum OverlayRef {
    Name(String),
    Identity(Ttype, String),
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct OverlayBlock {
    pub stmts: Vec<OverlayStmt>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Query {
    pub overlay: Option<OverlayBlock>,
    pub steps: Vec<Step>,
}
