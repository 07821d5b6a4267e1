//! Component F — plan evaluation over a `View`, builtin predicate
//! functions, and the query state machine (spec.md §4.F, §5).

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use rayon::prelude::*;

use crate::dsl::ast::{Compare, Expr, FunCall, Predicate, ValueFilter};
use crate::error::{Error, Result};
use crate::plan::{MemoCache, Op};
use crate::tx::View;
use crate::types::Tref;

/// Above this many candidates, `Intersect`/`Union`/`Difference` partition
/// across a `rayon` thread pool instead of scanning sequentially.
pub const DEFAULT_PARALLEL_THRESHOLD: usize = 1024;

/// Cooperative cancellation: checked between operators, not mid-operator,
/// so a cancelled query still unwinds cleanly rather than leaving a
/// half-applied intermediate set.
#[derive(Default)]
pub struct Cancel(AtomicBool);

impl Cancel {
    pub fn new() -> Cancel {
        Cancel(AtomicBool::new(false))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Lifecycle of one query, surfaced for observability (spec.md §5).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum QueryState {
    Parsing = 0,
    Planning = 1,
    Executing = 2,
    Done = 3,
    Failed = 4,
}

pub struct QueryStateCell(AtomicU8);

impl QueryStateCell {
    pub fn new() -> QueryStateCell {
        QueryStateCell(AtomicU8::new(QueryState::Parsing as u8))
    }

    pub fn set(&self, state: QueryState) {
        self.0.store(state as u8, Ordering::Release);
    }

    pub fn get(&self) -> QueryState {
        match self.0.load(Ordering::Acquire) {
            0 => QueryState::Parsing,
            1 => QueryState::Planning,
            2 => QueryState::Executing,
            3 => QueryState::Done,
            _ => QueryState::Failed,
        }
    }
}

impl Default for QueryStateCell {
    fn default() -> QueryStateCell {
        QueryStateCell::new()
    }
}

/// A scalar produced by evaluating an `Expr` against one tag's value.
#[derive(Clone, Debug, PartialEq)]
enum Value {
    Str(String),
    Num(f64),
}

impl Value {
    fn as_num(&self) -> f64 {
        match self {
            Value::Num(n) => *n,
            Value::Str(s) => s.trim().parse().unwrap_or(f64::NAN),
        }
    }

    fn as_str(&self) -> String {
        match self {
            Value::Str(s) => s.clone(),
            Value::Num(n) => n.to_string(),
        }
    }
}

fn eval_expr(expr: &Expr, tag_val: &str) -> Result<Value> {
    match expr {
        Expr::Str(s) => Ok(Value::Str(s.clone())),
        Expr::Num(n) => Ok(Value::Num(*n)),
        Expr::Name(n) if n == "val" => Ok(Value::Str(tag_val.to_string())),
        Expr::Name(n) => Ok(Value::Str(n.clone())),
        Expr::FunCall(fc) => eval_funcall_value(fc, tag_val),
    }
}

fn arg_str(fc: &FunCall, idx: usize, tag_val: &str) -> Result<String> {
    match fc.args.get(idx) {
        Some(e) => Ok(eval_expr(e, tag_val)?.as_str()),
        None => Ok(tag_val.to_string()),
    }
}

/// `num(s)`'s grammar (spec.md §4.F): `[+-]?\d+(\.\d+)?`. Deliberately
/// narrower than `f64::from_str` — that also accepts scientific notation
/// (`"1e10"`) and `"inf"`/`"nan"`, which `num` must treat as non-numeric.
fn parse_num(s: &str) -> Option<f64> {
    let b = s.as_bytes();
    let mut i = 0;
    if matches!(b.first(), Some(b'+') | Some(b'-')) {
        i += 1;
    }
    let int_start = i;
    while matches!(b.get(i), Some(c) if c.is_ascii_digit()) {
        i += 1;
    }
    if i == int_start {
        return None;
    }
    if b.get(i) == Some(&b'.') {
        i += 1;
        let frac_start = i;
        while matches!(b.get(i), Some(c) if c.is_ascii_digit()) {
            i += 1;
        }
        if i == frac_start {
            return None;
        }
    }
    if i != b.len() {
        return None;
    }
    s.parse().ok()
}

fn eval_funcall_value(fc: &FunCall, tag_val: &str) -> Result<Value> {
    match fc.name.as_str() {
        "num" => {
            let s = arg_str(fc, 0, tag_val)?;
            Ok(Value::Num(parse_num(&s).unwrap_or(f64::NAN)))
        }
        "len" => Ok(Value::Num(arg_str(fc, 0, tag_val)?.chars().count() as f64)),
        "lower" => Ok(Value::Str(arg_str(fc, 0, tag_val)?.to_lowercase())),
        "upper" => Ok(Value::Str(arg_str(fc, 0, tag_val)?.to_uppercase())),
        _ => Ok(Value::Str(if eval_bool(fc, tag_val)? { "true" } else { "false" }.to_string())),
    }
}

/// Evaluate a builtin funcall as a boolean predicate against one tag value.
fn eval_bool(fc: &FunCall, tag_val: &str) -> Result<bool> {
    match fc.name.as_str() {
        "startswith" => Ok(tag_val.starts_with(&arg_str(fc, 0, tag_val)?)),
        "regex" => {
            let pattern = arg_str(fc, 0, tag_val)?;
            let re = regex::Regex::new(&pattern).map_err(|e| Error::QueryParseError {
                reason: format!("invalid regex: {}", e),
                position: 0,
                suggestion: "fix the regex pattern".into(),
            })?;
            Ok(re.is_match(tag_val))
        }
        "num" => Ok(parse_num(&arg_str(fc, 0, tag_val)?).is_some()),
        "all" | "any" => Ok(true),
        "eq" => Ok(eval_expr(&fc.args[0], tag_val)?.as_str() == eval_expr(&fc.args[1], tag_val)?.as_str()),
        "ne" => Ok(eval_expr(&fc.args[0], tag_val)?.as_str() != eval_expr(&fc.args[1], tag_val)?.as_str()),
        "gt" | "gte" | "lt" | "lte" => {
            let a = eval_expr(&fc.args[0], tag_val)?.as_num();
            let b = eval_expr(&fc.args[1], tag_val)?.as_num();
            Ok(match fc.name.as_str() {
                "gt" => a > b,
                "gte" => a >= b,
                "lt" => a < b,
                "lte" => a <= b,
                _ => unreachable!(),
            })
        }
        "match" => match fc.args.first() {
            Some(Expr::FunCall(inner)) => eval_bool(inner, tag_val),
            _ => Err(Error::ValidationError("match(f) requires a function argument".into())),
        },
        "exclude" => match fc.args.first() {
            Some(Expr::FunCall(inner)) => Ok(!eval_bool(inner, tag_val)?),
            _ => Err(Error::ValidationError("exclude(f) requires a function argument".into())),
        },
        other => Err(Error::QueryParseError {
            reason: format!("unknown function {:?}", other),
            position: 0,
            suggestion: "see plan::BUILTIN_FUNCS".into(),
        }),
    }
}

fn eval_predicate(pred: &Predicate, tag_val: &str) -> Result<bool> {
    match pred {
        Predicate::Compare(Compare::Eq(v)) => Ok(tag_val == v),
        Predicate::Compare(Compare::Ne(v)) => Ok(tag_val != v),
        Predicate::FunCall(fc) => eval_bool(fc, tag_val),
    }
}

fn eval_value_filter(vf: &ValueFilter, tag_val: &str) -> Result<bool> {
    for conj in &vf.disjuncts {
        let mut all_true = true;
        for pred in conj {
            if !eval_predicate(pred, tag_val)? {
                all_true = false;
                break;
            }
        }
        if all_true {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Runtime context threaded through plan evaluation.
pub struct ExecCtx<'a> {
    pub view: &'a View<'a>,
    pub memo: Option<&'a MemoCache>,
    pub cancel: Option<&'a Cancel>,
    pub parallel_threshold: usize,
}

impl<'a> ExecCtx<'a> {
    pub fn new(view: &'a View<'a>) -> ExecCtx<'a> {
        ExecCtx {
            view,
            memo: None,
            cancel: None,
            parallel_threshold: DEFAULT_PARALLEL_THRESHOLD,
        }
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.map(|c| c.is_cancelled()).unwrap_or(false) {
            return Err(Error::Cancelled);
        }
        Ok(())
    }
}

fn sorted_unique(mut v: Vec<Tref>) -> Vec<Tref> {
    v.sort_unstable();
    v.dedup();
    v
}

fn set_intersect(a: &[Tref], b: &[Tref], ctx: &ExecCtx) -> Vec<Tref> {
    if a.len() + b.len() > ctx.parallel_threshold {
        let bset: std::collections::HashSet<Tref> = b.iter().copied().collect();
        return a.par_iter().copied().filter(|t| bset.contains(t)).collect();
    }
    let bset: std::collections::HashSet<Tref> = b.iter().copied().collect();
    a.iter().copied().filter(|t| bset.contains(t)).collect()
}

fn set_union(a: &[Tref], b: &[Tref]) -> Vec<Tref> {
    sorted_unique(a.iter().chain(b.iter()).copied().collect())
}

fn set_difference(a: &[Tref], b: &[Tref]) -> Vec<Tref> {
    let bset: std::collections::HashSet<Tref> = b.iter().copied().collect();
    a.iter().copied().filter(|t| !bset.contains(t)).collect()
}

fn eval(op: &Op, ctx: &ExecCtx) -> Result<Vec<Tref>> {
    ctx.check_cancelled()?;
    match op {
        Op::Empty => Ok(Vec::new()),
        Op::SourceAllOfType(t) => Ok(sorted_unique(ctx.view.all_of_type(t.as_str()))),
        Op::SourceByIdentity(t, v) => Ok(ctx.view.lookup_by_identity(t.as_str(), v).into_iter().collect()),
        Op::Traverse(inner) => {
            let bases = eval(inner, ctx)?;
            let neighbors: Vec<Tref> = if bases.len() > ctx.parallel_threshold {
                bases.par_iter().flat_map(|t| ctx.view.neighbors(*t)).collect()
            } else {
                bases.iter().flat_map(|t| ctx.view.neighbors(*t)).collect()
            };
            Ok(sorted_unique(neighbors))
        }
        Op::FilterType(inner, t) => {
            let bases = eval(inner, ctx)?;
            Ok(bases
                .into_iter()
                .filter(|tref| ctx.view.tag_identity(*tref).map(|(tt, _)| tt == t.as_str()).unwrap_or(false))
                .collect())
        }
        Op::FilterPredicate(inner, vf) => {
            let bases = eval(inner, ctx)?;
            let mut out = Vec::with_capacity(bases.len());
            for tref in bases {
                if let Some((_, val)) = ctx.view.tag_identity(tref) {
                    if eval_value_filter(vf, &val)? {
                        out.push(tref);
                    }
                }
            }
            Ok(out)
        }
        Op::Intersect(a, b) => {
            let a = eval(a, ctx)?;
            let b = eval(b, ctx)?;
            Ok(set_intersect(&a, &b, ctx))
        }
        Op::Union(a, b) => {
            let a = eval(a, ctx)?;
            let b = eval(b, ctx)?;
            Ok(set_union(&a, &b))
        }
        Op::Difference(a, b) => {
            let a = eval(a, ctx)?;
            let b = eval(b, ctx)?;
            Ok(set_difference(&a, &b))
        }
        Op::Top(inner, n, by) => {
            // `by=func` keeps the `n` largest-scoring tags (DESIGN.md's
            // resolution of spec.md §4.F's smallest/largest ambiguity);
            // the caller gets the smallest `n` via `Op::Difference` against
            // `top(total - n, by=func)` instead of a second keyword here.
            let mut bases = eval(inner, ctx)?;
            match by {
                None => bases.truncate(*n),
                Some(fc) => {
                    let mut scored: Vec<(f64, Tref)> = bases
                        .into_iter()
                        .map(|t| {
                            let val = ctx.view.tag_identity(t).map(|(_, v)| v).unwrap_or_default();
                            let score = eval_funcall_value(fc, &val).map(|v| v.as_num()).unwrap_or(f64::NAN);
                            (score, t)
                        })
                        .collect();
                    scored.sort_by(|x, y| y.0.partial_cmp(&x.0).unwrap_or(std::cmp::Ordering::Equal));
                    bases = scored.into_iter().map(|(_, t)| t).take(*n).collect();
                }
            }
            Ok(bases)
        }
        Op::MatchFirst(inner, fc) => {
            let bases = eval(inner, ctx)?;
            let mut seen = std::collections::HashSet::new();
            let mut out = Vec::new();
            for t in bases {
                let val = ctx.view.tag_identity(t).map(|(_, v)| v).unwrap_or_default();
                let key = eval_funcall_value(fc, &val)?.as_str();
                if seen.insert(key) {
                    out.push(t);
                }
            }
            Ok(out)
        }
        Op::Memo(key, inner) => {
            let rev = ctx.view.rev();
            match ctx.memo {
                Some(cache) => {
                    let key = *key;
                    // Can't close over `ctx`/`inner` by reference inside
                    // `FnOnce` without a second borrow of `ctx`; evaluate
                    // eagerly instead and only use the cache to dedupe
                    // across sibling branches within the same plan.
                    if let Some(hit) = cache.peek(rev, key) {
                        Ok(hit)
                    } else {
                        let result = eval(inner, ctx)?;
                        cache.insert(rev, key, result.clone());
                        Ok(result)
                    }
                }
                None => eval(inner, ctx),
            }
        }
    }
}

/// Evaluate a plan with an explicit execution context (memo cache,
/// cancellation token, parallel threshold).
pub fn execute_with(op: &Op, ctx: &ExecCtx) -> Result<Vec<Tref>> {
    eval(op, ctx)
}

/// Resolves `OverlayRef::Name` bindings to concrete `Tref`s as overlay
/// statements are applied in textual order; `store.rs` drives this while
/// staging a `with { ... }` block onto a `Tx`.
#[derive(Default)]
pub struct OverlayBindings {
    names: std::collections::HashMap<String, Tref>,
}

impl OverlayBindings {
    pub fn new() -> OverlayBindings {
        OverlayBindings::default()
    }

    pub fn bind(&mut self, name: String, tref: Tref) {
        self.names.insert(name, tref);
    }

    pub fn resolve(&self, r: &crate::dsl::ast::OverlayRef, view: &View) -> Result<Tref> {
        use crate::dsl::ast::OverlayRef;
        match r {
            OverlayRef::Name(n) => self
                .names
                .get(n)
                .copied()
                .ok_or_else(|| Error::ValidationError(format!("overlay reference {:?} is unbound", n))),
            OverlayRef::Identity(ttype, val) => view
                .lookup_by_identity(ttype.as_str(), val)
                .ok_or_else(|| Error::NotFound(format!("({}, {:?})", ttype, val))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsl;
    use crate::graph::Graph;
    use crate::plan;
    use crate::revision::Generation;
    use crate::types::{Rev, Ttype};
    use std::sync::Arc;

    fn mk_view() -> (Arc<Generation>, crate::tx::Tx) {
        let mut graph = Graph::new();
        let mut tx = crate::tx::Tx::open(Rev::zero());
        let person = Ttype::parse("person", 64).unwrap();
        let language = Ttype::parse("language", 64).unwrap();
        let rel = Ttype::parse("rel", 64).unwrap();
        let ada = tx.add_tag(&graph, person, "ada".into(), 1024).unwrap();
        let py = tx.add_tag(&graph, language.clone(), "python".into(), 1024).unwrap();
        let speaks = tx.add_tag(&graph, rel, "speaks".into(), 1024).unwrap();
        tx.link(ada, speaks).unwrap();
        tx.link(speaks, py).unwrap();
        let gen = Arc::new(Generation { rev: Rev::zero(), graph: std::mem::take(&mut graph) });
        let delta = tx.commit_locked(&gen).unwrap();
        let mut graph2 = Graph::new();
        graph2.install_delta(delta, Rev(1)).unwrap();
        let gen2 = Arc::new(Generation { rev: Rev(1), graph: graph2 });
        (gen2, crate::tx::Tx::open(Rev(1)))
    }

    #[test]
    fn test_execute_scenario_1_relation_traversal() {
        let (gen, _tx) = mk_view();
        let view = View::new(gen);
        let q = dsl::parse(r#"| person == "ada" > rel == "speaks" > language"#).unwrap();
        let op = plan::plan(&q, &view).unwrap();
        let result = execute_with(&op, &ExecCtx::new(&view)).unwrap();
        let vals: Vec<String> = result.iter().filter_map(|t| view.tag_identity(*t)).map(|(_, v)| v).collect();
        assert_eq!(vals, vec!["python".to_string()]);
    }

    #[test]
    fn test_startswith_predicate() {
        let (gen, _tx) = mk_view();
        let view = View::new(gen);
        let q = dsl::parse(r#"| language (startswith("py"))"#).unwrap();
        let op = plan::plan(&q, &view).unwrap();
        let result = execute_with(&op, &ExecCtx::new(&view)).unwrap();
        assert_eq!(result.len(), 1);
    }

    #[test]
    fn test_numeric_comparator_funcall() {
        assert!(eval_bool(&FunCall { name: "gt".into(), args: vec![Expr::FunCall(FunCall { name: "num".into(), args: vec![Expr::Name("val".into())] }), Expr::Num(1.0)] }, "5").unwrap());
        assert!(!eval_bool(&FunCall { name: "gt".into(), args: vec![Expr::FunCall(FunCall { name: "num".into(), args: vec![Expr::Name("val".into())] }), Expr::Num(1.0)] }, "not-a-number").unwrap());
    }

    #[test]
    fn test_top_by_keeps_largest_and_difference_recovers_smallest() {
        let mut graph = Graph::new();
        let score = Ttype::parse("score", 64).unwrap();
        let mut tx = crate::tx::Tx::open(Rev::zero());
        let vals = ["1", "5", "3", "9", "2"];
        for v in vals {
            tx.add_tag(&graph, score.clone(), v.into(), 1024).unwrap();
        }
        let gen0 = Arc::new(Generation { rev: Rev::zero(), graph: std::mem::take(&mut graph) });
        let delta = tx.commit_locked(&gen0).unwrap();
        graph.install_delta(delta, Rev(1)).unwrap();
        let gen = Arc::new(Generation { rev: Rev(1), graph });
        let view = View::new(gen);

        let top2 = dsl::parse(r#"| score (top(2, num(val)))"#).unwrap();
        let op = plan::plan(&top2, &view).unwrap();
        let result = execute_with(&op, &ExecCtx::new(&view)).unwrap();
        let mut got: Vec<String> = result.iter().filter_map(|t| view.tag_identity(*t)).map(|(_, v)| v).collect();
        got.sort();
        assert_eq!(got, vec!["5".to_string(), "9".to_string()]);

        // Smallest 2 = everything minus the largest (len - 2).
        let all = dsl::parse("| score").unwrap();
        let all_op = plan::plan(&all, &view).unwrap();
        let all_set = execute_with(&all_op, &ExecCtx::new(&view)).unwrap();
        let bottom_op = Op::Difference(Box::new(all_op), Box::new(op));
        let mut bottom: Vec<String> = execute_with(&bottom_op, &ExecCtx::new(&view))
            .unwrap()
            .iter()
            .filter_map(|t| view.tag_identity(*t))
            .map(|(_, v)| v)
            .collect();
        bottom.sort();
        assert_eq!(bottom, vec!["1".to_string(), "2".to_string(), "3".to_string()]);
        assert_eq!(all_set.len(), 5);
    }

    #[test]
    fn test_num_grammar_rejects_scientific_notation_and_inf_nan() {
        assert_eq!(parse_num("42"), Some(42.0));
        assert_eq!(parse_num("-3.5"), Some(-3.5));
        assert_eq!(parse_num("+2"), Some(2.0));
        assert_eq!(parse_num("1e10"), None);
        assert_eq!(parse_num("inf"), None);
        assert_eq!(parse_num("Infinity"), None);
        assert_eq!(parse_num("NaN"), None);
        assert_eq!(parse_num("3."), None);
        assert_eq!(parse_num(".5"), None);
        assert_eq!(parse_num("abc"), None);
        assert!(!eval_bool(&FunCall { name: "num".into(), args: vec![Expr::Name("val".into())] }, "1e10").unwrap());
    }

    #[test]
    fn test_exclude_negates() {
        assert!(!eval_bool(&FunCall { name: "exclude".into(), args: vec![Expr::FunCall(FunCall { name: "startswith".into(), args: vec![Expr::Str("py".into())] })] }, "python").unwrap());
    }

    #[test]
    fn test_cancel_token_stops_execution() {
        let (gen, _tx) = mk_view();
        let view = View::new(gen);
        let q = dsl::parse(r#"| person"#).unwrap();
        let op = plan::plan(&q, &view).unwrap();
        let cancel = Cancel::new();
        cancel.cancel();
        let ctx = ExecCtx { view: &view, memo: None, cancel: Some(&cancel), parallel_threshold: DEFAULT_PARALLEL_THRESHOLD };
        assert!(matches!(execute_with(&op, &ctx), Err(Error::Cancelled)));
    }
}
