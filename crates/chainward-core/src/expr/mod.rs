//! Sandboxed boolean condition language.
//!
//! A small CEL-flavoured language used for per-policy execution gating and for
//! custom parameter constraints:
//!
//! ```text
//! request.path.startsWith('/admin') && request.headers['x-tenant'] in ['a', 'b']
//! has(metadata['auth.subject']) ? response.status >= 500 : false
//! size(value) >= 16 && value.matches('^[A-Za-z0-9_-]+$')
//! ```
//!
//! Expressions are compiled once (syntax, known roots, regex literals) and
//! then evaluated against a `Bindings` view. Evaluation is pure: it can only
//! read the bound values, never mutate them, and its cost is bounded by the
//! compile-time size limits.

mod eval;
mod lexer;
mod parser;

use serde_json::Value;

use crate::error::{EngineError, Result};

/// Longest accepted expression source.
pub const MAX_SOURCE_LEN: usize = 4096;

/// Roots visible to conditions on request-phase policies.
pub const REQUEST_ROOTS: &[&str] = &["request", "metadata"];
/// Roots visible to conditions on response-phase policies.
pub const RESPONSE_ROOTS: &[&str] = &["request", "response", "metadata"];
/// Roots visible to parameter constraint expressions.
pub const CONSTRAINT_ROOTS: &[&str] = &["value"];

/// Read-only view the evaluator resolves root identifiers against.
pub trait Bindings {
    fn resolve(&self, root: &str) -> Option<Value>;
}

/// Single `value` binding (parameter constraints).
pub struct ValueBinding<'a>(pub &'a Value);

impl Bindings for ValueBinding<'_> {
    fn resolve(&self, root: &str) -> Option<Value> {
        (root == "value").then(|| self.0.clone())
    }
}

/// A compiled, immutable expression.
#[derive(Debug, Clone)]
pub struct Expression {
    source: String,
    root: parser::Node,
    roots: Vec<String>,
}

impl Expression {
    /// Compile `source`, rejecting identifiers outside `allowed_roots`.
    pub fn compile(source: &str, allowed_roots: &[&str]) -> Result<Self> {
        if source.len() > MAX_SOURCE_LEN {
            return Err(EngineError::InvalidExpression(format!(
                "expression longer than {MAX_SOURCE_LEN} bytes"
            )));
        }
        let toks = lexer::tokenize(source)?;
        let mut p = parser::Parser::new(toks, source.len());
        let root = p.parse()?;

        if let Some(bad) = p.roots.iter().find(|r| !allowed_roots.contains(&r.as_str())) {
            return Err(EngineError::InvalidExpression(format!(
                "unknown identifier `{bad}` (allowed: {})",
                allowed_roots.join(", ")
            )));
        }

        Ok(Self {
            source: source.to_string(),
            root,
            roots: p.roots,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Root identifiers the expression reads.
    pub fn roots(&self) -> &[String] {
        &self.roots
    }

    pub fn evaluate(&self, bindings: &dyn Bindings) -> Result<Value> {
        eval::Evaluator::new(bindings).eval(&self.root)
    }

    /// Evaluate and require a boolean result.
    pub fn evaluate_bool(&self, bindings: &dyn Bindings) -> Result<bool> {
        match self.evaluate(bindings)? {
            Value::Bool(b) => Ok(b),
            other => Err(EngineError::Evaluation(format!(
                "expression `{}` produced {}, expected bool",
                self.source,
                eval::type_name(&other)
            ))),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Map(Value);

    impl Bindings for Map {
        fn resolve(&self, root: &str) -> Option<Value> {
            self.0.get(root).cloned()
        }
    }

    fn eval(src: &str, ctx: Value) -> Result<Value> {
        Expression::compile(src, &["request", "metadata", "value"])?.evaluate(&Map(ctx))
    }

    #[test]
    fn short_circuit_skips_type_errors() {
        // rhs is a type error but is never evaluated
        let v = eval("false && (1 > 'a')", json!({})).unwrap_or(Value::Null);
        assert_eq!(v, json!(false));
    }

    #[test]
    fn unknown_root_is_rejected_at_compile_time() {
        let err = Expression::compile("response.status == 200", REQUEST_ROOTS).unwrap_err();
        assert_eq!(err.code().as_str(), "INVALID_EXPRESSION");
    }

    #[test]
    fn invalid_regex_is_rejected_at_compile_time() {
        assert!(Expression::compile("value.matches('(')", CONSTRAINT_ROOTS).is_err());
    }

    #[test]
    fn non_literal_regex_is_rejected() {
        assert!(Expression::compile("value.matches(value)", CONSTRAINT_ROOTS).is_err());
    }

    #[test]
    fn nesting_limit_is_enforced() {
        let deep = format!("{}true{}", "(".repeat(200), ")".repeat(200));
        assert!(Expression::compile(&deep, CONSTRAINT_ROOTS).is_err());
    }

    #[test]
    fn ternary_and_membership() {
        let ctx = json!({"request": {"method": "POST", "headers": {"x-tier": "gold"}}});
        let v = eval(
            "request.method in ['POST', 'PUT'] ? request.headers['X-Tier'] == 'gold' : false",
            ctx,
        )
        .unwrap_or(Value::Null);
        assert_eq!(v, json!(true));
    }

    #[test]
    fn non_bool_result_is_an_evaluation_error() {
        let e = Expression::compile("value", CONSTRAINT_ROOTS).unwrap_or_else(|_| unreachable!());
        let err = e.evaluate_bool(&ValueBinding(&json!(3))).unwrap_err();
        assert_eq!(err.code().as_str(), "EVALUATION");
    }
}
