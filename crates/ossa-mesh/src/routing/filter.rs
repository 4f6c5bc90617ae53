//! Payload filters for routing rules and subscriptions.
//!
//! A filter is a map of dotted paths to expected values plus at most one
//! comparison expression of the form `path op literal`, where `op` is one of
//! `==`, `!=`, `>`, `>=`, `<`, `<=`. All conditions must hold.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::sync::OnceLock;
use tracing::debug;

use crate::error::{MeshError, MeshResult};

/// Comparison operator accepted in filter expressions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl CompareOp {
    // Two-character operators first so `>=` is not read as `>`
    const TOKENS: [(&'static str, CompareOp); 6] = [
        ("==", CompareOp::Eq),
        ("!=", CompareOp::Ne),
        (">=", CompareOp::Ge),
        ("<=", CompareOp::Le),
        (">", CompareOp::Gt),
        ("<", CompareOp::Lt),
    ];

    fn holds(self, ordering: Ordering) -> bool {
        match self {
            Self::Eq => ordering == Ordering::Equal,
            Self::Ne => ordering != Ordering::Equal,
            Self::Gt => ordering == Ordering::Greater,
            Self::Ge => ordering != Ordering::Less,
            Self::Lt => ordering == Ordering::Less,
            Self::Le => ordering != Ordering::Greater,
        }
    }
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let token = Self::TOKENS
            .iter()
            .find(|(_, op)| op == self)
            .map(|(token, _)| *token)
            .unwrap_or("?");
        f.write_str(token)
    }
}

/// A parsed `path op literal` expression
#[derive(Debug, Clone, PartialEq)]
pub struct Comparison {
    pub path: String,
    pub op: CompareOp,
    pub literal: Value,
}

impl Comparison {
    /// Parse an expression such as `priority >= 3` or `payload.kind == "alert"`
    pub fn parse(expression: &str) -> MeshResult<Self> {
        let (index, token, op) = CompareOp::TOKENS
            .iter()
            .filter_map(|(token, op)| expression.find(token).map(|i| (i, *token, *op)))
            .min_by_key(|(i, token, _)| (*i, std::cmp::Reverse(token.len())))
            .ok_or_else(|| {
                MeshError::InvalidMessage(format!("filter expression '{expression}' has no operator"))
            })?;

        let path = expression[..index].trim();
        let raw_literal = expression[index + token.len()..].trim();
        if path.is_empty() || raw_literal.is_empty() {
            return Err(MeshError::InvalidMessage(format!(
                "filter expression '{expression}' must have the form 'path op literal'"
            )));
        }

        let path = path.strip_prefix("payload.").unwrap_or(path).to_string();
        Ok(Self {
            path,
            op,
            literal: parse_literal(raw_literal),
        })
    }

    /// Evaluate against a payload; a missing path never matches
    pub fn evaluate(&self, payload: &Value) -> bool {
        let Some(actual) = lookup_path(payload, &self.path) else {
            return false;
        };
        match compare(actual, &self.literal) {
            Some(ordering) => self.op.holds(ordering),
            // Incomparable values are only ever "not equal"
            None => self.op == CompareOp::Ne,
        }
    }
}

fn parse_literal(raw: &str) -> Value {
    if let Ok(value) = serde_json::from_str::<Value>(raw) {
        return value;
    }
    let unquoted = raw
        .strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
        .unwrap_or(raw);
    Value::String(unquoted.to_string())
}

fn compare(actual: &Value, expected: &Value) -> Option<Ordering> {
    match (actual, expected) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (a, b) if a == b => Some(Ordering::Equal),
        _ => None,
    }
}

/// Resolve a dotted path (`a.b.0.c`) inside a JSON value
pub fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }
    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Field-equality map and/or one comparison expression over the payload
///
/// The expression is parsed once, on [`validate`](Self::validate) or the
/// first evaluation, and the result is kept with the filter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageFilter {
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub fields: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expression: Option<String>,
    #[serde(skip)]
    compiled: OnceLock<Option<Comparison>>,
}

impl PartialEq for MessageFilter {
    fn eq(&self, other: &Self) -> bool {
        self.fields == other.fields && self.expression == other.expression
    }
}

impl MessageFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `path` to equal `value`
    pub fn with_field(mut self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(path.into(), value.into());
        self
    }

    /// Set the comparison expression
    pub fn with_expression(mut self, expression: impl Into<String>) -> Self {
        self.expression = Some(expression.into());
        self.compiled = OnceLock::new();
        self
    }

    pub fn expression(&self) -> Option<&str> {
        self.expression.as_deref()
    }

    /// Reject expressions that do not parse; a valid one is kept parsed
    pub fn validate(&self) -> MeshResult<()> {
        if let Some(expression) = &self.expression
            && !matches!(self.compiled.get(), Some(Some(_)))
        {
            let comparison = Comparison::parse(expression)?;
            let _ = self.compiled.set(Some(comparison));
        }
        Ok(())
    }

    /// The parsed expression, if there is one and it parses
    pub fn comparison(&self) -> Option<&Comparison> {
        let expression = self.expression.as_deref()?;
        self.compiled
            .get_or_init(|| match Comparison::parse(expression) {
                Ok(comparison) => Some(comparison),
                Err(e) => {
                    debug!(expression = %expression, error = %e, "Unparseable filter expression");
                    None
                }
            })
            .as_ref()
    }

    #[cfg(test)]
    pub(crate) fn is_compiled(&self) -> bool {
        matches!(self.compiled.get(), Some(Some(_)))
    }

    /// Whether `payload` satisfies every condition
    pub fn matches(&self, payload: &Value) -> bool {
        let fields_match = self.fields.iter().all(|(path, expected)| {
            let path = path.strip_prefix("payload.").unwrap_or(path);
            lookup_path(payload, path)
                .is_some_and(|actual| compare(actual, expected) == Some(Ordering::Equal))
        });
        if !fields_match {
            return false;
        }

        match &self.expression {
            None => true,
            Some(_) => self
                .comparison()
                .is_some_and(|comparison| comparison.evaluate(payload)),
        }
    }
}
