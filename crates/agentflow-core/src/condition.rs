// Copyright (c) 2025 Agentflow
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Condition evaluation over the execution context.
//!
//! Three input shapes are supported: an expression object holding a small
//! boolean expression, a structured field/operator/value comparison, and
//! `and`/`or`/`not` composites of the former two. An unparseable expression
//! evaluates to `false` and is logged, never raised.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// Source of values for condition evaluation.
///
/// Implemented by the execution record; tests may supply maps directly.
pub trait ConditionSource {
    /// Resolves a global variable.
    fn global(&self, name: &str) -> Option<Value>;
    /// Resolves a step's captured output.
    fn step_output(&self, step_id: &str) -> Option<Value>;
    /// Resolves a step's status in lowercase wire form.
    fn step_status(&self, step_id: &str) -> Option<String>;
}

/// Comparison operator of the structured condition shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonOperator {
    Equals,
    NotEquals,
    Exists,
    Contains,
    GreaterThan,
    LessThan,
    GreaterEqual,
    LessEqual,
}

/// A step execution condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Condition {
    /// `{ "expression": "<expr>" }`
    Expression { expression: String },
    /// `{ "field": ..., "operator": ..., "value": ... }`
    Comparison {
        field: String,
        operator: ComparisonOperator,
        #[serde(default)]
        value: Value,
    },
    /// `{ "and": [ ... ] }`
    And { and: Vec<Condition> },
    /// `{ "or": [ ... ] }`
    Or { or: Vec<Condition> },
    /// `{ "not": ... }`
    Not { not: Box<Condition> },
}

impl Condition {
    /// Shorthand for an expression condition.
    pub fn expression(expr: impl Into<String>) -> Self {
        Condition::Expression {
            expression: expr.into(),
        }
    }

    /// Evaluates the condition against `source`.
    pub fn evaluate(&self, source: &dyn ConditionSource) -> bool {
        match self {
            Condition::Expression { expression } => match parse_expression(expression) {
                Ok(expr) => truthy(&expr.eval(source)),
                Err(err) => {
                    warn!(expression = %expression, error = %err, "Unparseable condition expression");
                    false
                }
            },
            Condition::Comparison {
                field,
                operator,
                value,
            } => evaluate_comparison(field, *operator, value, source),
            Condition::And { and } => and.iter().all(|c| c.evaluate(source)),
            Condition::Or { or } => or.iter().any(|c| c.evaluate(source)),
            Condition::Not { not } => !not.evaluate(source),
        }
    }
}

fn evaluate_comparison(
    field: &str,
    operator: ComparisonOperator,
    expected: &Value,
    source: &dyn ConditionSource,
) -> bool {
    let actual = resolve_path(field, source);
    match operator {
        ComparisonOperator::Exists => actual.is_some(),
        ComparisonOperator::Equals => actual.map(|a| json_eq(&a, expected)).unwrap_or(false),
        ComparisonOperator::NotEquals => actual.map(|a| !json_eq(&a, expected)).unwrap_or(false),
        ComparisonOperator::Contains => actual.map(|a| json_contains(&a, expected)).unwrap_or(false),
        ComparisonOperator::GreaterThan => numeric_cmp(actual, expected, |l, r| l > r),
        ComparisonOperator::LessThan => numeric_cmp(actual, expected, |l, r| l < r),
        ComparisonOperator::GreaterEqual => numeric_cmp(actual, expected, |l, r| l >= r),
        ComparisonOperator::LessEqual => numeric_cmp(actual, expected, |l, r| l <= r),
    }
}

fn numeric_cmp(actual: Option<Value>, expected: &Value, cmp: fn(f64, f64) -> bool) -> bool {
    match (actual.as_ref().and_then(Value::as_f64), expected.as_f64()) {
        (Some(l), Some(r)) => cmp(l, r),
        _ => false,
    }
}

/// Resolves a dotted path against the context.
///
/// `global.<name>(.field)*`, `steps.<id>.output(.field)*`,
/// `steps.<id>.status`, or a bare global name.
fn resolve_path(path: &str, source: &dyn ConditionSource) -> Option<Value> {
    let mut segments = path.split('.');
    let head = segments.next()?;
    match head {
        "global" => {
            let name = segments.next()?;
            descend(source.global(name)?, segments)
        }
        "steps" => {
            let step_id = segments.next()?;
            match segments.next()? {
                "output" => descend(source.step_output(step_id)?, segments),
                "status" => Some(Value::String(source.step_status(step_id)?)),
                _ => None,
            }
        }
        name => descend(source.global(name)?, segments),
    }
}

fn descend<'a>(mut value: Value, segments: impl Iterator<Item = &'a str>) -> Option<Value> {
    for segment in segments {
        value = value.get(segment)?.clone();
    }
    Some(value)
}

/// Equality with mixed-type operands defined as `false`.
fn json_eq(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(l), Value::Number(r)) => match (l.as_f64(), r.as_f64()) {
            (Some(l), Some(r)) => l == r,
            _ => false,
        },
        (Value::Null, Value::Null) => true,
        (Value::Bool(_), Value::Bool(_))
        | (Value::String(_), Value::String(_))
        | (Value::Array(_), Value::Array(_))
        | (Value::Object(_), Value::Object(_)) => left == right,
        _ => false,
    }
}

fn json_contains(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::String(s) => needle.as_str().map(|n| s.contains(n)).unwrap_or(false),
        Value::Array(items) => items.iter().any(|item| json_eq(item, needle)),
        Value::Object(map) => needle
            .as_str()
            .map(|key| map.contains_key(key))
            .unwrap_or(false),
        _ => false,
    }
}

/// Boolean coercion: missing, `null`, `false`, `0`, and `""` are false.
fn truthy(value: &Option<Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(_)) | Some(Value::Object(_)) => true,
    }
}

// ---------------------------------------------------------------------------
// Expression language
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Literal(Value),
    Reference(String),
    Not,
    And,
    Or,
    Eq,
    Ne,
    Ge,
    Le,
    Gt,
    Lt,
    LParen,
    RParen,
}

#[derive(Debug, Clone)]
enum Expr {
    Literal(Value),
    Reference(String),
    Not(Box<Expr>),
    Compare(Box<Expr>, Token, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

impl Expr {
    fn eval(&self, source: &dyn ConditionSource) -> Option<Value> {
        match self {
            Expr::Literal(v) => Some(v.clone()),
            Expr::Reference(path) => resolve_path(path, source),
            Expr::Not(inner) => Some(Value::Bool(!truthy(&inner.eval(source)))),
            Expr::Compare(left, op, right) => {
                let l = left.eval(source);
                let r = right.eval(source);
                let result = match op {
                    Token::Eq => match (&l, &r) {
                        (Some(l), Some(r)) => json_eq(l, r),
                        _ => false,
                    },
                    Token::Ne => match (&l, &r) {
                        (Some(l), Some(r)) => !json_eq(l, r),
                        _ => false,
                    },
                    Token::Gt => numeric_pair(&l, &r, |a, b| a > b),
                    Token::Lt => numeric_pair(&l, &r, |a, b| a < b),
                    Token::Ge => numeric_pair(&l, &r, |a, b| a >= b),
                    Token::Le => numeric_pair(&l, &r, |a, b| a <= b),
                    _ => false,
                };
                Some(Value::Bool(result))
            }
            Expr::And(left, right) => Some(Value::Bool(
                truthy(&left.eval(source)) && truthy(&right.eval(source)),
            )),
            Expr::Or(left, right) => Some(Value::Bool(
                truthy(&left.eval(source)) || truthy(&right.eval(source)),
            )),
        }
    }
}

fn numeric_pair(left: &Option<Value>, right: &Option<Value>, cmp: fn(f64, f64) -> bool) -> bool {
    match (
        left.as_ref().and_then(Value::as_f64),
        right.as_ref().and_then(Value::as_f64),
    ) {
        (Some(l), Some(r)) => cmp(l, r),
        _ => false,
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '&' => {
                if chars.get(i + 1) == Some(&'&') {
                    tokens.push(Token::And);
                    i += 2;
                } else {
                    return Err(format!("stray '&' at offset {}", i));
                }
            }
            '|' => {
                if chars.get(i + 1) == Some(&'|') {
                    tokens.push(Token::Or);
                    i += 2;
                } else {
                    return Err(format!("stray '|' at offset {}", i));
                }
            }
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Eq);
                    i += 2;
                } else {
                    return Err(format!("stray '=' at offset {}", i));
                }
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ne);
                    i += 2;
                } else {
                    tokens.push(Token::Not);
                    i += 1;
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ge);
                    i += 2;
                } else {
                    tokens.push(Token::Gt);
                    i += 1;
                }
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Le);
                    i += 2;
                } else {
                    tokens.push(Token::Lt);
                    i += 1;
                }
            }
            '\'' | '"' => {
                let quote = c;
                let mut text = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            text.push(ch);
                            i += 1;
                        }
                        None => return Err("unterminated string literal".into()),
                    }
                }
                tokens.push(Token::Literal(Value::String(text)));
            }
            '0'..='9' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let number: f64 = text
                    .parse()
                    .map_err(|_| format!("bad numeric literal '{}'", text))?;
                let value = serde_json::Number::from_f64(number)
                    .map(Value::Number)
                    .ok_or_else(|| format!("non-finite numeric literal '{}'", text))?;
                tokens.push(Token::Literal(value));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_ascii_alphanumeric() || chars[i] == '_' || chars[i] == '.')
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                match word.as_str() {
                    "true" => tokens.push(Token::Literal(Value::Bool(true))),
                    "false" => tokens.push(Token::Literal(Value::Bool(false))),
                    _ => tokens.push(Token::Reference(word)),
                }
            }
            other => return Err(format!("unexpected character '{}' at offset {}", other, i)),
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn parse_or(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.advance();
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_comparison()?;
        while self.peek() == Some(&Token::And) {
            self.advance();
            let right = self.parse_comparison()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_comparison(&mut self) -> Result<Expr, String> {
        let left = self.parse_unary()?;
        let op = match self.peek() {
            Some(
                token @ (Token::Eq | Token::Ne | Token::Gt | Token::Lt | Token::Ge | Token::Le),
            ) => {
                let token = token.clone();
                self.advance();
                token
            }
            _ => return Ok(left),
        };
        let right = self.parse_unary()?;
        Ok(Expr::Compare(Box::new(left), op, Box::new(right)))
    }

    fn parse_unary(&mut self) -> Result<Expr, String> {
        if self.peek() == Some(&Token::Not) {
            self.advance();
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, String> {
        match self.advance() {
            Some(Token::Literal(v)) => Ok(Expr::Literal(v)),
            Some(Token::Reference(path)) => Ok(Expr::Reference(path)),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                match self.advance() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err("expected ')'".into()),
                }
            }
            other => Err(format!("unexpected token {:?}", other)),
        }
    }
}

fn parse_expression(input: &str) -> Result<Expr, String> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err("empty expression".into());
    }
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_or()?;
    if parser.pos != parser.tokens.len() {
        return Err(format!(
            "trailing tokens after expression at position {}",
            parser.pos
        ));
    }
    Ok(expr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    struct MapSource {
        globals: HashMap<String, Value>,
        outputs: HashMap<String, Value>,
        statuses: HashMap<String, String>,
    }

    impl MapSource {
        fn new() -> Self {
            Self {
                globals: HashMap::new(),
                outputs: HashMap::new(),
                statuses: HashMap::new(),
            }
        }
    }

    impl ConditionSource for MapSource {
        fn global(&self, name: &str) -> Option<Value> {
            self.globals.get(name).cloned()
        }

        fn step_output(&self, step_id: &str) -> Option<Value> {
            self.outputs.get(step_id).cloned()
        }

        fn step_status(&self, step_id: &str) -> Option<String> {
            self.statuses.get(step_id).cloned()
        }
    }

    fn source() -> MapSource {
        let mut s = MapSource::new();
        s.globals.insert("threshold".into(), json!(10));
        s.globals.insert("mode".into(), json!("fast"));
        s.globals.insert("enabled".into(), json!(true));
        s.outputs
            .insert("s1".into(), json!({"score": 42, "label": "ok", "tags": ["a", "b"]}));
        s.statuses.insert("s1".into(), "completed".into());
        s
    }

    #[test]
    fn test_expression_literals_and_operators() {
        let s = source();
        let cases = [
            ("true", true),
            ("false", false),
            ("1 == 1", true),
            ("1 != 2", true),
            ("3 >= 3", true),
            ("3 > 3", false),
            ("2 <= 1", false),
            ("'a' == 'a'", true),
            ("'a' == 'b'", false),
        ];
        for (expr, expected) in cases {
            assert_eq!(
                Condition::expression(expr).evaluate(&s),
                expected,
                "expression: {}",
                expr
            );
        }
    }

    #[test]
    fn test_expression_references() {
        let s = source();
        assert!(Condition::expression("global.threshold == 10").evaluate(&s));
        assert!(Condition::expression("global.mode == 'fast'").evaluate(&s));
        assert!(Condition::expression("steps.s1.output.score > 40").evaluate(&s));
        assert!(Condition::expression("steps.s1.status == 'completed'").evaluate(&s));
        assert!(!Condition::expression("steps.s1.status == 'failed'").evaluate(&s));
    }

    #[test]
    fn test_expression_precedence() {
        let s = source();
        // ! binds tighter than comparison chains and && tighter than ||.
        assert!(Condition::expression("false && false || true").evaluate(&s));
        assert!(!Condition::expression("false && (false || true)").evaluate(&s));
        assert!(Condition::expression("!false && true").evaluate(&s));
        assert!(Condition::expression("global.threshold > 5 && global.mode == 'fast'").evaluate(&s));
    }

    #[test]
    fn test_expression_missing_reference_is_false() {
        let s = source();
        assert!(!Condition::expression("global.absent == 10").evaluate(&s));
        assert!(!Condition::expression("steps.nope.output.x > 1").evaluate(&s));
        assert!(!Condition::expression("global.absent").evaluate(&s));
    }

    #[test]
    fn test_expression_mixed_type_equality_is_false() {
        let s = source();
        assert!(!Condition::expression("global.threshold == '10'").evaluate(&s));
        assert!(!Condition::expression("global.enabled == 1").evaluate(&s));
    }

    #[test]
    fn test_unparseable_expression_is_false() {
        let s = source();
        assert!(!Condition::expression("global.threshold >").evaluate(&s));
        assert!(!Condition::expression("&& true").evaluate(&s));
        assert!(!Condition::expression("").evaluate(&s));
    }

    #[test]
    fn test_structured_comparison() {
        let s = source();
        let cond: Condition = serde_json::from_value(json!({
            "field": "steps.s1.output.score",
            "operator": "greater_than",
            "value": 40
        }))
        .unwrap();
        assert!(cond.evaluate(&s));

        let cond: Condition = serde_json::from_value(json!({
            "field": "global.mode",
            "operator": "equals",
            "value": "fast"
        }))
        .unwrap();
        assert!(cond.evaluate(&s));
    }

    #[test]
    fn test_structured_exists_and_contains() {
        let s = source();
        let exists: Condition = serde_json::from_value(json!({
            "field": "steps.s1.output.label",
            "operator": "exists"
        }))
        .unwrap();
        assert!(exists.evaluate(&s));

        let missing: Condition = serde_json::from_value(json!({
            "field": "steps.s1.output.absent",
            "operator": "exists"
        }))
        .unwrap();
        assert!(!missing.evaluate(&s));

        let contains: Condition = serde_json::from_value(json!({
            "field": "steps.s1.output.tags",
            "operator": "contains",
            "value": "a"
        }))
        .unwrap();
        assert!(contains.evaluate(&s));

        let substring: Condition = serde_json::from_value(json!({
            "field": "global.mode",
            "operator": "contains",
            "value": "fa"
        }))
        .unwrap();
        assert!(substring.evaluate(&s));
    }

    #[test]
    fn test_composites() {
        let s = source();
        let cond: Condition = serde_json::from_value(json!({
            "and": [
                { "expression": "global.threshold == 10" },
                { "or": [
                    { "expression": "false" },
                    { "not": { "expression": "false" } }
                ]}
            ]
        }))
        .unwrap();
        assert!(cond.evaluate(&s));

        let cond: Condition = serde_json::from_value(json!({
            "not": { "field": "global.mode", "operator": "equals", "value": "fast" }
        }))
        .unwrap();
        assert!(!cond.evaluate(&s));
    }

    #[test]
    fn test_condition_shape_detection() {
        let expr: Condition = serde_json::from_value(json!({"expression": "true"})).unwrap();
        assert!(matches!(expr, Condition::Expression { .. }));

        let and: Condition =
            serde_json::from_value(json!({"and": [{"expression": "true"}]})).unwrap();
        assert!(matches!(and, Condition::And { .. }));
    }
}
