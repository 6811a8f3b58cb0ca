//! A small `${...}` expression language.
//!
//! Supports literals (`1`, `2.5`, `'text'`, `true`, `null`), dotted and
//! indexed lookups into the scope (`trigger.user`, `deployed[0].region`),
//! arithmetic (`+ - * / %`, `+` concatenates when either side is a string),
//! comparisons and boolean operators. A string that is exactly one
//! placeholder evaluates to the typed result; otherwise each placeholder is
//! rendered into the surrounding text.

use super::ExpressionEvaluator;
use crate::core::ContextMap;
use crate::errors::ExpressionError;
use regex::Regex;
use serde_json::{Number, Value};
use std::cmp::Ordering;
use std::sync::OnceLock;

const PLACEHOLDER: &str = r"\$\{([^}]*)\}";

#[allow(clippy::expect_used)]
fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(PLACEHOLDER).expect("placeholder pattern is valid"))
}

/// Evaluator for `${...}` placeholders.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaceholderEvaluator;

impl PlaceholderEvaluator {
    /// Creates a new evaluator.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl ExpressionEvaluator for PlaceholderEvaluator {
    fn contains_expression(&self, text: &str) -> bool {
        placeholder_pattern().is_match(text)
    }

    fn evaluate(&self, text: &str, context: &ContextMap) -> Result<Value, ExpressionError> {
        let pattern = placeholder_pattern();
        let fail = |reason: String| ExpressionError::new(text, reason);

        let trimmed = text.trim();
        if let Some(caps) = pattern.captures(trimmed) {
            let whole = caps.get(0).map_or(0..0, |m| m.range());
            if whole == (0..trimmed.len()) {
                let body = caps.get(1).map_or("", |m| m.as_str());
                return evaluate_body(body, context).map_err(fail);
            }
        }

        let mut rendered = String::with_capacity(text.len());
        let mut last = 0;
        for caps in pattern.captures_iter(text) {
            let Some(whole) = caps.get(0) else {
                continue;
            };
            let body = caps.get(1).map_or("", |m| m.as_str());
            rendered.push_str(&text[last..whole.start()]);
            let value = evaluate_body(body, context).map_err(fail)?;
            rendered.push_str(&render(&value));
            last = whole.end();
        }
        rendered.push_str(&text[last..]);
        Ok(Value::String(rendered))
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn evaluate_body(body: &str, context: &ContextMap) -> Result<Value, String> {
    let tokens = tokenize(body)?;
    if tokens.is_empty() {
        return Err("Empty expression".to_string());
    }
    let mut parser = Parser {
        tokens,
        pos: 0,
        context,
    };
    let value = parser.or()?;
    match parser.peek() {
        None => Ok(value),
        Some(token) => Err(format!("Unexpected token {token:?}")),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    Op(&'static str),
}

const TWO_CHAR_OPS: [&str; 6] = ["==", "!=", "<=", ">=", "&&", "||"];
const ONE_CHAR_OPS: [&str; 13] = ["+", "-", "*", "/", "%", "<", ">", "!", "(", ")", ".", "[", "]"];

fn tokenize(src: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c.is_ascii_digit() {
            let start = i;
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
            let is_float = i + 1 < chars.len() && chars[i] == '.' && chars[i + 1].is_ascii_digit();
            if is_float {
                i += 1;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
            }
            let literal: String = chars[start..i].iter().collect();
            let token = if is_float {
                literal.parse().map(Token::Float).map_err(|e| format!("{e}"))?
            } else {
                literal.parse().map(Token::Int).map_err(|e| format!("{e}"))?
            };
            tokens.push(token);
        } else if c == '\'' || c == '"' {
            let quote = c;
            i += 1;
            let mut text = String::new();
            loop {
                match chars.get(i) {
                    None => return Err("Unterminated string literal".to_string()),
                    Some('\\') => {
                        if let Some(next) = chars.get(i + 1) {
                            text.push(*next);
                        }
                        i += 2;
                    }
                    Some(ch) if *ch == quote => {
                        i += 1;
                        break;
                    }
                    Some(ch) => {
                        text.push(*ch);
                        i += 1;
                    }
                }
            }
            tokens.push(Token::Str(text));
        } else if c.is_alphabetic() || c == '_' || c == '$' || c == '#' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || matches!(chars[i], '_' | '$' | '#')) {
                i += 1;
            }
            tokens.push(Token::Ident(chars[start..i].iter().collect()));
        } else {
            let pair: String = chars[i..chars.len().min(i + 2)].iter().collect();
            if let Some(op) = TWO_CHAR_OPS.iter().find(|op| **op == pair) {
                tokens.push(Token::Op(*op));
                i += 2;
            } else if let Some(op) = ONE_CHAR_OPS.iter().find(|op| op.starts_with(c)) {
                tokens.push(Token::Op(*op));
                i += 1;
            } else {
                return Err(format!("Unexpected character '{c}'"));
            }
        }
    }
    Ok(tokens)
}

#[derive(Debug, Clone, Copy)]
enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    fn from_value(value: &Value) -> Option<Self> {
        let Value::Number(n) = value else {
            return None;
        };
        n.as_i64().map(Self::Int).or_else(|| n.as_f64().map(Self::Float))
    }

    #[allow(clippy::cast_precision_loss)]
    fn as_f64(self) -> f64 {
        match self {
            Self::Int(i) => i as f64,
            Self::Float(f) => f,
        }
    }

    fn into_value(self) -> Result<Value, String> {
        match self {
            Self::Int(i) => Ok(Value::Number(i.into())),
            Self::Float(f) => Number::from_f64(f)
                .map(Value::Number)
                .ok_or_else(|| "Result is not a finite number".to_string()),
        }
    }
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    context: &'a ContextMap,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn eat_op(&mut self, ops: &[&str]) -> Option<&'static str> {
        match self.peek() {
            Some(Token::Op(op)) if ops.contains(op) => {
                let op = *op;
                self.pos += 1;
                Some(op)
            }
            _ => None,
        }
    }

    fn expect_op(&mut self, op: &str) -> Result<(), String> {
        self.eat_op(&[op])
            .map(|_| ())
            .ok_or_else(|| format!("Expected '{op}'"))
    }

    fn or(&mut self) -> Result<Value, String> {
        let mut left = self.and()?;
        while self.eat_op(&["||"]).is_some() {
            let right = self.and()?;
            left = Value::Bool(truthy(&left)? || truthy(&right)?);
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Value, String> {
        let mut left = self.equality()?;
        while self.eat_op(&["&&"]).is_some() {
            let right = self.equality()?;
            left = Value::Bool(truthy(&left)? && truthy(&right)?);
        }
        Ok(left)
    }

    fn equality(&mut self) -> Result<Value, String> {
        let mut left = self.comparison()?;
        while let Some(op) = self.eat_op(&["==", "!="]) {
            let right = self.comparison()?;
            let equal = values_equal(&left, &right);
            left = Value::Bool(if op == "==" { equal } else { !equal });
        }
        Ok(left)
    }

    fn comparison(&mut self) -> Result<Value, String> {
        let mut left = self.additive()?;
        while let Some(op) = self.eat_op(&["<", ">", "<=", ">="]) {
            let right = self.additive()?;
            let ordering = compare(&left, &right)?;
            left = Value::Bool(match op {
                "<" => ordering == Ordering::Less,
                ">" => ordering == Ordering::Greater,
                "<=" => ordering != Ordering::Greater,
                _ => ordering != Ordering::Less,
            });
        }
        Ok(left)
    }

    fn additive(&mut self) -> Result<Value, String> {
        let mut left = self.multiplicative()?;
        while let Some(op) = self.eat_op(&["+", "-"]) {
            let right = self.multiplicative()?;
            left = if op == "+" && (left.is_string() || right.is_string()) {
                Value::String(format!("{}{}", render(&left), render(&right)))
            } else {
                arithmetic(op, &left, &right)?
            };
        }
        Ok(left)
    }

    fn multiplicative(&mut self) -> Result<Value, String> {
        let mut left = self.unary()?;
        while let Some(op) = self.eat_op(&["*", "/", "%"]) {
            let right = self.unary()?;
            left = arithmetic(op, &left, &right)?;
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Value, String> {
        if self.eat_op(&["!"]).is_some() {
            let value = self.unary()?;
            return Ok(Value::Bool(!truthy(&value)?));
        }
        if self.eat_op(&["-"]).is_some() {
            let value = self.unary()?;
            return arithmetic("-", &Value::Number(0.into()), &value);
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Value, String> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or_else(|| "Unexpected end of expression".to_string())?;
        self.pos += 1;

        match token {
            Token::Int(i) => Ok(Value::Number(i.into())),
            Token::Float(f) => Num::Float(f).into_value(),
            Token::Str(s) => Ok(Value::String(s)),
            Token::Op("(") => {
                let value = self.or()?;
                self.expect_op(")")?;
                Ok(value)
            }
            Token::Ident(name) => match name.as_str() {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                "null" => Ok(Value::Null),
                _ => self.path(&name),
            },
            Token::Op(op) => Err(format!("Unexpected operator '{op}'")),
        }
    }

    fn path(&mut self, root: &str) -> Result<Value, String> {
        let mut current = self
            .context
            .get(root)
            .cloned()
            .ok_or_else(|| format!("Unknown identifier '{root}'"))?;
        let mut path = root.to_string();

        loop {
            if self.eat_op(&["."]).is_some() {
                let Some(Token::Ident(key)) = self.tokens.get(self.pos).cloned() else {
                    return Err(format!("Expected property name after '{path}.'"));
                };
                self.pos += 1;
                path = format!("{path}.{key}");
                current = current
                    .get(key.as_str())
                    .cloned()
                    .ok_or_else(|| format!("No property '{path}'"))?;
            } else if self.eat_op(&["["]).is_some() {
                let index = self.or()?;
                self.expect_op("]")?;
                current = match (&current, &index) {
                    (Value::Array(items), Value::Number(n)) => n
                        .as_u64()
                        .and_then(|i| usize::try_from(i).ok())
                        .and_then(|i| items.get(i))
                        .cloned()
                        .ok_or_else(|| format!("Index {n} out of bounds for '{path}'"))?,
                    (Value::Object(map), Value::String(key)) => map
                        .get(key)
                        .cloned()
                        .ok_or_else(|| format!("No property '{path}[{key}]'"))?,
                    _ => return Err(format!("Cannot index '{path}' with {index}")),
                };
                path = format!("{path}[{}]", render(&index));
            } else {
                return Ok(current);
            }
        }
    }
}

fn truthy(value: &Value) -> Result<bool, String> {
    value
        .as_bool()
        .ok_or_else(|| format!("Expected a boolean but found {value}"))
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (Num::from_value(left), Num::from_value(right)) {
        (Some(Num::Int(a)), Some(Num::Int(b))) => a == b,
        (Some(a), Some(b)) => (a.as_f64() - b.as_f64()).abs() < f64::EPSILON,
        _ => left == right,
    }
}

fn compare(left: &Value, right: &Value) -> Result<Ordering, String> {
    if let (Some(a), Some(b)) = (Num::from_value(left), Num::from_value(right)) {
        return a
            .as_f64()
            .partial_cmp(&b.as_f64())
            .ok_or_else(|| "Numbers are not comparable".to_string());
    }
    match (left, right) {
        (Value::String(a), Value::String(b)) => Ok(a.cmp(b)),
        _ => Err(format!("Cannot compare {left} with {right}")),
    }
}

fn arithmetic(op: &str, left: &Value, right: &Value) -> Result<Value, String> {
    let (Some(a), Some(b)) = (Num::from_value(left), Num::from_value(right)) else {
        return Err(format!("Operator '{op}' needs numbers, found {left} and {right}"));
    };

    if let (Num::Int(x), Num::Int(y)) = (a, b) {
        let exact = match op {
            "+" => x.checked_add(y),
            "-" => x.checked_sub(y),
            "*" => x.checked_mul(y),
            "/" if x.checked_rem(y) == Some(0) => x.checked_div(y),
            "%" => x.checked_rem(y),
            _ => None,
        };
        if let Some(result) = exact {
            return Ok(Value::Number(result.into()));
        }
    }

    let (x, y) = (a.as_f64(), b.as_f64());
    if matches!(op, "/" | "%") && y == 0.0 {
        return Err("Division by zero".to_string());
    }
    let result = match op {
        "+" => x + y,
        "-" => x - y,
        "*" => x * y,
        "/" => x / y,
        _ => x % y,
    };
    Num::Float(result).into_value()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn scope() -> ContextMap {
        let Value::Object(map) = json!({
            "trigger": {"user": "alice", "buildNumber": 41},
            "deployed": [{"region": "us-west-2"}],
            "cluster": "app-main",
            "count": 3,
            "enabled": true
        }) else {
            unreachable!()
        };
        map
    }

    fn eval(text: &str) -> Result<Value, ExpressionError> {
        PlaceholderEvaluator::new().evaluate(text, &scope())
    }

    #[test]
    fn test_contains_expression() {
        let evaluator = PlaceholderEvaluator::new();
        assert!(evaluator.contains_expression("${1+1}"));
        assert!(evaluator.contains_expression("prefix-${cluster}"));
        assert!(!evaluator.contains_expression("$notAnExpression"));
        assert!(!evaluator.contains_expression("literal"));
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(eval("${1+1}").unwrap(), json!(2));
        assert_eq!(eval("${ 2 * (3 + 4) }").unwrap(), json!(14));
        assert_eq!(eval("${7 / 2}").unwrap(), json!(3.5));
        assert_eq!(eval("${-count + 1}").unwrap(), json!(-2));
        assert!(eval("${1 / 0}").is_err());
        assert!(eval("${5 % 0}").is_err());
    }

    #[test]
    fn test_integer_overflow_falls_back_to_float() {
        let min = "(-9223372036854775807 - 1)";
        assert!(eval(&format!("${{{min} % -1}}")).is_ok());
        assert!(eval(&format!("${{{min} / -1}}")).is_ok());
        assert_eq!(eval("${9223372036854775807 + 1}").unwrap(), json!(9_223_372_036_854_775_808.0));
    }

    #[test]
    fn test_large_integers_compare_exactly() {
        assert_eq!(eval("${1152921504606846976 == 1152921504606846977}").unwrap(), json!(false));
        assert_eq!(eval("${1152921504606846976 == 1152921504606846976}").unwrap(), json!(true));
        assert_eq!(eval("${2 == 2.0}").unwrap(), json!(true));
    }

    #[test]
    fn test_lookups() {
        assert_eq!(eval("${trigger.user}").unwrap(), json!("alice"));
        assert_eq!(eval("${deployed[0].region}").unwrap(), json!("us-west-2"));
        assert_eq!(eval("${trigger['buildNumber'] + 1}").unwrap(), json!(42));
        assert!(eval("${missing}").is_err());
        assert!(eval("${trigger.missing}").is_err());
        assert!(eval("${deployed[5]}").is_err());
    }

    #[test]
    fn test_interpolation() {
        assert_eq!(
            eval("deploy ${cluster} #${trigger.buildNumber}").unwrap(),
            json!("deploy app-main #41")
        );
        assert_eq!(eval("${'a' + 1}").unwrap(), json!("a1"));
    }

    #[test]
    fn test_booleans_and_comparisons() {
        assert_eq!(eval("${count > 2 && enabled}").unwrap(), json!(true));
        assert_eq!(eval("${count == 3.0}").unwrap(), json!(true));
        assert_eq!(eval("${cluster != 'app-main' || !enabled}").unwrap(), json!(false));
        assert_eq!(eval("${'a' < 'b'}").unwrap(), json!(true));
        assert!(eval("${count && true}").is_err());
    }

    #[test]
    fn test_literals() {
        assert_eq!(eval("${null}").unwrap(), Value::Null);
        assert_eq!(eval("${'it\\'s'}").unwrap(), json!("it's"));
        assert_eq!(eval("${2.5}").unwrap(), json!(2.5));
    }

    #[test]
    fn test_errors_carry_expression() {
        let err = eval("${1 +}").unwrap_err();
        assert_eq!(err.expression, "${1 +}");
        assert!(eval("${}").is_err());
        assert!(eval("${1 ~ 2}").is_err());
    }
}
