//! Sandboxed expression evaluation
//!
//! Literal expressions containing `{{...}}` references are expanded and
//! evaluated without embedding a scripting engine: references are replaced
//! with their JSON-serialized values (raw content when the site sits inside
//! quotes), the result is parsed structurally as JSON first, and only then
//! handed to a small comparison/arithmetic/array-method interpreter.
//!
//! Null values referenced immediately ahead of an array-method call site
//! (`.includes(`, `.map(` and friends) are replaced with `[]`, which keeps
//! authoring mistakes from turning into hard failures.
//!
//! The grammar is deliberately bounded: literals, identifiers bound by the
//! caller, `(){}[]`, unary `!`/`-`, the usual binary comparisons and
//! arithmetic, `&&`/`||`, ternaries, and a fixed method set (`length`,
//! `includes`, `join`, `map`, `filter`, `trim`, `toLowerCase`,
//! `toUpperCase`, `startsWith`, `endsWith`).

use crate::context::ExecutionContext;
use crate::resolver::{inline_value, resolve_reference, REFERENCE_RE};
use flowpilot_core::error::{ConditionError, WorkflowError};
use serde_json::{Map, Number, Value};

/// Call sites that expect an array receiver
const ARRAY_METHOD_SITES: [&str; 8] = [
    ".includes(", ".map(", ".filter(", ".join(", ".length", ".some(", ".every(", ".flat(",
];

/// Replace every reference site with JSON-serialized values, honoring
/// quoting context and the null-to-`[]` array-method guard.
pub fn expand_references(
    ctx: &ExecutionContext,
    expression: &str,
) -> Result<String, WorkflowError> {
    let mut result = String::with_capacity(expression.len());
    let mut last = 0;
    for captures in REFERENCE_RE.captures_iter(expression) {
        let whole = captures.get(0).expect("capture 0");
        let reference = captures.get(1).expect("capture 1").as_str();
        result.push_str(&expression[last..whole.start()]);

        let value = resolve_reference(ctx, reference)?;
        let in_quotes = expression[..whole.start()]
            .chars()
            .last()
            .map(|c| c == '"' || c == '\'')
            .unwrap_or(false);

        if in_quotes {
            // raw content; escape so the surrounding literal stays parseable
            let raw = inline_value(&value);
            let escaped = serde_json::to_string(&raw).unwrap_or_default();
            result.push_str(&escaped[1..escaped.len() - 1]);
        } else if value.is_null()
            && ARRAY_METHOD_SITES
                .iter()
                .any(|site| expression[whole.end()..].starts_with(site))
        {
            result.push_str("[]");
        } else {
            result.push_str(&serde_json::to_string(&value).unwrap_or_else(|_| "null".into()));
        }
        last = whole.end();
    }
    result.push_str(&expression[last..]);
    Ok(result)
}

/// Evaluate an expression string against the run state.
///
/// References are expanded first; a structural JSON parse wins, and the
/// bounded interpreter handles everything else. `bindings` supplies
/// caller-scoped identifiers such as `item` and `acc`.
pub fn evaluate_expression(
    ctx: &ExecutionContext,
    expression: &str,
    bindings: &Map<String, Value>,
) -> Result<Value, WorkflowError> {
    let expanded = expand_references(ctx, expression)?;
    let trimmed = expanded.trim();

    if let Ok(parsed) = serde_json::from_str::<Value>(trimmed) {
        return Ok(parsed);
    }

    let mut scope = bindings.clone();
    for (name, value) in &ctx.variables {
        scope.entry(name.clone()).or_insert_with(|| value.clone());
    }
    evaluate_raw(trimmed, &scope).map_err(WorkflowError::from)
}

/// Evaluate an already-expanded expression with explicit bindings
pub fn evaluate_raw(expression: &str, bindings: &Map<String, Value>) -> Result<Value, ConditionError> {
    let tokens = tokenize(expression)?;
    let mut parser = Parser {
        tokens,
        position: 0,
    };
    let expr = parser.parse_expression()?;
    parser.expect_end()?;
    eval(&expr, bindings)
}

/// JS-like truthiness used by predicate contexts
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Literal(Value),
    Ident(String),
    Op(&'static str),
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Dot,
    Question,
    Colon,
    Arrow,
}

fn tokenize(input: &str) -> Result<Vec<Token>, ConditionError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    let peek = |chars: &[char], at: usize| chars.get(at).copied();

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
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            '{' => {
                tokens.push(Token::LBrace);
                i += 1;
            }
            '}' => {
                tokens.push(Token::RBrace);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '?' => {
                tokens.push(Token::Question);
                i += 1;
            }
            ':' => {
                tokens.push(Token::Colon);
                i += 1;
            }
            '\'' | '"' => {
                let quote = c;
                let mut value = String::new();
                i += 1;
                let mut closed = false;
                while i < chars.len() {
                    let ch = chars[i];
                    if ch == '\\' && i + 1 < chars.len() {
                        value.push(match chars[i + 1] {
                            'n' => '\n',
                            't' => '\t',
                            other => other,
                        });
                        i += 2;
                        continue;
                    }
                    if ch == quote {
                        closed = true;
                        i += 1;
                        break;
                    }
                    value.push(ch);
                    i += 1;
                }
                if !closed {
                    return Err(ConditionError::BadExpression(format!(
                        "unterminated string in '{}'",
                        input
                    )));
                }
                tokens.push(Token::Literal(Value::String(value)));
            }
            '=' => {
                if peek(&chars, i + 1) == Some('=') {
                    tokens.push(Token::Op("=="));
                    i += if peek(&chars, i + 2) == Some('=') { 3 } else { 2 };
                } else if peek(&chars, i + 1) == Some('>') {
                    tokens.push(Token::Arrow);
                    i += 2;
                } else {
                    return Err(ConditionError::BadExpression(format!(
                        "unexpected '=' in '{}'",
                        input
                    )));
                }
            }
            '!' => {
                if peek(&chars, i + 1) == Some('=') {
                    tokens.push(Token::Op("!="));
                    i += if peek(&chars, i + 2) == Some('=') { 3 } else { 2 };
                } else {
                    tokens.push(Token::Op("!"));
                    i += 1;
                }
            }
            '>' => {
                if peek(&chars, i + 1) == Some('=') {
                    tokens.push(Token::Op(">="));
                    i += 2;
                } else {
                    tokens.push(Token::Op(">"));
                    i += 1;
                }
            }
            '<' => {
                if peek(&chars, i + 1) == Some('=') {
                    tokens.push(Token::Op("<="));
                    i += 2;
                } else {
                    tokens.push(Token::Op("<"));
                    i += 1;
                }
            }
            '&' if peek(&chars, i + 1) == Some('&') => {
                tokens.push(Token::Op("&&"));
                i += 2;
            }
            '|' if peek(&chars, i + 1) == Some('|') => {
                tokens.push(Token::Op("||"));
                i += 2;
            }
            '+' => {
                tokens.push(Token::Op("+"));
                i += 1;
            }
            '-' => {
                tokens.push(Token::Op("-"));
                i += 1;
            }
            '*' => {
                tokens.push(Token::Op("*"));
                i += 1;
            }
            '/' => {
                tokens.push(Token::Op("/"));
                i += 1;
            }
            '%' => {
                tokens.push(Token::Op("%"));
                i += 1;
            }
            '0'..='9' => {
                let mut text = String::new();
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    text.push(chars[i]);
                    i += 1;
                }
                let number = text.parse::<f64>().map_err(|_| {
                    ConditionError::BadExpression(format!("invalid number '{}'", text))
                })?;
                let value = if number.fract() == 0.0 && !text.contains('.') {
                    Value::Number(Number::from(number as i64))
                } else {
                    Number::from_f64(number)
                        .map(Value::Number)
                        .unwrap_or(Value::Null)
                };
                tokens.push(Token::Literal(value));
            }
            _ if c.is_ascii_alphabetic() || c == '_' || c == '$' => {
                let mut ident = String::new();
                while i < chars.len()
                    && (chars[i].is_ascii_alphanumeric() || chars[i] == '_' || chars[i] == '$')
                {
                    ident.push(chars[i]);
                    i += 1;
                }
                match ident.as_str() {
                    "true" => tokens.push(Token::Literal(Value::Bool(true))),
                    "false" => tokens.push(Token::Literal(Value::Bool(false))),
                    "null" | "undefined" => tokens.push(Token::Literal(Value::Null)),
                    _ => tokens.push(Token::Ident(ident)),
                }
            }
            other => {
                return Err(ConditionError::BadExpression(format!(
                    "unexpected character '{}' in '{}'",
                    other, input
                )))
            }
        }
    }
    Ok(tokens)
}

#[derive(Debug, Clone)]
enum Expr {
    Literal(Value),
    Ident(String),
    Array(Vec<Expr>),
    Unary {
        op: &'static str,
        operand: Box<Expr>,
    },
    Binary {
        op: &'static str,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Ternary {
        condition: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
    Member {
        target: Box<Expr>,
        name: String,
    },
    IndexAccess {
        target: Box<Expr>,
        index: Box<Expr>,
    },
    MethodCall {
        target: Box<Expr>,
        name: String,
        args: Vec<Expr>,
    },
    Arrow {
        param: String,
        body: Box<Expr>,
    },
}

struct Parser {
    tokens: Vec<Token>,
    position: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.position).cloned();
        if token.is_some() {
            self.position += 1;
        }
        token
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.position += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: Token) -> Result<(), ConditionError> {
        if self.eat(&expected) {
            Ok(())
        } else {
            Err(ConditionError::BadExpression(format!(
                "expected {:?}, found {:?}",
                expected,
                self.peek()
            )))
        }
    }

    fn expect_end(&self) -> Result<(), ConditionError> {
        if self.position == self.tokens.len() {
            Ok(())
        } else {
            Err(ConditionError::BadExpression(format!(
                "trailing tokens from {:?}",
                self.peek()
            )))
        }
    }

    fn parse_expression(&mut self) -> Result<Expr, ConditionError> {
        // arrow parameters only occur at call-argument position; handled
        // in parse_args
        let condition = self.parse_or()?;
        if self.eat(&Token::Question) {
            let then = self.parse_expression()?;
            self.expect(Token::Colon)?;
            let otherwise = self.parse_expression()?;
            return Ok(Expr::Ternary {
                condition: Box::new(condition),
                then: Box::new(then),
                otherwise: Box::new(otherwise),
            });
        }
        Ok(condition)
    }

    fn parse_or(&mut self) -> Result<Expr, ConditionError> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Op("||")) {
            self.next();
            let right = self.parse_and()?;
            left = Expr::Binary {
                op: "||",
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ConditionError> {
        let mut left = self.parse_equality()?;
        while self.peek() == Some(&Token::Op("&&")) {
            self.next();
            let right = self.parse_equality()?;
            left = Expr::Binary {
                op: "&&",
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_equality(&mut self) -> Result<Expr, ConditionError> {
        let mut left = self.parse_comparison()?;
        loop {
            let op = match self.peek() {
                Some(Token::Op(op @ ("==" | "!="))) => *op,
                _ => break,
            };
            self.next();
            let right = self.parse_comparison()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_comparison(&mut self) -> Result<Expr, ConditionError> {
        let mut left = self.parse_additive()?;
        loop {
            let op = match self.peek() {
                Some(Token::Op(op @ (">" | ">=" | "<" | "<="))) => *op,
                _ => break,
            };
            self.next();
            let right = self.parse_additive()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_additive(&mut self) -> Result<Expr, ConditionError> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Op(op @ ("+" | "-"))) => *op,
                _ => break,
            };
            self.next();
            let right = self.parse_multiplicative()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, ConditionError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Op(op @ ("*" | "/" | "%"))) => *op,
                _ => break,
            };
            self.next();
            let right = self.parse_unary()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ConditionError> {
        match self.peek() {
            Some(Token::Op("!")) => {
                self.next();
                Ok(Expr::Unary {
                    op: "!",
                    operand: Box::new(self.parse_unary()?),
                })
            }
            Some(Token::Op("-")) => {
                self.next();
                Ok(Expr::Unary {
                    op: "-",
                    operand: Box::new(self.parse_unary()?),
                })
            }
            _ => self.parse_postfix(),
        }
    }

    fn parse_postfix(&mut self) -> Result<Expr, ConditionError> {
        let mut expr = self.parse_primary()?;
        loop {
            if self.eat(&Token::Dot) {
                let name = match self.next() {
                    Some(Token::Ident(name)) => name,
                    other => {
                        return Err(ConditionError::BadExpression(format!(
                            "expected member name, found {:?}",
                            other
                        )))
                    }
                };
                if self.eat(&Token::LParen) {
                    let args = self.parse_args()?;
                    expr = Expr::MethodCall {
                        target: Box::new(expr),
                        name,
                        args,
                    };
                } else {
                    expr = Expr::Member {
                        target: Box::new(expr),
                        name,
                    };
                }
            } else if self.eat(&Token::LBracket) {
                let index = self.parse_expression()?;
                self.expect(Token::RBracket)?;
                expr = Expr::IndexAccess {
                    target: Box::new(expr),
                    index: Box::new(index),
                };
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn parse_args(&mut self) -> Result<Vec<Expr>, ConditionError> {
        let mut args = Vec::new();
        if self.eat(&Token::RParen) {
            return Ok(args);
        }
        loop {
            // arrow shorthand: `x => expr`
            let is_arrow = matches!(
                (self.peek(), self.tokens.get(self.position + 1)),
                (Some(Token::Ident(_)), Some(Token::Arrow))
            );
            if is_arrow {
                let param = match self.next() {
                    Some(Token::Ident(param)) => param,
                    _ => unreachable!("checked by is_arrow"),
                };
                self.next();
                let body = self.parse_expression()?;
                args.push(Expr::Arrow {
                    param,
                    body: Box::new(body),
                });
            } else {
                args.push(self.parse_expression()?);
            }
            if self.eat(&Token::Comma) {
                continue;
            }
            self.expect(Token::RParen)?;
            break;
        }
        Ok(args)
    }

    fn parse_primary(&mut self) -> Result<Expr, ConditionError> {
        match self.next() {
            Some(Token::Literal(value)) => Ok(Expr::Literal(value)),
            Some(Token::Ident(name)) => Ok(Expr::Ident(name)),
            Some(Token::LParen) => {
                let expr = self.parse_expression()?;
                self.expect(Token::RParen)?;
                Ok(expr)
            }
            Some(Token::LBracket) => {
                let mut elements = Vec::new();
                if self.eat(&Token::RBracket) {
                    return Ok(Expr::Array(elements));
                }
                loop {
                    elements.push(self.parse_expression()?);
                    if self.eat(&Token::Comma) {
                        continue;
                    }
                    self.expect(Token::RBracket)?;
                    break;
                }
                Ok(Expr::Array(elements))
            }
            other => Err(ConditionError::BadExpression(format!(
                "unexpected token {:?}",
                other
            ))),
        }
    }
}

fn eval(expr: &Expr, bindings: &Map<String, Value>) -> Result<Value, ConditionError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Ident(name) => Ok(bindings.get(name).cloned().unwrap_or(Value::Null)),
        Expr::Array(elements) => {
            let values: Result<Vec<_>, _> = elements.iter().map(|e| eval(e, bindings)).collect();
            Ok(Value::Array(values?))
        }
        Expr::Unary { op, operand } => {
            let value = eval(operand, bindings)?;
            match *op {
                "!" => Ok(Value::Bool(!truthy(&value))),
                "-" => match value.as_f64() {
                    Some(f) => Ok(number(-f)),
                    None => Err(ConditionError::NotComparable {
                        operator: "-".into(),
                        detail: "operand is not a number".into(),
                    }),
                },
                other => Err(ConditionError::UnknownOperator(other.to_string())),
            }
        }
        Expr::Binary { op, left, right } => eval_binary(op, left, right, bindings),
        Expr::Ternary {
            condition,
            then,
            otherwise,
        } => {
            if truthy(&eval(condition, bindings)?) {
                eval(then, bindings)
            } else {
                eval(otherwise, bindings)
            }
        }
        Expr::Member { target, name } => {
            let value = eval(target, bindings)?;
            match (&value, name.as_str()) {
                (Value::Array(items), "length") => Ok(Value::from(items.len())),
                (Value::String(s), "length") => Ok(Value::from(s.chars().count())),
                (Value::Object(object), _) => Ok(object.get(name).cloned().unwrap_or(Value::Null)),
                (Value::Null, _) => Ok(Value::Null),
                _ => Ok(Value::Null),
            }
        }
        Expr::IndexAccess { target, index } => {
            let value = eval(target, bindings)?;
            let index = eval(index, bindings)?;
            match (&value, &index) {
                (Value::Array(items), Value::Number(n)) => Ok(n
                    .as_u64()
                    .and_then(|i| items.get(i as usize))
                    .cloned()
                    .unwrap_or(Value::Null)),
                (Value::Object(object), Value::String(key)) => {
                    Ok(object.get(key).cloned().unwrap_or(Value::Null))
                }
                _ => Ok(Value::Null),
            }
        }
        Expr::MethodCall { target, name, args } => eval_method(target, name, args, bindings),
        Expr::Arrow { .. } => Err(ConditionError::BadExpression(
            "arrow function outside a method call".into(),
        )),
    }
}

fn number(f: f64) -> Value {
    if f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
        Value::Number(Number::from(f as i64))
    } else {
        Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
    }
}

fn eval_binary(
    op: &str,
    left: &Expr,
    right: &Expr,
    bindings: &Map<String, Value>,
) -> Result<Value, ConditionError> {
    // short-circuit forms first
    if op == "&&" {
        let lhs = eval(left, bindings)?;
        if !truthy(&lhs) {
            return Ok(lhs);
        }
        return eval(right, bindings);
    }
    if op == "||" {
        let lhs = eval(left, bindings)?;
        if truthy(&lhs) {
            return Ok(lhs);
        }
        return eval(right, bindings);
    }

    let lhs = eval(left, bindings)?;
    let rhs = eval(right, bindings)?;
    match op {
        "==" => Ok(Value::Bool(loose_eq(&lhs, &rhs))),
        "!=" => Ok(Value::Bool(!loose_eq(&lhs, &rhs))),
        ">" | ">=" | "<" | "<=" => {
            let ordering = compare(&lhs, &rhs).ok_or_else(|| ConditionError::NotComparable {
                operator: op.to_string(),
                detail: format!("{:?} vs {:?}", lhs, rhs),
            })?;
            Ok(Value::Bool(match op {
                ">" => ordering == std::cmp::Ordering::Greater,
                ">=" => ordering != std::cmp::Ordering::Less,
                "<" => ordering == std::cmp::Ordering::Less,
                _ => ordering != std::cmp::Ordering::Greater,
            }))
        }
        "+" => match (&lhs, &rhs) {
            (Value::String(a), b) => Ok(Value::String(format!("{}{}", a, inline_value(b)))),
            (a, Value::String(b)) => Ok(Value::String(format!("{}{}", inline_value(a), b))),
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => Ok(number(x + y)),
                _ => Err(ConditionError::NotComparable {
                    operator: "+".into(),
                    detail: "operands are neither numbers nor strings".into(),
                }),
            },
        },
        "-" | "*" | "/" | "%" => match (lhs.as_f64(), rhs.as_f64()) {
            (Some(x), Some(y)) => Ok(match op {
                "-" => number(x - y),
                "*" => number(x * y),
                "/" => {
                    if y == 0.0 {
                        Value::Null
                    } else {
                        number(x / y)
                    }
                }
                _ => {
                    if y == 0.0 {
                        Value::Null
                    } else {
                        number(x % y)
                    }
                }
            }),
            _ => Err(ConditionError::NotComparable {
                operator: op.to_string(),
                detail: "operands are not numbers".into(),
            }),
        },
        other => Err(ConditionError::UnknownOperator(other.to_string())),
    }
}

/// Loose equality: numbers compare numerically, numeric strings compare
/// against numbers, everything else structurally
pub fn loose_eq(left: &Value, right: &Value) -> bool {
    if left == right {
        return true;
    }
    match (left.as_f64(), right.as_f64()) {
        (Some(a), Some(b)) => return a == b,
        _ => {}
    }
    match (left, right) {
        (Value::String(s), other) | (other, Value::String(s)) => {
            if let (Ok(parsed), Some(num)) = (s.parse::<f64>(), other.as_f64()) {
                return parsed == num;
            }
            false
        }
        _ => false,
    }
}

/// Ordering for comparison operators: numeric when both sides parse as
/// numbers, lexicographic for strings
pub fn compare(left: &Value, right: &Value) -> Option<std::cmp::Ordering> {
    let left_num = left
        .as_f64()
        .or_else(|| left.as_str().and_then(|s| s.parse::<f64>().ok()));
    let right_num = right
        .as_f64()
        .or_else(|| right.as_str().and_then(|s| s.parse::<f64>().ok()));
    if let (Some(a), Some(b)) = (left_num, right_num) {
        return a.partial_cmp(&b);
    }
    match (left, right) {
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn eval_method(
    target: &Expr,
    name: &str,
    args: &[Expr],
    bindings: &Map<String, Value>,
) -> Result<Value, ConditionError> {
    let receiver = eval(target, bindings)?;
    match (receiver, name) {
        (Value::Array(items), "includes") => {
            let needle = args
                .first()
                .map(|a| eval(a, bindings))
                .transpose()?
                .unwrap_or(Value::Null);
            Ok(Value::Bool(items.iter().any(|item| loose_eq(item, &needle))))
        }
        (Value::String(s), "includes") => {
            let needle = args
                .first()
                .map(|a| eval(a, bindings))
                .transpose()?
                .unwrap_or(Value::Null);
            Ok(Value::Bool(match needle {
                Value::String(sub) => s.contains(&sub),
                other => s.contains(&inline_value(&other)),
            }))
        }
        (Value::Array(items), "join") => {
            let separator = match args.first().map(|a| eval(a, bindings)).transpose()? {
                Some(Value::String(s)) => s,
                _ => ",".to_string(),
            };
            Ok(Value::String(
                items
                    .iter()
                    .map(inline_value)
                    .collect::<Vec<_>>()
                    .join(&separator),
            ))
        }
        (Value::Array(items), "map") => {
            let (param, body) = arrow_arg(args, "map")?;
            let mut mapped = Vec::with_capacity(items.len());
            for item in items {
                let mut scope = bindings.clone();
                scope.insert(param.clone(), item);
                mapped.push(eval(body, &scope)?);
            }
            Ok(Value::Array(mapped))
        }
        (Value::Array(items), "filter") => {
            let (param, body) = arrow_arg(args, "filter")?;
            let mut kept = Vec::new();
            for item in items {
                let mut scope = bindings.clone();
                scope.insert(param.clone(), item.clone());
                if truthy(&eval(body, &scope)?) {
                    kept.push(item);
                }
            }
            Ok(Value::Array(kept))
        }
        (Value::Array(items), "some") => {
            let (param, body) = arrow_arg(args, "some")?;
            for item in items {
                let mut scope = bindings.clone();
                scope.insert(param.clone(), item);
                if truthy(&eval(body, &scope)?) {
                    return Ok(Value::Bool(true));
                }
            }
            Ok(Value::Bool(false))
        }
        (Value::Array(items), "every") => {
            let (param, body) = arrow_arg(args, "every")?;
            for item in items {
                let mut scope = bindings.clone();
                scope.insert(param.clone(), item);
                if !truthy(&eval(body, &scope)?) {
                    return Ok(Value::Bool(false));
                }
            }
            Ok(Value::Bool(true))
        }
        (Value::Array(items), "flat") => {
            let mut flattened = Vec::new();
            for item in items {
                match item {
                    Value::Array(inner) => flattened.extend(inner),
                    other => flattened.push(other),
                }
            }
            Ok(Value::Array(flattened))
        }
        (Value::String(s), "trim") => Ok(Value::String(s.trim().to_string())),
        (Value::String(s), "toLowerCase") => Ok(Value::String(s.to_lowercase())),
        (Value::String(s), "toUpperCase") => Ok(Value::String(s.to_uppercase())),
        (Value::String(s), "startsWith") => {
            let prefix = string_arg(args, bindings)?;
            Ok(Value::Bool(s.starts_with(&prefix)))
        }
        (Value::String(s), "endsWith") => {
            let suffix = string_arg(args, bindings)?;
            Ok(Value::Bool(s.ends_with(&suffix)))
        }
        (Value::Null, _) => Ok(Value::Null),
        (receiver, name) => Err(ConditionError::BadExpression(format!(
            "method '{}' is not supported on {:?}",
            name, receiver
        ))),
    }
}

fn arrow_arg<'a>(args: &'a [Expr], method: &str) -> Result<(&'a String, &'a Expr), ConditionError> {
    match args.first() {
        Some(Expr::Arrow { param, body }) => Ok((param, body)),
        _ => Err(ConditionError::BadExpression(format!(
            "'{}' requires an arrow argument",
            method
        ))),
    }
}

fn string_arg(args: &[Expr], bindings: &Map<String, Value>) -> Result<String, ConditionError> {
    let value = args
        .first()
        .map(|a| eval(a, bindings))
        .transpose()?
        .unwrap_or(Value::Null);
    Ok(inline_value(&value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowpilot_core::types::{AgentProfile, StepMetadata, StepOutput};
    use serde_json::json;

    fn bindings(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_comparisons() {
        let b = bindings(&[("item", json!({"score": 7}))]);
        assert_eq!(evaluate_raw("item.score > 5", &b).unwrap(), json!(true));
        assert_eq!(evaluate_raw("item.score == 7", &b).unwrap(), json!(true));
        assert_eq!(evaluate_raw("item.score >= 8", &b).unwrap(), json!(false));
    }

    #[test]
    fn test_numeric_string_loose_equality() {
        let b = bindings(&[]);
        assert_eq!(evaluate_raw("'7' == 7", &b).unwrap(), json!(true));
        assert_eq!(evaluate_raw("'7.5' > 7", &b).unwrap(), json!(true));
    }

    #[test]
    fn test_arithmetic_and_ternary() {
        let b = bindings(&[("item", json!({"id": 3}))]);
        assert_eq!(evaluate_raw("item.id * 10", &b).unwrap(), json!(30));
        assert_eq!(
            evaluate_raw("item.id > 2 ? 'big' : 'small'", &b).unwrap(),
            json!("big")
        );
    }

    #[test]
    fn test_array_methods() {
        let b = bindings(&[("tags", json!(["a", "b"]))]);
        assert_eq!(evaluate_raw("tags.includes('a')", &b).unwrap(), json!(true));
        assert_eq!(evaluate_raw("tags.length", &b).unwrap(), json!(2));
        assert_eq!(evaluate_raw("tags.join('-')", &b).unwrap(), json!("a-b"));
    }

    #[test]
    fn test_map_with_arrow() {
        let b = bindings(&[("item", json!([[1, "x"], [2, "y"]]))]);
        assert_eq!(
            evaluate_raw("item.map(x => x[0])", &b).unwrap(),
            json!([1, 2])
        );
    }

    #[test]
    fn test_filter_with_arrow() {
        let b = bindings(&[("rows", json!([{"n": 1}, {"n": 5}]))]);
        assert_eq!(
            evaluate_raw("rows.filter(r => r.n > 2)", &b).unwrap(),
            json!([{"n": 5}])
        );
    }

    #[test]
    fn test_logical_short_circuit() {
        let b = bindings(&[]);
        assert_eq!(
            evaluate_raw("false && missing.method()", &b).unwrap(),
            json!(false)
        );
        assert_eq!(evaluate_raw("'x' || 'y'", &b).unwrap(), json!("x"));
    }

    #[test]
    fn test_expand_null_before_array_method() {
        let mut ctx = ExecutionContext::new("e", "u", AgentProfile::default());
        ctx.set_step_output(
            "s",
            StepOutput::new("s", "t", "r", json!({"list": null}), StepMetadata::success(1)),
        );
        let expanded = expand_references(&ctx, "{{s.list}}.includes('a')").unwrap();
        assert_eq!(expanded, "[].includes('a')");
        let value = evaluate_expression(&ctx, "{{s.list}}.includes('a')", &Map::new()).unwrap();
        assert_eq!(value, json!(false));
    }

    #[test]
    fn test_quoted_reference_inserts_raw_content() {
        let mut ctx = ExecutionContext::new("e", "u", AgentProfile::default());
        ctx.set_step_output(
            "email",
            StepOutput::new("email", "t", "r", json!({"id": "m-1"}), StepMetadata::success(1)),
        );
        let value = evaluate_expression(&ctx, "[\"{{email.id}}\"]", &Map::new()).unwrap();
        assert_eq!(value, json!(["m-1"]));
    }

    #[test]
    fn test_json_parse_wins() {
        let ctx = ExecutionContext::new("e", "u", AgentProfile::default());
        let value = evaluate_expression(&ctx, "{\"a\": [1, 2]}", &Map::new()).unwrap();
        assert_eq!(value, json!({"a": [1, 2]}));
    }

    #[test]
    fn test_unresolved_reference_fails() {
        let ctx = ExecutionContext::new("e", "u", AgentProfile::default());
        assert!(evaluate_expression(&ctx, "{{ghost.field}} == 1", &Map::new()).is_err());
    }
}
