//! Default expression language for rule conditions and value mappings.
//!
//! Expressions read the execution context and never mutate it. Operators
//! follow JavaScript value semantics: `&&`/`||` return an operand, `+`
//! concatenates when either side is a string, `==` coerces and `===` does not.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use parking_lot::RwLock;
use serde_json::{Map as JsonMap, Value};
use uuid::Uuid;

use super::Evaluator;
use crate::{Error, Result, filter::json};

#[derive(Clone, Debug, PartialEq)]
enum Expr {
    Literal(Value),
    Var(String),
    Array(Vec<Expr>),
    Member(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Neg(Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Ternary(Box<Expr>, Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    LooseEq,
    LooseNe,
    StrictEq,
    StrictNe,
    Lt,
    Lte,
    Gt,
    Gte,
}

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    Punct(&'static str),
}

// Longest first so `===` wins over `==` and `=`.
const PUNCTUATION: &[&str] = &[
    "===", "!==", "==", "!=", "<=", ">=", "&&", "||", "<", ">", "+", "-", "*", "/", "%", "!",
    "?", ":", "(", ")", "[", "]", ",", ".",
];

fn tokenize(src: &str) -> std::result::Result<Vec<Token>, String> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let ch = chars[i];
        if ch.is_whitespace() {
            i += 1;
            continue;
        }
        if ch.is_ascii_digit() {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            let text: String = chars[start..i].iter().collect();
            let number = text
                .parse::<f64>()
                .map_err(|_| format!("invalid number `{text}`"))?;
            tokens.push(Token::Number(number));
            continue;
        }
        if ch == '\'' || ch == '"' {
            let quote = ch;
            let mut text = String::new();
            i += 1;
            loop {
                match chars.get(i) {
                    None => return Err("unterminated string".to_string()),
                    Some(c) if *c == quote => {
                        i += 1;
                        break;
                    }
                    Some('\\') => {
                        let escaped = chars.get(i + 1).ok_or("unterminated string")?;
                        text.push(match escaped {
                            'n' => '\n',
                            't' => '\t',
                            other => *other,
                        });
                        i += 2;
                    }
                    Some(c) => {
                        text.push(*c);
                        i += 1;
                    }
                }
            }
            tokens.push(Token::Str(text));
            continue;
        }
        if ch.is_alphabetic() || ch == '_' || ch == '$' {
            let start = i;
            while i < chars.len()
                && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '$')
            {
                i += 1;
            }
            tokens.push(Token::Ident(chars[start..i].iter().collect()));
            continue;
        }
        let rest: String = chars[i..chars.len().min(i + 3)].iter().collect();
        match PUNCTUATION.iter().find(|p| rest.starts_with(**p)) {
            Some(punct) => {
                tokens.push(Token::Punct(punct));
                i += punct.len();
            }
            None => return Err(format!("unexpected character `{ch}`")),
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

type ParseResult = std::result::Result<Expr, String>;

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn eat(&mut self, punct: &str) -> bool {
        if matches!(self.peek(), Some(Token::Punct(p)) if *p == punct) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, punct: &str) -> std::result::Result<(), String> {
        if self.eat(punct) {
            Ok(())
        } else {
            Err(format!("expected `{punct}`"))
        }
    }

    fn parse(mut self) -> ParseResult {
        let expr = self.ternary()?;
        match self.peek() {
            None => Ok(expr),
            Some(token) => Err(format!("unexpected trailing token {token:?}")),
        }
    }

    fn ternary(&mut self) -> ParseResult {
        let condition = self.or()?;
        if !self.eat("?") {
            return Ok(condition);
        }
        let then = self.ternary()?;
        self.expect(":")?;
        let otherwise = self.ternary()?;
        Ok(Expr::Ternary(
            Box::new(condition),
            Box::new(then),
            Box::new(otherwise),
        ))
    }

    fn or(&mut self) -> ParseResult {
        let mut left = self.and()?;
        while self.eat("||") {
            left = Expr::Or(Box::new(left), Box::new(self.and()?));
        }
        Ok(left)
    }

    fn and(&mut self) -> ParseResult {
        let mut left = self.equality()?;
        while self.eat("&&") {
            left = Expr::And(Box::new(left), Box::new(self.equality()?));
        }
        Ok(left)
    }

    fn binary_level(
        &mut self,
        ops: &[(&str, BinaryOp)],
        next: fn(&mut Self) -> ParseResult,
    ) -> ParseResult {
        let mut left = next(self)?;
        'outer: loop {
            for (punct, op) in ops {
                if self.eat(punct) {
                    left = Expr::Binary(*op, Box::new(left), Box::new(next(self)?));
                    continue 'outer;
                }
            }
            return Ok(left);
        }
    }

    fn equality(&mut self) -> ParseResult {
        self.binary_level(
            &[
                ("===", BinaryOp::StrictEq),
                ("!==", BinaryOp::StrictNe),
                ("==", BinaryOp::LooseEq),
                ("!=", BinaryOp::LooseNe),
            ],
            Self::comparison,
        )
    }

    fn comparison(&mut self) -> ParseResult {
        self.binary_level(
            &[
                ("<=", BinaryOp::Lte),
                (">=", BinaryOp::Gte),
                ("<", BinaryOp::Lt),
                (">", BinaryOp::Gt),
            ],
            Self::additive,
        )
    }

    fn additive(&mut self) -> ParseResult {
        self.binary_level(
            &[("+", BinaryOp::Add), ("-", BinaryOp::Sub)],
            Self::multiplicative,
        )
    }

    fn multiplicative(&mut self) -> ParseResult {
        self.binary_level(
            &[
                ("*", BinaryOp::Mul),
                ("/", BinaryOp::Div),
                ("%", BinaryOp::Rem),
            ],
            Self::unary,
        )
    }

    fn unary(&mut self) -> ParseResult {
        if self.eat("!") {
            return Ok(Expr::Not(Box::new(self.unary()?)));
        }
        if self.eat("-") {
            return Ok(Expr::Neg(Box::new(self.unary()?)));
        }
        self.postfix()
    }

    fn postfix(&mut self) -> ParseResult {
        let mut expr = self.primary()?;
        loop {
            if self.eat(".") {
                match self.tokens.get(self.pos).cloned() {
                    Some(Token::Ident(name)) => {
                        self.pos += 1;
                        expr = Expr::Member(Box::new(expr), name);
                    }
                    _ => return Err("expected property name after `.`".to_string()),
                }
            } else if self.eat("[") {
                let index = self.ternary()?;
                self.expect("]")?;
                expr = Expr::Index(Box::new(expr), Box::new(index));
            } else {
                return Ok(expr);
            }
        }
    }

    fn list(&mut self, close: &str) -> std::result::Result<Vec<Expr>, String> {
        let mut items = Vec::new();
        if self.eat(close) {
            return Ok(items);
        }
        loop {
            items.push(self.ternary()?);
            if self.eat(close) {
                return Ok(items);
            }
            self.expect(",")?;
        }
    }

    fn primary(&mut self) -> ParseResult {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or_else(|| "unexpected end of expression".to_string())?;
        self.pos += 1;
        match token {
            Token::Number(n) => Ok(Expr::Literal(number(n))),
            Token::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Token::Ident(name) => match name.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" | "undefined" => Ok(Expr::Literal(Value::Null)),
                _ if self.eat("(") => Ok(Expr::Call(name, self.list(")")?)),
                _ => Ok(Expr::Var(name)),
            },
            Token::Punct("(") => {
                let inner = self.ternary()?;
                self.expect(")")?;
                Ok(inner)
            }
            Token::Punct("[") => Ok(Expr::Array(self.list("]")?)),
            Token::Punct(p) => Err(format!("unexpected `{p}`")),
        }
    }
}

fn parse(src: &str) -> Result<Expr> {
    let tokens = tokenize(src).map_err(|reason| Error::expression(src, reason))?;
    Parser { tokens, pos: 0 }
        .parse()
        .map_err(|reason| Error::expression(src, reason))
}

/// JavaScript truthiness.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn number(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

fn to_number(value: &Value) -> f64 {
    match value {
        Value::Null => 0.0,
        Value::Bool(b) => f64::from(u8::from(*b)),
        Value::Number(n) => n.as_f64().unwrap_or(f64::NAN),
        Value::String(s) if s.trim().is_empty() => 0.0,
        Value::String(s) => s.trim().parse().unwrap_or(f64::NAN),
        Value::Array(_) | Value::Object(_) => f64::NAN,
    }
}

fn to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => match n.as_f64() {
            Some(f) if f.fract() == 0.0 && f.abs() < 1e21 => format!("{}", f as i64),
            _ => n.to_string(),
        },
        other => other.to_string(),
    }
}

fn loose_eq(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Null, Value::Null) => true,
        (Value::Null, _) | (_, Value::Null) => false,
        (Value::Number(_), Value::String(_))
        | (Value::String(_), Value::Number(_))
        | (Value::Bool(_), _)
        | (_, Value::Bool(_)) => to_number(left) == to_number(right),
        _ => json::json_eq(left, right),
    }
}

fn relational(op: BinaryOp, left: &Value, right: &Value) -> bool {
    let ordering = match (left, right) {
        (Value::String(l), Value::String(r)) => Some(l.cmp(r)),
        _ => to_number(left).partial_cmp(&to_number(right)),
    };
    let Some(ordering) = ordering else {
        return false;
    };
    match op {
        BinaryOp::Lt => ordering.is_lt(),
        BinaryOp::Lte => ordering.is_le(),
        BinaryOp::Gt => ordering.is_gt(),
        _ => ordering.is_ge(),
    }
}

fn index_into(target: &Value, key: &Value) -> Value {
    match (target, key) {
        (Value::Array(items), Value::Number(n)) => n
            .as_u64()
            .and_then(|i| items.get(i as usize))
            .cloned()
            .unwrap_or(Value::Null),
        (Value::Array(items), Value::String(name)) if name == "length" => {
            Value::from(items.len())
        }
        (Value::String(s), Value::String(name)) if name == "length" => {
            Value::from(s.chars().count())
        }
        (Value::Object(map), key) => map.get(&to_text(key)).cloned().unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

struct Scope<'a> {
    src: &'a str,
    context: &'a Value,
}

impl Scope<'_> {
    fn eval(&self, expr: &Expr) -> Result<Value> {
        Ok(match expr {
            Expr::Literal(value) => value.clone(),
            Expr::Var(name) => self
                .context
                .get(name.as_str())
                .cloned()
                .unwrap_or(Value::Null),
            Expr::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.eval(item))
                    .collect::<Result<_>>()?,
            ),
            Expr::Member(target, name) => {
                index_into(&self.eval(target)?, &Value::String(name.clone()))
            }
            Expr::Index(target, key) => index_into(&self.eval(target)?, &self.eval(key)?),
            Expr::Not(inner) => Value::Bool(!truthy(&self.eval(inner)?)),
            Expr::Neg(inner) => number(-to_number(&self.eval(inner)?)),
            Expr::And(left, right) => {
                let left = self.eval(left)?;
                if truthy(&left) { self.eval(right)? } else { left }
            }
            Expr::Or(left, right) => {
                let left = self.eval(left)?;
                if truthy(&left) { left } else { self.eval(right)? }
            }
            Expr::Ternary(condition, then, otherwise) => {
                if truthy(&self.eval(condition)?) {
                    self.eval(then)?
                } else {
                    self.eval(otherwise)?
                }
            }
            Expr::Binary(op, left, right) => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                self.binary(*op, &left, &right)?
            }
            Expr::Call(name, args) => {
                let args: Vec<Value> = args
                    .iter()
                    .map(|arg| self.eval(arg))
                    .collect::<Result<_>>()?;
                self.call(name, args)?
            }
        })
    }

    fn binary(&self, op: BinaryOp, left: &Value, right: &Value) -> Result<Value> {
        Ok(match op {
            BinaryOp::Add if left.is_string() || right.is_string() => {
                Value::String(format!("{}{}", to_text(left), to_text(right)))
            }
            BinaryOp::Add => number(to_number(left) + to_number(right)),
            BinaryOp::Sub => number(to_number(left) - to_number(right)),
            BinaryOp::Mul => number(to_number(left) * to_number(right)),
            BinaryOp::Div | BinaryOp::Rem => {
                let divisor = to_number(right);
                if divisor == 0.0 {
                    return Err(Error::expression(self.src, "division by zero"));
                }
                let dividend = to_number(left);
                if op == BinaryOp::Div {
                    number(dividend / divisor)
                } else {
                    number(dividend % divisor)
                }
            }
            BinaryOp::LooseEq => Value::Bool(loose_eq(left, right)),
            BinaryOp::LooseNe => Value::Bool(!loose_eq(left, right)),
            BinaryOp::StrictEq => Value::Bool(json::json_eq(left, right)),
            BinaryOp::StrictNe => Value::Bool(!json::json_eq(left, right)),
            BinaryOp::Lt | BinaryOp::Lte | BinaryOp::Gt | BinaryOp::Gte => {
                Value::Bool(relational(op, left, right))
            }
        })
    }

    fn call(&self, name: &str, args: Vec<Value>) -> Result<Value> {
        let first = args.first().cloned().unwrap_or(Value::Null);
        Ok(match name {
            "count" => Value::from(match &first {
                Value::Array(items) => items.len(),
                Value::Object(map) => map.len(),
                Value::String(s) => s.chars().count(),
                _ => 0,
            }),
            "isEmpty" => Value::Bool(match &first {
                Value::Null => true,
                Value::Array(items) => items.is_empty(),
                Value::Object(map) => map.is_empty(),
                Value::String(s) => s.is_empty(),
                _ => false,
            }),
            "uuid" => Value::String(Uuid::new_v4().to_string()),
            "now" => Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
            "lower" => Value::String(to_text(&first).to_lowercase()),
            "upper" => Value::String(to_text(&first).to_uppercase()),
            "string" => Value::String(to_text(&first)),
            "number" => number(to_number(&first)),
            "merge" => {
                let mut merged = JsonMap::new();
                for arg in args {
                    match arg {
                        Value::Object(map) => merged.extend(map),
                        Value::Null => {}
                        other => {
                            return Err(Error::expression(
                                self.src,
                                format!("merge expects objects, got {other}"),
                            ));
                        }
                    }
                }
                Value::Object(merged)
            }
            other => {
                return Err(Error::expression(
                    self.src,
                    format!("unknown function `{other}`"),
                ));
            }
        })
    }
}

const DEFAULT_CACHE_CAPACITY: usize = 1024;

/// Parses each distinct expression once and caches the tree.
///
/// The cache is cleared whenever it reaches its capacity, so expressions
/// assembled from data cannot grow it without bound.
pub struct ExprEvaluator {
    parsed: RwLock<HashMap<String, Arc<Expr>>>,
    capacity: usize,
}

impl Default for ExprEvaluator {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CACHE_CAPACITY)
    }
}

impl std::fmt::Debug for ExprEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExprEvaluator")
            .field("cached", &self.parsed.read().len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl ExprEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            parsed: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn cached(&self) -> usize {
        self.parsed.read().len()
    }

    fn compiled(&self, expr: &str) -> Result<Arc<Expr>> {
        if let Some(tree) = self.parsed.read().get(expr) {
            return Ok(tree.clone());
        }
        let tree = Arc::new(parse(expr)?);
        let mut parsed = self.parsed.write();
        if parsed.len() >= self.capacity {
            tracing::trace!(target: "docket::rules", evicted = parsed.len(), "expression cache cleared");
            parsed.clear();
        }
        parsed.insert(expr.to_string(), tree.clone());
        Ok(tree)
    }
}

impl Evaluator for ExprEvaluator {
    fn evaluate(&self, expr: &str, context: &Value) -> Result<Value> {
        let tree = self.compiled(expr)?;
        Scope { src: expr, context }.eval(&tree)
    }
}
