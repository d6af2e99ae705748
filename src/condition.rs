//! Sandboxed expression evaluation for conditional chain steps.
//!
//! A dedicated lexer, parser, and evaluator over a closed grammar: literals,
//! identifiers, property access, comparisons, boolean and arithmetic
//! operators, and a fixed helper set under `utils`. No assignments, loops,
//! function definitions, imports, I/O, or reflection. Expressions are never
//! handed to a general-purpose language runtime.

use crate::error::{PromptForgeError, Result};
use serde_json::{Map, Value};
use std::time::{Duration, Instant};

/// Input size cap, matching the conservative limits of the grammar.
const MAX_EXPR_BYTES: usize = 4096;
/// Parser recursion cap.
const MAX_DEPTH: usize = 32;

/// Identifiers that cause outright rejection before parsing.
const DENYLIST: &[&str] = &[
    "eval", "require", "import", "process", "system", "exec", "open", "file", "fs", "net",
    "fetch", "socket", "spawn", "child_process", "subprocess", "globalthis", "constructor",
    "__proto__",
];

/// Bindings visible to an expression.
#[derive(Debug, Clone, Default)]
pub struct ConditionContext {
    /// Prior step results keyed by step id: `{result: string, success: bool}`
    pub steps: Map<String, Value>,
    /// Chain variables
    pub vars: Map<String, Value>,
}

impl ConditionContext {
    pub fn insert_step(&mut self, step_id: &str, result: &str, success: bool) {
        let mut entry = Map::new();
        entry.insert("result".to_string(), Value::String(result.to_string()));
        entry.insert("success".to_string(), Value::Bool(success));
        self.steps.insert(step_id.to_string(), Value::Object(entry));
    }
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Str(String),
    True,
    False,
    Null,
    Dot,
    Comma,
    LParen,
    RParen,
    Not,
    And,
    Or,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
}

fn lex(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '%' => {
                tokens.push(Token::Percent);
                i += 1;
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
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Eq);
                    i += 2;
                } else {
                    return Err(reject("assignment is not allowed"));
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
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ge);
                    i += 2;
                } else {
                    tokens.push(Token::Gt);
                    i += 1;
                }
            }
            '&' => {
                if chars.get(i + 1) == Some(&'&') {
                    tokens.push(Token::And);
                    i += 2;
                } else {
                    return Err(reject("'&' is not an operator; use '&&'"));
                }
            }
            '|' => {
                if chars.get(i + 1) == Some(&'|') {
                    tokens.push(Token::Or);
                    i += 2;
                } else {
                    return Err(reject("'|' is not an operator; use '||'"));
                }
            }
            '\'' | '"' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some('\\') => {
                            match chars.get(i + 1) {
                                Some(&esc) => s.push(esc),
                                None => return Err(reject("unterminated escape")),
                            }
                            i += 2;
                        }
                        Some(&ch) => {
                            s.push(ch);
                            i += 1;
                        }
                        None => return Err(reject("unterminated string literal")),
                    }
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n = text.parse::<f64>().map_err(|_| reject("malformed number"))?;
                tokens.push(Token::Number(n));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                match word.as_str() {
                    "true" => tokens.push(Token::True),
                    "false" => tokens.push(Token::False),
                    "null" => tokens.push(Token::Null),
                    _ => tokens.push(Token::Ident(word)),
                }
            }
            other => {
                return Err(reject(&format!("unexpected character '{}'", other)));
            }
        }
    }

    Ok(tokens)
}

fn reject(message: &str) -> PromptForgeError {
    PromptForgeError::ExpressionRejected {
        message: message.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum BinOp {
    And,
    Or,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Ident(String),
    Property(Box<Expr>, String),
    /// Helper call: only `utils.<helper>(args)` survives evaluation
    Call {
        target: Box<Expr>,
        args: Vec<Expr>,
    },
    Not(Box<Expr>),
    Neg(Box<Expr>),
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
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
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expression(&mut self, depth: usize) -> Result<Expr> {
        if depth > MAX_DEPTH {
            return Err(reject("expression nests too deeply"));
        }
        self.or_expr(depth)
    }

    fn or_expr(&mut self, depth: usize) -> Result<Expr> {
        let mut lhs = self.and_expr(depth)?;
        while self.eat(&Token::Or) {
            let rhs = self.and_expr(depth)?;
            lhs = Expr::Binary {
                op: BinOp::Or,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn and_expr(&mut self, depth: usize) -> Result<Expr> {
        let mut lhs = self.equality(depth)?;
        while self.eat(&Token::And) {
            let rhs = self.equality(depth)?;
            lhs = Expr::Binary {
                op: BinOp::And,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn equality(&mut self, depth: usize) -> Result<Expr> {
        let mut lhs = self.comparison(depth)?;
        loop {
            let op = match self.peek() {
                Some(Token::Eq) => BinOp::Eq,
                Some(Token::Ne) => BinOp::Ne,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.comparison(depth)?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn comparison(&mut self, depth: usize) -> Result<Expr> {
        let mut lhs = self.additive(depth)?;
        loop {
            let op = match self.peek() {
                Some(Token::Lt) => BinOp::Lt,
                Some(Token::Le) => BinOp::Le,
                Some(Token::Gt) => BinOp::Gt,
                Some(Token::Ge) => BinOp::Ge,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.additive(depth)?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn additive(&mut self, depth: usize) -> Result<Expr> {
        let mut lhs = self.multiplicative(depth)?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.multiplicative(depth)?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn multiplicative(&mut self, depth: usize) -> Result<Expr> {
        let mut lhs = self.unary(depth)?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                Some(Token::Percent) => BinOp::Rem,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.unary(depth)?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn unary(&mut self, depth: usize) -> Result<Expr> {
        if self.eat(&Token::Not) {
            return Ok(Expr::Not(Box::new(self.unary(depth + 1)?)));
        }
        if self.eat(&Token::Minus) {
            return Ok(Expr::Neg(Box::new(self.unary(depth + 1)?)));
        }
        self.postfix(depth)
    }

    fn postfix(&mut self, depth: usize) -> Result<Expr> {
        let mut expr = self.primary(depth)?;
        loop {
            if self.eat(&Token::Dot) {
                match self.advance() {
                    Some(Token::Ident(name)) => {
                        expr = Expr::Property(Box::new(expr), name);
                    }
                    _ => return Err(reject("expected identifier after '.'")),
                }
            } else if self.eat(&Token::LParen) {
                let mut args = Vec::new();
                if self.peek() != Some(&Token::RParen) {
                    loop {
                        args.push(self.expression(depth + 1)?);
                        if !self.eat(&Token::Comma) {
                            break;
                        }
                    }
                }
                if !self.eat(&Token::RParen) {
                    return Err(reject("expected ')' after call arguments"));
                }
                expr = Expr::Call {
                    target: Box::new(expr),
                    args,
                };
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn primary(&mut self, depth: usize) -> Result<Expr> {
        match self.advance() {
            Some(Token::Number(n)) => Ok(Expr::Literal(
                serde_json::Number::from_f64(n)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
            )),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::True) => Ok(Expr::Literal(Value::Bool(true))),
            Some(Token::False) => Ok(Expr::Literal(Value::Bool(false))),
            Some(Token::Null) => Ok(Expr::Literal(Value::Null)),
            Some(Token::Ident(name)) => Ok(Expr::Ident(name)),
            Some(Token::LParen) => {
                let inner = self.expression(depth + 1)?;
                if !self.eat(&Token::RParen) {
                    return Err(reject("expected ')'"));
                }
                Ok(inner)
            }
            other => Err(reject(&format!("unexpected token {:?}", other))),
        }
    }
}

/// Screen and parse without evaluating. Used at load time to fail fast.
pub fn check_expression(input: &str) -> Result<()> {
    parse(input).map(|_| ())
}

fn parse(input: &str) -> Result<Expr> {
    if input.len() > MAX_EXPR_BYTES {
        return Err(reject("expression too long"));
    }

    // Denylist screen runs before the parser sees anything.
    let lowered = input.to_lowercase();
    for banned in DENYLIST {
        let hit = lowered
            .match_indices(banned)
            .any(|(at, _)| is_word_boundary(&lowered, at, banned.len()));
        if hit {
            return Err(reject(&format!("forbidden identifier '{}'", banned)));
        }
    }

    let tokens = lex(input)?;
    if tokens.is_empty() {
        return Err(reject("empty expression"));
    }
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.expression(0)?;
    if parser.pos != parser.tokens.len() {
        return Err(reject("trailing tokens after expression"));
    }
    Ok(expr)
}

fn is_word_boundary(haystack: &str, at: usize, len: usize) -> bool {
    let before = haystack[..at].chars().next_back();
    let after = haystack[at + len..].chars().next();
    let is_word = |c: Option<char>| c.is_some_and(|c| c.is_ascii_alphanumeric() || c == '_');
    !is_word(before) && !is_word(after)
}

// ---------------------------------------------------------------------------
// Evaluator
// ---------------------------------------------------------------------------

struct Evaluator<'a> {
    ctx: &'a ConditionContext,
    deadline: Instant,
}

impl Evaluator<'_> {
    fn eval(&self, expr: &Expr) -> Result<Value> {
        if Instant::now() > self.deadline {
            return Err(PromptForgeError::ExpressionTimeout { timeout_ms: 0 });
        }

        match expr {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Ident(name) => match name.as_str() {
                "steps" => Ok(Value::Object(self.ctx.steps.clone())),
                "vars" => Ok(Value::Object(self.ctx.vars.clone())),
                "utils" => Err(PromptForgeError::ExpressionFailed {
                    message: "'utils' can only be called, not read".to_string(),
                }),
                other => Err(PromptForgeError::ExpressionFailed {
                    message: format!("unknown identifier '{}'", other),
                }),
            },
            Expr::Property(base, name) => {
                let value = self.eval(base)?;
                match value {
                    Value::Object(map) => Ok(map.get(name).cloned().unwrap_or(Value::Null)),
                    _ => Ok(Value::Null),
                }
            }
            Expr::Call { target, args } => self.call(target, args),
            Expr::Not(inner) => Ok(Value::Bool(!truthy(&self.eval(inner)?))),
            Expr::Neg(inner) => {
                let v = self.eval(inner)?;
                let n = as_number(&v).ok_or_else(|| PromptForgeError::ExpressionFailed {
                    message: "cannot negate a non-number".to_string(),
                })?;
                Ok(number(-n))
            }
            Expr::Binary { op, lhs, rhs } => self.binary(op, lhs, rhs),
        }
    }

    fn binary(&self, op: &BinOp, lhs: &Expr, rhs: &Expr) -> Result<Value> {
        // Short-circuit boolean operators
        match op {
            BinOp::And => {
                let l = self.eval(lhs)?;
                if !truthy(&l) {
                    return Ok(Value::Bool(false));
                }
                return Ok(Value::Bool(truthy(&self.eval(rhs)?)));
            }
            BinOp::Or => {
                let l = self.eval(lhs)?;
                if truthy(&l) {
                    return Ok(Value::Bool(true));
                }
                return Ok(Value::Bool(truthy(&self.eval(rhs)?)));
            }
            _ => {}
        }

        let l = self.eval(lhs)?;
        let r = self.eval(rhs)?;

        match op {
            BinOp::Eq => Ok(Value::Bool(loose_eq(&l, &r))),
            BinOp::Ne => Ok(Value::Bool(!loose_eq(&l, &r))),
            BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
                let (a, b) = numeric_pair(&l, &r)?;
                let result = match op {
                    BinOp::Lt => a < b,
                    BinOp::Le => a <= b,
                    BinOp::Gt => a > b,
                    _ => a >= b,
                };
                Ok(Value::Bool(result))
            }
            BinOp::Add => {
                // String concatenation when either side is a string
                if l.is_string() || r.is_string() {
                    return Ok(Value::String(format!("{}{}", stringify(&l), stringify(&r))));
                }
                let (a, b) = numeric_pair(&l, &r)?;
                Ok(number(a + b))
            }
            BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Rem => {
                let (a, b) = numeric_pair(&l, &r)?;
                let result = match op {
                    BinOp::Sub => a - b,
                    BinOp::Mul => a * b,
                    BinOp::Div => {
                        if b == 0.0 {
                            return Err(PromptForgeError::ExpressionFailed {
                                message: "division by zero".to_string(),
                            });
                        }
                        a / b
                    }
                    _ => {
                        if b == 0.0 {
                            return Err(PromptForgeError::ExpressionFailed {
                                message: "modulo by zero".to_string(),
                            });
                        }
                        a % b
                    }
                };
                Ok(number(result))
            }
            BinOp::And | BinOp::Or => unreachable!("handled above"),
        }
    }

    fn call(&self, target: &Expr, args: &[Expr]) -> Result<Value> {
        let Expr::Property(base, helper) = target else {
            return Err(PromptForgeError::ExpressionFailed {
                message: "only utils helpers can be called".to_string(),
            });
        };
        if !matches!(base.as_ref(), Expr::Ident(name) if name == "utils") {
            return Err(PromptForgeError::ExpressionFailed {
                message: "only utils helpers can be called".to_string(),
            });
        }

        let values: Vec<Value> = args
            .iter()
            .map(|a| self.eval(a))
            .collect::<Result<Vec<_>>>()?;

        match (helper.as_str(), values.as_slice()) {
            ("exists", [v]) => Ok(Value::Bool(!v.is_null())),
            ("contains", [haystack, needle]) => {
                let result = match haystack {
                    Value::String(s) => s.contains(&stringify(needle)),
                    Value::Array(items) => items.iter().any(|i| loose_eq(i, needle)),
                    Value::Object(map) => needle
                        .as_str()
                        .is_some_and(|key| map.contains_key(key)),
                    _ => false,
                };
                Ok(Value::Bool(result))
            }
            ("length", [v]) => {
                let len = match v {
                    Value::String(s) => s.chars().count(),
                    Value::Array(items) => items.len(),
                    Value::Object(map) => map.len(),
                    Value::Null => 0,
                    _ => {
                        return Err(PromptForgeError::ExpressionFailed {
                            message: "length() expects a string, array, or object".to_string(),
                        });
                    }
                };
                Ok(number(len as f64))
            }
            ("to_number", [v]) => {
                let n = as_number(v).ok_or_else(|| PromptForgeError::ExpressionFailed {
                    message: format!("to_number() cannot convert {}", stringify(v)),
                })?;
                Ok(number(n))
            }
            ("to_string", [v]) => Ok(Value::String(stringify(v))),
            ("matches", [subject, pattern]) => {
                let subject = stringify(subject);
                let pattern = pattern.as_str().ok_or_else(|| {
                    PromptForgeError::ExpressionFailed {
                        message: "matches() pattern must be a string".to_string(),
                    }
                })?;
                let re =
                    regex::Regex::new(pattern).map_err(|e| PromptForgeError::ExpressionFailed {
                        message: format!("invalid regex: {}", e),
                    })?;
                Ok(Value::Bool(re.is_match(&subject)))
            }
            (name @ ("exists" | "contains" | "length" | "to_number" | "to_string" | "matches"), _) => {
                Err(PromptForgeError::ExpressionFailed {
                    message: format!("wrong argument count for utils.{}()", name),
                })
            }
            (other, _) => Err(PromptForgeError::ExpressionFailed {
                message: format!("unknown helper utils.{}()", other),
            }),
        }
    }
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn as_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(true) => Some(1.0),
        Value::Bool(false) => Some(0.0),
        _ => None,
    }
}

fn numeric_pair(l: &Value, r: &Value) -> Result<(f64, f64)> {
    match (as_number(l), as_number(r)) {
        (Some(a), Some(b)) => Ok((a, b)),
        _ => Err(PromptForgeError::ExpressionFailed {
            message: "comparison requires numeric operands".to_string(),
        }),
    }
}

fn number(n: f64) -> Value {
    serde_json::Number::from_f64(n)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

fn stringify(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn loose_eq(l: &Value, r: &Value) -> bool {
    if l == r {
        return true;
    }
    // Numbers compare across integer/float representations
    if let (Some(a), Some(b)) = (as_number(l), as_number(r)) {
        if l.is_number() && r.is_number() {
            return a == b;
        }
    }
    false
}

/// Evaluate an expression to a boolean with a hard wall-clock timeout.
///
/// The deadline is checked on every evaluation step and the whole call is
/// additionally bounded by a tokio timeout, so even pathological input is
/// aborted and reported as `ExpressionTimeout`.
pub async fn evaluate(expr: &str, ctx: &ConditionContext, timeout_ms: u64) -> Result<bool> {
    let parsed = parse(expr)?;
    let ctx = ctx.clone();
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);

    let handle = tokio::task::spawn_blocking(move || {
        let evaluator = Evaluator {
            ctx: &ctx,
            deadline,
        };
        evaluator.eval(&parsed).map(|v| truthy(&v))
    });

    match tokio::time::timeout(Duration::from_millis(timeout_ms), handle).await {
        Ok(Ok(result)) => result.map_err(|e| match e {
            PromptForgeError::ExpressionTimeout { .. } => {
                PromptForgeError::ExpressionTimeout { timeout_ms }
            }
            other => other,
        }),
        Ok(Err(join)) => Err(PromptForgeError::ExpressionFailed {
            message: format!("evaluator task failed: {}", join),
        }),
        Err(_) => Err(PromptForgeError::ExpressionTimeout { timeout_ms }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx_with_result(len: usize) -> ConditionContext {
        let mut ctx = ConditionContext::default();
        ctx.insert_step("data_check", &"x".repeat(len), true);
        ctx
    }

    #[tokio::test]
    async fn length_comparison_branches() {
        let ctx = ctx_with_result(500);
        assert!(
            evaluate("utils.length(steps.data_check.result) < 1000", &ctx, 5000)
                .await
                .unwrap()
        );
        assert!(
            !evaluate("utils.length(steps.data_check.result) >= 1000", &ctx, 5000)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn property_access_and_booleans() {
        let mut ctx = ConditionContext::default();
        ctx.insert_step("s1", "done", true);
        ctx.vars.insert("threshold".to_string(), json!(3));
        assert!(
            evaluate(
                "steps.s1.success && utils.contains(steps.s1.result, 'one') == false",
                &ctx,
                5000
            )
            .await
            .unwrap()
        );
        assert!(evaluate("vars.threshold + 1 == 4", &ctx, 5000).await.unwrap());
    }

    #[tokio::test]
    async fn denylist_rejects_before_parse() {
        let ctx = ConditionContext::default();
        for expr in [
            "eval('1')",
            "process.exit",
            "require('fs')",
            "utils.length(import_map)",
        ] {
            let err = evaluate(expr, &ctx, 5000).await.unwrap_err();
            assert!(
                matches!(err, PromptForgeError::ExpressionRejected { .. }),
                "expected rejection for {:?}, got {:?}",
                expr,
                err
            );
        }
    }

    #[tokio::test]
    async fn denylist_is_word_bounded() {
        let mut ctx = ConditionContext::default();
        ctx.vars.insert("processed".to_string(), json!(true));
        // "processed" contains "process" but is a distinct identifier
        assert!(evaluate("vars.processed", &ctx, 5000).await.unwrap());
    }

    #[tokio::test]
    async fn assignment_and_unknown_helpers_fail() {
        let ctx = ConditionContext::default();
        assert!(matches!(
            evaluate("vars.x = 1", &ctx, 5000).await.unwrap_err(),
            PromptForgeError::ExpressionRejected { .. }
        ));
        assert!(matches!(
            evaluate("utils.delete_all()", &ctx, 5000).await.unwrap_err(),
            PromptForgeError::ExpressionFailed { .. }
        ));
    }

    #[tokio::test]
    async fn matches_helper_uses_regex() {
        let mut ctx = ConditionContext::default();
        ctx.insert_step("s1", "error: code 42", false);
        assert!(
            evaluate("utils.matches(steps.s1.result, 'code \\d+')", &ctx, 5000)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn zero_timeout_reports_expression_timeout() {
        let ctx = ctx_with_result(10);
        let err = evaluate("utils.length(steps.data_check.result) > 1", &ctx, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, PromptForgeError::ExpressionTimeout { .. }));
    }

    #[tokio::test]
    async fn missing_path_is_null_not_error() {
        let ctx = ConditionContext::default();
        assert!(!evaluate("utils.exists(steps.nope.result)", &ctx, 5000).await.unwrap());
    }
}
