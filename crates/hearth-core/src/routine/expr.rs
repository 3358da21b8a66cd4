// ── Routine expression DSL ──
//
// Conditions and action parameters on routines are stored as small text
// expressions. They are evaluated against a fixed, whitelisted context --
// there is no host-language evaluation anywhere. Grammar:
//
//   expr   := or
//   or     := and (("||" | "or") and)*
//   and    := not (("&&" | "and") not)*
//   not    := ("!" | "not") not | cmp
//   cmp    := sum (("==" | "!=" | "<=" | ">=" | "<" | ">") sum)?
//   sum    := term (("+" | "-") term)*
//   term   := unary (("*" | "/") unary)*
//   unary  := "-" unary | atom
//   atom   := number | string | bool | ident | "(" expr ")" | object
//   object := "{" (key ":" expr ("," key ":" expr)*)? "}"
//
// Bool literals accept both `true` and the Python-style `True` spelling,
// and strings accept single or double quotes: routine fields written for
// the previous generation of this system keep evaluating unchanged.

use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::error::CoreError;

// ── Context ──────────────────────────────────────────────────────────

/// The variables an expression may reference. Unknown identifiers are an
/// evaluation error, not a silent default.
#[derive(Debug, Default, Clone)]
pub struct Context {
    vars: HashMap<String, Value>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        self.vars.insert(name.into(), value);
    }

    fn get(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }
}

// ── Public entry points ──────────────────────────────────────────────

/// Evaluate a routine condition. Empty source defaults to `true`; a
/// non-boolean result is an error (callers fail safe to `false`).
pub fn eval_condition(src: &str, ctx: &Context) -> Result<bool, CoreError> {
    let src = src.trim();
    if src.is_empty() {
        return Ok(true);
    }
    match eval(src, ctx)? {
        Value::Bool(b) => Ok(b),
        other => Err(CoreError::Expr(format!(
            "condition evaluated to {other}, expected a boolean"
        ))),
    }
}

/// Evaluate action parameters. Empty source defaults to `{}`; a
/// non-object result is an error.
pub fn eval_params(src: &str, ctx: &Context) -> Result<Value, CoreError> {
    let src = src.trim();
    if src.is_empty() {
        return Ok(Value::Object(Map::new()));
    }
    match eval(src, ctx)? {
        object @ Value::Object(_) => Ok(object),
        other => Err(CoreError::Expr(format!(
            "params evaluated to {other}, expected an object"
        ))),
    }
}

/// Evaluate an expression to a JSON value.
pub fn eval(src: &str, ctx: &Context) -> Result<Value, CoreError> {
    let tokens = tokenize(src)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        ctx,
    };
    let value = parser.or_expr()?;
    if parser.pos != parser.tokens.len() {
        return Err(CoreError::Expr(format!(
            "unexpected trailing input at token {}",
            parser.pos
        )));
    }
    Ok(value)
}

// ── Tokenizer ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Str(String),
    Ident(String),
    Bool(bool),
    // operators and punctuation
    Or,
    And,
    Not,
    Eq,
    Ne,
    Le,
    Ge,
    Lt,
    Gt,
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
    LBrace,
    RBrace,
    Colon,
    Comma,
}

fn tokenize(src: &str) -> Result<Vec<Token>, CoreError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = src.chars().collect();
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
            '{' => {
                tokens.push(Token::LBrace);
                i += 1;
            }
            '}' => {
                tokens.push(Token::RBrace);
                i += 1;
            }
            ':' => {
                tokens.push(Token::Colon);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
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
            '|' | '&' | '=' | '!' | '<' | '>' => {
                let next = chars.get(i + 1).copied();
                let (token, width) = match (c, next) {
                    ('|', Some('|')) => (Token::Or, 2),
                    ('&', Some('&')) => (Token::And, 2),
                    ('=', Some('=')) => (Token::Eq, 2),
                    ('!', Some('=')) => (Token::Ne, 2),
                    ('<', Some('=')) => (Token::Le, 2),
                    ('>', Some('=')) => (Token::Ge, 2),
                    ('<', _) => (Token::Lt, 1),
                    ('>', _) => (Token::Gt, 1),
                    ('!', _) => (Token::Not, 1),
                    _ => {
                        return Err(CoreError::Expr(format!("unexpected character '{c}'")));
                    }
                };
                tokens.push(token);
                i += width;
            }
            '\'' | '"' => {
                let quote = c;
                let start = i + 1;
                let mut end = start;
                while end < chars.len() && chars[end] != quote {
                    end += 1;
                }
                if end == chars.len() {
                    return Err(CoreError::Expr("unterminated string literal".into()));
                }
                tokens.push(Token::Str(chars[start..end].iter().collect()));
                i = end + 1;
            }
            '0'..='9' | '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let value = text
                    .parse::<f64>()
                    .map_err(|_| CoreError::Expr(format!("invalid number '{text}'")))?;
                tokens.push(Token::Num(value));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                let token = match word.as_str() {
                    "true" | "True" => Token::Bool(true),
                    "false" | "False" => Token::Bool(false),
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    _ => Token::Ident(word),
                };
                tokens.push(token);
            }
            other => {
                return Err(CoreError::Expr(format!("unexpected character '{other}'")));
            }
        }
    }

    Ok(tokens)
}

// ── Parser / evaluator ───────────────────────────────────────────────

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    ctx: &'a Context,
}

/// A float that is a whole number within safe range serializes as an
/// integer, so `{'brightness': 100}` stays `100`, not `100.0`.
fn number_value(f: f64) -> Value {
    if f.fract() == 0.0 && f.abs() < 9e15 {
        Value::from(f as i64)
    } else {
        Value::from(f)
    }
}

fn as_number(value: &Value) -> Result<f64, CoreError> {
    value
        .as_f64()
        .ok_or_else(|| CoreError::Expr(format!("{value} is not a number")))
}

fn as_bool(value: &Value) -> Result<bool, CoreError> {
    value
        .as_bool()
        .ok_or_else(|| CoreError::Expr(format!("{value} is not a boolean")))
}

impl Parser<'_> {
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

    fn expect(&mut self, token: &Token) -> Result<(), CoreError> {
        match self.advance() {
            Some(ref t) if t == token => Ok(()),
            other => Err(CoreError::Expr(format!(
                "expected {token:?}, found {other:?}"
            ))),
        }
    }

    fn or_expr(&mut self) -> Result<Value, CoreError> {
        let mut left = self.and_expr()?;
        while matches!(self.peek(), Some(Token::Or)) {
            self.advance();
            let right = self.and_expr()?;
            left = Value::Bool(as_bool(&left)? || as_bool(&right)?);
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Value, CoreError> {
        let mut left = self.not_expr()?;
        while matches!(self.peek(), Some(Token::And)) {
            self.advance();
            let right = self.not_expr()?;
            left = Value::Bool(as_bool(&left)? && as_bool(&right)?);
        }
        Ok(left)
    }

    fn not_expr(&mut self) -> Result<Value, CoreError> {
        if matches!(self.peek(), Some(Token::Not)) {
            self.advance();
            let value = self.not_expr()?;
            return Ok(Value::Bool(!as_bool(&value)?));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Value, CoreError> {
        let left = self.additive()?;
        let op = match self.peek() {
            Some(Token::Eq) => Token::Eq,
            Some(Token::Ne) => Token::Ne,
            Some(Token::Le) => Token::Le,
            Some(Token::Ge) => Token::Ge,
            Some(Token::Lt) => Token::Lt,
            Some(Token::Gt) => Token::Gt,
            _ => return Ok(left),
        };
        self.advance();
        let right = self.additive()?;

        let result = match op {
            Token::Eq => left == right,
            Token::Ne => left != right,
            Token::Le => as_number(&left)? <= as_number(&right)?,
            Token::Ge => as_number(&left)? >= as_number(&right)?,
            Token::Lt => as_number(&left)? < as_number(&right)?,
            Token::Gt => as_number(&left)? > as_number(&right)?,
            _ => unreachable!("comparison op set above"),
        };
        Ok(Value::Bool(result))
    }

    fn additive(&mut self) -> Result<Value, CoreError> {
        let mut left = self.term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => Token::Plus,
                Some(Token::Minus) => Token::Minus,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.term()?;
            let result = match op {
                Token::Plus => as_number(&left)? + as_number(&right)?,
                _ => as_number(&left)? - as_number(&right)?,
            };
            left = number_value(result);
        }
    }

    fn term(&mut self) -> Result<Value, CoreError> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => Token::Star,
                Some(Token::Slash) => Token::Slash,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.unary()?;
            let result = match op {
                Token::Star => as_number(&left)? * as_number(&right)?,
                _ => {
                    let divisor = as_number(&right)?;
                    if divisor == 0.0 {
                        return Err(CoreError::Expr("division by zero".into()));
                    }
                    as_number(&left)? / divisor
                }
            };
            left = number_value(result);
        }
    }

    fn unary(&mut self) -> Result<Value, CoreError> {
        if matches!(self.peek(), Some(Token::Minus)) {
            self.advance();
            let value = self.unary()?;
            return Ok(number_value(-as_number(&value)?));
        }
        self.atom()
    }

    fn atom(&mut self) -> Result<Value, CoreError> {
        match self.advance() {
            Some(Token::Num(n)) => Ok(number_value(n)),
            Some(Token::Str(s)) => Ok(Value::String(s)),
            Some(Token::Bool(b)) => Ok(Value::Bool(b)),
            Some(Token::Ident(name)) => self
                .ctx
                .get(&name)
                .cloned()
                .ok_or_else(|| CoreError::Expr(format!("unknown variable '{name}'"))),
            Some(Token::LParen) => {
                let value = self.or_expr()?;
                self.expect(&Token::RParen)?;
                Ok(value)
            }
            Some(Token::LBrace) => self.object(),
            other => Err(CoreError::Expr(format!("unexpected token {other:?}"))),
        }
    }

    /// `{ key: expr, ... }` -- keys are strings or bare identifiers.
    fn object(&mut self) -> Result<Value, CoreError> {
        let mut map = Map::new();

        if matches!(self.peek(), Some(Token::RBrace)) {
            self.advance();
            return Ok(Value::Object(map));
        }

        loop {
            let key = match self.advance() {
                Some(Token::Str(s)) => s,
                Some(Token::Ident(name)) => name,
                other => {
                    return Err(CoreError::Expr(format!(
                        "expected object key, found {other:?}"
                    )));
                }
            };
            self.expect(&Token::Colon)?;
            let value = self.or_expr()?;
            map.insert(key, value);

            match self.advance() {
                Some(Token::Comma) => {}
                Some(Token::RBrace) => break,
                other => {
                    return Err(CoreError::Expr(format!(
                        "expected ',' or '}}' in object, found {other:?}"
                    )));
                }
            }
        }

        Ok(Value::Object(map))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> Context {
        let mut ctx = Context::new();
        ctx.insert("runs", json!(3));
        ctx.insert("hour", json!(14));
        ctx.insert("minute", json!(30));
        ctx.insert("weekday", json!(5));
        ctx
    }

    #[test]
    fn empty_condition_defaults_to_true() {
        assert!(eval_condition("", &ctx()).unwrap());
        assert!(eval_condition("   ", &ctx()).unwrap());
    }

    #[test]
    fn python_spelled_literals() {
        assert!(eval_condition("True", &ctx()).unwrap());
        assert!(!eval_condition("False", &ctx()).unwrap());
        assert!(eval_condition("true", &ctx()).unwrap());
    }

    #[test]
    fn comparisons_and_boolean_operators() {
        let c = ctx();
        assert!(eval_condition("hour >= 14 && hour < 22", &c).unwrap());
        assert!(eval_condition("hour == 14 and minute == 30", &c).unwrap());
        assert!(eval_condition("weekday == 5 or weekday == 6", &c).unwrap());
        assert!(eval_condition("not (runs > 10)", &c).unwrap());
        assert!(!eval_condition("runs != 3", &c).unwrap());
    }

    #[test]
    fn arithmetic() {
        assert_eq!(eval("2 + 3 * 4", &ctx()).unwrap(), json!(14));
        assert_eq!(eval("(2 + 3) * 4", &ctx()).unwrap(), json!(20));
        assert_eq!(eval("10 / 4", &ctx()).unwrap(), json!(2.5));
        assert_eq!(eval("-runs + 5", &ctx()).unwrap(), json!(2));
    }

    #[test]
    fn division_by_zero_is_an_error() {
        assert!(eval("1 / 0", &ctx()).is_err());
    }

    #[test]
    fn empty_params_default_to_object() {
        assert_eq!(eval_params("", &ctx()).unwrap(), json!({}));
    }

    #[test]
    fn python_style_param_dict() {
        // Exactly the shape stored by the previous system.
        let params = eval_params("{'brightness': 100, 'is_on': True}", &ctx()).unwrap();
        assert_eq!(params, json!({"brightness": 100, "is_on": true}));
    }

    #[test]
    fn params_may_reference_context() {
        let params = eval_params("{brightness: runs * 10, 'label': 'night'}", &ctx()).unwrap();
        assert_eq!(params, json!({"brightness": 30, "label": "night"}));
    }

    #[test]
    fn whole_numbers_stay_integers() {
        assert_eq!(eval("2.0 + 3.0", &ctx()).unwrap(), json!(5));
        assert_eq!(eval("1.5 + 1", &ctx()).unwrap(), json!(2.5));
    }

    #[test]
    fn unknown_variable_is_an_error() {
        assert!(eval_condition("temperature > 20", &ctx()).is_err());
    }

    #[test]
    fn non_boolean_condition_is_an_error() {
        assert!(eval_condition("runs + 1", &ctx()).is_err());
        assert!(eval_params("42", &ctx()).is_err());
    }

    #[test]
    fn malformed_input_is_an_error_not_a_panic() {
        for src in ["{", "1 +", "((", "'unterminated", "@#$", "1 2"] {
            assert!(eval(src, &ctx()).is_err(), "expected error for {src:?}");
        }
    }

    #[test]
    fn string_comparison() {
        let mut c = Context::new();
        c.insert("mode", json!("night"));
        assert!(eval_condition("mode == 'night'", &c).unwrap());
        assert!(eval_condition("mode != \"day\"", &c).unwrap());
    }
}
