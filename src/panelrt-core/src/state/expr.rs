//! A small, safe expression language for `ComputedSlot` bodies.
//!
//! Deliberately not JavaScript: spec.md never specifies what a "computed
//! expression" is written in, and evaluating real handler-language
//! expressions here would pull the Sandbox Engine into a module that must
//! come before it in the dependency order (§2). Supports arithmetic,
//! comparison, boolean, ternary and string-concat operators over
//! `$state.<name>` / bare-identifier reads, following the worked example in
//! §8 scenario 4 (`sum = $state.a + $state.b`).

use serde_json::Value as Json;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ExprError {
    #[error("unexpected character {0:?} at position {1}")]
    UnexpectedChar(char, usize),
    #[error("unexpected end of expression")]
    UnexpectedEnd,
    #[error("expected {0:?}")]
    Expected(&'static str),
    #[error("trailing input after expression")]
    TrailingInput,
}

#[derive(Debug, Clone)]
pub enum Expr {
    Number(f64),
    String(String),
    Bool(bool),
    Null,
    Ident(String),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Ternary(Box<Expr>, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, Copy)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
}

pub fn parse(source: &str) -> Result<Expr, ExprError> {
    let tokens = lex(source)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_ternary()?;
    if parser.pos != parser.tokens.len() {
        return Err(ExprError::TrailingInput);
    }
    Ok(expr)
}

/// Evaluates `expr`, calling `resolve` for every identifier encountered
/// (including `$state.` prefixed ones, with the prefix stripped).
pub fn eval(expr: &Expr, resolve: &mut dyn FnMut(&str) -> Option<Json>) -> Result<Json, ExprError> {
    Ok(match expr {
        Expr::Number(n) => Json::from(*n),
        Expr::String(s) => Json::String(s.clone()),
        Expr::Bool(b) => Json::Bool(*b),
        Expr::Null => Json::Null,
        Expr::Ident(name) => resolve(name).unwrap_or(Json::Null),
        Expr::Unary(op, inner) => {
            let v = eval(inner, resolve)?;
            match op {
                UnaryOp::Neg => Json::from(-as_number(&v)),
                UnaryOp::Not => Json::Bool(!as_bool(&v)),
            }
        }
        Expr::Binary(op, lhs, rhs) => {
            let l = eval(lhs, resolve)?;
            match op {
                BinOp::And => {
                    if !as_bool(&l) {
                        return Ok(l);
                    }
                    eval(rhs, resolve)?
                }
                BinOp::Or => {
                    if as_bool(&l) {
                        return Ok(l);
                    }
                    eval(rhs, resolve)?
                }
                _ => {
                    let r = eval(rhs, resolve)?;
                    apply_binop(*op, &l, &r)
                }
            }
        }
        Expr::Ternary(cond, then_branch, else_branch) => {
            let c = eval(cond, resolve)?;
            if as_bool(&c) {
                eval(then_branch, resolve)?
            } else {
                eval(else_branch, resolve)?
            }
        }
    })
}

fn apply_binop(op: BinOp, l: &Json, r: &Json) -> Json {
    match op {
        BinOp::Add => {
            if matches!(l, Json::String(_)) || matches!(r, Json::String(_)) {
                Json::String(format!("{}{}", as_string(l), as_string(r)))
            } else {
                Json::from(as_number(l) + as_number(r))
            }
        }
        BinOp::Sub => Json::from(as_number(l) - as_number(r)),
        BinOp::Mul => Json::from(as_number(l) * as_number(r)),
        BinOp::Div => Json::from(as_number(l) / as_number(r)),
        BinOp::Eq => Json::Bool(loose_eq(l, r)),
        BinOp::NotEq => Json::Bool(!loose_eq(l, r)),
        BinOp::Lt => Json::Bool(as_number(l) < as_number(r)),
        BinOp::LtEq => Json::Bool(as_number(l) <= as_number(r)),
        BinOp::Gt => Json::Bool(as_number(l) > as_number(r)),
        BinOp::GtEq => Json::Bool(as_number(l) >= as_number(r)),
        BinOp::And | BinOp::Or => unreachable!("short-circuit ops handled in eval"),
    }
}

fn loose_eq(l: &Json, r: &Json) -> bool {
    if l == r {
        return true;
    }
    as_number(l) == as_number(r) && matches!(l, Json::Number(_) | Json::Bool(_) | Json::Null)
        && matches!(r, Json::Number(_) | Json::Bool(_) | Json::Null)
}

fn as_number(v: &Json) -> f64 {
    match v {
        Json::Number(n) => n.as_f64().unwrap_or(f64::NAN),
        Json::Bool(true) => 1.0,
        Json::Bool(false) => 0.0,
        Json::Null => 0.0,
        Json::String(s) => s.trim().parse().unwrap_or(f64::NAN),
        _ => f64::NAN,
    }
}

fn as_bool(v: &Json) -> bool {
    match v {
        Json::Bool(b) => *b,
        Json::Null => false,
        Json::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Json::String(s) => !s.is_empty(),
        Json::Array(a) => !a.is_empty(),
        Json::Object(o) => !o.is_empty(),
    }
}

fn as_string(v: &Json) -> String {
    match v {
        Json::String(s) => s.clone(),
        Json::Null => String::new(),
        other => other.to_string(),
    }
}

// --- lexer ---

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    String(String),
    Ident(String),
    True,
    False,
    Null,
    Plus,
    Minus,
    Star,
    Slash,
    Bang,
    EqEq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    AndAnd,
    OrOr,
    Question,
    Colon,
    LParen,
    RParen,
    Dot,
}

fn lex(source: &str) -> Result<Vec<Token>, ExprError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
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
            '?' => {
                tokens.push(Token::Question);
                i += 1;
            }
            ':' => {
                tokens.push(Token::Colon);
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
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '=' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::EqEq);
                i += 2;
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::NotEq);
                i += 2;
            }
            '!' => {
                tokens.push(Token::Bang);
                i += 1;
            }
            '<' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::LtEq);
                i += 2;
            }
            '<' => {
                tokens.push(Token::Lt);
                i += 1;
            }
            '>' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::GtEq);
                i += 2;
            }
            '>' => {
                tokens.push(Token::Gt);
                i += 1;
            }
            '&' if chars.get(i + 1) == Some(&'&') => {
                tokens.push(Token::AndAnd);
                i += 2;
            }
            '|' if chars.get(i + 1) == Some(&'|') => {
                tokens.push(Token::OrOr);
                i += 2;
            }
            '"' | '\'' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(ExprError::UnexpectedEnd),
                        Some(ch) if *ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(ch) => {
                            s.push(*ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::String(s));
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while chars.get(i).is_some_and(|c| c.is_ascii_digit() || *c == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n: f64 = text.parse().map_err(|_| ExprError::UnexpectedChar(c, start))?;
                tokens.push(Token::Number(n));
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                let start = i;
                while chars.get(i).is_some_and(|c| c.is_alphanumeric() || *c == '_' || *c == '$') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                tokens.push(match text.as_str() {
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" | "undefined" => Token::Null,
                    _ => Token::Ident(text),
                });
            }
            other => return Err(ExprError::UnexpectedChar(other, i)),
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
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
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

    fn parse_ternary(&mut self) -> Result<Expr, ExprError> {
        let cond = self.parse_or()?;
        if self.eat(&Token::Question) {
            let then_branch = self.parse_ternary()?;
            if !self.eat(&Token::Colon) {
                return Err(ExprError::Expected("':'"));
            }
            let else_branch = self.parse_ternary()?;
            return Ok(Expr::Ternary(Box::new(cond), Box::new(then_branch), Box::new(else_branch)));
        }
        Ok(cond)
    }

    fn parse_or(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.parse_and()?;
        while self.eat(&Token::OrOr) {
            let rhs = self.parse_and()?;
            lhs = Expr::Binary(BinOp::Or, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.parse_equality()?;
        while self.eat(&Token::AndAnd) {
            let rhs = self.parse_equality()?;
            lhs = Expr::Binary(BinOp::And, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_equality(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.parse_relational()?;
        loop {
            let op = match self.peek() {
                Some(Token::EqEq) => BinOp::Eq,
                Some(Token::NotEq) => BinOp::NotEq,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_relational()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_relational(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.parse_additive()?;
        loop {
            let op = match self.peek() {
                Some(Token::Lt) => BinOp::Lt,
                Some(Token::LtEq) => BinOp::LtEq,
                Some(Token::Gt) => BinOp::Gt,
                Some(Token::GtEq) => BinOp::GtEq,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_additive()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_additive(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_multiplicative()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, ExprError> {
        match self.peek() {
            Some(Token::Minus) => {
                self.advance();
                Ok(Expr::Unary(UnaryOp::Neg, Box::new(self.parse_unary()?)))
            }
            Some(Token::Bang) => {
                self.advance();
                Ok(Expr::Unary(UnaryOp::Not, Box::new(self.parse_unary()?)))
            }
            _ => self.parse_primary(),
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, ExprError> {
        match self.advance().ok_or(ExprError::UnexpectedEnd)? {
            Token::Number(n) => Ok(Expr::Number(n)),
            Token::String(s) => Ok(Expr::String(s)),
            Token::True => Ok(Expr::Bool(true)),
            Token::False => Ok(Expr::Bool(false)),
            Token::Null => Ok(Expr::Null),
            Token::LParen => {
                let inner = self.parse_ternary()?;
                if !self.eat(&Token::RParen) {
                    return Err(ExprError::Expected("')'"));
                }
                Ok(inner)
            }
            Token::Ident(name) => {
                // `$state.foo` / `$state.foo.bar` collapses to identifier
                // `foo` (dotted paths beyond the first segment are not
                // supported — computed expressions read top-level slots).
                if name == "$state" && self.eat(&Token::Dot) {
                    match self.advance().ok_or(ExprError::UnexpectedEnd)? {
                        Token::Ident(field) => Ok(Expr::Ident(field)),
                        _ => Err(ExprError::Expected("identifier after '$state.'")),
                    }
                } else {
                    Ok(Expr::Ident(name))
                }
            }
            other => Err(ExprError::Expected(token_kind(&other))),
        }
    }
}

fn token_kind(t: &Token) -> &'static str {
    match t {
        Token::Number(_) => "number",
        Token::String(_) => "string",
        Token::Ident(_) => "identifier",
        _ => "expression",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval_with(source: &str, vars: &[(&str, Json)]) -> Json {
        let expr = parse(source).unwrap();
        eval(&expr, &mut |name| {
            vars.iter().find(|(k, _)| *k == name).map(|(_, v)| v.clone())
        })
        .unwrap()
    }

    #[test]
    fn addition_over_state_reads() {
        let v = eval_with("$state.a + $state.b", &[("a", Json::from(1)), ("b", Json::from(2))]);
        assert_eq!(v, Json::from(3.0));
    }

    #[test]
    fn ternary_and_comparison() {
        let v = eval_with("$state.a > 5 ? 'big' : 'small'", &[("a", Json::from(10))]);
        assert_eq!(v, Json::String("big".to_string()));
    }

    #[test]
    fn string_concat_with_plus() {
        let v = eval_with("'x=' + $state.a", &[("a", Json::from(3))]);
        assert_eq!(v, Json::String("x=3".to_string()));
    }

    #[test]
    fn null_coerces_to_zero_in_arithmetic() {
        let v = eval_with("$state.missing + 1", &[]);
        assert_eq!(v, Json::from(1.0));
    }
}
