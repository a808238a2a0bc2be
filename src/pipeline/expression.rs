//! Cross-field check expressions, e.g. `total == subtotal + tax` or
//! `len(invoice.number) > 3 && currency != "XXX"`.
//!
//! Identifiers are dotted field paths resolved against the nested result
//! JSON. A path that runs through an array (a table) yields the list of
//! that column's values, which `sum` and `len` consume. Numeric equality
//! tolerates a difference of 0.01 so currency rounding does not fail checks.

use thiserror::Error;

const NUMERIC_TOLERANCE: f64 = 0.01;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExprError {
    #[error("Parse error at {pos}: {message}")]
    Parse { pos: usize, message: String },

    #[error("Type error: {0}")]
    Type(String),

    #[error("Division by zero")]
    DivideByZero,

    #[error("Unknown function: {0}")]
    UnknownFunction(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Str(String),
    Bool(bool),
    Null,
    Field(String),
    Not(Box<Expr>),
    Neg(Box<Expr>),
    Binary(Box<Expr>, BinOp, Box<Expr>),
    Call(String, Vec<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

/// Runtime value.
#[derive(Debug, Clone, PartialEq)]
pub enum Val {
    Null,
    Num(f64),
    Str(String),
    Bool(bool),
    List(Vec<Val>),
}

impl Val {
    fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Val::Null,
            serde_json::Value::Bool(b) => Val::Bool(*b),
            serde_json::Value::Number(n) => n.as_f64().map(Val::Num).unwrap_or(Val::Null),
            serde_json::Value::String(s) => Val::Str(s.clone()),
            serde_json::Value::Array(items) => Val::List(items.iter().map(Val::from_json).collect()),
            serde_json::Value::Object(_) => Val::Null,
        }
    }

    /// Numbers, and strings that parse as numbers.
    fn as_num(&self) -> Option<f64> {
        match self {
            Val::Num(n) => Some(*n),
            Val::Str(s) => s.trim().replace(',', "").parse().ok(),
            _ => None,
        }
    }

    fn truthy(&self) -> bool {
        match self {
            Val::Null => false,
            Val::Bool(b) => *b,
            Val::Num(n) => *n != 0.0,
            Val::Str(s) => !s.is_empty(),
            Val::List(items) => !items.is_empty(),
        }
    }

    fn describe(&self) -> &'static str {
        match self {
            Val::Null => "null",
            Val::Num(_) => "number",
            Val::Str(_) => "string",
            Val::Bool(_) => "boolean",
            Val::List(_) => "list",
        }
    }
}

// ---------------------------------------------------------------------------
// Tokenizer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    Op(&'static str),
    LParen,
    RParen,
    Comma,
}

fn tokenize(src: &str) -> Result<Vec<(usize, Token)>, ExprError> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let start = i;
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if c.is_ascii_digit() || (c == '.' && chars.get(i + 1).is_some_and(|d| d.is_ascii_digit())) {
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            let text: String = chars[start..i].iter().collect();
            let n = text.parse().map_err(|_| ExprError::Parse {
                pos: start,
                message: format!("bad number '{text}'"),
            })?;
            tokens.push((start, Token::Number(n)));
            continue;
        }
        if c == '"' || c == '\'' {
            i += 1;
            let mut s = String::new();
            while i < chars.len() && chars[i] != c {
                s.push(chars[i]);
                i += 1;
            }
            if i >= chars.len() {
                return Err(ExprError::Parse {
                    pos: start,
                    message: "unterminated string".into(),
                });
            }
            i += 1;
            tokens.push((start, Token::Str(s)));
            continue;
        }
        if c.is_alphabetic() || c == '_' {
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.') {
                i += 1;
            }
            let ident: String = chars[start..i].iter().collect();
            tokens.push((start, Token::Ident(ident)));
            continue;
        }

        let two: String = chars[i..(i + 2).min(chars.len())].iter().collect();
        let op = match two.as_str() {
            "==" => Some("=="),
            "!=" => Some("!="),
            "<=" => Some("<="),
            ">=" => Some(">="),
            "&&" => Some("&&"),
            "||" => Some("||"),
            _ => None,
        };
        if let Some(op) = op {
            tokens.push((start, Token::Op(op)));
            i += 2;
            continue;
        }

        let token = match c {
            '(' => Token::LParen,
            ')' => Token::RParen,
            ',' => Token::Comma,
            '+' => Token::Op("+"),
            '-' => Token::Op("-"),
            '*' => Token::Op("*"),
            '/' => Token::Op("/"),
            '<' => Token::Op("<"),
            '>' => Token::Op(">"),
            '!' => Token::Op("!"),
            '=' => Token::Op("=="),
            _ => {
                return Err(ExprError::Parse {
                    pos: start,
                    message: format!("unexpected character '{c}'"),
                })
            }
        };
        tokens.push((start, token));
        i += 1;
    }
    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    len: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn offset(&self) -> usize {
        self.tokens.get(self.pos).map(|(p, _)| *p).unwrap_or(self.len)
    }

    fn error(&self, message: impl Into<String>) -> ExprError {
        ExprError::Parse {
            pos: self.offset(),
            message: message.into(),
        }
    }

    fn eat_op(&mut self, ops: &[&'static str]) -> Option<&'static str> {
        if let Some(Token::Op(op)) = self.peek().cloned() {
            if let Some(found) = ops.iter().copied().find(|o| *o == op) {
                self.pos += 1;
                return Some(found);
            }
        }
        None
    }

    fn eat_keyword(&mut self, word: &str) -> bool {
        if let Some(Token::Ident(ident)) = self.peek() {
            if ident.eq_ignore_ascii_case(word) {
                self.pos += 1;
                return true;
            }
        }
        false
    }

    fn or(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.and()?;
        while self.eat_op(&["||"]).is_some() || self.eat_keyword("or") {
            let rhs = self.and()?;
            lhs = Expr::Binary(Box::new(lhs), BinOp::Or, Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.not()?;
        while self.eat_op(&["&&"]).is_some() || self.eat_keyword("and") {
            let rhs = self.not()?;
            lhs = Expr::Binary(Box::new(lhs), BinOp::And, Box::new(rhs));
        }
        Ok(lhs)
    }

    fn not(&mut self) -> Result<Expr, ExprError> {
        if self.eat_op(&["!"]).is_some() || self.eat_keyword("not") {
            return Ok(Expr::Not(Box::new(self.not()?)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, ExprError> {
        let lhs = self.additive()?;
        let op = match self.eat_op(&["==", "!=", "<=", ">=", "<", ">"]) {
            Some("==") => BinOp::Eq,
            Some("!=") => BinOp::Ne,
            Some("<=") => BinOp::Le,
            Some(">=") => BinOp::Ge,
            Some("<") => BinOp::Lt,
            Some(">") => BinOp::Gt,
            _ => return Ok(lhs),
        };
        let rhs = self.additive()?;
        Ok(Expr::Binary(Box::new(lhs), op, Box::new(rhs)))
    }

    fn additive(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.multiplicative()?;
        while let Some(op) = self.eat_op(&["+", "-"]) {
            let rhs = self.multiplicative()?;
            let op = if op == "+" { BinOp::Add } else { BinOp::Sub };
            lhs = Expr::Binary(Box::new(lhs), op, Box::new(rhs));
        }
        Ok(lhs)
    }

    fn multiplicative(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.unary()?;
        while let Some(op) = self.eat_op(&["*", "/"]) {
            let rhs = self.unary()?;
            let op = if op == "*" { BinOp::Mul } else { BinOp::Div };
            lhs = Expr::Binary(Box::new(lhs), op, Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, ExprError> {
        if self.eat_op(&["-"]).is_some() {
            return Ok(Expr::Neg(Box::new(self.unary()?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, ExprError> {
        let Some(token) = self.peek().cloned() else {
            return Err(self.error("unexpected end of expression"));
        };
        self.pos += 1;
        match token {
            Token::Number(n) => Ok(Expr::Number(n)),
            Token::Str(s) => Ok(Expr::Str(s)),
            Token::LParen => {
                let inner = self.or()?;
                match self.peek() {
                    Some(Token::RParen) => {
                        self.pos += 1;
                        Ok(inner)
                    }
                    _ => Err(self.error("expected ')'")),
                }
            }
            Token::Ident(ident) => {
                match ident.to_ascii_lowercase().as_str() {
                    "true" => return Ok(Expr::Bool(true)),
                    "false" => return Ok(Expr::Bool(false)),
                    "null" => return Ok(Expr::Null),
                    _ => {}
                }
                if self.peek() == Some(&Token::LParen) {
                    self.pos += 1;
                    let mut args = Vec::new();
                    if self.peek() != Some(&Token::RParen) {
                        loop {
                            args.push(self.or()?);
                            if self.peek() == Some(&Token::Comma) {
                                self.pos += 1;
                            } else {
                                break;
                            }
                        }
                    }
                    if self.peek() != Some(&Token::RParen) {
                        return Err(self.error("expected ')' after arguments"));
                    }
                    self.pos += 1;
                    return Ok(Expr::Call(ident.to_ascii_lowercase(), args));
                }
                Ok(Expr::Field(ident))
            }
            other => {
                self.pos -= 1;
                Err(self.error(format!("unexpected token {other:?}")))
            }
        }
    }
}

pub fn parse(src: &str) -> Result<Expr, ExprError> {
    let tokens = tokenize(src)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        len: src.len(),
    };
    let expr = parser.or()?;
    if parser.pos < parser.tokens.len() {
        return Err(parser.error("trailing input"));
    }
    Ok(expr)
}

const FUNCTIONS: &[&str] = &["len", "abs", "sum", "round", "empty"];

impl Expr {
    /// Field paths referenced by the expression, in order of appearance.
    pub fn fields(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_fields(&mut out);
        out
    }

    fn collect_fields<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expr::Field(path) => out.push(path),
            Expr::Not(e) | Expr::Neg(e) => e.collect_fields(out),
            Expr::Binary(l, _, r) => {
                l.collect_fields(out);
                r.collect_fields(out);
            }
            Expr::Call(_, args) => args.iter().for_each(|a| a.collect_fields(out)),
            _ => {}
        }
    }

    /// Reject calls to functions the evaluator does not know.
    pub fn check_functions(&self) -> Result<(), ExprError> {
        match self {
            Expr::Call(name, args) => {
                if !FUNCTIONS.contains(&name.as_str()) {
                    return Err(ExprError::UnknownFunction(name.clone()));
                }
                args.iter().try_for_each(Expr::check_functions)
            }
            Expr::Not(e) | Expr::Neg(e) => e.check_functions(),
            Expr::Binary(l, _, r) => {
                l.check_functions()?;
                r.check_functions()
            }
            _ => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Resolve a dotted path against nested JSON. Arrays are mapped over.
pub fn resolve_path(root: &serde_json::Value, path: &str) -> Val {
    fn walk(value: &serde_json::Value, parts: &[&str]) -> Val {
        let Some((head, rest)) = parts.split_first() else {
            return Val::from_json(value);
        };
        match value {
            serde_json::Value::Object(map) => match map.get(*head) {
                Some(child) => walk(child, rest),
                None => Val::Null,
            },
            serde_json::Value::Array(items) => {
                Val::List(items.iter().map(|item| walk(item, parts)).collect())
            }
            _ => Val::Null,
        }
    }
    let parts: Vec<&str> = path.split('.').collect();
    walk(root, &parts)
}

pub fn evaluate(expr: &Expr, root: &serde_json::Value) -> Result<Val, ExprError> {
    match expr {
        Expr::Number(n) => Ok(Val::Num(*n)),
        Expr::Str(s) => Ok(Val::Str(s.clone())),
        Expr::Bool(b) => Ok(Val::Bool(*b)),
        Expr::Null => Ok(Val::Null),
        Expr::Field(path) => Ok(resolve_path(root, path)),
        Expr::Not(inner) => Ok(Val::Bool(!evaluate(inner, root)?.truthy())),
        Expr::Neg(inner) => {
            let v = evaluate(inner, root)?;
            v.as_num()
                .map(|n| Val::Num(-n))
                .ok_or_else(|| ExprError::Type(format!("cannot negate {}", v.describe())))
        }
        Expr::Binary(lhs, BinOp::And, rhs) => {
            Ok(Val::Bool(evaluate(lhs, root)?.truthy() && evaluate(rhs, root)?.truthy()))
        }
        Expr::Binary(lhs, BinOp::Or, rhs) => {
            Ok(Val::Bool(evaluate(lhs, root)?.truthy() || evaluate(rhs, root)?.truthy()))
        }
        Expr::Binary(lhs, op, rhs) => {
            let l = evaluate(lhs, root)?;
            let r = evaluate(rhs, root)?;
            binary(*op, &l, &r)
        }
        Expr::Call(name, args) => {
            let values = args
                .iter()
                .map(|a| evaluate(a, root))
                .collect::<Result<Vec<_>, _>>()?;
            call(name, &values)
        }
    }
}

/// Evaluate to a boolean verdict.
pub fn check(expr: &Expr, root: &serde_json::Value) -> Result<bool, ExprError> {
    Ok(evaluate(expr, root)?.truthy())
}

fn numbers(op: BinOp, l: &Val, r: &Val) -> Result<(f64, f64), ExprError> {
    match (l.as_num(), r.as_num()) {
        (Some(a), Some(b)) => Ok((a, b)),
        _ => Err(ExprError::Type(format!(
            "{op:?} needs numbers, got {} and {}",
            l.describe(),
            r.describe()
        ))),
    }
}

fn equals(l: &Val, r: &Val) -> bool {
    match (l, r) {
        (Val::Null, Val::Null) => true,
        (Val::Null, _) | (_, Val::Null) => false,
        (Val::Bool(a), Val::Bool(b)) => a == b,
        (Val::Str(a), Val::Str(b)) if a == b => true,
        (Val::List(a), Val::List(b)) => a.len() == b.len() && a.iter().zip(b).all(|(x, y)| equals(x, y)),
        _ => match (l.as_num(), r.as_num()) {
            (Some(a), Some(b)) => (a - b).abs() <= NUMERIC_TOLERANCE,
            _ => false,
        },
    }
}

fn binary(op: BinOp, l: &Val, r: &Val) -> Result<Val, ExprError> {
    match op {
        BinOp::Eq => Ok(Val::Bool(equals(l, r))),
        BinOp::Ne => Ok(Val::Bool(!equals(l, r))),
        BinOp::Add => {
            if let (Val::Str(a), Val::Str(b)) = (l, r) {
                if a.trim().parse::<f64>().is_err() || b.trim().parse::<f64>().is_err() {
                    return Ok(Val::Str(format!("{a}{b}")));
                }
            }
            let (a, b) = numbers(op, l, r)?;
            Ok(Val::Num(a + b))
        }
        BinOp::Sub => numbers(op, l, r).map(|(a, b)| Val::Num(a - b)),
        BinOp::Mul => numbers(op, l, r).map(|(a, b)| Val::Num(a * b)),
        BinOp::Div => {
            let (a, b) = numbers(op, l, r)?;
            if b == 0.0 {
                return Err(ExprError::DivideByZero);
            }
            Ok(Val::Num(a / b))
        }
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let ordering = match (l, r) {
                (Val::Str(a), Val::Str(b)) if l.as_num().is_none() || r.as_num().is_none() => a.cmp(b),
                _ => {
                    let (a, b) = numbers(op, l, r)?;
                    a.partial_cmp(&b)
                        .ok_or_else(|| ExprError::Type("NaN comparison".into()))?
                }
            };
            let result = match op {
                BinOp::Lt => ordering.is_lt(),
                BinOp::Le => ordering.is_le(),
                BinOp::Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            };
            Ok(Val::Bool(result))
        }
        BinOp::And | BinOp::Or => Ok(Val::Bool(match op {
            BinOp::And => l.truthy() && r.truthy(),
            _ => l.truthy() || r.truthy(),
        })),
    }
}

fn call(name: &str, args: &[Val]) -> Result<Val, ExprError> {
    let arg = |i: usize| args.get(i).cloned().unwrap_or(Val::Null);
    match name {
        "len" => Ok(match arg(0) {
            Val::Str(s) => Val::Num(s.chars().count() as f64),
            Val::List(items) => Val::Num(items.len() as f64),
            Val::Null => Val::Num(0.0),
            other => Val::Num(value_text(&other).chars().count() as f64),
        }),
        "abs" => {
            let v = arg(0);
            v.as_num()
                .map(|n| Val::Num(n.abs()))
                .ok_or_else(|| ExprError::Type(format!("abs needs a number, got {}", v.describe())))
        }
        "sum" => match arg(0) {
            Val::List(items) => {
                let mut total = 0.0;
                for item in &items {
                    match item {
                        Val::Null => {}
                        other => {
                            total += other.as_num().ok_or_else(|| {
                                ExprError::Type(format!("sum over non-number {}", other.describe()))
                            })?
                        }
                    }
                }
                Ok(Val::Num(total))
            }
            other => other
                .as_num()
                .map(Val::Num)
                .ok_or_else(|| ExprError::Type(format!("sum needs a list, got {}", other.describe()))),
        },
        "round" => {
            let v = arg(0);
            let places = arg(1).as_num().unwrap_or(0.0) as i32;
            let factor = 10f64.powi(places);
            v.as_num()
                .map(|n| Val::Num((n * factor).round() / factor))
                .ok_or_else(|| ExprError::Type(format!("round needs a number, got {}", v.describe())))
        }
        "empty" => Ok(Val::Bool(!arg(0).truthy())),
        other => Err(ExprError::UnknownFunction(other.to_string())),
    }
}

fn value_text(v: &Val) -> String {
    match v {
        Val::Null => String::new(),
        Val::Num(n) => n.to_string(),
        Val::Str(s) => s.clone(),
        Val::Bool(b) => b.to_string(),
        Val::List(items) => items.iter().map(value_text).collect::<Vec<_>>().join(","),
    }
}
