//! Recursive-descent parser producing the evaluation tree.
//!
//! Precedence, lowest first: `?:`, `||`, `&&`, comparisons (`== != < <= > >= in`),
//! `+ -`, `* / %`, unary `! -`, postfix (`.field`, `[index]`, `.method(args)`).

use regex::{Regex, RegexBuilder};
use serde_json::Value;

use super::lexer::{Spanned, Tok};
use crate::error::{EngineError, Result};

pub(crate) const MAX_DEPTH: usize = 48;
pub(crate) const MAX_NODES: usize = 512;
const REGEX_SIZE_LIMIT: usize = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BinOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Func {
    Size,
    Has,
    Int,
    String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Method {
    StartsWith,
    EndsWith,
    Contains,
    Matches,
    LowerAscii,
    UpperAscii,
    Size,
}

impl Method {
    fn arity(self) -> usize {
        match self {
            Method::StartsWith | Method::EndsWith | Method::Contains | Method::Matches => 1,
            Method::LowerAscii | Method::UpperAscii | Method::Size => 0,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) enum Node {
    Lit(Value),
    Ident(String),
    List(Vec<Node>),
    Member(Box<Node>, String),
    Index(Box<Node>, Box<Node>),
    Call(Func, Vec<Node>),
    Method {
        target: Box<Node>,
        method: Method,
        args: Vec<Node>,
        /// Pre-compiled pattern for `matches`.
        regex: Option<Regex>,
    },
    Not(Box<Node>),
    Neg(Box<Node>),
    And(Box<Node>, Box<Node>),
    Or(Box<Node>, Box<Node>),
    Binary(BinOp, Box<Node>, Box<Node>),
    Cond(Box<Node>, Box<Node>, Box<Node>),
}

pub(crate) struct Parser {
    toks: Vec<Spanned>,
    pos: usize,
    depth: usize,
    nodes: usize,
    src_len: usize,
    /// Root identifiers referenced by the expression.
    pub roots: Vec<String>,
}

impl Parser {
    pub fn new(toks: Vec<Spanned>, src_len: usize) -> Self {
        Self {
            toks,
            pos: 0,
            depth: 0,
            nodes: 0,
            src_len,
            roots: Vec::new(),
        }
    }

    pub fn parse(&mut self) -> Result<Node> {
        if self.toks.is_empty() {
            return Err(EngineError::InvalidExpression("empty expression".into()));
        }
        let node = self.ternary()?;
        if let Some(t) = self.toks.get(self.pos) {
            return Err(self.err(t.at, "unexpected trailing input"));
        }
        Ok(node)
    }

    fn ternary(&mut self) -> Result<Node> {
        self.enter()?;
        let cond = self.or()?;
        let out = if self.eat(&Tok::Question) {
            let a = self.ternary()?;
            self.expect(&Tok::Colon, "`:`")?;
            let b = self.ternary()?;
            self.node(Node::Cond(Box::new(cond), Box::new(a), Box::new(b)))?
        } else {
            cond
        };
        self.leave();
        Ok(out)
    }

    fn or(&mut self) -> Result<Node> {
        let mut lhs = self.and()?;
        while self.eat(&Tok::Or) {
            let rhs = self.and()?;
            lhs = self.node(Node::Or(Box::new(lhs), Box::new(rhs)))?;
        }
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Node> {
        let mut lhs = self.comparison()?;
        while self.eat(&Tok::And) {
            let rhs = self.comparison()?;
            lhs = self.node(Node::And(Box::new(lhs), Box::new(rhs)))?;
        }
        Ok(lhs)
    }

    fn comparison(&mut self) -> Result<Node> {
        let lhs = self.additive()?;
        let op = match self.peek() {
            Some(Tok::Eq) => BinOp::Eq,
            Some(Tok::Ne) => BinOp::Ne,
            Some(Tok::Lt) => BinOp::Lt,
            Some(Tok::Le) => BinOp::Le,
            Some(Tok::Gt) => BinOp::Gt,
            Some(Tok::Ge) => BinOp::Ge,
            Some(Tok::In) => BinOp::In,
            _ => return Ok(lhs),
        };
        self.pos += 1;
        let rhs = self.additive()?;
        self.node(Node::Binary(op, Box::new(lhs), Box::new(rhs)))
    }

    fn additive(&mut self) -> Result<Node> {
        let mut lhs = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Tok::Plus) => BinOp::Add,
                Some(Tok::Minus) => BinOp::Sub,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.multiplicative()?;
            lhs = self.node(Node::Binary(op, Box::new(lhs), Box::new(rhs)))?;
        }
    }

    fn multiplicative(&mut self) -> Result<Node> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Tok::Star) => BinOp::Mul,
                Some(Tok::Slash) => BinOp::Div,
                Some(Tok::Percent) => BinOp::Rem,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = self.node(Node::Binary(op, Box::new(lhs), Box::new(rhs)))?;
        }
    }

    fn unary(&mut self) -> Result<Node> {
        self.enter()?;
        let out = if self.eat(&Tok::Not) {
            let inner = self.unary()?;
            self.node(Node::Not(Box::new(inner)))?
        } else if self.eat(&Tok::Minus) {
            let inner = self.unary()?;
            self.node(Node::Neg(Box::new(inner)))?
        } else {
            self.postfix()?
        };
        self.leave();
        Ok(out)
    }

    fn postfix(&mut self) -> Result<Node> {
        let mut node = self.primary()?;
        loop {
            if self.eat(&Tok::Dot) {
                let at = self.at();
                let name = match self.next() {
                    Some(Tok::Ident(n)) => n,
                    _ => return Err(self.err(at, "expected field or method name after `.`")),
                };
                if self.peek() == Some(&Tok::LParen) {
                    node = self.method_call(node, &name, at)?;
                } else {
                    node = self.node(Node::Member(Box::new(node), name))?;
                }
            } else if self.eat(&Tok::LBracket) {
                let idx = self.ternary()?;
                self.expect(&Tok::RBracket, "`]`")?;
                node = self.node(Node::Index(Box::new(node), Box::new(idx)))?;
            } else {
                return Ok(node);
            }
        }
    }

    fn method_call(&mut self, target: Node, name: &str, at: usize) -> Result<Node> {
        let method = match name {
            "startsWith" => Method::StartsWith,
            "endsWith" => Method::EndsWith,
            "contains" => Method::Contains,
            "matches" => Method::Matches,
            "lowerAscii" => Method::LowerAscii,
            "upperAscii" => Method::UpperAscii,
            "size" => Method::Size,
            other => return Err(self.err(at, &format!("unknown method `{other}`"))),
        };
        let args = self.args()?;
        if args.len() != method.arity() {
            return Err(self.err(
                at,
                &format!("`{name}` takes {} argument(s), got {}", method.arity(), args.len()),
            ));
        }

        let regex = if method == Method::Matches {
            // Patterns must be literals so they compile here, not per request.
            let Some(Node::Lit(Value::String(pat))) = args.first() else {
                return Err(self.err(at, "`matches` requires a string literal pattern"));
            };
            let re = RegexBuilder::new(pat)
                .size_limit(REGEX_SIZE_LIMIT)
                .build()
                .map_err(|e| self.err(at, &format!("invalid regex: {e}")))?;
            Some(re)
        } else {
            None
        };

        self.node(Node::Method {
            target: Box::new(target),
            method,
            args,
            regex,
        })
    }

    fn args(&mut self) -> Result<Vec<Node>> {
        self.expect(&Tok::LParen, "`(`")?;
        let mut args = Vec::new();
        if self.eat(&Tok::RParen) {
            return Ok(args);
        }
        loop {
            args.push(self.ternary()?);
            if self.eat(&Tok::Comma) {
                continue;
            }
            self.expect(&Tok::RParen, "`)`")?;
            return Ok(args);
        }
    }

    fn primary(&mut self) -> Result<Node> {
        let at = self.at();
        let Some(tok) = self.next() else {
            return Err(self.err(at, "unexpected end of expression"));
        };
        match tok {
            Tok::Int(i) => self.node(Node::Lit(Value::from(i))),
            Tok::Float(f) => self.node(Node::Lit(Value::from(f))),
            Tok::Str(s) => self.node(Node::Lit(Value::String(s))),
            Tok::True => self.node(Node::Lit(Value::Bool(true))),
            Tok::False => self.node(Node::Lit(Value::Bool(false))),
            Tok::Null => self.node(Node::Lit(Value::Null)),
            Tok::LParen => {
                let inner = self.ternary()?;
                self.expect(&Tok::RParen, "`)`")?;
                Ok(inner)
            }
            Tok::LBracket => {
                let mut items = Vec::new();
                if !self.eat(&Tok::RBracket) {
                    loop {
                        items.push(self.ternary()?);
                        if self.eat(&Tok::Comma) {
                            continue;
                        }
                        self.expect(&Tok::RBracket, "`]`")?;
                        break;
                    }
                }
                self.node(Node::List(items))
            }
            Tok::Ident(name) => {
                if self.peek() == Some(&Tok::LParen) {
                    let func = match name.as_str() {
                        "size" => Func::Size,
                        "has" => Func::Has,
                        "int" => Func::Int,
                        "string" => Func::String,
                        other => return Err(self.err(at, &format!("unknown function `{other}`"))),
                    };
                    let args = self.args()?;
                    if args.len() != 1 {
                        return Err(self.err(at, &format!("`{name}` takes exactly one argument")));
                    }
                    self.node(Node::Call(func, args))
                } else {
                    if !self.roots.contains(&name) {
                        self.roots.push(name.clone());
                    }
                    self.node(Node::Ident(name))
                }
            }
            other => Err(self.err(at, &format!("unexpected token {other:?}"))),
        }
    }

    // ---- helpers

    fn node(&mut self, n: Node) -> Result<Node> {
        self.nodes += 1;
        if self.nodes > MAX_NODES {
            return Err(EngineError::InvalidExpression(format!(
                "expression exceeds {MAX_NODES} nodes"
            )));
        }
        Ok(n)
    }

    fn enter(&mut self) -> Result<()> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(EngineError::InvalidExpression(format!(
                "expression nesting exceeds {MAX_DEPTH}"
            )));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    fn peek(&self) -> Option<&Tok> {
        self.toks.get(self.pos).map(|t| &t.tok)
    }

    fn next(&mut self) -> Option<Tok> {
        let t = self.toks.get(self.pos).map(|t| t.tok.clone());
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn at(&self) -> usize {
        self.toks.get(self.pos).map(|t| t.at).unwrap_or(self.src_len)
    }

    fn eat(&mut self, tok: &Tok) -> bool {
        if self.peek() == Some(tok) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, tok: &Tok, what: &str) -> Result<()> {
        let at = self.at();
        if self.eat(tok) {
            Ok(())
        } else {
            Err(self.err(at, &format!("expected {what}")))
        }
    }

    fn err(&self, at: usize, msg: &str) -> EngineError {
        EngineError::InvalidExpression(format!("{msg} at offset {at}"))
    }
}
