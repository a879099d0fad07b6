//! Template syntax tree and the compile step that builds and checks it.

use std::{collections::HashSet, mem};

use serde_json::Value;

use super::lexer::{self, Piece, Token};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BinaryOp {
    And,
    Or,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Expr {
    Literal(Value),
    Var(String),
    Attr(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Call {
        target: Box<Expr>,
        method: Method,
        args: Vec<Expr>,
    },
    Not(Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
}

/// Query builder methods callable from a template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Method {
    Limit,
    Offset,
    Take,
    Value,
}

impl Method {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "limit" => Some(Method::Limit),
            "offset" => Some(Method::Offset),
            "take" => Some(Method::Take),
            "value" => Some(Method::Value),
            _ => None,
        }
    }

    fn arity(self) -> usize {
        match self {
            Method::Limit | Method::Offset => 1,
            Method::Take => 2,
            Method::Value => 0,
        }
    }

    pub(crate) fn name(self) -> &'static str {
        match self {
            Method::Limit => "limit",
            Method::Offset => "offset",
            Method::Take => "take",
            Method::Value => "value",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Node {
    Text(String),
    Output(Expr),
    Set {
        name: String,
        value: Expr,
    },
    If {
        branches: Vec<(Expr, Vec<Node>)>,
        otherwise: Vec<Node>,
    },
    Req {
        name: String,
        main: bool,
        body: Vec<Node>,
    },
    Error(String),
}

/// Names always in scope during evaluation.
pub(crate) const CONTEXT_VAR: &str = "context";

/// Parses `source` and runs the compile-time checks: balanced tags, unique
/// request names, at most one `main` request and no unresolved variables.
pub(crate) fn compile(source: &str) -> Result<Vec<Node>, String> {
    let pieces = lexer::split(source)?;
    let mut parser = Parser {
        pieces: pieces.into_iter(),
    };
    let (nodes, end) = parser.block(&[])?;
    if let Some((tag, line)) = end {
        return Err(format!("line {line}: unexpected `{tag}`"));
    }
    check(&nodes)?;
    Ok(nodes)
}

struct Parser {
    pieces: std::vec::IntoIter<Piece>,
}

impl Parser {
    /// Parses nodes until one of `terminators` (or end of input when empty).
    /// Returns the terminating tag body along with its line.
    fn block(
        &mut self,
        terminators: &[&str],
    ) -> Result<(Vec<Node>, Option<(String, usize)>), String> {
        let mut nodes = Vec::new();
        while let Some(piece) = self.pieces.next() {
            match piece {
                Piece::Text(text) => nodes.push(Node::Text(text)),
                Piece::Output { expr, line } => {
                    nodes.push(Node::Output(parse_expr(&expr).map_err(|e| at(line, e))?));
                }
                Piece::Tag { body, line } => {
                    let keyword = body.split_whitespace().next().unwrap_or_default();
                    if terminators.contains(&keyword) {
                        return Ok((nodes, Some((body, line))));
                    }
                    nodes.push(self.tag(keyword, &body, line)?);
                }
            }
        }
        if terminators.is_empty() {
            Ok((nodes, None))
        } else {
            Err(format!("missing `{{% {} %}}`", terminators[terminators.len() - 1]))
        }
    }

    fn tag(&mut self, keyword: &str, body: &str, line: usize) -> Result<Node, String> {
        let args = body[keyword.len()..].trim();
        match keyword {
            "req" => {
                let mut words = args.split_whitespace();
                let name = words
                    .next()
                    .filter(|n| is_identifier(n))
                    .ok_or_else(|| at(line, "`req` needs a name".into()))?
                    .to_string();
                let main = match words.next() {
                    None => false,
                    Some("main") => true,
                    Some(other) => return Err(at(line, format!("unexpected `{other}` in `req`"))),
                };
                if let Some(extra) = words.next() {
                    return Err(at(line, format!("unexpected `{extra}` in `req`")));
                }
                let (body, _) = self.block(&["endreq"])?;
                Ok(Node::Req { name, main, body })
            }
            "set" => {
                let (name, value) = args
                    .split_once('=')
                    .ok_or_else(|| at(line, "expected `set name = value`".into()))?;
                let name = name.trim();
                if !is_identifier(name) {
                    return Err(at(line, format!("invalid variable name `{name}`")));
                }
                Ok(Node::Set {
                    name: name.to_string(),
                    value: parse_expr(value).map_err(|e| at(line, e))?,
                })
            }
            "if" => {
                let mut branches = Vec::new();
                let mut condition = parse_expr(args).map_err(|e| at(line, e))?;
                loop {
                    let (body, end) = self.block(&["elif", "else", "endif"])?;
                    branches.push((condition, body));
                    let Some((tag, end_line)) = end else {
                        return Err(at(line, "missing `{% endif %}`".into()));
                    };
                    let keyword = tag.split_whitespace().next().unwrap_or_default();
                    match keyword {
                        "elif" => {
                            condition = parse_expr(tag[keyword.len()..].trim())
                                .map_err(|e| at(end_line, e))?;
                        }
                        "else" => {
                            let (otherwise, _) = self.block(&["endif"])?;
                            return Ok(Node::If { branches, otherwise });
                        }
                        _ => {
                            return Ok(Node::If {
                                branches,
                                otherwise: Vec::new(),
                            });
                        }
                    }
                }
            }
            "error" => match lexer::tokenize(args).map_err(|e| at(line, e))?.as_slice() {
                [Token::Str(code)] => Ok(Node::Error(code.clone())),
                _ => Err(at(line, "expected `error \"CODE\"`".into())),
            },
            "endreq" | "endif" | "elif" | "else" => Err(at(line, format!("unexpected `{keyword}`"))),
            other => Err(at(line, format!("unknown tag `{other}`"))),
        }
    }
}

fn at(line: usize, message: String) -> String {
    format!("line {line}: {message}")
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    chars.next().is_some_and(|c| c.is_alphabetic() || c == '_')
        && chars.all(|c| c.is_alphanumeric() || c == '_')
}

pub(crate) fn parse_expr(src: &str) -> Result<Expr, String> {
    let tokens = lexer::tokenize(src)?;
    let mut parser = ExprParser { tokens, pos: 0 };
    let expr = parser.or()?;
    match parser.peek() {
        None => Ok(expr),
        Some(token) => Err(format!("unexpected {token} in `{src}`")),
    }
}

struct ExprParser {
    tokens: Vec<Token>,
    pos: usize,
}

impl ExprParser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(k)) if k == keyword) && {
            self.pos += 1;
            true
        }
    }

    fn expect(&mut self, token: Token) -> Result<(), String> {
        match self.next() {
            Some(t) if t == token => Ok(()),
            Some(t) => Err(format!("expected {token}, found {t}")),
            None => Err(format!("expected {token}")),
        }
    }

    fn or(&mut self) -> Result<Expr, String> {
        let mut lhs = self.and()?;
        while self.eat_keyword("or") {
            lhs = Expr::Binary(BinaryOp::Or, Box::new(lhs), Box::new(self.and()?));
        }
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Expr, String> {
        let mut lhs = self.not()?;
        while self.eat_keyword("and") {
            lhs = Expr::Binary(BinaryOp::And, Box::new(lhs), Box::new(self.not()?));
        }
        Ok(lhs)
    }

    fn not(&mut self) -> Result<Expr, String> {
        if self.eat_keyword("not") {
            return Ok(Expr::Not(Box::new(self.not()?)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, String> {
        let lhs = self.postfix()?;
        let op = match self.peek() {
            Some(Token::Eq) => BinaryOp::Eq,
            Some(Token::Ne) => BinaryOp::Ne,
            Some(Token::Lt) => BinaryOp::Lt,
            Some(Token::Le) => BinaryOp::Le,
            Some(Token::Gt) => BinaryOp::Gt,
            Some(Token::Ge) => BinaryOp::Ge,
            _ => return Ok(lhs),
        };
        self.pos += 1;
        Ok(Expr::Binary(op, Box::new(lhs), Box::new(self.postfix()?)))
    }

    fn postfix(&mut self) -> Result<Expr, String> {
        let mut expr = self.primary()?;
        loop {
            if self.eat(&Token::Dot) {
                let name = match self.next() {
                    Some(Token::Ident(name)) => name,
                    Some(t) => return Err(format!("expected a name after `.`, found {t}")),
                    None => return Err("expected a name after `.`".into()),
                };
                if self.eat(&Token::LParen) {
                    let method = Method::parse(&name)
                        .ok_or_else(|| format!("unknown method `{name}`"))?;
                    let args = self.arguments()?;
                    if args.len() != method.arity() {
                        return Err(format!(
                            "`{name}` takes {} argument(s), got {}",
                            method.arity(),
                            args.len()
                        ));
                    }
                    expr = Expr::Call {
                        target: Box::new(expr),
                        method,
                        args,
                    };
                } else {
                    expr = Expr::Attr(Box::new(expr), name);
                }
            } else if self.eat(&Token::LBracket) {
                let index = self.or()?;
                self.expect(Token::RBracket)?;
                expr = Expr::Index(Box::new(expr), Box::new(index));
            } else {
                return Ok(expr);
            }
        }
    }

    fn arguments(&mut self) -> Result<Vec<Expr>, String> {
        let mut args = Vec::new();
        if self.eat(&Token::RParen) {
            return Ok(args);
        }
        loop {
            args.push(self.or()?);
            if self.eat(&Token::RParen) {
                return Ok(args);
            }
            self.expect(Token::Comma)?;
        }
    }

    fn primary(&mut self) -> Result<Expr, String> {
        match self.next() {
            Some(Token::Int(i)) => Ok(Expr::Literal(Value::from(i))),
            Some(Token::Float(f)) => Ok(Expr::Literal(Value::from(f))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::from(s))),
            Some(Token::Ident(name)) => Ok(match name.as_str() {
                "true" => Expr::Literal(Value::Bool(true)),
                "false" => Expr::Literal(Value::Bool(false)),
                "null" | "none" => Expr::Literal(Value::Null),
                _ => Expr::Var(name),
            }),
            Some(Token::LParen) => {
                let expr = self.or()?;
                self.expect(Token::RParen)?;
                Ok(expr)
            }
            Some(t) => Err(format!("unexpected {t}")),
            None => Err("unexpected end of expression".into()),
        }
    }
}

/// Walks the tree in evaluation order, tracking which names are defined.
/// A request name becomes visible after its block, a `set` name after the
/// tag. Inside `if` branches both stay local to the branch unless every
/// branch, `else` included, defines them.
fn check(nodes: &[Node]) -> Result<(), String> {
    let mut checker = Checker {
        defined: HashSet::from([CONTEXT_VAR.to_string()]),
        requests: HashSet::new(),
        main: None,
    };
    checker.nodes(nodes)
}

struct Checker {
    defined: HashSet<String>,
    requests: HashSet<String>,
    main: Option<String>,
}

impl Checker {
    fn nodes(&mut self, nodes: &[Node]) -> Result<(), String> {
        for node in nodes {
            match node {
                Node::Text(_) | Node::Error(_) => {}
                Node::Output(expr) => self.expr(expr)?,
                Node::Set { name, value } => {
                    self.expr(value)?;
                    if self.requests.contains(name) {
                        return Err(format!("`{name}` shadows a request block"));
                    }
                    self.defined.insert(name.clone());
                }
                Node::If {
                    branches,
                    otherwise,
                } => {
                    // names survive the `if` only when every path defines them
                    let before = self.defined.clone();
                    let mut common: Option<HashSet<String>> = None;
                    let bodies = branches
                        .iter()
                        .map(|(condition, body)| (Some(condition), body))
                        .chain([(None, otherwise)]);
                    for (condition, body) in bodies {
                        if let Some(condition) = condition {
                            self.expr(condition)?;
                        }
                        self.nodes(body)?;
                        let after = mem::replace(&mut self.defined, before.clone());
                        common = Some(match common {
                            None => after,
                            Some(common) => common.intersection(&after).cloned().collect(),
                        });
                    }
                    self.defined = common.unwrap_or(before);
                }
                Node::Req { name, main, body } => {
                    if !self.requests.insert(name.clone()) || self.defined.contains(name) {
                        return Err(format!("request `{name}` is declared more than once"));
                    }
                    if *main {
                        if let Some(existing) = &self.main {
                            return Err(format!(
                                "`{name}` and `{existing}` are both marked main"
                            ));
                        }
                        self.main = Some(name.clone());
                    }
                    self.nodes(body)?;
                    self.defined.insert(name.clone());
                }
            }
        }
        Ok(())
    }

    fn expr(&self, expr: &Expr) -> Result<(), String> {
        match expr {
            Expr::Literal(_) => Ok(()),
            Expr::Var(name) if self.defined.contains(name) => Ok(()),
            Expr::Var(name) => Err(format!("`{name}` is not defined")),
            Expr::Attr(target, _) | Expr::Not(target) => self.expr(target),
            Expr::Index(target, index) => {
                self.expr(target)?;
                self.expr(index)
            }
            Expr::Call { target, args, .. } => {
                self.expr(target)?;
                args.iter().try_for_each(|a| self.expr(a))
            }
            Expr::Binary(_, lhs, rhs) => {
                self.expr(lhs)?;
                self.expr(rhs)
            }
        }
    }
}
