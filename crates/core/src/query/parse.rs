#![forbid(unsafe_code)]

use super::{QueryError, QueryExpr, QueryField, QueryValue};
use crate::status::JobStatus;

#[derive(Clone, Debug, PartialEq, Eq)]
enum Token {
    Word(String),
    Quoted(String),
    Eq,
    NotEq,
    LParen,
    RParen,
    Comma,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Word(w) => w.clone(),
            Token::Quoted(q) => format!("\"{q}\""),
            Token::Eq => "=".to_string(),
            Token::NotEq => "!=".to_string(),
            Token::LParen => "(".to_string(),
            Token::RParen => ")".to_string(),
            Token::Comma => ",".to_string(),
        }
    }

    fn is_keyword(&self, keyword: &str) -> bool {
        matches!(self, Token::Word(w) if w.eq_ignore_ascii_case(keyword))
    }
}

fn tokenize(input: &str) -> Result<Vec<(usize, Token)>, QueryError> {
    let mut out = Vec::new();
    let mut chars = input.char_indices().peekable();
    while let Some(&(pos, ch)) = chars.peek() {
        match ch {
            c if c.is_whitespace() => {
                chars.next();
            }
            '=' => {
                chars.next();
                out.push((pos, Token::Eq));
            }
            '!' => {
                chars.next();
                match chars.next() {
                    Some((_, '=')) => out.push((pos, Token::NotEq)),
                    _ => {
                        return Err(QueryError::UnexpectedToken {
                            pos,
                            found: "!".to_string(),
                        });
                    }
                }
            }
            '(' => {
                chars.next();
                out.push((pos, Token::LParen));
            }
            ')' => {
                chars.next();
                out.push((pos, Token::RParen));
            }
            ',' => {
                chars.next();
                out.push((pos, Token::Comma));
            }
            '"' | '\'' => {
                chars.next();
                let mut text = String::new();
                let mut closed = false;
                for (_, c) in chars.by_ref() {
                    if c == ch {
                        closed = true;
                        break;
                    }
                    text.push(c);
                }
                if !closed {
                    return Err(QueryError::UnterminatedString { pos });
                }
                out.push((pos, Token::Quoted(text)));
            }
            _ => {
                let mut word = String::new();
                while let Some(&(_, c)) = chars.peek() {
                    if c.is_whitespace() || matches!(c, '=' | '!' | '(' | ')' | ',' | '"' | '\'') {
                        break;
                    }
                    word.push(c);
                    chars.next();
                }
                out.push((pos, Token::Word(word)));
            }
        }
    }
    Ok(out)
}

/// Bound on nested `not` and parentheses, so a hostile query cannot
/// exhaust the stack while parsing or evaluating.
pub(crate) const MAX_DEPTH: usize = 128;

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn advance(&mut self) -> Result<(usize, Token), QueryError> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or(QueryError::UnexpectedEnd)?;
        self.pos += 1;
        Ok(token)
    }

    fn expect(&mut self, expected: Token) -> Result<(), QueryError> {
        let (pos, token) = self.advance()?;
        if token == expected {
            Ok(())
        } else {
            Err(unexpected(pos, &token))
        }
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.peek().is_some_and(|t| t.is_keyword(keyword)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expr(&mut self) -> Result<QueryExpr, QueryError> {
        let mut left = self.term()?;
        loop {
            let combine: fn(Box<QueryExpr>, Box<QueryExpr>) -> QueryExpr =
                if self.eat_keyword("or") {
                    QueryExpr::Or
                } else if self.eat_keyword("xor") {
                    QueryExpr::Xor
                } else if self.eat_keyword("sub") {
                    QueryExpr::Sub
                } else {
                    return Ok(left);
                };
            let right = self.term()?;
            left = combine(Box::new(left), Box::new(right));
        }
    }

    fn term(&mut self) -> Result<QueryExpr, QueryError> {
        let mut left = self.factor()?;
        while self.eat_keyword("and") {
            let right = self.factor()?;
            left = QueryExpr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn factor(&mut self) -> Result<QueryExpr, QueryError> {
        if self.eat_keyword("not") {
            self.descend()?;
            let inner = self.factor();
            self.depth -= 1;
            return Ok(QueryExpr::Not(Box::new(inner?)));
        }
        if self.peek() == Some(&Token::LParen) {
            self.pos += 1;
            self.descend()?;
            let inner = self.expr();
            self.depth -= 1;
            let inner = inner?;
            self.expect(Token::RParen)?;
            return Ok(inner);
        }
        self.comparison()
    }

    fn descend(&mut self) -> Result<(), QueryError> {
        if self.depth >= MAX_DEPTH {
            let pos = self.tokens.get(self.pos.saturating_sub(1)).map_or(0, |(p, _)| *p);
            return Err(QueryError::TooDeep {
                pos,
                max: MAX_DEPTH,
            });
        }
        self.depth += 1;
        Ok(())
    }

    fn comparison(&mut self) -> Result<QueryExpr, QueryError> {
        let (pos, token) = self.advance()?;
        let field = match token {
            Token::Word(ref name) if !is_reserved(name) => field_for(name),
            other => return Err(unexpected(pos, &other)),
        };
        let (pos, op) = self.advance()?;
        match op {
            Token::Eq => {
                let value = self.value(&field)?;
                Ok(QueryExpr::Eq(field, value))
            }
            Token::NotEq => {
                let value = self.value(&field)?;
                Ok(QueryExpr::Not(Box::new(QueryExpr::Eq(field, value))))
            }
            ref word if word.is_keyword("in") => {
                self.expect(Token::LParen)?;
                let mut values = vec![self.value(&field)?];
                loop {
                    let (pos, token) = self.advance()?;
                    match token {
                        Token::Comma => values.push(self.value(&field)?),
                        Token::RParen => break,
                        other => return Err(unexpected(pos, &other)),
                    }
                }
                Ok(QueryExpr::In(field, values))
            }
            other => Err(unexpected(pos, &other)),
        }
    }

    fn value(&mut self, field: &QueryField) -> Result<QueryValue, QueryError> {
        let (pos, token) = self.advance()?;
        let raw = match token {
            Token::Word(w) | Token::Quoted(w) => w,
            other => return Err(unexpected(pos, &other)),
        };
        match field {
            QueryField::Status => JobStatus::parse(&raw)
                .map(QueryValue::Status)
                .ok_or(QueryError::UnknownStatus(raw)),
            QueryField::Id => raw
                .parse::<u32>()
                .map(QueryValue::Id)
                .map_err(|_| QueryError::InvalidId(raw)),
            QueryField::Tag(_) => Ok(QueryValue::Text(raw)),
        }
    }
}

fn unexpected(pos: usize, token: &Token) -> QueryError {
    QueryError::UnexpectedToken {
        pos,
        found: token.describe(),
    }
}

fn is_reserved(word: &str) -> bool {
    ["and", "or", "xor", "sub", "not", "in"]
        .iter()
        .any(|k| k.eq_ignore_ascii_case(word))
}

fn field_for(name: &str) -> QueryField {
    if name.eq_ignore_ascii_case("status") {
        QueryField::Status
    } else if name.eq_ignore_ascii_case("id") {
        QueryField::Id
    } else {
        QueryField::Tag(name.to_string())
    }
}

pub fn parse(input: &str) -> Result<QueryExpr, QueryError> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(QueryError::Empty);
    }
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let expr = parser.expr()?;
    if let Some((pos, token)) = parser.tokens.get(parser.pos) {
        return Err(unexpected(*pos, token));
    }
    Ok(expr)
}
