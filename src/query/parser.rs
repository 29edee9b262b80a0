//! Tokenizer and recursive-descent parser shared by both query dialects
//!
//! Precedence (lowest first): OR, AND, NOT, predicate / parenthesised group.

use regex::Regex;

use super::{CmpOp, Expr, Literal};
use crate::error::{DwiprocError, Result};

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Lit(Literal),
    Op(CmpOp),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Dot,
    And,
    Or,
    Not,
    In,
    Is,
    Like,
}

/// Map attribute aliases onto the names used by `EntityRecord::attr`
fn canonical_attr(name: &str) -> String {
    match name {
        "subject" => "sub",
        "session" => "ses",
        "extension" => "ext",
        other => other,
    }
    .to_string()
}

fn keyword(word: &str) -> Option<Token> {
    let token = match word.to_ascii_uppercase().as_str() {
        "AND" => Token::And,
        "OR" => Token::Or,
        "NOT" => Token::Not,
        "IN" => Token::In,
        "IS" => Token::Is,
        "LIKE" => Token::Like,
        "NULL" | "NONE" => Token::Lit(Literal::Null),
        "TRUE" => Token::Lit(Literal::Bool(true)),
        "FALSE" => Token::Lit(Literal::Bool(false)),
        _ => return None,
    };
    Some(token)
}

struct Lexer<'a> {
    source: &'a str,
    chars: Vec<(usize, char)>,
    pos: usize,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            source,
            chars: source.char_indices().collect(),
            pos: 0,
        }
    }

    fn error(&self, position: usize, details: impl Into<String>) -> DwiprocError {
        DwiprocError::QueryParse {
            query: self.source.to_string(),
            position,
            details: details.into(),
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).map(|&(_, c)| c)
    }

    fn peek_next(&self) -> Option<char> {
        self.chars.get(self.pos + 1).map(|&(_, c)| c)
    }

    fn offset(&self) -> usize {
        self.chars
            .get(self.pos)
            .map_or(self.source.len(), |&(offset, _)| offset)
    }

    /// Consume `c` if it is next
    fn eat(&mut self, c: char) -> bool {
        if self.peek() == Some(c) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn tokenize(mut self) -> Result<Vec<(Token, usize)>> {
        let mut tokens = Vec::new();
        while let Some(c) = self.peek() {
            let start = self.offset();
            if c.is_whitespace() {
                self.pos += 1;
                continue;
            }
            let token = match c {
                '(' | ')' | '[' | ']' | ',' | '.' => {
                    self.pos += 1;
                    match c {
                        '(' => Token::LParen,
                        ')' => Token::RParen,
                        '[' => Token::LBracket,
                        ']' => Token::RBracket,
                        ',' => Token::Comma,
                        _ => Token::Dot,
                    }
                }
                '&' => {
                    self.pos += 1;
                    self.eat('&');
                    Token::And
                }
                '|' => {
                    self.pos += 1;
                    self.eat('|');
                    Token::Or
                }
                '~' => {
                    self.pos += 1;
                    Token::Not
                }
                '!' => {
                    self.pos += 1;
                    if self.eat('=') {
                        Token::Op(CmpOp::Ne)
                    } else {
                        Token::Not
                    }
                }
                '=' => {
                    self.pos += 1;
                    self.eat('=');
                    Token::Op(CmpOp::Eq)
                }
                '<' => {
                    self.pos += 1;
                    if self.eat('=') {
                        Token::Op(CmpOp::Le)
                    } else if self.eat('>') {
                        Token::Op(CmpOp::Ne)
                    } else {
                        Token::Op(CmpOp::Lt)
                    }
                }
                '>' => {
                    self.pos += 1;
                    if self.eat('=') {
                        Token::Op(CmpOp::Ge)
                    } else {
                        Token::Op(CmpOp::Gt)
                    }
                }
                '\'' | '"' => self.string(c)?,
                '-' if self.peek_next().is_some_and(|n| n.is_ascii_digit()) => self.number()?,
                c if c.is_ascii_digit() => self.number()?,
                c if c.is_alphabetic() || c == '_' => self.word(),
                other => return Err(self.error(start, format!("unexpected character '{other}'"))),
            };
            tokens.push((token, start));
        }
        Ok(tokens)
    }

    fn string(&mut self, quote: char) -> Result<Token> {
        let start = self.offset();
        self.pos += 1;
        let mut value = String::new();
        loop {
            match self.peek() {
                None => return Err(self.error(start, "unterminated string literal")),
                Some('\\') => {
                    self.pos += 1;
                    match self.peek() {
                        Some(escaped) => {
                            value.push(escaped);
                            self.pos += 1;
                        }
                        None => return Err(self.error(start, "unterminated string literal")),
                    }
                }
                Some(c) if c == quote => {
                    self.pos += 1;
                    // SQL-style doubled quote
                    if self.eat(quote) {
                        value.push(quote);
                    } else {
                        return Ok(Token::Lit(Literal::Str(value)));
                    }
                }
                Some(c) => {
                    value.push(c);
                    self.pos += 1;
                }
            }
        }
    }

    fn number(&mut self) -> Result<Token> {
        let start = self.offset();
        let mut text = String::new();
        if self.eat('-') {
            text.push('-');
        }
        while let Some(c) = self.peek().filter(|c| c.is_ascii_digit() || *c == '.') {
            // `1.` followed by a letter is an attribute access, not a float
            if c == '.' && !self.peek_next().is_some_and(|n| n.is_ascii_digit()) {
                break;
            }
            text.push(c);
            self.pos += 1;
        }
        let literal = if text.contains('.') {
            text.parse::<f64>().map(Literal::Float).ok()
        } else {
            text.parse::<i64>().map(Literal::Int).ok()
        };
        literal
            .map(Token::Lit)
            .ok_or_else(|| self.error(start, format!("invalid number '{text}'")))
    }

    fn word(&mut self) -> Token {
        let mut word = String::new();
        while let Some(c) = self.peek().filter(|c| c.is_alphanumeric() || *c == '_') {
            word.push(c);
            self.pos += 1;
        }
        keyword(&word).unwrap_or(Token::Ident(word))
    }
}

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<(Token, usize)>,
    pos: usize,
}

impl Parser<'_> {
    fn error(&self, details: impl Into<String>) -> DwiprocError {
        let position = self
            .tokens
            .get(self.pos)
            .map_or(self.source.len(), |(_, offset)| *offset);
        DwiprocError::QueryParse {
            query: self.source.to_string(),
            position,
            details: details.into(),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(t, _)| t.clone());
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: Token, what: &str) -> Result<()> {
        if self.eat(&expected) {
            Ok(())
        } else {
            Err(self.error(format!("expected {what}")))
        }
    }

    fn ident(&mut self) -> Result<String> {
        match self.peek() {
            Some(Token::Ident(name)) => {
                let name = name.clone();
                self.pos += 1;
                Ok(name)
            }
            _ => Err(self.error("expected attribute name")),
        }
    }

    fn string(&mut self) -> Result<String> {
        match self.peek() {
            Some(Token::Lit(Literal::Str(s))) => {
                let s = s.clone();
                self.pos += 1;
                Ok(s)
            }
            _ => Err(self.error("expected string literal")),
        }
    }

    fn or(&mut self) -> Result<Expr> {
        let mut lhs = self.and()?;
        while self.eat(&Token::Or) {
            let rhs = self.and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Expr> {
        let mut lhs = self.not()?;
        while self.eat(&Token::And) {
            let rhs = self.not()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn not(&mut self) -> Result<Expr> {
        if self.eat(&Token::Not) {
            Ok(Expr::Not(Box::new(self.not()?)))
        } else {
            self.primary()
        }
    }

    fn primary(&mut self) -> Result<Expr> {
        if self.eat(&Token::LParen) {
            let expr = self.or()?;
            self.expect(Token::RParen, "')'")?;
            return Ok(expr);
        }
        self.predicate()
    }

    fn predicate(&mut self) -> Result<Expr> {
        let attr = canonical_attr(&self.ident()?);

        if self.eat(&Token::Dot) {
            return self.method(attr);
        }

        let Some(token) = self.peek().cloned() else {
            return Err(self.error(format!("expected comparison after '{attr}'")));
        };
        match token {
            Token::Op(op) => {
                self.pos += 1;
                let value = self.literal()?;
                Ok(match (op, value) {
                    (CmpOp::Eq, Literal::Null) => Expr::IsNull { attr },
                    (CmpOp::Ne, Literal::Null) => Expr::Not(Box::new(Expr::IsNull { attr })),
                    (_, Literal::Null) => return Err(self.error("NULL only supports = and !=")),
                    (op, value) => Expr::Compare { attr, op, value },
                })
            }
            Token::Is => {
                self.pos += 1;
                let negated = self.eat(&Token::Not);
                self.expect(Token::Lit(Literal::Null), "NULL")?;
                let expr = Expr::IsNull { attr };
                Ok(if negated { Expr::Not(Box::new(expr)) } else { expr })
            }
            Token::Not => {
                self.pos += 1;
                let inner = self.membership(attr)?;
                Ok(Expr::Not(Box::new(inner)))
            }
            Token::In => {
                self.pos += 1;
                Ok(Expr::In {
                    attr,
                    values: self.list()?,
                })
            }
            Token::Like => {
                self.pos += 1;
                let pattern = self.string()?;
                self.like(attr, &pattern)
            }
            _ => Err(self.error(format!("expected comparison after '{attr}'"))),
        }
    }

    /// `IN (...)` or `LIKE '...'` following `NOT`
    fn membership(&mut self, attr: String) -> Result<Expr> {
        if self.eat(&Token::In) {
            Ok(Expr::In {
                attr,
                values: self.list()?,
            })
        } else if self.eat(&Token::Like) {
            let pattern = self.string()?;
            self.like(attr, &pattern)
        } else {
            Err(self.error("expected IN or LIKE after NOT"))
        }
    }

    /// Legacy accessor methods: `.isin([...])`, `.isnull()`, `.str.contains('...')`
    fn method(&mut self, attr: String) -> Result<Expr> {
        let name = self.ident()?;
        match name.as_str() {
            "str" => {
                self.expect(Token::Dot, "'.'")?;
                let func = self.ident()?;
                self.expect(Token::LParen, "'('")?;
                let arg = self.string()?;
                self.expect(Token::RParen, "')'")?;
                let pattern = match func.as_str() {
                    "contains" => arg,
                    "startswith" => format!("^{}", regex::escape(&arg)),
                    "endswith" => format!("{}$", regex::escape(&arg)),
                    other => return Err(self.error(format!("unsupported method 'str.{other}'"))),
                };
                self.regex(attr, &pattern)
            }
            "isin" => {
                self.expect(Token::LParen, "'('")?;
                let values = self.list()?;
                self.expect(Token::RParen, "')'")?;
                Ok(Expr::In { attr, values })
            }
            "isnull" | "isna" | "notnull" | "notna" => {
                self.expect(Token::LParen, "'('")?;
                self.expect(Token::RParen, "')'")?;
                let expr = Expr::IsNull { attr };
                Ok(if name.starts_with("not") {
                    Expr::Not(Box::new(expr))
                } else {
                    expr
                })
            }
            other => Err(self.error(format!("unsupported method '{other}'"))),
        }
    }

    fn literal(&mut self) -> Result<Literal> {
        match self.peek() {
            Some(Token::Lit(value)) => {
                let value = value.clone();
                self.pos += 1;
                Ok(value)
            }
            _ => Err(self.error("expected literal value")),
        }
    }

    /// `(a, b)` or `[a, b]`
    fn list(&mut self) -> Result<Vec<Literal>> {
        let close = match self.next() {
            Some(Token::LParen) => Token::RParen,
            Some(Token::LBracket) => Token::RBracket,
            _ => return Err(self.error("expected '(' or '['")),
        };
        let mut values = Vec::new();
        if self.eat(&close) {
            return Ok(values);
        }
        loop {
            values.push(self.literal()?);
            if self.eat(&close) {
                return Ok(values);
            }
            self.expect(Token::Comma, "',' or end of list")?;
        }
    }

    fn like(&self, attr: String, pattern: &str) -> Result<Expr> {
        let mut regex = String::from("^");
        for c in pattern.chars() {
            match c {
                '%' => regex.push_str(".*"),
                '_' => regex.push('.'),
                other => regex.push_str(&regex::escape(&other.to_string())),
            }
        }
        regex.push('$');
        self.regex(attr, &regex)
    }

    fn regex(&self, attr: String, pattern: &str) -> Result<Expr> {
        let regex = Regex::new(pattern).map_err(|e| self.error(format!("invalid pattern: {e}")))?;
        Ok(Expr::Matches { attr, regex })
    }
}

/// Compile query text into an expression tree
pub(super) fn parse(source: &str) -> Result<Expr> {
    let tokens = Lexer::new(source).tokenize()?;
    let mut parser = Parser {
        source,
        tokens,
        pos: 0,
    };
    if parser.peek().is_none() {
        return Err(parser.error("empty query"));
    }
    let expr = parser.or()?;
    if parser.peek().is_some() {
        return Err(parser.error("unexpected trailing input"));
    }
    Ok(expr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn and_binds_tighter_than_or() {
        let expr = parse("a = 1 OR b = 2 AND c = 3").unwrap();
        assert_eq!(expr.to_string(), "(a = 1 OR (b = 2 AND c = 3))");
    }

    #[test]
    fn sql_operators_and_literals() {
        let expr = parse("run <> 2 AND acq LIKE 'hi_res%' AND desc NOT IN ('a', 'b')").unwrap();
        assert_eq!(
            expr.to_string(),
            "((run != 2 AND acq ~ /^hi.res.*$/) AND NOT desc IN ('a', 'b'))"
        );
    }

    #[test]
    fn equality_with_null_becomes_null_check() {
        assert_eq!(parse("ses == None").unwrap().to_string(), "ses IS NULL");
        assert_eq!(parse("ses IS NOT NULL").unwrap().to_string(), "NOT ses IS NULL");
    }

    #[test]
    fn doubled_quotes_escape() {
        let expr = parse("desc = 'it''s'").unwrap();
        assert_eq!(expr.to_string(), "desc = 'it''s'");
    }

    #[test]
    fn negative_and_float_numbers() {
        let expr = parse("x > -1 AND y <= 2.5").unwrap();
        assert_eq!(expr.to_string(), "(x > -1 AND y <= 2.5)");
    }

    #[test]
    fn errors_report_position() {
        match parse("sub == ").unwrap_err() {
            DwiprocError::QueryParse { position, .. } => assert_eq!(position, 7),
            other => panic!("unexpected error: {other}"),
        }
        assert!(parse("").is_err());
        assert!(parse("sub == '1' extra").is_err());
        assert!(parse("(sub == '1'").is_err());
        assert!(parse("sub == 'open").is_err());
        assert!(parse("sub.upper()").is_err());
        assert!(parse("sub # 1").is_err());
    }
}
