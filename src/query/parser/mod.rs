pub mod ast;
pub mod lexer;

pub use ast::{
    BinOp, BinaryExpr, Expr, FunctionCall, Grouping, Literal, MetricSelector, RangeExpr, TimeBound,
    TimeRangeSpec,
};
pub use lexer::{LexError, Lexer, Token, TokenKind};

use thiserror::Error;

use crate::storage::catalog::{LabelMatcher, MatchOp};

#[derive(Debug, Error, PartialEq)]
#[error("Unexpected {found} at offset {position}: expected {expected}")]
pub struct ParseError {
    pub position: usize,
    pub expected: String,
    pub found: String,
}

/// Recursive-descent parser over the token stream produced by [`Lexer`].
///
/// Precedence, loosest first: `or`, `and`, comparisons, `+ -`, `* / %`,
/// unary minus. A `[start:end:step]` suffix binds tighter than any binary
/// operator, so `a + b[now-1h:now]` attaches the window to `b` alone.
pub struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> Parser<'a> {
    /// The token slice must end with an `Eof` token, as `tokenize` guarantees.
    pub fn new(tokens: &'a [Token]) -> Self {
        debug_assert!(matches!(
            tokens.last().map(|token| &token.kind),
            Some(TokenKind::Eof)
        ));
        Self { tokens, pos: 0 }
    }

    /// Parses a complete query, requiring every token to be consumed.
    pub fn parse(&mut self) -> Result<Expr, ParseError> {
        let expr = self.parse_expr()?;
        if !matches!(self.peek().kind, TokenKind::Eof) {
            return Err(self.unexpected("end of input"));
        }
        Ok(expr)
    }

    fn parse_expr(&mut self) -> Result<Expr, ParseError> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_and()?;
        while self.eat(TokenKind::Or) {
            let rhs = self.parse_and()?;
            expr = Expr::binary(BinOp::Or, expr, rhs);
        }
        Ok(expr)
    }

    fn parse_and(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_comparison()?;
        while self.eat(TokenKind::And) {
            let rhs = self.parse_comparison()?;
            expr = Expr::binary(BinOp::And, expr, rhs);
        }
        Ok(expr)
    }

    fn parse_comparison(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_additive()?;
        loop {
            let op = match &self.peek().kind {
                TokenKind::EqEq => BinOp::Eq,
                TokenKind::Neq => BinOp::Neq,
                TokenKind::Gt => BinOp::Gt,
                TokenKind::Lt => BinOp::Lt,
                TokenKind::Gte => BinOp::Gte,
                TokenKind::Lte => BinOp::Lte,
                _ => break,
            };
            self.bump();
            let rhs = self.parse_additive()?;
            expr = Expr::binary(op, expr, rhs);
        }
        Ok(expr)
    }

    fn parse_additive(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_multiplicative()?;
        loop {
            let op = match &self.peek().kind {
                TokenKind::Plus => BinOp::Add,
                TokenKind::Minus => BinOp::Sub,
                _ => break,
            };
            self.bump();
            let rhs = self.parse_multiplicative()?;
            expr = Expr::binary(op, expr, rhs);
        }
        Ok(expr)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_unary()?;
        loop {
            let op = match &self.peek().kind {
                TokenKind::Star => BinOp::Mul,
                TokenKind::Slash => BinOp::Div,
                TokenKind::Percent => BinOp::Mod,
                _ => break,
            };
            self.bump();
            let rhs = self.parse_unary()?;
            expr = Expr::binary(op, expr, rhs);
        }
        Ok(expr)
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        if self.eat(TokenKind::Minus) {
            let operand = self.parse_unary()?;
            // Negated number literals fold; anything else becomes 0 - x.
            return Ok(match operand {
                Expr::Literal(Literal::Number(value)) => Expr::number(-value),
                other => Expr::binary(BinOp::Sub, Expr::number(0.0), other),
            });
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_primary()?;
        while self.eat(TokenKind::LBracket) {
            let range = self.parse_range_spec()?;
            expr = Expr::Range(RangeExpr {
                expr: Box::new(expr),
                range,
            });
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        match &self.peek().kind {
            TokenKind::Number(value) => {
                let value = *value;
                self.bump();
                Ok(Expr::number(value))
            }
            TokenKind::Str(text) => {
                let text = text.clone();
                self.bump();
                Ok(Expr::Literal(Literal::Str(text)))
            }
            TokenKind::LParen => {
                self.bump();
                let expr = self.parse_expr()?;
                self.expect(TokenKind::RParen, "')'")?;
                Ok(expr)
            }
            TokenKind::Ident => {
                let name = self.bump().text.clone();
                if self.eat(TokenKind::LParen) {
                    self.parse_call(name)
                } else if self.eat(TokenKind::LBrace) {
                    let matchers = self.parse_matchers()?;
                    Ok(Expr::Selector(MetricSelector {
                        metric: name,
                        matchers,
                    }))
                } else {
                    Ok(Expr::Selector(MetricSelector::bare(name)))
                }
            }
            _ => Err(self.unexpected("an expression")),
        }
    }

    fn parse_call(&mut self, name: String) -> Result<Expr, ParseError> {
        let mut args = Vec::new();
        if !self.eat(TokenKind::RParen) {
            loop {
                args.push(self.parse_expr()?);
                if self.eat(TokenKind::Comma) {
                    continue;
                }
                self.expect(TokenKind::RParen, "',' or ')'")?;
                break;
            }
        }
        let grouping = self.parse_grouping()?;
        Ok(Expr::Call(FunctionCall {
            name,
            args,
            grouping,
        }))
    }

    fn parse_grouping(&mut self) -> Result<Option<Grouping>, ParseError> {
        let by = match &self.peek().kind {
            TokenKind::By => true,
            TokenKind::Without => false,
            _ => return Ok(None),
        };
        self.bump();
        self.expect(TokenKind::LParen, "'('")?;
        let mut labels = Vec::new();
        if !self.eat(TokenKind::RParen) {
            loop {
                match &self.peek().kind {
                    TokenKind::Ident => labels.push(self.bump().text.clone()),
                    _ => return Err(self.unexpected("a label name")),
                }
                if self.eat(TokenKind::Comma) {
                    continue;
                }
                self.expect(TokenKind::RParen, "',' or ')'")?;
                break;
            }
        }
        Ok(Some(if by {
            Grouping::By(labels)
        } else {
            Grouping::Without(labels)
        }))
    }

    fn parse_matchers(&mut self) -> Result<Vec<LabelMatcher>, ParseError> {
        let mut matchers = Vec::new();
        if self.eat(TokenKind::RBrace) {
            return Ok(matchers);
        }
        loop {
            let label = match &self.peek().kind {
                TokenKind::Ident => self.bump().text.clone(),
                _ => return Err(self.unexpected("a label name")),
            };
            let op = match &self.peek().kind {
                TokenKind::Eq => MatchOp::Eq,
                TokenKind::Neq => MatchOp::Neq,
                TokenKind::ReMatch => MatchOp::Re,
                TokenKind::ReNotMatch => MatchOp::NotRe,
                _ => return Err(self.unexpected("a matcher operator")),
            };
            self.bump();
            let value = match &self.peek().kind {
                TokenKind::Str(value) => {
                    let value = value.clone();
                    self.bump();
                    value
                }
                _ => return Err(self.unexpected("a quoted value")),
            };
            matchers.push(LabelMatcher::new(label, op, value));
            if self.eat(TokenKind::Comma) {
                // A trailing comma before the closing brace is allowed.
                if self.eat(TokenKind::RBrace) {
                    break;
                }
                continue;
            }
            self.expect(TokenKind::RBrace, "',' or '}'")?;
            break;
        }
        Ok(matchers)
    }

    fn parse_range_spec(&mut self) -> Result<TimeRangeSpec, ParseError> {
        let start = self.parse_time_bound()?;
        self.expect(TokenKind::Colon, "':'")?;
        let end = self.parse_time_bound()?;
        let step = if self.eat(TokenKind::Colon) {
            match &self.peek().kind {
                TokenKind::Duration(nanos) => {
                    let nanos = *nanos;
                    self.bump();
                    Some(nanos)
                }
                _ => return Err(self.unexpected("a step duration")),
            }
        } else {
            None
        };
        self.expect(TokenKind::RBracket, "']'")?;
        Ok(TimeRangeSpec { start, end, step })
    }

    fn parse_time_bound(&mut self) -> Result<TimeBound, ParseError> {
        match &self.peek().kind {
            TokenKind::Now => {
                self.bump();
                if self.eat(TokenKind::Minus) {
                    match &self.peek().kind {
                        TokenKind::Duration(nanos) => {
                            let nanos = *nanos;
                            self.bump();
                            Ok(TimeBound::Offset(nanos))
                        }
                        _ => Err(self.unexpected("a duration offset")),
                    }
                } else {
                    Ok(TimeBound::Now)
                }
            }
            TokenKind::Number(_) => {
                // Absolute bounds reparse the raw text as i64, since the f64
                // token value cannot hold nanosecond timestamps exactly.
                let token = self.bump();
                match token.text.parse::<i64>() {
                    Ok(nanos) => Ok(TimeBound::At(nanos)),
                    Err(_) => Err(ParseError {
                        position: token.offset,
                        expected: "an integer timestamp".to_string(),
                        found: format!("'{}'", token.text),
                    }),
                }
            }
            _ => Err(self.unexpected("a time bound")),
        }
    }

    fn peek(&self) -> &'a Token {
        &self.tokens[self.pos]
    }

    fn bump(&mut self) -> &'a Token {
        let token = &self.tokens[self.pos];
        if !matches!(token.kind, TokenKind::Eof) {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, kind: TokenKind) -> bool {
        if self.peek().kind == kind {
            self.bump();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind, expected: &str) -> Result<&'a Token, ParseError> {
        if self.peek().kind == kind {
            Ok(self.bump())
        } else {
            Err(self.unexpected(expected))
        }
    }

    fn unexpected(&self, expected: &str) -> ParseError {
        let token = self.peek();
        ParseError {
            position: token.offset,
            expected: expected.to_string(),
            found: token.to_string(),
        }
    }
}
