use std::fmt;
use std::iter::Peekable;
use std::str::Chars;

use thiserror::Error;

use crate::storage::series::NANOS_PER_SECOND;

#[derive(Debug, Error)]
#[error("{reason} at offset {position}")]
pub struct LexError {
    /// Character offset into the query text where the bad token starts
    pub position: usize,
    pub reason: LexErrorKind,
}

#[derive(Debug, Error, PartialEq)]
pub enum LexErrorKind {
    #[error("Unexpected character: {0}")]
    UnexpectedChar(char),
    #[error("Invalid number format: {0}")]
    InvalidNumber(String),
    #[error("Invalid duration unit: {0}")]
    InvalidDuration(String),
    #[error("Unterminated string literal")]
    UnterminatedString,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    // Literals
    Ident,
    Number(f64),
    Str(String),
    /// Duration literal, converted to nanoseconds
    Duration(i64),

    // Keywords
    And,
    Or,
    By,
    Without,
    Now,

    // Operators
    Eq,         // =
    EqEq,       // ==
    Neq,        // !=
    Gt,         // >
    Lt,         // <
    Gte,        // >=
    Lte,        // <=
    ReMatch,    // =~
    ReNotMatch, // !~
    Plus,       // +
    Minus,      // -
    Star,       // *
    Slash,      // /
    Percent,    // %

    // Punctuation
    Comma,    // ,
    Colon,    // :
    LParen,   // (
    RParen,   // )
    LBrace,   // {
    RBrace,   // }
    LBracket, // [
    RBracket, // ]

    // Special
    Eof,
}

/// One lexed token: its kind, the raw text it was read from, and the
/// character offset where it starts.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    pub offset: usize,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            TokenKind::Eof => write!(f, "end of input"),
            _ => write!(f, "'{}'", self.text),
        }
    }
}

pub struct Lexer<'a> {
    input: Peekable<Chars<'a>>,
    current_pos: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Self {
        Self {
            input: input.chars().peekable(),
            current_pos: 0,
        }
    }

    /// Tokenizes the whole input. Re-tokenizing the same text always yields
    /// the identical sequence; the final token is always `Eof`.
    pub fn tokenize(&mut self) -> Result<Vec<Token>, LexError> {
        let mut tokens = Vec::new();

        while let Some(token) = self.next_token()? {
            tokens.push(token);
        }

        tokens.push(Token {
            kind: TokenKind::Eof,
            text: String::new(),
            offset: self.current_pos,
        });
        Ok(tokens)
    }

    fn next_token(&mut self) -> Result<Option<Token>, LexError> {
        self.skip_whitespace_and_comments();

        let start = self.current_pos;
        let c = match self.input.peek() {
            Some(&c) => c,
            None => return Ok(None),
        };

        let (kind, text) = match c {
            // Longest valid token wins: two-character operators are checked
            // before their one-character prefixes.
            '=' => {
                self.bump();
                match self.input.peek() {
                    Some('=') => {
                        self.bump();
                        (TokenKind::EqEq, "==".to_string())
                    }
                    Some('~') => {
                        self.bump();
                        (TokenKind::ReMatch, "=~".to_string())
                    }
                    _ => (TokenKind::Eq, "=".to_string()),
                }
            }
            '!' => {
                self.bump();
                match self.input.peek() {
                    Some('=') => {
                        self.bump();
                        (TokenKind::Neq, "!=".to_string())
                    }
                    Some('~') => {
                        self.bump();
                        (TokenKind::ReNotMatch, "!~".to_string())
                    }
                    _ => {
                        return Err(LexError {
                            position: start,
                            reason: LexErrorKind::UnexpectedChar('!'),
                        })
                    }
                }
            }
            '>' => {
                self.bump();
                if let Some('=') = self.input.peek() {
                    self.bump();
                    (TokenKind::Gte, ">=".to_string())
                } else {
                    (TokenKind::Gt, ">".to_string())
                }
            }
            '<' => {
                self.bump();
                if let Some('=') = self.input.peek() {
                    self.bump();
                    (TokenKind::Lte, "<=".to_string())
                } else {
                    (TokenKind::Lt, "<".to_string())
                }
            }
            '+' => {
                self.bump();
                (TokenKind::Plus, "+".to_string())
            }
            '-' => {
                self.bump();
                (TokenKind::Minus, "-".to_string())
            }
            '*' => {
                self.bump();
                (TokenKind::Star, "*".to_string())
            }
            '/' => {
                self.bump();
                (TokenKind::Slash, "/".to_string())
            }
            '%' => {
                self.bump();
                (TokenKind::Percent, "%".to_string())
            }
            ',' => {
                self.bump();
                (TokenKind::Comma, ",".to_string())
            }
            ':' => {
                self.bump();
                (TokenKind::Colon, ":".to_string())
            }
            '(' => {
                self.bump();
                (TokenKind::LParen, "(".to_string())
            }
            ')' => {
                self.bump();
                (TokenKind::RParen, ")".to_string())
            }
            '{' => {
                self.bump();
                (TokenKind::LBrace, "{".to_string())
            }
            '}' => {
                self.bump();
                (TokenKind::RBrace, "}".to_string())
            }
            '[' => {
                self.bump();
                (TokenKind::LBracket, "[".to_string())
            }
            ']' => {
                self.bump();
                (TokenKind::RBracket, "]".to_string())
            }

            // String literals
            '"' | '\'' => self.scan_string(start)?,

            // Numbers and duration literals
            c if c.is_ascii_digit() => self.scan_number(start)?,

            // Identifiers and keywords
            c if c.is_ascii_alphabetic() || c == '_' => self.scan_identifier(),

            c => {
                return Err(LexError {
                    position: start,
                    reason: LexErrorKind::UnexpectedChar(c),
                })
            }
        };

        Ok(Some(Token {
            kind,
            text,
            offset: start,
        }))
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.input.next();
        if c.is_some() {
            self.current_pos += 1;
        }
        c
    }

    fn skip_whitespace_and_comments(&mut self) {
        while let Some(&c) = self.input.peek() {
            if c.is_whitespace() {
                self.bump();
            } else if c == '#' {
                // Comment runs to end of line.
                while let Some(&c) = self.input.peek() {
                    if c == '\n' {
                        break;
                    }
                    self.bump();
                }
            } else {
                break;
            }
        }
    }

    fn scan_string(&mut self, start: usize) -> Result<(TokenKind, String), LexError> {
        let quote = match self.bump() {
            Some(q) => q,
            None => {
                return Err(LexError {
                    position: start,
                    reason: LexErrorKind::UnterminatedString,
                })
            }
        };
        let mut value = String::new();

        while let Some(&c) = self.input.peek() {
            if c == quote {
                self.bump();
                let text = format!("{}{}{}", quote, value, quote);
                return Ok((TokenKind::Str(value), text));
            }
            self.bump();
            value.push(c);
        }

        Err(LexError {
            position: start,
            reason: LexErrorKind::UnterminatedString,
        })
    }

    fn scan_number(&mut self, start: usize) -> Result<(TokenKind, String), LexError> {
        let mut number = String::new();
        let mut has_decimal = false;

        while let Some(&c) = self.input.peek() {
            match c {
                '0'..='9' => {
                    self.bump();
                    number.push(c);
                }
                '.' if !has_decimal => {
                    has_decimal = true;
                    self.bump();
                    number.push(c);
                }
                _ => break,
            }
        }

        // A trailing letter run makes this a duration literal.
        let mut unit = String::new();
        while let Some(&c) = self.input.peek() {
            if c.is_ascii_alphabetic() {
                self.bump();
                unit.push(c);
            } else {
                break;
            }
        }

        let value = number.parse::<f64>().map_err(|_| LexError {
            position: start,
            reason: LexErrorKind::InvalidNumber(number.clone()),
        })?;

        if unit.is_empty() {
            return Ok((TokenKind::Number(value), number));
        }

        let per_unit = match unit.as_str() {
            "ns" => 1,
            "us" => 1_000,
            "ms" => 1_000_000,
            "s" => NANOS_PER_SECOND,
            "m" => 60 * NANOS_PER_SECOND,
            "h" => 3_600 * NANOS_PER_SECOND,
            "d" => 86_400 * NANOS_PER_SECOND,
            "w" => 604_800 * NANOS_PER_SECOND,
            _ => {
                return Err(LexError {
                    position: start,
                    reason: LexErrorKind::InvalidDuration(format!("{}{}", number, unit)),
                })
            }
        };

        let nanos = (value * per_unit as f64) as i64;
        Ok((TokenKind::Duration(nanos), format!("{}{}", number, unit)))
    }

    fn scan_identifier(&mut self) -> (TokenKind, String) {
        let mut identifier = String::new();

        while let Some(&c) = self.input.peek() {
            if c.is_ascii_alphanumeric() || c == '_' {
                self.bump();
                identifier.push(c);
            } else {
                break;
            }
        }

        let kind = match identifier.as_str() {
            "and" => TokenKind::And,
            "or" => TokenKind::Or,
            "by" => TokenKind::By,
            "without" => TokenKind::Without,
            "now" => TokenKind::Now,
            _ => TokenKind::Ident,
        };

        (kind, identifier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(input: &str) -> Vec<TokenKind> {
        let mut lexer = Lexer::new(input);
        lexer
            .tokenize()
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn test_selector_tokens() {
        assert_eq!(
            kinds(r#"cpu_usage{host="a",region!="us"}"#),
            vec![
                TokenKind::Ident,
                TokenKind::LBrace,
                TokenKind::Ident,
                TokenKind::Eq,
                TokenKind::Str("a".to_string()),
                TokenKind::Comma,
                TokenKind::Ident,
                TokenKind::Neq,
                TokenKind::Str("us".to_string()),
                TokenKind::RBrace,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_maximal_munch_operators() {
        assert_eq!(
            kinds(">= <= == != =~ !~ > < ="),
            vec![
                TokenKind::Gte,
                TokenKind::Lte,
                TokenKind::EqEq,
                TokenKind::Neq,
                TokenKind::ReMatch,
                TokenKind::ReNotMatch,
                TokenKind::Gt,
                TokenKind::Lt,
                TokenKind::Eq,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_duration_literals() {
        assert_eq!(
            kinds("5m 1.5h 30s 10ns 2w"),
            vec![
                TokenKind::Duration(300 * NANOS_PER_SECOND),
                TokenKind::Duration(5_400 * NANOS_PER_SECOND),
                TokenKind::Duration(30 * NANOS_PER_SECOND),
                TokenKind::Duration(10),
                TokenKind::Duration(1_209_600 * NANOS_PER_SECOND),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_invalid_duration_unit() {
        let mut lexer = Lexer::new("rate_limit + 5x");
        let err = lexer.tokenize().unwrap_err();
        assert_eq!(err.position, 13);
        assert_eq!(err.reason, LexErrorKind::InvalidDuration("5x".to_string()));
    }

    #[test]
    fn test_unterminated_string() {
        let mut lexer = Lexer::new(r#"cpu{host="a"#);
        let err = lexer.tokenize().unwrap_err();
        assert_eq!(err.position, 9);
        assert_eq!(err.reason, LexErrorKind::UnterminatedString);
    }

    #[test]
    fn test_whitespace_and_comments_discarded() {
        let input = "sum(cpu) # trailing comment\n  # full-line comment\n + 1";
        assert_eq!(
            kinds(input),
            vec![
                TokenKind::Ident,
                TokenKind::LParen,
                TokenKind::Ident,
                TokenKind::RParen,
                TokenKind::Plus,
                TokenKind::Number(1.0),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_range_suffix_tokens() {
        assert_eq!(
            kinds("[now - 1h : now : 30s]"),
            vec![
                TokenKind::LBracket,
                TokenKind::Now,
                TokenKind::Minus,
                TokenKind::Duration(3_600 * NANOS_PER_SECOND),
                TokenKind::Colon,
                TokenKind::Now,
                TokenKind::Colon,
                TokenKind::Duration(30 * NANOS_PER_SECOND),
                TokenKind::RBracket,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_offsets_and_raw_text() {
        let mut lexer = Lexer::new(r#"sum(cpu) by (host)"#);
        let tokens = lexer.tokenize().unwrap();
        assert_eq!(tokens[0].text, "sum");
        assert_eq!(tokens[0].offset, 0);
        assert_eq!(tokens[2].text, "cpu");
        assert_eq!(tokens[2].offset, 4);
        assert_eq!(tokens[4].kind, TokenKind::By);
        assert_eq!(tokens[4].offset, 9);
    }

    #[test]
    fn test_offsets_count_characters() {
        // 'é' is two bytes but one character; offsets past it stay in
        // character units.
        let mut lexer = Lexer::new(r#"cpu{host="héllo"} @"#);
        let err = lexer.tokenize().unwrap_err();
        assert_eq!(err.position, 18);
        assert_eq!(err.reason, LexErrorKind::UnexpectedChar('@'));
    }

    #[test]
    fn test_relex_is_deterministic() {
        let input = r#"topk(3, rate(requests{path=~"/api/.*"})) by (host) [now-1h:now:60s]"#;
        let first = Lexer::new(input).tokenize().unwrap();
        let second = Lexer::new(input).tokenize().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_unexpected_characters() {
        let mut lexer = Lexer::new("cpu @ 5");
        let err = lexer.tokenize().unwrap_err();
        assert_eq!(err.position, 4);
        assert_eq!(err.reason, LexErrorKind::UnexpectedChar('@'));

        let mut lexer = Lexer::new("1.2.3");
        let err = lexer.tokenize().unwrap_err();
        assert_eq!(err.reason, LexErrorKind::UnexpectedChar('.'));
    }

    #[test]
    fn test_keywords_are_case_sensitive() {
        // Uppercase forms are plain identifiers, not keywords.
        assert_eq!(
            kinds("AND and"),
            vec![TokenKind::Ident, TokenKind::And, TokenKind::Eof]
        );
    }
}
