//! Inclusion predicates over feature flags.
//!
//! A predicate is written either in structured form
//!
//! ```json
//! {"all": [{"flag": "database"}, {"not": {"flag": "swagger"}}]}
//! ```
//!
//! or as a text expression such as `database AND NOT swagger`. The text
//! grammar accepts `AND`/`&&`, `OR`/`||`, `NOT`/`!` and parentheses, with the
//! usual precedence (NOT binds tightest, then AND, then OR). The bare word
//! `always` is reserved and matches every flag set.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::errors::TemplateError;

/// A boolean expression over flag membership.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", try_from = "RawPredicate")]
pub enum FlagPredicate {
    /// Always included.
    #[default]
    Always,
    /// Included when the flag is enabled.
    Flag(String),
    /// Included when every sub-predicate holds (true when empty).
    All(Vec<FlagPredicate>),
    /// Included when any sub-predicate holds (false when empty).
    Any(Vec<FlagPredicate>),
    /// Negation.
    Not(Box<FlagPredicate>),
}

impl FlagPredicate {
    /// Predicate on a single flag.
    #[must_use]
    pub fn flag(name: impl Into<String>) -> Self {
        Self::Flag(name.into())
    }

    /// Negates a predicate.
    #[must_use]
    pub fn negate(inner: Self) -> Self {
        Self::Not(Box::new(inner))
    }

    /// Parses a text expression.
    pub fn parse(expression: &str) -> Result<Self, TemplateError> {
        let tokens = tokenize(expression)?;
        let mut parser = Parser {
            tokens: &tokens,
            pos: 0,
            expression,
        };
        let predicate = parser.parse_or()?;
        if parser.pos != tokens.len() {
            return Err(parser.error(format!("unexpected token '{}'", tokens[parser.pos])));
        }
        Ok(predicate)
    }

    /// Evaluates against an enabled-flag set.
    #[must_use]
    pub fn evaluate(&self, flags: &BTreeSet<String>) -> bool {
        match self {
            Self::Always => true,
            Self::Flag(name) => flags.contains(name),
            Self::All(items) => items.iter().all(|p| p.evaluate(flags)),
            Self::Any(items) => items.iter().any(|p| p.evaluate(flags)),
            Self::Not(inner) => !inner.evaluate(flags),
        }
    }

    /// Adds every flag the predicate mentions to `out`.
    pub fn collect_flags(&self, out: &mut BTreeSet<String>) {
        match self {
            Self::Always => {}
            Self::Flag(name) => {
                out.insert(name.clone());
            }
            Self::All(items) | Self::Any(items) => {
                for item in items {
                    item.collect_flags(out);
                }
            }
            Self::Not(inner) => inner.collect_flags(out),
        }
    }

    /// Flags the predicate mentions.
    #[must_use]
    pub fn referenced_flags(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_flags(&mut out);
        out
    }
}

impl fmt::Display for FlagPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn join(f: &mut fmt::Formatter<'_>, items: &[FlagPredicate], op: &str) -> fmt::Result {
            write!(f, "(")?;
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    write!(f, " {op} ")?;
                }
                write!(f, "{item}")?;
            }
            write!(f, ")")
        }

        match self {
            Self::Always => write!(f, "always"),
            Self::Flag(name) => write!(f, "{name}"),
            Self::All(items) => join(f, items, "AND"),
            Self::Any(items) => join(f, items, "OR"),
            Self::Not(inner) => write!(f, "NOT {inner}"),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawPredicate {
    Text(String),
    Structured(StructuredPredicate),
}

#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
enum StructuredPredicate {
    Flag(String),
    All(Vec<FlagPredicate>),
    Any(Vec<FlagPredicate>),
    Not(Box<FlagPredicate>),
}

impl TryFrom<RawPredicate> for FlagPredicate {
    type Error = TemplateError;

    fn try_from(raw: RawPredicate) -> Result<Self, Self::Error> {
        match raw {
            RawPredicate::Text(text) => Self::parse(&text),
            RawPredicate::Structured(StructuredPredicate::Flag(name)) => Ok(Self::Flag(name)),
            RawPredicate::Structured(StructuredPredicate::All(items)) => Ok(Self::All(items)),
            RawPredicate::Structured(StructuredPredicate::Any(items)) => Ok(Self::Any(items)),
            RawPredicate::Structured(StructuredPredicate::Not(inner)) => Ok(Self::Not(inner)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    And,
    Or,
    Not,
    Open,
    Close,
    Ident(String),
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::And => write!(f, "AND"),
            Self::Or => write!(f, "OR"),
            Self::Not => write!(f, "NOT"),
            Self::Open => write!(f, "("),
            Self::Close => write!(f, ")"),
            Self::Ident(name) => write!(f, "{name}"),
        }
    }
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_'
}

fn tokenize(expression: &str) -> Result<Vec<Token>, TemplateError> {
    let mut tokens = Vec::new();
    let mut chars = expression.char_indices().peekable();

    while let Some(&(start, c)) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::Open);
            }
            ')' => {
                chars.next();
                tokens.push(Token::Close);
            }
            '!' => {
                chars.next();
                tokens.push(Token::Not);
            }
            '&' | '|' => {
                chars.next();
                match chars.next() {
                    Some((_, next)) if next == c => {
                        tokens.push(if c == '&' { Token::And } else { Token::Or });
                    }
                    _ => {
                        return Err(TemplateError::InvalidPredicate {
                            expression: expression.to_string(),
                            reason: format!("expected '{c}{c}' at offset {start}"),
                        });
                    }
                }
            }
            c if is_ident_char(c) => {
                let mut end = start;
                while let Some(&(i, c)) = chars.peek() {
                    if !is_ident_char(c) {
                        break;
                    }
                    end = i + c.len_utf8();
                    chars.next();
                }
                let word = &expression[start..end];
                tokens.push(match word {
                    "AND" => Token::And,
                    "OR" => Token::Or,
                    "NOT" => Token::Not,
                    _ => Token::Ident(word.to_string()),
                });
            }
            other => {
                return Err(TemplateError::InvalidPredicate {
                    expression: expression.to_string(),
                    reason: format!("unexpected character '{other}' at offset {start}"),
                });
            }
        }
    }

    Ok(tokens)
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    expression: &'a str,
}

impl Parser<'_> {
    fn error(&self, reason: impl Into<String>) -> TemplateError {
        TemplateError::InvalidPredicate {
            expression: self.expression.to_string(),
            reason: reason.into(),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn parse_or(&mut self) -> Result<FlagPredicate, TemplateError> {
        let mut items = vec![self.parse_and()?];
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            items.push(self.parse_and()?);
        }
        Ok(if items.len() == 1 {
            items.remove(0)
        } else {
            FlagPredicate::Any(items)
        })
    }

    fn parse_and(&mut self) -> Result<FlagPredicate, TemplateError> {
        let mut items = vec![self.parse_unary()?];
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            items.push(self.parse_unary()?);
        }
        Ok(if items.len() == 1 {
            items.remove(0)
        } else {
            FlagPredicate::All(items)
        })
    }

    fn parse_unary(&mut self) -> Result<FlagPredicate, TemplateError> {
        let token = self
            .peek()
            .cloned()
            .ok_or_else(|| self.error("unexpected end of expression"))?;
        self.pos += 1;

        match token {
            Token::Not => Ok(FlagPredicate::negate(self.parse_unary()?)),
            Token::Open => {
                let inner = self.parse_or()?;
                if self.peek() != Some(&Token::Close) {
                    return Err(self.error("missing ')'"));
                }
                self.pos += 1;
                Ok(inner)
            }
            Token::Ident(name) if name == "always" => Ok(FlagPredicate::Always),
            Token::Ident(name) => Ok(FlagPredicate::Flag(name)),
            other => Err(self.error(format!("unexpected token '{other}'"))),
        }
    }
}
