#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Comparator {
    #[serde(rename = "<")]
    Less,
    #[serde(rename = "<=")]
    LessOrEqual,
    #[serde(rename = "=")]
    Equal,
    #[serde(rename = ">=")]
    GreaterOrEqual,
    #[serde(rename = ">")]
    Greater,
    #[serde(rename = "!=")]
    NotEqual,
}

impl Comparator {
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Less => "<",
            Self::LessOrEqual => "<=",
            Self::Equal => "=",
            Self::GreaterOrEqual => ">=",
            Self::Greater => ">",
            Self::NotEqual => "!=",
        }
    }

    pub fn holds(self, value: i64, threshold: i64) -> bool {
        match self {
            Self::Less => value < threshold,
            Self::LessOrEqual => value <= threshold,
            Self::Equal => value == threshold,
            Self::GreaterOrEqual => value >= threshold,
            Self::Greater => value > threshold,
            Self::NotEqual => value != threshold,
        }
    }
}

impl FromStr for Comparator {
    type Err = PredicateParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "<" => Ok(Self::Less),
            "<=" => Ok(Self::LessOrEqual),
            "=" | "==" => Ok(Self::Equal),
            ">=" => Ok(Self::GreaterOrEqual),
            ">" => Ok(Self::Greater),
            "!=" => Ok(Self::NotEqual),
            other => Err(PredicateParseError::UnknownComparator(other.to_string())),
        }
    }
}

/// The index is missing or carries an impossible `freq` value.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum IndexConsistencyError {
    #[error("vertex has no freq property")]
    MissingFrequency,
    #[error("vertex has negative freq {0}")]
    NegativeFrequency(i64),
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum PredicateParseError {
    #[error("frequency filter must not be empty")]
    Empty,
    #[error("unknown comparator '{0}'")]
    UnknownComparator(String),
    #[error("expected a number after '{0}'")]
    MissingThreshold(String),
    #[error("invalid number '{0}'")]
    InvalidNumber(String),
    #[error("unexpected token '{0}'")]
    UnexpectedToken(String),
    #[error("at most two comparisons are allowed")]
    TooManyClauses,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrequencyClause {
    pub comparator: Comparator,
    pub threshold: i64,
}

impl FrequencyClause {
    pub fn holds(&self, freq: i64) -> bool {
        self.comparator.holds(freq, self.threshold)
    }
}

/// Conjunction of one or two comparisons against a vertex's `freq`.
///
/// Disjunctive ranges are not expressible by a single predicate; run one query
/// per range and union the matches.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrequencyPredicate {
    first: FrequencyClause,
    second: Option<FrequencyClause>,
}

impl FrequencyPredicate {
    pub fn new(comparator: Comparator, threshold: i64) -> Self {
        Self {
            first: FrequencyClause {
                comparator,
                threshold,
            },
            second: None,
        }
    }

    /// Adds (or replaces) the second clause.
    pub fn and(mut self, comparator: Comparator, threshold: i64) -> Self {
        self.second = Some(FrequencyClause {
            comparator,
            threshold,
        });
        self
    }

    /// Inclusive `low..=high` range.
    pub fn range(low: i64, high: i64) -> Self {
        Self::new(Comparator::GreaterOrEqual, low).and(Comparator::LessOrEqual, high)
    }

    pub fn first(&self) -> FrequencyClause {
        self.first
    }

    pub fn second(&self) -> Option<FrequencyClause> {
        self.second
    }

    pub fn evaluate(&self, freq: Option<i64>) -> Result<bool, IndexConsistencyError> {
        let freq = freq.ok_or(IndexConsistencyError::MissingFrequency)?;
        if freq < 0 {
            return Err(IndexConsistencyError::NegativeFrequency(freq));
        }
        if !self.first.holds(freq) {
            return Ok(false);
        }
        Ok(self.second.is_none_or(|clause| clause.holds(freq)))
    }
}

impl fmt::Display for FrequencyPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.first.comparator.symbol(), self.first.threshold)?;
        if let Some(second) = self.second {
            write!(f, " {} {}", second.comparator.symbol(), second.threshold)?;
        }
        Ok(())
    }
}

/// Accepts `> 5`, `freq >= 5 AND freq <= 20`, `>=5 <=20` and the range
/// shorthand `= 2-5`.
impl FromStr for FrequencyPredicate {
    type Err = PredicateParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let mut scanner = Scanner::new(value);
        let mut clauses = Vec::new();

        while let Some(token) = scanner.next_token()? {
            match token {
                Token::Word(word)
                    if word.eq_ignore_ascii_case("freq") || word.eq_ignore_ascii_case("and") => {}
                Token::Word(word) => return Err(PredicateParseError::UnexpectedToken(word)),
                Token::Number(raw) => return Err(PredicateParseError::UnexpectedToken(raw)),
                Token::Comparator(symbol) => {
                    let comparator = symbol.parse::<Comparator>()?;
                    let low = scanner.number_after(&symbol)?;
                    if comparator == Comparator::Equal && scanner.eat_range_dash() {
                        let high = scanner.number_after("-")?;
                        clauses.push(FrequencyClause {
                            comparator: Comparator::GreaterOrEqual,
                            threshold: low,
                        });
                        clauses.push(FrequencyClause {
                            comparator: Comparator::LessOrEqual,
                            threshold: high,
                        });
                    } else {
                        clauses.push(FrequencyClause {
                            comparator,
                            threshold: low,
                        });
                    }
                }
            }
            if clauses.len() > 2 {
                return Err(PredicateParseError::TooManyClauses);
            }
        }

        let mut clauses = clauses.into_iter();
        let Some(first) = clauses.next() else {
            return Err(PredicateParseError::Empty);
        };
        Ok(Self {
            first,
            second: clauses.next(),
        })
    }
}

enum Token {
    Word(String),
    Comparator(String),
    Number(String),
}

struct Scanner<'a> {
    rest: &'a str,
}

impl<'a> Scanner<'a> {
    fn new(input: &'a str) -> Self {
        Self { rest: input }
    }

    fn skip_whitespace(&mut self) {
        self.rest = self.rest.trim_start();
    }

    fn take_while(&mut self, pred: impl Fn(char) -> bool) -> &'a str {
        let end = self
            .rest
            .char_indices()
            .find(|(_, c)| !pred(*c))
            .map(|(i, _)| i)
            .unwrap_or(self.rest.len());
        let (head, tail) = self.rest.split_at(end);
        self.rest = tail;
        head
    }

    fn next_token(&mut self) -> Result<Option<Token>, PredicateParseError> {
        self.skip_whitespace();
        let Some(first) = self.rest.chars().next() else {
            return Ok(None);
        };
        if first.is_ascii_alphabetic() {
            return Ok(Some(Token::Word(
                self.take_while(|c| c.is_ascii_alphabetic()).to_string(),
            )));
        }
        if first == '&' {
            let amps = self.take_while(|c| c == '&');
            if amps == "&&" {
                return Ok(Some(Token::Word("and".to_string())));
            }
            return Err(PredicateParseError::UnexpectedToken(amps.to_string()));
        }
        if matches!(first, '<' | '>' | '=' | '!') {
            return Ok(Some(Token::Comparator(
                self.take_while(|c| matches!(c, '<' | '>' | '=' | '!'))
                    .to_string(),
            )));
        }
        if first.is_ascii_digit() || first == '-' {
            return Ok(Some(Token::Number(self.take_number().to_string())));
        }
        Err(PredicateParseError::UnexpectedToken(first.to_string()))
    }

    fn take_number(&mut self) -> &'a str {
        let sign = if self.rest.starts_with('-') { 1 } else { 0 };
        let digits = self.rest[sign..]
            .char_indices()
            .find(|(_, c)| !c.is_ascii_digit())
            .map(|(i, _)| i)
            .unwrap_or(self.rest.len() - sign);
        let (head, tail) = self.rest.split_at(sign + digits);
        self.rest = tail;
        head
    }

    fn number_after(&mut self, after: &str) -> Result<i64, PredicateParseError> {
        self.skip_whitespace();
        let raw = self.take_number();
        if raw.is_empty() || raw == "-" {
            return Err(PredicateParseError::MissingThreshold(after.to_string()));
        }
        raw.parse::<i64>()
            .map_err(|_| PredicateParseError::InvalidNumber(raw.to_string()))
    }

    /// Consumes the `-` of a `low-high` range when it directly follows a number.
    fn eat_range_dash(&mut self) -> bool {
        let trimmed = self.rest.trim_start();
        let Some(after_dash) = trimmed.strip_prefix('-') else {
            return false;
        };
        if !after_dash.trim_start().starts_with(|c: char| c.is_ascii_digit()) {
            return false;
        }
        self.rest = after_dash;
        true
    }
}
