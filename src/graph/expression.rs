//! Decision Expressions
//!
//! A small expression language for decisions and transition conditions:
//! - Optional `#{...}` or `${...}` wrapper
//! - Variable names, string/number/boolean/null literals
//! - Comparisons `== != < <= > >=`, logic `&& || !`, parentheses

use std::cmp::Ordering;
use std::fmt;

use thiserror::Error;

use crate::variables::VariableValue;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExpressionError {
    #[error("empty expression")]
    Empty,

    #[error("unexpected {found} at offset {offset} in '{text}'")]
    Unexpected {
        found: String,
        offset: usize,
        text: String,
    },

    #[error("unterminated string literal in '{0}'")]
    UnterminatedString(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(String),
    Str(String),
    Compare(CompareOp),
    And,
    Or,
    Not,
    LParen,
    RParen,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ident(name) => write!(f, "'{}'", name),
            Self::Number(n) => write!(f, "{}", n),
            Self::Str(s) => write!(f, "\"{}\"", s),
            Self::Compare(op) => write!(f, "{:?}", op),
            Self::And => write!(f, "&&"),
            Self::Or => write!(f, "||"),
            Self::Not => write!(f, "!"),
            Self::LParen => write!(f, "("),
            Self::RParen => write!(f, ")"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(VariableValue),
    Variable(String),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(Box<Expr>, CompareOp, Box<Expr>),
}

/// A parsed expression, kept with its source text.
///
/// # Example
///
/// ```rust
/// use flowrunner::graph::Expression;
/// use flowrunner::variables::VariableValue;
///
/// let expr = Expression::parse("#{amount > 100 && approved}").unwrap();
/// let lookup = |name: &str| match name {
///     "amount" => Some(VariableValue::Long(250)),
///     "approved" => Some(VariableValue::Boolean(true)),
///     _ => None,
/// };
/// assert!(expr.is_true(lookup));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    text: String,
    root: Expr,
}

impl Expression {
    pub fn parse(text: &str) -> Result<Self, ExpressionError> {
        let body = unwrap_delimiters(text.trim());
        if body.trim().is_empty() {
            return Err(ExpressionError::Empty);
        }

        let tokens = tokenize(body, text)?;
        let mut parser = Parser {
            tokens,
            position: 0,
            text,
        };
        let root = parser.parse_or()?;
        if let Some((token, offset)) = parser.tokens.get(parser.position) {
            return Err(ExpressionError::Unexpected {
                found: token.to_string(),
                offset: *offset,
                text: text.to_string(),
            });
        }

        Ok(Self {
            text: text.to_string(),
            root,
        })
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Evaluates against a variable lookup; unknown variables are null.
    pub fn evaluate<F>(&self, lookup: F) -> VariableValue
    where
        F: Fn(&str) -> Option<VariableValue>,
    {
        eval(&self.root, &lookup)
    }

    pub fn is_true<F>(&self, lookup: F) -> bool
    where
        F: Fn(&str) -> Option<VariableValue>,
    {
        truthy(&self.evaluate(lookup))
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

fn unwrap_delimiters(text: &str) -> &str {
    ["#{", "${"]
        .iter()
        .find_map(|open| text.strip_prefix(open).and_then(|rest| rest.strip_suffix('}')))
        .unwrap_or(text)
}

fn tokenize(body: &str, text: &str) -> Result<Vec<(Token, usize)>, ExpressionError> {
    let chars: Vec<(usize, char)> = body.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    let unexpected = |c: char, offset: usize| ExpressionError::Unexpected {
        found: format!("'{}'", c),
        offset,
        text: text.to_string(),
    };

    while i < chars.len() {
        let (offset, c) = chars[i];
        let next = chars.get(i + 1).map(|(_, c)| *c);

        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push((Token::LParen, offset));
                i += 1;
            }
            ')' => {
                tokens.push((Token::RParen, offset));
                i += 1;
            }
            '&' if next == Some('&') => {
                tokens.push((Token::And, offset));
                i += 2;
            }
            '|' if next == Some('|') => {
                tokens.push((Token::Or, offset));
                i += 2;
            }
            '=' if next == Some('=') => {
                tokens.push((Token::Compare(CompareOp::Eq), offset));
                i += 2;
            }
            '!' if next == Some('=') => {
                tokens.push((Token::Compare(CompareOp::Ne), offset));
                i += 2;
            }
            '!' => {
                tokens.push((Token::Not, offset));
                i += 1;
            }
            '<' | '>' => {
                let op = match (c, next == Some('=')) {
                    ('<', true) => CompareOp::Le,
                    ('<', false) => CompareOp::Lt,
                    (_, true) => CompareOp::Ge,
                    (_, false) => CompareOp::Gt,
                };
                tokens.push((Token::Compare(op), offset));
                i += if next == Some('=') { 2 } else { 1 };
            }
            '\'' | '"' => {
                let quote = c;
                let mut literal = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        Some((_, ch)) if *ch == quote => break,
                        Some((_, ch)) => literal.push(*ch),
                        None => return Err(ExpressionError::UnterminatedString(text.to_string())),
                    }
                    i += 1;
                }
                tokens.push((Token::Str(literal), offset));
                i += 1;
            }
            c if c.is_ascii_digit() || (c == '-' && next.map_or(false, |n| n.is_ascii_digit())) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].1.is_ascii_digit() || chars[i].1 == '.') {
                    i += 1;
                }
                let number: String = chars[start..i].iter().map(|(_, ch)| *ch).collect();
                tokens.push((Token::Number(number), offset));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].1.is_alphanumeric() || chars[i].1 == '_' || chars[i].1 == '.')
                {
                    i += 1;
                }
                let ident: String = chars[start..i].iter().map(|(_, ch)| *ch).collect();
                tokens.push((Token::Ident(ident), offset));
            }
            other => return Err(unexpected(other, offset)),
        }
    }

    Ok(tokens)
}

struct Parser<'a> {
    tokens: Vec<(Token, usize)>,
    position: usize,
    text: &'a str,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position).map(|(token, _)| token)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.position).map(|(token, _)| token.clone());
        self.position += 1;
        token
    }

    fn unexpected(&self) -> ExpressionError {
        match self.tokens.get(self.position) {
            Some((token, offset)) => ExpressionError::Unexpected {
                found: token.to_string(),
                offset: *offset,
                text: self.text.to_string(),
            },
            None => ExpressionError::Unexpected {
                found: "end of expression".to_string(),
                offset: self.text.len(),
                text: self.text.to_string(),
            },
        }
    }

    fn parse_or(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.advance();
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_unary()?;
        while self.peek() == Some(&Token::And) {
            self.advance();
            let right = self.parse_unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ExpressionError> {
        if self.peek() == Some(&Token::Not) {
            self.advance();
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, ExpressionError> {
        let left = self.parse_primary()?;
        if let Some(Token::Compare(op)) = self.peek() {
            let op = *op;
            self.advance();
            let right = self.parse_primary()?;
            return Ok(Expr::Compare(Box::new(left), op, Box::new(right)));
        }
        Ok(left)
    }

    fn parse_primary(&mut self) -> Result<Expr, ExpressionError> {
        let expr = match self.peek() {
            Some(Token::LParen) => {
                self.advance();
                let inner = self.parse_or()?;
                if self.peek() != Some(&Token::RParen) {
                    return Err(self.unexpected());
                }
                inner
            }
            Some(Token::Number(text)) => {
                let value = if text.contains('.') {
                    text.parse().map(VariableValue::Double).ok()
                } else {
                    text.parse().map(VariableValue::Long).ok()
                };
                match value {
                    Some(value) => Expr::Literal(value),
                    None => return Err(self.unexpected()),
                }
            }
            Some(Token::Str(s)) => Expr::Literal(VariableValue::String(s.clone())),
            Some(Token::Ident(name)) => match name.as_str() {
                "true" => Expr::Literal(VariableValue::Boolean(true)),
                "false" => Expr::Literal(VariableValue::Boolean(false)),
                "null" => Expr::Literal(VariableValue::Null),
                _ => Expr::Variable(name.clone()),
            },
            _ => return Err(self.unexpected()),
        };
        self.advance();
        Ok(expr)
    }
}

fn eval<F>(expr: &Expr, lookup: &F) -> VariableValue
where
    F: Fn(&str) -> Option<VariableValue>,
{
    match expr {
        Expr::Literal(value) => value.clone(),
        Expr::Variable(name) => lookup(name).unwrap_or(VariableValue::Null),
        Expr::Not(inner) => VariableValue::Boolean(!truthy(&eval(inner, lookup))),
        Expr::And(left, right) => {
            VariableValue::Boolean(truthy(&eval(left, lookup)) && truthy(&eval(right, lookup)))
        }
        Expr::Or(left, right) => {
            VariableValue::Boolean(truthy(&eval(left, lookup)) || truthy(&eval(right, lookup)))
        }
        Expr::Compare(left, op, right) => {
            let left = eval(left, lookup);
            let right = eval(right, lookup);
            VariableValue::Boolean(compare(&left, *op, &right))
        }
    }
}

fn compare(left: &VariableValue, op: CompareOp, right: &VariableValue) -> bool {
    let ordering = match (left.as_double(), right.as_double()) {
        (Some(a), Some(b)) => a.partial_cmp(&b),
        _ => match (left, right) {
            (VariableValue::Null, VariableValue::Null) => Some(Ordering::Equal),
            (VariableValue::Null, _) | (_, VariableValue::Null) => None,
            _ => Some(left.to_string().cmp(&right.to_string())),
        },
    };

    match (op, ordering) {
        (CompareOp::Eq, ordering) => ordering == Some(Ordering::Equal),
        (CompareOp::Ne, ordering) => ordering != Some(Ordering::Equal),
        (_, None) => false,
        (CompareOp::Lt, Some(o)) => o == Ordering::Less,
        (CompareOp::Le, Some(o)) => o != Ordering::Greater,
        (CompareOp::Gt, Some(o)) => o == Ordering::Greater,
        (CompareOp::Ge, Some(o)) => o != Ordering::Less,
    }
}

/// Truth value of an expression result.
pub fn truthy(value: &VariableValue) -> bool {
    match value {
        VariableValue::Null => false,
        VariableValue::Boolean(b) => *b,
        VariableValue::Long(n) => *n != 0,
        VariableValue::Double(n) => *n != 0.0,
        VariableValue::String(s) => !s.is_empty() && s != "false",
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(name: &str) -> Option<VariableValue> {
        match name {
            "amount" => Some(VariableValue::Long(150)),
            "rate" => Some(VariableValue::Double(0.5)),
            "status" => Some(VariableValue::from("approved")),
            "flag" => Some(VariableValue::Boolean(false)),
            _ => None,
        }
    }

    #[test]
    fn test_variable_reference() {
        let expr = Expression::parse("#{status}").unwrap();
        assert_eq!(expr.evaluate(vars), VariableValue::from("approved"));
        assert_eq!(expr.text(), "#{status}");
    }

    #[test]
    fn test_comparisons() {
        assert!(Expression::parse("amount > 100").unwrap().is_true(vars));
        assert!(Expression::parse("amount <= 150").unwrap().is_true(vars));
        assert!(!Expression::parse("rate >= 1").unwrap().is_true(vars));
        assert!(Expression::parse("status == 'approved'").unwrap().is_true(vars));
        assert!(Expression::parse("status != \"rejected\"").unwrap().is_true(vars));
        assert!(Expression::parse("amount == -5 || amount == 150").unwrap().is_true(vars));
    }

    #[test]
    fn test_logic_and_grouping() {
        assert!(Expression::parse("${!flag && (amount > 1 || missing)}")
            .unwrap()
            .is_true(vars));
        assert!(!Expression::parse("flag || missing").unwrap().is_true(vars));
        assert!(Expression::parse("missing == null").unwrap().is_true(vars));
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(Expression::parse("#{ }"), Err(ExpressionError::Empty));
        assert!(matches!(
            Expression::parse("amount >"),
            Err(ExpressionError::Unexpected { .. })
        ));
        assert!(matches!(
            Expression::parse("status == 'open"),
            Err(ExpressionError::UnterminatedString(_))
        ));
        assert!(matches!(
            Expression::parse("a b"),
            Err(ExpressionError::Unexpected { .. })
        ));
        assert!(Expression::parse("amount # 3").is_err());
    }
}
