//! A small FHIRPath subset for action conditions.
//!
//! Supported: `true`, `false`, `%var.exists()`, `%var.empty()`,
//! `%var.count() <op> N`, `not`, `and`, `or` and parentheses. `%var` names a
//! data requirement of the action (or an output recorded under that id).

use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use super::ConditionEvaluator;
use super::filter::requirement_resources;
use crate::action::{ActionNode, ConditionSpec, variable_name};
use crate::context::ProcessingContext;
use crate::error::ConditionError;

static TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\A\s*(?:(?P<open>\()|(?P<close>\))|%(?P<var>[A-Za-z][A-Za-z0-9_\-]*)|\.\s*(?P<func>exists|empty|count)\s*\(\s*\)|(?P<op>>=|<=|!=|=|>|<)|(?P<num>\d+)|(?P<word>[A-Za-z]+))",
    )
    .expect("token regex is valid")
});

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Open,
    Close,
    Var(String),
    Func(Func),
    Op(Comparison),
    Num(usize),
    True,
    False,
    Not,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Func {
    Exists,
    Empty,
    Count,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl Comparison {
    fn apply(self, left: usize, right: usize) -> bool {
        match self {
            Self::Eq => left == right,
            Self::Ne => left != right,
            Self::Gt => left > right,
            Self::Ge => left >= right,
            Self::Lt => left < right,
            Self::Le => left <= right,
        }
    }
}

/// Parsed condition expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expression {
    Literal(bool),
    Exists(String),
    Empty(String),
    Count {
        variable: String,
        op: Comparison,
        value: usize,
    },
    Not(Box<Expression>),
    And(Box<Expression>, Box<Expression>),
    Or(Box<Expression>, Box<Expression>),
}

impl Expression {
    pub fn parse(input: &str) -> Result<Self, ConditionError> {
        let tokens = tokenize(input)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.or()?;
        if parser.pos != parser.tokens.len() {
            return Err(ConditionError::UnsupportedExpression(format!(
                "unexpected trailing input in '{input}'"
            )));
        }
        Ok(expr)
    }

    /// Evaluate with `count` resolving a variable to its resource count.
    pub fn eval(&self, count: &mut impl FnMut(&str) -> usize) -> bool {
        match self {
            Self::Literal(b) => *b,
            Self::Exists(var) => count(var) > 0,
            Self::Empty(var) => count(var) == 0,
            Self::Count {
                variable,
                op,
                value,
            } => op.apply(count(variable), *value),
            Self::Not(inner) => !inner.eval(count),
            Self::And(l, r) => {
                let left = l.eval(count);
                let right = r.eval(count);
                left && right
            }
            Self::Or(l, r) => {
                let left = l.eval(count);
                let right = r.eval(count);
                left || right
            }
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>, ConditionError> {
    let mut tokens = Vec::new();
    let mut rest = input;
    while !rest.trim().is_empty() {
        let caps = TOKEN.captures(rest).ok_or_else(|| {
            ConditionError::UnsupportedExpression(format!("cannot parse '{}'", rest.trim()))
        })?;
        let token = if caps.name("open").is_some() {
            Token::Open
        } else if caps.name("close").is_some() {
            Token::Close
        } else if let Some(var) = caps.name("var") {
            Token::Var(var.as_str().to_string())
        } else if let Some(func) = caps.name("func") {
            Token::Func(match func.as_str() {
                "exists" => Func::Exists,
                "empty" => Func::Empty,
                _ => Func::Count,
            })
        } else if let Some(op) = caps.name("op") {
            Token::Op(match op.as_str() {
                "=" => Comparison::Eq,
                "!=" => Comparison::Ne,
                ">" => Comparison::Gt,
                ">=" => Comparison::Ge,
                "<" => Comparison::Lt,
                _ => Comparison::Le,
            })
        } else if let Some(num) = caps.name("num") {
            let value = num.as_str().parse().map_err(|_| {
                ConditionError::UnsupportedExpression(format!("number out of range: {}", num.as_str()))
            })?;
            Token::Num(value)
        } else {
            let word = caps.name("word").map(|m| m.as_str()).unwrap_or_default();
            match word {
                "true" => Token::True,
                "false" => Token::False,
                "not" => Token::Not,
                "and" => Token::And,
                "or" => Token::Or,
                other => {
                    return Err(ConditionError::UnsupportedExpression(format!(
                        "unknown keyword '{other}'"
                    )));
                }
            }
        };
        tokens.push(token);
        let consumed = caps.get(0).map(|m| m.end()).unwrap_or(rest.len());
        rest = &rest[consumed..];
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn or(&mut self) -> Result<Expression, ConditionError> {
        let mut left = self.and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            left = Expression::Or(Box::new(left), Box::new(self.and()?));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expression, ConditionError> {
        let mut left = self.unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            left = Expression::And(Box::new(left), Box::new(self.unary()?));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expression, ConditionError> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            return Ok(Expression::Not(Box::new(self.unary()?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expression, ConditionError> {
        match self.next() {
            Some(Token::True) => Ok(Expression::Literal(true)),
            Some(Token::False) => Ok(Expression::Literal(false)),
            Some(Token::Open) => {
                let inner = self.or()?;
                match self.next() {
                    Some(Token::Close) => Ok(inner),
                    _ => Err(unsupported("missing ')'")),
                }
            }
            Some(Token::Var(variable)) => match self.next() {
                Some(Token::Func(Func::Exists)) => Ok(Expression::Exists(variable)),
                Some(Token::Func(Func::Empty)) => Ok(Expression::Empty(variable)),
                Some(Token::Func(Func::Count)) => match (self.next(), self.next()) {
                    (Some(Token::Op(op)), Some(Token::Num(value))) => Ok(Expression::Count {
                        variable,
                        op,
                        value,
                    }),
                    _ => Err(unsupported("count() must be compared to a number")),
                },
                _ => Err(unsupported(&format!(
                    "%{variable} must be followed by exists(), empty() or count()"
                ))),
            },
            Some(other) => Err(unsupported(&format!("unexpected token {other:?}"))),
            None => Err(unsupported("unexpected end of expression")),
        }
    }
}

fn unsupported(message: &str) -> ConditionError {
    ConditionError::UnsupportedExpression(message.to_string())
}

/// Evaluator for [`ProcessorKind::FhirPath`](crate::action::ProcessorKind::FhirPath) conditions.
#[derive(Debug, Clone, Copy, Default)]
pub struct FhirPathEvaluator;

impl FhirPathEvaluator {
    fn count(variable: &str, node: &ActionNode, ctx: &ProcessingContext) -> usize {
        if let Some(requirement) = node.input_requirement(variable) {
            return requirement_resources(requirement, ctx).len();
        }
        let count = ctx
            .output_resources()
            .values()
            .flat_map(|outputs| outputs.keys())
            .filter(|id| id.as_str() == variable || variable_name(id) == variable)
            .count();
        if count == 0 {
            debug!(action_id = %node.id, variable, "Expression variable resolved to no data");
        }
        count
    }
}

impl ConditionEvaluator for FhirPathEvaluator {
    fn evaluate(
        &self,
        condition: &ConditionSpec,
        node: &ActionNode,
        ctx: &mut ProcessingContext,
    ) -> Result<bool, ConditionError> {
        let expression = Expression::parse(&condition.expression)?;
        let ctx: &ProcessingContext = ctx;
        Ok(expression.eval(&mut |variable: &str| Self::count(variable, node, ctx)))
    }
}
