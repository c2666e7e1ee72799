//! Guard and assignment expressions.
//!
//! Conditions, `assign` bodies and `foreach` selectors are parsed at build
//! time into a small AST and evaluated against the scoped context map.
//! The grammar exposes literals, comparisons, boolean connectives, basic
//! arithmetic and property paths (`context["key"]`, `context.key`, or a
//! bare dotted path) — nothing else, so definitions cannot reach the host.

use nom::{
    branch::alt,
    bytes::complete::{tag, take_until},
    character::complete::{alpha1, alphanumeric1, char, digit1, multispace0},
    combinator::{map, opt, recognize, verify},
    multi::{many0, many1},
    sequence::{delimited, pair, preceded},
    IResult,
};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExprError {
    #[error("can't parse expression '{0}'")]
    Parse(String),
    #[error("no such property in scope: {0}")]
    NoSuchProperty(String),
    #[error("type error in expression: {0}")]
    Type(String),
    #[error("division by zero")]
    DivisionByZero,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum BinOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Literal(Value),
    /// Property path into the scope, e.g. `["prop2", "subkey"]`.
    Path(Vec<String>),
    Not(Box<Expr>),
    Neg(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
}

impl Expr {
    /// Parse a complete expression; trailing input is an error.
    pub fn parse(input: &str) -> Result<Self, ExprError> {
        match expr(input) {
            Ok((rest, parsed)) if rest.trim().is_empty() => Ok(parsed),
            _ => Err(ExprError::Parse(input.to_string())),
        }
    }

    /// Evaluate against the flattened context scope.
    pub fn eval(&self, scope: &Map<String, Value>) -> Result<Value, ExprError> {
        match self {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Path(segments) => lookup_path(scope, segments),
            Expr::Not(inner) => Ok(Value::Bool(!truthy(&inner.eval(scope)?))),
            Expr::Neg(inner) => match inner.eval(scope)? {
                Value::Number(n) if n.is_i64() => Ok(Value::from(-n.as_i64().unwrap())),
                Value::Number(n) => Ok(Value::from(-n.as_f64().unwrap())),
                other => Err(ExprError::Type(format!("can't negate {other}"))),
            },
            Expr::Binary(op, lhs, rhs) => eval_binary(*op, lhs, rhs, scope),
        }
    }

    /// Evaluate as a guard (truthiness of the result).
    pub fn eval_bool(&self, scope: &Map<String, Value>) -> Result<bool, ExprError> {
        Ok(truthy(&self.eval(scope)?))
    }
}

/// All conditions of a node must hold.
pub fn eval_guard(
    conditions: &[Expr],
    scope: &Map<String, Value>,
) -> Result<bool, ExprError> {
    for condition in conditions {
        if !condition.eval_bool(scope)? {
            return Ok(false);
        }
    }
    Ok(true)
}

pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(entries) => !entries.is_empty(),
    }
}

fn lookup_path(scope: &Map<String, Value>, segments: &[String]) -> Result<Value, ExprError> {
    let missing = || ExprError::NoSuchProperty(segments.join("."));
    let mut current = scope.get(&segments[0]).ok_or_else(missing)?;
    for segment in &segments[1..] {
        current = match current {
            Value::Object(entries) => entries.get(segment).ok_or_else(missing)?,
            Value::Array(items) => {
                let index: usize = segment.parse().map_err(|_| missing())?;
                items.get(index).ok_or_else(missing)?
            }
            _ => return Err(missing()),
        };
    }
    Ok(current.clone())
}

fn eval_binary(
    op: BinOp,
    lhs: &Expr,
    rhs: &Expr,
    scope: &Map<String, Value>,
) -> Result<Value, ExprError> {
    // Short-circuit connectives first.
    match op {
        BinOp::Or => {
            return Ok(Value::Bool(
                lhs.eval_bool(scope)? || rhs.eval_bool(scope)?,
            ))
        }
        BinOp::And => {
            return Ok(Value::Bool(
                lhs.eval_bool(scope)? && rhs.eval_bool(scope)?,
            ))
        }
        _ => {}
    }

    let left = lhs.eval(scope)?;
    let right = rhs.eval(scope)?;
    match op {
        BinOp::Eq => Ok(Value::Bool(left == right)),
        BinOp::Ne => Ok(Value::Bool(left != right)),
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => compare(op, &left, &right),
        BinOp::Add => match (&left, &right) {
            (Value::String(a), Value::String(b)) => Ok(Value::from(format!("{a}{b}"))),
            _ => arithmetic(op, &left, &right),
        },
        BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Mod => arithmetic(op, &left, &right),
        BinOp::Or | BinOp::And => unreachable!(),
    }
}

fn compare(op: BinOp, left: &Value, right: &Value) -> Result<Value, ExprError> {
    let ordering = match (left, right) {
        (Value::Number(a), Value::Number(b)) => a
            .as_f64()
            .unwrap()
            .partial_cmp(&b.as_f64().unwrap())
            .ok_or_else(|| ExprError::Type("incomparable numbers".to_string()))?,
        (Value::String(a), Value::String(b)) => a.cmp(b),
        _ => {
            return Err(ExprError::Type(format!(
                "can't compare {left} with {right}"
            )))
        }
    };
    let holds = match op {
        BinOp::Lt => ordering.is_lt(),
        BinOp::Le => ordering.is_le(),
        BinOp::Gt => ordering.is_gt(),
        BinOp::Ge => ordering.is_ge(),
        _ => unreachable!(),
    };
    Ok(Value::Bool(holds))
}

fn arithmetic(op: BinOp, left: &Value, right: &Value) -> Result<Value, ExprError> {
    let (a, b) = match (left, right) {
        (Value::Number(a), Value::Number(b)) => (a, b),
        _ => {
            return Err(ExprError::Type(format!(
                "arithmetic needs numbers, got {left} and {right}"
            )))
        }
    };
    if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
        let result = match op {
            BinOp::Add => a.checked_add(b),
            BinOp::Sub => a.checked_sub(b),
            BinOp::Mul => a.checked_mul(b),
            BinOp::Div => {
                if b == 0 {
                    return Err(ExprError::DivisionByZero);
                }
                a.checked_div(b)
            }
            BinOp::Mod => {
                if b == 0 {
                    return Err(ExprError::DivisionByZero);
                }
                a.checked_rem(b)
            }
            _ => unreachable!(),
        };
        return result
            .map(Value::from)
            .ok_or_else(|| ExprError::Type("integer overflow".to_string()));
    }
    let (a, b) = (a.as_f64().unwrap(), b.as_f64().unwrap());
    let result = match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div => {
            if b == 0.0 {
                return Err(ExprError::DivisionByZero);
            }
            a / b
        }
        BinOp::Mod => a % b,
        _ => unreachable!(),
    };
    Ok(Value::from(result))
}

// ─── Grammar ──────────────────────────────────────────────────

fn ws(input: &str) -> IResult<&str, &str> {
    multispace0(input)
}

fn identifier(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        alt((alpha1, tag("_"))),
        many0(alt((alphanumeric1, tag("_")))),
    ))(input)
}

/// A word operator like `and` (must not swallow an identifier prefix).
fn word<'a>(keyword: &'static str) -> impl FnMut(&'a str) -> IResult<&'a str, &'a str> {
    verify(preceded(ws, identifier), move |s: &&str| *s == keyword)
}

fn quoted_string(input: &str) -> IResult<&str, String> {
    preceded(
        ws,
        alt((
            delimited(
                char('"'),
                map(take_until("\""), str::to_string),
                char('"'),
            ),
            delimited(char('\''), map(take_until("'"), str::to_string), char('\'')),
        )),
    )(input)
}

fn number(input: &str) -> IResult<&str, Expr> {
    let (rest, text) = preceded(
        ws,
        recognize(pair(digit1, opt(pair(char('.'), digit1)))),
    )(input)?;
    let value = if text.contains('.') {
        Value::from(text.parse::<f64>().unwrap())
    } else {
        Value::from(text.parse::<i64>().unwrap_or(i64::MAX))
    };
    Ok((rest, Expr::Literal(value)))
}

/// A dotted-path segment: a property name or an array index.
fn path_segment(input: &str) -> IResult<&str, &str> {
    alt((identifier, digit1))(input)
}

/// Bracket or dot accessor after `context`.
fn accessor(input: &str) -> IResult<&str, String> {
    alt((
        delimited(
            preceded(ws, char('[')),
            quoted_string,
            preceded(ws, char(']')),
        ),
        map(preceded(char('.'), path_segment), str::to_string),
    ))(input)
}

/// Identifier-led atom: keyword literal, `context` path, or bare path.
fn word_atom(input: &str) -> IResult<&str, Expr> {
    let (rest, name) = preceded(ws, identifier)(input)?;
    match name {
        "True" | "true" => Ok((rest, Expr::Literal(Value::Bool(true)))),
        "False" | "false" => Ok((rest, Expr::Literal(Value::Bool(false)))),
        "None" | "null" => Ok((rest, Expr::Literal(Value::Null))),
        "and" | "or" | "not" => Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::Verify,
        ))),
        "context" => {
            let (rest, segments) = many1(accessor)(rest)?;
            Ok((rest, Expr::Path(segments)))
        }
        _ => {
            let (rest, tail) = many0(preceded(char('.'), path_segment))(rest)?;
            let mut segments = vec![name.to_string()];
            segments.extend(tail.iter().map(|s| s.to_string()));
            Ok((rest, Expr::Path(segments)))
        }
    }
}

fn atom(input: &str) -> IResult<&str, Expr> {
    alt((
        number,
        map(quoted_string, |s| Expr::Literal(Value::from(s))),
        word_atom,
        delimited(preceded(ws, char('(')), expr, preceded(ws, char(')'))),
    ))(input)
}

fn unary(input: &str) -> IResult<&str, Expr> {
    alt((
        map(preceded(preceded(ws, char('!')), unary), |e| {
            Expr::Not(Box::new(e))
        }),
        map(preceded(word("not"), unary), |e| Expr::Not(Box::new(e))),
        map(preceded(preceded(ws, char('-')), unary), |e| {
            Expr::Neg(Box::new(e))
        }),
        atom,
    ))(input)
}

fn fold_binary(first: Expr, rest: Vec<(BinOp, Expr)>) -> Expr {
    rest.into_iter().fold(first, |lhs, (op, rhs)| {
        Expr::Binary(op, Box::new(lhs), Box::new(rhs))
    })
}

fn product(input: &str) -> IResult<&str, Expr> {
    let (rest, first) = unary(input)?;
    let (rest, tail) = many0(pair(
        preceded(
            ws,
            alt((
                map(char('*'), |_| BinOp::Mul),
                map(char('/'), |_| BinOp::Div),
                map(char('%'), |_| BinOp::Mod),
            )),
        ),
        unary,
    ))(rest)?;
    Ok((rest, fold_binary(first, tail)))
}

fn sum(input: &str) -> IResult<&str, Expr> {
    let (rest, first) = product(input)?;
    let (rest, tail) = many0(pair(
        preceded(
            ws,
            alt((
                map(char('+'), |_| BinOp::Add),
                map(char('-'), |_| BinOp::Sub),
            )),
        ),
        product,
    ))(rest)?;
    Ok((rest, fold_binary(first, tail)))
}

fn comparison(input: &str) -> IResult<&str, Expr> {
    let (rest, first) = sum(input)?;
    let (rest, tail) = opt(pair(
        preceded(
            ws,
            alt((
                map(tag("=="), |_| BinOp::Eq),
                map(tag("!="), |_| BinOp::Ne),
                map(tag("<="), |_| BinOp::Le),
                map(tag(">="), |_| BinOp::Ge),
                map(tag("<"), |_| BinOp::Lt),
                map(tag(">"), |_| BinOp::Gt),
            )),
        ),
        sum,
    ))(rest)?;
    Ok((rest, fold_binary(first, tail.into_iter().collect())))
}

fn conjunction(input: &str) -> IResult<&str, Expr> {
    let (rest, first) = comparison(input)?;
    let (rest, tail) = many0(pair(
        alt((
            map(preceded(ws, tag("&&")), |_| BinOp::And),
            map(word("and"), |_| BinOp::And),
        )),
        comparison,
    ))(rest)?;
    Ok((rest, fold_binary(first, tail)))
}

fn expr(input: &str) -> IResult<&str, Expr> {
    let (rest, first) = conjunction(input)?;
    let (rest, tail) = many0(pair(
        alt((
            map(preceded(ws, tag("||")), |_| BinOp::Or),
            map(word("or"), |_| BinOp::Or),
        )),
        conjunction,
    ))(rest)?;
    Ok((rest, fold_binary(first, tail)))
}
