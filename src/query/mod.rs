//! Query engine
//!
//! Predicates are compiled once into an [`Expr`] tree from either dialect:
//! - SQL-style: `sub = '001' AND ses IN ('A', 'B') AND desc LIKE 'brain%'`
//! - legacy: `sub == '001' & ses.isin(['A', 'B']) & desc.str.contains('brain')`
//!
//! Both render to the same canonical form via `Display`.

mod parser;
pub mod select;

use std::collections::BTreeSet;
use std::fmt;

use regex::Regex;

use crate::error::Result;
use crate::index::EntityRecord;

pub use select::{
    Cardinality, InputRequest, Presence, ProcessingUnit, QueryEngine, Scope, Selection,
    SelectionIssue, UnitSelection,
};

/// Literal operand of a comparison
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Null,
}

impl Literal {
    fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    fn text(&self) -> String {
        match self {
            Self::Str(s) => s.clone(),
            Self::Int(i) => i.to_string(),
            Self::Float(f) => f.to_string(),
            Self::Bool(b) => b.to_string(),
            Self::Null => String::new(),
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(s) => write!(f, "'{}'", s.replace('\'', "''")),
            Self::Null => f.write_str("NULL"),
            Self::Bool(b) => f.write_str(if *b { "TRUE" } else { "FALSE" }),
            other => f.write_str(&other.text()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    fn symbol(&self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        }
    }

    fn holds(&self, ordering: std::cmp::Ordering) -> bool {
        use std::cmp::Ordering::*;
        match self {
            Self::Eq => ordering == Equal,
            Self::Ne => ordering != Equal,
            Self::Lt => ordering == Less,
            Self::Le => ordering != Greater,
            Self::Gt => ordering == Greater,
            Self::Ge => ordering != Less,
        }
    }
}

/// Compiled predicate tree
#[derive(Debug, Clone)]
pub enum Expr {
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Compare {
        attr: String,
        op: CmpOp,
        value: Literal,
    },
    In {
        attr: String,
        values: Vec<Literal>,
    },
    /// Regex search (`LIKE` patterns are anchored on compilation)
    Matches {
        attr: String,
        regex: Regex,
    },
    IsNull {
        attr: String,
    },
}

impl PartialEq for Expr {
    fn eq(&self, other: &Self) -> bool {
        self.to_string() == other.to_string()
    }
}

impl Expr {
    pub fn and(self, other: Expr) -> Expr {
        Expr::And(Box::new(self), Box::new(other))
    }

    pub fn eval(&self, record: &EntityRecord) -> bool {
        match self {
            Self::And(a, b) => a.eval(record) && b.eval(record),
            Self::Or(a, b) => a.eval(record) || b.eval(record),
            Self::Not(inner) => !inner.eval(record),
            Self::Compare { attr, op, value } => match record.attr(attr) {
                Some(actual) => compare(&actual, *op, value),
                None => false,
            },
            Self::In { attr, values } => record
                .attr(attr)
                .is_some_and(|actual| values.iter().any(|v| compare(&actual, CmpOp::Eq, v))),
            Self::Matches { attr, regex } => {
                record.attr(attr).is_some_and(|actual| regex.is_match(&actual))
            }
            Self::IsNull { attr } => record.attr(attr).is_none(),
        }
    }

    fn collect_attributes(&self, out: &mut BTreeSet<String>) {
        match self {
            Self::And(a, b) | Self::Or(a, b) => {
                a.collect_attributes(out);
                b.collect_attributes(out);
            }
            Self::Not(inner) => inner.collect_attributes(out),
            Self::Compare { attr, .. }
            | Self::In { attr, .. }
            | Self::Matches { attr, .. }
            | Self::IsNull { attr } => {
                out.insert(attr.clone());
            }
        }
    }
}

fn compare(actual: &str, op: CmpOp, expected: &Literal) -> bool {
    match expected {
        Literal::Null => false,
        Literal::Int(_) | Literal::Float(_) => {
            match (actual.parse::<f64>(), expected.as_f64()) {
                (Ok(lhs), Some(rhs)) => lhs.partial_cmp(&rhs).is_some_and(|ord| op.holds(ord)),
                // non-numeric attribute: textual ordering
                _ => op.holds(actual.cmp(expected.text().as_str())),
            }
        }
        Literal::Bool(b) => {
            let matches = actual.eq_ignore_ascii_case(&b.to_string());
            match op {
                CmpOp::Eq => matches,
                CmpOp::Ne => !matches,
                _ => false,
            }
        }
        Literal::Str(s) => op.holds(actual.cmp(s.as_str())),
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::And(a, b) => write!(f, "({a} AND {b})"),
            Self::Or(a, b) => write!(f, "({a} OR {b})"),
            Self::Not(inner) => write!(f, "NOT {inner}"),
            Self::Compare { attr, op, value } => write!(f, "{attr} {} {value}", op.symbol()),
            Self::In { attr, values } => {
                let list: Vec<String> = values.iter().map(ToString::to_string).collect();
                write!(f, "{attr} IN ({})", list.join(", "))
            }
            Self::Matches { attr, regex } => write!(f, "{attr} ~ /{}/", regex.as_str()),
            Self::IsNull { attr } => write!(f, "{attr} IS NULL"),
        }
    }
}

/// A compiled query with its source text
#[derive(Debug, Clone)]
pub struct Query {
    source: String,
    expr: Expr,
}

impl Query {
    /// Compile either dialect
    pub fn parse(text: &str) -> Result<Self> {
        let expr = parser::parse(text)?;
        Ok(Self {
            source: text.to_string(),
            expr,
        })
    }

    pub fn from_expr(expr: Expr) -> Self {
        Self {
            source: expr.to_string(),
            expr,
        }
    }

    /// Conjunction of all queries; `None` if the list is empty
    pub fn all_of(queries: impl IntoIterator<Item = Query>) -> Option<Query> {
        queries
            .into_iter()
            .map(|q| q.expr)
            .reduce(Expr::and)
            .map(Query::from_expr)
    }

    /// Conjunction with another query
    pub fn and(self, other: Query) -> Query {
        Query::from_expr(self.expr.and(other.expr))
    }

    /// Narrow a built-in query with an optional user-supplied one
    pub fn refine(self, user: Option<&str>) -> Result<Query> {
        match user {
            Some(text) => Ok(self.and(Query::parse(text)?)),
            None => Ok(self),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    pub fn matches(&self, record: &EntityRecord) -> bool {
        self.expr.eval(record)
    }

    /// Canonical attribute names referenced by the query
    pub fn attributes(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.expr.collect_attributes(&mut out);
        out
    }

    /// Canonical SQL-style rendering
    pub fn canonical(&self) -> String {
        self.expr.to_string()
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}
