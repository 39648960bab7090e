#![forbid(unsafe_code)]

//! Boolean job queries over status, id and tag equality.
//!
//! ```text
//! status = Pending and not (color = red or id in (4, 5))
//! ```
//!
//! `NOT` binds tightest, then `AND`, then `OR` / `XOR` / `SUB` (left
//! associative). Keywords and status names are case-insensitive; values may
//! be bare words or quoted strings.

mod parse;

use crate::idset::IdSet;
use crate::status::JobStatus;
use std::fmt;

pub use parse::parse;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QueryField {
    Status,
    Id,
    Tag(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QueryValue {
    Status(JobStatus),
    Id(u32),
    Text(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QueryExpr {
    Eq(QueryField, QueryValue),
    In(QueryField, Vec<QueryValue>),
    Not(Box<QueryExpr>),
    And(Box<QueryExpr>, Box<QueryExpr>),
    Or(Box<QueryExpr>, Box<QueryExpr>),
    Xor(Box<QueryExpr>, Box<QueryExpr>),
    Sub(Box<QueryExpr>, Box<QueryExpr>),
}

/// The sets a query is evaluated against.
pub trait QuerySource {
    fn all_jobs(&self) -> IdSet;
    fn jobs_in_status(&self, status: JobStatus) -> IdSet;
    fn jobs_with_tag(&self, key: &str, value: &str) -> IdSet;
}

impl QueryExpr {
    /// Matching job ids, restricted to jobs that exist in `source`.
    pub fn evaluate(&self, source: &impl QuerySource) -> IdSet {
        let mut result = self.eval(source);
        result.intersect_with(&source.all_jobs());
        result
    }

    fn eval(&self, source: &impl QuerySource) -> IdSet {
        match self {
            QueryExpr::Eq(field, value) => lookup(source, field, value),
            QueryExpr::In(field, values) => {
                let mut out = IdSet::new();
                for value in values {
                    out.union_with(&lookup(source, field, value));
                }
                out
            }
            QueryExpr::Not(inner) => {
                let mut out = inner.eval(source);
                out.invert();
                out
            }
            QueryExpr::And(left, right) => {
                let mut out = left.eval(source);
                if !out.is_empty() {
                    out.intersect_with(&right.eval(source));
                }
                out
            }
            QueryExpr::Or(left, right) => {
                let mut out = left.eval(source);
                out.union_with(&right.eval(source));
                out
            }
            QueryExpr::Xor(left, right) => {
                let mut out = left.eval(source);
                out.xor_with(&right.eval(source));
                out
            }
            QueryExpr::Sub(left, right) => {
                let mut out = left.eval(source);
                out.subtract(&right.eval(source));
                out
            }
        }
    }

    /// Tag keys referenced anywhere in the expression.
    pub fn tag_keys(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_tag_keys(&mut out);
        out.sort_unstable();
        out.dedup();
        out
    }

    fn collect_tag_keys<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            QueryExpr::Eq(QueryField::Tag(key), _) | QueryExpr::In(QueryField::Tag(key), _) => {
                out.push(key)
            }
            QueryExpr::Eq(..) | QueryExpr::In(..) => {}
            QueryExpr::Not(inner) => inner.collect_tag_keys(out),
            QueryExpr::And(l, r)
            | QueryExpr::Or(l, r)
            | QueryExpr::Xor(l, r)
            | QueryExpr::Sub(l, r) => {
                l.collect_tag_keys(out);
                r.collect_tag_keys(out);
            }
        }
    }
}

fn lookup(source: &impl QuerySource, field: &QueryField, value: &QueryValue) -> IdSet {
    match (field, value) {
        (QueryField::Status, QueryValue::Status(status)) => source.jobs_in_status(*status),
        (QueryField::Id, QueryValue::Id(id)) => {
            let mut out = IdSet::new();
            out.insert(*id);
            out
        }
        (QueryField::Tag(key), QueryValue::Text(value)) => source.jobs_with_tag(key, value),
        // The parser never pairs a field with a foreign value kind.
        _ => IdSet::new(),
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QueryError {
    Empty,
    UnexpectedEnd,
    UnexpectedToken { pos: usize, found: String },
    UnterminatedString { pos: usize },
    UnknownStatus(String),
    InvalidId(String),
    TooDeep { pos: usize, max: usize },
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "query is empty"),
            Self::UnexpectedEnd => write!(f, "query ends unexpectedly"),
            Self::UnexpectedToken { pos, found } => {
                write!(f, "unexpected '{found}' at position {pos}")
            }
            Self::UnterminatedString { pos } => {
                write!(f, "unterminated string starting at position {pos}")
            }
            Self::UnknownStatus(raw) => write!(f, "unknown job status '{raw}'"),
            Self::InvalidId(raw) => write!(f, "invalid job id '{raw}'"),
            Self::TooDeep { pos, max } => {
                write!(f, "query nests deeper than {max} levels at position {pos}")
            }
        }
    }
}

impl std::error::Error for QueryError {}
