//! Precompiled statements and bound parameters.
//!
//! A statement is a compile-time constant: a target table plus a fixed list of
//! predicates over named parameters. Values are bound per execution through
//! [`Params`]; statement text is never assembled at runtime.

use std::collections::{HashMap, HashSet};

use crate::error::{Result, StoreError};

/// Tables held by the columnar database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableName {
    /// Versioned dataset item rows.
    DatasetItems,
    /// Experiment links from experiments to dataset items and traces.
    ExperimentItems,
    /// Trace rows carrying input/output documents.
    Traces,
    /// Feedback scores attached to traces or spans.
    FeedbackScores,
}

impl TableName {
    /// Returns the table name as stored.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::DatasetItems => "dataset_items",
            Self::ExperimentItems => "experiment_items",
            Self::Traces => "traces",
            Self::FeedbackScores => "feedback_scores",
        }
    }
}

/// Comparison operator of a predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// `column = :param`
    Eq,
    /// `column < :param` (lexicographic over the stored text).
    Lt,
    /// `column IN :param`
    In,
}

/// A single `column <op> :param` condition. All predicate columns are `Utf8`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Predicate {
    /// Column the predicate reads.
    pub column: &'static str,
    /// Comparison operator.
    pub op: Op,
    /// Name of the bound parameter.
    pub param: &'static str,
}

impl Predicate {
    /// `column = :param`
    #[must_use]
    pub const fn eq(column: &'static str, param: &'static str) -> Self {
        Self {
            column,
            op: Op::Eq,
            param,
        }
    }

    /// `column < :param`
    #[must_use]
    pub const fn lt(column: &'static str, param: &'static str) -> Self {
        Self {
            column,
            op: Op::Lt,
            param,
        }
    }

    /// `column IN :param`
    #[must_use]
    pub const fn is_in(column: &'static str, param: &'static str) -> Self {
        Self {
            column,
            op: Op::In,
            param,
        }
    }

    pub(crate) fn bind<'a>(&self, params: &'a Params) -> Result<BoundPredicate<'a>> {
        let test = match self.op {
            Op::Eq => Test::Eq(params.text(self.param)?),
            Op::Lt => Test::Lt(params.text(self.param)?),
            Op::In => Test::In(params.list(self.param)?.iter().map(String::as_str).collect()),
        };
        Ok(BoundPredicate {
            column: self.column,
            test,
        })
    }
}

/// A predicate whose parameter has been resolved.
#[derive(Debug)]
pub(crate) struct BoundPredicate<'a> {
    pub(crate) column: &'static str,
    test: Test<'a>,
}

#[derive(Debug)]
enum Test<'a> {
    Eq(&'a str),
    Lt(&'a str),
    In(HashSet<&'a str>),
}

impl BoundPredicate<'_> {
    pub(crate) fn matches(&self, value: &str) -> bool {
        match &self.test {
            Test::Eq(expected) => value == *expected,
            Test::Lt(bound) => value < *bound,
            Test::In(set) => set.contains(value),
        }
    }
}

/// A precompiled statement.
#[derive(Debug, Clone, Copy)]
pub struct Statement {
    /// Name used in logs.
    pub name: &'static str,
    /// Target table.
    pub table: TableName,
    /// Conjunction of predicates; an empty list matches every row.
    pub predicates: &'static [Predicate],
}

/// A bound parameter value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// A single text value.
    Text(String),
    /// A list of text values (for `IN`).
    List(Vec<String>),
}

/// Named parameters bound to a statement execution.
#[derive(Debug, Clone, Default)]
pub struct Params {
    values: HashMap<&'static str, Value>,
}

impl Params {
    /// Creates an empty parameter set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds a single text value.
    #[must_use]
    pub fn bind(mut self, name: &'static str, value: impl ToString) -> Self {
        self.values.insert(name, Value::Text(value.to_string()));
        self
    }

    /// Binds a list of values.
    #[must_use]
    pub fn bind_list<I, T>(mut self, name: &'static str, values: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: ToString,
    {
        self.values.insert(
            name,
            Value::List(values.into_iter().map(|v| v.to_string()).collect()),
        );
        self
    }

    fn text(&self, name: &str) -> Result<&str> {
        match self.values.get(name) {
            Some(Value::Text(value)) => Ok(value),
            Some(Value::List(_)) => Err(StoreError::invariant(format!(
                "parameter ':{name}' is a list, expected a single value"
            ))),
            None => Err(StoreError::invariant(format!("parameter ':{name}' is not bound"))),
        }
    }

    fn list(&self, name: &str) -> Result<&[String]> {
        match self.values.get(name) {
            Some(Value::List(values)) => Ok(values),
            Some(Value::Text(_)) => Err(StoreError::invariant(format!(
                "parameter ':{name}' is a single value, expected a list"
            ))),
            None => Err(StoreError::invariant(format!("parameter ':{name}' is not bound"))),
        }
    }
}
