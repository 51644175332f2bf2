//! Parameterised SQL assembly and the metadata predicate AST.
//!
//! Query text is only ever built from fixed fragments; every caller-provided
//! value (field names, terms, operands, cursors) goes through [`SqlBuilder::bind`].

use std::collections::BTreeMap;

use rusqlite::types::Value;
use rusqlite::{ParamsFromIter, params_from_iter};

use crate::error::{FramewiseError, Result};
use crate::schema::Operator;
use crate::types::{FieldFilter, IdRange, Scalar};

/// SQL text plus its positional parameters, kept in step.
#[derive(Debug, Default, Clone)]
pub(crate) struct SqlBuilder {
    sql: String,
    params: Vec<Value>,
}

impl SqlBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, fragment: &str) -> &mut Self {
        self.sql.push_str(fragment);
        self
    }

    pub fn bind(&mut self, value: impl Into<Value>) -> &mut Self {
        self.sql.push('?');
        self.params.push(value.into());
        self
    }

    pub fn bind_list<I, V>(&mut self, values: I) -> &mut Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        for (i, value) in values.into_iter().enumerate() {
            if i > 0 {
                self.sql.push_str(", ");
            }
            self.bind(value);
        }
        self
    }

    /// Splice another builder's text and parameters onto the end of this one.
    pub fn append(&mut self, other: SqlBuilder) -> &mut Self {
        self.sql.push_str(&other.sql);
        self.params.extend(other.params);
        self
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn params(&self) -> ParamsFromIter<std::slice::Iter<'_, Value>> {
        params_from_iter(self.params.iter())
    }

    #[cfg(test)]
    pub fn param_values(&self) -> &[Value] {
        &self.params
    }

    /// `and <column> > ?` / `and <column> <= ?` for the bounds present.
    pub fn push_range(&mut self, column: &str, range: IdRange) -> &mut Self {
        if let Some(after) = range.after {
            self.push(" and ").push(column).push(" > ").bind(after);
        }
        if let Some(upto) = range.upto {
            self.push(" and ").push(column).push(" <= ").bind(upto);
        }
        self
    }

    /// `and <column> [not] in (<unstructured field ids>)`; nothing for `All`.
    pub fn push_field_filter(&mut self, column: &str, filter: &FieldFilter) -> &mut Self {
        let (negate, names) = match filter {
            FieldFilter::All => return self,
            FieldFilter::Include(names) => (false, names),
            FieldFilter::Exclude(names) => (true, names),
        };
        self.push(" and ").push(column);
        if negate {
            self.push(" not");
        }
        self.push(" in (select id from unstructured_field where name in (")
            .bind_list(names.iter().cloned())
            .push("))")
    }

    pub fn push_limit(&mut self, limit: Option<usize>) -> &mut Self {
        if let Some(limit) = limit {
            self.push(" limit ").bind(limit as i64);
        }
        self
    }
}

/// Comparison of a structured value against bound operands.
#[derive(Debug, Clone, PartialEq)]
pub enum Comparison {
    Lt(Scalar),
    Gt(Scalar),
    Le(Scalar),
    Ge(Scalar),
    Eq(Scalar),
    In(Vec<Scalar>),
    Between(Scalar, Scalar),
    NotBetween(Scalar, Scalar),
}

impl Comparison {
    /// Build from an operator and its operands (one, a list for `in`, two for
    /// the `between` forms).
    pub fn from_operator(op: Operator, mut operands: Vec<Scalar>) -> Result<Self> {
        let arity = |expected: usize, got: usize| {
            FramewiseError::invalid_query(format!(
                "'{op}' takes {expected} operand(s), got {got}"
            ))
        };
        let single = |mut operands: Vec<Scalar>| match operands.len() {
            1 => Ok(operands.remove(0)),
            n => Err(arity(1, n)),
        };
        Ok(match op {
            Operator::Lt => Comparison::Lt(single(operands)?),
            Operator::Gt => Comparison::Gt(single(operands)?),
            Operator::Le => Comparison::Le(single(operands)?),
            Operator::Ge => Comparison::Ge(single(operands)?),
            Operator::Eq => Comparison::Eq(single(operands)?),
            Operator::In if operands.is_empty() => return Err(arity(1, 0)),
            Operator::In => Comparison::In(operands),
            Operator::Between | Operator::NotBetween => {
                if operands.len() != 2 {
                    return Err(arity(2, operands.len()));
                }
                let high = operands.remove(1);
                let low = operands.remove(0);
                if op == Operator::Between {
                    Comparison::Between(low, high)
                } else {
                    Comparison::NotBetween(low, high)
                }
            }
            Operator::Ne => {
                return Err(FramewiseError::NonSearchableOperator {
                    operator: op.to_string(),
                });
            }
        })
    }

    fn render(&self, sql: &mut SqlBuilder) {
        match self {
            Comparison::Lt(v) => sql.push(" and value < ").bind(v.clone()),
            Comparison::Gt(v) => sql.push(" and value > ").bind(v.clone()),
            Comparison::Le(v) => sql.push(" and value <= ").bind(v.clone()),
            Comparison::Ge(v) => sql.push(" and value >= ").bind(v.clone()),
            Comparison::Eq(v) => sql.push(" and value = ").bind(v.clone()),
            Comparison::In(values) => sql
                .push(" and value in (")
                .bind_list(values.iter().cloned())
                .push(")"),
            Comparison::Between(low, high) => sql
                .push(" and value between ")
                .bind(low.clone())
                .push(" and ")
                .bind(high.clone()),
            Comparison::NotBetween(low, high) => sql
                .push(" and value not between ")
                .bind(low.clone())
                .push(" and ")
                .bind(high.clone()),
        };
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    pub field: String,
    pub comparison: Comparison,
}

/// Conjunction of structured-field predicates.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataFilter {
    predicates: Vec<Predicate>,
}

impl MetadataFilter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, field: impl Into<String>, comparison: Comparison) {
        self.predicates.push(Predicate {
            field: field.into(),
            comparison,
        });
    }

    pub fn with(mut self, field: impl Into<String>, comparison: Comparison) -> Self {
        self.push(field, comparison);
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    #[must_use]
    pub fn predicates(&self) -> &[Predicate] {
        &self.predicates
    }

    fn by_field(&self) -> BTreeMap<&str, Vec<&Comparison>> {
        let mut grouped: BTreeMap<&str, Vec<&Comparison>> = BTreeMap::new();
        for predicate in &self.predicates {
            grouped
                .entry(predicate.field.as_str())
                .or_default()
                .push(&predicate.comparison);
        }
        grouped
    }

    /// One `select document_id` per field, joined with `intersect`.
    pub(crate) fn render_document_ids(&self, sql: &mut SqlBuilder) {
        for (i, (field, comparisons)) in self.by_field().into_iter().enumerate() {
            if i > 0 {
                sql.push(" intersect ");
            }
            sql.push(
                "select document_id from document_data \
                 where field_id = (select id from structured_field where name = ",
            )
            .bind(field.to_owned())
            .push(")");
            for comparison in comparisons {
                comparison.render(sql);
            }
        }
    }
}
