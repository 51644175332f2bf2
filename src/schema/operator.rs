use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::FramewiseError;

/// Comparison operators understood by structured fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = "in")]
    In,
    #[serde(rename = "between")]
    Between,
    #[serde(rename = "not between")]
    NotBetween,
}

impl Operator {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Operator::Lt => "<",
            Operator::Gt => ">",
            Operator::Le => "<=",
            Operator::Ge => ">=",
            Operator::Eq => "=",
            Operator::Ne => "!=",
            Operator::In => "in",
            Operator::Between => "between",
            Operator::NotBetween => "not between",
        }
    }

    /// Whether the storage layer can answer this operator from its indices.
    ///
    /// `!=` can be evaluated against a value but has no index-backed query form.
    #[must_use]
    pub fn is_searchable(self) -> bool {
        !matches!(self, Operator::Ne)
    }

    /// Orderings rather than equality tests.
    #[must_use]
    pub fn is_ordering(self) -> bool {
        matches!(
            self,
            Operator::Lt
                | Operator::Gt
                | Operator::Le
                | Operator::Ge
                | Operator::Between
                | Operator::NotBetween
        )
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operator {
    type Err = FramewiseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "<" => Operator::Lt,
            ">" => Operator::Gt,
            "<=" => Operator::Le,
            ">=" => Operator::Ge,
            "=" | "==" => Operator::Eq,
            "!=" => Operator::Ne,
            "in" => Operator::In,
            "between" => Operator::Between,
            "not between" => Operator::NotBetween,
            other => {
                return Err(FramewiseError::NonSearchableOperator {
                    operator: other.to_owned(),
                });
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_displays_symbols() {
        for op in [
            Operator::Lt,
            Operator::Ge,
            Operator::In,
            Operator::NotBetween,
        ] {
            assert_eq!(op.as_str().parse::<Operator>().unwrap(), op);
        }
        assert_eq!("==".parse::<Operator>().unwrap(), Operator::Eq);
    }

    #[test]
    fn unknown_symbol_is_not_searchable() {
        let err = "like".parse::<Operator>().unwrap_err();
        assert!(matches!(err, FramewiseError::NonSearchableOperator { .. }));
        assert!(!Operator::Ne.is_searchable());
    }
}
