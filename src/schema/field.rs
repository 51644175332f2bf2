use std::cmp::Ordering;
use std::iter;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::operator::Operator;
use crate::analysis::{StandardAnalyser, Token};
use crate::error::{FramewiseError, Result};
use crate::types::Scalar;

/// Capabilities the index needs from a field.
///
/// Unstructured fields (`categorical() == false`) are tokenized into frames.
/// Structured fields contribute one document-level value through `value_of`.
pub trait Field {
    fn indexed(&self) -> bool;
    fn stored(&self) -> bool;
    fn categorical(&self) -> bool;
    fn analyse<'a>(&'a self, text: &'a str) -> Box<dyn Iterator<Item = Token> + 'a>;
    fn value_of(&self, raw: &Value) -> Result<Scalar>;
    fn supports(&self, op: Operator) -> bool;

    /// Evaluate `value <op> operand`. `in` takes any number of operands, the
    /// `between` forms take exactly two.
    fn evaluate_op(&self, op: Operator, value: &Scalar, operand: &[Scalar]) -> Result<bool> {
        if !self.supports(op) {
            return Err(FramewiseError::UnsupportedOperator {
                operator: op.to_string(),
                field: self.kind_name().to_owned(),
            });
        }
        evaluate(op, value, operand)
    }

    fn kind_name(&self) -> &'static str;
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextField {
    #[serde(default = "default_true")]
    pub indexed: bool,
    #[serde(default = "default_true")]
    pub stored: bool,
    #[serde(default)]
    pub analyser: StandardAnalyser,
}

impl Default for TextField {
    fn default() -> Self {
        Self {
            indexed: true,
            stored: true,
            analyser: StandardAnalyser::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoricalField {
    #[serde(default = "default_true")]
    pub indexed: bool,
    #[serde(default = "default_true")]
    pub stored: bool,
}

impl Default for CategoricalField {
    fn default() -> Self {
        Self {
            indexed: true,
            stored: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NumericKind {
    Integer,
    #[default]
    Float,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumericField {
    #[serde(default = "default_true")]
    pub indexed: bool,
    #[serde(default = "default_true")]
    pub stored: bool,
    #[serde(default)]
    pub kind: NumericKind,
}

impl Default for NumericField {
    fn default() -> Self {
        Self {
            indexed: true,
            stored: true,
            kind: NumericKind::default(),
        }
    }
}

/// Dates are indexed as milliseconds since the Unix epoch (UTC).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DateField {
    #[serde(default = "default_true")]
    pub indexed: bool,
    #[serde(default = "default_true")]
    pub stored: bool,
}

impl Default for DateField {
    fn default() -> Self {
        Self {
            indexed: true,
            stored: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BooleanField {
    #[serde(default = "default_true")]
    pub indexed: bool,
    #[serde(default = "default_true")]
    pub stored: bool,
}

impl Default for BooleanField {
    fn default() -> Self {
        Self {
            indexed: true,
            stored: true,
        }
    }
}

/// Every field kind the schema can hold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "options", rename_all = "snake_case")]
pub enum FieldType {
    Text(TextField),
    Categorical(CategoricalField),
    Numeric(NumericField),
    Date(DateField),
    Boolean(BooleanField),
}

impl FieldType {
    #[must_use]
    pub fn text() -> Self {
        FieldType::Text(TextField::default())
    }

    #[must_use]
    pub fn categorical() -> Self {
        FieldType::Categorical(CategoricalField::default())
    }

    #[must_use]
    pub fn numeric(kind: NumericKind) -> Self {
        FieldType::Numeric(NumericField {
            kind,
            ..NumericField::default()
        })
    }

    #[must_use]
    pub fn date() -> Self {
        FieldType::Date(DateField::default())
    }

    #[must_use]
    pub fn boolean() -> Self {
        FieldType::Boolean(BooleanField::default())
    }

    pub fn with_stored(mut self, value: bool) -> Self {
        *self.flags_mut().1 = value;
        self
    }

    pub fn with_indexed(mut self, value: bool) -> Self {
        *self.flags_mut().0 = value;
        self
    }

    fn flags(&self) -> (bool, bool) {
        match self {
            FieldType::Text(f) => (f.indexed, f.stored),
            FieldType::Categorical(f) => (f.indexed, f.stored),
            FieldType::Numeric(f) => (f.indexed, f.stored),
            FieldType::Date(f) => (f.indexed, f.stored),
            FieldType::Boolean(f) => (f.indexed, f.stored),
        }
    }

    fn flags_mut(&mut self) -> (&mut bool, &mut bool) {
        match self {
            FieldType::Text(f) => (&mut f.indexed, &mut f.stored),
            FieldType::Categorical(f) => (&mut f.indexed, &mut f.stored),
            FieldType::Numeric(f) => (&mut f.indexed, &mut f.stored),
            FieldType::Date(f) => (&mut f.indexed, &mut f.stored),
            FieldType::Boolean(f) => (&mut f.indexed, &mut f.stored),
        }
    }
}

impl Field for FieldType {
    fn indexed(&self) -> bool {
        self.flags().0
    }

    fn stored(&self) -> bool {
        self.flags().1
    }

    fn categorical(&self) -> bool {
        !matches!(self, FieldType::Text(_))
    }

    fn analyse<'a>(&'a self, text: &'a str) -> Box<dyn Iterator<Item = Token> + 'a> {
        match self {
            FieldType::Text(field) => Box::new(field.analyser.analyse(text)),
            _ => Box::new(iter::once(Token {
                value: text.trim().to_owned(),
                stopped: false,
            })),
        }
    }

    fn value_of(&self, raw: &Value) -> Result<Scalar> {
        match self {
            FieldType::Text(_) | FieldType::Categorical(_) => match raw {
                Value::String(s) => Ok(Scalar::Text(s.trim().to_owned())),
                Value::Number(n) => Ok(Scalar::Text(n.to_string())),
                Value::Bool(b) => Ok(Scalar::Text(b.to_string())),
                other => Err(not_a(other, "text value")),
            },
            FieldType::Numeric(field) => numeric_value(field.kind, raw),
            FieldType::Date(_) => date_value(raw),
            FieldType::Boolean(_) => boolean_value(raw),
        }
    }

    fn supports(&self, op: Operator) -> bool {
        match self {
            FieldType::Text(_) => false,
            FieldType::Categorical(_) | FieldType::Boolean(_) => {
                matches!(op, Operator::Eq | Operator::Ne | Operator::In)
            }
            FieldType::Numeric(_) | FieldType::Date(_) => true,
        }
    }

    fn kind_name(&self) -> &'static str {
        match self {
            FieldType::Text(_) => "text",
            FieldType::Categorical(_) => "categorical",
            FieldType::Numeric(_) => "numeric",
            FieldType::Date(_) => "date",
            FieldType::Boolean(_) => "boolean",
        }
    }
}

fn not_a(raw: &Value, expected: &str) -> FramewiseError {
    FramewiseError::invalid_document(format!("expected a {expected}, got {raw}"))
}

fn numeric_value(kind: NumericKind, raw: &Value) -> Result<Scalar> {
    match kind {
        NumericKind::Integer => {
            let parsed = match raw {
                Value::Number(n) => n.as_i64(),
                Value::String(s) => s.trim().parse::<i64>().ok(),
                _ => None,
            };
            parsed
                .map(Scalar::Integer)
                .ok_or_else(|| not_a(raw, "integer"))
        }
        NumericKind::Float => {
            let parsed = match raw {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.trim().parse::<f64>().ok(),
                _ => None,
            };
            parsed.map(Scalar::Real).ok_or_else(|| not_a(raw, "number"))
        }
    }
}

fn date_value(raw: &Value) -> Result<Scalar> {
    match raw {
        Value::Number(n) => n
            .as_i64()
            .map(Scalar::Integer)
            .ok_or_else(|| not_a(raw, "timestamp in milliseconds")),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Ok(Scalar::Integer(dt.timestamp_millis()));
            }
            if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S") {
                return Ok(Scalar::Integer(dt.and_utc().timestamp_millis()));
            }
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|dt| Scalar::Integer(dt.and_utc().timestamp_millis()))
                .ok_or_else(|| not_a(raw, "date"))
        }
        other => Err(not_a(other, "date")),
    }
}

fn boolean_value(raw: &Value) -> Result<Scalar> {
    let parsed = match raw {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|v| v != 0),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" => Some(true),
            "false" | "no" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    };
    parsed
        .map(|b| Scalar::Integer(i64::from(b)))
        .ok_or_else(|| not_a(raw, "boolean"))
}

fn compare(left: &Scalar, right: &Scalar) -> Option<Ordering> {
    match (left, right) {
        (Scalar::Text(a), Scalar::Text(b)) => Some(a.cmp(b)),
        _ => left.as_f64()?.partial_cmp(&right.as_f64()?),
    }
}

fn evaluate(op: Operator, value: &Scalar, operand: &[Scalar]) -> Result<bool> {
    let ordering = |target: &Scalar| {
        compare(value, target).ok_or_else(|| {
            FramewiseError::invalid_query(format!("cannot compare {value} with {target}"))
        })
    };
    let single = || {
        operand
            .first()
            .ok_or_else(|| FramewiseError::invalid_query(format!("'{op}' needs an operand")))
    };
    let bounds = || match operand {
        [low, high] => Ok((low, high)),
        _ => Err(FramewiseError::invalid_query(format!(
            "'{op}' needs exactly two operands"
        ))),
    };

    Ok(match op {
        Operator::Lt => ordering(single()?)? == Ordering::Less,
        Operator::Gt => ordering(single()?)? == Ordering::Greater,
        Operator::Le => ordering(single()?)? != Ordering::Greater,
        Operator::Ge => ordering(single()?)? != Ordering::Less,
        Operator::Eq => ordering(single()?)? == Ordering::Equal,
        Operator::Ne => ordering(single()?)? != Ordering::Equal,
        Operator::In => operand
            .iter()
            .any(|candidate| compare(value, candidate) == Some(Ordering::Equal)),
        Operator::Between | Operator::NotBetween => {
            let (low, high) = bounds()?;
            let inside = ordering(low)? != Ordering::Less && ordering(high)? != Ordering::Greater;
            inside == (op == Operator::Between)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn text_is_the_only_unstructured_kind() {
        assert!(!FieldType::text().categorical());
        for field in [
            FieldType::categorical(),
            FieldType::numeric(NumericKind::Integer),
            FieldType::date(),
            FieldType::boolean(),
        ] {
            assert!(field.categorical());
        }
    }

    #[test]
    fn flags_can_be_overridden() {
        let field = FieldType::text().with_stored(false);
        assert!(field.indexed());
        assert!(!field.stored());
        let field = FieldType::categorical().with_indexed(false);
        assert!(!field.indexed());
    }

    #[test]
    fn structured_values_are_normalised() {
        let int = FieldType::numeric(NumericKind::Integer);
        assert_eq!(int.value_of(&json!("42")).unwrap(), Scalar::Integer(42));
        assert!(int.value_of(&json!("forty")).is_err());

        let date = FieldType::date();
        assert_eq!(
            date.value_of(&json!("1970-01-02")).unwrap(),
            Scalar::Integer(86_400_000)
        );
        assert_eq!(
            date.value_of(&json!("1970-01-01T00:00:01Z")).unwrap(),
            Scalar::Integer(1_000)
        );

        let flag = FieldType::boolean();
        assert_eq!(flag.value_of(&json!("yes")).unwrap(), Scalar::Integer(1));
        assert_eq!(
            FieldType::categorical().value_of(&json!("  red ")).unwrap(),
            Scalar::from("red")
        );
    }

    #[test]
    fn evaluate_op_respects_capabilities() {
        let numeric = FieldType::numeric(NumericKind::Float);
        let five = Scalar::Real(5.0);
        assert!(
            numeric
                .evaluate_op(Operator::Between, &five, &[Scalar::Integer(1), Scalar::Integer(5)])
                .unwrap()
        );
        assert!(
            !numeric
                .evaluate_op(Operator::NotBetween, &five, &[Scalar::Integer(1), Scalar::Integer(9)])
                .unwrap()
        );
        assert!(
            numeric
                .evaluate_op(Operator::In, &five, &[Scalar::Integer(2), Scalar::Integer(5)])
                .unwrap()
        );

        let categorical = FieldType::categorical();
        let err = categorical
            .evaluate_op(Operator::Lt, &Scalar::from("a"), &[Scalar::from("b")])
            .unwrap_err();
        assert!(matches!(err, FramewiseError::UnsupportedOperator { .. }));
        assert!(
            categorical
                .evaluate_op(Operator::Ne, &Scalar::from("a"), &[Scalar::from("b")])
                .unwrap()
        );
    }

    #[test]
    fn tagged_serialization_names_the_kind() {
        let json = serde_json::to_value(FieldType::numeric(NumericKind::Integer)).unwrap();
        assert_eq!(json["type"], "numeric");
        assert_eq!(json["options"]["kind"], "integer");
    }
}
