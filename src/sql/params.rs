//! Convert serde_json::Value to types that sqlx can bind.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgArguments, Postgres};
use sqlx::query::Query;

use crate::error::AppError;

/// A value that can be bound to a PostgreSQL query. Converts from serde_json::Value.
#[derive(Clone, Debug, PartialEq)]
pub enum PgBindValue {
    Null,
    Bool(bool),
    I64(i64),
    F64(f64),
    String(String),
    Timestamp(DateTime<Utc>),
    Json(Value),
}

impl PgBindValue {
    pub fn from_json(v: &Value) -> Self {
        match v {
            Value::Null => PgBindValue::Null,
            Value::Bool(b) => PgBindValue::Bool(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    PgBindValue::I64(i)
                } else {
                    PgBindValue::F64(n.as_f64().unwrap_or(0.0))
                }
            }
            Value::String(s) => PgBindValue::String(s.clone()),
            Value::Array(_) | Value::Object(_) => PgBindValue::Json(v.clone()),
        }
    }

    /// Bind a value written to a date column. Strings must already be RFC 3339 (see `coerce`).
    pub fn timestamp_from_json(column: &str, v: &Value) -> Result<Self, AppError> {
        match v {
            Value::Null => Ok(PgBindValue::Null),
            Value::String(s) => DateTime::parse_from_rfc3339(s)
                .map(|d| PgBindValue::Timestamp(d.with_timezone(&Utc)))
                .map_err(|e| AppError::validation(format!("{} has invalid timestamp: {}", column, e))),
            other => Err(AppError::validation(format!(
                "{} expected timestamp string, got {}",
                column, other
            ))),
        }
    }
}

/// Bind one parameter with its concrete PostgreSQL type.
pub fn bind_param<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: &'q PgBindValue,
) -> Query<'q, Postgres, PgArguments> {
    match value {
        PgBindValue::Null => query.bind(None::<i32>),
        PgBindValue::Bool(b) => query.bind(*b),
        PgBindValue::I64(n) => query.bind(*n),
        PgBindValue::F64(n) => query.bind(*n),
        PgBindValue::String(s) => query.bind(s.as_str()),
        PgBindValue::Timestamp(d) => query.bind(*d),
        PgBindValue::Json(v) => query.bind(v),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_json_numbers() {
        assert_eq!(PgBindValue::from_json(&json!(7)), PgBindValue::I64(7));
        assert_eq!(PgBindValue::from_json(&json!(1.5)), PgBindValue::F64(1.5));
        assert_eq!(PgBindValue::from_json(&json!({"a": 1})), PgBindValue::Json(json!({"a": 1})));
    }

    #[test]
    fn test_timestamp_from_json() {
        let v = PgBindValue::timestamp_from_json("createTime", &json!("2024-01-01T00:00:00.000Z")).unwrap();
        match v {
            PgBindValue::Timestamp(d) => assert_eq!(d.to_rfc3339(), "2024-01-01T00:00:00+00:00"),
            other => panic!("unexpected {:?}", other),
        }
        let err = PgBindValue::timestamp_from_json("createTime", &json!(true)).unwrap_err();
        assert!(err.to_string().contains("createTime"));
    }
}
