//! Field coercion over JSON payloads: date normalisation by key, null pruning.

use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde_json::{Map, Value};

use crate::error::AppError;

/// Names of fields whose values are dates. Matched by key at any depth.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DateFields(BTreeSet<String>);

impl DateFields {
    pub fn from_list<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        DateFields(
            names
                .into_iter()
                .map(Into::into)
                .map(|s: String| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        )
    }

    /// Comma-separated list, e.g. `"createTime,updateTime"`.
    pub fn parse(s: &str) -> Self {
        DateFields::from_list(s.split(','))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains(name)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Return a copy of `value` with every scalar under a date key normalised to RFC 3339 UTC.
pub fn coerce_dates(value: &Value, dates: &DateFields) -> Result<Value, AppError> {
    if dates.is_empty() {
        return Ok(value.clone());
    }
    walk(value, dates, None)
}

fn walk(value: &Value, dates: &DateFields, key: Option<&str>) -> Result<Value, AppError> {
    match value {
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), walk(v, dates, Some(k))?);
            }
            Ok(Value::Object(out))
        }
        // Array elements inherit no key.
        Value::Array(items) => items
            .iter()
            .map(|i| walk(i, dates, None))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Null => Ok(Value::Null),
        scalar => match key {
            Some(k) if dates.contains(k) => normalize_date(k, scalar).map(Value::String),
            _ => Ok(scalar.clone()),
        },
    }
}

fn normalize_date(field: &str, v: &Value) -> Result<String, AppError> {
    let parsed = match v {
        Value::String(s) => parse_date_str(s.trim()),
        Value::Number(n) => n.as_i64().and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        _ => None,
    };
    parsed
        .map(|d| d.to_rfc3339_opts(SecondsFormat::Millis, true))
        .ok_or_else(|| AppError::validation(format!("{} is not a valid date: {}", field, v)))
}

fn parse_date_str(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(d) = DateTime::parse_from_rfc3339(s) {
        return Some(d.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M"] {
        if let Ok(d) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(d.and_utc());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|d| d.and_utc())
}

/// Drop null members recursively. Objects and arrays left empty become `None`.
pub fn prune_nulls(value: &Value) -> Option<Value> {
    match value {
        Value::Null => None,
        Value::Object(map) => {
            let out: Map<String, Value> = map
                .iter()
                .filter_map(|(k, v)| prune_nulls(v).map(|v| (k.clone(), v)))
                .collect();
            if out.is_empty() {
                None
            } else {
                Some(Value::Object(out))
            }
        }
        Value::Array(items) => {
            if items.is_empty() {
                return None;
            }
            Some(Value::Array(
                items.iter().map(|i| prune_nulls(i).unwrap_or(Value::Null)).collect(),
            ))
        }
        other => Some(other.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_only_date_fields_are_normalised() {
        let dates = DateFields::from_list(["createTime"]);
        let input = json!({"createTime": "2024-01-01", "name": "x"});
        let out = coerce_dates(&input, &dates).unwrap();
        assert_eq!(out, json!({"createTime": "2024-01-01T00:00:00.000Z", "name": "x"}));
        assert_eq!(input, json!({"createTime": "2024-01-01", "name": "x"}));
    }

    #[test]
    fn test_nested_objects_and_arrays() {
        let dates = DateFields::parse("createTime, updateTime");
        let input = json!({
            "rows": [
                {"createTime": "2024-03-05 10:20:30", "code": "a"},
                {"updateTime": 0, "code": "b"}
            ],
            "createTime": null
        });
        let out = coerce_dates(&input, &dates).unwrap();
        assert_eq!(out["rows"][0]["createTime"], json!("2024-03-05T10:20:30.000Z"));
        assert_eq!(out["rows"][1]["updateTime"], json!("1970-01-01T00:00:00.000Z"));
        assert_eq!(out["rows"][1]["code"], json!("b"));
        assert_eq!(out["createTime"], Value::Null);
    }

    #[test]
    fn test_offset_is_converted_to_utc() {
        let dates = DateFields::from_list(["at"]);
        let out = coerce_dates(&json!({"at": "2024-01-01T08:00:00+08:00"}), &dates).unwrap();
        assert_eq!(out["at"], json!("2024-01-01T00:00:00.000Z"));
    }

    #[test]
    fn test_empty_field_set_is_noop() {
        let input = json!({"createTime": "not a date"});
        assert_eq!(coerce_dates(&input, &DateFields::default()).unwrap(), input);
    }

    #[test]
    fn test_invalid_date_is_validation_error() {
        let dates = DateFields::from_list(["createTime"]);
        let err = coerce_dates(&json!({"createTime": "yesterday"}), &dates).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn test_prune_nulls() {
        let input = json!({"a": null, "b": {"c": null}, "d": [1, null], "e": "x"});
        assert_eq!(prune_nulls(&input), Some(json!({"d": [1, null], "e": "x"})));
        assert_eq!(prune_nulls(&json!({"a": null})), None);
        assert_eq!(prune_nulls(&json!([])), None);
    }
}
