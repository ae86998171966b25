//! QuerySpec: the flat request-query object split into reserved keys and plain filters.

use serde_json::{Map, Value};

use crate::error::AppError;
use crate::sql::{parse_where, Columns, ConditionNode, Direction};

pub const PAGE_SIZE_KEY: &str = "pageSize";
pub const PAGE_KEY: &str = "page";
pub const FIELDS_KEY: &str = "_fs";
pub const ORDER_KEY: &str = "_ob";
pub const ID_KEY: &str = "id";
pub const WHERE_KEY: &str = "_where";
pub const GET_ONE_KEY: &str = "_getone";

/// Largest page size or page number; LIMIT and OFFSET are `bigint`.
pub const MAX_PAGE_VALUE: u64 = i64::MAX as u64;

/// Id shorthand: a comma list becomes a membership test.
#[derive(Clone, Debug, PartialEq)]
pub enum IdFilter {
    Eq(Value),
    In(Vec<String>),
}

impl IdFilter {
    /// `None` for null or blank ids.
    pub fn from_value(v: &Value) -> Result<Option<IdFilter>, AppError> {
        match v {
            Value::Null => Ok(None),
            Value::String(s) if s.trim().is_empty() => Ok(None),
            Value::String(s) if s.contains(',') => {
                let ids: Vec<String> = s
                    .split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(String::from)
                    .collect();
                if ids.len() > 1 {
                    Ok(Some(IdFilter::In(ids)))
                } else {
                    Ok(ids.into_iter().next().map(|id| IdFilter::Eq(Value::String(id))))
                }
            }
            Value::String(_) | Value::Number(_) => Ok(Some(IdFilter::Eq(v.clone()))),
            other => Err(AppError::config(format!("id must be a string or number, got {}", other))),
        }
    }

    /// The id as the caller passed it.
    pub fn raw(&self) -> Value {
        match self {
            IdFilter::Eq(v) => v.clone(),
            IdFilter::In(ids) => Value::String(ids.join(",")),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct QuerySpec {
    pub page_size: Option<u64>,
    pub page: Option<u64>,
    pub columns: Columns,
    /// `None` leaves the table's default ordering in force.
    pub order_by: Option<Vec<(String, Direction)>>,
    pub id: Option<IdFilter>,
    pub condition: Vec<ConditionNode>,
    /// Plain equality filters, ANDed.
    pub filters: Vec<(String, Value)>,
    pub get_one: bool,
}

impl QuerySpec {
    pub fn new() -> Self {
        QuerySpec::default()
    }

    /// Split a request object into reserved keys and plain filters.
    pub fn from_map(map: &Map<String, Value>) -> Result<Self, AppError> {
        let mut spec = QuerySpec::new();
        for (k, v) in map {
            match k.as_str() {
                PAGE_SIZE_KEY => spec.page_size = positive_int(k, v)?,
                PAGE_KEY => spec.page = positive_int(k, v)?,
                FIELDS_KEY => spec.columns = parse_columns(v)?,
                ORDER_KEY => spec.order_by = parse_order(v)?,
                ID_KEY => spec.id = IdFilter::from_value(v)?,
                WHERE_KEY => {
                    if !is_blank(v) {
                        spec.condition = parse_where(v)?;
                    }
                }
                GET_ONE_KEY => spec.get_one = truthy(v),
                _ => {
                    if v.is_array() || v.is_object() {
                        return Err(AppError::config(format!("filter {} must be a scalar", k)));
                    }
                    spec.filters.push((k.clone(), v.clone()));
                }
            }
        }
        Ok(spec)
    }

    /// From a decoded URL query string, in the order the pairs were written; every value arrives as text.
    pub fn from_params(params: &[(String, String)]) -> Result<Self, AppError> {
        let map: Map<String, Value> = params
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        QuerySpec::from_map(&map)
    }

    pub fn from_value(v: &Value) -> Result<Self, AppError> {
        match v {
            Value::Null => Ok(QuerySpec::new()),
            Value::Object(map) => QuerySpec::from_map(map),
            other => Err(AppError::config(format!("query must be an object, got {}", other))),
        }
    }

    pub fn filter(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push((column.into(), value.into()));
        self
    }

    pub fn with_id(mut self, id: impl Into<Value>) -> Result<Self, AppError> {
        self.id = IdFilter::from_value(&id.into())?;
        Ok(self)
    }

    pub fn order(mut self, column: impl Into<String>, direction: Direction) -> Self {
        self.order_by.get_or_insert_with(Vec::new).push((column.into(), direction));
        self
    }

    pub fn paged(mut self, page_size: u64, page: u64) -> Self {
        self.page_size = Some(page_size.min(MAX_PAGE_VALUE)).filter(|n| *n > 0);
        self.page = Some(page.min(MAX_PAGE_VALUE)).filter(|n| *n > 0);
        self
    }

    pub fn with_where(mut self, tree: &Value) -> Result<Self, AppError> {
        self.condition = parse_where(tree)?;
        Ok(self)
    }

    /// No id, no condition tree, no plain filter: a write over this would touch every row.
    pub fn is_unconditioned(&self) -> bool {
        self.id.is_none() && self.condition.is_empty() && self.filters.is_empty()
    }

    /// Page window, when both halves are set.
    pub fn window(&self) -> Option<(u64, u64)> {
        match (self.page_size, self.page) {
            (Some(size), Some(page)) => Some((size, page)),
            _ => None,
        }
    }
}

fn is_blank(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !matches!(s.trim(), "" | "0" | "false"),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Zero, null and blank mean "not set".
fn positive_int(key: &str, v: &Value) -> Result<Option<u64>, AppError> {
    let bad = || {
        AppError::config(format!(
            "{} must be an integer between 0 and {}, got {}",
            key, MAX_PAGE_VALUE, v
        ))
    };
    let n = match v {
        Value::Null => return Ok(None),
        Value::Number(n) => n.as_u64().ok_or_else(bad)?,
        Value::String(s) if s.trim().is_empty() => return Ok(None),
        Value::String(s) => s.trim().parse::<u64>().map_err(|_| bad())?,
        _ => return Err(bad()),
    };
    if n > MAX_PAGE_VALUE {
        return Err(bad());
    }
    Ok(Some(n).filter(|n| *n > 0))
}

fn parse_columns(v: &Value) -> Result<Columns, AppError> {
    match v {
        Value::Null => Ok(Columns::All),
        Value::String(s) => Ok(Columns::parse(s)),
        Value::Array(items) => {
            let mut list = Vec::with_capacity(items.len());
            for item in items {
                let s = item
                    .as_str()
                    .ok_or_else(|| AppError::config(format!("_fs entries must be strings, got {}", item)))?;
                list.push(s);
            }
            Ok(Columns::parse(&list.join(",")))
        }
        other => Err(AppError::config(format!("_fs must be a string or array, got {}", other))),
    }
}

fn parse_order(v: &Value) -> Result<Option<Vec<(String, Direction)>>, AppError> {
    match v {
        Value::Null => Ok(None),
        Value::String(s) if s.trim().is_empty() => Ok(None),
        Value::String(s) => {
            let parsed: Value = serde_json::from_str(s)
                .map_err(|e| AppError::config(format!("malformed _ob: {}", e)))?;
            parse_order(&parsed)
        }
        Value::Object(map) => {
            let mut terms = Vec::with_capacity(map.len());
            for (column, dir) in map {
                terms.push((column.clone(), direction(column, dir)?));
            }
            Ok(Some(terms))
        }
        other => Err(AppError::config(format!("_ob must be an object, got {}", other))),
    }
}

fn direction(column: &str, v: &Value) -> Result<Direction, AppError> {
    let asc = match v {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "asc" | "true" | "1" => true,
            "desc" | "false" | "0" => false,
            _ => return Err(AppError::config(format!("bad _ob direction for {}: {}", column, s))),
        },
        other => return Err(AppError::config(format!("bad _ob direction for {}: {}", column, other))),
    };
    Ok(if asc { Direction::Asc } else { Direction::Desc })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec(v: Value) -> Result<QuerySpec, AppError> {
        QuerySpec::from_value(&v)
    }

    #[test]
    fn test_reserved_keys_are_separated() {
        let s = spec(json!({
            "pageSize": "10",
            "page": 2,
            "_fs": "id,name",
            "_ob": {"displayorder": true, "name": false},
            "id": "a",
            "_where": "[{\"whereNull\": \"checker\"}]",
            "status": "1"
        }))
        .unwrap();
        assert_eq!(s.window(), Some((10, 2)));
        assert_eq!(s.columns, Columns::List(vec!["id".into(), "name".into()]));
        assert_eq!(
            s.order_by,
            Some(vec![("displayorder".into(), Direction::Asc), ("name".into(), Direction::Desc)])
        );
        assert_eq!(s.id, Some(IdFilter::Eq(json!("a"))));
        assert_eq!(s.condition.len(), 1);
        assert_eq!(s.filters, vec![("status".to_string(), json!("1"))]);
    }

    #[test]
    fn test_id_comma_list() {
        let s = spec(json!({"id": "a,b,c"})).unwrap();
        assert_eq!(s.id, Some(IdFilter::In(vec!["a".into(), "b".into(), "c".into()])));
        assert_eq!(s.id.unwrap().raw(), json!("a,b,c"));
        assert_eq!(spec(json!({"id": "a,"})).unwrap().id, Some(IdFilter::Eq(json!("a"))));
        assert_eq!(spec(json!({"id": ""})).unwrap().id, None);
    }

    #[test]
    fn test_page_needs_both_halves() {
        assert_eq!(spec(json!({"pageSize": 10})).unwrap().window(), None);
        assert_eq!(spec(json!({"pageSize": 10, "page": 0})).unwrap().window(), None);
        assert!(spec(json!({"pageSize": "ten", "page": 1})).is_err());
    }

    #[test]
    fn test_page_values_capped_at_bigint() {
        let max = i64::MAX.to_string();
        let s = spec(json!({"pageSize": max, "page": 1})).unwrap();
        assert_eq!(s.window(), Some((MAX_PAGE_VALUE, 1)));
        let err = spec(json!({"pageSize": "9223372036854775808", "page": 1})).unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
        assert!(spec(json!({"page": u64::MAX})).is_err());
        assert_eq!(QuerySpec::new().paged(u64::MAX, 1).window(), Some((MAX_PAGE_VALUE, 1)));
    }

    #[test]
    fn test_order_from_query_string() {
        let params = vec![
            ("_ob".to_string(), "{\"createTime\": false}".to_string()),
            ("_getone".to_string(), "1".to_string()),
        ];
        let s = QuerySpec::from_params(&params).unwrap();
        assert_eq!(s.order_by, Some(vec![("createTime".into(), Direction::Desc)]));
        assert!(s.get_one);
    }

    #[test]
    fn test_order_keeps_written_key_order() {
        let s = spec(json!({"_ob": {"rank": true, "createTime": false}})).unwrap();
        assert_eq!(
            s.order_by,
            Some(vec![("rank".into(), Direction::Asc), ("createTime".into(), Direction::Desc)])
        );
        let params = vec![("_ob".to_string(), "{\"rank\": true, \"createTime\": false}".to_string())];
        let s = QuerySpec::from_params(&params).unwrap();
        assert_eq!(
            s.order_by,
            Some(vec![("rank".into(), Direction::Asc), ("createTime".into(), Direction::Desc)])
        );
    }

    #[test]
    fn test_where_never_reaches_filters() {
        let s = spec(json!({"_where": {"whereIn": ["a", [1]]}})).unwrap();
        assert!(s.filters.is_empty());
        assert!(!s.is_unconditioned());
        assert!(spec(json!({"_where": ""})).unwrap().is_unconditioned());
    }

    #[test]
    fn test_malformed_where_is_config_error() {
        let err = spec(json!({"_where": "{oops"})).unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }

    #[test]
    fn test_structured_filter_value_rejected() {
        assert!(spec(json!({"status": [1, 2]})).is_err());
    }

    #[test]
    fn test_fields_as_array() {
        let s = spec(json!({"_fs": ["project_status.*", "datatype.name"]})).unwrap();
        assert_eq!(
            s.columns,
            Columns::List(vec!["project_status.*".into(), "datatype.name".into()])
        );
    }
}
