//! Apply a QuerySpec to a SELECT under construction.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::error::AppError;
use crate::query::spec::{IdFilter, QuerySpec};
use crate::sql::{apply_nodes, Connector, SelectQuery, WhereList};

/// Caller hook run on the query after the `_where` tree, before id and plain filters.
pub type ScopeFn = Arc<dyn Fn(&mut SelectQuery) -> Result<(), AppError> + Send + Sync>;

#[derive(Clone)]
pub struct InterpretOptions {
    pub id_name: String,
    pub wh: Option<ScopeFn>,
}

impl Default for InterpretOptions {
    fn default() -> Self {
        InterpretOptions {
            id_name: "id".into(),
            wh: None,
        }
    }
}

impl fmt::Debug for InterpretOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterpretOptions")
            .field("id_name", &self.id_name)
            .field("wh", &self.wh.is_some())
            .finish()
    }
}

impl InterpretOptions {
    pub fn new(id_name: impl Into<String>) -> Self {
        InterpretOptions {
            id_name: id_name.into(),
            wh: None,
        }
    }

    pub fn scoped<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut SelectQuery) -> Result<(), AppError> + Send + Sync + 'static,
    {
        self.wh = Some(Arc::new(f));
        self
    }
}

/// Filter, order and scope `base` by `spec`. Columns and the page window are left to `projection`.
pub fn interpret(
    mut base: SelectQuery,
    spec: &QuerySpec,
    opts: &InterpretOptions,
) -> Result<SelectQuery, AppError> {
    // Parenthesised so a top-level `orWhere` cannot escape the filters added below.
    let mut tree = WhereList::new();
    apply_nodes(&mut tree, &spec.condition)?;
    base.filter_mut().group(Connector::And, false, tree);

    if let Some(wh) = &opts.wh {
        wh(&mut base)?;
    }

    match &spec.id {
        Some(IdFilter::In(ids)) => {
            let values: Vec<Value> = ids.iter().cloned().map(Value::String).collect();
            base.filter_mut()
                .within(Connector::And, false, &opts.id_name, &values)?;
        }
        Some(IdFilter::Eq(id)) => {
            base.filter_mut()
                .compare(Connector::And, false, &opts.id_name, "=", id)?;
        }
        None => {}
    }

    if let Some(order) = &spec.order_by {
        for (column, direction) in order {
            base.order_by(column, *direction)?;
        }
    }

    if !spec.filters.is_empty() {
        base.filter_mut().equals(Connector::And, false, &spec.filters)?;
    }
    Ok(base)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::{Direction, PgBindValue, Table};
    use serde_json::json;

    fn run(q: Value, opts: &InterpretOptions) -> Result<(String, Vec<PgBindValue>), AppError> {
        let spec = QuerySpec::from_value(&q)?;
        let base = SelectQuery::from_table(Table::new("project"));
        let buf = interpret(base, &spec, opts)?.to_select()?;
        Ok((buf.sql, buf.params))
    }

    #[test]
    fn test_plain_equality_is_conjunction() {
        let (sql, params) = run(json!({"status": "1", "rank": 2}), &InterpretOptions::default()).unwrap();
        assert_eq!(
            sql,
            "SELECT * FROM \"project\" WHERE (\"status\" = '1' AND \"rank\" = $1)"
        );
        assert_eq!(params, vec![PgBindValue::I64(2)]);
    }

    #[test]
    fn test_id_membership_vs_equality() {
        let opts = InterpretOptions::new("projectId");
        let (sql, params) = run(json!({"id": "a,b,c"}), &opts).unwrap();
        assert_eq!(
            sql,
            "SELECT * FROM \"project\" WHERE \"projectId\" IN ('a', 'b', 'c')"
        );
        assert!(params.is_empty());

        let (sql, _) = run(json!({"id": "a"}), &opts).unwrap();
        assert_eq!(sql, "SELECT * FROM \"project\" WHERE \"projectId\" = 'a'");
    }

    #[test]
    fn test_steps_apply_in_order() {
        let opts = InterpretOptions::default().scoped(|q| {
            q.filter_mut().is_null(Connector::And, false, "deletedAt")
        });
        let (sql, _) = run(
            json!({
                "_where": [{"whereIn": ["status", ["0", "2"]]}],
                "id": "p1",
                "_ob": {"displayorder": true},
                "name": "x"
            }),
            &opts,
        )
        .unwrap();
        assert_eq!(
            sql,
            "SELECT * FROM \"project\" WHERE (\"status\" IN ('0', '2')) AND \"deletedAt\" IS NULL \
             AND \"id\" = 'p1' AND \"name\" = 'x' ORDER BY \"displayorder\" ASC"
        );
    }

    #[test]
    fn test_top_level_or_stays_inside_the_tree() {
        let opts = InterpretOptions::default().scoped(|q| {
            q.filter_mut().is_null(Connector::And, false, "deletedAt")
        });
        let (sql, params) = run(
            json!({"_where": [{"where": {"a": 1}}, {"orWhere": {"b": 2}}], "id": "x"}),
            &opts,
        )
        .unwrap();
        assert_eq!(
            sql,
            "SELECT * FROM \"project\" WHERE (\"a\" = $1 OR \"b\" = $2) AND \"deletedAt\" IS NULL AND \"id\" = 'x'"
        );
        assert_eq!(params, vec![PgBindValue::I64(1), PgBindValue::I64(2)]);
    }

    #[test]
    fn test_order_only() {
        let spec = QuerySpec::new().order("a", Direction::Desc).order("b", Direction::Asc);
        let q = interpret(
            SelectQuery::from_table(Table::new("t")),
            &spec,
            &InterpretOptions::default(),
        )
        .unwrap();
        assert!(!q.has_filter());
        assert_eq!(
            q.to_select().unwrap().sql,
            "SELECT * FROM \"t\" ORDER BY \"a\" DESC, \"b\" ASC"
        );
    }

    #[test]
    fn test_scope_error_propagates() {
        let opts = InterpretOptions::default().scoped(|_| Err(AppError::validation("no scope")));
        assert!(matches!(run(json!({}), &opts), Err(AppError::Validation(_))));
    }
}
