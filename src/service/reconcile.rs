//! Bring the stored rows for one parent in line with a desired list.
//!
//! Identity between a desired item and a stored row is whatever the caller's
//! `compare` says. Each class of write is enabled by supplying its builder:
//! no delete builder, no deletes. An update whose payload every matching row
//! already holds is dropped from the plan, so a repeated run writes nothing.

use std::sync::Arc;

use futures::stream::{self, StreamExt, TryStreamExt};
use serde::Serialize;
use serde_json::Value;

use crate::coerce::{coerce_dates, DateFields};
use crate::config::DEFAULT_RECONCILE_CONCURRENCY;
use crate::error::AppError;
use crate::exec::Executor;
use crate::query::QuerySpec;
use crate::service::ops::{Ops, ReadOptions};

pub type CompareFn = Arc<dyn Fn(&Value, &Value) -> bool + Send + Sync>;
/// `(item, parent id)` to the filter for one write.
pub type QueryFn = Arc<dyn Fn(&Value, &Value) -> Result<QuerySpec, AppError> + Send + Sync>;
/// `(item, parent id)` to an insert payload.
pub type PayloadFn = Arc<dyn Fn(&Value, &Value) -> Value + Send + Sync>;
pub type TransformFn = Arc<dyn Fn(&Value) -> Value + Send + Sync>;
pub type CustomFn = Arc<dyn Fn(&CustomContext<'_>) -> Result<Vec<PendingWrite>, AppError> + Send + Sync>;

/// One write waiting to run against the reconciled table.
#[derive(Clone, Debug, PartialEq)]
pub enum PendingWrite {
    Delete(QuerySpec),
    Insert(Value),
    Update { data: Value, query: QuerySpec },
}

impl PendingWrite {
    pub fn action(&self) -> &'static str {
        match self {
            PendingWrite::Delete(_) => "delete",
            PendingWrite::Insert(_) => "insert",
            PendingWrite::Update { .. } => "update",
        }
    }
}

/// What the `custom` hook sees. It returns extra writes to run with the rest.
pub struct CustomContext<'a> {
    pub desired: &'a [Value],
    pub existing: &'a [Value],
    pub pending: &'a [PendingWrite],
}

/// Indexes into the desired (`insert`, `update`) and existing (`delete`) lists.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Diff {
    pub delete: Vec<usize>,
    pub insert: Vec<usize>,
    pub update: Vec<usize>,
}

/// Three-way split of `desired` against `existing` under `compare(desired, existing)`.
pub fn diff<F>(desired: &[Value], existing: &[Value], compare: F) -> Diff
where
    F: Fn(&Value, &Value) -> bool,
{
    let delete = existing
        .iter()
        .enumerate()
        .filter(|(_, e)| !desired.iter().any(|d| compare(d, *e)))
        .map(|(i, _)| i)
        .collect();
    let (update, insert): (Vec<usize>, Vec<usize>) = (0..desired.len())
        .partition(|&i| existing.iter().any(|e| compare(&desired[i], e)));
    Diff {
        delete,
        insert,
        update,
    }
}

/// Results of each write, by class, in plan order.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ReconcileReport {
    pub deleted: Vec<Value>,
    pub inserted: Vec<Value>,
    pub updated: Vec<Value>,
    pub custom: Vec<Value>,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        self.deleted.is_empty() && self.inserted.is_empty() && self.updated.is_empty() && self.custom.is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Slot {
    Planned,
    Custom,
}

pub struct Reconcile {
    ops: Ops,
    parent: Value,
    desired: Vec<Value>,
    get_query: QuerySpec,
    compare: CompareFn,
    del_query: Option<QueryFn>,
    add_query: Option<PayloadFn>,
    update_query: Option<QueryFn>,
    update_data: Option<TransformFn>,
    custom: Option<CustomFn>,
    concurrency: usize,
}

impl Reconcile {
    /// Reconcile `desired` against the rows `get_query` selects from `ops`' table.
    pub fn new<F>(ops: &Ops, parent: impl Into<Value>, desired: Vec<Value>, get_query: QuerySpec, compare: F) -> Self
    where
        F: Fn(&Value, &Value) -> bool + Send + Sync + 'static,
    {
        Reconcile {
            ops: ops.clone(),
            parent: parent.into(),
            desired,
            get_query,
            compare: Arc::new(compare),
            del_query: None,
            add_query: None,
            update_query: None,
            update_data: None,
            custom: None,
            concurrency: DEFAULT_RECONCILE_CONCURRENCY,
        }
    }

    pub fn delete_with<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value, &Value) -> Result<QuerySpec, AppError> + Send + Sync + 'static,
    {
        self.del_query = Some(Arc::new(f));
        self
    }

    pub fn insert_with<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value, &Value) -> Value + Send + Sync + 'static,
    {
        self.add_query = Some(Arc::new(f));
        self
    }

    pub fn update_with<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value, &Value) -> Result<QuerySpec, AppError> + Send + Sync + 'static,
    {
        self.update_query = Some(Arc::new(f));
        self
    }

    /// Payload transform for updates; without it the desired item is written as is.
    pub fn update_data<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value) -> Value + Send + Sync + 'static,
    {
        self.update_data = Some(Arc::new(f));
        self
    }

    pub fn custom<F>(mut self, f: F) -> Self
    where
        F: Fn(&CustomContext<'_>) -> Result<Vec<PendingWrite>, AppError> + Send + Sync + 'static,
    {
        self.custom = Some(Arc::new(f));
        self
    }

    pub fn date_fields(mut self, fields: DateFields) -> Self {
        self.ops = self.ops.with_date_fields(fields);
        self
    }

    /// Writes in flight at once; at least 1.
    pub fn concurrency(mut self, n: usize) -> Self {
        self.concurrency = n.max(1);
        self
    }

    /// Writes needed to turn `existing` into the desired list. Pure.
    pub fn plan(&self, existing: &[Value]) -> Result<Vec<PendingWrite>, AppError> {
        let d = diff(&self.desired, existing, |a, b| (self.compare)(a, b));
        let mut writes = Vec::new();
        if let Some(del_query) = &self.del_query {
            for &i in &d.delete {
                writes.push(PendingWrite::Delete(del_query(&existing[i], &self.parent)?));
            }
        }
        if let Some(add_query) = &self.add_query {
            for &i in &d.insert {
                writes.push(PendingWrite::Insert(add_query(&self.desired[i], &self.parent)));
            }
        }
        if let Some(update_query) = &self.update_query {
            for &i in &d.update {
                let item = &self.desired[i];
                let data = match &self.update_data {
                    Some(transform) => transform(item),
                    None => item.clone(),
                };
                if self.unchanged(item, &data, existing) {
                    continue;
                }
                writes.push(PendingWrite::Update {
                    data,
                    query: update_query(item, &self.parent)?,
                });
            }
        }
        Ok(writes)
    }

    /// Every stored row equivalent to `item` already carries each field of `data`.
    /// Dates are compared in their stored RFC 3339 form; the id column is never written.
    fn unchanged(&self, item: &Value, data: &Value, existing: &[Value]) -> bool {
        let options = self.ops.options();
        let fields = match coerce_dates(data, &options.date_fields) {
            Ok(Value::Object(fields)) => fields,
            _ => return false,
        };
        existing
            .iter()
            .filter(|row| (self.compare)(item, row))
            .all(|row| {
                fields
                    .iter()
                    .filter(|(k, _)| **k != options.id_name)
                    .all(|(k, v)| row.get(k) == Some(v))
            })
    }

    /// Fetch, plan, run every write with bounded concurrency. The first failure aborts the run.
    pub async fn run(&self, exec: &dyn Executor) -> Result<ReconcileReport, AppError> {
        let existing = self
            .ops
            .get(exec, &self.get_query, &ReadOptions::default())
            .await?
            .data;
        let planned = self.plan(&existing)?;
        let extra = match &self.custom {
            Some(custom) => custom(&CustomContext {
                desired: &self.desired,
                existing: &existing,
                pending: &planned,
            })?,
            None => Vec::new(),
        };
        tracing::debug!(
            table = %self.ops.table().name,
            existing = existing.len(),
            planned = planned.len(),
            custom = extra.len(),
            "reconcile plan"
        );

        let writes: Vec<(Slot, usize, PendingWrite)> = numbered(Slot::Planned, planned)
            .chain(numbered(Slot::Custom, extra))
            .collect();
        let mut done: Vec<(usize, Value)> = stream::iter(writes.iter().enumerate())
            .map(|(pos, (_, index, write))| async move {
                self.apply(exec, write)
                    .await
                    .map(|v| (pos, v))
                    .map_err(|e| AppError::WriteFailed {
                        action: write.action(),
                        index: *index,
                        source: Box::new(e),
                    })
            })
            .buffer_unordered(self.concurrency)
            .try_collect()
            .await?;
        done.sort_by_key(|(pos, _)| *pos);

        let mut report = ReconcileReport::default();
        for (pos, value) in done {
            let (slot, _, write) = &writes[pos];
            let bucket = match (slot, write) {
                (Slot::Custom, _) => &mut report.custom,
                (Slot::Planned, PendingWrite::Delete(_)) => &mut report.deleted,
                (Slot::Planned, PendingWrite::Insert(_)) => &mut report.inserted,
                (Slot::Planned, PendingWrite::Update { .. }) => &mut report.updated,
            };
            bucket.push(value);
        }
        Ok(report)
    }

    async fn apply(&self, exec: &dyn Executor, write: &PendingWrite) -> Result<Value, AppError> {
        match write {
            PendingWrite::Delete(query) => self.ops.del(exec, query).await,
            PendingWrite::Insert(data) => self.ops.add(exec, data).await,
            PendingWrite::Update { data, query } => self.ops.edit(exec, data, query).await,
        }
    }
}

/// Tag each write with its slot and its position among writes of the same action.
fn numbered(slot: Slot, writes: Vec<PendingWrite>) -> impl Iterator<Item = (Slot, usize, PendingWrite)> {
    let mut seen = [0usize; 3];
    writes.into_iter().map(move |w| {
        let k = match w {
            PendingWrite::Delete(_) => 0,
            PendingWrite::Insert(_) => 1,
            PendingWrite::Update { .. } => 2,
        };
        let index = seen[k];
        seen[k] += 1;
        (slot, index, w)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::config::OpOptions;
    use crate::exec::mock::{MockExecutor, Reply};
    use crate::sql::Table;
    use serde_json::json;

    fn same_k(d: &Value, e: &Value) -> bool {
        d["k"] == e["k"]
    }

    fn by_k(item: &Value, parent: &Value) -> Result<QuerySpec, AppError> {
        Ok(QuerySpec::new().filter("parentId", parent.clone()).filter("k", item["k"].clone()))
    }

    fn related_ops() -> Ops {
        Ops::new(
            Table::new("related"),
            OpOptions::new().id_generator(|| "gen".to_string()),
        )
    }

    fn full(desired: Vec<Value>) -> Reconcile {
        Reconcile::new(
            &related_ops(),
            "p1",
            desired,
            QuerySpec::new().filter("parentId", "p1"),
            same_k,
        )
        .delete_with(by_k)
        .insert_with(|item, parent| {
            let mut row = item.clone();
            row["parentId"] = parent.clone();
            row
        })
        .update_with(by_k)
    }

    /// An in-memory table keyed by `k`, driven through the SQL the ops emit.
    struct Store {
        rows: Mutex<Vec<Value>>,
    }

    impl Store {
        fn executor(rows: Vec<Value>) -> (Arc<Store>, MockExecutor) {
            let store = Arc::new(Store {
                rows: Mutex::new(rows),
            });
            let s = Arc::clone(&store);
            // Items are `{"k": int, "v": int}`, so `k` and `v` are the only bound parameters.
            let exec = MockExecutor::new(move |q| {
                let mut rows = s.rows.lock().unwrap();
                let ints: Vec<i64> = q
                    .params
                    .iter()
                    .filter_map(|p| match p {
                        crate::sql::PgBindValue::I64(n) => Some(*n),
                        _ => None,
                    })
                    .collect();
                Ok(if q.sql.starts_with("SELECT") {
                    Reply::Rows(rows.clone())
                } else if q.sql.starts_with("DELETE") {
                    rows.retain(|r| r["k"] != json!(ints[0]));
                    Reply::Affected(1)
                } else if q.sql.starts_with("INSERT") {
                    rows.push(json!({"k": ints[0], "v": ints[1]}));
                    Reply::Rows(vec![json!({})])
                } else {
                    for r in rows.iter_mut().filter(|r| r["k"] == json!(ints[0])) {
                        r["v"] = json!(ints[1]);
                    }
                    Reply::Affected(1)
                })
            });
            (store, exec)
        }
    }

    // ==================== Planning ====================

    #[test]
    fn test_diff_worked_example() {
        let desired = vec![json!({"k": 1, "v": "a"}), json!({"k": 2, "v": "b"})];
        let existing = vec![json!({"k": 2, "v": "x"}), json!({"k": 3, "v": "y"})];
        let d = diff(&desired, &existing, same_k);
        assert_eq!(d.delete, vec![1]);
        assert_eq!(d.insert, vec![0]);
        assert_eq!(d.update, vec![1]);

        let writes = full(desired).plan(&existing).unwrap();
        assert_eq!(
            writes,
            vec![
                PendingWrite::Delete(by_k(&json!({"k": 3}), &json!("p1")).unwrap()),
                PendingWrite::Insert(json!({"k": 1, "v": "a", "parentId": "p1"})),
                PendingWrite::Update {
                    data: json!({"k": 2, "v": "b"}),
                    query: by_k(&json!({"k": 2}), &json!("p1")).unwrap(),
                },
            ]
        );
    }

    #[test]
    fn test_missing_builders_disable_classes() {
        let desired = vec![json!({"k": 1})];
        let existing = vec![json!({"k": 2})];
        let only_insert = Reconcile::new(&related_ops(), "p1", desired, QuerySpec::new(), same_k)
            .insert_with(|item, _| item.clone());
        assert_eq!(
            only_insert.plan(&existing).unwrap(),
            vec![PendingWrite::Insert(json!({"k": 1}))]
        );
    }

    #[test]
    fn test_update_data_transform() {
        let r = Reconcile::new(&related_ops(), "p1", vec![json!({"k": 1, "tmp": true})], QuerySpec::new(), same_k)
            .update_with(by_k)
            .update_data(|item| json!({"k": item["k"], "seen": true}));
        match &r.plan(&[json!({"k": 1})]).unwrap()[0] {
            PendingWrite::Update { data, .. } => assert_eq!(data, &json!({"k": 1, "seen": true})),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_update_already_held_is_skipped() {
        let desired = vec![json!({"k": 1, "v": "a"}), json!({"k": 2, "v": "b"})];
        let existing = vec![json!({"id": "r1", "k": 1, "v": "a", "extra": 0}), json!({"k": 2, "v": "x"})];
        let r = Reconcile::new(&related_ops(), "p1", desired, QuerySpec::new(), same_k).update_with(by_k);
        let writes = r.plan(&existing).unwrap();
        assert_eq!(writes.len(), 1);
        assert!(matches!(&writes[0], PendingWrite::Update { data, .. } if data["k"] == json!(2)));
    }

    #[test]
    fn test_unchanged_compares_stored_dates() {
        let desired = vec![json!({"k": 1, "due": "2024-01-01"})];
        let existing = vec![json!({"k": 1, "due": "2024-01-01T00:00:00.000Z"})];
        let r = Reconcile::new(&related_ops(), "p1", desired, QuerySpec::new(), same_k)
            .update_with(by_k)
            .date_fields(DateFields::from_list(["due"]));
        assert!(r.plan(&existing).unwrap().is_empty());
    }

    // ==================== Running ====================

    #[tokio::test]
    async fn test_run_reports_each_class() {
        let (store, exec) = Store::executor(vec![json!({"k": 2, "v": 99}), json!({"k": 3, "v": 30})]);
        let desired = vec![json!({"k": 1, "v": 10}), json!({"k": 2, "v": 20})];
        let report = full(desired).concurrency(2).run(&exec).await.unwrap();
        assert_eq!(report.deleted, vec![Value::Null]);
        assert_eq!(report.inserted, vec![json!("gen")]);
        assert_eq!(report.updated, vec![Value::Null]);
        assert!(report.custom.is_empty());

        let rows = store.rows.lock().unwrap().clone();
        assert_eq!(rows.len(), 2);
        assert!(rows.contains(&json!({"k": 1, "v": 10})) && rows.contains(&json!({"k": 2, "v": 20})));
        assert!(exec
            .statements()
            .contains(&"DELETE FROM \"related\" WHERE (\"parentId\" = 'p1' AND \"k\" = $1)".to_string()));
    }

    #[tokio::test]
    async fn test_second_run_with_updates_writes_nothing() {
        let (_store, exec) = Store::executor(vec![json!({"k": 2, "v": 99}), json!({"k": 3, "v": 30})]);
        let desired = vec![json!({"k": 1, "v": 10}), json!({"k": 2, "v": 20})];
        let first = full(desired.clone()).run(&exec).await.unwrap();
        assert_eq!(first.updated.len(), 1);
        let before = exec.statements().len();
        let second = full(desired).run(&exec).await.unwrap();
        assert!(second.is_noop());
        assert_eq!(exec.statements().len(), before + 1);
    }

    #[tokio::test]
    async fn test_second_run_is_idempotent() {
        let (_store, exec) = Store::executor(vec![json!({"k": 3, "v": 30})]);
        let desired = vec![json!({"k": 1, "v": 10})];
        let reconcile = || {
            Reconcile::new(&related_ops(), "p1", desired.clone(), QuerySpec::new(), same_k)
                .delete_with(by_k)
                .insert_with(|item, _| item.clone())
        };
        let first = reconcile().run(&exec).await.unwrap();
        assert_eq!((first.deleted.len(), first.inserted.len()), (1, 1));
        let before = exec.statements().len();
        let second = reconcile().run(&exec).await.unwrap();
        assert!(second.is_noop());
        // Only the read of current rows.
        assert_eq!(exec.statements().len(), before + 1);
    }

    #[tokio::test]
    async fn test_custom_writes_run_with_the_rest() {
        let exec = MockExecutor::new(|q| {
            Ok(if q.sql.starts_with("SELECT") {
                Reply::Rows(vec![json!({"k": 1})])
            } else {
                Reply::Affected(4)
            })
        });
        let report = Reconcile::new(&related_ops(), "p1", vec![json!({"k": 1})], QuerySpec::new(), same_k)
            .custom(|ctx| {
                assert_eq!(ctx.existing.len(), 1);
                assert!(ctx.pending.is_empty());
                Ok(vec![PendingWrite::Delete(QuerySpec::new().filter("stale", true))])
            })
            .run(&exec)
            .await
            .unwrap();
        assert_eq!(report.custom, vec![Value::Null]);
        assert!(report.deleted.is_empty());
    }

    #[tokio::test]
    async fn test_failure_names_the_write() {
        let exec = MockExecutor::new(|q| {
            if q.sql.starts_with("SELECT") {
                Ok(Reply::Rows(vec![json!({"k": 2})]))
            } else {
                Err(AppError::Db(sqlx::Error::RowNotFound))
            }
        });
        let err = full(vec![json!({"k": 2, "v": "b"})]).run(&exec).await.unwrap_err();
        match err {
            AppError::WriteFailed { action, index, .. } => {
                assert_eq!(action, "update");
                assert_eq!(index, 0);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
