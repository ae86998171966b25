//! Generic CRUD over one table: reads through the interpreter, guarded writes.

use std::borrow::Cow;

use serde_json::{Map, Value};

use crate::coerce::{coerce_dates, DateFields};
use crate::config::{OpOptions, WriteOutcome};
use crate::error::AppError;
use crate::exec::Executor;
use crate::projection::{fetch, read_total, FetchMode, Fetched, Page};
use crate::query::{interpret, IdFilter, InterpretOptions, QuerySpec, ScopeFn};
use crate::sql::{insert, Direction, SelectQuery, Table};

/// Per-call read overrides.
#[derive(Clone, Default)]
pub struct ReadOptions {
    /// Extra scoping run after the `_where` tree.
    pub wh: Option<ScopeFn>,
    /// Replaces the table's default ordering when the call has no `_ob`.
    pub order_by: Option<Vec<(String, Direction)>>,
}

impl ReadOptions {
    pub fn scoped<F>(f: F) -> Self
    where
        F: Fn(&mut SelectQuery) -> Result<(), AppError> + Send + Sync + 'static,
    {
        ReadOptions {
            wh: Some(std::sync::Arc::new(f)),
            order_by: None,
        }
    }
}

/// A table bound to its [`OpOptions`].
#[derive(Clone, Debug)]
pub struct Ops {
    table: Table,
    options: OpOptions,
}

impl Ops {
    pub fn new(table: Table, options: OpOptions) -> Self {
        Ops { table, options }
    }

    pub fn table(&self) -> &Table {
        &self.table
    }

    pub fn options(&self) -> &OpOptions {
        &self.options
    }

    /// Same table, different date fields.
    pub fn with_date_fields(&self, fields: DateFields) -> Self {
        Ops {
            table: self.table.clone(),
            options: self.options.clone().date_fields(fields),
        }
    }

    fn interpret_options(&self, read: &ReadOptions) -> InterpretOptions {
        InterpretOptions {
            id_name: self.options.id_name.clone(),
            wh: read.wh.clone(),
        }
    }

    /// Fill in the default ordering unless the call brought its own.
    fn ordered<'a>(&self, spec: &'a QuerySpec, read: &ReadOptions) -> Cow<'a, QuerySpec> {
        if spec.order_by.is_some() {
            return Cow::Borrowed(spec);
        }
        let default = read.order_by.as_ref().unwrap_or(&self.options.order_by);
        if default.is_empty() {
            return Cow::Borrowed(spec);
        }
        let mut owned = spec.clone();
        owned.order_by = Some(default.clone());
        Cow::Owned(owned)
    }

    /// The interpreter bound to this table, for callers composing joins or aggregates.
    pub fn filter(&self, spec: &QuerySpec, read: &ReadOptions) -> Result<SelectQuery, AppError> {
        interpret(
            SelectQuery::from_table(self.table.clone()),
            spec,
            &self.interpret_options(read),
        )
    }

    /// Read over a caller-built base query (typically with joins).
    pub async fn get_with(
        &self,
        exec: &dyn Executor,
        base: SelectQuery,
        spec: &QuerySpec,
        read: &ReadOptions,
    ) -> Result<Fetched, AppError> {
        let spec = self.ordered(spec, read);
        let query = interpret(base, &spec, &self.interpret_options(read))?;
        fetch(exec, query, &spec.columns, FetchMode::from_spec(&spec)).await
    }

    /// List rows; paged when the spec carries `pageSize` and `page`.
    pub async fn get(&self, exec: &dyn Executor, spec: &QuerySpec, read: &ReadOptions) -> Result<Page, AppError> {
        let base = SelectQuery::from_table(self.table.clone());
        Ok(self.get_with(exec, base, spec, read).await?.into_page())
    }

    /// First matching row, or `None`.
    pub async fn get_one(
        &self,
        exec: &dyn Executor,
        spec: &QuerySpec,
        read: &ReadOptions,
    ) -> Result<Option<Value>, AppError> {
        let spec = QuerySpec {
            get_one: true,
            ..spec.clone()
        };
        let base = SelectQuery::from_table(self.table.clone());
        Ok(self.get_with(exec, base, &spec, read).await?.into_row())
    }

    pub async fn count(&self, exec: &dyn Executor, spec: &QuerySpec) -> Result<u64, AppError> {
        let query = self.filter(spec, &ReadOptions::default())?;
        let row = exec.fetch_optional(&query.to_count()).await?;
        Ok(read_total(row))
    }

    /// Insert one row. Assigns a generated id when the payload has none and generation is on.
    pub async fn add(&self, exec: &dyn Executor, data: &Value) -> Result<Value, AppError> {
        let mut payload = as_object(data, "add")?.clone();
        let id_name = self.options.id_name.as_str();
        let id = match payload.get(id_name) {
            Some(v) if !is_blank_id(v) => v.clone(),
            _ => match &self.options.id_generate {
                Some(generate) => {
                    let id = Value::String(generate());
                    payload.insert(id_name.to_string(), id.clone());
                    id
                }
                None => {
                    // Leave the column default in charge.
                    payload.shift_remove(id_name);
                    Value::Null
                }
            },
        };
        let payload = self.coerce(payload)?;
        let q = insert(&self.table, &payload, &self.options.date_fields)?;
        let row = exec.fetch_optional(&q).await?.unwrap_or(Value::Null);
        let id = if id.is_null() {
            row.get(id_name).cloned().unwrap_or(Value::Null)
        } else {
            id
        };
        Ok((self.options.then)(id, WriteOutcome::Inserted(row)))
    }

    /// Update rows matched by `spec`, or by the id embedded in `data`. The id column is never written.
    pub async fn edit(&self, exec: &dyn Executor, data: &Value, spec: &QuerySpec) -> Result<Value, AppError> {
        let mut payload = as_object(data, "edit")?.clone();
        let embedded = payload.shift_remove(&self.options.id_name);
        let mut spec = spec.clone();
        if spec.id.is_none() {
            if let Some(id) = embedded {
                spec.id = IdFilter::from_value(&id)?;
            }
        }
        if spec.is_unconditioned() {
            return Err(AppError::config(format!(
                "edit on {} requires an id or a condition",
                self.table.name
            )));
        }
        let id = spec.id.as_ref().map(IdFilter::raw).unwrap_or(Value::Null);
        let payload = self.coerce(payload)?;
        let query = self.filter(&spec, &ReadOptions::default())?;
        let n = exec
            .execute(&query.to_update(&payload, &self.options.date_fields)?)
            .await?;
        Ok((self.options.then)(id, WriteOutcome::Affected(n)))
    }

    /// Delete rows matched by `spec`. An empty spec is refused.
    pub async fn del(&self, exec: &dyn Executor, spec: &QuerySpec) -> Result<Value, AppError> {
        if spec.is_unconditioned() {
            return Err(AppError::config(format!(
                "delete on {} requires a condition",
                self.table.name
            )));
        }
        let id = spec.id.as_ref().map(IdFilter::raw).unwrap_or(Value::Null);
        let query = self.filter(spec, &ReadOptions::default())?;
        let n = exec.execute(&query.to_delete()?).await?;
        Ok((self.options.then)(id, WriteOutcome::Affected(n)))
    }

    fn coerce(&self, payload: Map<String, Value>) -> Result<Map<String, Value>, AppError> {
        if self.options.date_fields.is_empty() {
            return Ok(payload);
        }
        match coerce_dates(&Value::Object(payload), &self.options.date_fields)? {
            Value::Object(map) => Ok(map),
            _ => Err(AppError::validation("payload must be an object")),
        }
    }
}

fn as_object<'a>(data: &'a Value, action: &str) -> Result<&'a Map<String, Value>, AppError> {
    data.as_object()
        .ok_or_else(|| AppError::validation(format!("{} expects an object, got {}", action, data)))
}

fn is_blank_id(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}
