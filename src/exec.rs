//! Store handles: the shared pool or a scoped transaction, behind one trait.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use serde_json::{json, Map, Value};
use sqlx::postgres::types::PgInterval;
use sqlx::postgres::{PgArguments, PgColumn, PgRow, PgTypeKind, Postgres};
use sqlx::query::Query;
use sqlx::{Column, PgPool, Row, Transaction, TypeInfo};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::AppError;
use crate::sql::{bind_param, QueryBuf};

/// Where statements run. Every operation takes one, so a caller decides
/// per call whether work shares the pool or a transaction.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn fetch_all(&self, q: &QueryBuf) -> Result<Vec<Value>, AppError>;

    async fn fetch_optional(&self, q: &QueryBuf) -> Result<Option<Value>, AppError>;

    /// Rows affected.
    async fn execute(&self, q: &QueryBuf) -> Result<u64, AppError>;
}

fn bound(q: &QueryBuf) -> Query<'_, Postgres, PgArguments> {
    let mut query = sqlx::query(&q.sql);
    for p in &q.params {
        query = bind_param(query, p);
    }
    query
}

#[async_trait]
impl Executor for PgPool {
    async fn fetch_all(&self, q: &QueryBuf) -> Result<Vec<Value>, AppError> {
        tracing::debug!(sql = %q.sql, params = ?q.params, "query");
        let rows = bound(q).fetch_all(self).await?;
        rows.iter().map(row_to_json).collect()
    }

    async fn fetch_optional(&self, q: &QueryBuf) -> Result<Option<Value>, AppError> {
        tracing::debug!(sql = %q.sql, params = ?q.params, "query");
        let row = bound(q).fetch_optional(self).await?;
        row.as_ref().map(row_to_json).transpose()
    }

    async fn execute(&self, q: &QueryBuf) -> Result<u64, AppError> {
        tracing::debug!(sql = %q.sql, params = ?q.params, "execute");
        let done = bound(q).execute(self).await?;
        Ok(done.rows_affected())
    }
}

/// A transaction usable as an [`Executor`]. Statements are serialised on the
/// one connection; dropping it without `commit` rolls back.
pub struct TxExecutor {
    tx: Mutex<Option<Transaction<'static, Postgres>>>,
}

impl TxExecutor {
    pub async fn begin(pool: &PgPool) -> Result<Self, AppError> {
        let tx = pool.begin().await?;
        Ok(TxExecutor {
            tx: Mutex::new(Some(tx)),
        })
    }

    async fn take(&self) -> Result<Transaction<'static, Postgres>, AppError> {
        self.tx.lock().await.take().ok_or_else(finished)
    }

    pub async fn commit(self) -> Result<(), AppError> {
        self.take().await?.commit().await?;
        Ok(())
    }

    pub async fn rollback(self) -> Result<(), AppError> {
        self.take().await?.rollback().await?;
        Ok(())
    }
}

fn finished() -> AppError {
    AppError::Transaction("transaction already finished".into())
}

#[async_trait]
impl Executor for TxExecutor {
    async fn fetch_all(&self, q: &QueryBuf) -> Result<Vec<Value>, AppError> {
        tracing::debug!(sql = %q.sql, params = ?q.params, "query (tx)");
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or_else(finished)?;
        let rows = bound(q).fetch_all(&mut **tx).await?;
        rows.iter().map(row_to_json).collect()
    }

    async fn fetch_optional(&self, q: &QueryBuf) -> Result<Option<Value>, AppError> {
        tracing::debug!(sql = %q.sql, params = ?q.params, "query (tx)");
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or_else(finished)?;
        let row = bound(q).fetch_optional(&mut **tx).await?;
        row.as_ref().map(row_to_json).transpose()
    }

    async fn execute(&self, q: &QueryBuf) -> Result<u64, AppError> {
        tracing::debug!(sql = %q.sql, params = ?q.params, "execute (tx)");
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or_else(finished)?;
        let done = bound(q).execute(&mut **tx).await?;
        Ok(done.rows_affected())
    }
}

/// Run `f` inside one transaction: commit on `Ok`, roll back on `Err`.
/// The handle must not outlive `f`.
pub async fn in_transaction<F, Fut, T>(pool: &PgPool, f: F) -> Result<T, AppError>
where
    F: FnOnce(Arc<TxExecutor>) -> Fut,
    Fut: Future<Output = Result<T, AppError>>,
{
    let tx = Arc::new(TxExecutor::begin(pool).await?);
    let out = f(Arc::clone(&tx)).await;
    let tx = match Arc::try_unwrap(tx) {
        Ok(tx) => tx,
        Err(_) => {
            tracing::warn!("transaction handle escaped its scope, rolling back");
            return match out {
                Ok(_) => Err(AppError::Transaction(
                    "transaction handle still shared at commit".into(),
                )),
                Err(e) => Err(e),
            };
        }
    };
    match out {
        Ok(v) => {
            tx.commit().await?;
            Ok(v)
        }
        Err(e) => {
            tracing::warn!(error = %e, "rolling back transaction");
            tx.rollback().await?;
            Err(e)
        }
    }
}

fn row_to_json(row: &PgRow) -> Result<Value, AppError> {
    let mut map = Map::new();
    for col in row.columns() {
        map.insert(col.name().to_string(), cell_to_value(row, col)?);
    }
    Ok(Value::Object(map))
}

/// Decode one cell by its PostgreSQL type. NUMERIC comes back as a string so
/// no precision is lost; a type with no JSON mapping is an error, never null.
fn cell_to_value(row: &PgRow, col: &PgColumn) -> Result<Value, AppError> {
    let i = col.ordinal();
    let ty = col.type_info();
    Ok(match ty.name() {
        "BOOL" => row.try_get::<Option<bool>, _>(i)?.into(),
        "INT2" => row.try_get::<Option<i16>, _>(i)?.into(),
        "INT4" => row.try_get::<Option<i32>, _>(i)?.into(),
        "INT8" => row.try_get::<Option<i64>, _>(i)?.into(),
        "FLOAT4" => row.try_get::<Option<f32>, _>(i)?.map(f64::from).into(),
        "FLOAT8" => row.try_get::<Option<f64>, _>(i)?.into(),
        "NUMERIC" => row.try_get::<Option<Decimal>, _>(i)?.map(|d| d.to_string()).into(),
        "TEXT" | "VARCHAR" | "CHAR" | "NAME" | "citext" => row.try_get::<Option<String>, _>(i)?.into(),
        "UUID" => row.try_get::<Option<Uuid>, _>(i)?.map(|u| u.to_string()).into(),
        // Same shape `coerce` writes, so read-modify-write round trips.
        "TIMESTAMPTZ" => row
            .try_get::<Option<DateTime<Utc>>, _>(i)?
            .map(|d| d.to_rfc3339_opts(SecondsFormat::Millis, true))
            .into(),
        "TIMESTAMP" => row
            .try_get::<Option<NaiveDateTime>, _>(i)?
            .map(|d| d.and_utc().to_rfc3339_opts(SecondsFormat::Millis, true))
            .into(),
        "DATE" => row.try_get::<Option<NaiveDate>, _>(i)?.map(|d| d.to_string()).into(),
        "TIME" => row.try_get::<Option<NaiveTime>, _>(i)?.map(|t| t.to_string()).into(),
        "INTERVAL" => row
            .try_get::<Option<PgInterval>, _>(i)?
            .map(|iv| json!({"months": iv.months, "days": iv.days, "microseconds": iv.microseconds}))
            .into(),
        "BYTEA" => row.try_get::<Option<Vec<u8>>, _>(i)?.map(|b| hex_bytes(&b)).into(),
        "JSON" | "JSONB" => row.try_get::<Option<Value>, _>(i)?.unwrap_or(Value::Null),
        "BOOL[]" => row.try_get::<Option<Vec<Option<bool>>>, _>(i)?.into(),
        "INT2[]" => row.try_get::<Option<Vec<Option<i16>>>, _>(i)?.into(),
        "INT4[]" => row.try_get::<Option<Vec<Option<i32>>>, _>(i)?.into(),
        "INT8[]" => row.try_get::<Option<Vec<Option<i64>>>, _>(i)?.into(),
        "FLOAT8[]" => row.try_get::<Option<Vec<Option<f64>>>, _>(i)?.into(),
        "NUMERIC[]" => row
            .try_get::<Option<Vec<Option<Decimal>>>, _>(i)?
            .map(|v| v.into_iter().map(|d| d.map(|d| d.to_string())).collect::<Vec<_>>())
            .into(),
        "TEXT[]" | "VARCHAR[]" | "CHAR[]" => row.try_get::<Option<Vec<Option<String>>>, _>(i)?.into(),
        "UUID[]" => row
            .try_get::<Option<Vec<Option<Uuid>>>, _>(i)?
            .map(|v| v.into_iter().map(|u| u.map(|u| u.to_string())).collect::<Vec<_>>())
            .into(),
        "JSONB[]" => row.try_get::<Option<Vec<Value>>, _>(i)?.into(),
        // Enum labels travel as their text.
        _ if matches!(ty.kind(), PgTypeKind::Enum(_)) => row.try_get_unchecked::<Option<String>, _>(i)?.into(),
        other => {
            return Err(AppError::Db(sqlx::Error::ColumnDecode {
                index: col.name().to_string(),
                source: format!("no JSON mapping for column type {}", other).into(),
            }))
        }
    })
}

/// PostgreSQL's hex output form, `\x0aff`.
fn hex_bytes(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(2 + bytes.len() * 2);
    out.push_str("\\x");
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}
