//! dataops: query-spec interpreter, CRUD factory and related-set reconciliation over PostgreSQL.

pub mod coerce;
pub mod config;
pub mod error;
pub mod exec;
pub mod extractors;
pub mod projection;
pub mod query;
pub mod service;
pub mod sql;

pub use coerce::{coerce_dates, prune_nulls, DateFields};
pub use config::{init_tracing, OpOptions, Settings, WriteOutcome};
pub use error::AppError;
pub use exec::{in_transaction, Executor, TxExecutor};
pub use extractors::QueryParams;
pub use projection::{fetch, qualified_fields, FetchMode, Fetched, Page};
pub use query::{interpret, InterpretOptions, QuerySpec};
pub use service::{check_arg_empty, check_arg_length, Ops, ReadOptions, Reconcile, ReconcileReport};
pub use sql::{Direction, SelectQuery, Table};
