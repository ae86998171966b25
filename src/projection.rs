//! Column selection, page windows and the result envelope.

use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::Value;

use crate::error::AppError;
use crate::exec::Executor;
use crate::query::spec::MAX_PAGE_VALUE;
use crate::query::QuerySpec;
use crate::sql::{Columns, SelectQuery};

/// How many rows a read returns. Checked in declaration order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchMode {
    One,
    Page { size: u64, page: u64 },
    All,
}

impl FetchMode {
    pub fn from_spec(spec: &QuerySpec) -> Self {
        if spec.get_one {
            FetchMode::One
        } else if let Some((size, page)) = spec.window() {
            FetchMode::Page { size, page }
        } else {
            FetchMode::All
        }
    }
}

/// `{"data": [...]}`, plus `"total"` for paged reads.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Page {
    pub data: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
}

impl IntoResponse for Page {
    fn into_response(self) -> Response {
        Json(self).into_response()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Fetched {
    /// Single-row mode; `None` means nothing matched.
    One(Option<Value>),
    Page(Page),
}

impl Fetched {
    /// Single-row results become a one-element page (or an empty one).
    pub fn into_page(self) -> Page {
        match self {
            Fetched::One(row) => Page {
                data: row.into_iter().collect(),
                total: None,
            },
            Fetched::Page(page) => page,
        }
    }

    pub fn into_row(self) -> Option<Value> {
        match self {
            Fetched::One(row) => row,
            Fetched::Page(page) => page.data.into_iter().next(),
        }
    }
}

/// Run `query` in `mode`. A paged read also counts every match, ignoring the window.
pub async fn fetch(
    exec: &dyn Executor,
    mut query: SelectQuery,
    columns: &Columns,
    mode: FetchMode,
) -> Result<Fetched, AppError> {
    query.set_columns(columns.clone());
    match mode {
        FetchMode::One => {
            query.set_window(Some(1), None);
            let row = exec.fetch_optional(&query.to_select()?).await?;
            Ok(Fetched::One(row))
        }
        FetchMode::Page { size, page } => {
            let offset = page
                .saturating_sub(1)
                .checked_mul(size)
                .filter(|n| *n <= MAX_PAGE_VALUE)
                .ok_or_else(|| {
                    AppError::validation(format!("page {} of size {} is past the last addressable row", page, size))
                })?;
            let count = query.to_count();
            query.set_window(Some(size), Some(offset));
            let select = query.to_select()?;
            let (data, total) =
                futures::try_join!(exec.fetch_all(&select), exec.fetch_optional(&count))?;
            Ok(Fetched::Page(Page {
                data,
                total: Some(read_total(total)),
            }))
        }
        FetchMode::All => {
            let data = exec.fetch_all(&query.to_select()?).await?;
            Ok(Fetched::Page(Page { data, total: None }))
        }
    }
}

pub(crate) fn read_total(row: Option<Value>) -> u64 {
    row.as_ref()
        .and_then(|r| r.get("total"))
        .and_then(Value::as_u64)
        .unwrap_or(0)
}

/// Columns for a join from `(table, fields)` pairs: `"*"` selects `table.*`,
/// otherwise `fields` is a comma list qualified with `table`.
pub fn qualified_fields(tables: &[(&str, &str)]) -> Columns {
    let mut out = Vec::new();
    for (table, fields) in tables {
        if fields.trim() == "*" {
            out.push(format!("{}.*", table));
            continue;
        }
        out.extend(
            fields
                .split(',')
                .map(str::trim)
                .filter(|f| !f.is_empty())
                .map(|f| format!("{}.{}", table, f)),
        );
    }
    if out.is_empty() {
        Columns::All
    } else {
        Columns::List(out)
    }
}
