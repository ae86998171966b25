//! Builds SELECT, COUNT, INSERT, UPDATE, DELETE. Identifiers are validated and quoted.
//! Strings are written as escaped untyped literals so PostgreSQL types them from the
//! column they meet; every other value is a `$n` parameter.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};

use crate::coerce::DateFields;
use crate::error::AppError;
use crate::sql::params::PgBindValue;

fn column_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)?$").expect("static regex")
    })
}

/// Quote identifier for PostgreSQL.
fn quoted(s: &str) -> String {
    format!("\"{}\"", s.replace('"', "\"\""))
}

/// Validate and quote `col` or `table.col`.
pub fn quote_column(name: &str) -> Result<String, AppError> {
    if !column_pattern().is_match(name) {
        return Err(AppError::config(format!("invalid column name: {}", name)));
    }
    Ok(name.split('.').map(quoted).collect::<Vec<_>>().join("."))
}

/// Write payload keys must be bare column names.
fn quote_write_column(name: &str) -> Result<String, AppError> {
    if name.contains('.') {
        return Err(AppError::config(format!("invalid column name: {}", name)));
    }
    quote_column(name)
}

pub struct QueryBuf {
    pub sql: String,
    pub params: Vec<PgBindValue>,
}

impl QueryBuf {
    fn new() -> Self {
        QueryBuf {
            sql: String::new(),
            params: Vec::new(),
        }
    }

    fn push_param(&mut self, v: PgBindValue) -> usize {
        self.params.push(v);
        self.params.len()
    }

    fn placeholder(&mut self, v: &PgBindValue) -> String {
        match v {
            PgBindValue::String(s) => string_literal(s),
            other => format!("${}", self.push_param(other.clone())),
        }
    }
}

/// Quotes doubled; with any backslash, an `E''` literal with backslashes doubled
/// (the `PQescapeLiteral` form, valid whatever `standard_conforming_strings` says).
pub fn string_literal(s: &str) -> String {
    let quoted = s.replace('\'', "''");
    if s.contains('\\') {
        format!("E'{}'", quoted.replace('\\', "\\\\"))
    } else {
        format!("'{}'", quoted)
    }
}

/// A scalar filter or payload value. NUL cannot travel inside a literal.
fn scalar(column: &str, v: &Value) -> Result<PgBindValue, AppError> {
    if v.as_str().is_some_and(|s| s.contains('\0')) {
        return Err(AppError::validation(format!("{} contains a NUL character", column)));
    }
    Ok(PgBindValue::from_json(v))
}

/// A table reachable through the store, optionally schema-qualified.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Table {
    pub schema: Option<String>,
    pub name: String,
}

impl Table {
    pub fn new(name: impl Into<String>) -> Self {
        Table {
            schema: None,
            name: name.into(),
        }
    }

    pub fn in_schema(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Table {
            schema: Some(schema.into()),
            name: name.into(),
        }
    }

    fn qualified(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{}.{}", quoted(schema), quoted(&self.name)),
            None => quoted(&self.name),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Connector {
    And,
    Or,
}

impl Connector {
    fn keyword(self) -> &'static str {
        match self {
            Connector::And => " AND ",
            Connector::Or => " OR ",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

/// Comparison operators accepted in three-argument `where` calls.
pub fn comparison_operator(op: &str) -> Result<&'static str, AppError> {
    Ok(match op.trim().to_lowercase().as_str() {
        "=" => "=",
        "<>" => "<>",
        "!=" => "<>",
        "<" => "<",
        "<=" => "<=",
        ">" => ">",
        ">=" => ">=",
        "like" => "LIKE",
        "not like" => "NOT LIKE",
        "ilike" => "ILIKE",
        "not ilike" => "NOT ILIKE",
        _ => return Err(AppError::config(format!("unknown comparison operator: {}", op))),
    })
}

#[derive(Clone, Debug, PartialEq)]
enum Term {
    Compare {
        column: String,
        op: &'static str,
        value: PgBindValue,
    },
    IsNull {
        column: String,
        negated: bool,
    },
    In {
        column: String,
        values: Vec<PgBindValue>,
        negated: bool,
    },
    Between {
        column: String,
        low: PgBindValue,
        high: PgBindValue,
        negated: bool,
    },
    Group(WhereList),
}

#[derive(Clone, Debug, PartialEq)]
struct Entry {
    connector: Connector,
    negated: bool,
    term: Term,
}

/// Boolean clause list rendered left to right; groups are parenthesised.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WhereList {
    entries: Vec<Entry>,
}

impl WhereList {
    pub fn new() -> Self {
        WhereList::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn push(&mut self, connector: Connector, negated: bool, term: Term) {
        self.entries.push(Entry {
            connector,
            negated,
            term,
        });
    }

    /// `column <op> value`; a null value with `=`/`<>` becomes `IS [NOT] NULL`.
    pub fn compare(
        &mut self,
        connector: Connector,
        negated: bool,
        column: &str,
        op: &str,
        value: &Value,
    ) -> Result<(), AppError> {
        let column = quote_column(column)?;
        let op = comparison_operator(op)?;
        let term = if value.is_null() {
            match op {
                "=" => Term::IsNull { column, negated: false },
                "<>" => Term::IsNull { column, negated: true },
                _ => {
                    return Err(AppError::config(format!(
                        "operator {} cannot compare against null",
                        op
                    )))
                }
            }
        } else if value.is_array() || value.is_object() {
            return Err(AppError::config(format!(
                "comparison value for {} must be a scalar",
                column
            )));
        } else {
            Term::Compare {
                value: scalar(&column, value)?,
                column,
                op,
            }
        };
        self.push(connector, negated, term);
        Ok(())
    }

    /// AND of `column = value` pairs. More than one pair is grouped so connectors apply to the whole map.
    pub fn equals(
        &mut self,
        connector: Connector,
        negated: bool,
        pairs: &[(String, Value)],
    ) -> Result<(), AppError> {
        match pairs {
            [] => Ok(()),
            [(column, value)] => self.compare(connector, negated, column, "=", value),
            _ => {
                let mut group = WhereList::new();
                for (column, value) in pairs {
                    group.compare(Connector::And, false, column, "=", value)?;
                }
                self.push(connector, negated, Term::Group(group));
                Ok(())
            }
        }
    }

    pub fn is_null(&mut self, connector: Connector, negated: bool, column: &str) -> Result<(), AppError> {
        let column = quote_column(column)?;
        self.push(connector, false, Term::IsNull { column, negated });
        Ok(())
    }

    pub fn within(
        &mut self,
        connector: Connector,
        negated: bool,
        column: &str,
        values: &[Value],
    ) -> Result<(), AppError> {
        let column = quote_column(column)?;
        let mut binds = Vec::with_capacity(values.len());
        // A NULL member never matches.
        for v in values.iter().filter(|v| !v.is_null()) {
            if v.is_array() || v.is_object() {
                return Err(AppError::config(format!("IN values for {} must be scalars", column)));
            }
            binds.push(scalar(&column, v)?);
        }
        self.push(
            connector,
            false,
            Term::In {
                column,
                values: binds,
                negated,
            },
        );
        Ok(())
    }

    pub fn between(
        &mut self,
        connector: Connector,
        negated: bool,
        column: &str,
        low: &Value,
        high: &Value,
    ) -> Result<(), AppError> {
        let column = quote_column(column)?;
        for bound in [low, high] {
            if bound.is_null() || bound.is_array() || bound.is_object() {
                return Err(AppError::config(format!("BETWEEN bounds for {} must be scalars", column)));
            }
        }
        self.push(
            connector,
            false,
            Term::Between {
                low: scalar(&column, low)?,
                high: scalar(&column, high)?,
                column,
                negated,
            },
        );
        Ok(())
    }

    /// Nested parenthesised group; an empty group is dropped.
    pub fn group(&mut self, connector: Connector, negated: bool, group: WhereList) {
        if !group.is_empty() {
            self.push(connector, negated, Term::Group(group));
        }
    }

    fn render(&self, q: &mut QueryBuf) -> String {
        let mut out = String::new();
        for (i, entry) in self.entries.iter().enumerate() {
            if i > 0 {
                out.push_str(entry.connector.keyword());
            }
            let sql = render_term(&entry.term, q);
            if entry.negated {
                out.push_str(&format!("NOT ({})", sql));
            } else {
                out.push_str(&sql);
            }
        }
        out
    }
}

fn render_term(term: &Term, q: &mut QueryBuf) -> String {
    match term {
        Term::Compare { column, op, value } => format!("{} {} {}", column, op, q.placeholder(value)),
        Term::IsNull { column, negated } => {
            if *negated {
                format!("{} IS NOT NULL", column)
            } else {
                format!("{} IS NULL", column)
            }
        }
        Term::In {
            column,
            values,
            negated,
        } => {
            if values.is_empty() {
                return if *negated { "1 = 1".into() } else { "1 = 0".into() };
            }
            let placeholders: Vec<String> = values.iter().map(|v| q.placeholder(v)).collect();
            format!(
                "{} {}IN ({})",
                column,
                if *negated { "NOT " } else { "" },
                placeholders.join(", ")
            )
        }
        Term::Between {
            column,
            low,
            high,
            negated,
        } => {
            let a = q.placeholder(low);
            let b = q.placeholder(high);
            format!(
                "{} {}BETWEEN {} AND {}",
                column,
                if *negated { "NOT " } else { "" },
                a,
                b
            )
        }
        Term::Group(list) => format!("({})", list.render(q)),
    }
}

/// Requested output columns.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Columns {
    #[default]
    All,
    List(Vec<String>),
}

impl Columns {
    /// Split a comma-separated list; blank entries are dropped.
    pub fn parse(s: &str) -> Columns {
        let list: Vec<String> = s
            .split(',')
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(String::from)
            .collect();
        if list.is_empty() {
            Columns::All
        } else {
            Columns::List(list)
        }
    }

    fn render(&self) -> Result<String, AppError> {
        match self {
            Columns::All => Ok("*".into()),
            Columns::List(list) => {
                let mut out = Vec::with_capacity(list.len());
                for c in list {
                    if c == "*" {
                        out.push("*".to_string());
                    } else if let Some(table) = c.strip_suffix(".*") {
                        out.push(format!("{}.*", quote_column(table)?));
                    } else {
                        out.push(quote_column(c)?);
                    }
                }
                Ok(out.join(", "))
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
struct Join {
    table: Table,
    on: Vec<(String, String)>,
}

/// SELECT under construction: the filtered handle the interpreter produces.
#[derive(Clone, Debug, PartialEq)]
pub struct SelectQuery {
    table: Table,
    joins: Vec<Join>,
    columns: Columns,
    filter: WhereList,
    order_by: Vec<(String, Direction)>,
    limit: Option<u64>,
    offset: Option<u64>,
}

impl SelectQuery {
    pub fn from_table(table: Table) -> Self {
        SelectQuery {
            table,
            joins: Vec::new(),
            columns: Columns::All,
            filter: WhereList::new(),
            order_by: Vec::new(),
            limit: None,
            offset: None,
        }
    }

    pub fn table(&self) -> &Table {
        &self.table
    }

    /// LEFT JOIN `table` ON each `left = right` pair (ANDed).
    pub fn left_join(mut self, table: Table, on: &[(&str, &str)]) -> Result<Self, AppError> {
        if on.is_empty() {
            return Err(AppError::config(format!("join on {} needs a condition", table.name)));
        }
        let mut pairs = Vec::with_capacity(on.len());
        for (l, r) in on {
            pairs.push((quote_column(l)?, quote_column(r)?));
        }
        self.joins.push(Join { table, on: pairs });
        Ok(self)
    }

    pub fn filter_mut(&mut self) -> &mut WhereList {
        &mut self.filter
    }

    pub fn has_filter(&self) -> bool {
        !self.filter.is_empty()
    }

    /// AND `column = value`.
    pub fn where_eq(mut self, column: &str, value: Value) -> Result<Self, AppError> {
        self.filter.compare(Connector::And, false, column, "=", &value)?;
        Ok(self)
    }

    pub fn order_by(&mut self, column: &str, direction: Direction) -> Result<(), AppError> {
        let column = quote_column(column)?;
        self.order_by.push((column, direction));
        Ok(())
    }

    pub fn set_columns(&mut self, columns: Columns) {
        self.columns = columns;
    }

    pub fn set_window(&mut self, limit: Option<u64>, offset: Option<u64>) {
        self.limit = limit;
        self.offset = offset;
    }

    fn from_clause(&self) -> String {
        let mut out = self.table.qualified();
        for join in &self.joins {
            let on: Vec<String> = join.on.iter().map(|(l, r)| format!("{} = {}", l, r)).collect();
            out.push_str(&format!(" LEFT JOIN {} ON {}", join.table.qualified(), on.join(" AND ")));
        }
        out
    }

    fn where_clause(&self, q: &mut QueryBuf) -> String {
        if self.filter.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.filter.render(q))
        }
    }

    pub fn to_select(&self) -> Result<QueryBuf, AppError> {
        let mut q = QueryBuf::new();
        let cols = self.columns.render()?;
        let from = self.from_clause();
        let where_clause = self.where_clause(&mut q);
        let order_clause = if self.order_by.is_empty() {
            String::new()
        } else {
            let terms: Vec<String> = self
                .order_by
                .iter()
                .map(|(c, d)| match d {
                    Direction::Asc => format!("{} ASC", c),
                    Direction::Desc => format!("{} DESC", c),
                })
                .collect();
            format!(" ORDER BY {}", terms.join(", "))
        };
        let limit_clause = self.limit.map(|n| format!(" LIMIT {}", n)).unwrap_or_default();
        let offset_clause = self.offset.map(|n| format!(" OFFSET {}", n)).unwrap_or_default();
        q.sql = format!(
            "SELECT {} FROM {}{}{}{}{}",
            cols, from, where_clause, order_clause, limit_clause, offset_clause
        );
        Ok(q)
    }

    /// Full matching count, ignoring columns, ordering and window.
    pub fn to_count(&self) -> QueryBuf {
        let mut q = QueryBuf::new();
        let from = self.from_clause();
        let where_clause = self.where_clause(&mut q);
        q.sql = format!("SELECT COUNT(*)::bigint AS \"total\" FROM {}{}", from, where_clause);
        q
    }

    fn guard_write(&self, action: &str) -> Result<(), AppError> {
        if !self.joins.is_empty() {
            return Err(AppError::config(format!("{} over a joined query is not supported", action)));
        }
        if self.filter.is_empty() {
            return Err(AppError::config(format!("{} requires a condition", action)));
        }
        Ok(())
    }

    /// UPDATE matching rows. Never renders without a WHERE clause.
    pub fn to_update(&self, payload: &Map<String, Value>, dates: &DateFields) -> Result<QueryBuf, AppError> {
        self.guard_write("update")?;
        if payload.is_empty() {
            return Err(AppError::validation("nothing to update"));
        }
        let mut q = QueryBuf::new();
        let mut sets = Vec::with_capacity(payload.len());
        for (k, v) in payload {
            let column = quote_write_column(k)?;
            sets.push(format!("{} = {}", column, write_placeholder(&mut q, k, v, dates)?));
        }
        let where_clause = self.where_clause(&mut q);
        q.sql = format!("UPDATE {} SET {}{}", self.table.qualified(), sets.join(", "), where_clause);
        Ok(q)
    }

    /// DELETE matching rows. Never renders without a WHERE clause.
    pub fn to_delete(&self) -> Result<QueryBuf, AppError> {
        self.guard_write("delete")?;
        let mut q = QueryBuf::new();
        let where_clause = self.where_clause(&mut q);
        q.sql = format!("DELETE FROM {}{}", self.table.qualified(), where_clause);
        Ok(q)
    }
}

/// Nulls are written as a literal so they fit any column type.
fn write_placeholder(q: &mut QueryBuf, column: &str, v: &Value, dates: &DateFields) -> Result<String, AppError> {
    if v.is_null() {
        return Ok("NULL".into());
    }
    let param = if dates.contains(column) {
        PgBindValue::timestamp_from_json(column, v)?
    } else {
        scalar(column, v)?
    };
    Ok(q.placeholder(&param))
}

/// INSERT one row and return it.
pub fn insert(table: &Table, payload: &Map<String, Value>, dates: &DateFields) -> Result<QueryBuf, AppError> {
    let mut q = QueryBuf::new();
    if payload.is_empty() {
        q.sql = format!("INSERT INTO {} DEFAULT VALUES RETURNING *", table.qualified());
        return Ok(q);
    }
    let mut cols = Vec::with_capacity(payload.len());
    let mut placeholders = Vec::with_capacity(payload.len());
    for (k, v) in payload {
        cols.push(quote_write_column(k)?);
        placeholders.push(write_placeholder(&mut q, k, v, dates)?);
    }
    q.sql = format!(
        "INSERT INTO {} ({}) VALUES ({}) RETURNING *",
        table.qualified(),
        cols.join(", "),
        placeholders.join(", ")
    );
    Ok(q)
}
