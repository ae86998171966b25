//! Per-table operation options: id policy, post-write transform, date fields, default order.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use crate::coerce::DateFields;
use crate::sql::Direction;

/// What the store reported for a write.
#[derive(Clone, Debug, PartialEq)]
pub enum WriteOutcome {
    /// The row returned by `INSERT ... RETURNING *`.
    Inserted(Value),
    /// Rows touched by an UPDATE or DELETE.
    Affected(u64),
}

impl WriteOutcome {
    pub fn to_value(&self) -> Value {
        match self {
            WriteOutcome::Inserted(row) => row.clone(),
            WriteOutcome::Affected(n) => Value::from(*n),
        }
    }
}

pub type IdGenerator = Arc<dyn Fn() -> String + Send + Sync>;

/// Maps `(id, outcome)` to what `add`/`edit`/`del` return.
pub type ThenFn = Arc<dyn Fn(Value, WriteOutcome) -> Value + Send + Sync>;

/// 32 lowercase hex digits.
pub fn generate_id() -> String {
    Uuid::new_v4().simple().to_string()
}

#[derive(Clone)]
pub struct OpOptions {
    pub id_name: String,
    /// `None` leaves ids to the caller or the column default.
    pub id_generate: Option<IdGenerator>,
    pub then: ThenFn,
    pub date_fields: DateFields,
    /// Applied by `get` when the call has no `_ob`.
    pub order_by: Vec<(String, Direction)>,
}

impl Default for OpOptions {
    fn default() -> Self {
        OpOptions {
            id_name: "id".into(),
            id_generate: Some(Arc::new(generate_id)),
            then: Arc::new(|id: Value, _: WriteOutcome| id),
            date_fields: DateFields::default(),
            order_by: Vec::new(),
        }
    }
}

impl fmt::Debug for OpOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpOptions")
            .field("id_name", &self.id_name)
            .field("id_generate", &self.id_generate.is_some())
            .field("date_fields", &self.date_fields)
            .field("order_by", &self.order_by)
            .finish()
    }
}

impl OpOptions {
    pub fn new() -> Self {
        OpOptions::default()
    }

    pub fn id_name(mut self, name: impl Into<String>) -> Self {
        self.id_name = name.into();
        self
    }

    pub fn id_generator<F>(mut self, f: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.id_generate = Some(Arc::new(f));
        self
    }

    pub fn without_id_generation(mut self) -> Self {
        self.id_generate = None;
        self
    }

    pub fn then<F>(mut self, f: F) -> Self
    where
        F: Fn(Value, WriteOutcome) -> Value + Send + Sync + 'static,
    {
        self.then = Arc::new(f);
        self
    }

    pub fn date_fields(mut self, fields: DateFields) -> Self {
        self.date_fields = fields;
        self
    }

    pub fn order_by(mut self, column: impl Into<String>, direction: Direction) -> Self {
        self.order_by.push((column.into(), direction));
        self
    }
}
