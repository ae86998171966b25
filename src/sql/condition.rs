//! Nested `_where` condition trees.
//!
//! A tree is a node or an array of nodes. A node is either a plain equality
//! mapping (`{"status": "1"}`) or a mapping from operator names to arguments:
//!
//! ```json
//! [
//!   {"whereIn": ["checkStatus", ["0", "2"]]},
//!   {"orWhere": [{"where": {"editor": "u1"}}, {"whereNull": "checker"}]}
//! ]
//! ```
//!
//! An operator whose value is itself a node (or array of nodes) opens a
//! parenthesised group joined with that operator's connector. Any other value
//! is spread as the operator's positional arguments. Trees are parsed into
//! [`ConditionNode`]s up front, so shape errors surface before any SQL exists.

use std::str::FromStr;

use serde_json::{Map, Value};

use crate::error::AppError;
use crate::sql::builder::{Connector, WhereList};

/// Deepest nesting accepted in a `_where` tree.
pub const MAX_WHERE_DEPTH: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WhereOp {
    Where,
    AndWhere,
    OrWhere,
    WhereNot,
    OrWhereNot,
    WhereIn,
    OrWhereIn,
    WhereNotIn,
    OrWhereNotIn,
    WhereNull,
    OrWhereNull,
    WhereNotNull,
    OrWhereNotNull,
    WhereBetween,
    OrWhereBetween,
    WhereNotBetween,
    OrWhereNotBetween,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Family {
    Basic,
    In,
    Null,
    Between,
}

impl WhereOp {
    pub const ALL: [WhereOp; 17] = [
        WhereOp::Where,
        WhereOp::AndWhere,
        WhereOp::OrWhere,
        WhereOp::WhereNot,
        WhereOp::OrWhereNot,
        WhereOp::WhereIn,
        WhereOp::OrWhereIn,
        WhereOp::WhereNotIn,
        WhereOp::OrWhereNotIn,
        WhereOp::WhereNull,
        WhereOp::OrWhereNull,
        WhereOp::WhereNotNull,
        WhereOp::OrWhereNotNull,
        WhereOp::WhereBetween,
        WhereOp::OrWhereBetween,
        WhereOp::WhereNotBetween,
        WhereOp::OrWhereNotBetween,
    ];

    pub fn name(self) -> &'static str {
        match self {
            WhereOp::Where => "where",
            WhereOp::AndWhere => "andWhere",
            WhereOp::OrWhere => "orWhere",
            WhereOp::WhereNot => "whereNot",
            WhereOp::OrWhereNot => "orWhereNot",
            WhereOp::WhereIn => "whereIn",
            WhereOp::OrWhereIn => "orWhereIn",
            WhereOp::WhereNotIn => "whereNotIn",
            WhereOp::OrWhereNotIn => "orWhereNotIn",
            WhereOp::WhereNull => "whereNull",
            WhereOp::OrWhereNull => "orWhereNull",
            WhereOp::WhereNotNull => "whereNotNull",
            WhereOp::OrWhereNotNull => "orWhereNotNull",
            WhereOp::WhereBetween => "whereBetween",
            WhereOp::OrWhereBetween => "orWhereBetween",
            WhereOp::WhereNotBetween => "whereNotBetween",
            WhereOp::OrWhereNotBetween => "orWhereNotBetween",
        }
    }

    fn connector(self) -> Connector {
        if self.name().starts_with("or") {
            Connector::Or
        } else {
            Connector::And
        }
    }

    fn negated(self) -> bool {
        matches!(
            self,
            WhereOp::WhereNot
                | WhereOp::OrWhereNot
                | WhereOp::WhereNotIn
                | WhereOp::OrWhereNotIn
                | WhereOp::WhereNotNull
                | WhereOp::OrWhereNotNull
                | WhereOp::WhereNotBetween
                | WhereOp::OrWhereNotBetween
        )
    }

    fn family(self) -> Family {
        match self {
            WhereOp::Where | WhereOp::AndWhere | WhereOp::OrWhere | WhereOp::WhereNot | WhereOp::OrWhereNot => {
                Family::Basic
            }
            WhereOp::WhereIn | WhereOp::OrWhereIn | WhereOp::WhereNotIn | WhereOp::OrWhereNotIn => Family::In,
            WhereOp::WhereNull | WhereOp::OrWhereNull | WhereOp::WhereNotNull | WhereOp::OrWhereNotNull => {
                Family::Null
            }
            WhereOp::WhereBetween
            | WhereOp::OrWhereBetween
            | WhereOp::WhereNotBetween
            | WhereOp::OrWhereNotBetween => Family::Between,
        }
    }
}

impl FromStr for WhereOp {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WhereOp::ALL
            .iter()
            .copied()
            .find(|op| op.name() == s)
            .ok_or_else(|| AppError::config(format!("unknown where operator: {}", s)))
    }
}

/// One argument list, already checked against the operator's arity.
#[derive(Clone, Debug, PartialEq)]
pub enum Predicate {
    Equals(Vec<(String, Value)>),
    Compare { column: String, op: String, value: Value },
    In { column: String, values: Vec<Value> },
    Null { column: String },
    Between { column: String, low: Value, high: Value },
}

#[derive(Clone, Debug, PartialEq)]
pub enum ClauseBody {
    Predicate(Predicate),
    Group(Vec<ConditionNode>),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Clause {
    pub op: WhereOp,
    pub body: ClauseBody,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ConditionNode {
    /// Bare mapping without operator keys.
    Equals(Vec<(String, Value)>),
    Clauses(Vec<Clause>),
}

/// Parse a `_where` payload: JSON text or an already structured value.
pub fn parse_where(raw: &Value) -> Result<Vec<ConditionNode>, AppError> {
    match raw {
        Value::String(s) => {
            let v: Value = serde_json::from_str(s)
                .map_err(|e| AppError::config(format!("malformed _where: {}", e)))?;
            parse_tree(&v, 1)
        }
        other => parse_tree(other, 1),
    }
}

fn parse_tree(v: &Value, depth: usize) -> Result<Vec<ConditionNode>, AppError> {
    if depth > MAX_WHERE_DEPTH {
        return Err(AppError::config(format!(
            "_where nested deeper than {} levels",
            MAX_WHERE_DEPTH
        )));
    }
    match v {
        Value::Array(items) => items.iter().map(|i| parse_node(i, depth)).collect(),
        other => Ok(vec![parse_node(other, depth)?]),
    }
}

fn parse_node(v: &Value, depth: usize) -> Result<ConditionNode, AppError> {
    let map = v
        .as_object()
        .ok_or_else(|| AppError::config(format!("_where node must be an object, got {}", v)))?;
    if !has_operator_key(map) {
        return Ok(ConditionNode::Equals(equality_pairs(map)?));
    }
    let mut clauses = Vec::with_capacity(map.len());
    for (k, value) in map {
        let op: WhereOp = k.parse()?;
        let body = if is_node_tree(value) {
            if op.family() != Family::Basic {
                return Err(AppError::config(format!("{} cannot take a nested group", op.name())));
            }
            ClauseBody::Group(parse_tree(value, depth + 1)?)
        } else {
            ClauseBody::Predicate(parse_args(op, value)?)
        };
        clauses.push(Clause { op, body });
    }
    Ok(ConditionNode::Clauses(clauses))
}

fn has_operator_key(map: &Map<String, Value>) -> bool {
    map.keys().any(|k| k.parse::<WhereOp>().is_ok())
}

fn is_operator_node(v: &Value) -> bool {
    match v {
        Value::Object(map) => !map.is_empty() && map.keys().all(|k| k.parse::<WhereOp>().is_ok()),
        _ => false,
    }
}

/// A value opens a group when it is an operator node or a non-empty array of nodes.
fn is_node_tree(v: &Value) -> bool {
    match v {
        Value::Array(items) => {
            !items.is_empty() && items.iter().all(|i| matches!(i, Value::Object(m) if !m.is_empty()))
        }
        other => is_operator_node(other),
    }
}

fn equality_pairs(map: &Map<String, Value>) -> Result<Vec<(String, Value)>, AppError> {
    let mut pairs = Vec::with_capacity(map.len());
    for (k, v) in map {
        if v.is_array() || v.is_object() {
            return Err(AppError::config(format!("equality value for {} must be a scalar", k)));
        }
        pairs.push((k.clone(), v.clone()));
    }
    Ok(pairs)
}

fn column_arg(op: WhereOp, v: &Value) -> Result<String, AppError> {
    v.as_str()
        .map(String::from)
        .ok_or_else(|| AppError::config(format!("{} expects a column name, got {}", op.name(), v)))
}

fn parse_args(op: WhereOp, value: &Value) -> Result<Predicate, AppError> {
    let args: Vec<&Value> = match value {
        Value::Array(items) => items.iter().collect(),
        single => vec![single],
    };
    let arity = |expected: &str| {
        AppError::config(format!("{} expects {}, got {}", op.name(), expected, value))
    };
    match op.family() {
        Family::Basic => match args.as_slice() {
            [Value::Object(map)] => Ok(Predicate::Equals(equality_pairs(map)?)),
            [column, v] => Ok(Predicate::Compare {
                column: column_arg(op, column)?,
                op: "=".into(),
                value: (*v).clone(),
            }),
            [column, cmp, v] => Ok(Predicate::Compare {
                column: column_arg(op, column)?,
                op: cmp
                    .as_str()
                    .map(String::from)
                    .ok_or_else(|| arity("a comparison operator string"))?,
                value: (*v).clone(),
            }),
            _ => Err(arity("an object, [column, value] or [column, operator, value]")),
        },
        Family::In => match args.as_slice() {
            [column, Value::Array(values)] => Ok(Predicate::In {
                column: column_arg(op, column)?,
                values: values.clone(),
            }),
            _ => Err(arity("[column, [values]]")),
        },
        Family::Null => match args.as_slice() {
            [column] => Ok(Predicate::Null {
                column: column_arg(op, column)?,
            }),
            _ => Err(arity("a column name")),
        },
        Family::Between => match args.as_slice() {
            [column, Value::Array(bounds)] if bounds.len() == 2 => Ok(Predicate::Between {
                column: column_arg(op, column)?,
                low: bounds[0].clone(),
                high: bounds[1].clone(),
            }),
            _ => Err(arity("[column, [low, high]]")),
        },
    }
}

/// Apply parsed nodes onto `list`; each top-level node is ANDed.
pub fn apply_nodes(list: &mut WhereList, nodes: &[ConditionNode]) -> Result<(), AppError> {
    for node in nodes {
        match node {
            ConditionNode::Equals(pairs) => list.equals(Connector::And, false, pairs)?,
            ConditionNode::Clauses(clauses) => {
                for clause in clauses {
                    apply_clause(list, clause)?;
                }
            }
        }
    }
    Ok(())
}

fn apply_clause(list: &mut WhereList, clause: &Clause) -> Result<(), AppError> {
    let connector = clause.op.connector();
    let negated = clause.op.negated();
    match &clause.body {
        ClauseBody::Group(children) => {
            let mut group = WhereList::new();
            apply_nodes(&mut group, children)?;
            list.group(connector, negated, group);
            Ok(())
        }
        ClauseBody::Predicate(p) => match p {
            Predicate::Equals(pairs) => list.equals(connector, negated, pairs),
            Predicate::Compare { column, op, value } => list.compare(connector, negated, column, op, value),
            Predicate::In { column, values } => list.within(connector, negated, column, values),
            Predicate::Null { column } => list.is_null(connector, negated, column),
            Predicate::Between { column, low, high } => list.between(connector, negated, column, low, high),
        },
    }
}
