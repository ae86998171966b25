//! Safe SQL builder: identifiers are validated, values are parameters.

mod builder;
pub mod condition;
pub mod params;
pub use builder::*;
pub use condition::{apply_nodes, parse_where, ConditionNode, WhereOp};
pub use params::*;
