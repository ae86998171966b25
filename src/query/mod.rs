//! Request-query interpretation: QuerySpec parsing and its application to a SELECT.

pub mod interpret;
pub mod spec;

pub use interpret::{interpret, InterpretOptions, ScopeFn};
pub use spec::{IdFilter, QuerySpec};
