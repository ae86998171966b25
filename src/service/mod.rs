//! Table operations built on the interpreter: CRUD, reconciliation, argument guards.

mod guard;
mod ops;
mod reconcile;
pub use guard::{check_arg_empty, check_arg_length};
pub use ops::{Ops, ReadOptions};
pub use reconcile::{
    diff, CompareFn, CustomContext, CustomFn, Diff, PayloadFn, PendingWrite, QueryFn, Reconcile, ReconcileReport,
    TransformFn,
};
