//! Query planning and execution.

pub mod exec;
pub mod plan;

pub use exec::{Query, QuerySet};
pub use plan::{QueryFactory, QueryPolicy};
