//! Query execution over the fixed join chain and the `nanoquery` command-line front end.
//!
//! [`QueryExecutor`] asks the planner for a plan, loads pruned working copies of the base
//! tables, runs each join step with the chosen engine and hands the final joined table to
//! [`aggregate`].

pub mod aggregation;
pub mod executor;

pub use aggregation::aggregate;
pub use executor::{AlgorithmOverride, QueryExecutor, QueryResult};
