//! Cost-based choice of join algorithms and column projections for the fixed join chain.
//!
//! Architecture role:
//! - [`descriptor`]: the immutable query shape (tables, join chain, aggregation, order)
//! - [`cost`]: pluggable footprint estimate and the HPJ/SMJ threshold rule
//! - [`planner`]: metadata-only planning into a serializable [`QueryPlan`]
//! - [`explain`]: text rendering of a plan

pub mod cost;
pub mod descriptor;
pub mod explain;
pub mod planner;

pub use cost::*;
pub use descriptor::*;
pub use explain::*;
pub use planner::*;
