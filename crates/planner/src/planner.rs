use std::sync::Arc;

use nq_common::{EngineConfig, NqError, Result};
use nq_storage::{Catalog, TableMetadata};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::cost::{choose_algo, CostModel, JoinAlgorithm, NaiveCostModel};
use crate::descriptor::QueryDescriptor;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlannerConfig {
    /// Memory available to one hash-join build side.
    pub avail_mem_mb: f64,
    /// Multiplier on the estimated input size before the threshold comparison.
    pub overhead_factor: f64,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            avail_mem_mb: 10_000.0,
            overhead_factor: 5.0,
        }
    }
}

impl From<&EngineConfig> for PlannerConfig {
    fn from(cfg: &EngineConfig) -> Self {
        Self {
            avail_mem_mb: cfg.avail_mem_mb,
            overhead_factor: cfg.overhead_factor,
        }
    }
}

/// Per-table part of a plan: the exact columns to load and the metadata they were judged on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TablePlan {
    pub name: String,
    pub columns: Vec<String>,
    pub metadata: TableMetadata,
    pub estimated_mb: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedStep {
    pub left: String,
    pub left_key: String,
    pub right: String,
    pub right_key: String,
    pub algorithm: JoinAlgorithm,
    /// Smaller of the two input estimates; the value compared against the threshold.
    pub estimated_mb: f64,
}

/// Planner output. Read-only once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryPlan {
    pub tables: Vec<TablePlan>,
    pub steps: Vec<PlannedStep>,
}

impl QueryPlan {
    pub fn table(&self, name: &str) -> Option<&TablePlan> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Columns to load for `name`.
    pub fn columns(&self, name: &str) -> Result<&[String]> {
        self.table(name)
            .map(|t| t.columns.as_slice())
            .ok_or_else(|| NqError::Planning(format!("table {name} is not part of the plan")))
    }

    pub fn algorithms(&self) -> Vec<JoinAlgorithm> {
        self.steps.iter().map(|s| s.algorithm).collect()
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| NqError::Execution(format!("plan serialization failed: {e}")))
    }
}

/// Picks per-step join algorithms and per-table projections from footer metadata only.
///
/// The join order comes from the descriptor; the planner never reorders steps.
#[derive(Clone)]
pub struct QueryPlanner {
    cfg: PlannerConfig,
    cost: Arc<dyn CostModel>,
}

impl Default for QueryPlanner {
    fn default() -> Self {
        Self::new(PlannerConfig::default())
    }
}

impl QueryPlanner {
    pub fn new(cfg: PlannerConfig) -> Self {
        Self {
            cfg,
            cost: Arc::new(NaiveCostModel),
        }
    }

    /// Replace the footprint estimator; the threshold rule stays the same.
    pub fn with_cost_model(mut self, cost: Arc<dyn CostModel>) -> Self {
        self.cost = cost;
        self
    }

    pub fn plan(&self, catalog: &Catalog, query: &QueryDescriptor) -> Result<QueryPlan> {
        query.validate()?;

        let mut tables = Vec::new();
        for name in query.base_tables() {
            let metadata = catalog.table(&name)?.metadata()?;
            let columns = query.columns_for(&name)?.to_vec();
            let missing = columns
                .iter()
                .filter(|c| !metadata.has_column(c))
                .cloned()
                .collect::<Vec<_>>();
            if !missing.is_empty() {
                return Err(NqError::InvalidConfig(format!(
                    "table {name} is missing required columns {missing:?}"
                )));
            }
            let estimated_mb = self.cost.estimate_mb(&metadata, &columns);
            debug!(
                table = %name,
                rows = metadata.rows,
                row_groups = metadata.row_groups,
                columns = ?columns,
                estimated_mb,
                "planner read table metadata"
            );
            tables.push(TablePlan {
                name,
                columns,
                metadata,
                estimated_mb,
            });
        }

        let estimate = |name: &str| {
            tables
                .iter()
                .find(|t| t.name == name)
                .map(|t| t.estimated_mb)
                .unwrap_or(0.0)
        };
        let steps = query
            .joins
            .iter()
            .enumerate()
            .map(|(i, step)| {
                // for later steps the named left table stands in for the previous result
                let estimated_mb = estimate(&step.left).min(estimate(&step.right));
                let algorithm =
                    choose_algo(estimated_mb, self.cfg.avail_mem_mb, self.cfg.overhead_factor);
                info!(
                    step = i + 1,
                    left = %step.left,
                    right = %step.right,
                    estimated_mb,
                    avail_mem_mb = self.cfg.avail_mem_mb,
                    overhead_factor = self.cfg.overhead_factor,
                    algorithm = %algorithm,
                    "planner chose join algorithm"
                );
                PlannedStep {
                    left: step.left.clone(),
                    left_key: step.left_key.clone(),
                    right: step.right.clone(),
                    right_key: step.right_key.clone(),
                    algorithm,
                    estimated_mb,
                }
            })
            .collect();

        Ok(QueryPlan { tables, steps })
    }
}
