//! Query executor: plan, column-pruned loads, chained joins, aggregation.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Instant;

use arrow::record_batch::RecordBatch;
use nq_common::{create_scratch_dir, global_metrics, EngineConfig, NqError, Result};
use nq_execution::{HashPartitionJoin, JoinEngine, JoinInput, SortMergeJoin};
use nq_planner::{JoinAlgorithm, PlannerConfig, QueryDescriptor, QueryPlan, QueryPlanner};
use nq_storage::{Catalog, ColumnarTable};
use tracing::info;

use crate::aggregation::aggregate;

/// Replace the planner's algorithm choice without touching the planner.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum AlgorithmOverride {
    /// Use what the planner chose.
    #[default]
    Planner,
    /// Same algorithm for every step.
    All(JoinAlgorithm),
    /// Per step, by position; `None` or a missing entry keeps the planner's choice.
    PerStep(Vec<Option<JoinAlgorithm>>),
}

impl AlgorithmOverride {
    pub fn for_step(&self, step: usize) -> Option<JoinAlgorithm> {
        match self {
            Self::Planner => None,
            Self::All(a) => Some(*a),
            Self::PerStep(steps) => steps.get(step).copied().flatten(),
        }
    }
}

/// Outcome of one execution.
#[derive(Debug, Clone)]
pub struct QueryResult {
    pub batch: RecordBatch,
    /// The plan actually executed, overrides applied.
    pub plan: QueryPlan,
    /// Execution-scoped directory holding every intermediate table.
    pub work_dir: PathBuf,
}

pub struct QueryExecutor {
    catalog: Catalog,
    config: EngineConfig,
    planner: QueryPlanner,
    overrides: AlgorithmOverride,
}

impl QueryExecutor {
    pub fn new(catalog: Catalog, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let planner = QueryPlanner::new(PlannerConfig::from(&config));
        Ok(Self {
            catalog,
            config,
            planner,
            overrides: AlgorithmOverride::Planner,
        })
    }

    /// Plan with `planner` instead of one built from the engine configuration.
    pub fn with_planner(mut self, planner: QueryPlanner) -> Self {
        self.planner = planner;
        self
    }

    pub fn with_override(mut self, overrides: AlgorithmOverride) -> Self {
        self.overrides = overrides;
        self
    }

    /// Plan with overrides applied; reads table metadata only.
    pub fn plan(&self, query: &QueryDescriptor) -> Result<QueryPlan> {
        let mut plan = self.planner.plan(&self.catalog, query)?;
        for (i, step) in plan.steps.iter_mut().enumerate() {
            if let Some(forced) = self.overrides.for_step(i) {
                if forced != step.algorithm {
                    info!(
                        step = i + 1,
                        planned = %step.algorithm,
                        forced = %forced,
                        "join algorithm overridden"
                    );
                }
                step.algorithm = forced;
            }
        }
        Ok(plan)
    }

    /// Run `query` end to end. Any failing step aborts the execution; intermediate files stay in
    /// the returned (or logged) working directory.
    pub fn execute(&self, query: &QueryDescriptor) -> Result<QueryResult> {
        let started = Instant::now();
        let plan = self.plan(query)?;
        let work_dir = create_scratch_dir(&self.config.working_dir, "exec")?;
        info!(work_dir = %work_dir.display(), "execution started");

        let mut loaded = BTreeMap::new();
        for table in &plan.tables {
            let pruned = self.load_pruned(&table.name, &table.columns, &work_dir)?;
            loaded.insert(table.name.clone(), pruned);
        }

        let mut current: Option<ColumnarTable> = None;
        for (i, step) in plan.steps.iter().enumerate() {
            let right_table = lookup(&loaded, &step.right)?;
            let left = match current.take() {
                // previous result is already exactly what the remaining steps need
                Some(prev) => JoinInput::new(prev, &step.left_key),
                None => JoinInput::new(lookup(&loaded, &step.left)?, &step.left_key)
                    .with_projection(Some(plan.columns(&step.left)?.to_vec())),
            };
            let right = JoinInput::new(right_table, &step.right_key)
                .with_projection(Some(plan.columns(&step.right)?.to_vec()));

            let engine = self.engine_for(step.algorithm);
            let step_started = Instant::now();
            let out = engine.join(&left, &right, &work_dir)?;
            info!(
                step = i + 1,
                algorithm = %step.algorithm,
                left = %left.table.name(),
                right = %step.right,
                rows = out.rows,
                output = %out.table.path().display(),
                elapsed_ms = step_started.elapsed().as_millis() as u64,
                "join step finished"
            );
            current = Some(out.table);
        }

        let joined = current
            .ok_or_else(|| NqError::Planning("query has no join steps".to_string()))?;
        let batch = aggregate(&joined, query, self.config.batch_size_rows)?;
        info!(
            rows = batch.num_rows(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "execution finished"
        );
        Ok(QueryResult {
            batch,
            plan,
            work_dir,
        })
    }

    fn engine_for(&self, algorithm: JoinAlgorithm) -> Box<dyn JoinEngine> {
        match algorithm {
            JoinAlgorithm::HashPartition => Box::new(HashPartitionJoin::from_config(&self.config)),
            JoinAlgorithm::SortMerge => Box::new(SortMergeJoin::from_config(&self.config)),
        }
    }

    /// Stream `columns` of a base table into `<work_dir>/<name>_loaded.parquet`.
    fn load_pruned(
        &self,
        name: &str,
        columns: &[String],
        work_dir: &std::path::Path,
    ) -> Result<ColumnarTable> {
        let started = Instant::now();
        let source = self.catalog.table(name)?;
        let reader = source.read_batches(Some(columns), self.config.batch_size_rows)?;
        let schema = reader.schema();
        let target = ColumnarTable::create_in(format!("{name}_loaded"), work_dir)?;
        let mut writer =
            target.create_writer_with_row_groups(schema, self.config.row_group_rows)?;
        for batch in reader {
            writer.write(&batch?)?;
        }
        let summary = writer.close()?;
        global_metrics().record_operator(
            "PrunedLoad",
            summary.rows,
            summary.rows,
            summary.batches,
            started.elapsed().as_secs_f64(),
        );
        info!(
            table = name,
            columns = ?columns,
            rows = summary.rows,
            path = %target.path().display(),
            "loaded pruned table"
        );
        // joins address the working copy under the base table name
        Ok(ColumnarTable::open(name, target.path()))
    }
}

fn lookup(loaded: &BTreeMap<String, ColumnarTable>, name: &str) -> Result<ColumnarTable> {
    loaded
        .get(name)
        .cloned()
        .ok_or_else(|| NqError::Planning(format!("table {name} was not loaded")))
}
