use std::fs::File;
use std::path::PathBuf;

use arrow::util::pretty::pretty_format_batches;
use clap::{Parser, ValueEnum};
use nq_client::{AlgorithmOverride, QueryExecutor};
use nq_common::{global_metrics, EngineConfig, NqError};
use nq_planner::{explain_plan, JoinAlgorithm, QueryDescriptor};
use nq_storage::Catalog;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum AlgoArg {
    Hpj,
    Smj,
}

impl From<AlgoArg> for JoinAlgorithm {
    fn from(a: AlgoArg) -> Self {
        match a {
            AlgoArg::Hpj => JoinAlgorithm::HashPartition,
            AlgoArg::Smj => JoinAlgorithm::SortMerge,
        }
    }
}

/// nanoquery: average listener age and distinct listeners per song, joined out of core.
#[derive(Debug, Parser)]
#[command(name = "nanoquery", version)]
struct Args {
    /// JSON map of table name to parquet path
    #[arg(long)]
    catalog: Option<PathBuf>,

    /// Songs table (overrides the catalog entry)
    #[arg(long)]
    songs: Option<PathBuf>,

    /// Listens table (overrides the catalog entry)
    #[arg(long)]
    listens: Option<PathBuf>,

    /// Users table (overrides the catalog entry)
    #[arg(long)]
    users: Option<PathBuf>,

    /// Root for intermediate tables, partitions and runs
    #[arg(long)]
    working_dir: Option<PathBuf>,

    /// Engine config JSON
    #[arg(long)]
    config: Option<PathBuf>,

    /// Force one algorithm for every join step
    #[arg(long, value_enum, conflicts_with_all = ["force_step1", "force_step2"])]
    force: Option<AlgoArg>,

    #[arg(long, value_enum)]
    force_step1: Option<AlgoArg>,

    #[arg(long, value_enum)]
    force_step2: Option<AlgoArg>,

    /// Print the plan and exit without reading rows
    #[arg(long)]
    plan_only: bool,

    /// Write the result as CSV
    #[arg(long)]
    output: Option<PathBuf>,

    /// Print prometheus metrics after the run
    #[arg(long)]
    metrics: bool,
}

impl Args {
    fn overrides(&self) -> AlgorithmOverride {
        if let Some(a) = self.force {
            return AlgorithmOverride::All(a.into());
        }
        if self.force_step1.is_none() && self.force_step2.is_none() {
            return AlgorithmOverride::Planner;
        }
        AlgorithmOverride::PerStep(vec![
            self.force_step1.map(Into::into),
            self.force_step2.map(Into::into),
        ])
    }

    fn catalog(&self) -> Result<Catalog, NqError> {
        let mut catalog = match &self.catalog {
            Some(path) => Catalog::load_from_json(path)?,
            None => Catalog::new(),
        };
        for (name, path) in [
            ("Songs", &self.songs),
            ("Listens", &self.listens),
            ("Users", &self.users),
        ] {
            if let Some(p) = path {
                catalog.register_table(name, p.clone());
            }
        }
        Ok(catalog)
    }

    fn engine_config(&self) -> Result<EngineConfig, NqError> {
        let mut cfg = match &self.config {
            Some(path) => EngineConfig::from_json_file(path)?,
            None => EngineConfig::default(),
        };
        if let Some(dir) = &self.working_dir {
            cfg.working_dir = dir.clone();
        }
        Ok(cfg)
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(Args::parse()) {
        eprintln!("nanoquery: {e}");
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let query = QueryDescriptor::listens_by_song();
    let executor = QueryExecutor::new(args.catalog()?, args.engine_config()?)?
        .with_override(args.overrides());
    debug!(sql = %query.sql(), "query");

    if args.plan_only {
        let plan = executor.plan(&query)?;
        println!("{}\n", query.sql());
        print!("{}", explain_plan(&plan));
        return Ok(());
    }

    let result = executor.execute(&query)?;
    print!("{}", explain_plan(&result.plan));
    println!("{}", pretty_format_batches(std::slice::from_ref(&result.batch))?);

    if let Some(path) = &args.output {
        let mut writer = arrow::csv::Writer::new(File::create(path)?);
        writer.write(&result.batch)?;
        println!("result written to {}", path.display());
    }
    if args.metrics {
        print!("{}", global_metrics().render_prometheus());
    }
    Ok(())
}
