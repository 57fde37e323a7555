use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{NqError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Rows per batch for every streaming read (partitioning, probing, pruned loads).
    pub batch_size_rows: usize,
    /// Number of hash-join partitions (B).
    pub hash_partitions: usize,
    /// Upper bound on rows per sorted run.
    pub run_rows: usize,
    /// Batch size for k-way merge reads and the merge-join scan; also the output flush threshold.
    pub merge_batch_rows: usize,
    /// Memory the planner may assume for one hash-join build side.
    pub avail_mem_mb: f64,
    /// Multiplier applied to the estimated build size before comparing with `avail_mem_mb`.
    pub overhead_factor: f64,
    /// Caller-owned root under which every intermediate table, partition and run is created.
    pub working_dir: PathBuf,
    /// Partition / run-sort both join sides on two threads before the build/merge phase.
    pub parallel_sides: bool,
    /// Max parquet row-group size for tables written by the engine.
    pub row_group_rows: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size_rows: 100_000,
            hash_partitions: 8,
            run_rows: 250_000,
            merge_batch_rows: 200_000,
            avail_mem_mb: 10_000.0,
            overhead_factor: 5.0,
            working_dir: PathBuf::from("temp"),
            parallel_sides: false,
            row_group_rows: 50_000,
        }
    }
}

impl EngineConfig {
    /// Load a config from a JSON file; absent fields keep their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let s = fs::read_to_string(path).map_err(|e| {
            NqError::InvalidConfig(format!("cannot read config {}: {e}", path.display()))
        })?;
        let cfg: EngineConfig =
            serde_json::from_str(&s).map_err(|e| NqError::InvalidConfig(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("batch_size_rows", self.batch_size_rows),
            ("hash_partitions", self.hash_partitions),
            ("run_rows", self.run_rows),
            ("merge_batch_rows", self.merge_batch_rows),
            ("row_group_rows", self.row_group_rows),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(NqError::InvalidConfig(format!("{name} must be > 0")));
            }
        }
        if !(self.avail_mem_mb > 0.0) {
            return Err(NqError::InvalidConfig(
                "avail_mem_mb must be a positive number".to_string(),
            ));
        }
        if !(self.overhead_factor > 0.0) {
            return Err(NqError::InvalidConfig(
                "overhead_factor must be a positive number".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::EngineConfig;

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg: EngineConfig =
            serde_json::from_str(r#"{"hash_partitions": 4, "working_dir": "/tmp/nq"}"#)
                .expect("parse");
        assert_eq!(cfg.hash_partitions, 4);
        assert_eq!(cfg.run_rows, 250_000);
        assert_eq!(cfg.overhead_factor, 5.0);
        assert_eq!(cfg.working_dir.to_string_lossy(), "/tmp/nq");
    }

    #[test]
    fn validate_rejects_zero_partitions() {
        let cfg = EngineConfig {
            hash_partitions: 0,
            ..EngineConfig::default()
        };
        assert!(cfg.validate().is_err());
        assert!(EngineConfig::default().validate().is_ok());
    }
}
