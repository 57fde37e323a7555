//! Footprint estimation and the HPJ/SMJ threshold rule.

use std::fmt;

use nq_storage::TableMetadata;
use serde::{Deserialize, Serialize};

/// Join algorithm chosen for one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JoinAlgorithm {
    /// Partitioned hash join.
    #[serde(rename = "HPJ")]
    HashPartition,
    /// External sort-merge join.
    #[serde(rename = "SMJ")]
    SortMerge,
}

impl JoinAlgorithm {
    pub fn short_name(&self) -> &'static str {
        match self {
            Self::HashPartition => "HPJ",
            Self::SortMerge => "SMJ",
        }
    }
}

impl fmt::Display for JoinAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short_name())
    }
}

/// In-memory footprint estimate of reading `columns` of a table.
pub trait CostModel: Send + Sync {
    fn estimate_mb(&self, meta: &TableMetadata, columns: &[String]) -> f64;
}

/// 8 bytes per value, whatever the column type.
///
/// Variable-width columns are underestimated; the estimate only feeds a threshold decision.
#[derive(Debug, Clone, Copy, Default)]
pub struct NaiveCostModel;

impl NaiveCostModel {
    pub const BYTES_PER_VALUE: f64 = 8.0;
}

impl CostModel for NaiveCostModel {
    fn estimate_mb(&self, meta: &TableMetadata, columns: &[String]) -> f64 {
        meta.rows as f64 * Self::BYTES_PER_VALUE * columns.len() as f64 / (1024.0 * 1024.0)
    }
}

/// Hash join when `size_mb * overhead < avail_mb` (strict), otherwise sort-merge.
pub fn choose_algo(size_mb: f64, avail_mb: f64, overhead: f64) -> JoinAlgorithm {
    if size_mb * overhead < avail_mb {
        JoinAlgorithm::HashPartition
    } else {
        JoinAlgorithm::SortMerge
    }
}

#[cfg(test)]
mod tests {
    use nq_storage::TableMetadata;

    use super::{choose_algo, CostModel, JoinAlgorithm, NaiveCostModel};

    #[test]
    fn threshold_is_strict() {
        assert_eq!(choose_algo(1999.0, 10_000.0, 5.0), JoinAlgorithm::HashPartition);
        assert_eq!(choose_algo(2000.0, 10_000.0, 5.0), JoinAlgorithm::SortMerge);
        assert_eq!(choose_algo(2001.0, 10_000.0, 5.0), JoinAlgorithm::SortMerge);
        assert_eq!(choose_algo(0.0, 10_000.0, 5.0), JoinAlgorithm::HashPartition);
    }

    #[test]
    fn naive_model_counts_eight_bytes_per_value() {
        let meta = TableMetadata {
            rows: 1024 * 1024,
            columns: vec!["a".into(), "b".into(), "c".into()],
            row_groups: 1,
            disk_bytes: 0,
        };
        let cols = vec!["a".to_string(), "b".to_string()];
        assert_eq!(NaiveCostModel.estimate_mb(&meta, &cols), 16.0);
    }

    #[test]
    fn algorithm_names_serialize_short() {
        assert_eq!(JoinAlgorithm::SortMerge.to_string(), "SMJ");
        assert_eq!(
            serde_json::to_string(&JoinAlgorithm::SortMerge).expect("json"),
            "\"SMJ\""
        );
    }
}
