#![deny(missing_docs)]

//! Out-of-core equi-join engines.
//!
//! Architecture role:
//! - key extraction and deterministic bucket hashing shared by both engines
//! - join output schema and buffered output writing
//! - partitioned hash join (spill both sides to B buckets, build on the smaller side per bucket)
//! - external sort-merge join (sorted runs, k-way merge, streaming many-to-many merge)
//!
//! Key modules:
//! - [`key`]
//! - [`output`]
//! - [`hash_join`]
//! - [`sort_merge_join`]
//!
//! Every invocation works inside its own fresh subdirectory of the caller's scratch root, so
//! joins never share partition or run files.

pub mod hash_join;
pub mod key;
pub mod output;
pub mod sort_merge_join;

use std::path::{Path, PathBuf};

use nq_common::{NqError, Result};
use nq_storage::ColumnarTable;

pub use hash_join::HashPartitionJoin;
pub use key::{bucket, extract_keys, KeyClass, KeyValue};
pub use output::JoinSchema;
pub use sort_merge_join::SortMergeJoin;

/// One side of an equi-join.
#[derive(Debug, Clone)]
pub struct JoinInput {
    /// Table to read.
    pub table: ColumnarTable,
    /// Join key column name.
    pub key: String,
    /// Columns to read; `None` reads every column.
    pub projection: Option<Vec<String>>,
}

impl JoinInput {
    /// Join `table` on `key`, reading all columns.
    pub fn new(table: ColumnarTable, key: impl Into<String>) -> Self {
        Self {
            table,
            key: key.into(),
            projection: None,
        }
    }

    /// Restrict the columns read from this side. The key must be among them.
    pub fn with_projection(mut self, columns: Option<Vec<String>>) -> Self {
        self.projection = columns;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if let Some(cols) = &self.projection {
            if !cols.iter().any(|c| c == &self.key) {
                return Err(NqError::InvalidConfig(format!(
                    "table {}: join key '{}' missing from projection {:?}",
                    self.table.name(),
                    self.key,
                    cols
                )));
            }
        }
        Ok(())
    }
}

/// Result of one join invocation.
#[derive(Debug, Clone)]
pub struct JoinOutput {
    /// Joined table, written under `work_dir`.
    pub table: ColumnarTable,
    /// Fresh subdirectory owned by this invocation.
    pub work_dir: PathBuf,
    /// Rows written to `table`.
    pub rows: u64,
}

/// A join algorithm that consumes two on-disk tables and produces a third.
pub trait JoinEngine: Send + Sync {
    /// Operator name used in logs and metrics.
    fn name(&self) -> &'static str;

    /// Inner equi-join of `left` and `right`; all artifacts go below `scratch_root`.
    ///
    /// # Errors
    /// Returns an error for missing columns, incompatible key types, or any I/O failure while
    /// writing partitions/runs/output. Empty inputs are not errors.
    fn join(&self, left: &JoinInput, right: &JoinInput, scratch_root: &Path)
        -> Result<JoinOutput>;
}
