//! Identifiers for execution-scoped and invocation-scoped scratch directories.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::error::Result;

/// Fresh identifier for one join invocation or one query execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScratchId(
    /// Raw uuid value.
    pub Uuid,
);

impl ScratchId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ScratchId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ScratchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Create `<root>/<prefix>_<fresh id>` and return its path.
///
/// Every call yields a directory no other call has produced, so two invocations never share
/// partition or run files.
pub fn create_scratch_dir(root: &Path, prefix: &str) -> Result<PathBuf> {
    let dir = root.join(format!("{prefix}_{}", ScratchId::new()));
    fs::create_dir_all(&dir)?;
    Ok(dir)
}
