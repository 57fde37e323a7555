use serde::{Deserialize, Serialize};

/// Footer-level facts about a table file, read without materialising rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableMetadata {
    pub rows: u64,
    pub columns: Vec<String>,
    pub row_groups: usize,
    pub disk_bytes: u64,
}

impl TableMetadata {
    pub fn disk_mb(&self) -> f64 {
        self.disk_bytes as f64 / (1024.0 * 1024.0)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c == name)
    }
}
