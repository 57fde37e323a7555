use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use nq_common::{NqError, Result};

use crate::table::ColumnarTable;

/// Table name -> parquet file location.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    tables: BTreeMap<String, PathBuf>,
}

impl Catalog {
    pub fn new() -> Self {
        Self {
            tables: BTreeMap::new(),
        }
    }

    pub fn register_table(&mut self, name: impl Into<String>, path: impl Into<PathBuf>) {
        self.tables.insert(name.into(), path.into());
    }

    pub fn with_table(mut self, name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.register_table(name, path);
        self
    }

    pub fn path(&self, name: &str) -> Result<&Path> {
        self.tables
            .get(name)
            .map(PathBuf::as_path)
            .ok_or_else(|| NqError::InvalidConfig(format!("no location registered for table {name}")))
    }

    /// Open the registered file for `name` as a table handle.
    pub fn table(&self, name: &str) -> Result<ColumnarTable> {
        let path = self.path(name)?;
        if !path.is_file() {
            return Err(NqError::InvalidConfig(format!(
                "table {name}: file not found at {}",
                path.display()
            )));
        }
        Ok(ColumnarTable::open(name, path))
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.keys().cloned().collect()
    }

    /// Load `{ "Songs": "data/Songs.parquet", ... }`.
    pub fn load_from_json(path: impl AsRef<Path>) -> Result<Self> {
        let s = fs::read_to_string(path.as_ref())?;
        let tables: BTreeMap<String, PathBuf> =
            serde_json::from_str(&s).map_err(|e| NqError::InvalidConfig(e.to_string()))?;
        let mut cat = Catalog::new();
        for (name, p) in tables {
            cat.register_table(name, p);
        }
        Ok(cat)
    }
}

#[cfg(test)]
mod tests {
    use super::Catalog;

    #[test]
    fn unknown_table_is_config_error() {
        let cat = Catalog::new().with_table("Songs", "/nonexistent/Songs.parquet");
        let err = cat.path("Users").expect_err("missing");
        assert!(err.to_string().contains("Users"));
        let err = cat.table("Songs").expect_err("no file");
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn loads_json_map() {
        let path = std::env::temp_dir().join(format!(
            "nq_catalog_{}.json",
            nq_common::ScratchId::new()
        ));
        std::fs::write(&path, r#"{"Songs": "a.parquet", "Users": "b.parquet"}"#).expect("write");
        let cat = Catalog::load_from_json(&path).expect("load");
        assert_eq!(cat.table_names(), vec!["Songs".to_string(), "Users".to_string()]);
        assert_eq!(cat.path("Users").expect("users").to_string_lossy(), "b.parquet");
        let _ = std::fs::remove_file(path);
    }
}
