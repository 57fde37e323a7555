use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::record_batch::RecordBatch;
use arrow_schema::{Schema, SchemaRef};
use nq_common::{NqError, Result};
use parquet::arrow::arrow_reader::{ParquetRecordBatchReader, ParquetRecordBatchReaderBuilder};
use parquet::arrow::{ArrowWriter, ProjectionMask};
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use tracing::debug;

use crate::stats::TableMetadata;

const DEFAULT_ROW_GROUP_ROWS: usize = 50_000;

/// Handle to one logical table stored as a single parquet file.
///
/// The handle is cheap; nothing is opened until a read, write or metadata call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnarTable {
    name: String,
    path: PathBuf,
}

impl ColumnarTable {
    /// Table `<dir>/<name>.parquet`, creating `dir` if needed.
    pub fn create_in(name: impl Into<String>, dir: &Path) -> Result<Self> {
        let name = name.into();
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("{name}.parquet"));
        Ok(Self { name, path })
    }

    /// Handle for an existing file.
    pub fn open(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn reader_builder(&self) -> Result<ParquetRecordBatchReaderBuilder<File>> {
        let file = File::open(&self.path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                NqError::InvalidConfig(format!(
                    "table {}: file not found at {}",
                    self.name,
                    self.path.display()
                ))
            } else {
                NqError::Io(e)
            }
        })?;
        ParquetRecordBatchReaderBuilder::try_new(file).map_err(|e| {
            NqError::InvalidConfig(format!(
                "table {}: unreadable parquet footer at {}: {e}",
                self.name,
                self.path.display()
            ))
        })
    }

    /// Row count, column names, row-group count and file size from the footer only.
    pub fn metadata(&self) -> Result<TableMetadata> {
        let builder = self.reader_builder()?;
        let meta = builder.metadata();
        let rows = meta
            .row_groups()
            .iter()
            .map(|rg| rg.num_rows().max(0) as u64)
            .sum();
        let columns = builder
            .schema()
            .fields()
            .iter()
            .map(|f| f.name().clone())
            .collect();
        Ok(TableMetadata {
            rows,
            columns,
            row_groups: meta.num_row_groups(),
            disk_bytes: fs::metadata(&self.path)?.len(),
        })
    }

    /// Row count from the footer.
    pub fn num_rows(&self) -> Result<u64> {
        Ok(self.metadata()?.rows)
    }

    /// Schema of the table, optionally narrowed to `projection` in the requested order.
    pub fn schema(&self, projection: Option<&[String]>) -> Result<SchemaRef> {
        let builder = self.reader_builder()?;
        let file_schema = builder.schema().clone();
        match projection {
            None => Ok(plain_schema(&file_schema, None)),
            Some(cols) => {
                let idx = self.resolve_projection(&file_schema, cols)?;
                Ok(plain_schema(&file_schema, Some(&idx)))
            }
        }
    }

    fn resolve_projection(&self, schema: &SchemaRef, cols: &[String]) -> Result<Vec<usize>> {
        let mut out = Vec::with_capacity(cols.len());
        for c in cols {
            let idx = schema.index_of(c).map_err(|_| {
                NqError::InvalidConfig(format!(
                    "table {}: column '{c}' not found (have: {})",
                    self.name,
                    schema
                        .fields()
                        .iter()
                        .map(|f| f.name().as_str())
                        .collect::<Vec<_>>()
                        .join(",")
                ))
            })?;
            if out.contains(&idx) {
                return Err(NqError::InvalidConfig(format!(
                    "table {}: column '{c}' requested twice",
                    self.name
                )));
            }
            out.push(idx);
        }
        Ok(out)
    }

    /// Stream the table in batches of at most `batch_size` rows, in file order.
    ///
    /// With a projection only those columns are decoded, and they are returned in the order
    /// given rather than file order.
    pub fn read_batches(
        &self,
        projection: Option<&[String]>,
        batch_size: usize,
    ) -> Result<TableBatchReader> {
        let builder = self.reader_builder()?;
        let file_schema = builder.schema().clone();
        let (builder, schema, reorder) = match projection {
            None => (builder, plain_schema(&file_schema, None), None),
            Some(cols) => {
                let idx = self.resolve_projection(&file_schema, cols)?;
                let mut sorted = idx.clone();
                sorted.sort_unstable();
                // parquet yields projected columns in file order; map back to requested order
                let reorder = idx
                    .iter()
                    .map(|i| sorted.iter().position(|s| s == i).unwrap_or_default())
                    .collect::<Vec<_>>();
                let mask = ProjectionMask::roots(builder.parquet_schema(), sorted);
                (
                    builder.with_projection(mask),
                    plain_schema(&file_schema, Some(&idx)),
                    Some(reorder),
                )
            }
        };
        let inner = builder
            .with_batch_size(batch_size.max(1))
            .build()
            .map_err(|e| NqError::Execution(format!("parquet reader open failed: {e}")))?;
        debug!(table = %self.name, path = %self.path.display(), batch_size, "open batch reader");
        Ok(TableBatchReader {
            inner,
            schema,
            reorder,
        })
    }

    /// Open a single-pass writer; an existing file is replaced.
    pub fn create_writer(&self, schema: SchemaRef) -> Result<TableWriter> {
        self.create_writer_with_row_groups(schema, DEFAULT_ROW_GROUP_ROWS)
    }

    pub fn create_writer_with_row_groups(
        &self,
        schema: SchemaRef,
        row_group_rows: usize,
    ) -> Result<TableWriter> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(&self.path)?;
        let props = WriterProperties::builder()
            .set_compression(Compression::SNAPPY)
            .set_max_row_group_size(row_group_rows.max(1))
            .build();
        let writer = ArrowWriter::try_new(file, schema.clone(), Some(props))
            .map_err(|e| NqError::Execution(format!("parquet writer init failed: {e}")))?;
        Ok(TableWriter {
            writer,
            schema,
            path: self.path.clone(),
            rows: 0,
            batches: 0,
        })
    }

    /// Write every batch of `batches` as the full content of this table.
    pub fn write_all<I>(&self, schema: SchemaRef, batches: I) -> Result<WriteSummary>
    where
        I: IntoIterator<Item = Result<RecordBatch>>,
    {
        let mut writer = self.create_writer(schema)?;
        for batch in batches {
            writer.write(&batch?)?;
        }
        writer.close()
    }

    /// Read the whole table into memory. Intended for small results and tests.
    pub fn read_all(&self, projection: Option<&[String]>) -> Result<Vec<RecordBatch>> {
        self.read_batches(projection, 8192)?.collect()
    }
}

/// Strip schema-level metadata so batches from different files concatenate and write cleanly.
fn plain_schema(schema: &SchemaRef, idx: Option<&[usize]>) -> SchemaRef {
    let fields = match idx {
        None => schema.fields().iter().cloned().collect::<Vec<_>>(),
        Some(idx) => idx.iter().map(|i| schema.fields()[*i].clone()).collect(),
    };
    Arc::new(Schema::new(fields))
}

/// Iterator over the batches of one table.
pub struct TableBatchReader {
    inner: ParquetRecordBatchReader,
    schema: SchemaRef,
    reorder: Option<Vec<usize>>,
}

impl TableBatchReader {
    pub fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }
}

impl Iterator for TableBatchReader {
    type Item = Result<RecordBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        let batch = match self.inner.next()? {
            Ok(b) => b,
            Err(e) => {
                return Some(Err(NqError::Execution(format!(
                    "parquet decode failed: {e}"
                ))))
            }
        };
        let columns = match &self.reorder {
            None => batch.columns().to_vec(),
            Some(order) => order.iter().map(|i| batch.column(*i).clone()).collect(),
        };
        Some(
            RecordBatch::try_new(self.schema.clone(), columns)
                .map_err(|e| NqError::Execution(format!("batch rebuild failed: {e}"))),
        )
    }
}

/// Result of closing a [`TableWriter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteSummary {
    pub rows: u64,
    pub batches: u64,
    pub bytes: u64,
}

/// Streaming, append-only writer for one table file.
pub struct TableWriter {
    writer: ArrowWriter<File>,
    schema: SchemaRef,
    path: PathBuf,
    rows: u64,
    batches: u64,
}

impl TableWriter {
    pub fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    pub fn write(&mut self, batch: &RecordBatch) -> Result<()> {
        if batch.num_rows() == 0 {
            return Ok(());
        }
        self.writer
            .write(batch)
            .map_err(|e| NqError::Execution(format!("parquet write failed: {e}")))?;
        self.rows += batch.num_rows() as u64;
        self.batches += 1;
        Ok(())
    }

    /// Flush the footer. A writer that never saw a row still produces a valid, empty table.
    pub fn close(self) -> Result<WriteSummary> {
        self.writer
            .close()
            .map_err(|e| NqError::Execution(format!("parquet close failed: {e}")))?;
        Ok(WriteSummary {
            rows: self.rows,
            batches: self.batches,
            bytes: fs::metadata(&self.path)?.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow::array::{Int64Array, StringArray};
    use arrow::record_batch::RecordBatch;
    use arrow_schema::{DataType, Field, Schema};

    use super::ColumnarTable;

    fn temp_dir() -> std::path::PathBuf {
        std::env::temp_dir().join(format!("nq_table_test_{}", nq_common::ScratchId::new()))
    }

    fn songs_batch() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("song_id", DataType::Int64, false),
            Field::new("title", DataType::Utf8, false),
            Field::new("extra", DataType::Int64, false),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(vec![1_i64, 2, 3, 4, 5])),
                Arc::new(StringArray::from(vec!["A", "B", "C", "D", "E"])),
                Arc::new(Int64Array::from(vec![0_i64; 5])),
            ],
        )
        .expect("batch")
    }

    #[test]
    fn projected_read_follows_requested_order_in_batches() {
        let dir = temp_dir();
        let table = ColumnarTable::create_in("Songs", &dir).expect("table");
        let batch = songs_batch();
        let summary = table
            .write_all(batch.schema(), vec![Ok(batch)])
            .expect("write");
        assert_eq!(summary.rows, 5);

        let cols = vec!["title".to_string(), "song_id".to_string()];
        let batches = table
            .read_batches(Some(&cols), 2)
            .expect("reader")
            .collect::<nq_common::Result<Vec<_>>>()
            .expect("read");
        assert_eq!(batches.len(), 3);
        assert!(batches.iter().all(|b| b.num_rows() <= 2));
        let schema = batches[0].schema();
        assert_eq!(schema.field(0).name(), "title");
        assert_eq!(schema.field(1).name(), "song_id");
        assert_eq!(schema.fields().len(), 2);

        let meta = table.metadata().expect("meta");
        assert_eq!(meta.rows, 5);
        assert_eq!(meta.columns, vec!["song_id", "title", "extra"]);
        assert!(meta.row_groups >= 1);
        assert!(meta.disk_bytes > 0);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn empty_writer_produces_schema_valid_table() {
        let dir = temp_dir();
        let table = ColumnarTable::create_in("Empty", &dir).expect("table");
        let schema = songs_batch().schema();
        let writer = table.create_writer(schema.clone()).expect("writer");
        let summary = writer.close().expect("close");
        assert_eq!(summary.rows, 0);
        assert_eq!(table.num_rows().expect("rows"), 0);
        assert_eq!(table.schema(None).expect("schema").fields().len(), 3);
        assert!(table.read_all(None).expect("read").is_empty());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn unknown_column_is_config_error() {
        let dir = temp_dir();
        let table = ColumnarTable::create_in("Songs", &dir).expect("table");
        let batch = songs_batch();
        table.write_all(batch.schema(), vec![Ok(batch)]).expect("write");
        let err = table
            .read_batches(Some(&["nope".to_string()]), 10)
            .err()
            .expect("missing column");
        assert!(err.to_string().contains("invalid configuration"));
        let _ = std::fs::remove_dir_all(dir);
    }
}
