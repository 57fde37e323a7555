#![allow(dead_code)]

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use arrow::array::ArrayRef;
use arrow::record_batch::RecordBatch;
use arrow::util::display::array_value_to_string;
use arrow_schema::Schema;
use nq_execution::JoinOutput;
use nq_storage::ColumnarTable;
use parquet::arrow::ArrowWriter;

pub fn unique_dir(prefix: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock before epoch")
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("{prefix}_{nanos}"));
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

pub fn write_parquet(path: &Path, schema: Arc<Schema>, cols: Vec<ArrayRef>) {
    let batch = RecordBatch::try_new(schema.clone(), cols).expect("build batch");
    let file = File::create(path).expect("create parquet");
    let mut writer = ArrowWriter::try_new(file, schema, None).expect("writer");
    writer.write(&batch).expect("write");
    writer.close().expect("close");
}

pub fn write_table(
    dir: &Path,
    name: &str,
    schema: Arc<Schema>,
    cols: Vec<ArrayRef>,
) -> ColumnarTable {
    let path = dir.join(format!("{name}.parquet"));
    write_parquet(&path, schema, cols);
    ColumnarTable::open(name, path)
}

/// Rows rendered as `a|b|c` strings, sorted, so outputs of different engines compare equal.
pub fn snapshot_rows(batches: &[RecordBatch]) -> Vec<String> {
    let mut rows = Vec::new();
    for batch in batches {
        for row in 0..batch.num_rows() {
            let cells = batch
                .columns()
                .iter()
                .map(|c| array_value_to_string(c, row).expect("render cell"))
                .collect::<Vec<_>>();
            rows.push(cells.join("|"));
        }
    }
    rows.sort();
    rows
}

pub fn output_snapshot(out: &JoinOutput) -> Vec<String> {
    snapshot_rows(&out.table.read_all(None).expect("read join output"))
}

pub fn column_names(out: &JoinOutput) -> Vec<String> {
    out.table
        .schema(None)
        .expect("output schema")
        .fields()
        .iter()
        .map(|f| f.name().clone())
        .collect()
}
