#![allow(dead_code)]

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use arrow::array::{ArrayRef, Float64Array, Int64Array, StringArray};
use arrow::record_batch::RecordBatch;
use arrow_schema::{DataType, Field, Schema};
use nq_common::EngineConfig;
use nq_storage::Catalog;
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

/// The small Songs/Listens/Users case with duplicate songs and duplicate users.
///
/// Songs carries an extra `artist` column and Listens an extra `listen_id`, neither of which the
/// query reads.
pub fn write_seed_tables(dir: &Path) -> Catalog {
    let songs = dir.join("Songs.parquet");
    write_parquet(
        &songs,
        Arc::new(Schema::new(vec![
            Field::new("song_id", DataType::Int64, false),
            Field::new("title", DataType::Utf8, false),
            Field::new("artist", DataType::Utf8, false),
        ])),
        vec![
            Arc::new(Int64Array::from(vec![1_i64, 1, 2, 3])),
            Arc::new(StringArray::from(vec!["A", "A", "B", "C"])),
            Arc::new(StringArray::from(vec!["x", "x", "y", "z"])),
        ],
    );
    let listens = dir.join("Listens.parquet");
    write_parquet(
        &listens,
        Arc::new(Schema::new(vec![
            Field::new("listen_id", DataType::Int64, false),
            Field::new("song_id", DataType::Int64, false),
            Field::new("user_id", DataType::Int64, false),
        ])),
        vec![
            Arc::new(Int64Array::from(vec![100_i64, 101, 102, 103, 104])),
            Arc::new(Int64Array::from(vec![1_i64, 1, 2, 2, 3])),
            Arc::new(Int64Array::from(vec![10_i64, 11, 11, 12, 10])),
        ],
    );
    let users = dir.join("Users.parquet");
    write_parquet(
        &users,
        Arc::new(Schema::new(vec![
            Field::new("user_id", DataType::Int64, false),
            Field::new("age", DataType::Int64, false),
        ])),
        vec![
            Arc::new(Int64Array::from(vec![10_i64, 11, 11, 12])),
            Arc::new(Int64Array::from(vec![20_i64, 30, 40, 50])),
        ],
    );
    Catalog::new()
        .with_table("Songs", songs)
        .with_table("Listens", listens)
        .with_table("Users", users)
}

/// Tiny batch, partition and run sizes so every spill path is taken.
pub fn small_config(working_dir: &Path) -> EngineConfig {
    EngineConfig {
        batch_size_rows: 2,
        hash_partitions: 3,
        run_rows: 2,
        merge_batch_rows: 3,
        row_group_rows: 2,
        working_dir: working_dir.to_path_buf(),
        ..EngineConfig::default()
    }
}

/// `(song_id, avg_age, count_distinct_users)` rows in result order.
pub fn result_rows(batch: &RecordBatch) -> Vec<(i64, f64, i64)> {
    let ids = batch
        .column(0)
        .as_any()
        .downcast_ref::<Int64Array>()
        .expect("song_id");
    let avg = batch
        .column(1)
        .as_any()
        .downcast_ref::<Float64Array>()
        .expect("avg_age");
    let cnt = batch
        .column(2)
        .as_any()
        .downcast_ref::<Int64Array>()
        .expect("count_distinct_users");
    (0..batch.num_rows())
        .map(|i| (ids.value(i), avg.value(i), cnt.value(i)))
        .collect()
}
