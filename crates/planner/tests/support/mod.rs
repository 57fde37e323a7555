#![allow(dead_code)]

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use arrow::array::{ArrayRef, Int64Array, StringArray};
use arrow::record_batch::RecordBatch;
use arrow_schema::{DataType, Field, Schema};
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

fn int_col(rows: usize, base: i64) -> ArrayRef {
    Arc::new(Int64Array::from(
        (0..rows as i64).map(|i| base + i).collect::<Vec<_>>(),
    ))
}

/// Songs / Listens / Users with extra columns the query never reads.
pub fn write_music_tables(dir: &Path, songs: usize, listens: usize, users: usize) -> Catalog {
    let songs_path = dir.join("Songs.parquet");
    write_parquet(
        &songs_path,
        Arc::new(Schema::new(vec![
            Field::new("song_id", DataType::Int64, false),
            Field::new("title", DataType::Utf8, false),
            Field::new("artist", DataType::Utf8, false),
            Field::new("duration", DataType::Int64, false),
        ])),
        vec![
            int_col(songs, 1),
            Arc::new(StringArray::from(
                (0..songs).map(|i| format!("t{i}")).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                (0..songs).map(|i| format!("a{i}")).collect::<Vec<_>>(),
            )),
            int_col(songs, 180),
        ],
    );
    let listens_path = dir.join("Listens.parquet");
    write_parquet(
        &listens_path,
        Arc::new(Schema::new(vec![
            Field::new("listen_id", DataType::Int64, false),
            Field::new("song_id", DataType::Int64, false),
            Field::new("user_id", DataType::Int64, false),
            Field::new("ts", DataType::Int64, false),
        ])),
        vec![
            int_col(listens, 100),
            int_col(listens, 1),
            int_col(listens, 10),
            int_col(listens, 0),
        ],
    );
    let users_path = dir.join("Users.parquet");
    write_parquet(
        &users_path,
        Arc::new(Schema::new(vec![
            Field::new("user_id", DataType::Int64, false),
            Field::new("age", DataType::Int64, false),
            Field::new("country", DataType::Utf8, false),
        ])),
        vec![
            int_col(users, 10),
            int_col(users, 20),
            Arc::new(StringArray::from(vec!["x"; users])),
        ],
    );
    Catalog::new()
        .with_table("Songs", songs_path)
        .with_table("Listens", listens_path)
        .with_table("Users", users_path)
}
