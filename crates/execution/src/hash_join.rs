//! Partitioned (grace) hash join.
//!
//! Phase 1 streams each side batch-wise and appends every row to one of B partition files by
//! [`bucket`] of its key. Phase 2 visits each bucket present on both sides, builds an in-memory
//! multi-map on the side with fewer rows and streams the other side against it. Peak memory is
//! bounded by the smaller side of a single bucket.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Instant;

use arrow::array::{Array, ArrayRef};
use arrow::compute::interleave;
use arrow::record_batch::RecordBatch;
use arrow_schema::SchemaRef;
use nq_common::{create_scratch_dir, global_metrics, EngineConfig, NqError, Result};
use nq_storage::{ColumnarTable, TableBatchReader, TableWriter};
use tracing::{debug, info};

use crate::key::{bucket, extract_keys, KeyClass, KeyValue};
use crate::output::{take_rows, BufferedOutput, JoinSchema};
use crate::{JoinEngine, JoinInput, JoinOutput};

const OPERATOR: &str = "HashPartitionJoin";

/// Partitioned hash join engine.
#[derive(Debug, Clone)]
pub struct HashPartitionJoin {
    partitions: usize,
    batch_rows: usize,
    row_group_rows: usize,
    parallel_sides: bool,
}

impl Default for HashPartitionJoin {
    fn default() -> Self {
        Self::new(8)
    }
}

impl HashPartitionJoin {
    /// Engine with `partitions` buckets and default batch sizing.
    pub fn new(partitions: usize) -> Self {
        Self {
            partitions: partitions.max(1),
            batch_rows: 100_000,
            row_group_rows: 50_000,
            parallel_sides: false,
        }
    }

    /// Engine sized from the shared engine configuration.
    pub fn from_config(cfg: &EngineConfig) -> Self {
        Self {
            partitions: cfg.hash_partitions.max(1),
            batch_rows: cfg.batch_size_rows.max(1),
            row_group_rows: cfg.row_group_rows.max(1),
            parallel_sides: cfg.parallel_sides,
        }
    }

    /// Rows per streamed batch while partitioning, building and probing.
    pub fn with_batch_rows(mut self, rows: usize) -> Self {
        self.batch_rows = rows.max(1);
        self
    }

    /// Partition the two sides concurrently.
    pub fn with_parallel_sides(mut self, enabled: bool) -> Self {
        self.parallel_sides = enabled;
        self
    }

    fn partition_side(&self, input: &JoinInput, work_dir: &Path, tag: &str) -> Result<Partitions> {
        let reader = input
            .table
            .read_batches(input.projection.as_deref(), self.batch_rows)?;
        let schema = reader.schema();
        let key_idx = key_index(&schema, input)?;

        let mut writers: Vec<Option<(ColumnarTable, TableWriter)>> =
            (0..self.partitions).map(|_| None).collect();
        let mut rows_in = 0_u64;
        for batch in reader {
            let batch = batch?;
            rows_in += batch.num_rows() as u64;
            let keys = extract_keys(batch.column(key_idx))?;
            let mut bucket_rows = vec![Vec::<u32>::new(); self.partitions];
            for (row, key) in keys.iter().enumerate() {
                // null keys never match in an inner equi-join
                if let Some(k) = key {
                    bucket_rows[bucket(k, self.partitions)].push(row as u32);
                }
            }
            for (b, rows) in bucket_rows.into_iter().enumerate() {
                if rows.is_empty() {
                    continue;
                }
                let chunk = take_rows(&batch, rows)?;
                if writers[b].is_none() {
                    let table = ColumnarTable::create_in(format!("{tag}_part{b}"), work_dir)?;
                    let writer =
                        table.create_writer_with_row_groups(schema.clone(), self.row_group_rows)?;
                    writers[b] = Some((table, writer));
                }
                if let Some((_, writer)) = writers[b].as_mut() {
                    writer.write(&chunk)?;
                }
            }
        }

        let mut parts = Vec::with_capacity(self.partitions);
        let mut bytes = 0_u64;
        for slot in writers {
            match slot {
                None => parts.push(None),
                Some((table, writer)) => {
                    let summary = writer.close()?;
                    bytes += summary.bytes;
                    parts.push(Some(PartitionFile {
                        table,
                        rows: summary.rows,
                    }));
                }
            }
        }
        Ok(Partitions {
            schema,
            key_idx,
            parts,
            rows_in,
            bytes,
        })
    }

    fn partition_both(
        &self,
        left: &JoinInput,
        right: &JoinInput,
        work_dir: &Path,
    ) -> Result<(Partitions, Partitions)> {
        if !self.parallel_sides {
            let l = self.partition_side(left, work_dir, "L")?;
            let r = self.partition_side(right, work_dir, "R")?;
            return Ok((l, r));
        }
        // each side owns its own partition files, so the two writers never share a file;
        // the scope end is the barrier before any partition is read back
        std::thread::scope(|s| {
            let lh = s.spawn(|| self.partition_side(left, work_dir, "L"));
            let r = self.partition_side(right, work_dir, "R");
            let l = lh.join().map_err(|_| {
                NqError::Execution("left partitioning thread panicked".to_string())
            })?;
            Ok((l?, r?))
        })
    }

    fn join_bucket(
        &self,
        b: usize,
        left: (&PartitionFile, &Partitions),
        right: (&PartitionFile, &Partitions),
        join_schema: &JoinSchema,
        out: &mut BufferedOutput,
    ) -> Result<u64> {
        // row counts straight from the partition footers
        let l_rows = left.0.table.num_rows()?;
        let r_rows = right.0.table.num_rows()?;
        debug_assert_eq!((l_rows, r_rows), (left.0.rows, right.0.rows));
        let build_left = l_rows <= r_rows;
        let (build, streamed) = if build_left {
            (left, right)
        } else {
            (right, left)
        };
        debug!(
            bucket = b,
            left_rows = l_rows,
            right_rows = r_rows,
            build_side = if build_left { "left" } else { "right" },
            "hash join bucket"
        );

        let table = BuildTable::load(build.0, build.1.key_idx, self.batch_rows)?;
        let build_columns = table.column_views(build.1.schema.fields().len());

        let mut emitted = 0_u64;
        for batch in read_partition(streamed.0, self.batch_rows)? {
            let batch = batch?;
            let keys = extract_keys(batch.column(streamed.1.key_idx))?;
            let mut groups: HashMap<KeyValue, Vec<u32>> = HashMap::new();
            for (row, key) in keys.into_iter().enumerate() {
                if let Some(k) = key {
                    groups.entry(k).or_default().push(row as u32);
                }
            }

            let mut build_idx = Vec::<(usize, usize)>::with_capacity(self.batch_rows);
            let mut stream_idx = Vec::<u32>::with_capacity(self.batch_rows);
            for (key, stream_rows) in &groups {
                let Some(matches) = table.map.get(key) else {
                    continue;
                };
                for m in matches {
                    for p in stream_rows {
                        build_idx.push((m.batch as usize, m.row as usize));
                        stream_idx.push(*p);
                        // a skewed key must not turn into one huge output batch
                        if stream_idx.len() >= self.batch_rows {
                            emitted += emit_pairs(
                                &build_columns,
                                &batch,
                                std::mem::take(&mut build_idx),
                                std::mem::take(&mut stream_idx),
                                build_left,
                                join_schema,
                                out,
                            )?;
                        }
                    }
                }
            }
            emitted += emit_pairs(
                &build_columns,
                &batch,
                build_idx,
                stream_idx,
                build_left,
                join_schema,
                out,
            )?;
        }
        Ok(emitted)
    }
}

impl JoinEngine for HashPartitionJoin {
    fn name(&self) -> &'static str {
        OPERATOR
    }

    fn join(&self, left: &JoinInput, right: &JoinInput, scratch_root: &Path) -> Result<JoinOutput> {
        left.validate()?;
        right.validate()?;
        let started = Instant::now();
        let work_dir = create_scratch_dir(scratch_root, "hpj")?;

        let left_schema = left.table.schema(left.projection.as_deref())?;
        let right_schema = right.table.schema(right.projection.as_deref())?;
        let join_schema = JoinSchema::new(&left_schema, &right_schema, &left.key, &right.key)?;
        KeyClass::check_compatible(
            left_schema.field(key_index(&left_schema, left)?).data_type(),
            right_schema.field(key_index(&right_schema, right)?).data_type(),
        )?;

        let spill_started = Instant::now();
        let (lparts, rparts) = self.partition_both(left, right, &work_dir)?;
        let files = lparts.file_count() + rparts.file_count();
        global_metrics().record_spill(
            OPERATOR,
            "partition",
            files as u64,
            lparts.bytes + rparts.bytes,
            spill_started.elapsed().as_secs_f64(),
        );
        info!(
            work_dir = %work_dir.display(),
            partitions = self.partitions,
            left_rows = lparts.rows_in,
            right_rows = rparts.rows_in,
            partition_files = files,
            "hash join partitioned inputs"
        );

        let out_table = ColumnarTable::create_in("HPJ_out", &work_dir)?;
        let mut out = BufferedOutput::create(
            &out_table,
            join_schema.schema(),
            self.batch_rows,
            self.row_group_rows,
        )?;
        let mut rows_out = 0_u64;
        let mut joined_buckets = 0_usize;
        for b in 0..self.partitions {
            if let (Some(lp), Some(rp)) = (&lparts.parts[b], &rparts.parts[b]) {
                rows_out +=
                    self.join_bucket(b, (lp, &lparts), (rp, &rparts), &join_schema, &mut out)?;
                joined_buckets += 1;
            }
        }
        let summary = out.finish()?;
        lparts.remove_files();
        rparts.remove_files();

        global_metrics().record_operator(
            OPERATOR,
            lparts.rows_in + rparts.rows_in,
            rows_out,
            summary.batches,
            started.elapsed().as_secs_f64(),
        );
        info!(
            output = %out_table.path().display(),
            buckets_joined = joined_buckets,
            rows = summary.rows,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "hash join finished"
        );
        Ok(JoinOutput {
            table: out_table,
            work_dir,
            rows: summary.rows,
        })
    }
}

/// One non-empty bucket of one side. Empty buckets are `None` in [`Partitions::parts`], decided
/// while partitioning rather than by probing the filesystem.
#[derive(Debug, Clone)]
struct PartitionFile {
    table: ColumnarTable,
    rows: u64,
}

struct Partitions {
    schema: SchemaRef,
    key_idx: usize,
    parts: Vec<Option<PartitionFile>>,
    rows_in: u64,
    bytes: u64,
}

impl Partitions {
    fn file_count(&self) -> usize {
        self.parts.iter().flatten().count()
    }

    fn remove_files(&self) {
        for part in self.parts.iter().flatten() {
            if let Err(e) = fs::remove_file(part.table.path()) {
                debug!(path = %part.table.path().display(), error = %e, "partition cleanup failed");
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct RowRef {
    batch: u32,
    row: u32,
}

/// Build side of one bucket: batches kept in an arena, keys mapped to row handles into it.
struct BuildTable {
    arena: Vec<RecordBatch>,
    map: HashMap<KeyValue, Vec<RowRef>>,
}

impl BuildTable {
    fn load(part: &PartitionFile, key_idx: usize, batch_rows: usize) -> Result<Self> {
        let mut arena = Vec::new();
        let mut map: HashMap<KeyValue, Vec<RowRef>> = HashMap::new();
        for batch in read_partition(part, batch_rows)? {
            let batch = batch?;
            if batch.num_rows() == 0 {
                continue;
            }
            let slot = arena.len() as u32;
            for (row, key) in extract_keys(batch.column(key_idx))?.into_iter().enumerate() {
                if let Some(k) = key {
                    map.entry(k).or_default().push(RowRef {
                        batch: slot,
                        row: row as u32,
                    });
                }
            }
            arena.push(batch);
        }
        Ok(Self { arena, map })
    }

    /// Per column, the arrays of every arena batch, ready for `interleave`.
    fn column_views(&self, width: usize) -> Vec<Vec<&dyn Array>> {
        (0..width)
            .map(|c| self.arena.iter().map(|b| b.column(c).as_ref()).collect())
            .collect()
    }
}

/// Gather matched build rows and streamed rows and push them as one output batch in left/right
/// column order.
fn emit_pairs(
    build_columns: &[Vec<&dyn Array>],
    streamed: &RecordBatch,
    build_idx: Vec<(usize, usize)>,
    stream_idx: Vec<u32>,
    build_left: bool,
    join_schema: &JoinSchema,
    out: &mut BufferedOutput,
) -> Result<u64> {
    if stream_idx.is_empty() {
        return Ok(0);
    }
    let build_cols = build_columns
        .iter()
        .map(|arrays| interleave(arrays, &build_idx))
        .collect::<std::result::Result<Vec<ArrayRef>, _>>()
        .map_err(|e| NqError::Execution(format!("build side gather failed: {e}")))?;
    let stream_cols = take_rows(streamed, stream_idx)?.columns().to_vec();
    let joined = if build_left {
        join_schema.combine(build_cols, stream_cols)?
    } else {
        join_schema.combine(stream_cols, build_cols)?
    };
    let rows = joined.num_rows() as u64;
    out.push(joined)?;
    Ok(rows)
}

fn read_partition(part: &PartitionFile, batch_rows: usize) -> Result<TableBatchReader> {
    part.table.read_batches(None, batch_rows)
}

fn key_index(schema: &SchemaRef, input: &JoinInput) -> Result<usize> {
    schema.index_of(&input.key).map_err(|_| {
        NqError::InvalidConfig(format!(
            "table {}: join key '{}' not found",
            input.table.name(),
            input.key
        ))
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow::array::{Int64Array, StringArray};
    use arrow::record_batch::RecordBatch;
    use arrow_schema::{DataType, Field, Schema};
    use nq_storage::ColumnarTable;

    use super::HashPartitionJoin;
    use crate::output::{BufferedOutput, JoinSchema};
    use crate::{JoinEngine, JoinInput};

    fn temp_root() -> std::path::PathBuf {
        std::env::temp_dir().join(format!("nq_hpj_test_{}", nq_common::ScratchId::new()))
    }

    fn write(dir: &std::path::Path, name: &str, batch: RecordBatch) -> ColumnarTable {
        let t = ColumnarTable::create_in(name, dir).expect("table");
        t.write_all(batch.schema(), vec![Ok(batch)]).expect("write");
        t
    }

    #[test]
    fn string_keys_partition_consistently_across_sides() {
        let root = temp_root();
        let left = RecordBatch::try_new(
            Arc::new(Schema::new(vec![
                Field::new("k", DataType::Utf8, false),
                Field::new("lv", DataType::Int64, false),
            ])),
            vec![
                Arc::new(StringArray::from(vec!["a", "b", "c", "d", "e"])),
                Arc::new(Int64Array::from(vec![1_i64, 2, 3, 4, 5])),
            ],
        )
        .expect("left");
        let right = RecordBatch::try_new(
            Arc::new(Schema::new(vec![
                Field::new("k", DataType::Utf8, false),
                Field::new("rv", DataType::Int64, false),
            ])),
            vec![
                Arc::new(StringArray::from(vec!["e", "a", "a", "z"])),
                Arc::new(Int64Array::from(vec![50_i64, 10, 11, 99])),
            ],
        )
        .expect("right");
        let l = write(&root, "L", left);
        let r = write(&root, "R", right);

        let out = HashPartitionJoin::new(4)
            .join(&JoinInput::new(l, "k"), &JoinInput::new(r, "k"), &root)
            .expect("join");
        assert_eq!(out.rows, 3);
        let batches = out.table.read_all(None).expect("read");
        let schema = batches[0].schema();
        let names = schema
            .fields()
            .iter()
            .map(|f| f.name().as_str())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["k", "lv", "rv"]);
        // partition files are removed once the join completes
        let leftovers = std::fs::read_dir(&out.work_dir)
            .expect("work dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains("_part"))
            .count();
        assert_eq!(leftovers, 0);
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn skewed_key_output_is_pushed_in_bounded_batches() {
        let root = temp_root();
        let side = |name: &str, col: &str| {
            let batch = RecordBatch::try_new(
                Arc::new(Schema::new(vec![
                    Field::new("k", DataType::Int64, false),
                    Field::new(col, DataType::Int64, false),
                ])),
                vec![
                    Arc::new(Int64Array::from(vec![1_i64; 300])),
                    Arc::new(Int64Array::from((0..300).collect::<Vec<i64>>())),
                ],
            )
            .expect("batch");
            write(&root, name, batch)
        };
        let l = JoinInput::new(side("L", "lv"), "k");
        let r = JoinInput::new(side("R", "rv"), "k");

        let hpj = HashPartitionJoin::new(2).with_batch_rows(100);
        let work = root.join("work");
        let (lparts, rparts) = hpj.partition_both(&l, &r, &work).expect("partition");
        let join_schema =
            JoinSchema::new(&lparts.schema, &rparts.schema, "k", "k").expect("schema");
        let out_table = ColumnarTable::create_in("out", &work).expect("out");
        let mut out =
            BufferedOutput::create(&out_table, join_schema.schema(), 100, 1000).expect("output");
        let (lp, rp) = match (&lparts.parts[1], &rparts.parts[1]) {
            (Some(lp), Some(rp)) => (lp, rp),
            _ => panic!("key 1 must land in bucket 1 on both sides"),
        };
        let rows = hpj
            .join_bucket(1, (lp, &lparts), (rp, &rparts), &join_schema, &mut out)
            .expect("join bucket");

        assert_eq!(rows, 300 * 300);
        assert!(out.largest_push() <= 100, "pushed {} rows at once", out.largest_push());
        assert_eq!(out.finish().expect("finish").rows, 300 * 300);
        let _ = std::fs::remove_dir_all(root);
    }
}
