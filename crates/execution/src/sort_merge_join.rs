//! External sort-merge join.
//!
//! Phase 1 cuts each side into chunks of at most `run_rows` rows, stable-sorts every chunk by key
//! and writes it as a run file. Phase 2 k-way merges the runs of a side into one sorted file,
//! holding one batch per run in memory. Phase 3 scans the two sorted files in lockstep and emits
//! the cross product of every pair of equal-key groups.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::fs;
use std::path::Path;
use std::time::Instant;

use arrow::array::ArrayRef;
use arrow::compute::{concat_batches, interleave};
use arrow::record_batch::RecordBatch;
use arrow_schema::SchemaRef;
use nq_common::{create_scratch_dir, global_metrics, EngineConfig, NqError, Result};
use nq_storage::{ColumnarTable, TableBatchReader, TableWriter};
use tracing::{debug, info};

use crate::key::{extract_keys, extract_non_null_keys, KeyClass, KeyValue};
use crate::output::{take_rows, BufferedOutput, JoinSchema};
use crate::{JoinEngine, JoinInput, JoinOutput};

const OPERATOR: &str = "SortMergeJoin";

/// External sort-merge join engine.
#[derive(Debug, Clone)]
pub struct SortMergeJoin {
    run_rows: usize,
    merge_batch_rows: usize,
    row_group_rows: usize,
    parallel_sides: bool,
}

impl Default for SortMergeJoin {
    fn default() -> Self {
        Self::new(250_000, 200_000)
    }
}

impl SortMergeJoin {
    /// Engine with the given run-size bound and merge batch size.
    pub fn new(run_rows: usize, merge_batch_rows: usize) -> Self {
        Self {
            run_rows: run_rows.max(1),
            merge_batch_rows: merge_batch_rows.max(1),
            row_group_rows: 50_000,
            parallel_sides: false,
        }
    }

    /// Engine sized from the shared engine configuration.
    pub fn from_config(cfg: &EngineConfig) -> Self {
        Self {
            run_rows: cfg.run_rows.max(1),
            merge_batch_rows: cfg.merge_batch_rows.max(1),
            row_group_rows: cfg.row_group_rows.max(1),
            parallel_sides: cfg.parallel_sides,
        }
    }

    /// Sort the two sides concurrently.
    pub fn with_parallel_sides(mut self, enabled: bool) -> Self {
        self.parallel_sides = enabled;
        self
    }

    /// Sort one side into `<tag>_sorted.parquet` and return it.
    ///
    /// Rows with a null key are dropped here; they can never match.
    fn external_sort(&self, input: &JoinInput, work_dir: &Path, tag: &str) -> Result<SortedSide> {
        let started = Instant::now();
        let reader = input
            .table
            .read_batches(input.projection.as_deref(), self.run_rows)?;
        let schema = reader.schema();
        let key_idx = key_index(&schema, input)?;

        let mut runs = Vec::new();
        let mut rows_in = 0_u64;
        let mut run_bytes = 0_u64;
        for batch in reader {
            let batch = batch?;
            rows_in += batch.num_rows() as u64;
            let mut order = extract_keys(batch.column(key_idx))?
                .into_iter()
                .enumerate()
                .filter_map(|(row, key)| key.map(|k| (row as u32, k)))
                .collect::<Vec<_>>();
            if order.is_empty() {
                continue;
            }
            // stable: equal keys keep input order, which keeps the merged output deterministic
            order.sort_by(|a, b| a.1.cmp(&b.1));
            let sorted = take_rows(&batch, order.into_iter().map(|(row, _)| row).collect())?;
            let run = ColumnarTable::create_in(format!("{tag}_run_{}", runs.len()), work_dir)?;
            let mut writer = run.create_writer_with_row_groups(schema.clone(), self.row_group_rows)?;
            writer.write(&sorted)?;
            run_bytes += writer.close()?.bytes;
            runs.push(run);
        }
        global_metrics().record_spill(
            OPERATOR,
            "run",
            runs.len() as u64,
            run_bytes,
            started.elapsed().as_secs_f64(),
        );

        let merged = ColumnarTable::create_in(format!("{tag}_sorted"), work_dir)?;
        let merge_started = Instant::now();
        let rows = self.merge_runs(&runs, &merged, &schema, key_idx)?;
        for run in &runs {
            if let Err(e) = fs::remove_file(run.path()) {
                debug!(path = %run.path().display(), error = %e, "run cleanup failed");
            }
        }
        global_metrics().record_spill(
            OPERATOR,
            "sorted",
            1,
            fs::metadata(merged.path())?.len(),
            merge_started.elapsed().as_secs_f64(),
        );
        info!(
            side = tag,
            rows_in,
            rows_sorted = rows,
            runs = runs.len(),
            "sort-merge join sorted side"
        );
        Ok(SortedSide {
            table: merged,
            schema,
            key_idx,
            rows_in,
        })
    }

    /// K-way merge of sorted runs into `out`. Memory is one batch per live run plus the pending
    /// output batch, independent of the total row count.
    fn merge_runs(
        &self,
        runs: &[ColumnarTable],
        out: &ColumnarTable,
        schema: &SchemaRef,
        key_idx: usize,
    ) -> Result<u64> {
        let mut writer = out.create_writer_with_row_groups(schema.clone(), self.row_group_rows)?;
        // batches referenced by `pending`; slots are reassigned after every flush
        let mut arena: Vec<RecordBatch> = Vec::new();
        let mut cursors: Vec<Option<RunCursor>> = Vec::with_capacity(runs.len());
        let mut heap = BinaryHeap::new();

        for (run_idx, run) in runs.iter().enumerate() {
            let reader = run.read_batches(None, self.merge_batch_rows)?;
            let cursor = RunCursor::open(reader, key_idx, &mut arena)?;
            if let Some(c) = &cursor {
                heap.push(Reverse(MergeEntry {
                    key: c.keys[c.pos].clone(),
                    run: run_idx,
                }));
            }
            cursors.push(cursor);
        }

        let mut pending: Vec<(usize, usize)> = Vec::with_capacity(self.merge_batch_rows);
        let mut rows = 0_u64;
        while let Some(Reverse(entry)) = heap.pop() {
            let mut exhausted = false;
            if let Some(cursor) = cursors[entry.run].as_mut() {
                pending.push((cursor.slot, cursor.pos));
                if cursor.step(&mut arena)? {
                    heap.push(Reverse(MergeEntry {
                        key: cursor.keys[cursor.pos].clone(),
                        run: entry.run,
                    }));
                } else {
                    exhausted = true;
                }
            }
            if exhausted {
                cursors[entry.run] = None;
            }

            if pending.len() >= self.merge_batch_rows {
                rows += flush_merged(&mut writer, schema, &arena, &pending)?;
                pending.clear();
                arena.clear();
                for cursor in cursors.iter_mut().flatten() {
                    cursor.slot = arena.len();
                    arena.push(cursor.batch.clone());
                }
            }
        }
        rows += flush_merged(&mut writer, schema, &arena, &pending)?;
        writer.close()?;
        Ok(rows)
    }

    fn sort_both(
        &self,
        left: &JoinInput,
        right: &JoinInput,
        work_dir: &Path,
    ) -> Result<(SortedSide, SortedSide)> {
        if !self.parallel_sides {
            let l = self.external_sort(left, work_dir, "L")?;
            let r = self.external_sort(right, work_dir, "R")?;
            return Ok((l, r));
        }
        // runs are tagged per side, so no file has two writers; merging starts after both join
        std::thread::scope(|s| {
            let lh = s.spawn(|| self.external_sort(left, work_dir, "L"));
            let r = self.external_sort(right, work_dir, "R");
            let l = lh
                .join()
                .map_err(|_| NqError::Execution("left sort thread panicked".to_string()))?;
            Ok((l?, r?))
        })
    }

    fn merge_join(
        &self,
        left: &SortedSide,
        right: &SortedSide,
        join_schema: &JoinSchema,
        out: &mut BufferedOutput,
    ) -> Result<u64> {
        let mut lc = SortedCursor::open(left, self.merge_batch_rows)?;
        let mut rc = SortedCursor::open(right, self.merge_batch_rows)?;
        let mut emitted = 0_u64;
        loop {
            let ord = match (lc.current_key(), rc.current_key()) {
                (Some(l), Some(r)) => l.cmp(r),
                _ => break,
            };
            match ord {
                Ordering::Less => lc.advance()?,
                Ordering::Greater => rc.advance()?,
                Ordering::Equal => {
                    let lg = lc.take_group()?;
                    let rg = rc.take_group()?;
                    emitted += join_schema.cross_product(&lg, &rg, self.merge_batch_rows, out)?;
                }
            }
        }
        Ok(emitted)
    }
}

impl JoinEngine for SortMergeJoin {
    fn name(&self) -> &'static str {
        OPERATOR
    }

    fn join(&self, left: &JoinInput, right: &JoinInput, scratch_root: &Path) -> Result<JoinOutput> {
        left.validate()?;
        right.validate()?;
        let started = Instant::now();
        let work_dir = create_scratch_dir(scratch_root, "smj")?;

        let left_schema = left.table.schema(left.projection.as_deref())?;
        let right_schema = right.table.schema(right.projection.as_deref())?;
        let join_schema = JoinSchema::new(&left_schema, &right_schema, &left.key, &right.key)?;
        KeyClass::check_compatible(
            left_schema.field(key_index(&left_schema, left)?).data_type(),
            right_schema.field(key_index(&right_schema, right)?).data_type(),
        )?;

        let (ls, rs) = self.sort_both(left, right, &work_dir)?;

        let out_table = ColumnarTable::create_in("SMJ_out", &work_dir)?;
        let mut out = BufferedOutput::create(
            &out_table,
            join_schema.schema(),
            self.merge_batch_rows,
            self.row_group_rows,
        )?;
        let rows_out = self.merge_join(&ls, &rs, &join_schema, &mut out)?;
        let summary = out.finish()?;
        for side in [&ls, &rs] {
            if let Err(e) = fs::remove_file(side.table.path()) {
                debug!(path = %side.table.path().display(), error = %e, "sorted file cleanup failed");
            }
        }

        global_metrics().record_operator(
            OPERATOR,
            ls.rows_in + rs.rows_in,
            rows_out,
            summary.batches,
            started.elapsed().as_secs_f64(),
        );
        info!(
            work_dir = %work_dir.display(),
            output = %out_table.path().display(),
            rows = summary.rows,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "sort-merge join finished"
        );
        Ok(JoinOutput {
            table: out_table,
            work_dir,
            rows: summary.rows,
        })
    }
}

struct SortedSide {
    table: ColumnarTable,
    schema: SchemaRef,
    key_idx: usize,
    rows_in: u64,
}

/// Heap entry of the k-way merge.
///
/// Ordered by key, then by run index, so among equal keys the lower run is emitted first and the
/// merge output is deterministic. The row itself is the current position of run `run`'s cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
struct MergeEntry {
    key: KeyValue,
    run: usize,
}

impl Ord for MergeEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key
            .cmp(&other.key)
            .then_with(|| self.run.cmp(&other.run))
    }
}

impl PartialOrd for MergeEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct RunCursor {
    reader: TableBatchReader,
    key_idx: usize,
    batch: RecordBatch,
    keys: Vec<KeyValue>,
    pos: usize,
    slot: usize,
}

impl RunCursor {
    fn open(
        mut reader: TableBatchReader,
        key_idx: usize,
        arena: &mut Vec<RecordBatch>,
    ) -> Result<Option<Self>> {
        let Some((batch, keys)) = next_keyed_batch(&mut reader, key_idx)? else {
            return Ok(None);
        };
        let slot = arena.len();
        arena.push(batch.clone());
        Ok(Some(Self {
            reader,
            key_idx,
            batch,
            keys,
            pos: 0,
            slot,
        }))
    }

    /// Move past the current row; `false` once the run is exhausted.
    fn step(&mut self, arena: &mut Vec<RecordBatch>) -> Result<bool> {
        self.pos += 1;
        if self.pos < self.keys.len() {
            return Ok(true);
        }
        match next_keyed_batch(&mut self.reader, self.key_idx)? {
            Some((batch, keys)) => {
                self.slot = arena.len();
                arena.push(batch.clone());
                self.batch = batch;
                self.keys = keys;
                self.pos = 0;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

fn next_keyed_batch(
    reader: &mut TableBatchReader,
    key_idx: usize,
) -> Result<Option<(RecordBatch, Vec<KeyValue>)>> {
    for batch in reader.by_ref() {
        let batch = batch?;
        if batch.num_rows() == 0 {
            continue;
        }
        let keys = extract_non_null_keys(batch.column(key_idx))?;
        return Ok(Some((batch, keys)));
    }
    Ok(None)
}

fn flush_merged(
    writer: &mut TableWriter,
    schema: &SchemaRef,
    arena: &[RecordBatch],
    pending: &[(usize, usize)],
) -> Result<u64> {
    if pending.is_empty() {
        return Ok(0);
    }
    let cols = (0..schema.fields().len())
        .map(|c| {
            let arrays = arena.iter().map(|b| b.column(c).as_ref()).collect::<Vec<_>>();
            interleave(&arrays, pending)
        })
        .collect::<std::result::Result<Vec<ArrayRef>, _>>()
        .map_err(|e| NqError::Execution(format!("merge gather failed: {e}")))?;
    let batch = RecordBatch::try_new(schema.clone(), cols)
        .map_err(|e| NqError::Execution(format!("merge batch failed: {e}")))?;
    writer.write(&batch)?;
    Ok(batch.num_rows() as u64)
}

/// Read cursor over one fully sorted side.
struct SortedCursor {
    reader: TableBatchReader,
    schema: SchemaRef,
    key_idx: usize,
    batch: Option<RecordBatch>,
    keys: Vec<KeyValue>,
    pos: usize,
}

impl SortedCursor {
    fn open(side: &SortedSide, batch_rows: usize) -> Result<Self> {
        let reader = side.table.read_batches(None, batch_rows)?;
        let mut cursor = Self {
            reader,
            schema: side.schema.clone(),
            key_idx: side.key_idx,
            batch: None,
            keys: Vec::new(),
            pos: 0,
        };
        cursor.load_next()?;
        Ok(cursor)
    }

    fn load_next(&mut self) -> Result<()> {
        match next_keyed_batch(&mut self.reader, self.key_idx)? {
            Some((batch, keys)) => {
                self.batch = Some(batch);
                self.keys = keys;
            }
            None => {
                self.batch = None;
                self.keys.clear();
            }
        }
        self.pos = 0;
        Ok(())
    }

    fn current_key(&self) -> Option<&KeyValue> {
        self.batch.as_ref().and(self.keys.get(self.pos))
    }

    fn advance(&mut self) -> Result<()> {
        self.pos += 1;
        if self.pos >= self.keys.len() {
            self.load_next()?;
        }
        Ok(())
    }

    /// Consume every row equal to the current key, following the group across batch
    /// boundaries, and return them as one batch.
    fn take_group(&mut self) -> Result<RecordBatch> {
        let Some(key) = self.current_key().cloned() else {
            return Ok(RecordBatch::new_empty(self.schema.clone()));
        };
        let mut parts = Vec::new();
        while let Some(batch) = &self.batch {
            let start = self.pos;
            let mut end = start;
            while end < self.keys.len() && self.keys[end] == key {
                end += 1;
            }
            parts.push(batch.slice(start, end - start));
            self.pos = end;
            if end < self.keys.len() {
                break;
            }
            self.load_next()?;
            if self.keys.first() != Some(&key) {
                break;
            }
        }
        concat_batches(&self.schema, &parts)
            .map_err(|e| NqError::Execution(format!("group concat failed: {e}")))
    }
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
