//! Join output schema and buffered output writing.

use std::sync::Arc;

use arrow::array::{ArrayRef, UInt32Array};
use arrow::compute::{concat_batches, take_record_batch};
use arrow::record_batch::RecordBatch;
use arrow_schema::{Field, Schema, SchemaRef};
use nq_common::{NqError, Result};
use nq_storage::{ColumnarTable, TableWriter, WriteSummary};
use tracing::debug;

/// Output layout of an inner equi-join: all left columns, then right columns.
///
/// The right key is dropped when it carries the same name as the left key (its values are equal
/// on every output row). Other right columns whose names collide with a left column are renamed
/// `<name>_right`.
#[derive(Debug, Clone)]
pub struct JoinSchema {
    schema: SchemaRef,
    left_width: usize,
    right_keep: Vec<usize>,
}

impl JoinSchema {
    /// Layout for joining `left` and `right` on `left_key = right_key`.
    pub fn new(left: &Schema, right: &Schema, left_key: &str, right_key: &str) -> Result<Self> {
        left.index_of(left_key).map_err(|_| {
            NqError::InvalidConfig(format!("left join key '{left_key}' not in left schema"))
        })?;
        let right_key_idx = right.index_of(right_key).map_err(|_| {
            NqError::InvalidConfig(format!("right join key '{right_key}' not in right schema"))
        })?;

        let mut fields = left
            .fields()
            .iter()
            .map(|f| f.as_ref().clone())
            .collect::<Vec<Field>>();
        let mut right_keep = Vec::with_capacity(right.fields().len());
        for (idx, f) in right.fields().iter().enumerate() {
            if idx == right_key_idx && left_key == right_key {
                continue;
            }
            let field = if left.index_of(f.name()).is_ok() {
                f.as_ref().clone().with_name(format!("{}_right", f.name()))
            } else {
                f.as_ref().clone()
            };
            fields.push(field);
            right_keep.push(idx);
        }
        Ok(Self {
            schema: Arc::new(Schema::new(fields)),
            left_width: left.fields().len(),
            right_keep,
        })
    }

    /// Output schema.
    pub fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    /// Assemble one output batch from row-aligned left and right columns.
    pub fn combine(&self, left: Vec<ArrayRef>, right: Vec<ArrayRef>) -> Result<RecordBatch> {
        if left.len() != self.left_width {
            return Err(NqError::Execution(format!(
                "join combine expected {} left columns, got {}",
                self.left_width,
                left.len()
            )));
        }
        let mut cols = left;
        for idx in &self.right_keep {
            let col = right.get(*idx).ok_or_else(|| {
                NqError::Execution(format!("join combine missing right column {idx}"))
            })?;
            cols.push(col.clone());
        }
        RecordBatch::try_new(self.schema.clone(), cols)
            .map_err(|e| NqError::Execution(format!("join output batch failed: {e}")))
    }

    /// Cross product of two equal-key groups, emitted in chunks of about `chunk_rows` rows.
    pub(crate) fn cross_product(
        &self,
        left: &RecordBatch,
        right: &RecordBatch,
        chunk_rows: usize,
        out: &mut BufferedOutput,
    ) -> Result<u64> {
        let (n, m) = (left.num_rows(), right.num_rows());
        if n == 0 || m == 0 {
            return Ok(0);
        }
        let chunk_rows = chunk_rows.max(m);
        let mut li = Vec::with_capacity(chunk_rows.min(n * m));
        let mut ri = Vec::with_capacity(chunk_rows.min(n * m));
        let mut emitted = 0_u64;
        for i in 0..n {
            for j in 0..m {
                li.push(i as u32);
                ri.push(j as u32);
            }
            if li.len() >= chunk_rows || i + 1 == n {
                let l = take_rows(left, std::mem::take(&mut li))?;
                let r = take_rows(right, std::mem::take(&mut ri))?;
                emitted += l.num_rows() as u64;
                out.push(self.combine(l.columns().to_vec(), r.columns().to_vec())?)?;
            }
        }
        Ok(emitted)
    }
}

pub(crate) fn take_rows(batch: &RecordBatch, rows: Vec<u32>) -> Result<RecordBatch> {
    take_record_batch(batch, &UInt32Array::from(rows))
        .map_err(|e| NqError::Execution(format!("take rows failed: {e}")))
}

/// Accumulates output batches and writes them once `flush_rows` rows are pending.
pub(crate) struct BufferedOutput {
    writer: TableWriter,
    pending: Vec<RecordBatch>,
    pending_rows: usize,
    flush_rows: usize,
    largest_push: usize,
}

impl BufferedOutput {
    pub(crate) fn create(
        table: &ColumnarTable,
        schema: SchemaRef,
        flush_rows: usize,
        row_group_rows: usize,
    ) -> Result<Self> {
        Ok(Self {
            writer: table.create_writer_with_row_groups(schema, row_group_rows)?,
            pending: Vec::new(),
            pending_rows: 0,
            flush_rows: flush_rows.max(1),
            largest_push: 0,
        })
    }

    pub(crate) fn push(&mut self, batch: RecordBatch) -> Result<()> {
        if batch.num_rows() == 0 {
            return Ok(());
        }
        self.largest_push = self.largest_push.max(batch.num_rows());
        self.pending_rows += batch.num_rows();
        self.pending.push(batch);
        if self.pending_rows >= self.flush_rows {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let merged = concat_batches(&self.writer.schema(), &self.pending)
            .map_err(|e| NqError::Execution(format!("output concat failed: {e}")))?;
        self.writer.write(&merged)?;
        self.pending.clear();
        self.pending_rows = 0;
        Ok(())
    }

    /// Row count of the biggest batch pushed so far.
    pub(crate) fn largest_push(&self) -> usize {
        self.largest_push
    }

    pub(crate) fn finish(mut self) -> Result<WriteSummary> {
        self.flush()?;
        debug!(largest_push = self.largest_push, "join output closing");
        self.writer.close()
    }
}
