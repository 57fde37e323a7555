//! Non-spilling group-by over a joined table: `Avg` and `CountDistinct`, then order-by and the
//! final projection.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use arrow::array::{
    Array, ArrayRef, AsArray, BooleanArray, Float64Array, Int64Array, StringArray, UInt64Array,
};
use arrow::compute::{cast, lexsort_to_indices, take_record_batch, SortColumn, SortOptions};
use arrow::datatypes::Float64Type;
use arrow::record_batch::RecordBatch;
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use nq_common::{global_metrics, NqError, Result};
use nq_execution::{extract_keys, KeyValue};
use nq_planner::{unqualified, AggFunc, AggregateSpec, QueryDescriptor};
use nq_storage::ColumnarTable;
use tracing::info;

const OPERATOR: &str = "Aggregate";

#[derive(Debug, Clone)]
enum AggState {
    Avg { sum: f64, count: u64 },
    CountDistinct(HashSet<KeyValue>),
}

impl AggState {
    fn init(func: AggFunc) -> Self {
        match func {
            AggFunc::Avg => Self::Avg { sum: 0.0, count: 0 },
            AggFunc::CountDistinct => Self::CountDistinct(HashSet::new()),
        }
    }
}

/// Group key values; a null group value is its own group.
type GroupKey = Vec<Option<KeyValue>>;

struct GroupEntry {
    key: GroupKey,
    states: Vec<AggState>,
}

/// Input column feeding one aggregate, extracted per batch.
enum AggInput {
    Numbers(Float64Array),
    Values(Vec<Option<KeyValue>>),
}

/// Aggregate `table` as described by `query`, reading `batch_rows` rows at a time.
pub fn aggregate(
    table: &ColumnarTable,
    query: &QueryDescriptor,
    batch_rows: usize,
) -> Result<RecordBatch> {
    let started = Instant::now();
    let group_cols = query
        .group_by
        .iter()
        .map(|c| unqualified(c).to_string())
        .collect::<Vec<_>>();
    let agg_cols = query
        .aggregates
        .iter()
        .map(|a| unqualified(&a.column).to_string())
        .collect::<Vec<_>>();
    let mut projection: Vec<String> = Vec::new();
    for c in group_cols.iter().chain(agg_cols.iter()) {
        if !projection.contains(c) {
            projection.push(c.clone());
        }
    }

    let reader = table.read_batches(Some(projection.as_slice()), batch_rows)?;
    let input_schema = reader.schema();
    let group_idx = indices_of(&input_schema, &group_cols)?;
    let agg_idx = indices_of(&input_schema, &agg_cols)?;
    for (spec, idx) in query.aggregates.iter().zip(&agg_idx) {
        check_input_type(spec, input_schema.field(*idx).data_type())?;
    }

    let mut order: Vec<GroupKey> = Vec::new();
    let mut groups: HashMap<GroupKey, GroupEntry> = HashMap::new();
    let mut rows_in = 0_u64;
    for batch in reader {
        let batch = batch?;
        rows_in += batch.num_rows() as u64;
        let keys = group_idx
            .iter()
            .map(|i| extract_keys(batch.column(*i)))
            .collect::<Result<Vec<_>>>()?;
        let inputs = query
            .aggregates
            .iter()
            .zip(&agg_idx)
            .map(|(spec, i)| agg_input(spec.func, batch.column(*i)))
            .collect::<Result<Vec<_>>>()?;

        for row in 0..batch.num_rows() {
            let key = keys.iter().map(|k| k[row].clone()).collect::<GroupKey>();
            let entry = groups.entry(key.clone()).or_insert_with(|| {
                order.push(key.clone());
                GroupEntry {
                    key,
                    states: query.aggregates.iter().map(|a| AggState::init(a.func)).collect(),
                }
            });
            for (state, input) in entry.states.iter_mut().zip(&inputs) {
                update_state(state, input, row)?;
            }
        }
    }

    let entries = order
        .iter()
        .filter_map(|k| groups.remove(k))
        .collect::<Vec<_>>();
    let grouped = build_output(&entries, &input_schema, &group_idx, &group_cols, query)?;
    let sorted = sort_output(&grouped, query)?;
    let result = project_select(&sorted, query)?;

    global_metrics().record_operator(
        OPERATOR,
        rows_in,
        result.num_rows() as u64,
        1,
        started.elapsed().as_secs_f64(),
    );
    info!(
        rows_in,
        groups = result.num_rows(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "aggregation finished"
    );
    Ok(result)
}

fn indices_of(schema: &SchemaRef, columns: &[String]) -> Result<Vec<usize>> {
    columns
        .iter()
        .map(|c| {
            schema.index_of(c).map_err(|_| {
                NqError::InvalidConfig(format!("aggregation column '{c}' not in joined table"))
            })
        })
        .collect()
}

fn check_input_type(spec: &AggregateSpec, dt: &DataType) -> Result<()> {
    if spec.func == AggFunc::Avg && !dt.is_numeric() {
        return Err(NqError::Unsupported(format!(
            "AVG over non-numeric column {} ({dt:?})",
            spec.column
        )));
    }
    Ok(())
}

fn agg_input(func: AggFunc, array: &ArrayRef) -> Result<AggInput> {
    match func {
        AggFunc::Avg => {
            let numbers = cast(array, &DataType::Float64)
                .map_err(|e| NqError::Execution(format!("avg input cast failed: {e}")))?;
            Ok(AggInput::Numbers(numbers.as_primitive::<Float64Type>().clone()))
        }
        AggFunc::CountDistinct => Ok(AggInput::Values(extract_keys(array)?)),
    }
}

fn update_state(state: &mut AggState, input: &AggInput, row: usize) -> Result<()> {
    match (state, input) {
        (AggState::Avg { sum, count }, AggInput::Numbers(values)) => {
            if values.is_valid(row) {
                *sum += values.value(row);
                *count += 1;
            }
        }
        (AggState::CountDistinct(seen), AggInput::Values(values)) => {
            if let Some(v) = &values[row] {
                if !seen.contains(v) {
                    seen.insert(v.clone());
                }
            }
        }
        (state, _) => {
            return Err(NqError::Execution(format!(
                "aggregate input does not match state {state:?}"
            )));
        }
    }
    Ok(())
}

/// Group columns (input types, unqualified names) followed by one column per aggregate.
fn build_output(
    entries: &[GroupEntry],
    input_schema: &SchemaRef,
    group_idx: &[usize],
    group_cols: &[String],
    query: &QueryDescriptor,
) -> Result<RecordBatch> {
    let mut fields = Vec::new();
    let mut columns: Vec<ArrayRef> = Vec::new();
    for (pos, (idx, name)) in group_idx.iter().zip(group_cols).enumerate() {
        let dt = input_schema.field(*idx).data_type();
        let values = entries.iter().map(|e| e.key[pos].as_ref());
        fields.push(Field::new(name, dt.clone(), true));
        columns.push(key_column(values, dt)?);
    }
    for (i, spec) in query.aggregates.iter().enumerate() {
        match spec.func {
            AggFunc::Avg => {
                fields.push(Field::new(&spec.alias, DataType::Float64, true));
                columns.push(Arc::new(
                    entries
                        .iter()
                        .map(|e| match &e.states[i] {
                            AggState::Avg { sum, count } if *count > 0 => {
                                Some(*sum / *count as f64)
                            }
                            _ => None,
                        })
                        .collect::<Float64Array>(),
                ));
            }
            AggFunc::CountDistinct => {
                fields.push(Field::new(&spec.alias, DataType::Int64, false));
                columns.push(Arc::new(
                    entries
                        .iter()
                        .map(|e| match &e.states[i] {
                            AggState::CountDistinct(seen) => seen.len() as i64,
                            _ => 0,
                        })
                        .collect::<Int64Array>(),
                ));
            }
        }
    }
    RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)
        .map_err(|e| NqError::Execution(format!("aggregate output failed: {e}")))
}

/// Rebuild a column of group values and cast it back to the input type.
fn key_column<'a>(
    values: impl Iterator<Item = Option<&'a KeyValue>>,
    dt: &DataType,
) -> Result<ArrayRef> {
    let values = values.collect::<Vec<_>>();
    let array: ArrayRef = match dt {
        DataType::Utf8 | DataType::LargeUtf8 => Arc::new(
            values
                .iter()
                .map(|v| v.map(KeyValue::to_string))
                .collect::<StringArray>(),
        ),
        DataType::Boolean => Arc::new(
            values
                .iter()
                .map(|v| match v {
                    Some(KeyValue::Int(i)) => Some(*i != 0),
                    _ => None,
                })
                .collect::<BooleanArray>(),
        ),
        DataType::UInt64 => Arc::new(
            values
                .iter()
                .map(|v| match v {
                    Some(KeyValue::UInt(u)) => Some(*u),
                    Some(KeyValue::Int(i)) => u64::try_from(*i).ok(),
                    _ => None,
                })
                .collect::<UInt64Array>(),
        ),
        DataType::Float32 | DataType::Float64 => Arc::new(
            values
                .iter()
                .map(|v| match v {
                    Some(KeyValue::Float64Bits(bits)) => Some(f64::from_bits(*bits)),
                    _ => None,
                })
                .collect::<Float64Array>(),
        ),
        _ => Arc::new(
            values
                .iter()
                .map(|v| match v {
                    Some(KeyValue::Int(i)) => Some(*i),
                    _ => None,
                })
                .collect::<Int64Array>(),
        ),
    };
    cast(&array, dt).map_err(|e| NqError::Execution(format!("group column cast failed: {e}")))
}

fn sort_output(batch: &RecordBatch, query: &QueryDescriptor) -> Result<RecordBatch> {
    if query.order_by.is_empty() || batch.num_rows() == 0 {
        return Ok(batch.clone());
    }
    let schema = batch.schema();
    let sort_columns = query
        .order_by
        .iter()
        .map(|o| {
            let idx = schema.index_of(unqualified(&o.column)).map_err(|_| {
                NqError::Planning(format!("order-by column '{}' not in result", o.column))
            })?;
            Ok(SortColumn {
                values: batch.column(idx).clone(),
                options: Some(SortOptions {
                    descending: o.descending,
                    nulls_first: false,
                }),
            })
        })
        .collect::<Result<Vec<_>>>()?;
    let indices = lexsort_to_indices(&sort_columns, None)
        .map_err(|e| NqError::Execution(format!("result sort failed: {e}")))?;
    take_record_batch(batch, &indices)
        .map_err(|e| NqError::Execution(format!("result reorder failed: {e}")))
}

fn project_select(batch: &RecordBatch, query: &QueryDescriptor) -> Result<RecordBatch> {
    let schema = batch.schema();
    let indices = query
        .select
        .iter()
        .map(|c| {
            schema.index_of(unqualified(c)).map_err(|_| {
                NqError::Planning(format!("selected column '{c}' is neither grouped nor aggregated"))
            })
        })
        .collect::<Result<Vec<_>>>()?;
    batch
        .project(&indices)
        .map_err(|e| NqError::Execution(format!("result projection failed: {e}")))
}
