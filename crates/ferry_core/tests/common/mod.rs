#![allow(dead_code)]

use std::sync::Arc;

use datafusion::arrow::array::{Array, Float64Array, Int64Array};
use datafusion::arrow::datatypes::{DataType, Field, Schema};
use datafusion::arrow::record_batch::RecordBatch;

/// Batch with columns `k: Int64` and `v: Float64`.
pub fn kv_batch(keys: &[i64], values: &[f64]) -> RecordBatch {
    let schema = Arc::new(Schema::new(vec![
        Field::new("k", DataType::Int64, false),
        Field::new("v", DataType::Float64, false),
    ]));
    RecordBatch::try_new(
        schema,
        vec![
            Arc::new(Int64Array::from(keys.to_vec())),
            Arc::new(Float64Array::from(values.to_vec())),
        ],
    )
    .unwrap()
}

pub fn total_rows(batches: &[RecordBatch]) -> usize {
    batches.iter().map(|b| b.num_rows()).sum()
}

pub fn int_column(batches: &[RecordBatch], idx: usize) -> Vec<i64> {
    batches
        .iter()
        .flat_map(|b| {
            let col = b.column(idx).as_any().downcast_ref::<Int64Array>().unwrap();
            (0..col.len()).map(|i| col.value(i)).collect::<Vec<_>>()
        })
        .collect()
}

pub fn float_column(batches: &[RecordBatch], idx: usize) -> Vec<f64> {
    batches
        .iter()
        .flat_map(|b| {
            let col = b
                .column(idx)
                .as_any()
                .downcast_ref::<Float64Array>()
                .unwrap();
            (0..col.len()).map(|i| col.value(i)).collect::<Vec<_>>()
        })
        .collect()
}
