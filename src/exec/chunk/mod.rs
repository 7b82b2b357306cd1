// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//! Row batches flowing between operators.
//!
//! A [`Chunk`] is an ordered run of rows backed by an Arrow `RecordBatch`. Join and
//! aggregation keys are read through [`KeyColumn`], which widens every supported
//! integer type to `i64` so build and probe sides hash and compare identically.

use std::fmt;

use arrow::array::{
    Array, ArrayRef, BooleanArray, Date32Array, Int8Array, Int16Array, Int32Array, Int64Array,
    LargeStringArray, RecordBatch, StringArray, UInt32Array,
};
use arrow::compute::{concat_batches, filter_record_batch, take_record_batch};
use arrow::datatypes::{DataType, SchemaRef};

use crate::common::status::{Status, StatusResult};
use crate::exec::hash_table::hash::{hash_bytes_with_seed, hash_null_with_seed, hash_u64_with_seed};

#[derive(Debug, Clone)]
pub struct Chunk {
    pub batch: RecordBatch,
}

impl Chunk {
    pub fn new(batch: RecordBatch) -> Self {
        Self { batch }
    }

    pub fn schema(&self) -> SchemaRef {
        self.batch.schema()
    }

    pub fn len(&self) -> usize {
        self.batch.num_rows()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.num_rows() == 0
    }

    pub fn columns(&self) -> &[ArrayRef] {
        self.batch.columns()
    }

    pub fn slice(&self, offset: usize, length: usize) -> Self {
        Self {
            batch: self.batch.slice(offset, length),
        }
    }

    pub fn column_index(&self, name: &str) -> StatusResult<usize> {
        self.batch.schema().index_of(name).map_err(|_| {
            Status::invalid_argument(format!(
                "column '{}' not found in chunk (columns={:?})",
                name,
                self.batch
                    .schema()
                    .fields()
                    .iter()
                    .map(|f| f.name().as_str())
                    .collect::<Vec<_>>()
            ))
        })
    }

    pub fn column_by_name(&self, name: &str) -> StatusResult<ArrayRef> {
        let idx = self.column_index(name)?;
        Ok(self.batch.column(idx).clone())
    }

    /// Deterministic size estimate of the rows this chunk references.
    ///
    /// Unlike `get_array_memory_size`, slices only count their own rows, so the estimate
    /// of a chunk equals the sum of the estimates of its parts.
    pub fn logical_bytes(&self) -> usize {
        self.batch
            .columns()
            .iter()
            .map(|c| array_logical_bytes(c.as_ref()))
            .sum()
    }

    pub fn take(&self, indices: &UInt32Array) -> StatusResult<Self> {
        let batch = take_record_batch(&self.batch, indices)?;
        Ok(Self { batch })
    }

    pub fn filter(&self, mask: &BooleanArray) -> StatusResult<Self> {
        let batch = filter_record_batch(&self.batch, mask)?;
        Ok(Self { batch })
    }

    /// Concatenates chunks sharing `schema` into one chunk.
    pub fn concat(schema: &SchemaRef, chunks: &[Chunk]) -> StatusResult<Self> {
        let batch = concat_batches(schema, chunks.iter().map(|c| &c.batch))?;
        Ok(Self { batch })
    }
}

fn array_logical_bytes(array: &dyn Array) -> usize {
    let len = array.len();
    match array.data_type() {
        DataType::Utf8 => match array.as_any().downcast_ref::<StringArray>() {
            Some(s) => {
                let offsets = s.value_offsets();
                let data = (offsets[len] - offsets[0]) as usize;
                data + (len + 1) * std::mem::size_of::<i32>()
            }
            None => array.get_array_memory_size(),
        },
        DataType::LargeUtf8 => match array.as_any().downcast_ref::<LargeStringArray>() {
            Some(s) => {
                let offsets = s.value_offsets();
                let data = (offsets[len] - offsets[0]) as usize;
                data + (len + 1) * std::mem::size_of::<i64>()
            }
            None => array.get_array_memory_size(),
        },
        DataType::Boolean => len.div_ceil(8),
        dt => match dt.primitive_width() {
            Some(width) => width * len,
            None => array.get_array_memory_size(),
        },
    }
}

/// Join/group key value, with integers widened to `i64`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyValue {
    Int(i64),
    Utf8(String),
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyValue::Int(v) => write!(f, "{}", v),
            KeyValue::Utf8(v) => write!(f, "'{}'", v),
        }
    }
}

/// Typed view over a key column.
pub enum KeyColumn<'a> {
    Int8(&'a Int8Array),
    Int16(&'a Int16Array),
    Int32(&'a Int32Array),
    Int64(&'a Int64Array),
    Date32(&'a Date32Array),
    Utf8(&'a StringArray),
    LargeUtf8(&'a LargeStringArray),
}

macro_rules! downcast_key {
    ($array:expr, $ty:ty, $variant:ident) => {
        $array
            .as_any()
            .downcast_ref::<$ty>()
            .map(KeyColumn::$variant)
            .ok_or_else(|| Status::internal(concat!("failed to downcast ", stringify!($ty))))
    };
}

impl<'a> KeyColumn<'a> {
    pub fn try_new(array: &'a ArrayRef) -> StatusResult<Self> {
        match array.data_type() {
            DataType::Int8 => downcast_key!(array, Int8Array, Int8),
            DataType::Int16 => downcast_key!(array, Int16Array, Int16),
            DataType::Int32 => downcast_key!(array, Int32Array, Int32),
            DataType::Int64 => downcast_key!(array, Int64Array, Int64),
            DataType::Date32 => downcast_key!(array, Date32Array, Date32),
            DataType::Utf8 => downcast_key!(array, StringArray, Utf8),
            DataType::LargeUtf8 => downcast_key!(array, LargeStringArray, LargeUtf8),
            other => Err(Status::invalid_argument(format!(
                "unsupported key column type: {:?}",
                other
            ))),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            KeyColumn::Int8(a) => a.len(),
            KeyColumn::Int16(a) => a.len(),
            KeyColumn::Int32(a) => a.len(),
            KeyColumn::Int64(a) => a.len(),
            KeyColumn::Date32(a) => a.len(),
            KeyColumn::Utf8(a) => a.len(),
            KeyColumn::LargeUtf8(a) => a.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_null(&self, row: usize) -> bool {
        match self {
            KeyColumn::Int8(a) => a.is_null(row),
            KeyColumn::Int16(a) => a.is_null(row),
            KeyColumn::Int32(a) => a.is_null(row),
            KeyColumn::Int64(a) => a.is_null(row),
            KeyColumn::Date32(a) => a.is_null(row),
            KeyColumn::Utf8(a) => a.is_null(row),
            KeyColumn::LargeUtf8(a) => a.is_null(row),
        }
    }

    fn int_at(&self, row: usize) -> Option<i64> {
        match self {
            KeyColumn::Int8(a) => Some(a.value(row) as i64),
            KeyColumn::Int16(a) => Some(a.value(row) as i64),
            KeyColumn::Int32(a) => Some(a.value(row) as i64),
            KeyColumn::Int64(a) => Some(a.value(row)),
            KeyColumn::Date32(a) => Some(a.value(row) as i64),
            KeyColumn::Utf8(_) | KeyColumn::LargeUtf8(_) => None,
        }
    }

    fn str_at(&self, row: usize) -> Option<&'a str> {
        match self {
            KeyColumn::Utf8(a) => Some(a.value(row)),
            KeyColumn::LargeUtf8(a) => Some(a.value(row)),
            _ => None,
        }
    }

    /// Key at `row`, `None` for SQL NULL.
    pub fn value(&self, row: usize) -> Option<KeyValue> {
        if self.is_null(row) {
            return None;
        }
        if let Some(v) = self.int_at(row) {
            return Some(KeyValue::Int(v));
        }
        self.str_at(row).map(|s| KeyValue::Utf8(s.to_string()))
    }

    /// Seeded hash of the key at `row`. Equal keys hash equally across integer widths.
    pub fn hash(&self, row: usize, seed: u64) -> u64 {
        if self.is_null(row) {
            return hash_null_with_seed(seed);
        }
        if let Some(v) = self.int_at(row) {
            return hash_u64_with_seed(seed, v as u64);
        }
        match self.str_at(row) {
            Some(s) => hash_u64_with_seed(seed, hash_bytes_with_seed(0, s.as_bytes())),
            None => hash_null_with_seed(seed),
        }
    }
}

/// Hashes a standalone key value the same way [`KeyColumn::hash`] hashes a row.
pub fn hash_key_value(key: &KeyValue, seed: u64) -> u64 {
    match key {
        KeyValue::Int(v) => hash_u64_with_seed(seed, *v as u64),
        KeyValue::Utf8(s) => hash_u64_with_seed(seed, hash_bytes_with_seed(0, s.as_bytes())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use arrow::datatypes::{Field, Schema};

    fn int_chunk(values: Vec<Option<i32>>) -> Chunk {
        let schema = Arc::new(Schema::new(vec![Field::new("k", DataType::Int32, true)]));
        let batch = RecordBatch::try_new(schema, vec![Arc::new(Int32Array::from(values))])
            .expect("batch");
        Chunk::new(batch)
    }

    #[test]
    fn logical_bytes_is_additive_over_slices() {
        let chunk = int_chunk(vec![Some(1), Some(2), Some(3), Some(4)]);
        assert_eq!(chunk.logical_bytes(), 16);
        let left = chunk.slice(0, 1);
        let right = chunk.slice(1, 3);
        assert_eq!(left.logical_bytes() + right.logical_bytes(), 16);
    }

    #[test]
    fn key_column_widens_integers() {
        let chunk = int_chunk(vec![Some(7), None]);
        let col = chunk.column_by_name("k").expect("column");
        let keys = KeyColumn::try_new(&col).expect("key column");
        assert_eq!(keys.value(0), Some(KeyValue::Int(7)));
        assert_eq!(keys.value(1), None);
        assert_eq!(keys.hash(0, 42), hash_key_value(&KeyValue::Int(7), 42));

        let wide: ArrayRef = Arc::new(Int64Array::from(vec![7i64]));
        let wide_keys = KeyColumn::try_new(&wide).expect("key column");
        assert_eq!(wide_keys.hash(0, 42), keys.hash(0, 42));
    }

    #[test]
    fn missing_column_is_invalid_argument() {
        let chunk = int_chunk(vec![Some(1)]);
        let err = chunk.column_by_name("nope").unwrap_err();
        assert_eq!(err.code, crate::common::status::StatusCode::InvalidArgument);
    }
}
