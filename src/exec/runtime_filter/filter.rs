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
use std::fmt;
use std::str::FromStr;

use arrow::array::BooleanArray;

use crate::common::status::{Status, StatusResult};
use crate::exec::chunk::{Chunk, KeyColumn, KeyValue, hash_key_value};
use crate::exec::hash_table::hash::RUNTIME_FILTER_HASH_SEED;

use super::bloom::BloomFilter;
use super::min_max::MinMaxFilter;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RuntimeFilterKind {
    Bloom,
    MinMax,
}

impl fmt::Display for RuntimeFilterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeFilterKind::Bloom => write!(f, "BLOOM"),
            RuntimeFilterKind::MinMax => write!(f, "MIN_MAX"),
        }
    }
}

impl FromStr for RuntimeFilterKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "BLOOM" => Ok(RuntimeFilterKind::Bloom),
            "MIN_MAX" | "MINMAX" => Ok(RuntimeFilterKind::MinMax),
            other => Err(format!("unknown runtime filter kind: {other}")),
        }
    }
}

/// Filter payload. Immutable once published; consumers read it through `Arc`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RuntimeFilter {
    Membership(BloomFilter),
    Range(MinMaxFilter),
}

impl RuntimeFilter {
    /// Filter with no keys yet. `bloom_filter_bytes` is ignored for range filters.
    pub fn empty(kind: RuntimeFilterKind, bloom_filter_bytes: usize) -> Self {
        match kind {
            RuntimeFilterKind::Bloom => {
                RuntimeFilter::Membership(BloomFilter::with_size_bytes(bloom_filter_bytes))
            }
            RuntimeFilterKind::MinMax => RuntimeFilter::Range(MinMaxFilter::empty()),
        }
    }

    pub fn kind(&self) -> RuntimeFilterKind {
        match self {
            RuntimeFilter::Membership(_) => RuntimeFilterKind::Bloom,
            RuntimeFilter::Range(_) => RuntimeFilterKind::MinMax,
        }
    }

    /// Adds every non-null key of the column.
    pub fn insert_column(&mut self, keys: &KeyColumn<'_>) -> StatusResult<()> {
        match self {
            RuntimeFilter::Membership(bloom) => {
                for row in 0..keys.len() {
                    if !keys.is_null(row) {
                        bloom.insert_hash(keys.hash(row, RUNTIME_FILTER_HASH_SEED));
                    }
                }
                Ok(())
            }
            RuntimeFilter::Range(range) => range.insert_column(keys),
        }
    }

    pub fn merge_from(&mut self, other: &RuntimeFilter) -> StatusResult<()> {
        match (self, other) {
            (RuntimeFilter::Membership(dst), RuntimeFilter::Membership(src)) => dst.merge_from(src),
            (RuntimeFilter::Range(dst), RuntimeFilter::Range(src)) => dst.merge_from(src),
            (dst, src) => Err(Status::invalid_argument(format!(
                "cannot merge runtime filter of kind {} into {}",
                src.kind(),
                dst.kind()
            ))),
        }
    }

    /// `false` only when the key certainly has no build-side match.
    pub fn test_key(&self, key: &KeyValue) -> bool {
        match self {
            RuntimeFilter::Membership(bloom) => {
                bloom.test_hash(hash_key_value(key, RUNTIME_FILTER_HASH_SEED))
            }
            RuntimeFilter::Range(range) => range.test(key),
        }
    }

    /// `false` only when no key within `[lo, hi]` can match.
    pub fn may_overlap(&self, lo: &KeyValue, hi: &KeyValue) -> bool {
        match self {
            RuntimeFilter::Membership(_) if lo == hi => self.test_key(lo),
            RuntimeFilter::Membership(_) => true,
            RuntimeFilter::Range(range) => range.overlaps(lo, hi),
        }
    }

    fn test_row(&self, keys: &KeyColumn<'_>, row: usize) -> bool {
        if keys.is_null(row) {
            return false;
        }
        match self {
            RuntimeFilter::Membership(bloom) => {
                bloom.test_hash(keys.hash(row, RUNTIME_FILTER_HASH_SEED))
            }
            RuntimeFilter::Range(range) => keys.value(row).is_none_or(|key| range.test(&key)),
        }
    }

    /// Drops the rows of `chunk` whose `column` value cannot match. NULL keys are dropped.
    pub fn filter_chunk(&self, chunk: &Chunk, column: &str) -> StatusResult<Chunk> {
        if chunk.is_empty() {
            return Ok(chunk.clone());
        }
        let array = chunk.column_by_name(column)?;
        let keys = KeyColumn::try_new(&array)?;
        let keep: Vec<bool> = (0..keys.len()).map(|row| self.test_row(&keys, row)).collect();
        if keep.iter().all(|v| *v) {
            return Ok(chunk.clone());
        }
        chunk.filter(&BooleanArray::from(keep))
    }
}
