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
use arrow::array::UInt32Array;

use crate::common::status::{Status, StatusResult};
use crate::exec::chunk::{Chunk, KeyColumn};
use crate::exec::hash_table::hash::partition_seed;

/// Upper bound on the fan-out of one partitioning step.
pub const MAX_PARTITION_FANOUT: usize = 256;

/// Routes rows to buckets by `hash(key, level) % fanout`.
#[derive(Debug, Clone, Copy)]
pub struct PartitionDirectory {
    fanout: usize,
    level: u32,
    seed: u64,
}

impl PartitionDirectory {
    pub fn new(fanout: usize, level: u32) -> StatusResult<Self> {
        if fanout < 2 || !fanout.is_power_of_two() || fanout > MAX_PARTITION_FANOUT {
            return Err(Status::invalid_argument(format!(
                "partition fan-out must be a power of two in [2, {}], got {}",
                MAX_PARTITION_FANOUT, fanout
            )));
        }
        Ok(Self {
            fanout,
            level,
            seed: partition_seed(level),
        })
    }

    pub fn fanout(&self) -> usize {
        self.fanout
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn bucket_of(&self, hash: u64) -> usize {
        (hash & (self.fanout as u64 - 1)) as usize
    }

    /// Splits `chunk` by the key in `key_column`. Row order inside a bucket is preserved;
    /// buckets that receive no rows are `None`.
    pub fn split(&self, chunk: &Chunk, key_column: &str) -> StatusResult<Vec<Option<Chunk>>> {
        let mut out = vec![None; self.fanout];
        if chunk.is_empty() {
            return Ok(out);
        }
        let array = chunk.column_by_name(key_column)?;
        let keys = KeyColumn::try_new(&array)?;
        let mut indices: Vec<Vec<u32>> = vec![Vec::new(); self.fanout];
        for row in 0..chunk.len() {
            let bucket = self.bucket_of(keys.hash(row, self.seed));
            indices[bucket].push(row as u32);
        }
        for (bucket, rows) in indices.into_iter().enumerate() {
            if rows.is_empty() {
                continue;
            }
            if rows.len() == chunk.len() {
                out[bucket] = Some(chunk.clone());
                continue;
            }
            out[bucket] = Some(chunk.take(&UInt32Array::from(rows))?);
        }
        Ok(out)
    }
}

/// Smallest power-of-two fan-out whose per-partition share of `estimated_bytes` fits
/// `mem_limit`. Falls back to `configured` when no estimate is available.
pub fn partition_count_for_budget(mem_limit: usize, estimated_bytes: usize, configured: usize) -> usize {
    let configured = configured
        .clamp(2, MAX_PARTITION_FANOUT)
        .next_power_of_two()
        .min(MAX_PARTITION_FANOUT);
    if estimated_bytes == 0 || mem_limit == 0 {
        return configured;
    }
    let mut fanout = 2usize;
    while fanout < MAX_PARTITION_FANOUT && estimated_bytes.div_ceil(fanout) > mem_limit {
        fanout *= 2;
    }
    fanout
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use arrow::array::{Int64Array, RecordBatch};
    use arrow::datatypes::{DataType, Field, Schema};

    fn chunk(keys: Vec<i64>) -> Chunk {
        let schema = Arc::new(Schema::new(vec![Field::new("k", DataType::Int64, true)]));
        let batch = RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(keys))]).unwrap();
        Chunk::new(batch)
    }

    #[test]
    fn rejects_bad_fanout() {
        assert!(PartitionDirectory::new(1, 0).is_err());
        assert!(PartitionDirectory::new(12, 0).is_err());
        assert!(PartitionDirectory::new(512, 0).is_err());
        assert!(PartitionDirectory::new(16, 3).is_ok());
    }

    #[test]
    fn split_keeps_every_row_once() {
        let dir = PartitionDirectory::new(8, 0).unwrap();
        let input = chunk((0..1000).collect());
        let parts = dir.split(&input, "k").unwrap();
        let total: usize = parts.iter().flatten().map(|c| c.len()).sum();
        assert_eq!(total, 1000);
        assert!(parts.iter().filter(|p| p.is_some()).count() > 1);
    }

    #[test]
    fn equal_keys_share_a_bucket_at_every_level() {
        for level in 0..4 {
            let dir = PartitionDirectory::new(16, level).unwrap();
            let parts = dir.split(&chunk(vec![42; 10]), "k").unwrap();
            let non_empty: Vec<_> = parts.iter().flatten().collect();
            assert_eq!(non_empty.len(), 1);
            assert_eq!(non_empty[0].len(), 10);
        }
    }

    #[test]
    fn budget_sizing() {
        assert_eq!(partition_count_for_budget(100, 0, 16), 16);
        assert_eq!(partition_count_for_budget(100, 150, 16), 2);
        assert_eq!(partition_count_for_budget(100, 1000, 16), 16);
        assert_eq!(partition_count_for_budget(1, 1 << 20, 16), MAX_PARTITION_FANOUT);
        assert_eq!(partition_count_for_budget(100, 0, 12), 16);
    }
}
