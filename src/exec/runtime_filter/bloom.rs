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
//! Split-block Bloom filter used as the membership runtime filter.
//!
//! Each bucket is 8 x 32-bit words; a key sets one bit per word. Filters built for
//! the same query share one size, so partial filters merge by OR-ing directories.

use crate::common::status::{Status, StatusResult};

use super::codec::{read_bytes, read_u32_le};

pub const MIN_BLOOM_FILTER_BYTES: usize = 4 * 1024;
pub const MAX_BLOOM_FILTER_BYTES: usize = 16 * 1024 * 1024;

const BUCKET_WORDS: usize = 8;
const LOG_BUCKET_BYTES: u32 = 5;

const SALT: [u32; 8] = [
    0x47b6137b, 0x44974d91, 0x8824ad5b, 0xa2b7289d, 0x705495c7, 0x2df1424b, 0x9efc4947, 0x5c6bfb31,
];

/// Clamps a requested filter size into the supported range and rounds it up to a power of two.
pub fn normalize_filter_size(bytes: usize) -> usize {
    bytes
        .clamp(MIN_BLOOM_FILTER_BYTES, MAX_BLOOM_FILTER_BYTES)
        .next_power_of_two()
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BloomFilter {
    log_num_buckets: u32,
    directory_mask: u32,
    directory: Vec<u32>,
}

impl BloomFilter {
    /// Filter occupying `2^log_space_bytes` bytes.
    pub fn with_log_space(log_space_bytes: u32) -> Self {
        let log_num_buckets = log_space_bytes.saturating_sub(LOG_BUCKET_BYTES).max(1);
        let bucket_count = 1usize << log_num_buckets;
        Self {
            log_num_buckets,
            directory_mask: (bucket_count - 1) as u32,
            directory: vec![0u32; bucket_count * BUCKET_WORDS],
        }
    }

    pub fn with_size_bytes(bytes: usize) -> Self {
        let size = normalize_filter_size(bytes);
        Self::with_log_space(size.trailing_zeros())
    }

    pub fn size_bytes(&self) -> usize {
        self.directory.len() * 4
    }

    pub fn log_space_bytes(&self) -> u32 {
        self.log_num_buckets + LOG_BUCKET_BYTES
    }

    pub fn insert_hash(&mut self, hash: u64) {
        let bucket_idx = (hash as u32) & self.directory_mask;
        let key = (hash >> self.log_num_buckets) as u32;
        let masks = make_mask(key);
        let base = bucket_idx as usize * BUCKET_WORDS;
        for (word, mask) in self.directory[base..base + BUCKET_WORDS]
            .iter_mut()
            .zip(masks)
        {
            *word |= mask;
        }
    }

    /// `false` means definitely absent, `true` means possibly present.
    pub fn test_hash(&self, hash: u64) -> bool {
        let bucket_idx = (hash as u32) & self.directory_mask;
        let key = (hash >> self.log_num_buckets) as u32;
        let masks = make_mask(key);
        let base = bucket_idx as usize * BUCKET_WORDS;
        self.directory[base..base + BUCKET_WORDS]
            .iter()
            .zip(masks)
            .all(|(word, mask)| word & mask != 0)
    }

    pub fn merge_from(&mut self, other: &BloomFilter) -> StatusResult<()> {
        if self.log_num_buckets != other.log_num_buckets
            || self.directory.len() != other.directory.len()
        {
            return Err(Status::invalid_argument(format!(
                "runtime bloom filter merge size mismatch: {} vs {} bytes",
                self.size_bytes(),
                other.size_bytes()
            )));
        }
        for (dst, src) in self.directory.iter_mut().zip(other.directory.iter()) {
            *dst |= *src;
        }
        Ok(())
    }

    /// Expected false positive probability after inserting `ndv` distinct keys
    /// into a filter of `2^log_space_bytes` bytes.
    pub fn false_positive_prob(ndv: usize, log_space_bytes: u32) -> f64 {
        let bits = (1u64 << (log_space_bytes + 3)) as f64;
        let k = BUCKET_WORDS as f64;
        (1.0 - (-k * ndv as f64 / bits).exp()).powf(k)
    }

    /// Smallest `log_space_bytes` keeping the false positive rate at or below `fpp` for `ndv` keys.
    pub fn min_log_space(ndv: usize, fpp: f64) -> u32 {
        let k = BUCKET_WORDS as f64;
        let m = -k * ndv as f64 / (1.0 - fpp.powf(1.0 / k)).ln();
        let bytes = (m / 8.0).max(1.0);
        bytes.log2().ceil().max(0.0) as u32
    }

    /// Largest number of distinct keys that keeps the false positive rate at or below `fpp`.
    pub fn max_ndv(log_space_bytes: u32, fpp: f64) -> usize {
        let ik = 1.0 / BUCKET_WORDS as f64;
        let bits = (1u64 << (log_space_bytes + 3)) as f64;
        (-bits * (1.0 - fpp.powf(ik)).ln() * ik) as usize
    }

    pub(super) fn serialize(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.log_num_buckets.to_le_bytes());
        buf.extend_from_slice(&self.directory_mask.to_le_bytes());
        buf.extend_from_slice(&(self.directory.len() as u32).to_le_bytes());
        for value in &self.directory {
            buf.extend_from_slice(&value.to_le_bytes());
        }
    }

    pub(super) fn deserialize(data: &[u8], offset: &mut usize) -> StatusResult<Self> {
        let log_num_buckets = read_u32_le(data, offset)?;
        let directory_mask = read_u32_le(data, offset)?;
        let words = read_u32_le(data, offset)? as usize;
        if log_num_buckets >= 32 || words != (1usize << log_num_buckets) * BUCKET_WORDS {
            return Err(Status::invalid_argument(
                "runtime bloom filter directory size invalid",
            ));
        }
        if directory_mask as usize != (1usize << log_num_buckets) - 1 {
            return Err(Status::invalid_argument(
                "runtime bloom filter directory mask invalid",
            ));
        }
        let raw = read_bytes(data, offset, words * 4)?;
        let directory = raw
            .chunks_exact(4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        Ok(Self {
            log_num_buckets,
            directory_mask,
            directory,
        })
    }
}

fn make_mask(key: u32) -> [u32; 8] {
    let mut masks = [0u32; 8];
    for (mask, salt) in masks.iter_mut().zip(SALT) {
        *mask = 1u32 << (key.wrapping_mul(salt) >> 27);
    }
    masks
}
