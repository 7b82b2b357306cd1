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
/// Seed used by runtime filters on both the build and the probe side.
pub const RUNTIME_FILTER_HASH_SEED: u64 = 1234;

const PARTITION_HASH_SEED: u64 = 0x5bd1_e995_7f4a_7c15;

/// Hash seed for partitioning at `level`.
///
/// Every level gets a distinct seed, so rows that shared a bucket at level `n`
/// are spread again at level `n + 1` unless their keys are equal.
pub fn partition_seed(level: u32) -> u64 {
    mix_u64(PARTITION_HASH_SEED ^ ((level as u64) << 32 | level as u64))
}

pub fn hash_u64_with_seed(seed: u64, value: u64) -> u64 {
    mix_u64(seed ^ value)
}

pub fn hash_bytes_with_seed(seed: u64, bytes: &[u8]) -> u64 {
    let mut hash = seed ^ 0xcbf29ce484222325;
    for byte in bytes {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

pub fn hash_null_with_seed(seed: u64) -> u64 {
    hash_u64_with_seed(seed, 0x9e3779b97f4a7c15)
}

fn mix_u64(mut value: u64) -> u64 {
    value = value.wrapping_add(0x9e3779b97f4a7c15);
    value = (value ^ (value >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
    value = (value ^ (value >> 27)).wrapping_mul(0x94d049bb133111eb);
    value ^ (value >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_seeds_differ_per_level() {
        let seeds: Vec<u64> = (0..16).map(partition_seed).collect();
        for (i, a) in seeds.iter().enumerate() {
            for b in &seeds[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn colliding_keys_split_at_next_level() {
        // Find two keys sharing a bucket at level 0 and check some level separates them.
        let fanout = 16u64;
        let seed0 = partition_seed(0);
        let base = hash_u64_with_seed(seed0, 1) % fanout;
        let other = (2u64..1000)
            .find(|v| hash_u64_with_seed(seed0, *v) % fanout == base)
            .expect("collision");
        let separated = (1..8).any(|level| {
            let seed = partition_seed(level);
            hash_u64_with_seed(seed, 1) % fanout != hash_u64_with_seed(seed, other) % fanout
        });
        assert!(separated);
    }
}
