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
//! Runtime filter payloads and descriptors.
//!
//! Responsibilities:
//! - Builds membership (split-block Bloom) and range (min/max) filters from build-side keys.
//! - Merges partial filters from several producers; merging is commutative and associative.
//! - Applies filters to scan chunks and scan-range statistics without ever dropping a matching row.
//!
//! Key exported interfaces:
//! - Types: `RuntimeFilter`, `RuntimeFilterKind`, `RuntimeFilterDesc`, `RuntimeFilterMode`.
//! - Functions: `encode_runtime_filter`, `decode_runtime_filter`, `should_disable_filter`.
//!
//! Current limitations:
//! - Keys are single integer, date or string columns.

mod bloom;
mod codec;
mod descriptor;
mod filter;
mod min_max;

pub use bloom::{BloomFilter, MAX_BLOOM_FILTER_BYTES, MIN_BLOOM_FILTER_BYTES, normalize_filter_size};
pub use codec::{decode_runtime_filter, encode_runtime_filter};
pub use descriptor::{
    RuntimeFilterDesc, RuntimeFilterMode, should_disable_filter, should_disable_filter_by_config,
};
pub use filter::{RuntimeFilter, RuntimeFilterKind};
pub use min_max::MinMaxFilter;
