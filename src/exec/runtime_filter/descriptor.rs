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
use std::time::Duration;

use crate::common::config;
use crate::common::ids::FilterId;

use super::bloom::{BloomFilter, normalize_filter_size};
use super::filter::RuntimeFilterKind;

/// Which runtime filters a query produces.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RuntimeFilterMode {
    /// No runtime filters.
    Off,
    /// Only filters whose producers and consumers share one worker.
    Local,
    /// Local and cluster-wide filters.
    Global,
}

impl RuntimeFilterMode {
    pub fn from_config() -> Self {
        config::runtime_filter_mode()
            .parse()
            .unwrap_or(RuntimeFilterMode::Global)
    }

    pub fn allows(self, desc: &RuntimeFilterDesc) -> bool {
        match self {
            RuntimeFilterMode::Off => false,
            RuntimeFilterMode::Local => desc.is_local,
            RuntimeFilterMode::Global => true,
        }
    }
}

impl fmt::Display for RuntimeFilterMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeFilterMode::Off => write!(f, "OFF"),
            RuntimeFilterMode::Local => write!(f, "LOCAL"),
            RuntimeFilterMode::Global => write!(f, "GLOBAL"),
        }
    }
}

impl FromStr for RuntimeFilterMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "OFF" => Ok(RuntimeFilterMode::Off),
            "LOCAL" => Ok(RuntimeFilterMode::Local),
            "GLOBAL" => Ok(RuntimeFilterMode::Global),
            other => Err(format!("unknown runtime filter mode: {other}")),
        }
    }
}

/// Planner-provided description of one runtime filter. Immutable after construction.
#[derive(Clone, Debug, PartialEq)]
pub struct RuntimeFilterDesc {
    pub filter_id: FilterId,
    pub kind: RuntimeFilterKind,
    /// Scan column the filter is applied to.
    pub target_expr: String,
    /// Build-side key column the filter is computed from.
    pub build_expr: String,
    pub expected_producer_count: usize,
    /// Measured from the moment the coordinator opens the filter.
    pub arrival_deadline: Duration,
    /// Resolved inside one worker without going through the coordinator.
    pub is_local: bool,
    /// Membership filter size in bytes, already normalized.
    pub bloom_filter_bytes: usize,
}

impl RuntimeFilterDesc {
    /// Descriptor with deadline and filter size taken from the process configuration.
    pub fn new(
        filter_id: FilterId,
        kind: RuntimeFilterKind,
        target_expr: impl Into<String>,
        build_expr: impl Into<String>,
        expected_producer_count: usize,
    ) -> Self {
        Self {
            filter_id,
            kind,
            target_expr: target_expr.into(),
            build_expr: build_expr.into(),
            expected_producer_count,
            arrival_deadline: Duration::from_millis(config::runtime_filter_wait_time_ms()),
            is_local: false,
            bloom_filter_bytes: normalize_filter_size(config::bloom_filter_size()),
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.arrival_deadline = deadline;
        self
    }

    pub fn with_local(mut self, is_local: bool) -> Self {
        self.is_local = is_local;
        self
    }

    pub fn with_bloom_filter_bytes(mut self, bytes: usize) -> Self {
        self.bloom_filter_bytes = normalize_filter_size(bytes);
        self
    }
}

/// Whether a membership filter of `filter_bytes` over `max_ndv` keys would be too
/// imprecise to be worth building.
pub fn should_disable_filter(max_ndv: usize, filter_bytes: usize, max_filter_error_rate: f64) -> bool {
    let log_space = normalize_filter_size(filter_bytes).trailing_zeros();
    BloomFilter::false_positive_prob(max_ndv, log_space) > max_filter_error_rate
}

/// [`should_disable_filter`] with the configured filter size and error rate.
pub fn should_disable_filter_by_config(max_ndv: usize) -> bool {
    should_disable_filter(
        max_ndv,
        config::bloom_filter_size(),
        config::max_filter_error_rate(),
    )
}
