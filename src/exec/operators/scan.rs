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
//! Scan-side consumer of runtime filters.
//!
//! Responsibilities:
//! - Waits, bounded by one overall `max_wait`, for every runtime filter targeting the scan.
//! - Skips whole scan ranges whose column statistics cannot overlap an arrived filter.
//! - Drops rows whose key cannot match; rows that might match are always kept.
//!
//! Key exported interfaces:
//! - Types: `ScanConsumer`, `ScanRange`, `ScanStats`.
//!
//! Current limitations:
//! - Rows come from in-memory chunks; storage formats are out of scope.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::common::ids::{ConsumerId, FilterId};
use crate::common::status::{Status, StatusResult};
use crate::exec::chunk::{Chunk, KeyValue};
use crate::exec::runtime_filter::RuntimeFilter;
use crate::graceflow_logging::{debug, info};
use crate::runtime::query_context::CancelToken;
use crate::runtime::runtime_filter_bank::RuntimeFilterBank;
use crate::runtime::runtime_filter_entry::WaitOutcome;

/// A unit of scan work: its rows plus optional per-column `(min, max)` statistics.
#[derive(Clone, Debug, Default)]
pub struct ScanRange {
    pub chunks: Vec<Chunk>,
    pub column_stats: HashMap<String, (KeyValue, KeyValue)>,
}

impl ScanRange {
    pub fn new(chunks: Vec<Chunk>) -> Self {
        Self {
            chunks,
            column_stats: HashMap::new(),
        }
    }

    pub fn with_column_stats(mut self, column: impl Into<String>, min: KeyValue, max: KeyValue) -> Self {
        self.column_stats.insert(column.into(), (min, max));
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScanStats {
    pub ranges_total: usize,
    pub ranges_pruned: usize,
    pub rows_read: usize,
    pub rows_filtered: usize,
    pub filters_arrived: usize,
    pub filters_timed_out: usize,
    pub filters_disabled: usize,
}

struct AppliedFilter {
    filter_id: FilterId,
    column: String,
    filter: Arc<RuntimeFilter>,
}

pub struct ScanConsumer {
    consumer_id: ConsumerId,
    bank: Arc<RuntimeFilterBank>,
    filter_ids: Vec<FilterId>,
    max_wait: Duration,
    cancel: CancelToken,
    applied: Option<Vec<AppliedFilter>>,
    stats: ScanStats,
}

impl ScanConsumer {
    /// Registers `consumer_id` for every filter in `filter_ids` with the worker's bank.
    pub fn new(
        consumer_id: ConsumerId,
        bank: Arc<RuntimeFilterBank>,
        filter_ids: Vec<FilterId>,
        max_wait: Duration,
        cancel: CancelToken,
    ) -> StatusResult<Self> {
        for filter_id in &filter_ids {
            bank.register_consumer(consumer_id, *filter_id)?;
        }
        Ok(Self {
            consumer_id,
            bank,
            filter_ids,
            max_wait,
            cancel,
            applied: None,
            stats: ScanStats::default(),
        })
    }

    pub fn stats(&self) -> &ScanStats {
        &self.stats
    }

    /// Waits for the expected filters. Called by the first `scan_range`; a filter that has
    /// not arrived by then is ignored for the rest of the scan.
    pub fn wait_for_filters(&mut self) -> StatusResult<()> {
        if self.applied.is_some() {
            return Ok(());
        }
        let started = Instant::now();
        let give_up_at = started.checked_add(self.max_wait);
        let mut applied = Vec::with_capacity(self.filter_ids.len());
        for filter_id in &self.filter_ids {
            self.cancel.check()?;
            let remaining = give_up_at
                .map(|t| t.saturating_duration_since(Instant::now()))
                .unwrap_or(self.max_wait);
            match self.bank.await_filter(*filter_id, remaining)? {
                WaitOutcome::Arrived(filter) => {
                    self.stats.filters_arrived += 1;
                    let column = self.bank.desc(*filter_id)?.target_expr.clone();
                    applied.push(AppliedFilter {
                        filter_id: *filter_id,
                        column,
                        filter,
                    });
                }
                WaitOutcome::TimedOut => self.stats.filters_timed_out += 1,
                WaitOutcome::Disabled => self.stats.filters_disabled += 1,
                WaitOutcome::Cancelled => {
                    return Err(Status::cancelled(format!(
                        "scan consumer {} cancelled while waiting for runtime filter {}",
                        self.consumer_id, filter_id
                    )));
                }
            }
        }
        info!(
            "scan consumer {} runtime filters: arrived={} timed_out={} disabled={} waited_ms={}",
            self.consumer_id,
            self.stats.filters_arrived,
            self.stats.filters_timed_out,
            self.stats.filters_disabled,
            started.elapsed().as_millis()
        );
        self.applied = Some(applied);
        Ok(())
    }

    /// Returns the rows of `range` that may survive the arrived filters.
    pub fn scan_range(&mut self, range: &ScanRange) -> StatusResult<Vec<Chunk>> {
        self.wait_for_filters()?;
        self.cancel.check()?;
        self.stats.ranges_total += 1;
        let applied = self.applied.as_deref().unwrap_or(&[]);

        for f in applied {
            if let Some((lo, hi)) = range.column_stats.get(&f.column)
                && !f.filter.may_overlap(lo, hi)
            {
                debug!(
                    "scan range pruned: consumer={} filter_id={} column={} min={} max={}",
                    self.consumer_id, f.filter_id, f.column, lo, hi
                );
                self.stats.ranges_pruned += 1;
                return Ok(Vec::new());
            }
        }

        let mut out = Vec::with_capacity(range.chunks.len());
        for chunk in &range.chunks {
            self.cancel.check()?;
            self.stats.rows_read += chunk.len();
            let mut current = chunk.clone();
            for f in applied {
                if current.is_empty() {
                    break;
                }
                current = f.filter.filter_chunk(&current, &f.column)?;
            }
            self.stats.rows_filtered += chunk.len() - current.len();
            if !current.is_empty() {
                out.push(current);
            }
        }
        Ok(out)
    }
}
