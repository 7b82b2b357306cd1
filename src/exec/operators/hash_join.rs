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
//! Partitioned inner hash join with spill-to-disk.
//!
//! Responsibilities:
//! - Consumes the build side into hash partitions and builds partial runtime filters over
//!   every non-null build key.
//! - Probes in-memory partitions as probe chunks arrive; probe rows of spilled partitions
//!   are spilled alongside and joined after the probe input ends.
//!
//! Key exported interfaces:
//! - Types: `PartitionedHashJoin`, `RuntimeFilterBuildSpec`.
//!
//! Current limitations:
//! - Inner equi-join on one key column. NULL keys never match.

use std::sync::Arc;

use arrow::array::{Array, ArrayRef, RecordBatch, UInt32Array};
use arrow::compute::{is_not_null, take};
use arrow::datatypes::{Schema, SchemaRef};
use hashbrown::HashMap;

use crate::common::ids::{FilterId, PartitionId};
use crate::common::status::{Status, StatusResult};
use crate::exec::chunk::{Chunk, KeyColumn, KeyValue};
use crate::exec::operators::partitioned::{
    PartitionedCore, PartitionedParams, PartitionedStats, ProbeSide,
};
use crate::exec::partition::PartitionState;
use crate::exec::runtime_filter::{RuntimeFilter, RuntimeFilterKind};
use crate::exec::spill::SpillerHandle;
use crate::graceflow_logging::{debug, info};
use crate::runtime::mem_tracker::MemoryBudget;
use crate::runtime::query_context::CancelToken;

/// A runtime filter this join produces from its build keys.
#[derive(Clone, Debug)]
pub struct RuntimeFilterBuildSpec {
    pub filter_id: FilterId,
    pub kind: RuntimeFilterKind,
    pub bloom_filter_bytes: usize,
}

/// Build rows of one partition indexed by key.
struct JoinHashTable {
    build: Chunk,
    rows_by_key: HashMap<KeyValue, Vec<u32>>,
}

impl JoinHashTable {
    fn build(schema: &SchemaRef, chunks: &[Chunk], key_column: &str) -> StatusResult<Self> {
        let build = Chunk::concat(schema, chunks)?;
        let mut rows_by_key: HashMap<KeyValue, Vec<u32>> = HashMap::new();
        if !build.is_empty() {
            let array = build.column_by_name(key_column)?;
            let keys = KeyColumn::try_new(&array)?;
            for row in 0..build.len() {
                if let Some(key) = keys.value(row) {
                    rows_by_key.entry(key).or_default().push(row as u32);
                }
            }
        }
        Ok(Self { build, rows_by_key })
    }

    fn num_keys(&self) -> usize {
        self.rows_by_key.len()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum JoinPhase {
    Build,
    Probe,
    Finished,
}

pub struct PartitionedHashJoin {
    core: PartitionedCore,
    probe_schema: SchemaRef,
    probe_key: String,
    output_schema: SchemaRef,
    filter_specs: Vec<RuntimeFilterBuildSpec>,
    partial_filters: Vec<RuntimeFilter>,
    tables: std::collections::HashMap<PartitionId, JoinHashTable>,
    phase: JoinPhase,
    output_rows: usize,
}

impl PartitionedHashJoin {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        params: PartitionedParams,
        build_schema: SchemaRef,
        build_key: impl Into<String>,
        probe_schema: SchemaRef,
        probe_key: impl Into<String>,
        spiller: SpillerHandle,
        cancel: CancelToken,
        filter_specs: Vec<RuntimeFilterBuildSpec>,
    ) -> StatusResult<Self> {
        let probe_key = probe_key.into();
        let core = PartitionedCore::new(
            "hash join",
            params,
            build_schema.clone(),
            build_key,
            Some(ProbeSide {
                schema: probe_schema.clone(),
                key_column: probe_key.clone(),
            }),
            spiller,
            cancel,
        )?;
        let fields = probe_schema
            .fields()
            .iter()
            .chain(build_schema.fields().iter())
            .cloned()
            .collect::<Vec<_>>();
        let output_schema = Arc::new(Schema::new(fields));
        let partial_filters = filter_specs
            .iter()
            .map(|spec| RuntimeFilter::empty(spec.kind, spec.bloom_filter_bytes))
            .collect();
        Ok(Self {
            core,
            probe_schema,
            probe_key,
            output_schema,
            filter_specs,
            partial_filters,
            tables: std::collections::HashMap::new(),
            phase: JoinPhase::Build,
            output_rows: 0,
        })
    }

    /// Charges this join's reservations to the query-wide `budget` as well.
    pub fn with_query_budget(mut self, budget: &Arc<MemoryBudget>) -> StatusResult<Self> {
        self.core.charge_to(budget)?;
        Ok(self)
    }

    pub fn output_schema(&self) -> &SchemaRef {
        &self.output_schema
    }

    pub fn add_build_chunk(&mut self, chunk: &Chunk) -> StatusResult<()> {
        if self.phase != JoinPhase::Build {
            return Err(Status::illegal_state("hash join build side is already finished"));
        }
        let chunk = drop_null_keys(chunk, self.core.build_key())?;
        if chunk.is_empty() {
            return Ok(());
        }
        if !self.partial_filters.is_empty() {
            let array = chunk.column_by_name(self.core.build_key())?;
            let keys = KeyColumn::try_new(&array)?;
            for filter in &mut self.partial_filters {
                filter.insert_column(&keys)?;
            }
        }
        self.core.add_build_chunk(&chunk)
    }

    /// Ends the build input, builds hash tables for partitions still in memory and
    /// returns one partial runtime filter per attached build spec.
    pub fn finish_build(&mut self) -> StatusResult<Vec<(FilterId, RuntimeFilter)>> {
        if self.phase != JoinPhase::Build {
            return Err(Status::illegal_state("hash join build side is already finished"));
        }
        self.core.check_cancelled()?;
        let roots = self.core.roots().to_vec();
        let mut spilled = 0usize;
        for pid in roots {
            let record = self.core.arena().get(pid)?;
            if record.build.is_spilled() {
                spilled += 1;
                continue;
            }
            if record.build.is_empty() {
                continue;
            }
            let table = JoinHashTable::build(
                self.core.build_schema(),
                record.build.in_memory_chunks(),
                self.core.build_key(),
            )?;
            self.tables.insert(pid, table);
        }
        info!(
            "hash join build finished: partitions={} in_memory={} spilled={} budget_used={}",
            self.core.roots().len(),
            self.tables.len(),
            spilled,
            self.core.budget().used()
        );
        self.phase = JoinPhase::Probe;
        let filters = std::mem::take(&mut self.partial_filters);
        Ok(self
            .filter_specs
            .iter()
            .map(|spec| spec.filter_id)
            .zip(filters)
            .collect())
    }

    /// Joins `chunk` against in-memory partitions and spills probe rows of spilled ones.
    pub fn probe(&mut self, chunk: &Chunk) -> StatusResult<Vec<Chunk>> {
        if self.phase != JoinPhase::Probe {
            return Err(Status::illegal_state(format!(
                "hash join cannot probe in phase {:?}",
                self.phase
            )));
        }
        self.core.check_cancelled()?;
        let chunk = drop_null_keys(chunk, &self.probe_key)?;
        if chunk.is_empty() {
            return Ok(Vec::new());
        }
        let parts = self.core.root_dir().split(&chunk, &self.probe_key)?;
        let mut out = Vec::new();
        for (bucket, part) in parts.into_iter().enumerate() {
            let Some(part) = part else {
                continue;
            };
            let pid = self.core.roots()[bucket];
            if let Some(table) = self.tables.get(&pid) {
                if let Some(joined) = self.join_chunk(table, &part)? {
                    out.push(joined);
                }
                continue;
            }
            let record = self.core.arena().get(pid)?;
            if record.build.is_empty() {
                continue;
            }
            self.core.append_probe(pid, part)?;
        }
        self.output_rows += out.iter().map(Chunk::len).sum::<usize>();
        Ok(out)
    }

    /// Ends the probe input and joins every spilled partition, repartitioning those that
    /// do not fit the budget.
    pub fn finish_probe(&mut self) -> StatusResult<Vec<Chunk>> {
        if self.phase != JoinPhase::Probe {
            return Err(Status::illegal_state(format!(
                "hash join cannot finish probe in phase {:?}",
                self.phase
            )));
        }
        let in_memory: Vec<PartitionId> = self.tables.keys().copied().collect();
        for pid in in_memory {
            self.tables.remove(&pid);
            self.core.complete(pid)?;
        }

        let mut out = Vec::new();
        let mut stack: Vec<PartitionId> = self.core.roots().iter().rev().copied().collect();
        while let Some(pid) = stack.pop() {
            self.core.check_cancelled()?;
            let (state, build_empty, probe_empty) = {
                let record = self.core.arena().get(pid)?;
                let probe_empty = record.probe.as_ref().is_none_or(|p| p.is_empty());
                (record.state, record.build.is_empty(), probe_empty)
            };
            if state != PartitionState::Open {
                continue;
            }
            if build_empty || probe_empty {
                self.core.complete(pid)?;
                continue;
            }
            if self.core.needs_repartition(pid)? {
                let children = self.core.repartition(pid)?;
                // Spilled children are pushed first so in-memory ones are joined (and
                // release their memory) before any spilled sibling is loaded.
                let (in_memory, spilled): (Vec<_>, Vec<_>) = children
                    .into_iter()
                    .partition(|c| self.core.arena().get(*c).is_ok_and(|r| !r.build.is_spilled()));
                stack.extend(spilled);
                stack.extend(in_memory);
                continue;
            }
            out.extend(self.join_partition(pid)?);
        }
        self.phase = JoinPhase::Finished;
        self.output_rows += out.iter().map(Chunk::len).sum::<usize>();
        info!(
            "hash join finished: output_rows={} stats={:?}",
            self.output_rows,
            self.core.stats()
        );
        Ok(out)
    }

    fn join_partition(&mut self, pid: PartitionId) -> StatusResult<Vec<Chunk>> {
        let build = self.core.load_build(pid)?;
        let table = JoinHashTable::build(self.core.build_schema(), &build, self.core.build_key())?;
        drop(build);
        debug!(
            "hash join partition loaded: id={} rows={} keys={}",
            pid,
            table.build.len(),
            table.num_keys()
        );
        let mut out = Vec::new();
        for block in 0..self.core.probe_blocks(pid)? {
            self.core.check_cancelled()?;
            for chunk in self.core.restore_probe_block(pid, block)? {
                if let Some(joined) = self.join_chunk(&table, &chunk)? {
                    out.push(joined);
                }
            }
        }
        self.core.complete(pid)?;
        Ok(out)
    }

    fn join_chunk(&self, table: &JoinHashTable, probe: &Chunk) -> StatusResult<Option<Chunk>> {
        let array = probe.column_by_name(&self.probe_key)?;
        let keys = KeyColumn::try_new(&array)?;
        let mut probe_rows: Vec<u32> = Vec::new();
        let mut build_rows: Vec<u32> = Vec::new();
        for row in 0..probe.len() {
            let Some(key) = keys.value(row) else {
                continue;
            };
            if let Some(matches) = table.rows_by_key.get(&key) {
                for build_row in matches {
                    probe_rows.push(row as u32);
                    build_rows.push(*build_row);
                }
            }
        }
        if probe_rows.is_empty() {
            return Ok(None);
        }
        let probe_idx = UInt32Array::from(probe_rows);
        let build_idx = UInt32Array::from(build_rows);
        let mut columns: Vec<ArrayRef> = Vec::with_capacity(self.output_schema.fields().len());
        for column in probe.columns() {
            columns.push(take(column.as_ref(), &probe_idx, None)?);
        }
        for column in table.build.columns() {
            columns.push(take(column.as_ref(), &build_idx, None)?);
        }
        let batch = RecordBatch::try_new(self.output_schema.clone(), columns)?;
        Ok(Some(Chunk::new(batch)))
    }

    pub fn probe_schema(&self) -> &SchemaRef {
        &self.probe_schema
    }

    pub fn stats(&self) -> PartitionedStats {
        self.core.stats()
    }

    /// Rows emitted so far.
    pub fn output_rows(&self) -> usize {
        self.output_rows
    }
}

fn drop_null_keys(chunk: &Chunk, key_column: &str) -> StatusResult<Chunk> {
    let array = chunk.column_by_name(key_column)?;
    if array.null_count() == 0 {
        return Ok(chunk.clone());
    }
    let mask = is_not_null(array.as_ref())?;
    chunk.filter(&mask)
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int64Array;
    use arrow::datatypes::{DataType, Field};

    use crate::exec::spill::ipc_serde::SpillCodec;
    use crate::exec::spill::{InMemorySpillStorage, Spiller};

    fn schema(name: &str) -> SchemaRef {
        Arc::new(Schema::new(vec![Field::new(name, DataType::Int64, true)]))
    }

    fn chunk(name: &str, keys: Vec<Option<i64>>) -> Chunk {
        Chunk::new(RecordBatch::try_new(schema(name), vec![Arc::new(Int64Array::from(keys))]).unwrap())
    }

    fn join(mem_limit: usize) -> PartitionedHashJoin {
        let spiller =
            Arc::new(Spiller::new(Arc::new(InMemorySpillStorage::new()), SpillCodec::None).unwrap());
        PartitionedHashJoin::new(
            PartitionedParams {
                partition_count: 4,
                mem_limit,
                max_partition_depth: 8,
            },
            schema("b"),
            "b",
            schema("p"),
            "p",
            spiller,
            CancelToken::new(),
            vec![RuntimeFilterBuildSpec {
                filter_id: FilterId(1),
                kind: RuntimeFilterKind::MinMax,
                bloom_filter_bytes: 4096,
            }],
        )
        .unwrap()
    }

    fn count_rows(chunks: &[Chunk]) -> usize {
        chunks.iter().map(Chunk::len).sum()
    }

    #[test]
    fn null_keys_never_match() {
        let mut j = join(1 << 20);
        j.add_build_chunk(&chunk("b", vec![Some(1), None, Some(2)])).unwrap();
        let filters = j.finish_build().unwrap();
        assert_eq!(filters.len(), 1);
        assert!(!filters[0].1.test_key(&KeyValue::Int(3)));
        let mut out = j.probe(&chunk("p", vec![None, Some(1), Some(2), Some(3)])).unwrap();
        out.extend(j.finish_probe().unwrap());
        assert_eq!(count_rows(&out), 2);
        assert_eq!(out[0].batch.num_columns(), 2);
    }

    #[test]
    fn probe_before_build_finished_is_illegal() {
        let mut j = join(1 << 20);
        assert!(j.probe(&chunk("p", vec![Some(1)])).is_err());
        j.finish_build().unwrap();
        assert!(j.add_build_chunk(&chunk("b", vec![Some(1)])).is_err());
    }

    #[test]
    fn tiny_budget_spills_and_still_joins() {
        let mut j = join(32);
        j.add_build_chunk(&chunk("b", (0..200).map(Some).collect())).unwrap();
        j.finish_build().unwrap();
        let mut out = j.probe(&chunk("p", (100..300).map(Some).collect())).unwrap();
        out.extend(j.finish_probe().unwrap());
        assert_eq!(count_rows(&out), 100);
        assert!(j.stats().partitions_spilled > 0);
    }
}
