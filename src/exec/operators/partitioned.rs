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
//! Build-side partitioning, spilling and recursive repartitioning shared by the
//! partitioned hash join and hash aggregation.
//!
//! Responsibilities:
//! - Routes input rows to `partition_count` level-0 partitions and keeps them within one
//!   operator-wide [`MemoryBudget`], spilling victims when a reservation fails.
//! - Splits oversized spilled partitions into children at `level + 1` with a level-dependent
//!   hash seed, streaming the parent's blocks so the parent is never fully materialised.
//! - Fails with `RESOURCE_LIMIT_EXCEEDED` instead of creating a partition at the depth limit.
//!
//! Key exported interfaces:
//! - Types: `PartitionedParams`, `PartitionedStats`.
//!
//! Current limitations:
//! - One key column per operator.

use std::collections::HashMap;
use std::sync::Arc;

use arrow::datatypes::SchemaRef;

use crate::common::config;
use crate::common::ids::PartitionId;
use crate::common::status::{Status, StatusResult};
use crate::exec::chunk::Chunk;
use crate::exec::partition::{
    MAX_PARTITION_FANOUT, PartitionArena, PartitionDirectory, PartitionState, SpillablePartition,
    partition_count_for_budget,
};
use crate::exec::spill::SpillerHandle;
use crate::graceflow_logging::{debug, info};
use crate::runtime::mem_tracker::MemoryBudget;
use crate::runtime::query_context::CancelToken;

/// Planner-provided sizing of one partitioned operator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PartitionedParams {
    pub partition_count: usize,
    pub mem_limit: usize,
    pub max_partition_depth: u32,
}

impl PartitionedParams {
    pub fn from_config() -> Self {
        Self {
            partition_count: config::partition_count(),
            mem_limit: config::mem_limit_bytes(),
            max_partition_depth: config::max_partition_depth(),
        }
    }

    /// Sizes the fanout so that `estimated_build_bytes` split evenly across the
    /// level-0 partitions fits in `mem_limit`. An unknown (zero) estimate falls back
    /// to the configured partition count.
    pub fn for_build_estimate(estimated_build_bytes: usize, mem_limit: usize) -> Self {
        Self {
            partition_count: partition_count_for_budget(
                mem_limit,
                estimated_build_bytes,
                config::partition_count(),
            ),
            mem_limit,
            max_partition_depth: config::max_partition_depth(),
        }
    }

    pub fn validate(&self) -> StatusResult<()> {
        if self.partition_count < 2
            || !self.partition_count.is_power_of_two()
            || self.partition_count > MAX_PARTITION_FANOUT
        {
            return Err(Status::invalid_argument(format!(
                "partition_count must be a power of two in [2, {}], got {}",
                MAX_PARTITION_FANOUT, self.partition_count
            )));
        }
        if self.max_partition_depth == 0 {
            return Err(Status::invalid_argument("max_partition_depth must be positive"));
        }
        if self.mem_limit == 0 {
            return Err(Status::invalid_argument("mem_limit must be positive"));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PartitionedStats {
    pub partitions_created: usize,
    pub partitions_spilled: usize,
    pub repartitions: usize,
    pub max_level: u32,
    pub peak_memory: usize,
    pub spilled_rows: u64,
    pub spilled_bytes: u64,
}

/// Probe-side storage carried alongside the build side (join only).
pub(crate) struct ProbeSide {
    pub(crate) schema: SchemaRef,
    pub(crate) key_column: String,
}

pub(crate) struct PartitionedCore {
    op_name: &'static str,
    params: PartitionedParams,
    build_schema: SchemaRef,
    build_key: String,
    probe: Option<ProbeSide>,
    spiller: SpillerHandle,
    budget: Arc<MemoryBudget>,
    cancel: CancelToken,
    arena: PartitionArena,
    roots: Vec<PartitionId>,
    root_dir: PartitionDirectory,
    /// Bytes force-reserved while a spilled partition is loaded for processing.
    pinned: HashMap<PartitionId, usize>,
    partitions_spilled: usize,
    repartitions: usize,
}

impl PartitionedCore {
    pub(crate) fn new(
        op_name: &'static str,
        params: PartitionedParams,
        build_schema: SchemaRef,
        build_key: impl Into<String>,
        probe: Option<ProbeSide>,
        spiller: SpillerHandle,
        cancel: CancelToken,
    ) -> StatusResult<Self> {
        params.validate()?;
        let build_key = build_key.into();
        build_schema.index_of(&build_key).map_err(|_| {
            Status::invalid_argument(format!("{} build key '{}' not in schema", op_name, build_key))
        })?;
        if let Some(p) = &probe {
            p.schema.index_of(&p.key_column).map_err(|_| {
                Status::invalid_argument(format!(
                    "{} probe key '{}' not in schema",
                    op_name, p.key_column
                ))
            })?;
        }
        let root_dir = PartitionDirectory::new(params.partition_count, 0)?;
        let budget = Arc::new(MemoryBudget::new(op_name, params.mem_limit));
        let mut core = Self {
            op_name,
            params,
            build_schema,
            build_key,
            probe,
            spiller,
            budget,
            cancel,
            arena: PartitionArena::new(),
            roots: Vec::with_capacity(params.partition_count),
            root_dir,
            pinned: HashMap::new(),
            partitions_spilled: 0,
            repartitions: 0,
        };
        for bucket in 0..params.partition_count {
            let build = SpillablePartition::new(core.build_schema.clone(), core.spiller.clone());
            let probe = core.new_probe_partition();
            let id = core.arena.add(None, 0, bucket, build, probe)?;
            core.roots.push(id);
        }
        Ok(core)
    }

    fn new_probe_partition(&self) -> Option<SpillablePartition> {
        self.probe
            .as_ref()
            .map(|p| SpillablePartition::new_spilled(p.schema.clone(), self.spiller.clone()))
    }

    pub(crate) fn build_schema(&self) -> &SchemaRef {
        &self.build_schema
    }

    pub(crate) fn build_key(&self) -> &str {
        &self.build_key
    }

    pub(crate) fn budget(&self) -> &Arc<MemoryBudget> {
        &self.budget
    }

    /// Re-roots the operator budget under `parent` so every reservation is also
    /// charged to the enclosing query. Only valid before any input is accepted.
    pub(crate) fn charge_to(&mut self, parent: &Arc<MemoryBudget>) -> StatusResult<()> {
        if self.budget.used() != 0 {
            return Err(Status::illegal_state(format!(
                "{} budget already holds {} bytes",
                self.op_name,
                self.budget.used()
            )));
        }
        self.budget = Arc::new(MemoryBudget::new_child(
            self.op_name,
            self.params.mem_limit,
            parent,
        ));
        Ok(())
    }

    pub(crate) fn arena(&self) -> &PartitionArena {
        &self.arena
    }

    pub(crate) fn roots(&self) -> &[PartitionId] {
        &self.roots
    }

    pub(crate) fn root_dir(&self) -> &PartitionDirectory {
        &self.root_dir
    }

    pub(crate) fn check_cancelled(&self) -> StatusResult<()> {
        self.cancel.check()
    }

    pub(crate) fn add_build_chunk(&mut self, chunk: &Chunk) -> StatusResult<()> {
        self.check_cancelled()?;
        let parts = self.root_dir.split(chunk, &self.build_key)?;
        for (bucket, part) in parts.into_iter().enumerate() {
            if let Some(part) = part {
                self.append_build(self.roots[bucket], part)?;
            }
        }
        Ok(())
    }

    /// Appends to a partition's build side, spilling under memory pressure.
    ///
    /// A failed reservation spills the largest in-memory partition and retries once;
    /// if that is not enough the target itself is spilled and the chunk goes to its store.
    pub(crate) fn append_build(&mut self, pid: PartitionId, chunk: Chunk) -> StatusResult<()> {
        if self.arena.get(pid)?.build.is_spilled() {
            return self.arena.get_mut(pid)?.build.append(chunk);
        }
        let bytes = chunk.logical_bytes();
        if !self.budget.try_reserve(bytes) {
            if let Some(victim) = self.largest_in_memory_partition() {
                self.spill_partition(victim)?;
            }
            let target_spilled = self.arena.get(pid)?.build.is_spilled();
            if target_spilled || !self.budget.try_reserve(bytes) {
                if !target_spilled {
                    self.spill_partition(pid)?;
                }
                return self.arena.get_mut(pid)?.build.append(chunk);
            }
        }
        let appended = self.arena.get_mut(pid)?.build.append(chunk);
        if appended.is_err() {
            self.budget.release(bytes);
        }
        appended
    }

    pub(crate) fn append_probe(&mut self, pid: PartitionId, chunk: Chunk) -> StatusResult<()> {
        let op_name = self.op_name;
        let record = self.arena.get_mut(pid)?;
        let probe = record.probe.as_mut().ok_or_else(|| {
            Status::internal(format!("{} partition {} has no probe side", op_name, pid))
        })?;
        probe.append(chunk)
    }

    fn largest_in_memory_partition(&self) -> Option<PartitionId> {
        self.arena
            .iter()
            .filter(|r| r.state == PartitionState::Open && !r.build.is_spilled())
            .filter(|r| r.build.in_memory_bytes() > 0)
            .max_by_key(|r| r.build.in_memory_bytes())
            .map(|r| r.id)
    }

    /// Moves a partition's buffered build rows to spill storage and returns the bytes freed.
    pub(crate) fn spill_partition(&mut self, pid: PartitionId) -> StatusResult<usize> {
        let record = self.arena.get_mut(pid)?;
        if record.build.is_spilled() {
            return Ok(0);
        }
        let level = record.level;
        let rows = record.build.num_rows();
        let freed = record.build.spill()?;
        self.budget.release(freed);
        self.partitions_spilled += 1;
        debug!(
            "{} partition spilled: id={} level={} rows={} freed_bytes={} budget_used={}",
            self.op_name,
            pid,
            level,
            rows,
            freed,
            self.budget.used()
        );
        Ok(freed)
    }

    /// Whether a spilled partition is too large to load within the remaining budget.
    pub(crate) fn needs_repartition(&self, pid: PartitionId) -> StatusResult<bool> {
        let record = self.arena.get(pid)?;
        Ok(record.build.is_spilled()
            && record.build.num_rows() > 1
            && record.build.estimated_size() > self.budget.available())
    }

    /// Splits `pid` into `partition_count` children at the next level and returns the
    /// non-empty ones. The parent's rows are streamed block by block.
    pub(crate) fn repartition(&mut self, pid: PartitionId) -> StatusResult<Vec<PartitionId>> {
        let (level, rows, bytes) = {
            let record = self.arena.get(pid)?;
            (
                record.level,
                record.build.num_rows(),
                record.build.estimated_size(),
            )
        };
        let next_level = level + 1;
        if next_level >= self.params.max_partition_depth {
            return Err(Status::resource_limit_exceeded(format!(
                "Cannot perform {}. Partitioned input data too many times. This could mean there is \
                 too much skew in the data or the memory limit is set too low. \
                 (partition={} level={} max_partition_depth={} rows={} bytes={} mem_limit={})",
                self.op_name,
                pid,
                level,
                self.params.max_partition_depth,
                rows,
                bytes,
                self.params.mem_limit
            )));
        }
        let dir = PartitionDirectory::new(self.params.partition_count, next_level)?;
        self.arena.get_mut(pid)?.state = PartitionState::Pinned;

        let mut children = Vec::with_capacity(dir.fanout());
        for bucket in 0..dir.fanout() {
            let build = SpillablePartition::new(self.build_schema.clone(), self.spiller.clone());
            let probe = self.new_probe_partition();
            children.push(self.arena.add(Some(pid), next_level, bucket, build, probe)?);
        }

        let num_blocks = self.arena.get(pid)?.build.num_blocks();
        for block in 0..num_blocks {
            self.check_cancelled()?;
            let chunks = self.arena.get(pid)?.build.restore_block(block)?;
            for chunk in chunks {
                for (bucket, part) in dir.split(&chunk, &self.build_key)?.into_iter().enumerate() {
                    if let Some(part) = part {
                        self.append_build(children[bucket], part)?;
                    }
                }
            }
        }

        if let Some(probe_key) = self.probe.as_ref().map(|p| p.key_column.clone()) {
            let num_probe_blocks = self
                .arena
                .get(pid)?
                .probe
                .as_ref()
                .map(SpillablePartition::num_blocks)
                .unwrap_or(0);
            for block in 0..num_probe_blocks {
                self.check_cancelled()?;
                let chunks = match self.arena.get(pid)?.probe.as_ref() {
                    Some(probe) => probe.restore_block(block)?,
                    None => Vec::new(),
                };
                for chunk in chunks {
                    for (bucket, part) in dir.split(&chunk, &probe_key)?.into_iter().enumerate() {
                        if let Some(part) = part {
                            self.append_probe(children[bucket], part)?;
                        }
                    }
                }
            }
        }

        let record = self.arena.get_mut(pid)?;
        record.build.release();
        if let Some(probe) = record.probe.as_mut() {
            probe.release();
        }
        record.state = PartitionState::Repartitioned;
        self.repartitions += 1;

        let mut non_empty = Vec::with_capacity(children.len());
        for child in children {
            let record = self.arena.get_mut(child)?;
            if record.build.is_empty() {
                record.state = PartitionState::Completed;
                if let Some(probe) = record.probe.as_mut() {
                    probe.release();
                }
            } else {
                non_empty.push(child);
            }
        }
        info!(
            "{} repartitioned: id={} level={} rows={} bytes={} children={}",
            self.op_name,
            pid,
            level,
            rows,
            bytes,
            non_empty.len()
        );
        Ok(non_empty)
    }

    /// Materialises the build rows of `pid` for processing and pins the partition.
    pub(crate) fn load_build(&mut self, pid: PartitionId) -> StatusResult<Vec<Chunk>> {
        let record = self.arena.get_mut(pid)?;
        record.state = PartitionState::Pinned;
        if !record.build.is_spilled() {
            return Ok(record.build.in_memory_chunks().to_vec());
        }
        let size = record.build.estimated_size();
        let chunks = record.build.reload()?;
        self.budget.force_reserve(size);
        self.pinned.insert(pid, size);
        Ok(chunks)
    }

    /// Number of spilled probe blocks held by `pid`.
    pub(crate) fn probe_blocks(&self, pid: PartitionId) -> StatusResult<usize> {
        Ok(self
            .arena
            .get(pid)?
            .probe
            .as_ref()
            .map(SpillablePartition::num_blocks)
            .unwrap_or(0))
    }

    pub(crate) fn restore_probe_block(&self, pid: PartitionId, block: usize) -> StatusResult<Vec<Chunk>> {
        match self.arena.get(pid)?.probe.as_ref() {
            Some(probe) => probe.restore_block(block),
            None => Ok(Vec::new()),
        }
    }

    pub(crate) fn restore_build_block(&self, pid: PartitionId, block: usize) -> StatusResult<Vec<Chunk>> {
        self.arena.get(pid)?.build.restore_block(block)
    }

    /// Releases a partition's rows and memory once its output has been produced.
    pub(crate) fn complete(&mut self, pid: PartitionId) -> StatusResult<()> {
        let record = self.arena.get_mut(pid)?;
        let in_memory = record.build.in_memory_bytes();
        record.build.release();
        if let Some(probe) = record.probe.as_mut() {
            probe.release();
        }
        record.state = PartitionState::Completed;
        self.budget.release(in_memory);
        if let Some(pinned) = self.pinned.remove(&pid) {
            self.budget.release(pinned);
        }
        Ok(())
    }

    pub(crate) fn stats(&self) -> PartitionedStats {
        let spill = self.spiller.stats();
        PartitionedStats {
            partitions_created: self.arena.len(),
            partitions_spilled: self.partitions_spilled,
            repartitions: self.repartitions,
            max_level: self.arena.max_level(),
            peak_memory: self.budget.peak(),
            spilled_rows: spill.spill_rows(),
            spilled_bytes: spill.spill_bytes(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Int64Array, RecordBatch};
    use arrow::datatypes::{DataType, Field, Schema};

    use crate::common::status::StatusCode;
    use crate::exec::spill::ipc_serde::SpillCodec;
    use crate::exec::spill::{InMemorySpillStorage, Spiller};

    fn schema() -> SchemaRef {
        Arc::new(Schema::new(vec![Field::new("k", DataType::Int64, true)]))
    }

    fn chunk(keys: Vec<i64>) -> Chunk {
        Chunk::new(RecordBatch::try_new(schema(), vec![Arc::new(Int64Array::from(keys))]).unwrap())
    }

    fn core(mem_limit: usize, depth: u32) -> PartitionedCore {
        let spiller =
            Arc::new(Spiller::new(Arc::new(InMemorySpillStorage::new()), SpillCodec::None).unwrap());
        let params = PartitionedParams {
            partition_count: 4,
            mem_limit,
            max_partition_depth: depth,
        };
        PartitionedCore::new("test", params, schema(), "k", None, spiller, CancelToken::new())
            .unwrap()
    }

    fn leaf_keys(core: &PartitionedCore) -> Vec<i64> {
        let mut out = Vec::new();
        for record in core.arena().leaves() {
            for c in record.build.reload().unwrap() {
                let a = c.batch.column(0).as_any().downcast_ref::<Int64Array>().unwrap();
                out.extend(a.values().iter().copied());
            }
        }
        out.sort();
        out
    }

    #[test]
    fn params_validation() {
        let mut p = PartitionedParams {
            partition_count: 16,
            mem_limit: 1,
            max_partition_depth: 4,
        };
        assert!(p.validate().is_ok());
        p.partition_count = 6;
        assert!(p.validate().is_err());
        p.partition_count = 16;
        p.max_partition_depth = 0;
        assert!(p.validate().is_err());
    }

    #[test]
    fn build_estimate_drives_fanout() {
        let estimate = 64 * 1024;
        let roomy = PartitionedParams::for_build_estimate(estimate, 64 * 1024);
        let tight = PartitionedParams::for_build_estimate(estimate, 1024);
        assert_eq!(roomy.partition_count, 2);
        assert_eq!(tight.partition_count, 64);
        assert!(tight.validate().is_ok());
        assert_eq!(tight.mem_limit, 1024);

        let unknown = PartitionedParams::for_build_estimate(0, 1024);
        assert_eq!(unknown.partition_count, PartitionedParams::from_config().partition_count);
    }

    #[test]
    fn query_budget_sees_operator_reservations() {
        let query = Arc::new(MemoryBudget::new("query", 1 << 20));
        let mut core = core(64, 8);
        core.charge_to(&query).unwrap();
        core.add_build_chunk(&chunk((0..6).collect())).unwrap();
        assert_eq!(core.budget().used(), 48);
        assert_eq!(query.used(), 48);
        let err = core.charge_to(&query).unwrap_err();
        assert_eq!(err.code, StatusCode::IllegalState);
    }

    #[test]
    fn pressure_spills_and_keeps_rows() {
        let mut core = core(64, 8);
        for i in 0..20 {
            core.add_build_chunk(&chunk((i * 10..i * 10 + 10).collect())).unwrap();
        }
        let stats = core.stats();
        assert!(stats.partitions_spilled > 0);
        assert!(core.budget().used() <= 64);
        assert_eq!(leaf_keys(&core), (0..200).collect::<Vec<_>>());
    }

    #[test]
    fn repartition_preserves_rows() {
        let mut core = core(16, 8);
        core.add_build_chunk(&chunk((0..100).collect())).unwrap();
        let spilled: Vec<PartitionId> = core
            .roots()
            .iter()
            .copied()
            .filter(|id| core.arena().get(*id).unwrap().build.is_spilled())
            .collect();
        assert!(!spilled.is_empty());
        let children = core.repartition(spilled[0]).unwrap();
        assert!(!children.is_empty());
        assert_eq!(core.arena().get(spilled[0]).unwrap().state, PartitionState::Repartitioned);
        assert_eq!(leaf_keys(&core), (0..100).collect::<Vec<_>>());
        assert_eq!(core.stats().max_level, 1);
    }

    #[test]
    fn depth_limit_is_resource_error() {
        let mut core = core(8, 1);
        core.add_build_chunk(&chunk(vec![7; 50])).unwrap();
        let pid = core
            .roots()
            .iter()
            .copied()
            .find(|id| !core.arena().get(*id).unwrap().build.is_empty())
            .unwrap();
        assert!(core.needs_repartition(pid).unwrap());
        let err = core.repartition(pid).unwrap_err();
        assert_eq!(err.code, StatusCode::ResourceLimitExceeded);
        assert!(err.message.contains("Partitioned input data too many times"));
    }

    #[test]
    fn cancelled_build_fails() {
        let spiller =
            Arc::new(Spiller::new(Arc::new(InMemorySpillStorage::new()), SpillCodec::None).unwrap());
        let cancel = CancelToken::new();
        let params = PartitionedParams {
            partition_count: 2,
            mem_limit: 1024,
            max_partition_depth: 4,
        };
        let mut core =
            PartitionedCore::new("test", params, schema(), "k", None, spiller, cancel.clone())
                .unwrap();
        cancel.cancel();
        let err = core.add_build_chunk(&chunk(vec![1])).unwrap_err();
        assert!(err.is_cancelled());
    }
}
