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

use crate::common::ids::PartitionId;
use crate::common::status::{Status, StatusResult};
use crate::exec::partition::spillable::SpillablePartition;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PartitionState {
    /// Accepting rows.
    Open,
    /// Being reloaded or processed; never chosen as a spill victim.
    Pinned,
    /// Rows were moved into children at the next level.
    Repartitioned,
    /// Output produced and storage released.
    Completed,
}

impl fmt::Display for PartitionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PartitionState::Open => "OPEN",
            PartitionState::Pinned => "PINNED",
            PartitionState::Repartitioned => "REPARTITIONED",
            PartitionState::Completed => "COMPLETED",
        };
        f.write_str(s)
    }
}

pub struct PartitionRecord {
    pub id: PartitionId,
    pub parent: Option<PartitionId>,
    pub level: u32,
    /// Bucket inside the parent's fan-out (or the root fan-out at level 0).
    pub bucket: usize,
    pub children: Vec<PartitionId>,
    pub build: SpillablePartition,
    pub probe: Option<SpillablePartition>,
    pub state: PartitionState,
}

impl PartitionRecord {
    pub fn is_leaf(&self) -> bool {
        self.state != PartitionState::Repartitioned
    }
}

/// Every partition created by one operator, indexed by id. Records are never removed,
/// so ids stay valid for the operator's lifetime.
#[derive(Default)]
pub struct PartitionArena {
    records: Vec<PartitionRecord>,
}

impl PartitionArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(
        &mut self,
        parent: Option<PartitionId>,
        level: u32,
        bucket: usize,
        build: SpillablePartition,
        probe: Option<SpillablePartition>,
    ) -> StatusResult<PartitionId> {
        let id = PartitionId(u32::try_from(self.records.len()).map_err(|_| {
            Status::resource_limit_exceeded("too many partitions in one operator")
        })?);
        if let Some(parent_id) = parent {
            let parent_record = self.get_mut(parent_id)?;
            if parent_record.level + 1 != level {
                return Err(Status::internal(format!(
                    "partition {} at level {} cannot have a child at level {}",
                    parent_id, parent_record.level, level
                )));
            }
            parent_record.children.push(id);
        }
        self.records.push(PartitionRecord {
            id,
            parent,
            level,
            bucket,
            children: Vec::new(),
            build,
            probe,
            state: PartitionState::Open,
        });
        Ok(id)
    }

    pub fn get(&self, id: PartitionId) -> StatusResult<&PartitionRecord> {
        self.records
            .get(id.0 as usize)
            .ok_or_else(|| Status::internal(format!("unknown partition {}", id)))
    }

    pub fn get_mut(&mut self, id: PartitionId) -> StatusResult<&mut PartitionRecord> {
        self.records
            .get_mut(id.0 as usize)
            .ok_or_else(|| Status::internal(format!("unknown partition {}", id)))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PartitionRecord> {
        self.records.iter()
    }

    /// Partitions that were not split further.
    pub fn leaves(&self) -> impl Iterator<Item = &PartitionRecord> {
        self.records.iter().filter(|r| r.is_leaf())
    }

    /// Parent chain of `id`, nearest first.
    pub fn ancestors(&self, id: PartitionId) -> StatusResult<Vec<PartitionId>> {
        let mut out = Vec::new();
        let mut cur = self.get(id)?.parent;
        while let Some(pid) = cur {
            out.push(pid);
            cur = self.get(pid)?.parent;
        }
        Ok(out)
    }

    pub fn max_level(&self) -> u32 {
        self.records.iter().map(|r| r.level).max().unwrap_or(0)
    }
}
