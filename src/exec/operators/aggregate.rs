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
//! Partitioned hash aggregation with spill-to-disk.
//!
//! Input rows are partitioned by the group key exactly like the join build side. Partitions
//! still in memory are aggregated directly; spilled partitions are aggregated by streaming
//! their blocks into a group table and are repartitioned only when that table outgrows the
//! budget while holding more than one group. A single hot key therefore never recurses.

use std::fmt;
use std::sync::Arc;

use arrow::array::{ArrayRef, Int64Array, RecordBatch, StringArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use hashbrown::HashMap;
use hashbrown::hash_map::Entry;

use crate::common::ids::PartitionId;
use crate::common::status::{Status, StatusResult};
use crate::exec::chunk::{Chunk, KeyColumn, KeyValue};
use crate::exec::operators::partitioned::{PartitionedCore, PartitionedParams, PartitionedStats};
use crate::exec::partition::PartitionState;
use crate::exec::spill::SpillerHandle;
use crate::graceflow_logging::{debug, info};
use crate::runtime::mem_tracker::MemoryBudget;
use crate::runtime::query_context::CancelToken;

/// Fixed per-group overhead used by the group-table size estimate.
const GROUP_ENTRY_BYTES: usize = 48;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AggFunction {
    CountStar,
    Count(String),
    Sum(String),
    Min(String),
    Max(String),
}

impl AggFunction {
    fn input_column(&self) -> Option<&str> {
        match self {
            AggFunction::CountStar => None,
            AggFunction::Count(c) | AggFunction::Sum(c) | AggFunction::Min(c) | AggFunction::Max(c) => {
                Some(c.as_str())
            }
        }
    }

    pub fn output_name(&self) -> String {
        match self {
            AggFunction::CountStar => "count_star".to_string(),
            AggFunction::Count(c) => format!("count_{c}"),
            AggFunction::Sum(c) => format!("sum_{c}"),
            AggFunction::Min(c) => format!("min_{c}"),
            AggFunction::Max(c) => format!("max_{c}"),
        }
    }

    fn init(&self) -> Accumulator {
        match self {
            AggFunction::CountStar | AggFunction::Count(_) => Accumulator::Count(0),
            AggFunction::Sum(_) => Accumulator::Sum(None),
            AggFunction::Min(_) => Accumulator::Min(None),
            AggFunction::Max(_) => Accumulator::Max(None),
        }
    }
}

impl fmt::Display for AggFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AggFunction::CountStar => write!(f, "COUNT(*)"),
            AggFunction::Count(c) => write!(f, "COUNT({c})"),
            AggFunction::Sum(c) => write!(f, "SUM({c})"),
            AggFunction::Min(c) => write!(f, "MIN({c})"),
            AggFunction::Max(c) => write!(f, "MAX({c})"),
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum Accumulator {
    Count(i64),
    Sum(Option<i64>),
    Min(Option<i64>),
    Max(Option<i64>),
}

impl Accumulator {
    /// `value` is `None` for a NULL input; COUNT(*) is fed `Some(0)` for every row.
    fn update(&mut self, value: Option<i64>) -> StatusResult<()> {
        let Some(v) = value else {
            return Ok(());
        };
        match self {
            Accumulator::Count(n) => *n += 1,
            Accumulator::Sum(sum) => {
                let next = sum.unwrap_or(0).checked_add(v).ok_or_else(|| {
                    Status::arithmetic_overflow("SUM overflowed the 64-bit integer range")
                })?;
                *sum = Some(next);
            }
            Accumulator::Min(min) => *min = Some(min.map_or(v, |m| m.min(v))),
            Accumulator::Max(max) => *max = Some(max.map_or(v, |m| m.max(v))),
        }
        Ok(())
    }

    fn value(&self) -> Option<i64> {
        match self {
            Accumulator::Count(n) => Some(*n),
            Accumulator::Sum(v) | Accumulator::Min(v) | Accumulator::Max(v) => *v,
        }
    }
}

struct GroupTable {
    groups: HashMap<Option<KeyValue>, Vec<Accumulator>>,
    estimated_bytes: usize,
}

impl GroupTable {
    fn new() -> Self {
        Self {
            groups: HashMap::new(),
            estimated_bytes: 0,
        }
    }

    fn num_groups(&self) -> usize {
        self.groups.len()
    }

    fn update(&mut self, chunk: &Chunk, key_column: &str, aggs: &[AggFunction]) -> StatusResult<()> {
        if chunk.is_empty() {
            return Ok(());
        }
        let key_array = chunk.column_by_name(key_column)?;
        let keys = KeyColumn::try_new(&key_array)?;
        let mut inputs = Vec::with_capacity(aggs.len());
        for agg in aggs {
            inputs.push(match agg.input_column() {
                Some(column) => Some(chunk.column_by_name(column)?),
                None => None,
            });
        }
        let input_views = inputs
            .iter()
            .map(|a| a.as_ref().map(KeyColumn::try_new).transpose())
            .collect::<StatusResult<Vec<_>>>()?;
        for row in 0..chunk.len() {
            let key = keys.value(row);
            let accs = match self.groups.entry(key) {
                Entry::Occupied(e) => e.into_mut(),
                Entry::Vacant(e) => {
                    self.estimated_bytes +=
                        GROUP_ENTRY_BYTES + aggs.len() * 16 + key_bytes(e.key());
                    e.insert(aggs.iter().map(AggFunction::init).collect())
                }
            };
            for (acc, view) in accs.iter_mut().zip(&input_views) {
                let value = match view {
                    None => Some(0),
                    Some(view) => match view.value(row) {
                        None => None,
                        Some(KeyValue::Int(v)) => Some(v),
                        Some(KeyValue::Utf8(_)) => {
                            return Err(Status::invalid_argument(
                                "aggregate input must be an integer column",
                            ));
                        }
                    },
                };
                acc.update(value)?;
            }
        }
        Ok(())
    }
}

fn key_bytes(key: &Option<KeyValue>) -> usize {
    match key {
        Some(KeyValue::Utf8(s)) => s.len() + 24,
        _ => 8,
    }
}

enum SpilledOutcome {
    Done(Option<Chunk>),
    OverBudget,
}

pub struct PartitionedAggregation {
    core: PartitionedCore,
    aggs: Vec<AggFunction>,
    output_schema: SchemaRef,
    string_key: bool,
    output_groups: usize,
}

impl PartitionedAggregation {
    pub fn new(
        params: PartitionedParams,
        input_schema: SchemaRef,
        group_key: impl Into<String>,
        aggs: Vec<AggFunction>,
        spiller: SpillerHandle,
        cancel: CancelToken,
    ) -> StatusResult<Self> {
        let group_key = group_key.into();
        for agg in &aggs {
            if let Some(column) = agg.input_column() {
                let field = input_schema.field_with_name(column).map_err(|_| {
                    Status::invalid_argument(format!("aggregate input '{}' not in schema", column))
                })?;
                if !is_integer_type(field.data_type()) {
                    return Err(Status::invalid_argument(format!(
                        "{} requires an integer column, '{}' is {}",
                        agg,
                        column,
                        field.data_type()
                    )));
                }
            }
        }
        let key_type = input_schema
            .field_with_name(&group_key)
            .map_err(|_| Status::invalid_argument(format!("group key '{}' not in schema", group_key)))?
            .data_type()
            .clone();
        let string_key = matches!(key_type, DataType::Utf8 | DataType::LargeUtf8);
        let mut fields = vec![Field::new(
            &group_key,
            if string_key { DataType::Utf8 } else { DataType::Int64 },
            true,
        )];
        fields.extend(
            aggs.iter()
                .map(|agg| Field::new(agg.output_name(), DataType::Int64, true)),
        );
        let core = PartitionedCore::new(
            "hash aggregation",
            params,
            input_schema,
            group_key,
            None,
            spiller,
            cancel,
        )?;
        Ok(Self {
            core,
            aggs,
            output_schema: Arc::new(Schema::new(fields)),
            string_key,
            output_groups: 0,
        })
    }

    /// Charges this aggregation's reservations to the query-wide `budget` as well.
    pub fn with_query_budget(mut self, budget: &Arc<MemoryBudget>) -> StatusResult<Self> {
        self.core.charge_to(budget)?;
        Ok(self)
    }

    pub fn output_schema(&self) -> &SchemaRef {
        &self.output_schema
    }

    pub fn add_chunk(&mut self, chunk: &Chunk) -> StatusResult<()> {
        self.core.add_build_chunk(chunk)
    }

    /// Aggregates every partition and returns one chunk per non-empty partition.
    pub fn finish(&mut self) -> StatusResult<Vec<Chunk>> {
        let mut out = Vec::new();
        let mut stack: Vec<PartitionId> = Vec::new();
        for pid in self.core.roots().to_vec() {
            let record = self.core.arena().get(pid)?;
            if record.build.is_empty() {
                self.core.complete(pid)?;
            } else if record.build.is_spilled() {
                stack.push(pid);
            } else {
                let chunk = self.aggregate_in_memory(pid)?;
                out.extend(chunk);
            }
        }

        while let Some(pid) = stack.pop() {
            self.core.check_cancelled()?;
            if self.core.arena().get(pid)?.state != PartitionState::Open {
                continue;
            }
            if !self.core.arena().get(pid)?.build.is_spilled() {
                out.extend(self.aggregate_in_memory(pid)?);
                continue;
            }
            match self.aggregate_spilled(pid)? {
                SpilledOutcome::Done(chunk) => out.extend(chunk),
                SpilledOutcome::OverBudget => {
                    let children = self.core.repartition(pid)?;
                    let (in_memory, spilled): (Vec<_>, Vec<_>) = children
                        .into_iter()
                        .partition(|c| self.core.arena().get(*c).is_ok_and(|r| !r.build.is_spilled()));
                    stack.extend(spilled);
                    stack.extend(in_memory);
                }
            }
        }
        info!(
            "hash aggregation finished: groups={} stats={:?}",
            self.output_groups,
            self.core.stats()
        );
        Ok(out)
    }

    fn aggregate_in_memory(&mut self, pid: PartitionId) -> StatusResult<Option<Chunk>> {
        let mut table = GroupTable::new();
        for chunk in self.core.load_build(pid)? {
            table.update(&chunk, self.core.build_key(), &self.aggs)?;
        }
        let chunk = self.emit(table)?;
        self.core.complete(pid)?;
        Ok(chunk)
    }

    /// Streams a spilled partition into a group table, giving up once the table
    /// outgrows the budget with more than one group.
    fn aggregate_spilled(&mut self, pid: PartitionId) -> StatusResult<SpilledOutcome> {
        let num_blocks = self.core.arena().get(pid)?.build.num_blocks();
        let mut table = GroupTable::new();
        for block in 0..num_blocks {
            self.core.check_cancelled()?;
            for chunk in self.core.restore_build_block(pid, block)? {
                table.update(&chunk, self.core.build_key(), &self.aggs)?;
            }
            if table.num_groups() > 1 && table.estimated_bytes > self.core.budget().available() {
                debug!(
                    "hash aggregation group table over budget: partition={} groups={} bytes={} available={}",
                    pid,
                    table.num_groups(),
                    table.estimated_bytes,
                    self.core.budget().available()
                );
                return Ok(SpilledOutcome::OverBudget);
            }
        }
        let chunk = self.emit(table)?;
        self.core.complete(pid)?;
        Ok(SpilledOutcome::Done(chunk))
    }

    fn emit(&mut self, table: GroupTable) -> StatusResult<Option<Chunk>> {
        if table.num_groups() == 0 {
            return Ok(None);
        }
        self.output_groups += table.num_groups();
        let mut keys = Vec::with_capacity(table.num_groups());
        let mut values: Vec<Vec<Option<i64>>> = vec![Vec::with_capacity(table.num_groups()); self.aggs.len()];
        for (key, accs) in table.groups {
            keys.push(key);
            for (i, acc) in accs.iter().enumerate() {
                values[i].push(acc.value());
            }
        }
        let key_array: ArrayRef = if self.string_key {
            Arc::new(StringArray::from(
                keys.into_iter()
                    .map(|k| match k {
                        Some(KeyValue::Utf8(s)) => Some(s),
                        Some(KeyValue::Int(v)) => Some(v.to_string()),
                        None => None,
                    })
                    .collect::<Vec<_>>(),
            ))
        } else {
            Arc::new(Int64Array::from(
                keys.into_iter()
                    .map(|k| match k {
                        Some(KeyValue::Int(v)) => Some(v),
                        _ => None,
                    })
                    .collect::<Vec<_>>(),
            ))
        };
        let mut columns = vec![key_array];
        for column in values {
            columns.push(Arc::new(Int64Array::from(column)) as ArrayRef);
        }
        let batch = RecordBatch::try_new(self.output_schema.clone(), columns)?;
        Ok(Some(Chunk::new(batch)))
    }

    pub fn stats(&self) -> PartitionedStats {
        self.core.stats()
    }
}

fn is_integer_type(data_type: &DataType) -> bool {
    matches!(
        data_type,
        DataType::Int8 | DataType::Int16 | DataType::Int32 | DataType::Int64 | DataType::Date32
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Array;
    use std::collections::BTreeMap;

    use crate::exec::spill::ipc_serde::SpillCodec;
    use crate::exec::spill::{InMemorySpillStorage, Spiller};

    fn schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new("g", DataType::Utf8, true),
            Field::new("v", DataType::Int32, true),
        ]))
    }

    fn chunk(rows: &[(Option<&str>, Option<i32>)]) -> Chunk {
        let g = StringArray::from(rows.iter().map(|r| r.0).collect::<Vec<_>>());
        let v = arrow::array::Int32Array::from(rows.iter().map(|r| r.1).collect::<Vec<_>>());
        Chunk::new(RecordBatch::try_new(schema(), vec![Arc::new(g), Arc::new(v)]).unwrap())
    }

    fn agg(mem_limit: usize) -> PartitionedAggregation {
        let spiller =
            Arc::new(Spiller::new(Arc::new(InMemorySpillStorage::new()), SpillCodec::None).unwrap());
        PartitionedAggregation::new(
            PartitionedParams {
                partition_count: 2,
                mem_limit,
                max_partition_depth: 2,
            },
            schema(),
            "g",
            vec![
                AggFunction::CountStar,
                AggFunction::Count("v".to_string()),
                AggFunction::Sum("v".to_string()),
                AggFunction::Max("v".to_string()),
            ],
            spiller,
            CancelToken::new(),
        )
        .unwrap()
    }

    fn collect(out: &[Chunk]) -> BTreeMap<Option<String>, Vec<Option<i64>>> {
        let mut map = BTreeMap::new();
        for c in out {
            let g = c.batch.column(0).as_any().downcast_ref::<StringArray>().unwrap();
            for row in 0..c.len() {
                let key = (!g.is_null(row)).then(|| g.value(row).to_string());
                let vals = (1..c.batch.num_columns())
                    .map(|i| {
                        let a = c.batch.column(i).as_any().downcast_ref::<Int64Array>().unwrap();
                        (!a.is_null(row)).then(|| a.value(row))
                    })
                    .collect();
                map.insert(key, vals);
            }
        }
        map
    }

    #[test]
    fn null_key_is_one_group() {
        let mut a = agg(1 << 20);
        a.add_chunk(&chunk(&[(None, Some(1)), (Some("x"), None), (None, Some(4))])).unwrap();
        let groups = collect(&a.finish().unwrap());
        assert_eq!(groups[&None], vec![Some(2), Some(2), Some(5), Some(4)]);
        assert_eq!(groups[&Some("x".to_string())], vec![Some(1), Some(0), None, None]);
    }

    #[test]
    fn single_hot_key_does_not_recurse() {
        let mut a = agg(8);
        for _ in 0..20 {
            a.add_chunk(&chunk(&[(Some("hot"), Some(1)); 10])).unwrap();
        }
        let groups = collect(&a.finish().unwrap());
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[&Some("hot".to_string())][0], Some(200));
        assert_eq!(a.stats().repartitions, 0);
        assert!(a.stats().partitions_spilled > 0);
    }

    #[test]
    fn rejects_non_integer_input() {
        let spiller =
            Arc::new(Spiller::new(Arc::new(InMemorySpillStorage::new()), SpillCodec::None).unwrap());
        let res = PartitionedAggregation::new(
            PartitionedParams {
                partition_count: 2,
                mem_limit: 1024,
                max_partition_depth: 2,
            },
            schema(),
            "g",
            vec![AggFunction::Sum("g".to_string())],
            spiller,
            CancelToken::new(),
        );
        assert!(res.is_err());
    }

    #[test]
    fn sum_overflow_is_arithmetic_error() {
        let input = Arc::new(Schema::new(vec![
            Field::new("g", DataType::Utf8, true),
            Field::new("v", DataType::Int64, true),
        ]));
        let spiller =
            Arc::new(Spiller::new(Arc::new(InMemorySpillStorage::new()), SpillCodec::None).unwrap());
        let mut a = PartitionedAggregation::new(
            PartitionedParams {
                partition_count: 2,
                mem_limit: 1 << 20,
                max_partition_depth: 2,
            },
            input.clone(),
            "g",
            vec![AggFunction::Sum("v".to_string())],
            spiller,
            CancelToken::new(),
        )
        .unwrap();
        let batch = RecordBatch::try_new(
            input,
            vec![
                Arc::new(StringArray::from(vec!["big", "big"])),
                Arc::new(Int64Array::from(vec![i64::MAX, 1])),
            ],
        )
        .unwrap();
        let err = a
            .add_chunk(&Chunk::new(batch))
            .and_then(|_| a.finish())
            .unwrap_err();
        assert_eq!(err.code, crate::common::status::StatusCode::ArithmeticOverflow);
    }
}
