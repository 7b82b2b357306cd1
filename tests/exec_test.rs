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
//! Integration tests for the partitioned join and aggregation.

use std::collections::BTreeMap;
use std::sync::Arc;

use arrow::array::{Array, Int64Array, RecordBatch};
use arrow::datatypes::{DataType, Field, Schema};

use graceflow::common::ids::FilterId;
use graceflow::common::status::StatusCode;
use graceflow::exec::chunk::{Chunk, KeyValue};
use graceflow::exec::operators::{
    AggFunction, PartitionedAggregation, PartitionedHashJoin, PartitionedParams,
    RuntimeFilterBuildSpec,
};
use graceflow::exec::runtime_filter::RuntimeFilterKind;
use graceflow::exec::spill::SpillerHandle;
use graceflow::runtime::query_context::{CancelToken, QueryContext};

use crate::common::{
    TestConfig, int_chunk, key_schema, memory_spiller, sorted_ints, unique_query_id,
};

mod common;

fn params(partition_count: usize, mem_limit: usize, max_partition_depth: u32) -> PartitionedParams {
    PartitionedParams {
        partition_count,
        mem_limit,
        max_partition_depth,
    }
}

fn new_join(params: PartitionedParams, spiller: SpillerHandle) -> PartitionedHashJoin {
    assert_ok!(PartitionedHashJoin::new(
        params,
        key_schema("b"),
        "b",
        key_schema("p"),
        "p",
        spiller,
        CancelToken::new(),
        vec![RuntimeFilterBuildSpec {
            filter_id: FilterId(1),
            kind: RuntimeFilterKind::Bloom,
            bloom_filter_bytes: 4096,
        }],
    ))
}

/// Feeds the build rows one per chunk so memory pressure builds up row by row.
fn run_join(join: &mut PartitionedHashJoin, build: &[i64], probe: &[i64]) -> Vec<Chunk> {
    for key in build {
        assert_ok!(join.add_build_chunk(&int_chunk("b", &[*key])));
    }
    assert_ok!(join.finish_build());
    let mut out = assert_ok!(join.probe(&int_chunk("p", probe)));
    out.extend(assert_ok!(join.finish_probe()));
    out
}

fn matches_per_key(out: &[Chunk]) -> BTreeMap<i64, usize> {
    let mut counts = BTreeMap::new();
    for key in sorted_ints(out, "p") {
        *counts.entry(key).or_insert(0) += 1;
    }
    counts
}

#[test]
fn test_join_counts_without_spill() {
    let (_, spiller) = memory_spiller();
    let mut join = new_join(params(4, 1 << 20, 4), spiller);
    let out = run_join(&mut join, &[1, 1, 1, 2, 3], &[1, 2, 4]);
    let counts = matches_per_key(&out);
    assert_eq!(counts.get(&1), Some(&3));
    assert_eq!(counts.get(&2), Some(&1));
    assert_eq!(counts.get(&4), None);
    assert_eq!(join.stats().partitions_spilled, 0);
    assert_eq!(join.output_rows(), 4);
}

#[test]
fn test_join_counts_with_spill() {
    // 24 bytes fit the three rows of key 1; the fourth row forces them out.
    let (storage, spiller) = memory_spiller();
    let mut join = new_join(params(4, 24, 4), spiller);
    let out = run_join(&mut join, &[1, 1, 1, 2, 3], &[1, 2, 4]);
    let counts = matches_per_key(&out);
    assert_eq!(counts.get(&1), Some(&3));
    assert_eq!(counts.get(&2), Some(&1));
    assert_eq!(counts.get(&4), None);
    assert!(join.stats().partitions_spilled >= 1);
    assert!(join.stats().spilled_rows >= 3);
    // Every block is deleted once its partition completes.
    assert_eq!(storage.num_blocks(), 0);
}

#[test]
fn test_join_output_columns() {
    let (_, spiller) = memory_spiller();
    let mut join = new_join(params(4, 1 << 20, 4), spiller);
    let out = run_join(&mut join, &[5, 6], &[6, 6, 7]);
    let schema = join.output_schema();
    assert_eq!(schema.field(0).name(), "p");
    assert_eq!(schema.field(1).name(), "b");
    assert_eq!(sorted_ints(&out, "b"), vec![6, 6]);
}

#[test]
fn test_join_with_local_spill_storage() {
    let cfg = TestConfig::default();
    let spiller = cfg.local_spiller();
    let mut join = new_join(params(8, 256, 8), spiller);
    let build: Vec<i64> = (0..500).collect();
    let probe: Vec<i64> = (250..750).collect();
    let out = run_join(&mut join, &build, &probe);
    assert_eq!(sorted_ints(&out, "p"), (250..500).collect::<Vec<_>>());
    assert!(join.stats().partitions_spilled > 0);
    assert!(join.stats().repartitions > 0);
    let leftover = std::fs::read_dir(&cfg.spill_dir).map(|d| d.count()).unwrap_or(0);
    assert_eq!(leftover, 0);
}

#[test]
fn test_single_key_fails_at_max_depth() {
    let (_, spiller) = memory_spiller();
    let mut join = new_join(params(4, 64, 3), spiller);
    assert_ok!(join.add_build_chunk(&int_chunk("b", &[7; 100])));
    assert_ok!(join.finish_build());
    assert_ok!(join.probe(&int_chunk("p", &[7])));
    let err = assert_err!(join.finish_probe());
    assert_eq!(err.code, StatusCode::ResourceLimitExceeded);
    assert!(err.message.contains("Partitioned input data too many times"));
    assert!(err.message.contains("max_partition_depth=3"));
    let stats = join.stats();
    assert_eq!(stats.max_level, 2);
    assert_eq!(stats.repartitions, 2);
}

#[test]
fn test_reload_failure_is_io_error() {
    let (storage, spiller) = memory_spiller();
    let mut join = new_join(params(4, 24, 4), spiller);
    for key in [1, 1, 1, 2, 3] {
        assert_ok!(join.add_build_chunk(&int_chunk("b", &[key])));
    }
    assert_ok!(join.finish_build());
    assert_ok!(join.probe(&int_chunk("p", &[1, 2, 4])));
    storage.set_fail_reads(true);
    let err = assert_err!(join.finish_probe());
    assert_eq!(err.code, StatusCode::IoError);
}

#[test]
fn test_write_failure_keeps_spilled_partitions_readable() {
    // Key 1 fills the 24-byte budget and is spilled once key 2 arrives; keys 2, 3
    // and 5 then fill the budget again from memory.
    let (storage, spiller) = memory_spiller();
    let mut join = new_join(params(4, 24, 4), spiller);
    for key in [1, 1, 1, 2, 3, 5] {
        assert_ok!(join.add_build_chunk(&int_chunk("b", &[key])));
    }
    assert_eq!(join.stats().partitions_spilled, 1);
    let written = storage.num_blocks();
    assert!(written >= 1);

    // The next row needs a victim spill, and the store refuses it.
    storage.set_fail_writes(true);
    let err = assert_err!(join.add_build_chunk(&int_chunk("b", &[6])));
    assert_eq!(err.code, StatusCode::IoError);
    assert_eq!(storage.num_blocks(), written);
    assert_eq!(join.stats().partitions_spilled, 1);

    storage.set_fail_writes(false);
    assert_ok!(join.finish_build());
    let mut out = assert_ok!(join.probe(&int_chunk("p", &[1, 2, 3, 5])));
    out.extend(assert_ok!(join.finish_probe()));
    let counts = matches_per_key(&out);
    assert_eq!(counts.get(&1), Some(&3));
    assert_eq!(counts.get(&2), Some(&1));
    assert_eq!(counts.get(&3), Some(&1));
    assert_eq!(counts.get(&5), Some(&1));
    assert_eq!(counts.get(&6), None);
    assert_eq!(storage.num_blocks(), 0);
}

#[test]
fn test_join_charges_query_budget() {
    let (_, spiller) = memory_spiller();
    let ctx = QueryContext::new(unique_query_id("join_query_budget"), 24);
    let join = new_join(params(4, 24, 4), spiller);
    let mut join = assert_ok!(join.with_query_budget(&ctx.mem_budget()));
    let out = run_join(&mut join, &[1, 1, 1, 2, 3], &[1, 2, 4]);
    assert_eq!(matches_per_key(&out).get(&1), Some(&3));
    assert!(ctx.mem_budget().peak() >= 24);
    assert_eq!(ctx.mem_budget().used(), 0);
    assert_eq!(ctx.mem_budget().peak(), join.stats().peak_memory);
}

#[test]
fn test_budget_sized_join_uses_more_partitions() {
    let build: Vec<i64> = (0..64).collect();
    let estimate = build.len() * 8;
    let roomy = PartitionedParams::for_build_estimate(estimate, estimate);
    let tight = PartitionedParams::for_build_estimate(estimate, 64);
    assert!(tight.partition_count > roomy.partition_count);
    assert_eq!(tight.partition_count, 8);

    let (storage, spiller) = memory_spiller();
    let mut join = new_join(tight, spiller);
    let out = run_join(&mut join, &build, &[0, 31, 63, 64]);
    assert_eq!(sorted_ints(&out, "p"), vec![0, 31, 63]);
    assert!(join.stats().partitions_created >= 8);
    assert_eq!(storage.num_blocks(), 0);
}

#[test]
fn test_cancelled_join_stops() {
    let (_, spiller) = memory_spiller();
    let cancel = CancelToken::new();
    let mut join = assert_ok!(PartitionedHashJoin::new(
        params(4, 1 << 20, 4),
        key_schema("b"),
        "b",
        key_schema("p"),
        "p",
        spiller,
        cancel.clone(),
        Vec::new(),
    ));
    assert_ok!(join.add_build_chunk(&int_chunk("b", &[1, 2])));
    cancel.cancel();
    let err = assert_err!(join.finish_build());
    assert_eq!(err.code, StatusCode::Cancelled);
}

#[test]
fn test_join_partial_filter_covers_build_keys() {
    let (_, spiller) = memory_spiller();
    let mut join = new_join(params(4, 32, 6), spiller);
    for key in 0..100 {
        assert_ok!(join.add_build_chunk(&int_chunk("b", &[key * 3])));
    }
    let filters = assert_ok!(join.finish_build());
    assert_eq!(filters.len(), 1);
    let (id, filter) = &filters[0];
    assert_eq!(*id, FilterId(1));
    for key in 0..100 {
        assert!(filter.test_key(&KeyValue::Int(key * 3)));
    }
}

fn agg_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("k", DataType::Int64, true),
        Field::new("v", DataType::Int64, true),
    ]))
}

fn agg_chunk(rows: &[(i64, i64)]) -> Chunk {
    let k = Int64Array::from(rows.iter().map(|r| r.0).collect::<Vec<_>>());
    let v = Int64Array::from(rows.iter().map(|r| r.1).collect::<Vec<_>>());
    Chunk::new(RecordBatch::try_new(agg_schema(), vec![Arc::new(k), Arc::new(v)]).unwrap())
}

#[test]
fn test_aggregation_under_spill_matches_expected() {
    let (_, spiller) = memory_spiller();
    let mut agg = assert_ok!(PartitionedAggregation::new(
        params(4, 1024, 6),
        agg_schema(),
        "k",
        vec![
            AggFunction::CountStar,
            AggFunction::Sum("v".to_string()),
            AggFunction::Min("v".to_string()),
        ],
        spiller,
        CancelToken::new(),
    ));
    let rows: Vec<(i64, i64)> = (0..1000).map(|i| (i % 50, i)).collect();
    for part in rows.chunks(37) {
        assert_ok!(agg.add_chunk(&agg_chunk(part)));
    }
    let out = assert_ok!(agg.finish());

    let mut expected: BTreeMap<i64, (i64, i64, i64)> = BTreeMap::new();
    for (k, v) in &rows {
        let e = expected.entry(*k).or_insert((0, 0, i64::MAX));
        e.0 += 1;
        e.1 += v;
        e.2 = e.2.min(*v);
    }

    let mut actual: BTreeMap<i64, (i64, i64, i64)> = BTreeMap::new();
    for chunk in &out {
        let col = |i: usize| {
            chunk
                .batch
                .column(i)
                .as_any()
                .downcast_ref::<Int64Array>()
                .unwrap()
                .clone()
        };
        let (k, c, s, m) = (col(0), col(1), col(2), col(3));
        for row in 0..chunk.len() {
            assert!(!k.is_null(row));
            actual.insert(k.value(row), (c.value(row), s.value(row), m.value(row)));
        }
    }
    assert_eq!(actual, expected);
    assert!(agg.stats().partitions_spilled > 0);
}
