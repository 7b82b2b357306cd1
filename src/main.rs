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
use std::env;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use arrow::array::{Int64Array, RecordBatch, StringArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};

use graceflow::common::ids::{ConsumerId, FilterId, ProducerId, QueryId, WorkerId};
use graceflow::exec::chunk::{Chunk, KeyValue};
use graceflow::exec::operators::{
    AggFunction, PartitionedAggregation, PartitionedHashJoin, PartitionedParams,
    RuntimeFilterBuildSpec, ScanConsumer, ScanRange,
};
use graceflow::exec::runtime_filter::{
    RuntimeFilterDesc, RuntimeFilterKind, RuntimeFilterMode, should_disable_filter_by_config,
};
use graceflow::exec::spill::Spiller;
use graceflow::graceflow_config::{self, GraceflowConfig};
use graceflow::graceflow_logging::{self, error, info, info_span, warn};
use graceflow::runtime::query_context::QueryContext;
use graceflow::runtime::runtime_filter_bank::RuntimeFilterBank;
use graceflow::runtime::runtime_filter_transport::LoopbackTransport;
use graceflow::StatusResult;

const BUILD_ROWS: i64 = 200_000;
const HOT_KEY_ROWS: i64 = 50_000;
const PROBE_RANGES: i64 = 8;
const CHUNK_ROWS: i64 = 4096;

struct DemoArgs {
    config_path: Option<String>,
    mem_limit: Option<usize>,
}

fn parse_args() -> DemoArgs {
    let args: Vec<String> = env::args().collect();
    let mut parsed = DemoArgs {
        config_path: None,
        mem_limit: None,
    };
    let mut idx = 1usize;
    while let Some(arg) = args.get(idx) {
        match arg.as_str() {
            "--config" | "-c" => {
                idx += 1;
                parsed.config_path = args.get(idx).cloned();
                if parsed.config_path.is_none() {
                    eprintln!("missing value for --config/-c");
                    process::exit(1);
                }
            }
            "--mem-limit" | "-m" => {
                idx += 1;
                match args.get(idx).and_then(|v| v.parse::<usize>().ok()) {
                    Some(v) => parsed.mem_limit = Some(v),
                    None => {
                        eprintln!("--mem-limit/-m expects a byte count");
                        process::exit(1);
                    }
                }
            }
            "--help" | "-h" => {
                eprintln!("Usage: graceflow [--config <path>] [--mem-limit <bytes>]");
                eprintln!("  Runs a skewed partitioned join that spills under the memory limit");
                eprintln!("  and feeds its runtime filter to the probe-side scan.");
                process::exit(0);
            }
            other => {
                eprintln!("unknown arg: {other} (try --help)");
                process::exit(1);
            }
        }
        idx += 1;
    }
    parsed
}

fn build_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("b_key", DataType::Int64, true),
        Field::new("b_payload", DataType::Utf8, true),
    ]))
}

fn probe_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("p_key", DataType::Int64, true),
        Field::new("p_value", DataType::Int64, true),
    ]))
}

/// Build side: a quarter of the rows share key 0, the rest are distinct even keys.
fn build_chunks(schema: &SchemaRef) -> StatusResult<Vec<Chunk>> {
    let keys: Vec<i64> = (0..BUILD_ROWS)
        .map(|i| if i < HOT_KEY_ROWS { 0 } else { i * 2 })
        .collect();
    let mut chunks = Vec::new();
    for part in keys.chunks(CHUNK_ROWS as usize) {
        let payload: Vec<String> = part.iter().map(|k| format!("row-{k}")).collect();
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(Int64Array::from(part.to_vec())),
                Arc::new(StringArray::from(payload)),
            ],
        )?;
        chunks.push(Chunk::new(batch));
    }
    Ok(chunks)
}

/// Probe side: ranges of consecutive keys with min/max statistics. Ranges above the
/// build key range are pruned by the min/max filter.
fn probe_ranges(schema: &SchemaRef) -> StatusResult<Vec<ScanRange>> {
    let span = BUILD_ROWS * 4 / PROBE_RANGES;
    let mut ranges = Vec::new();
    for r in 0..PROBE_RANGES {
        let lo = r * span + 1;
        let hi = lo + span - 1;
        let keys: Vec<i64> = (lo..=hi).collect();
        let mut chunks = Vec::new();
        for part in keys.chunks(CHUNK_ROWS as usize) {
            let batch = RecordBatch::try_new(
                schema.clone(),
                vec![
                    Arc::new(Int64Array::from(part.to_vec())),
                    Arc::new(Int64Array::from(part.iter().map(|k| k * 10).collect::<Vec<_>>())),
                ],
            )?;
            chunks.push(Chunk::new(batch));
        }
        ranges.push(ScanRange::new(chunks).with_column_stats(
            "p_key",
            KeyValue::Int(lo),
            KeyValue::Int(hi),
        ));
    }
    Ok(ranges)
}

/// Number of distinct build keys, computed with a partitioned aggregation so the
/// planner can decide whether a membership filter is worth building.
fn count_build_keys(
    ctx: &QueryContext,
    spiller: &Arc<Spiller>,
    schema: &SchemaRef,
    chunks: &[Chunk],
    params: PartitionedParams,
) -> StatusResult<usize> {
    let mut agg = PartitionedAggregation::new(
        params,
        schema.clone(),
        "b_key",
        vec![AggFunction::CountStar],
        Arc::clone(spiller),
        ctx.cancel_token(),
    )?
    .with_query_budget(&ctx.mem_budget())?;
    for chunk in chunks {
        agg.add_chunk(chunk)?;
    }
    let groups = agg.finish()?.iter().map(Chunk::len).sum::<usize>();
    info!("build key count: groups={} agg={:?}", groups, agg.stats());
    Ok(groups)
}

fn run(cfg: &GraceflowConfig, args: &DemoArgs) -> StatusResult<()> {
    let mem_limit = args
        .mem_limit
        .unwrap_or_else(|| cfg.runtime.mem_limit_bytes.min(2 * 1024 * 1024));
    let mode = RuntimeFilterMode::from_config();

    let schema = build_schema();
    let build = build_chunks(&schema)?;
    let estimate = build.iter().map(Chunk::logical_bytes).sum::<usize>();
    let params = PartitionedParams::for_build_estimate(estimate, mem_limit);
    info!(
        "partitioned params: estimate_bytes={} mem_limit={} partition_count={} mode={}",
        estimate, params.mem_limit, params.partition_count, mode
    );

    let query_id = QueryId::new(0x6772_6163, 0x0001);
    let _query_span = info_span!("query", query_id = %query_id).entered();
    let ctx = QueryContext::new(query_id, params.mem_limit);
    let spiller = Arc::new(Spiller::new_from_config()?);
    let build_keys = count_build_keys(&ctx, &spiller, &schema, &build, params)?;

    let transport = LoopbackTransport::new();
    let wait = Duration::from_millis(cfg.runtime.runtime_filter_wait_time_ms);
    let range_filter = FilterId(1);
    let key_filter = FilterId(2);
    let descs = vec![
        RuntimeFilterDesc::new(range_filter, RuntimeFilterKind::MinMax, "p_key", "b_key", 1)
            .with_deadline(wait),
        RuntimeFilterDesc::new(key_filter, RuntimeFilterKind::Bloom, "p_key", "b_key", 1)
            .with_deadline(wait),
    ];
    let coordinator = ctx.open_runtime_filters(descs.clone(), mode, transport.clone())?;
    transport.attach_coordinator(&coordinator);
    let bank = RuntimeFilterBank::new(WorkerId(1), query_id, &descs, mode, transport.clone());
    transport.attach_worker(&bank);
    ctx.attach_bank(Arc::clone(&bank));

    let mut specs = vec![RuntimeFilterBuildSpec {
        filter_id: range_filter,
        kind: RuntimeFilterKind::MinMax,
        bloom_filter_bytes: descs[0].bloom_filter_bytes,
    }];
    if mode.allows(&descs[1]) && should_disable_filter_by_config(build_keys) {
        info!("bloom filter disabled: build_keys={}", build_keys);
        coordinator.disable(key_filter)?;
    } else {
        specs.push(RuntimeFilterBuildSpec {
            filter_id: key_filter,
            kind: RuntimeFilterKind::Bloom,
            bloom_filter_bytes: descs[1].bloom_filter_bytes,
        });
    }

    let mut join = PartitionedHashJoin::new(
        params,
        build_schema(),
        "b_key",
        probe_schema(),
        "p_key",
        Arc::clone(&spiller),
        ctx.cancel_token(),
        specs,
    )?
    .with_query_budget(&ctx.mem_budget())?;

    for chunk in &build {
        join.add_build_chunk(chunk)?;
    }
    for (id, partial) in join.finish_build()? {
        bank.publish_partial(id, ProducerId(1), partial)?;
    }

    let mut scan = ScanConsumer::new(
        ConsumerId(1),
        Arc::clone(&bank),
        vec![range_filter, key_filter],
        wait,
        ctx.cancel_token(),
    )?;
    let mut output_rows = 0usize;
    for range in probe_ranges(&probe_schema())? {
        for chunk in scan.scan_range(&range)? {
            output_rows += join.probe(&chunk)?.iter().map(Chunk::len).sum::<usize>();
        }
    }
    output_rows += join.finish_probe()?.iter().map(Chunk::len).sum::<usize>();

    let join_stats = join.stats();
    let scan_stats = scan.stats();
    info!(
        "demo finished: output_rows={} join={:?} scan={:?} filter_state={}",
        output_rows,
        join_stats,
        scan_stats,
        coordinator.state(range_filter)?
    );
    println!("output rows:          {output_rows}");
    println!("partitions created:   {}", join_stats.partitions_created);
    println!("partitions spilled:   {}", join_stats.partitions_spilled);
    println!("repartitions:         {}", join_stats.repartitions);
    println!("max partition level:  {}", join_stats.max_level);
    println!("distinct build keys:  {build_keys}");
    println!("peak memory (bytes):  {}", join_stats.peak_memory);
    println!("query peak (bytes):   {}", ctx.mem_budget().peak());
    println!("spilled rows/bytes:   {}/{}", join_stats.spilled_rows, join_stats.spilled_bytes);
    println!(
        "scan ranges pruned:   {}/{}",
        scan_stats.ranges_pruned, scan_stats.ranges_total
    );
    println!(
        "scan rows filtered:   {}/{}",
        scan_stats.rows_filtered, scan_stats.rows_read
    );
    ctx.close();
    Ok(())
}

fn main() {
    let args = parse_args();
    let loaded = match args.config_path.as_deref() {
        Some(p) => graceflow_config::init_from_path(p).map(Clone::clone),
        None => graceflow_config::init_from_env_or_default().map(Clone::clone),
    };
    let (cfg, load_error) = match loaded {
        Ok(cfg) => (cfg, None),
        Err(e) if args.config_path.is_none() => (GraceflowConfig::default(), Some(e)),
        Err(e) => {
            eprintln!("load graceflow config failed: {e:#}");
            process::exit(1);
        }
    };
    graceflow_logging::init_with_level(cfg.log_filter_or_level());
    if let Some(e) = load_error {
        warn!("no config file loaded, using defaults: {e:#}");
    }

    if let Err(e) = run(&cfg, &args) {
        error!("demo failed: {e}");
        eprintln!("graceflow: {e}");
        process::exit(1);
    }
}
