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
use crate::graceflow_config::config as graceflow_app_config;

pub(crate) fn mem_limit_bytes() -> usize {
    graceflow_app_config()
        .ok()
        .map(|c| c.runtime.mem_limit_bytes)
        .unwrap_or(256 * 1024 * 1024)
}

pub(crate) fn partition_count() -> usize {
    graceflow_app_config()
        .ok()
        .map(|c| c.runtime.partition_count)
        .unwrap_or(16)
}

pub(crate) fn max_partition_depth() -> u32 {
    graceflow_app_config()
        .ok()
        .map(|c| c.runtime.max_partition_depth)
        .unwrap_or(16)
}

pub(crate) fn runtime_filter_wait_time_ms() -> u64 {
    graceflow_app_config()
        .ok()
        .map(|c| c.runtime.runtime_filter_wait_time_ms)
        .unwrap_or(1000)
}

pub(crate) fn runtime_filter_mode() -> String {
    graceflow_app_config()
        .ok()
        .map(|c| c.runtime.runtime_filter_mode.clone())
        .unwrap_or_else(|| "GLOBAL".to_string())
}

pub(crate) fn bloom_filter_size() -> usize {
    graceflow_app_config()
        .ok()
        .map(|c| c.runtime.bloom_filter_size)
        .unwrap_or(1024 * 1024)
}

pub(crate) fn max_filter_error_rate() -> f64 {
    graceflow_app_config()
        .ok()
        .map(|c| c.runtime.max_filter_error_rate)
        .unwrap_or(0.75)
}

pub(crate) fn spill_enable() -> bool {
    graceflow_app_config()
        .ok()
        .map(|c| c.spill.enable)
        .unwrap_or(true)
}

pub(crate) fn spill_local_dirs() -> Vec<String> {
    let dirs = graceflow_app_config()
        .ok()
        .map(|c| c.spill.local_dirs.clone())
        .unwrap_or_default();
    if !dirs.is_empty() {
        return dirs;
    }
    vec![
        std::env::temp_dir()
            .join("graceflow-spill")
            .to_string_lossy()
            .to_string(),
    ]
}

pub(crate) fn spill_ipc_compression() -> String {
    graceflow_app_config()
        .ok()
        .map(|c| c.spill.ipc_compression.clone())
        .unwrap_or_else(|| "lz4".to_string())
}

pub(crate) fn spill_block_size_bytes() -> usize {
    graceflow_app_config()
        .ok()
        .map(|c| c.spill.block_size_bytes)
        .unwrap_or(1024 * 1024)
}
