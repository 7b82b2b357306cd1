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
use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

static CONFIG: OnceLock<GraceflowConfig> = OnceLock::new();

fn default_log_level() -> String {
    "info".to_string()
}

pub fn init_from_path(path: impl AsRef<Path>) -> Result<&'static GraceflowConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    let path = path.as_ref().to_path_buf();
    let cfg = GraceflowConfig::load_from_file(&path)?;
    let _ = CONFIG.set(cfg);
    CONFIG.get().ok_or_else(|| anyhow!("config not initialized"))
}

pub fn init_from_env_or_default() -> Result<&'static GraceflowConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    let path = config_path_from_env_or_default()?;
    let cfg = GraceflowConfig::load_from_file(&path)?;
    let _ = CONFIG.set(cfg);
    CONFIG.get().ok_or_else(|| anyhow!("config not initialized"))
}

pub fn config() -> Result<&'static GraceflowConfig> {
    init_from_env_or_default()
}

fn config_path_from_env_or_default() -> Result<PathBuf> {
    if let Ok(p) = std::env::var("GRACEFLOW_CONFIG")
        && !p.trim().is_empty()
    {
        return Ok(PathBuf::from(p));
    }

    let candidates = [PathBuf::from("graceflow.toml")];
    for p in candidates {
        if p.exists() {
            return Ok(p);
        }
    }

    Err(anyhow!(
        "missing config file: set $GRACEFLOW_CONFIG or create ./graceflow.toml"
    ))
}

#[derive(Clone, Debug, Deserialize)]
pub struct GraceflowConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Optional full tracing EnvFilter expression.
    /// If set, this takes precedence over `log_level`.
    /// Example: "graceflow::runtime=debug,info"
    #[serde(default)]
    pub log_filter: Option<String>,

    #[serde(default)]
    pub runtime: RuntimeConfig,

    #[serde(default)]
    pub spill: SpillStorageConfig,
}

impl GraceflowConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("read config file: {}", path.display()))?;
        let cfg: GraceflowConfig =
            toml::from_str(&s).with_context(|| format!("parse toml: {}", path.display()))?;
        Ok(cfg)
    }

    /// Filter expression handed to the logging subscriber.
    pub fn log_filter_or_level(&self) -> &str {
        self.log_filter.as_deref().unwrap_or(&self.log_level)
    }
}

impl Default for GraceflowConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_filter: None,
            runtime: RuntimeConfig::default(),
            spill: SpillStorageConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct RuntimeConfig {
    /// Soft memory budget of one partitioned join/aggregation instance.
    #[serde(default = "default_mem_limit_bytes")]
    pub mem_limit_bytes: usize,
    /// Initial fan-out of a partitioned operator. Must be a power of two.
    #[serde(default = "default_partition_count")]
    pub partition_count: usize,
    #[serde(default = "default_max_partition_depth")]
    pub max_partition_depth: u32,
    /// Default arrival deadline of a runtime filter, measured from query open.
    #[serde(default = "default_runtime_filter_wait_time_ms")]
    pub runtime_filter_wait_time_ms: u64,
    /// One of OFF, LOCAL or GLOBAL.
    #[serde(default = "default_runtime_filter_mode")]
    pub runtime_filter_mode: String,
    #[serde(default = "default_bloom_filter_size")]
    pub bloom_filter_size: usize,
    #[serde(default = "default_max_filter_error_rate")]
    pub max_filter_error_rate: f64,
}

fn default_mem_limit_bytes() -> usize {
    256 * 1024 * 1024
}

fn default_partition_count() -> usize {
    16
}

fn default_max_partition_depth() -> u32 {
    16
}

fn default_runtime_filter_wait_time_ms() -> u64 {
    1000
}

fn default_runtime_filter_mode() -> String {
    "GLOBAL".to_string()
}

fn default_bloom_filter_size() -> usize {
    1024 * 1024
}

fn default_max_filter_error_rate() -> f64 {
    0.75
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            mem_limit_bytes: default_mem_limit_bytes(),
            partition_count: default_partition_count(),
            max_partition_depth: default_max_partition_depth(),
            runtime_filter_wait_time_ms: default_runtime_filter_wait_time_ms(),
            runtime_filter_mode: default_runtime_filter_mode(),
            bloom_filter_size: default_bloom_filter_size(),
            max_filter_error_rate: default_max_filter_error_rate(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct SpillStorageConfig {
    #[serde(default = "default_spill_enable")]
    pub enable: bool,
    /// Empty means `$TMPDIR/graceflow-spill`.
    #[serde(default)]
    pub local_dirs: Vec<String>,
    /// One of none, lz4 or zstd.
    #[serde(default = "default_spill_ipc_compression")]
    pub ipc_compression: String,
    /// Pending rows of a spilled partition are written once they reach this size.
    #[serde(default = "default_spill_block_size_bytes")]
    pub block_size_bytes: usize,
}

fn default_spill_enable() -> bool {
    true
}

fn default_spill_ipc_compression() -> String {
    "lz4".to_string()
}

fn default_spill_block_size_bytes() -> usize {
    1024 * 1024
}

impl Default for SpillStorageConfig {
    fn default() -> Self {
        Self {
            enable: default_spill_enable(),
            local_dirs: Vec::new(),
            ipc_compression: default_spill_ipc_compression(),
            block_size_bytes: default_spill_block_size_bytes(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::GraceflowConfig;

    #[test]
    fn test_runtime_defaults() {
        let cfg: GraceflowConfig = toml::from_str(
            r#"
[runtime]
"#,
        )
        .expect("parse config");
        assert_eq!(cfg.runtime.partition_count, 16);
        assert_eq!(cfg.runtime.max_partition_depth, 16);
        assert_eq!(cfg.runtime.runtime_filter_wait_time_ms, 1000);
        assert_eq!(cfg.runtime.runtime_filter_mode, "GLOBAL");
        assert_eq!(cfg.runtime.bloom_filter_size, 1_048_576);
        assert!((cfg.runtime.max_filter_error_rate - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_runtime_can_be_overridden() {
        let cfg: GraceflowConfig = toml::from_str(
            r#"
log_level = "debug"

[runtime]
mem_limit_bytes = 4096
partition_count = 4
max_partition_depth = 3
runtime_filter_mode = "LOCAL"
"#,
        )
        .expect("parse config");
        assert_eq!(cfg.log_filter_or_level(), "debug");
        assert_eq!(cfg.runtime.mem_limit_bytes, 4096);
        assert_eq!(cfg.runtime.partition_count, 4);
        assert_eq!(cfg.runtime.max_partition_depth, 3);
        assert_eq!(cfg.runtime.runtime_filter_mode, "LOCAL");
    }

    #[test]
    fn test_log_filter_takes_precedence() {
        let cfg: GraceflowConfig = toml::from_str(
            r#"
log_level = "warn"
log_filter = "graceflow::runtime=debug,info"
"#,
        )
        .expect("parse config");
        assert_eq!(cfg.log_filter_or_level(), "graceflow::runtime=debug,info");
    }

    #[test]
    fn test_spill_section_defaults() {
        let cfg: GraceflowConfig = toml::from_str(
            r#"
[spill]
local_dirs = ["/tmp/a", "/tmp/b"]
"#,
        )
        .expect("parse config");
        assert!(cfg.spill.enable);
        assert_eq!(cfg.spill.local_dirs.len(), 2);
        assert_eq!(cfg.spill.ipc_compression, "lz4");
        assert_eq!(cfg.spill.block_size_bytes, 1024 * 1024);
    }
}
