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
//! Common utilities and helpers for integration tests.
#![allow(dead_code)]
#![allow(unused_imports)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use arrow::array::{Array, Int64Array, RecordBatch, StringArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use tempfile::TempDir;

use graceflow::common::ids::QueryId;
use graceflow::exec::chunk::Chunk;
use graceflow::exec::spill::ipc_serde::SpillCodec;
use graceflow::exec::spill::{InMemorySpillStorage, LocalSpillStorage, Spiller, SpillerHandle};
use graceflow::graceflow_config;
use graceflow::graceflow_logging;

/// Test configuration for integration tests.
pub struct TestConfig {
    /// Temporary directory for test artifacts
    pub temp_dir: TempDir,
    /// Test config path
    pub config_path: PathBuf,
    /// Spill directory inside `temp_dir`
    pub spill_dir: PathBuf,
}

impl TestConfig {
    /// Create a new test configuration with default settings.
    pub fn new() -> anyhow::Result<Self> {
        let temp_dir = tempfile::tempdir()?;
        let config_path = temp_dir.path().join("test_graceflow.toml");
        let spill_dir = temp_dir.path().join("spill");
        std::fs::create_dir_all(&spill_dir)?;

        let config_content = format!(
            r#"
log_level = "debug"

[runtime]
mem_limit_bytes = 1048576
partition_count = 8
max_partition_depth = 4
runtime_filter_wait_time_ms = 200
runtime_filter_mode = "GLOBAL"
bloom_filter_size = 65536

[spill]
local_dirs = ["{}"]
ipc_compression = "none"
"#,
            spill_dir.display()
        );

        std::fs::write(&config_path, config_content)?;

        Ok(Self {
            temp_dir,
            config_path,
            spill_dir,
        })
    }

    /// Initialize logging for tests.
    pub fn init_logging(&self) {
        graceflow_logging::init_with_level("debug");
    }

    /// Load the test configuration.
    pub fn load_config(&self) -> anyhow::Result<&'static graceflow_config::GraceflowConfig> {
        graceflow_config::init_from_path(&self.config_path)
    }

    /// Spiller writing lz4-compressed blocks under `spill_dir`.
    pub fn local_spiller(&self) -> SpillerHandle {
        let storage = LocalSpillStorage::new(vec![self.spill_dir.clone()])
            .expect("create local spill storage");
        Arc::new(Spiller::new(Arc::new(storage), SpillCodec::Lz4).expect("create spiller"))
    }
}

impl Default for TestConfig {
    fn default() -> Self {
        Self::new().expect("Failed to create test config")
    }
}

/// Generate a test query ID.
pub fn test_query_id() -> QueryId {
    QueryId::new(1234567890, 9876543210)
}

/// Generate a unique query ID based on test name.
pub fn unique_query_id(test_name: &str) -> QueryId {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    test_name.hash(&mut hasher);
    let hash = hasher.finish();

    QueryId::new(hash, hash.rotate_left(32))
}

/// Spiller over process memory, plus the storage so tests can inject failures.
pub fn memory_spiller() -> (Arc<InMemorySpillStorage>, SpillerHandle) {
    let storage = Arc::new(InMemorySpillStorage::new());
    let spiller = Arc::new(Spiller::new(storage.clone(), SpillCodec::None).expect("create spiller"));
    (storage, spiller)
}

pub fn key_schema(name: &str) -> SchemaRef {
    Arc::new(Schema::new(vec![Field::new(name, DataType::Int64, true)]))
}

/// Key column plus a string payload, so spilled blocks carry variable-width data.
pub fn keyed_schema(key: &str, payload: &str) -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new(key, DataType::Int64, true),
        Field::new(payload, DataType::Utf8, true),
    ]))
}

pub fn int_chunk(name: &str, keys: &[i64]) -> Chunk {
    let batch = RecordBatch::try_new(key_schema(name), vec![Arc::new(Int64Array::from(keys.to_vec()))])
        .expect("build chunk");
    Chunk::new(batch)
}

pub fn keyed_chunk(key: &str, payload: &str, keys: &[i64]) -> Chunk {
    let payloads: Vec<String> = keys.iter().map(|k| format!("payload-{k}")).collect();
    let batch = RecordBatch::try_new(
        keyed_schema(key, payload),
        vec![
            Arc::new(Int64Array::from(keys.to_vec())),
            Arc::new(StringArray::from(payloads)),
        ],
    )
    .expect("build chunk");
    Chunk::new(batch)
}

/// Values of the Int64 column `name` across `chunks`, sorted.
pub fn sorted_ints(chunks: &[Chunk], name: &str) -> Vec<i64> {
    let mut out = Vec::new();
    for chunk in chunks {
        let column = chunk.column_by_name(name).expect("column");
        let ints = column
            .as_any()
            .downcast_ref::<Int64Array>()
            .expect("int64 column");
        out.extend(ints.iter().flatten());
    }
    out.sort_unstable();
    out
}

/// Wait for a condition to become true, with timeout.
pub fn wait_for<F>(mut condition: F, timeout: Duration) -> bool
where
    F: FnMut() -> bool,
{
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    false
}

/// Run `f` and fail the test if it does not finish within `timeout`.
pub fn run_with_timeout<F, T>(timeout: Duration, f: F) -> T
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    use std::sync::mpsc;

    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let _ = tx.send(f());
    });

    match rx.recv_timeout(timeout) {
        Ok(v) => v,
        Err(_) => panic!("test timed out after {:?}", timeout),
    }
}

/// Assert that a result is Ok and return the value.
#[macro_export]
macro_rules! assert_ok {
    ($result:expr) => {
        match $result {
            Ok(value) => value,
            Err(e) => panic!("Expected Ok, got Err: {:?}", e),
        }
    };
    ($result:expr, $message:expr) => {
        match $result {
            Ok(value) => value,
            Err(e) => panic!("{}: {:?}", $message, e),
        }
    };
}

/// Assert that a result is Err.
#[macro_export]
macro_rules! assert_err {
    ($result:expr) => {
        match $result {
            Ok(value) => panic!("Expected Err, got Ok: {:?}", value),
            Err(e) => e,
        }
    };
}
