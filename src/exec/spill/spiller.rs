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
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use arrow::datatypes::SchemaRef;

use crate::common::config;
use crate::common::status::{Status, StatusResult};
use crate::exec::chunk::Chunk;
use crate::exec::spill::SpillStats;
use crate::exec::spill::block_manager::{BLOCK_HEADER_LEN, BlockHeader};
use crate::exec::spill::ipc_serde::{ChunkStreamCodec, SpillCodec, schema_hash};
use crate::exec::spill::storage::{LocalSpillStorage, SpillStorage};
use crate::graceflow_logging::debug;

/// Block file names carry this counter, so spillers of one process never pick the
/// same name even when they share a directory.
static NEXT_BLOCK_ID: AtomicU64 = AtomicU64::new(0);

const CREATE_BLOCK_ATTEMPTS: usize = 3;

#[derive(Debug, Clone)]
pub struct SpillStorageConfig {
    pub local_dirs: Vec<PathBuf>,
    pub ipc_compression: SpillCodec,
    pub block_size_bytes: usize,
}

impl SpillStorageConfig {
    pub fn from_app_config() -> StatusResult<Self> {
        if !config::spill_enable() {
            return Err(Status::invalid_argument(
                "spill storage is disabled in config",
            ));
        }
        let local_dirs = config::spill_local_dirs()
            .into_iter()
            .map(PathBuf::from)
            .collect::<Vec<_>>();
        let ipc_compression = config::spill_ipc_compression()
            .parse::<SpillCodec>()
            .map_err(Status::invalid_argument)?;
        Ok(Self {
            local_dirs,
            ipc_compression,
            block_size_bytes: config::spill_block_size_bytes(),
        })
    }
}

/// Handle to one block written through a [`Spiller`].
#[derive(Debug, Clone)]
pub struct SpillBlock {
    pub path: String,
    pub header: BlockHeader,
}

impl SpillBlock {
    pub fn num_rows(&self) -> u64 {
        self.header.num_rows
    }

    pub fn stored_bytes(&self) -> u64 {
        BLOCK_HEADER_LEN as u64 + self.header.body_length
    }
}

/// Writes chunks as self-describing blocks to a [`SpillStorage`] and reads them back.
pub struct Spiller {
    storage: Arc<dyn SpillStorage>,
    stream: ChunkStreamCodec,
    pid: u32,
    block_size_bytes: usize,
    stats: Arc<SpillStats>,
}

pub type SpillerHandle = Arc<Spiller>;

impl Spiller {
    pub fn new(storage: Arc<dyn SpillStorage>, codec: SpillCodec) -> StatusResult<Self> {
        Ok(Self {
            storage,
            stream: ChunkStreamCodec::new(codec)?,
            pid: std::process::id(),
            block_size_bytes: config::spill_block_size_bytes(),
            stats: Arc::new(SpillStats::default()),
        })
    }

    pub fn new_with_storage(storage: SpillStorageConfig) -> StatusResult<Self> {
        let local = LocalSpillStorage::new(storage.local_dirs)?;
        Ok(Self::new(Arc::new(local), storage.ipc_compression)?
            .with_block_size_bytes(storage.block_size_bytes))
    }

    /// Spilled partitions buffer appended rows until this many bytes are pending,
    /// then write them as one block.
    pub fn with_block_size_bytes(mut self, bytes: usize) -> Self {
        self.block_size_bytes = bytes.max(1);
        self
    }

    pub fn block_size_bytes(&self) -> usize {
        self.block_size_bytes
    }

    pub fn new_from_config() -> StatusResult<Self> {
        Self::new_with_storage(SpillStorageConfig::from_app_config()?)
    }

    pub fn stats(&self) -> Arc<SpillStats> {
        Arc::clone(&self.stats)
    }

    /// Writes `chunks` as one block. Empty chunks are skipped.
    pub fn spill_chunks(&self, schema: &SchemaRef, chunks: &[Chunk]) -> StatusResult<SpillBlock> {
        let encoded = self.stream.encode(schema, chunks)?;

        let mut header = BlockHeader::new(self.stream.codec(), schema_hash(schema.as_ref()));
        header.num_batches = encoded.num_batches;
        header.num_rows = encoded.num_rows;
        header.body_length = encoded.body.len() as u64;

        let mut bytes = Vec::with_capacity(BLOCK_HEADER_LEN + encoded.body.len());
        bytes.extend_from_slice(&header.to_bytes());
        bytes.extend_from_slice(&encoded.body);

        let path = self.create_block(&bytes)?;

        self.stats.record_spill(header.num_rows, bytes.len() as u64);
        debug!(
            "spill block written: path={} rows={} bytes={} codec={}",
            path,
            header.num_rows,
            bytes.len(),
            header.codec
        );
        Ok(SpillBlock { path, header })
    }

    fn create_block(&self, bytes: &[u8]) -> StatusResult<String> {
        let mut attempts = 0;
        loop {
            let id = NEXT_BLOCK_ID.fetch_add(1, Ordering::AcqRel);
            let path = self
                .storage
                .block_path(&format!("spill_{:x}_{:x}.ipc", self.pid, id));
            if self.storage.create(&path, bytes)? {
                return Ok(path);
            }
            attempts += 1;
            if attempts >= CREATE_BLOCK_ATTEMPTS {
                return Err(Status::io_error(format!(
                    "create spill block failed: {} already exists",
                    path
                )));
            }
            debug!("spill block name taken, retrying: path={}", path);
        }
    }

    pub fn restore_chunks(&self, schema: &SchemaRef, block: &SpillBlock) -> StatusResult<Vec<Chunk>> {
        let bytes = self.storage.read(&block.path)?;
        let header = BlockHeader::from_bytes(&bytes)?;
        if header.schema_hash != schema_hash(schema.as_ref()) {
            return Err(Status::io_error(format!(
                "spill block {} schema mismatch",
                block.path
            )));
        }
        let body = &bytes[BLOCK_HEADER_LEN..];
        if body.len() as u64 != header.body_length {
            return Err(Status::io_error(format!(
                "spill block {} truncated: expected {} body bytes, got {}",
                block.path,
                header.body_length,
                body.len()
            )));
        }
        let chunks = self.stream.decode(schema, body)?;
        let rows: u64 = chunks.iter().map(|c| c.len() as u64).sum();
        if rows != header.num_rows {
            return Err(Status::io_error(format!(
                "spill block {} row count mismatch: header={} decoded={}",
                block.path, header.num_rows, rows
            )));
        }
        self.stats.record_restore(rows, bytes.len() as u64);
        Ok(chunks)
    }

    pub fn release(&self, block: &SpillBlock) -> StatusResult<()> {
        self.storage.delete(&block.path)
    }
}
