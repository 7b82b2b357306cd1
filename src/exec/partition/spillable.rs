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
use arrow::datatypes::SchemaRef;

use crate::common::status::{Status, StatusResult};
use crate::exec::chunk::Chunk;
use crate::exec::spill::{SpillBlock, SpillerHandle};
use crate::graceflow_logging::{debug, warn};

/// Row storage of one partition, buffered in memory or spilled as blocks.
///
/// Once spilled, appends collect in a pending tail that is written as one block as
/// soon as it reaches the spiller's block size. The tail counts as spilled data: it
/// is not part of `in_memory_bytes` and is read back like the last block. Rows come
/// back to memory only through [`SpillablePartition::unspill`].
pub struct SpillablePartition {
    schema: SchemaRef,
    spiller: SpillerHandle,
    chunks: Vec<Chunk>,
    in_memory_bytes: usize,
    blocks: Vec<SpillBlock>,
    pending: Vec<Chunk>,
    pending_bytes: usize,
    spilled_bytes: usize,
    num_rows: usize,
    spilled: bool,
}

impl SpillablePartition {
    pub fn new(schema: SchemaRef, spiller: SpillerHandle) -> Self {
        Self {
            schema,
            spiller,
            chunks: Vec::new(),
            in_memory_bytes: 0,
            blocks: Vec::new(),
            pending: Vec::new(),
            pending_bytes: 0,
            spilled_bytes: 0,
            num_rows: 0,
            spilled: false,
        }
    }

    /// Partition that sends every append to the backing store.
    pub fn new_spilled(schema: SchemaRef, spiller: SpillerHandle) -> Self {
        let mut partition = Self::new(schema, spiller);
        partition.spilled = true;
        partition
    }

    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    pub fn append(&mut self, chunk: Chunk) -> StatusResult<()> {
        if chunk.is_empty() {
            return Ok(());
        }
        let bytes = chunk.logical_bytes();
        let rows = chunk.len();
        if self.spilled {
            self.pending.push(chunk);
            self.pending_bytes += bytes;
            self.spilled_bytes += bytes;
            if self.pending_bytes >= self.spiller.block_size_bytes() {
                self.flush()?;
            }
        } else {
            self.chunks.push(chunk);
            self.in_memory_bytes += bytes;
        }
        self.num_rows += rows;
        Ok(())
    }

    /// Writes buffered rows to one block and marks the partition spilled.
    /// Returns the in-memory bytes freed. Spilling a spilled partition is a no-op.
    pub fn spill(&mut self) -> StatusResult<usize> {
        if self.spilled {
            return Ok(0);
        }
        let freed = self.in_memory_bytes;
        if !self.chunks.is_empty() {
            let block = self.spiller.spill_chunks(&self.schema, &self.chunks)?;
            debug!(
                "partition spilled: rows={} bytes={} path={}",
                block.num_rows(),
                freed,
                block.path
            );
            self.blocks.push(block);
            self.chunks.clear();
        }
        self.spilled_bytes += freed;
        self.in_memory_bytes = 0;
        self.spilled = true;
        Ok(freed)
    }

    /// Writes the pending tail as one block.
    pub fn flush(&mut self) -> StatusResult<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let block = self.spiller.spill_chunks(&self.schema, &self.pending)?;
        debug!(
            "spilled partition flushed: rows={} bytes={} path={}",
            block.num_rows(),
            self.pending_bytes,
            block.path
        );
        self.blocks.push(block);
        self.pending.clear();
        self.pending_bytes = 0;
        Ok(())
    }

    /// All rows in append order, without changing the partition's state.
    pub fn reload(&self) -> StatusResult<Vec<Chunk>> {
        let mut out =
            Vec::with_capacity(self.blocks.len() + self.pending.len() + self.chunks.len());
        for block in &self.blocks {
            let restored = self.spiller.restore_chunks(&self.schema, block).map_err(|e| {
                Status::io_error(format!("reload spilled partition failed: {}", e.message))
            })?;
            out.extend(restored);
        }
        out.extend(self.pending.iter().cloned());
        out.extend(self.chunks.iter().cloned());
        Ok(out)
    }

    /// Written blocks plus the pending tail, if any.
    pub fn num_blocks(&self) -> usize {
        self.blocks.len() + usize::from(!self.pending.is_empty())
    }

    /// Reads back the `index`-th block. The index after the last written block
    /// yields the pending tail.
    pub fn restore_block(&self, index: usize) -> StatusResult<Vec<Chunk>> {
        if index == self.blocks.len() && !self.pending.is_empty() {
            return Ok(self.pending.clone());
        }
        let block = self.blocks.get(index).ok_or_else(|| {
            Status::internal(format!(
                "spill block index {} out of range ({} blocks)",
                index,
                self.num_blocks()
            ))
        })?;
        self.spiller
            .restore_chunks(&self.schema, block)
            .map_err(|e| Status::io_error(format!("restore spill block failed: {}", e.message)))
    }

    /// Buffered chunks that were never spilled.
    pub fn in_memory_chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    /// Brings a spilled partition back into memory and deletes its blocks.
    /// Returns the bytes now held in memory.
    pub fn unspill(&mut self) -> StatusResult<usize> {
        if !self.spilled {
            return Ok(0);
        }
        let chunks = self.reload()?;
        self.release_blocks();
        self.in_memory_bytes = chunks.iter().map(Chunk::logical_bytes).sum();
        self.chunks = chunks;
        self.spilled_bytes = 0;
        self.spilled = false;
        Ok(self.in_memory_bytes)
    }

    pub fn estimated_size(&self) -> usize {
        self.in_memory_bytes + self.spilled_bytes
    }

    pub fn in_memory_bytes(&self) -> usize {
        self.in_memory_bytes
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn is_spilled(&self) -> bool {
        self.spilled
    }

    pub fn is_empty(&self) -> bool {
        self.num_rows == 0
    }

    /// Drops every row and deletes the backing blocks.
    pub fn release(&mut self) {
        self.chunks.clear();
        self.in_memory_bytes = 0;
        self.release_blocks();
        self.spilled_bytes = 0;
        self.num_rows = 0;
    }

    fn release_blocks(&mut self) {
        self.pending.clear();
        self.pending_bytes = 0;
        for block in self.blocks.drain(..) {
            if let Err(err) = self.spiller.release(&block) {
                warn!("failed to delete spill block {}: {}", block.path, err);
            }
        }
    }
}

impl Drop for SpillablePartition {
    fn drop(&mut self) {
        self.release_blocks();
    }
}
