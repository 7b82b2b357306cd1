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
//! Spill-to-disk plumbing for partitioned operators.
//!
//! - `storage`: the read/write/delete capability blocks are stored through.
//! - `block_manager`: fixed block header.
//! - `ipc_serde`: Arrow IPC stream encoding with optional compression.
//! - `spiller`: writes chunks as blocks and restores them.

pub mod block_manager;
pub mod dir_manager;
pub mod ipc_serde;
pub mod spiller;
pub mod storage;

use std::sync::atomic::{AtomicU64, Ordering};

pub use spiller::{SpillBlock, Spiller, SpillerHandle};
pub use storage::{InMemorySpillStorage, LocalSpillStorage, SpillStorage};

/// Counters shared by everything spilling through one [`Spiller`].
#[derive(Debug, Default)]
pub struct SpillStats {
    spill_rows: AtomicU64,
    spill_bytes: AtomicU64,
    spill_blocks: AtomicU64,
    restore_rows: AtomicU64,
    restore_bytes: AtomicU64,
}

impl SpillStats {
    pub(crate) fn record_spill(&self, rows: u64, bytes: u64) {
        self.spill_rows.fetch_add(rows, Ordering::Relaxed);
        self.spill_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.spill_blocks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_restore(&self, rows: u64, bytes: u64) {
        self.restore_rows.fetch_add(rows, Ordering::Relaxed);
        self.restore_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn spill_rows(&self) -> u64 {
        self.spill_rows.load(Ordering::Relaxed)
    }

    pub fn spill_bytes(&self) -> u64 {
        self.spill_bytes.load(Ordering::Relaxed)
    }

    pub fn spill_blocks(&self) -> u64 {
        self.spill_blocks.load(Ordering::Relaxed)
    }

    pub fn restore_rows(&self) -> u64 {
        self.restore_rows.load(Ordering::Relaxed)
    }

    pub fn restore_bytes(&self) -> u64 {
        self.restore_bytes.load(Ordering::Relaxed)
    }
}
