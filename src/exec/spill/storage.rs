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
//! Backing stores for spilled partition blocks.
//!
//! The execution core only needs `create`, `read` and `delete` keyed by path. Where
//! the bytes live (local disk, a distributed file system) is the store's concern.
//! Blocks are never overwritten: `create` refuses a path that already exists, so
//! several spillers sharing one directory cannot clobber each other's blocks.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::common::status::{Status, StatusResult};
use crate::exec::spill::dir_manager::DirManager;

pub trait SpillStorage: Send + Sync {
    /// Returns the path a new block named `file_name` should be written to.
    fn block_path(&self, file_name: &str) -> String;

    /// Writes a new block at `path`. Returns `Ok(false)` without writing anything
    /// when a block already exists there.
    fn create(&self, path: &str, bytes: &[u8]) -> StatusResult<bool>;

    fn read(&self, path: &str) -> StatusResult<Vec<u8>>;

    fn delete(&self, path: &str) -> StatusResult<()>;
}

/// Files under the configured local spill directories.
#[derive(Debug)]
pub struct LocalSpillStorage {
    dir_manager: DirManager,
}

impl LocalSpillStorage {
    pub fn new(dirs: Vec<PathBuf>) -> StatusResult<Self> {
        Ok(Self {
            dir_manager: DirManager::new(dirs)?,
        })
    }
}

impl SpillStorage for LocalSpillStorage {
    fn block_path(&self, file_name: &str) -> String {
        self.dir_manager
            .next_dir()
            .join(file_name)
            .to_string_lossy()
            .to_string()
    }

    fn create(&self, path: &str, bytes: &[u8]) -> StatusResult<bool> {
        let mut file = match OpenOptions::new().create_new(true).write(true).open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => {
                return Err(Status::io_error(format!(
                    "create spill block {} failed: {e}",
                    path
                )));
            }
        };
        if let Err(e) = file.write_all(bytes).and_then(|_| file.flush()) {
            drop(file);
            let _ = fs::remove_file(path);
            return Err(Status::io_error(format!(
                "write spill block {} failed: {e}",
                path
            )));
        }
        Ok(true)
    }

    fn read(&self, path: &str) -> StatusResult<Vec<u8>> {
        fs::read(path)
            .map_err(|e| Status::io_error(format!("read spill block {} failed: {e}", path)))
    }

    fn delete(&self, path: &str) -> StatusResult<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Status::io_error(format!(
                "delete spill block {} failed: {e}",
                path
            ))),
        }
    }
}

/// Process-local store keeping blocks in a map.
///
/// Reads and writes can be switched to fail, which lets callers exercise the
/// `IO_ERROR` paths without touching a real disk.
#[derive(Debug, Default)]
pub struct InMemorySpillStorage {
    blocks: Mutex<HashMap<String, Vec<u8>>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl InMemorySpillStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::Release);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Release);
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.lock().map(|b| b.len()).unwrap_or(0)
    }

    fn lock(&self) -> StatusResult<std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>>> {
        self.blocks
            .lock()
            .map_err(|_| Status::internal("in-memory spill storage lock poisoned"))
    }
}

impl SpillStorage for InMemorySpillStorage {
    fn block_path(&self, file_name: &str) -> String {
        format!("mem://{}", file_name)
    }

    fn create(&self, path: &str, bytes: &[u8]) -> StatusResult<bool> {
        if self.fail_writes.load(Ordering::Acquire) {
            return Err(Status::io_error(format!(
                "write spill block {} failed: storage unavailable",
                path
            )));
        }
        match self.lock()?.entry(path.to_string()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(bytes.to_vec());
                Ok(true)
            }
        }
    }

    fn read(&self, path: &str) -> StatusResult<Vec<u8>> {
        if self.fail_reads.load(Ordering::Acquire) {
            return Err(Status::io_error(format!(
                "read spill block {} failed: storage unavailable",
                path
            )));
        }
        self.lock()?
            .get(path)
            .cloned()
            .ok_or_else(|| Status::io_error(format!("spill block {} not found", path)))
    }

    fn delete(&self, path: &str) -> StatusResult<()> {
        self.lock()?.remove(path);
        Ok(())
    }
}
