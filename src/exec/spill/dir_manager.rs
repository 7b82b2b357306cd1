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
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::common::status::{Status, StatusResult};

/// Round-robin over the configured local spill directories.
#[derive(Debug)]
pub struct DirManager {
    dirs: Vec<PathBuf>,
    next_dir: AtomicUsize,
}

impl DirManager {
    pub fn new(dirs: Vec<PathBuf>) -> StatusResult<Self> {
        if dirs.is_empty() {
            return Err(Status::invalid_argument("spill.local_dirs is empty"));
        }
        for dir in &dirs {
            ensure_dir(dir)?;
        }
        Ok(Self {
            dirs,
            next_dir: AtomicUsize::new(0),
        })
    }

    pub fn next_dir(&self) -> PathBuf {
        let idx = self.next_dir.fetch_add(1, Ordering::AcqRel);
        let pos = idx % self.dirs.len();
        self.dirs[pos].clone()
    }
}

fn ensure_dir(path: &Path) -> StatusResult<()> {
    if path.as_os_str().is_empty() {
        return Err(Status::invalid_argument(
            "spill.local_dirs contains empty path",
        ));
    }
    std::fs::create_dir_all(path).map_err(|e| {
        Status::io_error(format!(
            "create spill directory {} failed: {e}",
            path.display()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn next_dir_rotates() {
        let a = tempdir().unwrap();
        let b = tempdir().unwrap();
        let mgr = DirManager::new(vec![a.path().to_path_buf(), b.path().to_path_buf()]).unwrap();
        assert_eq!(mgr.next_dir(), a.path());
        assert_eq!(mgr.next_dir(), b.path());
        assert_eq!(mgr.next_dir(), a.path());
    }

    #[test]
    fn empty_dirs_rejected() {
        assert!(DirManager::new(Vec::new()).is_err());
    }
}
