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
use crate::common::status::{Status, StatusResult};
use crate::exec::spill::ipc_serde::SpillCodec;

const BLOCK_MAGIC: [u8; 4] = *b"GFSP";
const BLOCK_VERSION: u16 = 1;
pub const BLOCK_HEADER_LEN: usize = 40;

/// Fixed header in front of every spilled block.
///
/// Layout (little endian):
/// `magic[4] version:u16 header_len:u16 codec:u8 reserved:u8 reserved:u16
///  num_batches:u32 num_rows:u64 body_length:u64 schema_hash:u64`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub codec: SpillCodec,
    pub num_batches: u32,
    pub num_rows: u64,
    pub body_length: u64,
    pub schema_hash: u64,
}

impl BlockHeader {
    pub fn new(codec: SpillCodec, schema_hash: u64) -> Self {
        Self {
            codec,
            num_batches: 0,
            num_rows: 0,
            body_length: 0,
            schema_hash,
        }
    }

    pub fn to_bytes(&self) -> [u8; BLOCK_HEADER_LEN] {
        let mut buf = [0u8; BLOCK_HEADER_LEN];
        buf[..4].copy_from_slice(&BLOCK_MAGIC);
        buf[4..6].copy_from_slice(&BLOCK_VERSION.to_le_bytes());
        buf[6..8].copy_from_slice(&(BLOCK_HEADER_LEN as u16).to_le_bytes());
        buf[8] = self.codec.as_u8();
        buf[9] = 0;
        buf[10..12].copy_from_slice(&0u16.to_le_bytes());
        buf[12..16].copy_from_slice(&self.num_batches.to_le_bytes());
        buf[16..24].copy_from_slice(&self.num_rows.to_le_bytes());
        buf[24..32].copy_from_slice(&self.body_length.to_le_bytes());
        buf[32..40].copy_from_slice(&self.schema_hash.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> StatusResult<Self> {
        if buf.len() < BLOCK_HEADER_LEN {
            return Err(Status::io_error("spill block header is too small"));
        }
        if buf[..4] != BLOCK_MAGIC {
            return Err(Status::io_error("spill block header magic mismatch"));
        }
        let version = u16::from_le_bytes([buf[4], buf[5]]);
        if version != BLOCK_VERSION {
            return Err(Status::io_error(format!(
                "unsupported spill block version: {version}"
            )));
        }
        let header_len = u16::from_le_bytes([buf[6], buf[7]]);
        if header_len as usize != BLOCK_HEADER_LEN {
            return Err(Status::io_error(format!(
                "unsupported spill block header length: {header_len}"
            )));
        }
        let codec = SpillCodec::try_from(buf[8]).map_err(Status::io_error)?;
        if buf[9] != 0 || buf[10] != 0 || buf[11] != 0 {
            return Err(Status::io_error(
                "spill block header reserved field must be 0",
            ));
        }
        Ok(Self {
            codec,
            num_batches: read_u32(buf, 12),
            num_rows: read_u64(buf, 16),
            body_length: read_u64(buf, 24),
            schema_hash: read_u64(buf, 32),
        })
    }
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(raw)
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_rejects_bad_magic_and_short_input() {
        let header = BlockHeader {
            codec: SpillCodec::Lz4,
            num_batches: 2,
            num_rows: 10,
            body_length: 512,
            schema_hash: 99,
        };
        let mut bytes = header.to_bytes();
        assert_eq!(BlockHeader::from_bytes(&bytes).unwrap(), header);

        assert!(BlockHeader::from_bytes(&bytes[..10]).is_err());
        bytes[0] = b'X';
        assert!(BlockHeader::from_bytes(&bytes).is_err());
    }
}
