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
//! Binary encoding of runtime filters for delivery between workers.
//!
//! Layout (little endian): `version:u8 kind:u8 payload`. The membership payload is
//! the block directory, the range payload a presence flag followed by two key values.

use crate::common::status::{Status, StatusResult};
use crate::exec::chunk::KeyValue;

use super::bloom::BloomFilter;
use super::filter::RuntimeFilter;
use super::min_max::MinMaxFilter;

const CODEC_VERSION: u8 = 1;
const KIND_MEMBERSHIP: u8 = 0;
const KIND_RANGE: u8 = 1;
const KEY_TAG_INT: u8 = 0;
const KEY_TAG_UTF8: u8 = 1;

pub fn encode_runtime_filter(filter: &RuntimeFilter) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.push(CODEC_VERSION);
    match filter {
        RuntimeFilter::Membership(bloom) => {
            buf.push(KIND_MEMBERSHIP);
            bloom.serialize(&mut buf);
        }
        RuntimeFilter::Range(range) => {
            buf.push(KIND_RANGE);
            match range.bounds() {
                Some((min, max)) => {
                    buf.push(1);
                    write_key(&mut buf, min);
                    write_key(&mut buf, max);
                }
                None => buf.push(0),
            }
        }
    }
    buf
}

pub fn decode_runtime_filter(data: &[u8]) -> StatusResult<RuntimeFilter> {
    let mut offset = 0usize;
    let version = read_u8(data, &mut offset)?;
    if version != CODEC_VERSION {
        return Err(Status::invalid_argument(format!(
            "unsupported runtime filter codec version: {version}"
        )));
    }
    let filter = match read_u8(data, &mut offset)? {
        KIND_MEMBERSHIP => RuntimeFilter::Membership(BloomFilter::deserialize(data, &mut offset)?),
        KIND_RANGE => {
            let range = match read_u8(data, &mut offset)? {
                0 => MinMaxFilter::empty(),
                1 => {
                    let min = read_key(data, &mut offset)?;
                    let max = read_key(data, &mut offset)?;
                    MinMaxFilter::from_bounds(min, max)?
                }
                other => {
                    return Err(Status::invalid_argument(format!(
                        "invalid runtime range filter presence flag: {other}"
                    )));
                }
            };
            RuntimeFilter::Range(range)
        }
        other => {
            return Err(Status::invalid_argument(format!(
                "unknown runtime filter kind: {other}"
            )));
        }
    };
    if offset != data.len() {
        return Err(Status::invalid_argument(format!(
            "runtime filter payload has {} trailing bytes",
            data.len() - offset
        )));
    }
    Ok(filter)
}

fn write_key(buf: &mut Vec<u8>, key: &KeyValue) {
    match key {
        KeyValue::Int(v) => {
            buf.push(KEY_TAG_INT);
            buf.extend_from_slice(&v.to_le_bytes());
        }
        KeyValue::Utf8(s) => {
            buf.push(KEY_TAG_UTF8);
            buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
            buf.extend_from_slice(s.as_bytes());
        }
    }
}

fn read_key(data: &[u8], offset: &mut usize) -> StatusResult<KeyValue> {
    match read_u8(data, offset)? {
        KEY_TAG_INT => Ok(KeyValue::Int(read_i64_le(data, offset)?)),
        KEY_TAG_UTF8 => {
            let len = read_u32_le(data, offset)? as usize;
            let bytes = read_bytes(data, offset, len)?;
            let s = std::str::from_utf8(bytes).map_err(|e| {
                Status::invalid_argument(format!("runtime filter key is not utf8: {e}"))
            })?;
            Ok(KeyValue::Utf8(s.to_string()))
        }
        other => Err(Status::invalid_argument(format!(
            "unknown runtime filter key tag: {other}"
        ))),
    }
}

pub(super) fn read_bytes<'a>(
    data: &'a [u8],
    offset: &mut usize,
    len: usize,
) -> StatusResult<&'a [u8]> {
    let end = offset
        .checked_add(len)
        .ok_or_else(|| Status::invalid_argument("runtime filter data length overflow"))?;
    if data.len() < end {
        return Err(Status::invalid_argument("runtime filter data truncated"));
    }
    let out = &data[*offset..end];
    *offset = end;
    Ok(out)
}

pub(super) fn read_u8(data: &[u8], offset: &mut usize) -> StatusResult<u8> {
    Ok(read_bytes(data, offset, 1)?[0])
}

pub(super) fn read_u32_le(data: &[u8], offset: &mut usize) -> StatusResult<u32> {
    let bytes = read_bytes(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

pub(super) fn read_i64_le(data: &[u8], offset: &mut usize) -> StatusResult<i64> {
    let bytes = read_bytes(data, offset, 8)?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(bytes);
    Ok(i64::from_le_bytes(raw))
}
