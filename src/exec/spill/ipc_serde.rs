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
//! Body encoding of spill blocks: the chunks of one block as a single Arrow IPC
//! stream, optionally compressed per buffer.

use std::fmt;
use std::io::Cursor;
use std::str::FromStr;

use arrow::datatypes::{Schema, SchemaRef};
use arrow::error::ArrowError;
use arrow::ipc::reader::StreamReader;
use arrow::ipc::writer::{IpcWriteOptions, StreamWriter};
use arrow::ipc::{CompressionType, MetadataVersion};

use crate::common::status::{Status, StatusResult};
use crate::exec::chunk::Chunk;
use crate::exec::hash_table::hash::hash_bytes_with_seed;

const IPC_ALIGNMENT: usize = 64;
const SCHEMA_HASH_SEED: u64 = 0x5350_494c_4c53_4348;

/// Buffer compression of a spill block body. The discriminant is stored in the
/// block header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum SpillCodec {
    None = 0,
    Lz4 = 1,
    Zstd = 2,
}

impl SpillCodec {
    const ALL: [SpillCodec; 3] = [SpillCodec::None, SpillCodec::Lz4, SpillCodec::Zstd];

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            SpillCodec::None => "none",
            SpillCodec::Lz4 => "lz4",
            SpillCodec::Zstd => "zstd",
        }
    }

    fn compression(self) -> Option<CompressionType> {
        match self {
            SpillCodec::None => None,
            SpillCodec::Lz4 => Some(CompressionType::LZ4_FRAME),
            SpillCodec::Zstd => Some(CompressionType::ZSTD),
        }
    }
}

impl FromStr for SpillCodec {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let wanted = value.trim();
        SpillCodec::ALL
            .into_iter()
            .find(|codec| codec.name().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| format!("unsupported spill ipc compression: {value}"))
    }
}

impl TryFrom<u8> for SpillCodec {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        SpillCodec::ALL
            .into_iter()
            .find(|codec| codec.as_u8() == value)
            .ok_or_else(|| format!("unknown spill codec value: {value}"))
    }
}

impl fmt::Display for SpillCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Result of encoding one block body.
#[derive(Debug)]
pub struct EncodedChunks {
    pub body: Vec<u8>,
    pub num_batches: u32,
    pub num_rows: u64,
}

/// Encodes chunks of one partition schema as an Arrow IPC stream and back.
#[derive(Debug, Clone)]
pub struct ChunkStreamCodec {
    codec: SpillCodec,
    write_options: IpcWriteOptions,
}

impl ChunkStreamCodec {
    pub fn new(codec: SpillCodec) -> StatusResult<Self> {
        let write_options = IpcWriteOptions::try_new(IPC_ALIGNMENT, false, MetadataVersion::V5)
            .and_then(|options| options.try_with_compression(codec.compression()))
            .map_err(ipc_error)?;
        Ok(Self {
            codec,
            write_options,
        })
    }

    pub fn codec(&self) -> SpillCodec {
        self.codec
    }

    /// Writes the non-empty `chunks` as one stream.
    pub fn encode(&self, schema: &SchemaRef, chunks: &[Chunk]) -> StatusResult<EncodedChunks> {
        let mut writer = StreamWriter::try_new_with_options(
            Vec::new(),
            schema.as_ref(),
            self.write_options.clone(),
        )
        .map_err(ipc_error)?;
        let mut num_batches = 0u32;
        let mut num_rows = 0u64;
        for chunk in chunks.iter().filter(|c| !c.is_empty()) {
            writer.write(&chunk.batch).map_err(ipc_error)?;
            num_batches = num_batches
                .checked_add(1)
                .ok_or_else(|| Status::internal("spill block batch count overflows u32"))?;
            num_rows += chunk.len() as u64;
        }
        writer.finish().map_err(ipc_error)?;
        Ok(EncodedChunks {
            body: writer.into_inner().map_err(ipc_error)?,
            num_batches,
            num_rows,
        })
    }

    /// Reads a stream written by [`ChunkStreamCodec::encode`] for `schema`.
    pub fn decode(&self, schema: &SchemaRef, body: &[u8]) -> StatusResult<Vec<Chunk>> {
        let reader = StreamReader::try_new(Cursor::new(body), None).map_err(ipc_error)?;
        if reader.schema().fields() != schema.fields() {
            return Err(Status::io_error(format!(
                "spill stream schema {} does not match partition schema {}",
                reader.schema(),
                schema
            )));
        }
        reader
            .map(|batch| batch.map(Chunk::new).map_err(ipc_error))
            .collect()
    }
}

/// Fingerprint of a partition layout, stored in every block header so a block is
/// never restored into a partition with different columns.
pub fn schema_hash(schema: &Schema) -> u64 {
    hash_bytes_with_seed(SCHEMA_HASH_SEED, schema.to_string().as_bytes())
}

fn ipc_error(err: ArrowError) -> Status {
    Status::io_error(format!("arrow ipc error: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use arrow::array::{Int64Array, RecordBatch, StringArray};
    use arrow::datatypes::{DataType, Field};

    fn schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new("k", DataType::Int64, false),
            Field::new("v", DataType::Utf8, true),
        ]))
    }

    fn batch(keys: Vec<i64>) -> RecordBatch {
        let values: Vec<Option<String>> = keys
            .iter()
            .map(|k| (k % 2 == 0).then(|| format!("v{k}")))
            .collect();
        RecordBatch::try_new(
            schema(),
            vec![Arc::new(Int64Array::from(keys)), Arc::new(StringArray::from(values))],
        )
        .unwrap()
    }

    #[test]
    fn codec_names_and_tags() {
        assert_eq!(" LZ4 ".parse::<SpillCodec>().unwrap(), SpillCodec::Lz4);
        assert_eq!("none".parse::<SpillCodec>().unwrap(), SpillCodec::None);
        assert!("snappy".parse::<SpillCodec>().is_err());
        assert_eq!(SpillCodec::try_from(2u8).unwrap(), SpillCodec::Zstd);
        assert!(SpillCodec::try_from(9u8).is_err());
        assert_eq!(SpillCodec::Zstd.to_string(), "zstd");
    }

    #[test]
    fn compressed_stream_keeps_batches_and_skips_empty() {
        let codec = ChunkStreamCodec::new(SpillCodec::Zstd).unwrap();
        let chunks = vec![
            Chunk::new(batch(vec![1, 2, 3])),
            Chunk::new(batch(Vec::new())),
            Chunk::new(batch(vec![4])),
        ];
        let encoded = codec.encode(&schema(), &chunks).unwrap();
        assert_eq!(encoded.num_batches, 2);
        assert_eq!(encoded.num_rows, 4);
        let restored = codec.decode(&schema(), &encoded.body).unwrap();
        assert_eq!(restored.len(), 2);
        assert_eq!(restored[0].batch, chunks[0].batch);
        assert_eq!(restored[1].batch, chunks[2].batch);
    }

    #[test]
    fn decode_rejects_other_layout() {
        let codec = ChunkStreamCodec::new(SpillCodec::None).unwrap();
        let encoded = codec.encode(&schema(), &[Chunk::new(batch(vec![1]))]).unwrap();
        let narrow = Arc::new(Schema::new(vec![Field::new("k", DataType::Int64, false)]));
        let err = codec.decode(&narrow, &encoded.body).unwrap_err();
        assert_eq!(err.code, crate::common::status::StatusCode::IoError);
    }

    #[test]
    fn schema_hash_changes_with_layout() {
        let a = Schema::new(vec![Field::new("k", DataType::Int64, false)]);
        let b = Schema::new(vec![Field::new("k", DataType::Int32, false)]);
        assert_ne!(schema_hash(&a), schema_hash(&b));
        assert_eq!(schema_hash(&a), schema_hash(&a.clone()));
    }
}
