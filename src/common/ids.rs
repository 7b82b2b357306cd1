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
use std::fmt;
use std::str::FromStr;

macro_rules! define_u32_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
        pub struct $name(pub u32);

        impl $name {
            pub const fn new(value: u32) -> Self {
                Self(value)
            }

            pub const fn as_u32(self) -> u32 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<$name> for u32 {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl TryFrom<i32> for $name {
            type Error = String;

            fn try_from(value: i32) -> Result<Self, Self::Error> {
                let v = u32::try_from(value)
                    .map_err(|_| format!(concat!("invalid ", $label, ": {}"), value))?;
                Ok(Self(v))
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let v = s
                    .parse::<u32>()
                    .map_err(|e| format!(concat!("invalid ", $label, " string '{}': {}"), s, e))?;
                Ok(Self(v))
            }
        }
    };
}

define_u32_id!(
    /// Runtime filter id, unique within one query.
    FilterId,
    "filter id"
);

define_u32_id!(
    /// Worker (backend) that hosts producers and consumers of runtime filters.
    WorkerId,
    "worker id"
);

define_u32_id!(
    /// Build-side operator instance contributing one partial filter.
    ProducerId,
    "producer id"
);

define_u32_id!(
    /// Scan operator instance waiting on runtime filters.
    ConsumerId,
    "consumer id"
);

define_u32_id!(
    /// Index of a partition record inside one operator's partition arena.
    PartitionId,
    "partition id"
);

/// Query id as a 128-bit value split in two halves, printed as `hi-lo` in hex.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct QueryId {
    pub hi: u64,
    pub lo: u64,
}

impl QueryId {
    pub const fn new(hi: u64, lo: u64) -> Self {
        Self { hi, lo }
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}-{:x}", self.hi, self.lo)
    }
}

impl FromStr for QueryId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (hi, lo) = s
            .split_once('-')
            .ok_or_else(|| format!("invalid query id string '{}': missing '-'", s))?;
        let hi = u64::from_str_radix(hi, 16)
            .map_err(|e| format!("invalid query id string '{}': {}", s, e))?;
        let lo = u64::from_str_radix(lo, 16)
            .map_err(|e| format!("invalid query id string '{}': {}", s, e))?;
        Ok(Self { hi, lo })
    }
}
