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
//! Hash partitions shared by the partitioned join and aggregation.
//!
//! A partition lives in a [`PartitionArena`] record; its rows live in a
//! [`SpillablePartition`] that can move to spill storage under memory pressure.

pub mod arena;
pub mod directory;
pub mod spillable;

pub use arena::{PartitionArena, PartitionRecord, PartitionState};
pub use directory::{MAX_PARTITION_FANOUT, PartitionDirectory, partition_count_for_budget};
pub use spillable::SpillablePartition;
