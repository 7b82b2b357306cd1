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
//! Messages exchanged between worker filter banks and the query's coordinator.
//!
//! The RPC layer is an external collaborator: anything implementing
//! [`FilterTransport`] can carry these messages. [`LoopbackTransport`] delivers them
//! in-process and synchronously, which is what single-process deployments and tests use.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock, Weak};

use crate::common::ids::{FilterId, ProducerId, QueryId, WorkerId};
use crate::common::status::{Status, StatusResult};
use crate::graceflow_logging::debug;
use crate::runtime::runtime_filter_bank::RuntimeFilterBank;
use crate::runtime::runtime_filter_coordinator::RuntimeFilterCoordinator;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FilterEndpoint {
    Coordinator,
    Worker(WorkerId),
}

impl fmt::Display for FilterEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterEndpoint::Coordinator => write!(f, "coordinator"),
            FilterEndpoint::Worker(id) => write!(f, "worker-{}", id),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FilterMessage {
    /// Worker -> coordinator: one producer's partial filter, encoded.
    Partial {
        query_id: QueryId,
        filter_id: FilterId,
        worker_id: WorkerId,
        producer_id: ProducerId,
        payload: Vec<u8>,
    },
    /// Worker -> coordinator: the worker hosts consumers of the filter.
    Subscribe {
        query_id: QueryId,
        filter_id: FilterId,
        worker_id: WorkerId,
    },
    /// Coordinator -> worker: the merged filter, encoded.
    Publish {
        query_id: QueryId,
        filter_id: FilterId,
        payload: Vec<u8>,
    },
    /// Coordinator -> worker: the filter will never arrive.
    TimedOut {
        query_id: QueryId,
        filter_id: FilterId,
    },
    /// Coordinator -> worker: the filter was disabled.
    Disabled {
        query_id: QueryId,
        filter_id: FilterId,
    },
    /// Coordinator -> worker: the query was cancelled.
    Cancel { query_id: QueryId },
}

impl FilterMessage {
    pub fn query_id(&self) -> QueryId {
        match self {
            FilterMessage::Partial { query_id, .. }
            | FilterMessage::Subscribe { query_id, .. }
            | FilterMessage::Publish { query_id, .. }
            | FilterMessage::TimedOut { query_id, .. }
            | FilterMessage::Disabled { query_id, .. }
            | FilterMessage::Cancel { query_id } => *query_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            FilterMessage::Partial { .. } => "partial",
            FilterMessage::Subscribe { .. } => "subscribe",
            FilterMessage::Publish { .. } => "publish",
            FilterMessage::TimedOut { .. } => "timed_out",
            FilterMessage::Disabled { .. } => "disabled",
            FilterMessage::Cancel { .. } => "cancel",
        }
    }
}

pub trait FilterTransport: Send + Sync {
    fn send(&self, to: FilterEndpoint, msg: FilterMessage) -> StatusResult<()>;
}

/// In-process transport routing messages to attached endpoints.
///
/// Endpoints are held weakly; messages to a dropped endpoint fail with `INTERNAL`.
#[derive(Default)]
pub struct LoopbackTransport {
    coordinator: RwLock<Option<Weak<RuntimeFilterCoordinator>>>,
    workers: RwLock<HashMap<WorkerId, Weak<RuntimeFilterBank>>>,
}

impl LoopbackTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn attach_coordinator(&self, coordinator: &Arc<RuntimeFilterCoordinator>) {
        let mut guard = self.coordinator.write().unwrap_or_else(|e| e.into_inner());
        *guard = Some(Arc::downgrade(coordinator));
    }

    pub fn attach_worker(&self, bank: &Arc<RuntimeFilterBank>) {
        let mut guard = self.workers.write().unwrap_or_else(|e| e.into_inner());
        guard.insert(bank.worker_id(), Arc::downgrade(bank));
    }

    fn coordinator(&self) -> Option<Arc<RuntimeFilterCoordinator>> {
        let guard = self.coordinator.read().unwrap_or_else(|e| e.into_inner());
        guard.as_ref().and_then(Weak::upgrade)
    }

    fn worker(&self, worker_id: WorkerId) -> Option<Arc<RuntimeFilterBank>> {
        let guard = self.workers.read().unwrap_or_else(|e| e.into_inner());
        guard.get(&worker_id).and_then(Weak::upgrade)
    }
}

impl FilterTransport for LoopbackTransport {
    fn send(&self, to: FilterEndpoint, msg: FilterMessage) -> StatusResult<()> {
        debug!("loopback transport send: to={} msg={}", to, msg.name());
        match to {
            FilterEndpoint::Coordinator => {
                let coordinator = self.coordinator().ok_or_else(|| {
                    Status::internal("runtime filter coordinator is not attached")
                })?;
                coordinator.receive(msg)
            }
            FilterEndpoint::Worker(worker_id) => {
                let bank = self.worker(worker_id).ok_or_else(|| {
                    Status::internal(format!(
                        "runtime filter bank of worker {} is not attached",
                        worker_id
                    ))
                })?;
                bank.receive(msg)
            }
        }
    }
}
