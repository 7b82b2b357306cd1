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
//! Worker-side registry of runtime filters for one query.
//!
//! Local filters are merged here. Cluster-wide filters are mirrored: partials go
//! to the coordinator and the mirror entry resolves when the coordinator answers.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::common::ids::{ConsumerId, FilterId, ProducerId, QueryId, WorkerId};
use crate::common::status::{Status, StatusResult};
use crate::exec::runtime_filter::{
    RuntimeFilter, RuntimeFilterDesc, RuntimeFilterMode, decode_runtime_filter,
    encode_runtime_filter,
};
use crate::graceflow_logging::{debug, warn};
use crate::runtime::runtime_filter_entry::{
    MergeOutcome, RuntimeFilterEntry, RuntimeFilterState, WaitOutcome,
};
use crate::runtime::runtime_filter_transport::{FilterEndpoint, FilterMessage, FilterTransport};

pub struct RuntimeFilterBank {
    worker_id: WorkerId,
    query_id: QueryId,
    mode: RuntimeFilterMode,
    entries: HashMap<FilterId, Arc<RuntimeFilterEntry>>,
    consumers: Mutex<HashMap<FilterId, HashSet<ConsumerId>>>,
    transport: Arc<dyn FilterTransport>,
}

impl RuntimeFilterBank {
    pub fn new(
        worker_id: WorkerId,
        query_id: QueryId,
        descs: &[RuntimeFilterDesc],
        mode: RuntimeFilterMode,
        transport: Arc<dyn FilterTransport>,
    ) -> Arc<Self> {
        let opened_at = Instant::now();
        let mut entries = HashMap::with_capacity(descs.len());
        for desc in descs {
            let entry = Arc::new(RuntimeFilterEntry::new(desc.clone(), opened_at));
            if !mode.allows(desc) {
                // A fresh entry has no partials, so disabling cannot fail.
                let _ = entry.disable();
            }
            entries.insert(desc.filter_id, entry);
        }
        Arc::new(Self {
            worker_id,
            query_id,
            mode,
            entries,
            consumers: Mutex::new(HashMap::new()),
            transport,
        })
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    pub fn query_id(&self) -> QueryId {
        self.query_id
    }

    pub fn mode(&self) -> RuntimeFilterMode {
        self.mode
    }

    fn entry(&self, filter_id: FilterId) -> StatusResult<&Arc<RuntimeFilterEntry>> {
        self.entries.get(&filter_id).ok_or_else(|| {
            Status::invalid_argument(format!(
                "unknown runtime filter {} on worker {} (query_id={})",
                filter_id, self.worker_id, self.query_id
            ))
        })
    }

    pub fn desc(&self, filter_id: FilterId) -> StatusResult<&RuntimeFilterDesc> {
        Ok(self.entry(filter_id)?.desc())
    }

    pub fn state(&self, filter_id: FilterId) -> StatusResult<RuntimeFilterState> {
        Ok(self.entry(filter_id)?.state())
    }

    /// Records that `consumer` reads `filter_id`. The first consumer of a cluster-wide
    /// filter subscribes this worker at the coordinator.
    pub fn register_consumer(&self, consumer: ConsumerId, filter_id: FilterId) -> StatusResult<()> {
        let entry = self.entry(filter_id)?;
        let first = {
            let mut consumers = self.consumers.lock().unwrap_or_else(|e| e.into_inner());
            let set = consumers.entry(filter_id).or_default();
            let first = set.is_empty();
            set.insert(consumer);
            first
        };
        if first && !entry.desc().is_local && entry.state() == RuntimeFilterState::Pending {
            self.transport.send(
                FilterEndpoint::Coordinator,
                FilterMessage::Subscribe {
                    query_id: self.query_id,
                    filter_id,
                    worker_id: self.worker_id,
                },
            )?;
        }
        Ok(())
    }

    /// Hands one producer's partial filter to the filter's merge point.
    pub fn publish_partial(
        &self,
        filter_id: FilterId,
        producer: ProducerId,
        partial: RuntimeFilter,
    ) -> StatusResult<()> {
        let entry = self.entry(filter_id)?;
        if entry.desc().is_local {
            if let MergeOutcome::Completed(_) = entry.merge_partial(producer, &partial)? {
                debug!(
                    "local runtime filter arrived: query_id={} worker={} filter_id={}",
                    self.query_id, self.worker_id, filter_id
                );
            }
            return Ok(());
        }
        if !self.mode.allows(entry.desc()) {
            debug!(
                "runtime filter partial not sent, mode {}: filter_id={} producer={}",
                self.mode, filter_id, producer
            );
            return Ok(());
        }
        self.transport.send(
            FilterEndpoint::Coordinator,
            FilterMessage::Partial {
                query_id: self.query_id,
                filter_id,
                worker_id: self.worker_id,
                producer_id: producer,
                payload: encode_runtime_filter(&partial),
            },
        )
    }

    /// Entry point for messages from the coordinator.
    pub fn receive(&self, msg: FilterMessage) -> StatusResult<()> {
        if msg.query_id() != self.query_id {
            return Err(Status::invalid_argument(format!(
                "runtime filter message for query {} delivered to worker {} of query {}",
                msg.query_id(),
                self.worker_id,
                self.query_id
            )));
        }
        match msg {
            FilterMessage::Publish {
                filter_id, payload, ..
            } => {
                let filter = decode_runtime_filter(&payload)?;
                self.entry(filter_id)?.publish(Arc::new(filter));
                Ok(())
            }
            FilterMessage::TimedOut { filter_id, .. } => {
                self.entry(filter_id)?.time_out();
                Ok(())
            }
            FilterMessage::Disabled { filter_id, .. } => {
                if let Err(err) = self.entry(filter_id)?.disable() {
                    warn!(
                        "ignore runtime filter disable notice: worker={} filter_id={} error={}",
                        self.worker_id, filter_id, err
                    );
                }
                Ok(())
            }
            FilterMessage::Cancel { .. } => {
                self.cancel();
                Ok(())
            }
            other => Err(Status::invalid_argument(format!(
                "worker cannot handle runtime filter message '{}'",
                other.name()
            ))),
        }
    }

    pub fn await_filter(&self, filter_id: FilterId, max_wait: Duration) -> StatusResult<WaitOutcome> {
        Ok(self.entry(filter_id)?.wait(max_wait))
    }

    pub fn cancel(&self) {
        for entry in self.entries.values() {
            entry.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::chunk::KeyValue;
    use crate::exec::runtime_filter::{MinMaxFilter, RuntimeFilterKind};
    use crate::runtime::runtime_filter_transport::LoopbackTransport;

    fn range(lo: i64, hi: i64) -> RuntimeFilter {
        RuntimeFilter::Range(MinMaxFilter::from_bounds(KeyValue::Int(lo), KeyValue::Int(hi)).unwrap())
    }

    #[test]
    fn local_filter_merges_in_place() {
        let desc = RuntimeFilterDesc::new(FilterId(7), RuntimeFilterKind::MinMax, "t", "b", 2)
            .with_local(true)
            .with_deadline(Duration::from_secs(10));
        let bank = RuntimeFilterBank::new(
            WorkerId(1),
            QueryId::new(0, 1),
            &[desc],
            RuntimeFilterMode::Local,
            LoopbackTransport::new(),
        );
        bank.register_consumer(ConsumerId(1), FilterId(7)).unwrap();
        bank.publish_partial(FilterId(7), ProducerId(1), range(1, 5)).unwrap();
        assert_eq!(bank.state(FilterId(7)).unwrap(), RuntimeFilterState::Pending);
        bank.publish_partial(FilterId(7), ProducerId(2), range(10, 20)).unwrap();
        let outcome = bank.await_filter(FilterId(7), Duration::from_millis(10)).unwrap();
        let filter = outcome.filter().unwrap();
        assert!(filter.test_key(&KeyValue::Int(15)));
        assert!(!filter.test_key(&KeyValue::Int(30)));
    }

    #[test]
    fn mode_off_disables_everything() {
        let desc = RuntimeFilterDesc::new(FilterId(1), RuntimeFilterKind::Bloom, "t", "b", 1)
            .with_local(true);
        let bank = RuntimeFilterBank::new(
            WorkerId(1),
            QueryId::new(0, 2),
            &[desc],
            RuntimeFilterMode::Off,
            LoopbackTransport::new(),
        );
        assert_eq!(bank.state(FilterId(1)).unwrap(), RuntimeFilterState::Disabled);
        let outcome = bank.await_filter(FilterId(1), Duration::from_secs(5)).unwrap();
        assert!(matches!(outcome, WaitOutcome::Disabled));
    }

    #[test]
    fn foreign_query_message_is_rejected() {
        let bank = RuntimeFilterBank::new(
            WorkerId(1),
            QueryId::new(0, 3),
            &[],
            RuntimeFilterMode::Global,
            LoopbackTransport::new(),
        );
        let msg = FilterMessage::Cancel {
            query_id: QueryId::new(9, 9),
        };
        assert!(bank.receive(msg).is_err());
        assert!(bank.state(FilterId(1)).is_err());
    }
}
