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
//! Per-query owner of cluster-wide runtime filters.
//!
//! Workers send partial filters through their bank; the coordinator merges them and
//! sends the result (or a timeout/disable notice) to every worker that subscribed.
//! Filters marked `is_local` never reach the coordinator: their producers and
//! consumers share one worker bank.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crate::common::ids::{FilterId, ProducerId, QueryId, WorkerId};
use crate::common::status::{Status, StatusResult};
use crate::exec::runtime_filter::{
    RuntimeFilter, RuntimeFilterDesc, RuntimeFilterMode, decode_runtime_filter,
    encode_runtime_filter,
};
use crate::graceflow_logging::{debug, info, warn};
use crate::runtime::runtime_filter_entry::{
    MergeOutcome, RuntimeFilterEntry, RuntimeFilterState, WaitOutcome,
};
use crate::runtime::runtime_filter_transport::{FilterEndpoint, FilterMessage, FilterTransport};

/// Counters reported when the coordinator closes.
#[derive(Debug, Default)]
pub struct CoordinatorStats {
    partials_received: AtomicU64,
    partials_dropped: AtomicU64,
    filters_published: AtomicU64,
    filters_timed_out: AtomicU64,
    send_failures: AtomicU64,
}

impl CoordinatorStats {
    pub fn partials_received(&self) -> u64 {
        self.partials_received.load(Ordering::Relaxed)
    }

    pub fn partials_dropped(&self) -> u64 {
        self.partials_dropped.load(Ordering::Relaxed)
    }

    pub fn filters_published(&self) -> u64 {
        self.filters_published.load(Ordering::Relaxed)
    }

    pub fn filters_timed_out(&self) -> u64 {
        self.filters_timed_out.load(Ordering::Relaxed)
    }

    pub fn send_failures(&self) -> u64 {
        self.send_failures.load(Ordering::Relaxed)
    }
}

struct TimerShutdown {
    closed: Mutex<bool>,
    cond: Condvar,
}

pub struct RuntimeFilterCoordinator {
    query_id: QueryId,
    mode: RuntimeFilterMode,
    descs: HashMap<FilterId, RuntimeFilterDesc>,
    entries: HashMap<FilterId, Arc<RuntimeFilterEntry>>,
    subscribers: Mutex<HashMap<FilterId, HashSet<WorkerId>>>,
    workers: Mutex<HashSet<WorkerId>>,
    transport: Arc<dyn FilterTransport>,
    timer: Arc<TimerShutdown>,
    cancelled: AtomicBool,
    stats: CoordinatorStats,
}

impl RuntimeFilterCoordinator {
    /// Creates entries for every cluster-wide filter and arms the deadline timer.
    ///
    /// Deadlines count from this call. Filters excluded by `mode` start DISABLED.
    pub fn open(
        query_id: QueryId,
        descs: Vec<RuntimeFilterDesc>,
        mode: RuntimeFilterMode,
        transport: Arc<dyn FilterTransport>,
    ) -> StatusResult<Arc<Self>> {
        let opened_at = Instant::now();
        let mut desc_map = HashMap::with_capacity(descs.len());
        let mut entries = HashMap::new();
        for desc in descs {
            if desc.expected_producer_count == 0 {
                return Err(Status::invalid_argument(format!(
                    "runtime filter {} has no producers",
                    desc.filter_id
                )));
            }
            if desc_map.contains_key(&desc.filter_id) {
                return Err(Status::invalid_argument(format!(
                    "duplicate runtime filter id {}",
                    desc.filter_id
                )));
            }
            if !desc.is_local {
                let entry = Arc::new(RuntimeFilterEntry::new(desc.clone(), opened_at));
                if !mode.allows(&desc) {
                    entry.disable()?;
                }
                entries.insert(desc.filter_id, entry);
            }
            desc_map.insert(desc.filter_id, desc);
        }

        let coordinator = Arc::new(Self {
            query_id,
            mode,
            descs: desc_map,
            entries,
            subscribers: Mutex::new(HashMap::new()),
            workers: Mutex::new(HashSet::new()),
            transport,
            timer: Arc::new(TimerShutdown {
                closed: Mutex::new(false),
                cond: Condvar::new(),
            }),
            cancelled: AtomicBool::new(false),
            stats: CoordinatorStats::default(),
        });
        coordinator.spawn_deadline_timer()?;
        info!(
            "runtime filter coordinator opened: query_id={} mode={} filters={} global={}",
            query_id,
            mode,
            coordinator.descs.len(),
            coordinator.entries.len()
        );
        Ok(coordinator)
    }

    pub fn query_id(&self) -> QueryId {
        self.query_id
    }

    pub fn mode(&self) -> RuntimeFilterMode {
        self.mode
    }

    pub fn descs(&self) -> impl Iterator<Item = &RuntimeFilterDesc> {
        self.descs.values()
    }

    pub fn stats(&self) -> &CoordinatorStats {
        &self.stats
    }

    fn entry(&self, filter_id: FilterId) -> StatusResult<&Arc<RuntimeFilterEntry>> {
        self.entries.get(&filter_id).ok_or_else(|| {
            let reason = if self.descs.contains_key(&filter_id) {
                "is local to one worker"
            } else {
                "is unknown"
            };
            Status::invalid_argument(format!(
                "runtime filter {} {} (query_id={})",
                filter_id, reason, self.query_id
            ))
        })
    }

    pub fn state(&self, filter_id: FilterId) -> StatusResult<RuntimeFilterState> {
        Ok(self.entry(filter_id)?.state())
    }

    /// Merges one producer's partial filter. The last outstanding partial publishes the result.
    pub fn update_filter(
        &self,
        filter_id: FilterId,
        producer: ProducerId,
        partial: &RuntimeFilter,
    ) -> StatusResult<()> {
        let entry = self.entry(filter_id)?;
        self.stats.partials_received.fetch_add(1, Ordering::Relaxed);
        match entry.merge_partial(producer, partial)? {
            MergeOutcome::Merged { outstanding } => {
                debug!(
                    "runtime filter partial merged: query_id={} filter_id={} producer={} outstanding={}",
                    self.query_id, filter_id, producer, outstanding
                );
            }
            MergeOutcome::Completed(filter) => {
                self.stats.filters_published.fetch_add(1, Ordering::Relaxed);
                let payload = encode_runtime_filter(&filter);
                self.broadcast(filter_id, |query_id| FilterMessage::Publish {
                    query_id,
                    filter_id,
                    payload: payload.clone(),
                });
            }
            MergeOutcome::Duplicate => {}
            MergeOutcome::Late(_) => {
                self.stats.partials_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    /// Disables a pending filter that has not received any partial yet.
    pub fn disable(&self, filter_id: FilterId) -> StatusResult<()> {
        self.entry(filter_id)?.disable()?;
        self.broadcast(filter_id, |query_id| FilterMessage::Disabled {
            query_id,
            filter_id,
        });
        Ok(())
    }

    /// Blocks until the filter resolves, the query is cancelled, or `max_wait` elapses.
    pub fn await_filter(&self, filter_id: FilterId, max_wait: Duration) -> StatusResult<WaitOutcome> {
        Ok(self.entry(filter_id)?.wait(max_wait))
    }

    /// Registers `worker` as hosting consumers of `filter_id`. A filter that is already
    /// resolved is delivered right away.
    pub fn subscribe(&self, filter_id: FilterId, worker: WorkerId) -> StatusResult<()> {
        let entry = self.entry(filter_id)?;
        self.note_worker(worker);
        {
            let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
            if !subscribers.entry(filter_id).or_default().insert(worker) {
                return Ok(());
            }
        }
        let msg = match entry.state() {
            RuntimeFilterState::Pending => return Ok(()),
            RuntimeFilterState::Arrived => match entry.published() {
                Some(filter) => FilterMessage::Publish {
                    query_id: self.query_id,
                    filter_id,
                    payload: encode_runtime_filter(&filter),
                },
                None => return Err(Status::internal("arrived runtime filter has no payload")),
            },
            RuntimeFilterState::TimedOut => FilterMessage::TimedOut {
                query_id: self.query_id,
                filter_id,
            },
            RuntimeFilterState::Disabled => FilterMessage::Disabled {
                query_id: self.query_id,
                filter_id,
            },
        };
        self.send(FilterEndpoint::Worker(worker), msg);
        Ok(())
    }

    /// Entry point for messages addressed to the coordinator.
    pub fn receive(&self, msg: FilterMessage) -> StatusResult<()> {
        if msg.query_id() != self.query_id {
            return Err(Status::invalid_argument(format!(
                "runtime filter message for query {} delivered to coordinator of query {}",
                msg.query_id(),
                self.query_id
            )));
        }
        match msg {
            FilterMessage::Partial {
                filter_id,
                worker_id,
                producer_id,
                payload,
                ..
            } => {
                self.note_worker(worker_id);
                let partial = decode_runtime_filter(&payload)?;
                self.update_filter(filter_id, producer_id, &partial)
            }
            FilterMessage::Subscribe {
                filter_id,
                worker_id,
                ..
            } => self.subscribe(filter_id, worker_id),
            other => Err(Status::invalid_argument(format!(
                "coordinator cannot handle runtime filter message '{}'",
                other.name()
            ))),
        }
    }

    /// Unblocks every waiter with `Cancelled` and forwards the cancellation to all known workers.
    pub fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        for entry in self.entries.values() {
            entry.cancel();
        }
        let workers: Vec<WorkerId> = self
            .workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .copied()
            .collect();
        for worker in workers {
            self.send(
                FilterEndpoint::Worker(worker),
                FilterMessage::Cancel {
                    query_id: self.query_id,
                },
            );
        }
        info!("runtime filter coordinator cancelled: query_id={}", self.query_id);
        self.stop_timer();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Stops the deadline timer. Entries still answer state queries afterwards.
    pub fn close(&self) {
        self.stop_timer();
        info!(
            "runtime filter coordinator closed: query_id={} partials_received={} partials_dropped={} published={} timed_out={}",
            self.query_id,
            self.stats.partials_received(),
            self.stats.partials_dropped(),
            self.stats.filters_published(),
            self.stats.filters_timed_out()
        );
    }

    fn note_worker(&self, worker: WorkerId) {
        self.workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(worker);
    }

    fn on_deadline(&self, filter_id: FilterId) {
        let Some(entry) = self.entries.get(&filter_id) else {
            return;
        };
        // A state query may already have expired the entry lazily; subscribers still need the notice.
        if !entry.time_out() && entry.state() != RuntimeFilterState::TimedOut {
            return;
        }
        self.stats.filters_timed_out.fetch_add(1, Ordering::Relaxed);
        info!(
            "runtime filter timed out: query_id={} filter_id={} outstanding_producers={}",
            self.query_id,
            filter_id,
            entry.outstanding_producers()
        );
        self.broadcast(filter_id, |query_id| FilterMessage::TimedOut {
            query_id,
            filter_id,
        });
    }

    fn broadcast(&self, filter_id: FilterId, make: impl Fn(QueryId) -> FilterMessage) {
        let targets: Vec<WorkerId> = self
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&filter_id)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        for worker in targets {
            self.send(FilterEndpoint::Worker(worker), make(self.query_id));
        }
    }

    fn send(&self, to: FilterEndpoint, msg: FilterMessage) {
        let name = msg.name();
        if let Err(err) = self.transport.send(to, msg) {
            self.stats.send_failures.fetch_add(1, Ordering::Relaxed);
            warn!(
                "runtime filter message delivery failed: query_id={} to={} msg={} error={}",
                self.query_id, to, name, err
            );
        }
    }

    fn spawn_deadline_timer(self: &Arc<Self>) -> StatusResult<()> {
        let mut deadlines: Vec<(Instant, FilterId)> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.state() == RuntimeFilterState::Pending)
            .map(|(id, entry)| (entry.deadline(), *id))
            .collect();
        if deadlines.is_empty() {
            return Ok(());
        }
        deadlines.sort();

        let weak: Weak<Self> = Arc::downgrade(self);
        let timer = Arc::clone(&self.timer);
        thread::Builder::new()
            .name(format!("rf-timer-{}", self.query_id))
            .spawn(move || {
                for (deadline, filter_id) in deadlines {
                    let mut closed = timer.closed.lock().unwrap_or_else(|e| e.into_inner());
                    loop {
                        if *closed {
                            return;
                        }
                        let now = Instant::now();
                        if now >= deadline {
                            break;
                        }
                        closed = timer
                            .cond
                            .wait_timeout(closed, deadline - now)
                            .map(|(guard, _)| guard)
                            .unwrap_or_else(|e| e.into_inner().0);
                    }
                    drop(closed);
                    let Some(coordinator) = weak.upgrade() else {
                        return;
                    };
                    coordinator.on_deadline(filter_id);
                }
            })
            .map_err(|e| Status::internal(format!("spawn runtime filter timer failed: {e}")))?;
        Ok(())
    }

    fn stop_timer(&self) {
        let mut closed = self.timer.closed.lock().unwrap_or_else(|e| e.into_inner());
        *closed = true;
        self.timer.cond.notify_all();
    }
}

impl Drop for RuntimeFilterCoordinator {
    fn drop(&mut self) {
        self.stop_timer();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::chunk::KeyValue;
    use crate::exec::runtime_filter::{MinMaxFilter, RuntimeFilterKind};
    use crate::runtime::runtime_filter_transport::LoopbackTransport;

    fn desc(id: u32, producers: usize, deadline_ms: u64) -> RuntimeFilterDesc {
        RuntimeFilterDesc::new(FilterId(id), RuntimeFilterKind::MinMax, "t", "b", producers)
            .with_deadline(Duration::from_millis(deadline_ms))
    }

    fn range(lo: i64, hi: i64) -> RuntimeFilter {
        RuntimeFilter::Range(MinMaxFilter::from_bounds(KeyValue::Int(lo), KeyValue::Int(hi)).unwrap())
    }

    #[test]
    fn timer_times_out_without_any_access() {
        let transport = LoopbackTransport::new();
        let coord = RuntimeFilterCoordinator::open(
            QueryId::new(1, 1),
            vec![desc(1, 2, 30)],
            RuntimeFilterMode::Global,
            transport,
        )
        .unwrap();
        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(coord.stats().filters_timed_out(), 1);
        assert_eq!(coord.state(FilterId(1)).unwrap(), RuntimeFilterState::TimedOut);
    }

    #[test]
    fn mode_local_disables_global_filters() {
        let coord = RuntimeFilterCoordinator::open(
            QueryId::new(1, 2),
            vec![desc(1, 1, 10_000), desc(2, 1, 10_000).with_local(true)],
            RuntimeFilterMode::Local,
            LoopbackTransport::new(),
        )
        .unwrap();
        assert_eq!(coord.state(FilterId(1)).unwrap(), RuntimeFilterState::Disabled);
        assert!(coord.state(FilterId(2)).is_err());
        assert!(coord.update_filter(FilterId(1), ProducerId(1), &range(1, 2)).is_ok());
        assert_eq!(coord.stats().partials_dropped(), 1);
    }

    #[test]
    fn invalid_descriptors_are_rejected() {
        let zero = RuntimeFilterCoordinator::open(
            QueryId::new(1, 3),
            vec![desc(1, 0, 100)],
            RuntimeFilterMode::Global,
            LoopbackTransport::new(),
        );
        assert!(zero.is_err());
        let dup = RuntimeFilterCoordinator::open(
            QueryId::new(1, 3),
            vec![desc(1, 1, 100), desc(1, 1, 100)],
            RuntimeFilterMode::Global,
            LoopbackTransport::new(),
        );
        assert!(dup.is_err());
    }

    #[test]
    fn cancel_wakes_waiters() {
        let coord = RuntimeFilterCoordinator::open(
            QueryId::new(1, 4),
            vec![desc(1, 1, 10_000)],
            RuntimeFilterMode::Global,
            LoopbackTransport::new(),
        )
        .unwrap();
        let waiter = {
            let coord = Arc::clone(&coord);
            std::thread::spawn(move || coord.await_filter(FilterId(1), Duration::from_secs(10)))
        };
        std::thread::sleep(Duration::from_millis(20));
        coord.cancel();
        let outcome = waiter.join().unwrap().unwrap();
        assert!(matches!(outcome, WaitOutcome::Cancelled));
        assert!(coord.is_cancelled());
    }
}
