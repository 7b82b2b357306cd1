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
//! Single-assignment resolution slot of one runtime filter.
//!
//! State machine: `PENDING -> ARRIVED | TIMED_OUT | DISABLED`. Once resolved the
//! state never changes again. The deadline is enforced lazily by every access and
//! eagerly by the owner's timer, whichever comes first.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::common::ids::ProducerId;
use crate::common::status::{Status, StatusResult};
use crate::exec::runtime_filter::{RuntimeFilter, RuntimeFilterDesc};
use crate::graceflow_logging::debug;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RuntimeFilterState {
    Pending,
    Arrived,
    TimedOut,
    Disabled,
}

impl RuntimeFilterState {
    pub fn is_resolved(self) -> bool {
        self != RuntimeFilterState::Pending
    }
}

impl fmt::Display for RuntimeFilterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeFilterState::Pending => write!(f, "PENDING"),
            RuntimeFilterState::Arrived => write!(f, "ARRIVED"),
            RuntimeFilterState::TimedOut => write!(f, "TIMED_OUT"),
            RuntimeFilterState::Disabled => write!(f, "DISABLED"),
        }
    }
}

/// What a consumer gets back from waiting on a filter.
#[derive(Clone, Debug)]
pub enum WaitOutcome {
    Arrived(Arc<RuntimeFilter>),
    /// The filter timed out, or the consumer's own wait budget ran out first.
    TimedOut,
    Disabled,
    Cancelled,
}

impl WaitOutcome {
    pub fn filter(&self) -> Option<&Arc<RuntimeFilter>> {
        match self {
            WaitOutcome::Arrived(filter) => Some(filter),
            _ => None,
        }
    }
}

/// Result of offering one partial filter.
#[derive(Clone, Debug)]
pub enum MergeOutcome {
    /// Merged; `outstanding` producers still missing.
    Merged { outstanding: usize },
    /// This partial completed the filter.
    Completed(Arc<RuntimeFilter>),
    /// The producer already contributed; the partial was ignored.
    Duplicate,
    /// The filter was already resolved; the partial was dropped.
    Late(RuntimeFilterState),
}

struct EntryState {
    state: RuntimeFilterState,
    aggregate: Option<RuntimeFilter>,
    published: Option<Arc<RuntimeFilter>>,
    producers: HashSet<ProducerId>,
    outstanding: usize,
    cancelled: bool,
    late_partials: usize,
}

pub struct RuntimeFilterEntry {
    desc: RuntimeFilterDesc,
    deadline: Instant,
    inner: Mutex<EntryState>,
    cond: Condvar,
}

impl RuntimeFilterEntry {
    /// Entry whose arrival deadline counts from `opened_at`.
    pub fn new(desc: RuntimeFilterDesc, opened_at: Instant) -> Self {
        let deadline = opened_at
            .checked_add(desc.arrival_deadline)
            .unwrap_or(opened_at + Duration::from_secs(365 * 24 * 3600));
        let outstanding = desc.expected_producer_count;
        Self {
            desc,
            deadline,
            inner: Mutex::new(EntryState {
                state: RuntimeFilterState::Pending,
                aggregate: None,
                published: None,
                producers: HashSet::new(),
                outstanding,
                cancelled: false,
                late_partials: 0,
            }),
            cond: Condvar::new(),
        }
    }

    pub fn desc(&self) -> &RuntimeFilterDesc {
        &self.desc
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    fn lock(&self) -> MutexGuard<'_, EntryState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Moves a pending entry past its deadline to TIMED_OUT. Returns true on transition.
    fn expire_if_due(&self, st: &mut EntryState, now: Instant) -> bool {
        if st.state != RuntimeFilterState::Pending || now < self.deadline {
            return false;
        }
        st.state = RuntimeFilterState::TimedOut;
        st.aggregate = None;
        debug!(
            "runtime filter timed out: filter_id={} outstanding_producers={}",
            self.desc.filter_id, st.outstanding
        );
        self.cond.notify_all();
        true
    }

    pub fn state(&self) -> RuntimeFilterState {
        let mut st = self.lock();
        self.expire_if_due(&mut st, Instant::now());
        st.state
    }

    pub fn is_cancelled(&self) -> bool {
        self.lock().cancelled
    }

    pub fn late_partials(&self) -> usize {
        self.lock().late_partials
    }

    pub fn outstanding_producers(&self) -> usize {
        self.lock().outstanding
    }

    /// The resolved filter, if the entry arrived.
    pub fn published(&self) -> Option<Arc<RuntimeFilter>> {
        self.lock().published.clone()
    }

    pub fn merge_partial(
        &self,
        producer: ProducerId,
        partial: &RuntimeFilter,
    ) -> StatusResult<MergeOutcome> {
        if partial.kind() != self.desc.kind {
            return Err(Status::invalid_argument(format!(
                "runtime filter {} expects {} partials, got {}",
                self.desc.filter_id,
                self.desc.kind,
                partial.kind()
            )));
        }
        let mut st = self.lock();
        self.expire_if_due(&mut st, Instant::now());
        if st.state != RuntimeFilterState::Pending {
            st.late_partials += 1;
            debug!(
                "runtime filter partial dropped: filter_id={} producer={} state={}",
                self.desc.filter_id, producer, st.state
            );
            return Ok(MergeOutcome::Late(st.state));
        }
        if st.producers.contains(&producer) {
            debug!(
                "runtime filter duplicate partial ignored: filter_id={} producer={}",
                self.desc.filter_id, producer
            );
            return Ok(MergeOutcome::Duplicate);
        }
        match st.aggregate.as_mut() {
            Some(aggregate) => aggregate.merge_from(partial)?,
            None => st.aggregate = Some(partial.clone()),
        }
        st.producers.insert(producer);
        st.outstanding = st.outstanding.saturating_sub(1);
        if st.outstanding > 0 {
            return Ok(MergeOutcome::Merged {
                outstanding: st.outstanding,
            });
        }
        let filter = st
            .aggregate
            .take()
            .map(Arc::new)
            .ok_or_else(|| Status::internal("runtime filter completed without payload"))?;
        st.published = Some(Arc::clone(&filter));
        st.state = RuntimeFilterState::Arrived;
        debug!(
            "runtime filter arrived: filter_id={} producers={}",
            self.desc.filter_id,
            st.producers.len()
        );
        self.cond.notify_all();
        Ok(MergeOutcome::Completed(filter))
    }

    /// Installs a filter merged elsewhere. Returns false if the entry was already resolved.
    pub fn publish(&self, filter: Arc<RuntimeFilter>) -> bool {
        let mut st = self.lock();
        self.expire_if_due(&mut st, Instant::now());
        if st.state != RuntimeFilterState::Pending {
            st.late_partials += 1;
            debug!(
                "runtime filter publish dropped: filter_id={} state={}",
                self.desc.filter_id, st.state
            );
            return false;
        }
        st.published = Some(filter);
        st.state = RuntimeFilterState::Arrived;
        self.cond.notify_all();
        true
    }

    /// Resolves a pending entry as TIMED_OUT ahead of the local clock.
    pub fn time_out(&self) -> bool {
        let mut st = self.lock();
        if self.expire_if_due(&mut st, Instant::now()) {
            return true;
        }
        if st.state != RuntimeFilterState::Pending {
            return false;
        }
        st.state = RuntimeFilterState::TimedOut;
        st.aggregate = None;
        self.cond.notify_all();
        true
    }

    /// PENDING with no partial merged yet -> DISABLED. Anything else is illegal.
    pub fn disable(&self) -> StatusResult<()> {
        let mut st = self.lock();
        self.expire_if_due(&mut st, Instant::now());
        if st.state == RuntimeFilterState::Disabled {
            return Ok(());
        }
        if st.state != RuntimeFilterState::Pending {
            return Err(Status::illegal_state(format!(
                "runtime filter {} cannot be disabled in state {}",
                self.desc.filter_id, st.state
            )));
        }
        if !st.producers.is_empty() {
            return Err(Status::illegal_state(format!(
                "runtime filter {} cannot be disabled after {} partial(s) arrived",
                self.desc.filter_id,
                st.producers.len()
            )));
        }
        st.state = RuntimeFilterState::Disabled;
        debug!("runtime filter disabled: filter_id={}", self.desc.filter_id);
        self.cond.notify_all();
        Ok(())
    }

    /// Wakes every waiter with `Cancelled`. The filter state itself is left as is.
    pub fn cancel(&self) {
        let mut st = self.lock();
        st.cancelled = true;
        self.cond.notify_all();
    }

    /// Blocks until the entry resolves, the query is cancelled, or `max_wait` elapses.
    pub fn wait(&self, max_wait: Duration) -> WaitOutcome {
        let give_up_at = Instant::now()
            .checked_add(max_wait)
            .unwrap_or(self.deadline);
        let mut st = self.lock();
        loop {
            let now = Instant::now();
            self.expire_if_due(&mut st, now);
            if st.cancelled {
                return WaitOutcome::Cancelled;
            }
            match st.state {
                RuntimeFilterState::Arrived => {
                    return match &st.published {
                        Some(filter) => WaitOutcome::Arrived(Arc::clone(filter)),
                        None => WaitOutcome::TimedOut,
                    };
                }
                RuntimeFilterState::TimedOut => return WaitOutcome::TimedOut,
                RuntimeFilterState::Disabled => return WaitOutcome::Disabled,
                RuntimeFilterState::Pending => {}
            }
            if now >= give_up_at {
                return WaitOutcome::TimedOut;
            }
            let until = give_up_at.min(self.deadline);
            let timeout = until.saturating_duration_since(now);
            st = self
                .cond
                .wait_timeout(st, timeout)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ids::FilterId;
    use crate::exec::chunk::KeyValue;
    use crate::exec::runtime_filter::{MinMaxFilter, RuntimeFilterKind};

    fn desc(producers: usize, deadline_ms: u64) -> RuntimeFilterDesc {
        RuntimeFilterDesc::new(FilterId(1), RuntimeFilterKind::MinMax, "t", "b", producers)
            .with_deadline(Duration::from_millis(deadline_ms))
    }

    fn range(lo: i64, hi: i64) -> RuntimeFilter {
        RuntimeFilter::Range(MinMaxFilter::from_bounds(KeyValue::Int(lo), KeyValue::Int(hi)).unwrap())
    }

    #[test]
    fn arrives_after_all_producers() {
        let entry = RuntimeFilterEntry::new(desc(2, 10_000), Instant::now());
        assert!(matches!(
            entry.merge_partial(ProducerId(1), &range(1, 5)).unwrap(),
            MergeOutcome::Merged { outstanding: 1 }
        ));
        assert!(matches!(
            entry.merge_partial(ProducerId(1), &range(100, 200)).unwrap(),
            MergeOutcome::Duplicate
        ));
        assert_eq!(entry.state(), RuntimeFilterState::Pending);
        let MergeOutcome::Completed(filter) =
            entry.merge_partial(ProducerId(2), &range(3, 9)).unwrap()
        else {
            panic!("expected completion");
        };
        assert_eq!(*filter, range(1, 9));
        assert_eq!(entry.state(), RuntimeFilterState::Arrived);
        assert!(matches!(entry.wait(Duration::ZERO), WaitOutcome::Arrived(_)));
    }

    #[test]
    fn deadline_is_applied_lazily() {
        let entry = RuntimeFilterEntry::new(desc(1, 0), Instant::now());
        assert_eq!(entry.state(), RuntimeFilterState::TimedOut);
        assert!(matches!(
            entry.merge_partial(ProducerId(1), &range(1, 2)).unwrap(),
            MergeOutcome::Late(RuntimeFilterState::TimedOut)
        ));
        assert_eq!(entry.late_partials(), 1);
        assert!(!entry.publish(Arc::new(range(1, 2))));
    }

    #[test]
    fn disable_only_before_partials() {
        let entry = RuntimeFilterEntry::new(desc(2, 10_000), Instant::now());
        entry.merge_partial(ProducerId(1), &range(1, 2)).unwrap();
        let err = entry.disable().unwrap_err();
        assert_eq!(err.code, crate::common::status::StatusCode::IllegalState);

        let fresh = RuntimeFilterEntry::new(desc(2, 10_000), Instant::now());
        fresh.disable().unwrap();
        assert_eq!(fresh.state(), RuntimeFilterState::Disabled);
        assert!(matches!(fresh.wait(Duration::from_secs(5)), WaitOutcome::Disabled));
    }

    #[test]
    fn consumer_wait_budget_does_not_change_state() {
        let entry = RuntimeFilterEntry::new(desc(1, 10_000), Instant::now());
        let started = Instant::now();
        assert!(matches!(entry.wait(Duration::from_millis(20)), WaitOutcome::TimedOut));
        assert!(started.elapsed() >= Duration::from_millis(20));
        assert_eq!(entry.state(), RuntimeFilterState::Pending);
    }

    #[test]
    fn wrong_kind_partial_is_rejected() {
        let entry = RuntimeFilterEntry::new(desc(1, 10_000), Instant::now());
        let bloom = RuntimeFilter::empty(RuntimeFilterKind::Bloom, 4096);
        assert!(entry.merge_partial(ProducerId(1), &bloom).is_err());
        assert_eq!(entry.state(), RuntimeFilterState::Pending);
    }
}
