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
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
struct BudgetState {
    used: usize,
    peak: usize,
}

/// Soft memory budget shared by all partitions of one partitioned operator.
///
/// Only bytes explicitly reported by the caller are accounted; this does not reflect
/// process RSS. Check-and-reserve happens under one lock, so concurrent callers never
/// overshoot the limit together. A child budget charges its parent too: a reservation
/// succeeds only when it fits in every ancestor.
#[derive(Debug)]
pub struct MemoryBudget {
    label: String,
    limit: usize,
    parent: Option<Arc<MemoryBudget>>,
    state: Mutex<BudgetState>,
}

impl MemoryBudget {
    pub fn new(label: impl Into<String>, limit: usize) -> Self {
        Self {
            label: label.into(),
            limit,
            parent: None,
            state: Mutex::new(BudgetState::default()),
        }
    }

    /// Budget whose reservations are also charged to `parent`.
    pub fn new_child(label: impl Into<String>, limit: usize, parent: &Arc<MemoryBudget>) -> Self {
        Self {
            label: label.into(),
            limit,
            parent: Some(Arc::clone(parent)),
            state: Mutex::new(BudgetState::default()),
        }
    }

    pub fn parent(&self) -> Option<&Arc<MemoryBudget>> {
        self.parent.as_ref()
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Reserves `bytes` if they fit. Returns false and reserves nothing otherwise.
    pub fn try_reserve(&self, bytes: usize) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let Some(next) = state.used.checked_add(bytes) else {
            return false;
        };
        if next > self.limit {
            return false;
        }
        // Lock order is always child before parent.
        if let Some(parent) = &self.parent {
            if !parent.try_reserve(bytes) {
                return false;
            }
        }
        state.used = next;
        state.peak = state.peak.max(next);
        true
    }

    /// Accounts `bytes` even when they exceed the limit.
    pub fn force_reserve(&self, bytes: usize) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.used = state.used.saturating_add(bytes);
        state.peak = state.peak.max(state.used);
        if let Some(parent) = &self.parent {
            parent.force_reserve(bytes);
        }
    }

    pub fn release(&self, bytes: usize) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let released = bytes.min(state.used);
        state.used -= released;
        if let Some(parent) = &self.parent {
            parent.release(released);
        }
    }

    pub fn used(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).used
    }

    pub fn peak(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).peak
    }

    pub fn available(&self) -> usize {
        self.limit.saturating_sub(self.used())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn reserve_respects_limit() {
        let budget = MemoryBudget::new("join", 100);
        assert!(budget.try_reserve(60));
        assert!(!budget.try_reserve(41));
        assert_eq!(budget.used(), 60);
        assert!(budget.try_reserve(40));
        budget.release(70);
        assert_eq!(budget.used(), 30);
        assert_eq!(budget.peak(), 100);
        assert_eq!(budget.available(), 70);
    }

    #[test]
    fn child_reservations_charge_parent() {
        let query = Arc::new(MemoryBudget::new("query", 100));
        let join = MemoryBudget::new_child("join", 80, &query);
        let agg = MemoryBudget::new_child("agg", 80, &query);
        assert!(join.try_reserve(70));
        // Fits the child limit but not what is left of the parent.
        assert!(!agg.try_reserve(40));
        assert_eq!(agg.used(), 0);
        assert!(agg.try_reserve(30));
        assert_eq!(query.used(), 100);
        join.release(500);
        assert_eq!(join.used(), 0);
        assert_eq!(query.used(), 30);
        agg.force_reserve(200);
        assert_eq!(query.used(), 230);
        assert_eq!(query.peak(), 230);
    }

    #[test]
    fn concurrent_reservations_never_exceed_limit() {
        let budget = Arc::new(MemoryBudget::new("agg", 1000));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let budget = Arc::clone(&budget);
                std::thread::spawn(move || {
                    let mut granted = 0usize;
                    for _ in 0..100 {
                        if budget.try_reserve(7) {
                            granted += 7;
                        }
                    }
                    granted
                })
            })
            .collect();
        let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert!(total <= 1000);
        assert_eq!(total, budget.used());
        assert!(budget.peak() <= 1000);
    }
}
