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
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::common::ids::QueryId;
use crate::common::status::{Status, StatusResult};
use crate::exec::runtime_filter::{RuntimeFilterDesc, RuntimeFilterMode};
use crate::graceflow_logging::info;
use crate::runtime::mem_tracker::MemoryBudget;
use crate::runtime::runtime_filter_bank::RuntimeFilterBank;
use crate::runtime::runtime_filter_coordinator::RuntimeFilterCoordinator;
use crate::runtime::runtime_filter_transport::FilterTransport;

/// Shared cancellation flag polled by operators between chunks.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn check(&self) -> StatusResult<()> {
        if self.is_cancelled() {
            return Err(Status::cancelled("query cancelled"));
        }
        Ok(())
    }
}

pub struct QueryContext {
    query_id: QueryId,
    cancel: CancelToken,
    mem_budget: Arc<MemoryBudget>,
    coordinator: Mutex<Option<Arc<RuntimeFilterCoordinator>>>,
    banks: Mutex<Vec<Arc<RuntimeFilterBank>>>,
}

impl QueryContext {
    pub fn new(query_id: QueryId, mem_limit: usize) -> Self {
        let label = format!("query_{:x}_{:x}", query_id.hi, query_id.lo);
        Self {
            query_id,
            cancel: CancelToken::new(),
            mem_budget: Arc::new(MemoryBudget::new(label, mem_limit)),
            coordinator: Mutex::new(None),
            banks: Mutex::new(Vec::new()),
        }
    }

    pub fn query_id(&self) -> QueryId {
        self.query_id
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn mem_budget(&self) -> Arc<MemoryBudget> {
        Arc::clone(&self.mem_budget)
    }

    /// Opens the coordinator for this query's cluster-wide filters.
    pub fn open_runtime_filters(
        &self,
        descs: Vec<RuntimeFilterDesc>,
        mode: RuntimeFilterMode,
        transport: Arc<dyn FilterTransport>,
    ) -> StatusResult<Arc<RuntimeFilterCoordinator>> {
        let mut guard = self.coordinator.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_some() {
            return Err(Status::illegal_state(format!(
                "runtime filters already opened for query {}",
                self.query_id
            )));
        }
        let coordinator = RuntimeFilterCoordinator::open(self.query_id, descs, mode, transport)?;
        if self.cancel.is_cancelled() {
            coordinator.cancel();
        }
        *guard = Some(Arc::clone(&coordinator));
        Ok(coordinator)
    }

    pub fn runtime_filter_coordinator(&self) -> Option<Arc<RuntimeFilterCoordinator>> {
        self.coordinator
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Ties a worker bank to this query so cancellation reaches its waiters.
    pub fn attach_bank(&self, bank: Arc<RuntimeFilterBank>) {
        if self.cancel.is_cancelled() {
            bank.cancel();
        }
        self.banks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(bank);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        info!("query cancelled: query_id={}", self.query_id);
        if let Some(coordinator) = self.runtime_filter_coordinator() {
            coordinator.cancel();
        }
        let banks = self.banks.lock().unwrap_or_else(|e| e.into_inner()).clone();
        for bank in banks {
            bank.cancel();
        }
    }

    pub fn close(&self) {
        if let Some(coordinator) = self.runtime_filter_coordinator() {
            coordinator.close();
        }
        self.banks.lock().unwrap_or_else(|e| e.into_inner()).clear();
        info!(
            "query closed: query_id={} peak_memory={}",
            self.query_id,
            self.mem_budget.peak()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_token_reports_cancelled_status() {
        let ctx = QueryContext::new(QueryId::new(1, 2), 1024);
        let token = ctx.cancel_token();
        assert!(token.check().is_ok());
        ctx.cancel();
        let err = token.check().unwrap_err();
        assert!(err.is_cancelled());
        assert!(ctx.is_cancelled());
    }

    #[test]
    fn mem_budget_uses_query_label() {
        let ctx = QueryContext::new(QueryId::new(0xa, 0xb), 64);
        assert_eq!(ctx.mem_budget().label(), "query_a_b");
        assert_eq!(ctx.mem_budget().limit(), 64);
    }
}
