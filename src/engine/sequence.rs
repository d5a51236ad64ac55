use std::sync::Arc;

use chrono::NaiveDate;
use tokio::sync::Mutex;
use ulid::Ulid;

use crate::model::*;

use super::{CounterState, Engine, EngineError};

/// Human-readable booking code: `{dock_code}-{YYYYMMDD}-{seq:03}`.
pub fn booking_code(dock_code: &str, date: NaiveDate, sequence: u32) -> String {
    format!("{dock_code}-{}-{sequence:03}", date.format("%Y%m%d"))
}

impl Engine {
    /// Allocate the next sequence value for `key`, starting at 1.
    pub async fn next_sequence(&self, key: CounterKey) -> Result<SequenceAllocation, EngineError> {
        let _gate = self.compaction_gate.read().await;
        self.allocate_sequence(key).await
    }

    /// A mutex per counter identity is held across read, WAL append, and
    /// write-back, so concurrent callers for the same identity receive
    /// distinct consecutive values. Different identities never contend.
    /// A failed WAL append leaves the counter untouched.
    pub(super) async fn allocate_sequence(
        &self,
        key: CounterKey,
    ) -> Result<SequenceAllocation, EngineError> {
        let slot = self
            .counters
            .entry(key.clone())
            .or_insert_with(|| {
                Arc::new(Mutex::new(CounterState {
                    value: 0,
                    last_allocation: Ulid::nil(),
                }))
            })
            .value()
            .clone();

        let mut counter = slot.lock().await;
        let value = counter
            .value
            .checked_add(1)
            .ok_or_else(|| EngineError::SequenceAllocation("counter exhausted".into()))?;
        let allocation = SequenceAllocation {
            id: Ulid::new(),
            key,
            value,
        };

        self.wal_append(&Event::SequenceAllocated {
            allocation: allocation.clone(),
        })
        .await
        .map_err(|e| EngineError::SequenceAllocation(e.to_string()))?;

        counter.value = value;
        counter.last_allocation = allocation.id;
        metrics::counter!(crate::observability::SEQUENCE_ALLOCATIONS_TOTAL).increment(1);
        Ok(allocation)
    }

    /// Current value for `key` (0 when nothing was allocated yet).
    pub async fn current_sequence(&self, key: &CounterKey) -> u32 {
        let slot = match self.counters.get(key) {
            Some(entry) => entry.value().clone(),
            None => return 0,
        };
        let value = slot.lock().await.value;
        value
    }
}
