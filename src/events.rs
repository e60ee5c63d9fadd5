//! Enforcement event stream.
//!
//! Decision paths publish events without blocking: the bus is a bounded
//! queue that drops the oldest entry on overflow, and a background task
//! drains it to the configured sink. Losing an event under pressure is
//! acceptable; stalling an admission check is not.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::decisions::RejectReason;
use crate::ledger::ScopeKey;
use crate::run::RunStatus;

/// Everything observable about enforcement, as a serializable stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GuardEvent {
    RunAdmitted {
        run_id: String,
        tenant_id: String,
        matched_budget_id: Option<String>,
        at: DateTime<Utc>,
    },
    RunRejected {
        run_id: String,
        tenant_id: String,
        reason: RejectReason,
        matched_budget_id: Option<String>,
        at: DateTime<Utc>,
    },
    RunCompleted {
        run_id: String,
        tenant_id: String,
        status: RunStatus,
        total_cost: Decimal,
        iterations: u32,
        tool_calls: u32,
        at: DateTime<Utc>,
    },
    RunHalted {
        run_id: String,
        tenant_id: String,
        reason: String,
        at: DateTime<Utc>,
    },
    ThresholdCrossed {
        scope_key: ScopeKey,
        budget_id: String,
        threshold: Decimal,
        consumed: Decimal,
        at: DateTime<Utc>,
    },
    HardLimitReached {
        scope_key: ScopeKey,
        budget_id: String,
        consumed: Decimal,
        at: DateTime<Utc>,
    },
    ModelDowngraded {
        run_id: String,
        stage: Option<String>,
        from_model: String,
        to_model: String,
        reason: String,
        at: DateTime<Utc>,
    },
}

/// Consumer of drained events.
pub trait EventSink: Send + Sync {
    fn deliver(&self, event: GuardEvent);
}

/// Default sink: structured log line per event.
#[derive(Debug, Default)]
pub struct LoggingSink;

impl EventSink for LoggingSink {
    fn deliver(&self, event: GuardEvent) {
        info!(target: "costguard::events", event = ?event, "guard event");
    }
}

/// Test sink that captures delivered events.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<GuardEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<GuardEvent> {
        match self.events.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }
}

impl EventSink for RecordingSink {
    fn deliver(&self, event: GuardEvent) {
        match self.events.lock() {
            Ok(mut guard) => guard.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}

/// Bounded, drop-oldest event queue.
pub struct EventBus {
    queue: Mutex<VecDeque<GuardEvent>>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            capacity: capacity.max(1),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueues an event, dropping the oldest one when full. Never blocks
    /// beyond the queue mutex.
    pub fn publish(&self, event: GuardEvent) {
        let mut queue = match self.queue.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if queue.len() >= self.capacity {
            queue.pop_front();
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped.is_power_of_two() {
                warn!(dropped, "event queue full, dropping oldest events");
            }
        }
        queue.push_back(event);
        drop(queue);
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<GuardEvent> {
        match self.queue.lock() {
            Ok(mut guard) => guard.pop_front(),
            Err(poisoned) => poisoned.into_inner().pop_front(),
        }
    }

    /// Waits until an event is available, then dequeues it.
    pub async fn next(&self) -> GuardEvent {
        loop {
            if let Some(event) = self.pop() {
                return event;
            }
            self.notify.notified().await;
        }
    }

    /// Drains whatever is queued right now, without waiting.
    pub fn drain_now(&self) -> Vec<GuardEvent> {
        match self.queue.lock() {
            Ok(mut guard) => guard.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        }
    }

    /// Total events lost to overflow.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        match self.queue.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .field("dropped", &self.dropped())
            .finish()
    }
}
