//! Per-(event, subscription) delivery state machine.
//!
//! ```text
//!            success                       success
//! Pending ───────────► Delivered ◄─────────────────┐
//!    │                                             │
//!    │ failure (attempt < max)                     │
//!    ▼                                             │
//! Retrying(1) ──► Retrying(2) ──► … ──► Retrying(n)┘
//!    │                                    │
//!    └──── failure (attempt == max) ──────┴──► DeadLettered
//! ```
//!
//! `Retrying(n)` means `n` attempts have failed and attempt `n + 1` is due.
//! `Delivered` and `DeadLettered` are terminal.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use uuid::Uuid;

/// Rejected transition out of a terminal state.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Delivery already retired as {0}")]
pub struct DeliveryError(pub DeliveryState);

/// Delivery progress of one event to one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryState {
    /// Matched, no attempt finished yet
    Pending,
    /// `n` attempts failed, another one is due
    Retrying(u32),
    /// An attempt succeeded
    Delivered,
    /// Every allowed attempt failed; the envelope went to the dead-letter target
    DeadLettered,
}

impl DeliveryState {
    /// Whether no further transition is possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Delivered | Self::DeadLettered)
    }

    /// Number of the attempt that is due, starting at 1.
    #[must_use]
    pub const fn next_attempt(self) -> Option<u32> {
        match self {
            Self::Pending => Some(1),
            Self::Retrying(failed) => Some(failed.saturating_add(1)),
            Self::Delivered | Self::DeadLettered => None,
        }
    }

    /// Transition after a successful attempt.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError`] if the delivery is already retired.
    pub const fn on_success(self) -> Result<Self, DeliveryError> {
        if self.is_terminal() {
            return Err(DeliveryError(self));
        }
        Ok(Self::Delivered)
    }

    /// Transition after a failed attempt, given the subscription's attempt bound.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError`] if the delivery is already retired.
    pub const fn on_failure(self, max_attempts: u32) -> Result<Self, DeliveryError> {
        let Some(attempt) = self.next_attempt() else {
            return Err(DeliveryError(self));
        };
        if attempt >= max_attempts {
            Ok(Self::DeadLettered)
        } else {
            Ok(Self::Retrying(attempt))
        }
    }
}

impl fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => f.write_str("pending"),
            Self::Retrying(n) => write!(f, "retrying({n})"),
            Self::Delivered => f.write_str("delivered"),
            Self::DeadLettered => f.write_str("dead_lettered"),
        }
    }
}

type LedgerKey = (Uuid, Arc<str>);

#[derive(Debug, Default)]
struct LedgerInner {
    states: HashMap<LedgerKey, DeliveryState>,
    retired: VecDeque<LedgerKey>,
}

/// Observable record of delivery states.
///
/// In-flight deliveries are always kept; retired ones are kept up to
/// `capacity`, oldest evicted first.
#[derive(Debug)]
pub struct DeliveryLedger {
    inner: Mutex<LedgerInner>,
    capacity: usize,
}

impl DeliveryLedger {
    /// Create a ledger retaining at most `capacity` retired deliveries.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(LedgerInner::default()),
            capacity,
        }
    }

    /// Record the current state of a delivery.
    pub fn record(&self, event_id: Uuid, subscription: &Arc<str>, state: DeliveryState) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let key = (event_id, Arc::clone(subscription));
        inner.states.insert(key.clone(), state);

        if state.is_terminal() {
            inner.retired.push_back(key);
            while inner.retired.len() > self.capacity {
                let Some(evicted) = inner.retired.pop_front() else {
                    break;
                };
                if inner.states.get(&evicted).is_some_and(|s| s.is_terminal()) {
                    inner.states.remove(&evicted);
                }
            }
        }
    }

    /// Last recorded state of a delivery, if still retained.
    #[must_use]
    pub fn get(&self, event_id: Uuid, subscription: &str) -> Option<DeliveryState> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let key: LedgerKey = (event_id, Arc::from(subscription));
        inner.states.get(&key).copied()
    }
}
