//! Event bus test doubles.
//!
//! - [`RecordingPublisher`]: captures published events, optionally refusing them
//! - [`ScriptedHandler`]: a subscriber with scripted failures, delays and counters
//! - [`FailingDeadLetterTarget`]: a dead-letter target that never accepts a write

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Lock poisoning only follows a panicking test

use rowflow_core::BoxFuture;
use rowflow_core::dead_letter::{DeadLetterEnvelope, DeadLetterError, DeadLetterTarget};
use rowflow_core::event::Event;
use rowflow_core::event_bus::{EventBusError, EventPublisher};
use rowflow_core::handler::{EventHandler, FailureKind, HandlerError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

/// Publisher that records every event it accepts.
#[derive(Clone, Debug, Default)]
pub struct RecordingPublisher {
    events: Arc<Mutex<Vec<Event>>>,
    closed: Arc<AtomicBool>,
}

impl RecordingPublisher {
    /// Create an empty publisher
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every later publish with [`EventBusError::Closed`]
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Events accepted so far, in publish order
    #[must_use]
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    /// Number of events accepted so far
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    /// Whether nothing was published
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventPublisher for RecordingPublisher {
    fn publish(&self, event: Event) -> BoxFuture<'_, Result<(), EventBusError>> {
        Box::pin(async move {
            if self.closed.load(Ordering::SeqCst) {
                return Err(EventBusError::Closed);
            }
            self.events.lock().unwrap().push(event);
            Ok(())
        })
    }
}

type Predicate = Box<dyn Fn(&Event) -> bool + Send + Sync>;

/// Subscriber whose behaviour is scripted per event.
///
/// # Example
///
/// ```
/// use rowflow_testing::ScriptedHandler;
///
/// // Fails the first two attempts of every event, then succeeds.
/// let handler = ScriptedHandler::new("flaky").failing_first(2);
/// assert_eq!(handler.total_attempts(), 0);
/// ```
pub struct ScriptedHandler {
    name: String,
    fail_first: u32,
    fail_when: Option<Predicate>,
    failure_kind: FailureKind,
    delay: Duration,
    attempts: Mutex<HashMap<Uuid, u32>>,
    delivered: Mutex<Vec<Event>>,
    running: AtomicUsize,
    max_running: AtomicUsize,
}

impl ScriptedHandler {
    /// A handler that always succeeds immediately
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fail_first: 0,
            fail_when: None,
            failure_kind: FailureKind::Transient,
            delay: Duration::ZERO,
            attempts: Mutex::new(HashMap::new()),
            delivered: Mutex::new(Vec::new()),
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
        }
    }

    /// Fail the first `n` attempts of every event
    #[must_use]
    pub fn failing_first(mut self, n: u32) -> Self {
        self.fail_first = n;
        self
    }

    /// Fail every attempt for events matching `predicate`
    #[must_use]
    pub fn failing_when(mut self, predicate: impl Fn(&Event) -> bool + Send + Sync + 'static) -> Self {
        self.fail_when = Some(Box::new(predicate));
        self
    }

    /// Kind reported by scripted failures
    #[must_use]
    pub fn with_failure_kind(mut self, kind: FailureKind) -> Self {
        self.failure_kind = kind;
        self
    }

    /// Sleep this long inside every attempt
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Attempts made for one event
    #[must_use]
    pub fn attempts(&self, event_id: Uuid) -> u32 {
        self.attempts
            .lock()
            .unwrap()
            .get(&event_id)
            .copied()
            .unwrap_or(0)
    }

    /// Attempts made across all events
    #[must_use]
    pub fn total_attempts(&self) -> u32 {
        self.attempts.lock().unwrap().values().sum()
    }

    /// Events whose attempt succeeded, in completion order
    #[must_use]
    pub fn delivered(&self) -> Vec<Event> {
        self.delivered.lock().unwrap().clone()
    }

    /// Highest number of attempts that ran at the same time
    #[must_use]
    pub fn max_concurrent(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }
}

impl EventHandler for ScriptedHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn handle<'a>(&'a self, event: &'a Event) -> BoxFuture<'a, Result<(), HandlerError>> {
        Box::pin(async move {
            let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(running, Ordering::SeqCst);

            let attempt = {
                let mut attempts = self.attempts.lock().unwrap();
                let count = attempts.entry(event.id()).or_insert(0);
                *count += 1;
                *count
            };

            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.running.fetch_sub(1, Ordering::SeqCst);

            let scripted_failure = attempt <= self.fail_first
                || self.fail_when.as_ref().is_some_and(|predicate| predicate(event));
            if scripted_failure {
                return Err(HandlerError::new(
                    self.failure_kind,
                    format!("scripted failure on attempt {attempt}"),
                ));
            }

            self.delivered.lock().unwrap().push(event.clone());
            Ok(())
        })
    }
}

/// Dead-letter target that rejects every write.
#[derive(Debug, Default)]
pub struct FailingDeadLetterTarget {
    attempts: AtomicUsize,
}

impl FailingDeadLetterTarget {
    /// Create the target
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of writes attempted
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl DeadLetterTarget for FailingDeadLetterTarget {
    fn name(&self) -> &str {
        "failing-dlq"
    }

    fn send<'a>(
        &'a self,
        _envelope: &'a DeadLetterEnvelope,
    ) -> BoxFuture<'a, Result<(), DeadLetterError>> {
        Box::pin(async move {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(DeadLetterError::Unavailable("scripted outage".to_string()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowflow_core::environment::SystemClock;
    use rowflow_core::event::CorrelationId;
    use serde_json::json;

    fn event() -> Event {
        Event::extraction(CorrelationId::new("c"), json!({"id": "1"}), &SystemClock)
    }

    #[tokio::test]
    async fn failing_first_then_succeeds() {
        let handler = ScriptedHandler::new("h").failing_first(1);
        let event = event();

        assert!(handler.handle(&event).await.is_err());
        assert!(handler.handle(&event).await.is_ok());
        assert_eq!(handler.attempts(event.id()), 2);
        assert_eq!(handler.delivered().len(), 1);
    }

    #[tokio::test]
    async fn closed_publisher_rejects() {
        let publisher = RecordingPublisher::new();
        publisher.publish(event()).await.unwrap();
        publisher.close();

        assert_eq!(publisher.publish(event()).await, Err(EventBusError::Closed));
        assert_eq!(publisher.len(), 1);
    }
}
