//! # Rowflow Testing
//!
//! Testing utilities and helpers for the rowflow ETL pipeline.
//!
//! This crate provides:
//! - In-memory implementations of the collaborator traits
//! - Scripted handlers and publishers for router tests
//! - A fixed clock for deterministic timestamps
//! - proptest strategies for records and rows
//!
//! ## Example
//!
//! ```ignore
//! use rowflow_testing::{InMemoryRecordStore, RecordingPublisher, test_clock};
//!
//! #[tokio::test]
//! async fn load_is_idempotent() {
//!     let store = Arc::new(InMemoryRecordStore::new());
//!     let worker = LoadWorker::new(store.clone());
//!
//!     worker.handle(&event).await.unwrap();
//!     worker.handle(&event).await.unwrap();
//!
//!     assert_eq!(store.len(), 1);
//! }
//! ```

use chrono::{DateTime, Utc};
use rowflow_core::environment::Clock;

pub mod bus;
pub mod stores;

/// Mock implementations for testing.
pub mod mocks {
    use super::{Clock, DateTime, Utc};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use rowflow_testing::mocks::FixedClock;
    /// use rowflow_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(DateTime::<Utc>::UNIX_EPOCH + chrono::Duration::days(20_089))
    }
}

/// Property-based testing strategies.
pub mod properties {
    use proptest::prelude::*;
    use rowflow_core::record::Record;
    use serde_json::{Map, Value};

    /// Small record ids, so generated batches collide often.
    pub fn record_id() -> impl Strategy<Value = String> {
        (0u8..8).prop_map(|n| n.to_string())
    }

    /// Attribute maps with string or null values.
    pub fn attributes() -> impl Strategy<Value = Map<String, Value>> {
        prop::collection::btree_map(
            "[a-z]{1,6}",
            prop::option::of("[a-z0-9 ]{0,8}"),
            0..4,
        )
        .prop_filter("id is the partition key", |m| !m.contains_key("id"))
        .prop_map(|m| {
            m.into_iter()
                .map(|(k, v)| (k, v.map_or(Value::Null, Value::String)))
                .collect()
        })
    }

    /// Arbitrary records.
    pub fn record() -> impl Strategy<Value = Record> {
        (record_id(), attributes()).prop_map(|(id, attributes)| Record::new(id, attributes))
    }
}

pub use bus::{FailingDeadLetterTarget, RecordingPublisher, ScriptedHandler};
pub use mocks::{FixedClock, test_clock};
pub use stores::{InMemoryObjectStore, InMemoryRecordStore};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_is_new_year_2025() {
        let clock = test_clock();
        assert_eq!(clock.now().to_rfc3339(), "2025-01-01T00:00:00+00:00");
        assert_eq!(clock.now(), clock.now());
    }
}
