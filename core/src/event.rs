//! Event model for the ingestion → transform → load pipeline.
//!
//! Every message on the bus is an [`Event`]: an immutable envelope whose
//! `source`, `detailType` and `detail.status` together form the routing key.
//! Payloads are free-form JSON; the envelope fields are strongly typed so that
//! a status can never be attached to a detail type it does not belong to.
//!
//! # Wire format
//!
//! ```text
//! {
//!   "id": "…", "time": "…",
//!   "source": "ingestion",
//!   "detailType": "extraction-process",
//!   "detail": { "status": "row_sent", "correlationId": "…", "payload": { … } }
//! }
//! ```
//!
//! # Example
//!
//! ```
//! use rowflow_core::environment::SystemClock;
//! use rowflow_core::event::{CorrelationId, DetailType, Event, Status};
//!
//! let event = Event::extraction(
//!     CorrelationId::new("row-1"),
//!     serde_json::json!({ "id": "1", "val": "a" }),
//!     &SystemClock,
//! );
//! assert_eq!(event.detail_type(), DetailType::ExtractionProcess);
//! assert_eq!(event.status(), Status::RowSent);
//! ```

use crate::environment::Clock;
use crate::object_store::ObjectRef;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Namespace for deterministic per-row correlation ids.
const ROW_NAMESPACE: Uuid = Uuid::from_u128(0x6f0c_2d1e_8a4b_4c55_9e3a_7d2f_1b6c_5a90);

/// Error types for event construction and decoding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    /// The source is not one of the known publishers.
    #[error("Unknown source: {0}")]
    UnknownSource(String),

    /// The detail type is not one of the known contracts.
    #[error("Unknown detail type: {0}")]
    UnknownDetailType(String),

    /// The status is not one of the known statuses.
    #[error("Unknown status: {0}")]
    UnknownStatus(String),

    /// The status belongs to a different detail type.
    #[error("Status '{status}' is not valid for detail type '{detail_type}'")]
    StatusMismatch {
        /// Detail type of the event
        detail_type: DetailType,
        /// Status that was supplied
        status: Status,
    },

    /// The wire bytes could not be decoded into an event.
    #[error("Malformed event: {0}")]
    Malformed(String),

    /// The event could not be encoded to wire bytes.
    #[error("Failed to serialize event: {0}")]
    SerializationError(String),
}

/// Publisher of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Source {
    /// The ingestion worker
    #[serde(rename = "ingestion")]
    Ingestion,
    /// The transform worker
    #[serde(rename = "transform")]
    Transform,
}

impl Source {
    /// Every known source.
    pub const ALL: [Self; 2] = [Self::Ingestion, Self::Transform];

    /// Wire representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ingestion => "ingestion",
            Self::Transform => "transform",
        }
    }
}

impl FromStr for Source {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|v| v.as_str() == s)
            .ok_or_else(|| EventError::UnknownSource(s.to_string()))
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Contract an event conforms to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DetailType {
    /// One parsed row extracted from an uploaded object
    #[serde(rename = "extraction-process")]
    ExtractionProcess,
    /// One normalized item produced by the transform stage
    #[serde(rename = "transform-process")]
    TransformProcess,
}

impl DetailType {
    /// Every known detail type.
    pub const ALL: [Self; 2] = [Self::ExtractionProcess, Self::TransformProcess];

    /// Wire representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ExtractionProcess => "extraction-process",
            Self::TransformProcess => "transform-process",
        }
    }
}

impl FromStr for DetailType {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|v| v.as_str() == s)
            .ok_or_else(|| EventError::UnknownDetailType(s.to_string()))
    }
}

impl fmt::Display for DetailType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of an event, drawn from a fixed set per [`DetailType`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    /// A row was extracted and sent
    #[serde(rename = "row_sent")]
    RowSent,
    /// An item was normalized
    #[serde(rename = "item_transformed")]
    ItemTransformed,
}

impl Status {
    /// Every known status.
    pub const ALL: [Self; 2] = [Self::RowSent, Self::ItemTransformed];

    /// Wire representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RowSent => "row_sent",
            Self::ItemTransformed => "item_transformed",
        }
    }

    /// The detail type this status belongs to.
    #[must_use]
    pub const fn detail_type(self) -> DetailType {
        match self {
            Self::RowSent => DetailType::ExtractionProcess,
            Self::ItemTransformed => DetailType::TransformProcess,
        }
    }
}

impl FromStr for Status {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|v| v.as_str() == s)
            .ok_or_else(|| EventError::UnknownStatus(s.to_string()))
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifier propagated unchanged across every event derived from one source row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Wrap an existing correlation id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Deterministic id for row `row` of `object`.
    ///
    /// The same object version and row position always produce the same id,
    /// so re-running ingestion republishes rows under their original ids.
    #[must_use]
    pub fn for_row(object: &ObjectRef, row: u64) -> Self {
        let name = format!("{}#{row}", object.identity());
        Self(Uuid::new_v5(&ROW_NAMESPACE, name.as_bytes()).to_string())
    }

    /// Borrow the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The routing key of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RoutingKey {
    /// Event source
    pub source: Source,
    /// Event detail type
    pub detail_type: DetailType,
    /// Event status
    pub status: Status,
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.source, self.detail_type, self.status)
    }
}

/// Body of an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detail {
    status: Status,
    #[serde(rename = "correlationId")]
    correlation_id: CorrelationId,
    payload: Value,
}

impl Detail {
    /// Event status.
    #[must_use]
    pub const fn status(&self) -> Status {
        self.status
    }

    /// Correlation id of the originating row.
    #[must_use]
    pub const fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    /// Row or item payload.
    #[must_use]
    pub const fn payload(&self) -> &Value {
        &self.payload
    }
}

/// An immutable domain event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawEvent")]
pub struct Event {
    id: Uuid,
    time: DateTime<Utc>,
    source: Source,
    #[serde(rename = "detailType")]
    detail_type: DetailType,
    detail: Detail,
}

/// Unvalidated mirror of [`Event`] used during deserialization.
#[derive(Deserialize)]
struct RawEvent {
    #[serde(default = "Uuid::new_v4")]
    id: Uuid,
    #[serde(default = "Utc::now")]
    time: DateTime<Utc>,
    source: Source,
    #[serde(rename = "detailType")]
    detail_type: DetailType,
    detail: Detail,
}

impl TryFrom<RawEvent> for Event {
    type Error = EventError;

    fn try_from(raw: RawEvent) -> Result<Self, Self::Error> {
        check_status(raw.detail_type, raw.detail.status)?;
        Ok(Self {
            id: raw.id,
            time: raw.time,
            source: raw.source,
            detail_type: raw.detail_type,
            detail: raw.detail,
        })
    }
}

fn check_status(detail_type: DetailType, status: Status) -> Result<(), EventError> {
    if status.detail_type() == detail_type {
        Ok(())
    } else {
        Err(EventError::StatusMismatch {
            detail_type,
            status,
        })
    }
}

impl Event {
    /// Create an event, validating that `status` belongs to `detail_type`.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::StatusMismatch`] if the status is not valid for
    /// the detail type.
    pub fn new(
        source: Source,
        detail_type: DetailType,
        status: Status,
        correlation_id: CorrelationId,
        payload: Value,
        clock: &dyn Clock,
    ) -> Result<Self, EventError> {
        check_status(detail_type, status)?;
        Ok(Self {
            id: Uuid::new_v4(),
            time: clock.now(),
            source,
            detail_type,
            detail: Detail {
                status,
                correlation_id,
                payload,
            },
        })
    }

    /// An `ingestion / extraction-process / row_sent` event carrying one parsed row.
    #[must_use]
    pub fn extraction(correlation_id: CorrelationId, row: Value, clock: &dyn Clock) -> Self {
        Self {
            id: Uuid::new_v4(),
            time: clock.now(),
            source: Source::Ingestion,
            detail_type: DetailType::ExtractionProcess,
            detail: Detail {
                status: Status::RowSent,
                correlation_id,
                payload: row,
            },
        }
    }

    /// A `transform / transform-process / item_transformed` event carrying one normalized item.
    #[must_use]
    pub fn transformed(correlation_id: CorrelationId, item: Value, clock: &dyn Clock) -> Self {
        Self {
            id: Uuid::new_v4(),
            time: clock.now(),
            source: Source::Transform,
            detail_type: DetailType::TransformProcess,
            detail: Detail {
                status: Status::ItemTransformed,
                correlation_id,
                payload: item,
            },
        }
    }

    /// Unique id of this event (not of the row it describes).
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// When the event was created.
    #[must_use]
    pub const fn time(&self) -> DateTime<Utc> {
        self.time
    }

    /// Publisher of the event.
    #[must_use]
    pub const fn source(&self) -> Source {
        self.source
    }

    /// Contract of the event.
    #[must_use]
    pub const fn detail_type(&self) -> DetailType {
        self.detail_type
    }

    /// Status of the event.
    #[must_use]
    pub const fn status(&self) -> Status {
        self.detail.status
    }

    /// Event body.
    #[must_use]
    pub const fn detail(&self) -> &Detail {
        &self.detail
    }

    /// Correlation id of the originating row.
    #[must_use]
    pub const fn correlation_id(&self) -> &CorrelationId {
        &self.detail.correlation_id
    }

    /// Row or item payload.
    #[must_use]
    pub const fn payload(&self) -> &Value {
        &self.detail.payload
    }

    /// The `(source, detailType, status)` routing key.
    #[must_use]
    pub const fn routing_key(&self) -> RoutingKey {
        RoutingKey {
            source: self.source,
            detail_type: self.detail_type,
            status: self.detail.status,
        }
    }

    /// Encode the event as JSON wire bytes.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::SerializationError`] if the payload cannot be encoded.
    pub fn to_wire(&self) -> Result<Vec<u8>, EventError> {
        serde_json::to_vec(self).map_err(|e| EventError::SerializationError(e.to_string()))
    }

    /// Decode and validate an event from JSON wire bytes.
    ///
    /// Missing `id` or `time` fields are filled in.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Malformed`] if the bytes are not a valid event,
    /// including a status that does not belong to the detail type.
    pub fn from_wire(bytes: &[u8]) -> Result<Self, EventError> {
        serde_json::from_slice(bytes).map_err(|e| EventError::Malformed(e.to_string()))
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Event {{ id: {}, route: {}, correlation_id: {} }}",
            self.id,
            self.routing_key(),
            self.detail.correlation_id
        )
    }
}
