//! Transform stage: deterministic normalization of extracted rows.
//!
//! [`NormalizationSchema`] is a pure function from a row payload to a
//! normalized item. [`TransformWorker`] applies it to every extraction event
//! it is handed and publishes exactly one transform event carrying the same
//! correlation id. The worker never retries on its own; failures go back to
//! the router, which owns the retry and dead-letter policy.

use chrono::{NaiveDate, NaiveDateTime};
use rowflow_core::BoxFuture;
use rowflow_core::environment::{Clock, SystemClock};
use rowflow_core::event::{CorrelationId, Event, Status};
use rowflow_core::event_bus::EventPublisher;
use rowflow_core::handler::{EventHandler, HandlerError};
use rowflow_core::record::ID_FIELD;
use rowflow_runtime::metrics::WorkerMetrics;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::sync::Arc;
use thiserror::Error;

/// Output layout of normalized dates.
pub const DATE_OUTPUT_FORMAT: &str = "%Y-%m-%d";

/// Why a payload cannot be normalized.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransformError {
    /// The payload is not a JSON object
    #[error("Payload is not an object")]
    NotAnObject,

    /// A required field is absent or empty
    #[error("Required field '{0}' is missing")]
    MissingField(String),

    /// A declared field does not parse as its kind
    #[error("Field '{field}' is not a valid {kind}: {value}")]
    InvalidValue {
        /// Normalized field name
        field: String,
        /// Expected kind
        kind: &'static str,
        /// Offending value
        value: String,
    },
}

/// Target type of a declared field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldKind {
    /// Kept as a string
    Text,
    /// Signed 64-bit integer
    Integer,
    /// Finite float
    Float,
    /// `true/false`, `yes/no`, `1/0`
    Boolean,
    /// Date or timestamp in `input_format`, emitted as `YYYY-MM-DD`
    Date {
        /// chrono `strftime` layout of the input
        input_format: String,
    },
}

impl FieldKind {
    const fn name(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Boolean => "boolean",
            Self::Date { .. } => "date",
        }
    }

    fn coerce(&self, field: &str, value: Value) -> Result<Value, TransformError> {
        let invalid = |value: &Value| TransformError::InvalidValue {
            field: field.to_string(),
            kind: self.name(),
            value: match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            },
        };

        let coerced = match (self, &value) {
            (_, Value::Null) => Some(Value::Null),
            (Self::Text, Value::String(_)) => Some(value.clone()),
            (Self::Text, other) => Some(Value::String(other.to_string())),
            (Self::Integer, Value::Number(n)) if n.is_i64() => Some(value.clone()),
            (Self::Integer, Value::String(s)) => s.parse::<i64>().ok().map(Value::from),
            (Self::Float, Value::Number(n)) => n.as_f64().and_then(Number::from_f64).map(Value::Number),
            (Self::Float, Value::String(s)) => s
                .parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number),
            (Self::Boolean, Value::Bool(_)) => Some(value.clone()),
            (Self::Boolean, Value::String(s)) => parse_bool(s).map(Value::Bool),
            (Self::Date { input_format }, Value::String(s)) => {
                parse_date(s, input_format).map(|d| Value::String(d.format(DATE_OUTPUT_FORMAT).to_string()))
            }
            _ => None,
        };
        coerced.ok_or_else(|| invalid(&value))
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.to_ascii_lowercase().as_str() {
        "true" | "yes" | "y" | "1" => Some(true),
        "false" | "no" | "n" | "0" => Some(false),
        _ => None,
    }
}

fn parse_date(s: &str, format: &str) -> Option<NaiveDate> {
    NaiveDateTime::parse_from_str(s, format)
        .map(|dt| dt.date())
        .or_else(|_| NaiveDate::parse_from_str(s, format))
        .ok()
}

/// A declared field of the schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    /// Normalized field name
    pub name: String,
    /// Target type
    #[serde(flatten)]
    pub kind: FieldKind,
    /// Missing or empty values fail the transform
    #[serde(default)]
    pub required: bool,
}

impl FieldSpec {
    /// An optional field.
    #[must_use]
    pub fn optional(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
        }
    }

    /// A required field.
    #[must_use]
    pub fn required(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            required: true,
            ..Self::optional(name, kind)
        }
    }
}

/// A field computed from other normalized fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Derived {
    /// `ceil(numerator / denominator)` as an integer; null when either side
    /// is absent or the denominator is zero
    RatioCeil {
        /// Output field
        name: String,
        /// Numerator field
        numerator: String,
        /// Denominator field
        denominator: String,
    },
}

impl Derived {
    #[allow(clippy::cast_possible_truncation)]
    fn apply(&self, item: &mut Map<String, Value>) {
        match self {
            Self::RatioCeil {
                name,
                numerator,
                denominator,
            } => {
                let n = item.get(numerator).and_then(Value::as_f64);
                let d = item.get(denominator).and_then(Value::as_f64);
                let value = match (n, d) {
                    (Some(n), Some(d)) if d != 0.0 => {
                        let ratio = (n / d).ceil();
                        if ratio.is_finite() {
                            Value::from(ratio as i64)
                        } else {
                            Value::Null
                        }
                    }
                    _ => Value::Null,
                };
                item.insert(name.clone(), value);
            }
        }
    }
}

/// Where the normalized item's `id` comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdSource {
    /// Copy this (normalized) field into `id`; a missing value fails the transform
    Field(String),
    /// Use the correlation id, for inputs without a natural key
    CorrelationId,
}

impl Default for IdSource {
    fn default() -> Self {
        Self::Field(ID_FIELD.to_string())
    }
}

/// Deterministic row normalization.
///
/// Applied in order:
/// 1. keys are trimmed, lowercased, and inner spaces or dashes become `_`
/// 2. string values are trimmed; empty strings become `null`
/// 3. declared fields are coerced to their kind; required ones must be non-null
/// 4. derived fields are computed
/// 5. `id` is set from the [`IdSource`]
///
/// The default schema declares nothing and takes `id` from the `id` column.
///
/// # Example
///
/// ```
/// use rowflow_core::event::CorrelationId;
/// use rowflow_workers::transform::NormalizationSchema;
/// use serde_json::json;
///
/// let schema = NormalizationSchema::default();
/// let item = schema
///     .apply(&json!({" ID ": "1", "Val": " a "}), &CorrelationId::new("c"))
///     .unwrap();
/// assert_eq!(item, json!({"id": "1", "val": "a"}));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizationSchema {
    /// Declared fields
    pub fields: Vec<FieldSpec>,
    /// Computed fields
    pub derived: Vec<Derived>,
    /// Source of the `id`
    pub id_source: IdSource,
}

impl NormalizationSchema {
    /// Schema for the real-estate sales export the pipeline was first built for.
    ///
    /// Sale dates arrive as `Wed May 21 00:00:00 EDT 2008` and are reduced to
    /// the calendar date; `price_per_sq_ft` is `ceil(price / sq__ft)`. Rows
    /// carry no natural key, so the correlation id becomes the record id.
    #[must_use]
    pub fn real_estate() -> Self {
        use FieldKind::{Float, Integer, Text};
        Self {
            fields: vec![
                FieldSpec::optional("street", Text),
                FieldSpec::optional("city", Text),
                FieldSpec::optional("zip", Text),
                FieldSpec::optional("state", Text),
                FieldSpec::optional("beds", Integer),
                FieldSpec::optional("baths", Integer),
                FieldSpec::required("sq__ft", Integer),
                FieldSpec::optional("type", Text),
                FieldSpec::required(
                    "sale_date",
                    FieldKind::Date {
                        input_format: "%a %b %e %H:%M:%S %Z %Y".to_string(),
                    },
                ),
                FieldSpec::required("price", Integer),
                FieldSpec::optional("latitude", Float),
                FieldSpec::optional("longitude", Float),
            ],
            derived: vec![Derived::RatioCeil {
                name: "price_per_sq_ft".to_string(),
                numerator: "price".to_string(),
                denominator: "sq__ft".to_string(),
            }],
            id_source: IdSource::CorrelationId,
        }
    }

    /// Normalize one row payload.
    ///
    /// # Errors
    ///
    /// Returns [`TransformError`] when the payload is not an object, a
    /// required field or the id is missing, or a declared field does not
    /// parse as its kind.
    pub fn apply(
        &self,
        payload: &Value,
        correlation_id: &CorrelationId,
    ) -> Result<Value, TransformError> {
        let Value::Object(row) = payload else {
            return Err(TransformError::NotAnObject);
        };

        let mut item: Map<String, Value> = row
            .iter()
            .map(|(k, v)| (normalize_key(k), normalize_value(v)))
            .collect();

        for spec in &self.fields {
            let value = item.remove(&spec.name).unwrap_or(Value::Null);
            let value = spec.kind.coerce(&spec.name, value)?;
            if spec.required && value.is_null() {
                return Err(TransformError::MissingField(spec.name.clone()));
            }
            item.insert(spec.name.clone(), value);
        }

        for derived in &self.derived {
            derived.apply(&mut item);
        }

        let id = match &self.id_source {
            IdSource::Field(field) => item
                .get(field.as_str())
                .filter(|v| !v.is_null())
                .cloned()
                .ok_or_else(|| TransformError::MissingField(field.clone()))?,
            IdSource::CorrelationId => Value::String(correlation_id.as_str().to_string()),
        };
        item.insert(ID_FIELD.to_string(), id);

        Ok(Value::Object(item))
    }
}

fn normalize_key(key: &str) -> String {
    key.trim()
        .to_lowercase()
        .chars()
        .map(|c| if c == ' ' || c == '-' { '_' } else { c })
        .collect()
}

fn normalize_value(value: &Value) -> Value {
    match value {
        Value::String(s) if s.trim().is_empty() => Value::Null,
        Value::String(s) => Value::String(s.trim().to_string()),
        other => other.clone(),
    }
}

/// Handler of the transform subscription.
pub struct TransformWorker {
    schema: Arc<NormalizationSchema>,
    publisher: Arc<dyn EventPublisher>,
    clock: Arc<dyn Clock>,
}

impl TransformWorker {
    /// Create a worker publishing transform events through `publisher`.
    #[must_use]
    pub fn new(schema: NormalizationSchema, publisher: Arc<dyn EventPublisher>) -> Self {
        Self {
            schema: Arc::new(schema),
            publisher,
            clock: Arc::new(SystemClock),
        }
    }

    /// Stamp events with `clock`.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The schema applied to every row.
    #[must_use]
    pub fn schema(&self) -> &NormalizationSchema {
        &self.schema
    }

    async fn transform(&self, event: &Event) -> Result<(), HandlerError> {
        if event.status() != Status::RowSent {
            return Err(HandlerError::permanent(format!(
                "transform worker cannot handle {}",
                event.routing_key()
            )));
        }

        let item = match self.schema.apply(event.payload(), event.correlation_id()) {
            Ok(item) => item,
            Err(e) => {
                WorkerMetrics::record_transform("rejected");
                return Err(HandlerError::permanent(e.to_string()));
            }
        };

        let transformed =
            Event::transformed(event.correlation_id().clone(), item, self.clock.as_ref());
        let transformed_id = transformed.id();
        self.publisher
            .publish(transformed)
            .await
            .map_err(|e| HandlerError::transient(format!("publish failed: {e}")))?;

        WorkerMetrics::record_transform("transformed");
        tracing::debug!(
            event_id = %event.id(),
            transformed_event_id = %transformed_id,
            correlation_id = %event.correlation_id(),
            "Row transformed"
        );
        Ok(())
    }
}

impl EventHandler for TransformWorker {
    fn name(&self) -> &str {
        "transform-worker"
    }

    fn handle<'a>(&'a self, event: &'a Event) -> BoxFuture<'a, Result<(), HandlerError>> {
        Box::pin(self.transform(event))
    }
}

impl std::fmt::Debug for TransformWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformWorker")
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rowflow_core::handler::FailureKind;
    use rowflow_testing::{RecordingPublisher, test_clock};
    use serde_json::json;

    fn cid() -> CorrelationId {
        CorrelationId::new("row-7")
    }

    fn sale() -> Value {
        json!({
            "street": "3526 HIGH ST",
            "city": "SACRAMENTO",
            "zip": "95838",
            "state": "CA",
            "beds": "2",
            "baths": "1",
            "sq__ft": "836",
            "type": "Residential",
            "sale_date": "Wed May 21 00:00:00 EDT 2008",
            "price": "59222",
            "latitude": "38.631913",
            "longitude": "-121.434879"
        })
    }

    #[test]
    fn default_schema_normalizes_keys_and_blanks() {
        let item = NormalizationSchema::default()
            .apply(&json!({"Id": "1", "Sale Date": "x", "zip-code": "", "val": " a "}), &cid())
            .unwrap();

        assert_eq!(
            item,
            json!({"id": "1", "sale_date": "x", "zip_code": null, "val": "a"})
        );
    }

    #[test]
    fn default_schema_requires_id() {
        let err = NormalizationSchema::default()
            .apply(&json!({"id": "  ", "val": "b"}), &cid())
            .unwrap_err();
        assert_eq!(err, TransformError::MissingField("id".to_string()));

        assert_eq!(
            NormalizationSchema::default().apply(&json!(["id"]), &cid()),
            Err(TransformError::NotAnObject)
        );
    }

    #[test]
    fn real_estate_matches_legacy_transform() {
        let item = NormalizationSchema::real_estate().apply(&sale(), &cid()).unwrap();

        assert_eq!(item["id"], json!("row-7"));
        assert_eq!(item["sale_date"], json!("2008-05-21"));
        assert_eq!(item["price"], json!(59222));
        assert_eq!(item["sq__ft"], json!(836));
        assert_eq!(item["beds"], json!(2));
        assert_eq!(item["price_per_sq_ft"], json!(71));
        assert_eq!(item["latitude"], json!(38.631913));
        assert_eq!(item["zip"], json!("95838"));
    }

    #[test]
    fn zero_area_gives_null_ratio() {
        let mut row = sale();
        row["sq__ft"] = json!("0");

        let item = NormalizationSchema::real_estate().apply(&row, &cid()).unwrap();
        assert_eq!(item["price_per_sq_ft"], Value::Null);
    }

    #[test]
    fn invalid_declared_field_is_rejected() {
        let mut row = sale();
        row["price"] = json!("cheap");

        let err = NormalizationSchema::real_estate().apply(&row, &cid()).unwrap_err();
        assert_eq!(
            err,
            TransformError::InvalidValue {
                field: "price".to_string(),
                kind: "integer",
                value: "cheap".to_string(),
            }
        );

        let mut row = sale();
        row["sale_date"] = json!("");
        assert_eq!(
            NormalizationSchema::real_estate().apply(&row, &cid()),
            Err(TransformError::MissingField("sale_date".to_string()))
        );
    }

    #[test]
    fn schema_deserializes_from_config() {
        let schema = schema_from_json(
            r#"{
                "fields": [
                    {"name": "price", "kind": "integer", "required": true},
                    {"name": "sold", "kind": "date", "input_format": "%d/%m/%Y"},
                    {"name": "active", "kind": "boolean"}
                ],
                "id_source": "correlation_id"
            }"#,
        );

        let item = schema
            .apply(&json!({"price": "10", "sold": "02/01/2024", "active": "Yes"}), &cid())
            .unwrap();
        assert_eq!(
            item,
            json!({"id": "row-7", "price": 10, "sold": "2024-01-02", "active": true})
        );
    }

    fn schema_from_json(json: &str) -> NormalizationSchema {
        serde_json::from_str(json).unwrap()
    }

    #[tokio::test]
    async fn worker_publishes_one_event_with_same_correlation_id() {
        let publisher = RecordingPublisher::new();
        let worker = TransformWorker::new(NormalizationSchema::default(), Arc::new(publisher.clone()))
            .with_clock(Arc::new(test_clock()));
        let row = Event::extraction(cid(), json!({"id": "1", "val": "a"}), &test_clock());

        worker.handle(&row).await.unwrap();

        let events = publisher.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status(), Status::ItemTransformed);
        assert_eq!(events[0].correlation_id(), row.correlation_id());
        assert_eq!(events[0].payload(), &json!({"id": "1", "val": "a"}));
        assert_eq!(events[0].time(), test_clock().now());
    }

    #[tokio::test]
    async fn malformed_row_is_permanent_failure() {
        let publisher = RecordingPublisher::new();
        let worker = TransformWorker::new(NormalizationSchema::default(), Arc::new(publisher.clone()));
        let row = Event::extraction(cid(), json!({"val": "a"}), &SystemClock);

        let err = worker.handle(&row).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::Permanent);
        assert!(publisher.is_empty());
    }

    #[tokio::test]
    async fn closed_bus_is_transient_failure() {
        let publisher = RecordingPublisher::new();
        publisher.close();
        let worker = TransformWorker::new(NormalizationSchema::default(), Arc::new(publisher));
        let row = Event::extraction(cid(), json!({"id": "1"}), &SystemClock);

        assert_eq!(
            worker.handle(&row).await.unwrap_err().kind(),
            FailureKind::Transient
        );
    }

    proptest! {
        #[test]
        fn default_normalization_is_idempotent(
            row in prop::collection::btree_map("[A-Za-z -]{1,8}", "[a-z ]{0,6}", 0..6),
            id in "[0-9]{1,4}",
        ) {
            let mut payload: Map<String, Value> =
                row.into_iter().map(|(k, v)| (k, Value::String(v))).collect();
            payload.retain(|k, _| normalize_key(k) != ID_FIELD);
            payload.insert("id".to_string(), Value::String(id));
            let schema = NormalizationSchema::default();

            let once = schema.apply(&Value::Object(payload), &cid()).unwrap();
            let twice = schema.apply(&once, &cid()).unwrap();
            prop_assert_eq!(once, twice);
        }
    }
}
