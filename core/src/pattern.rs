//! Declarative routing rules.
//!
//! An [`EventPattern`] is what a subscription is configured with: for each of
//! `source`, `detailType` and `status`, a list of accepted values. A field
//! matches when the event's value is one of the listed values, or when the list
//! is empty (wildcard). The pattern matches when every field matches.
//!
//! Patterns are compiled once, at registration, into a [`CompiledPattern`]
//! that evaluates events with three bit tests and no string handling.
//!
//! # Example
//!
//! ```
//! use rowflow_core::pattern::EventPattern;
//!
//! let pattern: EventPattern = serde_json::from_str(
//!     r#"{ "source": ["transform"], "detailType": ["transform-process"] }"#,
//! ).unwrap();
//!
//! let compiled = pattern.compile().unwrap();
//! assert_eq!(compiled.to_string(), "source=[transform] detailType=[transform-process] status=*");
//! ```

use crate::event::{DetailType, Event, EventError, Source, Status};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors raised while compiling a pattern.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PatternError {
    /// No field constrains the pattern
    #[error("Pattern has no predicates")]
    Empty,

    /// A listed value is not a known source, detail type or status
    #[error("Invalid pattern value: {0}")]
    UnknownValue(#[from] EventError),

    /// No listed status belongs to any listed detail type
    #[error("Pattern can never match: statuses {statuses:?} do not belong to detail types {detail_types:?}")]
    Unsatisfiable {
        /// Listed detail types
        detail_types: Vec<String>,
        /// Listed statuses
        statuses: Vec<String>,
    },
}

/// A declarative routing rule.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventPattern {
    /// Accepted sources; empty means any
    #[serde(default)]
    pub source: Vec<String>,
    /// Accepted detail types; empty means any
    #[serde(default, rename = "detailType", alias = "detail_type")]
    pub detail_type: Vec<String>,
    /// Accepted statuses; empty means any
    #[serde(default)]
    pub status: Vec<String>,
}

impl EventPattern {
    /// A pattern accepting exactly one routing key.
    #[must_use]
    pub fn exact(source: Source, detail_type: DetailType, status: Status) -> Self {
        Self {
            source: vec![source.as_str().to_string()],
            detail_type: vec![detail_type.as_str().to_string()],
            status: vec![status.as_str().to_string()],
        }
    }

    /// Also accept `source`.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source.push(source.into());
        self
    }

    /// Also accept `detail_type`.
    #[must_use]
    pub fn with_detail_type(mut self, detail_type: impl Into<String>) -> Self {
        self.detail_type.push(detail_type.into());
        self
    }

    /// Also accept `status`.
    #[must_use]
    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status.push(status.into());
        self
    }

    /// Compile into an explicit predicate.
    ///
    /// # Errors
    ///
    /// - [`PatternError::Empty`] if no field is constrained
    /// - [`PatternError::UnknownValue`] if a value is not recognized
    /// - [`PatternError::Unsatisfiable`] if no listed status belongs to a listed detail type
    pub fn compile(&self) -> Result<CompiledPattern, PatternError> {
        if self.source.is_empty() && self.detail_type.is_empty() && self.status.is_empty() {
            return Err(PatternError::Empty);
        }

        let compiled = CompiledPattern {
            sources: mask::<Source>(&self.source)?,
            detail_types: mask::<DetailType>(&self.detail_type)?,
            statuses: mask::<Status>(&self.status)?,
        };

        let satisfiable = Status::ALL.into_iter().any(|status| {
            compiled.statuses & status.bit() != 0
                && compiled.detail_types & status.detail_type().bit() != 0
        });
        if !satisfiable {
            return Err(PatternError::Unsatisfiable {
                detail_types: self.detail_type.clone(),
                statuses: self.status.clone(),
            });
        }

        Ok(compiled)
    }
}

/// Enumerations usable as pattern fields.
trait Flag: FromStr<Err = EventError> + Copy {
    const ALL_BITS: u8;

    fn bit(self) -> u8;
}

impl Flag for Source {
    const ALL_BITS: u8 = 0b11;

    fn bit(self) -> u8 {
        1 << self as u8
    }
}

impl Flag for DetailType {
    const ALL_BITS: u8 = 0b11;

    fn bit(self) -> u8 {
        1 << self as u8
    }
}

impl Flag for Status {
    const ALL_BITS: u8 = 0b11;

    fn bit(self) -> u8 {
        1 << self as u8
    }
}

fn mask<T: Flag>(values: &[String]) -> Result<u8, EventError> {
    if values.is_empty() {
        return Ok(T::ALL_BITS);
    }
    values
        .iter()
        .try_fold(0, |acc, value| Ok(acc | value.trim().parse::<T>()?.bit()))
}

/// A routing rule compiled to bit sets over the typed routing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompiledPattern {
    sources: u8,
    detail_types: u8,
    statuses: u8,
}

impl CompiledPattern {
    /// Whether `event` satisfies every predicate.
    #[must_use]
    pub fn matches(&self, event: &Event) -> bool {
        self.sources & event.source().bit() != 0
            && self.detail_types & event.detail_type().bit() != 0
            && self.statuses & event.status().bit() != 0
    }

    /// Whether `status` is the only status an event matching this pattern
    /// can carry.
    #[must_use]
    pub fn admits_only(&self, status: Status) -> bool {
        Status::ALL
            .into_iter()
            .filter(|s| {
                self.statuses & s.bit() != 0 && self.detail_types & s.detail_type().bit() != 0
            })
            .all(|s| s == status)
    }
}

fn write_field<T: Flag + fmt::Display>(
    f: &mut fmt::Formatter<'_>,
    name: &str,
    bits: u8,
    all: &[T],
) -> fmt::Result {
    if bits == T::ALL_BITS {
        return write!(f, "{name}=*");
    }
    let listed: Vec<String> = all
        .iter()
        .filter(|v| bits & v.bit() != 0)
        .map(ToString::to_string)
        .collect();
    write!(f, "{name}=[{}]", listed.join(","))
}

impl fmt::Display for CompiledPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_field(f, "source", self.sources, &Source::ALL)?;
        f.write_str(" ")?;
        write_field(f, "detailType", self.detail_types, &DetailType::ALL)?;
        f.write_str(" ")?;
        write_field(f, "status", self.statuses, &Status::ALL)
    }
}
