//! Weft data model.
//!
//! Everything in the runtime is expressed in terms of a handful of values:
//!
//! - [`Event`]: an immutable, timestamped, typed record. The only unit of change.
//! - [`CandidateEvent`]: an event that has not been admitted to the log yet.
//! - [`Context`]: a frozen prefix of the event log. Appending produces a new
//!   `Context`; a `Context` someone holds never changes.
//! - [`TypePattern`]: `*`, an exact type, or a namespace wildcard such as `tool.*`.
//! - [`ValuePath`]: an address into a bound event (`review.data.value`).

#![deny(unsafe_code)]

pub mod context;
pub mod error;
pub mod event;
pub mod path;
pub mod well_known;

pub use context::Context;
pub use error::TypeError;
pub use event::{
    CandidateEvent, Event, EventData, EventId, EventType, IntegrityHash, Origin, Timestamp,
    TypePattern, ORIGIN_KEY,
};
pub use path::ValuePath;
