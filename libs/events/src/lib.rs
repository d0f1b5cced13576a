//! # plexus-events
//!
//! Lifecycle notifications published by an assembler while it negotiates.
//!
//! Container and UI code key off this taxonomy, so the set of event types is
//! fixed:
//!
//! - `state.added`: a prior-configuration hint was registered for a pointer
//! - `request.added` / `request.changed` / `request.removed`: an instance
//!   request entered negotiation, switched candidate or template, or left
//! - `binding.changed`: a child binding moved between resolving, resolved
//!   and releasing
//! - `device.added` / `device.removed`: a host joined or left the
//!   participant set of an application
//!
//! ## Event Envelope
//!
//! Every notification is wrapped in an [`EventEnvelope`] carrying a per-host
//! sequence number, the emitting host, the application and the phase in
//! which the transition happened.

mod envelope;
mod error;
mod types;

pub use envelope::*;
pub use error::EventError;
pub use types::*;
