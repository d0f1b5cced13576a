//! Actor framework for the assembler.
//!
//! Every application under negotiation on a host is owned by exactly one
//! actor. All of an application's negotiation state is mutated only inside
//! that actor's `handle`, one message at a time; the mailbox is the only way
//! in from other tasks.
//!
//! ## Design Principles
//!
//! - **One actor per application**: the actor owns requests, bindings and
//!   the phase counter for its application; reservations are booked with
//!   the host's shared resource monitor
//! - **Message passing only**: RPC handlers enqueue events and return
//! - **Cooperative cancellation**: a stop signal is observed between
//!   messages, never in the middle of one

mod framework;

pub use framework::{
    mailbox, Actor, ActorContext, ActorError, ActorHandle, Mailbox, Message, Supervisor,
};
