//! plexus Assembler Library
//!
//! Each host runs one assembler. Together they negotiate how the component
//! tree of an application is assembled: which creator builds every node,
//! which host it lives on, and which allocators back its resources.
//!
//! ## Architecture
//!
//! ```text
//! Assembler (per host)
//! ├── ResourceMonitor           (host-wide free table, shared)
//! ├── LocalLeases               (granted and hooked leases)
//! └── Application(id)           (per-application negotiation actor)
//!     └── Outbox                (one FIFO lane per peer host)
//! ```
//!
//! ## Modules
//!
//! - `actors`: Actor framework the applications run on
//! - `application`: Per-application negotiation actor
//! - `assembler`: Host service and peer protocol entry points
//! - `network`: In-process network of hosts
//! - `scenario`: JSON-described simulations

pub mod actors;
pub mod application;
pub mod assembler;
pub mod container;
pub mod lease;
pub mod lifecycle;
pub mod model;
pub mod network;
pub mod peer;
pub mod resources;
pub mod scenario;

pub mod config;

pub use assembler::{Assembler, AssemblerError};
pub use config::Config;
pub use container::{Candidate, Container, ContainerError, ResourceSnapshot, StaticContainer};
pub use lease::{Lease, LeaseError, LivenessPort, LocalLeases};
pub use model::{Assembly, AssemblyPointer, AssemblyState, AssemblyTree, ChildRef};
pub use network::LocalNetwork;
pub use peer::{Peer, PeerDirectory, PeerError};
