//! # plexus-id
//!
//! Typed identifiers shared by every plexus crate.
//!
//! ## ID Format
//!
//! All identifiers use a prefixed format: `{prefix}_{ulid}`
//!
//! Examples:
//! - `app_01HV4Z2WQXKJNM8GPQY6VBKC3D` (an application being assembled)
//! - `sys_01HV4Z3MXNKPQR9HSTZ7WCLD4E` (a participating host)
//! - `prov_01HV4Z4NYPLTRS0JTUA8XDME5F` (a component creator or resource allocator)
//!
//! The prefix keeps host ids from being passed where provider ids are
//! expected, and the ULID keeps ids sortable and unique without coordination.
//!
//! [`Pointer`] identifies a node of the configuration tree by path rather
//! than by ULID. [`Phase`] is not an identifier but lives here because every
//! message on the peer protocol carries one.

mod error;
mod macros;
mod pointer;
mod types;

pub use error::IdError;
pub use pointer::{Pointer, Segment, SegmentKind};
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
