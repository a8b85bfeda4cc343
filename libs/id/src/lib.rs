//! # kiln-id
//!
//! Typed identifiers for the kiln node agent.
//!
//! Identifiers are ULID-backed and rendered as `{prefix}_{ulid}`, e.g.
//! `vm_01HV4Z4NYPLTRS0JTUA8XDME5F`. The rendered form never contains a `.`,
//! so an identifier is always a single message-bus subject token.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
