//! # drender-id
//!
//! Typed identifiers for drender resources.
//!
//! Two id families exist:
//!
//! - **Generated ids** (`JobId`) are minted by the driver. They use a prefixed
//!   ULID (`job_01HV4Z2WQXKJNM8GPQY6VBKC3D`), which makes them globally unique
//!   and time-ordered without coordination.
//! - **Foreign ids** (`ProjectId`, `InstanceId`) originate outside the driver:
//!   project ids are chosen by the caller, instance ids are assigned by the
//!   cloud provider. They are opaque non-empty strings, validated on parse.
//!
//! All ids round-trip through their string form and serialize as plain JSON
//! strings.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations.
pub use ulid::Ulid;
