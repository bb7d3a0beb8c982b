//! Driver-level error taxonomy.

use drender_id::ProjectId;
use drender_protocol::SoftwareTag;
use thiserror::Error;

use crate::resources::ResourceError;
use crate::store::StoreError;

/// Errors surfaced to callers of the driver.
///
/// Cloud and storage failures during recovery are handled locally (logged,
/// retried on a later event) and never appear here; only `startProject` can
/// fail outward, when the initial fleet or output bucket cannot be
/// provisioned.
#[derive(Debug, Error)]
pub enum DriverError {
    /// Duplicate START for a project id already in flight.
    #[error("project '{0}' already exists")]
    ProjectAlreadyPresent(ProjectId),

    /// The request failed validation before any state was touched.
    #[error("invalid project request: {0}")]
    InvalidRequest(String),

    /// No machine image is registered for the requested software package.
    #[error("no machine image registered for software '{0}'")]
    UnknownSoftware(SoftwareTag),

    /// The broker channel is already bound to a different host.
    #[error("broker channel already bound to host '{current}', request named '{requested}'")]
    BrokerMismatch { current: String, requested: String },

    /// Could not provision the initial fleet or the output bucket.
    #[error("provisioning failed: {0}")]
    Provision(#[from] ResourceError),

    /// Internal state inconsistency. Structurally impossible with validated
    /// input; surfacing one means a bug, not an operational condition.
    #[error("state error: {0}")]
    State(#[from] StoreError),

    /// The driver event loop is gone.
    #[error("driver is shutting down")]
    Unavailable,
}
