//! # drender-protocol
//!
//! Domain entities and wire messages for the drender control plane.
//!
//! Everything that crosses a process boundary lives here: project requests
//! and status responses, per-frame completion notifications from workers,
//! instance lifecycle messages, and the object-store addressing types. The
//! JSON field spellings are part of the wire contract and are pinned by serde
//! renames (`startFrame`, `publicIP`, `cloudAMI`, `jobID`, ...); tests assert
//! them so a refactor cannot silently change the protocol.
//!
//! The driver's in-memory state is built from these same types, keyed by the
//! typed ids from [`drender_id`].

pub mod cloud;
pub mod instance;
pub mod job;
pub mod project;

pub use cloud::{MachineImage, MessageQ, S3Source, SoftwareTag};
pub use instance::{
    InstanceAction, InstanceHeartbeat, InstanceRequest, InstanceResponse, InstanceState,
    RenderInstance,
};
pub use job::{FrameRange, Job, JobAction, JobDraft, JobFrame};
pub use project::{JobLogEntry, Project, ProjectAction, ProjectLog, ProjectRequest, ProjectResponse};
