//! Projects: user render requests spanning a contiguous frame range.

use chrono::{DateTime, Utc};
use drender_id::{JobId, ProjectId};
use serde::{Deserialize, Serialize};

use crate::cloud::{S3Source, SoftwareTag};
use crate::instance::RenderInstance;

/// A user render request, as held by the driver.
///
/// Immutable after creation except for `output_uri`, which is attached once
/// the output bucket exists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,

    pub source: S3Source,

    #[serde(rename = "startFrame")]
    pub start_frame: u32,

    #[serde(rename = "endFrame")]
    pub end_frame: u32,

    #[serde(rename = "framesPerMachine")]
    pub frames_per_machine: u32,

    pub software: SoftwareTag,

    #[serde(rename = "outputURI", skip_serializing_if = "Option::is_none", default)]
    pub output_uri: Option<S3Source>,

    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

/// What the caller wants done with a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProjectAction {
    Start,
    Status,
}

/// Inbound control message decoded at the HTTP shell.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectRequest {
    pub id: ProjectId,

    pub source: S3Source,

    #[serde(rename = "startFrame")]
    pub start_frame: u32,

    #[serde(rename = "endFrame")]
    pub end_frame: u32,

    #[serde(rename = "framesPerMachine")]
    pub frames_per_machine: u32,

    pub software: SoftwareTag,

    #[serde(rename = "publicIP")]
    pub public_ip: String,

    pub action: ProjectAction,
}

/// Snapshot of a project and its jobs.
///
/// All fields are optional so an unknown project yields an empty `{}` body,
/// mirroring the original wire behavior.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectResponse {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub id: Option<ProjectId>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub source: Option<S3Source>,

    #[serde(rename = "startFrame", skip_serializing_if = "Option::is_none", default)]
    pub start_frame: Option<u32>,

    #[serde(rename = "endFrame", skip_serializing_if = "Option::is_none", default)]
    pub end_frame: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub software: Option<SoftwareTag>,

    #[serde(rename = "outputURI", skip_serializing_if = "Option::is_none", default)]
    pub output_uri: Option<S3Source>,

    #[serde(rename = "isComplete", skip_serializing_if = "Option::is_none", default)]
    pub is_complete: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub log: Option<ProjectLog>,
}

impl ProjectResponse {
    /// The empty response returned for an unknown project id.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }
}

/// Per-job status lines inside a [`ProjectResponse`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectLog {
    pub jobs: Vec<JobLogEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobLogEntry {
    pub id: JobId,

    #[serde(rename = "startFrame")]
    pub start_frame: u32,

    #[serde(rename = "endFrame")]
    pub end_frame: u32,

    #[serde(rename = "instanceInfo", skip_serializing_if = "Option::is_none", default)]
    pub instance_info: Option<RenderInstance>,

    #[serde(rename = "isActive")]
    pub is_active: bool,

    #[serde(rename = "framesRendered")]
    pub frames_rendered: usize,
}
