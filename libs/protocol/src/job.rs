//! Jobs: worker-assignable contiguous frame sub-ranges of a project.

use drender_id::{InstanceId, JobId, ProjectId};
use serde::{Deserialize, Serialize};

use crate::cloud::{MessageQ, S3Source};

/// An inclusive, contiguous range of frame indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRange {
    pub start: u32,
    pub end: u32,
}

impl FrameRange {
    /// Creates a range. `start` must not exceed `end`.
    #[must_use]
    pub fn new(start: u32, end: u32) -> Self {
        debug_assert!(start <= end, "frame range start must not exceed end");
        Self { start, end }
    }

    /// Number of frames in the range.
    #[must_use]
    pub fn len(&self) -> u32 {
        self.end - self.start + 1
    }

    /// A frame range is never empty; this exists for clippy symmetry.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }

    #[must_use]
    pub fn contains(&self, frame: u32) -> bool {
        (self.start..=self.end).contains(&frame)
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> {
        self.start..=self.end
    }
}

impl std::fmt::Display for FrameRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}..{}]", self.start, self.end)
    }
}

/// What the worker should do with a job it receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobAction {
    Start,
    Stop,
}

/// A frame sub-range assigned (or assignable) to one worker machine.
///
/// A job stays in the store after deactivation; its recorded frame progress
/// keeps counting toward project completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,

    #[serde(rename = "projectID")]
    pub project_id: ProjectId,

    #[serde(rename = "startFrame")]
    pub start_frame: u32,

    #[serde(rename = "endFrame")]
    pub end_frame: u32,

    pub source: S3Source,

    #[serde(rename = "outputURI", skip_serializing_if = "Option::is_none", default)]
    pub output_uri: Option<S3Source>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub instance: Option<InstanceId>,

    #[serde(rename = "isActive")]
    pub is_active: bool,

    #[serde(rename = "messageQ", skip_serializing_if = "Option::is_none", default)]
    pub message_q: Option<MessageQ>,

    pub action: JobAction,
}

impl Job {
    /// The job's frame range.
    #[must_use]
    pub fn frames(&self) -> FrameRange {
        FrameRange::new(self.start_frame, self.end_frame)
    }
}

/// A job before the store has assigned it an id.
///
/// The partitioner emits drafts; `StateStore::add_jobs` mints ids and links
/// them to the project.
#[derive(Debug, Clone)]
pub struct JobDraft {
    pub project_id: ProjectId,
    pub start_frame: u32,
    pub end_frame: u32,
    pub source: S3Source,
    pub output_uri: Option<S3Source>,
    pub message_q: Option<MessageQ>,
    pub action: JobAction,
}

impl JobDraft {
    #[must_use]
    pub fn frames(&self) -> FrameRange {
        FrameRange::new(self.start_frame, self.end_frame)
    }
}

/// Per-frame completion notification published by a worker.
///
/// `frames_rendered` is an optional catch-up batch: workers that buffered
/// notifications may report several frames at once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobFrame {
    #[serde(rename = "jobID")]
    pub job_id: JobId,

    #[serde(rename = "lastFrameRendered")]
    pub last_frame_rendered: u32,

    #[serde(rename = "outputURI")]
    pub output_uri: S3Source,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub frames_rendered: Option<Vec<u32>>,
}
