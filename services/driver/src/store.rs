//! Authoritative in-memory state for projects, jobs, instances, frame
//! progress, and pending recovery actions.
//!
//! The store is owned outright by the driver event loop and is therefore not
//! synchronized; every mutation happens on that one task. Relations are
//! id-keyed: jobs reference instances by id, and the instance-to-jobs
//! direction is computed on demand.
//!
//! Invariants the store enforces:
//! - job ids are minted here and never reused;
//! - a job belongs to exactly one project;
//! - deactivation is monotone (no reactivation path exists);
//! - a job's recorded frames stay inside its own range.

use std::collections::{BTreeSet, HashMap, HashSet};

use drender_id::{InstanceId, JobId, ProjectId};
use drender_protocol::{Job, JobDraft, Project, RenderInstance, S3Source};
use thiserror::Error;
use tracing::debug;

use crate::heartbeat::HeartbeatHandle;

/// Errors from store operations.
///
/// With inputs validated at the driver boundary these indicate a logic bug,
/// not an operational condition.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("project '{0}' already present")]
    ProjectExists(ProjectId),

    #[error("unknown project '{0}'")]
    UnknownProject(ProjectId),

    #[error("unknown job '{0}'")]
    UnknownJob(JobId),

    #[error("unknown instance '{0}'")]
    UnknownInstance(InstanceId),

    #[error("frame {frame} outside job '{job}' range [{start}..{end}]")]
    FrameOutOfRange {
        job: JobId,
        frame: u32,
        start: u32,
        end: u32,
    },

    #[error("draft for project '{draft}' added under project '{target}'")]
    ProjectMismatch { draft: ProjectId, target: ProjectId },
}

/// The driver's single source of truth.
#[derive(Default)]
pub struct StateStore {
    projects: HashMap<ProjectId, Project>,
    jobs: HashMap<JobId, Job>,
    project_jobs: HashMap<ProjectId, Vec<JobId>>,
    progress: HashMap<JobId, BTreeSet<u32>>,
    instances: HashMap<InstanceId, RenderInstance>,
    heartbeats: HashMap<InstanceId, HeartbeatHandle>,
    pending_spawn: HashSet<InstanceId>,
    pending_restart: HashSet<InstanceId>,
    pending_terminate: HashSet<InstanceId>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    // =========================================================================
    // Projects
    // =========================================================================

    pub fn add_project(&mut self, project: Project) -> Result<(), StoreError> {
        if self.projects.contains_key(&project.id) {
            return Err(StoreError::ProjectExists(project.id));
        }
        self.project_jobs.insert(project.id.clone(), Vec::new());
        self.projects.insert(project.id.clone(), project);
        Ok(())
    }

    pub fn project(&self, id: &ProjectId) -> Option<&Project> {
        self.projects.get(id)
    }

    /// Attaches the output URI to a project. Set-once: a second call with any
    /// value leaves the first binding in place.
    pub fn set_project_output(
        &mut self,
        id: &ProjectId,
        output_uri: S3Source,
    ) -> Result<(), StoreError> {
        let project = self
            .projects
            .get_mut(id)
            .ok_or_else(|| StoreError::UnknownProject(id.clone()))?;
        if project.output_uri.is_none() {
            project.output_uri = Some(output_uri);
        }
        Ok(())
    }

    /// True iff the union of recorded frames across all of the project's jobs
    /// (active or not) covers the project's whole range.
    pub fn is_project_complete(&self, id: &ProjectId) -> bool {
        let Some(project) = self.projects.get(id) else {
            return false;
        };
        let Some(job_ids) = self.project_jobs.get(id) else {
            return false;
        };

        let mut covered: BTreeSet<u32> = BTreeSet::new();
        for job_id in job_ids {
            if let Some(frames) = self.progress.get(job_id) {
                covered.extend(frames.iter().copied());
            }
        }
        (project.start_frame..=project.end_frame).all(|frame| covered.contains(&frame))
    }

    // =========================================================================
    // Jobs
    // =========================================================================

    /// Creates jobs from drafts: mints fresh ids, marks them active, links
    /// them to the project. Returns the new ids in draft order.
    pub fn add_jobs(
        &mut self,
        project_id: &ProjectId,
        drafts: Vec<JobDraft>,
    ) -> Result<Vec<JobId>, StoreError> {
        if !self.projects.contains_key(project_id) {
            return Err(StoreError::UnknownProject(project_id.clone()));
        }
        for draft in &drafts {
            if &draft.project_id != project_id {
                return Err(StoreError::ProjectMismatch {
                    draft: draft.project_id.clone(),
                    target: project_id.clone(),
                });
            }
        }

        let mut ids = Vec::with_capacity(drafts.len());
        for draft in drafts {
            let id = JobId::new();
            let job = Job {
                id,
                project_id: draft.project_id,
                start_frame: draft.start_frame,
                end_frame: draft.end_frame,
                source: draft.source,
                output_uri: draft.output_uri,
                instance: None,
                is_active: true,
                message_q: draft.message_q,
                action: draft.action,
            };
            debug!(job_id = %id, project_id = %project_id, frames = %job.frames(), "Job created");
            self.jobs.insert(id, job);
            self.progress.insert(id, BTreeSet::new());
            self.project_jobs
                .get_mut(project_id)
                .expect("checked above")
                .push(id);
            ids.push(id);
        }
        Ok(ids)
    }

    pub fn job(&self, id: JobId) -> Option<&Job> {
        self.jobs.get(&id)
    }

    pub fn bind_instance(&mut self, job_id: JobId, instance_id: &InstanceId) -> Result<(), StoreError> {
        if !self.instances.contains_key(instance_id) {
            return Err(StoreError::UnknownInstance(instance_id.clone()));
        }
        let job = self
            .jobs
            .get_mut(&job_id)
            .ok_or(StoreError::UnknownJob(job_id))?;
        job.instance = Some(instance_id.clone());
        Ok(())
    }

    pub fn bind_output_uri(&mut self, job_id: JobId, output_uri: S3Source) -> Result<(), StoreError> {
        let job = self
            .jobs
            .get_mut(&job_id)
            .ok_or(StoreError::UnknownJob(job_id))?;
        job.output_uri = Some(output_uri);
        Ok(())
    }

    /// Deactivates a job. Idempotent; the job and its frame progress stay in
    /// the store as history.
    pub fn deactivate_job(&mut self, job_id: JobId) -> Result<(), StoreError> {
        let job = self
            .jobs
            .get_mut(&job_id)
            .ok_or(StoreError::UnknownJob(job_id))?;
        if job.is_active {
            job.is_active = false;
            debug!(job_id = %job_id, "Job deactivated");
        }
        Ok(())
    }

    /// Active jobs currently bound to an instance, in creation order.
    pub fn active_jobs_of(&self, instance_id: &InstanceId) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .jobs
            .values()
            .filter(|j| j.is_active && j.instance.as_ref() == Some(instance_id))
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.id);
        jobs
    }

    pub fn all_jobs(&self, project_id: &ProjectId) -> Vec<&Job> {
        self.project_jobs
            .get(project_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.jobs.get(id))
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default()
    }

    pub fn all_job_ids(&self, project_id: &ProjectId) -> Vec<JobId> {
        self.project_jobs
            .get(project_id)
            .cloned()
            .unwrap_or_default()
    }

    // =========================================================================
    // Frame progress
    // =========================================================================

    /// Records a rendered frame. Idempotent; returns whether the frame was
    /// newly recorded. Frames land against the job id they were reported for,
    /// active or not.
    pub fn record_frame(&mut self, job_id: JobId, frame: u32) -> Result<bool, StoreError> {
        let job = self.jobs.get(&job_id).ok_or(StoreError::UnknownJob(job_id))?;
        if !job.frames().contains(frame) {
            return Err(StoreError::FrameOutOfRange {
                job: job_id,
                frame,
                start: job.start_frame,
                end: job.end_frame,
            });
        }
        Ok(self
            .progress
            .get_mut(&job_id)
            .expect("progress set exists for every job")
            .insert(frame))
    }

    pub fn frames_rendered(&self, job_id: JobId) -> Option<&BTreeSet<u32>> {
        self.progress.get(&job_id)
    }

    pub fn frame_count(&self, job_id: JobId) -> usize {
        self.progress.get(&job_id).map(BTreeSet::len).unwrap_or(0)
    }

    // =========================================================================
    // Instances
    // =========================================================================

    pub fn add_instance(&mut self, instance: RenderInstance) {
        self.instances.insert(instance.id.clone(), instance);
    }

    pub fn instance(&self, id: &InstanceId) -> Option<&RenderInstance> {
        self.instances.get(id)
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    /// Removes an instance, cancelling its heartbeat watcher and clearing any
    /// pending-terminate entry before returning.
    pub fn remove_instance(&mut self, id: &InstanceId) {
        if let Some(handle) = self.heartbeats.remove(id) {
            handle.cancel();
        }
        self.pending_terminate.remove(id);
        if self.instances.remove(id).is_some() {
            debug!(instance_id = %id, "Instance removed");
        }
    }

    /// Instances hosting at least one active job of this project whose every
    /// active job (including any from other projects) is fully rendered.
    pub fn instances_with_all_jobs_done(&self, project_id: &ProjectId) -> Vec<InstanceId> {
        let mut by_instance: HashMap<&InstanceId, Vec<&Job>> = HashMap::new();
        for job in self.jobs.values() {
            if let Some(instance_id) = job.instance.as_ref().filter(|_| job.is_active) {
                by_instance.entry(instance_id).or_default().push(job);
            }
        }

        let mut done: Vec<InstanceId> = by_instance
            .into_iter()
            .filter(|(id, _)| self.instances.contains_key(*id))
            .filter(|(_, jobs)| jobs.iter().any(|j| &j.project_id == project_id))
            .filter(|(_, jobs)| {
                jobs.iter().all(|job| {
                    let rendered = self
                        .progress
                        .get(&job.id)
                        .map(BTreeSet::len)
                        .unwrap_or(0);
                    rendered as u32 >= job.frames().len()
                })
            })
            .map(|(id, _)| id.clone())
            .collect();
        done.sort();
        done
    }

    // =========================================================================
    // Pending-action queues
    // =========================================================================

    /// Marks a replacement spawn as in flight. True iff newly queued.
    pub fn try_queue_spawn(&mut self, id: &InstanceId) -> bool {
        self.pending_spawn.insert(id.clone())
    }

    /// Marks a restart as in flight. True iff newly queued.
    pub fn try_queue_restart(&mut self, id: &InstanceId) -> bool {
        self.pending_restart.insert(id.clone())
    }

    /// Marks terminations as in flight; returns only the newly queued subset.
    pub fn try_queue_terminate(&mut self, ids: &[InstanceId]) -> Vec<InstanceId> {
        ids.iter()
            .filter(|id| self.pending_terminate.insert((*id).clone()))
            .cloned()
            .collect()
    }

    pub fn clear_pending_spawn(&mut self, id: &InstanceId) -> bool {
        self.pending_spawn.remove(id)
    }

    pub fn clear_pending_restart(&mut self, id: &InstanceId) -> bool {
        self.pending_restart.remove(id)
    }

    pub fn clear_pending_terminate(&mut self, id: &InstanceId) -> bool {
        self.pending_terminate.remove(id)
    }

    // =========================================================================
    // Heartbeat timers
    // =========================================================================

    /// Registers the heartbeat watcher for an instance, cancelling any
    /// previous one.
    pub fn set_heartbeat(&mut self, id: &InstanceId, handle: HeartbeatHandle) {
        if let Some(old) = self.heartbeats.insert(id.clone(), handle) {
            old.cancel();
        }
    }

    pub fn has_heartbeat(&self, id: &InstanceId) -> bool {
        self.heartbeats.contains_key(id)
    }
}
