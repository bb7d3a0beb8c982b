//! The driver: project lifecycle orchestration on a single event loop.
//!
//! One task owns the [`StateStore`] and processes every [`DriverEvent`] in
//! arrival order, which is the whole concurrency story: mutations to a
//! project are serialized, a job's deactivation strictly precedes the
//! creation of its residual sub-jobs, and the pending-action queues give
//! at-most-one-in-flight recovery per instance per action kind.
//!
//! Anything that can block (cloud calls, storage checks) is spawned off the
//! loop and reports back with a `*Resolved` event.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use drender_id::{InstanceId, JobId, ProjectId};
use drender_protocol::{
    InstanceAction, InstanceHeartbeat, JobDraft, JobFrame, JobLogEntry, MachineImage, MessageQ,
    Project, ProjectLog, ProjectRequest, ProjectResponse, RenderInstance, S3Source,
};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::config::{BrokerConfig, DriverConfig, ImageCatalog};
use crate::error::DriverError;
use crate::frames::{FrameFeedConnector, FrameReconciler};
use crate::heartbeat::HeartbeatScheduler;
use crate::partition;
use crate::providers::{HealthProbe, JobDispatcher};
use crate::resources::{ResourceError, ResourceManager};
use crate::store::{StateStore, StoreError};
use crate::sweeper::CompletionSweeper;

// =============================================================================
// Events
// =============================================================================

/// Everything that reaches the driver loop.
#[derive(Debug)]
pub enum DriverEvent {
    /// START request from the shell.
    StartProject {
        request: ProjectRequest,
        reply: oneshot::Sender<Result<ProjectResponse, DriverError>>,
    },

    /// STATUS request from the shell.
    Status {
        project_id: ProjectId,
        reply: oneshot::Sender<ProjectResponse>,
    },

    /// Inbound instance control message from the shell.
    InstanceMessage { message: InstanceHeartbeat },

    /// A heartbeat watcher (or on-demand probe) found an instance unhealthy.
    Unhealthy { instance: RenderInstance },

    /// Initial fleet and output bucket provisioning finished.
    Provisioned {
        project_id: ProjectId,
        outcome: Result<(Vec<RenderInstance>, S3Source), ResourceError>,
        reply: oneshot::Sender<Result<ProjectResponse, DriverError>>,
    },

    /// A restart attempt (including health verification) finished.
    RestartResolved {
        instance: RenderInstance,
        drafts: Vec<JobDraft>,
        outcome: Result<(), ResourceError>,
    },

    /// A replacement spawn finished.
    ReplacementResolved {
        failed: InstanceId,
        image: MachineImage,
        drafts: Vec<JobDraft>,
        outcome: Result<Vec<RenderInstance>, ResourceError>,
    },

    /// A worker frame report that passed storage verification.
    FrameVerified { record: JobFrame },

    /// Periodic completion sweep for one project.
    SweepTick { project_id: ProjectId },

    /// A termination batch finished.
    TerminateResolved {
        instance_ids: Vec<InstanceId>,
        outcome: Result<(), ResourceError>,
    },
}

// =============================================================================
// Handle
// =============================================================================

/// Cloneable entry point to the driver loop.
#[derive(Clone)]
pub struct DriverHandle {
    events: mpsc::Sender<DriverEvent>,
}

impl DriverHandle {
    /// Starts a project and returns its status once the fleet is bound.
    pub async fn start_project(
        &self,
        request: ProjectRequest,
    ) -> Result<ProjectResponse, DriverError> {
        let (reply, rx) = oneshot::channel();
        self.events
            .send(DriverEvent::StartProject { request, reply })
            .await
            .map_err(|_| DriverError::Unavailable)?;
        rx.await.map_err(|_| DriverError::Unavailable)?
    }

    /// Snapshot status; empty response for an unknown project.
    pub async fn status(&self, project_id: ProjectId) -> Result<ProjectResponse, DriverError> {
        let (reply, rx) = oneshot::channel();
        self.events
            .send(DriverEvent::Status { project_id, reply })
            .await
            .map_err(|_| DriverError::Unavailable)?;
        rx.await.map_err(|_| DriverError::Unavailable)
    }

    /// Routes an inbound instance control message.
    pub async fn instance_message(&self, message: InstanceHeartbeat) -> Result<(), DriverError> {
        self.events
            .send(DriverEvent::InstanceMessage { message })
            .await
            .map_err(|_| DriverError::Unavailable)
    }
}

// =============================================================================
// Driver
// =============================================================================

/// A replacement spawn that failed and waits for the next sweep to retry.
struct ParkedRecovery {
    failed: InstanceId,
    image: MachineImage,
    drafts: Vec<JobDraft>,
}

pub struct Driver {
    store: StateStore,
    resources: Arc<ResourceManager>,
    heartbeats: HeartbeatScheduler,
    dispatcher: Arc<dyn JobDispatcher>,
    connector: Arc<dyn FrameFeedConnector>,
    config: DriverConfig,
    broker: BrokerConfig,
    images: ImageCatalog,
    events_tx: mpsc::Sender<DriverEvent>,
    events_rx: mpsc::Receiver<DriverEvent>,
    shutdown: watch::Receiver<bool>,
    message_q: Option<MessageQ>,
    sweeping: HashSet<ProjectId>,
    parked: Vec<ParkedRecovery>,
}

impl Driver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: DriverConfig,
        broker: BrokerConfig,
        images: ImageCatalog,
        resources: Arc<ResourceManager>,
        probe: Arc<dyn HealthProbe>,
        dispatcher: Arc<dyn JobDispatcher>,
        connector: Arc<dyn FrameFeedConnector>,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, DriverHandle) {
        let (events_tx, events_rx) = mpsc::channel(config.event_capacity);
        let heartbeats = HeartbeatScheduler::new(
            probe,
            config.heartbeat_interval,
            config.probe_timeout,
            events_tx.clone(),
        );
        let handle = DriverHandle {
            events: events_tx.clone(),
        };
        let driver = Self {
            store: StateStore::new(),
            resources,
            heartbeats,
            dispatcher,
            connector,
            config,
            broker,
            images,
            events_tx,
            events_rx,
            shutdown,
            message_q: None,
            sweeping: HashSet::new(),
            parked: Vec::new(),
        };
        (driver, handle)
    }

    /// Runs the event loop until shutdown.
    pub async fn run(mut self) {
        info!("Driver event loop started");

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.changed() => {
                    if *self.shutdown.borrow() {
                        info!("Driver shutting down");
                        break;
                    }
                }

                event = self.events_rx.recv() => match event {
                    Some(event) => self.handle(event),
                    None => break,
                },
            }
        }
    }

    fn handle(&mut self, event: DriverEvent) {
        match event {
            DriverEvent::StartProject { request, reply } => self.handle_start(request, reply),
            DriverEvent::Status { project_id, reply } => {
                let _ = reply.send(self.status(&project_id));
            }
            DriverEvent::InstanceMessage { message } => self.handle_instance_message(message),
            DriverEvent::Unhealthy { instance } => self.handle_unhealthy(instance),
            DriverEvent::Provisioned {
                project_id,
                outcome,
                reply,
            } => self.handle_provisioned(project_id, outcome, reply),
            DriverEvent::RestartResolved {
                instance,
                drafts,
                outcome,
            } => self.handle_restart_resolved(instance, drafts, outcome),
            DriverEvent::ReplacementResolved {
                failed,
                image,
                drafts,
                outcome,
            } => self.handle_replacement_resolved(failed, image, drafts, outcome),
            DriverEvent::FrameVerified { record } => self.handle_frame(record),
            DriverEvent::SweepTick { project_id } => self.handle_sweep(project_id),
            DriverEvent::TerminateResolved {
                instance_ids,
                outcome,
            } => self.handle_terminate_resolved(instance_ids, outcome),
        }
    }

    // =========================================================================
    // Project start and status
    // =========================================================================

    fn handle_start(
        &mut self,
        request: ProjectRequest,
        reply: oneshot::Sender<Result<ProjectResponse, DriverError>>,
    ) {
        info!(project_id = %request.id, frames = ?(request.start_frame, request.end_frame), "START received");

        if request.end_frame < request.start_frame {
            let _ = reply.send(Err(DriverError::InvalidRequest(format!(
                "endFrame {} precedes startFrame {}",
                request.end_frame, request.start_frame
            ))));
            return;
        }
        if request.frames_per_machine == 0 {
            let _ = reply.send(Err(DriverError::InvalidRequest(
                "framesPerMachine must be at least 1".to_string(),
            )));
            return;
        }
        let Some(image) = self.images.lookup(&request.software).cloned() else {
            let _ = reply.send(Err(DriverError::UnknownSoftware(request.software)));
            return;
        };

        // The broker channel is driver-scoped and fixed by the first START.
        let queue = match &self.message_q {
            Some(queue) if queue.host == request.public_ip => queue.clone(),
            Some(queue) => {
                let _ = reply.send(Err(DriverError::BrokerMismatch {
                    current: queue.host.clone(),
                    requested: request.public_ip,
                }));
                return;
            }
            None => {
                let queue = MessageQ {
                    host: request.public_ip.clone(),
                    port: self.broker.port,
                    queue_name: self.broker.queue.clone(),
                };
                self.message_q = Some(queue.clone());
                self.start_frame_consumer(queue.clone());
                queue
            }
        };

        let project = Project {
            id: request.id,
            source: request.source,
            start_frame: request.start_frame,
            end_frame: request.end_frame,
            frames_per_machine: request.frames_per_machine,
            software: request.software,
            output_uri: None,
            created_at: Utc::now(),
        };
        let project_id = project.id.clone();

        if let Err(e) = self.store.add_project(project.clone()) {
            let err = match e {
                StoreError::ProjectExists(id) => DriverError::ProjectAlreadyPresent(id),
                other => other.into(),
            };
            let _ = reply.send(Err(err));
            return;
        }

        let drafts = partition::initial_drafts(&project, &queue);
        let job_ids = match self.store.add_jobs(&project_id, drafts) {
            Ok(ids) => ids,
            Err(e) => {
                let _ = reply.send(Err(e.into()));
                return;
            }
        };

        info!(
            project_id = %project_id,
            jobs = job_ids.len(),
            software = %project.software,
            "Project persisted; provisioning fleet"
        );

        let resources = Arc::clone(&self.resources);
        let events = self.events_tx.clone();
        let count = job_ids.len();
        tokio::spawn(async move {
            let (machines, bucket) = tokio::join!(
                resources.spawn(&image, count),
                resources.create_bucket(&project_id)
            );
            let outcome = match (machines, bucket) {
                (Ok(instances), Ok(output_uri)) => Ok((instances, output_uri)),
                (Err(e), _) | (_, Err(e)) => Err(e),
            };
            let _ = events
                .send(DriverEvent::Provisioned {
                    project_id,
                    outcome,
                    reply,
                })
                .await;
        });
    }

    fn handle_provisioned(
        &mut self,
        project_id: ProjectId,
        outcome: Result<(Vec<RenderInstance>, S3Source), ResourceError>,
        reply: oneshot::Sender<Result<ProjectResponse, DriverError>>,
    ) {
        let (instances, output_uri) = match outcome {
            Ok(pair) => pair,
            Err(e) => {
                error!(project_id = %project_id, error = %e, "Provisioning failed; project start fails");
                for job_id in self.store.all_job_ids(&project_id) {
                    let _ = self.store.deactivate_job(job_id);
                }
                let _ = reply.send(Err(DriverError::Provision(e)));
                return;
            }
        };

        if let Err(e) = self.store.set_project_output(&project_id, output_uri.clone()) {
            let _ = reply.send(Err(e.into()));
            return;
        }

        let job_ids = self.store.all_job_ids(&project_id);
        for (job_id, instance) in job_ids.iter().copied().zip(instances) {
            self.adopt_instance(&instance);
            if let Err(e) = self.store.bind_instance(job_id, &instance.id) {
                error!(job_id = %job_id, error = %e, "Could not bind instance to job");
                continue;
            }
            if let Err(e) = self.store.bind_output_uri(job_id, output_uri.clone()) {
                error!(job_id = %job_id, error = %e, "Could not bind output URI to job");
            }
            self.dispatch_start(job_id);
        }

        self.ensure_sweeper(&project_id);
        info!(project_id = %project_id, "Fleet bound; project running");
        let _ = reply.send(Ok(self.status(&project_id)));
    }

    fn status(&self, project_id: &ProjectId) -> ProjectResponse {
        let Some(project) = self.store.project(project_id) else {
            return ProjectResponse::empty();
        };

        let jobs = self
            .store
            .all_jobs(project_id)
            .into_iter()
            .map(|job| JobLogEntry {
                id: job.id,
                start_frame: job.start_frame,
                end_frame: job.end_frame,
                instance_info: job
                    .instance
                    .as_ref()
                    .and_then(|id| self.store.instance(id))
                    .cloned(),
                is_active: job.is_active,
                frames_rendered: self.store.frame_count(job.id),
            })
            .collect();

        ProjectResponse {
            id: Some(project.id.clone()),
            source: Some(project.source.clone()),
            start_frame: Some(project.start_frame),
            end_frame: Some(project.end_frame),
            software: Some(project.software.clone()),
            output_uri: project.output_uri.clone(),
            is_complete: Some(self.store.is_project_complete(project_id)),
            log: Some(ProjectLog { jobs }),
        }
    }

    // =========================================================================
    // Recovery
    // =========================================================================

    fn handle_instance_message(&mut self, message: InstanceHeartbeat) {
        debug!(instance_id = %message.instance.id, action = ?message.action, "Instance message");
        match message.action {
            InstanceAction::HeartbeatCheck => self.heartbeats.probe_once(message.instance),
            InstanceAction::RestartMachine => self.handle_unhealthy(message.instance),
            InstanceAction::StartNewMachine => {
                let instance = message.instance;
                if !self.store.try_queue_spawn(&instance.id) {
                    debug!(instance_id = %instance.id, "Replacement already in flight");
                    return;
                }
                let drafts = self.transition_jobs(&instance);
                if drafts.is_empty() {
                    self.store.clear_pending_spawn(&instance.id);
                    return;
                }
                let image = instance.cloud_ami.clone();
                self.spawn_replacement_task(instance.id, image, drafts);
            }
            InstanceAction::KillMachine => {
                let newly = self.store.try_queue_terminate(&[message.instance.id]);
                if !newly.is_empty() {
                    self.launch_terminate(newly);
                }
            }
        }
    }

    /// Restart-first recovery: try a reboot, escalate to a replacement when
    /// the reboot fails. Duplicate reports are absorbed by the pending queue.
    fn handle_unhealthy(&mut self, instance: RenderInstance) {
        if !self.store.try_queue_restart(&instance.id) {
            debug!(instance_id = %instance.id, "Recovery already in flight, dropping unhealthy report");
            return;
        }

        let drafts = self.transition_jobs(&instance);
        if drafts.is_empty() {
            // Nothing left to render behind this machine; just make sure the
            // cloud side is cleaned up.
            self.store.clear_pending_restart(&instance.id);
            let newly = self.store.try_queue_terminate(&[instance.id.clone()]);
            if !newly.is_empty() {
                debug!(instance_id = %instance.id, "Unhealthy instance had no unrendered frames, terminating");
                self.launch_terminate(newly);
            }
            return;
        }

        info!(
            instance_id = %instance.id,
            sub_jobs = drafts.len(),
            "Instance unhealthy; attempting restart"
        );

        let resources = Arc::clone(&self.resources);
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let outcome = resources.restart(&instance).await;
            let _ = events
                .send(DriverEvent::RestartResolved {
                    instance,
                    drafts,
                    outcome,
                })
                .await;
        });
    }

    /// Deactivates an instance's jobs, drops the instance and its heartbeat,
    /// and returns residual drafts for the unrendered frames.
    ///
    /// Deactivation happens before the residual partition, so a frame report
    /// racing with recovery lands on the old job id and still counts.
    fn transition_jobs(&mut self, instance: &RenderInstance) -> Vec<JobDraft> {
        let jobs = self.store.active_jobs_of(&instance.id);
        for job in &jobs {
            let _ = self.store.deactivate_job(job.id);
        }
        self.store.remove_instance(&instance.id);

        let mut drafts = Vec::new();
        for job in &jobs {
            let rendered = self
                .store
                .frames_rendered(job.id)
                .cloned()
                .unwrap_or_default();
            drafts.extend(partition::residual_drafts(job, &rendered));
        }
        drafts
    }

    fn handle_restart_resolved(
        &mut self,
        instance: RenderInstance,
        drafts: Vec<JobDraft>,
        outcome: Result<(), ResourceError>,
    ) {
        self.store.clear_pending_restart(&instance.id);
        match outcome {
            Ok(()) => {
                info!(instance_id = %instance.id, "Restart verified; rebinding residual jobs");
                self.assign_drafts_to_instance(instance, drafts);
            }
            Err(e) => {
                warn!(
                    instance_id = %instance.id,
                    error = %e,
                    "Restart failed; escalating to replacement"
                );
                let image = instance.cloud_ami.clone();
                self.launch_replacement(instance.id, image, drafts);
            }
        }
    }

    fn launch_replacement(
        &mut self,
        failed: InstanceId,
        image: MachineImage,
        drafts: Vec<JobDraft>,
    ) {
        if !self.store.try_queue_spawn(&failed) {
            debug!(instance_id = %failed, "Replacement already in flight, parking residual jobs");
            self.parked.push(ParkedRecovery {
                failed,
                image,
                drafts,
            });
            return;
        }
        self.spawn_replacement_task(failed, image, drafts);
    }

    fn spawn_replacement_task(
        &self,
        failed: InstanceId,
        image: MachineImage,
        drafts: Vec<JobDraft>,
    ) {
        let resources = Arc::clone(&self.resources);
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let outcome = resources.spawn(&image, 1).await;
            let _ = events
                .send(DriverEvent::ReplacementResolved {
                    failed,
                    image,
                    drafts,
                    outcome,
                })
                .await;
        });
    }

    fn handle_replacement_resolved(
        &mut self,
        failed: InstanceId,
        image: MachineImage,
        drafts: Vec<JobDraft>,
        outcome: Result<Vec<RenderInstance>, ResourceError>,
    ) {
        match outcome {
            Ok(mut instances) => {
                if let Some(replacement) = instances.pop() {
                    self.store.clear_pending_spawn(&failed);
                    info!(
                        failed = %failed,
                        replacement = %replacement.id,
                        "Replacement machine ready"
                    );
                    self.assign_drafts_to_instance(replacement, drafts);
                } else {
                    warn!(failed = %failed, "Replacement spawn returned no machines, parking for retry");
                    self.parked.push(ParkedRecovery {
                        failed,
                        image,
                        drafts,
                    });
                }
            }
            Err(e) => {
                // The pending-spawn entry stays set until the retry is
                // queued, so duplicate reports cannot double-spawn meanwhile.
                warn!(failed = %failed, error = %e, "Replacement spawn failed, parking for retry");
                self.parked.push(ParkedRecovery {
                    failed,
                    image,
                    drafts,
                });
            }
        }
    }

    /// Adopts a machine and binds freshly minted jobs from `drafts` to it.
    fn assign_drafts_to_instance(&mut self, instance: RenderInstance, drafts: Vec<JobDraft>) {
        self.adopt_instance(&instance);

        let mut by_project: Vec<(ProjectId, Vec<JobDraft>)> = Vec::new();
        for draft in drafts {
            match by_project
                .iter_mut()
                .find(|(pid, _)| *pid == draft.project_id)
            {
                Some((_, group)) => group.push(draft),
                None => by_project.push((draft.project_id.clone(), vec![draft])),
            }
        }

        for (project_id, group) in by_project {
            match self.store.add_jobs(&project_id, group) {
                Ok(job_ids) => {
                    for job_id in job_ids {
                        if let Err(e) = self.store.bind_instance(job_id, &instance.id) {
                            error!(job_id = %job_id, error = %e, "Could not bind recovered job");
                            continue;
                        }
                        self.dispatch_start(job_id);
                    }
                    self.ensure_sweeper(&project_id);
                }
                Err(e) => {
                    error!(project_id = %project_id, error = %e, "Could not persist recovered jobs");
                }
            }
        }
    }

    // =========================================================================
    // Frames and sweeping
    // =========================================================================

    fn handle_frame(&mut self, record: JobFrame) {
        let mut frames = vec![record.last_frame_rendered];
        if let Some(batch) = &record.frames_rendered {
            frames.extend(batch.iter().copied());
        }
        for frame in frames {
            match self.store.record_frame(record.job_id, frame) {
                Ok(true) => debug!(job_id = %record.job_id, frame, "Frame recorded"),
                Ok(false) => {} // duplicate, absorbed
                Err(e) => warn!(job_id = %record.job_id, frame, error = %e, "Dropping frame report"),
            }
        }
    }

    fn handle_sweep(&mut self, project_id: ProjectId) {
        self.retry_parked();

        let candidates = self.store.instances_with_all_jobs_done(&project_id);
        if candidates.is_empty() {
            return;
        }
        let newly = self.store.try_queue_terminate(&candidates);
        if newly.is_empty() {
            return;
        }
        info!(project_id = %project_id, count = newly.len(), "Reaping finished instances");
        self.launch_terminate(newly);
    }

    fn retry_parked(&mut self) {
        if self.parked.is_empty() {
            return;
        }
        let parked = std::mem::take(&mut self.parked);
        for recovery in parked {
            self.store.clear_pending_spawn(&recovery.failed);
            info!(failed = %recovery.failed, "Retrying parked replacement spawn");
            self.launch_replacement(recovery.failed, recovery.image, recovery.drafts);
        }
    }

    fn launch_terminate(&self, instance_ids: Vec<InstanceId>) {
        let resources = Arc::clone(&self.resources);
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let outcome = resources.terminate(&instance_ids).await;
            let _ = events
                .send(DriverEvent::TerminateResolved {
                    instance_ids,
                    outcome,
                })
                .await;
        });
    }

    fn handle_terminate_resolved(
        &mut self,
        instance_ids: Vec<InstanceId>,
        outcome: Result<(), ResourceError>,
    ) {
        match outcome {
            Ok(()) => {
                for id in &instance_ids {
                    self.store.remove_instance(id);
                }
                info!(count = instance_ids.len(), "Instances reaped");
            }
            Err(e) => {
                // Clearing the queue entries lets the next sweep retry; the
                // sweeper is the only re-trigger source for termination.
                warn!(error = %e, "Termination failed; will retry on a later sweep");
                for id in &instance_ids {
                    self.store.clear_pending_terminate(id);
                }
            }
        }
    }

    // =========================================================================
    // Shared helpers
    // =========================================================================

    fn adopt_instance(&mut self, instance: &RenderInstance) {
        self.store.add_instance(instance.clone());
        let handle = self.heartbeats.watch(instance.clone());
        self.store.set_heartbeat(&instance.id, handle);
    }

    fn dispatch_start(&self, job_id: JobId) {
        let Some(job) = self.store.job(job_id).cloned() else {
            return;
        };
        let dispatcher = Arc::clone(&self.dispatcher);
        tokio::spawn(async move {
            // The dispatcher retries while the worker boots; an error here
            // means the job was rejected outright.
            if let Err(e) = dispatcher.start_job(&job).await {
                error!(job_id = %job.id, error = %e, "Job dispatch failed");
            }
        });
    }

    fn ensure_sweeper(&mut self, project_id: &ProjectId) {
        if !self.sweeping.insert(project_id.clone()) {
            return;
        }
        let sweeper = CompletionSweeper::new(
            project_id.clone(),
            self.config.sweep_interval,
            self.events_tx.clone(),
        );
        tokio::spawn(sweeper.run(self.shutdown.clone()));
    }

    fn start_frame_consumer(&self, queue: MessageQ) {
        let connector = Arc::clone(&self.connector);
        let resources = Arc::clone(&self.resources);
        let events = self.events_tx.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            match connector.connect(&queue).await {
                Ok(feed) => {
                    FrameReconciler::new(resources, events).run(feed, shutdown).await;
                }
                Err(e) => {
                    error!(host = %queue.host, error = %e, "Could not connect frame feed");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::ChannelFeedConnector;
    use crate::providers::{
        MockJobDispatcher, MockMachineProvider, MockStorageProvider, ScriptedHealthProbe,
    };
    use drender_protocol::{ProjectAction, SoftwareTag};
    use std::time::Duration;

    fn request(id: &str, start: u32, end: u32, per_machine: u32) -> ProjectRequest {
        ProjectRequest {
            id: ProjectId::parse(id).unwrap(),
            source: S3Source::new("assets", format!("{id}/scene.blend")),
            start_frame: start,
            end_frame: end,
            frames_per_machine: per_machine,
            software: SoftwareTag::new("blender"),
            public_ip: "203.0.113.4".into(),
            action: ProjectAction::Start,
        }
    }

    fn spawn_driver() -> DriverHandle {
        let machines = Arc::new(MockMachineProvider::new());
        let storage = Arc::new(MockStorageProvider::new());
        let probe = Arc::new(ScriptedHealthProbe::new());
        let config = DriverConfig {
            heartbeat_interval: Duration::from_millis(50),
            probe_timeout: Duration::from_millis(100),
            sweep_interval: Duration::from_millis(50),
            ..DriverConfig::default()
        };
        let resources = Arc::new(ResourceManager::new(
            &config,
            machines,
            storage,
            probe.clone(),
        ));
        let (connector, _feed_tx) = ChannelFeedConnector::pair(64);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        // Leak the shutdown sender so the loop lives for the whole test.
        std::mem::forget(_shutdown_tx);

        let (driver, handle) = Driver::new(
            config,
            BrokerConfig::default(),
            ImageCatalog::default(),
            resources,
            probe,
            Arc::new(MockJobDispatcher::new()),
            Arc::new(connector),
            shutdown_rx,
        );
        tokio::spawn(driver.run());
        handle
    }

    #[tokio::test]
    async fn test_status_of_unknown_project_is_empty() {
        let handle = spawn_driver();
        let response = handle
            .status(ProjectId::parse("nope").unwrap())
            .await
            .unwrap();
        assert!(response.id.is_none());
        assert_eq!(serde_json::to_string(&response).unwrap(), "{}");
    }

    #[tokio::test]
    async fn test_start_partitions_and_binds_fleet() {
        let handle = spawn_driver();
        let response = handle.start_project(request("film-01", 1, 5, 2)).await.unwrap();

        assert_eq!(response.id.unwrap().as_str(), "film-01");
        assert_eq!(response.is_complete, Some(false));
        let log = response.log.unwrap();
        assert_eq!(log.jobs.len(), 3);
        let ranges: Vec<(u32, u32)> = log
            .jobs
            .iter()
            .map(|j| (j.start_frame, j.end_frame))
            .collect();
        assert_eq!(ranges, vec![(1, 2), (3, 4), (5, 5)]);
        for job in &log.jobs {
            assert!(job.is_active);
            assert!(job.instance_info.is_some());
            assert_eq!(job.frames_rendered, 0);
        }
        let output = response.output_uri.unwrap();
        assert_eq!(output.key, "film-01/output/");
    }

    #[tokio::test]
    async fn test_duplicate_start_rejected() {
        let handle = spawn_driver();
        handle.start_project(request("film-01", 1, 5, 2)).await.unwrap();
        let err = handle
            .start_project(request("film-01", 1, 5, 2))
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::ProjectAlreadyPresent(_)));
    }

    #[tokio::test]
    async fn test_invalid_range_rejected() {
        let handle = spawn_driver();
        let err = handle
            .start_project(request("film-01", 9, 3, 2))
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_zero_frames_per_machine_rejected() {
        let handle = spawn_driver();
        let err = handle
            .start_project(request("film-01", 1, 5, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_unknown_software_rejected() {
        let handle = spawn_driver();
        let mut req = request("film-01", 1, 5, 2);
        req.software = SoftwareTag::new("povray");
        let err = handle.start_project(req).await.unwrap_err();
        assert!(matches!(err, DriverError::UnknownSoftware(_)));
    }

    #[tokio::test]
    async fn test_second_broker_host_rejected() {
        let handle = spawn_driver();
        handle.start_project(request("film-01", 1, 5, 2)).await.unwrap();

        let mut req = request("film-02", 1, 5, 2);
        req.public_ip = "203.0.113.99".into();
        let err = handle.start_project(req).await.unwrap_err();
        assert!(matches!(err, DriverError::BrokerMismatch { .. }));

        // Same host is fine.
        handle.start_project(request("film-03", 1, 5, 2)).await.unwrap();
    }

    #[tokio::test]
    async fn test_single_frame_project_yields_one_job() {
        let handle = spawn_driver();
        let response = handle.start_project(request("film-01", 7, 7, 20)).await.unwrap();
        let log = response.log.unwrap();
        assert_eq!(log.jobs.len(), 1);
        assert_eq!(log.jobs[0].start_frame, 7);
        assert_eq!(log.jobs[0].end_frame, 7);
    }
}
