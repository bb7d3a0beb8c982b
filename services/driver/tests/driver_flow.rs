//! End-to-end driver scenarios over the mock providers and the channel feed.

use std::sync::Arc;
use std::time::Duration;

use drender_driver::config::{BrokerConfig, DriverConfig, ImageCatalog};
use drender_driver::driver::{Driver, DriverHandle};
use drender_driver::frames::ChannelFeedConnector;
use drender_driver::providers::{
    MockJobDispatcher, MockMachineProvider, MockStorageProvider, ScriptedHealthProbe,
};
use drender_driver::resources::ResourceManager;
use drender_id::{InstanceId, ProjectId};
use drender_protocol::{
    InstanceAction, InstanceHeartbeat, JobFrame, JobLogEntry, ProjectAction, ProjectRequest,
    ProjectResponse, RenderInstance, S3Source, SoftwareTag,
};
use tokio::sync::{mpsc, watch};

struct Harness {
    handle: DriverHandle,
    machines: Arc<MockMachineProvider>,
    storage: Arc<MockStorageProvider>,
    probe: Arc<ScriptedHealthProbe>,
    dispatcher: Arc<MockJobDispatcher>,
    feed: mpsc::Sender<JobFrame>,
    _shutdown: watch::Sender<bool>,
}

fn harness() -> Harness {
    let machines = Arc::new(MockMachineProvider::new());
    let storage = Arc::new(MockStorageProvider::new());
    let probe = Arc::new(ScriptedHealthProbe::new());
    let dispatcher = Arc::new(MockJobDispatcher::new());

    let config = DriverConfig {
        heartbeat_interval: Duration::from_millis(30),
        probe_timeout: Duration::from_millis(100),
        sweep_interval: Duration::from_millis(30),
        restart_timeout: Duration::from_millis(300),
        probe_poll: Duration::from_millis(10),
        ..DriverConfig::default()
    };

    let resources = Arc::new(ResourceManager::new(
        &config,
        machines.clone(),
        storage.clone(),
        probe.clone(),
    ));
    let (connector, feed) = ChannelFeedConnector::pair(256);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let (driver, handle) = Driver::new(
        config,
        BrokerConfig::default(),
        ImageCatalog::default(),
        resources,
        probe.clone(),
        dispatcher.clone(),
        Arc::new(connector),
        shutdown_rx,
    );
    tokio::spawn(driver.run());

    Harness {
        handle,
        machines,
        storage,
        probe,
        dispatcher,
        feed,
        _shutdown: shutdown_tx,
    }
}

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

async fn status(h: &Harness, id: &str) -> ProjectResponse {
    h.handle
        .status(ProjectId::parse(id).unwrap())
        .await
        .expect("driver alive")
}

fn active_job(response: &ProjectResponse, start: u32, end: u32) -> JobLogEntry {
    response
        .log
        .as_ref()
        .expect("log present")
        .jobs
        .iter()
        .find(|j| j.is_active && j.start_frame == start && j.end_frame == end)
        .unwrap_or_else(|| panic!("no active job [{start}..{end}]"))
        .clone()
}

/// Publishes a verified frame report: the object is placed in storage first,
/// then the worker notification is fed in.
async fn render_frame(h: &Harness, job: &JobLogEntry, output: &S3Source, frame: u32) {
    let object = output.object(&format!("frame-{frame:04}.png"));
    h.storage.put(object.clone());
    h.feed
        .send(JobFrame {
            job_id: job.id,
            last_frame_rendered: frame,
            output_uri: object,
            frames_rendered: None,
        })
        .await
        .expect("feed open");
}

const WAIT_BUDGET: Duration = Duration::from_secs(5);
const POLL: Duration = Duration::from_millis(10);

/// Polls the project status until `pred` accepts it; returns that status.
async fn wait_for_status<P>(h: &Harness, id: &str, what: &str, pred: P) -> ProjectResponse
where
    P: Fn(&ProjectResponse) -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT_BUDGET;
    loop {
        let response = status(h, id).await;
        if pred(&response) {
            return response;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for: {what}");
        }
        tokio::time::sleep(POLL).await;
    }
}

/// Polls a synchronous condition (mock call recorders and the like).
async fn wait_until<C>(what: &str, mut cond: C)
where
    C: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT_BUDGET;
    loop {
        if cond() {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for: {what}");
        }
        tokio::time::sleep(POLL).await;
    }
}

fn instance_of(job: &JobLogEntry) -> RenderInstance {
    job.instance_info.clone().expect("job bound to an instance")
}

fn active_ranges(response: &ProjectResponse) -> Vec<(u32, u32)> {
    response
        .log
        .as_ref()
        .expect("log present")
        .jobs
        .iter()
        .filter(|j| j.is_active)
        .map(|j| (j.start_frame, j.end_frame))
        .collect()
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn happy_path_renders_and_reaps_fleet() {
    let h = harness();
    let response = h
        .handle
        .start_project(request("film-01", 1, 5, 2))
        .await
        .unwrap();

    let output = response.output_uri.clone().unwrap();
    assert_eq!(response.is_complete, Some(false));
    let jobs = [
        active_job(&response, 1, 2),
        active_job(&response, 3, 4),
        active_job(&response, 5, 5),
    ];
    let instance_ids: Vec<InstanceId> = jobs.iter().map(|j| instance_of(j).id).collect();
    assert_eq!(h.machines.spawn_requests(), vec![3]);

    // Every job was dispatched to its worker.
    wait_until("all jobs dispatched", || {
        h.dispatcher.started_jobs().len() == 3
    })
    .await;

    render_frame(&h, &jobs[0], &output, 1).await;
    render_frame(&h, &jobs[0], &output, 2).await;
    render_frame(&h, &jobs[1], &output, 3).await;
    render_frame(&h, &jobs[1], &output, 4).await;
    render_frame(&h, &jobs[2], &output, 5).await;

    wait_for_status(&h, "film-01", "project completion", |r| {
        r.is_complete == Some(true)
    })
    .await;

    // The sweeper terminates the fleet and the store forgets the machines.
    wait_for_status(&h, "film-01", "fleet reaped", |r| {
        r.log
            .as_ref()
            .is_some_and(|log| log.jobs.iter().all(|j| j.instance_info.is_none()))
    })
    .await;

    let killed: Vec<InstanceId> = h.machines.kills().into_iter().flatten().collect();
    for id in instance_ids {
        assert!(killed.contains(&id), "instance {id} was not terminated");
    }
}

#[tokio::test]
async fn mid_job_crash_repartitions_unrendered_frames() {
    let h = harness();
    let response = h
        .handle
        .start_project(request("film-02", 1, 10, 10))
        .await
        .unwrap();
    let output = response.output_uri.clone().unwrap();
    let job = active_job(&response, 1, 10);
    let i1 = instance_of(&job);

    for frame in [1, 2, 3, 5] {
        render_frame(&h, &job, &output, frame).await;
    }
    wait_for_status(&h, "film-02", "partial progress recorded", |r| {
        r.log
            .as_ref()
            .is_some_and(|log| log.jobs[0].frames_rendered == 4)
    })
    .await;

    // The machine dies; its reboot fails too, forcing a replacement.
    h.machines.set_fail_reboots(true);
    h.probe.set_healthy(i1.id.clone(), false);

    let response = wait_for_status(&h, "film-02", "residual re-partition", |r| {
        active_ranges(r) == vec![(4, 4), (6, 10)]
    })
    .await;

    let old = response
        .log
        .as_ref()
        .unwrap()
        .jobs
        .iter()
        .find(|j| !j.is_active)
        .expect("original job deactivated")
        .clone();
    assert_eq!((old.start_frame, old.end_frame), (1, 10));
    assert_eq!(old.frames_rendered, 4);

    // Both residual sub-jobs land on the same replacement machine.
    let sub_a = active_job(&response, 4, 4);
    let sub_b = active_job(&response, 6, 10);
    let replacement = instance_of(&sub_a);
    assert_eq!(replacement.id, instance_of(&sub_b).id);
    assert_ne!(replacement.id, i1.id);

    render_frame(&h, &sub_a, &output, 4).await;
    for frame in 6..=10 {
        render_frame(&h, &sub_b, &output, frame).await;
    }

    wait_for_status(&h, "film-02", "project completion after recovery", |r| {
        r.is_complete == Some(true)
    })
    .await;
}

#[tokio::test]
async fn duplicate_unhealthy_reports_issue_one_restart() {
    let h = harness();
    let response = h
        .handle
        .start_project(request("film-03", 1, 4, 4))
        .await
        .unwrap();
    let job = active_job(&response, 1, 4);
    let i1 = instance_of(&job);

    // Two failure reports in quick succession; the machine itself reboots
    // fine, so the restart path verifies and rebinds.
    for _ in 0..2 {
        h.handle
            .instance_message(InstanceHeartbeat {
                instance: i1.clone(),
                action: InstanceAction::RestartMachine,
            })
            .await
            .unwrap();
    }

    wait_for_status(&h, "film-03", "job rebound after restart", |r| {
        let Some(log) = r.log.as_ref() else {
            return false;
        };
        log.jobs
            .iter()
            .any(|j| j.is_active && j.instance_info.as_ref().map(|i| &i.id) == Some(&i1.id))
            && log.jobs.iter().any(|j| !j.is_active)
    })
    .await;

    assert_eq!(
        h.machines.reboots(),
        vec![i1.id],
        "exactly one restart issued"
    );
    assert_eq!(
        h.machines.spawn_requests().len(),
        1,
        "no replacement spawned"
    );
}

#[tokio::test]
async fn stale_frame_for_deactivated_job_counts_toward_completion() {
    let h = harness();
    let response = h
        .handle
        .start_project(request("film-04", 1, 10, 10))
        .await
        .unwrap();
    let output = response.output_uri.clone().unwrap();
    let original = active_job(&response, 1, 10);
    let i1 = instance_of(&original);

    for frame in 1..=5 {
        render_frame(&h, &original, &output, frame).await;
    }
    wait_for_status(&h, "film-04", "initial progress", |r| {
        r.log
            .as_ref()
            .is_some_and(|log| log.jobs[0].frames_rendered == 5)
    })
    .await;

    h.machines.set_fail_reboots(true);
    h.probe.set_healthy(i1.id.clone(), false);

    wait_for_status(&h, "film-04", "recovery re-partition", |r| {
        r.log
            .as_ref()
            .is_some_and(|log| log.jobs.iter().any(|j| !j.is_active))
    })
    .await;

    // The superseded worker still manages to upload frame 6 and report it
    // against the deactivated job id.
    render_frame(&h, &original, &output, 6).await;
    wait_for_status(&h, "film-04", "stale frame recorded", |r| {
        r.log.as_ref().is_some_and(|log| {
            log.jobs
                .iter()
                .find(|j| !j.is_active)
                .map(|j| j.frames_rendered)
                == Some(6)
        })
    })
    .await;

    // The replacement covers [6..10]; frames 7..10 finish the project even
    // though frame 6 only ever landed on the dead job.
    let response = status(&h, "film-04").await;
    let residual = active_job(&response, 6, 10);
    for frame in 7..=10 {
        render_frame(&h, &residual, &output, frame).await;
    }

    wait_for_status(&h, "film-04", "completion including stale frame", |r| {
        r.is_complete == Some(true)
    })
    .await;
}

#[tokio::test]
async fn unverified_frame_report_is_dropped() {
    let h = harness();
    let response = h
        .handle
        .start_project(request("film-05", 1, 3, 3))
        .await
        .unwrap();
    let output = response.output_uri.clone().unwrap();
    let job = active_job(&response, 1, 3);

    // Report frame 2 without the object existing in storage.
    h.feed
        .send(JobFrame {
            job_id: job.id,
            last_frame_rendered: 2,
            output_uri: output.object("frame-0002.png"),
            frames_rendered: None,
        })
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    let response = status(&h, "film-05").await;
    assert_eq!(response.log.unwrap().jobs[0].frames_rendered, 0);
    assert_eq!(response.is_complete, Some(false));
}

#[tokio::test]
async fn batched_frame_report_records_every_frame() {
    let h = harness();
    let response = h
        .handle
        .start_project(request("film-06", 1, 5, 5))
        .await
        .unwrap();
    let output = response.output_uri.clone().unwrap();
    let job = active_job(&response, 1, 5);

    let object = output.object("frame-0003.png");
    h.storage.put(object.clone());
    h.feed
        .send(JobFrame {
            job_id: job.id,
            last_frame_rendered: 3,
            output_uri: object,
            frames_rendered: Some(vec![1, 2, 3]),
        })
        .await
        .unwrap();

    wait_for_status(&h, "film-06", "batch recorded", |r| {
        r.log
            .as_ref()
            .is_some_and(|log| log.jobs[0].frames_rendered == 3)
    })
    .await;
}

#[tokio::test]
async fn kill_machine_message_terminates_instance() {
    let h = harness();
    let response = h
        .handle
        .start_project(request("film-07", 1, 2, 2))
        .await
        .unwrap();
    let job = active_job(&response, 1, 2);
    let i1 = instance_of(&job);

    h.handle
        .instance_message(InstanceHeartbeat {
            instance: i1.clone(),
            action: InstanceAction::KillMachine,
        })
        .await
        .unwrap();

    wait_until("instance terminated", || {
        h.machines
            .kills()
            .into_iter()
            .flatten()
            .any(|id| id == i1.id)
    })
    .await;
}

#[tokio::test]
async fn failed_initial_provisioning_fails_the_start() {
    let h = harness();
    h.machines.set_fail_spawns(true);

    let err = h
        .handle
        .start_project(request("film-08", 1, 10, 5))
        .await
        .unwrap_err();
    assert!(matches!(err, drender_driver::DriverError::Provision(_)));

    // The project remains queryable; its jobs are dead.
    let response = status(&h, "film-08").await;
    assert!(response.log.unwrap().jobs.iter().all(|j| !j.is_active));
}
