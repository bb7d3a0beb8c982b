//! Capability traits for external collaborators, plus mock implementations.
//!
//! The driver never talks to a cloud, an object store, a worker, or a broker
//! directly; each sits behind a trait here. Mock implementations back the
//! test suite and the development shell. Production deployments plug in real
//! providers at the `main` wiring point.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use drender_id::InstanceId;
use drender_protocol::{InstanceState, Job, MachineImage, RenderInstance, S3Source};
use tracing::{debug, info};

// =============================================================================
// Traits
// =============================================================================

/// Machine lifecycle operations of the cloud provider.
#[async_trait]
pub trait MachineProvider: Send + Sync {
    /// Provision `count` machines booting `image`. Blocking under the hood.
    async fn start_machines(&self, image: &MachineImage, count: usize)
        -> Result<Vec<RenderInstance>>;

    /// Reboot one machine in place.
    async fn reboot_machine(&self, id: &InstanceId) -> Result<()>;

    /// Terminate machines. The provider acks once the request is accepted.
    async fn kill_machines(&self, ids: &[InstanceId]) -> Result<()>;
}

/// Object-store operations.
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Create (idempotently) the storage area for the given key prefix.
    async fn create_storage(&self, prefix: &str) -> Result<S3Source>;

    /// Whether an object exists at the given address.
    async fn exists(&self, source: &S3Source) -> Result<bool>;
}

/// A single liveness check against one worker machine.
///
/// Probe transport failures count as unhealthy; the caller applies its own
/// timeout budget.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check(&self, instance: &RenderInstance) -> bool;
}

/// Delivers a START message to the worker bound to a job.
///
/// Implementations are expected to retry while the worker boots; the driver
/// sends exactly one START per job and does not wait for readiness.
#[async_trait]
pub trait JobDispatcher: Send + Sync {
    async fn start_job(&self, job: &Job) -> Result<()>;
}

// =============================================================================
// HTTP health probe
// =============================================================================

/// Probes `GET http://{publicIP}:{port}{path}` and treats any 2xx as healthy.
pub struct HttpHealthProbe {
    client: reqwest::Client,
    port: u16,
    path: String,
}

impl HttpHealthProbe {
    pub const DEFAULT_PORT: u16 = 8080;
    pub const DEFAULT_PATH: &'static str = "/nodeStatus";

    pub fn new(request_timeout: Duration) -> Self {
        Self::with_endpoint(request_timeout, Self::DEFAULT_PORT, Self::DEFAULT_PATH)
    }

    pub fn with_endpoint(request_timeout: Duration, port: u16, path: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .unwrap_or_default();
        Self {
            client,
            port,
            path: path.to_string(),
        }
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn check(&self, instance: &RenderInstance) -> bool {
        let url = format!("http://{}:{}{}", instance.public_ip, self.port, self.path);
        match self.client.get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!(instance_id = %instance.id, error = %e, "Health probe failed");
                false
            }
        }
    }
}

// =============================================================================
// Mock implementations
// =============================================================================

/// Mock machine provider for testing and development.
///
/// Mints sequentially numbered instances and records every call so tests can
/// assert on provisioning behavior. Spawns and reboots can be switched to
/// fail at runtime.
pub struct MockMachineProvider {
    inner: Mutex<MockMachineState>,
}

#[derive(Default)]
struct MockMachineState {
    counter: u64,
    fail_spawns: bool,
    fail_reboots: bool,
    spawn_requests: Vec<usize>,
    reboots: Vec<InstanceId>,
    kills: Vec<Vec<InstanceId>>,
}

impl MockMachineProvider {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MockMachineState::default()),
        }
    }

    /// Makes subsequent spawn calls fail.
    pub fn set_fail_spawns(&self, fail: bool) {
        self.inner.lock().expect("mock poisoned").fail_spawns = fail;
    }

    /// Makes subsequent reboot calls fail.
    pub fn set_fail_reboots(&self, fail: bool) {
        self.inner.lock().expect("mock poisoned").fail_reboots = fail;
    }

    /// Counts of machines requested per spawn call, in order.
    pub fn spawn_requests(&self) -> Vec<usize> {
        self.inner.lock().expect("mock poisoned").spawn_requests.clone()
    }

    /// Every instance a reboot was requested for, in order.
    pub fn reboots(&self) -> Vec<InstanceId> {
        self.inner.lock().expect("mock poisoned").reboots.clone()
    }

    /// Every termination batch, in order.
    pub fn kills(&self) -> Vec<Vec<InstanceId>> {
        self.inner.lock().expect("mock poisoned").kills.clone()
    }
}

impl Default for MockMachineProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MachineProvider for MockMachineProvider {
    async fn start_machines(
        &self,
        image: &MachineImage,
        count: usize,
    ) -> Result<Vec<RenderInstance>> {
        let mut inner = self.inner.lock().expect("mock poisoned");
        inner.spawn_requests.push(count);
        if inner.fail_spawns {
            anyhow::bail!("mock provider configured to fail spawns");
        }

        let mut instances = Vec::with_capacity(count);
        for _ in 0..count {
            inner.counter += 1;
            let n = inner.counter;
            instances.push(RenderInstance {
                id: InstanceId::parse(format!("i-{n:08x}")).expect("generated id is valid"),
                public_ip: format!("10.1.{}.{}", n / 256, n % 256),
                private_ip: None,
                cloud_ami: image.clone(),
                state: InstanceState::Running,
            });
        }
        info!(count, image = %image, "[MOCK] Started machines");
        Ok(instances)
    }

    async fn reboot_machine(&self, id: &InstanceId) -> Result<()> {
        let mut inner = self.inner.lock().expect("mock poisoned");
        inner.reboots.push(id.clone());
        if inner.fail_reboots {
            anyhow::bail!("mock provider configured to fail reboots");
        }
        info!(instance_id = %id, "[MOCK] Rebooted machine");
        Ok(())
    }

    async fn kill_machines(&self, ids: &[InstanceId]) -> Result<()> {
        let mut inner = self.inner.lock().expect("mock poisoned");
        inner.kills.push(ids.to_vec());
        info!(count = ids.len(), "[MOCK] Terminated machines");
        Ok(())
    }
}

/// Mock object store backed by an in-memory object set.
pub struct MockStorageProvider {
    bucket: String,
    objects: Mutex<HashSet<S3Source>>,
}

impl MockStorageProvider {
    pub fn new() -> Self {
        Self {
            bucket: "drender-output".to_string(),
            objects: Mutex::new(HashSet::new()),
        }
    }

    /// Makes an object visible to subsequent existence checks.
    pub fn put(&self, source: S3Source) {
        self.objects.lock().expect("mock poisoned").insert(source);
    }
}

impl Default for MockStorageProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageProvider for MockStorageProvider {
    async fn create_storage(&self, prefix: &str) -> Result<S3Source> {
        debug!(prefix, "[MOCK] Created storage prefix");
        Ok(S3Source::new(self.bucket.clone(), prefix))
    }

    async fn exists(&self, source: &S3Source) -> Result<bool> {
        Ok(self.objects.lock().expect("mock poisoned").contains(source))
    }
}

/// Health probe with per-instance scripted results.
///
/// Unknown instances report healthy, so a fresh fleet stays quiet until a
/// test (or operator tooling) marks a machine down.
pub struct ScriptedHealthProbe {
    health: Mutex<HashMap<InstanceId, bool>>,
}

impl ScriptedHealthProbe {
    pub fn new() -> Self {
        Self {
            health: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_healthy(&self, id: InstanceId, healthy: bool) {
        self.health.lock().expect("mock poisoned").insert(id, healthy);
    }
}

impl Default for ScriptedHealthProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HealthProbe for ScriptedHealthProbe {
    async fn check(&self, instance: &RenderInstance) -> bool {
        self.health
            .lock()
            .expect("mock poisoned")
            .get(&instance.id)
            .copied()
            .unwrap_or(true)
    }
}

/// Dispatcher that records started jobs instead of contacting workers.
pub struct MockJobDispatcher {
    started: Mutex<Vec<Job>>,
}

impl MockJobDispatcher {
    pub fn new() -> Self {
        Self {
            started: Mutex::new(Vec::new()),
        }
    }

    pub fn started_jobs(&self) -> Vec<Job> {
        self.started.lock().expect("mock poisoned").clone()
    }
}

impl Default for MockJobDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobDispatcher for MockJobDispatcher {
    async fn start_job(&self, job: &Job) -> Result<()> {
        debug!(job_id = %job.id, frames = %job.frames(), "[MOCK] Dispatched job start");
        self.started.lock().expect("mock poisoned").push(job.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_machines_are_distinct() {
        let provider = MockMachineProvider::new();
        let image = MachineImage::new("ami-1");
        let a = provider.start_machines(&image, 2).await.unwrap();
        let b = provider.start_machines(&image, 1).await.unwrap();
        assert_eq!(a.len(), 2);
        assert_ne!(a[0].id, a[1].id);
        assert_ne!(a[1].id, b[0].id);
        assert_eq!(provider.spawn_requests(), vec![2, 1]);
    }

    #[tokio::test]
    async fn test_mock_machines_failing_spawns() {
        let provider = MockMachineProvider::new();
        provider.set_fail_spawns(true);
        let result = provider.start_machines(&MachineImage::new("ami-1"), 1).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_mock_storage_exists_after_put() {
        let storage = MockStorageProvider::new();
        let prefix = storage.create_storage("film-01/output/").await.unwrap();
        let frame = prefix.object("frame-0001.png");
        assert!(!storage.exists(&frame).await.unwrap());
        storage.put(frame.clone());
        assert!(storage.exists(&frame).await.unwrap());
    }

    #[tokio::test]
    async fn test_http_probe_hits_node_status() {
        use axum::{routing::get, Router};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().route("/nodeStatus", get(|| async { "ok" }));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let probe = HttpHealthProbe::with_endpoint(
            Duration::from_millis(500),
            addr.port(),
            HttpHealthProbe::DEFAULT_PATH,
        );
        let instance = RenderInstance {
            id: InstanceId::parse("i-local").unwrap(),
            public_ip: addr.ip().to_string(),
            private_ip: None,
            cloud_ami: MachineImage::new("ami-1"),
            state: InstanceState::Running,
        };
        assert!(probe.check(&instance).await);

        // A port nothing listens on reports unhealthy rather than erroring.
        let dead_probe =
            HttpHealthProbe::with_endpoint(Duration::from_millis(200), 1, "/nodeStatus");
        assert!(!dead_probe.check(&instance).await);
    }

    #[tokio::test]
    async fn test_scripted_probe_defaults_healthy() {
        let probe = ScriptedHealthProbe::new();
        let instance = RenderInstance {
            id: InstanceId::parse("i-1").unwrap(),
            public_ip: "10.0.0.1".into(),
            private_ip: None,
            cloud_ami: MachineImage::new("ami-1"),
            state: InstanceState::Running,
        };
        assert!(probe.check(&instance).await);
        probe.set_healthy(instance.id.clone(), false);
        assert!(!probe.check(&instance).await);
    }
}
