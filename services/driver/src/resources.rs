//! Resource manager: timeout-wrapped, concurrency-bounded cloud operations.
//!
//! Thin adapter over the [`MachineProvider`]/[`StorageProvider`] pair. Every
//! operation runs under a semaphore (the cloud worker pool) and a per-kind
//! timeout, so a hung provider call can neither starve the pool forever nor
//! wedge a recovery chain. The manager is stateless apart from its provider
//! handles and never touches driver state.

use std::sync::Arc;
use std::time::Duration;

use drender_id::{InstanceId, ProjectId};
use drender_protocol::{MachineImage, RenderInstance, S3Source};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument};

use crate::config::DriverConfig;
use crate::providers::{HealthProbe, MachineProvider, StorageProvider};

const OUTPUT_FOLDER: &str = "output";

/// Errors from cloud and storage operations.
#[derive(Debug, Error)]
pub enum ResourceError {
    /// The operation did not complete within its budget.
    #[error("{op} timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },

    /// The provider reported a failure.
    #[error("{op} failed: {source}")]
    Provider {
        op: &'static str,
        #[source]
        source: anyhow::Error,
    },

    /// The provider returned fewer machines than requested.
    #[error("spawn returned {got} machines, requested {requested}")]
    ShortSpawn { requested: usize, got: usize },

    /// The cloud worker pool has been closed.
    #[error("cloud worker pool closed")]
    PoolClosed,
}

/// Adapter over the cloud and storage providers.
pub struct ResourceManager {
    machines: Arc<dyn MachineProvider>,
    storage: Arc<dyn StorageProvider>,
    probe: Arc<dyn HealthProbe>,
    pool: Semaphore,
    spawn_timeout: Duration,
    restart_timeout: Duration,
    terminate_timeout: Duration,
    storage_timeout: Duration,
    probe_poll: Duration,
}

impl ResourceManager {
    pub fn new(
        config: &DriverConfig,
        machines: Arc<dyn MachineProvider>,
        storage: Arc<dyn StorageProvider>,
        probe: Arc<dyn HealthProbe>,
    ) -> Self {
        Self {
            machines,
            storage,
            probe,
            pool: Semaphore::new(config.cloud_pool_size),
            spawn_timeout: config.spawn_timeout,
            restart_timeout: config.restart_timeout,
            terminate_timeout: config.terminate_timeout,
            storage_timeout: config.storage_timeout,
            probe_poll: config.probe_poll,
        }
    }

    /// Provisions `count` machines booting `image`.
    #[instrument(skip(self))]
    pub async fn spawn(
        &self,
        image: &MachineImage,
        count: usize,
    ) -> Result<Vec<RenderInstance>, ResourceError> {
        let _permit = self
            .pool
            .acquire()
            .await
            .map_err(|_| ResourceError::PoolClosed)?;

        let instances = tokio::time::timeout(self.spawn_timeout, self.machines.start_machines(image, count))
            .await
            .map_err(|_| ResourceError::Timeout {
                op: "spawn",
                after: self.spawn_timeout,
            })?
            .map_err(|source| ResourceError::Provider { op: "spawn", source })?;

        if instances.len() != count {
            return Err(ResourceError::ShortSpawn {
                requested: count,
                got: instances.len(),
            });
        }

        info!(count, image = %image, "Machines provisioned");
        Ok(instances)
    }

    /// Reboots a machine and waits for its health endpoint to come back.
    ///
    /// Success means the probe answered within the restart budget; anything
    /// else is a failure and the caller escalates.
    #[instrument(skip(self, instance), fields(instance_id = %instance.id))]
    pub async fn restart(&self, instance: &RenderInstance) -> Result<(), ResourceError> {
        let _permit = self
            .pool
            .acquire()
            .await
            .map_err(|_| ResourceError::PoolClosed)?;

        let verified = tokio::time::timeout(self.restart_timeout, async {
            self.machines
                .reboot_machine(&instance.id)
                .await
                .map_err(|source| ResourceError::Provider { op: "restart", source })?;

            loop {
                if self.probe.check(instance).await {
                    return Ok(());
                }
                debug!(instance_id = %instance.id, "Rebooted machine not healthy yet");
                tokio::time::sleep(self.probe_poll).await;
            }
        })
        .await;

        match verified {
            Ok(result) => result.map(|()| {
                info!(instance_id = %instance.id, "Machine restarted and verified");
            }),
            Err(_) => Err(ResourceError::Timeout {
                op: "restart",
                after: self.restart_timeout,
            }),
        }
    }

    /// Terminates a batch of machines and awaits the provider ack.
    #[instrument(skip(self))]
    pub async fn terminate(&self, ids: &[InstanceId]) -> Result<(), ResourceError> {
        let _permit = self
            .pool
            .acquire()
            .await
            .map_err(|_| ResourceError::PoolClosed)?;

        tokio::time::timeout(self.terminate_timeout, self.machines.kill_machines(ids))
            .await
            .map_err(|_| ResourceError::Timeout {
                op: "terminate",
                after: self.terminate_timeout,
            })?
            .map_err(|source| ResourceError::Provider { op: "terminate", source })?;

        info!(count = ids.len(), "Machines terminated");
        Ok(())
    }

    /// Creates the output storage area for a project. Idempotent per project.
    #[instrument(skip(self))]
    pub async fn create_bucket(&self, project_id: &ProjectId) -> Result<S3Source, ResourceError> {
        let _permit = self
            .pool
            .acquire()
            .await
            .map_err(|_| ResourceError::PoolClosed)?;

        let prefix = format!("{project_id}/{OUTPUT_FOLDER}/");
        tokio::time::timeout(self.storage_timeout, self.storage.create_storage(&prefix))
            .await
            .map_err(|_| ResourceError::Timeout {
                op: "create_bucket",
                after: self.storage_timeout,
            })?
            .map_err(|source| ResourceError::Provider {
                op: "create_bucket",
                source,
            })
    }

    /// Whether an object exists at the given address.
    pub async fn exists(&self, source: &S3Source) -> Result<bool, ResourceError> {
        let _permit = self
            .pool
            .acquire()
            .await
            .map_err(|_| ResourceError::PoolClosed)?;

        tokio::time::timeout(self.storage_timeout, self.storage.exists(source))
            .await
            .map_err(|_| ResourceError::Timeout {
                op: "exists",
                after: self.storage_timeout,
            })?
            .map_err(|source| ResourceError::Provider { op: "exists", source })
    }
}
