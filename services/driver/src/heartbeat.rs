//! Per-instance liveness monitoring.
//!
//! Every instance bound to jobs gets a watcher task that probes its health
//! endpoint on a fixed period. Watchers only report "unhealthy"; choosing
//! between restart and replacement is the driver's call. The watcher keeps
//! ticking after a failure report; the driver's pending-action queues absorb
//! the duplicates while a recovery is in flight.

use std::sync::Arc;
use std::time::Duration;

use drender_protocol::RenderInstance;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::driver::DriverEvent;
use crate::providers::HealthProbe;

/// Cancellable handle to one instance's watcher task.
///
/// Cancellation is idempotent; dropping the handle also cancels. The state
/// store holds these so removing an instance tears its watcher down in the
/// same step.
#[derive(Debug)]
pub struct HeartbeatHandle {
    task: JoinHandle<()>,
}

impl HeartbeatHandle {
    pub fn cancel(&self) {
        self.task.abort();
    }
}

impl Drop for HeartbeatHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Spawns and configures heartbeat watcher tasks.
pub struct HeartbeatScheduler {
    probe: Arc<dyn HealthProbe>,
    interval: Duration,
    probe_timeout: Duration,
    events: mpsc::Sender<DriverEvent>,
}

impl HeartbeatScheduler {
    pub fn new(
        probe: Arc<dyn HealthProbe>,
        interval: Duration,
        probe_timeout: Duration,
        events: mpsc::Sender<DriverEvent>,
    ) -> Self {
        Self {
            probe,
            interval,
            probe_timeout,
            events,
        }
    }

    /// Starts watching an instance. The returned handle is the only way to
    /// stop the watcher.
    pub fn watch(&self, instance: RenderInstance) -> HeartbeatHandle {
        let probe = Arc::clone(&self.probe);
        let events = self.events.clone();
        let period = self.interval;
        let probe_timeout = self.probe_timeout;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The instance was just provisioned or verified; skip the
            // immediate first tick.
            ticker.tick().await;

            loop {
                ticker.tick().await;

                let healthy = tokio::time::timeout(probe_timeout, probe.check(&instance))
                    .await
                    .unwrap_or(false);

                if healthy {
                    debug!(instance_id = %instance.id, "Heartbeat ok");
                    continue;
                }

                warn!(instance_id = %instance.id, "Heartbeat failed");
                let event = DriverEvent::Unhealthy {
                    instance: instance.clone(),
                };
                if events.send(event).await.is_err() {
                    // Driver is gone; nothing left to report to.
                    break;
                }
            }
        });

        HeartbeatHandle { task }
    }

    /// Runs a single out-of-band probe (wire `HEARTBEAT_CHECK`), reporting an
    /// unhealthy result through the normal recovery path.
    pub fn probe_once(&self, instance: RenderInstance) {
        let probe = Arc::clone(&self.probe);
        let events = self.events.clone();
        let probe_timeout = self.probe_timeout;

        tokio::spawn(async move {
            let healthy = tokio::time::timeout(probe_timeout, probe.check(&instance))
                .await
                .unwrap_or(false);
            if !healthy {
                warn!(instance_id = %instance.id, "On-demand heartbeat check failed");
                let _ = events.send(DriverEvent::Unhealthy { instance }).await;
            }
        });
    }
}
