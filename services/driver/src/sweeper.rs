//! Completion sweeper: periodic reap of instances whose jobs are all done.
//!
//! One sweeper task per project. The task only emits ticks; the driver owns
//! the candidate scan and the termination chain, so every store read stays on
//! the event loop.

use std::time::Duration;

use drender_id::ProjectId;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use crate::driver::DriverEvent;

pub struct CompletionSweeper {
    project_id: ProjectId,
    interval: Duration,
    events: mpsc::Sender<DriverEvent>,
}

impl CompletionSweeper {
    pub fn new(
        project_id: ProjectId,
        interval: Duration,
        events: mpsc::Sender<DriverEvent>,
    ) -> Self {
        Self {
            project_id,
            interval,
            events,
        }
    }

    /// Runs until shutdown is signaled or the driver goes away.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            project_id = %self.project_id,
            interval_secs = self.interval.as_secs(),
            "Starting completion sweeper"
        );

        let mut interval = tokio::time::interval(self.interval);
        // Nothing can be complete immediately after start; wait a period.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let event = DriverEvent::SweepTick {
                        project_id: self.project_id.clone(),
                    };
                    if self.events.send(event).await.is_err() {
                        debug!(project_id = %self.project_id, "Driver gone, sweeper stopping");
                        break;
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(project_id = %self.project_id, "Sweeper shutting down");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sweeper_emits_ticks_for_its_project() {
        let (tx, mut rx) = mpsc::channel(16);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let project_id = ProjectId::parse("film-01").unwrap();

        let sweeper =
            CompletionSweeper::new(project_id.clone(), Duration::from_millis(20), tx);
        tokio::spawn(sweeper.run(shutdown_rx));

        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("tick within deadline")
            .expect("channel open");
        match event {
            DriverEvent::SweepTick { project_id: got } => assert_eq!(got, project_id),
            other => panic!("expected SweepTick, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_sweeper_stops_on_shutdown() {
        let (tx, mut rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let sweeper = CompletionSweeper::new(
            ProjectId::parse("film-01").unwrap(),
            Duration::from_millis(10),
            tx,
        );
        let task = tokio::spawn(sweeper.run(shutdown_rx));

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("sweeper exits on shutdown")
            .unwrap();
        while rx.try_recv().is_ok() {}
        assert!(rx.try_recv().is_err());
    }
}
