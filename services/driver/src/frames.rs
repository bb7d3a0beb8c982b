//! Frame-completion intake.
//!
//! Workers publish [`JobFrame`] records on the broker; the reconciler
//! verifies each reported object actually exists in storage before the frame
//! is recorded. Records for deactivated jobs are still forwarded: a frame a
//! superseded worker managed to write counts toward project completion.
//!
//! The broker itself is an external collaborator. [`FrameFeed`] abstracts a
//! consumed queue; [`ChannelFeedConnector`] is the in-process implementation
//! used by tests and the development shell.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use drender_protocol::{JobFrame, MessageQ};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

use crate::driver::DriverEvent;
use crate::resources::ResourceManager;

/// A consumed stream of worker frame notifications.
#[async_trait]
pub trait FrameFeed: Send {
    /// Next record, or `None` once the feed is closed.
    async fn next(&mut self) -> Option<JobFrame>;
}

/// Connects a [`FrameFeed`] to broker coordinates.
///
/// The driver connects exactly once, when the first START fixes the broker
/// host.
#[async_trait]
pub trait FrameFeedConnector: Send + Sync {
    async fn connect(&self, queue: &MessageQ) -> Result<Box<dyn FrameFeed>>;
}

/// In-process feed over a tokio channel.
pub struct ChannelFrameFeed {
    rx: mpsc::Receiver<JobFrame>,
}

#[async_trait]
impl FrameFeed for ChannelFrameFeed {
    async fn next(&mut self) -> Option<JobFrame> {
        self.rx.recv().await
    }
}

/// Connector handing out a pre-built channel feed.
pub struct ChannelFeedConnector {
    rx: Mutex<Option<mpsc::Receiver<JobFrame>>>,
}

impl ChannelFeedConnector {
    /// Returns a connector and the sender side workers (or tests) publish to.
    pub fn pair(capacity: usize) -> (Self, mpsc::Sender<JobFrame>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                rx: Mutex::new(Some(rx)),
            },
            tx,
        )
    }
}

#[async_trait]
impl FrameFeedConnector for ChannelFeedConnector {
    async fn connect(&self, queue: &MessageQ) -> Result<Box<dyn FrameFeed>> {
        let rx = self
            .rx
            .lock()
            .await
            .take()
            .ok_or_else(|| anyhow::anyhow!("channel feed already connected"))?;
        info!(host = %queue.host, queue = %queue.queue_name, "Frame feed connected");
        Ok(Box::new(ChannelFrameFeed { rx }))
    }
}

/// Consumes the feed, verifies storage, and forwards verified frames to the
/// driver.
pub struct FrameReconciler {
    resources: Arc<ResourceManager>,
    events: mpsc::Sender<DriverEvent>,
}

impl FrameReconciler {
    pub fn new(resources: Arc<ResourceManager>, events: mpsc::Sender<DriverEvent>) -> Self {
        Self { resources, events }
    }

    /// Runs until the feed closes or shutdown is signaled.
    pub async fn run(self, mut feed: Box<dyn FrameFeed>, mut shutdown: watch::Receiver<bool>) {
        info!("Frame reconciler started");

        loop {
            let record = tokio::select! {
                biased;

                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Frame reconciler shutting down");
                        break;
                    }
                    continue;
                }

                record = feed.next() => match record {
                    Some(record) => record,
                    None => {
                        info!("Frame feed closed");
                        break;
                    }
                },
            };

            match self.resources.exists(&record.output_uri).await {
                Ok(true) => {
                    debug!(
                        job_id = %record.job_id,
                        frame = record.last_frame_rendered,
                        "Frame verified"
                    );
                    if self
                        .events
                        .send(DriverEvent::FrameVerified { record })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Ok(false) => {
                    // The worker may retry the notification once the object
                    // lands; dropping is safe.
                    warn!(
                        job_id = %record.job_id,
                        frame = record.last_frame_rendered,
                        output = %record.output_uri,
                        "Reported frame not found in storage, dropping"
                    );
                }
                Err(e) => {
                    warn!(
                        job_id = %record.job_id,
                        frame = record.last_frame_rendered,
                        error = %e,
                        "Storage check failed, dropping frame report"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DriverConfig;
    use crate::providers::{
        MockMachineProvider, MockStorageProvider, ScriptedHealthProbe,
    };
    use drender_id::JobId;
    use drender_protocol::S3Source;
    use std::time::Duration;

    fn setup() -> (
        Arc<MockStorageProvider>,
        mpsc::Sender<JobFrame>,
        mpsc::Receiver<DriverEvent>,
        watch::Sender<bool>,
    ) {
        let storage = Arc::new(MockStorageProvider::new());
        let resources = Arc::new(ResourceManager::new(
            &DriverConfig::default(),
            Arc::new(MockMachineProvider::new()),
            storage.clone(),
            Arc::new(ScriptedHealthProbe::new()),
        ));
        let (events_tx, events_rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (feed_tx, feed_rx) = mpsc::channel(16);

        let reconciler = FrameReconciler::new(resources, events_tx);
        tokio::spawn(reconciler.run(Box::new(ChannelFrameFeed { rx: feed_rx }), shutdown_rx));

        (storage, feed_tx, events_rx, shutdown_tx)
    }

    fn record(frame: u32, key: &str) -> JobFrame {
        JobFrame {
            job_id: JobId::new(),
            last_frame_rendered: frame,
            output_uri: S3Source::new("drender-output", key),
            frames_rendered: None,
        }
    }

    #[tokio::test]
    async fn test_verified_frame_is_forwarded() {
        let (storage, feed_tx, mut events_rx, _shutdown) = setup();
        let record = record(7, "p/output/frame-0007.png");
        storage.put(record.output_uri.clone());

        feed_tx.send(record.clone()).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(1), events_rx.recv())
            .await
            .expect("event within deadline")
            .expect("channel open");
        match event {
            DriverEvent::FrameVerified { record: got } => {
                assert_eq!(got.job_id, record.job_id);
                assert_eq!(got.last_frame_rendered, 7);
            }
            other => panic!("expected FrameVerified, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_object_is_dropped() {
        let (_storage, feed_tx, mut events_rx, _shutdown) = setup();
        feed_tx
            .send(record(7, "p/output/frame-0007.png"))
            .await
            .unwrap();

        let result = tokio::time::timeout(Duration::from_millis(150), events_rx.recv()).await;
        assert!(result.is_err(), "unverified frame must not be forwarded");
    }

    #[tokio::test]
    async fn test_connector_connects_once() {
        let (connector, _tx) = ChannelFeedConnector::pair(8);
        let queue = MessageQ {
            host: "203.0.113.4".into(),
            port: 5672,
            queue_name: "drender.driver.frames".into(),
        };
        assert!(connector.connect(&queue).await.is_ok());
        assert!(connector.connect(&queue).await.is_err());
    }
}
