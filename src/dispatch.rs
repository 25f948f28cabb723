//! Background delivery of audit events and notifications.
//!
//! The pipeline only enqueues; a spawned worker appends to the activity log
//! (with exponential backoff) and publishes notifications. Nothing the
//! worker does can fail or delay the request that produced the job.

use crate::{
    domain::ActivityLog,
    errors::ActivityError,
    models::ActivityEvent,
    notifications::{Notification, NotificationRouter},
};
use backoff::ExponentialBackoffBuilder;
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};

const DEFAULT_RETRY_WINDOW: Duration = Duration::from_secs(5);

enum Job {
    Record(ActivityEvent),
    Notify(Notification),
    Flush(oneshot::Sender<()>),
}

/// Cloneable handle used to enqueue side effects.
#[derive(Clone)]
pub struct SideEffects {
    tx: mpsc::Sender<Job>,
}

struct SideEffectWorker {
    rx: mpsc::Receiver<Job>,
    activity_log: Arc<dyn ActivityLog>,
    router: NotificationRouter,
    retry_window: Duration,
}

impl SideEffects {
    /// Creates the queue and spawns its worker on the current runtime.
    pub fn spawn(activity_log: Arc<dyn ActivityLog>, router: NotificationRouter, capacity: usize) -> (Self, JoinHandle<()>) {
        Self::spawn_with_retry(activity_log, router, capacity, DEFAULT_RETRY_WINDOW)
    }

    pub fn spawn_with_retry(
        activity_log: Arc<dyn ActivityLog>,
        router: NotificationRouter,
        capacity: usize,
        retry_window: Duration,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity);
        let worker = SideEffectWorker {
            rx,
            activity_log,
            router,
            retry_window,
        };
        (Self { tx }, tokio::spawn(worker.run()))
    }

    pub fn record(&self, event: ActivityEvent) {
        let action = event.action;
        self.enqueue(Job::Record(event), action.as_str());
    }

    pub fn notify(&self, notification: Notification) {
        let kind = notification.kind;
        self.enqueue(Job::Notify(notification), kind.as_str());
    }

    /// Resolves once every job enqueued before this call has been handled.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(Job::Flush(ack_tx)).await.is_err() {
            tracing::warn!("Side-effect worker is gone, nothing to flush");
            return;
        }
        let _ = ack_rx.await;
    }

    fn enqueue(&self, job: Job, what: &'static str) {
        match self.tx.try_send(job) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(job = what, "Side-effect queue full, dropping job");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::warn!(job = what, "Side-effect worker stopped, dropping job");
            }
        }
    }
}

impl SideEffectWorker {
    async fn run(mut self) {
        tracing::debug!("Side-effect worker started");
        while let Some(job) = self.rx.recv().await {
            match job {
                Job::Record(event) => append_with_retry(self.activity_log.as_ref(), &event, self.retry_window).await,
                Job::Notify(notification) => self.router.publish(&notification).await,
                Job::Flush(ack) => {
                    let _ = ack.send(());
                }
            }
        }
        tracing::debug!("Side-effect queue closed, worker exiting");
    }
}

async fn append_with_retry(activity_log: &dyn ActivityLog, event: &ActivityEvent, retry_window: Duration) {
    let policy = ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(50))
        .with_max_elapsed_time(Some(retry_window))
        .build();

    let result = backoff::future::retry(policy, || async {
        activity_log.append(event).await.map_err(|e| match e {
            ActivityError::Encoding(_) => backoff::Error::permanent(e),
            other => backoff::Error::transient(other),
        })
    })
    .await;

    if let Err(e) = result {
        tracing::error!(
            log_id = %event.log_id,
            action = event.action.as_str(),
            actor = %event.actor,
            error = %e,
            "Failed to record activity, dropping event"
        );
    }
}
