//! Connectivity tracking and the background triggers that drain the queue.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use fieldreg_core::ConnectivityState;
use fieldreg_storage::http::PROBE_TIMEOUT;
use fieldreg_storage::ApiClient;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info};

use crate::queue::{DrainOutcome, SyncQueue};

pub fn connectivity_channel(
    initial: ConnectivityState,
) -> (
    watch::Sender<ConnectivityState>,
    watch::Receiver<ConnectivityState>,
) {
    watch::channel(initial)
}

/// Polls the API root and publishes connectivity changes. Subscribers are only
/// woken when the state actually differs. Each probe is bounded by the smaller
/// of `every` and `PROBE_TIMEOUT`; ticks missed behind a slow probe are skipped.
pub fn spawn_http_probe(
    api: ApiClient,
    tx: watch::Sender<ConnectivityState>,
    every: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let limit = every.min(PROBE_TIMEOUT);
        loop {
            ticker.tick().await;
            let state = api.probe_within(limit).await;
            let changed = tx.send_if_modified(|current| {
                if *current == state {
                    return false;
                }
                *current = state;
                true
            });
            if changed {
                info!(online = state.is_online(), "connectivity changed");
            }
            if tx.is_closed() {
                debug!("no connectivity subscribers left; stopping probe");
                break;
            }
        }
    })
}

pub struct SyncService {
    queue: Arc<SyncQueue>,
    connectivity: watch::Receiver<ConnectivityState>,
    interval: Duration,
}

impl SyncService {
    pub fn new(
        queue: Arc<SyncQueue>,
        connectivity: watch::Receiver<ConnectivityState>,
        interval: Duration,
    ) -> Self {
        Self {
            queue,
            connectivity,
            interval,
        }
    }

    pub fn queue(&self) -> &Arc<SyncQueue> {
        &self.queue
    }

    pub fn is_online(&self) -> bool {
        self.connectivity.borrow().is_online()
    }

    /// Drains once at startup when already online, then on every
    /// offline-to-online transition.
    pub fn spawn_connectivity_listener(&self) -> JoinHandle<()> {
        let queue = self.queue.clone();
        let mut rx = self.connectivity.clone();
        tokio::spawn(async move {
            let mut was_online = rx.borrow_and_update().is_online();
            if was_online {
                log_drain("startup", queue.drain().await);
            }
            while rx.changed().await.is_ok() {
                let online = rx.borrow_and_update().is_online();
                if online && !was_online {
                    log_drain("reconnect", queue.drain().await);
                }
                was_online = online;
            }
            debug!("connectivity source closed; listener exiting");
        })
    }

    pub async fn build_scheduler(&self) -> Result<JobScheduler> {
        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let queue = self.queue.clone();
        let rx = self.connectivity.clone();
        let job = Job::new_repeated_async(self.interval, move |_uuid, _lock| {
            let queue = queue.clone();
            let online = rx.borrow().is_online();
            Box::pin(async move {
                if online {
                    log_drain("periodic", queue.drain().await);
                } else {
                    debug!("offline; skipping periodic drain");
                }
            })
        })
        .with_context(|| format!("creating periodic sync job every {:?}", self.interval))?;
        sched.add(job).await.context("adding periodic sync job")?;
        Ok(sched)
    }

    pub async fn maybe_build_scheduler(&self, enabled: bool) -> Result<Option<JobScheduler>> {
        if !enabled {
            return Ok(None);
        }
        self.build_scheduler().await.map(Some)
    }
}

fn log_drain(trigger: &str, outcome: DrainOutcome) {
    match outcome {
        DrainOutcome::Completed(summary) => debug!(
            trigger,
            synced = summary.synced,
            failed = summary.failed,
            "triggered drain completed"
        ),
        DrainOutcome::AlreadyRunning => debug!(trigger, "drain skipped; one is already running"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::SyncBackend;
    use crate::queue::QueuePolicy;
    use async_trait::async_trait;
    use fieldreg_core::{MutationKind, QueueItem};
    use fieldreg_storage::{MemoryStore, RemoteError};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingBackend {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SyncBackend for CountingBackend {
        async fn submit(&self, _item: &QueueItem) -> Result<(), RemoteError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    async fn wait_until_empty(queue: &SyncQueue) -> bool {
        for _ in 0..100 {
            if queue.get_queue().await.is_empty() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    fn service(initial: ConnectivityState) -> (SyncService, watch::Sender<ConnectivityState>, Arc<CountingBackend>) {
        let backend = Arc::new(CountingBackend::default());
        let queue = Arc::new(SyncQueue::new(
            Arc::new(MemoryStore::new()),
            backend.clone(),
            QueuePolicy::default(),
        ));
        let (tx, rx) = connectivity_channel(initial);
        (SyncService::new(queue, rx, Duration::from_secs(30)), tx, backend)
    }

    #[tokio::test]
    async fn reconnect_triggers_a_drain() {
        let (service, tx, backend) = service(ConnectivityState::offline());
        service
            .queue()
            .enqueue(MutationKind::CreatePerson, json!({"name": "a"}))
            .await
            .expect("enqueue");

        let listener = service.spawn_connectivity_listener();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);

        tx.send(ConnectivityState::online()).expect("send");
        assert!(wait_until_empty(service.queue()).await);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
        listener.abort();
    }

    #[tokio::test]
    async fn startup_drains_when_already_online() {
        let (service, _tx, backend) = service(ConnectivityState::online());
        service
            .queue()
            .enqueue(MutationKind::SubmitSurvey, json!({"name": "s"}))
            .await
            .expect("enqueue");

        let listener = service.spawn_connectivity_listener();
        assert!(wait_until_empty(service.queue()).await);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
        listener.abort();
    }

    #[tokio::test]
    async fn staying_online_does_not_retrigger() {
        let (service, tx, backend) = service(ConnectivityState::online());
        let listener = service.spawn_connectivity_listener();
        tokio::time::sleep(Duration::from_millis(20)).await;

        service
            .queue()
            .enqueue(MutationKind::CreatePerson, json!({"name": "later"}))
            .await
            .expect("enqueue");
        tx.send(ConnectivityState {
            is_connected: true,
            is_internet_reachable: true,
        })
        .expect("send");
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
        assert_eq!(service.queue().pending_count().await, 1);
        listener.abort();
    }

    #[tokio::test]
    async fn scheduler_is_optional() {
        let (service, _tx, _backend) = service(ConnectivityState::offline());
        assert!(service
            .maybe_build_scheduler(false)
            .await
            .expect("build")
            .is_none());
        assert!(!service.is_online());
    }

    #[tokio::test]
    async fn hung_backend_is_published_as_offline_promptly() {
        use fieldreg_storage::ApiConfig;
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(30)))
            .mount(&server)
            .await;
        let api = ApiClient::new(ApiConfig {
            base_url: server.uri(),
            ..ApiConfig::default()
        })
        .expect("client");

        let (tx, mut rx) = connectivity_channel(ConnectivityState::online());
        let probe = spawn_http_probe(api, tx, Duration::from_millis(100));
        tokio::time::timeout(Duration::from_secs(2), rx.changed())
            .await
            .expect("state published before the client timeout")
            .expect("sender alive");
        assert!(!rx.borrow().is_online());
        probe.abort();
    }
}
