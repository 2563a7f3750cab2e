use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::MissedTickBehavior,
};

use crate::core::sync::SyncEngine;

/// Confirms that the internet is actually reachable, not just the local link.
#[async_trait]
pub trait Probe: Send + Sync {
    async fn reachable(&self) -> bool;
}

/// Expects a 2xx from a highly available endpoint within a short timeout.
pub struct HttpProbe {
    client: Client,
    url: String,
}

impl HttpProbe {
    pub fn new(url: &str, timeout: Duration) -> anyhow::Result<Self> {
        Ok(HttpProbe {
            client: Client::builder().timeout(timeout).build()?,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn reachable(&self) -> bool {
        match self.client.get(&self.url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                log::debug!("Connectivity probe failed: {}", e);
                false
            }
        }
    }
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectivityStatus {
    Unknown,
    Offline,
    Online,
    /// Online and a sync completed this session; polling is paused
    Synced,
}

/// Per-session flags shared between the monitor task and its handles.
#[derive(Default, Debug)]
pub struct SessionState {
    has_synced: AtomicBool,
}

impl SessionState {
    pub fn has_synced(&self) -> bool {
        self.has_synced.load(Ordering::SeqCst)
    }

    fn set_synced(&self, synced: bool) {
        self.has_synced.store(synced, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Hint {
    /// Platform link state changed; a hint only
    LinkChanged { connected: bool },
    Foreground,
    /// Start of a new session, polling resumes
    Reset,
    Poll,
}

/// Control surface of a running monitor.
#[derive(Clone)]
pub struct MonitorHandle {
    hints: mpsc::UnboundedSender<Hint>,
    shutdown: Arc<watch::Sender<bool>>,
    status: watch::Receiver<ConnectivityStatus>,
    session: Arc<SessionState>,
}

impl MonitorHandle {
    fn hint(&self, hint: Hint) {
        if self.hints.send(hint).is_err() {
            log::debug!("Connectivity monitor already stopped, dropping {:?}", hint);
        }
    }

    pub fn link_changed(&self, connected: bool) {
        self.hint(Hint::LinkChanged { connected });
    }

    pub fn foreground(&self) {
        self.hint(Hint::Foreground);
    }

    pub fn reset(&self) {
        self.hint(Hint::Reset);
    }

    /// Stops polling. A sync already running is allowed to finish.
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    pub fn status(&self) -> ConnectivityStatus {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectivityStatus> {
        self.status.clone()
    }

    pub fn has_synced(&self) -> bool {
        self.session.has_synced()
    }
}

struct ConnectivityMonitor {
    probe: Arc<dyn Probe>,
    sync: Arc<SyncEngine>,
    session: Arc<SessionState>,
    status: watch::Sender<ConnectivityStatus>,
}

impl ConnectivityMonitor {
    fn set_status(&self, status: ConnectivityStatus) {
        self.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            log::info!("Connectivity: {:?} -> {:?}", current, status);
            *current = status;
            true
        });
    }

    async fn attempt(&self) {
        if !self.probe.reachable().await {
            self.set_status(ConnectivityStatus::Offline);
            return;
        }
        self.set_status(ConnectivityStatus::Online);

        match self.sync.sync().await {
            Ok(Some(report)) => {
                log::info!(
                    "Background sync uploaded {} and pulled {}",
                    report.uploaded,
                    report.pulled
                );
                self.session.set_synced(true);
                self.set_status(ConnectivityStatus::Synced);
            }
            Ok(None) => {}
            Err(e) => log::warn!("Background sync failed, will retry: {:#}", e),
        }
    }
}

/// Starts the monitor task.
///
/// It probes on every poll tick, link-up hint and foreground event until a
/// sync succeeds, then idles until [`MonitorHandle::reset`].
pub fn start_monitor(
    probe: Arc<dyn Probe>,
    sync: Arc<SyncEngine>,
    poll_interval: Duration,
) -> (MonitorHandle, JoinHandle<anyhow::Result<()>>) {
    let (hints_tx, mut hints) = mpsc::unbounded_channel();
    let (shutdown_tx, mut shutdown) = watch::channel(false);
    let (status_tx, status_rx) = watch::channel(ConnectivityStatus::Unknown);
    let session = Arc::new(SessionState::default());

    let monitor = ConnectivityMonitor {
        probe,
        sync,
        session: session.clone(),
        status: status_tx,
    };

    let handle = MonitorHandle {
        hints: hints_tx,
        shutdown: Arc::new(shutdown_tx),
        status: status_rx,
        session,
    };

    let task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let hint = tokio::select! {
                biased;
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                hint = hints.recv() => match hint {
                    Some(hint) => hint,
                    None => break,
                },
                _ = interval.tick(), if !monitor.session.has_synced() => Hint::Poll,
            };

            match hint {
                Hint::Reset => {
                    log::info!("New session, resuming connectivity polling");
                    monitor.session.set_synced(false);
                    monitor.set_status(ConnectivityStatus::Unknown);
                    interval.reset();
                }
                Hint::LinkChanged { connected: false } => {
                    monitor.set_status(ConnectivityStatus::Offline);
                    continue;
                }
                _ => {}
            }

            if !monitor.session.has_synced() {
                monitor.attempt().await;
            }
        }

        log::info!("Connectivity monitor stopped");
        Ok(())
    });

    (handle, task)
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::{atomic::AtomicUsize, Mutex},
    };

    use super::*;
    use crate::{
        core::{
            db::{
                tests::{profile, temp_db},
                ParticipantDb,
            },
            participant::{NewParticipant, Source},
        },
        integrations::remote::MemoryRemoteStore,
    };

    /// Answers from a script, then keeps repeating the last answer.
    struct ScriptedProbe {
        script: Mutex<VecDeque<bool>>,
        last: AtomicBool,
        calls: AtomicUsize,
    }

    impl ScriptedProbe {
        fn new(script: &[bool]) -> Arc<Self> {
            Arc::new(ScriptedProbe {
                script: Mutex::new(script.iter().copied().collect()),
                last: AtomicBool::new(false),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Probe for ScriptedProbe {
        async fn reachable(&self) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.script.lock().unwrap().pop_front() {
                Some(answer) => {
                    self.last.store(answer, Ordering::SeqCst);
                    answer
                }
                None => self.last.load(Ordering::SeqCst),
            }
        }
    }

    async fn onsite(db: &ParticipantDb, id: &str) {
        db.insert_if_absent(&NewParticipant::new(
            id,
            "CodeCrypt",
            profile("Isha", &format!("{}@example.com", id), ""),
            Source::OnSite,
        ))
        .await
        .unwrap();
    }

    async fn wait_for(handle: &MonitorHandle, status: ConnectivityStatus) {
        let mut rx = handle.subscribe();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == status))
            .await
            .expect("status not reached in time")
            .unwrap();
    }

    #[tokio::test]
    async fn test_polls_until_first_sync() {
        let (_dir, db) = temp_db().await;
        onsite(&db, "p1").await;
        let remote = Arc::new(MemoryRemoteStore::new());
        let sync = Arc::new(SyncEngine::new(db.clone(), remote.clone(), 50, false));
        let probe = ScriptedProbe::new(&[false, false, true]);

        let (handle, task) = start_monitor(probe.clone(), sync, Duration::from_millis(30));
        wait_for(&handle, ConnectivityStatus::Synced).await;
        assert!(handle.has_synced());
        assert_eq!(remote.len(), 1);

        let calls = probe.calls();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(probe.calls(), calls);

        handle.stop();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_failed_sync_is_retried() {
        let (_dir, db) = temp_db().await;
        onsite(&db, "p1").await;
        let remote = Arc::new(MemoryRemoteStore::new());
        remote.fail_next_writes(2);
        let sync = Arc::new(SyncEngine::new(db.clone(), remote.clone(), 50, false));

        let (handle, _task) =
            start_monitor(ScriptedProbe::new(&[true]), sync, Duration::from_millis(30));
        wait_for(&handle, ConnectivityStatus::Synced).await;
        assert!(db.list_pending(None).await.unwrap().is_empty());
        handle.stop();
    }

    #[tokio::test]
    async fn test_foreground_and_link_hints() {
        let (_dir, db) = temp_db().await;
        let sync = Arc::new(SyncEngine::new(
            db,
            Arc::new(MemoryRemoteStore::new()),
            50,
            false,
        ));
        let probe = ScriptedProbe::new(&[false, true]);

        // Polling effectively disabled, only hints drive attempts.
        let (handle, _task) = start_monitor(probe.clone(), sync, Duration::from_secs(3600));
        wait_for(&handle, ConnectivityStatus::Offline).await;

        handle.link_changed(false);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(probe.calls(), 1);

        handle.foreground();
        wait_for(&handle, ConnectivityStatus::Synced).await;
        assert_eq!(probe.calls(), 2);
        handle.stop();
    }

    #[tokio::test]
    async fn test_reset_resumes_after_sync() {
        let (_dir, db) = temp_db().await;
        let remote = Arc::new(MemoryRemoteStore::new());
        let sync = Arc::new(SyncEngine::new(db.clone(), remote.clone(), 50, false));

        let (handle, _task) = start_monitor(
            ScriptedProbe::new(&[true]),
            sync,
            Duration::from_millis(30),
        );
        wait_for(&handle, ConnectivityStatus::Synced).await;

        onsite(&db, "late").await;
        handle.reset();
        for _ in 0..100 {
            if remote.document("late").is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(remote.document("late").unwrap().events, vec!["CodeCrypt"]);
        wait_for(&handle, ConnectivityStatus::Synced).await;
        handle.stop();
    }

    #[tokio::test]
    async fn test_stop_ends_task() {
        let (_dir, db) = temp_db().await;
        let sync = Arc::new(SyncEngine::new(
            db,
            Arc::new(MemoryRemoteStore::offline()),
            50,
            false,
        ));
        let (handle, task) = start_monitor(
            ScriptedProbe::new(&[false]),
            sync,
            Duration::from_millis(10),
        );

        handle.stop();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        handle.foreground();
        assert!(!handle.has_synced());
    }
}
