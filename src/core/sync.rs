use std::sync::Arc;

use anyhow::anyhow;
use serde::Serialize;
use tokio::sync::{broadcast, Mutex};

use crate::integrations::remote::{documents_for, RemoteStore};

use super::db::ParticipantDb;

#[derive(Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub uploaded: usize,
    pub pulled: usize,
}

/// Progress notifications, for whoever is listening.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SyncEvent {
    Started,
    /// Another sync was already running, this trigger was dropped
    Coalesced,
    BatchCommitted { records: usize },
    BatchFailed { records: usize, reason: String },
    Pulled { inserted: usize },
    Finished(SyncReport),
    Failed { reason: String },
}

/// Reconciles the local store with the remote store.
///
/// The pending flag on each record is the upload queue. At most one sync runs
/// at a time; overlapping triggers return immediately.
pub struct SyncEngine {
    db: Arc<ParticipantDb>,
    remote: Arc<dyn RemoteStore>,
    batch_size: usize,
    pull_enabled: bool,
    in_flight: Mutex<()>,
    events: broadcast::Sender<SyncEvent>,
}

impl SyncEngine {
    pub fn new(
        db: Arc<ParticipantDb>,
        remote: Arc<dyn RemoteStore>,
        batch_size: usize,
        pull_enabled: bool,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        SyncEngine {
            db,
            remote,
            batch_size: batch_size.max(1),
            pull_enabled,
            in_flight: Mutex::new(()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: SyncEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    /// Uploads every pending record, one batch at a time.
    ///
    /// A batch is marked synced only after the remote confirmed it. The first
    /// failing batch stops the push and stays pending as a whole.
    pub async fn push(&self) -> anyhow::Result<usize> {
        let pending = self.db.list_pending(None).await?;
        if pending.is_empty() {
            return Ok(0);
        }

        log::info!("Uploading {} pending records", pending.len());
        let mut uploaded = 0;
        for batch in pending.chunks(self.batch_size) {
            if let Err(e) = self.remote.upsert_batch(documents_for(batch)).await {
                self.publish(SyncEvent::BatchFailed {
                    records: batch.len(),
                    reason: e.to_string(),
                });
                return Err(e.context(format!(
                    "Batch of {} records was not committed ({} uploaded before it)",
                    batch.len(),
                    uploaded
                )));
            }

            let acks: Vec<(String, String, i64)> = batch
                .iter()
                .map(|r| (r.participant_id.clone(), r.event_id.clone(), r.revision))
                .collect();
            let marked = self.db.mark_batch_synced(&acks).await?;
            if (marked as usize) < batch.len() {
                log::debug!(
                    "{} records changed during upload, keeping them pending",
                    batch.len() - marked as usize
                );
            }
            uploaded += batch.len();
            self.publish(SyncEvent::BatchCommitted {
                records: batch.len(),
            });
        }

        Ok(uploaded)
    }

    /// Inserts remote registrations that are missing locally.
    ///
    /// Existing records keep their admission and payment state.
    pub async fn pull(&self) -> anyhow::Result<usize> {
        if !self.pull_enabled {
            return Ok(0);
        }

        let docs = self.remote.fetch_all().await?;
        let mut inserted = 0;
        for doc in docs {
            for record in doc.local_records() {
                if self.db.insert_if_absent(&record).await? {
                    inserted += 1;
                }
            }
        }

        log::info!("Pulled {} new records from remote", inserted);
        self.publish(SyncEvent::Pulled { inserted });
        Ok(inserted)
    }

    /// Push then pull. `None` if another sync was already running.
    pub async fn sync(&self) -> anyhow::Result<Option<SyncReport>> {
        let Ok(_guard) = self.in_flight.try_lock() else {
            log::debug!("Sync already in progress, coalescing trigger");
            self.publish(SyncEvent::Coalesced);
            return Ok(None);
        };

        self.publish(SyncEvent::Started);
        let result = async {
            let uploaded = self.push().await?;
            let pulled = self.pull().await?;
            Ok::<_, anyhow::Error>(SyncReport { uploaded, pulled })
        }
        .await;

        match result {
            Ok(report) => {
                log::info!(
                    "Sync finished: {} uploaded, {} pulled",
                    report.uploaded,
                    report.pulled
                );
                self.publish(SyncEvent::Finished(report.clone()));
                Ok(Some(report))
            }
            Err(e) => {
                self.publish(SyncEvent::Failed {
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Like [`sync`](Self::sync), but a coalesced trigger is an error.
    pub async fn sync_now(&self) -> anyhow::Result<SyncReport> {
        self.sync()
            .await?
            .ok_or(anyhow!("A sync is already in progress"))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::{
        core::{
            db::tests::{profile, set_store_available, temp_db},
            participant::{NewParticipant, Source, SyncState},
        },
        integrations::remote::{MemoryRemoteStore, RemoteRegistration},
    };

    async fn onsite(db: &ParticipantDb, id: &str, event: &str) {
        db.insert_if_absent(&NewParticipant::new(
            id,
            event,
            profile("Deepa", &format!("{}@example.com", id), ""),
            Source::OnSite,
        ))
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_push_marks_synced_and_is_idempotent() {
        let (_dir, db) = temp_db().await;
        let remote = Arc::new(MemoryRemoteStore::new());
        let engine = SyncEngine::new(db.clone(), remote.clone(), 2, false);
        for i in 0..3 {
            onsite(&db, &format!("o{}", i), "CodeCrypt").await;
        }

        let report = engine.sync_now().await.unwrap();
        assert_eq!(report.uploaded, 3);
        assert_eq!(remote.len(), 3);
        assert_eq!(remote.commits(), 2);
        assert!(db.list_pending(None).await.unwrap().is_empty());

        assert_eq!(engine.push().await.unwrap(), 0);
        assert_eq!(remote.commits(), 2);
    }

    #[tokio::test]
    async fn test_failed_batch_stays_pending() {
        let (_dir, db) = temp_db().await;
        let remote = Arc::new(MemoryRemoteStore::new());
        let engine = SyncEngine::new(db.clone(), remote.clone(), 10, false);
        for i in 0..4 {
            onsite(&db, &format!("o{}", i), "WealthX").await;
        }

        remote.fail_next_writes(1);
        let mut events = engine.subscribe();
        assert!(engine.sync().await.is_err());
        assert_eq!(db.list_pending(None).await.unwrap().len(), 4);
        assert!(remote.is_empty());

        assert_eq!(events.recv().await.unwrap(), SyncEvent::Started);
        assert!(matches!(
            events.recv().await.unwrap(),
            SyncEvent::BatchFailed { records: 4, .. }
        ));

        assert_eq!(engine.sync_now().await.unwrap().uploaded, 4);
        assert!(db.list_pending(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_devices_converge_on_event_lists() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let (_a_dir, device_a) = temp_db().await;
        let (_b_dir, device_b) = temp_db().await;
        onsite(&device_a, "shared", "CodeCrypt").await;
        onsite(&device_b, "shared", "LinkLogic").await;

        SyncEngine::new(device_a, remote.clone(), 50, false)
            .sync_now()
            .await
            .unwrap();
        SyncEngine::new(device_b, remote.clone(), 50, false)
            .sync_now()
            .await
            .unwrap();

        let doc = remote.document("shared").unwrap();
        assert_eq!(doc.events, vec!["CodeCrypt", "LinkLogic"]);
    }

    #[tokio::test]
    async fn test_pull_never_overwrites_local_state() {
        let (_dir, db) = temp_db().await;
        db.insert_if_absent(&NewParticipant::new(
            "web-1",
            "CodeCrypt",
            profile("Local Name", "web1@example.com", ""),
            Source::RemoteImport,
        ))
        .await
        .unwrap();
        db.increment_admission("web-1", "CodeCrypt", None)
            .await
            .unwrap();

        let remote = Arc::new(MemoryRemoteStore::with_documents(vec![RemoteRegistration {
            uid: "web-1".to_owned(),
            name: "Remote Name".to_owned(),
            email: "web1@example.com".to_owned(),
            events: vec!["CodeCrypt".to_owned(), "AlgoPulse".to_owned()],
            ..Default::default()
        }]));

        let disabled = SyncEngine::new(db.clone(), remote.clone(), 50, false);
        assert_eq!(disabled.pull().await.unwrap(), 0);

        let engine = SyncEngine::new(db.clone(), remote, 50, true);
        assert_eq!(engine.pull().await.unwrap(), 1);
        assert_eq!(engine.pull().await.unwrap(), 0);

        let local = db.find_by_key("web-1", "CodeCrypt").await.unwrap().unwrap();
        assert_eq!(local.profile.name, "Local Name");
        assert_eq!(local.admission_count, 1);

        let pulled = db.find_by_key("web-1", "AlgoPulse").await.unwrap().unwrap();
        assert_eq!(pulled.sync_state, SyncState::Synced);
        assert_eq!(pulled.admission_count, 0);
    }

    struct SlowRemote(MemoryRemoteStore);

    #[async_trait]
    impl RemoteStore for SlowRemote {
        async fn upsert_batch(&self, docs: Vec<RemoteRegistration>) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_millis(100)).await;
            self.0.upsert_batch(docs).await
        }

        async fn fetch_all(&self) -> anyhow::Result<Vec<RemoteRegistration>> {
            self.0.fetch_all().await
        }

        async fn fetch(&self, uid: &str) -> anyhow::Result<Option<RemoteRegistration>> {
            self.0.fetch(uid).await
        }
    }

    #[tokio::test]
    async fn test_overlapping_triggers_are_coalesced() {
        let (_dir, db) = temp_db().await;
        onsite(&db, "o1", "Pitchfest").await;
        let remote = Arc::new(SlowRemote(MemoryRemoteStore::new()));
        let engine = SyncEngine::new(db, remote.clone(), 50, false);

        let (first, second) = tokio::join!(engine.sync(), engine.sync());
        let ran = [first.unwrap(), second.unwrap()];

        assert_eq!(ran.iter().filter(|r| r.is_some()).count(), 1);
        assert_eq!(remote.0.commits(), 1);
    }

    /// Accepts the upload, then takes the local store offline before the
    /// acknowledgement.
    struct StoreOutageRemote {
        inner: MemoryRemoteStore,
        db: Arc<ParticipantDb>,
    }

    #[async_trait]
    impl RemoteStore for StoreOutageRemote {
        async fn upsert_batch(&self, docs: Vec<RemoteRegistration>) -> anyhow::Result<()> {
            self.inner.upsert_batch(docs).await?;
            set_store_available(&self.db, false).await;
            Ok(())
        }

        async fn fetch_all(&self) -> anyhow::Result<Vec<RemoteRegistration>> {
            self.inner.fetch_all().await
        }

        async fn fetch(&self, uid: &str) -> anyhow::Result<Option<RemoteRegistration>> {
            self.inner.fetch(uid).await
        }
    }

    #[tokio::test]
    async fn test_failed_acknowledgement_keeps_whole_batch_pending() {
        let (_dir, db) = temp_db().await;
        for i in 0..3 {
            onsite(&db, &format!("o{}", i), "CodeCrypt").await;
        }
        let remote = Arc::new(StoreOutageRemote {
            inner: MemoryRemoteStore::new(),
            db: db.clone(),
        });
        let engine = SyncEngine::new(db.clone(), remote.clone(), 50, false);

        assert!(engine.push().await.is_err());
        set_store_available(&db, true).await;
        assert_eq!(remote.inner.len(), 3);
        assert_eq!(db.list_pending(None).await.unwrap().len(), 3);
    }
}
