use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    time::Duration,
};

use anyhow::anyhow;
use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{
    core::participant::{NewParticipant, ParticipantRecord, Profile, Source},
    util::{format_millis, now_millis},
};

/// A fee payment attached to a registration document.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRecord {
    /// Stable per payment, so a re-sent payment merges instead of duplicating
    pub id: String,
    #[serde(default)]
    pub event_names: Vec<String>,
    #[serde(default)]
    pub verified: bool,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub amount: f64,
    #[serde(default)]
    pub date: String,
}

/// A participant document in the remote registration store.
///
/// Writes are merges: list fields grow by union and counters take the
/// maximum, so two devices uploading the same person converge.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct RemoteRegistration {
    pub uid: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub college: String,
    #[serde(default)]
    pub degree: String,
    #[serde(default)]
    pub department: String,
    #[serde(default)]
    pub year: String,
    #[serde(default)]
    pub events: Vec<String>,
    #[serde(default)]
    pub payments: Vec<PaymentRecord>,
    #[serde(default)]
    pub participated_events: Vec<String>,
    #[serde(default)]
    pub admission_counts: BTreeMap<String, i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<Source>,
}

fn union(into: &mut Vec<String>, from: Vec<String>) {
    for item in from {
        if !into.contains(&item) {
            into.push(item);
        }
    }
}

fn take_if_set(dst: &mut String, src: String) {
    if !src.trim().is_empty() {
        *dst = src;
    }
}

impl RemoteRegistration {
    /// The document contribution of one local participant-event record.
    pub fn from_record(record: &ParticipantRecord) -> Self {
        let event = record.event_id.clone();
        let profile = &record.profile;

        let payments = if record.payment_verified {
            vec![PaymentRecord {
                id: format!("onspot_{}_{}", record.participant_id, event),
                event_names: vec![event.clone()],
                verified: true,
                kind: match record.source {
                    Source::OnSite => "CASH_ONSPOT",
                    _ => "DESK_CONFIRMED",
                }
                .to_string(),
                amount: 0.0,
                date: format_millis(Some(now_millis())),
            }]
        } else {
            vec![]
        };

        let (participated_events, admission_counts) = if record.is_admitted() {
            (
                vec![event.clone()],
                BTreeMap::from([(event.clone(), record.admission_count)]),
            )
        } else {
            (vec![], BTreeMap::new())
        };

        RemoteRegistration {
            uid: record.participant_id.clone(),
            name: profile.name.clone(),
            display_name: Some(profile.name.clone()).filter(|n| !n.is_empty()),
            email: profile.email.clone(),
            phone: profile.phone.clone(),
            college: profile.college.clone(),
            degree: profile.degree.clone(),
            department: profile.department.clone(),
            year: profile.year.clone(),
            events: vec![event],
            payments,
            participated_events,
            admission_counts,
            source: Some(record.source),
        }
    }

    /// Applies a merge write on top of this document.
    pub fn merge(&mut self, other: RemoteRegistration) {
        take_if_set(&mut self.name, other.name);
        if other.display_name.is_some() {
            self.display_name = other.display_name;
        }
        take_if_set(&mut self.email, other.email);
        take_if_set(&mut self.phone, other.phone);
        take_if_set(&mut self.college, other.college);
        take_if_set(&mut self.degree, other.degree);
        take_if_set(&mut self.department, other.department);
        take_if_set(&mut self.year, other.year);

        union(&mut self.events, other.events);
        union(&mut self.participated_events, other.participated_events);

        for payment in other.payments {
            match self.payments.iter_mut().find(|p| p.id == payment.id) {
                Some(existing) => {
                    existing.verified |= payment.verified;
                    union(&mut existing.event_names, payment.event_names);
                }
                None => self.payments.push(payment),
            }
        }

        for (event, count) in other.admission_counts {
            let current = self.admission_counts.entry(event).or_insert(0);
            *current = (*current).max(count);
        }

        if self.source.is_none() {
            self.source = other.source;
        }
    }

    pub fn profile(&self) -> Profile {
        let name = self
            .display_name
            .clone()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| self.name.clone());

        Profile {
            name,
            email: self.email.clone(),
            phone: self.phone.clone(),
            college: self.college.clone(),
            degree: self.degree.clone(),
            department: self.department.clone(),
            year: self.year.clone(),
        }
    }

    pub fn payment_verified_for(&self, event_id: &str) -> bool {
        self.payments
            .iter()
            .any(|p| p.verified && p.event_names.iter().any(|e| e == event_id))
    }

    /// One local record per event this document registers for.
    pub fn local_records(&self) -> Vec<NewParticipant> {
        let profile = self.profile();
        self.events
            .iter()
            .filter(|e| !e.trim().is_empty())
            .map(|event| {
                NewParticipant::new(&self.uid, event, profile.clone(), Source::RemoteImport)
                    .with_payment_verified(self.payment_verified_for(event))
            })
            .collect()
    }
}

/// Folds records into one document per participant, ready for a batch write.
pub fn documents_for(records: &[ParticipantRecord]) -> Vec<RemoteRegistration> {
    let mut docs: BTreeMap<String, RemoteRegistration> = BTreeMap::new();
    for record in records {
        let doc = RemoteRegistration::from_record(record);
        match docs.get_mut(&doc.uid) {
            Some(existing) => existing.merge(doc),
            None => {
                docs.insert(doc.uid.clone(), doc);
            }
        }
    }
    docs.into_values().collect()
}

/// The shared registration store devices reconcile against.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Merge-writes every document, committing all of them or none.
    async fn upsert_batch(&self, docs: Vec<RemoteRegistration>) -> anyhow::Result<()>;

    async fn fetch_all(&self) -> anyhow::Result<Vec<RemoteRegistration>>;

    async fn fetch(&self, uid: &str) -> anyhow::Result<Option<RemoteRegistration>>;
}

#[derive(Serialize)]
struct BatchRequest<'a> {
    documents: &'a [RemoteRegistration],
}

/// Document store reachable over HTTP.
///
/// `POST registrations/batch` merge-writes a batch atomically,
/// `GET registrations` lists every document and `GET registrations/{uid}`
/// fetches one.
pub struct HttpRemoteStore {
    client: Client,
    base: Url,
    token: Option<String>,
}

impl HttpRemoteStore {
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> anyhow::Result<Self> {
        let mut base = Url::parse(base_url)?;
        if !base.path().ends_with('/') {
            base.set_path(&format!("{}/", base.path()));
        }

        Ok(HttpRemoteStore {
            client: Client::builder().timeout(timeout).build()?,
            base,
            token,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> anyhow::Result<reqwest::RequestBuilder> {
        let url = self.base.join(path)?;
        let builder = self.client.request(method, url);
        Ok(match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        })
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn upsert_batch(&self, docs: Vec<RemoteRegistration>) -> anyhow::Result<()> {
        self.request(reqwest::Method::POST, "registrations/batch")?
            .json(&BatchRequest { documents: &docs })
            .send()
            .await?
            .error_for_status()?;

        log::debug!("Remote committed {} documents", docs.len());
        Ok(())
    }

    async fn fetch_all(&self) -> anyhow::Result<Vec<RemoteRegistration>> {
        Ok(self
            .request(reqwest::Method::GET, "registrations")?
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?)
    }

    async fn fetch(&self, uid: &str) -> anyhow::Result<Option<RemoteRegistration>> {
        let mut url = self.base.join("registrations/")?;
        url.path_segments_mut()
            .map_err(|_| anyhow!("Remote url {} cannot hold a path", self.base))?
            .pop_if_empty()
            .push(uid);

        let builder = self.client.get(url);
        let builder = match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        };

        let resp = builder.send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(resp.error_for_status()?.json().await?))
    }
}

/// Process-local document store.
///
/// Used when no remote is configured and as the network stand-in for tests,
/// with switches to simulate an outage or a failing commit.
#[derive(Default)]
pub struct MemoryRemoteStore {
    docs: DashMap<String, RemoteRegistration>,
    offline: AtomicBool,
    failing_writes: AtomicUsize,
    commits: AtomicUsize,
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that is never reachable.
    pub fn offline() -> Self {
        let store = Self::default();
        store.set_offline(true);
        store
    }

    pub fn with_documents(docs: Vec<RemoteRegistration>) -> Self {
        let store = Self::default();
        for doc in docs {
            store.docs.insert(doc.uid.clone(), doc);
        }
        store
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Makes the next `n` batch writes fail without committing anything.
    pub fn fail_next_writes(&self, n: usize) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    pub fn document(&self, uid: &str) -> Option<RemoteRegistration> {
        self.docs.get(uid).map(|d| d.clone())
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// Number of batches committed so far.
    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    fn check_online(&self) -> anyhow::Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(anyhow!("Remote store is unreachable"));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn upsert_batch(&self, docs: Vec<RemoteRegistration>) -> anyhow::Result<()> {
        self.check_online()?;
        let failing = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(anyhow!("Batch commit rejected"));
        }

        for doc in docs {
            match self.docs.get_mut(&doc.uid) {
                Some(mut existing) => existing.merge(doc),
                None => {
                    self.docs.insert(doc.uid.clone(), doc);
                }
            }
        }
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn fetch_all(&self) -> anyhow::Result<Vec<RemoteRegistration>> {
        self.check_online()?;
        Ok(self.docs.iter().map(|d| d.clone()).collect())
    }

    async fn fetch(&self, uid: &str) -> anyhow::Result<Option<RemoteRegistration>> {
        self.check_online()?;
        Ok(self.document(uid))
    }
}
