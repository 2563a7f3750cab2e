use std::{sync::Arc, time::Duration};

use anyhow::anyhow;
use serde::Serialize;

use crate::{
    error::AdmissionError,
    integrations::remote::{RemoteRegistration, RemoteStore},
};

use super::{
    backup::BackupWriter,
    db::ParticipantDb,
    event::{AdmissionMode, EventContext, PaidEntryPolicy},
    participant::{NewParticipant, ParticipantRecord, Profile, Source},
    token::QrIdentity,
};

/// Progress of a team being admitted in one continuous scanning sequence.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct TeamProgress {
    pub team_name: String,
    pub admitted: u32,
    pub size: u32,
}

impl TeamProgress {
    pub fn is_complete(&self) -> bool {
        self.admitted >= self.size
    }
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Admission {
    pub record: ParticipantRecord,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub team: Option<TeamProgress>,
    /// Set when the participant was already admitted under another team
    #[serde(skip_serializing_if = "Option::is_none")]
    pub team_warning: Option<String>,
}

/// Result of handing a scanned token to the engine.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ScanOutcome {
    Admitted(Admission),
    /// Paid event, ticket already used
    ReentryBlocked { record: ParticipantRecord },
    /// Free event, already admitted; waits for `confirm` or `cancel`
    ConfirmReentry { record: ParticipantRecord },
    /// Fee not confirmed; waits for `confirm` or `cancel`
    PaymentPending {
        participant_id: String,
        profile: Profile,
        registered: bool,
    },
    /// Not enough known about this person to admit them without the desk
    NeedsRegistration {
        participant_id: String,
        profile: Profile,
    },
    DuplicateInSession { participant_id: String },
    /// A previous scan still waits for a staff decision
    AwaitingDecision,
    /// The team is full
    SessionComplete { team_name: String },
    InvalidToken { reason: String },
}

#[derive(Debug, Clone, PartialEq)]
enum Decision {
    Reentry(ParticipantRecord),
    PaymentForRecord(ParticipantRecord),
    PaymentForNew(NewParticipant),
}

#[derive(Debug, Clone, PartialEq)]
struct PendingDecision {
    scanned_id: String,
    decision: Decision,
}

/// State of one scanning station: the event, the admission mode and the
/// decision currently waiting on staff, if any.
#[derive(Debug, Clone)]
pub struct ScanSession {
    event: EventContext,
    mode: AdmissionMode,
    members: Vec<String>,
    admitted: u32,
    pending: Option<PendingDecision>,
}

impl ScanSession {
    pub fn new(event: EventContext, mode: AdmissionMode) -> Self {
        ScanSession {
            event,
            mode,
            members: vec![],
            admitted: 0,
            pending: None,
        }
    }

    pub fn event(&self) -> &EventContext {
        &self.event
    }

    pub fn mode(&self) -> &AdmissionMode {
        &self.mode
    }

    /// Participant ids admitted during this session.
    pub fn members(&self) -> &[String] {
        &self.members
    }

    pub fn is_awaiting_decision(&self) -> bool {
        self.pending.is_some()
    }

    pub fn team_progress(&self) -> Option<TeamProgress> {
        match &self.mode {
            AdmissionMode::Individual => None,
            AdmissionMode::Team { team_name, size } => Some(TeamProgress {
                team_name: team_name.clone(),
                admitted: self.admitted,
                size: *size,
            }),
        }
    }

    /// Counts an admission made for this session, by a scan or at the
    /// registration desk.
    pub fn record_admission(&mut self, scanned_id: &str, participant_id: &str) {
        self.admitted += 1;
        self.members.push(participant_id.to_string());
        if scanned_id != participant_id {
            self.members.push(scanned_id.to_string());
        }
    }

    fn already_scanned(&self, id: &str) -> bool {
        matches!(self.mode, AdmissionMode::Team { .. }) && self.members.iter().any(|m| m == id)
    }
}

/// Decides admissions from local data, consulting the remote store only to
/// fill gaps.
pub struct AdmissionEngine {
    db: Arc<ParticipantDb>,
    remote: Arc<dyn RemoteStore>,
    backup: Option<Arc<BackupWriter>>,
    policy: PaidEntryPolicy,
    remote_timeout: Duration,
}

impl AdmissionEngine {
    pub fn new(
        db: Arc<ParticipantDb>,
        remote: Arc<dyn RemoteStore>,
        backup: Option<Arc<BackupWriter>>,
        policy: PaidEntryPolicy,
        remote_timeout: Duration,
    ) -> Self {
        AdmissionEngine {
            db,
            remote,
            backup,
            policy,
            remote_timeout,
        }
    }

    pub fn db(&self) -> &Arc<ParticipantDb> {
        &self.db
    }

    /// Runs one scan through the state machine.
    ///
    /// Only a local storage failure is an error; everything else resolves to
    /// an outcome.
    pub async fn scan(
        &self,
        session: &mut ScanSession,
        raw: &str,
    ) -> Result<ScanOutcome, AdmissionError> {
        if session.pending.is_some() {
            return Ok(ScanOutcome::AwaitingDecision);
        }

        let identity = match QrIdentity::parse(raw) {
            Ok(identity) => identity,
            Err(e) => {
                return Ok(ScanOutcome::InvalidToken {
                    reason: e.to_string(),
                })
            }
        };

        if let Some(team) = session.team_progress() {
            if team.is_complete() {
                return Ok(ScanOutcome::SessionComplete {
                    team_name: team.team_name,
                });
            }
        }

        if session.already_scanned(&identity.participant_id) {
            return Ok(ScanOutcome::DuplicateInSession {
                participant_id: identity.participant_id,
            });
        }

        let event_id = session.event.event_id.clone();
        let found = match self
            .db
            .find_by_key(&identity.participant_id, &event_id)
            .await?
        {
            Some(record) => Some(record),
            None => {
                self.db
                    .find_by_contact(
                        &identity.profile.email,
                        &identity.profile.phone,
                        Some(&event_id),
                    )
                    .await?
            }
        };

        match found {
            Some(record) => self.scan_known(session, identity, record).await,
            None => self.scan_unknown(session, identity).await,
        }
    }

    async fn scan_known(
        &self,
        session: &mut ScanSession,
        identity: QrIdentity,
        record: ParticipantRecord,
    ) -> Result<ScanOutcome, AdmissionError> {
        if session.already_scanned(&record.participant_id) {
            return Ok(ScanOutcome::DuplicateInSession {
                participant_id: record.participant_id,
            });
        }

        if record.is_admitted() {
            if session.event.payment_gated {
                log::info!(
                    "Blocked re-entry of {} into paid event {}",
                    record.participant_id,
                    record.event_id
                );
                return Ok(ScanOutcome::ReentryBlocked { record });
            }

            session.pending = Some(PendingDecision {
                scanned_id: identity.participant_id,
                decision: Decision::Reentry(record.clone()),
            });
            return Ok(ScanOutcome::ConfirmReentry { record });
        }

        if session.event.payment_gated && !self.is_paid(&record).await? {
            let outcome = ScanOutcome::PaymentPending {
                participant_id: record.participant_id.clone(),
                profile: record.profile.clone(),
                registered: true,
            };
            session.pending = Some(PendingDecision {
                scanned_id: identity.participant_id,
                decision: Decision::PaymentForRecord(record),
            });
            return Ok(outcome);
        }

        self.admit(session, &identity.participant_id, &record).await
    }

    /// Whether a registered, not yet admitted record may enter a paid event.
    async fn is_paid(&self, record: &ParticipantRecord) -> Result<bool, AdmissionError> {
        if record.payment_verified {
            return Ok(true);
        }

        match self.policy {
            PaidEntryPolicy::TrustLocalRecord => Ok(matches!(
                record.source,
                Source::RemoteImport | Source::OnSite
            )),
            PaidEntryPolicy::RequireVerifiedPayment => {
                let verified = self
                    .remote_lookup(&record.participant_id)
                    .await
                    .is_some_and(|doc| doc.payment_verified_for(&record.event_id));

                if verified {
                    self.db
                        .set_payment_verified(&record.participant_id, &record.event_id)
                        .await?;
                }
                Ok(verified)
            }
        }
    }

    async fn scan_unknown(
        &self,
        session: &mut ScanSession,
        identity: QrIdentity,
    ) -> Result<ScanOutcome, AdmissionError> {
        let profile = self.enrich(&identity).await?;
        let participant_id = identity.participant_id;

        if !profile.is_admissible() {
            log::info!(
                "Not enough data to admit {}, routing to registration",
                participant_id
            );
            return Ok(ScanOutcome::NeedsRegistration {
                participant_id,
                profile,
            });
        }

        let event_id = session.event.event_id.clone();
        let candidate = NewParticipant::new(&participant_id, &event_id, profile, Source::QrAuto);

        if session.event.payment_gated {
            let outcome = ScanOutcome::PaymentPending {
                participant_id: participant_id.clone(),
                profile: candidate.profile.clone(),
                registered: false,
            };
            session.pending = Some(PendingDecision {
                scanned_id: participant_id,
                decision: Decision::PaymentForNew(candidate),
            });
            return Ok(outcome);
        }

        self.db.insert_if_absent(&candidate).await?;
        let record = self.find_required(&participant_id, &event_id).await?;
        self.admit(session, &participant_id, &record).await
    }

    /// Fills gaps in the token's profile from other local records of the same
    /// person, then from the remote store.
    async fn enrich(&self, identity: &QrIdentity) -> Result<Profile, AdmissionError> {
        let mut profile = identity.profile.clone();
        if profile.is_admissible() {
            return Ok(profile);
        }

        if let Some(other) = self.db.find_any_event(&identity.participant_id).await? {
            profile.backfill(&other.profile);
        }
        if !profile.is_admissible() {
            if let Some(other) = self
                .db
                .find_by_contact(&profile.email, &profile.phone, None)
                .await?
            {
                profile.backfill(&other.profile);
            }
        }
        if !profile.is_admissible() {
            if let Some(doc) = self.remote_lookup(&identity.participant_id).await {
                profile.backfill(&doc.profile());
            }
        }

        Ok(profile)
    }

    /// Remote lookups never fail a scan; any error reads as "not found".
    async fn remote_lookup(
        &self,
        participant_id: &str,
    ) -> Option<RemoteRegistration> {
        match tokio::time::timeout(self.remote_timeout, self.remote.fetch(participant_id)).await {
            Ok(Ok(doc)) => doc,
            Ok(Err(e)) => {
                log::warn!("Remote lookup of {} failed: {}", participant_id, e);
                None
            }
            Err(_) => {
                log::warn!("Remote lookup of {} timed out", participant_id);
                None
            }
        }
    }

    async fn find_required(
        &self,
        participant_id: &str,
        event_id: &str,
    ) -> Result<ParticipantRecord, AdmissionError> {
        self.db
            .find_by_key(participant_id, event_id)
            .await?
            .ok_or_else(|| {
                AdmissionError::Storage(anyhow!(
                    "Record {} for {} disappeared during admission",
                    participant_id,
                    event_id
                ))
            })
    }

    /// Admits `record` into the session's event.
    ///
    /// For payment-gated events the increment only applies to a record that
    /// was never admitted, so two stations racing on the same ticket admit it
    /// once and the other gets [`ScanOutcome::ReentryBlocked`].
    async fn admit(
        &self,
        session: &mut ScanSession,
        scanned_id: &str,
        record: &ParticipantRecord,
    ) -> Result<ScanOutcome, AdmissionError> {
        let team_name = session.mode.team_name().map(str::to_string);
        let team_warning = match (&team_name, &record.team_name) {
            (Some(current), Some(previous)) if current != previous => Some(format!(
                "{} was already admitted with team {}",
                record.profile.name, previous
            )),
            _ => None,
        };

        let updated = if session.event.payment_gated {
            self.db
                .admit_first_entry(
                    &record.participant_id,
                    &record.event_id,
                    team_name.as_deref(),
                )
                .await?
        } else {
            self.db
                .increment_admission(
                    &record.participant_id,
                    &record.event_id,
                    team_name.as_deref(),
                )
                .await?
        };

        let updated = match updated {
            Some(updated) => updated,
            None => {
                let current = self
                    .find_required(&record.participant_id, &record.event_id)
                    .await?;
                log::info!(
                    "Blocked re-entry of {} into paid event {}, admitted elsewhere",
                    current.participant_id,
                    current.event_id
                );
                return Ok(ScanOutcome::ReentryBlocked { record: current });
            }
        };

        session.record_admission(scanned_id, &updated.participant_id);

        if let Some(backup) = &self.backup {
            backup.spawn_backup(self.db.clone());
        }

        Ok(ScanOutcome::Admitted(Admission {
            record: updated,
            team: session.team_progress(),
            team_warning,
        }))
    }

    /// Resolves the pending decision in favour of admission.
    ///
    /// The admission state is checked again at this point; a paid ticket used
    /// at another station in the meantime yields
    /// [`ScanOutcome::ReentryBlocked`].
    pub async fn confirm(&self, session: &mut ScanSession) -> Result<ScanOutcome, AdmissionError> {
        let pending = session
            .pending
            .take()
            .ok_or(AdmissionError::NoPendingDecision)?;

        match pending.decision {
            Decision::Reentry(record) => self.admit(session, &pending.scanned_id, &record).await,
            Decision::PaymentForRecord(record) => {
                self.db
                    .set_payment_verified(&record.participant_id, &record.event_id)
                    .await?;
                self.admit(session, &pending.scanned_id, &record).await
            }
            Decision::PaymentForNew(candidate) => {
                let candidate = candidate.with_payment_verified(true);
                if !self.db.insert_if_absent(&candidate).await? {
                    self.db
                        .set_payment_verified(&candidate.participant_id, &candidate.event_id)
                        .await?;
                }
                let record = self
                    .find_required(&candidate.participant_id, &candidate.event_id)
                    .await?;
                self.admit(session, &pending.scanned_id, &record).await
            }
        }
    }

    /// Writes the backup now and waits for it, for callers that exit right
    /// after admitting.
    pub async fn flush_backup(&self) -> anyhow::Result<usize> {
        match &self.backup {
            Some(backup) => backup.append_admitted(&self.db).await,
            None => Ok(0),
        }
    }

    /// Drops the pending decision without touching the store.
    pub fn cancel(&self, session: &mut ScanSession) -> Result<(), AdmissionError> {
        session
            .pending
            .take()
            .map(|_| ())
            .ok_or(AdmissionError::NoPendingDecision)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::{
        core::db::tests::{profile, temp_db},
        integrations::remote::{MemoryRemoteStore, PaymentRecord},
    };

    struct Fixture {
        dir: TempDir,
        db: Arc<ParticipantDb>,
        remote: Arc<MemoryRemoteStore>,
        engine: AdmissionEngine,
    }

    async fn fixture(policy: PaidEntryPolicy) -> Fixture {
        let (dir, db) = temp_db().await;
        let remote = Arc::new(MemoryRemoteStore::new());
        let backup = Arc::new(BackupWriter::new(dir.path().join("backup.csv")));
        let engine = AdmissionEngine::new(
            db.clone(),
            remote.clone(),
            Some(backup),
            policy,
            Duration::from_secs(2),
        );
        Fixture {
            dir,
            db,
            remote,
            engine,
        }
    }

    async fn register(db: &ParticipantDb, id: &str, event: &str, source: Source) {
        db.insert_if_absent(&NewParticipant::new(
            id,
            event,
            profile("Lakshmi", &format!("{}@example.com", id), ""),
            source,
        ))
        .await
        .unwrap();
    }

    fn full_token(uid: &str) -> String {
        format!(
            r#"{{"uid":"{}","name":"Farhan","email":"{}@example.com","college":"SSN"}}"#,
            uid, uid
        )
    }

    fn admitted(outcome: ScanOutcome) -> Admission {
        match outcome {
            ScanOutcome::Admitted(a) => a,
            other => panic!("expected admission, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_free_event_unknown_attendee_is_auto_registered() {
        let f = fixture(PaidEntryPolicy::default()).await;
        let mut session = ScanSession::new(EventContext::free("CodeCrypt"), AdmissionMode::Individual);

        let admission = admitted(f.engine.scan(&mut session, &full_token("new-1")).await.unwrap());
        assert_eq!(admission.record.admission_count, 1);
        assert_eq!(admission.record.source, Source::QrAuto);

        let all = f.db.list_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(f.db.list_pending(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_thin_token_enriched_from_remote() {
        let f = fixture(PaidEntryPolicy::default()).await;
        f.remote
            .upsert_batch(vec![RemoteRegistration {
                uid: "web-3".to_owned(),
                name: "Sana".to_owned(),
                phone: "9123456780".to_owned(),
                college: "MIT".to_owned(),
                ..Default::default()
            }])
            .await
            .unwrap();
        let mut session = ScanSession::new(EventContext::free("LinkLogic"), AdmissionMode::Individual);

        let admission = admitted(f.engine.scan(&mut session, "web-3").await.unwrap());
        assert_eq!(admission.record.profile.name, "Sana");
        assert_eq!(admission.record.profile.college, "MIT");
    }

    #[tokio::test]
    async fn test_thin_token_enriched_from_other_event() {
        let f = fixture(PaidEntryPolicy::default()).await;
        register(&f.db, "u5", "WealthX", Source::RemoteImport).await;
        let mut session = ScanSession::new(EventContext::free("LinkLogic"), AdmissionMode::Individual);

        let admission = admitted(f.engine.scan(&mut session, "u5").await.unwrap());
        assert_eq!(admission.record.event_id, "LinkLogic");
        assert_eq!(admission.record.profile.name, "Lakshmi");
    }

    #[tokio::test]
    async fn test_unreachable_remote_routes_to_registration() {
        let f = fixture(PaidEntryPolicy::default()).await;
        f.remote.set_offline(true);
        let mut session = ScanSession::new(EventContext::free("LinkLogic"), AdmissionMode::Individual);

        let outcome = f
            .engine
            .scan(&mut session, r#"{"uid":"x1","name":"Only Name"}"#)
            .await
            .unwrap();
        match outcome {
            ScanOutcome::NeedsRegistration {
                participant_id,
                profile,
            } => {
                assert_eq!(participant_id, "x1");
                assert_eq!(profile.name, "Only Name");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(f.db.list_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_paid_event_unverified_waits_for_payment() {
        let f = fixture(PaidEntryPolicy::default()).await;
        register(&f.db, "b1", "WealthX", Source::BulkImport).await;
        let mut session = ScanSession::new(EventContext::paid("WealthX"), AdmissionMode::Individual);

        let outcome = f.engine.scan(&mut session, "b1").await.unwrap();
        assert!(matches!(
            outcome,
            ScanOutcome::PaymentPending {
                registered: true,
                ..
            }
        ));
        let record = f.db.find_by_key("b1", "WealthX").await.unwrap().unwrap();
        assert_eq!(record.admission_count, 0);

        // No further scans until staff decides.
        assert_eq!(
            f.engine.scan(&mut session, "b1").await.unwrap(),
            ScanOutcome::AwaitingDecision
        );

        let admission = admitted(f.engine.confirm(&mut session).await.unwrap());
        assert_eq!(admission.record.admission_count, 1);
        assert!(admission.record.payment_verified);
    }

    #[tokio::test]
    async fn test_paid_event_trusts_remote_import() {
        let f = fixture(PaidEntryPolicy::TrustLocalRecord).await;
        register(&f.db, "r1", "WealthX", Source::RemoteImport).await;
        let mut session = ScanSession::new(EventContext::paid("WealthX"), AdmissionMode::Individual);

        let admission = admitted(f.engine.scan(&mut session, "r1").await.unwrap());
        assert_eq!(admission.record.admission_count, 1);
    }

    #[tokio::test]
    async fn test_strict_policy_consults_remote_payments() {
        let f = fixture(PaidEntryPolicy::RequireVerifiedPayment).await;
        register(&f.db, "r1", "WealthX", Source::RemoteImport).await;
        register(&f.db, "r2", "WealthX", Source::RemoteImport).await;
        f.remote
            .upsert_batch(vec![RemoteRegistration {
                uid: "r1".to_owned(),
                events: vec!["WealthX".to_owned()],
                payments: vec![PaymentRecord {
                    id: "pay-1".to_owned(),
                    event_names: vec!["WealthX".to_owned()],
                    verified: true,
                    kind: "UPI".to_owned(),
                    amount: 150.0,
                    date: String::new(),
                }],
                ..Default::default()
            }])
            .await
            .unwrap();
        let mut session = ScanSession::new(EventContext::paid("WealthX"), AdmissionMode::Individual);

        let admission = admitted(f.engine.scan(&mut session, "r1").await.unwrap());
        assert!(admission.record.payment_verified);

        let outcome = f.engine.scan(&mut session, "r2").await.unwrap();
        assert!(matches!(outcome, ScanOutcome::PaymentPending { .. }));
        f.engine.cancel(&mut session).unwrap();
        let r2 = f.db.find_by_key("r2", "WealthX").await.unwrap().unwrap();
        assert_eq!(r2.admission_count, 0);
    }

    #[tokio::test]
    async fn test_paid_event_reentry_is_blocked() {
        let f = fixture(PaidEntryPolicy::default()).await;
        register(&f.db, "r1", "WealthX", Source::RemoteImport).await;
        f.db.increment_admission("r1", "WealthX", None).await.unwrap();
        let mut session = ScanSession::new(EventContext::paid("WealthX"), AdmissionMode::Individual);

        let outcome = f.engine.scan(&mut session, "r1").await.unwrap();
        assert!(matches!(outcome, ScanOutcome::ReentryBlocked { .. }));
        assert!(!session.is_awaiting_decision());
        assert!(f.engine.confirm(&mut session).await.is_err());

        let record = f.db.find_by_key("r1", "WealthX").await.unwrap().unwrap();
        assert_eq!(record.admission_count, 1);
    }

    #[tokio::test]
    async fn test_free_event_reentry_needs_confirmation() {
        let f = fixture(PaidEntryPolicy::default()).await;
        register(&f.db, "r1", "CodeCrypt", Source::RemoteImport).await;
        f.db.increment_admission("r1", "CodeCrypt", None).await.unwrap();
        let mut session = ScanSession::new(EventContext::free("CodeCrypt"), AdmissionMode::Individual);

        let outcome = f.engine.scan(&mut session, "r1").await.unwrap();
        assert!(matches!(outcome, ScanOutcome::ConfirmReentry { .. }));
        f.engine.cancel(&mut session).unwrap();
        let record = f.db.find_by_key("r1", "CodeCrypt").await.unwrap().unwrap();
        assert_eq!(record.admission_count, 1);

        f.engine.scan(&mut session, "r1").await.unwrap();
        let admission = admitted(f.engine.confirm(&mut session).await.unwrap());
        assert_eq!(admission.record.admission_count, 2);
        assert!(matches!(
            f.engine.cancel(&mut session),
            Err(AdmissionError::NoPendingDecision)
        ));
    }

    #[tokio::test]
    async fn test_paid_event_unknown_attendee_created_on_confirmation() {
        let f = fixture(PaidEntryPolicy::default()).await;
        let mut session = ScanSession::new(EventContext::paid("WealthX"), AdmissionMode::Individual);

        let outcome = f.engine.scan(&mut session, &full_token("walk-in")).await.unwrap();
        assert!(matches!(
            outcome,
            ScanOutcome::PaymentPending {
                registered: false,
                ..
            }
        ));
        f.engine.cancel(&mut session).unwrap();
        assert!(f.db.list_all().await.unwrap().is_empty());

        f.engine.scan(&mut session, &full_token("walk-in")).await.unwrap();
        let admission = admitted(f.engine.confirm(&mut session).await.unwrap());
        assert_eq!(admission.record.admission_count, 1);
        assert!(admission.record.payment_verified);
        assert_eq!(admission.record.source, Source::QrAuto);
    }

    #[tokio::test]
    async fn test_contact_lookup_resolves_foreign_ids() {
        let f = fixture(PaidEntryPolicy::default()).await;
        register(&f.db, "local-7", "CodeCrypt", Source::RemoteImport).await;
        let mut session = ScanSession::new(EventContext::free("CodeCrypt"), AdmissionMode::Individual);

        let admission = admitted(
            f.engine
                .scan(&mut session, r#"{"uid":"other-system-99","email":"LOCAL-7@example.com"}"#)
                .await
                .unwrap(),
        );
        assert_eq!(admission.record.participant_id, "local-7");
        assert_eq!(f.db.list_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_team_session() {
        let f = fixture(PaidEntryPolicy::default()).await;
        for id in ["t1", "t2", "t3"] {
            register(&f.db, id, "Pitchfest", Source::RemoteImport).await;
        }
        f.db.increment_admission("t2", "Pitchfest", Some("Old Team"))
            .await
            .unwrap();
        let mut session = ScanSession::new(
            EventContext::free("Pitchfest"),
            AdmissionMode::Team {
                team_name: "Byte Me".to_owned(),
                size: 2,
            },
        );

        let first = admitted(f.engine.scan(&mut session, "t1").await.unwrap());
        assert_eq!(first.team.as_ref().unwrap().admitted, 1);
        assert_eq!(first.record.team_name.as_deref(), Some("Byte Me"));

        assert_eq!(
            f.engine.scan(&mut session, "t1").await.unwrap(),
            ScanOutcome::DuplicateInSession {
                participant_id: "t1".to_owned()
            }
        );

        // Already admitted elsewhere: re-entry prompt, then a warning only.
        f.engine.scan(&mut session, "t2").await.unwrap();
        let second = admitted(f.engine.confirm(&mut session).await.unwrap());
        assert!(second.team_warning.is_some());
        assert!(second.team.unwrap().is_complete());

        assert!(matches!(
            f.engine.scan(&mut session, "t3").await.unwrap(),
            ScanOutcome::SessionComplete { .. }
        ));
        assert_eq!(session.members(), ["t1", "t2"]);
    }

    #[tokio::test]
    async fn test_admission_writes_backup() {
        let f = fixture(PaidEntryPolicy::default()).await;
        let mut session = ScanSession::new(EventContext::free("CodeCrypt"), AdmissionMode::Individual);
        f.engine.scan(&mut session, &full_token("bk-1")).await.unwrap();

        let path = f.dir.path().join("backup.csv");
        for _ in 0..50 {
            if std::fs::read_to_string(&path).is_ok_and(|t| t.contains("bk-1")) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("backup file was not written");
    }

    #[tokio::test]
    async fn test_invalid_token() {
        let f = fixture(PaidEntryPolicy::default()).await;
        let mut session = ScanSession::new(EventContext::free("CodeCrypt"), AdmissionMode::Individual);
        assert!(matches!(
            f.engine.scan(&mut session, "  ").await.unwrap(),
            ScanOutcome::InvalidToken { .. }
        ));
    }

    #[tokio::test]
    async fn test_paid_ticket_admits_once_across_stations() {
        let f = fixture(PaidEntryPolicy::default()).await;
        for i in 0..20 {
            let id = format!("ticket-{}", i);
            register(&f.db, &id, "WealthX", Source::RemoteImport).await;
            let mut gate_a = ScanSession::new(EventContext::paid("WealthX"), AdmissionMode::Individual);
            let mut gate_b = ScanSession::new(EventContext::paid("WealthX"), AdmissionMode::Individual);

            admitted(f.engine.scan(&mut gate_a, &id).await.unwrap());
            assert!(matches!(
                f.engine.scan(&mut gate_b, &id).await.unwrap(),
                ScanOutcome::ReentryBlocked { .. }
            ));
        }
    }

    #[tokio::test]
    async fn test_racing_payment_confirmations_admit_once() {
        let f = fixture(PaidEntryPolicy::default()).await;
        register(&f.db, "b1", "WealthX", Source::BulkImport).await;
        let mut gate_a = ScanSession::new(EventContext::paid("WealthX"), AdmissionMode::Individual);
        let mut gate_b = ScanSession::new(EventContext::paid("WealthX"), AdmissionMode::Individual);

        for gate in [&mut gate_a, &mut gate_b] {
            assert!(matches!(
                f.engine.scan(gate, "b1").await.unwrap(),
                ScanOutcome::PaymentPending { registered: true, .. }
            ));
        }

        let first = admitted(f.engine.confirm(&mut gate_a).await.unwrap());
        assert_eq!(first.record.admission_count, 1);
        match f.engine.confirm(&mut gate_b).await.unwrap() {
            ScanOutcome::ReentryBlocked { record } => assert_eq!(record.admission_count, 1),
            other => panic!("unexpected {:?}", other),
        }
        assert!(gate_b.members().is_empty());

        let record = f.db.find_by_key("b1", "WealthX").await.unwrap().unwrap();
        assert_eq!(record.admission_count, 1);
    }

    #[tokio::test]
    async fn test_racing_walk_in_confirmations_admit_once() {
        let f = fixture(PaidEntryPolicy::default()).await;
        let mut gate_a = ScanSession::new(EventContext::paid("WealthX"), AdmissionMode::Individual);
        let mut gate_b = ScanSession::new(EventContext::paid("WealthX"), AdmissionMode::Individual);

        for gate in [&mut gate_a, &mut gate_b] {
            assert!(matches!(
                f.engine.scan(gate, &full_token("walk-in-2")).await.unwrap(),
                ScanOutcome::PaymentPending { registered: false, .. }
            ));
        }

        admitted(f.engine.confirm(&mut gate_a).await.unwrap());
        assert!(matches!(
            f.engine.confirm(&mut gate_b).await.unwrap(),
            ScanOutcome::ReentryBlocked { .. }
        ));

        let record = f.db.find_by_key("walk-in-2", "WealthX").await.unwrap().unwrap();
        assert_eq!(record.admission_count, 1);
    }

    #[tokio::test]
    async fn test_flush_backup_writes_before_returning() {
        let f = fixture(PaidEntryPolicy::default()).await;
        let mut session = ScanSession::new(EventContext::free("CodeCrypt"), AdmissionMode::Individual);
        admitted(f.engine.scan(&mut session, &full_token("cli-1")).await.unwrap());

        f.engine.flush_backup().await.unwrap();
        let text = std::fs::read_to_string(f.dir.path().join("backup.csv")).unwrap();
        assert!(text.contains("cli-1"));
    }
}
