use std::sync::{Arc, OnceLock};

use rand::Rng;
use regex::Regex;
use serde::Deserialize;

use crate::{error::RegistrationError, util::now_millis};

use super::{
    backup::BackupWriter,
    db::ParticipantDb,
    event::EventContext,
    participant::{NewParticipant, ParticipantRecord, Profile, Source},
};

/// A walk-in registration taken at the desk.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct RegistrationRequest {
    /// Id from a scanned token, when the person already has one
    #[serde(default)]
    pub participant_id: Option<String>,
    #[serde(flatten)]
    pub profile: Profile,
    /// Staff collected the fee
    #[serde(default)]
    pub payment_confirmed: bool,
    /// Admit right after registering
    #[serde(default)]
    pub admit: bool,
    #[serde(default)]
    pub team_name: Option<String>,
}

static EMAIL_REGEX: OnceLock<Regex> = OnceLock::new();
static PHONE_REGEX: OnceLock<Regex> = OnceLock::new();

/// `<Event>-ONSPOT-<millis>-<n>`
pub fn onspot_id(event_id: &str) -> String {
    format!(
        "{}-ONSPOT-{}-{}",
        event_id.split_whitespace().collect::<String>(),
        now_millis(),
        rand::thread_rng().gen_range(0..10000)
    )
}

fn validate(profile: &Profile) -> Result<(), RegistrationError> {
    let email_regex =
        EMAIL_REGEX.get_or_init(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap());
    let phone_regex = PHONE_REGEX.get_or_init(|| Regex::new(r"^\d{10}$").unwrap());

    if profile.name.trim().is_empty() {
        return Err(RegistrationError::MissingField("name"));
    }
    if !profile.has_contact() {
        return Err(RegistrationError::MissingField("email or phone"));
    }

    let email = profile.email.trim();
    if !email.is_empty() && !email_regex.is_match(email) {
        return Err(RegistrationError::InvalidField("email", email.to_string()));
    }
    let phone = profile.phone.trim();
    if !phone.is_empty() && !phone_regex.is_match(phone) {
        return Err(RegistrationError::InvalidField("phone", phone.to_string()));
    }

    Ok(())
}

/// Creates on-site records for people the scanner could not admit.
pub struct Registrar {
    db: Arc<ParticipantDb>,
    backup: Option<Arc<BackupWriter>>,
}

impl Registrar {
    pub fn new(db: Arc<ParticipantDb>, backup: Option<Arc<BackupWriter>>) -> Self {
        Registrar { db, backup }
    }

    /// Registers a walk-in for `event` and optionally admits them.
    ///
    /// The record is queued for upload. Someone already registered for the
    /// event under the same email or phone is rejected.
    pub async fn register(
        &self,
        event: &EventContext,
        req: RegistrationRequest,
    ) -> Result<ParticipantRecord, RegistrationError> {
        validate(&req.profile)?;

        if req.admit && event.payment_gated && !req.payment_confirmed {
            return Err(RegistrationError::PaymentRequired(event.event_id.clone()));
        }

        if self
            .db
            .find_by_contact(&req.profile.email, &req.profile.phone, Some(&event.event_id))
            .await?
            .is_some()
        {
            return Err(RegistrationError::Duplicate(event.event_id.clone()));
        }

        let participant_id = req
            .participant_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| onspot_id(&event.event_id));

        let record = NewParticipant::new(&participant_id, &event.event_id, req.profile, Source::OnSite)
            .with_payment_verified(req.payment_confirmed);

        if !self.db.insert_if_absent(&record).await? {
            return Err(RegistrationError::Duplicate(event.event_id.clone()));
        }
        log::info!(
            "Registered {} on site for {}",
            record.participant_id,
            event.event_id
        );

        let stored = if req.admit {
            let admitted = self
                .db
                .increment_admission(
                    &record.participant_id,
                    &event.event_id,
                    req.team_name.as_deref(),
                )
                .await?;
            if let Some(backup) = &self.backup {
                backup.spawn_backup(self.db.clone());
            }
            admitted
        } else {
            self.db
                .find_by_key(&record.participant_id, &event.event_id)
                .await?
        };

        stored.ok_or_else(|| {
            RegistrationError::Storage(anyhow::anyhow!(
                "Record {} vanished after registration",
                record.participant_id
            ))
        })
    }
}
