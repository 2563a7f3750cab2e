use serde::{Deserialize, Serialize};
use sqlx::prelude::FromRow;

use crate::util::{deserialize_datetime, serialize_datetime};

/// Where a participant-event record came from.
#[derive(PartialEq, Eq, Hash, Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Source {
    /// Pulled from the remote registration store before the event
    RemoteImport,
    /// Registered by staff at the venue
    OnSite,
    /// Spreadsheet or device-to-device transfer
    BulkImport,
    /// Created by the admission engine from a scanned token
    QrAuto,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::RemoteImport => "REMOTE_IMPORT",
            Source::OnSite => "ON_SITE",
            Source::BulkImport => "BULK_IMPORT",
            Source::QrAuto => "QR_AUTO",
        }
    }
}

#[derive(PartialEq, Eq, Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncState {
    Pending,
    Synced,
}

/// Identity and contact details of an attendee, shared by every event record.
#[derive(PartialEq, Eq, Debug, Clone, Serialize, Deserialize, Default, FromRow)]
#[serde(default)]
pub struct Profile {
    pub name: String,
    pub email: String,
    pub phone: String,
    pub college: String,
    pub degree: String,
    pub department: String,
    pub year: String,
}

impl Profile {
    /// Fills blank fields from `other`, never overwriting known values.
    pub fn backfill(&mut self, other: &Profile) {
        fn fill(dst: &mut String, src: &str) {
            if dst.trim().is_empty() && !src.trim().is_empty() {
                *dst = src.trim().to_string();
            }
        }

        fill(&mut self.name, &other.name);
        fill(&mut self.email, &other.email);
        fill(&mut self.phone, &other.phone);
        fill(&mut self.college, &other.college);
        fill(&mut self.degree, &other.degree);
        fill(&mut self.department, &other.department);
        fill(&mut self.year, &other.year);
    }

    /// Whether there is enough to admit someone without a registration desk:
    /// a name, a way to reach them and a college.
    pub fn is_admissible(&self) -> bool {
        !self.name.trim().is_empty()
            && (!self.email.trim().is_empty() || !self.phone.trim().is_empty())
            && !self.college.trim().is_empty()
    }

    pub fn has_contact(&self) -> bool {
        !self.email.trim().is_empty() || !self.phone.trim().is_empty()
    }
}

/// A participant's registration for a single event.
///
/// Keyed by `(participant_id, event_id)`.
#[derive(PartialEq, Eq, Debug, FromRow, Clone, Serialize, Deserialize)]
pub struct ParticipantRecord {
    /// Identity issued at registration, stable across events
    pub participant_id: String,

    /// The event this record grants admission to
    pub event_id: String,

    #[sqlx(flatten)]
    #[serde(flatten)]
    pub profile: Profile,

    pub source: Source,

    pub sync_state: SyncState,

    pub payment_verified: bool,

    /// Number of admissions into this event, never decremented
    pub admission_count: i64,

    /// Unix milliseconds of the latest admission
    #[serde(
        serialize_with = "serialize_datetime",
        deserialize_with = "deserialize_datetime",
        default
    )]
    pub last_admission_time: Option<i64>,

    /// Latest team this participant was admitted with
    pub team_name: Option<String>,

    /// Local mutation counter used to acknowledge uploads
    #[serde(skip)]
    pub revision: i64,
}

impl ParticipantRecord {
    pub fn is_admitted(&self) -> bool {
        self.admission_count > 0
    }

    /// Backup and transfer identity: lowercased email, phone and event.
    pub fn contact_key(&self) -> (String, String, String) {
        (
            self.profile.email.trim().to_lowercase(),
            self.profile.phone.trim().to_string(),
            self.event_id.clone(),
        )
    }
}

/// Everything needed to create a record; admission state always starts empty.
#[derive(PartialEq, Eq, Debug, Clone, Serialize, Deserialize)]
pub struct NewParticipant {
    pub participant_id: String,
    pub event_id: String,
    #[serde(flatten)]
    pub profile: Profile,
    pub source: Source,
    pub payment_verified: bool,
}

impl NewParticipant {
    pub fn new(participant_id: &str, event_id: &str, profile: Profile, source: Source) -> Self {
        NewParticipant {
            participant_id: participant_id.trim().to_string(),
            event_id: event_id.to_string(),
            profile,
            source,
            payment_verified: false,
        }
    }

    pub fn with_payment_verified(mut self, verified: bool) -> Self {
        self.payment_verified = verified;
        self
    }

    /// Sync state a fresh record starts in.
    ///
    /// Records that mirror an upstream copy start synced; anything minted on
    /// this device still has to be uploaded.
    pub fn initial_sync_state(&self) -> SyncState {
        match self.source {
            Source::RemoteImport | Source::BulkImport => SyncState::Synced,
            Source::OnSite | Source::QrAuto => SyncState::Pending,
        }
    }
}
