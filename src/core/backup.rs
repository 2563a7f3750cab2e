use std::{collections::HashSet, path::PathBuf, sync::Arc};

use tokio::{fs, io::AsyncWriteExt, sync::Mutex, task::JoinHandle};

use crate::util::{csv_row, format_millis, parse_csv};

use super::{db::ParticipantDb, participant::ParticipantRecord};

pub const BACKUP_HEADER: [&str; 12] = [
    "UID",
    "Event",
    "Name",
    "Phone",
    "Email",
    "College",
    "Department",
    "Year",
    "Checkin Time",
    "Participated Count",
    "Team Name",
    "Source",
];

const EVENT_COLUMN: usize = 1;
const PHONE_COLUMN: usize = 3;
const EMAIL_COLUMN: usize = 4;

type BackupKey = (String, String, String);

fn backup_row(p: &ParticipantRecord) -> String {
    csv_row(&[
        p.participant_id.clone(),
        p.event_id.clone(),
        p.profile.name.clone(),
        p.profile.phone.clone(),
        p.profile.email.clone(),
        p.profile.college.clone(),
        p.profile.department.clone(),
        p.profile.year.clone(),
        format_millis(p.last_admission_time),
        p.admission_count.to_string(),
        p.team_name.clone().unwrap_or_default(),
        p.source.as_str().to_string(),
    ])
}

/// Append-only CSV of admitted participants, deduplicated by
/// `(email, phone, event)`.
///
/// Survives network and remote outages; rows are never rewritten.
pub struct BackupWriter {
    path: PathBuf,
    lock: Mutex<()>,
}

impl BackupWriter {
    pub fn new(path: PathBuf) -> Self {
        BackupWriter {
            path,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    async fn existing_keys(&self) -> anyhow::Result<Option<HashSet<BackupKey>>> {
        let text = match fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let rows = parse_csv(&text);
        if rows.is_empty() {
            return Ok(None);
        }

        Ok(Some(
            rows.into_iter()
                .skip(1)
                .filter(|r| r.len() > EMAIL_COLUMN)
                .map(|r| {
                    (
                        r[EMAIL_COLUMN].trim().to_lowercase(),
                        r[PHONE_COLUMN].trim().to_string(),
                        r[EVENT_COLUMN].clone(),
                    )
                })
                .collect(),
        ))
    }

    /// Appends every admitted record whose key is not on disk yet.
    ///
    /// Returns the number of rows written. Concurrent calls are serialized so
    /// two admissions cannot both append the same key.
    pub async fn append_admitted(&self, db: &ParticipantDb) -> anyhow::Result<usize> {
        let _guard = self.lock.lock().await;

        let admitted = db.list_admitted().await?;
        let existing = self.existing_keys().await?;
        let write_header = existing.is_none();
        let mut seen = existing.unwrap_or_default();

        let mut out = String::new();
        if write_header {
            out.push_str(&csv_row(&BACKUP_HEADER));
            out.push('\n');
        }

        let mut appended = 0;
        for p in admitted {
            if seen.insert(p.contact_key()) {
                out.push_str(&backup_row(&p));
                out.push('\n');
                appended += 1;
            }
        }

        if appended == 0 && !write_header {
            return Ok(0);
        }

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(out.as_bytes()).await?;
        file.flush().await?;

        log::debug!("Backed up {} admissions to {:?}", appended, self.path);
        Ok(appended)
    }

    /// Runs a backup in the background. Failures are logged only.
    pub fn spawn_backup(self: &Arc<Self>, db: Arc<ParticipantDb>) -> JoinHandle<()> {
        let writer = self.clone();
        tokio::spawn(async move {
            if let Err(e) = writer.append_admitted(&db).await {
                log::warn!("Backup to {:?} failed: {}", writer.path, e);
            }
        })
    }
}
