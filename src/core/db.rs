use std::{path::Path, str::FromStr, time::Duration};

use anyhow::anyhow;
use serde::Serialize;
use sqlx::{
    migrate::{MigrateDatabase, Migrator},
    sqlite::{Sqlite, SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    SqlitePool,
};

use crate::util::now_millis;

use super::participant::{NewParticipant, ParticipantRecord, Source, SyncState};

/// Ordered, additive schema history. Existing rows survive every step.
pub static MIGRATOR: Migrator = sqlx::migrate!();

/// Head count for a single event.
#[derive(PartialEq, Eq, Debug, Clone, Serialize)]
pub struct EventCounts {
    pub total: i64,
    pub admitted: i64,
}

/// The on-device participant table, authoritative for admission decisions.
pub struct ParticipantDb {
    db: SqlitePool,
}

impl ParticipantDb {
    /// Opens (creating if needed) the store at `file` and applies any pending
    /// migrations.
    pub async fn open(file: &Path) -> anyhow::Result<Self> {
        let url = format!(
            "sqlite://{}",
            file.to_str()
                .ok_or(anyhow!("Database path {:?} is not valid UTF-8", file))?
        );
        if !Sqlite::database_exists(&url).await? {
            log::info!("Creating participant database at {}", url);
            Sqlite::create_database(&url).await?;
        }

        let options = SqliteConnectOptions::from_str(&url)?
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(10));

        let db = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        Self::from_pool(db).await
    }

    pub async fn from_pool(db: SqlitePool) -> anyhow::Result<Self> {
        MIGRATOR.run(&db).await?;
        Ok(ParticipantDb { db })
    }

    /// Inserts a record unless `(participant_id, event_id)` already exists.
    ///
    /// An existing row is left untouched, including its admission and payment
    /// state. Returns whether a row was created.
    pub async fn insert_if_absent(&self, p: &NewParticipant) -> anyhow::Result<bool> {
        if p.participant_id.is_empty() || p.event_id.is_empty() {
            return Err(anyhow!("Participant id and event id are required"));
        }

        let result = sqlx::query(
            "insert into participants(
                participant_id, event_id, name, email, phone, college,
                degree, department, year, source, sync_state, payment_verified
            ) values(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            on conflict(participant_id, event_id) do nothing",
        )
        .bind(&p.participant_id)
        .bind(&p.event_id)
        .bind(p.profile.name.trim())
        .bind(p.profile.email.trim())
        .bind(p.profile.phone.trim())
        .bind(p.profile.college.trim())
        .bind(p.profile.degree.trim())
        .bind(p.profile.department.trim())
        .bind(p.profile.year.trim())
        .bind(p.source)
        .bind(p.initial_sync_state())
        .bind(p.payment_verified)
        .execute(&self.db)
        .await?;

        let inserted = result.rows_affected() == 1;
        if inserted {
            log::debug!(
                "Inserted {} for {} ({:?})",
                p.participant_id,
                p.event_id,
                p.source
            );
        }
        Ok(inserted)
    }

    /// Looks up a record by its key.
    ///
    /// Falls back to legacy suffixed ids (`<id>_<suffix>`) registered for the
    /// same event.
    pub async fn find_by_key(
        &self,
        participant_id: &str,
        event_id: &str,
    ) -> anyhow::Result<Option<ParticipantRecord>> {
        let exact = sqlx::query_as(
            "select * from participants
                where participant_id = ? and event_id = ?
                limit 1",
        )
        .bind(participant_id)
        .bind(event_id)
        .fetch_optional(&self.db)
        .await?;

        if exact.is_some() || participant_id.is_empty() {
            return Ok(exact);
        }

        let prefix = format!("{}_", participant_id);
        Ok(sqlx::query_as(
            "select * from participants
                where event_id = ? and substr(participant_id, 1, ?) = ?
                order by participant_id
                limit 1",
        )
        .bind(event_id)
        .bind(prefix.chars().count() as i64)
        .bind(&prefix)
        .fetch_optional(&self.db)
        .await?)
    }

    /// Finds a record sharing the email (case-insensitive) or phone.
    ///
    /// With `event_id` the search is limited to that event, otherwise any
    /// event matches. Blank contact values never match.
    pub async fn find_by_contact(
        &self,
        email: &str,
        phone: &str,
        event_id: Option<&str>,
    ) -> anyhow::Result<Option<ParticipantRecord>> {
        let email = email.trim();
        let phone = phone.trim();
        if email.is_empty() && phone.is_empty() {
            return Ok(None);
        }

        Ok(sqlx::query_as(
            "select * from participants
                where (? is null or event_id = ?)
                and ((? <> '' and email = ? collate nocase) or (? <> '' and phone = ?))
                order by admission_count desc
                limit 1",
        )
        .bind(event_id)
        .bind(event_id)
        .bind(email)
        .bind(email)
        .bind(phone)
        .bind(phone)
        .fetch_optional(&self.db)
        .await?)
    }

    /// Any record of this participant, whatever the event.
    pub async fn find_any_event(
        &self,
        participant_id: &str,
    ) -> anyhow::Result<Option<ParticipantRecord>> {
        Ok(sqlx::query_as(
            "select * from participants
                where participant_id = ?
                order by admission_count desc
                limit 1",
        )
        .bind(participant_id)
        .fetch_optional(&self.db)
        .await?)
    }

    /// Records one more admission and returns the updated row.
    ///
    /// A single `update ... returning` statement, so concurrent callers for
    /// the same key are serialized by SQLite and never lose an increment.
    /// `None` if the key does not exist.
    pub async fn increment_admission(
        &self,
        participant_id: &str,
        event_id: &str,
        team_name: Option<&str>,
    ) -> anyhow::Result<Option<ParticipantRecord>> {
        self.admit_where(participant_id, event_id, team_name, false)
            .await
    }

    /// Like [`Self::increment_admission`], but only for a record that was
    /// never admitted. `None` if the key does not exist or was already used.
    pub async fn admit_first_entry(
        &self,
        participant_id: &str,
        event_id: &str,
        team_name: Option<&str>,
    ) -> anyhow::Result<Option<ParticipantRecord>> {
        self.admit_where(participant_id, event_id, team_name, true)
            .await
    }

    async fn admit_where(
        &self,
        participant_id: &str,
        event_id: &str,
        team_name: Option<&str>,
        first_entry_only: bool,
    ) -> anyhow::Result<Option<ParticipantRecord>> {
        // Stepped to completion so the write commits before anyone else reads.
        let mut rows: Vec<ParticipantRecord> = sqlx::query_as(
            "update participants set
                admission_count = admission_count + 1,
                last_admission_time = ?,
                team_name = coalesce(?, team_name),
                sync_state = ?,
                revision = revision + 1
            where participant_id = ? and event_id = ?
                and (? = 0 or admission_count = 0)
            returning *",
        )
        .bind(now_millis())
        .bind(team_name)
        .bind(SyncState::Pending)
        .bind(participant_id)
        .bind(event_id)
        .bind(first_entry_only)
        .fetch_all(&self.db)
        .await?;

        let record = rows.pop();
        if let Some(record) = &record {
            log::info!(
                "Admitted {} into {} (admission #{})",
                participant_id,
                event_id,
                record.admission_count
            );
        }
        Ok(record)
    }

    /// Marks the fee for this record as paid. Returns whether anything changed.
    pub async fn set_payment_verified(
        &self,
        participant_id: &str,
        event_id: &str,
    ) -> anyhow::Result<bool> {
        let result = sqlx::query(
            "update participants set
                payment_verified = 1,
                sync_state = ?,
                revision = revision + 1
            where participant_id = ? and event_id = ? and payment_verified = 0",
        )
        .bind(SyncState::Pending)
        .bind(participant_id)
        .bind(event_id)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Records waiting for upload, optionally restricted to some sources.
    pub async fn list_pending(
        &self,
        sources: Option<&[Source]>,
    ) -> anyhow::Result<Vec<ParticipantRecord>> {
        let pending: Vec<ParticipantRecord> = sqlx::query_as(
            "select * from participants
                where sync_state = ?
                order by participant_id, event_id",
        )
        .bind(SyncState::Pending)
        .fetch_all(&self.db)
        .await?;

        Ok(match sources {
            Some(sources) => pending
                .into_iter()
                .filter(|p| sources.contains(&p.source))
                .collect(),
            None => pending,
        })
    }

    /// Acknowledges an upload of `revision`.
    ///
    /// A record mutated after it was read for upload keeps its newer revision
    /// and stays pending.
    pub async fn mark_synced(
        &self,
        participant_id: &str,
        event_id: &str,
        revision: i64,
    ) -> anyhow::Result<bool> {
        let ack = [(participant_id.to_string(), event_id.to_string(), revision)];
        Ok(self.mark_batch_synced(&ack).await? > 0)
    }

    /// Acknowledges a whole uploaded batch in one transaction.
    ///
    /// Each entry is `(participant_id, event_id, revision)`; stale revisions
    /// stay pending as with [`Self::mark_synced`]. Returns how many records
    /// were marked. Either every acknowledgement lands or none does.
    pub async fn mark_batch_synced(&self, batch: &[(String, String, i64)]) -> anyhow::Result<u64> {
        let mut tx = self.db.begin().await?;
        let mut marked = 0;
        for (participant_id, event_id, revision) in batch {
            marked += sqlx::query(
                "update participants set sync_state = ?
                    where participant_id = ? and event_id = ? and revision = ?",
            )
            .bind(SyncState::Synced)
            .bind(participant_id)
            .bind(event_id)
            .bind(revision)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }
        tx.commit().await?;
        Ok(marked)
    }

    pub async fn list_all(&self) -> anyhow::Result<Vec<ParticipantRecord>> {
        Ok(
            sqlx::query_as("select * from participants order by name collate nocase, event_id")
                .fetch_all(&self.db)
                .await?,
        )
    }

    pub async fn list_admitted(&self) -> anyhow::Result<Vec<ParticipantRecord>> {
        Ok(sqlx::query_as(
            "select * from participants
                where admission_count > 0
                order by last_admission_time, participant_id",
        )
        .fetch_all(&self.db)
        .await?)
    }

    pub async fn list_by_event(&self, event_id: &str) -> anyhow::Result<Vec<ParticipantRecord>> {
        Ok(sqlx::query_as(
            "select * from participants
                where event_id = ?
                order by name collate nocase",
        )
        .bind(event_id)
        .fetch_all(&self.db)
        .await?)
    }

    /// Case-insensitive substring search over identity and contact fields.
    pub async fn search(&self, term: &str) -> anyhow::Result<Vec<ParticipantRecord>> {
        let term = term.trim();
        if term.is_empty() {
            return self.list_all().await;
        }

        let escaped = term
            .replace('\\', "\\\\")
            .replace('%', "\\%")
            .replace('_', "\\_");
        let pattern = format!("%{}%", escaped);
        Ok(sqlx::query_as(
            r"select * from participants
                where name like ? escape '\' or email like ? escape '\'
                or phone like ? escape '\' or participant_id like ? escape '\'
                or college like ? escape '\' or team_name like ? escape '\'
                order by name collate nocase, event_id",
        )
        .bind(&pattern)
        .bind(&pattern)
        .bind(&pattern)
        .bind(&pattern)
        .bind(&pattern)
        .bind(&pattern)
        .fetch_all(&self.db)
        .await?)
    }

    pub async fn event_counts(&self, event_id: &str) -> anyhow::Result<EventCounts> {
        let (total, admitted): (i64, i64) = sqlx::query_as(
            "select count(*), coalesce(sum(admission_count > 0), 0)
                from participants where event_id = ?",
        )
        .bind(event_id)
        .fetch_one(&self.db)
        .await?;

        Ok(EventCounts { total, admitted })
    }

    /// Administrative reset. Not part of normal operation.
    pub async fn clear_all(&self) -> anyhow::Result<u64> {
        log::warn!("Clearing every participant record");
        Ok(sqlx::query("delete from participants")
            .execute(&self.db)
            .await?
            .rows_affected())
    }
}
