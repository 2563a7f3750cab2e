use std::{path::Path, sync::OnceLock};

use regex::Regex;
use serde::Serialize;

use crate::{
    error::SheetError,
    util::{csv_row, format_millis, parse_csv},
};

use super::{
    db::ParticipantDb,
    participant::{NewParticipant, Profile, Source},
};

const EXPORT_HEADER: [&str; 14] = [
    "UID",
    "Event",
    "Name",
    "Email",
    "Phone",
    "College",
    "Department",
    "Degree",
    "Year",
    "Admissions",
    "Last Admission",
    "Team Name",
    "Source",
    "Payment Verified",
];

#[derive(Serialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct SheetImport {
    pub imported: usize,
    pub duplicates: usize,
    /// Rows without a name and email, or without any event
    pub skipped: usize,
}

static SEPARATOR_REGEX: OnceLock<Regex> = OnceLock::new();

fn sheet_id(email: &str, phone: &str) -> String {
    let separators = SEPARATOR_REGEX.get_or_init(|| Regex::new(r"[@.]").unwrap());
    let contact = if email.is_empty() { phone } else { email };
    format!("SHEET_{}", separators.replace_all(contact, "_"))
}

struct Columns {
    name: usize,
    events: usize,
    email: Option<usize>,
    phone: Option<usize>,
    college: Option<usize>,
    department: Option<usize>,
    degree: Option<usize>,
    year: Option<usize>,
}

impl Columns {
    fn locate(header: &[String]) -> Result<Self, SheetError> {
        let find = |name: &str| {
            header
                .iter()
                .position(|h| h.trim().eq_ignore_ascii_case(name))
        };

        Ok(Columns {
            name: find("Name").ok_or(SheetError::MissingColumn("Name"))?,
            events: find("Events").ok_or(SheetError::MissingColumn("Events"))?,
            email: find("Email"),
            phone: find("Phone"),
            college: find("College"),
            department: find("Department"),
            degree: find("Degree"),
            year: find("Year"),
        })
    }
}

fn cell(row: &[String], index: Option<usize>) -> String {
    index
        .and_then(|i| row.get(i))
        .map(|v| v.trim().to_string())
        .unwrap_or_default()
}

/// Imports a registration sheet exported as CSV.
///
/// Each row yields one record per event listed in its `Events` cell. Records
/// mirror an upstream list, so they start synced.
pub async fn import_sheet(db: &ParticipantDb, text: &str) -> Result<SheetImport, SheetError> {
    let mut rows = parse_csv(text).into_iter();
    let header = rows.next().ok_or(SheetError::Empty)?;
    let cols = Columns::locate(&header)?;

    let mut result = SheetImport::default();
    for row in rows {
        let profile = Profile {
            name: cell(&row, Some(cols.name)),
            email: cell(&row, cols.email),
            phone: cell(&row, cols.phone),
            college: cell(&row, cols.college),
            degree: cell(&row, cols.degree),
            department: cell(&row, cols.department),
            year: cell(&row, cols.year),
        };

        let events: Vec<String> = cell(&row, Some(cols.events))
            .split(',')
            .map(|e| e.trim().to_string())
            .filter(|e| !e.is_empty())
            .collect();

        if (profile.name.is_empty() && profile.email.is_empty())
            || !profile.has_contact()
            || events.is_empty()
        {
            result.skipped += 1;
            continue;
        }

        let id = sheet_id(&profile.email, &profile.phone);
        for event in events {
            if db
                .find_by_contact(&profile.email, &profile.phone, Some(&event))
                .await?
                .is_some()
            {
                result.duplicates += 1;
                continue;
            }

            let record = NewParticipant::new(&id, &event, profile.clone(), Source::BulkImport);
            if db.insert_if_absent(&record).await? {
                result.imported += 1;
            } else {
                result.duplicates += 1;
            }
        }
    }

    log::info!(
        "Sheet import: {} imported, {} duplicates, {} skipped",
        result.imported,
        result.duplicates,
        result.skipped
    );
    Ok(result)
}

pub async fn import_sheet_file(db: &ParticipantDb, path: &Path) -> Result<SheetImport, SheetError> {
    let text = tokio::fs::read_to_string(path).await?;
    import_sheet(db, &text).await
}

/// Every admitted record as CSV, one row per participant-event pair.
pub async fn export_sheet(db: &ParticipantDb) -> anyhow::Result<String> {
    let mut out = csv_row(&EXPORT_HEADER);
    out.push('\n');

    for p in db.list_admitted().await? {
        out.push_str(&csv_row(&[
            p.participant_id,
            p.event_id,
            p.profile.name,
            p.profile.email,
            p.profile.phone,
            p.profile.college,
            p.profile.department,
            p.profile.degree,
            p.profile.year,
            p.admission_count.to_string(),
            format_millis(p.last_admission_time),
            p.team_name.unwrap_or_default(),
            p.source.as_str().to_string(),
            if p.payment_verified { "Yes" } else { "No" }.to_string(),
        ]));
        out.push('\n');
    }

    Ok(out)
}

pub async fn export_sheet_file(db: &ParticipantDb, path: &Path) -> anyhow::Result<()> {
    tokio::fs::write(path, export_sheet(db).await?).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{db::tests::temp_db, participant::SyncState};

    const SHEET: &str = "Name,Email,Phone,College,Department,Degree,Year,Events,Registration Date\n\
        Anu,anu@example.com,9000011111,PSG,CSE,BE,2,\"CodeCrypt, WealthX\",2024-02-01\n\
        ,,,,,,,,\n\
        Bala,bala@example.com,,CIT,EEE,BE,3,,2024-02-01\n\
        Chitra,chitra@example.com,,CIT,IT,BTech,1,LinkLogic,2024-02-02\n";

    #[tokio::test]
    async fn test_import_sheet() {
        let (_dir, db) = temp_db().await;

        let result = import_sheet(&db, SHEET).await.unwrap();
        assert_eq!(
            result,
            SheetImport {
                imported: 3,
                duplicates: 0,
                skipped: 2
            }
        );

        let anu = db
            .find_by_key("SHEET_anu_example_com", "WealthX")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(anu.source, Source::BulkImport);
        assert_eq!(anu.sync_state, SyncState::Synced);
        assert_eq!(anu.profile.department, "CSE");

        let again = import_sheet(&db, SHEET).await.unwrap();
        assert_eq!(again.imported, 0);
        assert_eq!(again.duplicates, 3);
    }

    #[tokio::test]
    async fn test_import_sheet_missing_columns() {
        let (_dir, db) = temp_db().await;
        assert!(matches!(
            import_sheet(&db, "Name,Email\nA,a@x.io\n").await,
            Err(SheetError::MissingColumn("Events"))
        ));
        assert!(matches!(import_sheet(&db, "").await, Err(SheetError::Empty)));
    }

    #[tokio::test]
    async fn test_export_sheet_lists_admitted() {
        let (dir, db) = temp_db().await;
        import_sheet(&db, SHEET).await.unwrap();
        db.increment_admission("SHEET_chitra_example_com", "LinkLogic", Some("Team Zero"))
            .await
            .unwrap();

        let path = dir.path().join("export.csv");
        export_sheet_file(&db, &path).await.unwrap();
        let rows = parse_csv(&std::fs::read_to_string(&path).unwrap());

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1][2], "Chitra");
        assert_eq!(rows[1][9], "1");
        assert_eq!(rows[1][11], "Team Zero");
    }
}
