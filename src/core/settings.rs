use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use super::event::{EventCatalog, PaidEntryPolicy};

pub const DEFAULT_PROBE_URL: &str = "https://clients3.google.com/generate_204";

/// Json struct for device settings
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Settings {
    /// SQLite file holding the participant table
    pub database: Option<PathBuf>,
    /// Append-only CSV of admitted participants
    pub backup_file: Option<PathBuf>,
    /// Base url of the registration document store
    pub remote_url: Option<String>,
    pub remote_token: Option<String>,
    pub probe_url: Option<String>,
    pub probe_timeout_secs: Option<u64>,
    pub poll_interval_secs: Option<u64>,
    pub remote_timeout_secs: Option<u64>,
    pub push_batch_size: Option<usize>,
    pub pull_enabled: Option<bool>,
    #[serde(default)]
    pub paid_events: Vec<String>,
    pub paid_entry_policy: Option<PaidEntryPolicy>,
    /// Largest serialized transfer chunk, in bytes
    pub transfer_max_payload: Option<usize>,
    pub web_port: Option<u16>,
}

impl Settings {
    pub fn database(&self) -> PathBuf {
        self.database
            .clone()
            .unwrap_or_else(|| PathBuf::from("gatekeep.db"))
    }

    pub fn backup_file(&self) -> PathBuf {
        self.backup_file
            .clone()
            .unwrap_or_else(|| PathBuf::from("gatekeep_backup.csv"))
    }

    pub fn probe_url(&self) -> String {
        self.probe_url
            .clone()
            .unwrap_or_else(|| DEFAULT_PROBE_URL.to_string())
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs.unwrap_or(5))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.unwrap_or(30).max(1))
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_secs(self.remote_timeout_secs.unwrap_or(10))
    }

    pub fn push_batch_size(&self) -> usize {
        self.push_batch_size.unwrap_or(400).max(1)
    }

    pub fn pull_enabled(&self) -> bool {
        self.pull_enabled.unwrap_or(true)
    }

    pub fn paid_entry_policy(&self) -> PaidEntryPolicy {
        self.paid_entry_policy.unwrap_or_default()
    }

    pub fn transfer_max_payload(&self) -> usize {
        self.transfer_max_payload.unwrap_or(2200)
    }

    pub fn catalog(&self) -> EventCatalog {
        EventCatalog::new(&self.paid_events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings: Settings = serde_json::from_str("{}").unwrap();

        assert_eq!(settings.probe_url(), DEFAULT_PROBE_URL);
        assert_eq!(settings.probe_timeout(), Duration::from_secs(5));
        assert_eq!(settings.poll_interval(), Duration::from_secs(30));
        assert!(settings.pull_enabled());
        assert_eq!(settings.paid_entry_policy(), PaidEntryPolicy::TrustLocalRecord);
    }

    #[test]
    fn test_overrides() {
        let settings: Settings = serde_json::from_str(
            r#"{
                "paid_events": ["WealthX"],
                "paid_entry_policy": "require_verified_payment",
                "pull_enabled": false,
                "push_batch_size": 0
            }"#,
        )
        .unwrap();

        assert!(settings.catalog().is_paid("WealthX"));
        assert!(!settings.pull_enabled());
        assert_eq!(settings.push_batch_size(), 1);
        assert_eq!(
            settings.paid_entry_policy(),
            PaidEntryPolicy::RequireVerifiedPayment
        );
    }
}
