use serde::{Deserialize, Serialize};

/// The event a device is currently admitting people into.
#[derive(PartialEq, Eq, Debug, Clone, Serialize, Deserialize)]
pub struct EventContext {
    pub event_id: String,

    /// Whether a fee must be confirmed before admission
    pub payment_gated: bool,
}

impl EventContext {
    pub fn free(event_id: &str) -> Self {
        EventContext {
            event_id: event_id.to_string(),
            payment_gated: false,
        }
    }

    pub fn paid(event_id: &str) -> Self {
        EventContext {
            event_id: event_id.to_string(),
            payment_gated: true,
        }
    }
}

/// Known events and which of them charge a fee.
#[derive(Debug, Clone, Default)]
pub struct EventCatalog {
    paid_events: Vec<String>,
}

impl EventCatalog {
    pub fn new(paid_events: &[String]) -> Self {
        EventCatalog {
            paid_events: paid_events.to_vec(),
        }
    }

    pub fn is_paid(&self, event_id: &str) -> bool {
        self.paid_events
            .iter()
            .any(|e| e.trim().eq_ignore_ascii_case(event_id.trim()))
    }

    pub fn context(&self, event_id: &str) -> EventContext {
        EventContext {
            event_id: event_id.trim().to_string(),
            payment_gated: self.is_paid(event_id),
        }
    }
}

/// How a scan session admits people.
#[derive(PartialEq, Eq, Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AdmissionMode {
    Individual,
    /// A fixed-size group admitted under one team label
    Team { team_name: String, size: u32 },
}

impl AdmissionMode {
    pub fn team_name(&self) -> Option<&str> {
        match self {
            AdmissionMode::Individual => None,
            AdmissionMode::Team { team_name, .. } => Some(team_name),
        }
    }
}

/// What counts as proof of payment for an already-registered, not yet
/// admitted participant of a paid event.
#[derive(PartialEq, Eq, Debug, Clone, Copy, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PaidEntryPolicy {
    /// A record that arrived from the remote registration store, or was
    /// created at the desk, is trusted as paid.
    #[default]
    TrustLocalRecord,
    /// Only a verified payment (local flag or remote payment fact) admits.
    RequireVerifiedPayment,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_lookup() {
        let catalog = EventCatalog::new(&["WealthX".to_owned(), "Paper Presentation".to_owned()]);

        assert!(catalog.context("wealthx").payment_gated);
        assert!(!catalog.context("CodeCrypt").payment_gated);
        assert_eq!(catalog.context(" CodeCrypt ").event_id, "CodeCrypt");
    }

    #[test]
    fn test_mode_serialization() {
        let mode: AdmissionMode =
            serde_json::from_str(r#"{"mode":"team","team_name":"Null Pointers","size":3}"#).unwrap();
        assert_eq!(mode.team_name(), Some("Null Pointers"));

        let individual: AdmissionMode = serde_json::from_str(r#"{"mode":"individual"}"#).unwrap();
        assert_eq!(individual, AdmissionMode::Individual);
    }
}
