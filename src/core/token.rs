use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::error::TokenError;

use super::participant::Profile;

/// Identity decoded from a scanned QR code.
///
/// Either a bare id string or a JSON object carrying the id and contact
/// details.
#[derive(PartialEq, Eq, Debug, Clone)]
pub struct QrIdentity {
    pub participant_id: String,
    pub profile: Profile,
}

#[derive(Deserialize)]
struct TokenPayload {
    #[serde(default, deserialize_with = "lenient_string")]
    uid: String,
    #[serde(default, deserialize_with = "lenient_string")]
    name: String,
    #[serde(default, deserialize_with = "lenient_string")]
    email: String,
    #[serde(default, deserialize_with = "lenient_string")]
    phone: String,
    #[serde(default, deserialize_with = "lenient_string")]
    college: String,
    #[serde(default, deserialize_with = "lenient_string")]
    degree: String,
    #[serde(default, alias = "department", deserialize_with = "lenient_string")]
    dept: String,
    #[serde(default, deserialize_with = "lenient_string")]
    year: String,
}

/// Accepts strings, numbers (phones and years are often typed as such) and null.
fn lenient_string<'de, D>(d: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(d)? {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => String::new(),
    })
}

impl QrIdentity {
    pub fn parse(raw: &str) -> Result<Self, TokenError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(TokenError::Empty);
        }

        if !raw.starts_with('{') {
            return Ok(QrIdentity {
                participant_id: raw.to_string(),
                profile: Profile::default(),
            });
        }

        // Anything that looks like JSON but is not one of ours is treated as
        // an opaque id.
        let Ok(payload) = serde_json::from_str::<TokenPayload>(raw) else {
            return Ok(QrIdentity {
                participant_id: raw.to_string(),
                profile: Profile::default(),
            });
        };

        if payload.uid.is_empty() {
            return Err(TokenError::MissingId);
        }

        Ok(QrIdentity {
            participant_id: payload.uid,
            profile: Profile {
                name: payload.name,
                email: payload.email,
                phone: payload.phone,
                college: payload.college,
                degree: payload.degree,
                department: payload.dept,
                year: payload.year,
            },
        })
    }
}
