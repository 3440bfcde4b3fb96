use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// key: monitored-keys-model
/// Canonical record for one monitored credential. Immutable after import;
/// `id` is the stable identity used everywhere else.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeyRecord {
    pub id: Uuid,
    pub secret: String,
    pub imported_at: DateTime<Utc>,
}

impl KeyRecord {
    pub fn new(secret: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            secret,
            imported_at: Utc::now(),
        }
    }

    pub fn masked_secret(&self) -> String {
        mask_secret(&self.secret)
    }
}

/// Display form of a record; the full secret never leaves the service here.
#[derive(Clone, Debug, Serialize)]
pub struct KeyInfo {
    pub id: Uuid,
    pub masked_secret: String,
    pub imported_at: DateTime<Utc>,
}

impl From<&KeyRecord> for KeyInfo {
    fn from(record: &KeyRecord) -> Self {
        Self {
            id: record.id,
            masked_secret: record.masked_secret(),
            imported_at: record.imported_at,
        }
    }
}

pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 12 {
        return "•".repeat(chars.len().max(4));
    }
    let head: String = chars[..8].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}…{tail}")
}
