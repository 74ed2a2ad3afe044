use chrono::{DateTime, Duration, Local, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Default freshness window of an IAM token.
pub const DEFAULT_FRESHNESS_HOURS: i64 = 12;

/// A bearer credential and the moment it was issued.
///
/// On disk this is a single JSON object: `{"token": "...", "ttl": "<ISO-8601>"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub token: Option<String>,
    #[serde(
        rename = "ttl",
        default = "Utc::now",
        deserialize_with = "deserialize_issued_at"
    )]
    pub issued_at: DateTime<Utc>,
}

impl Credential {
    /// A credential that has never been acquired.
    pub fn empty() -> Self {
        Self {
            token: None,
            issued_at: Utc::now(),
        }
    }

    pub fn issued(token: impl Into<String>, issued_at: DateTime<Utc>) -> Self {
        Self {
            token: Some(token.into()),
            issued_at,
        }
    }

    pub fn is_held(&self) -> bool {
        self.token.is_some()
    }

    /// True iff a token is held and no more than `window` has passed since issue.
    pub fn is_valid_at(&self, now: DateTime<Utc>, window: Duration) -> bool {
        self.token.is_some() && now - self.issued_at <= window
    }

    /// `Authorization` header value, or `None` before the first acquisition.
    pub fn bearer_header(&self) -> Option<String> {
        self.token.as_deref().map(|t| format!("Bearer {t}"))
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }
}

impl Default for Credential {
    fn default() -> Self {
        Self::empty()
    }
}

/// Accepts RFC 3339 timestamps as well as offset-less ones, which are read as
/// local time.
fn deserialize_issued_at<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw).map_err(serde::de::Error::custom)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    let naive = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map_err(|e| format!("invalid ttl timestamp {raw:?}: {e}"))?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| format!("ttl timestamp {raw:?} does not exist in local time"))
}
