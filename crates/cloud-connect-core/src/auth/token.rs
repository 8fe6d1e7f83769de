use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Tokens returned by a provider's token endpoint. Persisting them is up to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResult {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub token_type: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub scope: Vec<String>,
    /// Every field of the token response, including provider-specific extras
    /// such as Dropbox's `account_id` or Baidu's `session_key`.
    #[serde(default)]
    pub raw: Map<String, Value>,
    #[serde(default = "default_received_at")]
    pub received_at: DateTime<Utc>,
}

fn default_received_at() -> DateTime<Utc> {
    Utc::now()
}

impl TokenResult {
    pub fn new_access_token(
        access_token: String,
        refresh_token: Option<String>,
        expires_at: Option<DateTime<Utc>>,
        scope: Vec<String>,
    ) -> Self {
        Self {
            access_token,
            refresh_token,
            token_type: Some("bearer".into()),
            expires_at,
            scope,
            raw: Map::new(),
            received_at: Utc::now(),
        }
    }

    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(ts) => Utc::now() >= ts,
            None => false,
        }
    }

    pub fn will_expire_within(&self, window: Duration) -> bool {
        match self.expires_at {
            Some(ts) => Utc::now() + window >= ts,
            None => false,
        }
    }

    /// Look up a provider-specific field from the raw token response.
    pub fn extra(&self, key: &str) -> Option<&Value> {
        self.raw.get(key)
    }
}
