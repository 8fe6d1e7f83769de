use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{AuthError, Connector, TokenResult};

/// Bearer credential handed to HTTP clients answering an authentication challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credential {
    pub fn authorization_header(&self) -> String {
        format!("Bearer {}", self.access_token)
    }
}

impl From<&TokenResult> for Credential {
    fn from(token: &TokenResult) -> Self {
        Self {
            access_token: token.access_token.clone(),
            refresh_token: token.refresh_token.clone(),
            expires_at: token.expires_at,
        }
    }
}

/// Renews expired credentials on behalf of a generic HTTP auth-challenge handler.
#[async_trait]
pub trait CredentialRenewal: Send + Sync {
    async fn renew_credential(&self, refresh_token: &str) -> Result<Credential, AuthError>;
}

#[async_trait]
impl CredentialRenewal for Connector {
    async fn renew_credential(&self, refresh_token: &str) -> Result<Credential, AuthError> {
        let token = self.renew_token_async(refresh_token).await?;
        Ok(Credential::from(&token))
    }
}
