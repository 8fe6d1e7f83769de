use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::{Client, StatusCode};
use serde_json::{Map, Value};
use tracing::{debug, warn};
use url::Url;

use super::{AuthError, PkcePair, ProviderConfig, TokenResult};

const DEFAULT_USER_AGENT: &str = "cloud-connect/0.1.0";
const DEFAULT_RESPONSE_TYPE: &str = "code";
const TOKEN_REQUEST_TIMEOUT: StdDuration = StdDuration::from_secs(30);

/// Authorization URL parameters owned by the flow itself.
const RESERVED_AUTHORIZE_PARAMETERS: [&str; 7] = [
    "response_type",
    "client_id",
    "redirect_uri",
    "scope",
    "code_challenge",
    "code_challenge_method",
    "state",
];

/// Whether `key` is set by the flow and cannot be supplied as an extra parameter.
pub fn is_reserved_authorize_parameter(key: &str) -> bool {
    RESERVED_AUTHORIZE_PARAMETERS
        .iter()
        .any(|reserved| reserved.eq_ignore_ascii_case(key))
}

/// Application registration supplied by consumers.
#[derive(Debug, Clone)]
pub struct AppCredentials {
    pub app_id: String,
    pub app_secret: String,
    pub callback_url: Url,
    pub response_type: String,
    /// Scope override; ignored for providers with a fixed scope.
    pub scope: Option<String>,
    /// Fixed state value. When absent a random state is generated per attempt.
    pub state: Option<String>,
}

impl AppCredentials {
    pub fn new<I, S>(app_id: I, app_secret: S, callback_url: Url) -> Self
    where
        I: Into<String>,
        S: Into<String>,
    {
        Self {
            app_id: app_id.into(),
            app_secret: app_secret.into(),
            callback_url,
            response_type: DEFAULT_RESPONSE_TYPE.to_owned(),
            scope: None,
            state: None,
        }
    }

    pub fn with_scope<S: Into<String>>(mut self, scope: S) -> Self {
        self.scope = Some(scope.into());
        self
    }

    pub fn with_state<S: Into<String>>(mut self, state: S) -> Self {
        self.state = Some(state.into());
        self
    }

    pub fn with_response_type<S: Into<String>>(mut self, response_type: S) -> Self {
        self.response_type = response_type.into();
        self
    }
}

/// Status and body of a token endpoint response.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: StatusCode,
    pub body: String,
}

/// HTTP collaborator used for form-encoded token requests.
#[async_trait]
pub trait TokenTransport: Send + Sync {
    async fn post_form(
        &self,
        url: &Url,
        form: &[(String, String)],
    ) -> Result<TransportResponse, AuthError>;
}

/// [`TokenTransport`] backed by a shared `reqwest` client.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    http: Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self, AuthError> {
        let http = Client::builder()
            .user_agent(DEFAULT_USER_AGENT)
            .timeout(TOKEN_REQUEST_TIMEOUT)
            .build()?;
        Ok(Self { http })
    }

    pub fn with_client(http: Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl TokenTransport for ReqwestTransport {
    async fn post_form(
        &self,
        url: &Url,
        form: &[(String, String)],
    ) -> Result<TransportResponse, AuthError> {
        let response = self
            .http
            .post(url.clone())
            .header(reqwest::header::ACCEPT, "application/json")
            .form(form)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        Ok(TransportResponse { status, body })
    }
}

/// Builds authorization URLs and performs token requests for one provider.
#[derive(Clone)]
pub struct OAuthClient {
    provider: Arc<ProviderConfig>,
    credentials: AppCredentials,
    transport: Arc<dyn TokenTransport>,
    extra_authorize_parameters: Vec<(String, String)>,
}

impl OAuthClient {
    pub fn new(
        provider: Arc<ProviderConfig>,
        credentials: AppCredentials,
        transport: Arc<dyn TokenTransport>,
    ) -> Self {
        Self {
            provider,
            credentials,
            transport,
            extra_authorize_parameters: vec![],
        }
    }

    /// Add or replace an authorization URL query parameter (e.g. Baidu's `display`).
    ///
    /// Reserved keys such as `scope` or `state` are ignored.
    pub fn with_authorize_parameter(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        let key = key.into();
        if is_reserved_authorize_parameter(&key) {
            warn!(key = %key, "ignoring reserved authorization parameter");
            return self;
        }
        self.extra_authorize_parameters.retain(|(k, _)| *k != key);
        self.extra_authorize_parameters.push((key, value.into()));
        self
    }

    pub fn provider(&self) -> &ProviderConfig {
        &self.provider
    }

    pub fn credentials(&self) -> &AppCredentials {
        &self.credentials
    }

    /// Scope actually requested, after applying the provider's scope policy.
    pub fn scope(&self) -> Option<&str> {
        self.provider
            .effective_scope(self.credentials.scope.as_deref())
    }

    pub fn authorization_url(&self, pkce: &PkcePair, state: &str) -> Url {
        let mut url = self.provider.endpoints().authorization_url.clone();
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("response_type", &self.credentials.response_type);
            pairs.append_pair("client_id", &self.credentials.app_id);
            pairs.append_pair("redirect_uri", self.credentials.callback_url.as_str());
            if let Some(scope) = self.scope() {
                pairs.append_pair("scope", scope);
            }
            pairs.append_pair("code_challenge", pkce.challenge());
            pairs.append_pair("code_challenge_method", pkce.method());
            pairs.append_pair("state", state);
            for (key, value) in self.provider.authorize_parameters() {
                let overridden = self
                    .extra_authorize_parameters
                    .iter()
                    .any(|(extra, _)| extra == key);
                if !overridden && !is_reserved_authorize_parameter(key) {
                    pairs.append_pair(key, value);
                }
            }
            for (key, value) in &self.extra_authorize_parameters {
                if !is_reserved_authorize_parameter(key) {
                    pairs.append_pair(key, value);
                }
            }
        }
        url
    }

    /// Exchange an authorization code for access/refresh tokens.
    pub async fn exchange_code(&self, code: &str, pkce: &PkcePair) -> Result<TokenResult, AuthError> {
        let mut form = vec![
            ("grant_type".to_string(), "authorization_code".to_string()),
            ("code".to_string(), code.to_owned()),
            (
                "redirect_uri".to_string(),
                self.credentials.callback_url.to_string(),
            ),
            ("code_verifier".to_string(), pkce.verifier().to_owned()),
        ];
        self.push_client_credentials(&mut form);
        self.push_token_parameters(&mut form);

        debug!(provider = self.provider.key(), "exchanging authorization code");
        self.request_token(&form).await
    }

    /// Obtain a new access token from a refresh token.
    ///
    /// Providers that do not advertise refresh support are rejected before any request is made.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenResult, AuthError> {
        self.ensure_refresh_supported()?;

        let mut form = vec![
            ("grant_type".to_string(), "refresh_token".to_string()),
            ("refresh_token".to_string(), refresh_token.to_owned()),
        ];
        self.push_client_credentials(&mut form);
        self.push_token_parameters(&mut form);

        debug!(provider = self.provider.key(), "refreshing access token");
        let mut token = self.request_token(&form).await?;
        if token.refresh_token.is_none() {
            token.refresh_token = Some(refresh_token.to_owned());
        }
        Ok(token)
    }

    pub fn ensure_refresh_supported(&self) -> Result<(), AuthError> {
        if self.provider.supports_refresh() {
            Ok(())
        } else {
            Err(AuthError::Unsupported {
                provider: self.provider.display_name().to_owned(),
                operation: "token refresh",
            })
        }
    }

    fn push_client_credentials(&self, form: &mut Vec<(String, String)>) {
        form.push(("client_id".to_string(), self.credentials.app_id.clone()));
        if !self.credentials.app_secret.is_empty() {
            form.push((
                "client_secret".to_string(),
                self.credentials.app_secret.clone(),
            ));
        }
    }

    fn push_token_parameters(&self, form: &mut Vec<(String, String)>) {
        form.extend(self.provider.token_parameters().iter().cloned());
    }

    async fn request_token(&self, form: &[(String, String)]) -> Result<TokenResult, AuthError> {
        let response = self
            .transport
            .post_form(&self.provider.endpoints().token_url, form)
            .await?;
        parse_token_response(response, Utc::now())
    }
}

impl std::fmt::Debug for OAuthClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthClient")
            .field("provider", &self.provider.key())
            .field("app_id", &self.credentials.app_id)
            .field("callback_url", &self.credentials.callback_url.as_str())
            .finish_non_exhaustive()
    }
}

pub(crate) fn parse_token_response(
    response: TransportResponse,
    received_at: DateTime<Utc>,
) -> Result<TokenResult, AuthError> {
    let TransportResponse { status, body } = response;
    if !status.is_success() {
        return Err(AuthError::TokenEndpoint { status, body });
    }

    let raw: Map<String, Value> = match serde_json::from_str(&body) {
        Ok(Value::Object(map)) => map,
        Ok(_) => {
            return Err(AuthError::MalformedTokenResponse(
                "expected a JSON object".into(),
            ))
        }
        Err(err) => return Err(AuthError::MalformedTokenResponse(err.to_string())),
    };

    // pCloud reports failures with a 200 status and an `error` field.
    if raw.contains_key("error") && !raw.contains_key("access_token") {
        return Err(AuthError::TokenEndpoint { status, body });
    }

    let access_token = string_field(&raw, "access_token")
        .ok_or_else(|| AuthError::MalformedTokenResponse("missing access_token".into()))?;

    let expires_at = raw
        .get("expires_in")
        .and_then(parse_i64_lossy)
        .filter(|seconds| *seconds > 0)
        // Lifetimes past chrono's range are treated as non-expiring.
        .and_then(Duration::try_seconds)
        .and_then(|lifetime| received_at.checked_add_signed(lifetime));

    let scope = string_field(&raw, "scope")
        .unwrap_or_default()
        .split_whitespace()
        .map(ToOwned::to_owned)
        .collect();

    Ok(TokenResult {
        access_token,
        refresh_token: string_field(&raw, "refresh_token"),
        token_type: string_field(&raw, "token_type"),
        expires_at,
        scope,
        raw,
        received_at,
    })
}

fn string_field(map: &Map<String, Value>, key: &str) -> Option<String> {
    map.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_owned)
}

fn parse_i64_lossy(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}
