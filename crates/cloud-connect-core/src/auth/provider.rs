use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use url::Url;

use super::AuthError;

/// Cloud services with a built-in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProviderId {
    BaiduPan,
    Box,
    Dropbox,
    GoogleDrive,
    OneDrive,
    PCloud,
}

impl ProviderId {
    pub const ALL: [ProviderId; 6] = [
        ProviderId::BaiduPan,
        ProviderId::Box,
        ProviderId::Dropbox,
        ProviderId::GoogleDrive,
        ProviderId::OneDrive,
        ProviderId::PCloud,
    ];

    /// Stable key used in configuration files and on the command line.
    pub fn key(&self) -> &'static str {
        match self {
            ProviderId::BaiduPan => "baidupan",
            ProviderId::Box => "box",
            ProviderId::Dropbox => "dropbox",
            ProviderId::GoogleDrive => "googledrive",
            ProviderId::OneDrive => "onedrive",
            ProviderId::PCloud => "pcloud",
        }
    }
}

impl std::str::FromStr for ProviderId {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "baidupan" | "baidu-pan" | "baidu" => Ok(ProviderId::BaiduPan),
            "box" => Ok(ProviderId::Box),
            "dropbox" => Ok(ProviderId::Dropbox),
            "googledrive" | "google-drive" | "gdrive" | "google" => Ok(ProviderId::GoogleDrive),
            "onedrive" | "one-drive" => Ok(ProviderId::OneDrive),
            "pcloud" => Ok(ProviderId::PCloud),
            other => Err(AuthError::UnknownProvider(other.to_owned())),
        }
    }
}

impl std::fmt::Display for ProviderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key())
    }
}

/// Whether callers may replace a provider's default scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopePolicy {
    Overridable,
    /// The provider contract requires the default scope; caller input is ignored.
    Fixed,
}

/// Authorization and token endpoints of a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthEndpoints {
    pub authorization_url: Url,
    pub token_url: Url,
}

/// Immutable description of one OAuth2 provider.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    key: String,
    display_name: String,
    endpoints: OAuthEndpoints,
    default_scope: Option<String>,
    scope_policy: ScopePolicy,
    supports_refresh: bool,
    authorize_parameters: Vec<(String, String)>,
    token_parameters: Vec<(String, String)>,
}

impl ProviderConfig {
    /// Describe a provider that is not part of the built-in table.
    pub fn custom(
        key: impl Into<String>,
        display_name: impl Into<String>,
        endpoints: OAuthEndpoints,
    ) -> Self {
        Self {
            key: key.into(),
            display_name: display_name.into(),
            endpoints,
            default_scope: None,
            scope_policy: ScopePolicy::Overridable,
            supports_refresh: true,
            authorize_parameters: vec![],
            token_parameters: vec![],
        }
    }

    pub fn with_default_scope(mut self, scope: impl Into<String>) -> Self {
        self.default_scope = Some(scope.into());
        self
    }

    pub fn with_scope_policy(mut self, policy: ScopePolicy) -> Self {
        self.scope_policy = policy;
        self
    }

    pub fn with_refresh_support(mut self, supported: bool) -> Self {
        self.supports_refresh = supported;
        self
    }

    pub fn with_authorize_parameter(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.authorize_parameters.push((key.into(), value.into()));
        self
    }

    pub fn with_token_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.token_parameters.push((key.into(), value.into()));
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn endpoints(&self) -> &OAuthEndpoints {
        &self.endpoints
    }

    pub fn default_scope(&self) -> Option<&str> {
        self.default_scope.as_deref()
    }

    pub fn scope_policy(&self) -> ScopePolicy {
        self.scope_policy
    }

    pub fn supports_refresh(&self) -> bool {
        self.supports_refresh
    }

    pub fn authorize_parameters(&self) -> &[(String, String)] {
        &self.authorize_parameters
    }

    pub fn token_parameters(&self) -> &[(String, String)] {
        &self.token_parameters
    }

    /// Scope sent to the provider given an optional caller override.
    pub fn effective_scope<'a>(&'a self, requested: Option<&'a str>) -> Option<&'a str> {
        let requested = requested.map(str::trim).filter(|scope| !scope.is_empty());
        match self.scope_policy {
            ScopePolicy::Fixed => self.default_scope(),
            ScopePolicy::Overridable => requested.or(self.default_scope()),
        }
    }

    fn builtin(id: ProviderId) -> Self {
        match id {
            ProviderId::BaiduPan => Self::custom(
                id.key(),
                "Baidu Pan",
                endpoints(
                    "https://openapi.baidu.com/oauth/2.0/authorize",
                    "https://openapi.baidu.com/oauth/2.0/token",
                ),
            )
            .with_default_scope("basic,netdisk")
            .with_scope_policy(ScopePolicy::Fixed)
            .with_authorize_parameter("display", "pc")
            .with_authorize_parameter("force_login", "1"),
            ProviderId::Box => Self::custom(
                id.key(),
                "Box",
                endpoints(
                    "https://account.box.com/api/oauth2/authorize",
                    "https://api.box.com/oauth2/token",
                ),
            )
            .with_default_scope("root_readwrite"),
            ProviderId::Dropbox => Self::custom(
                id.key(),
                "Dropbox",
                endpoints(
                    "https://www.dropbox.com/oauth2/authorize",
                    "https://api.dropbox.com/oauth2/token",
                ),
            )
            .with_authorize_parameter("token_access_type", "offline"),
            ProviderId::GoogleDrive => Self::custom(
                id.key(),
                "Google Drive",
                endpoints(
                    "https://accounts.google.com/o/oauth2/auth",
                    "https://accounts.google.com/o/oauth2/token",
                ),
            )
            .with_default_scope(
                "https://www.googleapis.com/auth/drive https://www.googleapis.com/auth/userinfo.profile",
            ),
            ProviderId::OneDrive => Self::custom(
                id.key(),
                "OneDrive",
                endpoints(
                    "https://login.microsoftonline.com/common/oauth2/v2.0/authorize",
                    "https://login.microsoftonline.com/common/oauth2/v2.0/token",
                ),
            )
            .with_default_scope("offline_access User.Read Files.ReadWrite.All"),
            // pCloud never issues refresh tokens.
            ProviderId::PCloud => Self::custom(
                id.key(),
                "pCloud",
                endpoints(
                    "https://my.pcloud.com/oauth2/authorize",
                    "https://api.pcloud.com/oauth2_token",
                ),
            )
            .with_refresh_support(false),
        }
    }
}

fn endpoints(authorization_url: &str, token_url: &str) -> OAuthEndpoints {
    OAuthEndpoints {
        authorization_url: Url::parse(authorization_url).expect("valid built-in authorize URL"),
        token_url: Url::parse(token_url).expect("valid built-in token URL"),
    }
}

/// Lookup table of provider configurations keyed by provider key.
#[derive(Debug, Clone, Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, Arc<ProviderConfig>>,
}

impl ProviderRegistry {
    /// An empty registry for callers assembling their own provider set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide, read-only table of the built-in providers.
    pub fn builtin() -> &'static ProviderRegistry {
        static REGISTRY: OnceLock<ProviderRegistry> = OnceLock::new();
        REGISTRY.get_or_init(|| {
            let mut registry = ProviderRegistry::new();
            for id in ProviderId::ALL {
                registry.register(ProviderConfig::builtin(id));
            }
            registry
        })
    }

    /// Add a provider, replacing any previous entry with the same key.
    pub fn register(&mut self, config: ProviderConfig) -> &mut Self {
        self.providers
            .insert(config.key().to_ascii_lowercase(), Arc::new(config));
        self
    }

    pub fn get(&self, id: ProviderId) -> Arc<ProviderConfig> {
        self.providers
            .get(id.key())
            .cloned()
            .unwrap_or_else(|| Arc::new(ProviderConfig::builtin(id)))
    }

    /// Resolve a provider by key or alias.
    pub fn lookup(&self, name: &str) -> Result<Arc<ProviderConfig>, AuthError> {
        if let Some(config) = self.providers.get(&name.trim().to_ascii_lowercase()) {
            return Ok(config.clone());
        }
        let id: ProviderId = name.parse()?;
        self.providers
            .get(id.key())
            .cloned()
            .ok_or_else(|| AuthError::UnknownProvider(name.to_owned()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ProviderConfig>> {
        self.providers.values()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}
