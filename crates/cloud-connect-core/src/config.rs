use std::collections::BTreeMap;
use std::fs;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::auth::{AppCredentials, StateValidation};

const APPS_FILE: &str = "apps.json";

/// Application-specific configuration helpers.
#[derive(Debug, Clone)]
pub struct ConfigLocator {
    root: PathBuf,
}

impl ConfigLocator {
    /// Attempt to discover the persistent configuration directory, creating it if needed.
    pub fn new() -> Result<Self, ConfigError> {
        let dirs = ProjectDirs::from("app", "cloud-connect", "cloud-connect")
            .ok_or(ConfigError::MissingProjectDirs)?;
        let config_dir = dirs.config_dir();
        fs::create_dir_all(config_dir).map_err(ConfigError::CreateDir)?;
        set_user_only_permissions(config_dir)?;
        Ok(Self {
            root: config_dir.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path to the file holding registered app credentials per provider.
    pub fn apps_file(&self) -> PathBuf {
        self.root.join(APPS_FILE)
    }

    #[cfg(test)]
    pub(crate) fn from_root_for_tests(root: PathBuf) -> Self {
        Self { root }
    }
}

fn set_user_only_permissions(path: &Path) -> Result<(), ConfigError> {
    #[cfg(unix)]
    {
        let metadata = fs::metadata(path)?;
        let mut permissions = metadata.permissions();
        permissions.set_mode(0o700);
        fs::set_permissions(path, permissions)?;
        Ok(())
    }
    #[cfg(not(unix))]
    {
        let _ = path;
        Ok(())
    }
}

/// Credentials an application registered with one provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppProfile {
    #[serde(default)]
    pub app_id: Option<String>,
    #[serde(default)]
    pub app_secret: Option<String>,
    #[serde(default)]
    pub callback_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub skip_state_check: bool,
}

impl AppProfile {
    /// Fill unset fields from `fallback`; values already present win.
    pub fn or(mut self, fallback: AppProfile) -> Self {
        self.app_id = self.app_id.or(fallback.app_id);
        self.app_secret = self.app_secret.or(fallback.app_secret);
        self.callback_url = self.callback_url.or(fallback.callback_url);
        self.scope = self.scope.or(fallback.scope);
        self.skip_state_check |= fallback.skip_state_check;
        self
    }

    pub fn state_validation(&self) -> StateValidation {
        if self.skip_state_check {
            StateValidation::Skip
        } else {
            StateValidation::Enforce
        }
    }

    /// Build connector credentials, requiring an app id and a callback URL.
    pub fn to_credentials(&self, provider: &str) -> Result<AppCredentials, ConfigError> {
        let app_id = self
            .app_id
            .as_deref()
            .filter(|value| !value.is_empty())
            .ok_or_else(|| ConfigError::MissingField {
                provider: provider.to_owned(),
                field: "app_id",
            })?;
        let callback = self
            .callback_url
            .as_deref()
            .ok_or_else(|| ConfigError::MissingField {
                provider: provider.to_owned(),
                field: "callback_url",
            })?;
        let callback_url = Url::parse(callback).map_err(|source| ConfigError::InvalidCallback {
            value: callback.to_owned(),
            source,
        })?;

        let mut credentials = AppCredentials::new(
            app_id,
            self.app_secret.clone().unwrap_or_default(),
            callback_url,
        );
        if let Some(scope) = &self.scope {
            credentials = credentials.with_scope(scope.clone());
        }
        Ok(credentials)
    }
}

/// Contents of `apps.json`, keyed by provider id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AppsConfig {
    apps: BTreeMap<String, AppProfile>,
}

impl AppsConfig {
    /// Load the apps file, treating a missing file as an empty configuration.
    pub fn load(locator: &ConfigLocator) -> Result<Self, ConfigError> {
        Self::load_from(&locator.apps_file())
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = fs::read_to_string(path)?;
        serde_json::from_str(&data).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn save(&self, locator: &ConfigLocator) -> Result<(), ConfigError> {
        let path = locator.apps_file();
        let data = serde_json::to_string_pretty(self).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })?;
        fs::write(&path, data)?;
        #[cfg(unix)]
        {
            let mut permissions = fs::metadata(&path)?.permissions();
            permissions.set_mode(0o600);
            fs::set_permissions(&path, permissions)?;
        }
        Ok(())
    }

    pub fn get(&self, provider: &str) -> Option<&AppProfile> {
        self.apps.get(provider)
    }

    pub fn insert(&mut self, provider: impl Into<String>, profile: AppProfile) {
        self.apps.insert(provider.into(), profile);
    }

    pub fn providers(&self) -> impl Iterator<Item = &str> {
        self.apps.keys().map(String::as_str)
    }
}

/// Errors that can occur when working with configuration directories.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to determine configuration directory for cloud-connect")]
    MissingProjectDirs,
    #[error("failed to create configuration directory: {0}")]
    CreateDir(#[source] std::io::Error),
    #[error("filesystem error: {0}")]
    Io(#[source] std::io::Error),
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("no {field} configured for {provider}")]
    MissingField {
        provider: String,
        field: &'static str,
    },
    #[error("invalid callback url '{value}': {source}")]
    InvalidCallback {
        value: String,
        #[source]
        source: url::ParseError,
    },
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::Io(err)
    }
}
