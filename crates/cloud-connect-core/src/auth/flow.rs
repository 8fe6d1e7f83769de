use std::env;

use url::Url;

use super::is_loopback_callback;

/// Ways of getting the user through the provider's consent page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFlow {
    /// Open a browser and capture the redirect on a loopback listener.
    Loopback,
    /// Print the URL and read the redirect URL back from the user.
    Manual,
}

/// Helper responsible for inferring which flow to start with.
#[derive(Debug)]
pub struct FlowPreference {
    preferred: AuthFlow,
    browser_available: bool,
}

impl FlowPreference {
    /// Detect the preferred flow based on environment variables and terminal capabilities.
    pub fn detect() -> Self {
        if let Some(flow) = env::var("CLOUD_CONNECT_AUTH_FLOW")
            .ok()
            .and_then(|value| value.parse::<AuthFlow>().ok())
        {
            return Self {
                preferred: flow,
                browser_available: matches!(flow, AuthFlow::Loopback) && browser_available(),
            };
        }

        let browser_available = browser_available();
        let preferred = if browser_available {
            AuthFlow::Loopback
        } else {
            AuthFlow::Manual
        };
        Self {
            preferred,
            browser_available,
        }
    }

    /// Explicit preference, for callers that do their own detection.
    pub fn new(preferred: AuthFlow, browser_available: bool) -> Self {
        Self {
            preferred,
            browser_available,
        }
    }

    /// Downgrade to the manual flow when the callback cannot be served on loopback.
    pub fn for_callback(mut self, callback: &Url) -> Self {
        if !is_loopback_callback(callback) {
            self.preferred = AuthFlow::Manual;
        }
        self
    }

    /// Preferred flow to offer to the user.
    pub fn preferred(&self) -> AuthFlow {
        self.preferred
    }

    /// Whether we should attempt to spawn the system browser automatically.
    pub fn browser_available(&self) -> bool {
        self.browser_available
    }
}

fn browser_available() -> bool {
    if env::var_os("CLOUD_CONNECT_NO_BROWSER").is_some() {
        return false;
    }

    if env::var_os("SSH_CONNECTION").is_some() && env::var_os("DISPLAY").is_none() {
        return false;
    }

    if env::var_os("DISPLAY").is_some() || env::var_os("WAYLAND_DISPLAY").is_some() {
        return true;
    }

    cfg!(target_os = "windows") || cfg!(target_os = "macos")
}

impl std::str::FromStr for AuthFlow {
    type Err = InvalidFlow;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "loopback" | "browser" => Ok(AuthFlow::Loopback),
            "manual" | "paste" => Ok(AuthFlow::Manual),
            other => Err(InvalidFlow(other.to_owned())),
        }
    }
}

impl std::fmt::Display for AuthFlow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let value = match self {
            AuthFlow::Loopback => "loopback",
            AuthFlow::Manual => "manual",
        };
        write!(f, "{value}")
    }
}

/// Error reported when parsing an unsupported flow.
#[derive(Debug, thiserror::Error)]
#[error("invalid auth flow '{0}'")]
pub struct InvalidFlow(pub String);
