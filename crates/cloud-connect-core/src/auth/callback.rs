use tracing::warn;
use url::{form_urlencoded, Url};

use super::AuthError;

/// Error domain reported by platform web-authentication sessions.
const WEB_AUTH_SESSION_DOMAIN: &str = "com.apple.AuthenticationServices.WebAuthenticationSession";
/// Error code of a session the user dismissed.
const WEB_AUTH_CANCELED_LOGIN: &str = "1";

/// Whether the `state` echoed on the redirect must match the outstanding request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StateValidation {
    #[default]
    Enforce,
    /// Accept redirects with a missing or different `state`.
    ///
    /// This removes CSRF protection for the redirect and exists only for providers
    /// that do not echo `state` back.
    Skip,
}

/// Parameters carried by an authorization redirect.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
    pub error_domain: Option<String>,
    pub error_code: Option<String>,
}

impl CallbackParams {
    /// Read redirect parameters from the query string, falling back to the fragment.
    pub fn parse(url: &Url) -> Self {
        let from_query = Self::from_pairs(url.query_pairs());
        if from_query.code.is_some() || from_query.error.is_some() {
            return from_query;
        }
        match url.fragment() {
            Some(fragment) => {
                let from_fragment = Self::from_pairs(form_urlencoded::parse(fragment.as_bytes()));
                if from_fragment.code.is_some() || from_fragment.error.is_some() {
                    from_fragment
                } else {
                    from_query
                }
            }
            None => from_query,
        }
    }

    fn from_pairs<'a, I>(pairs: I) -> Self
    where
        I: Iterator<Item = (std::borrow::Cow<'a, str>, std::borrow::Cow<'a, str>)>,
    {
        let mut params = Self::default();
        for (key, value) in pairs {
            let value = Some(value.into_owned());
            match key.as_ref() {
                "code" => params.code = value,
                "state" => params.state = value,
                "error" => params.error = value,
                "error_description" => params.error_description = value,
                "error_domain" => params.error_domain = value,
                "error_code" => params.error_code = value,
                _ => {}
            }
        }
        params
    }

    /// True when the platform session reported that the user dismissed it.
    pub fn is_platform_cancellation(&self) -> bool {
        self.error_domain.as_deref() == Some(WEB_AUTH_SESSION_DOMAIN)
            && self.error_code.as_deref() == Some(WEB_AUTH_CANCELED_LOGIN)
    }

    /// Resolve the redirect into an authorization code.
    ///
    /// Error parameters win over a code, and state is checked before the code is released.
    pub fn into_code(
        self,
        expected_state: &str,
        validation: StateValidation,
    ) -> Result<String, AuthError> {
        if let Some(error) = self.error.clone() {
            if self.is_platform_cancellation() {
                return Err(AuthError::Cancelled);
            }
            let description = self.error_description.clone().or_else(|| {
                match (self.error_domain.as_deref(), self.error_code.as_deref()) {
                    (Some(domain), Some(code)) => Some(format!("{domain} ({code})")),
                    _ => None,
                }
            });
            return Err(AuthError::AccessDenied { error, description });
        }

        match validation {
            StateValidation::Enforce => {
                if self.state.as_deref() != Some(expected_state) {
                    return Err(AuthError::StateMismatch);
                }
            }
            StateValidation::Skip => {
                if self.state.as_deref() != Some(expected_state) {
                    warn!("accepting redirect without matching state; state validation is disabled");
                }
            }
        }

        self.code
            .filter(|code| !code.is_empty())
            .ok_or(AuthError::MissingAuthorizationCode)
    }
}

/// Whether `redirect` targets the configured callback (same scheme, host, port, and path).
pub fn matches_callback(callback: &Url, redirect: &Url) -> bool {
    if callback.scheme() != redirect.scheme() {
        return false;
    }
    if callback.host_str() != redirect.host_str()
        || callback.port_or_known_default() != redirect.port_or_known_default()
    {
        return false;
    }
    normalize_path(callback.path()) == normalize_path(redirect.path())
}

fn normalize_path(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/"
    } else {
        trimmed
    }
}
