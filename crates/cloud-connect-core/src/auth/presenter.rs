use async_trait::async_trait;
use tracing::debug;
use url::Url;

use super::AuthError;

/// Surface that shows the authorization page to the user.
///
/// A presenter either captures the redirect itself and returns it, or returns
/// `Ok(None)` once the page is shown, in which case the redirect is expected
/// through [`RedirectHandler`](super::RedirectHandler).
/// Returning [`AuthError::Cancelled`] reports that the user dismissed the page.
#[async_trait]
pub trait AuthorizationPresenter: Send + Sync {
    async fn present(
        &self,
        authorize_url: &Url,
        callback_url: &Url,
    ) -> Result<Option<Url>, AuthError>;
}

/// Opens the authorization page in the system browser and leaves the redirect to the
/// platform's URL-scheme handler.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemBrowserPresenter;

#[async_trait]
impl AuthorizationPresenter for SystemBrowserPresenter {
    async fn present(
        &self,
        authorize_url: &Url,
        _callback_url: &Url,
    ) -> Result<Option<Url>, AuthError> {
        debug!(host = authorize_url.host_str(), "opening system browser");
        open::that(authorize_url.as_str()).map_err(|err| AuthError::BrowserLaunch(err.to_string()))?;
        Ok(None)
    }
}
