use std::future::Future;

use async_trait::async_trait;
use url::Url;

use super::callback::matches_callback;
use super::{AuthError, AuthorizationPresenter};

/// Copy/paste presenter: shows the authorization URL and reads back the redirect URL
/// the user lands on. Suited to custom-scheme callbacks and headless sessions.
pub struct ManualPresenter<Notify, Input> {
    open_browser: bool,
    notify_authorization_url: Notify,
    read_input: Input,
}

impl<Notify, Input, Fut> ManualPresenter<Notify, Input>
where
    Notify: Fn(&Url) -> Result<(), AuthError> + Send + Sync,
    Input: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<String, AuthError>> + Send,
{
    pub fn new(open_browser: bool, notify_authorization_url: Notify, read_input: Input) -> Self {
        Self {
            open_browser,
            notify_authorization_url,
            read_input,
        }
    }
}

#[async_trait]
impl<Notify, Input, Fut> AuthorizationPresenter for ManualPresenter<Notify, Input>
where
    Notify: Fn(&Url) -> Result<(), AuthError> + Send + Sync,
    Input: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<String, AuthError>> + Send,
{
    async fn present(
        &self,
        authorize_url: &Url,
        callback_url: &Url,
    ) -> Result<Option<Url>, AuthError> {
        (self.notify_authorization_url)(authorize_url)?;

        if self.open_browser {
            open::that(authorize_url.as_str())
                .map_err(|err| AuthError::BrowserLaunch(err.to_string()))?;
        }

        let raw = (self.read_input)().await?;
        parse_manual_input(raw.trim(), callback_url).map(Some)
    }
}

fn parse_manual_input(input: &str, callback_url: &Url) -> Result<Url, AuthError> {
    if input.is_empty() {
        return Err(AuthError::Cancelled);
    }

    let url = Url::parse(input).map_err(|_| {
        AuthError::InvalidAuthorizationResponse(
            "expected the full redirect URL, including its query string".into(),
        )
    })?;
    if !matches_callback(callback_url, &url) {
        return Err(AuthError::CallbackMismatch(input.to_owned()));
    }
    Ok(url)
}
