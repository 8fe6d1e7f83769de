use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;
use url::Url;

use super::callback::{matches_callback, CallbackParams};
use super::{AuthError, AuthorizationPresenter};

const SUCCESS_HTML: &str = r#"<html><body><h1>Authorization complete</h1><p>You may close this window and return to the application.</p></body></html>"#;
const ERROR_HTML: &str = r#"<html><body><h1>Authorization failed</h1><p>Please return to the application for details.</p></body></html>"#;
const NOT_FOUND_HTML: &str = r#"<html><body><h1>Not found</h1></body></html>"#;

/// Idle connections (speculative pre-connects) are dropped after this long.
const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Presents the authorization page in a browser and captures the redirect with a
/// loopback HTTP listener bound to the callback URL's host and port.
pub struct LoopbackPresenter<F> {
    open_browser: bool,
    notify_authorization_url: F,
}

impl<F> LoopbackPresenter<F>
where
    F: Fn(&Url) -> Result<(), AuthError> + Send + Sync,
{
    pub fn new(open_browser: bool, notify_authorization_url: F) -> Self {
        Self {
            open_browser,
            notify_authorization_url,
        }
    }
}

/// Whether `callback` can be served by [`LoopbackPresenter`].
pub fn is_loopback_callback(callback: &Url) -> bool {
    callback.scheme() == "http"
        && matches!(
            callback.host_str(),
            Some("127.0.0.1") | Some("localhost") | Some("[::1]")
        )
}

#[async_trait]
impl<F> AuthorizationPresenter for LoopbackPresenter<F>
where
    F: Fn(&Url) -> Result<(), AuthError> + Send + Sync,
{
    async fn present(
        &self,
        authorize_url: &Url,
        callback_url: &Url,
    ) -> Result<Option<Url>, AuthError> {
        if !is_loopback_callback(callback_url) {
            return Err(AuthError::UnsupportedCallback(callback_url.to_string()));
        }
        let host = callback_url
            .host_str()
            .map(|host| host.trim_start_matches('[').trim_end_matches(']'))
            .unwrap_or("127.0.0.1")
            .to_owned();
        let port = callback_url.port_or_known_default().unwrap_or(80);
        let listener = TcpListener::bind((host.as_str(), port)).await?;
        debug!(%host, port, "loopback listener ready");

        (self.notify_authorization_url)(authorize_url)?;

        if self.open_browser {
            open::that(authorize_url.as_str())
                .map_err(|err| AuthError::BrowserLaunch(err.to_string()))?;
        }

        accept_redirect(listener, callback_url).await.map(Some)
    }
}

async fn accept_redirect(listener: TcpListener, callback_url: &Url) -> Result<Url, AuthError> {
    loop {
        let (mut stream, _addr) = listener.accept().await?;
        // Pre-connects and stray clients must not end the flow.
        match read_redirect(&mut stream, callback_url).await {
            Ok(Some(redirect)) => {
                let params = CallbackParams::parse(&redirect);
                if params.error.is_some() || params.code.is_none() {
                    respond(&mut stream, 400, ERROR_HTML).await?;
                } else {
                    respond(&mut stream, 200, SUCCESS_HTML).await?;
                }
                let _ = stream.shutdown().await;
                return Ok(redirect);
            }
            // Browsers also ask for things like /favicon.ico; only the callback path counts.
            Ok(None) => {
                let _ = respond(&mut stream, 404, NOT_FOUND_HTML).await;
            }
            Err(err) => {
                debug!(error = %err, "ignoring malformed loopback request");
                let _ = respond(&mut stream, 400, ERROR_HTML).await;
            }
        }
    }
}

async fn read_redirect(stream: &mut TcpStream, callback_url: &Url) -> Result<Option<Url>, AuthError> {
    let mut buffer = [0u8; 4096];
    let n = tokio::time::timeout(REQUEST_READ_TIMEOUT, stream.read(&mut buffer))
        .await
        .map_err(|_| AuthError::InvalidAuthorizationResponse("request timed out".into()))??;
    let request = String::from_utf8_lossy(&buffer[..n]);
    let path = parse_request_path(&request)?;
    let redirect = callback_url.join(path)?;
    Ok(matches_callback(callback_url, &redirect).then_some(redirect))
}

fn parse_request_path(request: &str) -> Result<&str, AuthError> {
    let mut lines = request.lines();
    let first_line = lines
        .next()
        .ok_or_else(|| AuthError::InvalidAuthorizationResponse("missing request line".into()))?;
    let mut parts = first_line.split_whitespace();
    let _method = parts
        .next()
        .ok_or_else(|| AuthError::InvalidAuthorizationResponse("missing method".into()))?;
    let path = parts
        .next()
        .ok_or_else(|| AuthError::InvalidAuthorizationResponse("missing path".into()))?;
    Ok(path)
}

async fn respond(stream: &mut TcpStream, status: u16, body: &str) -> Result<(), AuthError> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        400 => "HTTP/1.1 400 Bad Request",
        404 => "HTTP/1.1 404 Not Found",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let response = format!(
        "{status_line}\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await?;
    Ok(())
}
