use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};
use url::Url;

use super::callback::{matches_callback, CallbackParams, StateValidation};
use super::oauth::is_reserved_authorize_parameter;
use super::utils::{self, MutexExt};
use super::{
    AppCredentials, AuthError, AuthorizationPresenter, OAuthClient, PkcePair, ProviderConfig,
    ProviderId, ProviderRegistry, ReqwestTransport, SystemBrowserPresenter, TokenResult,
    TokenTransport,
};

const STATE_LEN: usize = 32;

/// Lifecycle of one authorization attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Authorizing,
    Exchanging,
    Completed,
    Failed,
    Cancelled,
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Completed | Phase::Failed | Phase::Cancelled)
    }
}

/// In-flight authorization: state, cancellation, and the slot a redirect is delivered to.
struct Attempt {
    id: u64,
    state: String,
    cancel: CancellationToken,
    /// Fires once the attempt's job (and any listener it holds) has been dropped.
    finished: CancellationToken,
    superseded: AtomicBool,
    phase: Mutex<Phase>,
    redirect: Mutex<Option<oneshot::Sender<Url>>>,
}

impl Attempt {
    fn phase(&self) -> Phase {
        *self.phase.lock_or_recover()
    }

    fn set_phase(&self, phase: Phase) {
        let mut current = self.phase.lock_or_recover();
        if !current.is_terminal() {
            *current = phase;
        }
    }

    fn supersede(&self) {
        self.superseded.store(true, Ordering::SeqCst);
        self.cancel.cancel();
    }

    fn cancellation_error(&self) -> AuthError {
        if self.superseded.load(Ordering::SeqCst) {
            AuthError::Superseded
        } else {
            AuthError::Cancelled
        }
    }

    fn finish(&self, result: &Result<TokenResult, AuthError>) {
        let phase = match result {
            Ok(_) => Phase::Completed,
            Err(err) if err.is_cancellation() => Phase::Cancelled,
            Err(_) => Phase::Failed,
        };
        self.set_phase(phase);
    }
}

type PendingSlot = Arc<Mutex<Option<Arc<Attempt>>>>;

/// Handle to a running authorization; cancelling it aborts the presenter and any
/// in-flight token request.
#[derive(Clone)]
pub struct AuthorizationHandle {
    attempt: Arc<Attempt>,
}

impl AuthorizationHandle {
    /// Cancel the attempt. Has no effect once it has completed.
    pub fn cancel(&self) {
        if !self.attempt.phase().is_terminal() {
            self.attempt.cancel.cancel();
        }
    }

    pub fn phase(&self) -> Phase {
        self.attempt.phase()
    }

    pub fn is_finished(&self) -> bool {
        self.phase().is_terminal()
    }

    /// The `state` value sent with the authorization URL.
    pub fn state(&self) -> &str {
        &self.attempt.state
    }

    /// Guard that cancels the attempt when dropped unless disarmed.
    pub fn cancel_on_drop(&self) -> DropGuard {
        self.attempt.cancel.clone().drop_guard()
    }
}

impl std::fmt::Debug for AuthorizationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorizationHandle")
            .field("id", &self.attempt.id)
            .field("phase", &self.phase())
            .finish()
    }
}

/// Handle to a running token renewal.
#[derive(Debug, Clone)]
pub struct RenewalHandle {
    cancel: CancellationToken,
}

impl RenewalHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_on_drop(&self) -> DropGuard {
        self.cancel.clone().drop_guard()
    }
}

/// Routes redirects received outside the presenter (URL-scheme handlers, embedded
/// web views) to the connector's outstanding authorization.
#[derive(Clone)]
pub struct RedirectHandler {
    slot: PendingSlot,
    callback_url: Url,
}

impl RedirectHandler {
    pub fn handle_redirect(&self, redirect: &Url) -> Result<(), AuthError> {
        // Platform failures arrive as `<scheme>:?error=...` without the callback's host or path.
        // Only custom-scheme callbacks get this allowance.
        let custom_scheme = !matches!(self.callback_url.scheme(), "http" | "https");
        let platform_error = custom_scheme
            && redirect.scheme() == self.callback_url.scheme()
            && CallbackParams::parse(redirect).error.is_some();
        if !platform_error && !matches_callback(&self.callback_url, redirect) {
            return Err(AuthError::CallbackMismatch(redirect.to_string()));
        }

        let attempt = self
            .slot
            .lock_or_recover()
            .clone()
            .ok_or(AuthError::NoPendingAuthorization)?;
        let sender = attempt
            .redirect
            .lock_or_recover()
            .take()
            .ok_or(AuthError::NoPendingAuthorization)?;
        debug!(attempt = attempt.id, "redirect delivered");
        sender
            .send(redirect.clone())
            .map_err(|_| AuthError::NoPendingAuthorization)
    }

    pub fn handle_redirect_str(&self, redirect: &str) -> Result<(), AuthError> {
        self.handle_redirect(&Url::parse(redirect)?)
    }
}

/// Runs the authorization-code-with-PKCE flow and token renewal for one provider.
///
/// Methods that start work spawn onto the current Tokio runtime.
pub struct Connector {
    client: OAuthClient,
    presenter: Arc<dyn AuthorizationPresenter>,
    state_validation: StateValidation,
    slot: PendingSlot,
    next_attempt: AtomicU64,
}

/// Configures a [`Connector`].
pub struct ConnectorBuilder {
    provider: Arc<ProviderConfig>,
    credentials: AppCredentials,
    transport: Option<Arc<dyn TokenTransport>>,
    presenter: Option<Arc<dyn AuthorizationPresenter>>,
    state_validation: StateValidation,
    authorize_parameters: Vec<(String, String)>,
}

impl ConnectorBuilder {
    pub fn transport(mut self, transport: Arc<dyn TokenTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn presenter(mut self, presenter: Arc<dyn AuthorizationPresenter>) -> Self {
        self.presenter = Some(presenter);
        self
    }

    /// Choose whether the redirect's `state` must match. Defaults to [`StateValidation::Enforce`].
    pub fn state_validation(mut self, validation: StateValidation) -> Self {
        self.state_validation = validation;
        self
    }

    /// Add or replace an authorization URL query parameter. Keys the flow sets itself
    /// (`scope`, `state`, `code_challenge`, ...) make [`build`](Self::build) fail.
    pub fn authorize_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.authorize_parameters.push((key.into(), value.into()));
        self
    }

    pub fn build(self) -> Result<Connector, AuthError> {
        if let Some((key, _)) = self
            .authorize_parameters
            .iter()
            .find(|(key, _)| is_reserved_authorize_parameter(key))
        {
            return Err(AuthError::ReservedParameter(key.clone()));
        }
        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::new()?),
        };
        let presenter = self
            .presenter
            .unwrap_or_else(|| Arc::new(SystemBrowserPresenter));
        let mut client = OAuthClient::new(self.provider, self.credentials, transport);
        for (key, value) in self.authorize_parameters {
            client = client.with_authorize_parameter(key, value);
        }
        if self.state_validation == StateValidation::Skip {
            warn!(
                provider = client.provider().key(),
                "state validation disabled; redirects will not be checked for CSRF"
            );
        }
        Ok(Connector {
            client,
            presenter,
            state_validation: self.state_validation,
            slot: Arc::new(Mutex::new(None)),
            next_attempt: AtomicU64::new(1),
        })
    }
}

impl Connector {
    pub fn builder(provider: Arc<ProviderConfig>, credentials: AppCredentials) -> ConnectorBuilder {
        ConnectorBuilder {
            provider,
            credentials,
            transport: None,
            presenter: None,
            state_validation: StateValidation::default(),
            authorize_parameters: vec![],
        }
    }

    /// Builder for one of the built-in providers.
    pub fn for_provider(id: ProviderId, credentials: AppCredentials) -> ConnectorBuilder {
        Self::builder(ProviderRegistry::builtin().get(id), credentials)
    }

    pub fn provider(&self) -> &ProviderConfig {
        self.client.provider()
    }

    pub fn client(&self) -> &OAuthClient {
        &self.client
    }

    /// Authorization URL for an explicit PKCE pair and state.
    pub fn authorization_url(&self, pkce: &PkcePair, state: &str) -> Url {
        self.client.authorization_url(pkce, state)
    }

    pub fn redirect_handler(&self) -> RedirectHandler {
        RedirectHandler {
            slot: self.slot.clone(),
            callback_url: self.client.credentials().callback_url.clone(),
        }
    }

    /// Phase of the outstanding attempt, or [`Phase::Idle`] when none is running.
    pub fn phase(&self) -> Phase {
        self.slot
            .lock_or_recover()
            .as_ref()
            .map_or(Phase::Idle, |attempt| attempt.phase())
    }

    /// Start an authorization. Returns immediately; `completion` runs exactly once.
    ///
    /// A call made while another attempt is outstanding cancels that attempt, whose
    /// caller receives [`AuthError::Superseded`].
    pub fn connect<F>(&self, completion: F) -> AuthorizationHandle
    where
        F: FnOnce(Result<TokenResult, AuthError>) + Send + 'static,
    {
        let state = self
            .client
            .credentials()
            .state
            .clone()
            .filter(|state| !state.is_empty())
            .unwrap_or_else(|| utils::random_state(STATE_LEN));
        let (redirect_tx, redirect_rx) = oneshot::channel();
        let attempt = Arc::new(Attempt {
            id: self.next_attempt.fetch_add(1, Ordering::Relaxed),
            state,
            cancel: CancellationToken::new(),
            finished: CancellationToken::new(),
            superseded: AtomicBool::new(false),
            phase: Mutex::new(Phase::Authorizing),
            redirect: Mutex::new(Some(redirect_tx)),
        });

        let previous = self.slot.lock_or_recover().replace(attempt.clone());
        if let Some(previous) = &previous {
            if !previous.phase().is_terminal() {
                info!(
                    provider = self.provider().key(),
                    superseded = previous.id,
                    attempt = attempt.id,
                    "superseding outstanding authorization"
                );
                previous.supersede();
            }
        }

        let job = AuthorizationJob {
            client: self.client.clone(),
            presenter: self.presenter.clone(),
            validation: self.state_validation,
            attempt: attempt.clone(),
            previous,
            redirect_rx,
        };
        let slot = self.slot.clone();
        let task_attempt = attempt.clone();
        tokio::spawn(async move {
            let attempt = task_attempt;
            let result = tokio::select! {
                biased;
                () = attempt.cancel.cancelled() => Err(attempt.cancellation_error()),
                result = job.run() => result,
            };
            attempt.finished.cancel();
            attempt.finish(&result);
            log_outcome(attempt.id, &result);
            {
                let mut slot = slot.lock_or_recover();
                if slot.as_ref().is_some_and(|current| current.id == attempt.id) {
                    *slot = None;
                }
            }
            completion(result);
        });

        AuthorizationHandle { attempt }
    }

    /// Awaitable form of [`connect`](Self::connect). Dropping the future cancels the attempt.
    pub async fn connect_async(&self) -> Result<TokenResult, AuthError> {
        let (tx, rx) = oneshot::channel();
        let handle = self.connect(move |result| {
            let _ = tx.send(result);
        });
        let guard = handle.cancel_on_drop();
        let result = rx.await.map_err(|_| AuthError::ListenerClosed)?;
        guard.disarm();
        result
    }

    /// Exchange a refresh token for new tokens; `completion` runs exactly once.
    ///
    /// Providers without refresh support fail synchronously without any network request.
    pub fn renew_token<F>(&self, refresh_token: impl Into<String>, completion: F) -> RenewalHandle
    where
        F: FnOnce(Result<TokenResult, AuthError>) + Send + 'static,
    {
        let cancel = CancellationToken::new();
        if let Err(err) = self.client.ensure_refresh_supported() {
            completion(Err(err));
            return RenewalHandle { cancel };
        }

        let client = self.client.clone();
        let refresh_token = refresh_token.into();
        let token = cancel.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                biased;
                () = token.cancelled() => Err(AuthError::Cancelled),
                result = client.refresh(&refresh_token) => result,
            };
            if let Err(err) = &result {
                warn!(provider = client.provider().key(), error = %err, "token renewal failed");
            }
            completion(result);
        });
        RenewalHandle { cancel }
    }

    /// Awaitable form of [`renew_token`](Self::renew_token). Dropping the future cancels the request.
    pub async fn renew_token_async(
        &self,
        refresh_token: impl Into<String>,
    ) -> Result<TokenResult, AuthError> {
        let (tx, rx) = oneshot::channel();
        let handle = self.renew_token(refresh_token, move |result| {
            let _ = tx.send(result);
        });
        let guard = handle.cancel_on_drop();
        let result = rx.await.map_err(|_| AuthError::ListenerClosed)?;
        guard.disarm();
        result
    }
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("client", &self.client)
            .field("state_validation", &self.state_validation)
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

struct AuthorizationJob {
    client: OAuthClient,
    presenter: Arc<dyn AuthorizationPresenter>,
    validation: StateValidation,
    attempt: Arc<Attempt>,
    /// Superseded attempt that may still hold the callback listener.
    previous: Option<Arc<Attempt>>,
    redirect_rx: oneshot::Receiver<Url>,
}

impl AuthorizationJob {
    async fn run(mut self) -> Result<TokenResult, AuthError> {
        if let Some(previous) = self.previous.take() {
            previous.finished.cancelled().await;
        }
        let pkce = PkcePair::generate()?;
        let authorize_url = self.client.authorization_url(&pkce, &self.attempt.state);
        let callback_url = &self.client.credentials().callback_url;
        debug!(
            provider = self.client.provider().key(),
            attempt = self.attempt.id,
            "presenting authorization page"
        );

        let mut redirect_rx = self.redirect_rx;
        let mut presented = self.presenter.present(&authorize_url, callback_url);
        let captured = tokio::select! {
            result = &mut presented => result?,
            received = &mut redirect_rx => {
                Some(received.map_err(|_| AuthError::ListenerClosed)?)
            }
        };
        drop(presented);
        let redirect = match captured {
            Some(url) => url,
            None => redirect_rx.await.map_err(|_| AuthError::ListenerClosed)?,
        };

        let code = CallbackParams::parse(&redirect).into_code(&self.attempt.state, self.validation)?;
        self.attempt.set_phase(Phase::Exchanging);
        debug!(attempt = self.attempt.id, "authorization code received");
        self.client.exchange_code(&code, &pkce).await
    }
}

fn log_outcome(attempt: u64, result: &Result<TokenResult, AuthError>) {
    match result {
        Ok(_) => info!(attempt, "authorization completed"),
        Err(err) if err.is_cancellation() => info!(attempt, reason = %err, "authorization cancelled"),
        Err(err) => warn!(attempt, error = %err, "authorization failed"),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use async_trait::async_trait;
    use reqwest::StatusCode;
    use tokio::sync::{mpsc, Notify};

    use super::*;
    use crate::auth::{derive_challenge, ErrorKind, TransportResponse};

    const CALLBACK: &str = "http://127.0.0.1:8765/callback";

    #[derive(Default)]
    struct RecordingTransport {
        status: StatusCode,
        body: String,
        hang: bool,
        entered: Notify,
        requests: Mutex<Vec<(Url, Vec<(String, String)>)>>,
    }

    impl RecordingTransport {
        fn responding(status: StatusCode, body: &str) -> Arc<Self> {
            Arc::new(Self {
                status,
                body: body.to_owned(),
                ..Self::default()
            })
        }

        fn hanging() -> Arc<Self> {
            Arc::new(Self {
                hang: true,
                ..Self::default()
            })
        }

        fn calls(&self) -> usize {
            self.requests.lock().unwrap().len()
        }

        fn request(&self, index: usize) -> (Url, HashMap<String, String>) {
            let requests = self.requests.lock().unwrap();
            let (url, form) = &requests[index];
            (url.clone(), form.iter().cloned().collect())
        }
    }

    #[async_trait]
    impl TokenTransport for RecordingTransport {
        async fn post_form(
            &self,
            url: &Url,
            form: &[(String, String)],
        ) -> Result<TransportResponse, AuthError> {
            self.requests
                .lock()
                .unwrap()
                .push((url.clone(), form.to_vec()));
            self.entered.notify_one();
            if self.hang {
                std::future::pending::<()>().await;
            }
            Ok(TransportResponse {
                status: self.status,
                body: self.body.clone(),
            })
        }
    }

    /// Shows nothing; forwards the authorize URL to the test and leaves the
    /// redirect to the [`RedirectHandler`].
    struct ScriptedPresenter {
        urls: mpsc::UnboundedSender<Url>,
    }

    #[async_trait]
    impl AuthorizationPresenter for ScriptedPresenter {
        async fn present(&self, authorize_url: &Url, _callback: &Url) -> Result<Option<Url>, AuthError> {
            let _ = self.urls.send(authorize_url.clone());
            Ok(None)
        }
    }

    /// Captures the redirect itself, answering with a fixed query plus the request's state.
    struct EchoPresenter {
        query: &'static str,
    }

    #[async_trait]
    impl AuthorizationPresenter for EchoPresenter {
        async fn present(&self, authorize_url: &Url, callback: &Url) -> Result<Option<Url>, AuthError> {
            let state = query(authorize_url)["state"].clone();
            let redirect = format!("{callback}?{}&state={state}", self.query);
            Ok(Some(Url::parse(&redirect)?))
        }
    }

    fn credentials() -> AppCredentials {
        AppCredentials::new("app-id", "app-secret", Url::parse(CALLBACK).unwrap())
    }

    fn query(url: &Url) -> HashMap<String, String> {
        url.query_pairs().into_owned().collect()
    }

    fn scripted(
        provider: ProviderId,
        transport: Arc<RecordingTransport>,
    ) -> (Connector, mpsc::UnboundedReceiver<Url>) {
        let (urls, rx) = mpsc::unbounded_channel();
        let connector = Connector::for_provider(provider, credentials())
            .transport(transport)
            .presenter(Arc::new(ScriptedPresenter { urls }))
            .build()
            .unwrap();
        (connector, rx)
    }

    type Outcome = oneshot::Receiver<Result<TokenResult, AuthError>>;

    fn start(connector: &Connector, calls: &Arc<AtomicUsize>) -> (AuthorizationHandle, Outcome) {
        let (tx, rx) = oneshot::channel();
        let calls = calls.clone();
        let handle = connector.connect(move |result| {
            calls.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send(result);
        });
        (handle, rx)
    }

    fn redirect(query: &str) -> String {
        format!("{CALLBACK}?{query}")
    }

    const TOKEN_BODY: &str =
        r#"{"access_token":"AT","refresh_token":"RT","token_type":"bearer","expires_in":14400}"#;

    #[tokio::test]
    async fn dropbox_authorization_exchanges_code_with_original_verifier() {
        let transport = RecordingTransport::responding(StatusCode::OK, TOKEN_BODY);
        let (connector, mut urls) = scripted(ProviderId::Dropbox, transport.clone());
        let calls = Arc::new(AtomicUsize::new(0));

        let (handle, outcome) = start(&connector, &calls);
        let authorize = urls.recv().await.unwrap();
        let params = query(&authorize);
        assert_eq!(authorize.host_str(), Some("www.dropbox.com"));
        assert_eq!(params["state"], handle.state());
        assert_eq!(params["code_challenge_method"], "S256");
        assert_eq!(params["token_access_type"], "offline");
        assert_eq!(connector.phase(), Phase::Authorizing);

        connector
            .redirect_handler()
            .handle_redirect_str(&redirect(&format!("code=XYZ&state={}", handle.state())))
            .unwrap();

        let token = outcome.await.unwrap().unwrap();
        assert_eq!(token.access_token, "AT");
        assert_eq!(token.refresh_token.as_deref(), Some("RT"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(handle.phase(), Phase::Completed);

        assert_eq!(transport.calls(), 1);
        let (url, form) = transport.request(0);
        assert_eq!(url.as_str(), "https://api.dropbox.com/oauth2/token");
        assert_eq!(form["grant_type"], "authorization_code");
        assert_eq!(form["code"], "XYZ");
        assert_eq!(form["redirect_uri"], CALLBACK);
        assert_eq!(derive_challenge(&form["code_verifier"]), params["code_challenge"]);
    }

    #[tokio::test]
    async fn access_denied_fails_without_exchange() {
        let transport = RecordingTransport::responding(StatusCode::OK, TOKEN_BODY);
        let (connector, mut urls) = scripted(ProviderId::Box, transport.clone());
        let calls = Arc::new(AtomicUsize::new(0));

        let (handle, outcome) = start(&connector, &calls);
        urls.recv().await.unwrap();
        connector
            .redirect_handler()
            .handle_redirect_str(&redirect(&format!("error=access_denied&state={}", handle.state())))
            .unwrap();

        let err = outcome.await.unwrap().unwrap_err();
        assert!(matches!(err, AuthError::AccessDenied { .. }));
        assert_eq!(err.kind(), ErrorKind::AuthorizationDenied);
        assert_eq!(handle.phase(), Phase::Failed);
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn cancel_completes_once_and_rejects_late_redirects() {
        let transport = RecordingTransport::responding(StatusCode::OK, TOKEN_BODY);
        let (connector, mut urls) = scripted(ProviderId::GoogleDrive, transport.clone());
        let calls = Arc::new(AtomicUsize::new(0));

        let (handle, outcome) = start(&connector, &calls);
        urls.recv().await.unwrap();
        handle.cancel();

        let err = outcome.await.unwrap().unwrap_err();
        assert!(matches!(err, AuthError::Cancelled));
        assert_eq!(handle.phase(), Phase::Cancelled);
        handle.cancel();
        tokio::task::yield_now().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let late = connector
            .redirect_handler()
            .handle_redirect_str(&redirect(&format!("code=late&state={}", handle.state())));
        assert!(matches!(late, Err(AuthError::NoPendingAuthorization)));
        assert_eq!(connector.phase(), Phase::Idle);
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn cancel_aborts_token_exchange() {
        let transport = RecordingTransport::hanging();
        let (connector, mut urls) = scripted(ProviderId::OneDrive, transport.clone());
        let calls = Arc::new(AtomicUsize::new(0));

        let (handle, outcome) = start(&connector, &calls);
        urls.recv().await.unwrap();
        connector
            .redirect_handler()
            .handle_redirect_str(&redirect(&format!("code=abc&state={}", handle.state())))
            .unwrap();
        transport.entered.notified().await;
        assert_eq!(handle.phase(), Phase::Exchanging);

        handle.cancel();
        let err = outcome.await.unwrap().unwrap_err();
        assert!(matches!(err, AuthError::Cancelled));
        assert_eq!(handle.phase(), Phase::Cancelled);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn second_connect_supersedes_first() {
        let transport = RecordingTransport::responding(StatusCode::OK, TOKEN_BODY);
        let (connector, mut urls) = scripted(ProviderId::Dropbox, transport.clone());
        let first_calls = Arc::new(AtomicUsize::new(0));
        let second_calls = Arc::new(AtomicUsize::new(0));

        let (first, first_outcome) = start(&connector, &first_calls);
        urls.recv().await.unwrap();
        let (second, second_outcome) = start(&connector, &second_calls);
        assert_ne!(first.state(), second.state());

        let err = first_outcome.await.unwrap().unwrap_err();
        assert!(matches!(err, AuthError::Superseded));
        assert_eq!(err.kind(), ErrorKind::UserCancelled);
        assert_eq!(first.phase(), Phase::Cancelled);

        let authorize = urls.recv().await.unwrap();
        assert_eq!(query(&authorize)["state"], second.state());
        connector
            .redirect_handler()
            .handle_redirect_str(&redirect(&format!("code=XYZ&state={}", second.state())))
            .unwrap();
        second_outcome.await.unwrap().unwrap();

        assert_eq!(first_calls.load(Ordering::SeqCst), 1);
        assert_eq!(second_calls.load(Ordering::SeqCst), 1);
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn state_mismatch_is_rejected() {
        let transport = RecordingTransport::responding(StatusCode::OK, TOKEN_BODY);
        let (connector, mut urls) = scripted(ProviderId::Box, transport.clone());
        let calls = Arc::new(AtomicUsize::new(0));

        let (handle, outcome) = start(&connector, &calls);
        urls.recv().await.unwrap();
        connector
            .redirect_handler()
            .handle_redirect_str(&redirect("code=abc&state=forged"))
            .unwrap();

        let err = outcome.await.unwrap().unwrap_err();
        assert!(matches!(err, AuthError::StateMismatch));
        assert_eq!(handle.phase(), Phase::Failed);
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn skipped_state_validation_accepts_missing_state() {
        let transport = RecordingTransport::responding(StatusCode::OK, TOKEN_BODY);
        let (urls, mut rx) = mpsc::unbounded_channel();
        let connector = Connector::for_provider(ProviderId::Box, credentials())
            .transport(transport.clone())
            .presenter(Arc::new(ScriptedPresenter { urls }))
            .state_validation(StateValidation::Skip)
            .build()
            .unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        let (_handle, outcome) = start(&connector, &calls);
        rx.recv().await.unwrap();
        connector
            .redirect_handler()
            .handle_redirect_str(&redirect("code=abc"))
            .unwrap();

        outcome.await.unwrap().unwrap();
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn presenter_captured_redirect_completes_async_connect() {
        let transport = RecordingTransport::responding(StatusCode::OK, TOKEN_BODY);
        let connector = Connector::for_provider(ProviderId::BaiduPan, credentials())
            .transport(transport.clone())
            .presenter(Arc::new(EchoPresenter { query: "code=from-presenter" }))
            .build()
            .unwrap();

        let token = connector.connect_async().await.unwrap();
        assert_eq!(token.access_token, "AT");
        let (url, form) = transport.request(0);
        assert_eq!(url.host_str(), Some("openapi.baidu.com"));
        assert_eq!(form["code"], "from-presenter");
        assert_eq!(connector.phase(), Phase::Idle);
    }

    #[tokio::test]
    async fn platform_dismissal_maps_to_cancelled() {
        let transport = RecordingTransport::responding(StatusCode::OK, TOKEN_BODY);
        let connector = Connector::for_provider(ProviderId::Dropbox, credentials())
            .transport(transport.clone())
            .presenter(Arc::new(EchoPresenter {
                query: "error=canceled&error_domain=com.apple.AuthenticationServices.WebAuthenticationSession&error_code=1",
            }))
            .build()
            .unwrap();

        let err = connector.connect_async().await.unwrap_err();
        assert!(err.is_cancellation());
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn dropping_async_connect_cancels_attempt() {
        let transport = RecordingTransport::responding(StatusCode::OK, TOKEN_BODY);
        let (connector, mut urls) = scripted(ProviderId::Dropbox, transport.clone());

        let timed_out =
            tokio::time::timeout(Duration::from_millis(50), connector.connect_async()).await;
        assert!(timed_out.is_err());
        urls.recv().await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), async {
            while connector.phase() != Phase::Idle {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        let late = connector
            .redirect_handler()
            .handle_redirect_str(&redirect("code=late"));
        assert!(matches!(late, Err(AuthError::NoPendingAuthorization)));
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn exchange_failure_reports_endpoint_error() {
        let transport =
            RecordingTransport::responding(StatusCode::BAD_REQUEST, r#"{"error":"invalid_grant"}"#);
        let (connector, mut urls) = scripted(ProviderId::OneDrive, transport.clone());
        let calls = Arc::new(AtomicUsize::new(0));

        let (handle, outcome) = start(&connector, &calls);
        urls.recv().await.unwrap();
        connector
            .redirect_handler()
            .handle_redirect_str(&redirect(&format!("code=abc&state={}", handle.state())))
            .unwrap();

        let err = outcome.await.unwrap().unwrap_err();
        assert!(matches!(err, AuthError::TokenEndpoint { status, .. } if status == StatusCode::BAD_REQUEST));
        assert_eq!(err.kind(), ErrorKind::ProviderRejected);
        assert_eq!(handle.phase(), Phase::Failed);
    }

    #[tokio::test]
    async fn redirect_handler_rejects_foreign_urls_and_idle_connector() {
        let transport = RecordingTransport::responding(StatusCode::OK, TOKEN_BODY);
        let (connector, _urls) = scripted(ProviderId::Box, transport);
        let handler = connector.redirect_handler();

        let idle = handler.handle_redirect_str(&redirect("code=abc"));
        assert!(matches!(idle, Err(AuthError::NoPendingAuthorization)));

        let foreign = handler.handle_redirect_str("https://evil.example/callback?code=abc");
        assert!(matches!(foreign, Err(AuthError::CallbackMismatch(_))));
    }

    #[tokio::test]
    async fn pcloud_renewal_is_unsupported_without_network() {
        let transport = RecordingTransport::responding(StatusCode::OK, TOKEN_BODY);
        let (connector, _urls) = scripted(ProviderId::PCloud, transport.clone());
        let outcome = Arc::new(Mutex::new(None));

        let slot = outcome.clone();
        connector.renew_token("refresh", move |result| {
            *slot.lock().unwrap() = Some(result);
        });

        let result = outcome.lock().unwrap().take().expect("completion runs synchronously");
        let err = result.unwrap_err();
        assert!(matches!(err, AuthError::Unsupported { .. }));
        assert_eq!(err.kind(), ErrorKind::UnsupportedOperation);
        assert_eq!(transport.calls(), 0);

        let err = connector.renew_token_async("refresh").await.unwrap_err();
        assert!(matches!(err, AuthError::Unsupported { .. }));
    }

    #[tokio::test]
    async fn renewal_keeps_refresh_token_when_omitted() {
        let transport = RecordingTransport::responding(StatusCode::OK, r#"{"access_token":"fresh"}"#);
        let (connector, _urls) = scripted(ProviderId::GoogleDrive, transport.clone());

        let token = connector.renew_token_async("old-refresh").await.unwrap();
        assert_eq!(token.access_token, "fresh");
        assert_eq!(token.refresh_token.as_deref(), Some("old-refresh"));

        let (url, form) = transport.request(0);
        assert_eq!(url.as_str(), "https://accounts.google.com/o/oauth2/token");
        assert_eq!(form["grant_type"], "refresh_token");
        assert_eq!(form["refresh_token"], "old-refresh");
        assert_eq!(form["client_secret"], "app-secret");
    }

    #[tokio::test]
    async fn cancelled_renewal_reports_cancelled() {
        let transport = RecordingTransport::hanging();
        let (connector, _urls) = scripted(ProviderId::Box, transport.clone());
        let (tx, rx) = oneshot::channel();

        let handle = connector.renew_token("refresh", move |result| {
            let _ = tx.send(result);
        });
        transport.entered.notified().await;
        handle.cancel();

        let err = rx.await.unwrap().unwrap_err();
        assert!(matches!(err, AuthError::Cancelled));
    }

    #[tokio::test]
    async fn unrepresentable_expiry_still_completes() {
        let transport = RecordingTransport::responding(
            StatusCode::OK,
            r#"{"access_token":"x","expires_in":9223372036854775807}"#,
        );
        let (connector, mut urls) = scripted(ProviderId::Box, transport.clone());
        let calls = Arc::new(AtomicUsize::new(0));

        let (handle, outcome) = start(&connector, &calls);
        urls.recv().await.unwrap();
        connector
            .redirect_handler()
            .handle_redirect_str(&redirect(&format!("code=abc&state={}", handle.state())))
            .unwrap();

        let token = outcome.await.unwrap().unwrap();
        assert_eq!(token.access_token, "x");
        assert!(token.expires_at.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(handle.phase(), Phase::Completed);
    }

    #[test]
    fn reserved_authorize_parameters_are_rejected() {
        for key in ["scope", "code_challenge", "state", "client_id", "redirect_uri"] {
            let err = Connector::for_provider(ProviderId::BaiduPan, credentials())
                .transport(RecordingTransport::responding(StatusCode::OK, TOKEN_BODY))
                .authorize_parameter(key, "forged")
                .build()
                .unwrap_err();
            assert!(matches!(err, AuthError::ReservedParameter(ref k) if k == key));
            assert_eq!(err.kind(), ErrorKind::Configuration);
        }

        let connector = Connector::for_provider(ProviderId::BaiduPan, credentials().with_scope("evil"))
            .transport(RecordingTransport::responding(StatusCode::OK, TOKEN_BODY))
            .authorize_parameter("display", "mobile")
            .build()
            .unwrap();
        let pkce = PkcePair::generate().unwrap();
        let params: Vec<(String, String)> = connector
            .authorization_url(&pkce, "s")
            .query_pairs()
            .into_owned()
            .collect();
        let scopes: Vec<_> = params.iter().filter(|(k, _)| k == "scope").collect();
        assert_eq!(scopes.len(), 1);
        assert_eq!(scopes[0].1, "basic,netdisk");
    }

    #[tokio::test]
    async fn foreign_host_error_redirect_is_rejected_for_http_callbacks() {
        let transport = RecordingTransport::responding(StatusCode::OK, TOKEN_BODY);
        let (connector, mut urls) = scripted(ProviderId::Box, transport);
        let calls = Arc::new(AtomicUsize::new(0));

        let (handle, _outcome) = start(&connector, &calls);
        urls.recv().await.unwrap();
        let foreign = connector
            .redirect_handler()
            .handle_redirect_str("http://other-host/?error=access_denied");
        assert!(matches!(foreign, Err(AuthError::CallbackMismatch(_))));
        assert_eq!(handle.phase(), Phase::Authorizing);
        handle.cancel();
    }

    #[tokio::test]
    async fn custom_scheme_platform_error_reaches_attempt() {
        let transport = RecordingTransport::responding(StatusCode::OK, TOKEN_BODY);
        let (urls, mut rx) = mpsc::unbounded_channel();
        let connector = Connector::for_provider(
            ProviderId::Dropbox,
            AppCredentials::new("app-id", "", Url::parse("app://cb").unwrap()),
        )
        .transport(transport.clone())
        .presenter(Arc::new(ScriptedPresenter { urls }))
        .build()
        .unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        let (handle, outcome) = start(&connector, &calls);
        rx.recv().await.unwrap();
        connector
            .redirect_handler()
            .handle_redirect_str(
                "app:?error=canceled&error_domain=com.apple.AuthenticationServices.WebAuthenticationSession&error_code=1",
            )
            .unwrap();

        let err = outcome.await.unwrap().unwrap_err();
        assert!(matches!(err, AuthError::Cancelled));
        assert_eq!(handle.phase(), Phase::Cancelled);
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn superseding_loopback_attempt_rebinds_callback_port() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpStream;

        use crate::auth::LoopbackPresenter;

        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let callback = Url::parse(&format!("http://127.0.0.1:{port}/callback")).unwrap();
        let transport = RecordingTransport::responding(StatusCode::OK, TOKEN_BODY);
        let (urls, mut rx) = mpsc::unbounded_channel();
        let presenter = LoopbackPresenter::new(false, move |url: &Url| {
            let _ = urls.send(url.clone());
            Ok(())
        });
        let connector = Connector::for_provider(
            ProviderId::Dropbox,
            AppCredentials::new("app-id", "app-secret", callback),
        )
        .transport(transport.clone())
        .presenter(Arc::new(presenter))
        .build()
        .unwrap();

        for _ in 0..5 {
            let calls = Arc::new(AtomicUsize::new(0));
            let (_first, first_outcome) = start(&connector, &calls);
            rx.recv().await.unwrap();
            let (second, second_outcome) = start(&connector, &calls);

            let err = first_outcome.await.unwrap().unwrap_err();
            assert!(matches!(err, AuthError::Superseded));
            let authorize = rx.recv().await.unwrap();
            assert_eq!(query(&authorize)["state"], second.state());

            let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
            let request = format!(
                "GET /callback?code=c&state={} HTTP/1.1\r\nHost: 127.0.0.1\r\nConnection: close\r\n\r\n",
                second.state()
            );
            stream.write_all(request.as_bytes()).await.unwrap();
            let mut response = Vec::new();
            let _ = stream.read_to_end(&mut response).await;
            assert!(response.starts_with(b"HTTP/1.1 200"));

            second_outcome.await.unwrap().unwrap();
            assert_eq!(calls.load(Ordering::SeqCst), 2);
        }
        assert_eq!(transport.calls(), 5);
    }
}
