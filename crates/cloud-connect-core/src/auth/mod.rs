mod browser;
mod callback;
mod connector;
mod error;
mod flow;
mod manual;
mod oauth;
mod pkce;
mod presenter;
mod provider;
mod renewal;
mod token;
mod utils;

pub use browser::{is_loopback_callback, LoopbackPresenter};
pub use callback::{matches_callback, CallbackParams, StateValidation};
pub use connector::{
    AuthorizationHandle, Connector, ConnectorBuilder, Phase, RedirectHandler, RenewalHandle,
};
pub use error::{AuthError, ErrorKind};
pub use flow::{AuthFlow, FlowPreference};
pub use manual::ManualPresenter;
pub use oauth::{
    is_reserved_authorize_parameter, AppCredentials, OAuthClient, ReqwestTransport, TokenTransport,
    TransportResponse,
};
pub use pkce::{derive_challenge, generate_verifier, PkcePair, DEFAULT_VERIFIER_BYTES};
pub use presenter::{AuthorizationPresenter, SystemBrowserPresenter};
pub use provider::{OAuthEndpoints, ProviderConfig, ProviderId, ProviderRegistry, ScopePolicy};
pub use renewal::{Credential, CredentialRenewal};
pub use token::TokenResult;
pub use utils::random_state;
