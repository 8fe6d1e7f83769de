use std::env;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use cloud_connect_core::auth::{
    random_state, AuthError, AuthFlow, AuthorizationPresenter, Connector, FlowPreference,
    LoopbackPresenter, ManualPresenter, PkcePair, ProviderConfig, ProviderRegistry, ScopePolicy,
    TokenResult,
};
use cloud_connect_core::config::{AppProfile, AppsConfig, ConfigLocator};
use serde_json::json;
use tokio::task;
use url::Url;

const EXIT_INTERRUPTED: i32 = 130;

#[derive(Parser, Debug)]
#[command(author, version, about = "Connect to cloud storage providers with OAuth2 + PKCE")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List the supported providers
    Providers(ProvidersArgs),
    /// Authorize the application and print the issued tokens
    Login(LoginArgs),
    /// Exchange a refresh token for a new access token
    Refresh(RefreshArgs),
    /// Print an authorization URL with a fresh PKCE verifier
    AuthorizeUrl(AuthorizeUrlArgs),
    /// Store app credentials for a provider in apps.json
    Configure(ConfigureArgs),
}

#[derive(Args, Debug)]
struct ProvidersArgs {
    /// Output raw JSON
    #[arg(long)]
    json: bool,
}

/// App registration; flags win over `CLOUD_CONNECT_*` variables, which win over apps.json.
#[derive(Args, Debug)]
struct AppArgs {
    /// Provider id (baidupan, box, dropbox, googledrive, onedrive, pcloud)
    provider: String,
    /// Application (client) id
    #[arg(long = "app-id")]
    app_id: Option<String>,
    /// Application secret
    #[arg(long = "app-secret")]
    app_secret: Option<String>,
    /// Redirect URL registered with the provider
    #[arg(long = "callback-url")]
    callback_url: Option<String>,
    /// Requested scope; ignored by providers with a fixed scope
    #[arg(long)]
    scope: Option<String>,
    /// Accept redirects whose state does not match (disables CSRF protection)
    #[arg(long = "skip-state-check")]
    skip_state_check: bool,
}

#[derive(Args, Debug)]
struct LoginArgs {
    #[command(flatten)]
    app: AppArgs,
    /// Use manual copy/paste flow instead of a loopback listener
    #[arg(long)]
    manual: bool,
    /// Output raw JSON
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct RefreshArgs {
    #[command(flatten)]
    app: AppArgs,
    /// Refresh token previously issued by the provider
    #[arg(long = "refresh-token")]
    refresh_token: String,
    /// Output raw JSON
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct AuthorizeUrlArgs {
    #[command(flatten)]
    app: AppArgs,
}

#[derive(Args, Debug)]
struct ConfigureArgs {
    #[command(flatten)]
    app: AppArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    match cli.command {
        Commands::Providers(args) => list_providers(args)?,
        Commands::Login(args) => login(args).await?,
        Commands::Refresh(args) => refresh(args).await?,
        Commands::AuthorizeUrl(args) => authorize_url(args)?,
        Commands::Configure(args) => configure(args)?,
    }
    Ok(())
}

fn init_logging() {
    if env::var("RUST_LOG").is_ok() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_writer(std::io::stderr)
            .try_init();
    }
}

fn list_providers(args: ProvidersArgs) -> Result<()> {
    let registry = ProviderRegistry::builtin();
    let configured: Vec<String> = ConfigLocator::new()
        .ok()
        .and_then(|locator| AppsConfig::load(&locator).ok())
        .map(|config| config.providers().map(str::to_owned).collect())
        .unwrap_or_default();
    let is_configured = |key: &str| configured.iter().any(|name| name == key);
    if args.json {
        let providers = registry
            .iter()
            .map(|provider| {
                json!({
                    "id": provider.key(),
                    "name": provider.display_name(),
                    "authorization_url": provider.endpoints().authorization_url.as_str(),
                    "token_url": provider.endpoints().token_url.as_str(),
                    "default_scope": provider.default_scope(),
                    "fixed_scope": provider.scope_policy() == ScopePolicy::Fixed,
                    "supports_refresh": provider.supports_refresh(),
                    "configured": is_configured(provider.key()),
                })
            })
            .collect::<Vec<_>>();
        println!("{}", serde_json::to_string_pretty(&providers)?);
        return Ok(());
    }

    println!(
        "{:<12} {:<14} {:<8} {:<11} SCOPE",
        "ID", "NAME", "REFRESH", "CONFIGURED"
    );
    for provider in registry.iter() {
        let scope = match (provider.default_scope(), provider.scope_policy()) {
            (Some(scope), ScopePolicy::Fixed) => format!("{scope} (fixed)"),
            (Some(scope), ScopePolicy::Overridable) => scope.to_owned(),
            (None, _) => "-".to_owned(),
        };
        println!(
            "{:<12} {:<14} {:<8} {:<11} {}",
            provider.key(),
            provider.display_name(),
            if provider.supports_refresh() { "yes" } else { "no" },
            if is_configured(provider.key()) { "yes" } else { "no" },
            scope
        );
    }
    Ok(())
}

async fn login(args: LoginArgs) -> Result<()> {
    let (provider, profile) = resolve_app(&args.app)?;
    let credentials = profile.to_credentials(provider.key())?;

    let preference = FlowPreference::detect().for_callback(&credentials.callback_url);
    let (flow, open_browser) = choose_flow(args.manual, &preference);
    let presenter: Arc<dyn AuthorizationPresenter> = match flow {
        AuthFlow::Loopback => Arc::new(LoopbackPresenter::new(
            open_browser,
            print_authorization_url,
        )),
        AuthFlow::Manual => Arc::new(ManualPresenter::new(
            open_browser,
            print_authorization_url,
            prompt_for_redirect,
        )),
    };

    let connector = Connector::builder(provider.clone(), credentials)
        .presenter(presenter)
        .state_validation(profile.state_validation())
        .build()
        .context("failed to build connector")?;

    let result = tokio::select! {
        result = connector.connect_async() => result,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("Authorization cancelled.");
            // A pending stdin read would keep the runtime alive on shutdown.
            std::process::exit(EXIT_INTERRUPTED);
        }
    };

    let token = match result {
        Ok(token) => token,
        Err(AuthError::BrowserLaunch(reason)) => {
            return Err(anyhow!(
                "failed to launch browser ({reason}); retry with --manual"
            ));
        }
        Err(err) => {
            return Err(err).with_context(|| format!("{} authorization failed", provider.display_name()))
        }
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&token)?);
    } else {
        println!("Connected to {}.", provider.display_name());
        render_token(&token);
    }
    Ok(())
}

/// Flow to run and whether its presenter should launch the browser itself.
fn choose_flow(manual: bool, preference: &FlowPreference) -> (AuthFlow, bool) {
    let flow = if manual {
        AuthFlow::Manual
    } else {
        preference.preferred()
    };
    (flow, preference.browser_available())
}

async fn refresh(args: RefreshArgs) -> Result<()> {
    let (provider, profile) = resolve_app(&args.app)?;
    let credentials = profile.to_credentials(provider.key())?;
    let connector = Connector::builder(provider.clone(), credentials)
        .build()
        .context("failed to build connector")?;

    let result = tokio::select! {
        result = connector.renew_token_async(args.refresh_token) => result,
        _ = tokio::signal::ctrl_c() => Err(AuthError::Cancelled),
    };
    let token =
        result.with_context(|| format!("{} token renewal failed", provider.display_name()))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&token)?);
    } else {
        render_token(&token);
    }
    Ok(())
}

fn authorize_url(args: AuthorizeUrlArgs) -> Result<()> {
    let (provider, profile) = resolve_app(&args.app)?;
    let credentials = profile.to_credentials(provider.key())?;
    let state = credentials
        .state
        .clone()
        .unwrap_or_else(|| random_state(32));
    let connector = Connector::builder(provider, credentials)
        .build()
        .context("failed to build connector")?;
    let pkce = PkcePair::generate().context("failed to generate PKCE verifier")?;

    println!("{}", connector.authorization_url(&pkce, &state));
    println!("code_verifier: {}", pkce.verifier());
    println!("state: {state}");
    Ok(())
}

fn configure(args: ConfigureArgs) -> Result<()> {
    let provider = lookup_provider(&args.app.provider)?;
    let locator = ConfigLocator::new().context("unable to locate configuration directory")?;
    let mut config = AppsConfig::load(&locator)
        .with_context(|| format!("failed to read {}", locator.apps_file().display()))?;

    let profile = store_profile(&mut config, provider.key(), explicit_profile(&args.app))?;
    config
        .save(&locator)
        .with_context(|| format!("failed to write {}", locator.apps_file().display()))?;

    println!(
        "Stored app '{}' for {} in {}.",
        profile.app_id.as_deref().unwrap_or_default(),
        provider.display_name(),
        locator.apps_file().display()
    );
    Ok(())
}

/// Merge `explicit` over the stored profile and keep it only if it yields usable credentials.
fn store_profile(config: &mut AppsConfig, provider: &str, explicit: AppProfile) -> Result<AppProfile> {
    let stored = config.get(provider).cloned().unwrap_or_default();
    let profile = explicit.or(stored);
    profile.to_credentials(provider)?;
    config.insert(provider, profile.clone());
    Ok(profile)
}

fn resolve_app(args: &AppArgs) -> Result<(Arc<ProviderConfig>, AppProfile)> {
    let provider = lookup_provider(&args.provider)?;
    let stored = load_stored_profile(provider.key())?;
    Ok((provider, explicit_profile(args).or(env_profile()).or(stored)))
}

fn lookup_provider(name: &str) -> Result<Arc<ProviderConfig>> {
    ProviderRegistry::builtin()
        .lookup(name)
        .with_context(|| format!("unknown provider '{name}'"))
}

fn explicit_profile(args: &AppArgs) -> AppProfile {
    AppProfile {
        app_id: args.app_id.clone(),
        app_secret: args.app_secret.clone(),
        callback_url: args.callback_url.clone(),
        scope: args.scope.clone(),
        skip_state_check: args.skip_state_check,
    }
}

fn load_stored_profile(provider: &str) -> Result<AppProfile> {
    let locator = ConfigLocator::new().context("unable to locate configuration directory")?;
    let config = AppsConfig::load(&locator)
        .with_context(|| format!("failed to read {}", locator.apps_file().display()))?;
    Ok(config.get(provider).cloned().unwrap_or_default())
}

fn env_profile() -> AppProfile {
    AppProfile {
        app_id: env_value("CLOUD_CONNECT_APP_ID"),
        app_secret: env_value("CLOUD_CONNECT_APP_SECRET"),
        callback_url: env_value("CLOUD_CONNECT_CALLBACK_URL"),
        scope: env_value("CLOUD_CONNECT_SCOPE"),
        skip_state_check: false,
    }
}

fn env_value(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn render_token(token: &TokenResult) {
    println!("Access token:  {}", token.access_token);
    if let Some(refresh) = &token.refresh_token {
        println!("Refresh token: {refresh}");
    }
    if let Some(expiry) = token.expires_at {
        println!("Expires at:    {expiry} (UTC)");
    }
    if !token.scope.is_empty() {
        println!("Scope:         {}", token.scope.join(" "));
    }
}

async fn prompt_for_redirect() -> Result<String, AuthError> {
    task::spawn_blocking(|| {
        use std::io::{self, Write};
        print!("Paste the URL you were redirected to: ");
        io::stdout().flush().map_err(AuthError::Io)?;
        let mut input = String::new();
        io::stdin().read_line(&mut input).map_err(AuthError::Io)?;
        Ok(input.trim().to_owned())
    })
    .await
    .map_err(|_| AuthError::Cancelled)?
}

fn print_authorization_url(url: &Url) -> Result<(), AuthError> {
    println!("\nAuthorize the application by visiting:\n  {}\n", url);
    Ok(())
}
