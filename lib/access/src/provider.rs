//! OAuth provider backends.
//!
//! The coordinator only sees [`OAuthProvider`]. [`GitHubProvider`] implements
//! the authorization-code grant against GitHub (or GitHub Enterprise) using
//! the `oauth2` crate for the URL and token exchange and `reqwest` for the
//! identity lookup.

use async_trait::async_trait;
use oauth2::{
    AuthType, AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, RedirectUrl, Scope,
    TokenResponse, TokenUrl, basic::BasicClient,
};
use reqwest::header::{ACCEPT, USER_AGENT};
use rootcause::prelude::*;
use secrecy::ExposeSecret;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

pub use oauth2::AccessToken;

use crate::config::{AuthConfig, GitHubSettings, ProviderKind};
use crate::error::{ConfigurationError, ProviderError};
use crate::user::Identity;

const GITHUB_AUTHORIZE_URL: &str = "https://github.com/login/oauth/authorize";
const GITHUB_TOKEN_URL: &str = "https://github.com/login/oauth/access_token";
const GITHUB_API_URL: &str = "https://api.github.com";
const CLIENT_USER_AGENT: &str = concat!("portcullis/", env!("CARGO_PKG_VERSION"));

/// A third-party identity provider speaking the authorization-code grant.
#[async_trait]
pub trait OAuthProvider: Send + Sync {
    /// Short provider name, e.g. "github".
    fn name(&self) -> &str;

    /// Builds the URL the browser is sent to, carrying `state` verbatim.
    fn authorization_url(&self, state: &str) -> String;

    /// Exchanges an authorization code for an access token.
    async fn exchange_code(
        &self,
        code: &str,
        state: &str,
    ) -> Result<AccessToken, Report<ProviderError>>;

    /// Fetches the profile of the user the token belongs to.
    async fn fetch_identity(&self, token: &AccessToken) -> Result<Identity, Report<ProviderError>>;
}

impl std::fmt::Debug for dyn OAuthProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "OAuthProvider({})", self.name())
    }
}

/// Builds the provider selected by `config`.
///
/// # Errors
///
/// Returns a `ConfigurationError` if the provider settings are missing or
/// invalid.
pub fn from_config(config: &AuthConfig) -> Result<Arc<dyn OAuthProvider>, Report<ConfigurationError>> {
    match config.provider {
        ProviderKind::Github => {
            let settings = config.github.as_ref().ok_or_else(|| {
                ConfigurationError::MissingProviderSettings {
                    provider: ProviderKind::Github.as_str().to_string(),
                }
            })?;
            let provider =
                GitHubProvider::new(settings, Duration::from_secs(config.provider_timeout))?;
            Ok(Arc::new(provider))
        }
    }
}

/// Endpoint set for a GitHub deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitHubEndpoints {
    pub authorize_url: String,
    pub token_url: String,
    /// Base of the REST API, without a trailing slash.
    pub api_url: String,
}

impl Default for GitHubEndpoints {
    fn default() -> Self {
        Self {
            authorize_url: GITHUB_AUTHORIZE_URL.to_string(),
            token_url: GITHUB_TOKEN_URL.to_string(),
            api_url: GITHUB_API_URL.to_string(),
        }
    }
}

impl GitHubEndpoints {
    /// Endpoints for a GitHub Enterprise host or a test server.
    #[must_use]
    pub fn at(base_url: &str, api_url: &str) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            authorize_url: format!("{base}/login/oauth/authorize"),
            token_url: format!("{base}/login/oauth/access_token"),
            api_url: api_url.trim_end_matches('/').to_string(),
        }
    }

    fn from_settings(settings: &GitHubSettings) -> Self {
        match (&settings.base_url, &settings.api_url) {
            (None, None) => Self::default(),
            (base, api) => Self::at(
                base.as_deref().unwrap_or("https://github.com"),
                api.as_deref().unwrap_or(GITHUB_API_URL),
            ),
        }
    }
}

/// GitHub OAuth app backend.
#[derive(Debug)]
pub struct GitHubProvider {
    client_id: ClientId,
    client_secret: ClientSecret,
    auth_url: AuthUrl,
    token_url: TokenUrl,
    redirect_url: RedirectUrl,
    scopes: Vec<String>,
    api_url: String,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct GitHubUser {
    id: u64,
    login: String,
    name: Option<String>,
    email: Option<String>,
    avatar_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GitHubEmail {
    email: String,
    primary: bool,
    verified: bool,
}

fn invalid(reason: impl Into<String>) -> ConfigurationError {
    ConfigurationError::InvalidProviderSettings {
        provider: ProviderKind::Github.as_str().to_string(),
        reason: reason.into(),
    }
}

impl GitHubProvider {
    /// Creates a provider for the endpoints named in `settings`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError::InvalidProviderSettings` if a URL does
    /// not parse or the HTTP client cannot be built.
    pub fn new(
        settings: &GitHubSettings,
        timeout: Duration,
    ) -> Result<Self, Report<ConfigurationError>> {
        Self::with_endpoints(settings, timeout, GitHubEndpoints::from_settings(settings))
    }

    /// Creates a provider against explicit endpoints.
    ///
    /// # Errors
    ///
    /// Same as [`GitHubProvider::new`].
    pub fn with_endpoints(
        settings: &GitHubSettings,
        timeout: Duration,
        endpoints: GitHubEndpoints,
    ) -> Result<Self, Report<ConfigurationError>> {
        let auth_url = AuthUrl::new(endpoints.authorize_url)
            .map_err(|e| invalid(format!("invalid authorize URL: {e}")))?;
        let token_url = TokenUrl::new(endpoints.token_url)
            .map_err(|e| invalid(format!("invalid token URL: {e}")))?;
        let redirect_url = RedirectUrl::new(settings.redirect_uri.clone())
            .map_err(|e| invalid(format!("invalid redirect URI: {e}")))?;

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| invalid(format!("HTTP client error: {e}")))?;

        Ok(Self {
            client_id: ClientId::new(settings.client_id.clone()),
            client_secret: ClientSecret::new(settings.client_secret.expose_secret().clone()),
            auth_url,
            token_url,
            redirect_url,
            scopes: settings.scopes.clone(),
            api_url: endpoints.api_url,
            http,
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        token: &AccessToken,
    ) -> Result<T, Report<ProviderError>> {
        let response = self
            .http
            .get(format!("{}{path}", self.api_url))
            .bearer_auth(token.secret())
            .header(USER_AGENT, CLIENT_USER_AGENT)
            .header(ACCEPT, "application/vnd.github+json")
            .send()
            .await
            .map_err(|e| ProviderError::Http {
                reason: e.without_url().to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProviderError::Identity {
                reason: format!("GET {path} returned {status}"),
            }
            .into());
        }

        response.json().await.map_err(|e| {
            ProviderError::Identity {
                reason: format!("GET {path} returned an unreadable body: {e}"),
            }
            .into()
        })
    }

    async fn primary_email(&self, token: &AccessToken) -> Option<String> {
        match self.get_json::<Vec<GitHubEmail>>("/user/emails", token).await {
            Ok(emails) => emails
                .iter()
                .find(|e| e.primary && e.verified)
                .or_else(|| emails.iter().find(|e| e.verified))
                .map(|e| e.email.clone()),
            Err(report) => {
                warn!(error = %report, "could not fetch GitHub emails, continuing without");
                None
            }
        }
    }
}

#[async_trait]
impl OAuthProvider for GitHubProvider {
    fn name(&self) -> &str {
        ProviderKind::Github.as_str()
    }

    fn authorization_url(&self, state: &str) -> String {
        let client = BasicClient::new(self.client_id.clone())
            .set_auth_uri(self.auth_url.clone())
            .set_redirect_uri(self.redirect_url.clone());

        let mut request = client.authorize_url(|| CsrfToken::new(state.to_string()));
        for scope in &self.scopes {
            request = request.add_scope(Scope::new(scope.clone()));
        }
        let (url, _) = request.url();
        url.to_string()
    }

    #[instrument(skip_all, fields(provider = "github"))]
    async fn exchange_code(
        &self,
        code: &str,
        _state: &str,
    ) -> Result<AccessToken, Report<ProviderError>> {
        let client = BasicClient::new(self.client_id.clone())
            .set_client_secret(self.client_secret.clone())
            .set_token_uri(self.token_url.clone())
            .set_redirect_uri(self.redirect_url.clone())
            .set_auth_type(AuthType::RequestBody);

        let response = client
            .exchange_code(AuthorizationCode::new(code.to_string()))
            .request_async(&self.http)
            .await
            .map_err(|e| ProviderError::TokenExchange {
                reason: e.to_string(),
            })?;

        debug!("authorization code exchanged");
        Ok(response.access_token().clone())
    }

    #[instrument(skip_all, fields(provider = "github"))]
    async fn fetch_identity(&self, token: &AccessToken) -> Result<Identity, Report<ProviderError>> {
        let profile: GitHubUser = self.get_json("/user", token).await?;
        if profile.login.trim().is_empty() {
            return Err(ProviderError::Identity {
                reason: "profile has no login".to_string(),
            }
            .into());
        }

        let email = match profile.email.filter(|e| !e.is_empty()) {
            Some(email) => Some(email),
            None => self.primary_email(token).await,
        };

        debug!(username = %profile.login, has_email = email.is_some(), "fetched GitHub identity");
        Ok(Identity {
            provider: ProviderKind::Github.as_str().to_string(),
            provider_id: profile.id.to_string(),
            username: profile.login,
            email,
            display_name: profile.name,
            avatar_url: profile.avatar_url,
        })
    }
}
