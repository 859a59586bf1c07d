//! Salesforce web-server OAuth flow with PKCE for the CLI connected app.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use oauth2::basic::BasicClient;
use oauth2::{AuthUrl, ClientId, CsrfToken, PkceCodeChallenge, RedirectUrl, Scope};
use serde::Deserialize;
use tokio::sync::Semaphore;
use tracing::{Instrument, debug, info, info_span, warn};
use url::Url;
use zeroize::Zeroizing;

use super::callback::CallbackListener;
use super::{AuthorizationSession, CaptureCoordinator, CaptureError, CapturedFields};
use crate::config::ProviderConfig;
use crate::credentials::NormalizedLoginUrl;

const SCOPES: [&str; 3] = ["refresh_token", "api", "web"];
const TOKEN_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const BODY_SNIPPET_LEN: usize = 200;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    instance_url: String,
    id: String,
}

/// Coordinates captures for one connected app. The callback address is fixed, so
/// at most one capture is armed at a time.
pub struct SalesforceCoordinator {
    client_id: String,
    client_secret: Option<String>,
    callback_url: Url,
    http: reqwest::Client,
    slot: Arc<Semaphore>,
}

struct AuthorizationRequest {
    url: Url,
    state: String,
    verifier: Zeroizing<String>,
}

impl SalesforceCoordinator {
    pub fn new(provider: &ProviderConfig) -> Result<Self, CaptureError> {
        let callback_url = provider
            .callback()
            .map_err(|e| CaptureError::Setup(e.to_string()))?;
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(TOKEN_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| CaptureError::Setup(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client_id: provider.client_id.clone(),
            client_secret: provider.client_secret.clone(),
            callback_url,
            http,
            slot: Arc::new(Semaphore::new(1)),
        })
    }

    fn authorization_request(
        &self,
        login_url: &NormalizedLoginUrl,
    ) -> Result<AuthorizationRequest, CaptureError> {
        let auth_url = AuthUrl::new(format!("{login_url}/services/oauth2/authorize"))
            .map_err(|e| CaptureError::AuthorizationUrl(e.to_string()))?;
        let redirect_url = RedirectUrl::new(self.callback_url.to_string())
            .map_err(|e| CaptureError::AuthorizationUrl(e.to_string()))?;

        let client = BasicClient::new(ClientId::new(self.client_id.clone()))
            .set_auth_uri(auth_url)
            .set_redirect_uri(redirect_url);

        let (pkce_challenge, pkce_verifier) = PkceCodeChallenge::new_random_sha256();
        let (url, csrf_token) = client
            .authorize_url(CsrfToken::new_random)
            .add_scopes(SCOPES.iter().map(|scope| Scope::new(scope.to_string())))
            .add_extra_param("prompt", "login")
            .set_pkce_challenge(pkce_challenge)
            .url();

        Ok(AuthorizationRequest {
            url,
            state: csrf_token.secret().clone(),
            verifier: Zeroizing::new(pkce_verifier.secret().clone()),
        })
    }
}

#[async_trait]
impl CaptureCoordinator for SalesforceCoordinator {
    async fn begin(
        &self,
        login_url: &NormalizedLoginUrl,
    ) -> Result<AuthorizationSession, CaptureError> {
        let slot = self
            .slot
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| CaptureError::SlotClosed)?;

        let request = self.authorization_request(login_url)?;
        let listener = CallbackListener::bind(&self.callback_url).await?;
        info!(callback = %self.callback_url, "callback listener armed");

        let exchange = TokenExchange {
            http: self.http.clone(),
            token_url: format!("{login_url}/services/oauth2/token"),
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.clone(),
            redirect_uri: self.callback_url.to_string(),
            verifier: request.verifier,
        };
        let state = request.state;
        // The slot lives in the task so it is released only once the socket is closed.
        let task = tokio::spawn(
            async move {
                let _slot = slot;
                let code = Zeroizing::new(listener.wait_for_code(&state).await?);
                debug!("authorization code received");
                exchange.redeem(&code).await
            }
            .instrument(info_span!("oauth_capture")),
        );

        Ok(AuthorizationSession::new(request.url, task))
    }
}

struct TokenExchange {
    http: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: Option<String>,
    redirect_uri: String,
    verifier: Zeroizing<String>,
}

impl TokenExchange {
    async fn redeem(&self, code: &str) -> Result<CapturedFields, CaptureError> {
        let mut params = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("client_id", self.client_id.as_str()),
            ("redirect_uri", self.redirect_uri.as_str()),
            ("code_verifier", self.verifier.as_str()),
        ];
        if let Some(secret) = &self.client_secret {
            params.push(("client_secret", secret.as_str()));
        }

        let response = self
            .http
            .post(&self.token_url)
            .header("Accept", "application/json")
            .form(&params)
            .send()
            .await
            .map_err(|e| CaptureError::Http(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            let snippet: String = body.chars().take(BODY_SNIPPET_LEN).collect();
            warn!(status, body = %snippet, "token exchange rejected");
            return Err(CaptureError::TokenEndpoint { status });
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| CaptureError::Http(format!("invalid token response: {e}")))?;

        let refresh_token = token
            .refresh_token
            .filter(|t| !t.is_empty())
            .map(Zeroizing::new)
            .ok_or(CaptureError::MissingRefreshToken)?;
        let (org_id, user_id) = parse_identity_url(&token.id)?;
        let encoded_auth_url = Zeroizing::new(encoded_auth_url(
            &self.client_id,
            self.client_secret.as_deref(),
            &refresh_token,
            &token.instance_url,
        ));

        info!(org_id = %org_id, instance_url = %token.instance_url, "tokens captured");
        Ok(CapturedFields {
            org_id,
            user_id,
            instance_url: token.instance_url,
            access_token: Zeroizing::new(token.access_token),
            refresh_token,
            encoded_auth_url,
        })
    }
}

/// Splits `https://<login host>/id/<orgId>/<userId>` into its org and user ids.
pub fn parse_identity_url(id: &str) -> Result<(String, String), CaptureError> {
    let url = Url::parse(id).map_err(|_| CaptureError::IdentityUrl(id.to_string()))?;
    let segments: Vec<&str> = url
        .path_segments()
        .map(|segments| segments.filter(|s| !s.is_empty()).collect())
        .unwrap_or_default();

    match segments.as_slice() {
        [.., "id", org_id, user_id] => Ok((org_id.to_string(), user_id.to_string())),
        _ => Err(CaptureError::IdentityUrl(id.to_string())),
    }
}

/// Builds `force://<clientId>:<clientSecret>:<refreshToken>@<instance host>`.
pub fn encoded_auth_url(
    client_id: &str,
    client_secret: Option<&str>,
    refresh_token: &str,
    instance_url: &str,
) -> String {
    let host = instance_url
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(instance_url)
        .trim_end_matches('/');
    format!(
        "force://{client_id}:{}:{refresh_token}@{host}",
        client_secret.unwrap_or_default()
    )
}
