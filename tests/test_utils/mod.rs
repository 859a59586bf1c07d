//! Test utilities for end-to-end API tests.
//!
//! The browser is replaced by a session that performs the provider redirect itself,
//! and the capture coordinator uses the real callback listener on a free port but
//! skips the token exchange.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use sf_auto_oauth::browser::{
    BrowserError, BrowserLauncher, BrowserSession, LaunchOptions, SessionManager, WaitOutcome,
};
use sf_auto_oauth::config::{AppConfig, BrowserSettings};
use sf_auto_oauth::credentials::{DomainPolicy, NormalizedLoginUrl};
use sf_auto_oauth::flow::{FlowPolicy, LoginFlow};
use sf_auto_oauth::oauth::callback::CallbackListener;
use sf_auto_oauth::oauth::salesforce::encoded_auth_url;
use sf_auto_oauth::oauth::{AuthorizationSession, CaptureCoordinator, CaptureError, CapturedFields};
use sf_auto_oauth::server::{AppState, create_app};
use url::Url;
use zeroize::Zeroizing;

pub const AUTH_CODE: &str = "aPrxIntegrationCode";

/// What the simulated login page does after the form is submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginPage {
    /// Redirects straight to the callback.
    Redirects,
    /// Shows the consent screen; the redirect happens after approval.
    AsksForConsent,
    /// Shows the login error banner.
    RejectsCredentials,
}

#[derive(Debug, Default)]
pub struct BrowserStats {
    pub launched: AtomicUsize,
    pub quit: AtomicUsize,
}

impl BrowserStats {
    pub fn launched(&self) -> usize {
        self.launched.load(Ordering::SeqCst)
    }

    pub fn quit(&self) -> usize {
        self.quit.load(Ordering::SeqCst)
    }
}

pub struct RedirectingLauncher {
    pub page: LoginPage,
    pub stats: Arc<BrowserStats>,
}

#[async_trait]
impl BrowserLauncher for RedirectingLauncher {
    async fn launch(
        &self,
        _options: &LaunchOptions,
    ) -> Result<Box<dyn BrowserSession>, BrowserError> {
        self.stats.launched.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(RedirectingSession {
            page: self.page,
            stats: self.stats.clone(),
            authorization_url: None,
            consent_given: false,
        }))
    }
}

struct RedirectingSession {
    page: LoginPage,
    stats: Arc<BrowserStats>,
    authorization_url: Option<Url>,
    consent_given: bool,
}

impl RedirectingSession {
    /// Follows the provider redirect to the callback address.
    async fn redirect(&self) -> Result<(), BrowserError> {
        let url = self
            .authorization_url
            .as_ref()
            .ok_or_else(|| BrowserError::Session("no page loaded".to_string()))?;
        let param = |key: &str| {
            url.query_pairs()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.into_owned())
                .unwrap_or_default()
        };
        let mut callback = Url::parse(&param("redirect_uri"))
            .map_err(|e| BrowserError::Session(e.to_string()))?;
        callback
            .query_pairs_mut()
            .append_pair("code", AUTH_CODE)
            .append_pair("state", &param("state"));

        reqwest::get(callback)
            .await
            .map_err(|e| BrowserError::Session(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl BrowserSession for RedirectingSession {
    async fn navigate(&mut self, url: &str) -> Result<(), BrowserError> {
        self.authorization_url = Some(Url::parse(url).map_err(|e| BrowserError::Navigation {
            url: url.to_string(),
            details: e.to_string(),
        })?);
        Ok(())
    }

    async fn send_input(&mut self, _selector: &str, _text: &str) -> Result<(), BrowserError> {
        Ok(())
    }

    async fn click(&mut self, selector: &str) -> Result<(), BrowserError> {
        match (selector, self.page) {
            ("#Login", LoginPage::Redirects) => self.redirect().await,
            ("#oaapprove", LoginPage::AsksForConsent) => {
                self.consent_given = true;
                self.redirect().await
            }
            _ => Ok(()),
        }
    }

    async fn wait_for(&mut self, selector: &str, _timeout: Duration) -> WaitOutcome {
        match (selector, self.page) {
            ("#error", LoginPage::RejectsCredentials) => WaitOutcome::Found,
            ("#oaapprove", LoginPage::AsksForConsent) if !self.consent_given => WaitOutcome::Found,
            _ => WaitOutcome::TimedOut,
        }
    }

    async fn quit(&mut self) -> Result<(), BrowserError> {
        self.stats.quit.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Real callback listener; the captured fields are derived from the code alone.
pub struct LoopbackCoordinator {
    pub callback: Url,
}

#[async_trait]
impl CaptureCoordinator for LoopbackCoordinator {
    async fn begin(
        &self,
        login_url: &NormalizedLoginUrl,
    ) -> Result<AuthorizationSession, CaptureError> {
        let listener = CallbackListener::bind(&self.callback).await?;
        let state = uuid::Uuid::new_v4().simple().to_string();

        let mut url = Url::parse(&format!("{login_url}/services/oauth2/authorize"))
            .map_err(|e| CaptureError::AuthorizationUrl(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", "PlatformCLI")
            .append_pair("redirect_uri", self.callback.as_str())
            .append_pair("state", &state);

        let task = tokio::spawn(async move {
            let code = listener.wait_for_code(&state).await?;
            let refresh = format!("refresh-for-{code}");
            Ok(CapturedFields {
                org_id: "00DINTEGRATION01".to_string(),
                user_id: "005INTEGRATION01".to_string(),
                instance_url: "https://acme.my.salesforce.com".to_string(),
                access_token: Zeroizing::new(format!("access-for-{code}")),
                encoded_auth_url: Zeroizing::new(encoded_auth_url(
                    "PlatformCLI",
                    None,
                    &refresh,
                    "https://acme.my.salesforce.com",
                )),
                refresh_token: Zeroizing::new(refresh),
            })
        });

        Ok(AuthorizationSession::new(url, task))
    }
}

/// Builds application state around the simulated browser and a free callback port.
pub fn test_state(page: LoginPage, config: AppConfig) -> (AppState, Arc<BrowserStats>) {
    let stats = Arc::new(BrowserStats::default());
    let port = portpicker::pick_unused_port().expect("free callback port");
    let callback = Url::parse(&format!("http://localhost:{port}/OauthRedirect")).unwrap();

    let sessions = Arc::new(SessionManager::new(
        Arc::new(RedirectingLauncher {
            page,
            stats: stats.clone(),
        }),
        LaunchOptions::for_container(&BrowserSettings::default()),
        config.browser.max_concurrent_sessions,
    ));
    let flow = LoginFlow::new(
        sessions,
        Arc::new(LoopbackCoordinator { callback }),
        FlowPolicy::from(&config.flow),
    );

    let state = AppState {
        domain_policy: Arc::new(DomainPolicy::new(&config.provider.domain).unwrap()),
        config: Arc::new(config),
        flow: Arc::new(flow),
    };
    (state, stats)
}

/// Serves the router on an ephemeral port and returns its base URL.
pub async fn spawn_app(state: AppState) -> Result<String> {
    let listener = tokio::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let _ = axum::serve(listener, create_app(state)).await;
    });
    Ok(format!("http://{addr}"))
}
