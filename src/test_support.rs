//! Scripted collaborators for unit tests of the flow and the HTTP layer.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use url::Url;
use zeroize::Zeroizing;

use crate::browser::{
    BrowserError, BrowserLauncher, BrowserSession, LaunchOptions, SessionManager, WaitOutcome,
};
use crate::config::{AppConfig, BrowserSettings, CredentialOverrides};
use crate::credentials::{self, Credentials, DomainPolicy, NormalizedLoginUrl, RequestFields};
use crate::flow::{FlowPolicy, LoginFlow};
use crate::oauth::{AuthorizationSession, CaptureCoordinator, CaptureError, CapturedFields};
use crate::server::AppState;

/// Ordered record of every collaborator call.
#[derive(Debug, Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn push(&self, event: impl Into<String>) {
        self.0.lock().unwrap().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, event: &str) -> usize {
        self.events().iter().filter(|e| e.as_str() == event).count()
    }

    pub fn position(&self, prefix: &str) -> Option<usize> {
        self.events().iter().position(|e| e.starts_with(prefix))
    }
}

/// How an element behaves when waited on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Found,
    Absent,
    Broken,
}

#[derive(Debug, Clone)]
pub struct BrowserScript {
    pub launch_fails: bool,
    pub error_indicator: Presence,
    pub approval_button: Presence,
    /// A selector that `send_input`/`click` cannot locate.
    pub missing_selector: Option<&'static str>,
}

impl Default for BrowserScript {
    fn default() -> Self {
        Self {
            launch_fails: false,
            error_indicator: Presence::Absent,
            approval_button: Presence::Absent,
            missing_selector: None,
        }
    }
}

pub struct ScriptedLauncher {
    pub log: EventLog,
    pub script: BrowserScript,
}

#[async_trait]
impl BrowserLauncher for ScriptedLauncher {
    async fn launch(
        &self,
        _options: &LaunchOptions,
    ) -> Result<Box<dyn BrowserSession>, BrowserError> {
        self.log.push("launch");
        if self.script.launch_fails {
            return Err(BrowserError::Launch("no chrome executable".to_string()));
        }
        Ok(Box::new(ScriptedSession {
            log: self.log.clone(),
            script: self.script.clone(),
        }))
    }
}

struct ScriptedSession {
    log: EventLog,
    script: BrowserScript,
}

impl ScriptedSession {
    fn locate(&self, selector: &str) -> Result<(), BrowserError> {
        if self.script.missing_selector == Some(selector) {
            return Err(BrowserError::ElementNotFound {
                selector: selector.to_string(),
                timeout_ms: 5_000,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl BrowserSession for ScriptedSession {
    async fn navigate(&mut self, url: &str) -> Result<(), BrowserError> {
        self.log.push(format!("navigate:{url}"));
        Ok(())
    }

    async fn send_input(&mut self, selector: &str, _text: &str) -> Result<(), BrowserError> {
        self.log.push(format!("input:{selector}"));
        self.locate(selector)
    }

    async fn click(&mut self, selector: &str) -> Result<(), BrowserError> {
        self.log.push(format!("click:{selector}"));
        self.locate(selector)
    }

    async fn wait_for(&mut self, selector: &str, _timeout: Duration) -> WaitOutcome {
        self.log.push(format!("wait:{selector}"));
        let presence = match selector {
            "#error" => self.script.error_indicator,
            "#oaapprove" => self.script.approval_button,
            _ => Presence::Absent,
        };
        match presence {
            Presence::Found => WaitOutcome::Found,
            Presence::Absent => WaitOutcome::TimedOut,
            Presence::Broken => {
                WaitOutcome::Failed(BrowserError::Session("target crashed".to_string()))
            }
        }
    }

    async fn quit(&mut self) -> Result<(), BrowserError> {
        self.log.push("quit");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureScript {
    Succeed,
    Fail,
    Hang,
    BeginFails,
}

pub struct ScriptedCoordinator {
    pub log: EventLog,
    pub script: CaptureScript,
}

#[async_trait]
impl CaptureCoordinator for ScriptedCoordinator {
    async fn begin(
        &self,
        login_url: &NormalizedLoginUrl,
    ) -> Result<AuthorizationSession, CaptureError> {
        self.log.push("begin");
        let url = Url::parse(&format!(
            "{login_url}/services/oauth2/authorize?client_id=PlatformCLI&state=fake"
        ))
        .map_err(|e| CaptureError::AuthorizationUrl(e.to_string()))?;

        let log = self.log.clone();
        let listener = match self.script {
            CaptureScript::BeginFails => {
                return Err(CaptureError::Bind {
                    addr: "127.0.0.1:1717".to_string(),
                    details: "address in use".to_string(),
                });
            }
            CaptureScript::Succeed => tokio::spawn(async move {
                log.push("captured");
                Ok(sample_fields())
            }),
            CaptureScript::Fail => tokio::spawn(async { Err(CaptureError::StateMismatch) }),
            CaptureScript::Hang => tokio::spawn(std::future::pending()),
        };
        Ok(AuthorizationSession::new(url, listener))
    }
}

pub fn sample_fields() -> CapturedFields {
    CapturedFields {
        org_id: "00D5g000004EabcEAC".to_string(),
        user_id: "0055g00000BxyzAAA".to_string(),
        instance_url: "https://acme.my.salesforce.com".to_string(),
        access_token: Zeroizing::new("00D5g000004Eabc!AQ4AQ.token".to_string()),
        refresh_token: Zeroizing::new("5Aep861refresh".to_string()),
        encoded_auth_url: Zeroizing::new(
            "force://PlatformCLI::5Aep861refresh@acme.my.salesforce.com".to_string(),
        ),
    }
}

pub fn sample_credentials() -> Credentials {
    let request = RequestFields {
        username: Some("admin@acme.com".to_string()),
        password: Some("hunter2".to_string()),
        instance_url: Some("https://login.salesforce.com".to_string()),
        domain: None,
    };
    let policy = DomainPolicy::new("salesforce.com").unwrap();
    credentials::validate(&CredentialOverrides::default(), &request, &policy).unwrap()
}

pub fn session_manager(log: &EventLog, script: BrowserScript) -> Arc<SessionManager> {
    Arc::new(SessionManager::new(
        Arc::new(ScriptedLauncher {
            log: log.clone(),
            script,
        }),
        LaunchOptions::for_container(&BrowserSettings::default()),
        2,
    ))
}

/// Router state backed by scripted collaborators.
pub fn app_state(
    log: &EventLog,
    browser: BrowserScript,
    capture: CaptureScript,
    config: AppConfig,
) -> AppState {
    let flow = LoginFlow::new(
        session_manager(log, browser),
        Arc::new(ScriptedCoordinator {
            log: log.clone(),
            script: capture,
        }),
        FlowPolicy::from(&config.flow),
    );
    AppState {
        domain_policy: Arc::new(DomainPolicy::new(&config.provider.domain).unwrap()),
        config: Arc::new(config),
        flow: Arc::new(flow),
    }
}
