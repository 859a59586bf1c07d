//! # Login Flow
//!
//! Drives one automated login: acquire a browser session, arm the OAuth capture,
//! submit the login form, handle the optional error and consent screens, then await
//! the captured tokens. The browser session is released on every exit path.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::browser::{BrowserError, BrowserSession, SessionManager, WaitOutcome};
use crate::config::FlowSettings;
use crate::credentials::Credentials;
use crate::oauth::{CaptureCoordinator, CaptureError, CapturedFields};

const USERNAME_FIELD: &str = "#username";
const PASSWORD_FIELD: &str = "#password";
const LOGIN_BUTTON: &str = "#Login";
const LOGIN_ERROR: &str = "#error";
const APPROVE_BUTTON: &str = "#oaapprove";

/// Stage toggles and deadlines for a flow.
#[derive(Debug, Clone)]
pub struct FlowPolicy {
    pub check_login_error: bool,
    pub error_wait: Duration,
    pub approval_wait: Duration,
    pub capture_timeout: Duration,
    /// Upper bound for the whole flow, including waiting for a free session.
    pub request_timeout: Duration,
}

impl From<&FlowSettings> for FlowPolicy {
    fn from(settings: &FlowSettings) -> Self {
        Self {
            check_login_error: settings.check_login_error,
            error_wait: settings.error_wait(),
            approval_wait: settings.approval_wait(),
            capture_timeout: settings.capture_timeout(),
            request_timeout: settings.request_timeout(),
        }
    }
}

/// Position of a flow in its state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    Idle,
    SessionAcquired,
    ListenerArmed,
    FormSubmitted,
    ErrorCheck,
    ApprovalPending,
    ApprovalNotNeeded,
    CaptureAwaited,
    Succeeded,
    Failed,
}

impl FlowState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowState::Idle => "idle",
            FlowState::SessionAcquired => "session_acquired",
            FlowState::ListenerArmed => "listener_armed",
            FlowState::FormSubmitted => "form_submitted",
            FlowState::ErrorCheck => "error_check",
            FlowState::ApprovalPending => "approval_pending",
            FlowState::ApprovalNotNeeded => "approval_not_needed",
            FlowState::CaptureAwaited => "capture_awaited",
            FlowState::Succeeded => "succeeded",
            FlowState::Failed => "failed",
        }
    }
}

impl fmt::Display for FlowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("failed to start browser automation session")]
    Acquisition(#[source] BrowserError),
    #[error(transparent)]
    Automation(#[from] BrowserError),
    #[error("login rejected by the identity provider")]
    CredentialRejected,
    #[error("OAuth capture failed: {0}")]
    Capture(#[from] CaptureError),
    #[error("login flow did not finish within {0:?}")]
    DeadlineExceeded(Duration),
}

impl FlowError {
    /// Label used for the outcome metric.
    pub fn kind(&self) -> &'static str {
        match self {
            FlowError::Acquisition(_) => "acquisition_failed",
            FlowError::Automation(_) => "automation_failed",
            FlowError::CredentialRejected => "credential_rejected",
            FlowError::Capture(_) => "capture_failed",
            FlowError::DeadlineExceeded(_) => "deadline_exceeded",
        }
    }
}

/// Orchestrates login flows against shared session and capture resources.
pub struct LoginFlow {
    sessions: Arc<SessionManager>,
    capture: Arc<dyn CaptureCoordinator>,
    policy: FlowPolicy,
}

impl LoginFlow {
    pub fn new(
        sessions: Arc<SessionManager>,
        capture: Arc<dyn CaptureCoordinator>,
        policy: FlowPolicy,
    ) -> Self {
        Self {
            sessions,
            capture,
            policy,
        }
    }

    /// Runs one flow to completion within the request deadline.
    pub async fn run(&self, credentials: &Credentials) -> Result<CapturedFields, FlowError> {
        let started = Instant::now();
        let deadline = self.policy.request_timeout;

        // Expiry drops the inner future; the session guard and the capture session
        // clean up after themselves.
        let result = match tokio::time::timeout(deadline, self.execute(credentials)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(timeout = ?deadline, "login flow exceeded request deadline");
                Err(FlowError::DeadlineExceeded(deadline))
            }
        };

        let outcome = match &result {
            Ok(_) => "success",
            Err(err) => err.kind(),
        };
        counter!("login_flow_outcomes_total", "outcome" => outcome).increment(1);
        histogram!("login_flow_duration_seconds").record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute(&self, credentials: &Credentials) -> Result<CapturedFields, FlowError> {
        let mut state = FlowState::Idle;

        let mut handle = match self.sessions.acquire().await {
            Ok(handle) => handle,
            Err(err) => {
                warn!(error = %err, "could not acquire browser session");
                transition(&mut state, FlowState::Failed);
                return Err(FlowError::Acquisition(err));
            }
        };
        transition(&mut state, FlowState::SessionAcquired);

        let result = self.drive(handle.session(), credentials, &mut state).await;
        handle.release().await;

        match &result {
            Ok(captured) => {
                transition(&mut state, FlowState::Succeeded);
                info!(org_id = %captured.org_id, "login flow succeeded");
            }
            Err(err) => {
                let failed_in = state;
                transition(&mut state, FlowState::Failed);
                info!(state = %failed_in, error = %err, "login flow failed");
            }
        }
        result
    }

    async fn drive(
        &self,
        session: &mut dyn BrowserSession,
        credentials: &Credentials,
        state: &mut FlowState,
    ) -> Result<CapturedFields, FlowError> {
        // The listener must be accepting before the browser can be redirected to it.
        let mut authorization = self.capture.begin(credentials.login_url()).await?;
        transition(state, FlowState::ListenerArmed);

        session
            .navigate(authorization.authorization_url().as_str())
            .await?;
        session
            .send_input(USERNAME_FIELD, credentials.username())
            .await?;
        session
            .send_input(PASSWORD_FIELD, credentials.password())
            .await?;
        session.click(LOGIN_BUTTON).await?;
        transition(state, FlowState::FormSubmitted);

        if self.policy.check_login_error {
            transition(state, FlowState::ErrorCheck);
            match session.wait_for(LOGIN_ERROR, self.policy.error_wait).await {
                WaitOutcome::Found => return Err(FlowError::CredentialRejected),
                WaitOutcome::TimedOut => debug!("no login error shown"),
                WaitOutcome::Failed(err) => return Err(err.into()),
            }
        }

        match session
            .wait_for(APPROVE_BUTTON, self.policy.approval_wait)
            .await
        {
            WaitOutcome::Found => {
                transition(state, FlowState::ApprovalPending);
                session.click(APPROVE_BUTTON).await?;
            }
            WaitOutcome::TimedOut => transition(state, FlowState::ApprovalNotNeeded),
            WaitOutcome::Failed(err) => return Err(err.into()),
        }

        transition(state, FlowState::CaptureAwaited);
        match tokio::time::timeout(self.policy.capture_timeout, authorization.captured()).await {
            Ok(captured) => Ok(captured?),
            Err(_) => Err(CaptureError::TimedOut(self.policy.capture_timeout).into()),
        }
    }
}

fn transition(state: &mut FlowState, next: FlowState) {
    debug!(from = %state, to = %next, "login flow transition");
    *state = next;
}
