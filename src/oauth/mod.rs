//! # OAuth Capture
//!
//! Arms a local callback listener, builds the provider authorization URL and exposes
//! the pending capture of the token fields that arrive once the provider redirects
//! the automated browser back to the callback address.

pub mod callback;
pub mod salesforce;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::task::JoinHandle;
use url::Url;
use zeroize::Zeroizing;

use crate::credentials::NormalizedLoginUrl;

pub use salesforce::SalesforceCoordinator;

/// Errors while arming the listener, receiving the callback or exchanging the code.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to bind callback listener on {addr}: {details}")]
    Bind { addr: String, details: String },
    #[error("capture coordinator setup failed: {0}")]
    Setup(String),
    #[error("callback slot is no longer available")]
    SlotClosed,
    #[error("invalid authorization URL: {0}")]
    AuthorizationUrl(String),
    #[error("provider returned an error on callback: {error}")]
    ProviderDenied {
        error: String,
        description: Option<String>,
    },
    #[error("callback state does not match the authorization request")]
    StateMismatch,
    #[error("callback did not carry an authorization code")]
    MissingCode,
    #[error("callback listener failed: {0}")]
    Listener(String),
    #[error("token request failed: {0}")]
    Http(String),
    #[error("token endpoint returned status {status}")]
    TokenEndpoint { status: u16 },
    #[error("token response did not include a refresh token")]
    MissingRefreshToken,
    #[error("unexpected identity URL: {0}")]
    IdentityUrl(String),
    #[error("callback listener closed before tokens were captured")]
    ListenerClosed,
    #[error("no callback received within {0:?}")]
    TimedOut(Duration),
}

/// Token fields captured at the end of a successful flow.
#[derive(Clone)]
pub struct CapturedFields {
    pub org_id: String,
    pub user_id: String,
    pub instance_url: String,
    pub access_token: Zeroizing<String>,
    pub refresh_token: Zeroizing<String>,
    /// `force://` URL usable by the provider's CLI tooling.
    pub encoded_auth_url: Zeroizing<String>,
}

impl fmt::Debug for CapturedFields {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapturedFields")
            .field("org_id", &self.org_id)
            .field("user_id", &self.user_id)
            .field("instance_url", &self.instance_url)
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .field("encoded_auth_url", &"[REDACTED]")
            .finish()
    }
}

/// An armed capture: the listener is bound and running when this value exists.
///
/// Dropping the session aborts the listener task, which closes the socket.
pub struct AuthorizationSession {
    authorization_url: Url,
    listener: JoinHandle<Result<CapturedFields, CaptureError>>,
}

impl AuthorizationSession {
    pub fn new(
        authorization_url: Url,
        listener: JoinHandle<Result<CapturedFields, CaptureError>>,
    ) -> Self {
        Self {
            authorization_url,
            listener,
        }
    }

    pub fn authorization_url(&self) -> &Url {
        &self.authorization_url
    }

    /// Resolves once the callback arrived and the code exchange finished.
    ///
    /// Cancel safe: dropping the returned future leaves the listener running until
    /// the session itself is dropped.
    pub async fn captured(&mut self) -> Result<CapturedFields, CaptureError> {
        match (&mut self.listener).await {
            Ok(result) => result,
            Err(_) => Err(CaptureError::ListenerClosed),
        }
    }
}

impl Drop for AuthorizationSession {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

/// Arms captures against the provider.
#[async_trait]
pub trait CaptureCoordinator: Send + Sync {
    /// Binds the callback listener and returns once it is accepting connections.
    async fn begin(&self, login_url: &NormalizedLoginUrl)
    -> Result<AuthorizationSession, CaptureError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields() -> CapturedFields {
        CapturedFields {
            org_id: "00D000000000001".to_string(),
            user_id: "005000000000001".to_string(),
            instance_url: "https://acme.my.salesforce.com".to_string(),
            access_token: Zeroizing::new("00D!secret-access".to_string()),
            refresh_token: Zeroizing::new("5Aep-secret-refresh".to_string()),
            encoded_auth_url: Zeroizing::new("force://PlatformCLI::5Aep@acme".to_string()),
        }
    }

    #[test]
    fn test_debug_hides_tokens() {
        let rendered = format!("{:?}", fields());
        assert!(rendered.contains("00D000000000001"));
        assert!(!rendered.contains("secret"));
        assert!(!rendered.contains("force://"));
    }

    #[tokio::test]
    async fn test_captured_resolves_listener_result() {
        let url = Url::parse("https://login.salesforce.com/services/oauth2/authorize").unwrap();
        let mut session = AuthorizationSession::new(url, tokio::spawn(async { Ok(fields()) }));
        let captured = session.captured().await.unwrap();
        assert_eq!(captured.org_id, "00D000000000001");
    }

    #[tokio::test]
    async fn test_drop_aborts_listener() {
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let listener = tokio::spawn(async move {
            let _tx = tx;
            std::future::pending::<Result<CapturedFields, CaptureError>>().await
        });
        let url = Url::parse("https://login.salesforce.com/services/oauth2/authorize").unwrap();
        drop(AuthorizationSession::new(url, listener));

        // The sender is dropped when the aborted task is torn down.
        assert!(rx.await.is_err());
    }
}
