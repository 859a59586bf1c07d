//! Localhost listener that receives the provider redirect carrying the authorization code.

use std::collections::HashMap;
use std::time::Duration;

use subtle::ConstantTimeEq;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};
use url::Url;

use super::CaptureError;

const SUCCESS_HTML: &str = "<html><body><h1>Authentication successful</h1><p>You may close this window.</p></body></html>";
const ERROR_HTML: &str =
    "<html><body><h1>Authentication failed</h1><p>You may close this window and retry.</p></body></html>";
const NOT_FOUND_HTML: &str = "<html><body><h1>Not Found</h1></body></html>";
const MAX_REQUEST_BYTES: usize = 8192;
/// Browsers open speculative connections that never send a request.
const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Query parameters of a provider redirect.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

/// A bound callback listener. Binding happens in [`CallbackListener::bind`], so a
/// redirect that arrives before [`CallbackListener::wait_for_code`] is polled is
/// queued in the accept backlog rather than refused.
#[derive(Debug)]
pub struct CallbackListener {
    path: String,
    listener_v4: TcpListener,
    listener_v6: Option<TcpListener>,
}

impl CallbackListener {
    /// Binds the port of `callback_url` on the IPv4 loopback, and on the IPv6
    /// loopback when available.
    pub async fn bind(callback_url: &Url) -> Result<Self, CaptureError> {
        let port = callback_url
            .port_or_known_default()
            .ok_or_else(|| CaptureError::Bind {
                addr: callback_url.to_string(),
                details: "callback URL has no port".to_string(),
            })?;

        let listener_v4 = TcpListener::bind(("127.0.0.1", port))
            .await
            .map_err(|e| CaptureError::Bind {
                addr: format!("127.0.0.1:{port}"),
                details: e.to_string(),
            })?;
        let listener_v6 = match TcpListener::bind(("::1", port)).await {
            Ok(listener) => Some(listener),
            Err(e) => {
                debug!(port, error = %e, "IPv6 loopback unavailable for callback listener");
                None
            }
        };

        Ok(Self {
            path: callback_url.path().to_string(),
            listener_v4,
            listener_v6,
        })
    }

    pub fn port(&self) -> Option<u16> {
        self.listener_v4.local_addr().ok().map(|addr| addr.port())
    }

    /// Serves connections until a redirect to the callback path arrives and returns
    /// its authorization code. Requests for other paths get a 404 and are skipped.
    pub async fn wait_for_code(self, expected_state: &str) -> Result<String, CaptureError> {
        loop {
            let (mut socket, peer) = self.accept().await?;

            let request = match tokio::time::timeout(READ_TIMEOUT, read_request(&mut socket)).await {
                Ok(Ok(request)) => request,
                Ok(Err(e)) => {
                    debug!(%peer, error = %e, "dropping unreadable callback connection");
                    continue;
                }
                Err(_) => {
                    debug!(%peer, "dropping idle callback connection");
                    continue;
                }
            };

            let Some(params) = match_callback(&request, &self.path) else {
                debug!(%peer, "ignoring request outside the callback path");
                respond(&mut socket, "404 Not Found", NOT_FOUND_HTML).await;
                continue;
            };

            let outcome = check_params(params, expected_state);
            match &outcome {
                Ok(_) => respond(&mut socket, "200 OK", SUCCESS_HTML).await,
                Err(e) => {
                    warn!(error = %e, "rejected OAuth callback");
                    respond(&mut socket, "400 Bad Request", ERROR_HTML).await;
                }
            }
            return outcome;
        }
    }

    async fn accept(&self) -> Result<(TcpStream, std::net::SocketAddr), CaptureError> {
        let accepted = match &self.listener_v6 {
            Some(v6) => {
                tokio::select! {
                    result = self.listener_v4.accept() => result,
                    result = v6.accept() => result,
                }
            }
            None => self.listener_v4.accept().await,
        };
        accepted.map_err(|e| CaptureError::Listener(format!("accept failed: {e}")))
    }
}

async fn read_request(socket: &mut TcpStream) -> std::io::Result<String> {
    let mut buffer = vec![0u8; MAX_REQUEST_BYTES];
    let size = socket.read(&mut buffer).await?;
    if size == 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "empty request",
        ));
    }
    Ok(String::from_utf8_lossy(&buffer[..size]).into_owned())
}

/// Returns the query parameters when the request is a `GET` for `callback_path`.
fn match_callback(request: &str, callback_path: &str) -> Option<CallbackParams> {
    let request_line = request.lines().next()?;
    let mut parts = request_line.split_whitespace();
    if parts.next()? != "GET" {
        return None;
    }
    let target = parts.next()?;

    // The request target is origin-form; resolve it against a dummy base to parse it.
    let url = Url::parse("http://localhost").ok()?.join(target).ok()?;
    if url.path() != callback_path {
        return None;
    }

    let mut query: HashMap<String, String> = url.query_pairs().into_owned().collect();
    Some(CallbackParams {
        code: query.remove("code"),
        state: query.remove("state"),
        error: query.remove("error"),
        error_description: query.remove("error_description"),
    })
}

fn check_params(params: CallbackParams, expected_state: &str) -> Result<String, CaptureError> {
    if let Some(error) = params.error {
        return Err(CaptureError::ProviderDenied {
            error,
            description: params.error_description,
        });
    }

    let state_matches = params
        .state
        .as_deref()
        .map(|state| bool::from(state.as_bytes().ct_eq(expected_state.as_bytes())))
        .unwrap_or(false);
    if !state_matches {
        return Err(CaptureError::StateMismatch);
    }

    match params.code {
        Some(code) if !code.is_empty() => Ok(code),
        _ => Err(CaptureError::MissingCode),
    }
}

async fn respond(socket: &mut TcpStream, status: &str, body: &str) {
    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len(),
    );
    let _ = socket.write_all(response.as_bytes()).await;
    let _ = socket.shutdown().await;
}
