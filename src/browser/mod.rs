//! # Browser Session Management
//!
//! Trait seam over the browser automation engine plus the per-request session
//! lifecycle. A [`SessionHandle`] owns exactly one automation session and one slot
//! of the session pool; it is released exactly once, either explicitly through
//! [`SessionHandle::release`] or, if the owning future is dropped first, by a guard
//! that schedules the release on the runtime.

pub mod chrome;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::{counter, gauge};
use scopeguard::ScopeGuard;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::config::BrowserSettings;

pub use chrome::ChromeLauncher;

/// Errors raised by the automation engine.
#[derive(Debug, Clone, Error)]
pub enum BrowserError {
    #[error("failed to launch browser: {0}")]
    Launch(String),
    #[error("navigation to {url} failed: {details}")]
    Navigation { url: String, details: String },
    #[error("element '{selector}' not found within {timeout_ms} ms")]
    ElementNotFound { selector: String, timeout_ms: u64 },
    #[error("interaction with element '{selector}' failed: {details}")]
    Interaction { selector: String, details: String },
    #[error("browser session error: {0}")]
    Session(String),
}

/// Outcome of a bounded wait for an element.
///
/// `TimedOut` is an ordinary answer ("the element did not appear"), not a failure.
#[derive(Debug)]
pub enum WaitOutcome {
    Found,
    TimedOut,
    Failed(BrowserError),
}

/// Launch options for one session.
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    pub headless: bool,
    pub sandbox_disabled: bool,
    pub shared_memory_usage_disabled: bool,
    pub verbose_logging_suppressed: bool,
    pub executable: Option<PathBuf>,
    pub launch_timeout: Duration,
    /// How long element lookups poll before reporting the element as missing.
    pub element_timeout: Duration,
}

impl LaunchOptions {
    /// Options for a headless, containerized deployment with a small `/dev/shm`.
    pub fn for_container(settings: &BrowserSettings) -> Self {
        Self {
            headless: true,
            sandbox_disabled: true,
            shared_memory_usage_disabled: true,
            verbose_logging_suppressed: true,
            executable: settings.chrome_executable.clone(),
            launch_timeout: settings.launch_timeout(),
            element_timeout: settings.element_timeout(),
        }
    }
}

/// One live automation session (a browser with a single page).
#[async_trait]
pub trait BrowserSession: Send {
    async fn navigate(&mut self, url: &str) -> Result<(), BrowserError>;

    /// Locates the element (polling up to the element timeout) and types `text` into it.
    async fn send_input(&mut self, selector: &str, text: &str) -> Result<(), BrowserError>;

    /// Locates the element (polling up to the element timeout) and clicks it.
    async fn click(&mut self, selector: &str) -> Result<(), BrowserError>;

    /// Waits up to `timeout` for an element matching `selector` to exist.
    async fn wait_for(&mut self, selector: &str, timeout: Duration) -> WaitOutcome;

    /// Terminates the browser. Called once per session.
    async fn quit(&mut self) -> Result<(), BrowserError>;
}

/// Starts automation sessions.
#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self, options: &LaunchOptions)
    -> Result<Box<dyn BrowserSession>, BrowserError>;
}

/// Hands out sessions, bounded by the configured pool size.
pub struct SessionManager {
    launcher: Arc<dyn BrowserLauncher>,
    options: LaunchOptions,
    permits: Arc<Semaphore>,
}

impl SessionManager {
    pub fn new(launcher: Arc<dyn BrowserLauncher>, options: LaunchOptions, max_sessions: usize) -> Self {
        Self {
            launcher,
            options,
            permits: Arc::new(Semaphore::new(max_sessions)),
        }
    }

    /// Number of sessions that could be acquired right now without waiting.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Acquires a pool slot and launches a session into it.
    pub async fn acquire(&self) -> Result<SessionHandle, BrowserError> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| BrowserError::Launch("session pool is closed".to_string()))?;

        debug!("launching browser session");
        let session = match self.launcher.launch(&self.options).await {
            Ok(session) => session,
            Err(err) => {
                counter!("browser_sessions_failed_total").increment(1);
                return Err(err);
            }
        };

        counter!("browser_sessions_acquired_total").increment(1);
        gauge!("browser_sessions_active").increment(1.0);
        info!("browser session acquired");

        Ok(SessionHandle {
            guard: scopeguard::guard(
                Checkout {
                    session,
                    _permit: permit,
                },
                release_detached,
            ),
        })
    }
}

struct Checkout {
    session: Box<dyn BrowserSession>,
    _permit: OwnedSemaphorePermit,
}

/// Exclusively owned automation session.
pub struct SessionHandle {
    guard: ScopeGuard<Checkout, fn(Checkout)>,
}

impl SessionHandle {
    pub fn session(&mut self) -> &mut dyn BrowserSession {
        self.guard.session.as_mut()
    }

    /// Terminates the session and returns its pool slot. Never fails; errors are logged.
    pub async fn release(self) {
        let mut checkout = ScopeGuard::into_inner(self.guard);
        quit_session(checkout.session.as_mut()).await;
    }
}

async fn quit_session(session: &mut dyn BrowserSession) {
    if let Err(err) = session.quit().await {
        warn!(error = %err, "browser session did not shut down cleanly");
    }
    gauge!("browser_sessions_active").decrement(1.0);
    info!("browser session released");
}

/// Drop path: the owning future went away before `release` ran.
fn release_detached(mut checkout: Checkout) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            warn!("browser session dropped without release; releasing in background");
            handle.spawn(async move {
                quit_session(checkout.session.as_mut()).await;
            });
        }
        Err(_) => {
            // No runtime left (process teardown); the engine's own drop kills the process.
            warn!("browser session dropped outside a runtime");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counters {
        launched: AtomicUsize,
        quit: AtomicUsize,
    }

    struct CountingSession(Arc<Counters>);

    #[async_trait]
    impl BrowserSession for CountingSession {
        async fn navigate(&mut self, _url: &str) -> Result<(), BrowserError> {
            Ok(())
        }
        async fn send_input(&mut self, _selector: &str, _text: &str) -> Result<(), BrowserError> {
            Ok(())
        }
        async fn click(&mut self, _selector: &str) -> Result<(), BrowserError> {
            Ok(())
        }
        async fn wait_for(&mut self, _selector: &str, _timeout: Duration) -> WaitOutcome {
            WaitOutcome::TimedOut
        }
        async fn quit(&mut self) -> Result<(), BrowserError> {
            self.0.quit.fetch_add(1, Ordering::SeqCst);
            Err(BrowserError::Session("already gone".to_string()))
        }
    }

    struct CountingLauncher {
        counters: Arc<Counters>,
        fail: bool,
    }

    #[async_trait]
    impl BrowserLauncher for CountingLauncher {
        async fn launch(
            &self,
            _options: &LaunchOptions,
        ) -> Result<Box<dyn BrowserSession>, BrowserError> {
            if self.fail {
                return Err(BrowserError::Launch("chrome binary not found".to_string()));
            }
            self.counters.launched.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(CountingSession(self.counters.clone())))
        }
    }

    fn manager(counters: Arc<Counters>, fail: bool, max: usize) -> SessionManager {
        SessionManager::new(
            Arc::new(CountingLauncher { counters, fail }),
            LaunchOptions::for_container(&BrowserSettings::default()),
            max,
        )
    }

    #[test]
    fn test_container_options_are_fixed() {
        let options = LaunchOptions::for_container(&BrowserSettings::default());
        assert!(options.headless);
        assert!(options.sandbox_disabled);
        assert!(options.shared_memory_usage_disabled);
        assert!(options.verbose_logging_suppressed);
        assert_eq!(options.element_timeout, Duration::from_millis(5_000));
    }

    #[tokio::test]
    async fn test_release_quits_once_and_frees_slot() {
        let counters = Arc::new(Counters::default());
        let manager = manager(counters.clone(), false, 1);

        let handle = manager.acquire().await.unwrap();
        assert_eq!(manager.available(), 0);

        // quit() reporting an error must not make release fail
        handle.release().await;

        assert_eq!(counters.quit.load(Ordering::SeqCst), 1);
        assert_eq!(manager.available(), 1);
    }

    #[tokio::test]
    async fn test_dropped_handle_is_released_in_background() {
        let counters = Arc::new(Counters::default());
        let manager = manager(counters.clone(), false, 1);

        let handle = manager.acquire().await.unwrap();
        drop(handle);

        for _ in 0..50 {
            if counters.quit.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(counters.quit.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_launch_failure_returns_slot() {
        let counters = Arc::new(Counters::default());
        let manager = manager(counters.clone(), true, 1);

        let err = manager.acquire().await.err().unwrap();
        assert!(matches!(err, BrowserError::Launch(_)));
        assert_eq!(manager.available(), 1);
        assert_eq!(counters.quit.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_pool_bounds_concurrent_sessions() {
        let counters = Arc::new(Counters::default());
        let manager = Arc::new(manager(counters.clone(), false, 1));

        let first = manager.acquire().await.unwrap();

        let waiting = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.acquire().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiting.is_finished());
        assert_eq!(counters.launched.load(Ordering::SeqCst), 1);

        first.release().await;
        let second = waiting.await.unwrap().unwrap();
        assert_eq!(counters.launched.load(Ordering::SeqCst), 2);
        second.release().await;
    }
}
