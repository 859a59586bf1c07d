//! Chrome DevTools Protocol implementation of the browser seam.

use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::element::Element;
use chromiumoxide::error::CdpError;
use chromiumoxide::page::Page;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info};

use super::{BrowserError, BrowserLauncher, BrowserSession, LaunchOptions, WaitOutcome};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Launches a local Chrome/Chromium per session.
#[derive(Debug, Default, Clone)]
pub struct ChromeLauncher;

impl ChromeLauncher {
    pub fn new() -> Self {
        Self
    }

    fn config(options: &LaunchOptions) -> Result<BrowserConfig, BrowserError> {
        let mut builder = BrowserConfig::builder().launch_timeout(options.launch_timeout);
        if !options.headless {
            builder = builder.with_head();
        }
        if options.sandbox_disabled {
            builder = builder.no_sandbox();
        }
        if options.shared_memory_usage_disabled {
            builder = builder.arg("--disable-dev-shm-usage");
        }
        if options.verbose_logging_suppressed {
            builder = builder.arg("--disable-logging").arg("--log-level=3");
        }
        if let Some(path) = &options.executable {
            builder = builder.chrome_executable(path);
        }
        builder.build().map_err(BrowserError::Launch)
    }
}

#[async_trait]
impl BrowserLauncher for ChromeLauncher {
    async fn launch(
        &self,
        options: &LaunchOptions,
    ) -> Result<Box<dyn BrowserSession>, BrowserError> {
        let config = Self::config(options)?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| BrowserError::Launch(e.to_string()))?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!(error = %e, "CDP handler stopped");
                    break;
                }
            }
        });

        let page = match browser.new_page("about:blank").await {
            Ok(page) => page,
            Err(e) => {
                let mut session = ChromeSession {
                    browser,
                    page: None,
                    handler_task,
                    element_timeout: options.element_timeout,
                };
                let _ = session.quit().await;
                return Err(BrowserError::Launch(format!("failed to open page: {e}")));
            }
        };

        info!("chrome session started");
        Ok(Box::new(ChromeSession {
            browser,
            page: Some(page),
            handler_task,
            element_timeout: options.element_timeout,
        }))
    }
}

/// One Chrome process with a single page.
pub struct ChromeSession {
    browser: Browser,
    page: Option<Page>,
    handler_task: JoinHandle<()>,
    element_timeout: Duration,
}

impl ChromeSession {
    fn page(&self) -> Result<&Page, BrowserError> {
        self.page
            .as_ref()
            .ok_or_else(|| BrowserError::Session("session has been closed".to_string()))
    }

    /// Polls for the element until it exists or the element timeout expires.
    async fn locate(&self, selector: &str) -> Result<Element, BrowserError> {
        let page = self.page()?;
        let deadline = Instant::now() + self.element_timeout;
        loop {
            match page.find_element(selector).await {
                Ok(element) => return Ok(element),
                Err(e) if connection_lost(&e) => {
                    return Err(BrowserError::Session(e.to_string()));
                }
                Err(_) if Instant::now() >= deadline => {
                    return Err(BrowserError::ElementNotFound {
                        selector: selector.to_string(),
                        timeout_ms: self.element_timeout.as_millis() as u64,
                    });
                }
                Err(_) => tokio::time::sleep(POLL_INTERVAL).await,
            }
        }
    }

    async fn exists(page: &Page, selector: &str) -> Result<bool, CdpError> {
        let quoted = serde_json::to_string(selector)?;
        let result = page
            .evaluate(format!("document.querySelector({quoted}) !== null"))
            .await?;
        Ok(result.into_value::<bool>().unwrap_or(false))
    }
}

/// Errors after which the DevTools connection cannot be used again.
fn connection_lost(err: &CdpError) -> bool {
    matches!(
        err,
        CdpError::Ws(_) | CdpError::Io(_) | CdpError::ChannelSendError(_) | CdpError::NoResponse
    )
}

#[async_trait]
impl BrowserSession for ChromeSession {
    async fn navigate(&mut self, url: &str) -> Result<(), BrowserError> {
        let page = self.page()?;
        page.goto(url)
            .await
            .map_err(|e| BrowserError::Navigation {
                url: url.to_string(),
                details: e.to_string(),
            })?;
        debug!(url, "navigated");
        Ok(())
    }

    async fn send_input(&mut self, selector: &str, text: &str) -> Result<(), BrowserError> {
        let element = self.locate(selector).await?;
        element
            .click()
            .await
            .map_err(|e| interaction(selector, e))?;
        element
            .type_str(text)
            .await
            .map_err(|e| interaction(selector, e))?;
        Ok(())
    }

    async fn click(&mut self, selector: &str) -> Result<(), BrowserError> {
        let element = self.locate(selector).await?;
        element
            .click()
            .await
            .map_err(|e| interaction(selector, e))?;
        Ok(())
    }

    async fn wait_for(&mut self, selector: &str, timeout: Duration) -> WaitOutcome {
        let page = match self.page() {
            Ok(page) => page,
            Err(e) => return WaitOutcome::Failed(e),
        };
        let deadline = Instant::now() + timeout;
        loop {
            match Self::exists(page, selector).await {
                Ok(true) => return WaitOutcome::Found,
                Ok(false) => {}
                Err(e) if connection_lost(&e) => {
                    return WaitOutcome::Failed(BrowserError::Session(e.to_string()));
                }
                // Evaluation can fail transiently while the page is navigating.
                Err(e) => debug!(selector, error = %e, "presence check failed; retrying"),
            }
            if Instant::now() >= deadline {
                return WaitOutcome::TimedOut;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn quit(&mut self) -> Result<(), BrowserError> {
        self.page = None;
        let closed = self.browser.close().await;
        let waited = self.browser.wait().await;
        self.handler_task.abort();

        if let Err(e) = &waited {
            error!(error = %e, "failed to reap chrome process");
        }
        closed
            .map(|_| ())
            .map_err(|e| BrowserError::Session(format!("failed to close browser: {e}")))
    }
}

fn interaction(selector: &str, err: CdpError) -> BrowserError {
    BrowserError::Interaction {
        selector: selector.to_string(),
        details: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrowserSettings;

    #[test]
    fn test_config_builds_with_container_flags() {
        let options = LaunchOptions::for_container(&BrowserSettings {
            chrome_executable: Some("/usr/bin/chromium".into()),
            ..BrowserSettings::default()
        });
        assert!(ChromeLauncher::config(&options).is_ok());
    }

    #[test]
    fn test_connection_loss_classification() {
        assert!(connection_lost(&CdpError::NoResponse));
        assert!(!connection_lost(&CdpError::NotFound));
    }
}
