//! Configuration loading for the sf-auto-oauth service.
//!
//! Loads layered `.env` files and the process environment, producing a typed
//! [`AppConfig`] that is built once at startup and threaded through the service.
//! Keys are unprefixed (`PORT`, `LOG_LEVEL`, `SF_USERNAME`, ...) to match the
//! deployment contract of the container this service ships in.

use std::{collections::BTreeMap, env, net::SocketAddr, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Every key the loader understands. Other process variables are ignored.
const KNOWN_KEYS: &[&str] = &[
    "PROFILE",
    "PORT",
    "BIND_ADDR",
    "LOG_LEVEL",
    "LOG_FORMAT",
    "SF_USERNAME",
    "SF_PASSWORD",
    "SF_INSTANCE_URL",
    "SF_DOMAIN",
    "SF_PROVIDER_DOMAIN",
    "SF_CLIENT_ID",
    "SF_CLIENT_SECRET",
    "SF_CALLBACK_URL",
    "CHROME_EXECUTABLE",
    "BROWSER_LAUNCH_TIMEOUT_MS",
    "ELEMENT_TIMEOUT_MS",
    "MAX_CONCURRENT_SESSIONS",
    "CHECK_LOGIN_ERROR",
    "ERROR_WAIT_MS",
    "APPROVAL_WAIT_MS",
    "CAPTURE_TIMEOUT_SECS",
    "REQUEST_TIMEOUT_SECS",
];

const MIN_WAIT_MS: u64 = 100;
const MAX_WAIT_MS: u64 = 60_000;
const MAX_CAPTURE_TIMEOUT_SECS: u64 = 600;
const MAX_SESSIONS: usize = 16;

/// Application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default)]
    pub credentials: CredentialOverrides,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub browser: BrowserSettings,
    #[serde(default)]
    pub flow: FlowSettings,
}

/// Operator-configured credential values. A field that is `Some` always wins
/// over the value a caller supplies in the request, even when it is empty.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CredentialOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
}

/// Identity provider and connected app settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Base domain of the provider, e.g. `salesforce.com`.
    pub domain: String,
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    /// Redirect URI registered on the connected app; the callback listener binds its port.
    pub callback_url: String,
}

/// Browser launch and element lookup settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chrome_executable: Option<PathBuf>,
    pub launch_timeout_ms: u64,
    pub element_timeout_ms: u64,
    /// Sessions beyond the first wait for the single callback slot with a browser
    /// already running.
    pub max_concurrent_sessions: usize,
}

/// Stage toggles and bounded waits of the login flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowSettings {
    pub check_login_error: bool,
    pub error_wait_ms: u64,
    pub approval_wait_ms: u64,
    pub capture_timeout_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            bind_addr: default_bind_addr(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            credentials: CredentialOverrides::default(),
            provider: ProviderConfig::default(),
            browser: BrowserSettings::default(),
            flow: FlowSettings::default(),
        }
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            domain: "salesforce.com".to_string(),
            client_id: "PlatformCLI".to_string(),
            client_secret: None,
            callback_url: "http://localhost:1717/OauthRedirect".to_string(),
        }
    }
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            chrome_executable: None,
            launch_timeout_ms: 20_000,
            element_timeout_ms: 5_000,
            max_concurrent_sessions: 1,
        }
    }
}

impl Default for FlowSettings {
    fn default() -> Self {
        Self {
            check_login_error: true,
            error_wait_ms: 4_000,
            approval_wait_ms: 4_000,
            capture_timeout_secs: 120,
            request_timeout_secs: 180,
        }
    }
}

impl FlowSettings {
    pub fn error_wait(&self) -> Duration {
        Duration::from_millis(self.error_wait_ms)
    }

    pub fn approval_wait(&self) -> Duration {
        Duration::from_millis(self.approval_wait_ms)
    }

    pub fn capture_timeout(&self) -> Duration {
        Duration::from_secs(self.capture_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Validate wait bounds and the capture/request deadline ordering.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("ERROR_WAIT_MS", self.error_wait_ms),
            ("APPROVAL_WAIT_MS", self.approval_wait_ms),
        ] {
            if !(MIN_WAIT_MS..=MAX_WAIT_MS).contains(&value) {
                return Err(ConfigError::InvalidWait {
                    field: field.to_string(),
                    value,
                });
            }
        }

        if self.capture_timeout_secs == 0 || self.capture_timeout_secs > MAX_CAPTURE_TIMEOUT_SECS {
            return Err(ConfigError::InvalidCaptureTimeout {
                value: self.capture_timeout_secs,
            });
        }

        if self.request_timeout_secs <= self.capture_timeout_secs {
            return Err(ConfigError::RequestTimeoutTooShort {
                request: self.request_timeout_secs,
                capture: self.capture_timeout_secs,
            });
        }

        Ok(())
    }
}

impl BrowserSettings {
    pub fn launch_timeout(&self) -> Duration {
        Duration::from_millis(self.launch_timeout_ms)
    }

    pub fn element_timeout(&self) -> Duration {
        Duration::from_millis(self.element_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_WAIT_MS..=MAX_WAIT_MS).contains(&self.element_timeout_ms) {
            return Err(ConfigError::InvalidWait {
                field: "ELEMENT_TIMEOUT_MS".to_string(),
                value: self.element_timeout_ms,
            });
        }
        if self.launch_timeout_ms < 1_000 {
            return Err(ConfigError::InvalidValue {
                key: "BROWSER_LAUNCH_TIMEOUT_MS".to_string(),
                value: self.launch_timeout_ms.to_string(),
            });
        }
        if self.max_concurrent_sessions == 0 || self.max_concurrent_sessions > MAX_SESSIONS {
            return Err(ConfigError::InvalidSessionLimit {
                value: self.max_concurrent_sessions,
            });
        }
        Ok(())
    }
}

impl ProviderConfig {
    /// Parses the callback URL, which must point at a loopback host with an explicit port.
    pub fn callback(&self) -> Result<Url, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidCallbackUrl {
            value: self.callback_url.clone(),
            reason: reason.to_string(),
        };

        let url = Url::parse(&self.callback_url).map_err(|e| invalid(&e.to_string()))?;
        if url.scheme() != "http" {
            return Err(invalid("scheme must be http"));
        }
        match url.host_str() {
            Some("localhost") | Some("127.0.0.1") => {}
            _ => return Err(invalid("host must be localhost or 127.0.0.1")),
        }
        if url.port().is_none() {
            return Err(invalid("an explicit port is required"));
        }
        Ok(url)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.domain.trim().is_empty() {
            return Err(ConfigError::MissingProviderDomain);
        }
        if self.client_id.trim().is_empty() {
            return Err(ConfigError::MissingClientId);
        }
        self.callback().map(|_| ())
    }
}

impl AppConfig {
    /// Returns the configured bind address as a socket address.
    pub fn socket_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        self.bind_addr.parse()
    }

    /// Returns a redacted JSON representation (secrets are redacted).
    pub fn redacted_json(&self) -> serde_json::Result<String> {
        let mut config = self.clone();
        if config.credentials.password.is_some() {
            config.credentials.password = Some("[REDACTED]".to_string());
        }
        if config.provider.client_secret.is_some() {
            config.provider.client_secret = Some("[REDACTED]".to_string());
        }
        serde_json::to_string_pretty(&config)
    }

    /// Validates the configuration, returning the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !matches!(self.log_format.as_str(), "json" | "pretty") {
            return Err(ConfigError::InvalidLogFormat {
                value: self.log_format.clone(),
            });
        }
        self.provider.validate()?;
        self.browser.validate()?;
        self.flow.validate()?;
        Ok(())
    }
}

fn default_profile() -> String {
    "local".to_string()
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load environment file {path}: {source}")]
    EnvFile {
        path: PathBuf,
        source: dotenvy::Error,
    },
    #[error("invalid bind address '{value}': {source}")]
    InvalidBindAddr {
        value: String,
        source: std::net::AddrParseError,
    },
    #[error("invalid value '{value}' for {key}")]
    InvalidValue { key: String, value: String },
    #[error("log format must be 'json' or 'pretty', got '{value}'")]
    InvalidLogFormat { value: String },
    #[error("{field} must be between 100 and 60000 milliseconds, got {value}")]
    InvalidWait { field: String, value: u64 },
    #[error("capture timeout must be between 1 and 600 seconds, got {value}")]
    InvalidCaptureTimeout { value: u64 },
    #[error(
        "request timeout ({request}s) must be longer than the capture timeout ({capture}s)"
    )]
    RequestTimeoutTooShort { request: u64, capture: u64 },
    #[error("max concurrent sessions must be between 1 and 16, got {value}")]
    InvalidSessionLimit { value: usize },
    #[error("invalid callback URL '{value}': {reason}")]
    InvalidCallbackUrl { value: String, reason: String },
    #[error("provider domain is empty; set SF_PROVIDER_DOMAIN")]
    MissingProviderDomain,
    #[error("connected app client id is empty; set SF_CLIENT_ID")]
    MissingClientId,
}

/// Loads configuration using layered `.env` files and the process environment.
pub struct ConfigLoader {
    base_dir: PathBuf,
}

impl ConfigLoader {
    /// Creates a new loader rooted at the current working directory.
    pub fn new() -> Self {
        Self {
            base_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// Creates a loader rooted at the provided directory (useful for tests).
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Loads, validates and returns the configuration.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let (mut layered, profile_hint) = self.collect_layered_env()?;

        // Overlay process environment last so it wins.
        for (key, value) in env::vars() {
            if KNOWN_KEYS.contains(&key.as_str()) {
                layered.insert(key, value);
            }
        }

        let profile = layered
            .remove("PROFILE")
            .filter(|v| !v.is_empty())
            .unwrap_or(profile_hint);

        let bind_addr = match layered.remove("BIND_ADDR").filter(|v| !v.is_empty()) {
            Some(addr) => addr,
            None => match layered.remove("PORT").filter(|v| !v.trim().is_empty()) {
                Some(port) => {
                    let port: u16 = parse_value("PORT", &port)?;
                    format!("0.0.0.0:{port}")
                }
                None => default_bind_addr(),
            },
        };

        let log_level = layered
            .remove("LOG_LEVEL")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_log_level);
        let log_format = layered
            .remove("LOG_FORMAT")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_log_format);

        // Presence, not emptiness, decides whether an override applies.
        let credentials = CredentialOverrides {
            username: layered.remove("SF_USERNAME"),
            password: layered.remove("SF_PASSWORD"),
            instance_url: layered.remove("SF_INSTANCE_URL"),
            domain: layered.remove("SF_DOMAIN"),
        };

        let provider_defaults = ProviderConfig::default();
        let provider = ProviderConfig {
            domain: non_empty(layered.remove("SF_PROVIDER_DOMAIN"))
                .unwrap_or(provider_defaults.domain),
            client_id: non_empty(layered.remove("SF_CLIENT_ID"))
                .unwrap_or(provider_defaults.client_id),
            client_secret: non_empty(layered.remove("SF_CLIENT_SECRET")),
            callback_url: non_empty(layered.remove("SF_CALLBACK_URL"))
                .unwrap_or(provider_defaults.callback_url),
        };

        let browser_defaults = BrowserSettings::default();
        let browser = BrowserSettings {
            chrome_executable: non_empty(layered.remove("CHROME_EXECUTABLE")).map(PathBuf::from),
            launch_timeout_ms: parse_or(
                &mut layered,
                "BROWSER_LAUNCH_TIMEOUT_MS",
                browser_defaults.launch_timeout_ms,
            )?,
            element_timeout_ms: parse_or(
                &mut layered,
                "ELEMENT_TIMEOUT_MS",
                browser_defaults.element_timeout_ms,
            )?,
            max_concurrent_sessions: parse_or(
                &mut layered,
                "MAX_CONCURRENT_SESSIONS",
                browser_defaults.max_concurrent_sessions,
            )?,
        };

        let flow_defaults = FlowSettings::default();
        let flow = FlowSettings {
            check_login_error: match non_empty(layered.remove("CHECK_LOGIN_ERROR")) {
                Some(raw) => parse_bool("CHECK_LOGIN_ERROR", &raw)?,
                None => flow_defaults.check_login_error,
            },
            error_wait_ms: parse_or(&mut layered, "ERROR_WAIT_MS", flow_defaults.error_wait_ms)?,
            approval_wait_ms: parse_or(
                &mut layered,
                "APPROVAL_WAIT_MS",
                flow_defaults.approval_wait_ms,
            )?,
            capture_timeout_secs: parse_or(
                &mut layered,
                "CAPTURE_TIMEOUT_SECS",
                flow_defaults.capture_timeout_secs,
            )?,
            request_timeout_secs: parse_or(
                &mut layered,
                "REQUEST_TIMEOUT_SECS",
                flow_defaults.request_timeout_secs,
            )?,
        };

        let config = AppConfig {
            profile,
            bind_addr,
            log_level,
            log_format,
            credentials,
            provider,
            browser,
            flow,
        };

        config.validate()?;

        match config.socket_addr() {
            Ok(_) => Ok(config),
            Err(source) => Err(ConfigError::InvalidBindAddr {
                value: config.bind_addr.clone(),
                source,
            }),
        }
    }

    fn collect_layered_env(&self) -> Result<(BTreeMap<String, String>, String), ConfigError> {
        let mut values = BTreeMap::new();

        self.merge_dotenv(self.base_dir.join(".env"), &mut values)?;
        self.merge_dotenv(self.base_dir.join(".env.local"), &mut values)?;

        let profile = env::var("PROFILE")
            .ok()
            .filter(|v| !v.is_empty())
            .or_else(|| values.get("PROFILE").cloned())
            .unwrap_or_else(default_profile);

        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}", &profile)),
            &mut values,
        )?;
        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}.local", &profile)),
            &mut values,
        )?;

        Ok((values, profile))
    }

    fn merge_dotenv(
        &self,
        path: PathBuf,
        values: &mut BTreeMap<String, String>,
    ) -> Result<(), ConfigError> {
        match dotenvy::from_path_iter(&path) {
            Ok(iter) => {
                for item in iter {
                    let (key, value) = item.map_err(|source| ConfigError::EnvFile {
                        path: path.clone(),
                        source,
                    })?;
                    if KNOWN_KEYS.contains(&key.as_str()) {
                        values.insert(key, value);
                    }
                }
                Ok(())
            }
            Err(dotenvy::Error::Io(ref io_err))
                if io_err.kind() == std::io::ErrorKind::NotFound =>
            {
                Ok(())
            }
            Err(err) => Err(ConfigError::EnvFile { path, source: err }),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.and_then(|val| {
        let trimmed = val.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn parse_value<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: raw.to_string(),
    })
}

fn parse_or<T: std::str::FromStr>(
    layered: &mut BTreeMap<String, String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError> {
    match non_empty(layered.remove(key)) {
        Some(raw) => parse_value(key, &raw),
        None => Ok(default),
    }
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: raw.to_string(),
        }),
    }
}
