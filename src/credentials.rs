//! # Credential Resolution
//!
//! Resolves the username, password and login domain for one request from the
//! operator-configured overrides and the caller-supplied fields, then normalizes
//! and classifies the login domain.
//!
//! Operator values always win: a caller can never replace a configured credential
//! by sending a field with the same meaning.

use std::fmt;

use regex::Regex;
use thiserror::Error;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::config::CredentialOverrides;

/// Credential field a validation error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Username,
    Password,
    InstanceUrl,
}

impl Field {
    fn label(self) -> &'static str {
        match self {
            Field::Username => "Username",
            Field::Password => "Password",
            Field::InstanceUrl => "Instance URL",
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Field::Username => f.write_str("username"),
            Field::Password => f.write_str("password"),
            Field::InstanceUrl => f.write_str("instance URL"),
        }
    }
}

/// Input rejected before any browser or listener is touched.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// Neither the environment nor the request supplied the field.
    #[error("Missing {0}.")]
    Missing(Field),
    /// The selected value is empty (after trimming, where the field is trimmed).
    #[error("{} cannot be empty.", .0.label())]
    Empty(Field),
    #[error("Invalid instance URL.")]
    InvalidDomain { value: String },
}

impl ValidationError {
    /// True for both absent and empty fields.
    pub fn is_missing_field(&self) -> bool {
        matches!(self, ValidationError::Missing(_) | ValidationError::Empty(_))
    }
}

/// Fields as supplied by the caller, from a JSON body or a query string.
#[derive(Debug, Clone, Default)]
pub struct RequestFields {
    pub username: Option<String>,
    pub password: Option<String>,
    pub instance_url: Option<String>,
    pub domain: Option<String>,
}

/// A validated login URL: always `https://`, and either a canonical login host or
/// a my-domain host of the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedLoginUrl(String);

impl NormalizedLoginUrl {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Wraps a URL without classification. Only for tests that point the flow at a
    /// local mock server.
    #[cfg(test)]
    pub(crate) fn from_trusted(url: impl Into<String>) -> Self {
        Self(url.into())
    }
}

impl fmt::Display for NormalizedLoginUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Credentials for a single login flow. The password is wiped from memory on drop.
pub struct Credentials {
    username: String,
    password: Zeroizing<String>,
    login_url: NormalizedLoginUrl,
}

impl Credentials {
    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        self.password.as_str()
    }

    pub fn login_url(&self) -> &NormalizedLoginUrl {
        &self.login_url
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("login_url", &self.login_url)
            .finish()
    }
}

/// Allow-list of login hosts for one provider domain.
#[derive(Debug, Clone)]
pub struct DomainPolicy {
    canonical_hosts: [String; 2],
    my_domain: Regex,
    sandbox_my_domain: Regex,
}

impl DomainPolicy {
    /// Builds the policy for a provider base domain such as `salesforce.com`.
    pub fn new(provider_domain: &str) -> Result<Self, regex::Error> {
        let domain = provider_domain.trim().trim_matches('.');
        let escaped = regex::escape(domain);
        Ok(Self {
            canonical_hosts: [
                format!("https://test.{domain}"),
                format!("https://login.{domain}"),
            ],
            my_domain: Regex::new(&format!(r"^https://[A-Za-z0-9_-]+\.my\.{escaped}$"))?,
            sandbox_my_domain: Regex::new(&format!(r"^https://[A-Za-z0-9_-]+\.sandbox\.my\.{escaped}$"))?,
        })
    }

    /// Normalizes the scheme to `https://` and accepts the URL iff it is a canonical
    /// login host or matches either my-domain shape.
    pub fn sanitize_login_url(&self, raw: &str) -> Result<NormalizedLoginUrl, ValidationError> {
        let trimmed = raw.trim();
        let mut url = if let Some(rest) = trimmed.strip_prefix("http://") {
            format!("https://{rest}")
        } else if trimmed.starts_with("https://") {
            trimmed.to_string()
        } else {
            format!("https://{trimmed}")
        };
        if url.ends_with('/') {
            url.pop();
        }

        let is_standard_domain = self.canonical_hosts.iter().any(|host| *host == url);
        let is_my_domain = self.sandbox_my_domain.is_match(&url) || self.my_domain.is_match(&url);

        if is_standard_domain || is_my_domain {
            Ok(NormalizedLoginUrl(url))
        } else {
            Err(ValidationError::InvalidDomain {
                value: raw.to_string(),
            })
        }
    }
}

/// Which source a resolved field came from; only ever logged.
#[derive(Debug, Clone, Copy)]
enum Source {
    Environment,
    Request,
}

fn resolve<'a>(
    field: Field,
    candidates: &[(Option<&'a String>, Source)],
) -> Result<&'a str, ValidationError> {
    match candidates
        .iter()
        .find_map(|(value, source)| value.map(|v| (v.as_str(), *source)))
    {
        Some((value, source)) => {
            info!(field = %field, source = ?source, "resolved credential field");
            Ok(value)
        }
        None => {
            info!(field = %field, "credential field not found in environment or request");
            Err(ValidationError::Missing(field))
        }
    }
}

/// Resolves and validates credentials.
///
/// Per field the environment override is consulted first, then the request; the
/// first *present* value is selected even if it turns out to be empty.
pub fn validate(
    overrides: &CredentialOverrides,
    request: &RequestFields,
    policy: &DomainPolicy,
) -> Result<Credentials, ValidationError> {
    let username = resolve(
        Field::Username,
        &[
            (overrides.username.as_ref(), Source::Environment),
            (request.username.as_ref(), Source::Request),
        ],
    )?;
    let username = username.trim();
    if username.is_empty() {
        return Err(ValidationError::Empty(Field::Username));
    }

    let password = resolve(
        Field::Password,
        &[
            (overrides.password.as_ref(), Source::Environment),
            (request.password.as_ref(), Source::Request),
        ],
    )?;
    if password.is_empty() {
        return Err(ValidationError::Empty(Field::Password));
    }

    let instance_url = resolve(
        Field::InstanceUrl,
        &[
            (overrides.instance_url.as_ref(), Source::Environment),
            (overrides.domain.as_ref(), Source::Environment),
            (request.instance_url.as_ref(), Source::Request),
            (request.domain.as_ref(), Source::Request),
        ],
    )?;
    let instance_url = instance_url.trim();
    if instance_url.is_empty() {
        return Err(ValidationError::Empty(Field::InstanceUrl));
    }

    let login_url = policy.sanitize_login_url(instance_url).inspect_err(|_| {
        warn!(instance_url = %instance_url, "received invalid instance URL");
    })?;

    Ok(Credentials {
        username: username.to_string(),
        password: Zeroizing::new(password.to_string()),
        login_url,
    })
}
