//! # Salesforce Auto OAuth Library
//!
//! Automates the Salesforce login form in a headless browser, captures the OAuth
//! redirect on a local listener and exchanges the code for an org authorization.

pub mod browser;
pub mod config;
pub mod credentials;
pub mod error;
pub mod flow;
pub mod handlers;
pub mod models;
pub mod oauth;
pub mod server;
pub mod telemetry;

#[cfg(test)]
pub(crate) mod test_support;
