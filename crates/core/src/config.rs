//! Configuration management for TrustClient.
//!
//! Configuration comes from a TOML file, from `TRUSTCLIENT_*` environment
//! variables, or both (environment wins). Every loaded configuration goes
//! through [`ClientConfig::validate`] before it is handed out.

use serde::{Deserialize, Serialize};
#[cfg(feature = "toml")]
use std::path::Path;
use tracing::debug;
use url::Url;

use crate::error::{CoreError, Result};

/// Prefix of every environment variable read by [`ClientConfig::apply_env`].
pub const ENV_PREFIX: &str = "TRUSTCLIENT_";

pub const DEFAULT_CONTEXT: &str = "default";
pub const DEFAULT_KEY_TAG_PREFIX: &str = "tcl";
pub const DEFAULT_USER_AGENT: &str = "TrustClient/0.0.1";

/// Relative endpoint paths of the registration service.
pub const NONCE_PATH: &str = "/reg/nonce";
pub const REGISTRATIONS_PATH: &str = "/reg/registrations";
pub const ISSUE_CERT_PATH: &str = "/ca/issue-cert";
pub const ECHO_PATH: &str = "/echo";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Base URL of the registration service
    pub base_url: String,
    /// Identity context; every key tag is scoped by it
    #[serde(default = "default_context")]
    pub context: String,
    /// Prefix of key-store tags and settings keys
    #[serde(default = "default_key_tag_prefix")]
    pub key_tag_prefix: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Device metadata sent in the registration payload
    #[serde(default = "default_device_name")]
    pub device_name: String,
    /// Common name placed in the mTLS certificate signing request
    #[serde(default = "default_mtls_common_name")]
    pub mtls_common_name: String,
    /// Send a CSR for the mTLS key along with the registration
    #[serde(default = "default_true")]
    pub include_csr_in_registration: bool,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_context() -> String {
    DEFAULT_CONTEXT.to_string()
}

fn default_key_tag_prefix() -> String {
    DEFAULT_KEY_TAG_PREFIX.to_string()
}

fn default_user_agent() -> String {
    DEFAULT_USER_AGENT.to_string()
}

fn default_device_name() -> String {
    "trust-client".to_string()
}

fn default_mtls_common_name() -> String {
    "Trust Client MTLS".to_string()
}

fn default_true() -> bool {
    true
}

fn default_request_timeout_secs() -> u64 {
    30
}

/// Resolved endpoint URLs of the registration service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub base: Url,
    pub nonce: Url,
    pub registrations: Url,
    pub issue_cert: Url,
    pub echo: Url,
}

impl Endpoints {
    pub fn new(base: Url) -> Result<Self> {
        let join = |path: &str| {
            base.join(path)
                .map_err(|e| CoreError::Config(format!("cannot resolve {path}: {e}")))
        };
        Ok(Self {
            nonce: join(NONCE_PATH)?,
            registrations: join(REGISTRATIONS_PATH)?,
            issue_cert: join(ISSUE_CERT_PATH)?,
            echo: join(ECHO_PATH)?,
            base,
        })
    }
}

impl ClientConfig {
    /// Configuration with defaults for everything but the base URL.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            context: default_context(),
            key_tag_prefix: default_key_tag_prefix(),
            user_agent: default_user_agent(),
            device_name: default_device_name(),
            mtls_common_name: default_mtls_common_name(),
            include_csr_in_registration: default_true(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }

    #[cfg(feature = "toml")]
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(|e| CoreError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    #[cfg(feature = "toml")]
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config = Self::from_toml_str(&content)?;
        debug!(path = %path.as_ref().display(), "Loaded configuration file");
        Ok(config)
    }

    /// Build a configuration purely from the environment.
    ///
    /// `TRUSTCLIENT_BASE_URL` is required.
    pub fn from_env() -> Result<Self> {
        let base_url = std::env::var(format!("{ENV_PREFIX}BASE_URL"))
            .map_err(|_| CoreError::Config(format!("{ENV_PREFIX}BASE_URL is not set")))?;
        let mut config = Self::new(base_url);
        config.apply_env()?;
        Ok(config)
    }

    /// Override fields from `TRUSTCLIENT_*` variables, then re-validate.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_vars(|name| {
            let variable = format!("{ENV_PREFIX}{name}");
            let value = std::env::var(&variable).ok();
            if value.is_some() {
                debug!(%variable, "Applying environment override");
            }
            value
        })
    }

    fn apply_vars<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("BASE_URL") {
            self.base_url = v;
        }
        if let Some(v) = lookup("CONTEXT") {
            self.context = v;
        }
        if let Some(v) = lookup("KEY_TAG_PREFIX") {
            self.key_tag_prefix = v;
        }
        if let Some(v) = lookup("USER_AGENT") {
            self.user_agent = v;
        }
        if let Some(v) = lookup("DEVICE_NAME") {
            self.device_name = v;
        }
        if let Some(v) = lookup("MTLS_COMMON_NAME") {
            self.mtls_common_name = v;
        }
        if let Some(v) = lookup("INCLUDE_CSR_IN_REGISTRATION") {
            self.include_csr_in_registration = v
                .parse()
                .map_err(|_| CoreError::Config(format!("invalid boolean: {v}")))?;
        }
        if let Some(v) = lookup("REQUEST_TIMEOUT_SECS") {
            self.request_timeout_secs = v
                .parse()
                .map_err(|_| CoreError::Config(format!("invalid timeout: {v}")))?;
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<()> {
        let url = self.parsed_base_url()?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(CoreError::Config(format!(
                "base_url must be http or https, got {}",
                url.scheme()
            )));
        }
        for (name, value) in [("context", &self.context), ("key_tag_prefix", &self.key_tag_prefix)] {
            if value.is_empty() {
                return Err(CoreError::Config(format!("{name} must not be empty")));
            }
            if value.contains(':') {
                return Err(CoreError::Config(format!("{name} must not contain ':'")));
            }
        }
        if self.request_timeout_secs == 0 {
            return Err(CoreError::Config("request_timeout_secs must be > 0".to_string()));
        }
        Ok(())
    }

    pub fn parsed_base_url(&self) -> Result<Url> {
        Url::parse(&self.base_url)
            .map_err(|e| CoreError::Config(format!("invalid base_url {}: {e}", self.base_url)))
    }

    pub fn endpoints(&self) -> Result<Endpoints> {
        Endpoints::new(self.parsed_base_url()?)
    }

    pub fn request_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.request_timeout_secs)
    }
}
