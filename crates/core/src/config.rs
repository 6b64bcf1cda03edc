//! Cluster connection settings, read once from `NOMAD_*` style variables.

#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_NAMESPACE: &str = "default";
pub const DEFAULT_SCALE_CONCURRENCY: usize = 32;
pub const DEFAULT_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {var}: {value:?}")]
    Invalid { var: &'static str, value: String },
}

/// Connection settings for one cluster endpoint. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterConfig {
    endpoint: String,
    namespace: String,
    token: Option<String>,
    ca_cert: Option<PathBuf>,
    client_cert: Option<PathBuf>,
    client_key: Option<PathBuf>,
    timeout: Duration,
    scale_concurrency: usize,
}

impl ClusterConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into();
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            token: None,
            ca_cert: None,
            client_cert: None,
            client_key: None,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            scale_concurrency: DEFAULT_SCALE_CONCURRENCY,
        }
    }

    /// Read settings from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through `lookup`; empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let endpoint = get("NOMAD_ADDR").ok_or(ConfigError::Missing("NOMAD_ADDR"))?;
        let mut cfg = Self::new(endpoint);
        if let Some(ns) = get("NOMAD_NAMESPACE") {
            cfg.namespace = ns;
        }
        cfg.token = get("NOMAD_TOKEN");
        cfg.ca_cert = get("NOMAD_CACERT").map(PathBuf::from);
        cfg.client_cert = get("NOMAD_CLIENT_CERT").map(PathBuf::from);
        cfg.client_key = get("NOMAD_CLIENT_KEY").map(PathBuf::from);
        if let Some(raw) = get("NOMON_HTTP_TIMEOUT_SECS") {
            let secs = raw
                .parse::<u64>()
                .ok()
                .filter(|s| *s > 0)
                .ok_or(ConfigError::Invalid { var: "NOMON_HTTP_TIMEOUT_SECS", value: raw.clone() })?;
            cfg.timeout = Duration::from_secs(secs);
        }
        if let Some(raw) = get("NOMON_SCALE_CONCURRENCY") {
            let n = raw
                .parse::<usize>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or(ConfigError::Invalid { var: "NOMON_SCALE_CONCURRENCY", value: raw.clone() })?;
            cfg.scale_concurrency = n;
        }
        Ok(cfg)
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_ca_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_cert = Some(path.into());
        self
    }

    pub fn with_client_identity(mut self, cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        self.client_cert = Some(cert.into());
        self.client_key = Some(key.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_scale_concurrency(mut self, n: usize) -> Self {
        self.scale_concurrency = n.max(1);
        self
    }

    pub fn endpoint(&self) -> &str { &self.endpoint }
    pub fn namespace(&self) -> &str { &self.namespace }
    pub fn token(&self) -> Option<&str> { self.token.as_deref() }
    pub fn ca_cert(&self) -> Option<&Path> { self.ca_cert.as_deref() }
    pub fn timeout(&self) -> Duration { self.timeout }
    pub fn scale_concurrency(&self) -> usize { self.scale_concurrency }

    /// Client certificate and key, only when both are configured.
    pub fn client_identity(&self) -> Option<(&Path, &Path)> {
        match (&self.client_cert, &self.client_key) {
            (Some(cert), Some(key)) => Some((cert.as_path(), key.as_path())),
            _ => None,
        }
    }

    /// True when exactly one half of the client identity was given.
    pub fn has_partial_identity(&self) -> bool {
        self.client_cert.is_some() != self.client_key.is_some()
    }
}
