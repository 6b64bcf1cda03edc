//! Nomon client: authenticated, read-only transport bound to one Nomad endpoint.
//!
//! Every request goes to `{endpoint}/v1/...` with `namespace` and `stale=true`
//! appended, so followers may serve reads.

#![forbid(unsafe_code)]

use std::path::Path;
use std::time::Instant;

use async_trait::async_trait;
use metrics::histogram;
use nomon_core::ClusterConfig;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Certificate, Identity, Method, Url};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

pub mod wire;

pub use wire::{DeploymentStub, JobListStub, JobScaleStatus, JobSummaryStub, TaskGroupScale, TaskGroupSummary};

pub const API_VERSION: &str = "v1";
pub const TOKEN_HEADER: &str = "X-Nomad-Token";

const MAX_ERROR_BODY: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("reading {}: {source}", .path.display())]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("tls setup: {0}")]
    Tls(#[source] reqwest::Error),
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{url} returned {status}: {message}")]
    Status { url: String, status: u16, message: String },
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl ClientError {
    /// Short label used for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientError::Config(_) => "config",
            ClientError::Io { .. } => "io",
            ClientError::Tls(_) => "tls",
            ClientError::Http(e) if e.is_timeout() => "timeout",
            ClientError::Http(e) if e.is_connect() => "connect",
            ClientError::Http(_) => "http",
            ClientError::Status { .. } => "status",
            ClientError::Decode { .. } => "decode",
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::Status { status, .. } => Some(*status),
            ClientError::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

/// Read-only view of the Nomad API the aggregator depends on.
#[async_trait]
pub trait NomadApi: Send + Sync {
    /// `GET /v1/jobs`
    async fn list_jobs(&self) -> Result<Vec<JobListStub>, ClientError>;

    /// `GET /v1/deployments`
    async fn list_deployments(&self) -> Result<Vec<DeploymentStub>, ClientError>;

    /// `GET /v1/job/{job_id}/scale`
    async fn job_scale(&self, job_id: &str) -> Result<JobScaleStatus, ClientError>;
}

/// HTTP client for a single cluster. Token, trust roots and client identity
/// are fixed at construction.
///
/// The pool keeps up to `scale_concurrency` idle connections per host so the
/// scale fan-out can reuse them between cycles. It does not cap open
/// connections: the number in flight is bounded by the caller, which is
/// `resolve_scale`'s limit plus the one list or deployments request.
#[derive(Debug, Clone)]
pub struct NomadClient {
    http: reqwest::Client,
    base: Url,
    namespace: String,
}

impl NomadClient {
    pub fn new(cfg: &ClusterConfig) -> Result<Self, ClientError> {
        let base = Url::parse(cfg.endpoint()).map_err(|e| ClientError::Config(format!("endpoint {:?}: {}", cfg.endpoint(), e)))?;
        if base.cannot_be_a_base() {
            return Err(ClientError::Config(format!("endpoint {:?} cannot carry a path", cfg.endpoint())));
        }

        let mut headers = HeaderMap::new();
        if let Some(token) = cfg.token() {
            let mut value = HeaderValue::from_str(token)
                .map_err(|_| ClientError::Config("token contains characters not allowed in a header".into()))?;
            value.set_sensitive(true);
            headers.insert(TOKEN_HEADER, value);
        }

        let mut builder = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(cfg.timeout())
            .pool_max_idle_per_host(cfg.scale_concurrency())
            .user_agent(concat!("nomon/", env!("CARGO_PKG_VERSION")));

        if let Some(ca) = cfg.ca_cert() {
            let pem = read_file(ca)?;
            let roots = Certificate::from_pem_bundle(&pem).map_err(ClientError::Tls)?;
            if roots.is_empty() {
                return Err(ClientError::Config(format!("no certificates found in {}", ca.display())));
            }
            debug!(path = %ca.display(), count = roots.len(), "nomad: using custom CA bundle");
            builder = builder.tls_built_in_root_certs(false);
            for root in roots {
                builder = builder.add_root_certificate(root);
            }
        }

        match cfg.client_identity() {
            Some((cert, key)) => {
                let mut pem = read_file(cert)?;
                pem.push(b'\n');
                pem.extend(read_file(key)?);
                builder = builder.identity(Identity::from_pem(&pem).map_err(ClientError::Tls)?);
            }
            None if cfg.has_partial_identity() => {
                warn!("client certificate and key must both be set; ignoring client identity");
            }
            None => {}
        }

        let http = builder.build().map_err(ClientError::Tls)?;
        info!(endpoint = %base, ns = %cfg.namespace(), "nomad: client ready");
        Ok(Self { http, base, namespace: cfg.namespace().to_string() })
    }

    /// Build `{endpoint}/v1/{segments...}?namespace=..&stale=true`. Segments are percent-encoded.
    pub fn url_for(&self, segments: &[&str]) -> Result<Url, ClientError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| ClientError::Config(format!("endpoint {} cannot carry a path", self.base)))?
            .pop_if_empty()
            .push(API_VERSION)
            .extend(segments);
        url.query_pairs_mut()
            .append_pair("namespace", &self.namespace)
            .append_pair("stale", "true");
        Ok(url)
    }

    /// Issue a request and return the JSON body.
    pub async fn request(&self, method: Method, segments: &[&str]) -> Result<serde_json::Value, ClientError> {
        self.send(method, segments).await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, segments: &[&str]) -> Result<T, ClientError> {
        self.send(Method::GET, segments).await
    }

    async fn send<T: DeserializeOwned>(&self, method: Method, segments: &[&str]) -> Result<T, ClientError> {
        let url = self.url_for(segments)?;
        let endpoint = segments.first().copied().unwrap_or("").to_string();
        let started = Instant::now();
        let response = self.http.request(method.clone(), url.clone()).send().await?;
        let status = response.status();
        let body = response.bytes().await?;
        let took_ms = started.elapsed().as_secs_f64() * 1000.0;
        histogram!("nomon_request_ms", "endpoint" => endpoint).record(took_ms);
        debug!(method = %method, url = %url, status = status.as_u16(), took_ms = %format!("{:.1}", took_ms), "nomad: request");

        if !status.is_success() {
            let mut message = String::from_utf8_lossy(&body).trim().to_string();
            if message.len() > MAX_ERROR_BODY {
                let cut = (0..=MAX_ERROR_BODY).rev().find(|i| message.is_char_boundary(*i)).unwrap_or(0);
                message.truncate(cut);
            }
            return Err(ClientError::Status { url: url.to_string(), status: status.as_u16(), message });
        }
        serde_json::from_slice(&body).map_err(|source| ClientError::Decode { url: url.to_string(), source })
    }
}

#[async_trait]
impl NomadApi for NomadClient {
    async fn list_jobs(&self) -> Result<Vec<JobListStub>, ClientError> {
        self.get_json(&["jobs"]).await
    }

    async fn list_deployments(&self) -> Result<Vec<DeploymentStub>, ClientError> {
        self.get_json(&["deployments"]).await
    }

    async fn job_scale(&self, job_id: &str) -> Result<JobScaleStatus, ClientError> {
        self.get_json(&["job", job_id, "scale"]).await
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>, ClientError> {
    std::fs::read(path).map_err(|source| ClientError::Io { path: path.to_path_buf(), source })
}
