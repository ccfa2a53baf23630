//! Docker Registry HTTP API v2 client.
//!
//! Speaks the two operations the pipeline needs: list tags
//! (`GET /v2/<name>/tags/list`) and fetch a manifest digest
//! (`HEAD /v2/<name>/manifests/<tag>`, reading `Docker-Content-Digest`,
//! with a `GET` + SHA-256-over-body fallback for registries that omit the
//! header on `HEAD`). Handles the standard bearer-token challenge flow,
//! applies a bounded request timeout, retries transient failures with
//! exponential backoff, and enforces a per-host concurrency limit.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, USER_AGENT, WWW_AUTHENTICATE};
use reqwest::StatusCode;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, instrument, warn};

use crate::config::RegistryConfig;
use crate::errors::RegistryError;
use crate::reference::split_registry;

/// Accepted manifest media types; covers Docker schema 2 and OCI, single
/// and multi-arch.
const MANIFEST_ACCEPT: &str = "application/vnd.docker.distribution.manifest.v2+json, \
     application/vnd.docker.distribution.manifest.list.v2+json, \
     application/vnd.oci.image.manifest.v1+json, \
     application/vnd.oci.image.index.v1+json";

/// Tags are fetched as a single page. Repositories with more tags than
/// this are outside what a per-pass poller should be enumerating.
const TAG_PAGE_LIMIT: usize = 1000;

// ---------------------------------------------------------------------------
// TagSource seam
// ---------------------------------------------------------------------------

/// What the resolver needs from a registry. Implemented by
/// [`RegistryClient`] for real registries and by in-memory fixtures in
/// tests.
pub trait TagSource: Send + Sync {
    /// List the available tags for `repository`.
    fn list_tags(
        &self,
        repository: &str,
    ) -> impl Future<Output = Result<Vec<String>, RegistryError>> + Send;

    /// Fetch the manifest digest the given tag currently points at.
    fn manifest_digest(
        &self,
        repository: &str,
        tag: &str,
    ) -> impl Future<Output = Result<String, RegistryError>> + Send;
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct TagList {
    tags: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

/// Asynchronous Docker Registry API v2 client.
pub struct RegistryClient {
    http: reqwest::Client,
    default_host: String,
    username: Option<String>,
    password: Option<String>,
    retries: u32,
    backoff: Duration,
    /// Per-registry-host request limiters.
    limiters: Mutex<HashMap<String, Arc<Semaphore>>>,
    max_concurrent: usize,
    /// Bearer tokens by `host|name`, valid for the duration of a pass.
    tokens: Mutex<HashMap<String, String>>,
}

impl RegistryClient {
    pub fn new(config: &RegistryConfig) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("imagesync/0.1"));
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .expect("failed to build reqwest client");
        info!(
            default_host = %config.default_host,
            timeout_secs = config.timeout_secs,
            retries = config.retries,
            "created RegistryClient"
        );
        Self {
            http,
            default_host: config.default_host.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
            retries: config.retries,
            backoff: Duration::from_millis(config.backoff_ms),
            limiters: Mutex::new(HashMap::new()),
            max_concurrent: config.max_concurrent_requests.max(1),
            tokens: Mutex::new(HashMap::new()),
        }
    }

    /// Split a repository into its registry host and remote name,
    /// defaulting the host and applying Docker Hub's `library/` namespace
    /// for single-segment names.
    fn locate(&self, repository: &str) -> (String, String) {
        let (host, name) = split_registry(repository);
        let host = host.unwrap_or(&self.default_host).to_string();
        let name = if !name.contains('/') && host.ends_with("docker.io") {
            format!("library/{}", name)
        } else {
            name.to_string()
        };
        (host, name)
    }

    async fn host_permit(&self, host: &str) -> tokio::sync::OwnedSemaphorePermit {
        let sem = {
            let mut limiters = self.limiters.lock().await;
            limiters
                .entry(host.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(self.max_concurrent)))
                .clone()
        };
        sem.acquire_owned().await.expect("semaphore never closed")
    }

    /// Run `op` with the transient-failure retry budget.
    async fn with_retries<T, F, Fut>(&self, repository: &str, mut op: F) -> Result<T, RegistryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RegistryError>>,
    {
        let mut delay = self.backoff;
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() && attempt < self.retries => {
                    attempt += 1;
                    warn!(
                        repository,
                        attempt,
                        retries = self.retries,
                        error = %e,
                        "transient registry failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Issue a request, handling the bearer-token challenge on 401.
    async fn send_authorized(
        &self,
        repository: &str,
        host: &str,
        name: &str,
        build: impl Fn() -> reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, RegistryError> {
        let token_key = format!("{}|{}", host, name);

        let cached = self.tokens.lock().await.get(&token_key).cloned();
        let mut req = build();
        if let Some(tok) = &cached {
            req = req.bearer_auth(tok);
        } else if let Some(user) = &self.username {
            req = req.basic_auth(user, self.password.as_deref());
        }

        let resp = req.send().await.map_err(|e| transport_error(repository, e))?;

        if resp.status() != StatusCode::UNAUTHORIZED {
            return Ok(resp);
        }

        // 401: follow the Bearer challenge, then retry once.
        let challenge = resp
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_bearer_challenge);
        let Some((realm, service)) = challenge else {
            return Err(RegistryError::AuthenticationFailed {
                repository: repository.to_string(),
                detail: "HTTP 401 without a Bearer challenge".into(),
            });
        };

        let token = self.fetch_token(repository, &realm, service.as_deref(), name).await?;
        self.tokens.lock().await.insert(token_key, token.clone());

        let resp = build()
            .bearer_auth(&token)
            .send()
            .await
            .map_err(|e| transport_error(repository, e))?;
        Ok(resp)
    }

    /// Fetch a pull token from the challenge realm.
    #[instrument(skip(self, realm, service))]
    async fn fetch_token(
        &self,
        repository: &str,
        realm: &str,
        service: Option<&str>,
        name: &str,
    ) -> Result<String, RegistryError> {
        let scope = format!("repository:{}:pull", name);
        let mut req = self.http.get(realm).query(&[("scope", scope.as_str())]);
        if let Some(svc) = service {
            req = req.query(&[("service", svc)]);
        }
        if let Some(user) = &self.username {
            req = req.basic_auth(user, self.password.as_deref());
        }

        let resp = req.send().await.map_err(|e| transport_error(repository, e))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(RegistryError::AuthenticationFailed {
                repository: repository.to_string(),
                detail: format!("token endpoint returned HTTP {}", status),
            });
        }
        let body: TokenResponse = resp.json().await.map_err(|e| RegistryError::Parse {
            repository: repository.to_string(),
            detail: format!("token response: {}", e),
        })?;
        body.token
            .or(body.access_token)
            .ok_or_else(|| RegistryError::Parse {
                repository: repository.to_string(),
                detail: "token response carried no token".into(),
            })
    }

    async fn list_tags_once(&self, repository: &str) -> Result<Vec<String>, RegistryError> {
        let (host, name) = self.locate(repository);
        let _permit = self.host_permit(&host).await;

        let url = format!("https://{}/v2/{}/tags/list", host, name);
        let resp = self
            .send_authorized(repository, &host, &name, || {
                self.http.get(&url).query(&[("n", TAG_PAGE_LIMIT)])
            })
            .await?;

        check_status(repository, resp.status())?;
        let body: TagList = resp.json().await.map_err(|e| RegistryError::Parse {
            repository: repository.to_string(),
            detail: format!("tag list: {}", e),
        })?;
        let tags = body.tags.unwrap_or_default();
        debug!(repository, count = tags.len(), "listed tags");
        Ok(tags)
    }

    async fn manifest_digest_once(
        &self,
        repository: &str,
        tag: &str,
    ) -> Result<String, RegistryError> {
        let (host, name) = self.locate(repository);
        let _permit = self.host_permit(&host).await;

        let url = format!("https://{}/v2/{}/manifests/{}", host, name, tag);
        let resp = self
            .send_authorized(repository, &host, &name, || {
                self.http.head(&url).header(ACCEPT, MANIFEST_ACCEPT)
            })
            .await?;
        check_status(repository, resp.status())?;

        if let Some(digest) = resp
            .headers()
            .get("docker-content-digest")
            .and_then(|v| v.to_str().ok())
        {
            debug!(repository, tag, digest, "manifest digest from header");
            return Ok(digest.to_string());
        }

        // Some registries only emit the header on GET; fetch the manifest
        // body and hash it (the digest is defined over the raw bytes).
        debug!(repository, tag, "HEAD carried no digest header, falling back to GET");
        let resp = self
            .send_authorized(repository, &host, &name, || {
                self.http.get(&url).header(ACCEPT, MANIFEST_ACCEPT)
            })
            .await?;
        check_status(repository, resp.status())?;
        if let Some(digest) = resp
            .headers()
            .get("docker-content-digest")
            .and_then(|v| v.to_str().ok())
        {
            return Ok(digest.to_string());
        }
        let body = resp
            .bytes()
            .await
            .map_err(|e| transport_error(repository, e))?;
        Ok(compute_digest(&body))
    }
}

impl TagSource for RegistryClient {
    #[instrument(skip(self))]
    async fn list_tags(&self, repository: &str) -> Result<Vec<String>, RegistryError> {
        self.with_retries(repository, || self.list_tags_once(repository))
            .await
    }

    #[instrument(skip(self))]
    async fn manifest_digest(&self, repository: &str, tag: &str) -> Result<String, RegistryError> {
        self.with_retries(repository, || self.manifest_digest_once(repository, tag))
            .await
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// The canonical digest of a manifest body.
fn compute_digest(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

/// Map an HTTP status to the error taxonomy. 5xx and 429 are transient;
/// 401/403 are authentication; 404 means the repository (or tag) does not
/// exist on this registry.
fn check_status(repository: &str, status: StatusCode) -> Result<(), RegistryError> {
    if status.is_success() {
        return Ok(());
    }
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        return Err(RegistryError::Unavailable {
            repository: repository.to_string(),
            detail: format!("HTTP {}", status),
        });
    }
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Err(RegistryError::AuthenticationFailed {
                repository: repository.to_string(),
                detail: format!("HTTP {}", status),
            })
        }
        StatusCode::NOT_FOUND => Err(RegistryError::NoMatchingVersion {
            repository: repository.to_string(),
            detail: "not found on registry".into(),
        }),
        _ => Err(RegistryError::Api {
            repository: repository.to_string(),
            status: status.as_u16(),
            detail: format!("HTTP {}", status),
        }),
    }
}

/// Connection-level failures (refused, DNS, timeout) are transient.
fn transport_error(repository: &str, e: reqwest::Error) -> RegistryError {
    RegistryError::Unavailable {
        repository: repository.to_string(),
        detail: e.to_string(),
    }
}

/// Parse `WWW-Authenticate: Bearer realm="…",service="…",scope="…"` into
/// `(realm, service)`.
fn parse_bearer_challenge(header: &str) -> Option<(String, Option<String>)> {
    let rest = header.strip_prefix("Bearer ")?;
    let mut realm = None;
    let mut service = None;
    for part in rest.split(',') {
        let (key, value) = part.trim().split_once('=')?;
        let value = value.trim_matches('"');
        match key {
            "realm" => realm = Some(value.to_string()),
            "service" => service = Some(value.to_string()),
            _ => {}
        }
    }
    realm.map(|r| (r, service))
}
