// # HTTP Remote Authority
//
// This crate talks to a remote provider's authority over HTTP: it exchanges
// login codes for tokens, pulls and pushes user preferences, and submits
// load-test metrics for the task queue.
//
// ## Architectural Constraints
//
// ### Trust Level: Untrusted (Remote Authority)
//
// **Allowed Capabilities**:
// - ✅ Perform HTTP/HTTPS calls to the provider's own base URL
// - ✅ Parse authority responses
//
// **Forbidden Capabilities**:
// - ❌ Spawn tasks (the sync loop is owned by `RemoteProvider`)
// - ❌ Retry (the next sync tick is the retry)
// - ❌ Touch persisters (the cache is owned by `RemoteProvider`)
//
// ## Security Requirements
//
// - Tokens NEVER appear in logs or `Debug` output
//
// ## API Reference
//
// - Exchange a login code: GET `{base}/api/user/token?code=...` → `{"token": "..."}`
// - Pull preferences: GET `{base}/api/user/prefs` → `{"<user>": {...}, ...}`
// - Push preferences: POST `{base}/api/user/prefs/<user>`
// - Submit metrics: POST `{base}/api/metrics`

use async_trait::async_trait;
use meshplane_core::provider::authority_host;
use meshplane_core::traits::{AuthorityFactory, Job, JobHandler, PreferenceSet, RemoteAuthority};
use meshplane_core::{Error, Result};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

const TOKEN_PATH: &str = "api/user/token";
const PREFERENCES_PATH: &str = "api/user/prefs";
const METRICS_PATH: &str = "api/metrics";

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
}

fn build_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| Error::http(format!("Failed to build HTTP client: {}", e)))
}

/// `base` with a trailing slash, so relative joins append instead of replace
fn directory(base: &Url) -> Url {
    let mut dir = base.clone();
    if !dir.path().ends_with('/') {
        let path = format!("{}/", dir.path());
        dir.set_path(&path);
    }
    dir.set_query(None);
    dir.set_fragment(None);
    dir
}

fn endpoint(base: &Url, path: &str) -> Result<Url> {
    directory(base)
        .join(path)
        .map_err(|e| Error::config(format!("Invalid endpoint {}: {}", path, e)))
}

/// Map a non-success status to the error taxonomy
fn status_error(authority: &str, status: reqwest::StatusCode, body: &str) -> Error {
    match status.as_u16() {
        401 | 403 => Error::auth(format!("{} rejected the token ({})", authority, status)),
        404 => Error::not_found(format!("{} endpoint not found ({})", authority, status)),
        429 => Error::http(format!("{} is rate limiting ({})", authority, status)),
        500..=599 => Error::http(format!("{} server error (transient): {} - {}", authority, status, body)),
        _ => Error::http(format!("{} request failed: {} - {}", authority, status, body)),
    }
}

async fn check(authority: &str, response: reqwest::Response) -> Result<reqwest::Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "Unable to read error response".to_string());
    Err(status_error(authority, status, &body))
}

fn transport_error(authority: &str, e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::http(format!("{} timed out", authority))
    } else {
        Error::http(format!("{} request failed: {}", authority, e))
    }
}

/// HTTP client for one remote provider's authority
///
/// Every request carries the session token as a bearer credential.
pub struct HttpAuthority {
    name: String,
    base: Url,
    client: reqwest::Client,
}

impl std::fmt::Debug for HttpAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpAuthority")
            .field("name", &self.name)
            .field("base", &self.base.as_str())
            .finish()
    }
}

impl HttpAuthority {
    /// Create a client for `base` with a per-request timeout
    pub fn new(base: Url, timeout: Duration) -> Result<Self> {
        let name = authority_host(&base)
            .ok_or_else(|| Error::invalid_provider_url(base.as_str(), "URL has no host"))?;

        Ok(Self {
            name,
            base,
            client: build_client(timeout)?,
        })
    }

    fn user_endpoint(&self, user: &str) -> Result<Url> {
        let mut url = endpoint(&self.base, PREFERENCES_PATH)?;
        url.path_segments_mut()
            .map_err(|_| Error::config(format!("{} cannot carry a path", self.base)))?
            .push(user);
        Ok(url)
    }
}

#[async_trait]
impl RemoteAuthority for HttpAuthority {
    async fn fetch_preferences(&self, token: &str) -> Result<PreferenceSet> {
        let url = endpoint(&self.base, PREFERENCES_PATH)?;
        tracing::debug!(authority = %self.name, "Pulling preferences");

        let response = self
            .client
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| transport_error(&self.name, e))?;

        check(&self.name, response)
            .await?
            .json::<PreferenceSet>()
            .await
            .map_err(|e| Error::http(format!("{} sent an invalid preference set: {}", self.name, e)))
    }

    async fn push_preferences(
        &self,
        token: &str,
        user: &str,
        preferences: &serde_json::Value,
    ) -> Result<()> {
        let url = self.user_endpoint(user)?;
        tracing::debug!(authority = %self.name, user, "Pushing preferences");

        let response = self
            .client
            .post(url)
            .bearer_auth(token)
            .json(preferences)
            .send()
            .await
            .map_err(|e| transport_error(&self.name, e))?;

        check(&self.name, response).await?;
        Ok(())
    }

    async fn exchange_token(&self, code: &str) -> Result<String> {
        if code.is_empty() {
            return Err(Error::auth("Login code cannot be empty"));
        }

        let mut url = endpoint(&self.base, TOKEN_PATH)?;
        url.query_pairs_mut().append_pair("code", code);

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| transport_error(&self.name, e))?;

        let body: TokenResponse = check(&self.name, response)
            .await?
            .json()
            .await
            .map_err(|e| Error::auth(format!("{} sent an invalid token response: {}", self.name, e)))?;

        if body.token.is_empty() {
            return Err(Error::auth(format!("{} returned an empty token", self.name)));
        }
        Ok(body.token)
    }

    fn authority_name(&self) -> &str {
        &self.name
    }
}

/// Builds an [`HttpAuthority`] per remote provider
#[derive(Debug, Default, Clone, Copy)]
pub struct HttpAuthorityFactory;

impl AuthorityFactory for HttpAuthorityFactory {
    fn create(&self, base_url: &Url, timeout: Duration) -> Result<Arc<dyn RemoteAuthority>> {
        Ok(Arc::new(HttpAuthority::new(base_url.clone(), timeout)?))
    }
}

/// Task queue handler posting `submitMetrics` payloads to a collector
pub struct HttpMetricsSubmitter {
    endpoint: Url,
    token: Option<String>,
    client: reqwest::Client,
}

impl std::fmt::Debug for HttpMetricsSubmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpMetricsSubmitter")
            .field("endpoint", &self.endpoint.as_str())
            .field("token", &self.token.as_ref().map(|_| "<REDACTED>"))
            .finish()
    }
}

impl HttpMetricsSubmitter {
    /// Post metrics to `{base}/api/metrics`, optionally as `token`
    pub fn new(base: &Url, token: Option<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            endpoint: endpoint(base, METRICS_PATH)?,
            token: token.filter(|t| !t.is_empty()),
            client: build_client(timeout)?,
        })
    }

    /// Collector URL
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl JobHandler for HttpMetricsSubmitter {
    async fn handle(&self, job: Job) -> Result<()> {
        let mut request = self.client.post(self.endpoint.clone()).json(&job.payload);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::job_failure(&job.name, transport_error("metrics collector", e).to_string()))?;

        check("metrics collector", response)
            .await
            .map_err(|e| Error::job_failure(&job.name, e.to_string()))?;

        tracing::debug!(job = %job.name, "Metrics submitted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Headers received and, if announced, the whole body
    fn request_complete(request: &[u8]) -> bool {
        let Some(end) = request.windows(4).position(|w| w == b"\r\n\r\n") else {
            return false;
        };
        let headers = String::from_utf8_lossy(&request[..end]).to_lowercase();
        let length = headers
            .lines()
            .find_map(|line| line.strip_prefix("content-length:"))
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(0);
        request.len() >= end + 4 + length
    }

    /// Serve one canned HTTP response and hand back the raw request
    async fn serve_once(status: &'static str, body: &'static str) -> (Url, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                request.extend_from_slice(&buf[..n]);
                if n == 0 || request_complete(&request) {
                    break;
                }
            }
            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
            String::from_utf8_lossy(&request).to_string()
        });

        (Url::parse(&format!("http://{}/base", addr)).unwrap(), handle)
    }

    #[test]
    fn test_endpoints_append_to_base_path() {
        let base = Url::parse("https://a.example/base?x=1").unwrap();
        assert_eq!(
            endpoint(&base, PREFERENCES_PATH).unwrap().as_str(),
            "https://a.example/base/api/user/prefs"
        );

        let authority = HttpAuthority::new(base, Duration::from_secs(1)).unwrap();
        assert_eq!(
            authority.user_endpoint("a b/c").unwrap().as_str(),
            "https://a.example/base/api/user/prefs/a%20b%2Fc"
        );
    }

    #[test]
    fn test_status_mapping() {
        use reqwest::StatusCode;

        assert!(matches!(status_error("a", StatusCode::UNAUTHORIZED, ""), Error::Authentication(_)));
        assert!(matches!(status_error("a", StatusCode::FORBIDDEN, ""), Error::Authentication(_)));
        assert!(matches!(status_error("a", StatusCode::NOT_FOUND, ""), Error::NotFound(_)));
        assert!(matches!(status_error("a", StatusCode::TOO_MANY_REQUESTS, ""), Error::Http(_)));
        assert!(matches!(status_error("a", StatusCode::BAD_GATEWAY, ""), Error::Http(_)));
    }

    #[test]
    fn test_factory_names_authority_by_host() {
        let base = Url::parse("https://a.example:8443/").unwrap();
        let authority = HttpAuthorityFactory.create(&base, Duration::from_secs(1)).unwrap();
        assert_eq!(authority.authority_name(), "a.example:8443");
    }

    #[test]
    fn test_token_not_exposed_in_debug() {
        let base = Url::parse("https://collector.example").unwrap();
        let submitter =
            HttpMetricsSubmitter::new(&base, Some("secret_token_12345".to_string()), Duration::from_secs(1))
                .unwrap();

        let debug_str = format!("{:?}", submitter);
        assert!(!debug_str.contains("secret_token"));
        assert!(debug_str.contains("HttpMetricsSubmitter"));
    }

    #[tokio::test]
    async fn test_fetch_preferences_sends_bearer_token() {
        let (base, server) = serve_once("200 OK", r#"{"alice":{"theme":"dark"}}"#).await;
        let authority = HttpAuthority::new(base, Duration::from_secs(5)).unwrap();

        let prefs = authority.fetch_preferences("t-1").await.unwrap();
        assert_eq!(prefs.get("alice"), Some(&json!({ "theme": "dark" })));

        let request = server.await.unwrap();
        assert!(request.starts_with("GET /base/api/user/prefs "));
        assert!(request.to_lowercase().contains("authorization: bearer t-1"));
    }

    #[tokio::test]
    async fn test_exchange_token() {
        let (base, server) = serve_once("200 OK", r#"{"token":"t-42"}"#).await;
        let authority = HttpAuthority::new(base, Duration::from_secs(5)).unwrap();

        assert_eq!(authority.exchange_token("abc").await.unwrap(), "t-42");
        let request = server.await.unwrap();
        assert!(request.starts_with("GET /base/api/user/token?code=abc "));
    }

    #[tokio::test]
    async fn test_rejected_token_is_an_auth_error() {
        let (base, server) = serve_once("401 Unauthorized", "{}").await;
        let authority = HttpAuthority::new(base, Duration::from_secs(5)).unwrap();

        let err = authority.fetch_preferences("expired").await.unwrap_err();
        assert!(matches!(err, Error::Authentication(_)));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_metrics_failure_is_a_job_failure() {
        let (base, server) = serve_once("503 Service Unavailable", "{}").await;
        let submitter = HttpMetricsSubmitter::new(&base, None, Duration::from_secs(5)).unwrap();

        let err = submitter
            .handle(Job::submit_metrics(json!({ "qps": 10 })))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::JobFailure { .. }));

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /base/api/metrics "));
    }
}
