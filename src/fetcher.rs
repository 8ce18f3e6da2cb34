//! Plain HTTP fetching
//!
//! The orchestrator always tries a cheap byte-level download first; only
//! documents the classifier flags are re-fetched through a browser.

use crate::{FetchError, HttpSettings, UrlGuard};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use reqwest::header::CONTENT_TYPE;
use reqwest::redirect;
use std::collections::HashMap;
use std::error::Error as _;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// A redirect hop that failed URL validation.
#[derive(Debug, Error)]
#[error("redirect to {target} rejected: {reason}")]
struct RedirectRejected {
    target: String,
    reason: String,
}

/// Response details the pipeline needs after a plain fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchMetadata {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub content_type: Option<String>,
    pub final_url: String,
    pub size: usize,
}

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub body: Bytes,
    pub meta: FetchMetadata,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HttpFetcher: Send + Sync {
    async fn fetch(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
    ) -> Result<FetchedPage, FetchError>;
}

/// `HttpFetcher` backed by a pooled reqwest client.
pub struct ReqwestFetcher {
    client: reqwest::Client,
    timeout: Duration,
    max_content_bytes: usize,
}

impl ReqwestFetcher {
    /// Every redirect hop is checked against `guard` before it is followed.
    pub fn new(
        settings: &HttpSettings,
        timeout: Duration,
        guard: UrlGuard,
    ) -> Result<Self, FetchError> {
        let max_redirects = settings.max_redirects;
        let policy = redirect::Policy::custom(move |attempt| {
            if attempt.previous().len() > max_redirects {
                return attempt.error(format!("more than {max_redirects} redirects"));
            }
            match guard.validate(attempt.url().as_str()) {
                Ok(_) => attempt.follow(),
                Err(e) => {
                    let rejected = RedirectRejected {
                        target: attempt.url().to_string(),
                        reason: e.to_string(),
                    };
                    warn!("{}", rejected);
                    attempt.error(rejected)
                }
            }
        });

        let client = reqwest::Client::builder()
            .user_agent(settings.user_agent.as_str())
            .redirect(policy)
            .timeout(timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| FetchError::Configuration(format!("HTTP client: {e}")))?;

        Ok(Self {
            client,
            timeout,
            max_content_bytes: settings.max_content_bytes,
        })
    }

    fn map_error(&self, err: reqwest::Error) -> FetchError {
        if err.is_timeout() {
            FetchError::Timeout(self.timeout)
        } else if err.is_builder() {
            FetchError::Validation(err.to_string())
        } else if err.is_redirect() {
            let mut source = err.source();
            while let Some(cause) = source {
                if let Some(rejected) = cause.downcast_ref::<RedirectRejected>() {
                    return FetchError::Validation(rejected.to_string());
                }
                source = cause.source();
            }
            FetchError::Download("too many redirects".to_string())
        } else if let Some(status) = err.status() {
            FetchError::UpstreamHttp {
                status: status.as_u16(),
            }
        } else {
            FetchError::Download(err.to_string())
        }
    }

    fn too_large(&self) -> FetchError {
        FetchError::Download(format!(
            "response exceeds {} bytes",
            self.max_content_bytes
        ))
    }
}

#[async_trait]
impl HttpFetcher for ReqwestFetcher {
    async fn fetch(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
    ) -> Result<FetchedPage, FetchError> {
        let mut request = self.client.get(url);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let mut response = request.send().await.map_err(|e| self.map_error(e))?;
        let status = response.status().as_u16();
        if status >= 400 {
            return Err(FetchError::UpstreamHttp { status });
        }

        if let Some(length) = response.content_length() {
            if length > self.max_content_bytes as u64 {
                return Err(self.too_large());
            }
        }

        let final_url = response.url().to_string();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let response_headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        let mut body = BytesMut::new();
        while let Some(chunk) = response.chunk().await.map_err(|e| self.map_error(e))? {
            if body.len() + chunk.len() > self.max_content_bytes {
                return Err(self.too_large());
            }
            body.extend_from_slice(&chunk);
        }

        debug!("Fetched {} ({} bytes, HTTP {})", final_url, body.len(), status);
        let size = body.len();
        Ok(FetchedPage {
            body: body.freeze(),
            meta: FetchMetadata {
                status,
                headers: response_headers,
                content_type,
                final_url,
                size,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::UrlGuardSettings;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fetcher(max_content_bytes: usize, timeout: Duration) -> ReqwestFetcher {
        let settings = HttpSettings {
            max_content_bytes,
            ..Default::default()
        };
        ReqwestFetcher::new(&settings, timeout, local_guard()).unwrap()
    }

    /// Test servers listen on loopback, so private targets stay allowed.
    fn local_guard() -> UrlGuard {
        UrlGuard::new(UrlGuardSettings {
            allow_private_networks: true,
            blocked_hosts: vec!["metadata.internal.example".to_string()],
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn fetch_returns_body_and_metadata() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/page"))
            .and(header("x-trace", "abc"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/html; charset=utf-8")
                    .set_body_string("<html><body>hi</body></html>"),
            )
            .mount(&server)
            .await;

        let mut headers = HashMap::new();
        headers.insert("x-trace".to_string(), "abc".to_string());
        let page = fetcher(1024, Duration::from_secs(5))
            .fetch(&format!("{}/page", server.uri()), &headers)
            .await
            .unwrap();

        assert_eq!(page.meta.status, 200);
        assert_eq!(page.meta.content_type.as_deref(), Some("text/html; charset=utf-8"));
        assert_eq!(page.meta.size, page.body.len());
        assert!(page.meta.final_url.ends_with("/page"));
        assert_eq!(&page.body[..], b"<html><body>hi</body></html>");
    }

    #[tokio::test]
    async fn error_status_is_upstream_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let result = fetcher(1024, Duration::from_secs(5))
            .fetch(&format!("{}/missing", server.uri()), &HashMap::new())
            .await;
        assert!(matches!(result, Err(FetchError::UpstreamHttp { status: 404 })));
    }

    #[tokio::test]
    async fn oversized_body_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("x".repeat(2048)))
            .mount(&server)
            .await;

        let result = fetcher(1024, Duration::from_secs(5))
            .fetch(&server.uri(), &HashMap::new())
            .await;
        assert!(matches!(result, Err(FetchError::Download(_))));
    }

    #[tokio::test]
    async fn slow_server_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let result = fetcher(1024, Duration::from_millis(100))
            .fetch(&server.uri(), &HashMap::new())
            .await;
        assert!(matches!(result, Err(FetchError::Timeout(_))));
    }

    #[tokio::test]
    async fn unreachable_host_is_download_error() {
        let result = fetcher(1024, Duration::from_secs(2))
            .fetch("http://127.0.0.1:9/", &HashMap::new())
            .await;
        assert!(matches!(result, Err(FetchError::Download(_))));
    }

    #[tokio::test]
    async fn redirects_are_followed_within_limit() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/old"))
            .respond_with(ResponseTemplate::new(302).insert_header("location", "/new"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/new"))
            .respond_with(ResponseTemplate::new(200).set_body_string("moved here"))
            .mount(&server)
            .await;

        let page = fetcher(1024, Duration::from_secs(5))
            .fetch(&format!("{}/old", server.uri()), &HashMap::new())
            .await
            .unwrap();
        assert!(page.meta.final_url.ends_with("/new"));
        assert_eq!(&page.body[..], b"moved here");
    }

    #[tokio::test]
    async fn redirect_to_blocked_host_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(302)
                    .insert_header("location", "http://metadata.internal.example/latest"),
            )
            .mount(&server)
            .await;

        let result = fetcher(1024, Duration::from_secs(5))
            .fetch(&server.uri(), &HashMap::new())
            .await;
        match result {
            Err(FetchError::Validation(message)) => assert!(message.contains("host is blocked")),
            other => panic!("expected a validation error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn redirect_to_private_address_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(301)
                    .insert_header("location", "http://169.254.169.254/latest/meta-data/"),
            )
            .mount(&server)
            .await;

        // Only the redirect target goes through this guard; the test server
        // itself is reached directly.
        let fetcher = ReqwestFetcher::new(
            &HttpSettings::default(),
            Duration::from_secs(5),
            UrlGuard::new(UrlGuardSettings::default()),
        )
        .unwrap();
        let result = fetcher.fetch(&server.uri(), &HashMap::new()).await;
        assert!(matches!(result, Err(FetchError::Validation(_))));
    }

    #[tokio::test]
    async fn redirect_loop_stops_at_limit() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(302).insert_header("location", "/again"))
            .mount(&server)
            .await;

        let result = fetcher(1024, Duration::from_secs(5))
            .fetch(&server.uri(), &HashMap::new())
            .await;
        assert!(matches!(result, Err(FetchError::Download(_))));
    }
}
