//! `fetch` capability: an HTTP request made with the extension's network
//! access, answered with status, headers and a base64 body.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::logging::redact_if_sensitive;

const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid URL {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("unsupported URL scheme: {0}")]
    UnsupportedScheme(String),
    #[error("invalid HTTP method: {0}")]
    InvalidMethod(String),
    #[error("invalid header {0}")]
    InvalidHeader(String),
    #[error("{0}")]
    Http(#[from] reqwest::Error),
}

/// Subset of the `RequestInit` dictionary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FetchInit {
    pub method: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    /// Base64-encoded response bytes.
    pub body: String,
}

impl FetchResponse {
    pub fn decoded_body(&self) -> Result<Vec<u8>, base64::DecodeError> {
        BASE64.decode(&self.body)
    }
}

#[async_trait]
pub trait HttpFetcher: Send + Sync {
    async fn fetch(&self, url: &str, init: FetchInit) -> Result<FetchResponse, FetchError>;
}

#[derive(Debug, Clone)]
pub struct ReqwestFetcher {
    client: reqwest::Client,
}

impl ReqwestFetcher {
    pub fn new() -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_FETCH_TIMEOUT)
            .build()?;
        Ok(Self { client })
    }

    #[must_use]
    pub const fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpFetcher for ReqwestFetcher {
    async fn fetch(&self, url: &str, init: FetchInit) -> Result<FetchResponse, FetchError> {
        let parsed = url::Url::parse(url).map_err(|source| FetchError::InvalidUrl {
            url: url.to_string(),
            source,
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(FetchError::UnsupportedScheme(parsed.scheme().to_string()));
        }
        let method_name = init.method.as_deref().unwrap_or("GET").to_ascii_uppercase();
        let method = reqwest::Method::from_bytes(method_name.as_bytes())
            .map_err(|_| FetchError::InvalidMethod(method_name.clone()))?;

        let mut headers = reqwest::header::HeaderMap::new();
        for (name, value) in &init.headers {
            tracing::debug!(
                header = %name,
                value = %redact_if_sensitive(name, value),
                "fetch request header"
            );
            let header_name = reqwest::header::HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| FetchError::InvalidHeader(name.clone()))?;
            let header_value = reqwest::header::HeaderValue::from_str(value)
                .map_err(|_| FetchError::InvalidHeader(name.clone()))?;
            headers.append(header_name, header_value);
        }

        tracing::debug!(%method, url = %parsed, "fetch");
        let mut request = self.client.request(method, parsed).headers(headers);
        if let Some(body) = init.body {
            request = request.body(body);
        }
        let response = request.send().await?;

        let status = response.status().as_u16();
        let mut headers: BTreeMap<String, String> = BTreeMap::new();
        for (name, value) in response.headers() {
            let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
            headers
                .entry(name.as_str().to_string())
                .and_modify(|joined| {
                    joined.push_str(", ");
                    joined.push_str(&value);
                })
                .or_insert(value);
        }
        let bytes = response.bytes().await?;
        Ok(FetchResponse {
            status,
            headers,
            body: BASE64.encode(&bytes),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    #[tokio::test]
    async fn returns_status_headers_and_base64_body() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/echo")
                .header("x-trace", "abc")
                .body("ping");
            then.status(201)
                .header("content-type", "text/plain")
                .body("pong");
        });

        let fetcher = ReqwestFetcher::new().expect("client");
        let response = fetcher
            .fetch(
                &server.url("/echo"),
                FetchInit {
                    method: Some("post".to_string()),
                    headers: BTreeMap::from([("x-trace".to_string(), "abc".to_string())]),
                    body: Some("ping".to_string()),
                },
            )
            .await
            .expect("fetch");

        mock.assert();
        assert_eq!(response.status, 201);
        assert_eq!(
            response.headers.get("content-type").map(String::as_str),
            Some("text/plain")
        );
        assert_eq!(response.decoded_body().expect("base64"), b"pong");
    }

    #[tokio::test]
    async fn error_statuses_are_not_failures() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/missing");
            then.status(404).body("");
        });
        let fetcher = ReqwestFetcher::new().expect("client");
        let response = fetcher
            .fetch(&server.url("/missing"), FetchInit::default())
            .await
            .expect("fetch");
        assert_eq!(response.status, 404);
        assert_eq!(response.body, "");
    }

    #[tokio::test]
    async fn rejects_bad_urls_and_methods() {
        let fetcher = ReqwestFetcher::new().expect("client");
        assert!(matches!(
            fetcher.fetch("not a url", FetchInit::default()).await,
            Err(FetchError::InvalidUrl { .. })
        ));
        assert!(matches!(
            fetcher.fetch("file:///etc/hosts", FetchInit::default()).await,
            Err(FetchError::UnsupportedScheme(_))
        ));
        let init = FetchInit {
            method: Some("GE T".to_string()),
            ..FetchInit::default()
        };
        assert!(matches!(
            fetcher.fetch("http://127.0.0.1:9/", init).await,
            Err(FetchError::InvalidMethod(_))
        ));
    }
}
