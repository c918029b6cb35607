//! # HTTP Retrieval Utilities
//!
//! Asynchronous API client around `reqwest` with exponential backoff retries,
//! plus the conditional `GET` used to build resource fetchers: the validators
//! of the held value go out as `If-None-Match` / `If-Modified-Since` and a
//! `304 Not Modified` short-circuits without a body.

use std::sync::Arc;

use anyhow::{anyhow, Context};
use futures_util::future::BoxFuture;
use reqwest::header::{
    HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH,
    LAST_MODIFIED,
};
use reqwest::{Method, StatusCode, Url};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use crate::coordinator::resource::{FetchContext, Fetched, ResourceFetcher};

/// A standardized container for API responses.
///
/// This struct wraps the deserialized data along with metadata about the
/// HTTP transaction, such as status codes and headers.
#[derive(Debug)]
pub struct ApiResponse<T> {
    /// The successfully deserialized response body, if any.
    pub data: Option<T>,
    /// The raw error body returned by the server if the request failed.
    pub error_body: Option<String>,
    /// The numeric HTTP status code.
    pub status: u16,
    /// Indicates if the status code was in the 2xx range.
    pub success: bool,
    /// The headers returned by the server.
    pub headers: HeaderMap,
}

impl<T> ApiResponse<T> {
    /// Value of a response header as text.
    pub fn header(&self, name: impl reqwest::header::AsHeaderName) -> Option<String> {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
    }
}

/// A flexible asynchronous HTTP client.
///
/// Built on top of `reqwest_middleware`, it handles base URLs,
/// authentication tokens, and automatic retries.
pub struct ApiClient {
    /// The underlying middleware-enabled client.
    inner: ClientWithMiddleware,
    /// The base URL to which all relative paths are joined.
    base_url: Url,
    /// An optional Bearer token used for authorization.
    auth_token: Option<String>,
}

impl ApiClient {
    /// Creates a new `ApiClient` instance with a retry policy.
    ///
    /// # Arguments
    /// * `base_url` - The absolute base URL for the API (e.g., "https://api.example.com/v1/").
    /// * `auth_token` - An optional string for the Authorization header.
    /// * `max_retries` - Retries of transient failures (connect errors, 5xx, 429).
    ///
    /// # Errors
    /// Fails if the `base_url` is not a valid absolute URL.
    pub fn new(base_url: &str, auth_token: Option<String>, max_retries: u32) -> anyhow::Result<Self> {
        let url = Url::parse(base_url)
            .with_context(|| format!("invalid base URL '{}' (must be absolute)", base_url))?;

        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(max_retries);
        let client = ClientBuilder::new(reqwest::Client::new())
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Ok(Self {
            inner: client,
            base_url: url,
            auth_token,
        })
    }

    /// Performs a generic HTTP request and handles the response.
    ///
    /// # Errors
    /// Returns an `anyhow::Error` if URL joining, network execution or decoding
    /// of a successful body fails. Non-2xx statuses are not errors here.
    pub async fn request<T, B>(
        &self,
        method: Method,
        path: &str,
        headers: Option<HeaderMap>,
        body: Option<B>,
    ) -> anyhow::Result<ApiResponse<T>>
    where
        T: DeserializeOwned,
        B: Serialize,
    {
        let full_url = self.base_url.join(path)?;
        let mut req = self.inner.request(method, full_url);

        if let Some(h) = headers {
            req = req.headers(h);
        }

        if let Some(token) = &self.auth_token {
            req = req.header(AUTHORIZATION, format!("Bearer {}", token));
        }

        if let Some(b) = body {
            let json_body = serde_json::to_string(&b)?;
            req = req.header(CONTENT_TYPE, "application/json").body(json_body);
        }

        let response: reqwest::Response = req.send().await?;
        let status = response.status();
        let resp_headers = response.headers().clone();

        if status.is_success() {
            let data = response.json::<T>().await?;
            Ok(ApiResponse {
                data: Some(data),
                error_body: None,
                status: status.as_u16(),
                success: true,
                headers: resp_headers,
            })
        } else {
            let error_text = response.text().await.ok().filter(|t| !t.is_empty());
            Ok(ApiResponse {
                data: None,
                error_body: error_text,
                status: status.as_u16(),
                success: false,
                headers: resp_headers,
            })
        }
    }

    /// `GET path` with the validators in `ctx`. A `304` yields
    /// [`Fetched::not_modified`]; any other non-2xx status is an error.
    pub async fn get_conditional(&self, path: &str, ctx: &FetchContext) -> anyhow::Result<Fetched> {
        let mut headers = HeaderMap::new();
        if let Some(etag) = &ctx.etag {
            headers.insert(IF_NONE_MATCH, HeaderValue::from_str(etag)?);
        }
        if let Some(since) = &ctx.last_modified {
            headers.insert(IF_MODIFIED_SINCE, HeaderValue::from_str(since)?);
        }

        let response = self
            .request::<Value, ()>(Method::GET, path, Some(headers), None)
            .await?;

        if response.status == StatusCode::NOT_MODIFIED.as_u16() {
            log::debug!("[http] {} not modified", path);
            return Ok(Fetched::not_modified());
        }
        if !response.success {
            return Err(anyhow!(
                "GET {} returned {}: {}",
                path,
                response.status,
                response.error_body.as_deref().unwrap_or("<empty body>")
            ));
        }

        Ok(Fetched {
            etag: response.header(ETAG),
            last_modified: response.header(LAST_MODIFIED),
            data: response.data.unwrap_or(Value::Null),
            not_modified: false,
        })
    }
}

/// Resource fetcher issuing conditional `GET path` requests through `client`.
pub fn http_fetcher(client: Arc<ApiClient>, path: impl Into<String>) -> ResourceFetcher {
    let path = path.into();
    Arc::new(move |ctx: FetchContext| -> BoxFuture<'static, anyhow::Result<Fetched>> {
        let client = Arc::clone(&client);
        let path = path.clone();
        Box::pin(async move { client.get_conditional(&path, &ctx).await })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// One-connection-per-request HTTP stub. Answers `304` when the request
    /// carries `If-None-Match: "v1"`, otherwise a JSON body with that ETag.
    async fn stub_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                let mut buf = vec![0u8; 4096];
                let n = socket.read(&mut buf).await.unwrap_or(0);
                let request = String::from_utf8_lossy(&buf[..n]).to_ascii_lowercase();

                let response = if request.starts_with("get /missing") {
                    "HTTP/1.1 404 Not Found\r\nContent-Length: 4\r\nConnection: close\r\n\r\ngone"
                        .to_string()
                } else if request.contains("if-none-match: \"v1\"") {
                    "HTTP/1.1 304 Not Modified\r\nConnection: close\r\n\r\n".to_string()
                } else {
                    let body = r#"{"items":[1,2]}"#;
                    format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nETag: \"v1\"\r\nLast-Modified: Wed, 21 Oct 2015 07:28:00 GMT\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    )
                };
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        format!("http://{}/", addr)
    }

    #[test]
    fn relative_base_url_is_rejected() {
        assert!(ApiClient::new("api/v1", None, 0).is_err());
    }

    #[tokio::test]
    async fn conditional_get_round_trip() {
        let base = stub_server().await;
        let client = Arc::new(ApiClient::new(&base, None, 0).unwrap());
        let fetch = http_fetcher(Arc::clone(&client), "orders");

        let first = fetch(FetchContext::default()).await.unwrap();
        assert_eq!(first.data, json!({"items": [1, 2]}));
        assert_eq!(first.etag.as_deref(), Some("\"v1\""));
        assert_eq!(
            first.last_modified.as_deref(),
            Some("Wed, 21 Oct 2015 07:28:00 GMT")
        );
        assert!(!first.not_modified);

        let second = fetch(FetchContext {
            etag: first.etag.clone(),
            last_modified: None,
        })
        .await
        .unwrap();
        assert!(second.not_modified);

        let missing = client
            .get_conditional("missing", &FetchContext::default())
            .await
            .unwrap_err();
        assert!(missing.to_string().contains("404"));
    }
}
