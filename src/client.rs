use std::env;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::{Duration, Instant};

use futures::Stream;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Client as ReqwestClient, Response, header};
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::observability::{CLIENT_REQUEST_DURATION, CLIENT_REQUEST_ERRORS, CLIENT_REQUESTS};
use crate::retry::{RetryPolicy, retry_with_backoff, retry_with_backoff_until};
use crate::sse::process_sse;
use crate::types::{ChatCompletionChunk, ChatCompletionRequest};

/// Default endpoint base; any OpenAI-compatible server works.
pub const DEFAULT_API_URL: &str = "https://api.openai.com/v1/";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);
const API_KEY_VARS: [&str; 2] = ["EDDIE_API_KEY", "OPENAI_API_KEY"];

/// A boxed stream of completion fragments.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<ChatCompletionChunk>> + Send>>;

/// Anything that can answer a chat completion request with a fragment stream.
///
/// The session engine only talks to the network through this trait.
#[async_trait::async_trait]
pub trait CompletionEndpoint: Send + Sync {
    /// Open a streamed completion for `request`.
    async fn stream(&self, request: ChatCompletionRequest) -> Result<ChunkStream>;
}

/// Client for an OpenAI-compatible chat completions endpoint.
#[derive(Debug, Clone)]
pub struct CompletionClient {
    api_key: Option<String>,
    client: ReqwestClient,
    base_url: String,
    timeout: Duration,
    retry: RetryPolicy,
    interrupt: Option<Arc<AtomicBool>>,
}

impl CompletionClient {
    /// Create a new client against the default endpoint.
    ///
    /// The API key can be provided directly or read from the EDDIE_API_KEY or
    /// OPENAI_API_KEY environment variables.  Local servers need no key, so a
    /// missing key is not an error.
    pub fn new(api_key: Option<String>) -> Result<Self> {
        Self::with_options(api_key, None, None)
    }

    /// Create a new client with custom settings.
    pub fn with_options(
        api_key: Option<String>,
        base_url: Option<String>,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        let api_key = api_key.or_else(|| {
            API_KEY_VARS
                .iter()
                .find_map(|var| env::var(var).ok())
                .filter(|key| !key.is_empty())
        });

        let base_url = normalize_base_url(base_url.as_deref().unwrap_or(DEFAULT_API_URL))?;
        let timeout = timeout.unwrap_or(DEFAULT_TIMEOUT);
        let client = ReqwestClient::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| {
                Error::http_client(
                    format!("Failed to build HTTP client: {e}"),
                    Some(Box::new(e)),
                )
            })?;

        Ok(Self {
            api_key,
            client,
            base_url,
            timeout,
            retry: RetryPolicy::default(),
            interrupt: None,
        })
    }

    /// Replace the retry policy used when opening streams.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Abandon retries as soon as `interrupt` is set.
    pub fn with_interrupt(mut self, interrupt: Arc<AtomicBool>) -> Self {
        self.interrupt = Some(interrupt);
        self
    }

    /// The endpoint base URL, always ending in `/`.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Create and return default headers for API requests.
    fn default_headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        headers.insert(
            header::ACCEPT,
            HeaderValue::from_static("text/event-stream"),
        );
        if let Some(api_key) = &self.api_key {
            let value = HeaderValue::from_str(&format!("Bearer {api_key}"))
                .map_err(|_| Error::authentication("API key contains invalid characters"))?;
            headers.insert(header::AUTHORIZATION, value);
        }
        Ok(headers)
    }

    /// Process API response errors and convert to our Error type
    async fn process_error_response(response: Response) -> Error {
        let status = response.status();
        let status_code = status.as_u16();

        let request_id = response
            .headers()
            .get("x-request-id")
            .and_then(|val| val.to_str().ok())
            .map(String::from);

        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|val| val.to_str().ok())
            .and_then(|val| val.parse::<u64>().ok());

        #[derive(Deserialize)]
        struct ErrorResponse {
            error: Option<ErrorDetail>,
        }

        #[derive(Deserialize)]
        struct ErrorDetail {
            #[serde(rename = "type")]
            error_type: Option<String>,
            message: Option<String>,
            param: Option<String>,
        }

        let error_body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                return Error::http_client(
                    format!("Failed to read error response: {e}"),
                    Some(Box::new(e)),
                );
            }
        };

        let parsed_error = serde_json::from_str::<ErrorResponse>(&error_body).ok();
        let detail = parsed_error.as_ref().and_then(|e| e.error.as_ref());
        let error_type = detail.and_then(|e| e.error_type.clone());
        let error_message = detail
            .and_then(|e| e.message.clone())
            .unwrap_or_else(|| error_body.clone());
        let error_param = detail.and_then(|e| e.param.clone());

        match status_code {
            400 => Error::bad_request(error_message, error_param),
            401 | 403 => Error::authentication(error_message),
            408 => Error::timeout(error_message, None),
            429 => Error::rate_limit(error_message, retry_after),
            500 => Error::internal_server(error_message, request_id),
            502..=504 => Error::service_unavailable(error_message, retry_after),
            _ => Error::api(status_code, error_type, error_message, request_id),
        }
    }

    /// Send one request and hand back the fragment stream on success.
    async fn open_stream(&self, request: &ChatCompletionRequest) -> Result<ChunkStream> {
        let url = format!("{}chat/completions", self.base_url);
        CLIENT_REQUESTS.click();
        let start = Instant::now();

        let response = self
            .client
            .post(&url)
            .headers(self.default_headers()?)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::timeout(
                        format!("Request timed out: {e}"),
                        Some(self.timeout.as_secs_f64()),
                    )
                } else if e.is_connect() {
                    Error::connection(format!("Connection error: {e}"), Some(Box::new(e)))
                } else {
                    Error::http_client(format!("Request failed: {e}"), Some(Box::new(e)))
                }
            });
        CLIENT_REQUEST_DURATION.add(start.elapsed().as_secs_f64());
        let response = match response {
            Ok(response) => response,
            Err(err) => {
                CLIENT_REQUEST_ERRORS.click();
                return Err(err);
            }
        };

        if !response.status().is_success() {
            CLIENT_REQUEST_ERRORS.click();
            return Err(Self::process_error_response(response).await);
        }

        debug!(status = %response.status(), "completion stream opened");
        Ok(Box::pin(process_sse(response.bytes_stream())))
    }
}

#[async_trait::async_trait]
impl CompletionEndpoint for CompletionClient {
    async fn stream(&self, mut request: ChatCompletionRequest) -> Result<ChunkStream> {
        request.stream = true;
        info!(
            model = %request.model,
            messages = request.messages.len(),
            "sending chat completion request"
        );
        match &self.interrupt {
            Some(interrupt) => {
                retry_with_backoff_until(self.retry, interrupt, || self.open_stream(&request))
                    .await
            }
            None => retry_with_backoff(self.retry, || self.open_stream(&request)).await,
        }
    }
}

fn normalize_base_url(base_url: &str) -> Result<String> {
    let mut parsed = url::Url::parse(base_url)?;
    if !parsed.path().ends_with('/') {
        let path = format!("{}/", parsed.path());
        parsed.set_path(&path);
    }
    Ok(parsed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        let client = CompletionClient::new(Some("test-key".to_string())).unwrap();
        assert_eq!(client.api_key.as_deref(), Some("test-key"));
        assert_eq!(client.base_url, DEFAULT_API_URL);
        assert_eq!(client.timeout, DEFAULT_TIMEOUT);

        let client = CompletionClient::with_options(
            Some("test-key".to_string()),
            Some("http://localhost:11434/v1".to_string()),
            Some(Duration::from_secs(30)),
        )
        .unwrap();
        assert_eq!(client.base_url(), "http://localhost:11434/v1/");
        assert_eq!(client.timeout, Duration::from_secs(30));
    }

    #[test]
    fn invalid_base_url_is_rejected() {
        let err = CompletionClient::with_options(None, Some("not a url".to_string()), None)
            .unwrap_err();
        assert!(matches!(err, Error::Url { .. }));
    }

    #[test]
    fn authorization_header_uses_bearer_token() {
        let client = CompletionClient::new(Some("sk-test".to_string())).unwrap();
        let headers = client.default_headers().unwrap();
        assert_eq!(
            headers.get(header::AUTHORIZATION).unwrap(),
            &HeaderValue::from_static("Bearer sk-test")
        );
        assert_eq!(
            headers.get(header::ACCEPT).unwrap(),
            &HeaderValue::from_static("text/event-stream")
        );
    }

    #[tokio::test]
    async fn connection_refused_is_a_transport_error() {
        let client = CompletionClient::with_options(
            Some("test-key".to_string()),
            Some("http://127.0.0.1:9/v1/".to_string()),
            Some(Duration::from_secs(2)),
        )
        .unwrap()
        .with_retry_policy(RetryPolicy::none());
        let request = ChatCompletionRequest::new("gpt-4o", vec![]);
        let err = match client.stream(request).await {
            Ok(_) => panic!("expected the connection to fail"),
            Err(err) => err,
        };
        assert!(err.is_transport());
    }
}
