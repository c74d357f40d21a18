use crate::charset::{self, CharsetInfo};
use crate::options::{ExtractOptions, DEFAULT_ACCEPT};
use crate::security::UrlGuard;
use crate::{OEmbed, OgieError};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE, LOCATION, USER_AGENT};
use reqwest::Client;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, instrument, warn};
use url::Url;

const HTML_CONTENT_TYPES: [&str; 2] = ["text/html", "application/xhtml+xml"];
const OEMBED_ACCEPT: &str = "application/json,text/json;q=0.9,*/*;q=0.1";

/// A single outgoing GET request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub url: Url,
    pub headers: HeaderMap,
    pub max_body_bytes: usize,
}

#[derive(Debug, Clone, Default)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    fn content_type(&self) -> String {
        self.header(CONTENT_TYPE.as_str()).unwrap_or_default().to_string()
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("{0}")]
    Network(String),

    #[error("response body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },
}

/// The HTTP layer under the fetcher.
///
/// Implementations must not follow redirects: 3xx responses are returned as-is
/// so that every hop passes through the URL guard. Timeouts are applied by the
/// caller.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

/// [`Transport`] backed by `reqwest` with redirects disabled.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self, OgieError> {
        let client = Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .pool_max_idle_per_host(10)
            .build()
            .map_err(|e| OgieError::fetch("", format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }

    /// Wraps an existing client. The client must be built with
    /// `redirect::Policy::none()`, otherwise redirect targets escape validation.
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut response = self
            .client
            .get(request.url)
            .headers(request.headers)
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        let status = response.status();
        let headers = response.headers().clone();
        if status.is_redirection() {
            return Ok(HttpResponse {
                status: status.as_u16(),
                headers,
                body: Vec::new(),
            });
        }

        let limit = request.max_body_bytes;
        if response.content_length().is_some_and(|len| len > limit as u64) {
            return Err(TransportError::BodyTooLarge { limit });
        }

        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?
        {
            if body.len() + chunk.len() > limit {
                return Err(TransportError::BodyTooLarge { limit });
            }
            body.extend_from_slice(&chunk);
        }

        Ok(HttpResponse {
            status: status.as_u16(),
            headers,
            body,
        })
    }
}

/// Outcome of a successful document fetch.
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub html: String,
    pub final_url: String,
    pub status_code: u16,
    pub content_type: String,
    pub charset: Option<CharsetInfo>,
}

/// Fetches documents with per-hop URL validation, timeouts and content-type checks.
#[derive(Clone)]
pub struct Fetcher {
    transport: Arc<dyn Transport>,
}

impl Fetcher {
    pub fn new() -> Result<Self, OgieError> {
        debug!("Fetcher initialized with reqwest transport");
        Ok(Self::with_transport(ReqwestTransport::new()?))
    }

    pub fn with_client(client: Client) -> Self {
        Self::with_transport(ReqwestTransport::with_client(client))
    }

    pub fn with_transport(transport: impl Transport + 'static) -> Self {
        Self {
            transport: Arc::new(transport),
        }
    }

    /// Fetches an HTML document, following up to `max_redirects` redirects.
    #[instrument(level = "debug", skip(self, options), err)]
    pub async fn fetch(&self, url: &str, options: &ExtractOptions) -> Result<FetchResult, OgieError> {
        let (final_url, response) = self.follow(url, options, DEFAULT_ACCEPT).await?;
        let final_url = final_url.to_string();

        if !(200..300).contains(&response.status) {
            return Err(OgieError::http_status(final_url, response.status));
        }

        let content_type = response.content_type();
        let lowered = content_type.to_ascii_lowercase();
        if !HTML_CONTENT_TYPES.iter().any(|t| lowered.contains(t)) {
            return Err(OgieError::fetch(
                final_url,
                format!("unsupported content type '{content_type}'"),
            ));
        }

        let (html, charset) = if options.convert_charset {
            let (html, info) = charset::detect_and_decode(&response.body, Some(&content_type));
            debug!(charset = %info.charset, source = info.source.as_str(), "Resolved document charset");
            (html, Some(info))
        } else {
            (String::from_utf8_lossy(&response.body).into_owned(), None)
        };

        debug!(url = %final_url, content_length = html.len(), "Successfully fetched document");
        Ok(FetchResult {
            html,
            final_url,
            status_code: response.status,
            content_type,
            charset,
        })
    }

    /// Fetches and validates an oEmbed JSON document through the same secure
    /// redirect loop as [`Fetcher::fetch`].
    #[instrument(level = "debug", skip(self, options), err)]
    pub async fn fetch_oembed(&self, url: &str, options: &ExtractOptions) -> Result<OEmbed, OgieError> {
        let (final_url, response) = self.follow(url, options, OEMBED_ACCEPT).await?;
        let final_url = final_url.to_string();

        if !(200..300).contains(&response.status) {
            return Err(OgieError::http_status(final_url, response.status));
        }

        let content_type = response.content_type();
        if !content_type.to_ascii_lowercase().contains("json") {
            return Err(OgieError::fetch(
                final_url,
                format!("unsupported oEmbed content type '{content_type}'"),
            ));
        }

        serde_json::from_slice(&response.body)
            .map_err(|e| OgieError::parse(final_url, format!("invalid oEmbed response: {e}")))
    }

    /// Issues requests until a non-redirect response arrives. At most
    /// `max_redirects + 1` requests are sent.
    async fn follow(
        &self,
        url: &str,
        options: &ExtractOptions,
        accept: &str,
    ) -> Result<(Url, HttpResponse), OgieError> {
        let guard = UrlGuard::new(options.allow_private_urls);
        let mut current = guard.validate(url)?;
        let headers = build_headers(options, accept, url)?;
        let mut redirects = 0;

        loop {
            debug!(url = %current, hop = redirects, "Sending request");
            let response = self
                .send_once(
                    HttpRequest {
                        url: current.clone(),
                        headers: headers.clone(),
                        max_body_bytes: options.max_content_length,
                    },
                    options,
                )
                .await?;

            if !is_redirect(response.status) {
                return Ok((current, response));
            }

            let location = response.header(LOCATION.as_str()).ok_or_else(|| {
                OgieError::fetch(
                    current.as_str(),
                    format!("redirect status {} without Location header", response.status),
                )
            })?;

            if redirects >= options.max_redirects {
                warn!(url = %url, max_redirects = options.max_redirects, "Redirect limit reached");
                return Err(OgieError::RedirectLimit {
                    url: url.to_string(),
                    max_redirects: options.max_redirects,
                });
            }
            let next = current
                .join(location)
                .map_err(|e| OgieError::invalid_url(location, format!("invalid redirect target: {e}")))?;
            guard.validate_parsed(&next)?;

            debug!(from = %current, to = %next, "Following redirect");
            current = next;
            redirects += 1;
        }
    }

    async fn send_once(
        &self,
        request: HttpRequest,
        options: &ExtractOptions,
    ) -> Result<HttpResponse, OgieError> {
        let url = request.url.to_string();
        let attempt = tokio::time::timeout(options.timeout, self.transport.send(request));

        let outcome = match &options.cancellation {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => {
                    return Err(OgieError::fetch(url, "request cancelled"));
                }
                outcome = attempt => outcome,
            },
            None => attempt.await,
        };

        match outcome {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(OgieError::fetch(url, e.to_string())),
            Err(_) => Err(OgieError::Timeout {
                url,
                timeout_ms: options.timeout.as_millis() as u64,
            }),
        }
    }
}

fn is_redirect(status: u16) -> bool {
    matches!(status, 301 | 302 | 303 | 307 | 308)
}

fn build_headers(options: &ExtractOptions, accept: &str, url: &str) -> Result<HeaderMap, OgieError> {
    let invalid = |name: &str| OgieError::fetch(url, format!("invalid request header '{name}'"));

    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_str(accept).map_err(|_| invalid("Accept"))?);
    headers.insert(
        USER_AGENT,
        HeaderValue::from_str(&options.user_agent).map_err(|_| invalid("User-Agent"))?,
    );
    for (name, value) in &options.headers {
        let header_name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| invalid(name))?;
        let header_value = HeaderValue::from_str(value).map_err(|_| invalid(name))?;
        headers.insert(header_name, header_value);
    }
    Ok(headers)
}
