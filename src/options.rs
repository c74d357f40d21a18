use crate::cache::Cache;
use crate::Metadata;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(10_000);
pub const DEFAULT_MAX_REDIRECTS: usize = 5;
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (compatible; ogie/0.1; +metadata-extractor)";
pub const DEFAULT_ACCEPT: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8";
pub const DEFAULT_MAX_CONTENT_LENGTH: usize = 10 * 1024 * 1024;

/// Per-call configuration for [`crate::extract`] and friends.
#[derive(Debug, Clone)]
pub struct ExtractOptions {
    /// Hard limit for each HTTP attempt, including reading the body.
    pub timeout: Duration,
    pub max_redirects: usize,
    pub user_agent: String,
    /// Extra request headers; these override the defaults.
    pub headers: BTreeMap<String, String>,
    /// Base for resolving relative URLs in direct HTML extraction.
    pub base_url: Option<String>,
    pub only_open_graph: bool,
    pub allow_private_urls: bool,
    pub fetch_oembed: bool,
    pub convert_charset: bool,
    pub cache: Option<Cache<Metadata>>,
    /// Skip the cache lookup but still store the fresh result.
    pub bypass_cache: bool,
    pub max_content_length: usize,
    pub cancellation: Option<CancellationToken>,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            max_redirects: DEFAULT_MAX_REDIRECTS,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            headers: BTreeMap::new(),
            base_url: None,
            only_open_graph: false,
            allow_private_urls: false,
            fetch_oembed: false,
            convert_charset: false,
            cache: None,
            bypass_cache: false,
            max_content_length: DEFAULT_MAX_CONTENT_LENGTH,
            cancellation: None,
        }
    }
}

impl ExtractOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_redirects(mut self, max_redirects: usize) -> Self {
        self.max_redirects = max_redirects;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_only_open_graph(mut self, only_open_graph: bool) -> Self {
        self.only_open_graph = only_open_graph;
        self
    }

    pub fn with_allow_private_urls(mut self, allow: bool) -> Self {
        self.allow_private_urls = allow;
        self
    }

    pub fn with_fetch_oembed(mut self, fetch_oembed: bool) -> Self {
        self.fetch_oembed = fetch_oembed;
        self
    }

    pub fn with_convert_charset(mut self, convert_charset: bool) -> Self {
        self.convert_charset = convert_charset;
        self
    }

    pub fn with_cache(mut self, cache: Cache<Metadata>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn without_cache(mut self) -> Self {
        self.cache = None;
        self
    }

    pub fn with_bypass_cache(mut self, bypass: bool) -> Self {
        self.bypass_cache = bypass;
        self
    }

    pub fn with_max_content_length(mut self, bytes: usize) -> Self {
        self.max_content_length = bytes;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}
