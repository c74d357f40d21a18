//! Metadata extraction for web pages: Open Graph, Twitter cards, JSON-LD,
//! feeds and oEmbed, behind an SSRF-aware fetcher with charset detection,
//! an optional result cache and a polite bulk scheduler.

mod cache;
pub mod charset;
mod error;
mod extract_service;
mod extractor;
mod fetcher;
#[cfg(feature = "logging")]
mod logging;
mod options;
mod scheduler;
pub mod security;
mod types;
mod utils;

pub use cache::{
    create_cache, generate_cache_key, normalize_url, Cache, CacheOptions, CacheStats,
    EvictionListener, DEFAULT_CACHE_MAX_SIZE, DEFAULT_CACHE_TTL,
};
pub use charset::{CharsetInfo, CharsetSource};
pub use error::OgieError;
pub use extract_service::ExtractService;
pub use extractor::MetadataExtractor;
pub use fetcher::{
    FetchResult, Fetcher, HttpRequest, HttpResponse, ReqwestTransport, Transport, TransportError,
};
#[cfg(feature = "logging")]
pub use logging::{log_error_card, log_metadata_card, setup_logging, LogConfig, LogLevelGuard};
pub use options::{
    ExtractOptions, DEFAULT_ACCEPT, DEFAULT_MAX_CONTENT_LENGTH, DEFAULT_MAX_REDIRECTS,
    DEFAULT_TIMEOUT, DEFAULT_USER_AGENT,
};
pub use scheduler::{
    BulkItem, BulkOptions, BulkOutcome, BulkProgress, BulkResult, BulkScheduler, BulkStats,
    ProgressCallback, SchedulerSnapshot, DEFAULT_CONCURRENCY, DEFAULT_CONCURRENCY_PER_DOMAIN,
    DEFAULT_MIN_DELAY_PER_DOMAIN, DEFAULT_REQUESTS_PER_MINUTE,
};
pub use security::{is_private_url, validate_url, UrlGuard};
pub use types::{
    Article, BasicMetadata, FeedKind, FeedLink, JsonLdItem, Metadata, OEmbed, OEmbedEndpoint,
    OEmbedKind, OgMedia, OpenGraph, TwitterCard,
};
pub use utils::{registrable_domain, truncate_str};

use tokio::sync::OnceCell;

static DEFAULT_SERVICE: OnceCell<ExtractService> = OnceCell::const_new();

async fn default_service() -> Result<&'static ExtractService, OgieError> {
    DEFAULT_SERVICE
        .get_or_try_init(|| async { ExtractService::new() })
        .await
}

/// Fetches `url` and extracts its metadata with a shared default service.
pub async fn extract(url: &str, options: &ExtractOptions) -> Result<Metadata, OgieError> {
    default_service().await?.extract(url, options).await
}

/// Extracts metadata from an HTML string. Relative URLs resolve against
/// `options.base_url`; no network access or caching takes place.
pub fn extract_from_html(html: &str, options: &ExtractOptions) -> Result<Metadata, OgieError> {
    MetadataExtractor::new().extract(html, options.base_url.as_deref(), options.only_open_graph)
}

/// Extracts many URLs under the scheduling limits in `options`.
///
/// Client construction failures are reported on every URL.
pub async fn extract_bulk(urls: Vec<String>, options: &BulkOptions) -> BulkResult<Metadata> {
    match default_service().await {
        Ok(service) => service.extract_bulk(urls, options).await,
        Err(e) => {
            let scheduler = BulkScheduler::new(options.clone());
            scheduler
                .run(urls, move |_url| {
                    let e = e.clone();
                    async move { Err::<Metadata, _>(e) }
                })
                .await
        }
    }
}
