use crate::cache::generate_cache_key;
use crate::extractor::MetadataExtractor;
use crate::fetcher::Fetcher;
use crate::options::ExtractOptions;
use crate::scheduler::{BulkOptions, BulkResult, BulkScheduler};
use crate::{Metadata, OgieError};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// ExtractService wires the fetcher, the extractor and the optional result
/// cache into a single extraction pipeline.
#[derive(Clone)]
pub struct ExtractService {
    fetcher: Arc<Fetcher>,
    extractor: MetadataExtractor,
}

impl ExtractService {
    pub fn new() -> Result<Self, OgieError> {
        Ok(Self::with_fetcher(Fetcher::new()?))
    }

    pub fn with_fetcher(fetcher: Fetcher) -> Self {
        debug!("ExtractService initialized");
        Self {
            fetcher: Arc::new(fetcher),
            extractor: MetadataExtractor::new(),
        }
    }

    pub fn fetcher(&self) -> &Fetcher {
        &self.fetcher
    }

    /// Fetches `url` and extracts its metadata.
    ///
    /// With a cache configured, a fresh entry is returned without any network
    /// access unless `bypass_cache` is set. Successful results are stored
    /// under the key of the requested URL; failures are never cached.
    #[instrument(level = "debug", skip(self, options), err)]
    pub async fn extract(&self, url: &str, options: &ExtractOptions) -> Result<Metadata, OgieError> {
        let cache_key = options
            .cache
            .as_ref()
            .map(|_| generate_cache_key(url, options));

        if let (Some(cache), Some(key)) = (&options.cache, &cache_key) {
            if !options.bypass_cache {
                if let Some(metadata) = cache.get(key) {
                    debug!(url, "Cache hit");
                    return Ok(metadata);
                }
            }
        }

        let fetched = self.fetcher.fetch(url, options).await?;
        let mut metadata =
            self.extractor
                .extract(&fetched.html, Some(&fetched.final_url), options.only_open_graph)?;
        metadata.charset = fetched.charset.as_ref().map(|info| info.charset.clone());

        if options.fetch_oembed && !options.only_open_graph {
            if let Some(endpoint) = metadata.oembed_endpoints.first() {
                match self.fetcher.fetch_oembed(&endpoint.url, options).await {
                    Ok(oembed) => metadata.oembed = Some(oembed),
                    Err(e) => {
                        warn!(endpoint = %endpoint.url, error = %e, "Ignoring failed oEmbed lookup");
                    }
                }
            }
        }

        if let (Some(cache), Some(key)) = (&options.cache, cache_key) {
            cache.set(key, metadata.clone());
        }

        Ok(metadata)
    }

    /// Extracts metadata from HTML that is already in memory. Nothing is
    /// fetched and the cache is not consulted.
    pub fn extract_from_html(&self, html: &str, options: &ExtractOptions) -> Result<Metadata, OgieError> {
        self.extractor
            .extract(html, options.base_url.as_deref(), options.only_open_graph)
    }

    /// Extracts many URLs under the scheduling limits in `options`.
    #[instrument(level = "debug", skip_all, fields(total = urls.len()))]
    pub async fn extract_bulk(&self, urls: Vec<String>, options: &BulkOptions) -> BulkResult<Metadata> {
        let scheduler = BulkScheduler::new(options.clone());
        let extract = Arc::new(options.extract.clone());
        let service = self.clone();

        scheduler
            .run(urls, move |url| {
                let service = service.clone();
                let extract = Arc::clone(&extract);
                async move { service.extract(&url, &extract).await }
            })
            .await
    }
}
