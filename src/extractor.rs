use crate::types::{
    Article, BasicMetadata, FeedKind, FeedLink, JsonLdItem, OEmbedEndpoint, OgMedia, OpenGraph,
    TwitterCard,
};
use crate::{Metadata, OgieError};
use scraper::{ElementRef, Html, Selector};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use tracing::debug;
use url::Url;

/// Metadata extractor, responsible for turning a parsed document into [`Metadata`].
///
/// Extraction is pure: it never performs I/O. URLs found in the document are
/// resolved against the base URL when one is given.
#[derive(Clone, Default)]
pub struct MetadataExtractor;

impl MetadataExtractor {
    pub fn new() -> Self {
        Self
    }

    /// Parses `html` and extracts its metadata.
    pub fn extract(
        &self,
        html: &str,
        base_url: Option<&str>,
        only_open_graph: bool,
    ) -> Result<Metadata, OgieError> {
        let url_label = base_url.unwrap_or_default();
        if html.trim().is_empty() {
            return Err(OgieError::parse(url_label, "empty document"));
        }
        let base = base_url
            .map(|b| {
                Url::parse(b).map_err(|e| OgieError::parse(url_label, format!("invalid base URL: {e}")))
            })
            .transpose()?;

        let document = Html::parse_document(html);
        self.extract_document(&document, base.as_ref(), only_open_graph)
    }

    pub fn extract_document(
        &self,
        document: &Html,
        base: Option<&Url>,
        only_open_graph: bool,
    ) -> Result<Metadata, OgieError> {
        let label = base.map(Url::as_str).unwrap_or_default();
        let metas = collect_meta(document, label)?;
        let open_graph = extract_open_graph(&metas, base);

        let mut metadata = Metadata {
            url: base.map(Url::to_string),
            open_graph,
            ..Default::default()
        };
        if only_open_graph {
            return Ok(metadata);
        }

        metadata.basic = extract_basic(document, &metas, base, label)?;
        metadata.twitter = extract_twitter(&metas, base);
        metadata.article = extract_article(&metas);
        metadata.json_ld = extract_json_ld(document, label)?;
        metadata.feeds = extract_feeds(document, base, label)?;
        metadata.oembed_endpoints = extract_oembed_endpoints(document, base, label)?;

        debug!(
            title = ?metadata.basic.title,
            og_title = ?metadata.open_graph.title,
            json_ld = metadata.json_ld.len(),
            "Metadata extraction results"
        );
        Ok(metadata)
    }
}

fn selector(css: &str, url: &str) -> Result<Selector, OgieError> {
    Selector::parse(css).map_err(|e| OgieError::parse(url, format!("invalid selector '{css}': {e:?}")))
}

fn resolve(base: Option<&Url>, href: &str) -> String {
    let href = href.trim();
    base.and_then(|b| b.join(href).ok())
        .map(|u| u.to_string())
        .unwrap_or_else(|| href.to_string())
}

fn text_of(element: ElementRef<'_>) -> Option<String> {
    let text = element.text().collect::<String>();
    let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
    (!text.is_empty()).then_some(text)
}

/// `(key, content)` for every `<meta>` with a property/name/itemprop, in document order.
fn collect_meta(document: &Html, url: &str) -> Result<Vec<(String, String)>, OgieError> {
    let meta = selector("meta", url)?;
    Ok(document
        .select(&meta)
        .filter_map(|el| {
            let attrs = el.value();
            let key = attrs
                .attr("property")
                .or_else(|| attrs.attr("name"))
                .or_else(|| attrs.attr("itemprop"))?;
            let content = attrs.attr("content")?.trim();
            (!content.is_empty()).then(|| (key.trim().to_ascii_lowercase(), content.to_string()))
        })
        .collect())
}

fn first<'a>(metas: &'a [(String, String)], key: &str) -> Option<&'a str> {
    metas
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

fn all(metas: &[(String, String)], key: &str) -> Vec<String> {
    metas
        .iter()
        .filter(|(k, _)| k == key)
        .map(|(_, v)| v.clone())
        .collect()
}

fn extract_open_graph(metas: &[(String, String)], base: Option<&Url>) -> OpenGraph {
    let owned = |key: &str| first(metas, key).map(str::to_string);

    OpenGraph {
        title: owned("og:title"),
        og_type: owned("og:type"),
        url: first(metas, "og:url").map(|u| resolve(base, u)),
        description: owned("og:description"),
        site_name: owned("og:site_name"),
        locale: owned("og:locale"),
        locale_alternate: all(metas, "og:locale:alternate"),
        determiner: owned("og:determiner"),
        images: structured_media(metas, "og:image", base),
        videos: structured_media(metas, "og:video", base),
        audio: structured_media(metas, "og:audio", base),
    }
}

/// Groups `og:image`, `og:image:width`, ... into entries. A new root tag starts
/// a new entry; structured properties apply to the most recent one.
fn structured_media(metas: &[(String, String)], root: &str, base: Option<&Url>) -> Vec<OgMedia> {
    let mut media: Vec<OgMedia> = Vec::new();

    for (key, content) in metas {
        let Some(rest) = key.strip_prefix(root) else {
            continue;
        };
        match rest {
            "" => media.push(OgMedia {
                url: resolve(base, content),
                ..Default::default()
            }),
            ":url" => {
                let url = resolve(base, content);
                match media.last_mut() {
                    Some(last) if last.url.is_empty() => last.url = url,
                    Some(last) if last.url == url => {}
                    _ => media.push(OgMedia {
                        url,
                        ..Default::default()
                    }),
                }
            }
            _ => {
                let Some(last) = media.last_mut() else {
                    continue;
                };
                match rest {
                    ":secure_url" => last.secure_url = Some(resolve(base, content)),
                    ":type" => last.mime_type = Some(content.clone()),
                    ":width" => last.width = content.parse().ok(),
                    ":height" => last.height = content.parse().ok(),
                    ":alt" => last.alt = Some(content.clone()),
                    _ => {}
                }
            }
        }
    }

    media.retain(|m| !m.url.is_empty());
    media
}

fn extract_twitter(metas: &[(String, String)], base: Option<&Url>) -> Option<TwitterCard> {
    let owned = |key: &str| first(metas, key).map(str::to_string);
    let card = TwitterCard {
        card: owned("twitter:card"),
        site: owned("twitter:site"),
        creator: owned("twitter:creator"),
        title: owned("twitter:title"),
        description: owned("twitter:description"),
        image: first(metas, "twitter:image")
            .or_else(|| first(metas, "twitter:image:src"))
            .map(|u| resolve(base, u)),
        image_alt: owned("twitter:image:alt"),
    };
    (card != TwitterCard::default()).then_some(card)
}

fn extract_article(metas: &[(String, String)]) -> Option<Article> {
    let owned = |key: &str| first(metas, key).map(str::to_string);
    let article = Article {
        published_time: owned("article:published_time"),
        modified_time: owned("article:modified_time"),
        expiration_time: owned("article:expiration_time"),
        authors: all(metas, "article:author"),
        section: owned("article:section"),
        tags: all(metas, "article:tag"),
    };
    (article != Article::default()).then_some(article)
}

fn extract_basic(
    document: &Html,
    metas: &[(String, String)],
    base: Option<&Url>,
    url: &str,
) -> Result<BasicMetadata, OgieError> {
    let title = document
        .select(&selector("title", url)?)
        .next()
        .and_then(text_of);

    let canonical_url = document
        .select(&selector("link[rel~='canonical'][href]", url)?)
        .next()
        .and_then(|el| el.value().attr("href"))
        .map(|href| resolve(base, href));

    let favicon = document
        .select(&selector("link[rel~='icon'][href]", url)?)
        .next()
        .and_then(|el| el.value().attr("href"))
        .map(|href| resolve(base, href))
        .or_else(|| base.and_then(|b| b.join("/favicon.ico").ok()).map(|u| u.to_string()));

    let language = document
        .select(&selector("html[lang]", url)?)
        .next()
        .and_then(|el| el.value().attr("lang"))
        .map(|lang| lang.trim().to_string())
        .filter(|lang| !lang.is_empty());

    let keywords = first(metas, "keywords")
        .map(|k| {
            k.split(',')
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    Ok(BasicMetadata {
        title,
        description: first(metas, "description").map(str::to_string),
        keywords,
        author: first(metas, "author").map(str::to_string),
        canonical_url,
        favicon,
        language,
        theme_color: first(metas, "theme-color").map(str::to_string),
    })
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::One(one) => vec![one],
            OneOrMany::Many(many) => many,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ImageRef {
    Url(String),
    Object { url: String },
}

/// Keeps a field only when it has the expected shape.
fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).ok())
}

#[derive(Deserialize)]
struct JsonLdNode {
    #[serde(rename = "@type", default, deserialize_with = "lenient")]
    types: Option<OneOrMany<String>>,
    #[serde(default, deserialize_with = "lenient")]
    name: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    headline: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    description: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    url: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    image: Option<OneOrMany<ImageRef>>,
}

fn json_ld_item(raw: serde_json::Value) -> Option<JsonLdItem> {
    if !raw.is_object() {
        return None;
    }
    let node: JsonLdNode = serde_json::from_value(raw.clone()).ok()?;
    let image = node
        .image
        .map(OneOrMany::into_vec)
        .and_then(|images| images.into_iter().next())
        .map(|image| match image {
            ImageRef::Url(url) | ImageRef::Object { url } => url,
        });

    Some(JsonLdItem {
        types: node.types.map(OneOrMany::into_vec).unwrap_or_default(),
        name: node.name,
        headline: node.headline,
        description: node.description,
        url: node.url,
        image,
        raw,
    })
}

fn extract_json_ld(document: &Html, url: &str) -> Result<Vec<JsonLdItem>, OgieError> {
    let scripts = selector("script[type='application/ld+json']", url)?;
    let mut items = Vec::new();

    for script in document.select(&scripts) {
        let source = script.text().collect::<String>();
        let value: serde_json::Value = match serde_json::from_str(source.trim()) {
            Ok(value) => value,
            Err(e) => {
                debug!(error = %e, "Skipping invalid JSON-LD block");
                continue;
            }
        };

        let nodes = match value {
            serde_json::Value::Array(nodes) => nodes,
            serde_json::Value::Object(mut object) => match object.remove("@graph") {
                Some(serde_json::Value::Array(graph)) => graph,
                Some(other) => {
                    object.insert("@graph".to_string(), other);
                    vec![serde_json::Value::Object(object)]
                }
                None => vec![serde_json::Value::Object(object)],
            },
            _ => continue,
        };
        items.extend(nodes.into_iter().filter_map(json_ld_item));
    }

    Ok(items)
}

fn extract_feeds(document: &Html, base: Option<&Url>, url: &str) -> Result<Vec<FeedLink>, OgieError> {
    let links = selector("link[rel~='alternate'][href][type]", url)?;

    Ok(document
        .select(&links)
        .filter_map(|el| {
            let attrs = el.value();
            let kind = match attrs.attr("type")?.trim().to_ascii_lowercase().as_str() {
                "application/rss+xml" => FeedKind::Rss,
                "application/atom+xml" => FeedKind::Atom,
                "application/feed+json" => FeedKind::Json,
                _ => return None,
            };
            Some(FeedLink {
                url: resolve(base, attrs.attr("href")?),
                kind,
                title: attrs.attr("title").map(str::to_string),
            })
        })
        .collect())
}

fn extract_oembed_endpoints(
    document: &Html,
    base: Option<&Url>,
    url: &str,
) -> Result<Vec<OEmbedEndpoint>, OgieError> {
    let links = selector("link[type][href]", url)?;

    Ok(document
        .select(&links)
        .filter(|el| {
            el.value()
                .attr("type")
                .is_some_and(|t| t.trim().eq_ignore_ascii_case("application/json+oembed"))
        })
        .filter_map(|el| {
            let attrs = el.value();
            Some(OEmbedEndpoint {
                url: resolve(base, attrs.attr("href")?),
                title: attrs.attr("title").map(str::to_string),
            })
        })
        .collect())
}
