use serde::{Deserialize, Serialize};

/// Everything extracted from a single document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    /// Final URL of the document (after redirects), or the base URL for direct HTML.
    pub url: Option<String>,
    pub basic: BasicMetadata,
    pub open_graph: OpenGraph,
    pub twitter: Option<TwitterCard>,
    pub article: Option<Article>,
    pub json_ld: Vec<JsonLdItem>,
    pub feeds: Vec<FeedLink>,
    pub oembed_endpoints: Vec<OEmbedEndpoint>,
    pub oembed: Option<OEmbed>,
    /// Charset name the document was decoded with, when charset conversion ran.
    pub charset: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BasicMetadata {
    pub title: Option<String>,
    pub description: Option<String>,
    pub keywords: Vec<String>,
    pub author: Option<String>,
    pub canonical_url: Option<String>,
    pub favicon: Option<String>,
    pub language: Option<String>,
    pub theme_color: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OpenGraph {
    pub title: Option<String>,
    #[serde(rename = "type")]
    pub og_type: Option<String>,
    pub url: Option<String>,
    pub description: Option<String>,
    pub site_name: Option<String>,
    pub locale: Option<String>,
    pub locale_alternate: Vec<String>,
    pub determiner: Option<String>,
    pub images: Vec<OgMedia>,
    pub videos: Vec<OgMedia>,
    pub audio: Vec<OgMedia>,
}

impl OpenGraph {
    pub fn is_empty(&self) -> bool {
        *self == OpenGraph::default()
    }
}

/// An `og:image`, `og:video` or `og:audio` entry with its structured properties.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OgMedia {
    pub url: String,
    pub secure_url: Option<String>,
    #[serde(rename = "type")]
    pub mime_type: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub alt: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TwitterCard {
    pub card: Option<String>,
    pub site: Option<String>,
    pub creator: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub image: Option<String>,
    pub image_alt: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Article {
    pub published_time: Option<String>,
    pub modified_time: Option<String>,
    pub expiration_time: Option<String>,
    pub authors: Vec<String>,
    pub section: Option<String>,
    pub tags: Vec<String>,
}

/// A validated JSON-LD node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JsonLdItem {
    pub types: Vec<String>,
    pub name: Option<String>,
    pub headline: Option<String>,
    pub description: Option<String>,
    pub url: Option<String>,
    pub image: Option<String>,
    pub raw: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedKind {
    Rss,
    Atom,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedLink {
    pub url: String,
    pub kind: FeedKind,
    pub title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OEmbedEndpoint {
    pub url: String,
    pub title: Option<String>,
}

/// An oEmbed response, validated against its `type` tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OEmbed {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub author_name: Option<String>,
    #[serde(default)]
    pub author_url: Option<String>,
    #[serde(default)]
    pub provider_name: Option<String>,
    #[serde(default)]
    pub provider_url: Option<String>,
    #[serde(default)]
    pub thumbnail_url: Option<String>,
    #[serde(flatten)]
    pub kind: OEmbedKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OEmbedKind {
    Photo {
        url: String,
        #[serde(default)]
        width: Option<serde_json::Value>,
        #[serde(default)]
        height: Option<serde_json::Value>,
    },
    Video {
        html: String,
        #[serde(default)]
        width: Option<serde_json::Value>,
        #[serde(default)]
        height: Option<serde_json::Value>,
    },
    Rich {
        html: String,
        #[serde(default)]
        width: Option<serde_json::Value>,
        #[serde(default)]
        height: Option<serde_json::Value>,
    },
    Link,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oembed_tagged_decoding() {
        let json = r#"{
            "version": "1.0",
            "type": "video",
            "title": "A talk",
            "provider_name": "Tube",
            "html": "<iframe></iframe>",
            "width": 640,
            "height": "360"
        }"#;
        let oembed: OEmbed = serde_json::from_str(json).unwrap();
        assert_eq!(oembed.title.as_deref(), Some("A talk"));
        match oembed.kind {
            OEmbedKind::Video { html, .. } => assert_eq!(html, "<iframe></iframe>"),
            other => panic!("unexpected kind: {other:?}"),
        }
    }

    #[test]
    fn test_oembed_rejects_missing_required_fields() {
        // A photo without its url is not a valid oEmbed photo.
        let json = r#"{"type": "photo", "width": 10, "height": 10}"#;
        assert!(serde_json::from_str::<OEmbed>(json).is_err());

        let json = r#"{"type": "unknown"}"#;
        assert!(serde_json::from_str::<OEmbed>(json).is_err());
    }
}
