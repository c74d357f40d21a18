//! Character encoding detection and decoding for fetched documents.
//!
//! Detection is ranked and the first source that yields a charset wins:
//! the `Content-Type` header, a byte order mark, a `<meta>` declaration in the
//! document prefix, then the UTF-8 default.

use encoding_rs::{
    Encoding, BIG5, EUC_JP, EUC_KR, GB18030, GBK, IBM866, ISO_2022_JP, ISO_8859_10, ISO_8859_13,
    ISO_8859_14, ISO_8859_15, ISO_8859_16, ISO_8859_2, ISO_8859_3, ISO_8859_4, ISO_8859_5,
    ISO_8859_6, ISO_8859_7, ISO_8859_8, ISO_8859_8_I, KOI8_R, KOI8_U, MACINTOSH, SHIFT_JIS,
    UTF_16BE, UTF_16LE, WINDOWS_1250, WINDOWS_1251, WINDOWS_1252, WINDOWS_1253, WINDOWS_1254,
    WINDOWS_1255, WINDOWS_1256, WINDOWS_1257, WINDOWS_1258, WINDOWS_874, X_MAC_CYRILLIC,
};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;

/// How far into the document `<meta>` declarations are searched for.
pub const META_SCAN_LIMIT: usize = 4096;

pub const DEFAULT_CHARSET: &str = "utf8";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CharsetSource {
    HttpHeader,
    Bom,
    MetaCharset,
    MetaHttpEquiv,
    Default,
}

impl CharsetSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            CharsetSource::HttpHeader => "http-header",
            CharsetSource::Bom => "bom",
            CharsetSource::MetaCharset => "meta-charset",
            CharsetSource::MetaHttpEquiv => "meta-http-equiv",
            CharsetSource::Default => "default",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharsetInfo {
    /// Normalized charset name, e.g. `utf8`, `shiftjis`, `windows1252`.
    pub charset: String,
    pub source: CharsetSource,
}

impl CharsetInfo {
    fn new(charset: impl Into<String>, source: CharsetSource) -> Self {
        Self {
            charset: charset.into(),
            source,
        }
    }
}

/// Lower-cases a charset label and strips quotes, whitespace, `-` and `_`.
pub fn normalize_charset(name: &str) -> String {
    name.trim()
        .trim_matches(|c| c == '"' || c == '\'')
        .chars()
        .filter(|c| !matches!(c, '-' | '_' | ' '))
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Determines the charset of `bytes`.
pub fn detect(bytes: &[u8], content_type: Option<&str>) -> CharsetInfo {
    if let Some(charset) = content_type.and_then(charset_from_content_type) {
        return CharsetInfo::new(charset, CharsetSource::HttpHeader);
    }

    if bytes.len() < 2 {
        return CharsetInfo::new(DEFAULT_CHARSET, CharsetSource::Default);
    }

    if let Some(charset) = sniff_bom(bytes) {
        return CharsetInfo::new(charset, CharsetSource::Bom);
    }

    if let Some(info) = scan_meta(bytes) {
        return info;
    }

    CharsetInfo::new(DEFAULT_CHARSET, CharsetSource::Default)
}

/// Extracts and normalizes the `charset` parameter of a `Content-Type` value.
pub fn charset_from_content_type(content_type: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|param| {
        let (name, value) = param.split_once('=')?;
        if !name.trim().eq_ignore_ascii_case("charset") {
            return None;
        }
        let charset = normalize_charset(value);
        (!charset.is_empty()).then_some(charset)
    })
}

fn sniff_bom(bytes: &[u8]) -> Option<&'static str> {
    match bytes {
        [0xFF, 0xFE, 0x00, 0x00, ..] => Some("utf32le"),
        [0x00, 0x00, 0xFE, 0xFF, ..] => Some("utf32be"),
        [0xEF, 0xBB, 0xBF, ..] => Some("utf8"),
        [0xFF, 0xFE, ..] => Some("utf16le"),
        [0xFE, 0xFF, ..] => Some("utf16be"),
        _ => None,
    }
}

fn scan_meta(bytes: &[u8]) -> Option<CharsetInfo> {
    let prefix = &bytes[..bytes.len().min(META_SCAN_LIMIT)];
    let text = String::from_utf8_lossy(prefix).to_ascii_lowercase();

    let mut rest = text.as_str();
    while let Some(start) = rest.find("<meta") {
        let tag = &rest[start + 5..];
        // `<metadata>` and friends are not meta tags.
        if !tag.starts_with(|c: char| c.is_ascii_whitespace() || c == '/') {
            rest = tag;
            continue;
        }
        let end = tag.find('>').unwrap_or(tag.len());
        let attrs = parse_attributes(&tag[..end]);

        if let Some((_, value)) = attrs.iter().find(|(name, _)| name == "charset") {
            let charset = normalize_charset(value);
            if !charset.is_empty() {
                return Some(CharsetInfo::new(charset, CharsetSource::MetaCharset));
            }
        }

        let is_content_type = attrs
            .iter()
            .any(|(name, value)| name == "http-equiv" && value.trim() == "content-type");
        if is_content_type {
            let charset = attrs
                .iter()
                .find(|(name, _)| name == "content")
                .and_then(|(_, value)| charset_from_content_type(value));
            if let Some(charset) = charset {
                return Some(CharsetInfo::new(charset, CharsetSource::MetaHttpEquiv));
            }
        }

        rest = &tag[end..];
    }
    None
}

/// Minimal attribute tokenizer for the inside of a start tag.
fn parse_attributes(tag: &str) -> Vec<(String, String)> {
    let mut attrs = Vec::new();
    let mut chars = tag.char_indices().peekable();

    loop {
        while chars.next_if(|(_, c)| c.is_ascii_whitespace() || *c == '/').is_some() {}
        let Some(&(name_start, _)) = chars.peek() else {
            break;
        };
        let mut name_end = tag.len();
        while let Some(&(i, c)) = chars.peek() {
            if c == '=' || c.is_ascii_whitespace() || c == '/' {
                name_end = i;
                break;
            }
            chars.next();
        }
        let name = tag[name_start..name_end.min(tag.len())].to_string();

        while chars.next_if(|(_, c)| c.is_ascii_whitespace()).is_some() {}
        if chars.next_if(|(_, c)| *c == '=').is_none() {
            attrs.push((name, String::new()));
            continue;
        }
        while chars.next_if(|(_, c)| c.is_ascii_whitespace()).is_some() {}

        let value = match chars.peek() {
            Some(&(i, quote @ ('"' | '\''))) => {
                chars.next();
                let start = i + 1;
                let mut end = tag.len();
                for (j, c) in chars.by_ref() {
                    if c == quote {
                        end = j;
                        break;
                    }
                }
                tag[start..end].to_string()
            }
            Some(&(start, _)) => {
                let mut end = tag.len();
                while let Some(&(j, c)) = chars.peek() {
                    if c.is_ascii_whitespace() {
                        end = j;
                        break;
                    }
                    chars.next();
                }
                tag[start..end].to_string()
            }
            None => String::new(),
        };
        attrs.push((name, value));
    }
    attrs
}

enum Codec {
    Utf8,
    Latin1,
    Utf32Le,
    Utf32Be,
    Table(&'static Encoding),
}

fn codec_for(label: &str) -> Codec {
    let charset = normalize_charset(label);
    match charset.as_str() {
        "utf8" | "unicode11utf8" => Codec::Utf8,
        "iso88591" | "latin1" | "l1" | "cp819" | "ibm819" | "isoir100" => Codec::Latin1,
        "utf32" | "utf32le" => Codec::Utf32Le,
        "utf32be" => Codec::Utf32Be,
        "utf16" | "utf16le" | "ucs2" => Codec::Table(UTF_16LE),
        "utf16be" => Codec::Table(UTF_16BE),
        "windows1252" | "cp1252" | "usascii" | "ascii" => Codec::Table(WINDOWS_1252),
        "shiftjis" | "sjis" | "mskanji" | "windows31j" | "cp932" | "xsjis" => Codec::Table(SHIFT_JIS),
        "eucjp" => Codec::Table(EUC_JP),
        "euckr" | "cp949" | "windows949" | "ksc56011987" => Codec::Table(EUC_KR),
        "gb2312" | "gbk" | "cp936" | "euccn" | "xgbk" => Codec::Table(GBK),
        "gb18030" => Codec::Table(GB18030),
        "big5" | "big5hkscs" | "cp950" => Codec::Table(BIG5),
        normalized => Encoding::for_label(label.trim().trim_matches(|c| c == '"' || c == '\'').as_bytes())
            .or_else(|| table_by_normalized_name(normalized))
            .or_else(|| Encoding::for_label(normalized.as_bytes()))
            .map(Codec::Table)
            .unwrap_or(Codec::Utf8),
    }
}

/// Finds the `encoding_rs` table whose canonical name normalizes to `normalized`,
/// so that e.g. `windows1251` and `koi8r` resolve like `windows-1251` and `KOI8-R`.
fn table_by_normalized_name(normalized: &str) -> Option<&'static Encoding> {
    let tables: &[&'static Encoding] = &[
        BIG5, EUC_JP, EUC_KR, GB18030, GBK, IBM866, ISO_2022_JP, ISO_8859_10, ISO_8859_13,
        ISO_8859_14, ISO_8859_15, ISO_8859_16, ISO_8859_2, ISO_8859_3, ISO_8859_4, ISO_8859_5,
        ISO_8859_6, ISO_8859_7, ISO_8859_8, ISO_8859_8_I, KOI8_R, KOI8_U, MACINTOSH, SHIFT_JIS,
        UTF_16BE, UTF_16LE, WINDOWS_1250, WINDOWS_1251, WINDOWS_1252, WINDOWS_1253, WINDOWS_1254,
        WINDOWS_1255, WINDOWS_1256, WINDOWS_1257, WINDOWS_1258, WINDOWS_874, X_MAC_CYRILLIC,
    ];
    tables
        .iter()
        .copied()
        .find(|encoding| normalize_charset(encoding.name()) == normalized)
}

/// Decodes `bytes` as `charset`. Unknown charsets decode as UTF-8; malformed
/// sequences become U+FFFD.
pub fn decode(bytes: &[u8], charset: &str) -> String {
    match codec_for(charset) {
        Codec::Utf8 => {
            let body = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]).unwrap_or(bytes);
            String::from_utf8_lossy(body).into_owned()
        }
        Codec::Latin1 => bytes.iter().map(|&b| char::from(b)).collect(),
        Codec::Utf32Le => {
            let body = bytes.strip_prefix(&[0xFF, 0xFE, 0x00, 0x00]).unwrap_or(bytes);
            decode_utf32(body, u32::from_le_bytes)
        }
        Codec::Utf32Be => {
            let body = bytes.strip_prefix(&[0x00, 0x00, 0xFE, 0xFF]).unwrap_or(bytes);
            decode_utf32(body, u32::from_be_bytes)
        }
        Codec::Table(encoding) => {
            let (text, _had_errors) = encoding.decode_with_bom_removal(bytes);
            match text {
                Cow::Borrowed(s) => s.to_string(),
                Cow::Owned(s) => s,
            }
        }
    }
}

fn decode_utf32(bytes: &[u8], to_u32: fn([u8; 4]) -> u32) -> String {
    let chunks = bytes.chunks_exact(4);
    let trailing = !chunks.remainder().is_empty();
    let mut text: String = chunks
        .map(|chunk| {
            let unit = to_u32([chunk[0], chunk[1], chunk[2], chunk[3]]);
            char::from_u32(unit).unwrap_or(char::REPLACEMENT_CHARACTER)
        })
        .collect();
    if trailing {
        text.push(char::REPLACEMENT_CHARACTER);
    }
    text
}

/// Detects the charset of `bytes` and decodes them in one step.
pub fn detect_and_decode(bytes: &[u8], content_type: Option<&str>) -> (String, CharsetInfo) {
    let info = detect(bytes, content_type);
    (decode(bytes, &info.charset), info)
}
