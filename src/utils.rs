use unicode_width::UnicodeWidthChar;

use url::{Host, Url};

/// Safely truncate a string, ensuring it is not truncated in the middle of multi-byte characters
///
/// This function will:
/// 1. Correctly handle Unicode characters (including Chinese, emoji, etc.)
/// 2. Add ellipsis when maximum length is reached
/// 3. Ensure the output string's display width does not exceed the specified length
pub fn truncate_str(s: &str, max_width: usize) -> String {
    use unicode_width::UnicodeWidthStr;

    if s.width() <= max_width {
        return s.to_string();
    }

    let mut result = String::new();
    let mut current_width = 0;

    for c in s.chars() {
        let char_width = c.width().unwrap_or(1);

        if current_width + char_width + 3 > max_width {
            break;
        }

        result.push(c);
        current_width += char_width;
    }

    result.push_str("...");
    result
}

/// The domain used to group per-domain limits.
///
/// IP literals stand alone. Other hosts are cut down to their registrable
/// domain under the public suffix list, so `a.github.io` and `b.github.io`
/// stay apart while `news.bbc.co.uk` becomes `bbc.co.uk`. Hosts with no
/// registrable part, such as `localhost`, are kept whole. Unparseable input
/// is returned lower-cased so that each such URL forms its own group.
pub fn registrable_domain(url: &str) -> String {
    let Some(host) = Url::parse(url.trim()).ok().and_then(|u| u.host().map(|h| h.to_owned())) else {
        return url.trim().to_lowercase();
    };

    let domain = match host {
        Host::Domain(domain) => domain.trim_end_matches('.').to_ascii_lowercase(),
        Host::Ipv4(ip) => return ip.to_string(),
        Host::Ipv6(ip) => return ip.to_string(),
    };

    psl::domain_str(&domain)
        .map(str::to_string)
        .unwrap_or(domain)
}
