//! Derived-field extraction for history rows.

/// Maximum title length kept before truncation.
const MAX_TITLE_LEN: usize = 200;

/// Maximum extension length; anything longer is not a real extension.
const MAX_EXTENSION_LEN: usize = 10;

/// Reduces a Content-Type header to a coarse category for the history table.
///
/// # Examples
///
/// ```
/// use snare_core::extract::mime_category;
///
/// assert_eq!(mime_category("text/html; charset=utf-8"), "html");
/// assert_eq!(mime_category("application/json"), "json");
/// assert_eq!(mime_category("image/png"), "image");
/// assert_eq!(mime_category(""), "");
/// ```
pub fn mime_category(content_type: &str) -> String {
    let main = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();

    let category = match main.as_str() {
        "" => "",
        "text/html" => "html",
        "text/css" => "css",
        "application/javascript" | "text/javascript" => "javascript",
        "application/xml" | "text/xml" => "xml",
        m if m.starts_with("application/json") => "json",
        m if m.starts_with("text/") => "text",
        m if m.starts_with("image/") => "image",
        m if m.starts_with("video/") => "video",
        m if m.starts_with("audio/") => "audio",
        m if m.starts_with("application/") => "application",
        other => return other.to_string(),
    };
    category.to_string()
}

/// Extracts the lower-cased file extension of the last path segment.
///
/// Query strings and fragments are ignored.
pub fn extract_extension(path: &str) -> String {
    let path = path.split(['?', '#']).next().unwrap_or("");
    let filename = path.rsplit('/').next().unwrap_or("");

    match filename.rfind('.') {
        Some(idx) if idx + 1 < filename.len() => {
            let ext = &filename[idx + 1..];
            if ext.len() <= MAX_EXTENSION_LEN {
                ext.to_ascii_lowercase()
            } else {
                String::new()
            }
        }
        _ => String::new(),
    }
}

/// Extracts the `<title>` of an HTML body.
///
/// Returns an empty string for non-HTML content types. Whitespace runs are
/// collapsed and long titles are truncated.
pub fn extract_title(body: &str, content_type: &str) -> String {
    if !content_type.to_ascii_lowercase().contains("html") || body.is_empty() {
        return String::new();
    }

    // ASCII lowercasing keeps byte offsets aligned with `body`.
    let lower = body.to_ascii_lowercase();
    let Some(tag_start) = lower.find("<title") else {
        return String::new();
    };
    let Some(open_end) = lower[tag_start..].find('>') else {
        return String::new();
    };
    let content_start = tag_start + open_end + 1;
    let Some(close) = lower[content_start..].find("</title>") else {
        return String::new();
    };

    let raw = &body[content_start..content_start + close];
    let title = raw.split_whitespace().collect::<Vec<_>>().join(" ");

    if title.chars().count() > MAX_TITLE_LEN {
        let truncated: String = title.chars().take(MAX_TITLE_LEN).collect();
        format!("{}...", truncated)
    } else {
        title
    }
}

/// Returns true if a body with this Content-Type is worth decoding as text.
///
/// Unknown and `application/octet-stream` types are treated as text so that
/// untyped API responses still get decoded.
pub fn is_text_content(content_type: &str) -> bool {
    let ct = content_type.to_ascii_lowercase();
    let ct = ct.trim();
    ct.is_empty()
        || ct == "application/octet-stream"
        || ct.contains("text/")
        || ct.contains("application/json")
        || ct.contains("application/xml")
        || ct.contains("application/javascript")
        || ct.contains("application/x-www-form-urlencoded")
        || ct.contains("+json")
        || ct.contains("+xml")
}

/// Splits `host:port`, handling bracketed and bare IPv6 addresses.
///
/// # Examples
///
/// ```
/// use snare_core::extract::split_host_port;
///
/// assert_eq!(split_host_port("example.com:8080"), ("example.com", Some("8080")));
/// assert_eq!(split_host_port("[::1]:443"), ("::1", Some("443")));
/// assert_eq!(split_host_port("::1"), ("::1", None));
/// assert_eq!(split_host_port("example.com"), ("example.com", None));
/// ```
pub fn split_host_port(address: &str) -> (&str, Option<&str>) {
    if let Some(rest) = address.strip_prefix('[') {
        return match rest.split_once(']') {
            Some((host, tail)) => (host, tail.strip_prefix(':').filter(|p| !p.is_empty())),
            None => (address, None),
        };
    }

    // More than one colon without brackets: a bare IPv6 address.
    if address.matches(':').count() > 1 {
        return (address, None);
    }

    match address.rsplit_once(':') {
        Some((host, port)) => (host, Some(port)),
        None => (address, None),
    }
}
