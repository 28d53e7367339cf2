//! Content sanitization for converted output
//!
//! Three pure, total functions. Each is computed to a fixed point (or is
//! stable by construction), so applying one to its own output is a no-op.
//! Callers run these only after `FileValidator` cleared the source file.

use regex::{Captures, Regex};
use std::sync::OnceLock;

/// Schemes a link may use
const LINK_SCHEMES: &[&str] = &["http", "https", "mailto"];

/// Raster image types allowed as `data:` URIs in image positions
const DATA_IMAGE_TYPES: &[&str] = &[
    "image/png",
    "image/jpeg",
    "image/jpg",
    "image/gif",
    "image/webp",
    "image/bmp",
];

/// Placeholder for names that sanitize to nothing
pub const FALLBACK_FILENAME: &str = "unnamed_file";

const MAX_FILENAME_BYTES: usize = 255;
const MAX_EXTENSION_BYTES: usize = 16;

// ---------------------------------------------------------------------------
// URL scheme policy
// ---------------------------------------------------------------------------

fn numeric_entity_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"&#(?:[xX]([0-9a-fA-F]{1,6})|([0-9]{1,7}));?").unwrap())
}

/// Decode the entities a browser would decode before reading the scheme,
/// then drop whitespace and control characters.
fn normalize_url(raw: &str) -> String {
    let decoded = numeric_entity_re().replace_all(raw, |caps: &Captures| {
        let code = match (caps.get(1), caps.get(2)) {
            (Some(hex), _) => u32::from_str_radix(hex.as_str(), 16).ok(),
            (_, Some(dec)) => dec.as_str().parse::<u32>().ok(),
            _ => None,
        };
        code.and_then(char::from_u32)
            .map(String::from)
            .unwrap_or_default()
    });

    let mut named = decoded.into_owned();
    for (entity, ch) in [
        ("&colon;", ":"),
        ("&tab;", "\t"),
        ("&newline;", "\n"),
        ("&sol;", "/"),
        ("&amp;", "&"),
    ] {
        if named.to_ascii_lowercase().contains(entity) {
            named = replace_ignore_ascii_case(&named, entity, ch);
        }
    }

    named
        .chars()
        .filter(|c| !c.is_whitespace() && !c.is_control())
        .collect::<String>()
        .to_ascii_lowercase()
}

fn replace_ignore_ascii_case(haystack: &str, needle: &str, with: &str) -> String {
    let lower = haystack.to_ascii_lowercase();
    let mut out = String::with_capacity(haystack.len());
    let mut last = 0;
    for (start, _) in lower.match_indices(needle) {
        out.push_str(&haystack[last..start]);
        out.push_str(with);
        last = start + needle.len();
    }
    out.push_str(&haystack[last..]);
    out
}

/// Whether a link or image URL may be kept.
///
/// Scheme-less (relative) URLs are allowed. Images may additionally carry
/// raster `data:image/*` URIs.
fn url_allowed(raw: &str, image: bool) -> bool {
    let url = normalize_url(raw);
    let scheme_end = match url.find(':') {
        Some(i) => i,
        None => return true,
    };
    if url[..scheme_end].contains(['/', '?', '#']) {
        return true;
    }

    let scheme = &url[..scheme_end];
    if LINK_SCHEMES.contains(&scheme) {
        return true;
    }
    image && scheme == "data" && is_data_image(&url[scheme_end + 1..])
}

fn is_data_image(rest: &str) -> bool {
    let mime = rest.split([';', ',']).next().unwrap_or_default();
    DATA_IMAGE_TYPES.contains(&mime)
}

// ---------------------------------------------------------------------------
// Markdown
// ---------------------------------------------------------------------------

fn md_script_block_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)<script\b.*?</script\s*>").unwrap())
}

fn md_link_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"(!?)\[([^\[\]\n]*)\]\(\s*<?((?:[^()\s<>]|\([^()\s<>]*\))*)>?(?:\s+(?:"[^"\n]*"|'[^'\n]*'))?\s*\)"#,
        )
        .unwrap()
    })
}

fn md_script_scheme_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)(?:java|vb)script\s*:").unwrap())
}

fn md_data_uri_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\bdata\s*:\s*([a-z0-9.+-]+/[a-z0-9.+-]+)?").unwrap())
}

fn md_event_handler_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(?i)(^|[\s"'/])on[a-z]+\s*="#).unwrap())
}

fn md_autolink_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)<(?:https?|mailto):[^\s<>]*>").unwrap())
}

/// Sanitize markdown text.
///
/// Links and images with a disallowed scheme collapse to their visible
/// text, script blocks and script schemes are removed, non-image `data:`
/// URIs and inline `on*=` handlers are stripped, and every remaining `<`
/// outside an allowed autolink is escaped.
pub fn sanitize_markdown(text: &str) -> String {
    // Each pass either lowers the count of `<` or shortens the text, so
    // this terminates.
    let mut current = text.to_string();
    loop {
        let next = markdown_pass(&current);
        if next == current {
            return current;
        }
        current = next;
    }
}

fn markdown_pass(text: &str) -> String {
    let text = md_script_block_re().replace_all(text, "");

    let text = md_link_re().replace_all(&text, |caps: &Captures| {
        let image = !caps[1].is_empty();
        if url_allowed(&caps[3], image) {
            caps[0].to_string()
        } else {
            caps[2].to_string()
        }
    });

    let text = md_script_scheme_re().replace_all(&text, "");

    let text = md_data_uri_re().replace_all(&text, |caps: &Captures| {
        let keep = caps
            .get(1)
            .map(|mime| DATA_IMAGE_TYPES.contains(&mime.as_str().to_ascii_lowercase().as_str()))
            .unwrap_or(false);
        if keep {
            caps[0].to_string()
        } else {
            String::new()
        }
    });

    let text = md_event_handler_re().replace_all(&text, "$1");

    escape_outside_autolinks(&text)
}

fn escape_outside_autolinks(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for link in md_autolink_re().find_iter(text) {
        out.push_str(&text[last..link.start()].replace('<', "&lt;"));
        out.push_str(link.as_str());
        last = link.end();
    }
    out.push_str(&text[last..].replace('<', "&lt;"));
    out
}

// ---------------------------------------------------------------------------
// HTML
// ---------------------------------------------------------------------------

/// Tags kept in sanitized HTML with their allowed attributes
fn allowed_attributes(tag: &str) -> Option<&'static [&'static str]> {
    let attrs: &'static [&'static str] = match tag {
        "a" => &["href", "title"],
        "img" => &["src", "alt", "title", "width", "height"],
        "td" | "th" => &["colspan", "rowspan"],
        "ol" => &["start"],
        "p" | "br" | "hr" | "b" | "i" | "em" | "strong" | "u" | "s" | "code" | "pre"
        | "blockquote" | "ul" | "li" | "h1" | "h2" | "h3" | "h4" | "h5" | "h6" | "table"
        | "thead" | "tbody" | "tr" | "span" | "div" | "sub" | "sup" | "dl" | "dt" | "dd" => &[],
        _ => return None,
    };
    Some(attrs)
}

/// Elements removed together with everything inside them
fn drops_subtree(tag: &str) -> bool {
    matches!(
        tag,
        "script"
            | "style"
            | "iframe"
            | "object"
            | "embed"
            | "svg"
            | "math"
            | "template"
            | "noscript"
            | "textarea"
    )
}

fn is_void(tag: &str) -> bool {
    matches!(tag, "br" | "hr" | "img")
}

fn entity_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^&(?:#[0-9]{1,7}|#[xX][0-9a-fA-F]{1,6}|[A-Za-z][A-Za-z0-9]{1,31});").unwrap()
    })
}

/// Escape markup characters, keeping well-formed entities intact
fn escape_text(text: &str, out: &mut String) {
    for (i, ch) in text.char_indices() {
        match ch {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '&' if entity_re().is_match(&text[i..]) => out.push('&'),
            '&' => out.push_str("&amp;"),
            _ => out.push(ch),
        }
    }
}

struct Tag<'a> {
    name: String,
    closing: bool,
    attrs: Vec<(String, &'a str)>,
    /// Byte offset just past the closing `>`
    end: usize,
}

/// Parse a tag starting at `start` (which holds `<`). `None` means the
/// `<` does not open a well-formed tag and is treated as text.
fn parse_tag(html: &str, start: usize) -> Option<Tag<'_>> {
    let bytes = html.as_bytes();
    let mut i = start + 1;
    let closing = bytes.get(i) == Some(&b'/');
    if closing {
        i += 1;
    }
    let name_start = i;
    while i < bytes.len() && bytes[i].is_ascii_alphanumeric() {
        i += 1;
    }
    if i == name_start || !bytes[name_start].is_ascii_alphabetic() {
        return None;
    }
    let name = html[name_start..i].to_ascii_lowercase();

    let mut attrs = Vec::new();
    loop {
        while i < bytes.len() && (bytes[i].is_ascii_whitespace() || bytes[i] == b'/') {
            i += 1;
        }
        match bytes.get(i) {
            None => return None,
            Some(b'>') => {
                return Some(Tag {
                    name,
                    closing,
                    attrs,
                    end: i + 1,
                })
            }
            Some(_) => {}
        }

        let attr_start = i;
        while i < bytes.len()
            && !bytes[i].is_ascii_whitespace()
            && !matches!(bytes[i], b'/' | b'>' | b'=')
        {
            i += 1;
        }
        let attr_name = html[attr_start..i].to_ascii_lowercase();
        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }

        let mut value = "";
        if bytes.get(i) == Some(&b'=') {
            i += 1;
            while i < bytes.len() && bytes[i].is_ascii_whitespace() {
                i += 1;
            }
            match bytes.get(i) {
                Some(&quote @ (b'"' | b'\'')) => {
                    let value_start = i + 1;
                    let len = html[value_start..].find(quote as char)?;
                    value = &html[value_start..value_start + len];
                    i = value_start + len + 1;
                }
                Some(_) => {
                    let value_start = i;
                    while i < bytes.len() && !bytes[i].is_ascii_whitespace() && bytes[i] != b'>' {
                        i += 1;
                    }
                    value = &html[value_start..i];
                }
                None => return None,
            }
        }

        if !attr_name.is_empty() {
            attrs.push((attr_name, value));
        }
    }
}

/// Find the end of a dropped element's subtree: just past its matching
/// close tag, or the end of input.
fn skip_subtree(html: &str, from: usize, name: &str) -> usize {
    let lower = html[from..].to_ascii_lowercase();
    let needle = format!("</{}", name);
    let mut search = 0;
    while let Some(found) = lower[search..].find(&needle) {
        let at = from + search + found;
        let after = at + needle.len();
        let boundary = html.as_bytes().get(after).map_or(true, |b| !b.is_ascii_alphanumeric());
        if boundary {
            return match html[after..].find('>') {
                Some(close) => after + close + 1,
                None => html.len(),
            };
        }
        search += found + needle.len();
    }
    html.len()
}

fn write_start_tag(tag: &Tag<'_>, allowed: &[&str], out: &mut String) {
    out.push('<');
    out.push_str(&tag.name);
    let mut seen: Vec<&str> = Vec::new();
    for (name, value) in &tag.attrs {
        if !allowed.contains(&name.as_str()) || seen.contains(&name.as_str()) {
            continue;
        }
        seen.push(name);
        if (name == "href" || name == "src") && !url_allowed(value, tag.name == "img") {
            tracing::debug!(tag = %tag.name, attribute = %name, "Dropping attribute with disallowed URL scheme");
            continue;
        }
        out.push(' ');
        out.push_str(name);
        out.push_str("=\"");
        escape_text(value, out);
        out.push('"');
    }
    out.push('>');
}

/// Sanitize an HTML fragment against the tag and attribute allow-lists.
///
/// Offending nodes are removed individually; the rest of the document is
/// rebuilt in canonical form (lower-case names, double-quoted attributes,
/// balanced tags).
pub fn sanitize_html(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut open: Vec<String> = Vec::new();
    let mut i = 0;
    let mut text_start = 0;

    while let Some(offset) = html[i..].find('<') {
        let lt = i + offset;
        let rest = &html[lt..];

        // comments, doctypes, processing instructions
        let markup_end = if rest.starts_with("<!--") {
            Some(rest[4..].find("-->").map_or(html.len(), |e| lt + 4 + e + 3))
        } else if rest.starts_with("<!") || rest.starts_with("<?") {
            Some(rest.find('>').map_or(html.len(), |e| lt + e + 1))
        } else {
            None
        };
        if let Some(end) = markup_end {
            escape_text(&html[text_start..lt], &mut out);
            i = end;
            text_start = end;
            continue;
        }

        let tag = match parse_tag(html, lt) {
            Some(tag) => tag,
            None => {
                i = lt + 1;
                continue;
            }
        };
        escape_text(&html[text_start..lt], &mut out);
        i = tag.end;
        text_start = tag.end;

        if tag.closing {
            if let Some(pos) = open.iter().rposition(|t| *t == tag.name) {
                for name in open.drain(pos..).rev() {
                    out.push_str("</");
                    out.push_str(&name);
                    out.push('>');
                }
            }
            continue;
        }

        if drops_subtree(&tag.name) {
            i = skip_subtree(html, tag.end, &tag.name);
            text_start = i;
            continue;
        }

        match allowed_attributes(&tag.name) {
            Some(allowed) => {
                write_start_tag(&tag, allowed, &mut out);
                if !is_void(&tag.name) {
                    open.push(tag.name);
                }
            }
            None => {
                tracing::debug!(tag = %tag.name, "Removing disallowed tag");
            }
        }
    }

    escape_text(&html[text_start..], &mut out);
    for name in open.into_iter().rev() {
        out.push_str("</");
        out.push_str(&name);
        out.push('>');
    }
    out
}

// ---------------------------------------------------------------------------
// Filenames
// ---------------------------------------------------------------------------

fn is_reserved_device_name(name: &str) -> bool {
    let stem = name.split('.').next().unwrap_or_default().trim_end();
    let upper = stem.to_ascii_uppercase();
    match upper.as_str() {
        "CON" | "PRN" | "AUX" | "NUL" => true,
        _ => {
            let bytes = upper.as_bytes();
            bytes.len() == 4
                && (upper.starts_with("COM") || upper.starts_with("LPT"))
                && (b'1'..=b'9').contains(&bytes[3])
        }
    }
}

fn trim_name(name: &str) -> &str {
    name.trim_matches(|c: char| c.is_whitespace() || c == '.')
}

/// Largest prefix of `s` that fits in `max` bytes on a char boundary
fn truncate_bytes(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Truncate to the filename byte limit, keeping a short extension, and trim
/// whatever the cut exposed.
fn fit_length(name: &str) -> String {
    if name.len() <= MAX_FILENAME_BYTES {
        return name.to_string();
    }
    let extension = name
        .rfind('.')
        .filter(|&dot| dot > 0 && name.len() - dot <= MAX_EXTENSION_BYTES)
        .map(|dot| &name[dot..]);
    let truncated = match extension {
        Some(ext) => {
            let stem = &name[..name.len() - ext.len()];
            format!("{}{}", truncate_bytes(stem, MAX_FILENAME_BYTES - ext.len()), ext)
        }
        None => truncate_bytes(name, MAX_FILENAME_BYTES).to_string(),
    };
    trim_name(&truncated).to_string()
}

/// Make a user-supplied filename safe to store.
///
/// Path separators, control characters and `<>:"|?*` become `_`;
/// surrounding whitespace and dots are trimmed; Windows device names get a
/// `_` prefix; the result is truncated to 255 bytes keeping a short
/// extension. Empty results become [`FALLBACK_FILENAME`].
pub fn sanitize_filename(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | '<' | '>' | ':' | '"' | '|' | '?' | '*' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    let mut cleaned = fit_length(trim_name(&replaced));
    if is_reserved_device_name(&cleaned) {
        cleaned.insert(0, '_');
        cleaned = fit_length(&cleaned);
    }

    if cleaned.is_empty() {
        FALLBACK_FILENAME.to_string()
    } else {
        cleaned
    }
}
