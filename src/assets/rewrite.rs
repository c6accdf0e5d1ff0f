//! Reference rewriting for offline use.
//!
//! Pages keep their URL-derived directory layout under the output root while
//! all assets live flat in `assets/`, so rewritten references are relative
//! paths computed from the page's own depth. Only references that were
//! actually captured get rewritten; failed ones keep their original text.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use url::Url;

use crate::crawl::normalize_url;

use super::download::hash_bytes;

static SRCSET_DQ_RE: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(r#"(srcset\s*=\s*")([^"]*)(")"#)
        .case_insensitive(true)
        .build()
        .unwrap()
});

static SRCSET_SQ_RE: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(r"(srcset\s*=\s*')([^']*)(')")
        .case_insensitive(true)
        .build()
        .unwrap()
});

static HREF_DQ_RE: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(r#"(href\s*=\s*")([^"]*)(")"#)
        .case_insensitive(true)
        .build()
        .unwrap()
});

static HREF_SQ_RE: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(r"(href\s*=\s*')([^']*)(')")
        .case_insensitive(true)
        .build()
        .unwrap()
});

/// On-disk path for a page, mirroring its URL structure.
/// `/` becomes `index.html`, `/about` becomes `about/index.html`, and paths
/// that already name a file keep their name. Query strings are disambiguated
/// with a short content hash.
pub fn page_local_path(url: &Url) -> String {
    let suffix = url
        .query()
        .map(|q| format!("_{}", &hash_bytes(q.as_bytes())[..8]))
        .unwrap_or_default();

    let path = url.path().trim_matches('/');
    if path.is_empty() {
        return format!("index{suffix}.html");
    }

    let named_file = path
        .rsplit('/')
        .next()
        .is_some_and(|segment| segment.contains('.'));
    if named_file {
        match path.rsplit_once('.') {
            Some((stem, ext)) if !suffix.is_empty() => format!("{stem}{suffix}.{ext}"),
            _ => path.to_string(),
        }
    } else {
        format!("{path}/index{suffix}.html")
    }
}

/// `../` repeated once per directory between the page and the output root.
pub fn relative_prefix(local_path: &str) -> String {
    let depth = local_path.matches('/').count();
    "../".repeat(depth)
}

/// Substitute captured asset references. `replacements` maps the raw
/// reference text to its page-relative local path.
pub fn rewrite_asset_refs(html: &str, replacements: &[(String, String)]) -> String {
    let mut doc = html.to_string();
    for (raw, local) in replacements {
        doc = replace_quoted(&doc, raw, local);
        doc = replace_css_forms(&doc, raw, local);
        // Attribute values may carry entity-encoded text the extractor saw
        // decoded.
        let encoded = html_escape::encode_double_quoted_attribute(raw.as_str());
        if encoded != raw.as_str() {
            doc = replace_quoted(&doc, &encoded, local);
        }
    }

    let map: HashMap<&str, &str> = replacements
        .iter()
        .map(|(raw, local)| (raw.as_str(), local.as_str()))
        .collect();
    doc = rewrite_srcset(&doc, &SRCSET_DQ_RE, &map);
    rewrite_srcset(&doc, &SRCSET_SQ_RE, &map)
}

/// Substitute captured references inside a stylesheet. Assets are flat in one
/// directory, so stylesheet-internal paths are bare filenames.
pub fn rewrite_css_refs(css: &str, replacements: &[(String, String)]) -> String {
    let mut sheet = css.to_string();
    for (raw, local) in replacements {
        sheet = replace_css_forms(&sheet, raw, local);
        sheet = sheet.replace(
            &format!("@import \"{raw}\""),
            &format!("@import \"{local}\""),
        );
        sheet = sheet.replace(&format!("@import '{raw}'"), &format!("@import '{local}'"));
    }
    sheet
}

/// Rewrite anchors that point at captured pages. `pages` maps normalized page
/// URLs to their local paths; anything else keeps its original href.
pub fn rewrite_page_links(
    html: &str,
    base: &Url,
    pages: &HashMap<String, String>,
    current_local: &str,
) -> String {
    let prefix = relative_prefix(current_local);
    let rewrite = |raw: &str| -> Option<String> {
        if raw.is_empty() || raw.starts_with('#') {
            return None;
        }
        let resolved = base.join(raw).ok()?;
        let fragment = resolved.fragment().map(str::to_string);
        let target = pages.get(normalize_url(&resolved).as_str())?;
        let mut local = format!("{prefix}{target}");
        if let Some(fragment) = fragment {
            local.push('#');
            local.push_str(&fragment);
        }
        Some(local)
    };

    let doc = HREF_DQ_RE.replace_all(html, |caps: &regex::Captures| {
        match rewrite(&caps[2]) {
            Some(local) => format!("{}{}{}", &caps[1], local, &caps[3]),
            None => caps[0].to_string(),
        }
    });
    HREF_SQ_RE
        .replace_all(&doc, |caps: &regex::Captures| match rewrite(&caps[2]) {
            Some(local) => format!("{}{}{}", &caps[1], local, &caps[3]),
            None => caps[0].to_string(),
        })
        .into_owned()
}

fn replace_quoted(doc: &str, raw: &str, local: &str) -> String {
    doc.replace(&format!("\"{raw}\""), &format!("\"{local}\""))
        .replace(&format!("'{raw}'"), &format!("'{local}'"))
}

fn replace_css_forms(doc: &str, raw: &str, local: &str) -> String {
    doc.replace(&format!("url({raw})"), &format!("url({local})"))
        .replace(&format!("url('{raw}')"), &format!("url('{local}')"))
        .replace(&format!("url(\"{raw}\")"), &format!("url(\"{local}\")"))
}

fn rewrite_srcset(doc: &str, pattern: &Regex, map: &HashMap<&str, &str>) -> String {
    pattern
        .replace_all(doc, |caps: &regex::Captures| {
            let rewritten = caps[2]
                .split(',')
                .map(|candidate| {
                    let trimmed = candidate.trim();
                    let mut parts = trimmed.splitn(2, char::is_whitespace);
                    let url = parts.next().unwrap_or_default();
                    let descriptor = parts.next();
                    let replaced = map.get(url).copied().unwrap_or(url);
                    match descriptor {
                        Some(desc) => format!("{replaced} {desc}"),
                        None => replaced.to_string(),
                    }
                })
                .collect::<Vec<_>>()
                .join(", ");
            format!("{}{}{}", &caps[1], rewritten, &caps[3])
        })
        .into_owned()
}
