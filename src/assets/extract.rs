//! Reference enumeration from markup and stylesheets.
//!
//! Extraction keeps the raw attribute text next to the resolved absolute URL
//! so the rewriter can later substitute exactly what the document contained.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use scraper::{Html, Selector};
use url::Url;

/// One asset reference: the text as written plus its absolute resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct AssetRef {
    pub raw: String,
    pub url: Url,
}

static CSS_URL_RE: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(r#"url\(\s*['"]?(?P<url>[^'")\s]+?)['"]?\s*\)"#)
        .case_insensitive(true)
        .build()
        .unwrap()
});

static CSS_IMPORT_RE: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(r#"@import\s+['"](?P<url>[^'"]+)['"]"#)
        .case_insensitive(true)
        .build()
        .unwrap()
});

fn selector(css: &str) -> Selector {
    Selector::parse(css).unwrap()
}

static SCRIPT_SEL: Lazy<Selector> = Lazy::new(|| selector("script[src]"));
static IMG_SEL: Lazy<Selector> = Lazy::new(|| selector("img"));
static SOURCE_SEL: Lazy<Selector> = Lazy::new(|| selector("source"));
static LINK_SEL: Lazy<Selector> = Lazy::new(|| selector("link[href]"));
static MEDIA_SEL: Lazy<Selector> = Lazy::new(|| selector("video, audio"));
static OBJECT_SEL: Lazy<Selector> = Lazy::new(|| selector("embed[src], object[data]"));
static INPUT_IMAGE_SEL: Lazy<Selector> = Lazy::new(|| selector(r#"input[type="image"][src]"#));
static STYLED_SEL: Lazy<Selector> = Lazy::new(|| selector("[style]"));
static STYLE_SEL: Lazy<Selector> = Lazy::new(|| selector("style"));
static ANCHOR_SEL: Lazy<Selector> = Lazy::new(|| selector("a[href]"));

/// `<link rel>` values that point at downloadable resources.
fn is_resource_rel(rel: &str) -> bool {
    rel.split_whitespace().any(|word| {
        matches!(
            word.to_ascii_lowercase().as_str(),
            "stylesheet" | "icon" | "shortcut" | "apple-touch-icon" | "preload" | "manifest"
        )
    })
}

fn is_fetchable(url: &Url) -> bool {
    matches!(url.scheme(), "http" | "https")
}

fn push_ref(refs: &mut Vec<AssetRef>, seen: &mut HashSet<String>, base: &Url, raw: &str) {
    let raw = raw.trim();
    if raw.is_empty() || raw.starts_with('#') || raw.starts_with("data:") {
        return;
    }
    if let Ok(url) = base.join(raw)
        && is_fetchable(&url)
        && seen.insert(url.to_string())
    {
        refs.push(AssetRef {
            raw: raw.to_string(),
            url,
        });
    }
}

fn push_srcset(refs: &mut Vec<AssetRef>, seen: &mut HashSet<String>, base: &Url, srcset: &str) {
    for candidate in srcset.split(',') {
        if let Some(url) = candidate.split_whitespace().next() {
            push_ref(refs, seen, base, url);
        }
    }
}

/// Enumerate every asset reference in a page.
pub fn extract_asset_refs(html: &str, base: &Url) -> Vec<AssetRef> {
    let doc = Html::parse_document(html);
    let mut refs = Vec::new();
    let mut seen = HashSet::new();

    for element in doc.select(&SCRIPT_SEL) {
        if let Some(src) = element.value().attr("src") {
            push_ref(&mut refs, &mut seen, base, src);
        }
    }
    for element in doc.select(&IMG_SEL) {
        if let Some(src) = element.value().attr("src") {
            push_ref(&mut refs, &mut seen, base, src);
        }
        if let Some(srcset) = element.value().attr("srcset") {
            push_srcset(&mut refs, &mut seen, base, srcset);
        }
    }
    for element in doc.select(&SOURCE_SEL) {
        if let Some(src) = element.value().attr("src") {
            push_ref(&mut refs, &mut seen, base, src);
        }
        if let Some(srcset) = element.value().attr("srcset") {
            push_srcset(&mut refs, &mut seen, base, srcset);
        }
    }
    for element in doc.select(&LINK_SEL) {
        let rel = element.value().attr("rel").unwrap_or_default();
        if is_resource_rel(rel)
            && let Some(href) = element.value().attr("href")
        {
            push_ref(&mut refs, &mut seen, base, href);
        }
    }
    for element in doc.select(&MEDIA_SEL) {
        if let Some(src) = element.value().attr("src") {
            push_ref(&mut refs, &mut seen, base, src);
        }
        if let Some(poster) = element.value().attr("poster") {
            push_ref(&mut refs, &mut seen, base, poster);
        }
    }
    for element in doc.select(&OBJECT_SEL) {
        if let Some(src) = element.value().attr("src").or(element.value().attr("data")) {
            push_ref(&mut refs, &mut seen, base, src);
        }
    }
    for element in doc.select(&INPUT_IMAGE_SEL) {
        if let Some(src) = element.value().attr("src") {
            push_ref(&mut refs, &mut seen, base, src);
        }
    }
    for element in doc.select(&STYLED_SEL) {
        if let Some(style) = element.value().attr("style") {
            for caps in CSS_URL_RE.captures_iter(style) {
                push_ref(&mut refs, &mut seen, base, &caps["url"]);
            }
        }
    }
    for element in doc.select(&STYLE_SEL) {
        let css: String = element.text().collect();
        for asset in extract_css_refs(&css, base) {
            if seen.insert(asset.url.to_string()) {
                refs.push(asset);
            }
        }
    }

    refs
}

/// Enumerate `url()` and `@import` references in a stylesheet.
pub fn extract_css_refs(css: &str, base: &Url) -> Vec<AssetRef> {
    let mut refs = Vec::new();
    let mut seen = HashSet::new();
    for caps in CSS_URL_RE.captures_iter(css) {
        push_ref(&mut refs, &mut seen, base, &caps["url"]);
    }
    for caps in CSS_IMPORT_RE.captures_iter(css) {
        push_ref(&mut refs, &mut seen, base, &caps["url"]);
    }
    refs
}

/// Enumerate anchor targets, resolved to absolute URLs.
pub fn extract_links(html: &str, base: &Url) -> Vec<Url> {
    let doc = Html::parse_document(html);
    let mut links = Vec::new();
    let mut seen = HashSet::new();
    for element in doc.select(&ANCHOR_SEL) {
        if let Some(href) = element.value().attr("href") {
            let href = href.trim();
            if href.is_empty() || href.starts_with('#') {
                continue;
            }
            if let Ok(url) = base.join(href)
                && is_fetchable(&url)
                && seen.insert(url.to_string())
            {
                links.push(url);
            }
        }
    }
    links
}
