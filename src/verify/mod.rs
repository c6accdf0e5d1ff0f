//! Post-capture verification.
//!
//! Runs a fixed set of weighted checks over the output tree and condenses
//! them into one score. The structural-similarity check only participates
//! when reference markup for the root page is available; its weight is
//! excluded from the denominator otherwise.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::crawl::PageRecord;
use crate::external_deps::interpreters::{BoaJavascriptInterpreter, JavascriptInterpreter};

const WEIGHT_NON_EMPTY: f64 = 0.2;
const WEIGHT_LINKS: f64 = 0.3;
const WEIGHT_SCRIPTS: f64 = 0.2;
const WEIGHT_INTEGRITY: f64 = 0.2;
const WEIGHT_STRUCTURE: f64 = 0.1;

/// Verification policy.
#[derive(Debug, Clone)]
pub struct VerifyConfig {
    /// Score at or above which the mirror is certified.
    pub certified_threshold: f64,
    /// Minimum tag-level similarity for the structural check.
    pub similarity_threshold: f64,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            certified_threshold: 0.95,
            similarity_threshold: 0.8,
        }
    }
}

/// One named check with its weight and outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationCheck {
    pub name: String,
    pub passed: bool,
    pub weight: f64,
    pub detail: String,
}

/// Weighted verification outcome for one mirror.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationReport {
    pub checks: Vec<VerificationCheck>,
    pub score: f64,
    pub certified: bool,
}

/// Runs the check suite over a finished output tree.
pub struct Verifier {
    config: VerifyConfig,
    interpreter: Arc<dyn JavascriptInterpreter>,
}

impl Verifier {
    pub fn new(config: VerifyConfig) -> Self {
        Self {
            config,
            interpreter: Arc::new(BoaJavascriptInterpreter::new()),
        }
    }

    pub fn with_interpreter(mut self, interpreter: Arc<dyn JavascriptInterpreter>) -> Self {
        self.interpreter = interpreter;
        self
    }

    /// Verify the output tree. `reference` is freshly fetched markup for the
    /// root page, when the caller could obtain it.
    pub fn verify(
        &self,
        output_root: &Path,
        pages: &[PageRecord],
        reference: Option<&str>,
    ) -> VerificationReport {
        let mut checks = Vec::new();

        checks.push(self.check_non_empty(output_root, pages));
        checks.push(self.check_internal_links(output_root, pages));
        checks.push(self.check_scripts(output_root, pages));
        checks.push(self.check_integrity(output_root));
        if let Some(reference) = reference {
            checks.push(self.check_structure(output_root, pages, reference));
        }

        let total: f64 = checks.iter().map(|c| c.weight).sum();
        let passed: f64 = checks.iter().filter(|c| c.passed).map(|c| c.weight).sum();
        let score = if total > 0.0 { passed / total } else { 0.0 };
        VerificationReport {
            checks,
            score,
            certified: score >= self.config.certified_threshold,
        }
    }

    fn check_non_empty(&self, output_root: &Path, pages: &[PageRecord]) -> VerificationCheck {
        let has_page = pages
            .iter()
            .any(|page| file_size(&output_root.join(&page.local_path)).unwrap_or(0) > 0);
        VerificationCheck {
            name: "output_non_empty".into(),
            passed: has_page,
            weight: WEIGHT_NON_EMPTY,
            detail: format!("{} pages captured", pages.len()),
        }
    }

    /// Every local reference inside every captured page must point at an
    /// existing non-empty file.
    fn check_internal_links(
        &self,
        output_root: &Path,
        pages: &[PageRecord],
    ) -> VerificationCheck {
        let mut total = 0usize;
        let mut broken = Vec::new();

        for page in pages {
            let page_path = output_root.join(&page.local_path);
            let Ok(markup) = std::fs::read_to_string(&page_path) else {
                broken.push(page.local_path.clone());
                continue;
            };
            let page_dir = page_path.parent().unwrap_or(output_root);
            for reference in local_references(&markup) {
                total += 1;
                let target = page_dir.join(strip_fragment(&reference));
                if file_size(&target).unwrap_or(0) == 0 {
                    broken.push(format!("{} -> {}", page.local_path, reference));
                }
            }
        }

        VerificationCheck {
            name: "internal_links_resolve".into(),
            passed: broken.is_empty(),
            weight: WEIGHT_LINKS,
            detail: if broken.is_empty() {
                format!("{total} references resolve")
            } else {
                format!("{} of {total} references broken: {:?}", broken.len(), broken)
            },
        }
    }

    /// Scripts referenced by the root page must load from local files and
    /// parse cleanly. Runtime failures from missing browser APIs are
    /// expected; syntax errors mean the capture corrupted the file.
    fn check_scripts(&self, output_root: &Path, pages: &[PageRecord]) -> VerificationCheck {
        let Some(root) = pages.iter().min_by_key(|page| page.depth) else {
            return VerificationCheck {
                name: "root_scripts_execute".into(),
                passed: false,
                weight: WEIGHT_SCRIPTS,
                detail: "no root page".into(),
            };
        };
        let page_path = output_root.join(&root.local_path);
        let Ok(markup) = std::fs::read_to_string(&page_path) else {
            return VerificationCheck {
                name: "root_scripts_execute".into(),
                passed: false,
                weight: WEIGHT_SCRIPTS,
                detail: "root page unreadable".into(),
            };
        };
        let page_dir = page_path.parent().unwrap_or(output_root);
        let host = Url::parse(&root.url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_else(|| "localhost".into());

        let mut checked = 0usize;
        let mut corrupt = Vec::new();
        for src in script_sources(&markup) {
            let Ok(source) = std::fs::read_to_string(page_dir.join(&src)) else {
                corrupt.push(format!("{src}: missing"));
                continue;
            };
            checked += 1;
            if let Err(err) = self.interpreter.execute(&source, &host)
                && err.is_syntax_error()
            {
                corrupt.push(format!("{src}: {err}"));
            }
        }

        VerificationCheck {
            name: "root_scripts_execute".into(),
            passed: corrupt.is_empty(),
            weight: WEIGHT_SCRIPTS,
            detail: if corrupt.is_empty() {
                format!("{checked} scripts checked")
            } else {
                format!("corrupt scripts: {corrupt:?}")
            },
        }
    }

    /// No zero-byte files anywhere in the output tree.
    fn check_integrity(&self, output_root: &Path) -> VerificationCheck {
        let mut files = 0usize;
        let mut empty = Vec::new();
        walk(output_root, &mut |path, size| {
            files += 1;
            if size == 0 {
                empty.push(path.display().to_string());
            }
        });
        VerificationCheck {
            name: "file_integrity".into(),
            passed: files > 0 && empty.is_empty(),
            weight: WEIGHT_INTEGRITY,
            detail: if empty.is_empty() {
                format!("{files} files intact")
            } else {
                format!("empty files: {empty:?}")
            },
        }
    }

    /// Tag-level structural comparison between the captured root page and
    /// freshly fetched reference markup.
    fn check_structure(
        &self,
        output_root: &Path,
        pages: &[PageRecord],
        reference: &str,
    ) -> VerificationCheck {
        let captured = pages
            .iter()
            .min_by_key(|page| page.depth)
            .and_then(|root| std::fs::read_to_string(output_root.join(&root.local_path)).ok());
        let similarity = captured
            .map(|markup| structural_similarity(&markup, reference))
            .unwrap_or(0.0);
        VerificationCheck {
            name: "structural_similarity".into(),
            passed: similarity >= self.config.similarity_threshold,
            weight: WEIGHT_STRUCTURE,
            detail: format!("similarity {similarity:.3}"),
        }
    }
}

fn file_size(path: &Path) -> Option<u64> {
    std::fs::metadata(path).ok().filter(|m| m.is_file()).map(|m| m.len())
}

fn walk(dir: &Path, visit: &mut impl FnMut(&Path, u64)) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            walk(&path, visit);
        } else if let Ok(meta) = entry.metadata() {
            visit(&path, meta.len());
        }
    }
}

fn strip_fragment(reference: &str) -> &str {
    reference
        .split_once('#')
        .map(|(path, _)| path)
        .unwrap_or(reference)
}

fn is_local(reference: &str) -> bool {
    !reference.is_empty()
        && !reference.starts_with('#')
        && !reference.starts_with("http://")
        && !reference.starts_with("https://")
        && !reference.starts_with("//")
        && !reference.contains(':')
}

/// All relative href/src/poster references in a page.
fn local_references(markup: &str) -> Vec<String> {
    let doc = Html::parse_document(markup);
    let sel = Selector::parse("[href], [src], [poster]").unwrap();
    let mut refs = Vec::new();
    for element in doc.select(&sel) {
        for attr in ["href", "src", "poster"] {
            if let Some(value) = element.value().attr(attr)
                && is_local(value)
            {
                refs.push(value.to_string());
            }
        }
    }
    refs
}

fn script_sources(markup: &str) -> Vec<String> {
    let doc = Html::parse_document(markup);
    let sel = Selector::parse("script[src]").unwrap();
    doc.select(&sel)
        .filter_map(|element| element.value().attr("src"))
        .filter(|src| is_local(src))
        .map(|src| strip_fragment(src).to_string())
        .collect()
}

fn tag_histogram(markup: &str) -> HashMap<String, usize> {
    let doc = Html::parse_document(markup);
    let sel = Selector::parse("*").unwrap();
    let mut counts = HashMap::new();
    for element in doc.select(&sel) {
        *counts.entry(element.value().name().to_string()).or_insert(0) += 1;
    }
    counts
}

/// Sørensen-Dice coefficient over tag multisets; 1.0 means identical shape.
fn structural_similarity(a: &str, b: &str) -> f64 {
    let ha = tag_histogram(a);
    let hb = tag_histogram(b);
    let total: usize = ha.values().sum::<usize>() + hb.values().sum::<usize>();
    if total == 0 {
        return 0.0;
    }
    let shared: usize = ha
        .iter()
        .map(|(tag, &count)| count.min(hb.get(tag).copied().unwrap_or(0)))
        .sum();
    (2 * shared) as f64 / total as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn page(url: &str, depth: usize, local_path: &str) -> PageRecord {
        PageRecord {
            url: url.to_string(),
            depth,
            http_status: 200,
            challenge_kind: "none".to_string(),
            resolved_at: None,
            local_path: local_path.to_string(),
            extracted_links: Vec::new(),
            asset_refs: Vec::new(),
            challenge_trail: Vec::new(),
        }
    }

    fn write(root: &Path, path: &str, content: &str) {
        let full = root.join(path);
        fs::create_dir_all(full.parent().unwrap()).unwrap();
        fs::write(full, content).unwrap();
    }

    #[test]
    fn intact_mirror_is_certified() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "index.html",
            r#"<html><body><a href="about/index.html">About</a>
               <script src="assets/app.js"></script></body></html>"#,
        );
        write(dir.path(), "about/index.html", "<html><body>about</body></html>");
        write(dir.path(), "assets/app.js", "var x = 1 + 1;");

        let pages = vec![
            page("https://a.test/", 0, "index.html"),
            page("https://a.test/about", 1, "about/index.html"),
        ];
        let report = Verifier::new(VerifyConfig::default()).verify(dir.path(), &pages, None);

        assert!(report.certified, "checks: {:?}", report.checks);
        assert!((report.score - 1.0).abs() < f64::EPSILON);
        assert_eq!(report.checks.len(), 4);
    }

    #[test]
    fn broken_link_lowers_the_score() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "index.html",
            r#"<html><body><a href="missing/index.html">Gone</a></body></html>"#,
        );
        let pages = vec![page("https://a.test/", 0, "index.html")];
        let report = Verifier::new(VerifyConfig::default()).verify(dir.path(), &pages, None);

        assert!(!report.certified);
        let links = report
            .checks
            .iter()
            .find(|c| c.name == "internal_links_resolve")
            .unwrap();
        assert!(!links.passed);
    }

    #[test]
    fn syntax_error_in_captured_script_fails_the_check() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "index.html",
            r#"<html><body><script src="assets/bad.js"></script></body></html>"#,
        );
        write(dir.path(), "assets/bad.js", "function ( { nope");
        let pages = vec![page("https://a.test/", 0, "index.html")];
        let report = Verifier::new(VerifyConfig::default()).verify(dir.path(), &pages, None);

        let scripts = report
            .checks
            .iter()
            .find(|c| c.name == "root_scripts_execute")
            .unwrap();
        assert!(!scripts.passed);
    }

    #[test]
    fn runtime_errors_from_missing_apis_are_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "index.html",
            r#"<html><body><script src="assets/app.js"></script></body></html>"#,
        );
        write(dir.path(), "assets/app.js", "fetch('/api/data');");
        let pages = vec![page("https://a.test/", 0, "index.html")];
        let report = Verifier::new(VerifyConfig::default()).verify(dir.path(), &pages, None);

        let scripts = report
            .checks
            .iter()
            .find(|c| c.name == "root_scripts_execute")
            .unwrap();
        assert!(scripts.passed, "{}", scripts.detail);
    }

    #[test]
    fn zero_byte_file_fails_integrity() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "index.html", "<html><body>hi</body></html>");
        write(dir.path(), "assets/empty.css", "");
        let pages = vec![page("https://a.test/", 0, "index.html")];
        let report = Verifier::new(VerifyConfig::default()).verify(dir.path(), &pages, None);

        let integrity = report
            .checks
            .iter()
            .find(|c| c.name == "file_integrity")
            .unwrap();
        assert!(!integrity.passed);
    }

    #[test]
    fn structural_check_compares_against_reference() {
        let dir = tempfile::tempdir().unwrap();
        let markup = "<html><body><div><p>text</p></div></body></html>";
        write(dir.path(), "index.html", markup);
        let pages = vec![page("https://a.test/", 0, "index.html")];
        let verifier = Verifier::new(VerifyConfig::default());

        let same = verifier.verify(dir.path(), &pages, Some(markup));
        assert!(
            same.checks
                .iter()
                .find(|c| c.name == "structural_similarity")
                .unwrap()
                .passed
        );

        let different = verifier.verify(
            dir.path(),
            &pages,
            Some("<html><body><table><tr><td>1</td></tr></table></body></html>"),
        );
        assert!(
            !different
                .checks
                .iter()
                .find(|c| c.name == "structural_similarity")
                .unwrap()
                .passed
        );
    }
}
