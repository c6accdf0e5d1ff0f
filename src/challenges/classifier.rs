//! Deterministic page classification.
//!
//! Every navigated page is classified from its status code and serialized
//! markup before any capture work happens. The same snapshot always yields
//! the same [`ChallengeKind`]; there is no heuristic scoring.

use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use url::Url;

use crate::external_deps::captcha::CaptchaKind;

/// Closed set of page states the engine knows how to handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeKind {
    /// Real content, no gate detected.
    None,
    /// Computational gate solved by evaluating embedded script.
    ScriptChallenge,
    /// Interactive gate requiring a solver-provided token.
    Captcha,
    /// Access denied outright; no resolution path.
    HardBlock,
}

impl ChallengeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChallengeKind::None => "none",
            ChallengeKind::ScriptChallenge => "script_challenge",
            ChallengeKind::Captcha => "captcha",
            ChallengeKind::HardBlock => "hard_block",
        }
    }
}

/// Everything the classifier is allowed to look at.
#[derive(Debug)]
pub struct PageSnapshot<'a> {
    pub url: &'a Url,
    pub status: u16,
    pub body: &'a str,
}

/// Classification plus the markers that produced it, for the event log.
#[derive(Debug, Clone)]
pub struct Classification {
    pub kind: ChallengeKind,
    pub matched_markers: Vec<&'static str>,
    pub captcha_kind: Option<CaptchaKind>,
}

static CHALLENGE_FORM_RE: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(r#"<form[^>]+id\s*=\s*["']challenge-form["']"#)
        .case_insensitive(true)
        .build()
        .unwrap()
});

static CHECKING_BROWSER_RE: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(r"(checking your browser|verifying you are human|just a moment)")
        .case_insensitive(true)
        .build()
        .unwrap()
});

static ANSWER_FIELD_RE: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(r#"<input[^>]+name\s*=\s*["'][^"']*answer[^"']*["']"#)
        .case_insensitive(true)
        .build()
        .unwrap()
});

static SITEKEY_RE: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(r#"data-sitekey\s*=\s*["']([0-9A-Za-z_-]+)["']"#)
        .case_insensitive(true)
        .build()
        .unwrap()
});

static RECAPTCHA_RE: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(r#"(google\.com/recaptcha|class\s*=\s*["'][^"']*g-recaptcha)"#)
        .case_insensitive(true)
        .build()
        .unwrap()
});

static HCAPTCHA_RE: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(r#"(hcaptcha\.com/1/api\.js|class\s*=\s*["'][^"']*h-captcha)"#)
        .case_insensitive(true)
        .build()
        .unwrap()
});

static TURNSTILE_RE: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(r#"(challenges\.cloudflare\.com/turnstile|class\s*=\s*["'][^"']*cf-turnstile)"#)
        .case_insensitive(true)
        .build()
        .unwrap()
});

static HARD_BLOCK_RE: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(r"(access denied|you have been blocked|ip.{0,20}banned|error code:?\s*1020)")
        .case_insensitive(true)
        .dot_matches_new_line(true)
        .build()
        .unwrap()
});

/// Gate pages arrive with one of these statuses; a 200 with challenge markup
/// alone is treated as content.
fn is_gate_status(status: u16) -> bool {
    matches!(status, 403 | 429 | 503)
}

/// Classify one page snapshot. Precedence is fixed: hard block, then captcha,
/// then script challenge, then content.
pub fn classify(snapshot: &PageSnapshot) -> Classification {
    let body = snapshot.body;
    let mut markers = Vec::new();

    if is_gate_status(snapshot.status) {
        let has_form = CHALLENGE_FORM_RE.is_match(body);
        let has_sitekey = SITEKEY_RE.is_match(body);

        if !has_form && !has_sitekey && HARD_BLOCK_RE.is_match(body) {
            markers.push("hard-block-phrase");
            return Classification {
                kind: ChallengeKind::HardBlock,
                matched_markers: markers,
                captcha_kind: None,
            };
        }

        if has_sitekey {
            markers.push("data-sitekey");
            let captcha_kind = detect_captcha_kind(body, &mut markers);
            return Classification {
                kind: ChallengeKind::Captcha,
                matched_markers: markers,
                captcha_kind,
            };
        }

        if has_form {
            markers.push("challenge-form");
            if CHECKING_BROWSER_RE.is_match(body) {
                markers.push("interstitial-phrase");
            }
            if ANSWER_FIELD_RE.is_match(body) {
                markers.push("answer-field");
            }
            return Classification {
                kind: ChallengeKind::ScriptChallenge,
                matched_markers: markers,
                captcha_kind: None,
            };
        }

        // Gate status without recognizable markup. 403/429 with no resolution
        // path is a hard block; a bare 503 may be an ordinary outage and is
        // left to the network retry policy.
        if snapshot.status != 503 {
            markers.push("gate-status");
            return Classification {
                kind: ChallengeKind::HardBlock,
                matched_markers: markers,
                captcha_kind: None,
            };
        }
    }

    Classification {
        kind: ChallengeKind::None,
        matched_markers: markers,
        captcha_kind: None,
    }
}

fn detect_captcha_kind(body: &str, markers: &mut Vec<&'static str>) -> Option<CaptchaKind> {
    if TURNSTILE_RE.is_match(body) {
        markers.push("turnstile");
        Some(CaptchaKind::Turnstile)
    } else if HCAPTCHA_RE.is_match(body) {
        markers.push("hcaptcha");
        Some(CaptchaKind::Hcaptcha)
    } else if RECAPTCHA_RE.is_match(body) {
        markers.push("recaptcha");
        Some(CaptchaKind::RecaptchaV2)
    } else {
        None
    }
}

/// Marker-only check used while polling after an answer submission, when the
/// original gate status no longer applies.
pub fn looks_like_gate(body: &str) -> bool {
    CHALLENGE_FORM_RE.is_match(body)
        || SITEKEY_RE.is_match(body)
        || CHECKING_BROWSER_RE.is_match(body)
        || HARD_BLOCK_RE.is_match(body)
}

/// Extract the first `data-sitekey` attribute value.
pub fn extract_site_key(body: &str) -> Option<String> {
    SITEKEY_RE
        .captures(body)
        .map(|caps| caps[1].to_string())
}
