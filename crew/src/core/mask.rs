//! Redaction of credentials before messages reach logs or audit files.

use std::sync::LazyLock;

use regex::Regex;

const MASK: &str = "***";

static ASSIGNMENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)([a-z0-9_.-]*(?:api[_-]?key|token|secret|password|passwd|credential)[a-z0-9_]*)("?\s*[:=]\s*)("?)([^\s"',;]+)"#,
    )
    .unwrap()
});
static BEARER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(bearer)\s+[A-Za-z0-9._~+/=-]+").unwrap());
static OPENAI_KEY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bsk-[A-Za-z0-9_-]{8,}").unwrap());
static GITHUB_TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bgh[pousr]_[A-Za-z0-9]{16,}").unwrap());

/// Replace secret-looking values with `***`, keeping the surrounding text.
pub fn mask_sensitive(message: &str) -> String {
    let masked = ASSIGNMENT_RE.replace_all(message, |caps: &regex::Captures<'_>| {
        format!("{}{}{}{MASK}", &caps[1], &caps[2], &caps[3])
    });
    let masked = BEARER_RE.replace_all(&masked, |caps: &regex::Captures<'_>| {
        format!("{} {MASK}", &caps[1])
    });
    let masked = OPENAI_KEY_RE.replace_all(&masked, MASK);
    GITHUB_TOKEN_RE.replace_all(&masked, MASK).into_owned()
}
