//! PII redaction for stored AI text
//!
//! Applied to bot message text and accuracy-record text before they hit
//! the database when `REDACT_PII` is enabled. Clients still receive the
//! original text; only the stored copies are scrubbed.

use regex::Regex;
use std::sync::OnceLock;

fn email_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").unwrap())
}

fn phone_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // 7+ digit runs, optionally grouped with spaces, dots or dashes
    RE.get_or_init(|| {
        Regex::new(r"\+?\d[\d\s().-]{5,}\d").unwrap()
    })
}

pub fn redact_pii(text: &str) -> String {
    let pass = email_re().replace_all(text, "[redacted-email]");
    phone_re().replace_all(&pass, "[redacted-phone]").into_owned()
}
