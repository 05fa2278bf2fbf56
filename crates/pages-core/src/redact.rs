//! Credential redaction for messages that get stored or shown to users.

use regex::Regex;
use std::sync::LazyLock;

/// Replaces the credential part of a `scheme://credential@host` URL.
pub const REDACTION_MARKER: &str = "[token_redacted]";

// Userinfo segment of a URL: everything between `//` and `@` with no path separator.
static CREDENTIAL_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"//[^/@\s]+@").unwrap());

/// Strip any `token@host` credential fragments from a message.
pub fn redact_credentials(message: &str) -> String {
    CREDENTIAL_REGEX
        .replace_all(message, format!("//{}@", REDACTION_MARKER).as_str())
        .into_owned()
}
