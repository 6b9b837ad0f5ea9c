//! Utility functions and helpers

pub mod duration;

pub use duration::{parse_duration, parse_timeout, Timeout};

use regex::Regex;
use sha2::{Digest, Sha256};

/// HTTP header field names are RFC 7230 tokens.
pub static HEADER_NAME_REGEX: std::sync::LazyLock<Regex> = std::sync::LazyLock::new(|| {
    Regex::new(r"^[!#$%&'*+\-.^_`|~0-9A-Za-z]+$").unwrap()
});

/// DNS-1123 subdomain with an optional leading `*.` wildcard label.
pub static HOSTNAME_REGEX: std::sync::LazyLock<Regex> = std::sync::LazyLock::new(|| {
    Regex::new(r"^(\*\.)?[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$").unwrap()
});

/// Returns true when `name` is a valid HTTP header field name.
pub fn is_valid_header_name(name: &str) -> bool {
    HEADER_NAME_REGEX.is_match(name)
}

/// Returns true when `host` is a valid virtual host name, wildcards included.
pub fn is_valid_hostname(host: &str) -> bool {
    host.len() <= 253 && HOSTNAME_REGEX.is_match(host)
}

/// First ten hex characters of the SHA-256 over `parts`.
///
/// Parts are length-prefixed so `["ab", "c"]` and `["a", "bc"]` differ.
pub fn short_hash<I, B>(parts: I) -> String
where
    I: IntoIterator<Item = B>,
    B: AsRef<[u8]>,
{
    let mut hasher = Sha256::new();
    for part in parts {
        let bytes = part.as_ref();
        hasher.update((bytes.len() as u64).to_be_bytes());
        hasher.update(bytes);
    }
    let digest = hex::encode(hasher.finalize());
    digest[..10].to_string()
}
