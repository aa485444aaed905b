//! Key derivation (C1): URL → opaque cache key, key → filename.

use md5::{Digest, Md5};

/// Opaque cache key derived from a URL. Equality is exact string
/// equality over the derived bytes.
pub type Key = String;

/// A filter that derives a [`Key`] from a URL, overriding the default
/// "key equals canonical URL string" rule. Stored as a trait object so
/// callers can plug in arbitrary normalization (stripping query
/// parameters, collapsing CDN host aliases, etc).
pub trait KeyFilter: Send + Sync {
    fn key_for_url(&self, url: &str) -> Key;
}

impl<F> KeyFilter for F
where
    F: Fn(&str) -> Key + Send + Sync,
{
    fn key_for_url(&self, url: &str) -> Key {
        self(url)
    }
}

/// Derives the cache key for a URL, consulting `filter` when present.
pub fn key_for_url(url: &str, filter: Option<&dyn KeyFilter>) -> Key {
    match filter {
        Some(filter) => filter.key_for_url(url),
        None => url.to_string(),
    }
}

/// Derives the on-disk filename for a key: a 32-character lowercase hex
/// MD5 digest of the key's UTF-8 bytes, followed by the file extension
/// found in the key's last path segment (including the leading `.`),
/// verbatim, when present and non-empty.
///
/// See spec.md §4.1 and the Open Questions in §9: two keys differing
/// only by extension hash identically but are stored under distinct
/// filenames, which is why [`crate::disk_cache::DiskCache`] probes both
/// the extensioned and bare paths on every read.
pub fn filename_for_key(key: &str) -> String {
    let digest = Md5::digest(key.as_bytes());
    let mut filename = hex_lower(&digest);
    if let Some(extension) = extension_of(key) {
        filename.push_str(extension);
    }
    filename
}

fn hex_lower(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Extracts `.ext` (leading dot included) from the last path segment of
/// `key`, treating `key` as a URL-like path. Returns `None` when the
/// last segment has no `.` or the suffix after it is empty.
fn extension_of(key: &str) -> Option<&str> {
    let without_query = key.split(['?', '#']).next().unwrap_or(key);
    let last_segment = without_query.rsplit('/').next().unwrap_or(without_query);
    let dot = last_segment.rfind('.')?;
    let extension = &last_segment[dot..];
    if extension.len() > 1 {
        Some(extension)
    } else {
        None
    }
}
