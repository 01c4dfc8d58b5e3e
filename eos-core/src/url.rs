//! URL/manifest primitives (§4.1).
//!
//! Resolves a possibly-relative URL against a parent and computes a
//! stable, URL-safe base64 fingerprint used inside the service's own
//! URL scheme (the `{origin_b64url}` / `{reference_b64}` / `{frag_b64}`
//! path segments of §6).

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

use crate::error::{CoreError, Result};

/// Resolve `url` against `parent`. Absolute inputs (carrying a scheme)
/// pass through unchanged; equality of fingerprints implies equality of
/// the resulting absolute URLs, so this function must be deterministic
/// and must not normalize away meaningful differences (trailing slash,
/// query string) beyond what `scheme://host/path` resolution naturally
/// folds in.
pub fn resolve(url: &str, parent: &str) -> Result<String> {
    if is_absolute(url) {
        return Ok(url.to_string());
    }
    let parent_url =
        url::Url::parse(parent).map_err(|e| CoreError::InvalidUrl(format!("{parent}: {e}")))?;
    let resolved = parent_url
        .join(url)
        .map_err(|e| CoreError::InvalidUrl(format!("{url} against {parent}: {e}")))?;
    Ok(resolved.to_string())
}

/// Whether `url` already carries a scheme (`http://`, `https://`, ...).
pub fn is_absolute(url: &str) -> bool {
    url::Url::parse(url).is_ok() && url.contains("://")
}

/// Compute the URL-safe, unpadded base64 fingerprint of an absolute URL.
/// Used as the `{..._b64url}` path segments in the service's own scheme.
pub fn fingerprint(absolute_url: &str) -> String {
    URL_SAFE_NO_PAD.encode(absolute_url.as_bytes())
}

/// Invert [`fingerprint`]. Returns `None` on malformed base64 or
/// non-UTF8 decoded bytes — callers treat this as a malformed client URL
/// (§7, 400 response, no session created).
pub fn defingerprint(encoded: &str) -> Option<String> {
    let bytes = URL_SAFE_NO_PAD.decode(encoded).ok()?;
    String::from_utf8(bytes).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absolute_passes_through() {
        let u = "https://origin.example.com/live/index.m3u8";
        assert_eq!(resolve(u, "https://other.example.com/").unwrap(), u);
    }

    #[test]
    fn relative_resolves_against_parent() {
        let resolved = resolve(
            "chunk_1.ts",
            "https://origin.example.com/live/index.m3u8",
        )
        .unwrap();
        assert_eq!(resolved, "https://origin.example.com/live/chunk_1.ts");
    }

    #[test]
    fn resolve_is_idempotent_on_absolute_input() {
        let once = resolve("chunk_1.ts", "https://o.example.com/live/index.m3u8").unwrap();
        let twice = resolve(&once, "https://o.example.com/live/index.m3u8").unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn fingerprint_roundtrips() {
        let u = "https://origin.example.com/live/index.m3u8?token=abc";
        let fp = fingerprint(u);
        assert!(!fp.contains('+') && !fp.contains('/') && !fp.contains('='));
        assert_eq!(defingerprint(&fp).as_deref(), Some(u));
    }

    #[test]
    fn equal_fingerprints_imply_equal_urls() {
        let a = "https://origin.example.com/x.m3u8";
        let b = "https://origin.example.com/x.m3u8";
        assert_eq!(fingerprint(a), fingerprint(b));
    }

    #[test]
    fn defingerprint_rejects_garbage() {
        assert!(defingerprint("not base64 at all!!").is_none());
    }
}
