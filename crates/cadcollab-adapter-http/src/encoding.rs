//! Path segment encoding.
//!
//! Project and user ids are free-form strings; everything outside the URL
//! unreserved set is percent-encoded so an id always stays one segment.

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

/// Characters left as-is in a path segment (RFC 3986 unreserved).
const UNRESERVED: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Percent-encode an id for use as a single path segment.
///
/// # Examples
///
/// ```
/// use cadcollab_adapter_http::encode_path_segment;
///
/// assert_eq!(encode_path_segment("bridge-7"), "bridge-7");
/// assert_eq!(encode_path_segment("site/a b"), "site%2Fa%20b");
/// ```
#[must_use]
pub fn encode_path_segment(id: &str) -> String {
    utf8_percent_encode(id, UNRESERVED).to_string()
}

/// Decode a percent-encoded path segment.
///
/// # Errors
///
/// Returns error if the decoded bytes are not valid UTF-8.
pub fn decode_path_segment(encoded: &str) -> Result<String, EncodingError> {
    percent_decode_str(encoded)
        .decode_utf8()
        .map(|s| s.into_owned())
        .map_err(|e| EncodingError::Utf8Decode(e.to_string()))
}

/// Errors that can occur during decoding.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EncodingError {
    /// UTF-8 decoding failed
    #[error("UTF-8 decode error: {0}")]
    Utf8Decode(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unreserved_passes_through() {
        assert_eq!(encode_path_segment("C1.v2_final~x"), "C1.v2_final~x");
    }

    #[test]
    fn separators_are_escaped() {
        let encoded = encode_path_segment("a/b?c#d%e");
        assert!(!encoded.contains('/'));
        assert!(!encoded.contains('?'));
        assert!(!encoded.contains('#'));
        assert_eq!(decode_path_segment(&encoded).unwrap(), "a/b?c#d%e");
    }

    #[test]
    fn unicode_ids() {
        let id = "projekt-brücke";
        assert_eq!(decode_path_segment(&encode_path_segment(id)).unwrap(), id);
    }

    #[test]
    fn invalid_utf8_is_rejected() {
        assert!(decode_path_segment("%FF%FE").is_err());
    }
}
