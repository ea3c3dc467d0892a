use sha2::{Digest, Sha256};

/// Length in characters of every identifier produced by [`url_to_id`].
pub const ID_LEN: usize = 64;

/// Derives the stable identifier for a feed URL or item link.
///
/// The identifier is the lowercase hex SHA-256 digest of the exact UTF-8 bytes
/// given. No canonicalization happens: `http://a/` and `http://a` are two
/// different identities. The empty string is a valid input.
///
/// ```
/// use feedkeep::util::url_to_id;
///
/// let id = url_to_id("https://example.com/feed.xml");
/// assert_eq!(id.len(), 64);
/// assert_eq!(id, url_to_id("https://example.com/feed.xml"));
/// assert_ne!(id, url_to_id("https://example.com/feed.xml/"));
/// ```
pub fn url_to_id(url: &str) -> String {
    let hash = Sha256::digest(url.as_bytes());
    format!("{:x}", hash)
}
