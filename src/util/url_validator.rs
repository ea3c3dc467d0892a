use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use thiserror::Error;
use url::{Host, Url};

/// Why a string was refused as a feed URL.
#[derive(Error, Debug)]
pub enum UrlValidationError {
    #[error("Malformed feed URL: {0}")]
    Malformed(#[from] url::ParseError),

    /// Only `http` and `https` feeds are fetched
    #[error("Feed URL scheme '{0}' is not http or https")]
    Scheme(String),

    #[error("Feed URL has no host")]
    NoHost,

    #[error("Feed URL points at this machine")]
    Loopback,

    /// RFC 1918, link-local, unique-local or unspecified address
    #[error("Feed URL points at a private network address: {0}")]
    PrivateAddress(IpAddr),
}

/// Checks that `url_str` is acceptable as a feed source before any request
/// is made.
///
/// Non-HTTP(S) schemes are always refused. Unless `allow_private_hosts` is
/// set, `localhost`, loopback and private-network literals are refused too,
/// so a subscription cannot reach internal services. Host names
/// are not resolved.
///
/// The URL is only checked, never rewritten: callers keep using the original
/// string so that feed identity stays a function of exactly what was given.
///
/// # Examples
///
/// ```
/// use feedkeep::util::validate_feed_url;
///
/// assert!(validate_feed_url("https://example.com/feed.xml", false).is_ok());
/// assert!(validate_feed_url("http://localhost/feed", false).is_err());
/// assert!(validate_feed_url("http://localhost/feed", true).is_ok());
/// assert!(validate_feed_url("file:///etc/passwd", true).is_err());
/// ```
pub fn validate_feed_url(url_str: &str, allow_private_hosts: bool) -> Result<Url, UrlValidationError> {
    let url = Url::parse(url_str.trim())?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(UrlValidationError::Scheme(url.scheme().to_string()));
    }

    let host = url.host().ok_or(UrlValidationError::NoHost)?;
    if !allow_private_hosts {
        let refusal = match host {
            Host::Domain(name) if name.eq_ignore_ascii_case("localhost") => {
                Some(UrlValidationError::Loopback)
            }
            Host::Domain(_) => None,
            Host::Ipv4(v4) => refuse_address(IpAddr::V4(v4)),
            Host::Ipv6(v6) => refuse_address(IpAddr::V6(v6)),
        };
        if let Some(err) = refusal {
            return Err(err);
        }
    }

    Ok(url)
}

fn refuse_address(ip: IpAddr) -> Option<UrlValidationError> {
    // ::ffff:a.b.c.d is judged as the IPv4 address it carries
    let ip = match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
        v4 => v4,
    };

    if ip.is_loopback() {
        return Some(UrlValidationError::Loopback);
    }
    let private = match ip {
        IpAddr::V4(v4) => is_private_v4(v4),
        IpAddr::V6(v6) => is_private_v6(v6),
    };
    private.then_some(UrlValidationError::PrivateAddress(ip))
}

fn is_private_v4(ip: Ipv4Addr) -> bool {
    ip.is_private() || ip.is_link_local() || ip.is_unspecified()
}

fn is_private_v6(ip: Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    ip.is_unspecified()
        || first & 0xfe00 == 0xfc00 // fc00::/7
        || first & 0xffc0 == 0xfe80 // fe80::/10
}
