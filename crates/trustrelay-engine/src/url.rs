//! Public-web URL detection for the low-trust content policy.
//!
//! A regular expression proposes URL-ish candidates; everything else
//! (email/embedded-token exclusion, hostname validation, private address
//! checks) happens in code, since the regex engine has no lookarounds.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::OnceLock;

use regex::Regex;

fn candidate_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(?:https?://|www\.)[^\s]+|(?:[a-z0-9-]+\.)+[a-z]{2,}(?:/[^\s]*)?")
            .expect("url candidate pattern compiles")
    })
}

const ENCLOSING_PUNCTUATION: &str = "()[]{}<>,.\"'`";

/// Returns true when the content contains at least one public-web URL
/// (`http(s)://`, `www.`, or a bare `domain.tld`).
pub fn contains_url(content: &str) -> bool {
    if content.is_empty() {
        return false;
    }

    let mut offset = 0;
    while offset < content.len() {
        let Some(found) = candidate_regex().find(&content[offset..]) else {
            return false;
        };
        let start = offset + found.start();
        let end = offset + found.end();
        offset = end;

        // Skip matches preceded by '@' (emails) or a domain character, so
        // "test.com" inside "example_test.com" never counts.
        if start > 0 {
            let prev = content.as_bytes()[start - 1];
            if prev == b'@' || is_domain_byte(prev) {
                continue;
            }
        }

        let candidate =
            content[start..end].trim_matches(|c| ENCLOSING_PUNCTUATION.contains(c));
        if candidate.is_empty() {
            continue;
        }
        // Underscores are not valid in DNS hostnames.
        if candidate.contains('_') {
            continue;
        }

        if is_public_web_host(candidate) {
            return true;
        }
    }

    false
}

fn is_domain_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'-' || b == b'_'
}

fn strip_prefix_ignore_case<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    let head = s.get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix) {
        s.get(prefix.len()..)
    } else {
        None
    }
}

/// Extracts the host from a candidate and checks it names something on the
/// public web.
fn is_public_web_host(candidate: &str) -> bool {
    let mut s = candidate;
    if let Some(rest) = strip_prefix_ignore_case(s, "https://") {
        s = rest;
    } else if let Some(rest) = strip_prefix_ignore_case(s, "http://") {
        s = rest;
    }

    // Cut at the first path, query, or fragment delimiter.
    if let Some(i) = s.find(['/', '?', '#']) {
        s = &s[..i];
    }
    // Strip userinfo if present.
    if let Some(at) = s.rfind('@') {
        s = &s[at + 1..];
    }
    // Strip a trailing numeric port, best effort.
    let host = match s.rsplit_once(':') {
        Some((h, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => h,
        _ => s,
    };

    if host.is_empty() {
        return false;
    }
    let host_lower = host.to_ascii_lowercase();
    if host_lower == "localhost" || host_lower.ends_with(".local") {
        return false;
    }

    if let Ok(ip) = host.parse::<IpAddr>() {
        return is_public_ip(ip);
    }

    // Minimal hostname sanity: at least one dot.
    host_lower.contains('.')
}

fn is_public_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !(v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
                || is_link_local_multicast_v4(&v4))
        }
        IpAddr::V6(v6) => {
            !(v6.is_loopback()
                || v6.is_unspecified()
                || is_unique_local_v6(&v6)
                || is_link_local_v6(&v6)
                || is_link_local_multicast_v6(&v6))
        }
    }
}

fn is_link_local_multicast_v4(ip: &Ipv4Addr) -> bool {
    let [a, b, c, _] = ip.octets();
    a == 224 && b == 0 && c == 0
}

// fc00::/7
fn is_unique_local_v6(ip: &Ipv6Addr) -> bool {
    (ip.segments()[0] & 0xfe00) == 0xfc00
}

// fe80::/10
fn is_link_local_v6(ip: &Ipv6Addr) -> bool {
    (ip.segments()[0] & 0xffc0) == 0xfe80
}

// ff02::/16
fn is_link_local_multicast_v6(ip: &Ipv6Addr) -> bool {
    ip.segments()[0] == 0xff02
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_scheme_and_www_urls() {
        let cases = [
            "Check out http://example.com",
            "Visit https://example.com/path?query=value",
            "https://example.com:8080/path",
            "https://duckduckgo.com/?q=a+b&c=1",
            "Go to www.example.com",
            "Visit www.example.com/path/to/page",
            "www.example.com:8080",
        ];
        for content in cases {
            assert!(contains_url(content), "{content}");
        }
    }

    #[test]
    fn matches_bare_domains() {
        let cases = [
            "Visit example.com",
            "example.com/path",
            "example.com?q=test",
            "example.com:8080",
            "sub.example.com",
            "a.b.c.example.com",
            "example.org",
            "example.net",
            "example.io",
            "example.co.uk",
            "foo.bar",
            "my-example.com",
            "example123.com",
            "(example.com)",
            "example.com.",
        ];
        for content in cases {
            assert!(contains_url(content), "{content}");
        }
    }

    #[test]
    fn ignores_non_http_schemes() {
        let cases = [
            "nostr:npub1...",
            "bitcoin:bc1q...",
            "mailto:test@example.com",
            "ipfs://Qm...",
        ];
        for content in cases {
            assert!(!contains_url(content), "{content}");
        }
    }

    #[test]
    fn rejects_local_and_private_hosts() {
        let cases = [
            "http://localhost:8080",
            "http://127.0.0.1:8080",
            "http://192.168.1.1",
            "http://10.0.0.1",
            "http://169.254.0.5",
            "printer.local/status",
            "http://[::1]:8080",
        ];
        for content in cases {
            assert!(!contains_url(content), "{content}");
        }
    }

    #[test]
    fn rejects_plain_text_and_lookalikes() {
        let cases = [
            "",
            "Just some plain text without URLs",
            "hello",
            "Contact me at test@example.com",
            "Version 1.2.3",
            "8.8.8.8",
            "example.",
            ".example",
            "example_test.com",
            "test@example.com",
        ];
        for content in cases {
            assert!(!contains_url(content), "{content}");
        }
    }

    #[test]
    fn finds_urls_anywhere_in_the_content() {
        assert!(contains_url("https://example.com is a great site"));
        assert!(contains_url("Check out https://example.com"));
        assert!(contains_url("https://example.com"));
        assert!(contains_url("Visit https://example.com and www.test.org"));
    }

    #[test]
    fn public_ip_urls_count() {
        assert!(contains_url("http://8.8.8.8"));
        assert!(contains_url("http://1.1.1.1/path"));
    }
}
