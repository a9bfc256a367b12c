//! Hostname grammar for tunnel bindings
//!
//! A hostname is one or more dot-separated labels. Each label is made of
//! `[a-z0-9]` with optional interior hyphens. Input is case-folded before
//! validation so every comparison and every registry key uses the lowercase
//! form.

use rand::Rng;
use thiserror::Error;

/// Longest hostname accepted (RFC 1035 presentation form)
pub const MAX_HOSTNAME_LEN: usize = 253;

/// Longest single label
pub const MAX_LABEL_LEN: usize = 63;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostnameError {
    #[error("Hostname is empty")]
    Empty,

    #[error("Hostname exceeds {MAX_HOSTNAME_LEN} characters")]
    TooLong,

    #[error("Hostname contains an empty label")]
    EmptyLabel,

    #[error("Label '{0}' exceeds {MAX_LABEL_LEN} characters")]
    LabelTooLong(String),

    #[error("Label '{0}' starts or ends with a hyphen")]
    HyphenAtEdge(String),

    #[error("Invalid character {1:?} in label '{0}'")]
    InvalidCharacter(String, char),
}

/// Lowercase and validate a hostname, returning its canonical form
pub fn canonicalize_hostname(hostname: &str) -> Result<String, HostnameError> {
    let canonical = hostname.to_ascii_lowercase();

    if canonical.is_empty() {
        return Err(HostnameError::Empty);
    }

    if canonical.len() > MAX_HOSTNAME_LEN {
        return Err(HostnameError::TooLong);
    }

    for label in canonical.split('.') {
        validate_label(label)?;
    }

    Ok(canonical)
}

fn validate_label(label: &str) -> Result<(), HostnameError> {
    if label.is_empty() {
        return Err(HostnameError::EmptyLabel);
    }

    if label.len() > MAX_LABEL_LEN {
        return Err(HostnameError::LabelTooLong(label.to_string()));
    }

    if let Some(c) = label
        .chars()
        .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-'))
    {
        return Err(HostnameError::InvalidCharacter(label.to_string(), c));
    }

    if label.starts_with('-') || label.ends_with('-') {
        return Err(HostnameError::HyphenAtEdge(label.to_string()));
    }

    Ok(())
}

/// Generate a random hostname under `base_domain`, e.g. `k3x9q2.example.com`
pub fn random_subdomain(len: usize, base_domain: &str) -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();

    let label: String = (0..len.max(1))
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect();

    let base = base_domain.trim_matches('.');
    if base.is_empty() {
        label
    } else {
        format!("{}.{}", label, base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_hostnames() {
        for host in [
            "localhost",
            "test.local",
            "a.b.c",
            "my-app.example.com",
            "x1.y2-z3.dev",
            "0.example.com",
        ] {
            assert_eq!(canonicalize_hostname(host).unwrap(), host);
        }
    }

    #[test]
    fn test_case_folding() {
        assert_eq!(
            canonicalize_hostname("Foo.Example.COM").unwrap(),
            "foo.example.com"
        );
    }

    #[test]
    fn test_rejects_underscore() {
        assert!(matches!(
            canonicalize_hostname("my_app.example.com"),
            Err(HostnameError::InvalidCharacter(_, '_'))
        ));
    }

    #[test]
    fn test_rejects_leading_and_trailing_hyphen() {
        assert!(matches!(
            canonicalize_hostname("-app.example.com"),
            Err(HostnameError::HyphenAtEdge(_))
        ));
        assert!(matches!(
            canonicalize_hostname("app-.example.com"),
            Err(HostnameError::HyphenAtEdge(_))
        ));
    }

    #[test]
    fn test_rejects_empty_labels() {
        assert_eq!(canonicalize_hostname(""), Err(HostnameError::Empty));
        assert_eq!(
            canonicalize_hostname("a..b"),
            Err(HostnameError::EmptyLabel)
        );
        assert_eq!(
            canonicalize_hostname(".example.com"),
            Err(HostnameError::EmptyLabel)
        );
        assert_eq!(
            canonicalize_hostname("example.com."),
            Err(HostnameError::EmptyLabel)
        );
    }

    #[test]
    fn test_rejects_port_and_spaces() {
        assert!(canonicalize_hostname("example.com:80").is_err());
        assert!(canonicalize_hostname("exa mple.com").is_err());
    }

    #[test]
    fn test_length_limits() {
        let long_label = "a".repeat(64);
        assert!(matches!(
            canonicalize_hostname(&long_label),
            Err(HostnameError::LabelTooLong(_))
        ));

        let long_host = vec!["abcdefghij"; 30].join(".");
        assert_eq!(canonicalize_hostname(&long_host), Err(HostnameError::TooLong));
    }

    #[test]
    fn test_random_subdomain() {
        let host = random_subdomain(8, "example.com");
        assert!(host.ends_with(".example.com"));
        assert_eq!(host.len(), 8 + ".example.com".len());
        assert!(canonicalize_hostname(&host).is_ok());

        let bare = random_subdomain(6, "");
        assert_eq!(bare.len(), 6);
    }
}
