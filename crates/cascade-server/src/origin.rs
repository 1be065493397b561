//! Accepted-origin policy for the transport upgrade.
//!
//! Origins are configured as `host:port` patterns where either part may
//! be the wildcard `*`. The universal pattern `*:*` accepts everything,
//! including requests without an `Origin` header.

use cascade_core::CascadeError;

/// One `host:port` pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
struct OriginPattern {
    host: String,
    port: String,
}

/// The parsed accepted-origin policy.
#[derive(Debug, Clone)]
pub struct OriginPolicy {
    allow_any: bool,
    patterns: Vec<OriginPattern>,
}

impl OriginPolicy {
    /// Parse a policy from configured patterns.
    ///
    /// A pattern without a port part matches any port.
    #[must_use]
    pub fn new(origins: &[String]) -> Self {
        let patterns: Vec<OriginPattern> = origins
            .iter()
            .map(|pattern| match pattern.rsplit_once(':') {
                Some((host, port)) => OriginPattern {
                    host: host.to_ascii_lowercase(),
                    port: port.to_string(),
                },
                None => OriginPattern {
                    host: pattern.to_ascii_lowercase(),
                    port: "*".to_string(),
                },
            })
            .collect();

        let allow_any = patterns
            .iter()
            .any(|pattern| pattern.host == "*" && pattern.port == "*");

        Self {
            allow_any,
            patterns,
        }
    }

    /// Check an `Origin` header value against the policy.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOrigin` when the origin is absent, unparsable, or
    /// not covered by any pattern.
    pub fn check(&self, origin: Option<&str>) -> Result<(), CascadeError> {
        if self.allow_any {
            return Ok(());
        }

        let raw = origin.unwrap_or("");
        let (host, port) = parse_origin(raw).ok_or_else(|| CascadeError::InvalidOrigin {
            origin: raw.to_string(),
        })?;

        let accepted = self.patterns.iter().any(|pattern| {
            (pattern.host == host || pattern.host == "*")
                && (pattern.port == port || pattern.port == "*")
        });

        if accepted {
            Ok(())
        } else {
            Err(CascadeError::InvalidOrigin {
                origin: raw.to_string(),
            })
        }
    }
}

/// Split an `Origin` header value into host and port, defaulting the
/// port to 80.
fn parse_origin(raw: &str) -> Option<(String, String)> {
    let without_scheme = match raw.split_once("://") {
        Some((_, rest)) => rest,
        None => raw,
    };

    let authority = without_scheme
        .split('/')
        .next()
        .filter(|part| !part.is_empty())?;

    match authority.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.chars().all(|c| c.is_ascii_digit()) => {
            Some((host.to_ascii_lowercase(), port.to_string()))
        }
        _ => Some((authority.to_ascii_lowercase(), "80".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(patterns: &[&str]) -> OriginPolicy {
        let patterns: Vec<String> = patterns.iter().map(|s| s.to_string()).collect();
        OriginPolicy::new(&patterns)
    }

    #[test]
    fn test_universal_pattern_accepts_everything() {
        let policy = policy(&["*:*"]);
        assert!(policy.check(Some("https://anywhere.example:9999")).is_ok());
        assert!(policy.check(None).is_ok());
    }

    #[test]
    fn test_exact_host_and_port() {
        let policy = policy(&["app.example:443"]);
        assert!(policy.check(Some("https://app.example:443")).is_ok());
        assert!(policy.check(Some("https://app.example:444")).is_err());
        assert!(policy.check(Some("https://other.example:443")).is_err());
    }

    #[test]
    fn test_host_wildcard_port() {
        let policy = policy(&["app.example:*"]);
        assert!(policy.check(Some("https://app.example:443")).is_ok());
        assert!(policy.check(Some("http://app.example:8080")).is_ok());
        assert!(policy.check(Some("http://other.example:8080")).is_err());
    }

    #[test]
    fn test_wildcard_host_exact_port() {
        let policy = policy(&["*:443"]);
        assert!(policy.check(Some("https://app.example:443")).is_ok());
        assert!(policy.check(Some("https://other.example:443")).is_ok());
        assert!(policy.check(Some("https://app.example:80")).is_err());
    }

    #[test]
    fn test_default_port_is_80() {
        let policy = policy(&["app.example:80"]);
        assert!(policy.check(Some("http://app.example")).is_ok());
        assert!(policy.check(Some("app.example")).is_ok());
    }

    #[test]
    fn test_missing_origin_rejected_without_universal() {
        let policy = policy(&["app.example:*"]);
        assert!(matches!(
            policy.check(None),
            Err(CascadeError::InvalidOrigin { .. })
        ));
    }

    #[test]
    fn test_host_matching_is_case_insensitive() {
        let policy = policy(&["App.Example:443"]);
        assert!(policy.check(Some("https://app.EXAMPLE:443")).is_ok());
    }

    #[test]
    fn test_pattern_without_port_matches_any_port() {
        let policy = policy(&["app.example"]);
        assert!(policy.check(Some("https://app.example:443")).is_ok());
        assert!(policy.check(Some("http://app.example")).is_ok());
    }
}
