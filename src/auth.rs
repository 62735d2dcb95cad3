//! Shared-credential check applied to every GET and POST.

use axum::http::{header, HeaderMap};
use subtle::ConstantTimeEq;

/// Compares caller credentials against the single configured token.
#[derive(Clone)]
pub struct Authenticator {
    token: String,
}

impl Authenticator {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    /// Returns true when the request carries the configured token, either as
    /// the second word of the `Authorization` header or, failing that, in the
    /// `token` query parameter.
    pub fn authenticate(&self, headers: &HeaderMap, query_token: Option<&str>) -> bool {
        match candidate_token(headers, query_token) {
            Some(candidate) => candidate.as_bytes().ct_eq(self.token.as_bytes()).into(),
            None => false,
        }
    }
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authenticator").finish_non_exhaustive()
    }
}

fn candidate_token<'a>(headers: &'a HeaderMap, query_token: Option<&'a str>) -> Option<&'a str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|raw| raw.split_whitespace().nth(1))
        .or(query_token)
        .filter(|t| !t.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn bearer(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn accepts_bearer_header() {
        let auth = Authenticator::new("s3cret");
        assert!(auth.authenticate(&bearer("Bearer s3cret"), None));
    }

    #[test]
    fn accepts_query_token_when_header_absent() {
        let auth = Authenticator::new("s3cret");
        assert!(auth.authenticate(&HeaderMap::new(), Some("s3cret")));
    }

    #[test]
    fn header_takes_precedence_over_query() {
        let auth = Authenticator::new("s3cret");
        assert!(!auth.authenticate(&bearer("Bearer wrong"), Some("s3cret")));
    }

    #[test]
    fn header_without_token_falls_back_to_query() {
        let auth = Authenticator::new("s3cret");
        assert!(auth.authenticate(&bearer("Bearer"), Some("s3cret")));
    }

    #[test]
    fn rejects_missing_or_mismatched_credentials() {
        let auth = Authenticator::new("s3cret");
        assert!(!auth.authenticate(&HeaderMap::new(), None));
        assert!(!auth.authenticate(&bearer("Bearer s3cre"), None));
        assert!(!auth.authenticate(&bearer("Bearer s3cret-and-more"), None));
        assert!(!auth.authenticate(&HeaderMap::new(), Some("")));
    }
}
