use axum::http::{header, HeaderMap};

/// Answers "is this caller authenticated". Account management lives outside
/// this server; it only has to expose this check.
pub trait SessionGate: Send + Sync {
    /// `query_token` is the already decoded `token` query parameter.
    fn admits(&self, headers: &HeaderMap, query_token: Option<&str>) -> bool;
}

/// Shared-secret gate: `Authorization: Bearer <token>` or `?token=<token>`.
/// With no token configured every caller is admitted.
pub struct TokenGate {
    token: Option<String>,
}

impl TokenGate {
    pub fn new(token: Option<String>) -> Self {
        Self { token }
    }
}

impl SessionGate for TokenGate {
    fn admits(&self, headers: &HeaderMap, query_token: Option<&str>) -> bool {
        let Some(expected) = self.token.as_deref() else {
            return true;
        };

        let bearer = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim);
        if bearer == Some(expected) {
            return true;
        }

        query_token == Some(expected)
    }
}
