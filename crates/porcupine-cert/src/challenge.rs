//! HTTP-01 challenge responses shared between the ACME client and the HTTP listener

use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

/// Path prefix ACME servers fetch challenge tokens from
pub const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// Token → key authorization map
#[derive(Debug, Clone, Default)]
pub struct Http01ChallengeStore {
    tokens: Arc<DashMap<String, String>>,
}

impl Http01ChallengeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, token: &str, key_authorization: &str) {
        debug!(token, "Publishing HTTP-01 challenge");
        self.tokens
            .insert(token.to_string(), key_authorization.to_string());
    }

    pub fn withdraw(&self, token: &str) {
        self.tokens.remove(token);
    }

    pub fn get(&self, token: &str) -> Option<String> {
        self.tokens.get(token).map(|v| v.value().clone())
    }

    /// Answer for a request path, if it is a challenge path
    ///
    /// `None` means the path is not an ACME challenge path at all;
    /// `Some(None)` means it is one but the token is unknown.
    pub fn respond(&self, path: &str) -> Option<Option<String>> {
        let token = path.strip_prefix(ACME_CHALLENGE_PREFIX)?;
        Some(self.get(token))
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}
