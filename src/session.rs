use log::{debug, warn};
use serde_json::Value;
use crate::error::TokenError;

/// Mutable state threaded through one run.
#[derive(Debug, Default)]
pub struct SessionState {
    pub auth_token: Option<String>,
    pub total: usize,
    pub passed: usize,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores the first token seen in the run. Later tokens are ignored.
    pub fn record_token(&mut self, token: String) -> bool {
        if self.auth_token.is_some() {
            warn!("Ignoring token from a second login check");
            return false;
        }
        debug!("Stored auth token ({} chars)", token.len());
        self.auth_token = Some(token);
        true
    }

    pub fn token(&self) -> Option<&str> {
        self.auth_token.as_deref()
    }

    pub fn count(&mut self, passed: bool) {
        self.total += 1;
        if passed {
            self.passed += 1;
        }
    }
}

/// Pulls a string token out of a JSON body, following a dotted path like `data.token`.
pub fn extract_token(body: &str, path: &str) -> Result<String, TokenError> {
    let root: Value = serde_json::from_str(body)?;
    let mut node = &root;
    for key in path.split('.').filter(|k| !k.is_empty()) {
        node = node
            .get(key)
            .ok_or_else(|| TokenError::Missing(path.to_string()))?;
    }
    match node.as_str() {
        Some(token) if !token.is_empty() => Ok(token.to_string()),
        _ => Err(TokenError::Missing(path.to_string())),
    }
}
