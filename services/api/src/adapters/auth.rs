//! services/api/src/adapters/auth.rs
//!
//! Resolves browser session tokens against a fixed table loaded from configuration.
//! It implements the `AuthSessionValidator` port.

use async_trait::async_trait;
use interview_core::domain::UserId;
use interview_core::ports::{AuthSessionValidator, PortError, PortResult};
use std::collections::HashMap;

pub struct StaticTokenValidator {
    tokens: HashMap<String, UserId>,
}

impl StaticTokenValidator {
    pub fn new(tokens: impl IntoIterator<Item = (String, UserId)>) -> Self {
        Self { tokens: tokens.into_iter().collect() }
    }
}

#[async_trait]
impl AuthSessionValidator for StaticTokenValidator {
    async fn validate_auth_session(&self, session_token: &str) -> PortResult<UserId> {
        self.tokens.get(session_token).copied().ok_or(PortError::Unauthorized)
    }
}
