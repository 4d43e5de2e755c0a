use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::AuthError;

/// Identity resolved from a verified bearer credential.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

impl Principal {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            role: None,
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }
}

/// Verifies bearer credentials. Token issuance lives elsewhere.
#[async_trait]
pub trait AuthGate: Send + Sync {
    async fn verify(&self, token: &str) -> Result<Principal, AuthError>;
}
