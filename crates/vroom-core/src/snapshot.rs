use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::ProviderError;
use crate::ids::{ParticipantId, SessionId};

/// Opaque, possibly participant-scoped view of a session's live state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Snapshot(Value);

impl Snapshot {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    /// Compact JSON text, as it goes on the wire.
    pub fn to_json(&self) -> String {
        self.0.to_string()
    }
}

impl From<Value> for Snapshot {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

/// Computes session state snapshots. `Ok(None)` means nothing to report yet
/// and is not an error.
#[async_trait]
pub trait SessionStateProvider: Send + Sync {
    async fn get_session_state(
        &self,
        session_id: &SessionId,
        participant_id: Option<&ParticipantId>,
    ) -> Result<Option<Snapshot>, ProviderError>;
}
