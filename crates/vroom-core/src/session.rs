use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::LookupError;
use crate::ids::SessionId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomStatus {
    Scheduled,
    Running,
    Paused,
    Finished,
}

impl RoomStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Finished => "finished",
        }
    }
}

impl std::fmt::Display for RoomStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RoomStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(Self::Scheduled),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "finished" => Ok(Self::Finished),
            other => Err(format!("unknown room status: {other}")),
        }
    }
}

/// A persisted virtual-room session. Read-only from the broadcast side.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: SessionId,
    pub title: String,
    pub status: RoomStatus,
    pub created_at: String,
    pub updated_at: String,
}

#[async_trait]
pub trait SessionRepository: Send + Sync {
    /// `Ok(None)` is a miss; `Err` means the backend itself failed.
    async fn find_by_id(&self, id: &SessionId) -> Result<Option<SessionRecord>, LookupError>;
}
