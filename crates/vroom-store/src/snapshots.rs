//! Snapshot assembly from persisted room state.

use async_trait::async_trait;
use serde_json::json;

use vroom_core::{ParticipantId, ProviderError, SessionId, SessionStateProvider, Snapshot};

use crate::database::Database;
use crate::participants::ParticipantRepo;
use crate::rooms::RoomRepo;

/// Builds snapshots straight from the `virtual_rooms` and `room_participants` tables.
///
/// Without a participant id the snapshot carries the whole roster; with one it
/// carries only that participant (or `null` when they have not joined).
#[derive(Clone)]
pub struct StoreStateProvider {
    rooms: RoomRepo,
    participants: ParticipantRepo,
}

impl StoreStateProvider {
    pub fn new(db: Database) -> Self {
        Self {
            rooms: RoomRepo::new(db.clone()),
            participants: ParticipantRepo::new(db),
        }
    }

    fn build(
        &self,
        session_id: &SessionId,
        participant_id: Option<&ParticipantId>,
    ) -> Result<Option<Snapshot>, ProviderError> {
        let Some(room) = self.rooms.find(session_id)? else {
            return Ok(None);
        };

        let mut value = json!({
            "sessionId": room.id,
            "status": room.status,
            "title": room.title,
            "updatedAt": room.updated_at,
        });

        match participant_id {
            Some(pid) => {
                let participant = self.participants.get(session_id, pid)?;
                value["participant"] = serde_json::to_value(participant)?;
            }
            None => {
                let roster = self.participants.list_for_room(session_id)?;
                value["participants"] = serde_json::to_value(roster)?;
            }
        }

        Ok(Some(Snapshot::new(value)))
    }
}

#[async_trait]
impl SessionStateProvider for StoreStateProvider {
    async fn get_session_state(
        &self,
        session_id: &SessionId,
        participant_id: Option<&ParticipantId>,
    ) -> Result<Option<Snapshot>, ProviderError> {
        // SQLite reads block; keep them off the async workers.
        let provider = self.clone();
        let session_id = session_id.clone();
        let participant_id = participant_id.cloned();
        tokio::task::spawn_blocking(move || provider.build(&session_id, participant_id.as_ref()))
            .await
            .map_err(|e| ProviderError::Unavailable(format!("snapshot task failed: {e}")))?
    }
}
