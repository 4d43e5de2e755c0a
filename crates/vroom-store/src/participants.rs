use chrono::Utc;
use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use vroom_core::{ParticipantId, SessionId};

use crate::database::Database;
use crate::error::StoreError;

/// One participant's progress inside a room.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantRow {
    pub participant_id: ParticipantId,
    pub display_name: String,
    pub status: String,
    pub progress: f64,
    pub updated_at: String,
}

#[derive(Clone)]
pub struct ParticipantRepo {
    db: Database,
}

impl ParticipantRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Join a participant to a room, or refresh their display name if already joined.
    #[instrument(skip(self), fields(session_id = %room_id, participant_id = %participant_id))]
    pub fn upsert(
        &self,
        room_id: &SessionId,
        participant_id: &ParticipantId,
        display_name: &str,
    ) -> Result<ParticipantRow, StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO room_participants (room_id, participant_id, display_name, status, progress, updated_at)
                 VALUES (?1, ?2, ?3, 'joined', 0.0, ?4)
                 ON CONFLICT(room_id, participant_id)
                 DO UPDATE SET display_name = excluded.display_name, updated_at = excluded.updated_at",
                rusqlite::params![room_id.as_str(), participant_id.as_str(), display_name, now],
            )?;
            Ok(())
        })?;
        self.get(room_id, participant_id)?
            .ok_or_else(|| StoreError::NotFound(format!("participant {participant_id}")))
    }

    /// Record progress (0.0..=1.0) and a free-form status such as `answering` or `submitted`.
    pub fn set_progress(
        &self,
        room_id: &SessionId,
        participant_id: &ParticipantId,
        status: &str,
        progress: f64,
    ) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        let progress = progress.clamp(0.0, 1.0);
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE room_participants SET status = ?1, progress = ?2, updated_at = ?3
                 WHERE room_id = ?4 AND participant_id = ?5",
                rusqlite::params![status, progress, now, room_id.as_str(), participant_id.as_str()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!(
                    "participant {participant_id} in room {room_id}"
                )));
            }
            Ok(())
        })
    }

    pub fn get(
        &self,
        room_id: &SessionId,
        participant_id: &ParticipantId,
    ) -> Result<Option<ParticipantRow>, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT participant_id, display_name, status, progress, updated_at
                     FROM room_participants WHERE room_id = ?1 AND participant_id = ?2",
                    [room_id.as_str(), participant_id.as_str()],
                    row_to_participant,
                )
                .optional()?)
        })
    }

    /// All participants of a room, in join order.
    pub fn list_for_room(&self, room_id: &SessionId) -> Result<Vec<ParticipantRow>, StoreError> {
        self.db.with_conn(|conn| {
            let rows = conn
                .prepare(
                    "SELECT participant_id, display_name, status, progress, updated_at
                     FROM room_participants WHERE room_id = ?1 ORDER BY rowid",
                )?
                .query_map([room_id.as_str()], row_to_participant)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

fn row_to_participant(row: &rusqlite::Row<'_>) -> rusqlite::Result<ParticipantRow> {
    Ok(ParticipantRow {
        participant_id: ParticipantId::from_raw(row.get::<_, String>(0)?),
        display_name: row.get(1)?,
        status: row.get(2)?,
        progress: row.get(3)?,
        updated_at: row.get(4)?,
    })
}
