use async_trait::async_trait;
use chrono::Utc;
use rusqlite::OptionalExtension;
use tracing::instrument;

use vroom_core::{LookupError, RoomStatus, SessionId, SessionRecord, SessionRepository};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

const ROOM_COLUMNS: &str = "id, title, status, created_at, updated_at";

#[derive(Clone)]
pub struct RoomRepo {
    db: Database,
}

impl RoomRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a new room with a generated id.
    pub fn create(&self, title: &str) -> Result<SessionRecord, StoreError> {
        self.create_with_id(&SessionId::new(), title)
    }

    /// Create a room under an id issued elsewhere (e.g. by the scheduling app).
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn create_with_id(&self, id: &SessionId, title: &str) -> Result<SessionRecord, StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO virtual_rooms (id, title, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![id.as_str(), title, RoomStatus::Scheduled.as_str(), now, now],
            )?;
            if inserted == 0 {
                return Err(StoreError::Conflict(format!("room {id} already exists")));
            }

            Ok(SessionRecord {
                id: id.clone(),
                title: title.to_string(),
                status: RoomStatus::Scheduled,
                created_at: now.clone(),
                updated_at: now,
            })
        })
    }

    /// Get a room by ID.
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn get(&self, id: &SessionId) -> Result<SessionRecord, StoreError> {
        self.find(id)?
            .ok_or_else(|| StoreError::NotFound(format!("room {id}")))
    }

    /// Look a room up, treating absence as `None`.
    pub fn find(&self, id: &SessionId) -> Result<Option<SessionRecord>, StoreError> {
        self.db.with_conn(|conn| {
            let raw = conn
                .query_row(
                    &format!("SELECT {ROOM_COLUMNS} FROM virtual_rooms WHERE id = ?1"),
                    [id.as_str()],
                    raw_room,
                )
                .optional()?;
            raw.map(RawRoom::into_record).transpose()
        })
    }

    #[instrument(skip(self), fields(session_id = %id, status = %status))]
    pub fn set_status(&self, id: &SessionId, status: RoomStatus) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE virtual_rooms SET status = ?1, updated_at = ?2 WHERE id = ?3",
                rusqlite::params![status.as_str(), now, id.as_str()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("room {id}")));
            }
            Ok(())
        })
    }

    /// List rooms, newest first, optionally filtered by status.
    pub fn list(&self, status: Option<RoomStatus>, limit: u32) -> Result<Vec<SessionRecord>, StoreError> {
        self.db.with_conn(|conn| {
            let raws: Vec<RawRoom> = match status {
                Some(status) => conn
                    .prepare(&format!(
                        "SELECT {ROOM_COLUMNS} FROM virtual_rooms WHERE status = ?1
                         ORDER BY created_at DESC LIMIT ?2"
                    ))?
                    .query_map(rusqlite::params![status.as_str(), limit], raw_room)?
                    .collect::<Result<_, _>>()?,
                None => conn
                    .prepare(&format!(
                        "SELECT {ROOM_COLUMNS} FROM virtual_rooms ORDER BY created_at DESC LIMIT ?1"
                    ))?
                    .query_map([limit], raw_room)?
                    .collect::<Result<_, _>>()?,
            };
            raws.into_iter().map(RawRoom::into_record).collect()
        })
    }
}

#[async_trait]
impl SessionRepository for RoomRepo {
    async fn find_by_id(&self, id: &SessionId) -> Result<Option<SessionRecord>, LookupError> {
        let repo = self.clone();
        let id = id.clone();
        tokio::task::spawn_blocking(move || repo.find(&id))
            .await
            .map_err(|e| LookupError::Backend(format!("lookup task failed: {e}")))?
            .map_err(LookupError::from)
    }
}

struct RawRoom {
    id: String,
    title: String,
    status: String,
    created_at: String,
    updated_at: String,
}

impl RawRoom {
    fn into_record(self) -> Result<SessionRecord, StoreError> {
        Ok(SessionRecord {
            id: SessionId::from_raw(self.id),
            title: self.title,
            status: row_helpers::parse_enum(&self.status, "virtual_rooms", "status")?,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

fn raw_room(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRoom> {
    Ok(RawRoom {
        id: row.get(0)?,
        title: row.get(1)?,
        status: row.get(2)?,
        created_at: row.get(3)?,
        updated_at: row.get(4)?,
    })
}
