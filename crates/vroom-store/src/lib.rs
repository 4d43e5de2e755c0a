pub mod database;
pub mod error;
pub mod participants;
pub mod rooms;
pub mod row_helpers;
pub mod schema;
pub mod snapshots;

pub use database::Database;
pub use error::StoreError;
pub use participants::{ParticipantRepo, ParticipantRow};
pub use rooms::RoomRepo;
pub use snapshots::StoreStateProvider;
