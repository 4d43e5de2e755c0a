pub mod auth;
pub mod errors;
pub mod ids;
pub mod session;
pub mod snapshot;

pub use auth::{AuthGate, Principal};
pub use errors::{AuthError, LookupError, ProviderError};
pub use ids::{ConnectionId, ParticipantId, SessionId};
pub use session::{RoomStatus, SessionRecord, SessionRepository};
pub use snapshot::{SessionStateProvider, Snapshot};
