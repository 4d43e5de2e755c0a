pub mod auth;
pub mod config;
pub mod error;
pub mod frames;
pub mod registry;
pub mod server;
pub mod stream;

pub use auth::JwtAuthGate;
pub use config::{load_settings_from_path, settings_path, SettingsError, StreamSettings, VroomSettings};
pub use registry::{CloseReason, ConnectionHandle, ConnectionRegistry};
pub use server::{build_router, start, AppState, ServerConfig, ServerDeps, ServerHandle};
pub use stream::{FrameStream, StreamHandler};
