use axum::response::sse::Event;
use vroom_core::Snapshot;

/// One server-push frame on a virtual-room stream.
#[derive(Clone, Debug, PartialEq)]
pub enum Frame {
    /// First snapshot, sent at most once when the stream opens.
    Init(Snapshot),
    Update(Snapshot),
    /// Comment-only keep-alive; clients never see it as a data event.
    Heartbeat,
}

impl Frame {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Init(_) => "init",
            Self::Update(_) => "update",
            Self::Heartbeat => "heartbeat",
        }
    }

    /// Exact bytes this frame occupies on the wire.
    pub fn encode(&self) -> String {
        match self {
            Self::Init(snapshot) | Self::Update(snapshot) => {
                format!("event: {}\ndata: {}\n\n", self.kind(), snapshot.to_json())
            }
            Self::Heartbeat => ": heartbeat\n\n".to_string(),
        }
    }

    pub fn into_event(self) -> Event {
        match self {
            Self::Init(snapshot) => Event::default().event("init").data(snapshot.to_json()),
            Self::Update(snapshot) => Event::default().event("update").data(snapshot.to_json()),
            Self::Heartbeat => Event::default().comment("heartbeat"),
        }
    }
}
