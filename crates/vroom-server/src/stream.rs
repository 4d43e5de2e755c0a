//! Per-connection stream lifecycle.
//!
//! Each accepted stream gets one spawned task that pushes an optional `init`
//! frame, then drives a heartbeat loop and a refresh loop concurrently until
//! the connection's lifetime token is cancelled. Both loops watch the same
//! token, and only the task itself unregisters, so cleanup happens once no
//! matter which side ended the stream.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use pin_project_lite::pin_project;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vroom_core::{ParticipantId, SessionId, SessionStateProvider};
use vroom_telemetry::MetricsRecorder;

use crate::config::StreamSettings;
use crate::frames::Frame;
use crate::registry::{CloseReason, ConnectionHandle, ConnectionRegistry};

/// Opens streams and owns the shared pieces every connection task needs.
pub struct StreamHandler {
    registry: Arc<ConnectionRegistry>,
    provider: Arc<dyn SessionStateProvider>,
    metrics: Arc<MetricsRecorder>,
    heartbeat_interval: Duration,
    refresh_interval: Duration,
    send_queue: usize,
    shutdown: CancellationToken,
}

impl StreamHandler {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        provider: Arc<dyn SessionStateProvider>,
        metrics: Arc<MetricsRecorder>,
        settings: &StreamSettings,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            registry,
            provider,
            metrics,
            heartbeat_interval: settings.heartbeat_interval(),
            refresh_interval: settings.refresh_interval(),
            send_queue: settings.send_queue.max(1),
            shutdown,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Register a new connection for an already authorized session and start
    /// its task. The returned stream yields frames until the connection ends;
    /// dropping it closes the connection.
    pub fn open(&self, session_id: SessionId, participant_id: Option<ParticipantId>) -> FrameStream {
        let handle = ConnectionHandle::new(session_id, participant_id, self.shutdown.child_token());
        let (tx, rx) = mpsc::channel(self.send_queue);

        if self.registry.register(handle.clone()).is_some() {
            self.metrics.counter_inc("vroom.connections.evicted", &[], 1);
        }
        self.metrics.counter_inc("vroom.connections.opened", &[], 1);
        self.metrics.gauge_inc("vroom.connections.active", &[], 1);

        info!(
            session_id = %handle.session_id(),
            connection_id = %handle.id(),
            participant_id = handle.participant_id().map(|p| p.as_str()),
            "stream opened"
        );

        let task = ConnectionTask {
            handle: handle.clone(),
            tx,
            registry: Arc::clone(&self.registry),
            provider: Arc::clone(&self.provider),
            metrics: Arc::clone(&self.metrics),
            heartbeat_interval: self.heartbeat_interval,
            refresh_interval: self.refresh_interval,
        };
        tokio::spawn(task.run());

        FrameStream {
            inner: ReceiverStream::new(rx),
            guard: CloseOnDrop(handle),
        }
    }
}

struct ConnectionTask {
    handle: ConnectionHandle,
    tx: mpsc::Sender<Frame>,
    registry: Arc<ConnectionRegistry>,
    provider: Arc<dyn SessionStateProvider>,
    metrics: Arc<MetricsRecorder>,
    heartbeat_interval: Duration,
    refresh_interval: Duration,
}

impl ConnectionTask {
    async fn run(self) {
        if let Some(snapshot) = self.fetch().await {
            self.emit(Frame::Init(snapshot)).await;
        }

        if !self.handle.is_closed() {
            tokio::join!(self.heartbeat_loop(), self.refresh_loop());
        }

        self.cleanup();
    }

    async fn heartbeat_loop(&self) {
        let mut ticker = interval_at(Instant::now() + self.heartbeat_interval, self.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                () = self.handle.closed() => break,
                _ = ticker.tick() => {
                    if !self.emit(Frame::Heartbeat).await {
                        break;
                    }
                }
            }
        }
    }

    async fn refresh_loop(&self) {
        let mut ticker = interval_at(Instant::now() + self.refresh_interval, self.refresh_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                () = self.handle.closed() => break,
                _ = ticker.tick() => {
                    if let Some(snapshot) = self.fetch().await {
                        if !self.emit(Frame::Update(snapshot)).await {
                            break;
                        }
                    }
                }
            }
        }
    }

    /// One provider read. Failures are logged and reported as "nothing new".
    async fn fetch(&self) -> Option<vroom_core::Snapshot> {
        let read = self
            .provider
            .get_session_state(self.handle.session_id(), self.handle.participant_id());

        let result = tokio::select! {
            biased;
            () = self.handle.closed() => return None,
            result = read => result,
        };

        match result {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.metrics
                    .counter_inc("vroom.refresh.failures", &[("kind", e.error_kind())], 1);
                debug!(
                    session_id = %self.handle.session_id(),
                    connection_id = %self.handle.id(),
                    error = %e,
                    "state fetch failed, retrying next tick"
                );
                None
            }
        }
    }

    /// Queue a frame for the client. Returns false once the connection is
    /// closing, in which case nothing more should be sent.
    async fn emit(&self, frame: Frame) -> bool {
        let kind = frame.kind();
        let sent = tokio::select! {
            biased;
            () = self.handle.closed() => return false,
            sent = self.tx.send(frame) => sent,
        };

        match sent {
            Ok(()) => {
                self.metrics.counter_inc("vroom.frames.sent", &[("kind", kind)], 1);
                true
            }
            Err(_) => {
                debug!(
                    session_id = %self.handle.session_id(),
                    connection_id = %self.handle.id(),
                    frame = kind,
                    "write failed, closing connection"
                );
                self.handle.close(CloseReason::TransportError);
                false
            }
        }
    }

    fn cleanup(&self) {
        let reason = self.handle.close_reason().unwrap_or(CloseReason::Shutdown);
        // Make sure the token is cancelled even if the loops exited on their own.
        self.handle.close(reason);

        let removed = self.registry.unregister(self.handle.session_id(), self.handle.id());
        self.metrics.gauge_inc("vroom.connections.active", &[], -1);
        self.metrics
            .counter_inc("vroom.connections.closed", &[("reason", reason.as_str())], 1);

        if reason == CloseReason::TransportError {
            warn!(
                session_id = %self.handle.session_id(),
                connection_id = %self.handle.id(),
                "stream closed after transport failure"
            );
        } else {
            info!(
                session_id = %self.handle.session_id(),
                connection_id = %self.handle.id(),
                reason = %reason,
                was_registered = removed,
                "stream closed"
            );
        }
    }
}

/// Closes the connection when the response body is dropped (client abort).
struct CloseOnDrop(ConnectionHandle);

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        self.0.close(CloseReason::ClientGone);
    }
}

pin_project! {
    /// Frames for one connection, in send order.
    pub struct FrameStream {
        #[pin]
        inner: ReceiverStream<Frame>,
        guard: CloseOnDrop,
    }
}

impl FrameStream {
    pub fn handle(&self) -> &ConnectionHandle {
        &self.guard.0
    }
}

impl Stream for FrameStream {
    type Item = Frame;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.project().inner.poll_next(cx)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}
