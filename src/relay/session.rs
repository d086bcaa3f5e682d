//! # Relay Session
//!
//! One client connection paired with one upstream connection.
//!
//! ## Lifecycle:
//! ```text
//! Connecting ──connected──▶ Open ──either side closes──▶ Closed
//!      │                      │
//!      └──connect fails / queue overflow──▶ Errored
//! ```
//! - While `Connecting`, client frames queue in arrival order (bounded)
//! - On connect, the queue drains in order before any live frame is forwarded
//! - `Connecting → Open` happens at most once; the terminal transition happens
//!   exactly once and later teardown calls are no-ops
//!
//! The session never touches sockets directly. Transports are reached through
//! [`ClientLink`] and [`UpstreamLink`], which keeps the ordering and teardown
//! rules testable without a network.

use crate::error::RelayError;
use crate::relay::event::RealtimeEvent;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Outbound half of the client transport.
pub trait ClientLink {
    fn send_text(&mut self, text: String);
    fn close_with(&mut self, reason: Option<String>);
}

/// Outbound half of the upstream transport.
pub trait UpstreamLink {
    fn send(&mut self, event: &RealtimeEvent) -> Result<(), RelayError>;
    fn disconnect(&mut self);
    fn is_connected(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpstreamState {
    Connecting,
    Open,
    Closed,
    Errored,
}

impl UpstreamState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, UpstreamState::Closed | UpstreamState::Errored)
    }
}

impl fmt::Display for UpstreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UpstreamState::Connecting => "connecting",
            UpstreamState::Open => "open",
            UpstreamState::Closed => "closed",
            UpstreamState::Errored => "errored",
        };
        f.write_str(name)
    }
}

/// Shared flag that flips to dead when the session tears down.
///
/// Work submitted on behalf of a session (analysis passes, timers) captures a
/// clone and checks it before delivering results.
#[derive(Debug, Clone)]
pub struct SessionLiveness(Arc<AtomicBool>);

impl SessionLiveness {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    pub fn is_alive(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn kill(&self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Default for SessionLiveness {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-session counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionCounters {
    pub client_messages_forwarded: u64,
    pub upstream_events_forwarded: u64,
    pub messages_queued: u64,
    pub peak_queue_depth: u64,
    pub malformed_frames_dropped: u64,
    pub upstream_send_failures: u64,
}

impl SessionCounters {
    /// Add another session's counters into this one.
    pub fn merge(&mut self, other: &SessionCounters) {
        self.client_messages_forwarded += other.client_messages_forwarded;
        self.upstream_events_forwarded += other.upstream_events_forwarded;
        self.messages_queued += other.messages_queued;
        self.peak_queue_depth = self.peak_queue_depth.max(other.peak_queue_depth);
        self.malformed_frames_dropped += other.malformed_frames_dropped;
        self.upstream_send_failures += other.upstream_send_failures;
    }
}

pub struct RelaySession<U> {
    id: Uuid,
    state: UpstreamState,
    pending: VecDeque<String>,
    max_pending: usize,
    upstream: Option<U>,
    liveness: SessionLiveness,
    counters: SessionCounters,
}

impl<U: UpstreamLink> RelaySession<U> {
    pub fn new(max_pending: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            state: UpstreamState::Connecting,
            pending: VecDeque::new(),
            max_pending,
            upstream: None,
            liveness: SessionLiveness::new(),
            counters: SessionCounters::default(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> UpstreamState {
        self.state
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn counters(&self) -> SessionCounters {
        self.counters
    }

    pub fn liveness(&self) -> SessionLiveness {
        self.liveness.clone()
    }

    pub fn is_terminated(&self) -> bool {
        self.state.is_terminal()
    }

    /// A text frame from the client.
    pub fn on_client_message<C: ClientLink>(&mut self, text: String, client: &mut C) {
        match self.state {
            UpstreamState::Connecting => {
                if self.pending.len() >= self.max_pending {
                    warn!(
                        session_id = %self.id,
                        limit = self.max_pending,
                        "Pending queue overflow while connecting upstream"
                    );
                    self.fail(RelayError::PendingOverflow(self.max_pending), client);
                    return;
                }

                self.pending.push_back(text);
                self.counters.messages_queued += 1;
                self.counters.peak_queue_depth = self.counters.peak_queue_depth.max(self.pending.len() as u64);
                debug!(session_id = %self.id, depth = self.pending.len(), "Queued client message");
            }
            UpstreamState::Open => self.forward_to_upstream(text),
            UpstreamState::Closed | UpstreamState::Errored => {
                debug!(session_id = %self.id, "Ignoring client message after teardown");
            }
        }
    }

    /// The upstream handshake finished. Drains the queue in arrival order.
    ///
    /// Returns `false` when the session was torn down while connecting; the
    /// late connection is disconnected straight away.
    pub fn on_upstream_connected(&mut self, mut upstream: U) -> bool {
        if self.state != UpstreamState::Connecting {
            debug!(session_id = %self.id, state = %self.state, "Discarding late upstream connection");
            upstream.disconnect();
            return false;
        }

        self.state = UpstreamState::Open;
        self.upstream = Some(upstream);
        info!(session_id = %self.id, queued = self.pending.len(), "Connected to upstream");

        while let Some(text) = self.pending.pop_front() {
            self.forward_to_upstream(text);
        }

        true
    }

    /// The upstream handshake failed. The client is closed and the session ends.
    pub fn on_upstream_connect_failed<C: ClientLink>(&mut self, err: RelayError, client: &mut C) {
        if self.state != UpstreamState::Connecting {
            return;
        }
        self.fail(err, client);
    }

    /// Forward an upstream event to the client verbatim.
    pub fn on_upstream_event<C: ClientLink>(&mut self, event: &RealtimeEvent, client: &mut C) {
        if self.state != UpstreamState::Open {
            return;
        }
        client.send_text(event.raw().to_string());
        self.counters.upstream_events_forwarded += 1;
    }

    /// An upstream frame that did not decode. Dropped; the session stays open.
    pub fn on_upstream_malformed(&mut self, err: &RelayError) {
        warn!(session_id = %self.id, error = %err, "Dropping malformed upstream frame");
        self.counters.malformed_frames_dropped += 1;
    }

    /// Upstream went away: close the client.
    pub fn on_upstream_closed<C: ClientLink>(&mut self, reason: Option<String>, client: &mut C) {
        if self.terminate(UpstreamState::Closed) {
            info!(session_id = %self.id, reason = ?reason, "Upstream closed, closing client");
            client.close_with(reason);
        }
    }

    /// Client went away: disconnect upstream.
    pub fn on_client_closed(&mut self) {
        if self.terminate(UpstreamState::Closed) {
            info!(session_id = %self.id, "Client closed, upstream disconnected");
        }
    }

    /// Close both sides. Safe to call any number of times.
    pub fn teardown<C: ClientLink>(&mut self, client: &mut C, reason: Option<String>) {
        if self.terminate(UpstreamState::Closed) {
            client.close_with(reason);
        }
    }

    fn fail<C: ClientLink>(&mut self, err: RelayError, client: &mut C) {
        let dropped = self.pending_len();
        if self.terminate(UpstreamState::Errored) {
            error!(session_id = %self.id, error = %err, dropped, "Session failed");
            client.close_with(Some(err.to_string()));
        }
    }

    fn forward_to_upstream(&mut self, text: String) {
        let event = match RealtimeEvent::parse(text) {
            Ok(event) => event,
            Err(err) => {
                warn!(session_id = %self.id, error = %err, "Dropping malformed client frame");
                self.counters.malformed_frames_dropped += 1;
                return;
            }
        };

        let Some(upstream) = self.upstream.as_mut() else {
            return;
        };

        match upstream.send(&event) {
            Ok(()) => self.counters.client_messages_forwarded += 1,
            Err(err) => {
                warn!(session_id = %self.id, kind = %event.kind(), error = %err, "Upstream send failed");
                self.counters.upstream_send_failures += 1;
            }
        }
    }

    /// Move to a terminal state. Returns `false` if already terminal.
    fn terminate(&mut self, final_state: UpstreamState) -> bool {
        if self.state.is_terminal() {
            return false;
        }

        self.state = final_state;
        self.liveness.kill();
        self.pending.clear();
        if let Some(mut upstream) = self.upstream.take() {
            upstream.disconnect();
        }
        true
    }
}

impl<U> fmt::Debug for RelaySession<U> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelaySession")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("pending", &self.pending.len())
            .field("counters", &self.counters)
            .finish()
    }
}
