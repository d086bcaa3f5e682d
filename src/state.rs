//! # Application State Management
//!
//! State shared by every HTTP handler and every relay session actor.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc (Atomically Reference Counted)
//! - Every worker thread holds a clone of `AppState`; the data behind the
//!   `Arc`s is shared, not copied
//!
//! ### RwLock (Reader-Writer Lock)
//! - Metrics are written when sessions open and close and read by the
//!   `/metrics` endpoint; many readers, one writer at a time
//!
//! ### Non-owning registry
//! - Sessions are registered as weak actor addresses. The registry can reach
//!   a live session (for shutdown) but never keeps one alive.
//!
//! Configuration is immutable once the server starts, so it sits behind a
//! plain `Arc` without a lock.

use crate::animation::scheduler::SchedulerStats;
use crate::audio::analyzer::AnalyzerStats;
use crate::config::AppConfig;
use crate::error::ConnectionRejected;
use crate::relay::registry::SessionRegistry;
use crate::relay::session::{SessionCounters, UpstreamState};
use crate::relay::upstream::RealtimeConnector;
use crate::websocket::{RelaySocket, Shutdown};
use actix::WeakAddr;
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;
use tracing::info;

/// Registry of live relay sessions keyed by session id.
pub type Sessions = SessionRegistry<WeakAddr<RelaySocket>>;

/// The application state shared across handlers and session actors.
#[derive(Clone)]
pub struct AppState {
    /// Effective configuration (read-only after startup)
    pub config: Arc<AppConfig>,

    /// Aggregate relay counters
    pub metrics: Arc<RwLock<RelayMetrics>>,

    /// Live sessions, bounded by `relay.max_concurrent_sessions`
    pub sessions: Arc<Sessions>,

    /// Opens upstream connections for new sessions
    pub connector: RealtimeConnector,

    /// When the server started
    pub start_time: Instant,
}

/// Counters aggregated across every session since startup.
///
/// Per-session counters are folded in when a session tears down, so
/// `relay` and `animation` cover finished sessions only.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RelayMetrics {
    pub sessions_accepted: u64,
    pub sessions_active: u64,
    pub sessions_closed: u64,
    pub sessions_errored: u64,
    pub rejections: RejectionCounts,
    pub upstream_connect_failures: u64,
    pub relay: SessionCounters,
    pub animation: AnimationTotals,
}

/// Connection attempts turned away by the gateway, by reason.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RejectionCounts {
    pub invalid_path: u64,
    pub not_websocket: u64,
    pub at_capacity: u64,
}

impl RejectionCounts {
    pub fn total(&self) -> u64 {
        self.invalid_path + self.not_websocket + self.at_capacity
    }
}

/// Lip-sync work summed over finished sessions.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct AnimationTotals {
    pub events_enqueued: u64,
    pub ticks: u64,
    pub frames: u64,
    pub updates_emitted: u64,
    pub resets: u64,
    pub chunks_analyzed: u64,
    pub frames_analyzed: u64,
    pub silent_frames: u64,
    pub samples_discarded: u64,
}

impl AnimationTotals {
    pub fn add_scheduler(&mut self, stats: &SchedulerStats) {
        self.events_enqueued += stats.events_enqueued;
        self.ticks += stats.ticks;
        self.frames += stats.frames;
        self.updates_emitted += stats.updates_emitted;
        self.resets += stats.resets;
    }

    pub fn add_analyzer(&mut self, stats: &AnalyzerStats) {
        self.chunks_analyzed += stats.chunks;
        self.frames_analyzed += stats.frames_analyzed;
        self.silent_frames += stats.silent_frames;
        self.samples_discarded += stats.samples_discarded;
    }
}

/// Final numbers from one session, reported when it stops.
#[derive(Debug, Clone, Copy)]
pub struct SessionReport {
    pub counters: SessionCounters,
    pub final_state: UpstreamState,
    pub animation: Option<(SchedulerStats, AnalyzerStats)>,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        let connector = RealtimeConnector::from_config(&config.relay);
        let sessions = SessionRegistry::new(config.relay.max_concurrent_sessions);

        Self {
            config: Arc::new(config),
            metrics: Arc::new(RwLock::new(RelayMetrics::default())),
            sessions: Arc::new(sessions),
            connector,
            start_time: Instant::now(),
        }
    }

    pub fn get_config(&self) -> &AppConfig {
        &self.config
    }

    /// A session actor started and registered itself.
    pub fn record_session_opened(&self) {
        let mut metrics = self.metrics_mut();
        metrics.sessions_accepted += 1;
        metrics.sessions_active += 1;
    }

    /// A session actor stopped. Folds its counters into the totals.
    pub fn record_session_closed(&self, report: &SessionReport) {
        let mut metrics = self.metrics_mut();
        metrics.sessions_active = metrics.sessions_active.saturating_sub(1);
        metrics.sessions_closed += 1;
        if report.final_state == UpstreamState::Errored {
            metrics.sessions_errored += 1;
        }

        metrics.relay.merge(&report.counters);
        if let Some((scheduler, analyzer)) = &report.animation {
            metrics.animation.add_scheduler(scheduler);
            metrics.animation.add_analyzer(analyzer);
        }
    }

    pub fn record_rejected(&self, reason: &ConnectionRejected) {
        let mut metrics = self.metrics_mut();
        match reason {
            ConnectionRejected::InvalidPath(_) => metrics.rejections.invalid_path += 1,
            ConnectionRejected::NotWebsocket(_) => metrics.rejections.not_websocket += 1,
            ConnectionRejected::AtCapacity(_) => metrics.rejections.at_capacity += 1,
        }
    }

    pub fn record_connect_failure(&self) {
        self.metrics_mut().upstream_connect_failures += 1;
    }

    /// Copy of the current metrics; the lock is released before returning.
    pub fn metrics_snapshot(&self) -> RelayMetrics {
        self.metrics_ref().clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Ask every live session to tear down. Returns how many were reached.
    pub fn shutdown_all(&self) -> usize {
        let mut reached = 0;
        for handle in self.sessions.handles() {
            if let Some(addr) = handle.upgrade() {
                addr.do_send(Shutdown);
                reached += 1;
            }
        }
        info!(sessions = reached, "Asked live sessions to shut down");
        reached
    }

    fn metrics_ref(&self) -> RwLockReadGuard<'_, RelayMetrics> {
        self.metrics.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn metrics_mut(&self) -> RwLockWriteGuard<'_, RelayMetrics> {
        self.metrics.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppState")
            .field("config", &self.config.redacted())
            .field("sessions", &self.sessions.len())
            .field("start_time", &self.start_time)
            .finish()
    }
}
