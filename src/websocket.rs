//! # Relay WebSocket Actor
//!
//! One actor per accepted client connection. The actor owns exactly one
//! [`RelaySession`] plus, when animation is enabled, one [`LipSync`]
//! pipeline, and is the only place either of them is mutated.
//!
//! ## Streams feeding the actor:
//! - client websocket frames (added by `ws::start`)
//! - upstream events, added once the upstream handshake completes
//! - analysis results from the session's analyzer worker (continuous mode)
//!
//! ## Timers:
//! - heartbeat: ping every `heartbeat_interval_secs`, tear down after
//!   `client_timeout_secs` of silence
//! - animation driver: a single `run_later` re-armed for the scheduler's
//!   next deadline after every piece of animation work
//!
//! ## Message Format:
//! - **Client ↔ Upstream**: realtime JSON events, forwarded verbatim
//! - **Server → Client**: additionally `relay.animation.frame` /
//!   `relay.animation.reset` when lip-sync is on

use crate::animation::pipeline::{AnalyzedChunk, AnimationMessage, LipSync};
use crate::relay::event::RealtimeEvent;
use crate::relay::session::{ClientLink, RelaySession};
use crate::relay::upstream::{RealtimeConnector, UpstreamEvent, UpstreamHandle};
use crate::state::{AppState, SessionReport};

use actix::prelude::*;
use actix_web_actors::ws;
use std::time::{Duration, Instant};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, warn};

/// Ask a session to close both sides (sent on server shutdown).
#[derive(Message)]
#[rtype(result = "()")]
pub struct Shutdown;

/// WebSocket actor relaying one client to one upstream connection.
pub struct RelaySocket {
    session: RelaySession<UpstreamHandle>,
    connector: RealtimeConnector,
    state: AppState,
    lip_sync: Option<LipSync>,
    analysis: Option<UnboundedReceiverStream<AnalyzedChunk>>,
    driver: Option<SpawnHandle>,
    started_at: Instant,
    last_heartbeat: Instant,
}

impl RelaySocket {
    pub fn new(state: AppState) -> Self {
        let config = state.get_config();
        let session = RelaySession::new(config.relay.max_pending_messages);

        let (lip_sync, analysis) = if config.animation.enabled {
            let (lip_sync, analysis) = LipSync::new(&config.animation, session.liveness());
            (Some(lip_sync), analysis)
        } else {
            (None, None)
        };

        Self {
            connector: state.connector.clone(),
            session,
            state,
            lip_sync,
            analysis,
            driver: None,
            started_at: Instant::now(),
            last_heartbeat: Instant::now(),
        }
    }

    /// Session-relative time for the animation pipeline.
    fn now(&self) -> Duration {
        self.started_at.elapsed()
    }

    fn start_heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        let relay = &self.state.get_config().relay;
        let timeout = relay.client_timeout();

        ctx.run_interval(relay.heartbeat_interval(), move |act, ctx| {
            if act.last_heartbeat.elapsed() > timeout {
                warn!(session_id = %act.session.id(), "Client heartbeat timed out");
                act.session.teardown(ctx, Some("heartbeat timeout".to_string()));
                return;
            }
            ctx.ping(b"");
        });
    }

    fn connect_upstream(&self, ctx: &mut ws::WebsocketContext<Self>) {
        let connector = self.connector.clone();
        info!(session_id = %self.session.id(), "Connecting to upstream");

        let connect = async move { connector.connect().await };
        ctx.spawn(connect.into_actor(self).map(|result, act, ctx| match result {
            Ok(connection) => {
                if act.session.on_upstream_connected(connection.handle) {
                    ctx.add_stream(connection.events);
                }
            }
            Err(err) => {
                act.state.record_connect_failure();
                act.session.on_upstream_connect_failed(err, ctx);
            }
        }));
    }

    /// Tap an upstream event into the lip-sync pipeline.
    fn animate(&mut self, event: &RealtimeEvent, ctx: &mut ws::WebsocketContext<Self>) {
        let now = self.now();
        let Some(lip_sync) = self.lip_sync.as_mut() else {
            return;
        };

        if let Err(err) = lip_sync.handle_event(event, now) {
            warn!(session_id = %self.session.id(), kind = %event.kind(), error = %err, "Animation input rejected");
        }
        self.drive_animation(ctx);
    }

    /// Run due scheduler work, send the output, and re-arm the driver.
    fn drive_animation(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        if self.session.is_terminated() {
            return;
        }

        let now = self.now();
        let Some(lip_sync) = self.lip_sync.as_mut() else {
            return;
        };

        for message in lip_sync.drive(now) {
            send_animation(ctx, &message);
        }

        if let Some(handle) = self.driver.take() {
            ctx.cancel_future(handle);
        }
        if let Some(deadline) = lip_sync.next_deadline() {
            let delay = deadline.saturating_sub(now);
            self.driver = Some(ctx.run_later(delay, |act, ctx| {
                act.driver = None;
                act.drive_animation(ctx);
            }));
        }
    }

    fn report(&self) -> SessionReport {
        SessionReport {
            counters: self.session.counters(),
            final_state: self.session.state(),
            animation: self
                .lip_sync
                .as_ref()
                .map(|lip_sync| (lip_sync.scheduler_stats(), lip_sync.analyzer_stats())),
        }
    }
}

fn send_animation(ctx: &mut ws::WebsocketContext<RelaySocket>, message: &AnimationMessage) {
    match serde_json::to_string(message) {
        Ok(json) => ctx.text(json),
        Err(e) => error!("Failed to serialize animation message: {}", e),
    }
}

impl ClientLink for ws::WebsocketContext<RelaySocket> {
    fn send_text(&mut self, text: String) {
        self.text(text);
    }

    fn close_with(&mut self, reason: Option<String>) {
        let close = match reason {
            Some(description) => ws::CloseReason {
                code: ws::CloseCode::Policy,
                description: Some(description),
            },
            None => ws::CloseReason::from(ws::CloseCode::Normal),
        };
        self.close(Some(close));
        self.stop();
    }
}

impl Actor for RelaySocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        let id = self.session.id();

        if !self.state.sessions.register(id, ctx.address().downgrade()) {
            // Lost a race with another connection for the last slot
            warn!(session_id = %id, "Session registry full, closing");
            self.session.teardown(ctx, Some("server at capacity".to_string()));
            return;
        }
        self.state.record_session_opened();
        info!(session_id = %id, animation = self.lip_sync.is_some(), "Relay session opened");

        self.start_heartbeat(ctx);
        if let Some(analysis) = self.analysis.take() {
            ctx.add_stream(analysis);
        }
        self.connect_upstream(ctx);
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        let id = self.session.id();
        self.session.on_client_closed();
        if let Some(lip_sync) = self.lip_sync.as_mut() {
            lip_sync.shutdown();
        }

        if self.state.sessions.remove(&id).is_some() {
            self.state.record_session_closed(&self.report());
        }
        info!(session_id = %id, state = %self.session.state(), counters = ?self.session.counters(), "Relay session closed");
    }
}

/// Frames from the client.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for RelaySocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                self.session.on_client_message(text.to_string(), ctx);
            }
            Ok(ws::Message::Binary(data)) => match std::str::from_utf8(&data) {
                Ok(text) => self.session.on_client_message(text.to_string(), ctx),
                Err(_) => warn!(session_id = %self.session.id(), bytes = data.len(), "Dropping non-UTF-8 binary frame"),
            },
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                debug!(session_id = %self.session.id(), reason = ?reason, "Client sent close");
                self.session.on_client_closed();
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(session_id = %self.session.id(), "Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(session_id = %self.session.id(), "WebSocket protocol error: {}", err);
                self.session.on_client_closed();
                ctx.stop();
            }
        }
    }
}

/// Events from the upstream connection.
impl StreamHandler<UpstreamEvent> for RelaySocket {
    fn handle(&mut self, item: UpstreamEvent, ctx: &mut Self::Context) {
        match item {
            UpstreamEvent::Server(event) => {
                // Forward first; animation output never precedes the event it came from
                self.session.on_upstream_event(&event, ctx);
                self.animate(&event, ctx);
            }
            UpstreamEvent::Malformed(err) => self.session.on_upstream_malformed(&err),
            UpstreamEvent::Closed(reason) => self.session.on_upstream_closed(reason, ctx),
        }
    }

    // The reader always ends with `Closed`, which already handled teardown
    fn finished(&mut self, _ctx: &mut Self::Context) {}
}

/// Results from the analyzer worker.
impl StreamHandler<AnalyzedChunk> for RelaySocket {
    fn handle(&mut self, chunk: AnalyzedChunk, ctx: &mut Self::Context) {
        let now = self.now();
        if let Some(lip_sync) = self.lip_sync.as_mut() {
            lip_sync.apply_analysis(chunk, now);
        }
        self.drive_animation(ctx);
    }

    fn finished(&mut self, _ctx: &mut Self::Context) {}
}

impl Handler<Shutdown> for RelaySocket {
    type Result = ();

    fn handle(&mut self, _msg: Shutdown, ctx: &mut Self::Context) {
        info!(session_id = %self.session.id(), "Closing session for server shutdown");
        self.session.teardown(ctx, Some("server shutting down".to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::gateway;
    use actix_web::{http::StatusCode, test as actix_test, web, App};

    #[actix_web::test]
    async fn test_valid_upgrade_switches_protocols() {
        let mut config = AppConfig::default();
        config.relay.api_key = "sk-test".to_string();
        let state = AppState::new(config);

        let app = actix_test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .default_service(web::to(gateway::accept)),
        )
        .await;

        let req = actix_test::TestRequest::get()
            .uri("/")
            .insert_header(("upgrade", "websocket"))
            .insert_header(("connection", "upgrade"))
            .insert_header(("sec-websocket-version", "13"))
            .insert_header(("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ=="))
            .to_request();
        let resp = actix_test::call_service(&app, req).await;

        assert_eq!(resp.status(), StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(state.metrics_snapshot().rejections.total(), 0);
    }

    #[actix_web::test]
    async fn test_silent_client_times_out() {
        // Accepts TCP but never answers the upstream handshake
        let upstream = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();

        let mut config = AppConfig::default();
        config.relay.api_key = "sk-test".to_string();
        config.relay.upstream_url = format!("ws://{}", upstream.local_addr().unwrap());
        config.relay.connect_timeout_ms = 30_000;
        config.relay.heartbeat_interval_secs = 1;
        config.relay.client_timeout_secs = 1;
        let state = AppState::new(config);

        let req = actix_test::TestRequest::get()
            .insert_header(("upgrade", "websocket"))
            .insert_header(("connection", "upgrade"))
            .insert_header(("sec-websocket-version", "13"))
            .insert_header(("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ=="))
            .to_http_request();
        let silent_client = futures_util::stream::pending::<Result<web::Bytes, actix_web::error::PayloadError>>();

        let (_addr, resp) = ws::WsResponseBuilder::new(RelaySocket::new(state.clone()), &req, silent_client)
            .start_with_addr()
            .unwrap();

        // The response body drives the actor and ends when it stops
        let body = tokio::time::timeout(Duration::from_secs(10), actix_web::body::to_bytes(resp.into_body()))
            .await
            .expect("session should close on heartbeat timeout")
            .unwrap();

        assert!(body.windows(17).any(|w| w == b"heartbeat timeout"));
        assert!(state.sessions.is_empty());
        let metrics = state.metrics_snapshot();
        assert_eq!(metrics.sessions_accepted, 1);
        assert_eq!(metrics.sessions_active, 0);
        assert_eq!(metrics.upstream_connect_failures, 0);
    }

    #[test]
    fn test_shutdown_message_is_fire_and_forget() {
        fn assert_message<M: Message<Result = ()>>() {}
        assert_message::<Shutdown>();
    }
}
