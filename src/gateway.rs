//! # Connection Gateway
//!
//! Entry point for inbound websocket connections. A request is accepted only
//! when its path is the configured relay path, it is a valid websocket
//! upgrade, and a session slot is free. Rejected requests are answered with
//! an HTTP error and never allocate session state.

use crate::error::{AppError, ConnectionRejected};
use crate::state::AppState;
use crate::websocket::RelaySocket;
use actix_web::{web, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use tracing::{info, warn};

/// Exact match against the configured relay path.
pub fn validate_target(path: &str, configured: &str) -> Result<(), ConnectionRejected> {
    if path == configured {
        Ok(())
    } else {
        Err(ConnectionRejected::InvalidPath(path.to_string()))
    }
}

/// Every check that can be made before the upgrade.
fn admit(req: &HttpRequest, state: &AppState) -> Result<(), ConnectionRejected> {
    validate_target(req.path(), &state.get_config().relay.path)?;

    ws::handshake(req).map_err(|e| ConnectionRejected::NotWebsocket(e.to_string()))?;

    if state.sessions.is_full() {
        return Err(ConnectionRejected::AtCapacity(state.sessions.capacity()));
    }

    Ok(())
}

/// Default service: upgrade to a relay session or reject.
pub async fn accept(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let peer = req.connection_info().peer_addr().unwrap_or("unknown").to_string();

    if let Err(rejection) = admit(&req, &state) {
        warn!(peer = %peer, path = %req.path(), reason = %rejection, "Connection rejected");
        state.record_rejected(&rejection);
        return Err(rejection.into());
    }

    info!(peer = %peer, "Accepting relay connection");
    let socket = RelaySocket::new(state.get_ref().clone());
    ws::start(socket, &req, stream).map_err(|e| AppError::Internal(format!("websocket upgrade failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use actix_web::{http::StatusCode, test as actix_test, App};

    fn test_state(max_sessions: usize) -> AppState {
        let mut config = AppConfig::default();
        config.relay.api_key = "sk-test".to_string();
        config.relay.max_concurrent_sessions = max_sessions;
        AppState::new(config)
    }

    fn upgrade_request(uri: &str) -> actix_test::TestRequest {
        actix_test::TestRequest::get()
            .uri(uri)
            .insert_header(("upgrade", "websocket"))
            .insert_header(("connection", "upgrade"))
            .insert_header(("sec-websocket-version", "13"))
            .insert_header(("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ=="))
    }

    #[test]
    fn test_validate_target() {
        assert!(validate_target("/", "/").is_ok());
        assert_eq!(
            validate_target("/chat", "/"),
            Err(ConnectionRejected::InvalidPath("/chat".to_string()))
        );
        // No prefix matching
        assert!(validate_target("/relay/extra", "/relay").is_err());
    }

    #[actix_web::test]
    async fn test_rejects_wrong_path_without_session() {
        let state = test_state(4);
        let app = actix_test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .default_service(web::to(accept)),
        )
        .await;

        let resp = actix_test::call_service(&app, upgrade_request("/other").to_request()).await;

        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert!(state.sessions.is_empty());
        assert_eq!(state.metrics_snapshot().rejections.invalid_path, 1);
        assert_eq!(state.metrics_snapshot().sessions_accepted, 0);
    }

    #[actix_web::test]
    async fn test_rejects_plain_http() {
        let state = test_state(4);
        let app = actix_test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .default_service(web::to(accept)),
        )
        .await;

        let resp = actix_test::call_service(&app, actix_test::TestRequest::get().uri("/").to_request()).await;

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(state.metrics_snapshot().rejections.not_websocket, 1);
    }

    #[actix_web::test]
    async fn test_rejects_when_at_capacity() {
        let state = test_state(0);

        let app = actix_test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .default_service(web::to(accept)),
        )
        .await;

        let resp = actix_test::call_service(&app, upgrade_request("/").to_request()).await;

        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(state.metrics_snapshot().rejections.at_capacity, 1);
    }
}
