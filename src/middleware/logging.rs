//! Request logging for the HTTP surface. Websocket upgrades pass through
//! here too, so a relay connection shows up as one request that completes
//! with `101` when the session starts.

use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    http::{header, StatusCode},
    Error,
};
use futures_util::future::LocalBoxFuture;
use std::{
    future::{ready, Ready},
    time::Instant,
};
use tracing::{error, info, warn};
use uuid::Uuid;

pub struct RequestLogging;

impl<S, B> Transform<S, ServiceRequest> for RequestLogging
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = RequestLoggingMiddleware<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(RequestLoggingMiddleware { service }))
    }
}

pub struct RequestLoggingMiddleware<S> {
    service: S,
}

impl<S, B> Service<ServiceRequest> for RequestLoggingMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let info = RequestInfo::from_request(&req);
        info!(
            request_id = %info.id,
            method = %info.method,
            uri = %info.uri,
            remote_addr = %info.remote_addr,
            upgrade = info.is_upgrade,
            "Request started"
        );

        let fut = self.service.call(req);

        Box::pin(async move {
            let result = fut.await;
            match &result {
                Ok(response) => info.log_response(response.status()),
                Err(err) => error!(
                    request_id = %info.id,
                    method = %info.method,
                    uri = %info.uri,
                    remote_addr = %info.remote_addr,
                    duration_ms = info.elapsed_ms(),
                    error = %err,
                    "Request failed"
                ),
            }
            result
        })
    }
}

/// What gets logged about one request, captured before the inner service
/// consumes it.
struct RequestInfo {
    id: Uuid,
    method: String,
    uri: String,
    remote_addr: String,
    /// Asked for a websocket upgrade, i.e. a relay connection attempt
    is_upgrade: bool,
    started: Instant,
}

impl RequestInfo {
    fn from_request(req: &ServiceRequest) -> Self {
        let is_upgrade = req
            .headers()
            .get(header::UPGRADE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.eq_ignore_ascii_case("websocket"));

        Self {
            id: Uuid::new_v4(),
            method: req.method().to_string(),
            uri: req.uri().to_string(),
            remote_addr: req.connection_info().realip_remote_addr().unwrap_or("unknown").to_string(),
            is_upgrade,
            started: Instant::now(),
        }
    }

    fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    fn log_response(&self, status: StatusCode) {
        let status_code = status.as_u16();
        let duration_ms = self.elapsed_ms();

        if status == StatusCode::SWITCHING_PROTOCOLS {
            // The session itself logs from here on
            info!(request_id = %self.id, uri = %self.uri, remote_addr = %self.remote_addr, duration_ms, "Relay upgrade accepted");
        } else if status.is_server_error() {
            error!(request_id = %self.id, uri = %self.uri, status = status_code, duration_ms, "Request failed");
        } else if status.is_client_error() {
            warn!(
                request_id = %self.id,
                uri = %self.uri,
                status = status_code,
                upgrade = self.is_upgrade,
                duration_ms,
                "Request rejected"
            );
        } else {
            info!(request_id = %self.id, method = %self.method, uri = %self.uri, status = status_code, duration_ms, "Request completed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{test as actix_test, web, App, HttpResponse};

    #[actix_web::test]
    async fn test_responses_pass_through() {
        let app = actix_test::init_service(
            App::new()
                .wrap(RequestLogging)
                .route("/ok", web::get().to(|| async { HttpResponse::Ok().body("ok") }))
                .route("/gone", web::get().to(|| async { HttpResponse::NotFound().finish() })),
        )
        .await;

        let resp = actix_test::call_service(&app, actix_test::TestRequest::get().uri("/ok").to_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(actix_test::read_body(resp).await, "ok");

        let resp = actix_test::call_service(&app, actix_test::TestRequest::get().uri("/gone").to_request()).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_upgrade_detection_ignores_case() {
        let req = actix_test::TestRequest::get().insert_header(("upgrade", "WebSocket")).to_srv_request();
        assert!(RequestInfo::from_request(&req).is_upgrade);

        let req = actix_test::TestRequest::get().insert_header(("upgrade", "h2c")).to_srv_request();
        assert!(!RequestInfo::from_request(&req).is_upgrade);

        let req = actix_test::TestRequest::get().to_srv_request();
        assert!(!RequestInfo::from_request(&req).is_upgrade);
    }
}
