use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// Effective configuration with the upstream API key masked.
pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = state.get_config().redacted();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": serde_json::to_value(&config)?
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use actix_web::{test, App};

    #[actix_web::test]
    async fn test_config_endpoint_redacts_api_key() {
        let mut config = AppConfig::default();
        config.relay.api_key = "sk-live-secret".to_string();

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(AppState::new(config)))
                .route("/api/v1/config", web::get().to(get_config)),
        )
        .await;

        let req = test::TestRequest::get().uri("/api/v1/config").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["config"]["relay"]["api_key"], "sk-...");
        assert_eq!(body["config"]["relay"]["path"], "/");
        assert_eq!(body["config"]["animation"]["boundary"], "carry");
        assert!(!body.to_string().contains("secret"));
    }
}
