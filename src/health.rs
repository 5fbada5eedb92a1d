use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let config = state.get_config();
    let snapshot = state.engine.snapshot();

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": "voice-session-engine",
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "session": snapshot,
        "agent": {
            "model": config.session.model,
            "voice_name": config.session.voice_name,
            "credential_configured": !config.transport.api_key.trim().is_empty()
        },
        "audio": {
            "input_sample_rate": config.audio.input_sample_rate,
            "output_sample_rate": config.audio.output_sample_rate,
            "native_devices": cfg!(feature = "native-audio")
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::testing::spawn_engine;
    use actix_web::{test, App};

    #[actix_web::test]
    async fn test_health_reports_session_snapshot() {
        let config = AppConfig::default();
        let (engine, _backend, _transport) = spawn_engine(&config);
        let state = AppState::new(config, engine);

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/health", web::get().to(health_check)),
        )
        .await;

        let req = test::TestRequest::get().uri("/health").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["status"], "healthy");
        assert_eq!(body["session"]["status"], "DISCONNECTED");
        assert_eq!(body["session"]["agent_talking"], false);
        assert_eq!(body["agent"]["credential_configured"], false);
    }
}
