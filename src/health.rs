use crate::session::{EndReason, SessionCoordinator};
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::{json, Map, Value};

/// Liveness check. Answers as soon as the server is accepting connections.
pub async fn health_check() -> HttpResponse {
    HttpResponse::Ok().json(json!({ "status": "ok" }))
}

pub async fn metrics(state: web::Data<AppState>, coordinator: web::Data<SessionCoordinator>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();
    let max_sessions = state.config.server.max_concurrent_sessions;
    let active_sessions = state.active_sessions();

    let mut ended = Map::new();
    for reason in EndReason::ALL {
        ended.insert(reason.as_str().to_string(), json!(metrics.sessions_ended_by(reason)));
    }

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
        },
        "http": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": if metrics.request_count > 0 {
                metrics.error_count as f64 / metrics.request_count as f64
            } else {
                0.0
            }
        },
        "sessions": {
            "active": active_sessions,
            "max_concurrent": max_sessions,
            "usage_percent": if max_sessions > 0 {
                (active_sessions as f64 / max_sessions as f64 * 100.0).round()
            } else {
                0.0
            },
            "started": metrics.sessions_started,
            "rejected": metrics.sessions_rejected,
            "ended": Value::Object(ended),
            "chunks_received": metrics.chunks_received,
            "events_relayed": metrics.events_relayed
        },
        "engine": coordinator.engine().describe()
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::session::testing::{PipelineScript, ScriptedEngine};
    use crate::session::SessionSettings;
    use actix_web::{test, App};

    #[actix_web::test]
    async fn test_health_check() {
        let app = test::init_service(App::new().route("/health", web::get().to(health_check))).await;

        let req = test::TestRequest::get().uri("/health").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body, json!({ "status": "ok" }));
    }

    #[actix_web::test]
    async fn test_metrics_report_sessions_and_engine() {
        let state = AppState::new(AppConfig::default());
        let _guard = state.try_open_session();
        let (engine, _log) = ScriptedEngine::new(PipelineScript::default());
        let coordinator = SessionCoordinator::new(engine, SessionSettings::default());

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .app_data(web::Data::new(coordinator))
                .route("/metrics", web::get().to(metrics)),
        )
        .await;

        let req = test::TestRequest::get().uri("/metrics").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["sessions"]["active"], 1);
        assert_eq!(body["sessions"]["started"], 1);
        assert_eq!(body["sessions"]["ended"]["client_closed"], 0);
        assert!(body["engine"]["name"].is_string());
    }
}
