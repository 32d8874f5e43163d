//! Runtime statistics

use axum::{extract::State, routing::get, Json, Router};

use crate::types::StatsResponse;
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/", get(stats))
}

async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        registry: state.registry().stats(),
        metrics: state.metrics.snapshot(),
    })
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use crate::build_router;
    use crate::test_support::{authed, body_json, state};

    #[tokio::test]
    async fn idle_server_reports_no_queries() {
        let app = build_router(state(&[]));
        let response = app
            .oneshot(authed("GET", "/api/stats", Value::Null))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["active_queries"], 0);
        assert_eq!(body["query_ids"], json!([]));
        assert_eq!(body["metrics"]["total_queries"], 0);
        assert!(body["metrics"].get("avg_ms").is_none());
    }

    #[tokio::test]
    async fn completed_queries_show_up_in_metrics() {
        let app = build_router(state(&["Spend is flat."]));
        let response = app
            .clone()
            .oneshot(authed(
                "POST",
                "/api/query",
                json!({"query_text": "cost?", "resource_ids": ["aws-prod"]}),
            ))
            .await
            .expect("response");
        // Draining the body waits for the query to finish
        crate::test_support::body_text(response).await;

        let body = body_json(
            app.oneshot(authed("GET", "/api/stats", Value::Null))
                .await
                .expect("response"),
        )
        .await;
        assert_eq!(body["active_queries"], 0);
        assert_eq!(body["metrics"]["total_queries"], 1);
        assert_eq!(body["metrics"]["total_resources"], 1);
    }
}
