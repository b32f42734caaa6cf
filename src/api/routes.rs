//! Route handlers.

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::error;
use uuid::Uuid;

use super::{ApiError, SharedState};
use crate::agent::parse_endpoint;
use crate::evaluation::Evaluation;
use crate::pipeline::OrchestratorError;

#[derive(Debug, Deserialize)]
pub struct StartEvaluationRequest {
    #[serde(default)]
    pub purple_agent_endpoint: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartEvaluationResponse {
    pub message: String,
    pub evaluation_id: Uuid,
    pub status_url: String,
}

pub async fn start_evaluation(
    State(state): State<SharedState>,
    body: Result<Json<StartEvaluationRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<StartEvaluationResponse>), ApiError> {
    let Json(request) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;

    let endpoint = request
        .purple_agent_endpoint
        .filter(|e| !e.trim().is_empty())
        .ok_or_else(|| ApiError::BadRequest("purple_agent_endpoint is required".to_string()))?;
    parse_endpoint(&endpoint).map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let evaluation_id = state
        .orchestrator
        .start_evaluation(&endpoint)
        .await
        .map_err(|e| match e {
            OrchestratorError::NoTaskAvailable => ApiError::Conflict(e.to_string()),
            OrchestratorError::Store(_) => {
                error!(error = %e, "Failed to start evaluation");
                ApiError::Internal(e.to_string())
            }
        })?;

    Ok((
        StatusCode::ACCEPTED,
        Json(StartEvaluationResponse {
            message: "Evaluation started".to_string(),
            evaluation_id,
            status_url: format!("/v1/evaluate/{}", evaluation_id),
        }),
    ))
}

pub async fn get_evaluation(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<Evaluation>, ApiError> {
    let not_found = || ApiError::NotFound(format!("Evaluation {} not found", id));
    let evaluation_id = Uuid::parse_str(&id).map_err(|_| not_found())?;

    match state.orchestrator.get_evaluation(evaluation_id).await {
        Ok(Some(evaluation)) => Ok(Json(evaluation)),
        Ok(None) => Err(not_found()),
        Err(e) => {
            error!(evaluation_id = %evaluation_id, error = %e, "Failed to load evaluation");
            Err(ApiError::Internal(e.to_string()))
        }
    }
}

pub async fn health() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::super::{build_router, AppState};
    use super::*;
    use crate::agent::AgentClient;
    use crate::error::AgentError;
    use crate::evaluation::{EvaluationStatus, Submission, TaskLike, TaskRequest};
    use crate::pipeline::EvaluationOrchestrator;
    use crate::scheduler::MemoryQueue;
    use crate::storage::{MemoryEvaluationStore, MemoryTaskPool};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{header, Request};
    use axum::Router;
    use http_body_util::BodyExt;
    use std::sync::Arc;
    use tower::ServiceExt;

    struct DownAgent;

    #[async_trait]
    impl AgentClient for DownAgent {
        async fn send_task(
            &self,
            _endpoint: &str,
            _task: &TaskRequest,
        ) -> Result<Submission, AgentError> {
            Err(AgentError::RequestFailed("connection refused".to_string()))
        }
    }

    fn test_app(tasks: Vec<TaskLike>) -> Router {
        let orchestrator = EvaluationOrchestrator::new(
            Arc::new(MemoryTaskPool::new(tasks)),
            Arc::new(MemoryEvaluationStore::new()),
            Arc::new(DownAgent),
            Arc::new(MemoryQueue::new()),
        );
        build_router(Arc::new(AppState { orchestrator }))
    }

    fn post_evaluate(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/v1/evaluate")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_missing_endpoint_is_bad_request() {
        let app = test_app(vec![TaskLike::new("t-1", "Write add(a, b).")]);

        let response = app.clone().oneshot(post_evaluate("{}")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert!(body["error"]
            .as_str()
            .unwrap()
            .contains("purple_agent_endpoint"));

        let response = app
            .oneshot(post_evaluate(r#"{"purple_agent_endpoint": "ftp://x"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_malformed_json_is_bad_request() {
        let app = test_app(vec![]);
        let response = app.oneshot(post_evaluate("{not json")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_empty_task_pool_is_conflict() {
        let app = test_app(vec![]);
        let response = app
            .oneshot(post_evaluate(
                r#"{"purple_agent_endpoint": "http://localhost:9009"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_accepted_evaluation_can_be_polled() {
        let app = test_app(vec![TaskLike::new("t-1", "Write add(a, b).")]);
        let response = app
            .clone()
            .oneshot(post_evaluate(
                r#"{"purple_agent_endpoint": "http://localhost:9009"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let body = body_json(response).await;
        assert_eq!(body["message"], "Evaluation started");
        let status_url = body["statusUrl"].as_str().unwrap().to_string();
        assert_eq!(
            status_url,
            format!("/v1/evaluate/{}", body["evaluationId"].as_str().unwrap())
        );

        let response = app
            .oneshot(
                Request::builder()
                    .uri(&status_url)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let evaluation: Evaluation = serde_json::from_value(body_json(response).await).unwrap();
        assert_eq!(evaluation.status, EvaluationStatus::Failed);
        assert_eq!(evaluation.contextual_debt_score, Some(0.0));
    }

    #[tokio::test]
    async fn test_unknown_evaluation_is_not_found() {
        let app = test_app(vec![]);
        for path in [
            format!("/v1/evaluate/{}", Uuid::new_v4()),
            "/v1/evaluate/not-a-uuid".to_string(),
        ] {
            let response = app
                .clone()
                .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND);
        }
    }

    #[tokio::test]
    async fn test_health() {
        let app = test_app(vec![]);
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"ok");
    }
}
