//! HTTP route handlers.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    Router,
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{
        IntoResponse, Json, Response,
        sse::{Event as SseEvent, Sse},
    },
    routing::{get, post},
};
use futures::{Stream, StreamExt};
use serde::Serialize;

use crate::broadcast::{Frame, FrameKind};
use crate::ingest::IngestOutcome;
use crate::service::{
    GenerationRequest, GenerationService, HealthSnapshot, SubmitError, WebhookAck,
    WebhookHandleError,
};
use crate::version::VersionInfo;
use crate::webhook::{SIGNATURE_HEADER, WebhookError};

#[derive(Debug, Serialize)]
pub struct HealthCheckResponse {
    pub status: &'static str,
    pub version: VersionInfo,
    pub channels: usize,
}

impl From<HealthSnapshot> for HealthCheckResponse {
    fn from(snapshot: HealthSnapshot) -> Self {
        Self {
            status: if snapshot.shutting_down {
                "SHUTTING_DOWN"
            } else {
                "READY"
            },
            version: snapshot.version,
            channels: snapshot.channels,
        }
    }
}

fn error_body(message: impl Into<String>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "error": message.into() }))
}

async fn health_check(State(service): State<Arc<GenerationService>>) -> Json<HealthCheckResponse> {
    Json(service.health().into())
}

async fn create_generation(
    State(service): State<Arc<GenerationService>>,
    body: Option<Json<GenerationRequest>>,
) -> Response {
    let Some(Json(request)) = body else {
        return (StatusCode::BAD_REQUEST, error_body("Invalid request body")).into_response();
    };

    match service.submit(request).await {
        Ok(submission) => (StatusCode::ACCEPTED, Json(submission)).into_response(),
        Err(SubmitError::Invalid(message)) => {
            (StatusCode::BAD_REQUEST, error_body(message)).into_response()
        }
        Err(SubmitError::Provider { job_id, source }) => (
            StatusCode::BAD_GATEWAY,
            Json(serde_json::json!({
                "id": job_id,
                "status": "failed",
                "error": source.to_string(),
            })),
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to submit generation");
            (StatusCode::INTERNAL_SERVER_ERROR, error_body("Failed to submit generation"))
                .into_response()
        }
    }
}

async fn receive_webhook(
    State(service): State<Arc<GenerationService>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());

    match service.handle_webhook(&body, signature).await {
        Ok(ack) => {
            let outcome = match ack {
                WebhookAck::Ignored => "ignored",
                WebhookAck::Ingested(IngestOutcome::Unroutable) => "unroutable",
                WebhookAck::Ingested(IngestOutcome::Duplicate) => "duplicate",
                WebhookAck::Ingested(IngestOutcome::Recorded { .. }) => "recorded",
            };
            Json(serde_json::json!({ "received": true, "outcome": outcome })).into_response()
        }
        Err(WebhookHandleError::Webhook(WebhookError::BadSignature)) => {
            tracing::warn!("Webhook signature mismatch");
            (StatusCode::UNAUTHORIZED, error_body("Invalid signature")).into_response()
        }
        Err(WebhookHandleError::Webhook(e @ WebhookError::Malformed(_))) => {
            tracing::warn!(error = %e, "Malformed webhook");
            (StatusCode::BAD_REQUEST, error_body(e.to_string())).into_response()
        }
        Err(WebhookHandleError::Ingest(e)) => {
            // 5xx so the provider retries once the store is back.
            tracing::error!(error = %e, "Failed to ingest webhook");
            (StatusCode::INTERNAL_SERVER_ERROR, error_body("Failed to process webhook"))
                .into_response()
        }
    }
}

async fn job_status(
    State(service): State<Arc<GenerationService>>,
    Path(job_id): Path<String>,
) -> Response {
    match service.status(&job_id).await {
        Ok(Some(summary)) => Json(summary).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, error_body("Job not found")).into_response(),
        Err(e) => {
            tracing::error!(job_id = %job_id, error = %e, "Failed to read job status");
            (StatusCode::INTERNAL_SERVER_ERROR, error_body("Failed to read job status"))
                .into_response()
        }
    }
}

fn sse_event(frame: Frame) -> SseEvent {
    if frame.kind == FrameKind::Heartbeat {
        return SseEvent::default().comment("heartbeat");
    }
    let event = SseEvent::default()
        .event(frame.kind.as_str())
        .data(frame.data.to_string());
    match frame.event_id {
        Some(id) => event.id(id.to_string()),
        None => event,
    }
}

fn last_event_id(headers: &HeaderMap) -> Option<i64> {
    headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

async fn live_stream(
    State(service): State<Arc<GenerationService>>,
    Path(key): Path<String>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, Response> {
    let channel = service
        .open_stream(&key, last_event_id(&headers))
        .await
        .map_err(|e| {
            tracing::error!(key = %key, error = %e, "Failed to open stream");
            (StatusCode::INTERNAL_SERVER_ERROR, error_body("Failed to open stream")).into_response()
        })?;

    Ok(Sse::new(
        channel
            .into_stream()
            .map(|frame| Ok::<_, Infallible>(sse_event(frame))),
    ))
}

pub fn routes(service: Arc<GenerationService>) -> Router {
    Router::new()
        .route("/health-check", get(health_check))
        .route("/generations", post(create_generation))
        .route("/webhooks/imagine", post(receive_webhook))
        .route("/status/{job_id}", get(job_status))
        .route("/stream/{key}", get(live_stream))
        .with_state(service)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use crate::service::ServiceConfig;
    use crate::storage::MemoryObjectStore;
    use crate::store::MemoryStore;
    use crate::testing::FakeProvider;
    use crate::webhook;

    fn service(config: ServiceConfig) -> Arc<GenerationService> {
        Arc::new(GenerationService::new(
            Arc::new(MemoryStore::new()),
            Arc::new(FakeProvider::new()),
            Arc::new(MemoryObjectStore::new("https://assets.test")),
            ServiceConfig {
                poll_on_submit: false,
                ..config
            },
        ))
    }

    async fn response_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: &str) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn health_check_returns_version_and_channels() {
        let app = routes(service(ServiceConfig::default()));
        let response = app
            .oneshot(Request::get("/health-check").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = response_json(response).await;
        assert_eq!(json["status"], "READY");
        assert!(json["version"]["genstream"].is_string());
        assert_eq!(json["channels"], 0);
    }

    #[tokio::test]
    async fn generation_is_accepted_and_status_is_pending() {
        let service = service(ServiceConfig::default());

        let response = routes(service.clone())
            .oneshot(post_json("/generations", r#"{"prompt":"a red coat"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let json = response_json(response).await;
        assert_eq!(json["status"], "pending");
        assert_eq!(json["externalIds"][0], "ext-1");
        let id = json["id"].as_str().unwrap().to_string();

        let response = routes(service)
            .oneshot(Request::get(format!("/status/{id}")).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = response_json(response).await;
        assert_eq!(json["status"], "pending");
        assert_eq!(json["progress"], 0);
    }

    #[tokio::test]
    async fn generation_without_prompt_is_rejected() {
        let app = routes(service(ServiceConfig::default()));
        let response = app
            .oneshot(post_json("/generations", r#"{"prompt":""}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let app = routes(service(ServiceConfig::default()));
        let response = app.oneshot(post_json("/generations", "nope")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_job_status_is_404() {
        let app = routes(service(ServiceConfig::default()));
        let response = app
            .oneshot(Request::get("/status/job_missing").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn webhook_for_unknown_id_is_acknowledged() {
        let app = routes(service(ServiceConfig::default()));
        let response = app
            .oneshot(post_json(
                "/webhooks/imagine",
                r#"{"event":"images.items.update","payload":{"id":"ext-404","status":"completed","url":"https://cdn.provider/x.png"}}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = response_json(response).await;
        assert_eq!(json["outcome"], "unroutable");
    }

    #[tokio::test]
    async fn malformed_webhook_is_400() {
        let app = routes(service(ServiceConfig::default()));
        let response = app
            .oneshot(post_json("/webhooks/imagine", r#"{"event":"images.items.update"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn webhook_with_bad_signature_is_401() {
        let service = service(ServiceConfig {
            webhook_secret: Some("s3cret".to_string()),
            ..ServiceConfig::default()
        });
        let body = r#"{"event":"images.items.update","payload":{"id":"ext-1","status":"pending"}}"#;

        let response = routes(service.clone())
            .oneshot(
                Request::post("/webhooks/imagine")
                    .header(SIGNATURE_HEADER, "sha256=00")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = routes(service)
            .oneshot(
                Request::post("/webhooks/imagine")
                    .header(SIGNATURE_HEADER, webhook::sign("s3cret", body.as_bytes()))
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn webhook_progress_is_reflected_in_status() {
        let service = service(ServiceConfig::default());
        let submission = service
            .submit(GenerationRequest {
                prompt: "p".to_string(),
                variants: Vec::new(),
            })
            .await
            .unwrap();

        let response = routes(service.clone())
            .oneshot(post_json(
                "/webhooks/imagine",
                r#"{"event":"images.items.update","payload":{"id":"ext-1","status":"in-progress","progress":50,"url":"https://cdn.provider/preview.png"}}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response_json(response).await["outcome"], "recorded");

        let summary = service.status(&submission.id).await.unwrap().unwrap();
        assert_eq!(summary.progress, 50);
        assert_eq!(summary.preview_url.as_deref(), Some("https://cdn.provider/preview.png"));
    }

    #[tokio::test(start_paused = true)]
    async fn stream_emits_connected_and_cached_frame() {
        let service = service(ServiceConfig::default());
        service.broadcaster().publish(
            "session-1",
            Frame::new(FrameKind::Complete, serde_json::json!({ "resultUrls": ["u"] })),
        );

        let response = routes(service)
            .oneshot(Request::get("/stream/session-1").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "text/event-stream"
        );

        // Closes one second after the terminal frame.
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.starts_with("event: connected\n"));
        assert!(text.contains("event: complete\ndata: {\"resultUrls\":[\"u\"]}\n"));
    }

    #[test]
    fn last_event_id_header_is_parsed() {
        let mut headers = HeaderMap::new();
        assert_eq!(last_event_id(&headers), None);
        headers.insert("last-event-id", "42".parse().unwrap());
        assert_eq!(last_event_id(&headers), Some(42));
        headers.insert("last-event-id", "abc".parse().unwrap());
        assert_eq!(last_event_id(&headers), None);
    }
}
