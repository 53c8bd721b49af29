//! Submission -> webhooks -> event log -> live stream, against a mocked
//! provider and a SQLite store.

use std::sync::Arc;
use std::time::Duration;

use genstream::{
    EventKind, FrameKind, GenerationRequest, GenerationService, ImagineClient, IngestOutcome,
    JobPhase, JobStore, MemoryObjectStore, ServiceConfig, SqliteStore, StreamConfig, WebhookAck,
};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn provider() -> MockServer {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/items/images"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({"data": {"id": "ext-1", "status": "pending"}})),
        )
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/cdn/x.png"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"\x89PNG".to_vec()))
        .expect(1)
        .mount(&server)
        .await;

    server
}

fn webhook(body: serde_json::Value) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "event": "images.items.update",
        "payload": body,
    }))
    .unwrap()
}

#[tokio::test]
async fn submit_ingest_and_stream() {
    let server = provider().await;
    let store = Arc::new(SqliteStore::in_memory().await.unwrap());
    let objects = Arc::new(MemoryObjectStore::new("https://assets.test"));

    let service = GenerationService::new(
        store.clone(),
        Arc::new(ImagineClient::new(server.uri(), "tok").unwrap()),
        objects.clone(),
        ServiceConfig {
            poll_on_submit: false,
            stream: StreamConfig {
                terminal_grace: Duration::from_millis(20),
                ..StreamConfig::default()
            },
            ..ServiceConfig::default()
        },
    );

    // Submission writes the job and the mapping before returning.
    let submission = service
        .submit(GenerationRequest {
            prompt: "a red coat".to_string(),
            variants: Vec::new(),
        })
        .await
        .unwrap();
    let job_id = submission.id.clone();
    let mapping = store.resolve_external("ext-1").await.unwrap().unwrap();
    assert_eq!(mapping.internal_job_id, job_id);

    let mut channel = service.open_stream(&job_id, None).await.unwrap();
    assert_eq!(channel.next().await.unwrap().kind, FrameKind::Connected);

    // Progress.
    let ack = service
        .handle_webhook(
            &webhook(serde_json::json!({"id": "ext-1", "status": "in-progress", "progress": 50})),
            None,
        )
        .await
        .unwrap();
    assert!(matches!(ack, WebhookAck::Ingested(IngestOutcome::Recorded { .. })));

    let events = store.events_for_job(&job_id, 0).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, EventKind::Progress);
    assert_eq!(events[0].progress, Some(50));

    // Completion with a provider-hosted artifact.
    let completed = webhook(serde_json::json!({
        "id": "ext-1",
        "status": "completed",
        "url": format!("{}/cdn/x.png", server.uri()),
    }));
    service.handle_webhook(&completed, None).await.unwrap();

    let stored_url = format!("https://assets.test/generations/{job_id}/image.png");
    let events = store.events_for_job(&job_id, 0).await.unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[1].kind, EventKind::Completed);
    assert_eq!(events[1].result_urls, vec![stored_url.clone()]);
    assert_eq!(
        objects.get(&format!("generations/{job_id}/image.png")).unwrap(),
        &b"\x89PNG"[..]
    );

    // Redelivery is a no-op.
    let ack = service.handle_webhook(&completed, None).await.unwrap();
    assert_eq!(ack, WebhookAck::Ingested(IngestOutcome::Duplicate));
    assert_eq!(store.events_for_job(&job_id, 0).await.unwrap().len(), 2);

    // The open stream saw progress, then completion, then closed.
    let mut kinds = Vec::new();
    while let Some(frame) = tokio::time::timeout(Duration::from_secs(5), channel.next())
        .await
        .unwrap()
    {
        if frame.kind != FrameKind::Heartbeat {
            kinds.push(frame.kind);
        }
    }
    assert_eq!(kinds, vec![FrameKind::Progress, FrameKind::Complete]);
    assert_eq!(service.health().channels, 0);

    let summary = service.status(&job_id).await.unwrap().unwrap();
    assert_eq!(summary.status, JobPhase::Completed);
    assert_eq!(summary.result_urls.unwrap(), vec![stored_url]);
}

#[tokio::test]
async fn unknown_external_id_records_nothing() {
    let store = Arc::new(SqliteStore::in_memory().await.unwrap());
    let service = GenerationService::new(
        store.clone(),
        Arc::new(ImagineClient::new("http://127.0.0.1:9", "tok").unwrap()),
        Arc::new(MemoryObjectStore::new("https://assets.test")),
        ServiceConfig {
            poll_on_submit: false,
            ..ServiceConfig::default()
        },
    );

    let ack = service
        .handle_webhook(
            &webhook(serde_json::json!({"id": "ext-404", "status": "completed", "url": "https://cdn/x.png"})),
            None,
        )
        .await
        .unwrap();
    assert_eq!(ack, WebhookAck::Ingested(IngestOutcome::Unroutable));
    assert!(store.resolve_external("ext-404").await.unwrap().is_none());
}
