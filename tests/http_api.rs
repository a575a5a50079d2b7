mod support;

use std::{fs, path::Path, sync::Arc, time::Duration};

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
};
use http_body_util::BodyExt;
use jsbrain_server::{
    application::mediator::RenderResponse,
    infra::http::{HttpState, build_router},
};
use support::{FakeEnvironment, Harness, HarnessBuilder, PageScript};
use tempfile::TempDir;
use tokio::sync::Notify;
use tower::ServiceExt;

fn router(harness: &Harness) -> Router {
    build_router(HttpState {
        mediator: harness.mediator(),
    })
}

fn render_uri(dir: &Path) -> String {
    let query = url::form_urlencoded::Serializer::new(String::new())
        .append_pair("inpath", &dir.display().to_string())
        .append_pair("user", "alice")
        .append_pair("goal", "loseit")
        .append_pair("unrelated", "ignored")
        .finish();
    format!("/?{query}")
}

async fn get(router: Router, uri: &str) -> (StatusCode, Option<String>, String) {
    let response = router
        .oneshot(Request::get(uri).body(Body::empty()).expect("request"))
        .await
        .expect("router response");
    let status = response.status();
    let worker = response
        .headers()
        .get("x-jsbrain-worker")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("collect body")
        .to_bytes();
    (
        status,
        worker,
        String::from_utf8(bytes.to_vec()).expect("utf-8 body"),
    )
}

fn seed_goal(dir: &Path) {
    fs::write(dir.join("alice+loseit.bb"), "{}").expect("seed goal");
}

#[tokio::test]
async fn ping_answers_without_touching_the_pool() {
    let harness = HarnessBuilder::new().build();

    let (status, worker, body) = get(router(&harness), "/?ping").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "pong");
    assert_eq!(worker.as_deref(), Some("1"));
    assert_eq!(harness.environment.opened(), 0);
}

#[tokio::test]
async fn bad_parameters_return_usage_with_400() {
    let harness = HarnessBuilder::new().build();

    let (status, _, body) = get(router(&harness), "/?slug=alice%2Bloseit").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.contains("Missing \"inpath\""), "{body}");
    assert!(body.contains("Usage:"), "{body}");

    let (status, _, body) = get(
        router(&harness),
        "/any/path?inpath=/tmp&slug=alice%2Bloseit&user=alice&goal=loseit",
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.contains("cannot be used together"), "{body}");

    let (status, _, _) = get(router(&harness), "/?inpath=/tmp&user=alice").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(harness.environment.opened(), 0);
}

#[tokio::test]
async fn successful_render_returns_json_document() {
    let dir = TempDir::new().expect("temp dir");
    seed_goal(dir.path());
    let harness = HarnessBuilder::new().build();

    let (status, _, body) = get(router(&harness), &render_uri(dir.path())).await;

    assert_eq!(status, StatusCode::OK);
    let response: RenderResponse = serde_json::from_str(&body).expect("response json");
    assert_eq!(response.slug, "alice+loseit");
    assert_eq!(response.error, None);
    assert!(response.png.is_some());
    assert!(dir.path().join("alice+loseit-thumb.png").is_file());
}

#[tokio::test]
async fn pipeline_errors_are_reported_in_a_200_body() {
    let dir = TempDir::new().expect("temp dir");
    let harness = HarnessBuilder::new()
        .retry_delay(Duration::from_millis(10))
        .build();

    let (status, _, body) = get(router(&harness), &render_uri(dir.path())).await;

    assert_eq!(status, StatusCode::OK);
    let response: RenderResponse = serde_json::from_str(&body).expect("response json");
    assert!(
        response
            .error
            .as_deref()
            .is_some_and(|err| err.starts_with("Processing error: Could not find file")),
        "{body}"
    );
    assert_eq!(response.svg, None);
    assert_eq!(response.png, None);
    assert_eq!(response.json, None);
    let raw: serde_json::Value = serde_json::from_str(&body).expect("raw json");
    assert!(raw["svg"].is_null());
}

#[tokio::test]
async fn busy_pool_rejects_the_extra_request() {
    let dir = TempDir::new().expect("temp dir");
    seed_goal(dir.path());
    let gate = Arc::new(Notify::new());
    let harness = HarnessBuilder::new()
        .capacity(1)
        .environment(FakeEnvironment::gated(
            PageScript::default(),
            Arc::clone(&gate),
        ))
        .build();
    let app = router(&harness);
    let uri = render_uri(dir.path());

    let first = {
        let app = app.clone();
        let uri = uri.clone();
        tokio::spawn(async move { get(app, &uri).await })
    };
    tokio::time::timeout(Duration::from_secs(5), async {
        while harness.environment.navigations().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("first job reached navigation");

    let (status, _, body) = get(app, &uri).await;
    assert_eq!(status, StatusCode::OK);
    let rejected: RenderResponse = serde_json::from_str(&body).expect("response json");
    assert_eq!(
        rejected.error.as_deref(),
        Some("Processing error: all 1 sessions are busy, cannot create more")
    );

    gate.notify_one();
    let (status, _, body) = first.await.expect("first request");
    assert_eq!(status, StatusCode::OK);
    let completed: RenderResponse = serde_json::from_str(&body).expect("response json");
    assert_eq!(completed.error, None, "{}", completed.log);
    assert_eq!(harness.environment.opened(), 1);
}

#[tokio::test]
async fn render_limit_turns_away_jobs_before_the_pool() {
    let dir = TempDir::new().expect("temp dir");
    seed_goal(dir.path());
    let gate = Arc::new(Notify::new());
    let harness = HarnessBuilder::new()
        .capacity(2)
        .max_renders(1)
        .environment(FakeEnvironment::gated(
            PageScript::default(),
            Arc::clone(&gate),
        ))
        .build();
    let app = router(&harness);
    let uri = render_uri(dir.path());

    let first = {
        let app = app.clone();
        let uri = uri.clone();
        tokio::spawn(async move { get(app, &uri).await })
    };
    tokio::time::timeout(Duration::from_secs(5), async {
        while harness.environment.navigations().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("first job reached navigation");

    let (status, _, body) = get(app, &uri).await;
    assert_eq!(status, StatusCode::OK);
    let rejected: RenderResponse = serde_json::from_str(&body).expect("response json");
    assert_eq!(
        rejected.error.as_deref(),
        Some(
            "Processing error: Server at capacity: 1/1 concurrent renders active. \
             Please retry in a few seconds."
        )
    );
    assert_eq!(harness.environment.opened(), 1);

    gate.notify_one();
    let (_, _, body) = first.await.expect("first request");
    let completed: RenderResponse = serde_json::from_str(&body).expect("response json");
    assert_eq!(completed.error, None, "{}", completed.log);
}

#[tokio::test]
async fn disconnected_environment_is_a_server_error() {
    let dir = TempDir::new().expect("temp dir");
    seed_goal(dir.path());
    let harness = HarnessBuilder::new().build();
    harness.worker.environment_lost();

    let (status, _, body) = get(router(&harness), &render_uri(dir.path())).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body, "Oops, an unexpected error occurred.");
}

#[tokio::test]
async fn ping_is_plain_text() {
    let harness = HarnessBuilder::new().build();
    let response = router(&harness)
        .oneshot(Request::get("/?ping=1").body(Body::empty()).expect("request"))
        .await
        .expect("router response");
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    assert!(content_type.starts_with("text/plain"), "{content_type}");
}
