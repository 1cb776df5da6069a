use std::time::Duration;

use reaper_core::testutil::RecordingSink;
use reaper_core::{
    AppError, Credentials, JobQueue, JobStatus, ProgressReporter, QueueConfig, SourceAdapter,
    SourceOutput, StaticKeyStore,
};
use reaper_sources::{HttpJsonAdapter, registry_with};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::integration::common::{TestServer, http_source};

const WAIT_LIMIT: Duration = Duration::from_secs(5);

fn local_adapter() -> HttpJsonAdapter {
    HttpJsonAdapter::new().unwrap().allow_private_urls()
}

#[tokio::test]
async fn pages_until_an_empty_page_reporting_progress() {
    let server = TestServer::start(|target| {
        let body = match target {
            "/items?p=1" => "[1, 2]",
            "/items?p=2" => "[3]",
            _ => "[]",
        };
        Some((200, body.to_string()))
    })
    .await;

    let source = http_source("numbers", &server.url("/items"))
        .with_param("pages", "5")
        .with_param("page_param", "p")
        .with_key("numbers");
    let sink = RecordingSink::new();
    let queue = JobQueue::new(
        registry_with(local_adapter()),
        StaticKeyStore::new().with_key("numbers", "k"),
        sink.clone(),
        QueueConfig::default(),
    );
    let id = queue.add(source);

    let summary = tokio::time::timeout(WAIT_LIMIT, queue.run().unwrap().wait())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(summary.succeeded, 1);
    assert_eq!(
        sink.outputs_for(id),
        vec![SourceOutput::new(vec![json!(1), json!(2), json!(3)])]
    );
    assert_eq!(
        server.targets(),
        vec!["/items?p=1", "/items?p=2", "/items?p=3"]
    );
    for request in server.requests() {
        assert_eq!(request.header("authorization"), Some("Bearer k"));
    }
    assert_eq!(
        sink.updates_for(id),
        vec![
            (JobStatus::Pending, 0),
            (JobStatus::Running, 0),
            (JobStatus::Running, 20),
            (JobStatus::Running, 40),
            (JobStatus::Running, 60),
            (JobStatus::Succeeded, 100),
        ]
    );
}

#[tokio::test]
async fn key_header_replaces_bearer_auth() {
    let server =
        TestServer::start(|_| Some((200, r#"{"results": [{"id": 7}]}"#.to_string()))).await;
    let source = http_source("weather", &server.url("/forecast"))
        .with_param("key_header", "X-Api-Key")
        .with_param("records_field", "results");

    let output = local_adapter()
        .run(
            &source,
            &Credentials::api_key("k"),
            ProgressReporter::detached(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(output.records, vec![json!({"id": 7})]);
    let requests = server.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].target, "/forecast");
    assert_eq!(requests[0].header("x-api-key"), Some("k"));
    assert_eq!(requests[0].header("authorization"), None);
}

#[tokio::test]
async fn key_param_travels_in_the_query() {
    let server = TestServer::start(|_| Some((200, r#"{"value": 1}"#.to_string()))).await;
    let source = http_source("rates", &server.url("/latest")).with_param("key_param", "apikey");

    let output = local_adapter()
        .run(
            &source,
            &Credentials::api_key("k"),
            ProgressReporter::detached(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    // A non-array body without records_field is a single record.
    assert_eq!(output.records, vec![json!({"value": 1})]);
    let requests = server.requests();
    assert_eq!(requests[0].target, "/latest?apikey=k");
    assert_eq!(requests[0].header("authorization"), None);
}

#[tokio::test]
async fn error_status_is_an_http_error() {
    let server = TestServer::start(|_| Some((503, r#"{"error": "down"}"#.to_string()))).await;
    let url = server.url("/items");

    let err = local_adapter()
        .run(
            &http_source("flaky", &url),
            &Credentials::none(),
            ProgressReporter::detached(),
            CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::HttpError(_)));
    assert_eq!(err.to_string(), format!("HTTP error: HTTP 503 for {url}"));
}

#[tokio::test]
async fn invalid_json_is_a_parse_error() {
    let server = TestServer::start(|_| Some((200, "<html>nope</html>".to_string()))).await;

    let err = local_adapter()
        .run(
            &http_source("html", &server.url("/page")),
            &Credentials::none(),
            ProgressReporter::detached(),
            CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::ParseError(_)));
}

#[tokio::test]
async fn cancellation_interrupts_a_request_in_flight() {
    let server = TestServer::start(|_| None).await;
    let source = http_source("stuck", &server.url("/slow"));
    let adapter = local_adapter();
    let cancel = CancellationToken::new();
    let credentials = Credentials::none();

    let run = adapter.run(
        &source,
        &credentials,
        ProgressReporter::detached(),
        cancel.clone(),
    );
    let trigger = async {
        while server.requests().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cancel.cancel();
    };

    let (result, ()) = tokio::time::timeout(WAIT_LIMIT, async { tokio::join!(run, trigger) })
        .await
        .unwrap();

    assert!(result.unwrap_err().is_cancellation());
    assert_eq!(server.requests().len(), 1);
}
