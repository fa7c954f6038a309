mod common;

use std::time::Duration;

use kontext_studio::{
    normalize::{NormalizedOutput, normalize},
    replicate::{
        ErrorClassifier, FileOutputMode, ImageProvider, ModelVariant, ProviderError,
        ProviderErrorKind, ProviderInput, RawProviderOutput, ReplicateClient, ReplicateConfig,
        Sizing,
    },
};
use mockito::{Matcher, Server, ServerGuard};
use serde_json::{Value, json};

use common::png_bytes;

fn client(server: &ServerGuard, file_output: FileOutputMode) -> ReplicateClient {
    client_with_timeout(server, file_output, Duration::from_secs(5))
}

fn client_with_timeout(
    server: &ServerGuard,
    file_output: FileOutputMode,
    poll_timeout: Duration,
) -> ReplicateClient {
    let config = ReplicateConfig {
        api_token: "r8_test".to_string(),
        api_base: server.url(),
        file_output,
        poll_interval: Duration::from_millis(5),
        poll_timeout,
    };
    ReplicateClient::new(&config, ErrorClassifier::default()).unwrap()
}

fn input(prompt: &str) -> ProviderInput {
    ProviderInput {
        prompt: prompt.to_string(),
        input_image: None,
        sizing: Sizing::Dimensions {
            width: 1024,
            height: 1024,
        },
    }
}

fn create_path(model: ModelVariant) -> String {
    format!("/models/{}/predictions", model.model_id())
}

fn prediction(status: &str, output: Value, error: Value) -> String {
    json!({ "id": "p1", "status": status, "output": output, "error": error }).to_string()
}

/// Mocks a create call that answers `starting`, leaving the outcome to the poll.
async fn mock_started(server: &mut ServerGuard) -> mockito::Mock {
    server
        .mock("POST", create_path(ModelVariant::Max).as_str())
        .with_status(201)
        .with_header("content-type", "application/json")
        .with_body(prediction("starting", Value::Null, Value::Null))
        .create_async()
        .await
}

async fn mock_poll(server: &mut ServerGuard, body: String) -> mockito::Mock {
    server
        .mock("GET", "/predictions/p1")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(body)
        .create_async()
        .await
}

async fn run(client: &ReplicateClient) -> Result<RawProviderOutput, ProviderError> {
    client.run(&input("a cat"), ModelVariant::Max).await
}

#[tokio::test]
async fn create_waits_and_sends_the_input() {
    let mut server = Server::new_async().await;
    let create = server
        .mock("POST", create_path(ModelVariant::Pro).as_str())
        .match_header("authorization", "Bearer r8_test")
        .match_header("prefer", "wait")
        .match_body(Matcher::PartialJson(json!({
            "input": { "prompt": "a cat", "width": 1024, "height": 1024 }
        })))
        .with_status(201)
        .with_header("content-type", "application/json")
        .with_body(prediction(
            "succeeded",
            json!("https://cdn.example/out.png"),
            Value::Null,
        ))
        .create_async()
        .await;

    let output = client(&server, FileOutputMode::Url)
        .run(&input("a cat"), ModelVariant::Pro)
        .await
        .unwrap();

    create.assert_async().await;
    match output {
        RawProviderOutput::DirectUrl(url) => assert_eq!(url, "https://cdn.example/out.png"),
        other => panic!("expected a direct url, got {other:?}"),
    }
}

#[tokio::test]
async fn polls_until_succeeded_and_returns_the_url_array() {
    let mut server = Server::new_async().await;
    let _create = mock_started(&mut server).await;
    let poll = mock_poll(
        &mut server,
        prediction(
            "succeeded",
            json!(["https://cdn.example/a.png", "https://cdn.example/b.png"]),
            Value::Null,
        ),
    )
    .await;

    let output = run(&client(&server, FileOutputMode::Url)).await.unwrap();

    poll.assert_async().await;
    match output {
        RawProviderOutput::UrlArray(urls) => assert_eq!(
            urls,
            vec!["https://cdn.example/a.png", "https://cdn.example/b.png"]
        ),
        other => panic!("expected a url array, got {other:?}"),
    }
}

#[tokio::test]
async fn failed_prediction_with_interruption_is_retryable() {
    let mut server = Server::new_async().await;
    let _create = mock_started(&mut server).await;
    let _poll = mock_poll(
        &mut server,
        prediction(
            "failed",
            Value::Null,
            json!("Prediction interrupted; please retry (code: PA)"),
        ),
    )
    .await;

    let err = run(&client(&server, FileOutputMode::Url)).await.unwrap_err();

    assert_eq!(err.kind, ProviderErrorKind::Interrupted);
    assert!(err.message.starts_with("Prediction failed:"), "{}", err.message);
}

#[tokio::test]
async fn failed_prediction_flagged_as_sensitive() {
    let mut server = Server::new_async().await;
    let _create = server
        .mock("POST", create_path(ModelVariant::Max).as_str())
        .with_status(201)
        .with_header("content-type", "application/json")
        .with_body(prediction(
            "failed",
            Value::Null,
            json!("Output was flagged as sensitive (E005)"),
        ))
        .create_async()
        .await;

    let err = run(&client(&server, FileOutputMode::Url)).await.unwrap_err();
    assert_eq!(err.kind, ProviderErrorKind::Sensitive);
}

#[tokio::test]
async fn canceled_prediction_is_a_plain_failure() {
    let mut server = Server::new_async().await;
    let _create = mock_started(&mut server).await;
    let _poll = mock_poll(&mut server, prediction("canceled", Value::Null, Value::Null)).await;

    let err = run(&client(&server, FileOutputMode::Url)).await.unwrap_err();

    assert_eq!(err.kind, ProviderErrorKind::Other);
    assert_eq!(err.message, "Prediction canceled: unknown error");
}

#[tokio::test]
async fn structured_error_detail_is_kept() {
    let mut server = Server::new_async().await;
    let _create = mock_started(&mut server).await;
    let _poll = mock_poll(
        &mut server,
        prediction("failed", Value::Null, json!({ "detail": "out of memory" })),
    )
    .await;

    let err = run(&client(&server, FileOutputMode::Url)).await.unwrap_err();

    assert_eq!(err.kind, ProviderErrorKind::Other);
    assert!(err.message.contains("out of memory"), "{}", err.message);
}

#[tokio::test]
async fn http_errors_carry_status_and_body() {
    let mut server = Server::new_async().await;
    let _create = server
        .mock("POST", create_path(ModelVariant::Max).as_str())
        .with_status(401)
        .with_body("Unauthenticated")
        .create_async()
        .await;

    let err = run(&client(&server, FileOutputMode::Url)).await.unwrap_err();

    assert_eq!(err.kind, ProviderErrorKind::Other);
    assert!(err.message.contains("401"), "{}", err.message);
    assert!(err.message.contains("Unauthenticated"), "{}", err.message);
}

#[tokio::test]
async fn polling_gives_up_after_the_deadline() {
    let mut server = Server::new_async().await;
    let _create = mock_started(&mut server).await;
    let poll = server
        .mock("GET", "/predictions/p1")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(prediction("processing", Value::Null, Value::Null))
        .expect_at_least(1)
        .create_async()
        .await;

    let client = client_with_timeout(&server, FileOutputMode::Url, Duration::from_millis(30));
    let err = run(&client).await.unwrap_err();

    poll.assert_async().await;
    assert_eq!(err.kind, ProviderErrorKind::Other);
    assert!(err.message.contains("timed out"), "{}", err.message);
}

#[tokio::test]
async fn stream_mode_downloads_the_file() {
    let mut server = Server::new_async().await;
    let image = png_bytes(40, 30);
    let file_url = format!("{}/files/out.png", server.url());
    let _create = mock_started(&mut server).await;
    let _poll = mock_poll(&mut server, prediction("succeeded", json!(file_url), Value::Null)).await;
    let file = server
        .mock("GET", "/files/out.png")
        .with_status(200)
        .with_header("content-type", "image/png")
        .with_body(&image)
        .create_async()
        .await;

    let output = run(&client(&server, FileOutputMode::Stream)).await.unwrap();
    assert!(matches!(output, RawProviderOutput::AsyncStream(_)), "{output:?}");

    assert_eq!(normalize(output).await.unwrap(), NormalizedOutput::Bytes(image));
    file.assert_async().await;
}

#[tokio::test]
async fn reader_mode_downloads_the_first_array_entry() {
    let mut server = Server::new_async().await;
    let image = png_bytes(20, 20);
    let first = format!("{}/files/first.png", server.url());
    let second = format!("{}/files/second.png", server.url());
    let _create = mock_started(&mut server).await;
    let _poll = mock_poll(
        &mut server,
        prediction("succeeded", json!([first, second]), Value::Null),
    )
    .await;
    let file = server
        .mock("GET", "/files/first.png")
        .with_status(200)
        .with_body(&image)
        .create_async()
        .await;
    let unused = server
        .mock("GET", "/files/second.png")
        .expect(0)
        .create_async()
        .await;

    let output = run(&client(&server, FileOutputMode::Reader)).await.unwrap();
    assert!(matches!(output, RawProviderOutput::ReaderStream(_)), "{output:?}");

    assert_eq!(normalize(output).await.unwrap(), NormalizedOutput::Bytes(image));
    file.assert_async().await;
    unused.assert_async().await;
}

#[tokio::test]
async fn data_uri_output_is_never_downloaded() {
    let mut server = Server::new_async().await;
    let _create = mock_started(&mut server).await;
    let _poll = mock_poll(
        &mut server,
        prediction("succeeded", json!("data:image/png;base64,AAAA"), Value::Null),
    )
    .await;

    let output = run(&client(&server, FileOutputMode::Stream)).await.unwrap();
    match output {
        RawProviderOutput::DirectUrl(url) => assert_eq!(url, "data:image/png;base64,AAAA"),
        other => panic!("expected a direct url, got {other:?}"),
    }
}

#[tokio::test]
async fn missing_file_fails_the_run() {
    let mut server = Server::new_async().await;
    let file_url = format!("{}/files/gone.png", server.url());
    let _create = mock_started(&mut server).await;
    let _poll = mock_poll(&mut server, prediction("succeeded", json!(file_url), Value::Null)).await;
    let _file = server
        .mock("GET", "/files/gone.png")
        .with_status(404)
        .with_body("not found")
        .create_async()
        .await;

    let err = run(&client(&server, FileOutputMode::Stream)).await.unwrap_err();
    assert!(err.message.contains("404"), "{}", err.message);
}

#[tokio::test]
async fn unrecognized_outputs_are_passed_on_for_rejection() {
    let mut server = Server::new_async().await;
    let _create = mock_started(&mut server).await;
    let _poll = mock_poll(
        &mut server,
        prediction("succeeded", json!({ "image": "x" }), Value::Null),
    )
    .await;

    let output = run(&client(&server, FileOutputMode::Stream)).await.unwrap();
    match output {
        RawProviderOutput::Unknown(value) => assert_eq!(value, json!({ "image": "x" })),
        other => panic!("expected an unknown output, got {other:?}"),
    }
}

#[tokio::test]
async fn empty_output_array_is_returned_as_is() {
    let mut server = Server::new_async().await;
    let _create = mock_started(&mut server).await;
    let _poll = mock_poll(&mut server, prediction("succeeded", json!([]), Value::Null)).await;

    let output = run(&client(&server, FileOutputMode::Stream)).await.unwrap();
    match output {
        RawProviderOutput::UrlArray(urls) => assert!(urls.is_empty()),
        other => panic!("expected a url array, got {other:?}"),
    }
}
