//! HTTP collaborator client tests against mock servers.

use futures_util::StreamExt;
use std::time::Duration;
use switchboard::alerts::AlertGateway;
use switchboard::config::{LlmConfig, SttConfig, TtsConfig};
use switchboard::llm::{ChatMessage, LlmClient};
use switchboard::records::{CallDirection, CallLogStore, CallOutcome, NewCall};
use switchboard::stt::SttClient;
use switchboard::tts::TtsClient;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn stt_config(url: &str, timeout_secs: u64) -> SttConfig {
    SttConfig {
        url: url.to_owned(),
        timeout_secs,
    }
}

#[tokio::test]
async fn stt_posts_wav_and_reads_text() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/transcribe"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({ "text": "hello there" })),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client = SttClient::new(&stt_config(&server.uri(), 5));
    let text = client.transcribe(vec![0u8; 64]).await.expect("transcribe");
    assert_eq!(text, "hello there");
}

#[tokio::test]
async fn stt_backend_error_is_an_error_not_a_panic() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/transcribe"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let client = SttClient::new(&stt_config(&server.uri(), 5));
    assert!(client.transcribe(vec![0u8; 64]).await.is_err());
}

#[tokio::test]
async fn stt_times_out_instead_of_blocking_the_session() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/transcribe"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({ "text": "late" }))
                .set_delay(Duration::from_secs(5)),
        )
        .mount(&server)
        .await;

    let client = SttClient::new(&stt_config(&server.uri(), 1));
    let started = std::time::Instant::now();
    assert!(client.transcribe(vec![0u8; 64]).await.is_err());
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[tokio::test]
async fn tts_streams_response_bytes() {
    let server = MockServer::start().await;
    let body = vec![7u8; 4096];
    Mock::given(method("POST"))
        .and(path("/v1/audio/speech/stream"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
        .mount(&server)
        .await;

    let client = TtsClient::new(&TtsConfig {
        url: server.uri(),
        voice_id: "default".to_owned(),
        timeout_secs: 5,
    });
    let mut stream = client.synthesize("hello").await.expect("synthesize");
    let mut collected = Vec::new();
    while let Some(chunk) = stream.next().await {
        collected.extend_from_slice(&chunk.expect("chunk"));
    }
    assert_eq!(collected, body);
}

#[tokio::test]
async fn llm_reassembles_sse_deltas() {
    let server = MockServer::start().await;
    let body = concat!(
        "data: {\"choices\":[{\"delta\":{\"content\":\"Hello\"}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\", world\"}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
        "data: [DONE]\n\n",
    );
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(body),
        )
        .mount(&server)
        .await;

    let client = LlmClient::new(&LlmConfig {
        url: format!("{}/v1", server.uri()),
        ..LlmConfig::default()
    });
    let reply = client
        .complete(&[ChatMessage::user("hi")])
        .await
        .expect("complete");
    assert_eq!(reply, "Hello, world");
}

#[tokio::test]
async fn alert_channel_is_created_once_then_cached() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/channels/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/channels/create"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({ "id": "chan-42" })),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/channels/chan-42/messages/post"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "ok": true })))
        .expect(2)
        .mount(&server)
        .await;

    let store = CallLogStore::open_in_memory().expect("store");
    let gateway = AlertGateway::new(&server.uri(), "token", "Voice Bridge Alerts");

    let record = {
        let id = store
            .create_call(&NewCall {
                call_id: Some("cc-1".to_owned()),
                direction: CallDirection::Inbound,
                to_number: "+15550002222".to_owned(),
                from_number: "+15557778888".to_owned(),
                status: "ringing".to_owned(),
                user_id: Some("user-1".to_owned()),
                chat_id: None,
            })
            .expect("create");
        store
            .finalize_call(
                Some(id),
                "cc-1",
                &CallOutcome {
                    status: "completed".to_owned(),
                    duration_secs: 30,
                    transcript: "User: hi".to_owned(),
                    cost: 0.0025,
                },
            )
            .expect("finalize")
            .expect("record")
    };

    assert!(gateway.deliver_call_summary(&store, &record).await);
    // Second delivery reuses the cached channel id: no second create call.
    assert!(gateway.deliver_call_summary(&store, &record).await);
    assert_eq!(
        store.channel_for("user-1", "Voice Bridge Alerts").as_deref(),
        Some("chan-42")
    );
}
