//! HTTP/WebSocket server edge.
//!
//! Three routes matter: `POST /voice/call` starts an outbound call,
//! `POST /voice/webhook` receives provider events (answering inbound
//! calls), and `GET /voice/stream/{id}` is the media socket the provider
//! connects back to. Health and voice listing are thin pass-throughs.

use crate::alerts::AlertGateway;
use crate::codec::outbound::OutboundEncoder;
use crate::config::BridgeConfig;
use crate::error::Result;
use crate::llm::{ChatMessage, LlmClient};
use crate::preload::{PreloadBroker, PreloadProducer};
use crate::provider::{CallControl, DialRequest};
use crate::records::{CallDirection, CallLogStore, NewCall};
use crate::registry::{CallContext, StreamRegistry};
use crate::session::{SessionDeps, run_session};
use crate::stt::SttClient;
use crate::tts::TtsClient;
use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

/// Shared state behind every route.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<BridgeConfig>,
    pub registry: Arc<StreamRegistry>,
    pub broker: Arc<PreloadBroker>,
    pub records: Arc<CallLogStore>,
    pub provider: Arc<dyn CallControl>,
    pub llm: LlmClient,
    pub stt: SttClient,
    pub tts: TtsClient,
    pub alerts: AlertGateway,
}

impl AppState {
    /// Wire up state from config plus the two injectable collaborators
    /// (call control and the record store), so tests can substitute both.
    pub fn new(config: BridgeConfig, records: CallLogStore, provider: Arc<dyn CallControl>) -> Self {
        let ttl = Duration::from_secs(config.server.registration_ttl_secs);
        let alerts = AlertGateway::new(
            &config.llm.url,
            &config.call.alert_token,
            &config.call.alert_channel_name,
        );
        let llm = LlmClient::new(&config.llm);
        let stt = SttClient::new(&config.stt);
        let tts = TtsClient::new(&config.tts);
        Self {
            config: Arc::new(config),
            registry: Arc::new(StreamRegistry::new(ttl)),
            broker: Arc::new(PreloadBroker::new(ttl)),
            records: Arc::new(records),
            provider,
            llm,
            stt,
            tts,
            alerts,
        }
    }

    fn session_deps(&self) -> SessionDeps {
        SessionDeps {
            config: Arc::clone(&self.config),
            broker: Arc::clone(&self.broker),
            records: Arc::clone(&self.records),
            provider: Arc::clone(&self.provider),
            llm: self.llm.clone(),
            stt: self.stt.clone(),
            tts: self.tts.clone(),
            alerts: self.alerts.clone(),
        }
    }
}

/// Build the bridge router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/voice/call", post(initiate_call))
        .route("/voice/webhook", post(webhook))
        .route("/voice/stream/{stream_id}", get(media_stream))
        .route("/voice/voices", get(list_voices))
        .with_state(state)
}

/// Build the `ws(s)://…/voice/stream/{id}?token=…` URL handed to the
/// provider. An `https` public base selects `wss`.
pub fn build_stream_url(public_url: &str, stream_id: &str, secret: &str) -> Result<String> {
    let mut url = Url::parse(public_url)
        .map_err(|e| crate::error::BridgeError::Config(format!("bad public_url: {e}")))?;
    let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
    url.set_scheme(scheme)
        .map_err(|()| crate::error::BridgeError::Config("bad public_url scheme".to_owned()))?;
    url.set_path(&format!("/voice/stream/{stream_id}"));
    url.query_pairs_mut().clear().append_pair("token", secret);
    Ok(url.to_string())
}

async fn healthz() -> impl IntoResponse {
    axum::Json(json!({ "status": "ok" }))
}

async fn list_voices(State(state): State<AppState>) -> Response {
    match state.tts.list_voices().await {
        Ok(voices) => axum::Json(json!({ "voices": voices })).into_response(),
        Err(e) => (
            StatusCode::BAD_GATEWAY,
            axum::Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

/// Request body for `POST /voice/call`.
#[derive(Debug, Deserialize)]
pub struct CallRequest {
    pub to_number: String,
    pub from_number: Option<String>,
    /// Per-call goal; when set, the greeting is pre-generated before the
    /// dial so there is no dead air once the far end answers.
    pub prompt: Option<String>,
    /// Silence delay before the greeting, in milliseconds.
    #[serde(default)]
    pub delay_ms: u64,
    pub user_id: Option<String>,
    pub chat_id: Option<String>,
}

async fn initiate_call(
    State(state): State<AppState>,
    axum::Json(request): axum::Json<CallRequest>,
) -> Response {
    let config = &state.config;
    if config.provider.app_id.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "provider missing app id");
    }
    let from_number = request
        .from_number
        .clone()
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| config.provider.from_number.clone());
    if from_number.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "no from number configured");
    }

    let stream_id = uuid::Uuid::new_v4().simple().to_string();
    let stream_url = match build_stream_url(
        &config.server.public_url,
        &stream_id,
        &config.server.stream_secret,
    ) {
        Ok(url) => url,
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    };

    // Pre-generate the greeting (blocking) so the queue is full before the
    // provider ever connects the socket.
    let preload = match request.prompt.as_deref() {
        Some(goal) => Some(generate_greeting(&state, goal).await),
        None => None,
    };

    info!("dialing {} (stream {stream_id})", request.to_number);
    let dial = DialRequest {
        to: request.to_number.clone(),
        from: from_number.clone(),
        app_id: config.provider.app_id.clone(),
        stream_url: Some(stream_url),
        codec: config.provider.codec,
    };
    let dialed = state.provider.dial(&dial).await;

    let new_call = NewCall {
        call_id: dialed.as_ref().ok().cloned(),
        direction: CallDirection::Outbound,
        to_number: request.to_number.clone(),
        from_number,
        status: if dialed.is_ok() { "initiated" } else { "failed" }.to_owned(),
        user_id: request.user_id.clone(),
        chat_id: request.chat_id.clone(),
    };
    let record_id = match state.records.create_call(&new_call) {
        Ok(id) => Some(id),
        Err(e) => {
            warn!("failed to create call record: {e}");
            None
        }
    };

    let call_id = match dialed {
        Ok(call_id) => call_id,
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    };

    let context = CallContext {
        call_id: call_id.clone(),
        record_id,
        prompt: request.prompt.clone(),
        max_duration: Duration::from_secs(config.call.max_duration_secs),
        limit_message: config.call.limit_message.clone(),
        delay_ms: request.delay_ms,
        user_id: request.user_id,
        chat_id: request.chat_id,
        inbound: false,
    };
    if let Err(e) = state.registry.register(&stream_id, context) {
        warn!("stream registration failed: {e}");
    }

    if let Some((frames, greeting)) = preload {
        match state.broker.create(&call_id) {
            Ok(producer) => {
                if let Some(text) = greeting {
                    producer.greeting.send_replace(Some(text));
                }
                for frame in frames {
                    let _ = producer.frames.send(frame);
                }
                // Dropping the producer closes the queue: end-of-stream.
            }
            Err(e) => warn!("preload queue not stored: {e}"),
        }
    }

    axum::Json(json!({
        "status": "initiated",
        "call_id": call_id,
        "record_id": record_id,
    }))
    .into_response()
}

#[derive(Debug, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// Provider webhook: answers inbound calls with a media stream attached and
/// kicks off background greeting generation.
async fn webhook(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
    axum::Json(event): axum::Json<serde_json::Value>,
) -> Response {
    if query.token.as_deref() != Some(state.config.server.stream_secret.as_str()) {
        warn!("webhook with bad token rejected");
        return error_response(StatusCode::FORBIDDEN, "unauthorized");
    }

    let event_type = event["data"]["event_type"].as_str().unwrap_or_default();
    let payload = &event["data"]["payload"];
    let call_id = payload["call_control_id"].as_str().unwrap_or_default();
    let direction = payload["direction"].as_str().unwrap_or("inbound");
    debug!("webhook event {event_type} for {call_id} ({direction})");

    match event_type {
        "call.initiated" if matches!(direction, "inbound" | "incoming") => {
            handle_inbound_call(&state, call_id, payload).await
        }
        "call.answered" => {
            info!("call answered: {call_id}");
            axum::Json(json!({ "status": "ok" })).into_response()
        }
        "call.hangup" => {
            info!("call hangup: {call_id}");
            axum::Json(json!({ "status": "ok" })).into_response()
        }
        _ => axum::Json(json!({ "status": "ok" })).into_response(),
    }
}

async fn handle_inbound_call(
    state: &AppState,
    call_id: &str,
    payload: &serde_json::Value,
) -> Response {
    let config = &state.config;
    if !config.provider.inbound_enabled {
        info!("inbound call rejected: inbound disabled");
        return axum::Json(json!({ "status": "rejected" })).into_response();
    }
    if call_id.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "missing call_control_id");
    }

    let stream_id = uuid::Uuid::new_v4().simple().to_string();
    let stream_url = match build_stream_url(
        &config.server.public_url,
        &stream_id,
        &config.server.stream_secret,
    ) {
        Ok(url) => url,
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    };

    let new_call = NewCall {
        call_id: Some(call_id.to_owned()),
        direction: CallDirection::Inbound,
        to_number: payload["to"].as_str().unwrap_or("unknown").to_owned(),
        from_number: payload["from"].as_str().unwrap_or("unknown").to_owned(),
        status: "ringing".to_owned(),
        user_id: config.provider.assigned_user_id.clone(),
        chat_id: None,
    };
    let record_id = match state.records.create_call(&new_call) {
        Ok(id) => Some(id),
        Err(e) => {
            warn!("failed to create call record: {e}");
            None
        }
    };

    let context = CallContext {
        call_id: call_id.to_owned(),
        record_id,
        prompt: config.provider.inbound_prompt.clone(),
        max_duration: Duration::from_secs(config.call.max_duration_secs),
        limit_message: config.call.limit_message.clone(),
        delay_ms: 0,
        user_id: config.provider.assigned_user_id.clone(),
        chat_id: None,
        inbound: true,
    };
    if let Err(e) = state.registry.register(&stream_id, context) {
        warn!("stream registration failed: {e}");
    }

    // Greeting generation races the socket attach; the session's sender
    // polls the broker, so starting late is fine.
    if let Some(prompt) = config.provider.inbound_prompt.clone() {
        match state.broker.create(call_id) {
            Ok(producer) => {
                let state = state.clone();
                let call_id = call_id.to_owned();
                tokio::spawn(async move {
                    debug!("inbound greeting generation started for {call_id}");
                    stream_greeting(&state, &prompt, producer).await;
                    debug!("inbound greeting generation finished for {call_id}");
                });
            }
            Err(e) => warn!("preload queue not created: {e}"),
        }
    }

    if let Err(e) = state
        .provider
        .answer(call_id, &stream_url, config.provider.codec)
        .await
    {
        warn!("failed to answer inbound call {call_id}: {e}");
    }
    axum::Json(json!({ "status": "ok" })).into_response()
}

#[derive(Debug, Deserialize)]
struct StreamQuery {
    token: Option<String>,
}

/// The media socket. The stream id in the path routes to the call context
/// registered at dial/answer time; the token query must match the
/// configured secret.
async fn media_stream(
    ws: WebSocketUpgrade,
    Path(stream_id): Path<String>,
    Query(query): Query<StreamQuery>,
    State(state): State<AppState>,
) -> Response {
    if !state.config.server.stream_secret.is_empty()
        && query.token.as_deref() != Some(state.config.server.stream_secret.as_str())
    {
        warn!("media socket with bad token rejected for stream {stream_id}");
        return StatusCode::FORBIDDEN.into_response();
    }
    let Some(context) = state.registry.resolve(&stream_id) else {
        warn!("unknown stream id: {stream_id}");
        return StatusCode::NOT_FOUND.into_response();
    };
    let deps = state.session_deps();
    ws.on_upgrade(move |socket| run_session(socket, stream_id, context, deps))
}

/// Generate the greeting for an outbound call, fully, before the dial.
/// Failures degrade to an empty preload (the call proceeds without a
/// greeting) rather than blocking the dial.
async fn generate_greeting(state: &AppState, goal: &str) -> (Vec<Vec<u8>>, Option<String>) {
    let mut frames = Vec::new();
    let Some(text) = greeting_text(state, goal).await else {
        return (frames, None);
    };

    let mut encoder = OutboundEncoder::new(state.config.provider.codec);
    match state.tts.synthesize(&text).await {
        Ok(mut stream) => {
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(chunk) => frames.extend(encoder.push(&chunk)),
                    Err(e) => {
                        warn!("greeting synthesis stream failed: {e}");
                        break;
                    }
                }
            }
            if let Some(last) = encoder.finish() {
                frames.push(last);
            }
        }
        Err(e) => warn!("greeting synthesis failed: {e}"),
    }
    info!("greeting pre-generated: {} frames", frames.len());
    (frames, Some(text))
}

/// Generate the greeting for an inbound call, streaming frames into the
/// preload queue as they are encoded.
async fn stream_greeting(state: &AppState, goal: &str, producer: PreloadProducer) {
    let Some(text) = greeting_text(state, goal).await else {
        return;
    };
    producer.greeting.send_replace(Some(text.clone()));

    let mut encoder = OutboundEncoder::new(state.config.provider.codec);
    match state.tts.synthesize(&text).await {
        Ok(mut stream) => {
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(chunk) => {
                        for frame in encoder.push(&chunk) {
                            if producer.frames.send(frame).is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        warn!("greeting synthesis stream failed: {e}");
                        break;
                    }
                }
            }
            if let Some(last) = encoder.finish() {
                let _ = producer.frames.send(last);
            }
        }
        Err(e) => warn!("greeting synthesis failed: {e}"),
    }
}

/// Ask the text backend for the greeting itself.
async fn greeting_text(state: &AppState, goal: &str) -> Option<String> {
    let system = match state.config.llm.system_prompt.as_deref().map(str::trim) {
        Some(prompt) if !prompt.is_empty() => format!("{prompt}\n\nCurrent Call Goal: {goal}"),
        _ => goal.to_owned(),
    };
    let messages = vec![
        ChatMessage::system(system),
        ChatMessage::user("Introduce yourself."),
    ];
    match state.llm.complete(&messages).await {
        Ok(reply) if !reply.trim().is_empty() => Some(reply.trim().to_owned()),
        Ok(_) => None,
        Err(e) => {
            warn!("greeting generation failed: {e}");
            None
        }
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, axum::Json(json!({ "error": message }))).into_response()
}
