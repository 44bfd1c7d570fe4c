//! Per-call media socket session.
//!
//! Owns the socket for the lifetime of one call and supervises everything
//! that runs inside it: the handshake, the initial-audio sender, the
//! duration monitor, per-turn conversation tasks, and final teardown with
//! persistence. The session moves through `Handshaking → Active →
//! Terminating → Closed`; a stop event or handshake error goes straight to
//! `Closed` without touching the call record.

use crate::alerts::AlertGateway;
use crate::codec::FRAME_MS;
use crate::config::BridgeConfig;
use crate::llm::{ChatMessage, LlmClient};
use crate::preload::PreloadBroker;
use crate::provider::CallControl;
use crate::records::{CallLogStore, CallOutcome};
use crate::registry::CallContext;
use crate::stt::{SttClient, wav_container};
use crate::tts::TtsClient;
use crate::turn::{Speaker, TurnEnv, compose_system_prompt, run_turn};
use crate::vad::TurnSegmenter;
use crate::wire::{InboundEvent, OutboundFrame, parse_event};
use axum::extract::ws::{Message, WebSocket};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Session lifecycle phase, for logs and invariants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Handshaking,
    Active,
    Terminating,
    Closed,
}

/// The bot-speaking gate.
///
/// While held, inbound audio is discarded before it reaches the segmenter,
/// so the bot never transcribes its own echo. Only the session hands out
/// guards; release happens on guard drop, which covers success, error, and
/// cancellation alike.
#[derive(Clone, Default)]
pub struct SpeakingGate(Arc<AtomicBool>);

impl SpeakingGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the bot currently holds the floor.
    pub fn is_held(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// Take the floor. The returned guard releases it when dropped.
    pub fn hold(&self) -> SpeakingGuard {
        self.0.store(true, Ordering::Relaxed);
        SpeakingGuard(Arc::clone(&self.0))
    }
}

/// RAII guard for [`SpeakingGate`].
pub struct SpeakingGuard(Arc<AtomicBool>);

impl Drop for SpeakingGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Relaxed);
        debug!("speaking gate released");
    }
}

/// Conversation state scoped to one call: role-tagged history for the text
/// backend plus the flat transcript written to the call record. Append-only.
#[derive(Default)]
pub struct Conversation {
    history: Mutex<Vec<ChatMessage>>,
    transcript: Mutex<Vec<String>>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_user(&self, text: &str) {
        self.transcript
            .lock()
            .expect("transcript lock")
            .push(format!("User: {text}"));
        self.history
            .lock()
            .expect("history lock")
            .push(ChatMessage::user(text));
    }

    pub fn push_assistant(&self, text: &str) {
        self.transcript
            .lock()
            .expect("transcript lock")
            .push(format!("Assistant: {text}"));
        self.history
            .lock()
            .expect("history lock")
            .push(ChatMessage::assistant(text));
    }

    /// Record the pre-generated greeting, unless an assistant utterance is
    /// already present (the greeting may be observed twice when generation
    /// finishes between socket attach and queue drain).
    pub fn seed_greeting(&self, text: &str) {
        let mut history = self.history.lock().expect("history lock");
        if history
            .iter()
            .any(|m| m.role == crate::llm::ChatRole::Assistant)
        {
            return;
        }
        debug!("seeding history with pre-generated greeting");
        history.push(ChatMessage::assistant(text));
        self.transcript
            .lock()
            .expect("transcript lock")
            .push(format!("Assistant: {text}"));
    }

    /// Snapshot of the history for building a turn's message list.
    pub fn history(&self) -> Vec<ChatMessage> {
        self.history.lock().expect("history lock").clone()
    }

    /// The transcript as written to the call record.
    pub fn transcript_joined(&self) -> String {
        self.transcript.lock().expect("transcript lock").join("\n")
    }
}

/// Handle for sending frames to the socket from any session task.
///
/// A dedicated writer task owns the sink; senders observe a closed socket
/// as a `false` return and stop quietly, so send-after-close can never
/// panic a task.
#[derive(Clone)]
pub struct Outbound {
    tx: mpsc::UnboundedSender<String>,
}

impl Outbound {
    /// Queue one media frame. Returns `false` once the socket is gone.
    pub fn send_media(&self, media_id: &str, wire_bytes: &[u8]) -> bool {
        self.tx
            .send(OutboundFrame::new(media_id, wire_bytes).to_json())
            .is_ok()
    }
}

/// Process-wide collaborators a session needs.
#[derive(Clone)]
pub struct SessionDeps {
    pub config: Arc<BridgeConfig>,
    pub broker: Arc<PreloadBroker>,
    pub records: Arc<CallLogStore>,
    pub provider: Arc<dyn CallControl>,
    pub llm: LlmClient,
    pub stt: SttClient,
    pub tts: TtsClient,
    pub alerts: AlertGateway,
}

/// Drive one media socket session to completion.
///
/// `route_id` is the opaque stream id from the socket path, used to tag
/// frames until the provider issues a media-session id in `start`.
pub async fn run_session(socket: WebSocket, route_id: String, ctx: CallContext, deps: SessionDeps) {
    info!(
        "session {route_id}: phase {:?} (call {})",
        SessionPhase::Handshaking,
        ctx.call_id
    );

    let (sink, mut inbound) = socket.split();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let outbound = Outbound { tx: out_tx };
    let writer = tokio::spawn(write_loop(sink, out_rx));

    let codec = deps.config.provider.codec;
    let Some(media_id) = handshake(&mut inbound, &outbound, &route_id, codec).await else {
        info!(
            "session {route_id}: handshake aborted, phase {:?}",
            SessionPhase::Closed
        );
        drop(outbound);
        let _ = writer.await;
        return;
    };
    info!("session {route_id}: phase {:?} (media id {media_id})", SessionPhase::Active);

    let started = Instant::now();
    let session_token = CancellationToken::new();
    let children = session_token.child_token();
    let gate = SpeakingGate::new();
    let conversation = Arc::new(Conversation::new());
    let speaker = Speaker {
        tts: deps.tts.clone(),
        codec,
        media_id: media_id.clone(),
        outbound: outbound.clone(),
    };

    // Initial-audio sender: silence burst, configured delay, preload drain.
    // It holds the gate so the far end's line noise during our own greeting
    // never reaches the segmenter.
    let sender = {
        let token = children.clone();
        let guard = gate.hold();
        let speaker = speaker.clone();
        let broker = Arc::clone(&deps.broker);
        let conversation = Arc::clone(&conversation);
        let ctx = ctx.clone();
        let wait = Duration::from_secs(deps.config.preload_wait_secs());
        tokio::spawn(async move {
            let _guard = guard;
            let _ = token
                .run_until_cancelled(send_initial_audio(speaker, broker, ctx, wait, conversation))
                .await;
        })
    };

    // Duration monitor: force-terminates the call at the configured limit.
    let monitor = {
        let children = children.clone();
        let session_token = session_token.clone();
        let speaker = speaker.clone();
        let provider = Arc::clone(&deps.provider);
        let ctx = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(ctx.max_duration).await;
            warn!(
                "call {} reached its {}s limit; terminating",
                ctx.call_id,
                ctx.max_duration.as_secs()
            );
            children.cancel();
            if let Err(e) = speaker.speak(&ctx.limit_message).await {
                warn!("limit message synthesis failed: {e}");
            }
            tokio::time::sleep(Duration::from_secs(2)).await;
            if let Err(e) = provider.hangup(&ctx.call_id).await {
                warn!("provider hangup failed: {e}");
            }
            session_token.cancel();
        })
    };

    let turn_env = Arc::new(TurnEnv {
        llm: deps.llm.clone(),
        speaker: speaker.clone(),
        provider: Arc::clone(&deps.provider),
        call_id: ctx.call_id.clone(),
        system_prompt: compose_system_prompt(
            deps.config.llm.system_prompt.as_deref(),
            ctx.prompt.as_deref(),
            ctx.user_id.as_deref(),
            ctx.chat_id.as_deref(),
        ),
        forward_context: deps.config.llm.forward_context,
        conversation: Arc::clone(&conversation),
        session_token: session_token.clone(),
    });

    let mut turns: JoinSet<()> = JoinSet::new();
    let mut segmenter = TurnSegmenter::new(deps.config.vad.clone());
    let mut was_speaking = true;

    loop {
        let msg = tokio::select! {
            () = session_token.cancelled() => break,
            msg = inbound.next() => msg,
        };
        let Some(Ok(msg)) = msg else {
            info!("session {route_id}: socket disconnected");
            break;
        };
        let Message::Text(text) = msg else {
            continue;
        };
        match parse_event(text.as_str()) {
            Some(InboundEvent::Media { media, .. }) => {
                if gate.is_held() {
                    was_speaking = true;
                    continue;
                }
                if was_speaking {
                    // First frame after the bot finished: start a fresh
                    // utterance so tail audio is not misattributed.
                    segmenter.reset();
                    was_speaking = false;
                }
                let Ok(wire_bytes) = BASE64.decode(media.payload.as_bytes()) else {
                    debug!("undecodable media payload; dropping frame");
                    continue;
                };
                let pcm = codec.decode(&wire_bytes);
                let Some(utterance) = segmenter.push(&pcm) else {
                    continue;
                };
                debug!("utterance boundary: {:?}", utterance.reason);
                let wav = match wav_container(&utterance.pcm) {
                    Ok(wav) => wav,
                    Err(e) => {
                        warn!("dropping utterance: {e}");
                        continue;
                    }
                };
                let transcript = match deps.stt.transcribe(wav).await {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("transcription failed; turn degraded to silence: {e}");
                        continue;
                    }
                };
                if transcript.trim().is_empty() {
                    debug!("transcription empty; nothing to do");
                    continue;
                }
                let guard = gate.hold();
                let env = Arc::clone(&turn_env);
                let token = children.clone();
                turns.spawn(async move {
                    let _ = token.run_until_cancelled(run_turn(&env, transcript, guard)).await;
                });
            }
            Some(InboundEvent::Stop) => {
                info!("session {route_id}: provider stop event");
                break;
            }
            // Repeated connected/start events are harmless after handshake.
            Some(InboundEvent::Connected | InboundEvent::Start { .. }) | None => {}
        }
    }

    info!("session {route_id}: phase {:?}", SessionPhase::Terminating);
    children.cancel();
    let _ = sender.await;
    while turns.join_next().await.is_some() {}
    monitor.abort();
    let _ = monitor.await;

    // Closing an already-closed socket is a no-op in the writer.
    drop(turn_env);
    drop(speaker);
    drop(outbound);
    let _ = tokio::time::timeout(Duration::from_secs(5), writer).await;

    finalize(&ctx, &deps, &conversation, started).await;
    info!("session {route_id}: phase {:?}", SessionPhase::Closed);
}

/// Writer task: single owner of the socket sink. Exits when every sender
/// handle is gone or the socket errors, then closes the sink defensively.
async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<String>,
) {
    while let Some(text) = rx.recv().await {
        if sink.send(Message::Text(text.into())).await.is_err() {
            debug!("socket write failed; discarding remaining outbound frames");
            break;
        }
    }
    let _ = sink.close().await;
}

/// Strict handshake: `connected` (answered with a silence burst to prime
/// the audio path), then `start` carrying the media-session id. A `media`
/// event arriving first carries the id too and completes the handshake;
/// `stop`, disconnect, or garbage aborts.
async fn handshake(
    inbound: &mut SplitStream<WebSocket>,
    outbound: &Outbound,
    route_id: &str,
    codec: crate::codec::WireCodec,
) -> Option<String> {
    loop {
        let msg = inbound.next().await?.ok()?;
        let Message::Text(text) = msg else {
            continue;
        };
        match parse_event(text.as_str()) {
            Some(InboundEvent::Connected) => {
                debug!("handshake: connected; sending silence burst");
                for _ in 0..50 {
                    if !outbound.send_media(route_id, &codec.silence_frame()) {
                        return None;
                    }
                    tokio::time::sleep(Duration::from_millis(FRAME_MS)).await;
                }
            }
            Some(InboundEvent::Start { stream_id }) => {
                return Some(stream_id.unwrap_or_else(|| route_id.to_owned()));
            }
            Some(InboundEvent::Media { stream_id, .. }) => {
                // Rare timing race: media before start. The id rides along;
                // this one frame is sacrificed.
                if let Some(id) = stream_id {
                    debug!("handshake: media before start; adopting media id");
                    return Some(id);
                }
            }
            Some(InboundEvent::Stop) => {
                debug!("handshake: stop before start");
                return None;
            }
            None => {}
        }
    }
}

/// Initial audio: 0.5 s of silence, the configured delay as continuous
/// silence (keeping the audio path warm rather than pausing), then the
/// preloaded greeting if one exists, then a 2 s echo tail.
async fn send_initial_audio(
    speaker: Speaker,
    broker: Arc<PreloadBroker>,
    ctx: CallContext,
    preload_wait: Duration,
    conversation: Arc<Conversation>,
) {
    speaker.silence(25, Duration::from_millis(FRAME_MS)).await;

    if ctx.delay_ms > 0 {
        debug!("delaying audio {}ms with continuous silence", ctx.delay_ms);
        let frames = (ctx.delay_ms / FRAME_MS) as usize;
        speaker.silence(frames, Duration::from_millis(FRAME_MS)).await;
    }

    // Inbound greetings are generated in the background and may not exist
    // yet; outbound greetings were queued before the dial.
    let queue = if ctx.inbound && ctx.prompt.is_some() {
        broker.wait_for(&ctx.call_id, preload_wait).await
    } else {
        broker.take(&ctx.call_id)
    };

    if let Some(mut queue) = queue {
        if let Some(greeting) = queue.greeting.borrow().clone() {
            conversation.seed_greeting(&greeting);
        }
        let mut sent = 0_usize;
        while let Some(frame) = queue.frames.recv().await {
            if !speaker.outbound.send_media(&speaker.media_id, &frame) {
                warn!("socket closed during preload drain");
                return;
            }
            sent += 1;
        }
        debug!("preload drained: {sent} frames");
        // Generation may have finished after we first looked.
        if let Some(greeting) = queue.greeting.borrow().clone() {
            conversation.seed_greeting(&greeting);
        }
    }

    tokio::time::sleep(Duration::from_secs(2)).await;
}

/// Exactly-once teardown persistence, plus best-effort inbound alerting.
async fn finalize(
    ctx: &CallContext,
    deps: &SessionDeps,
    conversation: &Conversation,
    started: Instant,
) {
    let duration_secs = started.elapsed().as_secs() as i64;
    let outcome = CallOutcome {
        status: "completed".to_owned(),
        duration_secs,
        transcript: conversation.transcript_joined(),
        cost: duration_secs as f64 / 60.0 * deps.config.call.cost_per_minute,
    };
    let record = match deps.records.finalize_call(ctx.record_id, &ctx.call_id, &outcome) {
        Ok(Some(record)) => record,
        Ok(None) => {
            warn!("no call record found for {} at teardown", ctx.call_id);
            return;
        }
        Err(e) => {
            warn!("failed to finalize call record for {}: {e}", ctx.call_id);
            return;
        }
    };

    if record.direction == "inbound" && record.user_id.is_some() && deps.alerts.enabled() {
        if deps
            .alerts
            .deliver_call_summary(&deps.records, &record)
            .await
        {
            info!("inbound call summary delivered for record {}", record.id);
        } else {
            warn!("inbound call summary delivery failed for record {}", record.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_releases_on_guard_drop() {
        let gate = SpeakingGate::new();
        assert!(!gate.is_held());
        let guard = gate.hold();
        assert!(gate.is_held());
        drop(guard);
        assert!(!gate.is_held());
    }

    #[test]
    fn gate_releases_when_task_is_aborted() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .expect("runtime");
        rt.block_on(async {
            let gate = SpeakingGate::new();
            let guard = gate.hold();
            let task = tokio::spawn(async move {
                let _guard = guard;
                tokio::time::sleep(Duration::from_secs(60)).await;
            });
            tokio::task::yield_now().await;
            assert!(gate.is_held());
            task.abort();
            let _ = task.await;
            assert!(!gate.is_held());
        });
    }

    #[test]
    fn greeting_seeds_history_once() {
        let conversation = Conversation::new();
        conversation.seed_greeting("Hello, this is the assistant.");
        conversation.seed_greeting("Hello again.");
        let history = conversation.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content, "Hello, this is the assistant.");
        assert_eq!(
            conversation.transcript_joined(),
            "Assistant: Hello, this is the assistant."
        );
    }

    #[test]
    fn transcript_interleaves_roles_in_order() {
        let conversation = Conversation::new();
        conversation.push_user("hi");
        conversation.push_assistant("hello!");
        conversation.push_user("bye");
        assert_eq!(
            conversation.transcript_joined(),
            "User: hi\nAssistant: hello!\nUser: bye"
        );
        assert_eq!(conversation.history().len(), 3);
    }
}
