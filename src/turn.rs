//! One conversational turn: transcript in, spoken reply out.
//!
//! A turn appends the user utterance to history, asks the text backend for
//! a reply (streamed, but fully reassembled before anything acts on it),
//! strips any embedded call-control directive, speaks the rest, and updates
//! history with what was actually said. Backend failures degrade the turn
//! to silence; the speaking gate is released on every exit path.

use crate::codec::{FRAME_MS, WireCodec};
use crate::codec::outbound::OutboundEncoder;
use crate::directive::extract_directive;
use crate::error::Result;
use crate::llm::{ChatMessage, LlmClient};
use crate::provider::CallControl;
use crate::session::{Conversation, Outbound, SpeakingGuard};
use crate::tts::TtsClient;
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Tool instructions appended to every system prompt. The model ends a call
/// by appending a JSON block after its spoken sign-off.
const TOOL_INSTRUCTIONS: &str = r#"
You can control the call by outputting a JSON block at the very end of your response.
Available Tools:
- hangup: Ends the call. Use this when the user says goodbye or wants to stop.

If you decide to hangup, you MUST generate a polite sign-off message (e.g., "Goodbye!", "Have a nice day!") before the JSON block in the "[Your spoken response here]" section.

Format:
[Your spoken response here]
```json
{
  "action": "hangup",
  "reason": "user said goodbye"
}
```
IMPORTANT: Do NOT output any text after the JSON block. Do NOT read the JSON block aloud.
"#;

const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful AI assistant.";

/// Trailing pad added to the hangup wait so the far end hears the sign-off
/// tail before the provider tears the leg down.
const HANGUP_PAD: Duration = Duration::from_millis(100);

/// Pause after a normal turn before the gate opens, so the segmenter does
/// not pick up buffered tail audio as new speech.
const ECHO_TAIL: Duration = Duration::from_secs(1);

/// Compose the per-session system prompt from the deployment prompt, the
/// per-call goal, and the caller context line, with the tool instructions
/// appended.
pub fn compose_system_prompt(
    deployment: Option<&str>,
    goal: Option<&str>,
    user_id: Option<&str>,
    chat_id: Option<&str>,
) -> String {
    let deployment = deployment.map(str::trim).filter(|s| !s.is_empty());
    let mut base = match (deployment, goal) {
        (Some(system), Some(goal)) => format!("{system}\n\nCurrent Call Goal: {goal}"),
        (None, Some(goal)) => goal.to_owned(),
        (Some(system), None) => system.to_owned(),
        (None, None) => DEFAULT_SYSTEM_PROMPT.to_owned(),
    };
    if user_id.is_some() || chat_id.is_some() {
        base.push_str(&format!(
            "\n\n[Context: user_id={}, chat_id={}]",
            user_id.unwrap_or("None"),
            chat_id.unwrap_or("None"),
        ));
    }
    base.push('\n');
    base.push_str(TOOL_INSTRUCTIONS);
    base
}

/// Build the message list for one turn.
///
/// With context forwarding, the full history (which already includes the
/// current user utterance) follows the system prompt; stateless mode sends
/// only the system prompt and the current utterance.
pub fn build_messages(
    system_prompt: &str,
    history: &[ChatMessage],
    current_user: &str,
    forward_context: bool,
) -> Vec<ChatMessage> {
    let mut messages = vec![ChatMessage::system(system_prompt)];
    if forward_context {
        messages.extend_from_slice(history);
    } else {
        messages.push(ChatMessage::user(current_user));
    }
    messages
}

/// How long to wait before hanging up so emitted audio finishes playing.
///
/// Playback duration is derived from the emitted byte count and the wire
/// codec's byte rate; the wall clock already spent streaming is subtracted.
pub fn hangup_wait(byte_rate: u32, sent_bytes: u64, elapsed: Duration) -> Duration {
    if sent_bytes == 0 || byte_rate == 0 {
        return HANGUP_PAD;
    }
    let playback = Duration::from_secs_f64(sent_bytes as f64 / f64::from(byte_rate));
    playback.saturating_sub(elapsed) + HANGUP_PAD
}

/// Synthesizes text and streams the encoded frames to the socket.
#[derive(Clone)]
pub struct Speaker {
    pub tts: TtsClient,
    pub codec: WireCodec,
    pub media_id: String,
    pub outbound: Outbound,
}

impl Speaker {
    /// Synthesize `text` and stream it, paced at one frame per 20 ms.
    ///
    /// Returns the number of wire bytes emitted and the instant the first
    /// frame went out.
    ///
    /// # Errors
    ///
    /// Returns an error if synthesis fails; frames already sent stay sent.
    pub async fn speak(&self, text: &str) -> Result<(u64, Option<Instant>)> {
        let mut stream = self.tts.synthesize(text).await?;
        let mut encoder = OutboundEncoder::new(self.codec);
        let mut sent_bytes = 0_u64;
        let mut first_frame: Option<Instant> = None;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            for block in encoder.push(&chunk) {
                first_frame.get_or_insert_with(Instant::now);
                sent_bytes += block.len() as u64;
                if !self.outbound.send_media(&self.media_id, &block) {
                    debug!("socket closed mid-synthesis");
                    return Ok((sent_bytes, first_frame));
                }
                tokio::time::sleep(Duration::from_millis(FRAME_MS)).await;
            }
        }
        if let Some(block) = encoder.finish() {
            first_frame.get_or_insert_with(Instant::now);
            sent_bytes += block.len() as u64;
            self.outbound.send_media(&self.media_id, &block);
        }
        Ok((sent_bytes, first_frame))
    }

    /// Send `frames` frames of silence, paced at `pace` per frame.
    pub async fn silence(&self, frames: usize, pace: Duration) {
        for _ in 0..frames {
            if !self.outbound.send_media(&self.media_id, &self.codec.silence_frame()) {
                return;
            }
            tokio::time::sleep(pace).await;
        }
    }
}

/// Everything a turn needs from its session.
pub struct TurnEnv {
    pub llm: LlmClient,
    pub speaker: Speaker,
    pub provider: Arc<dyn CallControl>,
    pub call_id: String,
    pub system_prompt: String,
    pub forward_context: bool,
    pub conversation: Arc<Conversation>,
    /// Cancelling this closes the whole session (used after a hangup).
    pub session_token: CancellationToken,
}

/// Run one conversational turn. The guard keeps the speaking gate held for
/// the duration and releases it on every exit path, including cancellation.
pub async fn run_turn(env: &TurnEnv, transcript: String, _guard: SpeakingGuard) {
    info!("turn started: {transcript:?}");
    env.conversation.push_user(&transcript);

    let messages = {
        let history = env.conversation.history();
        build_messages(&env.system_prompt, &history, &transcript, env.forward_context)
    };

    let reply = match env.llm.complete(&messages).await {
        Ok(reply) => reply,
        Err(e) => {
            warn!("text generation failed; degrading turn to silence: {e}");
            return;
        }
    };

    let (spoken, directive) = extract_directive(&reply);
    let should_hangup = directive.as_ref().is_some_and(|d| d.is_hangup());
    if let Some(d) = directive {
        info!("directive: action={} reason={:?}", d.action, d.reason);
    }

    let mut sent_bytes = 0_u64;
    let mut first_frame = None;
    if !spoken.trim().is_empty() {
        // Short silence pad so the leading edge is not clipped.
        env.speaker.silence(5, Duration::from_millis(10)).await;
        match env.speaker.speak(&spoken).await {
            Ok((bytes, started)) => {
                sent_bytes = bytes;
                first_frame = started;
            }
            Err(e) => {
                warn!("synthesis failed; degrading turn to silence: {e}");
                return;
            }
        }
        env.conversation.push_assistant(&spoken);
    }

    if should_hangup {
        let elapsed = first_frame.map_or(Duration::ZERO, |t| t.elapsed());
        let wait = hangup_wait(env.speaker.codec.byte_rate(), sent_bytes, elapsed);
        debug!("hangup in {:.2}s after sign-off playback", wait.as_secs_f64());
        tokio::time::sleep(wait).await;
        if let Err(e) = env.provider.hangup(&env.call_id).await {
            warn!("provider hangup failed: {e}");
        }
        env.session_token.cancel();
    } else {
        tokio::time::sleep(ECHO_TAIL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_prompt_merges_deployment_and_goal() {
        let prompt = compose_system_prompt(
            Some("Be concise."),
            Some("Book a table for two."),
            Some("u-1"),
            None,
        );
        assert!(prompt.starts_with("Be concise."));
        assert!(prompt.contains("Current Call Goal: Book a table for two."));
        assert!(prompt.contains("user_id=u-1"));
        assert!(prompt.contains("chat_id=None"));
        assert!(prompt.contains("hangup"));
    }

    #[test]
    fn system_prompt_defaults_when_nothing_configured() {
        let prompt = compose_system_prompt(None, None, None, None);
        assert!(prompt.starts_with(DEFAULT_SYSTEM_PROMPT));
        assert!(!prompt.contains("[Context:"));
    }

    #[test]
    fn stateless_mode_sends_only_current_utterance() {
        let history = vec![
            ChatMessage::user("earlier"),
            ChatMessage::assistant("reply"),
            ChatMessage::user("now"),
        ];
        let messages = build_messages("sys", &history, "now", false);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].content, "now");

        let forwarded = build_messages("sys", &history, "now", true);
        assert_eq!(forwarded.len(), 4);
        assert_eq!(forwarded[3].content, "now");
    }

    #[test]
    fn hangup_wait_covers_remaining_playback() {
        // 8000 B/s, 16000 bytes = 2s of audio; 0.5s already elapsed.
        let wait = hangup_wait(8_000, 16_000, Duration::from_millis(500));
        assert_eq!(wait, Duration::from_millis(1_600));
    }

    #[test]
    fn hangup_wait_clamps_to_pad_when_playback_done() {
        let wait = hangup_wait(8_000, 8_000, Duration::from_secs(5));
        assert_eq!(wait, HANGUP_PAD);
        assert_eq!(hangup_wait(8_000, 0, Duration::ZERO), HANGUP_PAD);
    }

    #[test]
    fn hangup_wait_uses_codec_byte_rate() {
        // The same byte count plays twice as long on an 8-bit codec.
        let l16 = hangup_wait(16_000, 16_000, Duration::ZERO);
        let pcmu = hangup_wait(8_000, 16_000, Duration::ZERO);
        assert_eq!(l16, Duration::from_millis(1_100));
        assert_eq!(pcmu, Duration::from_millis(2_100));
    }
}
