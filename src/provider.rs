//! Call-control collaborator.
//!
//! The bridge depends on a deliberately narrow surface: dial, answer,
//! hangup. The REST implementation targets a Telnyx-style call-control API;
//! anything richer (number provisioning, SMS, balance) is out of scope.

use crate::codec::WireCodec;
use crate::config::ProviderConfig;
use crate::error::{BridgeError, Result};
use async_trait::async_trait;
use tracing::{debug, warn};

/// Parameters for an outbound dial.
#[derive(Debug, Clone)]
pub struct DialRequest {
    pub to: String,
    pub from: String,
    /// Call-control application (connection) id.
    pub app_id: String,
    /// Media stream URL the provider should connect back to.
    pub stream_url: Option<String>,
    pub codec: WireCodec,
}

/// The three call actions the bridge performs.
#[async_trait]
pub trait CallControl: Send + Sync {
    /// Start an outbound call. Returns the provider call id.
    async fn dial(&self, request: &DialRequest) -> Result<String>;

    /// Answer an inbound call, attaching the media stream.
    async fn answer(&self, call_id: &str, stream_url: &str, codec: WireCodec) -> Result<()>;

    /// End a call.
    async fn hangup(&self, call_id: &str) -> Result<()>;
}

/// REST implementation of [`CallControl`].
#[derive(Debug, Clone)]
pub struct RestCallControl {
    api_base: String,
    api_key: String,
    http: reqwest::Client,
}

impl RestCallControl {
    /// Create a client from config.
    pub fn new(config: &ProviderConfig) -> Self {
        Self {
            api_base: config.api_base.trim_end_matches('/').to_owned(),
            api_key: config.api_key.clone(),
            http: reqwest::Client::new(),
        }
    }

    async fn post_action(&self, url: String, body: serde_json::Value) -> Result<serde_json::Value> {
        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| BridgeError::Provider(format!("request failed: {e}")))?;
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(BridgeError::Provider(format!("{status}: {text}")));
        }
        serde_json::from_str(&text)
            .map_err(|e| BridgeError::Provider(format!("bad response body: {e}")))
    }
}

#[async_trait]
impl CallControl for RestCallControl {
    async fn dial(&self, request: &DialRequest) -> Result<String> {
        let mut body = serde_json::json!({
            "connection_id": request.app_id,
            "to": request.to.trim(),
            "from": request.from.trim(),
        });
        if let Some(ref stream_url) = request.stream_url {
            body["stream_url"] = serde_json::json!(stream_url);
            body["stream_track"] = serde_json::json!("both_tracks");
            body["stream_bidirectional_mode"] = serde_json::json!("rtp");
            body["stream_bidirectional_codec"] = serde_json::json!(request.codec.as_str());
        }
        debug!("dialing {} from {}", request.to, request.from);

        let data = self
            .post_action(format!("{}/calls", self.api_base), body)
            .await?;
        data["data"]["call_control_id"]
            .as_str()
            .map(str::to_owned)
            .ok_or_else(|| BridgeError::Provider("dial response missing call id".to_owned()))
    }

    async fn answer(&self, call_id: &str, stream_url: &str, codec: WireCodec) -> Result<()> {
        let body = serde_json::json!({
            "stream_url": stream_url,
            "stream_track": "both_tracks",
            "stream_bidirectional_mode": "rtp",
            "stream_bidirectional_codec": codec.as_str(),
        });
        self.post_action(
            format!("{}/calls/{call_id}/actions/answer", self.api_base),
            body,
        )
        .await
        .map(|_| ())
    }

    async fn hangup(&self, call_id: &str) -> Result<()> {
        let body = serde_json::json!({ "command_id": "hangup_command" });
        match self
            .post_action(
                format!("{}/calls/{call_id}/actions/hangup", self.api_base),
                body,
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => {
                warn!("hangup for {call_id} rejected: {e}");
                Err(e)
            }
        }
    }
}
