//! Outbound notifications after a run completes: a chat message that is
//! created once and updated on later runs, and an HMAC-signed completion
//! webhook. Both are best-effort; failures log and leave retries to the
//! task policy.

use base64::Engine;
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;

use reflector_config::{WebhookSettings, ZulipSettings};
use reflector_core::{ActionItems, Participant, Topic, Transcript};

use crate::PipelineError;

type HmacSha256 = Hmac<Sha256>;

/// HMAC-SHA256 over `{timestamp}.{body}` with a base64-encoded secret,
/// base64-encoded result.
pub fn sign_webhook(secret_b64: &str, timestamp: &str, body: &[u8]) -> Result<String, PipelineError> {
    let secret = base64::engine::general_purpose::STANDARD
        .decode(secret_b64)
        .map_err(|e| PipelineError::Task(format!("webhook secret is not base64: {e}")))?;
    let mut mac = HmacSha256::new_from_slice(&secret)
        .map_err(|e| PipelineError::Task(format!("webhook hmac init: {e}")))?;
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(body);
    Ok(base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
}

#[derive(Debug, Serialize)]
pub struct WebhookTranscript {
    pub id: String,
    pub title: Option<String>,
    pub short_summary: Option<String>,
    pub long_summary: Option<String>,
    pub topics: Vec<Topic>,
    pub participants: Vec<Participant>,
    pub action_items: Option<ActionItems>,
    /// Mixed-audio object key; omitted when consent cleanup removed it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct WebhookPayload {
    pub transcript: WebhookTranscript,
    pub event_type: &'static str,
}

pub fn build_webhook_payload(transcript: &Transcript) -> WebhookPayload {
    let audio = if transcript.audio_deleted {
        None
    } else {
        Some(transcript.storage_audio_path())
    };
    WebhookPayload {
        transcript: WebhookTranscript {
            id: transcript.id.clone(),
            title: transcript.title.clone(),
            short_summary: transcript.short_summary.clone(),
            long_summary: transcript.long_summary.clone(),
            topics: transcript.topics.clone(),
            participants: transcript.participants.clone(),
            action_items: transcript.action_items.clone(),
            audio,
        },
        event_type: "transcript.completed",
    }
}

/// POST the signed completion payload. Returns false when no webhook is
/// configured or the transcript has no room attached.
pub async fn send_webhook(
    settings: &WebhookSettings,
    transcript: &Transcript,
) -> Result<bool, PipelineError> {
    let Some(url) = &settings.url else {
        tracing::debug!("webhook skipped, no url configured");
        return Ok(false);
    };
    if transcript.room_id.is_none() {
        tracing::debug!("webhook skipped, transcript has no room");
        return Ok(false);
    }

    let payload = build_webhook_payload(transcript);
    let body = serde_json::to_vec(&payload)?;
    let timestamp = chrono::Utc::now().timestamp().to_string();

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(settings.timeout_seconds))
        .build()
        .map_err(|e| PipelineError::Task(e.to_string()))?;
    let mut request = client
        .post(url)
        .header("content-type", "application/json")
        .header("x-webhook-timestamp", &timestamp);
    if let Some(secret) = &settings.secret {
        let signature = sign_webhook(secret, &timestamp, &body)?;
        request = request.header("x-webhook-signature", signature);
    }

    let response = request
        .body(body)
        .send()
        .await
        .map_err(|e| PipelineError::Task(format!("webhook delivery failed: {e}")))?;
    if !response.status().is_success() {
        return Err(PipelineError::Task(format!(
            "webhook returned HTTP {}",
            response.status()
        )));
    }
    tracing::info!(transcript_id = %transcript.id, "completion webhook delivered");
    Ok(true)
}

/// Markdown body of the chat notification.
pub fn notification_body(transcript: &Transcript) -> String {
    let title = transcript.title.as_deref().unwrap_or(&transcript.name);
    let mut body = format!("**{title}**");
    if let Some(recap) = &transcript.short_summary {
        body.push_str("\n\n");
        body.push_str(recap);
    }
    if !transcript.participants.is_empty() {
        let names: Vec<&str> = transcript
            .participants
            .iter()
            .map(|p| p.name.as_str())
            .collect();
        body.push_str(&format!("\n\nParticipants: {}", names.join(", ")));
    }
    body
}

/// Create or update the one chat message for this transcript. Returns the
/// message id when a message exists afterwards, idempotent over retries.
pub async fn post_chat_notification(
    settings: &ZulipSettings,
    transcript: &Transcript,
) -> Result<Option<i64>, PipelineError> {
    let (Some(realm), Some(bot_email), Some(api_key)) =
        (&settings.realm, &settings.bot_email, &settings.api_key)
    else {
        tracing::debug!("chat notification skipped, not configured");
        return Ok(None);
    };

    let client = reqwest::Client::new();
    let body = notification_body(transcript);
    let topic = transcript.title.as_deref().unwrap_or(&transcript.name);

    let response = if let Some(message_id) = transcript.zulip_message_id {
        client
            .patch(format!("{realm}/api/v1/messages/{message_id}"))
            .basic_auth(bot_email, Some(api_key))
            .form(&[("content", body.as_str())])
            .send()
            .await
    } else {
        client
            .post(format!("{realm}/api/v1/messages"))
            .basic_auth(bot_email, Some(api_key))
            .form(&[
                ("type", "stream"),
                ("to", settings.stream.as_str()),
                ("topic", topic),
                ("content", body.as_str()),
            ])
            .send()
            .await
    };

    let response = response.map_err(|e| PipelineError::Task(format!("chat post failed: {e}")))?;
    if !response.status().is_success() {
        return Err(PipelineError::Task(format!(
            "chat returned HTTP {}",
            response.status()
        )));
    }

    if transcript.zulip_message_id.is_some() {
        return Ok(transcript.zulip_message_id);
    }
    let value: serde_json::Value = response
        .json()
        .await
        .map_err(|e| PipelineError::Task(format!("chat response parse: {e}")))?;
    Ok(value.get("id").and_then(|id| id.as_i64()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_is_stable_and_verifiable() {
        let secret = base64::engine::general_purpose::STANDARD.encode(b"shared-secret");
        let sig_a = sign_webhook(&secret, "1712345678", b"{\"x\":1}").unwrap();
        let sig_b = sign_webhook(&secret, "1712345678", b"{\"x\":1}").unwrap();
        assert_eq!(sig_a, sig_b);

        let different = sign_webhook(&secret, "1712345679", b"{\"x\":1}").unwrap();
        assert_ne!(sig_a, different);
    }

    #[test]
    fn test_signature_rejects_bad_secret() {
        assert!(sign_webhook("not base64!!!", "0", b"body").is_err());
    }

    #[test]
    fn test_payload_omits_audio_after_consent_cleanup() {
        let mut transcript = Transcript::new("t");
        transcript.title = Some("Sync".into());
        transcript.room_id = Some("room".into());

        let with_audio = build_webhook_payload(&transcript);
        assert!(with_audio.transcript.audio.is_some());

        transcript.audio_deleted = true;
        let without_audio = build_webhook_payload(&transcript);
        assert!(without_audio.transcript.audio.is_none());

        let json = serde_json::to_value(&without_audio).unwrap();
        assert!(json["transcript"].get("audio").is_none());
        assert_eq!(json["event_type"], "transcript.completed");
    }

    #[test]
    fn test_notification_body_contains_title_and_recap() {
        let mut transcript = Transcript::new("fallback name");
        transcript.title = Some("Planning".into());
        transcript.short_summary = Some("We planned.".into());
        let body = notification_body(&transcript);
        assert!(body.starts_with("**Planning**"));
        assert!(body.contains("We planned."));
    }
}
