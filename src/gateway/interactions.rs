//! HTTP side of the platform: commands are posted as interactions and recent channel
//! history can be fetched. Both need the token; interactions also need the gateway's
//! session id.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, instrument};

use super::errors::{GatewayError, GatewayResult};
use super::message::PlatformMessage;
use super::traits::{GatewayCommand, MessageHistory};
use crate::config::{GatewayConfig, SendConfig};
use crate::constants::interaction;
use crate::resilience::{retry_with_backoff, RetryPolicy};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct InteractionClient {
    http: reqwest::Client,
    api_base: String,
    application_id: String,
    guild_id: String,
    channel_id: String,
    command_id: String,
    command_version: String,
    retry: RetryPolicy,
}

impl InteractionClient {
    pub fn new(gateway: &GatewayConfig, send: &SendConfig) -> GatewayResult<Self> {
        let mut headers = HeaderMap::new();
        let mut token = HeaderValue::from_str(&gateway.user_token).map_err(|e| {
            GatewayError::Configuration {
                message: format!("user token is not a valid header value: {e}"),
            }
        })?;
        token.set_sensitive(true);
        headers.insert(AUTHORIZATION, token);

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| GatewayError::Configuration {
                message: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            http,
            api_base: gateway.api_base.trim_end_matches('/').to_string(),
            application_id: gateway.bot_id.clone(),
            guild_id: gateway.guild_id.clone(),
            channel_id: gateway.channel_id.clone(),
            command_id: gateway.imagine_command_id.clone(),
            command_version: gateway.imagine_command_version.clone(),
            retry: RetryPolicy::linear(send.max_attempts, Duration::from_millis(send.base_delay_ms)),
        })
    }

    /// Interaction body for `command`; the nonce makes the platform echo the job id
    pub fn build_payload(&self, session_id: &str, command: &GatewayCommand) -> Value {
        match command {
            GatewayCommand::Imagine { nonce, prompt } => json!({
                "type": interaction::APPLICATION_COMMAND,
                "application_id": self.application_id,
                "guild_id": self.guild_id,
                "channel_id": self.channel_id,
                "session_id": session_id,
                "data": {
                    "version": self.command_version,
                    "id": self.command_id,
                    "name": "imagine",
                    "type": interaction::CHAT_INPUT,
                    "options": [{"type": interaction::STRING_OPTION, "name": "prompt", "value": prompt}],
                    "attachments": [],
                },
                "nonce": nonce,
            }),
            GatewayCommand::Action {
                nonce,
                message_id,
                custom_id,
            } => json!({
                "type": interaction::MESSAGE_COMPONENT,
                "application_id": self.application_id,
                "guild_id": self.guild_id,
                "channel_id": self.channel_id,
                "message_flags": 0,
                "message_id": message_id,
                "session_id": session_id,
                "data": {
                    "component_type": interaction::BUTTON,
                    "custom_id": custom_id,
                },
                "nonce": nonce,
            }),
        }
    }

    /// Post the command, retrying transient failures with linear delay
    #[instrument(skip(self, session_id, command), fields(command = command.name(), nonce = command.nonce()))]
    pub async fn send(&self, session_id: &str, command: &GatewayCommand) -> GatewayResult<()> {
        let payload = self.build_payload(session_id, command);
        let url = format!("{}/interactions", self.api_base);

        retry_with_backoff(&self.retry, "interaction", GatewayError::is_transient, || {
            self.post_once(&url, &payload)
        })
        .await?;

        debug!("📤 GATEWAY: Interaction accepted");
        Ok(())
    }

    async fn post_once(&self, url: &str, payload: &Value) -> GatewayResult<()> {
        let response = self.http.post(url).json(payload).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(GatewayError::Http {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl MessageHistory for InteractionClient {
    async fn recent_messages(&self, limit: u32) -> GatewayResult<Vec<PlatformMessage>> {
        let url = format!(
            "{}/channels/{}/messages?limit={}",
            self.api_base,
            self.channel_id,
            limit.clamp(1, 100)
        );
        let response = self.http.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Http {
                status: status.as_u16(),
                body,
            });
        }
        response
            .json::<Vec<PlatformMessage>>()
            .await
            .map_err(|e| GatewayError::Protocol {
                message: format!("unexpected message history payload: {e}"),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> InteractionClient {
        let gateway = GatewayConfig {
            user_token: "token".into(),
            guild_id: "G1".into(),
            channel_id: "C1".into(),
            ..GatewayConfig::default()
        };
        InteractionClient::new(&gateway, &SendConfig::default()).unwrap()
    }

    #[test]
    fn test_imagine_payload() {
        let payload = client().build_payload(
            "session",
            &GatewayCommand::Imagine {
                nonce: "J1".into(),
                prompt: "a red fox".into(),
            },
        );
        assert_eq!(payload["type"], 2);
        assert_eq!(payload["nonce"], "J1");
        assert_eq!(payload["session_id"], "session");
        assert_eq!(payload["channel_id"], "C1");
        assert_eq!(payload["data"]["name"], "imagine");
        assert_eq!(payload["data"]["options"][0]["value"], "a red fox");
        assert_eq!(payload["application_id"], "936929561302675456");
    }

    #[test]
    fn test_action_payload() {
        let payload = client().build_payload(
            "session",
            &GatewayCommand::Action {
                nonce: "J2".into(),
                message_id: "M1".into(),
                custom_id: "MJ::JOB::upsample::1::abc".into(),
            },
        );
        assert_eq!(payload["type"], 3);
        assert_eq!(payload["message_id"], "M1");
        assert_eq!(payload["data"]["component_type"], 2);
        assert_eq!(payload["data"]["custom_id"], "MJ::JOB::upsample::1::abc");
        assert_eq!(payload["nonce"], "J2");
    }

    #[test]
    fn test_invalid_token_is_configuration_error() {
        let gateway = GatewayConfig {
            user_token: "bad\ntoken".into(),
            ..GatewayConfig::default()
        };
        assert!(matches!(
            InteractionClient::new(&gateway, &SendConfig::default()),
            Err(GatewayError::Configuration { .. })
        ));
    }
}
