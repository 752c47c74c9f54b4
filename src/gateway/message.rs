//! Platform chat messages as delivered by `MESSAGE_CREATE` / `MESSAGE_UPDATE`, plus
//! the text heuristics the correlator relies on.
//!
//! Update payloads are partial, so every field except the id is optional.

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::sync::OnceLock;

use crate::constants::interaction;
use crate::models::ActionButton;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlatformMessage {
    pub id: String,
    #[serde(default)]
    pub channel_id: Option<String>,
    #[serde(default)]
    pub author: Option<MessageAuthor>,
    #[serde(default)]
    pub content: String,
    /// Echo of the idempotency token of the command that produced this message
    #[serde(default, deserialize_with = "deserialize_nonce")]
    pub nonce: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub components: Vec<Component>,
    #[serde(default)]
    pub message_reference: Option<MessageReference>,
    #[serde(default)]
    pub referenced_message: Option<Box<PlatformMessage>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageAuthor {
    pub id: String,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub url: String,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub proxy_url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageReference {
    #[serde(default)]
    pub message_id: Option<String>,
}

/// Action rows nest buttons one level down
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Component {
    #[serde(rename = "type")]
    pub kind: u8,
    #[serde(default)]
    pub custom_id: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub emoji: Option<ComponentEmoji>,
    #[serde(default)]
    pub style: Option<u8>,
    #[serde(default)]
    pub components: Vec<Component>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentEmoji {
    #[serde(default)]
    pub name: Option<String>,
}

/// Nonces arrive as strings or integers depending on the client that sent the command
fn deserialize_nonce<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) if !s.is_empty() => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

fn cached_regex(cell: &'static OnceLock<Option<Regex>>, pattern: &str) -> Option<&'static Regex> {
    cell.get_or_init(|| Regex::new(pattern).ok()).as_ref()
}

fn progress_regex() -> Option<&'static Regex> {
    static CELL: OnceLock<Option<Regex>> = OnceLock::new();
    cached_regex(&CELL, r"\((\d+)%\)")
}

fn prompt_with_params_regex() -> Option<&'static Regex> {
    static CELL: OnceLock<Option<Regex>> = OnceLock::new();
    cached_regex(&CELL, r"\*\*(.+?)\s*--")
}

fn bold_prompt_regex() -> Option<&'static Regex> {
    static CELL: OnceLock<Option<Regex>> = OnceLock::new();
    cached_regex(&CELL, r"\*\*(.+?)\*\*")
}

fn hash_regex() -> Option<&'static Regex> {
    static CELL: OnceLock<Option<Regex>> = OnceLock::new();
    cached_regex(&CELL, r"([a-f0-9]{32})")
}

fn first_capture(regex: Option<&Regex>, text: &str) -> Option<String> {
    regex?
        .captures(text)?
        .get(1)
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
}

impl PlatformMessage {
    pub fn author_id(&self) -> Option<&str> {
        self.author.as_ref().map(|author| author.id.as_str())
    }

    /// The message this one replies to, from either the reference or the embedded copy
    pub fn referenced_message_id(&self) -> Option<&str> {
        self.message_reference
            .as_ref()
            .and_then(|reference| reference.message_id.as_deref())
            .or_else(|| self.referenced_message.as_ref().map(|m| m.id.as_str()))
    }

    /// Own nonce, else the nonce of the message being replied to
    pub fn effective_nonce(&self) -> Option<&str> {
        self.nonce
            .as_deref()
            .or_else(|| self.referenced_message.as_ref()?.nonce.as_deref())
    }

    pub fn first_attachment_url(&self) -> Option<&str> {
        self.attachments.first().map(|a| a.url.as_str())
    }

    /// Buttons exposed by the message's action rows
    pub fn buttons(&self) -> Vec<ActionButton> {
        self.components
            .iter()
            .filter(|row| row.kind == interaction::ACTION_ROW)
            .flat_map(|row| row.components.iter())
            .filter(|component| component.kind == interaction::BUTTON)
            .filter_map(|button| {
                let custom_id = button.custom_id.clone().filter(|id| !id.is_empty())?;
                Some(ActionButton {
                    custom_id,
                    label: button.label.clone(),
                    emoji: button.emoji.as_ref().and_then(|e| e.name.clone()),
                    kind: button.kind,
                    style: button.style,
                })
            })
            .collect()
    }

    /// A finished render carries both the image and follow-up buttons
    pub fn is_final_result(&self) -> bool {
        !self.attachments.is_empty() && !self.buttons().is_empty()
    }

    /// Percentage hint such as `"45%"` from text like `"(45%) (fast)"`
    pub fn progress(&self) -> Option<String> {
        first_capture(progress_regex(), &self.content).map(|pct| format!("{pct}%"))
    }

    /// The prompt the bot echoes in bold, without trailing parameters
    pub fn prompt_fragment(&self) -> Option<String> {
        first_capture(prompt_with_params_regex(), &self.content)
            .or_else(|| first_capture(bold_prompt_regex(), &self.content))
    }

    /// 32-hex-digit render hash embedded in the attachment file name
    pub fn message_hash(&self) -> Option<String> {
        self.attachments
            .iter()
            .find_map(|a| first_capture(hash_regex(), &a.url))
    }
}

/// Loose prompt equivalence: either side contains the other after normalization
pub fn prompts_match(stored: &str, echoed: &str) -> bool {
    let stored = normalize_prompt(stored);
    let echoed = normalize_prompt(echoed);
    if stored.is_empty() || echoed.is_empty() {
        return false;
    }
    stored.contains(&echoed) || echoed.contains(&stored)
}

fn normalize_prompt(prompt: &str) -> String {
    prompt
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn final_message() -> PlatformMessage {
        serde_json::from_value(json!({
            "id": "M1",
            "channel_id": "C1",
            "author": {"id": "936929561302675456", "username": "Midjourney Bot"},
            "content": "**a red fox --v 6** - <@123> (fast)",
            "attachments": [{
                "url": "https://cdn.example/attachments/1/2/user_a_red_fox_0123456789abcdef0123456789abcdef.png",
                "filename": "fox.png"
            }],
            "components": [{
                "type": 1,
                "components": [
                    {"type": 2, "custom_id": "MJ::JOB::upsample::1::abc", "label": "U1", "style": 2},
                    {"type": 2, "custom_id": "MJ::JOB::reroll::0::abc::SOLO", "emoji": {"name": "🔄"}, "style": 2},
                    {"type": 2, "label": "link without id", "style": 5}
                ]
            }]
        }))
        .unwrap()
    }

    #[test]
    fn test_buttons_and_result() {
        let message = final_message();
        let buttons = message.buttons();
        assert_eq!(buttons.len(), 2);
        assert_eq!(buttons[0].label.as_deref(), Some("U1"));
        assert_eq!(buttons[1].emoji.as_deref(), Some("🔄"));
        assert!(message.is_final_result());
        assert_eq!(
            message.message_hash().as_deref(),
            Some("0123456789abcdef0123456789abcdef")
        );
    }

    #[test]
    fn test_prompt_and_progress_extraction() {
        let message = final_message();
        assert_eq!(message.prompt_fragment().as_deref(), Some("a red fox"));

        let progress = PlatformMessage {
            id: "M1".into(),
            content: "**a red fox** - <@123> (45%) (fast)".into(),
            ..Default::default()
        };
        assert_eq!(progress.progress().as_deref(), Some("45%"));
        assert_eq!(progress.prompt_fragment().as_deref(), Some("a red fox"));
        assert!(!progress.is_final_result());
    }

    #[test]
    fn test_numeric_nonce_and_reference() {
        let message: PlatformMessage = serde_json::from_value(json!({
            "id": "M2",
            "nonce": 1234567,
            "message_reference": {"message_id": "M1"},
        }))
        .unwrap();
        assert_eq!(message.nonce.as_deref(), Some("1234567"));
        assert_eq!(message.referenced_message_id(), Some("M1"));

        let reply: PlatformMessage = serde_json::from_value(json!({
            "id": "M3",
            "referenced_message": {"id": "M1", "nonce": "J1"},
        }))
        .unwrap();
        assert_eq!(reply.effective_nonce(), Some("J1"));
        assert_eq!(reply.referenced_message_id(), Some("M1"));
    }

    #[test]
    fn test_prompts_match() {
        assert!(prompts_match("A red  fox", "a red fox"));
        assert!(prompts_match("a red fox in the snow", "a red fox"));
        assert!(!prompts_match("a red fox", "a blue whale"));
        assert!(!prompts_match("", "a red fox"));
    }
}
