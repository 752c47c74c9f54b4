//! Builders for bot messages as the correlator sees them.

use botrelay_core::gateway::message::{Attachment, Component, MessageAuthor, MessageReference};
use botrelay_core::gateway::PlatformMessage;

pub const BOT_ID: &str = "bot-1";
pub const CHANNEL_ID: &str = "chan-1";
pub const UPSCALE_TOKEN: &str = "MJ::JOB::upsample::1::abc";

pub fn bot_message(id: &str, content: &str) -> PlatformMessage {
    PlatformMessage {
        id: id.into(),
        channel_id: Some(CHANNEL_ID.into()),
        author: Some(MessageAuthor {
            id: BOT_ID.into(),
            username: Some("Bot".into()),
        }),
        content: content.into(),
        ..Default::default()
    }
}

/// First reply to a command, echoing the job id as nonce
pub fn acknowledged(id: &str, nonce: &str, prompt: &str) -> PlatformMessage {
    let mut message = bot_message(id, &format!("**{prompt}** - <@1> (Waiting to start)"));
    message.nonce = Some(nonce.into());
    message
}

pub fn progress(id: &str, prompt: &str, percent: u8) -> PlatformMessage {
    bot_message(id, &format!("**{prompt}** - <@1> ({percent}%) (fast)"))
}

/// Finished render with one image and an upscale button
pub fn finished(id: &str, prompt: &str, url: &str) -> PlatformMessage {
    let mut message = bot_message(id, &format!("**{prompt}** - <@1> (fast)"));
    message.attachments = vec![Attachment {
        url: url.into(),
        ..Default::default()
    }];
    message.components = vec![Component {
        kind: 1,
        components: vec![Component {
            kind: 2,
            custom_id: Some(UPSCALE_TOKEN.into()),
            label: Some("U1".into()),
            ..Default::default()
        }],
        ..Default::default()
    }];
    message
}

pub fn replying_to(mut message: PlatformMessage, referenced_id: &str) -> PlatformMessage {
    message.message_reference = Some(MessageReference {
        message_id: Some(referenced_id.into()),
    });
    message
}
