//! Slack -> Matrix message conversion: mrkdwn/block text, file parts,
//! caption merging, edits, and thread relation resolution.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Value, json};
use tracing::warn;

use crate::db::DatabaseManager;
use crate::emoji::{EmojiManager, EmojiValue};
use crate::ids;
use crate::media::MediaHandler;

use super::blocks;
use super::mrkdwn::{self, MentionContext};

const LOGIN_PAGE_RETRY_DELAY_MS: u64 = 5_000;

/// One outgoing Matrix event's worth of content, keyed by a part id the
/// Message store uses for edits/deletes/caption-merge bookkeeping.
#[derive(Debug, Clone)]
pub struct ConvertedPart {
    pub part_id: String,
    pub event_type: String,
    pub content: Value,
}

#[derive(Debug, Default)]
pub struct ConversionResult {
    pub parts: Vec<ConvertedPart>,
    /// Populated only when converting an edit (`message_changed`).
    pub modified_parts: Vec<String>,
    pub deleted_parts: Vec<String>,
}

pub struct SlackToMatrixConverter {
    db: Arc<DatabaseManager>,
    emoji: Arc<EmojiManager>,
    media: Arc<MediaHandler>,
    appservice_token: String,
    max_file_size: usize,
    matrix_domain: String,
}

struct ResolvedContext {
    user_labels: HashMap<String, String>,
    user_mxids: HashMap<String, String>,
    channel_labels: HashMap<String, String>,
    emoji: HashMap<String, EmojiValue>,
}

impl MentionContext for ResolvedContext {
    fn user_label(&self, slack_user_id: &str) -> Option<String> {
        self.user_labels.get(slack_user_id).cloned()
    }
    fn user_mxid(&self, slack_user_id: &str) -> Option<String> {
        self.user_mxids.get(slack_user_id).cloned()
    }
    fn channel_label(&self, slack_channel_id: &str) -> Option<String> {
        self.channel_labels.get(slack_channel_id).cloned()
    }
    fn emoji(&self, shortcode: &str) -> Option<EmojiValue> {
        self.emoji.get(shortcode).cloned()
    }
}

static USER_TOKEN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<@([UW][A-Z0-9]+)").unwrap());
static CHAN_TOKEN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<#(C[A-Z0-9]+)").unwrap());
static SHORTCODE_TOKEN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r":([a-zA-Z0-9_+\-]+):").unwrap());

impl SlackToMatrixConverter {
    pub fn new(
        db: Arc<DatabaseManager>,
        emoji: Arc<EmojiManager>,
        media: Arc<MediaHandler>,
        appservice_token: String,
        max_file_size: usize,
        matrix_domain: String,
    ) -> Self {
        Self {
            db,
            emoji,
            media,
            appservice_token,
            max_file_size,
            matrix_domain,
        }
    }

    /// Converts one inbound Slack message (subtype "" or `message_changed`)
    /// into the parts the Portal Coordinator sends to Matrix.
    pub async fn convert(
        &self,
        team_id: &str,
        channel_id: &str,
        message: &Value,
        is_edit: bool,
    ) -> Result<ConversionResult> {
        let text_sources = gather_text_sources(message);
        let blocks_value = message.get("blocks").and_then(Value::as_array).cloned();
        let ctx = self.resolve_context(team_id, &text_sources, blocks_value.as_deref()).await?;

        let (mut plain, mut html) = if let Some(blocks_arr) = &blocks_value
            && !blocks_arr.is_empty()
        {
            let rendered = blocks::render(blocks_arr, &ctx);
            (rendered.plain, rendered.html)
        } else {
            let text = message.get("text").and_then(Value::as_str).unwrap_or("");
            let rendered = mrkdwn::render(text, &ctx);
            (rendered.plain, rendered.html)
        };

        let subtype = message.get("subtype").and_then(Value::as_str).unwrap_or("");
        let mut msgtype = "m.text".to_string();
        if subtype == "me_message" {
            msgtype = "m.emote".to_string();
        }
        if subtype == "huddle_thread"
            && let Some(url) = message.get("huddle_url").and_then(Value::as_str)
        {
            plain.push_str(&format!("\n{}", url));
            html.push_str(&format!(r#"<br/><a href="{}">{}</a>"#, url, url));
        }

        if let Some(attachments) = message.get("attachments").and_then(Value::as_array) {
            for attachment in attachments {
                let fallback = attachment
                    .get("text")
                    .and_then(Value::as_str)
                    .or_else(|| attachment.get("fallback").and_then(Value::as_str))
                    .unwrap_or("");
                if !fallback.is_empty() {
                    let rendered = mrkdwn::render(fallback, &ctx);
                    plain.push_str(&format!("\n{}", rendered.plain));
                    html.push_str(&format!("<br/>{}", rendered.html));
                }
            }
        }

        let mut parts = Vec::new();
        let has_text = !plain.trim().is_empty();
        if has_text {
            parts.push(ConvertedPart {
                part_id: String::new(),
                event_type: "m.room.message".to_string(),
                content: json!({
                    "msgtype": msgtype,
                    "body": plain,
                    "format": "org.matrix.custom.html",
                    "formatted_body": html,
                }),
            });
        }

        if let Some(files) = message.get("files").and_then(Value::as_array) {
            for (index, file) in files.iter().enumerate() {
                match self.convert_file(file, index).await {
                    Ok(Some(part)) => parts.push(part),
                    Ok(None) => {}
                    Err(err) => warn!("failed to convert Slack file: {}", err),
                }
            }
        }

        merge_caption(&mut parts);

        let thread_ts = message.get("thread_ts").and_then(Value::as_str);
        if let Some(thread_ts) = thread_ts {
            self.apply_thread_relation(team_id, channel_id, thread_ts, &mut parts).await?;
        }

        let mut result = ConversionResult {
            parts,
            ..Default::default()
        };

        if is_edit {
            result.modified_parts = result
                .parts
                .iter()
                .map(|p| p.part_id.clone())
                .collect();
            for file in message.get("files").and_then(Value::as_array).into_iter().flatten() {
                if file.get("mode").and_then(Value::as_str) == Some("tombstone")
                    && let Some(file_id) = file.get("id").and_then(Value::as_str)
                {
                    result.deleted_parts.push(format!("file-0-{}", file_id));
                }
            }
        }

        Ok(result)
    }

    async fn resolve_context(
        &self,
        team_id: &str,
        text_sources: &[String],
        blocks_arr: Option<&[Value]>,
    ) -> Result<ResolvedContext> {
        let mut user_ids = Vec::new();
        let mut channel_ids = Vec::new();
        let mut shortcodes = Vec::new();

        for text in text_sources {
            user_ids.extend(USER_TOKEN_RE.captures_iter(text).map(|c| c[1].to_string()));
            channel_ids.extend(CHAN_TOKEN_RE.captures_iter(text).map(|c| c[1].to_string()));
            shortcodes.extend(SHORTCODE_TOKEN_RE.captures_iter(text).map(|c| c[1].to_string()));
        }
        if let Some(blocks_arr) = blocks_arr {
            collect_rich_text_refs(blocks_arr, &mut user_ids, &mut channel_ids, &mut shortcodes);
        }

        let mut user_labels = HashMap::new();
        let mut user_mxids = HashMap::new();
        for user_id in user_ids.into_iter().collect::<std::collections::HashSet<_>>() {
            let ghost_id = ids::make_user_id(team_id, &user_id);
            if let Ok(Some(ghost)) = self.db.ghost_store().get_ghost(&ghost_id).await {
                if let Some(name) = ghost.name {
                    user_labels.insert(user_id.clone(), name);
                }
                user_mxids.insert(
                    user_id.clone(),
                    crate::matrix::make_ghost_user_id(&ghost_id, &self.matrix_domain),
                );
            }
        }

        let mut channel_labels = HashMap::new();
        for channel_id in channel_ids.into_iter().collect::<std::collections::HashSet<_>>() {
            let portal_id = ids::make_portal_id(team_id, &channel_id);
            if let Ok(Some(portal)) = self.db.portal_store().get_portal(&portal_id).await
                && let Some(name) = portal.name
            {
                channel_labels.insert(channel_id, name);
            }
        }

        let mut emoji = HashMap::new();
        for shortcode in shortcodes.into_iter().collect::<std::collections::HashSet<_>>() {
            if let Ok(Some(value)) = self.emoji.try_get_emoji(team_id, &shortcode, true, true).await {
                emoji.insert(shortcode, value);
            }
        }

        Ok(ResolvedContext {
            user_labels,
            user_mxids,
            channel_labels,
            emoji,
        })
    }

    async fn convert_file(&self, file: &Value, index: usize) -> Result<Option<ConvertedPart>> {
        let file_id = file.get("id").and_then(Value::as_str).unwrap_or("");
        if file.get("mode").and_then(Value::as_str) == Some("tombstone") {
            return Ok(None);
        }

        if let Some(size) = file.get("size").and_then(Value::as_u64)
            && size as usize > self.max_file_size
        {
            return Ok(Some(ConvertedPart {
                part_id: format!("file-{}-{}", index, file_id),
                event_type: "m.room.message".to_string(),
                content: json!({
                    "msgtype": "m.notice",
                    "body": format!("File {} exceeds the configured size limit and was not bridged.", file.get("name").and_then(Value::as_str).unwrap_or(file_id)),
                }),
            }));
        }

        let url = file
            .get("url_private_download")
            .and_then(Value::as_str)
            .or_else(|| file.get("url_private").and_then(Value::as_str))
            .or_else(|| file.get("permalink_public").and_then(Value::as_str));
        let Some(url) = url else {
            return Ok(None);
        };

        let mut media = self.media.download_from_url(url).await?;
        if looks_like_login_page(&media.data) {
            tokio::time::sleep(std::time::Duration::from_millis(LOGIN_PAGE_RETRY_DELAY_MS)).await;
            let retry_url = file.get("url_private").and_then(Value::as_str).unwrap_or(url);
            media = self.media.download_from_url(retry_url).await?;
        }

        let mxc = self.media.upload_to_matrix(&media, &self.appservice_token).await?;
        let msgtype = matrix_msgtype_for(&media.content_type);

        let mut info = json!({
            "mimetype": media.content_type,
            "size": media.size,
        });
        if msgtype == "m.image" || msgtype == "m.video" {
            if let Some(w) = file.get("original_w").and_then(Value::as_u64) {
                info["w"] = json!(w);
            }
            if let Some(h) = file.get("original_h").and_then(Value::as_u64) {
                info["h"] = json!(h);
            }
        }

        Ok(Some(ConvertedPart {
            part_id: format!("file-{}-{}", index, file_id),
            event_type: "m.room.message".to_string(),
            content: json!({
                "msgtype": msgtype,
                "body": media.filename,
                "filename": media.filename,
                "url": mxc,
                "info": info,
            }),
        }))
    }

    async fn apply_thread_relation(
        &self,
        team_id: &str,
        channel_id: &str,
        thread_ts: &str,
        parts: &mut [ConvertedPart],
    ) -> Result<()> {
        let portal_id = ids::make_portal_id(team_id, channel_id);
        let root = self
            .db
            .message_store()
            .get_message_parts(&portal_id, thread_ts)
            .await?
            .into_iter()
            .find(|m| m.part_id.is_empty());
        let latest = self.db.message_store().latest_thread_message(&portal_id, thread_ts).await?;

        let Some(root) = root else {
            return Ok(());
        };

        for part in parts.iter_mut() {
            let relates_to = match &latest {
                Some(latest) => json!({
                    "rel_type": "m.thread",
                    "event_id": root.matrix_event_id,
                    "is_falling_back": true,
                    "m.in_reply_to": { "event_id": latest.matrix_event_id },
                }),
                None => json!({
                    "m.in_reply_to": { "event_id": root.matrix_event_id },
                }),
            };
            if let Value::Object(ref mut map) = part.content {
                map.insert("m.relates_to".to_string(), relates_to);
            }
        }
        Ok(())
    }
}

fn gather_text_sources(message: &Value) -> Vec<String> {
    let mut out = Vec::new();
    if let Some(text) = message.get("text").and_then(Value::as_str) {
        out.push(text.to_string());
    }
    if let Some(attachments) = message.get("attachments").and_then(Value::as_array) {
        for attachment in attachments {
            if let Some(text) = attachment.get("text").and_then(Value::as_str) {
                out.push(text.to_string());
            }
        }
    }
    out
}

fn collect_rich_text_refs(
    blocks: &[Value],
    user_ids: &mut Vec<String>,
    channel_ids: &mut Vec<String>,
    shortcodes: &mut Vec<String>,
) {
    for block in blocks {
        walk_rich_text(block, user_ids, channel_ids, shortcodes);
    }
}

fn walk_rich_text(value: &Value, user_ids: &mut Vec<String>, channel_ids: &mut Vec<String>, shortcodes: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            match map.get("type").and_then(Value::as_str) {
                Some("user") => {
                    if let Some(id) = map.get("user_id").and_then(Value::as_str) {
                        user_ids.push(id.to_string());
                    }
                }
                Some("channel") => {
                    if let Some(id) = map.get("channel_id").and_then(Value::as_str) {
                        channel_ids.push(id.to_string());
                    }
                }
                Some("emoji") => {
                    if let Some(name) = map.get("name").and_then(Value::as_str) {
                        shortcodes.push(name.to_string());
                    }
                }
                _ => {}
            }
            for v in map.values() {
                walk_rich_text(v, user_ids, channel_ids, shortcodes);
            }
        }
        Value::Array(arr) => {
            for v in arr {
                walk_rich_text(v, user_ids, channel_ids, shortcodes);
            }
        }
        _ => {}
    }
}

/// If the converted message has exactly one text part and one media part,
/// the text becomes the media's caption per the Matrix caption convention.
fn merge_caption(parts: &mut Vec<ConvertedPart>) {
    if parts.len() != 2 {
        return;
    }
    let text_idx = parts.iter().position(|p| p.part_id.is_empty());
    let Some(text_idx) = text_idx else { return };
    let media_idx = 1 - text_idx;

    let is_media = matches!(
        parts[media_idx].content.get("msgtype").and_then(Value::as_str),
        Some("m.image") | Some("m.audio") | Some("m.video") | Some("m.file")
    );
    if !is_media {
        return;
    }

    let caption = parts[text_idx]
        .content
        .get("body")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let original_filename = parts[media_idx]
        .content
        .get("body")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();

    if let Value::Object(ref mut map) = parts[media_idx].content {
        map.insert("body".to_string(), json!(caption));
        map.insert("filename".to_string(), json!(original_filename));
    }

    let merged = parts[media_idx].clone();
    parts.clear();
    parts.push(merged);
}

fn looks_like_login_page(data: &[u8]) -> bool {
    data.starts_with(b"<!DOCTYPE html>") || data.starts_with(b"<!doctype html>")
}

fn matrix_msgtype_for(content_type: &str) -> &'static str {
    if content_type.starts_with("image/") {
        "m.image"
    } else if content_type.starts_with("video/") {
        "m.video"
    } else if content_type.starts_with("audio/") {
        "m.audio"
    } else {
        "m.file"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn msgtype_is_chosen_by_mimetype_prefix() {
        assert_eq!(matrix_msgtype_for("image/png"), "m.image");
        assert_eq!(matrix_msgtype_for("video/mp4"), "m.video");
        assert_eq!(matrix_msgtype_for("audio/mpeg"), "m.audio");
        assert_eq!(matrix_msgtype_for("application/zip"), "m.file");
    }

    #[test]
    fn login_page_detection() {
        assert!(looks_like_login_page(b"<!DOCTYPE html><html></html>"));
        assert!(!looks_like_login_page(b"\x89PNG\r\n"));
    }

    #[test]
    fn caption_merge_combines_text_and_media_part() {
        let mut parts = vec![
            ConvertedPart {
                part_id: String::new(),
                event_type: "m.room.message".to_string(),
                content: json!({ "msgtype": "m.text", "body": "a caption" }),
            },
            ConvertedPart {
                part_id: "file-0-F1".to_string(),
                event_type: "m.room.message".to_string(),
                content: json!({ "msgtype": "m.image", "body": "original.png", "url": "mxc://x/y" }),
            },
        ];
        merge_caption(&mut parts);
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].part_id, "file-0-F1");
        assert_eq!(parts[0].content["body"], json!("a caption"));
        assert_eq!(parts[0].content["filename"], json!("original.png"));
    }

    #[test]
    fn caption_merge_is_noop_for_two_media_parts() {
        let mut parts = vec![
            ConvertedPart {
                part_id: "file-0-F1".to_string(),
                event_type: "m.room.message".to_string(),
                content: json!({ "msgtype": "m.image" }),
            },
            ConvertedPart {
                part_id: "file-1-F2".to_string(),
                event_type: "m.room.message".to_string(),
                content: json!({ "msgtype": "m.image" }),
            },
        ];
        merge_caption(&mut parts);
        assert_eq!(parts.len(), 2);
    }
}
