//! Matrix -> Slack message conversion: HTML to mrkdwn, mention pill
//! resolution, and media upload parameters.

use std::sync::Arc;

use anyhow::{Result, anyhow};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::db::{DatabaseManager, Message};
use crate::media::{MediaHandler, MediaInfo};

/// What the converter hands back to the caller, which then picks the
/// right Slack Web API call (`chat.postMessage`/`chat.update` vs
/// `files.upload`).
pub enum SlackSendPlan {
    Text(SlackTextOptions),
    File(SlackFileUpload),
}

#[derive(Debug, Clone, Default)]
pub struct SlackTextOptions {
    pub text: String,
    pub markdown_disabled: bool,
    pub me_message: bool,
    pub thread_ts: Option<String>,
    pub update_ts: Option<String>,
}

pub struct SlackFileUpload {
    pub media: MediaInfo,
    pub initial_comment: Option<String>,
    pub thread_ts: Option<String>,
}

static PILL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"<a[^>]+href="(?:https://matrix\.to/#/|matrix:[^"]*?/)(?P<target>[^"#?]+)"[^>]*>(?P<label>.*?)</a>"#).unwrap()
});
static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<(/?)(\w+)[^>]*>").unwrap());
static BR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)<br\s*/?>").unwrap());

pub struct MatrixToSlackConverter {
    db: Arc<DatabaseManager>,
    media: Arc<MediaHandler>,
    team_id: String,
}

impl MatrixToSlackConverter {
    pub fn new(db: Arc<DatabaseManager>, media: Arc<MediaHandler>, team_id: String) -> Self {
        Self { db, media, team_id }
    }

    /// `content` is a Matrix `m.room.message` event content. `thread_root`
    /// and `edit_target` are the Message rows the caller already resolved
    /// (or `None`).
    pub async fn convert(
        &self,
        content: &Value,
        thread_root: Option<&Message>,
        edit_target: Option<&Message>,
    ) -> Result<SlackSendPlan> {
        let msgtype = content.get("msgtype").and_then(Value::as_str).unwrap_or("m.text");

        if let Some(edit) = edit_target
            && matches!(msgtype, "m.image" | "m.audio" | "m.video" | "m.file")
        {
            let body = content.get("body").and_then(Value::as_str).unwrap_or("");
            let filename = content.get("filename").and_then(Value::as_str).unwrap_or(body);
            if body == filename {
                return Err(anyhow!(
                    "media edit for {} rejected: only caption changes are supported",
                    edit.matrix_event_id
                ));
            }
        }

        match msgtype {
            "m.image" | "m.audio" | "m.video" | "m.file" | "m.sticker" => {
                self.convert_media(content, thread_root).await
            }
            _ => self.convert_text(content, msgtype, thread_root, edit_target).await,
        }
    }

    async fn convert_text(
        &self,
        content: &Value,
        msgtype: &str,
        thread_root: Option<&Message>,
        edit_target: Option<&Message>,
    ) -> Result<SlackSendPlan> {
        let formatted = content.get("formatted_body").and_then(Value::as_str);
        let plain = content.get("body").and_then(Value::as_str).unwrap_or("");

        let (text, markdown_disabled) = match formatted {
            Some(html) => (self.html_to_mrkdwn(html).await?, false),
            None => (plain.to_string(), true),
        };

        Ok(SlackSendPlan::Text(SlackTextOptions {
            text,
            markdown_disabled,
            me_message: msgtype == "m.emote",
            thread_ts: thread_root.map(|m| m.slack_timestamp.clone()),
            update_ts: edit_target.map(|m| m.slack_timestamp.clone()),
        }))
    }

    async fn convert_media(&self, content: &Value, thread_root: Option<&Message>) -> Result<SlackSendPlan> {
        let url = content
            .get("url")
            .and_then(Value::as_str)
            .or_else(|| content.pointer("/file/url").and_then(Value::as_str))
            .ok_or_else(|| anyhow!("media event missing url/file.url"))?;

        let media = self.media.download_matrix_media(url).await?;

        let body = content.get("body").and_then(Value::as_str).unwrap_or("");
        let filename = content.get("filename").and_then(Value::as_str).unwrap_or(body);
        let initial_comment = if !body.is_empty() && body != filename {
            Some(body.to_string())
        } else {
            None
        };

        Ok(SlackSendPlan::File(SlackFileUpload {
            media,
            initial_comment,
            thread_ts: thread_root.map(|m| m.slack_timestamp.clone()),
        }))
    }

    /// Resolves mention pills, then strips the remaining HTML down to
    /// Slack mrkdwn markers.
    async fn html_to_mrkdwn(&self, html: &str) -> Result<String> {
        let mut pending: Vec<(String, String)> = Vec::new();
        for caps in PILL_RE.captures_iter(html) {
            let target = caps["target"].to_string();
            let label = caps["label"].to_string();
            let replacement = self.resolve_pill(&target, &label).await;
            pending.push((caps[0].to_string(), replacement));
        }
        let mut result = html.to_string();
        for (literal, replacement) in pending {
            result = result.replacen(&literal, &replacement, 1);
        }

        let result = BR_RE.replace_all(&result, "\n");
        let result = result
            .replace("<strong>", "*")
            .replace("</strong>", "*")
            .replace("<b>", "*")
            .replace("</b>", "*")
            .replace("<em>", "_")
            .replace("</em>", "_")
            .replace("<i>", "_")
            .replace("</i>", "_")
            .replace("<del>", "~")
            .replace("</del>", "~")
            .replace("<strike>", "~")
            .replace("</strike>", "~")
            .replace("<code>", "`")
            .replace("</code>", "`")
            .replace("<pre>", "```")
            .replace("</pre>", "```");

        let result = TAG_RE.replace_all(&result, "").into_owned();
        Ok(html_unescape(&result))
    }

    async fn resolve_pill(&self, target: &str, label: &str) -> String {
        let decoded = percent_decode(target);
        if let Some(mxid) = decoded.strip_prefix('@') {
            if let Some(ghost_id) = ghost_id_for_mxid(mxid)
                && let Ok(Some(ghost)) = self.db.ghost_store().get_ghost(&ghost_id).await
            {
                return format!("<@{}>", ghost.slack_user_id);
            }
            if let Ok(logins) = self.db.user_login_store().get_logins_for_matrix_user(mxid).await
                && let Some(login) = logins.into_iter().find(|l| l.team_id == self.team_id)
            {
                return format!("<@{}>", login.slack_user_id);
            }
            return label.to_string();
        }
        if decoded.starts_with('!')
            && let Ok(Some(portal)) = self.db.portal_store().get_portal_by_matrix_room(&decoded).await
        {
            return format!("<#{}>", portal.channel_id);
        }
        label.to_string()
    }
}

/// Recovers the (lowercased) `MakeUserID` ghost id from a ghost's MXID
/// localpart, if it looks like one of ours.
fn ghost_id_for_mxid(mxid: &str) -> Option<String> {
    let localpart = mxid.split(':').next()?;
    localpart.strip_prefix("_slack_").map(str::to_string)
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(byte) = u8::from_str_radix(&s[i + 1..i + 3], 16) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8(out).unwrap_or_else(|_| s.to_string())
}

fn html_unescape(s: &str) -> String {
    s.replace("&amp;", "&").replace("&lt;", "<").replace("&gt;", ">").replace("&quot;", "\"")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_basic_formatting_tags() {
        let html = "<strong>bold</strong> and <em>italic</em>";
        let result = TAG_RE
            .replace_all(
                &html
                    .replace("<strong>", "*")
                    .replace("</strong>", "*")
                    .replace("<em>", "_")
                    .replace("</em>", "_"),
                "",
            )
            .into_owned();
        assert_eq!(result, "*bold* and _italic_");
    }

    #[test]
    fn br_becomes_newline() {
        let result = BR_RE.replace_all("line one<br/>line two", "\n");
        assert_eq!(result, "line one\nline two");
    }

    #[test]
    fn unescapes_html_entities() {
        assert_eq!(html_unescape("a &amp; b &lt;tag&gt;"), "a & b <tag>");
    }
}
