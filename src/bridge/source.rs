//! Adapts a connected `Session`'s `SlackWebApi` into the narrower
//! `SlackInfoSource`/`EmojiListFetcher` seams the resolver and emoji
//! manager depend on, so neither has to know about RTM or auth at all.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};

use crate::emoji::{EmojiListFetcher, SlackEmojiEntry};
use crate::resolver::{RawConversationInfo, SlackInfoSource, SlackUserInfo};
use crate::session::SlackWebApi;

pub struct SlackInfoSourceAdapter {
    web_api: Arc<dyn SlackWebApi>,
}

impl SlackInfoSourceAdapter {
    pub fn new(web_api: Arc<dyn SlackWebApi>) -> Self {
        Self { web_api }
    }
}

#[async_trait]
impl SlackInfoSource for SlackInfoSourceAdapter {
    async fn conversations_info(&self, channel_id: &str) -> Result<RawConversationInfo> {
        let resp = self
            .web_api
            .call("conversations.info", json!({ "channel": channel_id }))
            .await?;
        let channel = resp.get("channel").cloned().unwrap_or(Value::Null);

        Ok(RawConversationInfo {
            channel_id: channel_id.to_string(),
            name: channel.get("name").and_then(Value::as_str).map(String::from),
            topic: channel
                .get("topic")
                .and_then(|t| t.get("value"))
                .and_then(Value::as_str)
                .map(String::from),
            purpose: channel
                .get("purpose")
                .and_then(|p| p.get("value"))
                .and_then(Value::as_str)
                .map(String::from),
            is_member: channel.get("is_member").and_then(Value::as_bool).unwrap_or(false),
            is_im: channel.get("is_im").and_then(Value::as_bool).unwrap_or(false),
            is_mpim: channel.get("is_mpim").and_then(Value::as_bool).unwrap_or(false),
            im_user: channel.get("user").and_then(Value::as_str).map(String::from),
            locale: channel.get("locale").and_then(Value::as_str).map(String::from),
        })
    }

    async fn conversations_members_page(
        &self,
        channel_id: &str,
        cursor: Option<&str>,
        limit: u32,
    ) -> Result<(Vec<String>, Option<String>)> {
        let mut body = json!({ "channel": channel_id, "limit": limit });
        if let Some(cursor) = cursor {
            body["cursor"] = json!(cursor);
        }

        let resp = self.web_api.call("conversations.members", body).await?;
        let members = resp
            .get("members")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter_map(|v| v.as_str().map(String::from))
            .collect();
        let next_cursor = resp
            .get("response_metadata")
            .and_then(|m| m.get("next_cursor"))
            .and_then(Value::as_str)
            .filter(|c| !c.is_empty())
            .map(String::from);

        Ok((members, next_cursor))
    }

    async fn users_info(&self, user_ids: &[String]) -> Result<Vec<SlackUserInfo>> {
        let mut out = Vec::with_capacity(user_ids.len());
        for user_id in user_ids {
            let resp = self.web_api.call("users.info", json!({ "user": user_id })).await?;
            let user = resp.get("user").cloned().unwrap_or(Value::Null);
            let profile = user.get("profile").cloned().unwrap_or(Value::Null);

            out.push(SlackUserInfo {
                user_id: user_id.clone(),
                is_bot: user.get("is_bot").and_then(Value::as_bool).unwrap_or(false),
                display_name: profile
                    .get("display_name")
                    .and_then(Value::as_str)
                    .filter(|s| !s.is_empty())
                    .or_else(|| profile.get("real_name").and_then(Value::as_str))
                    .map(String::from),
                image_original: profile.get("image_original").and_then(Value::as_str).map(String::from),
                image_512: profile.get("image_512").and_then(Value::as_str).map(String::from),
                avatar_hash: profile.get("avatar_hash").and_then(Value::as_str).map(String::from),
                updated_at: profile.get("updated").and_then(Value::as_i64),
            });
        }
        Ok(out)
    }

    async fn bots_info(&self, bot_id: &str) -> Result<SlackUserInfo> {
        let resp = self.web_api.call("bots.info", json!({ "bot": bot_id })).await?;
        let bot = resp.get("bot").cloned().unwrap_or(Value::Null);
        let icons = bot.get("icons").cloned().unwrap_or(Value::Null);

        Ok(SlackUserInfo {
            user_id: bot_id.to_string(),
            is_bot: true,
            display_name: bot.get("name").and_then(Value::as_str).map(String::from),
            image_original: icons.get("image_original").and_then(Value::as_str).map(String::from),
            image_512: icons.get("image_512").and_then(Value::as_str).map(String::from),
            avatar_hash: None,
            updated_at: bot.get("updated").and_then(Value::as_i64),
        })
    }
}

#[async_trait]
impl EmojiListFetcher for SlackInfoSourceAdapter {
    async fn fetch_emoji_list(&self, _team_id: &str) -> Result<Vec<SlackEmojiEntry>> {
        let resp = self.web_api.call("emoji.list", json!({})).await?;
        let emoji_obj = resp.get("emoji").and_then(Value::as_object).cloned().unwrap_or_default();

        Ok(emoji_obj
            .into_iter()
            .map(|(id, value)| SlackEmojiEntry {
                id,
                value: value.as_str().unwrap_or_default().to_string(),
            })
            .collect())
    }
}
