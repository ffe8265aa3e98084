//! Chat & user info resolution: TTL-cached conversation metadata, paged
//! member listing, and ghost profile sync with a sync-suppression window.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, warn};

use crate::cache::AsyncTimedCache;
use crate::db::{DatabaseManager, Ghost, RoomType};
use crate::ids;
use crate::matrix::MatrixAppservice;

const CHAT_INFO_TTL: std::time::Duration = std::time::Duration::from_secs(3600);
const GHOST_SYNC_SUPPRESS_SECS: i64 = 4 * 3600;
const MEMBER_PAGE_LIMIT: u32 = 200;

/// What the Slack side reports about a conversation, before the resolver
/// turns it into a [`ChatInfo`].
#[derive(Debug, Clone)]
pub struct RawConversationInfo {
    pub channel_id: String,
    pub name: Option<String>,
    pub topic: Option<String>,
    pub purpose: Option<String>,
    pub is_member: bool,
    pub is_im: bool,
    pub is_mpim: bool,
    /// The other party's user id, DM conversations only.
    pub im_user: Option<String>,
    pub locale: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SlackUserInfo {
    pub user_id: String,
    pub is_bot: bool,
    pub display_name: Option<String>,
    pub image_original: Option<String>,
    pub image_512: Option<String>,
    pub avatar_hash: Option<String>,
    /// Slack's `profile.updated` epoch, used to skip redundant ghost writes.
    pub updated_at: Option<i64>,
}

/// The Web API surface the resolver needs. Implemented by the live Slack
/// session; kept abstract so the resolver's derivation logic is testable
/// without a network round trip.
#[async_trait]
pub trait SlackInfoSource: Send + Sync {
    async fn conversations_info(&self, channel_id: &str) -> Result<RawConversationInfo>;
    async fn conversations_members_page(
        &self,
        channel_id: &str,
        cursor: Option<&str>,
        limit: u32,
    ) -> Result<(Vec<String>, Option<String>)>;
    async fn users_info(&self, user_ids: &[String]) -> Result<Vec<SlackUserInfo>>;
    async fn bots_info(&self, bot_id: &str) -> Result<SlackUserInfo>;
}

#[derive(Debug, Clone)]
pub struct ChatInfo {
    pub channel_id: String,
    pub name: Option<String>,
    pub topic: String,
    pub avatar_url: Option<String>,
    pub members: Vec<String>,
    pub member_count: i64,
    pub room_type: RoomType,
    pub parent_portal_id: String,
}

pub struct Resolver {
    db: Arc<DatabaseManager>,
    matrix: Arc<MatrixAppservice>,
    chat_info_cache: AsyncTimedCache<String, ChatInfo>,
}

impl Resolver {
    pub fn new(db: Arc<DatabaseManager>, matrix: Arc<MatrixAppservice>) -> Self {
        Self {
            db,
            matrix,
            chat_info_cache: AsyncTimedCache::new(CHAT_INFO_TTL),
        }
    }

    /// `fetch_chat_info(channelID, isNew)`.
    pub async fn fetch_chat_info(
        &self,
        team_id: &str,
        channel_id: &str,
        is_new: bool,
        source: &dyn SlackInfoSource,
        self_user_id: &str,
    ) -> Result<ChatInfo> {
        let cache_key = format!("{team_id}-{channel_id}");
        if let Some(cached) = self.chat_info_cache.get(&cache_key).await {
            return Ok(cached);
        }

        let raw = source.conversations_info(channel_id).await?;

        if is_new && !raw.is_member {
            return Err(anyhow!("request cancelled"));
        }

        let room_type = if raw.is_im {
            RoomType::Dm
        } else if raw.is_mpim {
            RoomType::GroupDm
        } else {
            RoomType::Channel
        };

        let members = self
            .list_members(channel_id, raw.is_member, self_user_id, source)
            .await?;

        let (name, avatar_url) = match room_type {
            RoomType::Dm => {
                let other = raw
                    .im_user
                    .as_deref()
                    .or_else(|| members.iter().find(|m| m.as_str() != self_user_id).map(String::as_str));
                match other {
                    Some(other_id) => {
                        let ghost = self.sync_ghost(team_id, other_id, source, false).await?;
                        (ghost.name, ghost.avatar_mxc)
                    }
                    None => (raw.name.clone(), None),
                }
            }
            RoomType::GroupDm => {
                let mut names = Vec::new();
                for member in &members {
                    if member == self_user_id {
                        continue;
                    }
                    let ghost = self.sync_ghost(team_id, member, source, false).await?;
                    names.push(ghost.name.unwrap_or_else(|| member.clone()));
                }
                (Some(join_sorted_case_insensitive(names)), None)
            }
            RoomType::Channel | RoomType::Space => (raw.name.clone(), None),
        };

        let topic = match room_type {
            RoomType::Dm | RoomType::GroupDm | RoomType::Space => String::new(),
            RoomType::Channel => format_channel_topic(raw.topic.as_deref(), raw.purpose.as_deref()),
        };

        let info = ChatInfo {
            channel_id: channel_id.to_string(),
            name,
            topic,
            avatar_url,
            member_count: members.len() as i64,
            members,
            room_type,
            parent_portal_id: ids::make_portal_id(team_id, ""),
        };

        self.chat_info_cache.insert(cache_key, info.clone()).await;
        Ok(info)
    }

    /// Member listing protocol: page at `MEMBER_PAGE_LIMIT`, dedup by user
    /// id, stop on empty cursor or a short chunk; append self if Slack
    /// reports membership but self never appeared in a page.
    async fn list_members(
        &self,
        channel_id: &str,
        is_member: bool,
        self_user_id: &str,
        source: &dyn SlackInfoSource,
    ) -> Result<Vec<String>> {
        let mut seen: HashMap<String, ()> = HashMap::new();
        let mut cursor: Option<String> = None;

        loop {
            let (chunk, next_cursor) = source
                .conversations_members_page(channel_id, cursor.as_deref(), MEMBER_PAGE_LIMIT)
                .await?;
            let chunk_len = chunk.len();

            for user_id in chunk {
                seen.insert(user_id, ());
            }

            match next_cursor {
                Some(c) if !c.is_empty() && chunk_len as u32 >= MEMBER_PAGE_LIMIT => {
                    cursor = Some(c);
                }
                _ => break,
            }
        }

        if is_member && !seen.contains_key(self_user_id) {
            seen.insert(self_user_id.to_string(), ());
        }

        Ok(seen.into_keys().collect())
    }

    /// Syncs one ghost's profile, subject to the 4h suppression window
    /// unless `force` is set. Returns the (possibly unchanged) Ghost row.
    pub async fn sync_ghost(
        &self,
        team_id: &str,
        slack_user_id: &str,
        source: &dyn SlackInfoSource,
        force: bool,
    ) -> Result<Ghost> {
        let ghost_id = ids::make_user_id(team_id, slack_user_id);
        let existing = self.db.ghost_store().get_ghost(&ghost_id).await?;

        if !force
            && let Some(ghost) = &existing
            && let Some(last) = ghost.last_synced_at
            && (Utc::now() - last).num_seconds() < GHOST_SYNC_SUPPRESS_SECS
        {
            return Ok(ghost.clone());
        }

        let info = if is_bot_id(slack_user_id) {
            source.bots_info(slack_user_id).await?
        } else {
            source
                .users_info(std::slice::from_ref(&slack_user_id.to_string()))
                .await?
                .into_iter()
                .next()
                .ok_or_else(|| anyhow!("users.info returned no entry for {}", slack_user_id))?
        };

        self.apply_ghost_info(team_id, &ghost_id, slack_user_id, &info, existing)
            .await
    }

    /// Coalesces a batch of ghost syncs into a single `users.info` call.
    pub async fn sync_ghosts_batch(
        &self,
        team_id: &str,
        slack_user_ids: &[String],
        source: &dyn SlackInfoSource,
    ) -> Result<Vec<Ghost>> {
        let mut due = Vec::new();
        for user_id in slack_user_ids {
            let ghost_id = ids::make_user_id(team_id, user_id);
            let existing = self.db.ghost_store().get_ghost(&ghost_id).await?;
            let suppressed = existing
                .as_ref()
                .and_then(|g| g.last_synced_at)
                .is_some_and(|last| (Utc::now() - last).num_seconds() < GHOST_SYNC_SUPPRESS_SECS);
            if !suppressed {
                due.push(user_id.clone());
            }
        }

        if due.is_empty() {
            return Ok(Vec::new());
        }

        let (bot_ids, user_ids): (Vec<_>, Vec<_>) = due.into_iter().partition(|id| is_bot_id(id));

        let mut infos = Vec::new();
        if !user_ids.is_empty() {
            infos.extend(source.users_info(&user_ids).await?);
        }
        for bot_id in &bot_ids {
            infos.push(source.bots_info(bot_id).await?);
        }

        let mut ghosts = Vec::with_capacity(infos.len());
        for info in infos {
            let ghost_id = ids::make_user_id(team_id, &info.user_id);
            let existing = self.db.ghost_store().get_ghost(&ghost_id).await?;
            match self
                .apply_ghost_info(team_id, &ghost_id, &info.user_id, &info, existing)
                .await
            {
                Ok(ghost) => ghosts.push(ghost),
                Err(e) => warn!("failed to sync ghost {}: {}", ghost_id, e),
            }
        }

        Ok(ghosts)
    }

    async fn apply_ghost_info(
        &self,
        team_id: &str,
        ghost_id: &str,
        slack_user_id: &str,
        info: &SlackUserInfo,
        existing: Option<Ghost>,
    ) -> Result<Ghost> {
        let avatar_url = preferred_avatar_url(team_id, slack_user_id, info);
        let now = Utc::now();

        let ghost = Ghost {
            ghost_id: ghost_id.to_string(),
            team_id: team_id.to_string(),
            slack_user_id: slack_user_id.to_string(),
            name: info.display_name.clone(),
            avatar_url,
            avatar_mxc: existing.as_ref().and_then(|g| g.avatar_mxc.clone()),
            is_bot: info.is_bot,
            remote_updated_at: info.updated_at,
            last_synced_at: Some(now),
            created_at: existing.as_ref().map(|g| g.created_at).unwrap_or(now),
            updated_at: now,
        };

        if let Err(e) = self
            .matrix
            .ensure_ghost_user_registered(ghost_id, ghost.name.as_deref())
            .await
        {
            warn!("failed to register ghost {}: {}", ghost_id, e);
        }

        if let Some(name) = &ghost.name
            && let Err(e) = self.matrix.set_ghost_displayname(ghost_id, name).await
        {
            warn!("failed to set displayname for {}: {}", ghost_id, e);
        }

        self.db.ghost_store().upsert_ghost(&ghost).await?;
        debug!("synced ghost {}", ghost_id);
        Ok(ghost)
    }
}

fn is_bot_id(user_id: &str) -> bool {
    user_id.starts_with('B') || user_id == "USLACKBOT"
}

fn preferred_avatar_url(team_id: &str, user_id: &str, info: &SlackUserInfo) -> Option<String> {
    info.image_original.clone().or_else(|| info.image_512.clone()).or_else(|| {
        info.avatar_hash
            .as_ref()
            .map(|hash| format!("https://ca.slack-edge.com/{team_id}-{user_id}-{hash}-512"))
    })
}

fn join_sorted_case_insensitive(mut names: Vec<String>) -> String {
    names.sort_by_key(|n| n.to_lowercase());
    names.join(", ")
}

fn format_channel_topic(topic: Option<&str>, purpose: Option<&str>) -> String {
    let mut lines = Vec::new();
    if let Some(t) = topic
        && !t.is_empty()
    {
        lines.push(format!("Topic: {t}"));
    }
    if let Some(p) = purpose
        && !p.is_empty()
    {
        lines.push(format!("Description: {p}"));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bot_ids_are_detected_by_prefix_or_slackbot() {
        assert!(is_bot_id("B012345"));
        assert!(is_bot_id("USLACKBOT"));
        assert!(!is_bot_id("U012345"));
    }

    #[test]
    fn avatar_preference_prefers_original_then_512_then_synthesized() {
        let with_original = SlackUserInfo {
            user_id: "U1".into(),
            is_bot: false,
            display_name: None,
            image_original: Some("https://orig".into()),
            image_512: Some("https://i512".into()),
            avatar_hash: Some("abc".into()),
            updated_at: None,
        };
        assert_eq!(
            preferred_avatar_url("T1", "U1", &with_original),
            Some("https://orig".to_string())
        );

        let with_512_only = SlackUserInfo {
            image_original: None,
            ..with_original.clone()
        };
        assert_eq!(
            preferred_avatar_url("T1", "U1", &with_512_only),
            Some("https://i512".to_string())
        );

        let synthesized = SlackUserInfo {
            image_original: None,
            image_512: None,
            ..with_original
        };
        assert_eq!(
            preferred_avatar_url("T1", "U1", &synthesized),
            Some("https://ca.slack-edge.com/T1-U1-abc-512".to_string())
        );
    }

    #[test]
    fn group_dm_name_is_comma_joined_case_insensitive_sorted() {
        let joined = join_sorted_case_insensitive(vec!["bob".into(), "Alice".into(), "carol".into()]);
        assert_eq!(joined, "Alice, bob, carol");
    }

    #[test]
    fn channel_topic_omits_blank_lines() {
        assert_eq!(format_channel_topic(Some("standup"), Some("")), "Topic: standup");
        assert_eq!(format_channel_topic(None, Some("eng chat")), "Description: eng chat");
        assert_eq!(format_channel_topic(None, None), "");
        assert_eq!(
            format_channel_topic(Some("standup"), Some("eng chat")),
            "Topic: standup\nDescription: eng chat"
        );
    }
}
