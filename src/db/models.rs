use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A Slack workspace the bridge has touched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Team {
    pub team_id: String,
    pub domain: String,
    pub name: String,
    pub icon_url: Option<String>,
    /// Matrix room id of the team's Space, created lazily.
    pub space_room_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One (Matrix user, Slack team, Slack user) tuple.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserLogin {
    /// `MakeUserLoginID(team_id, user_id)`.
    pub login_id: String,
    pub matrix_user_id: String,
    pub team_id: String,
    pub slack_user_id: String,
    pub token: String,
    pub cookie_token: Option<String>,
    pub connection_state: ConnectionState,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    BadCredentials,
    UnknownError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoomType {
    Channel,
    Dm,
    GroupDm,
    /// The team portal ("space").
    Space,
}

/// The mapping Channel <-> Matrix room.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Portal {
    /// `MakePortalID(team_id, channel_id)`.
    pub portal_id: String,
    pub team_id: String,
    pub channel_id: String,
    pub matrix_room_id: Option<String>,
    pub room_type: RoomType,
    /// UserLogin id that owns this portal; empty for shared channels.
    pub receiver: String,
    pub name: Option<String>,
    pub topic: Option<String>,
    pub more_to_backfill: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A Matrix puppet representing a Slack user or bot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ghost {
    /// `MakeUserID(team_id, user_id)`.
    pub ghost_id: String,
    pub team_id: String,
    pub slack_user_id: String,
    pub name: Option<String>,
    pub avatar_url: Option<String>,
    pub avatar_mxc: Option<String>,
    pub is_bot: bool,
    /// Last Slack `profile.updated` epoch observed.
    pub remote_updated_at: Option<i64>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A Matrix<->Slack message-part binding. Key = (portal, slack ts, part id).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub portal_id: String,
    pub slack_timestamp: String,
    /// `""` for the text part; `file-<index>-<fileID>` for file parts.
    pub part_id: String,
    pub matrix_event_id: String,
    pub matrix_room_id: String,
    pub sender_id: String,
    pub thread_root_ts: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Keyed by (portal, message timestamp, sender, shortcode).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reaction {
    pub portal_id: String,
    pub slack_timestamp: String,
    pub sender_id: String,
    pub emoji_shortcode: String,
    pub matrix_event_id: String,
    pub created_at: DateTime<Utc>,
}

/// A custom, per-team emoji. `value` is either a direct URL or
/// `alias:<other-emoji-id>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Emoji {
    pub team_id: String,
    pub emoji_id: String,
    pub value: String,
    pub mxc_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Emoji {
    pub fn alias_target(&self) -> Option<&str> {
        self.value.strip_prefix("alias:")
    }

    pub fn is_alias(&self) -> bool {
        self.value.starts_with("alias:")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackfillTaskState {
    Pending,
    Dispatched,
    CoolingDown,
    Finished,
}

/// One unit of history-fetch work, at most one per (team, user, channel).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillTask {
    pub team_id: String,
    pub user_login_id: String,
    pub channel_id: String,
    pub state: BackfillTaskState,
    pub priority: i32,
    /// Oldest (or newest, for forward fill) Slack ts fetched so far.
    pub anchor_ts: Option<String>,
    pub forward: bool,
    pub dispatched_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl BackfillTask {
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            BackfillTaskState::Finished => false,
            BackfillTaskState::Dispatched => false,
            BackfillTaskState::CoolingDown => self.cooldown_until.is_none_or(|until| now >= until),
            BackfillTaskState::Pending => true,
        }
    }
}
