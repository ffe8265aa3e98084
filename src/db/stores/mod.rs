use async_trait::async_trait;

use super::DatabaseError;
use super::models::{BackfillTask, Emoji, Ghost, Message, Portal, Reaction, UserLogin};

#[async_trait]
pub trait PortalStore: Send + Sync {
    async fn get_portal(&self, portal_id: &str) -> Result<Option<Portal>, DatabaseError>;
    async fn get_portal_by_matrix_room(
        &self,
        matrix_room_id: &str,
    ) -> Result<Option<Portal>, DatabaseError>;
    async fn get_portals_by_team(&self, team_id: &str) -> Result<Vec<Portal>, DatabaseError>;
    async fn upsert_portal(&self, portal: &Portal) -> Result<(), DatabaseError>;
    async fn delete_portal(&self, portal_id: &str) -> Result<(), DatabaseError>;
    async fn count_portals(&self) -> Result<i64, DatabaseError>;
}

#[async_trait]
pub trait GhostStore: Send + Sync {
    async fn get_ghost(&self, ghost_id: &str) -> Result<Option<Ghost>, DatabaseError>;
    async fn upsert_ghost(&self, ghost: &Ghost) -> Result<(), DatabaseError>;
    async fn get_ghosts_needing_sync(
        &self,
        team_id: &str,
        older_than_secs: i64,
    ) -> Result<Vec<Ghost>, DatabaseError>;
}

#[async_trait]
pub trait UserLoginStore: Send + Sync {
    async fn get_login(&self, login_id: &str) -> Result<Option<UserLogin>, DatabaseError>;
    async fn get_logins_for_matrix_user(
        &self,
        matrix_user_id: &str,
    ) -> Result<Vec<UserLogin>, DatabaseError>;
    async fn get_all_logins(&self) -> Result<Vec<UserLogin>, DatabaseError>;
    async fn upsert_login(&self, login: &UserLogin) -> Result<(), DatabaseError>;
    async fn delete_login(&self, login_id: &str) -> Result<(), DatabaseError>;
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn get_message(
        &self,
        portal_id: &str,
        slack_timestamp: &str,
        part_id: &str,
    ) -> Result<Option<Message>, DatabaseError>;
    async fn get_message_parts(
        &self,
        portal_id: &str,
        slack_timestamp: &str,
    ) -> Result<Vec<Message>, DatabaseError>;
    async fn get_by_matrix_event_id(
        &self,
        matrix_event_id: &str,
    ) -> Result<Option<Message>, DatabaseError>;
    async fn upsert_message(&self, message: &Message) -> Result<(), DatabaseError>;
    async fn delete_message_parts(
        &self,
        portal_id: &str,
        slack_timestamp: &str,
    ) -> Result<(), DatabaseError>;
    async fn delete_message_part(
        &self,
        portal_id: &str,
        slack_timestamp: &str,
        part_id: &str,
    ) -> Result<(), DatabaseError>;
    async fn latest_thread_message(
        &self,
        portal_id: &str,
        thread_root_ts: &str,
    ) -> Result<Option<Message>, DatabaseError>;
}

#[async_trait]
pub trait ReactionStore: Send + Sync {
    async fn get_reaction(
        &self,
        portal_id: &str,
        slack_timestamp: &str,
        sender_id: &str,
        shortcode: &str,
    ) -> Result<Option<Reaction>, DatabaseError>;
    async fn upsert_reaction(&self, reaction: &Reaction) -> Result<(), DatabaseError>;
    async fn delete_reaction(
        &self,
        portal_id: &str,
        slack_timestamp: &str,
        sender_id: &str,
        shortcode: &str,
    ) -> Result<(), DatabaseError>;
}

#[async_trait]
pub trait EmojiStore: Send + Sync {
    async fn get_emoji(&self, team_id: &str, emoji_id: &str) -> Result<Option<Emoji>, DatabaseError>;
    async fn count_emoji(&self, team_id: &str) -> Result<i64, DatabaseError>;
    async fn list_emoji_ids(&self, team_id: &str) -> Result<Vec<String>, DatabaseError>;
    async fn upsert_emoji(&self, emoji: &Emoji) -> Result<(), DatabaseError>;
    async fn delete_emoji(&self, team_id: &str, emoji_id: &str) -> Result<(), DatabaseError>;
    async fn prune_emoji_not_in(
        &self,
        team_id: &str,
        keep_ids: &[String],
    ) -> Result<(), DatabaseError>;
}

#[async_trait]
pub trait BackfillStore: Send + Sync {
    async fn next_ready_task(&self) -> Result<Option<BackfillTask>, DatabaseError>;
    async fn upsert_task(&self, task: &BackfillTask) -> Result<(), DatabaseError>;
    async fn get_task(
        &self,
        team_id: &str,
        user_login_id: &str,
        channel_id: &str,
    ) -> Result<Option<BackfillTask>, DatabaseError>;
}

/// A transaction scope used by the backfill committer to insert
/// messages, reactions, and the advancing anchor atomically. Individual
/// store dialects provide their own concrete implementation; callers
/// only depend on this trait.
#[async_trait]
pub trait StoreTransaction: Send + Sync {
    async fn commit(self: Box<Self>) -> Result<(), DatabaseError>;
    async fn rollback(self: Box<Self>) -> Result<(), DatabaseError>;
}
