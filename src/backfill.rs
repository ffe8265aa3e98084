//! Backfill Engine: a loop that walks `BackfillTask`s, pulling history pages
//! from `conversations.history` and handing them to the upstream caller as
//! converted batches. Mirrors the ticker-loop shape `BridgeCore::start`
//! already uses for presence, but with per-outcome sleep durations instead
//! of a fixed interval.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::convert::{ConvertedPart, SlackToMatrixConverter};
use crate::db::{BackfillTask, BackfillTaskState, ConnectionState, DatabaseManager};
use crate::emoji::{EmojiManager, EmojiValue};
use crate::ids;
use crate::pipeline;
use crate::session::SlackWebApi;

const HISTORY_PAGE_LIMIT: u32 = 999;

/// Resolves a live Slack Web API handle for a `UserLogin`, if one is
/// currently connected. Kept as a seam so the engine doesn't need to know
/// how `Session`s are tracked by the rest of the bridge.
#[async_trait]
pub trait SessionLookup: Send + Sync {
    async fn web_api_for(&self, login_id: &str) -> Option<Arc<dyn SlackWebApi>>;
}

#[derive(Debug, Clone)]
pub struct BackfillReaction {
    pub sender_id: String,
    pub shortcode: String,
    pub emoji: Option<EmojiValue>,
}

#[derive(Debug, Clone)]
pub struct BackfillMessage {
    pub slack_timestamp: String,
    pub sender_id: String,
    pub parts: Vec<ConvertedPart>,
    pub reactions: Vec<BackfillReaction>,
}

/// What `fetch_batch` hands back to the upstream backfill caller (§4.8 step 6).
#[derive(Debug, Clone, Default)]
pub struct BackfillBatch {
    pub messages: Vec<BackfillMessage>,
    pub cursor: Option<String>,
    pub has_more: bool,
    pub forward: bool,
}

pub struct BackfillEngine {
    db: Arc<DatabaseManager>,
    sessions: Arc<dyn SessionLookup>,
    converter: Arc<SlackToMatrixConverter>,
    emoji: Arc<EmojiManager>,
    config: Arc<Config>,
}

impl BackfillEngine {
    pub fn new(
        db: Arc<DatabaseManager>,
        sessions: Arc<dyn SessionLookup>,
        converter: Arc<SlackToMatrixConverter>,
        emoji: Arc<EmojiManager>,
        config: Arc<Config>,
    ) -> Self {
        Self { db, sessions, converter, emoji, config }
    }

    /// Runs forever. Callers spawn this as its own task.
    pub async fn run(&self) {
        loop {
            let sleep_secs = match self.run_one().await {
                Ok(Some(())) => self.config.limits.backfill_post_batch_delay_secs,
                Ok(None) => self.config.limits.backfill_idle_sleep_secs,
                Err(e) => {
                    warn!("backfill store error: {}", e);
                    self.config.limits.backfill_db_error_sleep_secs
                }
            };
            tokio::time::sleep(std::time::Duration::from_secs(sleep_secs)).await;
        }
    }

    /// Processes one ready task, if any. `Ok(None)` means the queue was
    /// empty this round.
    async fn run_one(&self) -> Result<Option<()>> {
        let task = self
            .db
            .backfill_store()
            .next_ready_task()
            .await
            .context("fetching next backfill task")?;
        let Some(mut task) = task else {
            return Ok(None);
        };

        task.dispatched_at = Some(Utc::now());
        self.db.backfill_store().upsert_task(&task).await?;

        if let Err(e) = self.process_task(&mut task).await {
            debug!(
                "backfill task {}/{}/{} did not complete this round: {}",
                task.team_id, task.user_login_id, task.channel_id, e
            );
        }

        Ok(Some(()))
    }

    async fn process_task(&self, task: &mut BackfillTask) -> Result<()> {
        let login = self.db.user_login_store().get_login(&task.user_login_id).await?;
        let Some(login) = login else {
            self.cool_down(task);
            self.db.backfill_store().upsert_task(task).await?;
            return Ok(());
        };
        if login.connection_state != ConnectionState::Connected {
            self.cool_down(task);
            self.db.backfill_store().upsert_task(task).await?;
            return Ok(());
        }

        let portal_id = ids::make_portal_id(&task.team_id, &task.channel_id);
        let portal = self.db.portal_store().get_portal(&portal_id).await?;
        let Some(portal) = portal else {
            task.state = BackfillTaskState::Finished;
            self.db.backfill_store().upsert_task(task).await?;
            return Ok(());
        };
        if !portal.more_to_backfill {
            task.state = BackfillTaskState::Finished;
            self.db.backfill_store().upsert_task(task).await?;
            return Ok(());
        }

        let Some(web_api) = self.sessions.web_api_for(&task.user_login_id).await else {
            self.cool_down(task);
            self.db.backfill_store().upsert_task(task).await?;
            return Ok(());
        };

        let batch = self.fetch_batch(web_api.as_ref(), task).await?;

        for message in &batch.messages {
            for part in &message.parts {
                debug!(
                    "backfill: would commit portal={} ts={} part={}",
                    portal_id, message.slack_timestamp, part.part_id
                );
            }
        }

        task.anchor_ts = batch.cursor.clone();
        if !batch.has_more {
            let mut portal = portal;
            portal.more_to_backfill = false;
            portal.updated_at = Utc::now();
            self.db.portal_store().upsert_portal(&portal).await?;
        }
        task.completed_at = Some(Utc::now());
        task.state = BackfillTaskState::Pending;
        self.db.backfill_store().upsert_task(task).await?;

        info!(
            "backfilled {} message(s) for {}/{}",
            batch.messages.len(),
            task.team_id,
            task.channel_id
        );
        Ok(())
    }

    fn cool_down(&self, task: &mut BackfillTask) {
        let min = self.config.limits.backfill_cooldown_min_secs;
        let max = self.config.limits.backfill_cooldown_max_secs;
        let secs = min + (max.saturating_sub(min)) / 2;
        task.state = BackfillTaskState::CoolingDown;
        task.cooldown_until = Some(Utc::now() + chrono::Duration::seconds(secs as i64));
    }

    /// §4.8 steps 4-6: fetch one page of history and convert it.
    async fn fetch_batch(
        &self,
        web_api: &dyn SlackWebApi,
        task: &BackfillTask,
    ) -> Result<BackfillBatch> {
        let mut body = json!({
            "channel": task.channel_id,
            "inclusive": false,
            "limit": HISTORY_PAGE_LIMIT,
        });
        let anchor = task.anchor_ts.clone();
        if task.forward {
            if let Some(anchor) = &anchor {
                body["oldest"] = json!(anchor);
            }
        } else if let Some(anchor) = &anchor {
            body["latest"] = json!(anchor);
        }

        let resp = web_api.call("conversations.history", body).await?;
        let raw_messages: Vec<Value> = resp
            .get("messages")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let has_more = resp.get("has_more").and_then(Value::as_bool).unwrap_or(false);

        // Slack returns newest-first; chronological order is what the
        // portal worker's per-message deadline/ordering logic expects.
        let mut ordered = raw_messages.clone();
        ordered.reverse();

        let mut messages = Vec::with_capacity(ordered.len());
        for raw in &ordered {
            let Some(ts) = raw.get("ts").and_then(Value::as_str) else {
                continue;
            };
            let sender = raw
                .get("user")
                .or_else(|| raw.get("bot_id"))
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            let sender_id = pipeline::make_event_sender(&task.team_id, sender);

            let converted = self
                .converter
                .convert(&task.team_id, &task.channel_id, raw, false)
                .await
                .with_context(|| format!("converting backfilled message {}", ts))?;

            let reactions = self.resolve_reactions(&task.team_id, raw).await;

            messages.push(BackfillMessage {
                slack_timestamp: ts.to_string(),
                sender_id,
                parts: converted.parts,
                reactions,
            });
        }

        let cursor = if task.forward {
            raw_messages.first().and_then(|m| m.get("ts")).and_then(Value::as_str).map(String::from)
        } else {
            raw_messages.last().and_then(|m| m.get("ts")).and_then(Value::as_str).map(String::from)
        };

        Ok(BackfillBatch { messages, cursor, has_more, forward: task.forward })
    }

    async fn resolve_reactions(&self, team_id: &str, raw_message: &Value) -> Vec<BackfillReaction> {
        let mut out = Vec::new();
        let Some(reactions) = raw_message.get("reactions").and_then(Value::as_array) else {
            return out;
        };
        for reaction in reactions {
            let Some(name) = reaction.get("name").and_then(Value::as_str) else {
                continue;
            };
            let emoji = self.emoji.try_get_emoji(team_id, name, true, true).await.ok().flatten();
            let users = reaction.get("users").and_then(Value::as_array).cloned().unwrap_or_default();
            for user in users {
                let Some(user_id) = user.as_str() else { continue };
                out.push(BackfillReaction {
                    sender_id: pipeline::make_event_sender(team_id, user_id),
                    shortcode: name.to_string(),
                    emoji: emoji.clone(),
                });
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cooldown_window_lands_between_config_bounds() {
        let limits = crate::config::LimitsConfig::default();
        let secs = limits.backfill_cooldown_min_secs
            + (limits.backfill_cooldown_max_secs.saturating_sub(limits.backfill_cooldown_min_secs)) / 2;
        assert!(secs >= limits.backfill_cooldown_min_secs && secs <= limits.backfill_cooldown_max_secs);
    }

    #[test]
    fn finished_task_state_is_terminal() {
        let now = Utc::now();
        let task = BackfillTask {
            team_id: "T1".to_string(),
            user_login_id: "T1-U1".to_string(),
            channel_id: "C1".to_string(),
            state: BackfillTaskState::Finished,
            priority: 0,
            anchor_ts: None,
            forward: false,
            dispatched_at: None,
            completed_at: None,
            cooldown_until: None,
            created_at: now,
        };
        assert!(!task.is_ready(now));
    }
}
