use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::Utc;
use once_cell::sync::Lazy;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

use crate::db::{DatabaseManager, Emoji};
use crate::media::MediaHandler;

/// One row from Slack's `emoji.list`, before it is split into alias/non-alias
/// groups by a resync.
#[derive(Debug, Clone)]
pub struct SlackEmojiEntry {
    pub id: String,
    /// A direct image URL, or `alias:<other-id>`.
    pub value: String,
}

/// A resolved lookup from [`EmojiManager::try_get_emoji`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmojiValue {
    Unicode(String),
    Image(String),
    /// Resolved, but with nothing renderable yet (e.g. not uploaded and
    /// `ensure_uploaded` was false). Distinguishes "found, empty" from
    /// "not found at all".
    Empty,
}

/// Fetches the live `emoji.list` for a team. Implemented by the Slack
/// session/resolver; kept abstract here so the emoji tables don't depend on
/// the Web API client directly.
#[async_trait]
pub trait EmojiListFetcher: Send + Sync {
    async fn fetch_emoji_list(&self, team_id: &str) -> Result<Vec<SlackEmojiEntry>>;
}

pub struct EmojiManager {
    db: Arc<DatabaseManager>,
    media: Arc<MediaHandler>,
    appservice_token: String,
    write_locks: SyncMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    resync_locks: SyncMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl EmojiManager {
    pub fn new(db: Arc<DatabaseManager>, media: Arc<MediaHandler>, appservice_token: String) -> Self {
        Self {
            db,
            media,
            appservice_token,
            write_locks: SyncMutex::new(HashMap::new()),
            resync_locks: SyncMutex::new(HashMap::new()),
        }
    }

    fn team_lock(&self, team_id: &str) -> Arc<AsyncMutex<()>> {
        self.write_locks
            .lock()
            .entry(team_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    fn resync_lock(&self, team_id: &str) -> Arc<AsyncMutex<()>> {
        self.resync_locks
            .lock()
            .entry(team_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// `:name:` -> Unicode, if Slack's static table covers it.
    pub fn static_unicode(shortcode: &str) -> Option<&'static str> {
        STATIC_EMOJI.get(shortcode).copied()
    }

    /// `try_get_emoji(shortcode, ensure_uploaded, allow_recurse)`.
    pub async fn try_get_emoji(
        &self,
        team_id: &str,
        shortcode: &str,
        ensure_uploaded: bool,
        allow_recurse: bool,
    ) -> Result<Option<EmojiValue>> {
        if let Some(unicode) = Self::static_unicode(shortcode) {
            return Ok(Some(EmojiValue::Unicode(unicode.to_string())));
        }

        let emoji = match self.db.emoji_store().get_emoji(team_id, shortcode).await? {
            Some(e) => e,
            None => return Ok(None),
        };

        if let Some(uri) = emoji.mxc_url.clone() {
            return Ok(Some(EmojiValue::Image(uri)));
        }

        if let Some(target) = emoji.alias_target()
            && allow_recurse
        {
            let target = target.to_string();
            return Box::pin(self.try_get_emoji(team_id, &target, ensure_uploaded, false)).await;
        }

        if ensure_uploaded {
            let uri = self.download_and_upload(team_id, &emoji).await?;
            return Ok(Some(EmojiValue::Image(uri)));
        }

        Ok(Some(EmojiValue::Empty))
    }

    /// On not-found during a reaction lookup: cooperative resync-if-not-held,
    /// then retry the lookup once.
    pub async fn try_get_emoji_for_reaction(
        &self,
        team_id: &str,
        shortcode: &str,
        ensure_uploaded: bool,
        fetcher: &dyn EmojiListFetcher,
    ) -> Result<Option<EmojiValue>> {
        if let Some(found) = self.try_get_emoji(team_id, shortcode, ensure_uploaded, true).await? {
            return Ok(Some(found));
        }

        let lock = self.resync_lock(team_id);
        match lock.clone().try_lock_owned() {
            Ok(_guard) => match fetcher.fetch_emoji_list(team_id).await {
                Ok(remote) => {
                    if let Err(e) = self.full_resync(team_id, remote, false).await {
                        warn!("emoji resync for team {} failed: {}", team_id, e);
                    }
                }
                Err(e) => warn!("emoji.list fetch for team {} failed: {}", team_id, e),
            },
            Err(_) => {
                debug!("resync already in flight for team {}, waiting", team_id);
                let _wait = lock.lock().await;
            }
        }

        self.try_get_emoji(team_id, shortcode, ensure_uploaded, true).await
    }

    async fn download_and_upload(&self, team_id: &str, emoji: &Emoji) -> Result<String> {
        let guard = self.team_lock(team_id);
        let _guard = guard.lock().await;

        if let Some(current) = self.db.emoji_store().get_emoji(team_id, &emoji.emoji_id).await?
            && let Some(uri) = current.mxc_url
        {
            return Ok(uri);
        }

        let media = self.media.download_from_url(&emoji.value).await?;
        let uri = self.media.upload_to_matrix(&media, &self.appservice_token).await?;

        let updated = Emoji {
            mxc_url: Some(uri.clone()),
            updated_at: Utc::now(),
            ..emoji.clone()
        };
        self.db.emoji_store().upsert_emoji(&updated).await?;

        Ok(uri)
    }

    /// Slack `add` event: upsert `(team, id, value)`, propagating the alias
    /// target's image uri when known.
    pub async fn handle_add(&self, team_id: &str, id: &str, value: &str) -> Result<()> {
        let lock = self.team_lock(team_id);
        let _guard = lock.lock().await;
        self.upsert_single(team_id, id, value).await
    }

    /// Slack `remove` event.
    pub async fn handle_remove(&self, team_id: &str, ids: &[String]) -> Result<()> {
        let lock = self.team_lock(team_id);
        let _guard = lock.lock().await;
        for id in ids {
            self.db.emoji_store().delete_emoji(team_id, id).await?;
        }
        Ok(())
    }

    /// Slack `rename` event: lookup by old id; if missing or value mismatch,
    /// treat as an `add` of the new id; else update the id in place.
    pub async fn handle_rename(
        &self,
        team_id: &str,
        old_id: &str,
        new_id: &str,
        value: &str,
    ) -> Result<()> {
        let lock = self.team_lock(team_id);
        let _guard = lock.lock().await;

        let existing = self.db.emoji_store().get_emoji(team_id, old_id).await?;
        match existing {
            Some(row) if row.value == value => {
                self.db.emoji_store().delete_emoji(team_id, old_id).await?;
                let renamed = Emoji {
                    emoji_id: new_id.to_string(),
                    updated_at: Utc::now(),
                    ..row
                };
                self.db.emoji_store().upsert_emoji(&renamed).await
                    .map_err(|e| anyhow!("failed to persist renamed emoji {}: {}", new_id, e))
            }
            _ => self.upsert_single(team_id, new_id, value).await,
        }
    }

    /// Full resync, scheduled for any Slack emoji-event subtype this module
    /// doesn't otherwise special-case.
    pub async fn full_resync(
        &self,
        team_id: &str,
        remote: Vec<SlackEmojiEntry>,
        only_if_count_mismatch: bool,
    ) -> Result<()> {
        let lock = self.team_lock(team_id);
        let _guard = lock.lock().await;

        let local_count = self.db.emoji_store().count_emoji(team_id).await?;
        if only_if_count_mismatch && local_count == remote.len() as i64 {
            return Ok(());
        }

        let (aliases, non_aliases): (Vec<_>, Vec<_>) = remote
            .iter()
            .cloned()
            .partition(|e| e.value.starts_with("alias:"));

        let mut resolved: HashMap<String, String> = HashMap::new();

        for entry in &non_aliases {
            let existing = self.db.emoji_store().get_emoji(team_id, &entry.id).await?;
            if let Some(uri) = existing.as_ref().and_then(|e| e.mxc_url.clone()) {
                resolved.insert(entry.id.clone(), uri);
            }
            self.upsert_resync_row(team_id, entry, existing).await?;
        }

        for entry in &aliases {
            let target_id = entry.value.strip_prefix("alias:").unwrap_or(&entry.value);
            let existing = self.db.emoji_store().get_emoji(team_id, &entry.id).await?;
            let mxc = resolved
                .get(target_id)
                .cloned()
                .or_else(|| existing.as_ref().and_then(|e| e.mxc_url.clone()));
            let emoji = Emoji {
                team_id: team_id.to_string(),
                emoji_id: entry.id.clone(),
                value: entry.value.clone(),
                mxc_url: mxc,
                created_at: existing.as_ref().map(|e| e.created_at).unwrap_or_else(Utc::now),
                updated_at: Utc::now(),
            };
            self.db.emoji_store().upsert_emoji(&emoji).await?;
        }

        if local_count > remote.len() as i64 {
            let keep_ids: Vec<String> = non_aliases
                .iter()
                .chain(aliases.iter())
                .map(|e| e.id.clone())
                .collect();
            self.db.emoji_store().prune_emoji_not_in(team_id, &keep_ids).await?;
        }

        Ok(())
    }

    async fn upsert_resync_row(
        &self,
        team_id: &str,
        entry: &SlackEmojiEntry,
        existing: Option<Emoji>,
    ) -> Result<()> {
        let emoji = Emoji {
            team_id: team_id.to_string(),
            emoji_id: entry.id.clone(),
            value: entry.value.clone(),
            mxc_url: existing.as_ref().and_then(|e| e.mxc_url.clone()),
            created_at: existing.as_ref().map(|e| e.created_at).unwrap_or_else(Utc::now),
            updated_at: Utc::now(),
        };
        self.db.emoji_store().upsert_emoji(&emoji).await?;
        Ok(())
    }

    async fn upsert_single(&self, team_id: &str, id: &str, value: &str) -> Result<()> {
        let mut mxc = None;
        if let Some(target_id) = value.strip_prefix("alias:")
            && let Some(target) = self.db.emoji_store().get_emoji(team_id, target_id).await?
        {
            mxc = target.mxc_url;
        }

        let existing = self.db.emoji_store().get_emoji(team_id, id).await?;
        let emoji = Emoji {
            team_id: team_id.to_string(),
            emoji_id: id.to_string(),
            value: value.to_string(),
            mxc_url: mxc,
            created_at: existing.map(|e| e.created_at).unwrap_or_else(Utc::now),
            updated_at: Utc::now(),
        };

        self.db.emoji_store().upsert_emoji(&emoji).await
            .map_err(|e| anyhow!("failed to upsert emoji {}: {}", id, e))
    }

    pub fn emoji_to_matrix_html(&self, mxc_url: &str, shortcode: &str) -> String {
        format_custom_emoji_html(shortcode, mxc_url)
    }

    pub fn emoji_to_matrix_plain(&self, shortcode: &str) -> String {
        format!(":{}:", shortcode)
    }
}

/// The `<img data-mx-emoticon>` rendering for a custom emoji, usable
/// without a live `EmojiManager` (e.g. from the mrkdwn renderer, which only
/// has a resolved `EmojiValue` in hand).
pub fn format_custom_emoji_html(shortcode: &str, mxc_url: &str) -> String {
    format!(
        r#"<img data-mx-emoticon src="{}" alt=":{}:" title=":{}:" height="32"/>"#,
        mxc_url, shortcode, shortcode
    )
}

/// Approximation of Slack's static shortcode -> Unicode table. Covers the
/// common subset; unmapped shortcodes fall through to the per-team custom
/// emoji lookup.
static STATIC_EMOJI: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("smile", "\u{1F604}"),
        ("simple_smile", "\u{1F642}"),
        ("smiley", "\u{1F603}"),
        ("grinning", "\u{1F600}"),
        ("blush", "\u{1F60A}"),
        ("wink", "\u{1F609}"),
        ("slightly_smiling_face", "\u{1F642}"),
        ("joy", "\u{1F602}"),
        ("rofl", "\u{1F923}"),
        ("sweat_smile", "\u{1F605}"),
        ("laughing", "\u{1F606}"),
        ("innocent", "\u{1F607}"),
        ("slight_smile", "\u{1F642}"),
        ("upside_down_face", "\u{1F643}"),
        ("thinking_face", "\u{1F914}"),
        ("thinking", "\u{1F914}"),
        ("neutral_face", "\u{1F610}"),
        ("expressionless", "\u{1F611}"),
        ("no_mouth", "\u{1F636}"),
        ("unamused", "\u{1F612}"),
        ("roll_eyes", "\u{1F644}"),
        ("grimacing", "\u{1F62C}"),
        ("relieved", "\u{1F60C}"),
        ("pensive", "\u{1F614}"),
        ("sleepy", "\u{1F62A}"),
        ("sleeping", "\u{1F634}"),
        ("confused", "\u{1F615}"),
        ("worried", "\u{1F61F}"),
        ("slightly_frowning_face", "\u{1F641}"),
        ("frowning_face", "\u{2639}"),
        ("frowning", "\u{1F626}"),
        ("persevere", "\u{1F623}"),
        ("confounded", "\u{1F616}"),
        ("tired_face", "\u{1F62B}"),
        ("weary", "\u{1F629}"),
        ("triumph", "\u{1F624}"),
        ("rage", "\u{1F621}"),
        ("angry", "\u{1F620}"),
        ("cry", "\u{1F622}"),
        ("sob", "\u{1F62D}"),
        ("scream", "\u{1F631}"),
        ("fearful", "\u{1F628}"),
        ("cold_sweat", "\u{1F630}"),
        ("disappointed_relieved", "\u{1F625}"),
        ("hushed", "\u{1F62F}"),
        ("flushed", "\u{1F633}"),
        ("astonished", "\u{1F632}"),
        ("dizzy_face", "\u{1F635}"),
        ("exploding_head", "\u{1F92F}"),
        ("zany_face", "\u{1F92A}"),
        ("hugs", "\u{1F917}"),
        ("heart_eyes", "\u{1F60D}"),
        ("star_struck", "\u{1F929}"),
        ("kissing_heart", "\u{1F618}"),
        ("kissing", "\u{1F617}"),
        ("kissing_smiling_eyes", "\u{1F619}"),
        ("kissing_closed_eyes", "\u{1F61A}"),
        ("yum", "\u{1F60B}"),
        ("stuck_out_tongue", "\u{1F61B}"),
        ("stuck_out_tongue_winking_eye", "\u{1F61C}"),
        ("stuck_out_tongue_closed_eyes", "\u{1F61D}"),
        ("money_mouth_face", "\u{1F911}"),
        ("nerd_face", "\u{1F913}"),
        ("sunglasses", "\u{1F60E}"),
        ("clown_face", "\u{1F921}"),
        ("cowboy_hat_face", "\u{1F920}"),
        ("smirk", "\u{1F60F}"),
        ("no_good", "\u{1F645}"),
        ("+1", "\u{1F44D}"),
        ("thumbsup", "\u{1F44D}"),
        ("-1", "\u{1F44E}"),
        ("thumbsdown", "\u{1F44E}"),
        ("ok_hand", "\u{1F44C}"),
        ("v", "\u{270C}"),
        ("wave", "\u{1F44B}"),
        ("clap", "\u{1F44F}"),
        ("pray", "\u{1F64F}"),
        ("raised_hands", "\u{1F64C}"),
        ("muscle", "\u{1F4AA}"),
        ("point_up", "\u{261D}"),
        ("point_down", "\u{1F447}"),
        ("point_left", "\u{1F448}"),
        ("point_right", "\u{1F449}"),
        ("eyes", "\u{1F440}"),
        ("heart", "\u{2764}"),
        ("broken_heart", "\u{1F494}"),
        ("tada", "\u{1F389}"),
        ("fire", "\u{1F525}"),
        ("100", "\u{1F4AF}"),
        ("sparkles", "\u{2728}"),
        ("rocket", "\u{1F680}"),
        ("white_check_mark", "\u{2705}"),
        ("heavy_check_mark", "\u{2714}"),
        ("x", "\u{274C}"),
        ("warning", "\u{26A0}"),
        ("question", "\u{2753}"),
        ("exclamation", "\u{2757}"),
        ("bulb", "\u{1F4A1}"),
        ("bug", "\u{1F41B}"),
        ("eyes_closed", "\u{1F61D}"),
        ("pray_hands", "\u{1F64F}"),
        ("coffee", "\u{2615}"),
        ("beers", "\u{1F37B}"),
        ("pizza", "\u{1F355}"),
        ("tada_confetti", "\u{1F38A}"),
        ("calendar", "\u{1F4C5}"),
        ("memo", "\u{1F4DD}"),
        ("link", "\u{1F517}"),
        ("lock", "\u{1F512}"),
        ("unlock", "\u{1F513}"),
        ("email", "\u{1F4E7}"),
        ("phone", "\u{1F4DE}"),
        ("zap", "\u{26A1}"),
        ("star", "\u{2B50}"),
    ])
});

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> EmojiManager {
        EmojiManager::new(
            Arc::new(crate::db::DatabaseManager::new_in_memory().unwrap()),
            Arc::new(crate::media::MediaHandler::new("http://localhost:8008")),
            "as_token".to_string(),
        )
    }

    #[test]
    fn emoji_to_matrix_html_creates_correct_format() {
        let m = manager();
        let html = m.emoji_to_matrix_html("mxc://example.org/abc123", "smile");
        assert!(html.contains("mxc://example.org/abc123"));
        assert!(html.contains(":smile:"));
        assert!(html.contains("data-mx-emoticon"));
    }

    #[test]
    fn emoji_to_matrix_plain_creates_correct_format() {
        let m = manager();
        assert_eq!(m.emoji_to_matrix_plain("smile"), ":smile:");
    }

    #[test]
    fn static_table_resolves_known_shortcode() {
        assert_eq!(EmojiManager::static_unicode("fire"), Some("\u{1F525}"));
        assert_eq!(EmojiManager::static_unicode("not_a_real_shortcode"), None);
    }

    #[tokio::test]
    async fn try_get_emoji_returns_unicode_before_hitting_the_store() {
        let m = manager();
        let result = m
            .try_get_emoji("T1", "heart", false, true)
            .await
            .unwrap();
        assert_eq!(result, Some(EmojiValue::Unicode("\u{2764}".to_string())));
    }

    #[tokio::test]
    async fn try_get_emoji_reports_not_found_for_unknown_custom_emoji() {
        let m = manager();
        let result = m
            .try_get_emoji("T1", "totally-custom-and-missing", false, true)
            .await
            .unwrap();
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn add_then_lookup_returns_empty_without_ensure_uploaded() {
        let m = manager();
        m.handle_add("T1", "partyparrot", "https://example.org/parrot.gif")
            .await
            .unwrap();

        let result = m
            .try_get_emoji("T1", "partyparrot", false, true)
            .await
            .unwrap();
        assert_eq!(result, Some(EmojiValue::Empty));
    }

    #[tokio::test]
    async fn rename_with_matching_value_preserves_row_under_new_id() {
        let m = manager();
        m.handle_add("T1", "old_id", "https://example.org/x.png")
            .await
            .unwrap();
        m.handle_rename("T1", "old_id", "new_id", "https://example.org/x.png")
            .await
            .unwrap();

        assert_eq!(
            m.db.emoji_store().get_emoji("T1", "old_id").await.unwrap(),
            None
        );
        assert!(
            m.db
                .emoji_store()
                .get_emoji("T1", "new_id")
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn rename_with_mismatched_value_is_treated_as_add() {
        let m = manager();
        m.handle_add("T1", "old_id", "https://example.org/x.png")
            .await
            .unwrap();
        m.handle_rename("T1", "old_id", "new_id", "https://example.org/different.png")
            .await
            .unwrap();

        assert!(
            m.db
                .emoji_store()
                .get_emoji("T1", "old_id")
                .await
                .unwrap()
                .is_some()
        );
        assert!(
            m.db
                .emoji_store()
                .get_emoji("T1", "new_id")
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn full_resync_skips_when_count_matches_and_mismatch_only_is_set() {
        let m = manager();
        m.handle_add("T1", "a", "https://example.org/a.png")
            .await
            .unwrap();

        m.full_resync(
            "T1",
            vec![SlackEmojiEntry {
                id: "b".to_string(),
                value: "https://example.org/b.png".to_string(),
            }],
            true,
        )
        .await
        .unwrap();

        // count (1) matched remote count (1), so no-op: "a" survives, "b" absent.
        assert!(m.db.emoji_store().get_emoji("T1", "a").await.unwrap().is_some());
        assert!(m.db.emoji_store().get_emoji("T1", "b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn full_resync_prunes_rows_missing_from_a_smaller_remote_set() {
        let m = manager();
        m.handle_add("T1", "a", "https://example.org/a.png")
            .await
            .unwrap();
        m.handle_add("T1", "b", "https://example.org/b.png")
            .await
            .unwrap();

        m.full_resync(
            "T1",
            vec![SlackEmojiEntry {
                id: "a".to_string(),
                value: "https://example.org/a.png".to_string(),
            }],
            false,
        )
        .await
        .unwrap();

        assert!(m.db.emoji_store().get_emoji("T1", "a").await.unwrap().is_some());
        assert!(m.db.emoji_store().get_emoji("T1", "b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn full_resync_carries_alias_target_image_uri() {
        let m = manager();

        m.full_resync(
            "T1",
            vec![
                SlackEmojiEntry {
                    id: "base".to_string(),
                    value: "https://example.org/base.png".to_string(),
                },
                SlackEmojiEntry {
                    id: "derived".to_string(),
                    value: "alias:base".to_string(),
                },
            ],
            false,
        )
        .await
        .unwrap();

        let derived = m
            .db
            .emoji_store()
            .get_emoji("T1", "derived")
            .await
            .unwrap()
            .unwrap();
        assert!(derived.is_alias());
        // no mxc yet since "base" itself was never uploaded/persisted with an mxc.
        assert_eq!(derived.mxc_url, None);
    }
}
