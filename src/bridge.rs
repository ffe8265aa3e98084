//! Bridge Core: the orchestrator that owns every live Slack `Session`,
//! dispatches converted remote events onto the right portal worker, and
//! implements the Matrix-side event handler the appservice router calls
//! into. Ties together the Resolver, Portal Coordinator, Emoji Manager,
//! the two message converters, and the Backfill Engine.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use chrono::Utc;
use parking_lot::Mutex as SyncMutex;
use reqwest::multipart;
use serde_json::{Value, json};
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tracing::{debug, error, info, warn};

pub mod sessions;
pub mod source;

use self::sessions::SessionRegistry;
use self::source::SlackInfoSourceAdapter;

use crate::backfill::BackfillEngine;
use crate::config::Config;
use crate::convert::{ConversionResult, MatrixToSlackConverter, SlackSendPlan, SlackToMatrixConverter};
use crate::db::{ConnectionState, DatabaseManager, Message, Portal, Reaction, RoomType, UserLogin};
use crate::emoji::EmojiManager;
use crate::ids;
use crate::matrix::{MatrixAppservice, MatrixEvent};
use crate::media::MediaHandler;
use crate::pipeline::{self, RemoteEvent, RemoteEventKind};
use crate::portal::PortalCoordinator;
use crate::resolver::Resolver;
use crate::session::{RawRtmEvent, Session, SessionError, SlackWebApi};

/// Matrix's own cap is higher; this is what we're willing to relay
/// outbound without the separate upload-URL flow.
const MAX_OUTGOING_FILE_SIZE: usize = 50 * 1024 * 1024;
const EVENT_CHANNEL_BUFFER: usize = 512;

pub struct BridgeCore {
    matrix: Arc<MatrixAppservice>,
    db: Arc<DatabaseManager>,
    config: Arc<Config>,
    portals: Arc<PortalCoordinator>,
    resolver: Arc<Resolver>,
    emoji: Arc<EmojiManager>,
    media: Arc<MediaHandler>,
    slack_to_matrix: Arc<SlackToMatrixConverter>,
    matrix_to_slack: SyncMutex<HashMap<String, Arc<MatrixToSlackConverter>>>,
    sessions: Arc<SessionRegistry>,
    events_tx: mpsc::Sender<RawRtmEvent>,
    events_rx: AsyncMutex<Option<mpsc::Receiver<RawRtmEvent>>>,
}

impl BridgeCore {
    pub fn new(matrix: Arc<MatrixAppservice>, db: Arc<DatabaseManager>, config: Arc<Config>) -> Self {
        let media = Arc::new(MediaHandler::new(&config.bridge.homeserver_url));
        let emoji = Arc::new(EmojiManager::new(
            db.clone(),
            media.clone(),
            config.registration.appservice_token.clone(),
        ));
        let slack_to_matrix = Arc::new(SlackToMatrixConverter::new(
            db.clone(),
            emoji.clone(),
            media.clone(),
            config.registration.appservice_token.clone(),
            MAX_OUTGOING_FILE_SIZE,
            config.bridge.domain.clone(),
        ));
        let portals = Arc::new(PortalCoordinator::new(db.clone(), matrix.clone(), config.clone()));
        let resolver = Arc::new(Resolver::new(db.clone(), matrix.clone()));
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_BUFFER);

        Self {
            matrix,
            db,
            config,
            portals,
            resolver,
            emoji,
            media,
            slack_to_matrix,
            matrix_to_slack: SyncMutex::new(HashMap::new()),
            sessions: Arc::new(SessionRegistry::new()),
            events_tx,
            events_rx: AsyncMutex::new(Some(events_rx)),
        }
    }

    /// Connects every known login, then runs the event dispatcher, the
    /// backfill engine, and a periodic reconnect sweep. Never returns
    /// under normal operation.
    pub async fn start(self: Arc<Self>) -> Result<()> {
        let mut rx = self
            .events_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| anyhow!("bridge already started"))?;

        for login in self.db.user_login_store().get_all_logins().await? {
            let this = self.clone();
            tokio::spawn(async move { this.connect_login(login).await });
        }

        let dispatch_self = self.clone();
        tokio::spawn(async move {
            while let Some(raw) = rx.recv().await {
                let this = dispatch_self.clone();
                tokio::spawn(async move { this.dispatch_raw_event(raw).await });
            }
        });

        let backfill = Arc::new(BackfillEngine::new(
            self.db.clone(),
            self.sessions.clone(),
            self.slack_to_matrix.clone(),
            self.emoji.clone(),
            self.config.clone(),
        ));
        tokio::spawn(async move { backfill.run().await });

        let interval_secs = self.config.bridge.presence_interval.max(30);
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
        loop {
            ticker.tick().await;
            self.reconnect_stale_sessions().await;
        }
    }

    async fn connect_login(self: &Arc<Self>, login: UserLogin) {
        let login_id = login.login_id.clone();
        let team_id = login.team_id.clone();

        let session = match Session::new(
            login_id.clone(),
            login.team_id.clone(),
            login.slack_user_id.clone(),
            login.token.clone(),
            login.cookie_token.clone(),
            self.events_tx.clone(),
        ) {
            Ok(s) => s,
            Err(e) => {
                error!("failed to build session for {}: {}", login_id, e);
                return;
            }
        };

        match session.connect().await {
            Ok(_boot) => {
                self.sessions.insert(login_id.clone(), session, team_id);
                self.persist_connection_state(&login, ConnectionState::Connected).await;
                info!("connected login {}", login_id);
            }
            Err(SessionError::InvalidAuth) => {
                warn!("login {} rejected (bad credentials)", login_id);
                self.persist_connection_state(&login, ConnectionState::BadCredentials).await;
            }
            Err(e) => {
                warn!("login {} failed to connect: {}", login_id, e);
                self.persist_connection_state(&login, ConnectionState::UnknownError).await;
            }
        }
    }

    async fn persist_connection_state(&self, login: &UserLogin, state: ConnectionState) {
        let mut updated = login.clone();
        updated.connection_state = state;
        updated.last_sync_at = Some(Utc::now());
        updated.updated_at = Utc::now();
        if let Err(e) = self.db.user_login_store().upsert_login(&updated).await {
            error!("failed to persist connection state for {}: {}", login.login_id, e);
        }
    }

    async fn reconnect_stale_sessions(self: &Arc<Self>) {
        let logins = match self.db.user_login_store().get_all_logins().await {
            Ok(logins) => logins,
            Err(e) => {
                warn!("failed to list logins during reconnect sweep: {}", e);
                return;
            }
        };

        for login in logins {
            if self.sessions.is_connected(&login.login_id) {
                continue;
            }
            if login.connection_state == ConnectionState::BadCredentials {
                continue;
            }
            let this = self.clone();
            tokio::spawn(async move { this.connect_login(login).await });
        }
    }

    async fn dispatch_raw_event(self: Arc<Self>, raw: RawRtmEvent) {
        let login_id = raw.login_id.clone();
        let team_id = match self.sessions.team_id_of(&login_id) {
            Some(id) => id,
            None => {
                debug!("dropping event for disconnected login {}", login_id);
                return;
            }
        };

        let Some(event) = pipeline::convert(&team_id, raw) else {
            return;
        };

        let portal_id = event.meta.portal_id.clone();
        let handle = self.portals.handle_for(&portal_id);
        let this = self.clone();
        let enqueue_result = handle
            .enqueue(async move {
                if let Err(e) = this.process_remote_event(&login_id, event).await {
                    warn!("error processing remote event for portal {}: {}", portal_id, e);
                }
            })
            .await;

        if let Err(e) = enqueue_result {
            warn!("failed to enqueue remote event: {}", e);
        }
    }

    async fn process_remote_event(&self, login_id: &str, event: RemoteEvent) -> Result<()> {
        match event.kind {
            RemoteEventKind::Message => self.handle_remote_message(login_id, &event).await,
            RemoteEventKind::Edit => self.handle_remote_edit(&event).await,
            RemoteEventKind::MessageRemove => self.handle_remote_message_remove(&event).await,
            RemoteEventKind::Reaction => self.handle_remote_reaction(login_id, &event, true).await,
            RemoteEventKind::ReactionRemove => self.handle_remote_reaction(login_id, &event, false).await,
            RemoteEventKind::Typing => self.handle_remote_typing(&event).await,
            RemoteEventKind::ReadReceipt => Ok(()),
            RemoteEventKind::ChatResync | RemoteEventKind::ChatInfoChange => {
                self.handle_remote_chat_resync(login_id, &event).await
            }
            RemoteEventKind::Emoji => self.handle_remote_emoji(&event).await,
        }
    }

    fn web_api_for(&self, login_id: &str) -> Result<Arc<dyn SlackWebApi>> {
        self.sessions
            .get_web_api(login_id)
            .ok_or_else(|| anyhow!("no connected session for login {}", login_id))
    }

    async fn handle_remote_message(&self, login_id: &str, event: &RemoteEvent) -> Result<()> {
        let team_id = &event.meta.team_id;
        let channel_id = &event.meta.channel_id;
        let web_api = self.web_api_for(login_id)?;
        let source = SlackInfoSourceAdapter::new(web_api.clone());

        let login = self
            .db
            .user_login_store()
            .get_login(login_id)
            .await?
            .ok_or_else(|| anyhow!("unknown login {}", login_id))?;

        let existing_portal = self.db.portal_store().get_portal(&event.meta.portal_id).await?;
        let is_new = existing_portal.is_none();

        let chat_info = match self
            .resolver
            .fetch_chat_info(team_id, channel_id, is_new, &source, &login.slack_user_id)
            .await
        {
            Ok(info) => info,
            Err(e) => {
                debug!("skipping message for {}: {}", event.meta.portal_id, e);
                return Ok(());
            }
        };

        let receiver = pipeline::derive_receiver(chat_info.room_type, login_id);
        let portal = self
            .portals
            .get_or_init_portal(team_id, channel_id, chat_info.room_type, &receiver)
            .await?;

        let owner_matrix_user_id = login.matrix_user_id.clone();
        let portal = self.portals.ensure_room(&portal, &chat_info, &owner_matrix_user_id).await?;
        let room_id = portal
            .matrix_room_id
            .clone()
            .ok_or_else(|| anyhow!("portal {} has no matrix room after ensure_room", portal.portal_id))?;

        if is_new {
            self.queue_initial_backfill(&portal, login_id).await;
        }

        let raw_sender = event
            .raw
            .get("user")
            .and_then(Value::as_str)
            .or_else(|| event.raw.get("bot_id").and_then(Value::as_str));
        let sender_ghost_id = match raw_sender {
            Some(id) => self.resolver.sync_ghost(team_id, id, &source, false).await?.ghost_id,
            None => portal.receiver.clone(),
        };

        let ts_raw = event.raw.get("ts").and_then(Value::as_str).unwrap_or_default();
        let thread_root_ts = event.raw.get("thread_ts").and_then(Value::as_str).map(String::from);

        let converted = self.slack_to_matrix.convert(team_id, channel_id, &event.raw, false).await?;
        self.commit_converted_parts(&portal, &room_id, &sender_ghost_id, ts_raw, thread_root_ts, converted)
            .await
    }

    async fn commit_converted_parts(
        &self,
        portal: &Portal,
        room_id: &str,
        sender_ghost_id: &str,
        slack_ts: &str,
        thread_root_ts: Option<String>,
        converted: ConversionResult,
    ) -> Result<()> {
        for part in converted.parts {
            let matrix_event_id = self
                .matrix
                .send_event_as_ghost(room_id, sender_ghost_id, &part.event_type, &part.content)
                .await?;

            let message = Message {
                portal_id: portal.portal_id.clone(),
                slack_timestamp: slack_ts.to_string(),
                part_id: part.part_id,
                matrix_event_id,
                matrix_room_id: room_id.to_string(),
                sender_id: sender_ghost_id.to_string(),
                thread_root_ts: thread_root_ts.clone(),
                created_at: Utc::now(),
            };
            self.db.message_store().upsert_message(&message).await?;
        }
        Ok(())
    }

    async fn handle_remote_edit(&self, event: &RemoteEvent) -> Result<()> {
        let team_id = &event.meta.team_id;
        let channel_id = &event.meta.channel_id;
        let portal_id = &event.meta.portal_id;

        let inner = event.raw.get("message").cloned().unwrap_or_else(|| event.raw.clone());
        let ts = inner
            .get("ts")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let portal = self
            .db
            .portal_store()
            .get_portal(portal_id)
            .await?
            .ok_or_else(|| anyhow!("edit for unknown portal {}", portal_id))?;
        let room_id = portal
            .matrix_room_id
            .clone()
            .ok_or_else(|| anyhow!("portal {} has no matrix room", portal_id))?;

        let existing_parts = self.db.message_store().get_message_parts(portal_id, &ts).await?;
        let sender_ghost_id = existing_parts
            .first()
            .map(|m| m.sender_id.clone())
            .or_else(|| {
                inner
                    .get("user")
                    .and_then(Value::as_str)
                    .or_else(|| inner.get("bot_id").and_then(Value::as_str))
                    .map(|id| ids::make_user_id(team_id, id))
            })
            .unwrap_or_else(|| portal.receiver.clone());

        let converted = self.slack_to_matrix.convert(team_id, channel_id, &inner, true).await?;

        for part in &converted.parts {
            let existing = existing_parts.iter().find(|m| m.part_id == part.part_id);
            match existing {
                Some(existing) if converted.modified_parts.contains(&part.part_id) => {
                    let content = apply_edit_relation(&part.content, &existing.matrix_event_id);
                    let new_event_id = self
                        .matrix
                        .send_event_as_ghost(&room_id, &sender_ghost_id, &part.event_type, &content)
                        .await?;
                    let mut updated = existing.clone();
                    updated.matrix_event_id = new_event_id;
                    self.db.message_store().upsert_message(&updated).await?;
                }
                Some(_) => {}
                None => {
                    let matrix_event_id = self
                        .matrix
                        .send_event_as_ghost(&room_id, &sender_ghost_id, &part.event_type, &part.content)
                        .await?;
                    let message = Message {
                        portal_id: portal_id.clone(),
                        slack_timestamp: ts.clone(),
                        part_id: part.part_id.clone(),
                        matrix_event_id,
                        matrix_room_id: room_id.clone(),
                        sender_id: sender_ghost_id.clone(),
                        thread_root_ts: None,
                        created_at: Utc::now(),
                    };
                    self.db.message_store().upsert_message(&message).await?;
                }
            }
        }

        for deleted_part_id in &converted.deleted_parts {
            if let Some(existing) = existing_parts.iter().find(|m| &m.part_id == deleted_part_id) {
                self.matrix.redact_message(&room_id, &existing.matrix_event_id, None).await?;
                self.db.message_store().delete_message_part(portal_id, &ts, deleted_part_id).await?;
            }
        }

        Ok(())
    }

    async fn handle_remote_message_remove(&self, event: &RemoteEvent) -> Result<()> {
        let portal_id = &event.meta.portal_id;
        let target_ts = event
            .target_id
            .as_deref()
            .and_then(|id| id.rsplit_once('-'))
            .map(|(_, ts)| ts.to_string())
            .ok_or_else(|| anyhow!("message_deleted event without a resolvable timestamp"))?;

        let portal = self
            .db
            .portal_store()
            .get_portal(portal_id)
            .await?
            .ok_or_else(|| anyhow!("delete for unknown portal {}", portal_id))?;
        let room_id = portal
            .matrix_room_id
            .clone()
            .ok_or_else(|| anyhow!("portal {} has no matrix room", portal_id))?;

        let parts = self.db.message_store().get_message_parts(portal_id, &target_ts).await?;
        for part in &parts {
            if let Err(e) = self.matrix.redact_message(&room_id, &part.matrix_event_id, None).await {
                warn!("failed to redact {}: {}", part.matrix_event_id, e);
            }
        }
        self.db.message_store().delete_message_parts(portal_id, &target_ts).await?;
        Ok(())
    }

    async fn handle_remote_reaction(&self, login_id: &str, event: &RemoteEvent, added: bool) -> Result<()> {
        let team_id = &event.meta.team_id;
        let portal_id = &event.meta.portal_id;
        let target_ts = event
            .target_id
            .as_deref()
            .and_then(|id| id.rsplit_once('-'))
            .map(|(_, ts)| ts.to_string())
            .ok_or_else(|| anyhow!("reaction event without a resolvable target timestamp"))?;
        let shortcode = event
            .raw
            .get("reaction")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("reaction event missing shortcode"))?;
        let raw_sender = event
            .raw
            .get("user")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("reaction event missing sender"))?;
        let sender_ghost_id = ids::make_user_id(team_id, raw_sender);

        let portal = self
            .db
            .portal_store()
            .get_portal(portal_id)
            .await?
            .ok_or_else(|| anyhow!("reaction for unknown portal {}", portal_id))?;
        let room_id = portal
            .matrix_room_id
            .clone()
            .ok_or_else(|| anyhow!("portal {} has no matrix room", portal_id))?;

        let parts = self.db.message_store().get_message_parts(portal_id, &target_ts).await?;
        let text_part = parts
            .iter()
            .find(|m| m.part_id.is_empty())
            .or_else(|| parts.first())
            .ok_or_else(|| anyhow!("no message rows for reaction target {}", target_ts))?;

        if added {
            let web_api = self.web_api_for(login_id)?;
            let source = SlackInfoSourceAdapter::new(web_api);
            let value = self
                .emoji
                .try_get_emoji_for_reaction(team_id, shortcode, true, &source)
                .await?;
            let key = match value {
                Some(crate::emoji::EmojiValue::Unicode(u)) => u,
                _ => self.emoji.emoji_to_matrix_plain(shortcode),
            };

            let matrix_event_id = self
                .matrix
                .send_reaction_as_ghost(&room_id, &text_part.matrix_event_id, &sender_ghost_id, &key)
                .await?;

            let reaction = Reaction {
                portal_id: portal_id.clone(),
                slack_timestamp: target_ts,
                sender_id: sender_ghost_id,
                emoji_shortcode: shortcode.to_string(),
                matrix_event_id,
                created_at: Utc::now(),
            };
            self.db.reaction_store().upsert_reaction(&reaction).await?;
        } else {
            let existing = self
                .db
                .reaction_store()
                .get_reaction(portal_id, &target_ts, &sender_ghost_id, shortcode)
                .await?;
            if let Some(existing) = existing {
                self.matrix.redact_message(&room_id, &existing.matrix_event_id, None).await?;
                self.db
                    .reaction_store()
                    .delete_reaction(portal_id, &target_ts, &sender_ghost_id, shortcode)
                    .await?;
            }
        }

        Ok(())
    }

    async fn handle_remote_typing(&self, event: &RemoteEvent) -> Result<()> {
        if self.config.bridge.disable_typing_notifications {
            return Ok(());
        }
        let portal_id = &event.meta.portal_id;
        let portal = match self.db.portal_store().get_portal(portal_id).await? {
            Some(p) => p,
            None => return Ok(()),
        };
        let room_id = match portal.matrix_room_id {
            Some(id) => id,
            None => return Ok(()),
        };
        let sender = match &event.meta.sender {
            Some(s) => s,
            None => return Ok(()),
        };
        let typing = event.raw.get("typing").and_then(Value::as_bool).unwrap_or(false);
        self.matrix.set_slack_user_typing(&room_id, sender, typing, Some(5000)).await?;
        Ok(())
    }

    async fn handle_remote_chat_resync(&self, login_id: &str, event: &RemoteEvent) -> Result<()> {
        let team_id = &event.meta.team_id;
        let channel_id = &event.meta.channel_id;
        let portal_id = &event.meta.portal_id;

        let mut portal = match self.db.portal_store().get_portal(portal_id).await? {
            Some(p) => p,
            None => return Ok(()),
        };
        let room_id = match &portal.matrix_room_id {
            Some(id) => id.clone(),
            None => return Ok(()),
        };

        let login = self
            .db
            .user_login_store()
            .get_login(login_id)
            .await?
            .ok_or_else(|| anyhow!("unknown login {}", login_id))?;
        let web_api = self.web_api_for(login_id)?;
        let source = SlackInfoSourceAdapter::new(web_api);

        let chat_info = self
            .resolver
            .fetch_chat_info(team_id, channel_id, false, &source, &login.slack_user_id)
            .await?;

        let (name, topic) = match portal.room_type {
            RoomType::Dm | RoomType::GroupDm | RoomType::Space => (chat_info.name.clone(), String::new()),
            RoomType::Channel => {
                let name = chat_info.name.clone().map(|n| {
                    crate::utils::formatting::apply_pattern_string(&self.config.channel.name_pattern, &[("name", &n)])
                });
                (name, chat_info.topic.clone())
            }
        };

        if let Some(name) = &name {
            self.matrix.set_room_name(&room_id, name).await?;
        }
        self.matrix.set_room_topic(&room_id, &topic).await?;

        portal.name = name;
        portal.topic = Some(topic);
        portal.updated_at = Utc::now();
        self.db.portal_store().upsert_portal(&portal).await?;
        Ok(())
    }

    async fn handle_remote_emoji(&self, event: &RemoteEvent) -> Result<()> {
        let team_id = &event.meta.team_id;
        let subtype = event.raw.get("subtype").and_then(Value::as_str).unwrap_or("");

        match subtype {
            "add" => {
                let names = event.raw.get("names").and_then(Value::as_array).cloned().unwrap_or_default();
                let value = event.raw.get("value").and_then(Value::as_str).unwrap_or_default();
                for name in names.iter().filter_map(Value::as_str) {
                    self.emoji.handle_add(team_id, name, value).await?;
                }
            }
            "remove" => {
                let names: Vec<String> = event
                    .raw
                    .get("names")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect();
                self.emoji.handle_remove(team_id, &names).await?;
            }
            "rename" => {
                let old_name = event.raw.get("old_name").and_then(Value::as_str).unwrap_or_default();
                let new_name = event.raw.get("new_name").and_then(Value::as_str).unwrap_or_default();
                let value = event.raw.get("value").and_then(Value::as_str).unwrap_or_default();
                self.emoji.handle_rename(team_id, old_name, new_name, value).await?;
            }
            _ => {}
        }
        Ok(())
    }

    async fn queue_initial_backfill(&self, portal: &Portal, login_id: &str) {
        let existing = self
            .db
            .backfill_store()
            .get_task(&portal.team_id, login_id, &portal.channel_id)
            .await;
        if matches!(existing, Ok(Some(_))) {
            return;
        }
        let task = crate::db::BackfillTask {
            team_id: portal.team_id.clone(),
            user_login_id: login_id.to_string(),
            channel_id: portal.channel_id.clone(),
            state: crate::db::BackfillTaskState::Pending,
            priority: 0,
            anchor_ts: None,
            forward: false,
            dispatched_at: None,
            completed_at: None,
            cooldown_until: None,
            created_at: Utc::now(),
        };
        if let Err(e) = self.db.backfill_store().upsert_task(&task).await {
            warn!("failed to queue initial backfill for {}: {}", portal.portal_id, e);
        }
    }

    // --- Matrix -> Slack ---

    fn matrix_to_slack_converter(&self, team_id: &str) -> Arc<MatrixToSlackConverter> {
        let mut cache = self.matrix_to_slack.lock();
        cache
            .entry(team_id.to_string())
            .or_insert_with(|| {
                Arc::new(MatrixToSlackConverter::new(self.db.clone(), self.media.clone(), team_id.to_string()))
            })
            .clone()
    }

    pub async fn handle_matrix_message(&self, event: &MatrixEvent) -> Result<()> {
        if self.matrix.is_namespaced_user(&event.sender) {
            return Ok(());
        }
        let portal_id = match self.portals.portal_id_for_room(&event.room_id) {
            Some(id) => id,
            None => return Ok(()),
        };
        let portal = self
            .db
            .portal_store()
            .get_portal(&portal_id)
            .await?
            .ok_or_else(|| anyhow!("portal {} vanished", portal_id))?;

        let login_id = if portal.receiver.is_empty() {
            self.sessions.any_login_for_team(&portal.team_id)
        } else {
            Some(portal.receiver.clone())
        };
        let login_id = match login_id {
            Some(id) => id,
            None => {
                debug!("no connected login can send into portal {}", portal_id);
                return Ok(());
            }
        };
        let login = self
            .db
            .user_login_store()
            .get_login(&login_id)
            .await?
            .ok_or_else(|| anyhow!("unknown login {}", login_id))?;
        let web_api = self.web_api_for(&login_id)?;

        let content = event.content.clone().unwrap_or(Value::Null);

        let edit_target = content
            .pointer("/m.relates_to/rel_type")
            .and_then(Value::as_str)
            .filter(|rt| *rt == "m.replace")
            .and_then(|_| content.pointer("/m.relates_to/event_id").and_then(Value::as_str))
            .map(|s| s.to_string());
        let edit_target = match edit_target {
            Some(event_id) => self.db.message_store().get_by_matrix_event_id(&event_id).await?,
            None => None,
        };

        let thread_root = content
            .pointer("/m.relates_to/event_id")
            .and_then(Value::as_str)
            .map(|s| s.to_string());
        let thread_root = match thread_root {
            Some(event_id) if edit_target.is_none() => {
                self.db.message_store().get_by_matrix_event_id(&event_id).await?
            }
            _ => None,
        };

        let converter = self.matrix_to_slack_converter(&portal.team_id);
        let plan = converter.convert(&content, thread_root.as_ref(), edit_target.as_ref()).await?;

        match plan {
            SlackSendPlan::Text(opts) => {
                let mut text = opts.text;
                if opts.me_message {
                    text = format!("_{text}_");
                }
                let mut body = json!({
                    "channel": portal.channel_id,
                    "text": text,
                });
                if opts.markdown_disabled {
                    body["mrkdwn"] = json!(false);
                }
                if let Some(thread_ts) = &opts.thread_ts {
                    body["thread_ts"] = json!(thread_ts);
                }
                let method = if opts.update_ts.is_some() { "chat.update" } else { "chat.postMessage" };
                if let Some(ts) = &opts.update_ts {
                    body["ts"] = json!(ts);
                }
                let resp = web_api.call(method, body).await?;
                let slack_ts = resp.get("ts").and_then(Value::as_str).unwrap_or_default();
                self.record_outbound_message(&portal, slack_ts, event.event_id.as_deref()).await?;
            }
            SlackSendPlan::File(upload) => {
                let slack_ts = self
                    .send_file_to_slack(&login.token, &portal.channel_id, &upload)
                    .await?;
                self.record_outbound_message(&portal, &slack_ts, event.event_id.as_deref()).await?;
            }
        }

        Ok(())
    }

    async fn record_outbound_message(&self, portal: &Portal, slack_ts: &str, matrix_event_id: Option<&str>) -> Result<()> {
        let message = Message {
            portal_id: portal.portal_id.clone(),
            slack_timestamp: slack_ts.to_string(),
            part_id: String::new(),
            matrix_event_id: matrix_event_id.unwrap_or_default().to_string(),
            matrix_room_id: portal.matrix_room_id.clone().unwrap_or_default(),
            sender_id: portal.receiver.clone(),
            thread_root_ts: None,
            created_at: Utc::now(),
        };
        self.db.message_store().upsert_message(&message).await?;
        Ok(())
    }

    /// Classic `files.upload` multipart POST. Bypasses the JSON-only
    /// `SlackWebApi::call` seam since multipart isn't representable there.
    async fn send_file_to_slack(
        &self,
        token: &str,
        channel_id: &str,
        upload: &crate::convert::SlackFileUpload,
    ) -> Result<String> {
        let part = multipart::Part::bytes(upload.media.data.clone())
            .file_name(upload.media.filename.clone())
            .mime_str(&upload.media.content_type)
            .unwrap_or_else(|_| multipart::Part::bytes(upload.media.data.clone()));

        let mut form = multipart::Form::new().part("file", part).text("channels", channel_id.to_string());
        if let Some(comment) = &upload.initial_comment {
            form = form.text("initial_comment", comment.clone());
        }
        if let Some(thread_ts) = &upload.thread_ts {
            form = form.text("thread_ts", thread_ts.clone());
        }

        let client = reqwest::Client::new();
        let resp: Value = client
            .post("https://slack.com/api/files.upload")
            .bearer_auth(token)
            .multipart(form)
            .send()
            .await?
            .json()
            .await?;

        if !resp.get("ok").and_then(Value::as_bool).unwrap_or(false) {
            return Err(anyhow!("files.upload failed: {:?}", resp.get("error")));
        }

        let ts = resp
            .pointer("/file/shares/public")
            .or_else(|| resp.pointer("/file/shares/private"))
            .and_then(|shares| shares.as_object())
            .and_then(|shares| shares.get(channel_id))
            .and_then(|entries| entries.as_array())
            .and_then(|entries| entries.first())
            .and_then(|entry| entry.get("ts"))
            .and_then(Value::as_str)
            .or_else(|| resp.pointer("/file/timestamp").and_then(Value::as_str))
            .ok_or_else(|| anyhow!("files.upload response had no resolvable timestamp"))?
            .to_string();

        Ok(ts)
    }

    /// Membership/power-level/name/topic forwarding from Matrix has no
    /// counterpart on the Slack side; these exist only to satisfy
    /// `MatrixEventHandler`.
    pub async fn handle_matrix_member(&self, _event: &MatrixEvent) -> Result<()> {
        Ok(())
    }

    pub async fn handle_matrix_power_levels(&self, _event: &MatrixEvent) -> Result<()> {
        Ok(())
    }

    pub async fn handle_matrix_room_name(&self, _event: &MatrixEvent) -> Result<()> {
        Ok(())
    }

    pub async fn handle_matrix_room_topic(&self, _event: &MatrixEvent) -> Result<()> {
        Ok(())
    }

    /// Drops the cached room→portal mapping after the provisioning API
    /// unbridges a room. Does not touch the Portal row itself.
    pub fn forget_portal_room(&self, matrix_room_id: &str) {
        self.portals.forget_room(matrix_room_id);
    }

    /// The bridge manages its own portal encryption via `config.bridge.encryption`;
    /// if a room gets encrypted some other way, leave rather than silently drop events.
    pub async fn handle_matrix_encryption(&self, event: &MatrixEvent) -> Result<()> {
        if self.config.bridge.encryption {
            return Ok(());
        }
        if self.portals.portal_id_for_room(&event.room_id).is_some() {
            warn!("leaving unexpectedly-encrypted room {}", event.room_id);
            self.matrix.leave_room(&event.room_id).await?;
            self.portals.forget_room(&event.room_id);
        }
        Ok(())
    }
}

/// Clones `content` into a Matrix edit relation: `m.new_content` holds
/// the replacement, `m.relates_to` points at the target, and a plain-text
/// `body` (when present) gets the conventional `"* "` prefix.
fn apply_edit_relation(content: &Value, target_event_id: &str) -> Value {
    let mut new_content = content.clone();
    let mut top = content.clone();

    if let Some(body) = top.get("body").and_then(Value::as_str) {
        top["body"] = json!(format!("* {body}"));
    }
    if let Some(obj) = new_content.as_object_mut() {
        obj.remove("m.relates_to");
    }

    top["m.new_content"] = new_content;
    top["m.relates_to"] = json!({
        "rel_type": "m.replace",
        "event_id": target_event_id,
    });
    top
}
