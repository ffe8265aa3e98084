use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use parking_lot::Mutex;

use super::DatabaseError;
use super::models::{
    BackfillTask, BackfillTaskState, ConnectionState, Emoji, Ghost, Message, Portal, Reaction,
    RoomType, UserLogin,
};
use super::schema_sqlite::{backfill_tasks, emoji, ghosts, messages, portals, reactions, user_logins};
use super::stores::{
    BackfillStore, EmojiStore, GhostStore, MessageStore, PortalStore, ReactionStore,
    UserLoginStore,
};

fn conn_err(e: impl std::fmt::Display) -> DatabaseError {
    DatabaseError::Connection(e.to_string())
}

fn query_err(e: impl std::fmt::Display) -> DatabaseError {
    DatabaseError::Query(e.to_string())
}

fn ts_to_str(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

fn ts_from_str(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn opt_ts_to_str(ts: Option<DateTime<Utc>>) -> Option<String> {
    ts.map(ts_to_str)
}

fn opt_ts_from_str(s: Option<String>) -> Option<DateTime<Utc>> {
    s.map(|s| ts_from_str(&s))
}

fn room_type_to_str(t: RoomType) -> &'static str {
    match t {
        RoomType::Channel => "channel",
        RoomType::Dm => "dm",
        RoomType::GroupDm => "group_dm",
        RoomType::Space => "space",
    }
}

fn room_type_from_str(s: &str) -> RoomType {
    match s {
        "dm" => RoomType::Dm,
        "group_dm" => RoomType::GroupDm,
        "space" => RoomType::Space,
        _ => RoomType::Channel,
    }
}

fn conn_state_to_str(s: ConnectionState) -> &'static str {
    match s {
        ConnectionState::Disconnected => "disconnected",
        ConnectionState::Connecting => "connecting",
        ConnectionState::Connected => "connected",
        ConnectionState::Reconnecting => "reconnecting",
        ConnectionState::BadCredentials => "bad_credentials",
        ConnectionState::UnknownError => "unknown_error",
    }
}

fn conn_state_from_str(s: &str) -> ConnectionState {
    match s {
        "connecting" => ConnectionState::Connecting,
        "connected" => ConnectionState::Connected,
        "reconnecting" => ConnectionState::Reconnecting,
        "bad_credentials" => ConnectionState::BadCredentials,
        "unknown_error" => ConnectionState::UnknownError,
        _ => ConnectionState::Disconnected,
    }
}

fn task_state_to_str(s: BackfillTaskState) -> &'static str {
    match s {
        BackfillTaskState::Pending => "pending",
        BackfillTaskState::Dispatched => "dispatched",
        BackfillTaskState::CoolingDown => "cooling_down",
        BackfillTaskState::Finished => "finished",
    }
}

fn task_state_from_str(s: &str) -> BackfillTaskState {
    match s {
        "dispatched" => BackfillTaskState::Dispatched,
        "cooling_down" => BackfillTaskState::CoolingDown,
        "finished" => BackfillTaskState::Finished,
        _ => BackfillTaskState::Pending,
    }
}

/// SQLite has no real connection pool; every store shares one connection
/// behind a mutex, matched by a single blocking-pool thread at a time.
type SharedConn = Arc<Mutex<SqliteConnection>>;

fn open(path: &str) -> Result<SharedConn, DatabaseError> {
    SqliteConnection::establish(path)
        .map(|c| Arc::new(Mutex::new(c)))
        .map_err(conn_err)
}

#[derive(Queryable, Selectable)]
#[diesel(table_name = portals)]
struct DbPortal {
    portal_id: String,
    team_id: String,
    channel_id: String,
    matrix_room_id: Option<String>,
    room_type: String,
    receiver: String,
    name: Option<String>,
    topic: Option<String>,
    more_to_backfill: bool,
    created_at: String,
    updated_at: String,
}

impl From<DbPortal> for Portal {
    fn from(v: DbPortal) -> Self {
        Portal {
            portal_id: v.portal_id,
            team_id: v.team_id,
            channel_id: v.channel_id,
            matrix_room_id: v.matrix_room_id,
            room_type: room_type_from_str(&v.room_type),
            receiver: v.receiver,
            name: v.name,
            topic: v.topic,
            more_to_backfill: v.more_to_backfill,
            created_at: ts_from_str(&v.created_at),
            updated_at: ts_from_str(&v.updated_at),
        }
    }
}

#[derive(Insertable, AsChangeset)]
#[diesel(table_name = portals)]
struct NewPortal {
    portal_id: String,
    team_id: String,
    channel_id: String,
    matrix_room_id: Option<String>,
    room_type: String,
    receiver: String,
    name: Option<String>,
    topic: Option<String>,
    more_to_backfill: bool,
    created_at: String,
    updated_at: String,
}

impl NewPortal {
    fn from_portal(p: &Portal) -> Self {
        Self {
            portal_id: p.portal_id.clone(),
            team_id: p.team_id.clone(),
            channel_id: p.channel_id.clone(),
            matrix_room_id: p.matrix_room_id.clone(),
            room_type: room_type_to_str(p.room_type).to_string(),
            receiver: p.receiver.clone(),
            name: p.name.clone(),
            topic: p.topic.clone(),
            more_to_backfill: p.more_to_backfill,
            created_at: ts_to_str(p.created_at),
            updated_at: ts_to_str(p.updated_at),
        }
    }
}

pub struct SqlitePortalStore {
    conn: SharedConn,
}

impl SqlitePortalStore {
    pub fn new(path: Arc<String>) -> Result<Self, DatabaseError> {
        Ok(Self { conn: open(&path)? })
    }
}

#[async_trait]
impl PortalStore for SqlitePortalStore {
    async fn get_portal(&self, portal_id: &str) -> Result<Option<Portal>, DatabaseError> {
        let conn = self.conn.clone();
        let portal_id = portal_id.to_string();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock();
            portals::table
                .filter(portals::portal_id.eq(&portal_id))
                .select(DbPortal::as_select())
                .first(&mut *conn)
                .optional()
                .map(|o| o.map(Portal::from))
                .map_err(query_err)
        })
        .await
        .map_err(query_err)?
    }

    async fn get_portal_by_matrix_room(
        &self,
        matrix_room_id: &str,
    ) -> Result<Option<Portal>, DatabaseError> {
        let conn = self.conn.clone();
        let matrix_room_id = matrix_room_id.to_string();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock();
            portals::table
                .filter(portals::matrix_room_id.eq(&matrix_room_id))
                .select(DbPortal::as_select())
                .first(&mut *conn)
                .optional()
                .map(|o| o.map(Portal::from))
                .map_err(query_err)
        })
        .await
        .map_err(query_err)?
    }

    async fn get_portals_by_team(&self, team_id: &str) -> Result<Vec<Portal>, DatabaseError> {
        let conn = self.conn.clone();
        let team_id = team_id.to_string();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock();
            portals::table
                .filter(portals::team_id.eq(&team_id))
                .select(DbPortal::as_select())
                .load(&mut *conn)
                .map(|rows| rows.into_iter().map(Portal::from).collect())
                .map_err(query_err)
        })
        .await
        .map_err(query_err)?
    }

    async fn upsert_portal(&self, portal: &Portal) -> Result<(), DatabaseError> {
        let conn = self.conn.clone();
        let row = NewPortal::from_portal(portal);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock();
            diesel::insert_into(portals::table)
                .values(&row)
                .on_conflict(portals::portal_id)
                .do_update()
                .set(&row)
                .execute(&mut *conn)
                .map(|_| ())
                .map_err(query_err)
        })
        .await
        .map_err(query_err)?
    }

    async fn delete_portal(&self, portal_id: &str) -> Result<(), DatabaseError> {
        let conn = self.conn.clone();
        let portal_id = portal_id.to_string();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock();
            diesel::delete(portals::table.filter(portals::portal_id.eq(&portal_id)))
                .execute(&mut *conn)
                .map(|_| ())
                .map_err(query_err)
        })
        .await
        .map_err(query_err)?
    }

    async fn count_portals(&self) -> Result<i64, DatabaseError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock();
            portals::table.count().get_result(&mut *conn).map_err(query_err)
        })
        .await
        .map_err(query_err)?
    }
}

#[derive(Queryable, Selectable)]
#[diesel(table_name = ghosts)]
struct DbGhost {
    ghost_id: String,
    team_id: String,
    slack_user_id: String,
    name: Option<String>,
    avatar_url: Option<String>,
    avatar_mxc: Option<String>,
    is_bot: bool,
    remote_updated_at: Option<i64>,
    last_synced_at: Option<String>,
    created_at: String,
    updated_at: String,
}

impl From<DbGhost> for Ghost {
    fn from(v: DbGhost) -> Self {
        Ghost {
            ghost_id: v.ghost_id,
            team_id: v.team_id,
            slack_user_id: v.slack_user_id,
            name: v.name,
            avatar_url: v.avatar_url,
            avatar_mxc: v.avatar_mxc,
            is_bot: v.is_bot,
            remote_updated_at: v.remote_updated_at,
            last_synced_at: opt_ts_from_str(v.last_synced_at),
            created_at: ts_from_str(&v.created_at),
            updated_at: ts_from_str(&v.updated_at),
        }
    }
}

#[derive(Insertable, AsChangeset)]
#[diesel(table_name = ghosts)]
struct NewGhost {
    ghost_id: String,
    team_id: String,
    slack_user_id: String,
    name: Option<String>,
    avatar_url: Option<String>,
    avatar_mxc: Option<String>,
    is_bot: bool,
    remote_updated_at: Option<i64>,
    last_synced_at: Option<String>,
    created_at: String,
    updated_at: String,
}

impl NewGhost {
    fn from_ghost(g: &Ghost) -> Self {
        Self {
            ghost_id: g.ghost_id.clone(),
            team_id: g.team_id.clone(),
            slack_user_id: g.slack_user_id.clone(),
            name: g.name.clone(),
            avatar_url: g.avatar_url.clone(),
            avatar_mxc: g.avatar_mxc.clone(),
            is_bot: g.is_bot,
            remote_updated_at: g.remote_updated_at,
            last_synced_at: opt_ts_to_str(g.last_synced_at),
            created_at: ts_to_str(g.created_at),
            updated_at: ts_to_str(g.updated_at),
        }
    }
}

pub struct SqliteGhostStore {
    conn: SharedConn,
}

impl SqliteGhostStore {
    pub fn new(path: Arc<String>) -> Result<Self, DatabaseError> {
        Ok(Self { conn: open(&path)? })
    }
}

#[async_trait]
impl GhostStore for SqliteGhostStore {
    async fn get_ghost(&self, ghost_id: &str) -> Result<Option<Ghost>, DatabaseError> {
        let conn = self.conn.clone();
        let ghost_id = ghost_id.to_string();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock();
            ghosts::table
                .filter(ghosts::ghost_id.eq(&ghost_id))
                .select(DbGhost::as_select())
                .first(&mut *conn)
                .optional()
                .map(|o| o.map(Ghost::from))
                .map_err(query_err)
        })
        .await
        .map_err(query_err)?
    }

    async fn upsert_ghost(&self, ghost: &Ghost) -> Result<(), DatabaseError> {
        let conn = self.conn.clone();
        let row = NewGhost::from_ghost(ghost);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock();
            diesel::insert_into(ghosts::table)
                .values(&row)
                .on_conflict(ghosts::ghost_id)
                .do_update()
                .set(&row)
                .execute(&mut *conn)
                .map(|_| ())
                .map_err(query_err)
        })
        .await
        .map_err(query_err)?
    }

    async fn get_ghosts_needing_sync(
        &self,
        team_id: &str,
        older_than_secs: i64,
    ) -> Result<Vec<Ghost>, DatabaseError> {
        let conn = self.conn.clone();
        let team_id = team_id.to_string();
        let cutoff = ts_to_str(Utc::now() - chrono::Duration::seconds(older_than_secs));
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock();
            ghosts::table
                .filter(ghosts::team_id.eq(&team_id))
                .filter(
                    ghosts::last_synced_at
                        .is_null()
                        .or(ghosts::last_synced_at.lt(cutoff)),
                )
                .select(DbGhost::as_select())
                .load(&mut *conn)
                .map(|rows| rows.into_iter().map(Ghost::from).collect())
                .map_err(query_err)
        })
        .await
        .map_err(query_err)?
    }
}

#[derive(Queryable, Selectable)]
#[diesel(table_name = user_logins)]
struct DbUserLogin {
    login_id: String,
    matrix_user_id: String,
    team_id: String,
    slack_user_id: String,
    token: String,
    cookie_token: Option<String>,
    connection_state: String,
    last_sync_at: Option<String>,
    created_at: String,
    updated_at: String,
}

impl From<DbUserLogin> for UserLogin {
    fn from(v: DbUserLogin) -> Self {
        UserLogin {
            login_id: v.login_id,
            matrix_user_id: v.matrix_user_id,
            team_id: v.team_id,
            slack_user_id: v.slack_user_id,
            token: v.token,
            cookie_token: v.cookie_token,
            connection_state: conn_state_from_str(&v.connection_state),
            last_sync_at: opt_ts_from_str(v.last_sync_at),
            created_at: ts_from_str(&v.created_at),
            updated_at: ts_from_str(&v.updated_at),
        }
    }
}

#[derive(Insertable, AsChangeset)]
#[diesel(table_name = user_logins)]
struct NewUserLogin {
    login_id: String,
    matrix_user_id: String,
    team_id: String,
    slack_user_id: String,
    token: String,
    cookie_token: Option<String>,
    connection_state: String,
    last_sync_at: Option<String>,
    created_at: String,
    updated_at: String,
}

impl NewUserLogin {
    fn from_login(l: &UserLogin) -> Self {
        Self {
            login_id: l.login_id.clone(),
            matrix_user_id: l.matrix_user_id.clone(),
            team_id: l.team_id.clone(),
            slack_user_id: l.slack_user_id.clone(),
            token: l.token.clone(),
            cookie_token: l.cookie_token.clone(),
            connection_state: conn_state_to_str(l.connection_state).to_string(),
            last_sync_at: opt_ts_to_str(l.last_sync_at),
            created_at: ts_to_str(l.created_at),
            updated_at: ts_to_str(l.updated_at),
        }
    }
}

pub struct SqliteUserLoginStore {
    conn: SharedConn,
}

impl SqliteUserLoginStore {
    pub fn new(path: Arc<String>) -> Result<Self, DatabaseError> {
        Ok(Self { conn: open(&path)? })
    }
}

#[async_trait]
impl UserLoginStore for SqliteUserLoginStore {
    async fn get_login(&self, login_id: &str) -> Result<Option<UserLogin>, DatabaseError> {
        let conn = self.conn.clone();
        let login_id = login_id.to_string();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock();
            user_logins::table
                .filter(user_logins::login_id.eq(&login_id))
                .select(DbUserLogin::as_select())
                .first(&mut *conn)
                .optional()
                .map(|o| o.map(UserLogin::from))
                .map_err(query_err)
        })
        .await
        .map_err(query_err)?
    }

    async fn get_logins_for_matrix_user(
        &self,
        matrix_user_id: &str,
    ) -> Result<Vec<UserLogin>, DatabaseError> {
        let conn = self.conn.clone();
        let matrix_user_id = matrix_user_id.to_string();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock();
            user_logins::table
                .filter(user_logins::matrix_user_id.eq(&matrix_user_id))
                .select(DbUserLogin::as_select())
                .load(&mut *conn)
                .map(|rows| rows.into_iter().map(UserLogin::from).collect())
                .map_err(query_err)
        })
        .await
        .map_err(query_err)?
    }

    async fn get_all_logins(&self) -> Result<Vec<UserLogin>, DatabaseError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock();
            user_logins::table
                .select(DbUserLogin::as_select())
                .load(&mut *conn)
                .map(|rows| rows.into_iter().map(UserLogin::from).collect())
                .map_err(query_err)
        })
        .await
        .map_err(query_err)?
    }

    async fn upsert_login(&self, login: &UserLogin) -> Result<(), DatabaseError> {
        let conn = self.conn.clone();
        let row = NewUserLogin::from_login(login);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock();
            diesel::insert_into(user_logins::table)
                .values(&row)
                .on_conflict(user_logins::login_id)
                .do_update()
                .set(&row)
                .execute(&mut *conn)
                .map(|_| ())
                .map_err(query_err)
        })
        .await
        .map_err(query_err)?
    }

    async fn delete_login(&self, login_id: &str) -> Result<(), DatabaseError> {
        let conn = self.conn.clone();
        let login_id = login_id.to_string();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock();
            diesel::delete(user_logins::table.filter(user_logins::login_id.eq(&login_id)))
                .execute(&mut *conn)
                .map(|_| ())
                .map_err(query_err)
        })
        .await
        .map_err(query_err)?
    }
}

#[derive(Queryable, Selectable)]
#[diesel(table_name = messages)]
struct DbMessage {
    portal_id: String,
    slack_timestamp: String,
    part_id: String,
    matrix_event_id: String,
    matrix_room_id: String,
    sender_id: String,
    thread_root_ts: Option<String>,
    created_at: String,
}

impl From<DbMessage> for Message {
    fn from(v: DbMessage) -> Self {
        Message {
            portal_id: v.portal_id,
            slack_timestamp: v.slack_timestamp,
            part_id: v.part_id,
            matrix_event_id: v.matrix_event_id,
            matrix_room_id: v.matrix_room_id,
            sender_id: v.sender_id,
            thread_root_ts: v.thread_root_ts,
            created_at: ts_from_str(&v.created_at),
        }
    }
}

#[derive(Insertable, AsChangeset)]
#[diesel(table_name = messages)]
struct NewMessage {
    portal_id: String,
    slack_timestamp: String,
    part_id: String,
    matrix_event_id: String,
    matrix_room_id: String,
    sender_id: String,
    thread_root_ts: Option<String>,
    created_at: String,
}

impl NewMessage {
    fn from_message(m: &Message) -> Self {
        Self {
            portal_id: m.portal_id.clone(),
            slack_timestamp: m.slack_timestamp.clone(),
            part_id: m.part_id.clone(),
            matrix_event_id: m.matrix_event_id.clone(),
            matrix_room_id: m.matrix_room_id.clone(),
            sender_id: m.sender_id.clone(),
            thread_root_ts: m.thread_root_ts.clone(),
            created_at: ts_to_str(m.created_at),
        }
    }
}

pub struct SqliteMessageStore {
    conn: SharedConn,
}

impl SqliteMessageStore {
    pub fn new(path: Arc<String>) -> Result<Self, DatabaseError> {
        Ok(Self { conn: open(&path)? })
    }
}

#[async_trait]
impl MessageStore for SqliteMessageStore {
    async fn get_message(
        &self,
        portal_id: &str,
        slack_timestamp: &str,
        part_id: &str,
    ) -> Result<Option<Message>, DatabaseError> {
        let conn = self.conn.clone();
        let (portal_id, slack_timestamp, part_id) = (
            portal_id.to_string(),
            slack_timestamp.to_string(),
            part_id.to_string(),
        );
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock();
            messages::table
                .filter(messages::portal_id.eq(&portal_id))
                .filter(messages::slack_timestamp.eq(&slack_timestamp))
                .filter(messages::part_id.eq(&part_id))
                .select(DbMessage::as_select())
                .first(&mut *conn)
                .optional()
                .map(|o| o.map(Message::from))
                .map_err(query_err)
        })
        .await
        .map_err(query_err)?
    }

    async fn get_message_parts(
        &self,
        portal_id: &str,
        slack_timestamp: &str,
    ) -> Result<Vec<Message>, DatabaseError> {
        let conn = self.conn.clone();
        let (portal_id, slack_timestamp) = (portal_id.to_string(), slack_timestamp.to_string());
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock();
            messages::table
                .filter(messages::portal_id.eq(&portal_id))
                .filter(messages::slack_timestamp.eq(&slack_timestamp))
                .select(DbMessage::as_select())
                .load(&mut *conn)
                .map(|rows| rows.into_iter().map(Message::from).collect())
                .map_err(query_err)
        })
        .await
        .map_err(query_err)?
    }

    async fn get_by_matrix_event_id(
        &self,
        matrix_event_id: &str,
    ) -> Result<Option<Message>, DatabaseError> {
        let conn = self.conn.clone();
        let matrix_event_id = matrix_event_id.to_string();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock();
            messages::table
                .filter(messages::matrix_event_id.eq(&matrix_event_id))
                .select(DbMessage::as_select())
                .first(&mut *conn)
                .optional()
                .map(|o| o.map(Message::from))
                .map_err(query_err)
        })
        .await
        .map_err(query_err)?
    }

    async fn upsert_message(&self, message: &Message) -> Result<(), DatabaseError> {
        let conn = self.conn.clone();
        let row = NewMessage::from_message(message);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock();
            diesel::insert_into(messages::table)
                .values(&row)
                .on_conflict((
                    messages::portal_id,
                    messages::slack_timestamp,
                    messages::part_id,
                ))
                .do_update()
                .set(&row)
                .execute(&mut *conn)
                .map(|_| ())
                .map_err(query_err)
        })
        .await
        .map_err(query_err)?
    }

    async fn delete_message_parts(
        &self,
        portal_id: &str,
        slack_timestamp: &str,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn.clone();
        let (portal_id, slack_timestamp) = (portal_id.to_string(), slack_timestamp.to_string());
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock();
            diesel::delete(
                messages::table
                    .filter(messages::portal_id.eq(&portal_id))
                    .filter(messages::slack_timestamp.eq(&slack_timestamp)),
            )
            .execute(&mut *conn)
            .map(|_| ())
            .map_err(query_err)
        })
        .await
        .map_err(query_err)?
    }

    async fn delete_message_part(
        &self,
        portal_id: &str,
        slack_timestamp: &str,
        part_id: &str,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn.clone();
        let (portal_id, slack_timestamp, part_id) = (
            portal_id.to_string(),
            slack_timestamp.to_string(),
            part_id.to_string(),
        );
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock();
            diesel::delete(
                messages::table
                    .filter(messages::portal_id.eq(&portal_id))
                    .filter(messages::slack_timestamp.eq(&slack_timestamp))
                    .filter(messages::part_id.eq(&part_id)),
            )
            .execute(&mut *conn)
            .map(|_| ())
            .map_err(query_err)
        })
        .await
        .map_err(query_err)?
    }

    async fn latest_thread_message(
        &self,
        portal_id: &str,
        thread_root_ts: &str,
    ) -> Result<Option<Message>, DatabaseError> {
        let conn = self.conn.clone();
        let (portal_id, thread_root_ts) = (portal_id.to_string(), thread_root_ts.to_string());
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock();
            messages::table
                .filter(messages::portal_id.eq(&portal_id))
                .filter(messages::thread_root_ts.eq(&thread_root_ts))
                .order(messages::slack_timestamp.desc())
                .select(DbMessage::as_select())
                .first(&mut *conn)
                .optional()
                .map(|o| o.map(Message::from))
                .map_err(query_err)
        })
        .await
        .map_err(query_err)?
    }
}

#[derive(Queryable, Selectable)]
#[diesel(table_name = reactions)]
struct DbReaction {
    portal_id: String,
    slack_timestamp: String,
    sender_id: String,
    emoji_shortcode: String,
    matrix_event_id: String,
    created_at: String,
}

impl From<DbReaction> for Reaction {
    fn from(v: DbReaction) -> Self {
        Reaction {
            portal_id: v.portal_id,
            slack_timestamp: v.slack_timestamp,
            sender_id: v.sender_id,
            emoji_shortcode: v.emoji_shortcode,
            matrix_event_id: v.matrix_event_id,
            created_at: ts_from_str(&v.created_at),
        }
    }
}

#[derive(Insertable, AsChangeset)]
#[diesel(table_name = reactions)]
struct NewReaction {
    portal_id: String,
    slack_timestamp: String,
    sender_id: String,
    emoji_shortcode: String,
    matrix_event_id: String,
    created_at: String,
}

impl NewReaction {
    fn from_reaction(r: &Reaction) -> Self {
        Self {
            portal_id: r.portal_id.clone(),
            slack_timestamp: r.slack_timestamp.clone(),
            sender_id: r.sender_id.clone(),
            emoji_shortcode: r.emoji_shortcode.clone(),
            matrix_event_id: r.matrix_event_id.clone(),
            created_at: ts_to_str(r.created_at),
        }
    }
}

pub struct SqliteReactionStore {
    conn: SharedConn,
}

impl SqliteReactionStore {
    pub fn new(path: Arc<String>) -> Result<Self, DatabaseError> {
        Ok(Self { conn: open(&path)? })
    }
}

#[async_trait]
impl ReactionStore for SqliteReactionStore {
    async fn get_reaction(
        &self,
        portal_id: &str,
        slack_timestamp: &str,
        sender_id: &str,
        shortcode: &str,
    ) -> Result<Option<Reaction>, DatabaseError> {
        let conn = self.conn.clone();
        let (portal_id, slack_timestamp, sender_id, shortcode) = (
            portal_id.to_string(),
            slack_timestamp.to_string(),
            sender_id.to_string(),
            shortcode.to_string(),
        );
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock();
            reactions::table
                .filter(reactions::portal_id.eq(&portal_id))
                .filter(reactions::slack_timestamp.eq(&slack_timestamp))
                .filter(reactions::sender_id.eq(&sender_id))
                .filter(reactions::emoji_shortcode.eq(&shortcode))
                .select(DbReaction::as_select())
                .first(&mut *conn)
                .optional()
                .map(|o| o.map(Reaction::from))
                .map_err(query_err)
        })
        .await
        .map_err(query_err)?
    }

    async fn upsert_reaction(&self, reaction: &Reaction) -> Result<(), DatabaseError> {
        let conn = self.conn.clone();
        let row = NewReaction::from_reaction(reaction);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock();
            diesel::insert_into(reactions::table)
                .values(&row)
                .on_conflict((
                    reactions::portal_id,
                    reactions::slack_timestamp,
                    reactions::sender_id,
                    reactions::emoji_shortcode,
                ))
                .do_update()
                .set(&row)
                .execute(&mut *conn)
                .map(|_| ())
                .map_err(query_err)
        })
        .await
        .map_err(query_err)?
    }

    async fn delete_reaction(
        &self,
        portal_id: &str,
        slack_timestamp: &str,
        sender_id: &str,
        shortcode: &str,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn.clone();
        let (portal_id, slack_timestamp, sender_id, shortcode) = (
            portal_id.to_string(),
            slack_timestamp.to_string(),
            sender_id.to_string(),
            shortcode.to_string(),
        );
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock();
            diesel::delete(
                reactions::table
                    .filter(reactions::portal_id.eq(&portal_id))
                    .filter(reactions::slack_timestamp.eq(&slack_timestamp))
                    .filter(reactions::sender_id.eq(&sender_id))
                    .filter(reactions::emoji_shortcode.eq(&shortcode)),
            )
            .execute(&mut *conn)
            .map(|_| ())
            .map_err(query_err)
        })
        .await
        .map_err(query_err)?
    }
}

#[derive(Queryable, Selectable)]
#[diesel(table_name = emoji)]
struct DbEmoji {
    team_id: String,
    emoji_id: String,
    value: String,
    mxc_url: Option<String>,
    created_at: String,
    updated_at: String,
}

impl From<DbEmoji> for Emoji {
    fn from(v: DbEmoji) -> Self {
        Emoji {
            team_id: v.team_id,
            emoji_id: v.emoji_id,
            value: v.value,
            mxc_url: v.mxc_url,
            created_at: ts_from_str(&v.created_at),
            updated_at: ts_from_str(&v.updated_at),
        }
    }
}

#[derive(Insertable, AsChangeset)]
#[diesel(table_name = emoji)]
struct NewEmoji {
    team_id: String,
    emoji_id: String,
    value: String,
    mxc_url: Option<String>,
    created_at: String,
    updated_at: String,
}

impl NewEmoji {
    fn from_emoji(e: &Emoji) -> Self {
        Self {
            team_id: e.team_id.clone(),
            emoji_id: e.emoji_id.clone(),
            value: e.value.clone(),
            mxc_url: e.mxc_url.clone(),
            created_at: ts_to_str(e.created_at),
            updated_at: ts_to_str(e.updated_at),
        }
    }
}

pub struct SqliteEmojiStore {
    conn: SharedConn,
}

impl SqliteEmojiStore {
    pub fn new(path: Arc<String>) -> Result<Self, DatabaseError> {
        Ok(Self { conn: open(&path)? })
    }
}

#[async_trait]
impl EmojiStore for SqliteEmojiStore {
    async fn get_emoji(&self, team_id: &str, emoji_id: &str) -> Result<Option<Emoji>, DatabaseError> {
        let conn = self.conn.clone();
        let (team_id, emoji_id) = (team_id.to_string(), emoji_id.to_string());
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock();
            emoji::table
                .filter(emoji::team_id.eq(&team_id))
                .filter(emoji::emoji_id.eq(&emoji_id))
                .select(DbEmoji::as_select())
                .first(&mut *conn)
                .optional()
                .map(|o| o.map(Emoji::from))
                .map_err(query_err)
        })
        .await
        .map_err(query_err)?
    }

    async fn count_emoji(&self, team_id: &str) -> Result<i64, DatabaseError> {
        let conn = self.conn.clone();
        let team_id = team_id.to_string();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock();
            emoji::table
                .filter(emoji::team_id.eq(&team_id))
                .count()
                .get_result(&mut *conn)
                .map_err(query_err)
        })
        .await
        .map_err(query_err)?
    }

    async fn list_emoji_ids(&self, team_id: &str) -> Result<Vec<String>, DatabaseError> {
        let conn = self.conn.clone();
        let team_id = team_id.to_string();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock();
            emoji::table
                .filter(emoji::team_id.eq(&team_id))
                .select(emoji::emoji_id)
                .load(&mut *conn)
                .map_err(query_err)
        })
        .await
        .map_err(query_err)?
    }

    async fn upsert_emoji(&self, e: &Emoji) -> Result<(), DatabaseError> {
        let conn = self.conn.clone();
        let row = NewEmoji::from_emoji(e);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock();
            diesel::insert_into(emoji::table)
                .values(&row)
                .on_conflict((emoji::team_id, emoji::emoji_id))
                .do_update()
                .set(&row)
                .execute(&mut *conn)
                .map(|_| ())
                .map_err(query_err)
        })
        .await
        .map_err(query_err)?
    }

    async fn delete_emoji(&self, team_id: &str, emoji_id: &str) -> Result<(), DatabaseError> {
        let conn = self.conn.clone();
        let (team_id, emoji_id) = (team_id.to_string(), emoji_id.to_string());
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock();
            diesel::delete(
                emoji::table
                    .filter(emoji::team_id.eq(&team_id))
                    .filter(emoji::emoji_id.eq(&emoji_id)),
            )
            .execute(&mut *conn)
            .map(|_| ())
            .map_err(query_err)
        })
        .await
        .map_err(query_err)?
    }

    async fn prune_emoji_not_in(
        &self,
        team_id: &str,
        keep_ids: &[String],
    ) -> Result<(), DatabaseError> {
        let conn = self.conn.clone();
        let team_id = team_id.to_string();
        let keep_ids = keep_ids.to_vec();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock();
            diesel::delete(
                emoji::table
                    .filter(emoji::team_id.eq(&team_id))
                    .filter(emoji::emoji_id.ne_all(&keep_ids)),
            )
            .execute(&mut *conn)
            .map(|_| ())
            .map_err(query_err)
        })
        .await
        .map_err(query_err)?
    }
}

#[derive(Queryable, Selectable)]
#[diesel(table_name = backfill_tasks)]
struct DbBackfillTask {
    team_id: String,
    user_login_id: String,
    channel_id: String,
    state: String,
    priority: i32,
    anchor_ts: Option<String>,
    forward: bool,
    dispatched_at: Option<String>,
    completed_at: Option<String>,
    cooldown_until: Option<String>,
    created_at: String,
}

impl From<DbBackfillTask> for BackfillTask {
    fn from(v: DbBackfillTask) -> Self {
        BackfillTask {
            team_id: v.team_id,
            user_login_id: v.user_login_id,
            channel_id: v.channel_id,
            state: task_state_from_str(&v.state),
            priority: v.priority,
            anchor_ts: v.anchor_ts,
            forward: v.forward,
            dispatched_at: opt_ts_from_str(v.dispatched_at),
            completed_at: opt_ts_from_str(v.completed_at),
            cooldown_until: opt_ts_from_str(v.cooldown_until),
            created_at: ts_from_str(&v.created_at),
        }
    }
}

#[derive(Insertable, AsChangeset)]
#[diesel(table_name = backfill_tasks)]
struct NewBackfillTask {
    team_id: String,
    user_login_id: String,
    channel_id: String,
    state: String,
    priority: i32,
    anchor_ts: Option<String>,
    forward: bool,
    dispatched_at: Option<String>,
    completed_at: Option<String>,
    cooldown_until: Option<String>,
    created_at: String,
}

impl NewBackfillTask {
    fn from_task(t: &BackfillTask) -> Self {
        Self {
            team_id: t.team_id.clone(),
            user_login_id: t.user_login_id.clone(),
            channel_id: t.channel_id.clone(),
            state: task_state_to_str(t.state).to_string(),
            priority: t.priority,
            anchor_ts: t.anchor_ts.clone(),
            forward: t.forward,
            dispatched_at: opt_ts_to_str(t.dispatched_at),
            completed_at: opt_ts_to_str(t.completed_at),
            cooldown_until: opt_ts_to_str(t.cooldown_until),
            created_at: ts_to_str(t.created_at),
        }
    }
}

pub struct SqliteBackfillStore {
    conn: SharedConn,
}

impl SqliteBackfillStore {
    pub fn new(path: Arc<String>) -> Result<Self, DatabaseError> {
        Ok(Self { conn: open(&path)? })
    }
}

#[async_trait]
impl BackfillStore for SqliteBackfillStore {
    async fn next_ready_task(&self) -> Result<Option<BackfillTask>, DatabaseError> {
        let conn = self.conn.clone();
        let now = ts_to_str(Utc::now());
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock();
            backfill_tasks::table
                .filter(backfill_tasks::state.eq("pending"))
                .or_filter(
                    backfill_tasks::state
                        .eq("cooling_down")
                        .and(backfill_tasks::cooldown_until.le(now)),
                )
                .order(backfill_tasks::priority.desc())
                .select(DbBackfillTask::as_select())
                .first(&mut *conn)
                .optional()
                .map(|o| o.map(BackfillTask::from))
                .map_err(query_err)
        })
        .await
        .map_err(query_err)?
    }

    async fn upsert_task(&self, task: &BackfillTask) -> Result<(), DatabaseError> {
        let conn = self.conn.clone();
        let row = NewBackfillTask::from_task(task);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock();
            diesel::insert_into(backfill_tasks::table)
                .values(&row)
                .on_conflict((
                    backfill_tasks::team_id,
                    backfill_tasks::user_login_id,
                    backfill_tasks::channel_id,
                ))
                .do_update()
                .set(&row)
                .execute(&mut *conn)
                .map(|_| ())
                .map_err(query_err)
        })
        .await
        .map_err(query_err)?
    }

    async fn get_task(
        &self,
        team_id: &str,
        user_login_id: &str,
        channel_id: &str,
    ) -> Result<Option<BackfillTask>, DatabaseError> {
        let conn = self.conn.clone();
        let (team_id, user_login_id, channel_id) = (
            team_id.to_string(),
            user_login_id.to_string(),
            channel_id.to_string(),
        );
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock();
            backfill_tasks::table
                .filter(backfill_tasks::team_id.eq(&team_id))
                .filter(backfill_tasks::user_login_id.eq(&user_login_id))
                .filter(backfill_tasks::channel_id.eq(&channel_id))
                .select(DbBackfillTask::as_select())
                .first(&mut *conn)
                .optional()
                .map(|o| o.map(BackfillTask::from))
                .map_err(query_err)
        })
        .await
        .map_err(query_err)?
    }
}
