use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::pg::PgConnection;
use diesel::prelude::*;

use super::DatabaseError;
use super::manager::Pool;
use super::models::{
    BackfillTask, BackfillTaskState, ConnectionState, Emoji, Ghost, Message, Portal, Reaction,
    RoomType, UserLogin,
};
use super::schema::{backfill_tasks, emoji, ghosts, messages, portals, reactions, user_logins};
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
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
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
            created_at: v.created_at,
            updated_at: v.updated_at,
        }
    }
}

#[derive(Insertable, AsChangeset)]
#[diesel(table_name = portals)]
struct NewPortal<'a> {
    portal_id: &'a str,
    team_id: &'a str,
    channel_id: &'a str,
    matrix_room_id: Option<&'a str>,
    room_type: &'a str,
    receiver: &'a str,
    name: Option<&'a str>,
    topic: Option<&'a str>,
    more_to_backfill: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

pub struct PostgresPortalStore {
    pool: Pool,
}

impl PostgresPortalStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PortalStore for PostgresPortalStore {
    async fn get_portal(&self, portal_id: &str) -> Result<Option<Portal>, DatabaseError> {
        let pool = self.pool.clone();
        let portal_id = portal_id.to_string();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().map_err(conn_err)?;
            portals::table
                .filter(portals::portal_id.eq(&portal_id))
                .select(DbPortal::as_select())
                .first(&mut conn)
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
        let pool = self.pool.clone();
        let matrix_room_id = matrix_room_id.to_string();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().map_err(conn_err)?;
            portals::table
                .filter(portals::matrix_room_id.eq(&matrix_room_id))
                .select(DbPortal::as_select())
                .first(&mut conn)
                .optional()
                .map(|o| o.map(Portal::from))
                .map_err(query_err)
        })
        .await
        .map_err(query_err)?
    }

    async fn get_portals_by_team(&self, team_id: &str) -> Result<Vec<Portal>, DatabaseError> {
        let pool = self.pool.clone();
        let team_id = team_id.to_string();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().map_err(conn_err)?;
            portals::table
                .filter(portals::team_id.eq(&team_id))
                .select(DbPortal::as_select())
                .load(&mut conn)
                .map(|rows| rows.into_iter().map(Portal::from).collect())
                .map_err(query_err)
        })
        .await
        .map_err(query_err)?
    }

    async fn upsert_portal(&self, portal: &Portal) -> Result<(), DatabaseError> {
        let pool = self.pool.clone();
        let row = NewPortal {
            portal_id: &portal.portal_id,
            team_id: &portal.team_id,
            channel_id: &portal.channel_id,
            matrix_room_id: portal.matrix_room_id.as_deref(),
            room_type: room_type_to_str(portal.room_type),
            receiver: &portal.receiver,
            name: portal.name.as_deref(),
            topic: portal.topic.as_deref(),
            more_to_backfill: portal.more_to_backfill,
            created_at: portal.created_at,
            updated_at: portal.updated_at,
        };
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().map_err(conn_err)?;
            diesel::insert_into(portals::table)
                .values(&row)
                .on_conflict(portals::portal_id)
                .do_update()
                .set(&row)
                .execute(&mut conn)
                .map(|_| ())
                .map_err(query_err)
        })
        .await
        .map_err(query_err)?
    }

    async fn delete_portal(&self, portal_id: &str) -> Result<(), DatabaseError> {
        let pool = self.pool.clone();
        let portal_id = portal_id.to_string();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().map_err(conn_err)?;
            diesel::delete(portals::table.filter(portals::portal_id.eq(&portal_id)))
                .execute(&mut conn)
                .map(|_| ())
                .map_err(query_err)
        })
        .await
        .map_err(query_err)?
    }

    async fn count_portals(&self) -> Result<i64, DatabaseError> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().map_err(conn_err)?;
            portals::table
                .count()
                .get_result(&mut conn)
                .map_err(query_err)
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
    last_synced_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
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
            last_synced_at: v.last_synced_at,
            created_at: v.created_at,
            updated_at: v.updated_at,
        }
    }
}

#[derive(Insertable, AsChangeset)]
#[diesel(table_name = ghosts)]
struct NewGhost<'a> {
    ghost_id: &'a str,
    team_id: &'a str,
    slack_user_id: &'a str,
    name: Option<&'a str>,
    avatar_url: Option<&'a str>,
    avatar_mxc: Option<&'a str>,
    is_bot: bool,
    remote_updated_at: Option<i64>,
    last_synced_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

pub struct PostgresGhostStore {
    pool: Pool,
}

impl PostgresGhostStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl GhostStore for PostgresGhostStore {
    async fn get_ghost(&self, ghost_id: &str) -> Result<Option<Ghost>, DatabaseError> {
        let pool = self.pool.clone();
        let ghost_id = ghost_id.to_string();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().map_err(conn_err)?;
            ghosts::table
                .filter(ghosts::ghost_id.eq(&ghost_id))
                .select(DbGhost::as_select())
                .first(&mut conn)
                .optional()
                .map(|o| o.map(Ghost::from))
                .map_err(query_err)
        })
        .await
        .map_err(query_err)?
    }

    async fn upsert_ghost(&self, ghost: &Ghost) -> Result<(), DatabaseError> {
        let pool = self.pool.clone();
        let row = NewGhost {
            ghost_id: &ghost.ghost_id,
            team_id: &ghost.team_id,
            slack_user_id: &ghost.slack_user_id,
            name: ghost.name.as_deref(),
            avatar_url: ghost.avatar_url.as_deref(),
            avatar_mxc: ghost.avatar_mxc.as_deref(),
            is_bot: ghost.is_bot,
            remote_updated_at: ghost.remote_updated_at,
            last_synced_at: ghost.last_synced_at,
            created_at: ghost.created_at,
            updated_at: ghost.updated_at,
        };
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().map_err(conn_err)?;
            diesel::insert_into(ghosts::table)
                .values(&row)
                .on_conflict(ghosts::ghost_id)
                .do_update()
                .set(&row)
                .execute(&mut conn)
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
        let pool = self.pool.clone();
        let team_id = team_id.to_string();
        let cutoff = Utc::now() - chrono::Duration::seconds(older_than_secs);
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().map_err(conn_err)?;
            ghosts::table
                .filter(ghosts::team_id.eq(&team_id))
                .filter(
                    ghosts::last_synced_at
                        .is_null()
                        .or(ghosts::last_synced_at.lt(cutoff)),
                )
                .select(DbGhost::as_select())
                .load(&mut conn)
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
    last_sync_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
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
            last_sync_at: v.last_sync_at,
            created_at: v.created_at,
            updated_at: v.updated_at,
        }
    }
}

#[derive(Insertable, AsChangeset)]
#[diesel(table_name = user_logins)]
struct NewUserLogin<'a> {
    login_id: &'a str,
    matrix_user_id: &'a str,
    team_id: &'a str,
    slack_user_id: &'a str,
    token: &'a str,
    cookie_token: Option<&'a str>,
    connection_state: &'a str,
    last_sync_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

pub struct PostgresUserLoginStore {
    pool: Pool,
}

impl PostgresUserLoginStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserLoginStore for PostgresUserLoginStore {
    async fn get_login(&self, login_id: &str) -> Result<Option<UserLogin>, DatabaseError> {
        let pool = self.pool.clone();
        let login_id = login_id.to_string();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().map_err(conn_err)?;
            user_logins::table
                .filter(user_logins::login_id.eq(&login_id))
                .select(DbUserLogin::as_select())
                .first(&mut conn)
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
        let pool = self.pool.clone();
        let matrix_user_id = matrix_user_id.to_string();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().map_err(conn_err)?;
            user_logins::table
                .filter(user_logins::matrix_user_id.eq(&matrix_user_id))
                .select(DbUserLogin::as_select())
                .load(&mut conn)
                .map(|rows| rows.into_iter().map(UserLogin::from).collect())
                .map_err(query_err)
        })
        .await
        .map_err(query_err)?
    }

    async fn get_all_logins(&self) -> Result<Vec<UserLogin>, DatabaseError> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().map_err(conn_err)?;
            user_logins::table
                .select(DbUserLogin::as_select())
                .load(&mut conn)
                .map(|rows| rows.into_iter().map(UserLogin::from).collect())
                .map_err(query_err)
        })
        .await
        .map_err(query_err)?
    }

    async fn upsert_login(&self, login: &UserLogin) -> Result<(), DatabaseError> {
        let pool = self.pool.clone();
        let row = NewUserLogin {
            login_id: &login.login_id,
            matrix_user_id: &login.matrix_user_id,
            team_id: &login.team_id,
            slack_user_id: &login.slack_user_id,
            token: &login.token,
            cookie_token: login.cookie_token.as_deref(),
            connection_state: conn_state_to_str(login.connection_state),
            last_sync_at: login.last_sync_at,
            created_at: login.created_at,
            updated_at: login.updated_at,
        };
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().map_err(conn_err)?;
            diesel::insert_into(user_logins::table)
                .values(&row)
                .on_conflict(user_logins::login_id)
                .do_update()
                .set(&row)
                .execute(&mut conn)
                .map(|_| ())
                .map_err(query_err)
        })
        .await
        .map_err(query_err)?
    }

    async fn delete_login(&self, login_id: &str) -> Result<(), DatabaseError> {
        let pool = self.pool.clone();
        let login_id = login_id.to_string();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().map_err(conn_err)?;
            diesel::delete(user_logins::table.filter(user_logins::login_id.eq(&login_id)))
                .execute(&mut conn)
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
    created_at: DateTime<Utc>,
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
            created_at: v.created_at,
        }
    }
}

#[derive(Insertable, AsChangeset)]
#[diesel(table_name = messages)]
struct NewMessage<'a> {
    portal_id: &'a str,
    slack_timestamp: &'a str,
    part_id: &'a str,
    matrix_event_id: &'a str,
    matrix_room_id: &'a str,
    sender_id: &'a str,
    thread_root_ts: Option<&'a str>,
    created_at: DateTime<Utc>,
}

pub struct PostgresMessageStore {
    pool: Pool,
}

impl PostgresMessageStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MessageStore for PostgresMessageStore {
    async fn get_message(
        &self,
        portal_id: &str,
        slack_timestamp: &str,
        part_id: &str,
    ) -> Result<Option<Message>, DatabaseError> {
        let pool = self.pool.clone();
        let (portal_id, slack_timestamp, part_id) = (
            portal_id.to_string(),
            slack_timestamp.to_string(),
            part_id.to_string(),
        );
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().map_err(conn_err)?;
            messages::table
                .filter(messages::portal_id.eq(&portal_id))
                .filter(messages::slack_timestamp.eq(&slack_timestamp))
                .filter(messages::part_id.eq(&part_id))
                .select(DbMessage::as_select())
                .first(&mut conn)
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
        let pool = self.pool.clone();
        let (portal_id, slack_timestamp) = (portal_id.to_string(), slack_timestamp.to_string());
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().map_err(conn_err)?;
            messages::table
                .filter(messages::portal_id.eq(&portal_id))
                .filter(messages::slack_timestamp.eq(&slack_timestamp))
                .select(DbMessage::as_select())
                .load(&mut conn)
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
        let pool = self.pool.clone();
        let matrix_event_id = matrix_event_id.to_string();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().map_err(conn_err)?;
            messages::table
                .filter(messages::matrix_event_id.eq(&matrix_event_id))
                .select(DbMessage::as_select())
                .first(&mut conn)
                .optional()
                .map(|o| o.map(Message::from))
                .map_err(query_err)
        })
        .await
        .map_err(query_err)?
    }

    async fn upsert_message(&self, message: &Message) -> Result<(), DatabaseError> {
        let pool = self.pool.clone();
        let row = NewMessage {
            portal_id: &message.portal_id,
            slack_timestamp: &message.slack_timestamp,
            part_id: &message.part_id,
            matrix_event_id: &message.matrix_event_id,
            matrix_room_id: &message.matrix_room_id,
            sender_id: &message.sender_id,
            thread_root_ts: message.thread_root_ts.as_deref(),
            created_at: message.created_at,
        };
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().map_err(conn_err)?;
            diesel::insert_into(messages::table)
                .values(&row)
                .on_conflict((
                    messages::portal_id,
                    messages::slack_timestamp,
                    messages::part_id,
                ))
                .do_update()
                .set(&row)
                .execute(&mut conn)
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
        let pool = self.pool.clone();
        let (portal_id, slack_timestamp) = (portal_id.to_string(), slack_timestamp.to_string());
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().map_err(conn_err)?;
            diesel::delete(
                messages::table
                    .filter(messages::portal_id.eq(&portal_id))
                    .filter(messages::slack_timestamp.eq(&slack_timestamp)),
            )
            .execute(&mut conn)
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
        let pool = self.pool.clone();
        let (portal_id, slack_timestamp, part_id) = (
            portal_id.to_string(),
            slack_timestamp.to_string(),
            part_id.to_string(),
        );
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().map_err(conn_err)?;
            diesel::delete(
                messages::table
                    .filter(messages::portal_id.eq(&portal_id))
                    .filter(messages::slack_timestamp.eq(&slack_timestamp))
                    .filter(messages::part_id.eq(&part_id)),
            )
            .execute(&mut conn)
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
        let pool = self.pool.clone();
        let (portal_id, thread_root_ts) = (portal_id.to_string(), thread_root_ts.to_string());
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().map_err(conn_err)?;
            messages::table
                .filter(messages::portal_id.eq(&portal_id))
                .filter(messages::thread_root_ts.eq(&thread_root_ts))
                .order(messages::slack_timestamp.desc())
                .select(DbMessage::as_select())
                .first(&mut conn)
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
    created_at: DateTime<Utc>,
}

impl From<DbReaction> for Reaction {
    fn from(v: DbReaction) -> Self {
        Reaction {
            portal_id: v.portal_id,
            slack_timestamp: v.slack_timestamp,
            sender_id: v.sender_id,
            emoji_shortcode: v.emoji_shortcode,
            matrix_event_id: v.matrix_event_id,
            created_at: v.created_at,
        }
    }
}

#[derive(Insertable, AsChangeset)]
#[diesel(table_name = reactions)]
struct NewReaction<'a> {
    portal_id: &'a str,
    slack_timestamp: &'a str,
    sender_id: &'a str,
    emoji_shortcode: &'a str,
    matrix_event_id: &'a str,
    created_at: DateTime<Utc>,
}

pub struct PostgresReactionStore {
    pool: Pool,
}

impl PostgresReactionStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ReactionStore for PostgresReactionStore {
    async fn get_reaction(
        &self,
        portal_id: &str,
        slack_timestamp: &str,
        sender_id: &str,
        shortcode: &str,
    ) -> Result<Option<Reaction>, DatabaseError> {
        let pool = self.pool.clone();
        let (portal_id, slack_timestamp, sender_id, shortcode) = (
            portal_id.to_string(),
            slack_timestamp.to_string(),
            sender_id.to_string(),
            shortcode.to_string(),
        );
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().map_err(conn_err)?;
            reactions::table
                .filter(reactions::portal_id.eq(&portal_id))
                .filter(reactions::slack_timestamp.eq(&slack_timestamp))
                .filter(reactions::sender_id.eq(&sender_id))
                .filter(reactions::emoji_shortcode.eq(&shortcode))
                .select(DbReaction::as_select())
                .first(&mut conn)
                .optional()
                .map(|o| o.map(Reaction::from))
                .map_err(query_err)
        })
        .await
        .map_err(query_err)?
    }

    async fn upsert_reaction(&self, reaction: &Reaction) -> Result<(), DatabaseError> {
        let pool = self.pool.clone();
        let row = NewReaction {
            portal_id: &reaction.portal_id,
            slack_timestamp: &reaction.slack_timestamp,
            sender_id: &reaction.sender_id,
            emoji_shortcode: &reaction.emoji_shortcode,
            matrix_event_id: &reaction.matrix_event_id,
            created_at: reaction.created_at,
        };
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().map_err(conn_err)?;
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
                .execute(&mut conn)
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
        let pool = self.pool.clone();
        let (portal_id, slack_timestamp, sender_id, shortcode) = (
            portal_id.to_string(),
            slack_timestamp.to_string(),
            sender_id.to_string(),
            shortcode.to_string(),
        );
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().map_err(conn_err)?;
            diesel::delete(
                reactions::table
                    .filter(reactions::portal_id.eq(&portal_id))
                    .filter(reactions::slack_timestamp.eq(&slack_timestamp))
                    .filter(reactions::sender_id.eq(&sender_id))
                    .filter(reactions::emoji_shortcode.eq(&shortcode)),
            )
            .execute(&mut conn)
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
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<DbEmoji> for Emoji {
    fn from(v: DbEmoji) -> Self {
        Emoji {
            team_id: v.team_id,
            emoji_id: v.emoji_id,
            value: v.value,
            mxc_url: v.mxc_url,
            created_at: v.created_at,
            updated_at: v.updated_at,
        }
    }
}

#[derive(Insertable, AsChangeset)]
#[diesel(table_name = emoji)]
struct NewEmoji<'a> {
    team_id: &'a str,
    emoji_id: &'a str,
    value: &'a str,
    mxc_url: Option<&'a str>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

pub struct PostgresEmojiStore {
    pool: Pool,
}

impl PostgresEmojiStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EmojiStore for PostgresEmojiStore {
    async fn get_emoji(&self, team_id: &str, emoji_id: &str) -> Result<Option<Emoji>, DatabaseError> {
        let pool = self.pool.clone();
        let (team_id, emoji_id) = (team_id.to_string(), emoji_id.to_string());
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().map_err(conn_err)?;
            emoji::table
                .filter(emoji::team_id.eq(&team_id))
                .filter(emoji::emoji_id.eq(&emoji_id))
                .select(DbEmoji::as_select())
                .first(&mut conn)
                .optional()
                .map(|o| o.map(Emoji::from))
                .map_err(query_err)
        })
        .await
        .map_err(query_err)?
    }

    async fn count_emoji(&self, team_id: &str) -> Result<i64, DatabaseError> {
        let pool = self.pool.clone();
        let team_id = team_id.to_string();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().map_err(conn_err)?;
            emoji::table
                .filter(emoji::team_id.eq(&team_id))
                .count()
                .get_result(&mut conn)
                .map_err(query_err)
        })
        .await
        .map_err(query_err)?
    }

    async fn list_emoji_ids(&self, team_id: &str) -> Result<Vec<String>, DatabaseError> {
        let pool = self.pool.clone();
        let team_id = team_id.to_string();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().map_err(conn_err)?;
            emoji::table
                .filter(emoji::team_id.eq(&team_id))
                .select(emoji::emoji_id)
                .load(&mut conn)
                .map_err(query_err)
        })
        .await
        .map_err(query_err)?
    }

    async fn upsert_emoji(&self, e: &Emoji) -> Result<(), DatabaseError> {
        let pool = self.pool.clone();
        let row = NewEmoji {
            team_id: &e.team_id,
            emoji_id: &e.emoji_id,
            value: &e.value,
            mxc_url: e.mxc_url.as_deref(),
            created_at: e.created_at,
            updated_at: e.updated_at,
        };
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().map_err(conn_err)?;
            diesel::insert_into(emoji::table)
                .values(&row)
                .on_conflict((emoji::team_id, emoji::emoji_id))
                .do_update()
                .set(&row)
                .execute(&mut conn)
                .map(|_| ())
                .map_err(query_err)
        })
        .await
        .map_err(query_err)?
    }

    async fn delete_emoji(&self, team_id: &str, emoji_id: &str) -> Result<(), DatabaseError> {
        let pool = self.pool.clone();
        let (team_id, emoji_id) = (team_id.to_string(), emoji_id.to_string());
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().map_err(conn_err)?;
            diesel::delete(
                emoji::table
                    .filter(emoji::team_id.eq(&team_id))
                    .filter(emoji::emoji_id.eq(&emoji_id)),
            )
            .execute(&mut conn)
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
        let pool = self.pool.clone();
        let team_id = team_id.to_string();
        let keep_ids = keep_ids.to_vec();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().map_err(conn_err)?;
            diesel::delete(
                emoji::table
                    .filter(emoji::team_id.eq(&team_id))
                    .filter(emoji::emoji_id.ne_all(&keep_ids)),
            )
            .execute(&mut conn)
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
    dispatched_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    cooldown_until: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
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
            dispatched_at: v.dispatched_at,
            completed_at: v.completed_at,
            cooldown_until: v.cooldown_until,
            created_at: v.created_at,
        }
    }
}

#[derive(Insertable, AsChangeset)]
#[diesel(table_name = backfill_tasks)]
struct NewBackfillTask<'a> {
    team_id: &'a str,
    user_login_id: &'a str,
    channel_id: &'a str,
    state: &'a str,
    priority: i32,
    anchor_ts: Option<&'a str>,
    forward: bool,
    dispatched_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    cooldown_until: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

pub struct PostgresBackfillStore {
    pool: Pool,
}

impl PostgresBackfillStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BackfillStore for PostgresBackfillStore {
    async fn next_ready_task(&self) -> Result<Option<BackfillTask>, DatabaseError> {
        let pool = self.pool.clone();
        let now = Utc::now();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().map_err(conn_err)?;
            backfill_tasks::table
                .filter(backfill_tasks::state.eq("pending"))
                .or_filter(
                    backfill_tasks::state
                        .eq("cooling_down")
                        .and(backfill_tasks::cooldown_until.le(now)),
                )
                .order(backfill_tasks::priority.desc())
                .select(DbBackfillTask::as_select())
                .first(&mut conn)
                .optional()
                .map(|o| o.map(BackfillTask::from))
                .map_err(query_err)
        })
        .await
        .map_err(query_err)?
    }

    async fn upsert_task(&self, task: &BackfillTask) -> Result<(), DatabaseError> {
        let pool = self.pool.clone();
        let row = NewBackfillTask {
            team_id: &task.team_id,
            user_login_id: &task.user_login_id,
            channel_id: &task.channel_id,
            state: task_state_to_str(task.state),
            priority: task.priority,
            anchor_ts: task.anchor_ts.as_deref(),
            forward: task.forward,
            dispatched_at: task.dispatched_at,
            completed_at: task.completed_at,
            cooldown_until: task.cooldown_until,
            created_at: task.created_at,
        };
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().map_err(conn_err)?;
            diesel::insert_into(backfill_tasks::table)
                .values(&row)
                .on_conflict((
                    backfill_tasks::team_id,
                    backfill_tasks::user_login_id,
                    backfill_tasks::channel_id,
                ))
                .do_update()
                .set(&row)
                .execute(&mut conn)
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
        let pool = self.pool.clone();
        let (team_id, user_login_id, channel_id) = (
            team_id.to_string(),
            user_login_id.to_string(),
            channel_id.to_string(),
        );
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().map_err(conn_err)?;
            backfill_tasks::table
                .filter(backfill_tasks::team_id.eq(&team_id))
                .filter(backfill_tasks::user_login_id.eq(&user_login_id))
                .filter(backfill_tasks::channel_id.eq(&channel_id))
                .select(DbBackfillTask::as_select())
                .first(&mut conn)
                .optional()
                .map(|o| o.map(BackfillTask::from))
                .map_err(query_err)
        })
        .await
        .map_err(query_err)?
    }
}

#[allow(dead_code)]
fn _unused_conn_type_anchor(_: &PgConnection) {}
