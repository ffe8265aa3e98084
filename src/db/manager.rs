use std::sync::Arc;

#[cfg(any(feature = "postgres", feature = "sqlite"))]
use diesel::RunQueryDsl;
#[cfg(feature = "postgres")]
use diesel::pg::PgConnection;
#[cfg(feature = "postgres")]
use diesel::r2d2::{self, ConnectionManager};

use crate::config::{DatabaseConfig as ConfigDatabaseConfig, DbType as ConfigDbType};
#[cfg(feature = "postgres")]
use crate::db::postgres::{
    PostgresBackfillStore, PostgresEmojiStore, PostgresGhostStore, PostgresMessageStore,
    PostgresPortalStore, PostgresReactionStore, PostgresUserLoginStore,
};
use crate::db::stores::{
    BackfillStore, EmojiStore, GhostStore, MessageStore, PortalStore, ReactionStore,
    UserLoginStore,
};
use crate::db::DatabaseError;

#[cfg(feature = "postgres")]
pub type Pool = r2d2::Pool<ConnectionManager<PgConnection>>;

#[cfg(feature = "sqlite")]
use diesel::Connection;
#[cfg(feature = "sqlite")]
use diesel::sqlite::SqliteConnection;

#[cfg(feature = "sqlite")]
use crate::db::sqlite::{
    SqliteBackfillStore, SqliteEmojiStore, SqliteGhostStore, SqliteMessageStore,
    SqlitePortalStore, SqliteReactionStore, SqliteUserLoginStore,
};

/// Owns the connection pool/handle and the dialect-specific store set for
/// whichever backend the config selects.
#[derive(Clone)]
pub struct DatabaseManager {
    #[cfg(feature = "postgres")]
    postgres_pool: Option<Pool>,
    #[cfg(feature = "sqlite")]
    sqlite_path: Option<String>,
    portal_store: Arc<dyn PortalStore>,
    ghost_store: Arc<dyn GhostStore>,
    user_login_store: Arc<dyn UserLoginStore>,
    message_store: Arc<dyn MessageStore>,
    reaction_store: Arc<dyn ReactionStore>,
    emoji_store: Arc<dyn EmojiStore>,
    backfill_store: Arc<dyn BackfillStore>,
    db_type: DbType,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DbType {
    Postgres,
    Sqlite,
}

impl From<ConfigDbType> for DbType {
    fn from(value: ConfigDbType) -> Self {
        match value {
            ConfigDbType::Postgres => DbType::Postgres,
            ConfigDbType::Sqlite => DbType::Sqlite,
        }
    }
}

impl DatabaseManager {
    pub async fn new(config: &ConfigDatabaseConfig) -> Result<Self, DatabaseError> {
        let db_type = DbType::from(config.db_type());

        match db_type {
            #[cfg(feature = "postgres")]
            DbType::Postgres => {
                let connection_string = config.connection_string();
                let max_connections = config.max_connections();
                let min_connections = config.min_connections();

                let manager = ConnectionManager::<PgConnection>::new(connection_string);

                let builder = r2d2::Pool::builder()
                    .max_size(max_connections.unwrap_or(10))
                    .min_idle(Some(min_connections.unwrap_or(1)));

                let pool = builder
                    .build(manager)
                    .map_err(|e| DatabaseError::Connection(e.to_string()))?;

                let portal_store = Arc::new(PostgresPortalStore::new(pool.clone()));
                let ghost_store = Arc::new(PostgresGhostStore::new(pool.clone()));
                let user_login_store = Arc::new(PostgresUserLoginStore::new(pool.clone()));
                let message_store = Arc::new(PostgresMessageStore::new(pool.clone()));
                let reaction_store = Arc::new(PostgresReactionStore::new(pool.clone()));
                let emoji_store = Arc::new(PostgresEmojiStore::new(pool.clone()));
                let backfill_store = Arc::new(PostgresBackfillStore::new(pool.clone()));

                Ok(Self {
                    postgres_pool: Some(pool),
                    #[cfg(feature = "sqlite")]
                    sqlite_path: None,
                    portal_store,
                    ghost_store,
                    user_login_store,
                    message_store,
                    reaction_store,
                    emoji_store,
                    backfill_store,
                    db_type,
                })
            }
            #[cfg(feature = "sqlite")]
            DbType::Sqlite => {
                let path = config.sqlite_path().unwrap();
                let path_arc = Arc::new(path.clone());

                let portal_store = Arc::new(SqlitePortalStore::new(path_arc.clone())?);
                let ghost_store = Arc::new(SqliteGhostStore::new(path_arc.clone())?);
                let user_login_store = Arc::new(SqliteUserLoginStore::new(path_arc.clone())?);
                let message_store = Arc::new(SqliteMessageStore::new(path_arc.clone())?);
                let reaction_store = Arc::new(SqliteReactionStore::new(path_arc.clone())?);
                let emoji_store = Arc::new(SqliteEmojiStore::new(path_arc.clone())?);
                let backfill_store = Arc::new(SqliteBackfillStore::new(path_arc)?);

                Ok(Self {
                    #[cfg(feature = "postgres")]
                    postgres_pool: None,
                    sqlite_path: Some(path),
                    portal_store,
                    ghost_store,
                    user_login_store,
                    message_store,
                    reaction_store,
                    emoji_store,
                    backfill_store,
                    db_type,
                })
            }
            #[cfg(not(feature = "postgres"))]
            DbType::Postgres => {
                return Err(DatabaseError::Connection(
                    "PostgreSQL feature not enabled".to_string(),
                ));
            }
            #[cfg(not(feature = "sqlite"))]
            DbType::Sqlite => {
                return Err(DatabaseError::Connection(
                    "SQLite feature not enabled".to_string(),
                ));
            }
        }
    }

    #[cfg(feature = "sqlite")]
    pub fn new_in_memory() -> Result<Self, DatabaseError> {
        let path_arc = Arc::new(":memory:".to_string());

        let portal_store = Arc::new(SqlitePortalStore::new(path_arc.clone())?);
        let ghost_store = Arc::new(SqliteGhostStore::new(path_arc.clone())?);
        let user_login_store = Arc::new(SqliteUserLoginStore::new(path_arc.clone())?);
        let message_store = Arc::new(SqliteMessageStore::new(path_arc.clone())?);
        let reaction_store = Arc::new(SqliteReactionStore::new(path_arc.clone())?);
        let emoji_store = Arc::new(SqliteEmojiStore::new(path_arc.clone())?);
        let backfill_store = Arc::new(SqliteBackfillStore::new(path_arc)?);

        Ok(Self {
            #[cfg(feature = "postgres")]
            postgres_pool: None,
            sqlite_path: Some(":memory:".to_string()),
            portal_store,
            ghost_store,
            user_login_store,
            message_store,
            reaction_store,
            emoji_store,
            backfill_store,
            db_type: DbType::Sqlite,
        })
    }

    pub async fn migrate(&self) -> Result<(), DatabaseError> {
        match self.db_type {
            #[cfg(feature = "postgres")]
            DbType::Postgres => {
                let pool = self.postgres_pool.as_ref().unwrap();
                return Self::migrate_postgres(pool).await;
            }
            #[cfg(feature = "sqlite")]
            DbType::Sqlite => {
                let path = self.sqlite_path.as_ref().unwrap();
                return Self::migrate_sqlite(path).await;
            }
            #[cfg(not(feature = "postgres"))]
            DbType::Postgres => {
                return Err(DatabaseError::Migration(
                    "PostgreSQL feature not enabled".to_string(),
                ));
            }
            #[cfg(not(feature = "sqlite"))]
            DbType::Sqlite => {
                return Err(DatabaseError::Migration(
                    "SQLite feature not enabled".to_string(),
                ));
            }
        }
    }

    #[cfg(feature = "postgres")]
    async fn migrate_postgres(pool: &Pool) -> Result<(), DatabaseError> {
        let pool = pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|e| DatabaseError::Connection(e.to_string()))?;

            let statements = [
                r#"
                CREATE TABLE IF NOT EXISTS teams (
                    team_id TEXT PRIMARY KEY,
                    domain TEXT NOT NULL,
                    name TEXT NOT NULL,
                    icon_url TEXT,
                    space_room_id TEXT,
                    created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
                    updated_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW()
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS user_logins (
                    login_id TEXT PRIMARY KEY,
                    matrix_user_id TEXT NOT NULL,
                    team_id TEXT NOT NULL,
                    slack_user_id TEXT NOT NULL,
                    token TEXT NOT NULL,
                    cookie_token TEXT,
                    connection_state TEXT NOT NULL DEFAULT 'disconnected',
                    last_sync_at TIMESTAMP WITH TIME ZONE,
                    created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
                    updated_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW()
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS portals (
                    portal_id TEXT PRIMARY KEY,
                    team_id TEXT NOT NULL,
                    channel_id TEXT NOT NULL,
                    matrix_room_id TEXT UNIQUE,
                    room_type TEXT NOT NULL,
                    receiver TEXT NOT NULL DEFAULT '',
                    name TEXT,
                    topic TEXT,
                    more_to_backfill BOOLEAN NOT NULL DEFAULT TRUE,
                    created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
                    updated_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW()
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS ghosts (
                    ghost_id TEXT PRIMARY KEY,
                    team_id TEXT NOT NULL,
                    slack_user_id TEXT NOT NULL,
                    name TEXT,
                    avatar_url TEXT,
                    avatar_mxc TEXT,
                    is_bot BOOLEAN NOT NULL DEFAULT FALSE,
                    remote_updated_at BIGINT,
                    last_synced_at TIMESTAMP WITH TIME ZONE,
                    created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
                    updated_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW()
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS messages (
                    portal_id TEXT NOT NULL,
                    slack_timestamp TEXT NOT NULL,
                    part_id TEXT NOT NULL DEFAULT '',
                    matrix_event_id TEXT NOT NULL,
                    matrix_room_id TEXT NOT NULL,
                    sender_id TEXT NOT NULL,
                    thread_root_ts TEXT,
                    created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
                    PRIMARY KEY (portal_id, slack_timestamp, part_id)
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS reactions (
                    portal_id TEXT NOT NULL,
                    slack_timestamp TEXT NOT NULL,
                    sender_id TEXT NOT NULL,
                    emoji_shortcode TEXT NOT NULL,
                    matrix_event_id TEXT NOT NULL,
                    created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
                    PRIMARY KEY (portal_id, slack_timestamp, sender_id, emoji_shortcode)
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS emoji (
                    team_id TEXT NOT NULL,
                    emoji_id TEXT NOT NULL,
                    value TEXT NOT NULL,
                    mxc_url TEXT,
                    created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
                    updated_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
                    PRIMARY KEY (team_id, emoji_id)
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS backfill_tasks (
                    team_id TEXT NOT NULL,
                    user_login_id TEXT NOT NULL,
                    channel_id TEXT NOT NULL,
                    state TEXT NOT NULL DEFAULT 'pending',
                    priority INTEGER NOT NULL DEFAULT 0,
                    anchor_ts TEXT,
                    forward BOOLEAN NOT NULL DEFAULT FALSE,
                    dispatched_at TIMESTAMP WITH TIME ZONE,
                    completed_at TIMESTAMP WITH TIME ZONE,
                    cooldown_until TIMESTAMP WITH TIME ZONE,
                    created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
                    PRIMARY KEY (team_id, user_login_id, channel_id)
                )
                "#,
                "CREATE INDEX IF NOT EXISTS idx_user_logins_matrix_user ON user_logins(matrix_user_id)",
                "CREATE INDEX IF NOT EXISTS idx_portals_team ON portals(team_id)",
                "CREATE INDEX IF NOT EXISTS idx_ghosts_team ON ghosts(team_id)",
                "CREATE INDEX IF NOT EXISTS idx_ghosts_last_synced ON ghosts(last_synced_at)",
                "CREATE INDEX IF NOT EXISTS idx_messages_matrix_event ON messages(matrix_event_id)",
                "CREATE INDEX IF NOT EXISTS idx_messages_thread_root ON messages(portal_id, thread_root_ts)",
                "CREATE INDEX IF NOT EXISTS idx_backfill_tasks_state ON backfill_tasks(state, priority)",
            ];

            for statement in statements {
                diesel::sql_query(statement)
                    .execute(&mut conn)
                    .map_err(|e| DatabaseError::Migration(e.to_string()))?;
            }

            Ok(())
        })
        .await
        .map_err(|e| DatabaseError::Migration(format!("migration task failed: {e}")))?
    }

    #[cfg(feature = "sqlite")]
    async fn migrate_sqlite(path: &str) -> Result<(), DatabaseError> {
        let path = path.to_string();
        tokio::task::spawn_blocking(move || {
            let mut conn = SqliteConnection::establish(&path)
                .map_err(|e| DatabaseError::Connection(e.to_string()))?;

            let statements = [
                r#"
                CREATE TABLE IF NOT EXISTS teams (
                    team_id TEXT PRIMARY KEY,
                    domain TEXT NOT NULL,
                    name TEXT NOT NULL,
                    icon_url TEXT,
                    space_room_id TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS user_logins (
                    login_id TEXT PRIMARY KEY,
                    matrix_user_id TEXT NOT NULL,
                    team_id TEXT NOT NULL,
                    slack_user_id TEXT NOT NULL,
                    token TEXT NOT NULL,
                    cookie_token TEXT,
                    connection_state TEXT NOT NULL DEFAULT 'disconnected',
                    last_sync_at TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS portals (
                    portal_id TEXT PRIMARY KEY,
                    team_id TEXT NOT NULL,
                    channel_id TEXT NOT NULL,
                    matrix_room_id TEXT UNIQUE,
                    room_type TEXT NOT NULL,
                    receiver TEXT NOT NULL DEFAULT '',
                    name TEXT,
                    topic TEXT,
                    more_to_backfill INTEGER NOT NULL DEFAULT 1,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS ghosts (
                    ghost_id TEXT PRIMARY KEY,
                    team_id TEXT NOT NULL,
                    slack_user_id TEXT NOT NULL,
                    name TEXT,
                    avatar_url TEXT,
                    avatar_mxc TEXT,
                    is_bot INTEGER NOT NULL DEFAULT 0,
                    remote_updated_at BIGINT,
                    last_synced_at TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS messages (
                    portal_id TEXT NOT NULL,
                    slack_timestamp TEXT NOT NULL,
                    part_id TEXT NOT NULL DEFAULT '',
                    matrix_event_id TEXT NOT NULL,
                    matrix_room_id TEXT NOT NULL,
                    sender_id TEXT NOT NULL,
                    thread_root_ts TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    PRIMARY KEY (portal_id, slack_timestamp, part_id)
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS reactions (
                    portal_id TEXT NOT NULL,
                    slack_timestamp TEXT NOT NULL,
                    sender_id TEXT NOT NULL,
                    emoji_shortcode TEXT NOT NULL,
                    matrix_event_id TEXT NOT NULL,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    PRIMARY KEY (portal_id, slack_timestamp, sender_id, emoji_shortcode)
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS emoji (
                    team_id TEXT NOT NULL,
                    emoji_id TEXT NOT NULL,
                    value TEXT NOT NULL,
                    mxc_url TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                    PRIMARY KEY (team_id, emoji_id)
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS backfill_tasks (
                    team_id TEXT NOT NULL,
                    user_login_id TEXT NOT NULL,
                    channel_id TEXT NOT NULL,
                    state TEXT NOT NULL DEFAULT 'pending',
                    priority INTEGER NOT NULL DEFAULT 0,
                    anchor_ts TEXT,
                    forward INTEGER NOT NULL DEFAULT 0,
                    dispatched_at TEXT,
                    completed_at TEXT,
                    cooldown_until TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    PRIMARY KEY (team_id, user_login_id, channel_id)
                )
                "#,
                "CREATE INDEX IF NOT EXISTS idx_user_logins_matrix_user ON user_logins(matrix_user_id)",
                "CREATE INDEX IF NOT EXISTS idx_portals_team ON portals(team_id)",
                "CREATE INDEX IF NOT EXISTS idx_ghosts_team ON ghosts(team_id)",
                "CREATE INDEX IF NOT EXISTS idx_ghosts_last_synced ON ghosts(last_synced_at)",
                "CREATE INDEX IF NOT EXISTS idx_messages_matrix_event ON messages(matrix_event_id)",
                "CREATE INDEX IF NOT EXISTS idx_messages_thread_root ON messages(portal_id, thread_root_ts)",
                "CREATE INDEX IF NOT EXISTS idx_backfill_tasks_state ON backfill_tasks(state, priority)",
            ];

            for statement in statements {
                diesel::sql_query(statement)
                    .execute(&mut conn)
                    .map_err(|e| DatabaseError::Migration(e.to_string()))?;
            }

            Ok(())
        })
        .await
        .map_err(|e| DatabaseError::Migration(format!("migration task failed: {e}")))?
    }

    pub fn portal_store(&self) -> Arc<dyn PortalStore> {
        self.portal_store.clone()
    }

    pub fn ghost_store(&self) -> Arc<dyn GhostStore> {
        self.ghost_store.clone()
    }

    pub fn user_login_store(&self) -> Arc<dyn UserLoginStore> {
        self.user_login_store.clone()
    }

    pub fn message_store(&self) -> Arc<dyn MessageStore> {
        self.message_store.clone()
    }

    pub fn reaction_store(&self) -> Arc<dyn ReactionStore> {
        self.reaction_store.clone()
    }

    pub fn emoji_store(&self) -> Arc<dyn EmojiStore> {
        self.emoji_store.clone()
    }

    pub fn backfill_store(&self) -> Arc<dyn BackfillStore> {
        self.backfill_store.clone()
    }

    #[cfg(feature = "postgres")]
    pub fn pool(&self) -> Option<&Pool> {
        self.postgres_pool.as_ref()
    }

    pub fn db_type(&self) -> DbType {
        self.db_type
    }
}
