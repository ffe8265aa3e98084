pub use self::error::DatabaseError;
pub use self::manager::DatabaseManager;
pub use self::models::{
    BackfillTask, BackfillTaskState, ConnectionState, Emoji, Ghost, Message, Portal, Reaction,
    RoomType, UserLogin,
};
pub use self::stores::{
    BackfillStore, EmojiStore, GhostStore, MessageStore, PortalStore, ReactionStore,
    StoreTransaction, UserLoginStore,
};

pub mod error;
pub mod manager;
pub mod models;
#[cfg(feature = "postgres")]
pub mod schema;
pub mod stores;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "sqlite")]
pub mod schema_sqlite;
