pub use self::parser::{
    AuthConfig, BridgeConfig, ChannelConfig, ChannelDeleteOptionsConfig, Config, DatabaseConfig,
    DbType, GhostsConfig, LimitsConfig, LoggingConfig, LoggingFileConfig, MetricsConfig,
    RegistrationConfig, RoomConfig, UserActivityConfig,
};
pub use self::validator::ConfigError;

mod parser;
mod validator;
