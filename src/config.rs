pub use self::parser::{
    AuthConfig, BridgeConfig, Config, DatabaseConfig, DbType, LabelsConfig, LoggingConfig,
    MetricsConfig, RelayConfig, TargetConfig,
};
pub use self::validator::ConfigError;

mod parser;
mod validator;
