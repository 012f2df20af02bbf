mod settings;

pub use settings::{
    ConnectionConfig, EndpointConfig, LogFormat, LoggingConfig, ReconnectConfig, Settings,
    WatchConfig,
};
