//! Configuration Module
//!
//! Pipeline settings loaded from environment variables.

mod settings;

pub use settings::{
    BatchSettings, ConfigError, Credentials, FanoutSettings, FeedSettings, HealthSettings,
    IngestConfig, QueueSettings, ServerSettings, WebSocketSettings,
};
