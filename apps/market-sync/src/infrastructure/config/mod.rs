//! Configuration Module
//!
//! Configuration loading for the sync core.

mod settings;

pub use settings::{
    BusSettings, ConfigError, MonitorSettings, QueueSettings, ServerSettings, StreamingSettings,
    SyncConfig, TransportSettings,
};
