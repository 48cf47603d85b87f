//! Engine configuration.

pub mod duration;
mod settings;

pub use settings::{Settings, SettingsArgs, DEFAULT_CLICKHOUSE_URL, DEFAULT_LISTEN, DEFAULT_PAGE_SIZE};
