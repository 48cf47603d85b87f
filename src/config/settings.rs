use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use serde::Deserialize;

use super::duration::{self, parse_duration};

pub const DEFAULT_LISTEN: &str = "0.0.0.0:8102";
pub const DEFAULT_CLICKHOUSE_URL: &str = "http://localhost:8123/default";
pub const DEFAULT_PAGE_SIZE: usize = 1000;

/// Runtime settings of the engine.
///
/// Loaded from an optional TOML or YAML file, then overridden field by field
/// from command line flags and environment variables.
#[derive(Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// PostgreSQL URI of the internal multi-tenant store.
    pub internal_database_url: Option<String>,
    /// Shared secret expected as bearer token on admin routes.
    pub cron_secret: Option<String>,
    pub listen: SocketAddr,
    /// Connection of the reserved default ClickHouse target.
    pub default_clickhouse_url: String,
    /// Change records fetched per page.
    pub page_size: usize,
    /// Rows stamped per tracked table per sequencer pass.
    pub sequencer_batch_size: usize,
    /// Pages applied per mapping and target in one poller run.
    pub max_batches_per_mapping: Option<usize>,
    /// Targets synced in parallel.
    pub target_concurrency: usize,
    #[serde(deserialize_with = "duration::deserialize")]
    pub poll_interval: Duration,
    #[serde(deserialize_with = "duration::deserialize")]
    pub max_duration: Duration,
    /// Upper bound on syncing one target in one poller run.
    #[serde(deserialize_with = "duration::deserialize")]
    pub target_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            internal_database_url: None,
            cron_secret: None,
            listen: SocketAddr::from(([0, 0, 0, 0], 8102)),
            default_clickhouse_url: DEFAULT_CLICKHOUSE_URL.to_string(),
            page_size: DEFAULT_PAGE_SIZE,
            sequencer_batch_size: 1000,
            max_batches_per_mapping: None,
            target_concurrency: 8,
            poll_interval: Duration::from_millis(50),
            max_duration: Duration::from_secs(180),
            target_timeout: Duration::from_secs(300),
        }
    }
}

impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Settings")
            .field(
                "internal_database_url",
                &self
                    .internal_database_url
                    .as_deref()
                    .map(crate::registry::redact),
            )
            .field("cron_secret", &self.cron_secret.as_ref().map(|_| "***"))
            .field("listen", &self.listen)
            .field(
                "default_clickhouse_url",
                &crate::registry::redact(&self.default_clickhouse_url),
            )
            .field("page_size", &self.page_size)
            .field("sequencer_batch_size", &self.sequencer_batch_size)
            .field("max_batches_per_mapping", &self.max_batches_per_mapping)
            .field("target_concurrency", &self.target_concurrency)
            .field("poll_interval", &self.poll_interval)
            .field("max_duration", &self.max_duration)
            .field("target_timeout", &self.target_timeout)
            .finish()
    }
}

/// Command line and environment overrides for [`Settings`].
#[derive(Args, Clone, Debug, Default)]
pub struct SettingsArgs {
    /// Settings file (.toml, .yaml or .yml)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// PostgreSQL URI of the internal store
    #[arg(
        long,
        global = true,
        env = "EXTDB_SYNC_INTERNAL_DATABASE_URL",
        hide_env_values = true
    )]
    pub internal_database_url: Option<String>,

    /// Bearer token required by the admin routes
    #[arg(long, global = true, env = "CRON_SECRET", hide_env_values = true)]
    pub cron_secret: Option<String>,

    /// Admin server listen address
    #[arg(long, global = true, env = "EXTDB_SYNC_LISTEN")]
    pub listen: Option<SocketAddr>,

    /// Connection of the reserved default ClickHouse target
    #[arg(
        long,
        global = true,
        env = "EXTDB_SYNC_DEFAULT_CLICKHOUSE_URL",
        hide_env_values = true
    )]
    pub default_clickhouse_url: Option<String>,

    /// Change records fetched per page
    #[arg(long, global = true)]
    pub page_size: Option<usize>,

    /// Rows stamped per tracked table per sequencer pass
    #[arg(long, global = true)]
    pub sequencer_batch_size: Option<usize>,

    /// Pages applied per mapping and target in one poller run
    #[arg(long, global = true)]
    pub max_batches_per_mapping: Option<usize>,

    /// Targets synced in parallel
    #[arg(long, global = true)]
    pub target_concurrency: Option<usize>,

    /// Pause between passes of a bounded run (e.g. "50ms")
    #[arg(long, global = true)]
    pub poll_interval: Option<String>,

    /// Upper bound of a bounded run (e.g. "3m")
    #[arg(long, global = true)]
    pub max_duration: Option<String>,

    /// Upper bound on syncing one target in one poller run (e.g. "5m")
    #[arg(long, global = true)]
    pub target_timeout: Option<String>,
}

impl Settings {
    /// Read a settings file, picking the format from its extension.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file {}", path.display()))?;
        let settings = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::from_str(&content)
                .with_context(|| format!("Failed to parse TOML settings {}", path.display()))?,
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse YAML settings {}", path.display()))?,
            other => anyhow::bail!(
                "Unsupported settings file extension {:?} (expected .toml, .yaml or .yml)",
                other.unwrap_or("")
            ),
        };
        Ok(settings)
    }

    /// Build settings from an optional file plus overrides, then validate.
    pub fn load(args: &SettingsArgs) -> Result<Self> {
        let mut settings = match &args.config {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        settings.apply(args)?;
        settings.validate()?;
        Ok(settings)
    }

    fn apply(&mut self, args: &SettingsArgs) -> Result<()> {
        if let Some(url) = &args.internal_database_url {
            self.internal_database_url = Some(url.clone());
        }
        if let Some(secret) = &args.cron_secret {
            self.cron_secret = Some(secret.clone());
        }
        if let Some(listen) = args.listen {
            self.listen = listen;
        }
        if let Some(url) = &args.default_clickhouse_url {
            self.default_clickhouse_url = url.clone();
        }
        if let Some(v) = args.page_size {
            self.page_size = v;
        }
        if let Some(v) = args.sequencer_batch_size {
            self.sequencer_batch_size = v;
        }
        if let Some(v) = args.max_batches_per_mapping {
            self.max_batches_per_mapping = Some(v);
        }
        if let Some(v) = args.target_concurrency {
            self.target_concurrency = v;
        }
        if let Some(v) = &args.poll_interval {
            self.poll_interval = parse_duration(v).context("Invalid --poll-interval")?;
        }
        if let Some(v) = &args.max_duration {
            self.max_duration = parse_duration(v).context("Invalid --max-duration")?;
        }
        if let Some(v) = &args.target_timeout {
            self.target_timeout = parse_duration(v).context("Invalid --target-timeout")?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("page_size", self.page_size),
            ("sequencer_batch_size", self.sequencer_batch_size),
            ("target_concurrency", self.target_concurrency),
        ] {
            if value == 0 {
                anyhow::bail!("{name} must be positive");
            }
        }
        if self.max_batches_per_mapping == Some(0) {
            anyhow::bail!("max_batches_per_mapping must be positive when set");
        }
        if self.max_duration.is_zero() {
            anyhow::bail!("max_duration must be positive");
        }
        if self.target_timeout.is_zero() {
            anyhow::bail!("target_timeout must be positive");
        }
        clickhouse_sink::parse_connection_string(&self.default_clickhouse_url)
            .context("Invalid default_clickhouse_url")?;
        Ok(())
    }

    /// The internal store URI, required by every database-backed command.
    pub fn require_internal_database_url(&self) -> Result<&str> {
        self.internal_database_url.as_deref().context(
            "internal_database_url is not set (use --internal-database-url or EXTDB_SYNC_INTERNAL_DATABASE_URL)",
        )
    }

    pub fn require_cron_secret(&self) -> Result<&str> {
        match self.cron_secret.as_deref() {
            Some(secret) if !secret.is_empty() => Ok(secret),
            _ => anyhow::bail!("cron_secret is not set (use --cron-secret or CRON_SECRET)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(suffix: &str, content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        settings.validate().unwrap();
        assert_eq!(settings.listen.to_string(), DEFAULT_LISTEN);
        assert_eq!(settings.page_size, 1000);
        assert_eq!(settings.poll_interval, Duration::from_millis(50));
    }

    #[test]
    fn test_load_toml_with_overrides() {
        let file = write_temp(
            ".toml",
            r#"
internal_database_url = "postgres://app@localhost/stack"
page_size = 250
poll_interval = "100ms"
max_duration = 60
target_timeout = "90s"
"#,
        );
        let args = SettingsArgs {
            config: Some(file.path().to_path_buf()),
            page_size: Some(500),
            target_concurrency: Some(2),
            ..Default::default()
        };
        let settings = Settings::load(&args).unwrap();
        assert_eq!(settings.page_size, 500);
        assert_eq!(settings.target_concurrency, 2);
        assert_eq!(settings.poll_interval, Duration::from_millis(100));
        assert_eq!(settings.max_duration, Duration::from_secs(60));
        assert_eq!(settings.target_timeout, Duration::from_secs(90));
        assert_eq!(
            settings.require_internal_database_url().unwrap(),
            "postgres://app@localhost/stack"
        );
    }

    #[test]
    fn test_load_yaml() {
        let file = write_temp(
            ".yaml",
            "cron_secret: s3cret\nmax_batches_per_mapping: 4\nmax_duration: 2m\n",
        );
        let args = SettingsArgs {
            config: Some(file.path().to_path_buf()),
            ..Default::default()
        };
        let settings = Settings::load(&args).unwrap();
        assert_eq!(settings.require_cron_secret().unwrap(), "s3cret");
        assert_eq!(settings.max_batches_per_mapping, Some(4));
        assert_eq!(settings.max_duration, Duration::from_secs(120));
    }

    #[test]
    fn test_rejects_invalid_values() {
        let file = write_temp(".toml", "page_size = 0\n");
        let args = SettingsArgs {
            config: Some(file.path().to_path_buf()),
            ..Default::default()
        };
        assert!(Settings::load(&args).is_err());

        let file = write_temp(".toml", "unknown_key = 1\n");
        let args = SettingsArgs {
            config: Some(file.path().to_path_buf()),
            ..Default::default()
        };
        assert!(Settings::load(&args).is_err());

        let args = SettingsArgs {
            default_clickhouse_url: Some("ftp://example.com".to_string()),
            ..Default::default()
        };
        assert!(Settings::load(&args).is_err());
    }

    #[test]
    fn test_debug_hides_secrets() {
        let settings = Settings {
            internal_database_url: Some("postgres://app:hunter2@db/stack".to_string()),
            cron_secret: Some("topsecret".to_string()),
            ..Default::default()
        };
        let printed = format!("{settings:?}");
        assert!(!printed.contains("hunter2"));
        assert!(!printed.contains("topsecret"));
    }

    #[test]
    fn test_missing_required_values() {
        let settings = Settings::default();
        assert!(settings.require_internal_database_url().is_err());
        assert!(settings.require_cron_secret().is_err());
    }
}
