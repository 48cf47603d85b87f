//! Mapping registry: a project's named external targets.
//!
//! Project configuration stores `dbSync.externalDatabases` as a JSON object
//! of `name -> { "type": "postgres" | "clickhouse", "connectionString": ... }`.
//! Every project additionally owns the reserved [`DEFAULT_TARGET_NAME`]
//! target, a platform-managed ClickHouse database. Customer writes to the
//! reserved name are dropped at merge time, and reads always show the
//! reserved definition.

use serde_json::{Map, Value};
use sync_core::{ExternalDatabaseConfig, TargetKind};
use url::Url;

/// Name of the platform-managed target every project carries.
pub const DEFAULT_TARGET_NAME: &str = "stack-default-clickhouse";

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("externalDatabases must be a JSON object")]
    NotAnObject,

    #[error("External database '{name}' is not an object with a 'type' field")]
    Malformed { name: String },

    #[error("External database '{name}' has unsupported type '{kind}'")]
    UnsupportedKind { name: String, kind: String },

    #[error("External database '{name}' has no connectionString")]
    MissingConnection { name: String },

    #[error("External database '{name}': {source}")]
    InvalidPostgres {
        name: String,
        #[source]
        source: postgres_sink::ConnectionError,
    },

    #[error("External database '{name}': {source}")]
    InvalidClickHouse {
        name: String,
        #[source]
        source: clickhouse_sink::ConnectionError,
    },
}

impl RegistryError {
    /// Name of the offending target, if the error concerns one.
    pub fn target_name(&self) -> Option<&str> {
        match self {
            RegistryError::NotAnObject => None,
            RegistryError::Malformed { name }
            | RegistryError::UnsupportedKind { name, .. }
            | RegistryError::MissingConnection { name }
            | RegistryError::InvalidPostgres { name, .. }
            | RegistryError::InvalidClickHouse { name, .. } => Some(name),
        }
    }
}

/// Connections the platform supplies for managed targets.
#[derive(Clone)]
pub struct PlatformTargets {
    pub default_clickhouse_url: String,
}

impl std::fmt::Debug for PlatformTargets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlatformTargets")
            .field("default_clickhouse_url", &redact(&self.default_clickhouse_url))
            .finish()
    }
}

/// A validated target, ready to be handed to a connector.
#[derive(Clone, PartialEq, Eq)]
pub struct ResolvedTarget {
    pub name: String,
    pub kind: TargetKind,
    /// Secret-bearing connection descriptor. Never log it unredacted.
    pub connection: String,
    /// Platform-managed, shared by every project.
    pub managed: bool,
}

impl ResolvedTarget {
    pub fn redacted_connection(&self) -> String {
        redact(&self.connection)
    }
}

impl std::fmt::Debug for ResolvedTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedTarget")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("connection", &self.redacted_connection())
            .field("managed", &self.managed)
            .finish()
    }
}

fn reserved_value() -> Value {
    serde_json::json!({ "type": TargetKind::ClickHouse.as_str() })
}

fn as_object(config: &Value) -> Result<Map<String, Value>, RegistryError> {
    match config {
        Value::Null => Ok(Map::new()),
        Value::Object(map) => Ok(map.clone()),
        _ => Err(RegistryError::NotAnObject),
    }
}

/// Stored configuration as the project sees it: the reserved entry always
/// present and unchanged.
pub fn view(stored: &Value) -> Result<Value, RegistryError> {
    let mut map = as_object(stored)?;
    map.insert(DEFAULT_TARGET_NAME.to_string(), reserved_value());
    Ok(Value::Object(map))
}

/// Merge a partial update into the stored configuration.
///
/// Entries with a value are inserted or replaced, `null` entries are
/// removed. Entries naming the reserved target are ignored. New entries are
/// validated before they are accepted.
pub fn merge_override(base: &Value, patch: &Value) -> Result<Value, RegistryError> {
    let mut merged = as_object(base)?;
    let Value::Object(patch) = patch else {
        return Err(RegistryError::NotAnObject);
    };

    for (name, entry) in patch {
        if name == DEFAULT_TARGET_NAME {
            continue;
        }
        if entry.is_null() {
            merged.remove(name);
            continue;
        }
        let config = parse_entry(name, entry)?;
        validate(name, &config)?;
        merged.insert(name.clone(), entry.clone());
    }

    merged.insert(DEFAULT_TARGET_NAME.to_string(), reserved_value());
    Ok(Value::Object(merged))
}

fn parse_entry(name: &str, entry: &Value) -> Result<ExternalDatabaseConfig, RegistryError> {
    let kind = entry
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| RegistryError::Malformed {
            name: name.to_string(),
        })?;
    if !matches!(kind, "postgres" | "clickhouse") {
        return Err(RegistryError::UnsupportedKind {
            name: name.to_string(),
            kind: kind.to_string(),
        });
    }
    serde_json::from_value(entry.clone()).map_err(|_| RegistryError::Malformed {
        name: name.to_string(),
    })
}

fn validate(name: &str, config: &ExternalDatabaseConfig) -> Result<String, RegistryError> {
    let connection = config
        .connection_string
        .as_deref()
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| RegistryError::MissingConnection {
            name: name.to_string(),
        })?;

    match config.kind {
        TargetKind::Postgres => {
            postgres_sink::parse_connection_string(connection).map_err(|source| {
                RegistryError::InvalidPostgres {
                    name: name.to_string(),
                    source,
                }
            })?;
        }
        TargetKind::ClickHouse => {
            clickhouse_sink::parse_connection_string(connection).map_err(|source| {
                RegistryError::InvalidClickHouse {
                    name: name.to_string(),
                    source,
                }
            })?;
        }
    }
    Ok(connection.to_string())
}

/// Targets of a project, as far as its configuration could be read.
#[derive(Debug)]
pub struct Resolution {
    /// Reserved target first, then customer targets in name order.
    pub targets: Vec<Result<ResolvedTarget, RegistryError>>,
    /// Set when the customer configuration is unreadable as a whole. The
    /// reserved target is resolved regardless.
    pub config_error: Option<RegistryError>,
}

/// Resolve a project's targets. Each customer entry is validated on its
/// own, so one broken entry does not hide the others, and a broken
/// configuration never hides the reserved target.
pub fn resolve(stored: &Value, platform: &PlatformTargets) -> Resolution {
    let mut targets = vec![Ok(ResolvedTarget {
        name: DEFAULT_TARGET_NAME.to_string(),
        kind: TargetKind::ClickHouse,
        connection: platform.default_clickhouse_url.clone(),
        managed: true,
    })];

    let map = match as_object(stored) {
        Ok(map) => map,
        Err(e) => {
            return Resolution {
                targets,
                config_error: Some(e),
            }
        }
    };

    let mut names: Vec<&String> = map
        .keys()
        .filter(|name| name.as_str() != DEFAULT_TARGET_NAME)
        .collect();
    names.sort();

    for name in names {
        let resolved = parse_entry(name, &map[name.as_str()]).and_then(|config| {
            let connection = validate(name, &config)?;
            Ok(ResolvedTarget {
                name: name.clone(),
                kind: config.kind,
                connection,
                managed: false,
            })
        });
        targets.push(resolved);
    }
    Resolution {
        targets,
        config_error: None,
    }
}

/// Remove credentials from a connection descriptor.
///
/// URL descriptors lose their password; key/value descriptors lose their
/// `password=` pair.
pub fn redact(connection: &str) -> String {
    if let Ok(mut url) = Url::parse(connection) {
        if url.password().is_some() && url.set_password(Some("***")).is_ok() {
            return url.to_string();
        }
        if url.has_host() {
            return url.to_string();
        }
    }
    connection
        .split_whitespace()
        .map(|pair| {
            if pair.starts_with("password=") {
                "password=***"
            } else {
                pair
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn platform() -> PlatformTargets {
        PlatformTargets {
            default_clickhouse_url: "http://default:pw@clickhouse:8123/analytics".to_string(),
        }
    }

    #[test]
    fn test_merge_ignores_reserved_name() {
        let base = json!({});
        let patch = json!({
            DEFAULT_TARGET_NAME: { "type": "postgres", "connectionString": "postgres://evil@h/db" },
            "warehouse": { "type": "postgres", "connectionString": "postgres://u:p@db:5432/app" }
        });
        let merged = merge_override(&base, &patch).unwrap();
        assert_eq!(merged[DEFAULT_TARGET_NAME], json!({ "type": "clickhouse" }));
        assert_eq!(merged["warehouse"]["type"], "postgres");
    }

    #[test]
    fn test_merge_cannot_delete_reserved_name() {
        let base = view(&json!({})).unwrap();
        let merged = merge_override(&base, &json!({ DEFAULT_TARGET_NAME: null })).unwrap();
        assert_eq!(merged[DEFAULT_TARGET_NAME], json!({ "type": "clickhouse" }));
    }

    #[test]
    fn test_merge_null_removes_entry() {
        let base = json!({
            "a": { "type": "postgres", "connectionString": "postgres://u@h/db" },
            "b": { "type": "postgres", "connectionString": "postgres://u@h/db2" }
        });
        let merged = merge_override(&base, &json!({ "a": null })).unwrap();
        let map = merged.as_object().unwrap();
        assert!(!map.contains_key("a"));
        assert!(map.contains_key("b"));
    }

    #[test]
    fn test_merge_rejects_invalid_entries() {
        let base = json!({});
        assert!(matches!(
            merge_override(&base, &json!({ "x": { "type": "mysql", "connectionString": "mysql://h" } })),
            Err(RegistryError::UnsupportedKind { .. })
        ));
        assert!(matches!(
            merge_override(&base, &json!({ "x": { "type": "postgres" } })),
            Err(RegistryError::MissingConnection { .. })
        ));
        assert!(matches!(
            merge_override(&base, &json!({ "x": { "type": "clickhouse", "connectionString": "ftp://h" } })),
            Err(RegistryError::InvalidClickHouse { .. })
        ));
        assert!(matches!(
            merge_override(&base, &json!([1, 2])),
            Err(RegistryError::NotAnObject)
        ));
    }

    #[test]
    fn test_resolve_orders_reserved_first() {
        let stored = json!({
            "zeta": { "type": "clickhouse", "connectionString": "http://ch:8123/z" },
            "alpha": { "type": "postgres", "connectionString": "host=db user=app dbname=app" },
            DEFAULT_TARGET_NAME: { "type": "postgres", "connectionString": "postgres://x@h/db" }
        });
        let targets = resolve(&stored, &platform()).targets;
        let names: Vec<String> = targets
            .iter()
            .map(|t| t.as_ref().unwrap().name.clone())
            .collect();
        assert_eq!(names, vec![DEFAULT_TARGET_NAME, "alpha", "zeta"]);

        let reserved = targets[0].as_ref().unwrap();
        assert!(reserved.managed);
        assert_eq!(reserved.kind, TargetKind::ClickHouse);
        assert_eq!(reserved.connection, platform().default_clickhouse_url);
    }

    #[test]
    fn test_resolve_isolates_invalid_entries() {
        let stored = json!({
            "bad": { "type": "postgres", "connectionString": "not a : valid = string" },
            "good": { "type": "postgres", "connectionString": "postgres://u@db/app" }
        });
        let targets = resolve(&stored, &platform()).targets;
        assert_eq!(targets.len(), 3);
        let bad = targets[1].as_ref().unwrap_err();
        assert_eq!(bad.target_name(), Some("bad"));
        assert!(targets[2].is_ok());
    }

    #[test]
    fn test_resolve_empty_config() {
        let resolution = resolve(&Value::Null, &platform());
        assert_eq!(resolution.targets.len(), 1);
        assert!(resolution.config_error.is_none());
    }

    #[test]
    fn test_unreadable_config_keeps_reserved_target() {
        for stored in [json!("oops"), json!([1, 2]), json!(42)] {
            let resolution = resolve(&stored, &platform());
            assert!(matches!(
                resolution.config_error,
                Some(RegistryError::NotAnObject)
            ));
            assert_eq!(resolution.targets.len(), 1);
            let reserved = resolution.targets[0].as_ref().unwrap();
            assert_eq!(reserved.name, DEFAULT_TARGET_NAME);
            assert!(reserved.managed);
        }
    }

    #[test]
    fn test_redact() {
        assert_eq!(
            redact("postgres://app:hunter2@db:5432/app"),
            "postgres://app:***@db:5432/app"
        );
        assert_eq!(
            redact("host=db user=app password=hunter2 dbname=app"),
            "host=db user=app password=*** dbname=app"
        );
        assert_eq!(redact("http://ch:8123/default"), "http://ch:8123/default");
    }

    #[test]
    fn test_debug_redacts_connection() {
        let target = ResolvedTarget {
            name: "warehouse".to_string(),
            kind: TargetKind::Postgres,
            connection: "postgres://app:hunter2@db/app".to_string(),
            managed: false,
        };
        assert!(!format!("{target:?}").contains("hunter2"));
    }
}
