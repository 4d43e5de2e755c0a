//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`VroomSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply `VROOM_*` environment variable overrides (highest priority)

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::{debug, Level};
use vroom_telemetry::LogFormat;

/// Hard cap on live connections per session unless configured otherwise.
pub const MAX_CONNECTIONS_PER_SESSION: usize = 10;
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 15_000;
pub const DEFAULT_REFRESH_INTERVAL_MS: u64 = 1_000;

/// Errors that can occur when loading or validating settings.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse settings JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid settings value: {0}")]
    InvalidValue(String),
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VroomSettings {
    pub server: ServerSettings,
    pub stream: StreamSettings,
    pub database: DatabaseSettings,
    pub auth: AuthSettings,
    pub logging: LoggingSettings,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 9092,
        }
    }
}

/// Per-connection stream tuning.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StreamSettings {
    pub max_connections_per_session: usize,
    pub heartbeat_interval_ms: u64,
    pub refresh_interval_ms: u64,
    /// Frames buffered per connection before writes apply backpressure.
    pub send_queue: usize,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            max_connections_per_session: MAX_CONNECTIONS_PER_SESSION,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            refresh_interval_ms: DEFAULT_REFRESH_INTERVAL_MS,
            send_queue: 16,
        }
    }
}

impl StreamSettings {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub path: PathBuf,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            path: vroom_home().join("database").join("vroom.db"),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AuthSettings {
    /// HS256 signing secret. Never serialized back out.
    #[serde(skip_serializing, deserialize_with = "deserialize_secret")]
    pub jwt_secret: SecretString,
    pub issuer: Option<String>,
    pub leeway_secs: u64,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            jwt_secret: SecretString::from(String::new()),
            issuer: None,
            leeway_secs: 30,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub format: LogFormat,
    /// Per-target overrides, e.g. `{"vroom_server": "debug"}`.
    pub modules: BTreeMap<String, String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: LogFormat::Json,
            modules: BTreeMap::new(),
        }
    }
}

impl LoggingSettings {
    /// Parsed base level plus per-module overrides.
    pub fn levels(&self) -> Result<(Level, Vec<(String, Level)>), SettingsError> {
        let base = parse_level("logging.level", &self.level)?;
        let modules = self
            .modules
            .iter()
            .map(|(module, level)| {
                parse_level(&format!("logging.modules.{module}"), level).map(|l| (module.clone(), l))
            })
            .collect::<Result<_, _>>()?;
        Ok((base, modules))
    }
}

fn parse_level(key: &str, value: &str) -> Result<Level, SettingsError> {
    value
        .trim()
        .parse::<Level>()
        .map_err(|_| SettingsError::InvalidValue(format!("{key}: unknown log level {value:?}")))
}

fn deserialize_secret<'de, D>(deserializer: D) -> Result<SecretString, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    Ok(SecretString::from(raw))
}

impl VroomSettings {
    /// Reject settings the server cannot run with.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.auth.jwt_secret.expose_secret().is_empty() {
            return Err(SettingsError::InvalidValue(
                "auth.jwtSecret must be set (or VROOM_JWT_SECRET)".into(),
            ));
        }
        if self.stream.max_connections_per_session == 0 {
            return Err(SettingsError::InvalidValue(
                "stream.maxConnectionsPerSession must be at least 1".into(),
            ));
        }
        if self.stream.heartbeat_interval_ms == 0 || self.stream.refresh_interval_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "stream intervals must be non-zero".into(),
            ));
        }
        if self.stream.send_queue == 0 {
            return Err(SettingsError::InvalidValue("stream.sendQueue must be at least 1".into()));
        }
        self.logging.levels()?;
        Ok(())
    }
}

/// Resolve the path to the settings file (`~/.vroom/settings.json`).
pub fn settings_path() -> PathBuf {
    vroom_home().join("settings.json")
}

fn vroom_home() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".vroom")
}

/// Load settings from a specific path with env var overrides.
///
/// If the file does not exist, returns defaults. If the file contains
/// invalid JSON, returns an error.
pub fn load_settings_from_path(path: &Path) -> Result<VroomSettings, SettingsError> {
    let defaults = serde_json::to_value(VroomSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: VroomSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
///
/// - Objects are merged recursively (source overrides target per-key)
/// - Arrays and primitives are replaced entirely by source
/// - Null values in source are skipped (preserving target)
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `VROOM_*` environment overrides from the process environment.
pub fn apply_env_overrides(settings: &mut VroomSettings) {
    apply_overrides_from(settings, |name| std::env::var(name).ok());
}

/// Apply overrides from any key lookup. Invalid or out-of-range values are
/// ignored with a warning.
pub fn apply_overrides_from<F>(settings: &mut VroomSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let string = |name: &str| lookup(name).filter(|v| !v.is_empty());
    let ranged = |name: &str, min: u64, max: u64| -> Option<u64> {
        let val = lookup(name)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid numeric env var, ignoring");
        }
        result
    };

    if let Some(v) = string("VROOM_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = ranged("VROOM_PORT", 1, 65_535) {
        settings.server.port = v as u16;
    }
    if let Some(v) = ranged("VROOM_MAX_CONNECTIONS_PER_SESSION", 1, 1_000) {
        settings.stream.max_connections_per_session = v as usize;
    }
    if let Some(v) = ranged("VROOM_HEARTBEAT_INTERVAL_MS", 100, 600_000) {
        settings.stream.heartbeat_interval_ms = v;
    }
    if let Some(v) = ranged("VROOM_REFRESH_INTERVAL_MS", 50, 600_000) {
        settings.stream.refresh_interval_ms = v;
    }
    if let Some(v) = ranged("VROOM_SEND_QUEUE", 1, 4_096) {
        settings.stream.send_queue = v as usize;
    }
    if let Some(v) = string("VROOM_DB_PATH") {
        settings.database.path = PathBuf::from(v);
    }
    if let Some(v) = string("VROOM_JWT_SECRET") {
        settings.auth.jwt_secret = SecretString::from(v);
    }
    if let Some(v) = string("VROOM_JWT_ISSUER") {
        settings.auth.issuer = Some(v);
    }
    if let Some(v) = string("VROOM_LOG_FORMAT") {
        match v.parse() {
            Ok(format) => settings.logging.format = format,
            Err(e) => tracing::warn!(key = "VROOM_LOG_FORMAT", error = %e, "ignoring"),
        }
    }
}

/// Parse a string as a `u64` within an inclusive range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn temp_settings(contents: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("vroom-settings-{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("settings.json");
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn defaults_match_stream_contract() {
        let s = VroomSettings::default();
        assert_eq!(s.stream.max_connections_per_session, 10);
        assert_eq!(s.stream.heartbeat_interval(), Duration::from_secs(15));
        assert_eq!(s.stream.refresh_interval(), Duration::from_secs(1));
    }

    #[test]
    fn merge_nested_override() {
        let target = serde_json::json!({"server": {"port": 8080, "host": "localhost"}});
        let source = serde_json::json!({"server": {"port": 9090}});
        let merged = deep_merge(target, source);
        assert_eq!(merged["server"]["port"], 9090);
        assert_eq!(merged["server"]["host"], "localhost");
    }

    #[test]
    fn merge_skips_nulls() {
        let target = serde_json::json!({"a": 1});
        let merged = deep_merge(target, serde_json::json!({"a": null}));
        assert_eq!(merged["a"], 1);
    }

    #[test]
    fn file_values_override_defaults() {
        let path = temp_settings(
            r#"{"stream": {"heartbeatIntervalMs": 500}, "auth": {"jwtSecret": "s3cret", "issuer": null}}"#,
        );
        let s = load_settings_from_path(&path).unwrap();
        assert_eq!(s.stream.heartbeat_interval_ms, 500);
        assert_eq!(s.stream.refresh_interval_ms, DEFAULT_REFRESH_INTERVAL_MS);
        assert_eq!(s.auth.jwt_secret.expose_secret(), "s3cret");
        assert!(s.auth.issuer.is_none());
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let s = load_settings_from_path(Path::new("/nonexistent/vroom/settings.json")).unwrap();
        assert_eq!(s.server.port, 9092);
    }

    #[test]
    fn invalid_json_is_an_error() {
        let path = temp_settings("{not json");
        assert!(matches!(
            load_settings_from_path(&path),
            Err(SettingsError::Json(_))
        ));
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn secret_is_never_serialized() {
        let mut s = VroomSettings::default();
        s.auth.jwt_secret = SecretString::from("sup3r-s3cret-value".to_string());
        let json = serde_json::to_string(&s).unwrap();
        assert!(!json.contains("sup3r-s3cret-value"));
        assert!(!format!("{s:?}").contains("sup3r-s3cret-value"));
    }

    #[test]
    fn env_overrides_apply_with_range_checks() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("VROOM_PORT", "7000"),
            ("VROOM_MAX_CONNECTIONS_PER_SESSION", "0"),
            ("VROOM_HEARTBEAT_INTERVAL_MS", "2000"),
            ("VROOM_JWT_SECRET", "from-env"),
            ("VROOM_LOG_FORMAT", "pretty"),
        ]);
        let mut s = VroomSettings::default();
        apply_overrides_from(&mut s, |k| env.get(k).map(|v| v.to_string()));

        assert_eq!(s.server.port, 7000);
        assert_eq!(s.stream.max_connections_per_session, 10);
        assert_eq!(s.stream.heartbeat_interval_ms, 2000);
        assert_eq!(s.auth.jwt_secret.expose_secret(), "from-env");
        assert_eq!(s.logging.format, LogFormat::Pretty);
    }

    #[test]
    fn validate_requires_secret() {
        let mut s = VroomSettings::default();
        assert!(matches!(s.validate(), Err(SettingsError::InvalidValue(_))));
        s.auth.jwt_secret = SecretString::from("x".to_string());
        assert!(s.validate().is_ok());
        s.stream.send_queue = 0;
        assert!(s.validate().is_err());
    }

    #[test]
    fn validate_rejects_unknown_log_levels() {
        let mut s = VroomSettings::default();
        s.auth.jwt_secret = SecretString::from("x".to_string());
        s.logging.level = "loud".into();
        assert!(matches!(s.validate(), Err(SettingsError::InvalidValue(_))));

        s.logging.level = "DEBUG".into();
        s.logging.modules.insert("hyper".into(), "chatty".into());
        assert!(matches!(s.validate(), Err(SettingsError::InvalidValue(_))));

        s.logging.modules.insert("hyper".into(), "warn".into());
        s.logging.modules.insert("vroom_store".into(), "trace".into());
        let (base, modules) = s.logging.levels().unwrap();
        assert_eq!(base, Level::DEBUG);
        assert_eq!(
            modules,
            vec![("hyper".to_string(), Level::WARN), ("vroom_store".to_string(), Level::TRACE)]
        );
    }

    #[test]
    fn module_levels_load_from_file() {
        let path = temp_settings(r#"{"logging": {"modules": {"vroom_server": "debug"}}}"#);
        let s = load_settings_from_path(&path).unwrap();
        assert_eq!(s.logging.modules.get("vroom_server").map(String::as_str), Some("debug"));
        assert_eq!(s.logging.level, "info");
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn range_parsing() {
        assert_eq!(parse_u64_range("15", 1, 20), Some(15));
        assert_eq!(parse_u64_range(" 15 ", 1, 20), Some(15));
        assert_eq!(parse_u64_range("25", 1, 20), None);
        assert_eq!(parse_u64_range("abc", 1, 20), None);
    }
}
