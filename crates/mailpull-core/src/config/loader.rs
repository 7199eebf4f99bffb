//! Config loader — reads `~/.mailpull/config.json` and merges env vars.
//!
//! # Loading precedence
//! 1. Defaults (from `Config::default()`)
//! 2. JSON file at `~/.mailpull/config.json` (or `$MAILPULL_CONFIG`)
//! 3. Environment variables `MAILPULL_<SECTION>__<FIELD>` (override JSON)

use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::schema::Config;

/// Default config file path.
pub fn get_config_path() -> PathBuf {
    match std::env::var("MAILPULL_CONFIG") {
        Ok(p) if !p.is_empty() => crate::utils::expand_home(&p),
        _ => crate::utils::get_data_path().join("config.json"),
    }
}

/// Load configuration from the default path + env vars.
///
/// Falls back to `Config::default()` if the file doesn't exist or can't be parsed.
pub fn load_config(path: Option<&Path>) -> Config {
    let config_path = path
        .map(PathBuf::from)
        .unwrap_or_else(get_config_path);

    load_config_from_path(&config_path)
}

/// Load config from a specific file path.
fn load_config_from_path(path: &Path) -> Config {
    if !path.exists() {
        info!("No config file found at {}, using defaults", path.display());
        return apply_env_overrides(Config::default());
    }

    debug!("Loading config from {}", path.display());

    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            warn!("Failed to read config file {}: {}", path.display(), e);
            return apply_env_overrides(Config::default());
        }
    };

    let config: Config = match serde_json::from_str(&content) {
        Ok(c) => c,
        Err(e) => {
            warn!("Failed to parse config JSON: {}", e);
            return apply_env_overrides(Config::default());
        }
    };

    apply_env_overrides(config)
}

/// Save configuration to disk (pretty-printed JSON with camelCase keys).
pub fn save_config(config: &Config, path: Option<&Path>) -> std::io::Result<()> {
    let config_path = path
        .map(PathBuf::from)
        .unwrap_or_else(get_config_path);

    // Ensure parent directory exists
    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(config).map_err(std::io::Error::other)?;

    std::fs::write(&config_path, json)?;
    debug!("Config saved to {}", config_path.display());
    Ok(())
}

/// Apply environment variable overrides on top of a loaded config.
///
/// Env var format: `MAILPULL_<SECTION>__<FIELD>` (double underscore as delimiter).
///
/// Supported overrides:
/// - `MAILPULL_DELIVERY__BACKEND`, `__MAILBOX`, `__PATTERN`, `__OUTBOX`, `__ERRBOX`
/// - `MAILPULL_DELIVERY__SHORT_SLEEP_SECS`, `__LONG_SLEEP_SECS`
/// - `MAILPULL_IMAP__HOST`, `__PORT`, `__USERNAME`, `__PASSWORD`, `__USE_TLS`
/// - `MAILPULL_GRAPH__API_BASE`, `__ACCESS_TOKEN`
fn apply_env_overrides(mut config: Config) -> Config {
    // Delivery
    if let Ok(val) = std::env::var("MAILPULL_DELIVERY__BACKEND") {
        config.delivery.backend = val;
    }
    if let Ok(val) = std::env::var("MAILPULL_DELIVERY__MAILBOX") {
        config.delivery.mailbox = val;
    }
    if let Ok(val) = std::env::var("MAILPULL_DELIVERY__PATTERN") {
        config.delivery.pattern = val;
    }
    if let Ok(val) = std::env::var("MAILPULL_DELIVERY__OUTBOX") {
        config.delivery.outbox = val;
    }
    if let Ok(val) = std::env::var("MAILPULL_DELIVERY__ERRBOX") {
        config.delivery.errbox = val;
    }
    if let Ok(val) = std::env::var("MAILPULL_DELIVERY__SHORT_SLEEP_SECS") {
        if let Ok(n) = val.parse::<u64>() {
            config.delivery.short_sleep_secs = n;
        }
    }
    if let Ok(val) = std::env::var("MAILPULL_DELIVERY__LONG_SLEEP_SECS") {
        if let Ok(n) = val.parse::<u64>() {
            config.delivery.long_sleep_secs = n;
        }
    }

    // IMAP
    if let Ok(val) = std::env::var("MAILPULL_IMAP__HOST") {
        config.imap.host = val;
    }
    if let Ok(val) = std::env::var("MAILPULL_IMAP__PORT") {
        if let Ok(p) = val.parse::<u16>() {
            config.imap.port = p;
        }
    }
    if let Ok(val) = std::env::var("MAILPULL_IMAP__USERNAME") {
        config.imap.username = val;
    }
    if let Ok(val) = std::env::var("MAILPULL_IMAP__PASSWORD") {
        config.imap.password = val;
    }
    if let Ok(val) = std::env::var("MAILPULL_IMAP__USE_TLS") {
        config.imap.use_tls = val == "true" || val == "1";
    }

    // REST
    if let Ok(val) = std::env::var("MAILPULL_GRAPH__API_BASE") {
        config.graph.api_base = val;
    }
    if let Ok(val) = std::env::var("MAILPULL_GRAPH__ACCESS_TOKEN") {
        config.graph.access_token = val;
    }

    config
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
