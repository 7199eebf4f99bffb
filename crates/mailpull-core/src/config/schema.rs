//! Configuration schema.
//!
//! Hierarchy: `Config` → `DeliveryConfig`, `ImapConfig`, `GraphConfig`.
//!
//! JSON on disk uses **camelCase** keys; Rust uses snake_case.
//! We use `#[serde(rename_all = "camelCase")]` to handle the conversion.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::stage::DEFAULT_SPILL_THRESHOLD;
use crate::utils::non_empty;
use crate::DEFAULT_MAILBOX;

// ─────────────────────────────────────────────
// Root Config
// ─────────────────────────────────────────────

/// Root configuration — loaded from `~/.mailpull/config.json` + env vars.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub delivery: DeliveryConfig,
    pub imap: ImapConfig,
    pub graph: GraphConfig,
}

// ─────────────────────────────────────────────
// Delivery loop
// ─────────────────────────────────────────────

fn default_backend() -> String {
    "imap".to_string()
}

fn default_mailbox() -> String {
    DEFAULT_MAILBOX.to_string()
}

fn default_short_sleep() -> u64 {
    1
}

fn default_long_sleep() -> u64 {
    5 * 60
}

fn default_spill_threshold() -> usize {
    DEFAULT_SPILL_THRESHOLD
}

/// What to poll, where to relocate, and how long to sleep between rounds.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeliveryConfig {
    /// Session backend: `"imap"`, `"graph"` or `"memory"`.
    #[serde(default = "default_backend")]
    pub backend: String,
    /// Mailbox to poll (default "INBOX").
    #[serde(default = "default_mailbox")]
    pub mailbox: String,
    /// Subject substring to match; empty matches everything.
    #[serde(default)]
    pub pattern: String,
    /// Destination for delivered messages; empty leaves them in place.
    #[serde(default)]
    pub outbox: String,
    /// Destination for rejected messages; empty leaves them in place.
    #[serde(default)]
    pub errbox: String,
    /// Sleep after a round that delivered something.
    #[serde(default = "default_short_sleep")]
    pub short_sleep_secs: u64,
    /// Sleep after an empty or failed round.
    #[serde(default = "default_long_sleep")]
    pub long_sleep_secs: u64,
    /// Bodies larger than this are staged in a temp file.
    #[serde(default = "default_spill_threshold")]
    pub spill_threshold_bytes: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            mailbox: default_mailbox(),
            pattern: String::new(),
            outbox: String::new(),
            errbox: String::new(),
            short_sleep_secs: default_short_sleep(),
            long_sleep_secs: default_long_sleep(),
            spill_threshold_bytes: default_spill_threshold(),
        }
    }
}

impl DeliveryConfig {
    /// Mailbox to poll, falling back to "INBOX" when blank.
    pub fn mailbox(&self) -> &str {
        non_empty(&self.mailbox).unwrap_or(DEFAULT_MAILBOX)
    }

    pub fn outbox(&self) -> Option<&str> {
        non_empty(&self.outbox)
    }

    pub fn errbox(&self) -> Option<&str> {
        non_empty(&self.errbox)
    }

    /// Seen messages are listed only when both relocation targets are set:
    /// every processed message then leaves the mailbox, so relocation alone
    /// prevents reprocessing.
    pub fn include_seen(&self) -> bool {
        self.outbox().is_some() && self.errbox().is_some()
    }

    pub fn short_sleep(&self) -> Duration {
        Duration::from_secs(self.short_sleep_secs)
    }

    pub fn long_sleep(&self) -> Duration {
        Duration::from_secs(self.long_sleep_secs)
    }
}

// ─────────────────────────────────────────────
// IMAP backend
// ─────────────────────────────────────────────

fn default_imap_port() -> u16 {
    993
}

fn default_true() -> bool {
    true
}

fn default_timeout() -> u64 {
    60
}

/// IMAP backend config.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ImapConfig {
    /// IMAP server hostname.
    #[serde(default)]
    pub host: String,
    /// IMAP server port (default 993 for IMAPS).
    #[serde(default = "default_imap_port")]
    pub port: u16,
    /// IMAP login username.
    #[serde(default)]
    pub username: String,
    /// IMAP login password.
    #[serde(default)]
    pub password: String,
    /// Use IMAPS (TLS from the start). Default true.
    #[serde(default = "default_true")]
    pub use_tls: bool,
    /// Per-command timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

impl Default for ImapConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_imap_port(),
            username: String::new(),
            password: String::new(),
            use_tls: true,
            timeout_secs: default_timeout(),
        }
    }
}

impl ImapConfig {
    /// Host, username and password are all present.
    pub fn is_configured(&self) -> bool {
        !self.host.is_empty() && !self.username.is_empty() && !self.password.is_empty()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

// ─────────────────────────────────────────────
// REST backend
// ─────────────────────────────────────────────

fn default_graph_base() -> String {
    "https://graph.microsoft.com/v1.0/me".to_string()
}

/// Mail REST API backend config (bearer token auth).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GraphConfig {
    /// API root for the signed-in user.
    #[serde(default = "default_graph_base")]
    pub api_base: String,
    /// OAuth2 access token.
    #[serde(default)]
    pub access_token: String,
    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            api_base: default_graph_base(),
            access_token: String::new(),
            timeout_secs: default_timeout(),
        }
    }
}

impl GraphConfig {
    pub fn is_configured(&self) -> bool {
        !self.access_token.is_empty()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
