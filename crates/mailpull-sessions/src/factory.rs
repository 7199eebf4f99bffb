//! Session factory — pick a backend from the config.

use anyhow::{bail, Result};
use tracing::{debug, warn};

use mailpull_core::config::Config;
use mailpull_core::MailboxSession;

use crate::memory::MemoryStore;

/// Build the session named by `config.delivery.backend`.
///
/// `"memory"` yields a session over a fresh, empty store; it is mostly useful
/// for dry runs. Backends compiled out by features are reported as errors.
pub fn create_session(config: &Config) -> Result<Box<dyn MailboxSession>> {
    let backend = config.delivery.backend.trim().to_ascii_lowercase();
    debug!(backend = %backend, "creating mailbox session");

    match backend.as_str() {
        "memory" => Ok(Box::new(MemoryStore::new().session())),
        "imap" => imap_session(config),
        "graph" => graph_session(config),
        other => bail!(
            "unknown session backend '{}' (expected \"imap\", \"graph\" or \"memory\")",
            other
        ),
    }
}

#[cfg(feature = "imap")]
fn imap_session(config: &Config) -> Result<Box<dyn MailboxSession>> {
    let imap = &config.imap;
    if !imap.is_configured() {
        if imap.host.is_empty() {
            warn!("imap: host not configured");
        }
        if imap.username.is_empty() {
            warn!("imap: username not configured");
        }
        if imap.password.is_empty() {
            warn!("imap: password not configured");
        }
        bail!("IMAP backend needs host, username and password");
    }
    Ok(Box::new(crate::imap::ImapSession::new(imap.clone())))
}

#[cfg(not(feature = "imap"))]
fn imap_session(_config: &Config) -> Result<Box<dyn MailboxSession>> {
    bail!("IMAP backend not compiled in (enable the \"imap\" feature)")
}

#[cfg(feature = "graph")]
fn graph_session(config: &Config) -> Result<Box<dyn MailboxSession>> {
    if !config.graph.is_configured() {
        warn!("graph: access token not configured");
        bail!("REST backend needs an access token");
    }
    Ok(Box::new(crate::graph::GraphSession::new(&config.graph)))
}

#[cfg(not(feature = "graph"))]
fn graph_session(_config: &Config) -> Result<Box<dyn MailboxSession>> {
    bail!("REST backend not compiled in (enable the \"graph\" feature)")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with(backend: &str) -> Config {
        let mut config = Config::default();
        config.delivery.backend = backend.to_string();
        config
    }

    #[test]
    fn test_memory_backend() {
        let session = create_session(&config_with("Memory")).unwrap();
        assert_eq!(session.describe(), "memory");
    }

    #[test]
    fn test_unknown_backend() {
        let err = create_session(&config_with("pop3")).err().unwrap();
        assert!(err.to_string().contains("unknown session backend 'pop3'"));
    }

    #[cfg(feature = "imap")]
    #[test]
    fn test_imap_needs_credentials() {
        let mut config = config_with("imap");
        assert!(create_session(&config).is_err());

        config.imap.host = "imap.example.com".into();
        config.imap.username = "user".into();
        config.imap.password = "pw".into();
        let session = create_session(&config).unwrap();
        assert_eq!(session.describe(), "imaps://user@imap.example.com:993");
    }

    #[cfg(feature = "graph")]
    #[test]
    fn test_graph_needs_token() {
        let mut config = config_with("graph");
        assert!(create_session(&config).is_err());

        config.graph.access_token = "tok".into();
        let session = create_session(&config).unwrap();
        assert_eq!(session.describe(), "https://graph.microsoft.com/v1.0/me");
    }

    #[tokio::test]
    async fn test_memory_session_round_trip() {
        let mut session = create_session(&config_with("memory")).unwrap();
        session.connect().await.unwrap();
        assert!(session.list("INBOX", "", false).await.unwrap().is_empty());
        session.close(true).await.unwrap();
    }
}
