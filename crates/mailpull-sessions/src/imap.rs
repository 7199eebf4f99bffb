//! IMAP backend — `MailboxSession` over `async-imap`.
//!
//! One TCP (+TLS) connection per `connect`/`close` pair. Messages are
//! addressed by UID in the mailbox selected by the last `list`. Bodies are
//! fetched with `BODY.PEEK[]` so reading never sets `\Seen`; only `mark`
//! does. Every server round-trip is bounded by the configured timeout.

use std::fmt;
use std::future::Future;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use async_imap::types::Fetch;
use async_trait::async_trait;
use futures_util::TryStreamExt;
use tracing::{debug, info, warn};

use mailpull_core::config::schema::ImapConfig;
use mailpull_core::{Candidate, MailboxSession, SessionError};

// ─────────────────────────────────────────────
// Transport
// ─────────────────────────────────────────────

/// Async read+write stream marker.
trait ImapStream: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + fmt::Debug {}
impl<T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + fmt::Debug> ImapStream for T {}

type Session = async_imap::Session<Box<dyn ImapStream>>;

/// TCP connect, optionally wrapped in TLS from the first byte (IMAPS).
async fn open_stream(host: &str, port: u16, use_tls: bool) -> Result<Box<dyn ImapStream>, SessionError> {
    let tcp = tokio::net::TcpStream::connect((host, port)).await?;

    if !use_tls {
        return Ok(Box::new(tcp));
    }

    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    let connector = tokio_rustls::TlsConnector::from(Arc::new(config));
    let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
        .map_err(|e| SessionError::backend(format!("invalid server name '{}': {}", host, e)))?;
    let tls = connector.connect(server_name, tcp).await?;
    Ok(Box::new(tls))
}

fn imap_err(e: impl fmt::Display) -> SessionError {
    SessionError::backend(format!("IMAP: {}", e))
}

/// Run `fut`, mapping its error and an elapsed `limit` to `SessionError`.
async fn bounded<T, E, F>(limit: Duration, fut: F) -> Result<T, SessionError>
where
    F: Future<Output = Result<T, E>>,
    E: Into<SessionError>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => Err(SessionError::Timeout(limit)),
    }
}

/// Wrapper so library errors convert with `?` inside `bounded` blocks.
struct ImapError(async_imap::error::Error);

impl From<async_imap::error::Error> for ImapError {
    fn from(e: async_imap::error::Error) -> Self {
        ImapError(e)
    }
}

impl From<ImapError> for SessionError {
    fn from(e: ImapError) -> Self {
        imap_err(e.0)
    }
}

// ─────────────────────────────────────────────
// Query building
// ─────────────────────────────────────────────

/// Quote a string for use as an IMAP quoted-string.
fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// `UID SEARCH` criteria for a listing.
fn search_query(pattern: &str, include_seen: bool) -> String {
    let mut criteria = Vec::new();
    if !include_seen {
        criteria.push("UNSEEN".to_string());
    }
    if !pattern.is_empty() {
        criteria.push(format!("SUBJECT {}", quote(pattern)));
    }
    if criteria.is_empty() {
        criteria.push("ALL".to_string());
    }

    let query = criteria.join(" ");
    if pattern.is_ascii() {
        query
    } else {
        format!("CHARSET UTF-8 {}", query)
    }
}

/// Mailbox name as sent on the wire: modified UTF-7 (RFC 3501 §5.1.3).
fn wire_mailbox(name: &str) -> String {
    utf7_imap::encode_utf7_imap(name.to_string())
}

fn uid_of(id: &Candidate) -> Result<u32, SessionError> {
    id.uid().ok_or_else(|| SessionError::NotFound(id.clone()))
}

// ─────────────────────────────────────────────
// ImapSession
// ─────────────────────────────────────────────

/// IMAP `MailboxSession`.
pub struct ImapSession {
    config: ImapConfig,
    session: Option<Session>,
    /// Server advertised the MOVE extension (RFC 6851).
    can_move: bool,
}

impl ImapSession {
    pub fn new(config: ImapConfig) -> Self {
        Self {
            config,
            session: None,
            can_move: false,
        }
    }

    fn timeout(&self) -> Duration {
        self.config.timeout()
    }

    fn session(&mut self) -> Result<&mut Session, SessionError> {
        self.session.as_mut().ok_or(SessionError::NotConnected)
    }

    async fn store_flag(&mut self, uid: u32, op: &str) -> Result<(), SessionError> {
        let limit = self.timeout();
        let session = self.session()?;
        let query = format!("{}FLAGS (\\Seen)", op);
        bounded(limit, async {
            let updates = session.uid_store(uid.to_string(), &query).await?;
            updates.try_collect::<Vec<Fetch>>().await?;
            Ok::<_, ImapError>(())
        })
        .await
    }
}

impl fmt::Debug for ImapSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImapSession")
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("connected", &self.session.is_some())
            .finish()
    }
}

#[async_trait]
impl MailboxSession for ImapSession {
    fn describe(&self) -> String {
        let scheme = if self.config.use_tls { "imaps" } else { "imap" };
        format!(
            "{}://{}@{}:{}",
            scheme, self.config.username, self.config.host, self.config.port
        )
    }

    async fn connect(&mut self) -> Result<(), SessionError> {
        if self.session.is_some() {
            debug!("IMAP already connected");
            return Ok(());
        }

        let limit = self.timeout();
        let ImapConfig {
            host,
            port,
            username,
            password,
            use_tls,
            ..
        } = &self.config;

        let stream = match tokio::time::timeout(limit, open_stream(host, *port, *use_tls)).await {
            Ok(stream) => stream?,
            Err(_) => return Err(SessionError::Timeout(limit)),
        };

        let mut client = async_imap::Client::new(stream);
        let greeting = bounded(limit, async { client.read_response().await.transpose() }).await?;
        if greeting.is_none() {
            return Err(SessionError::backend("IMAP server sent no greeting"));
        }

        let mut session = match tokio::time::timeout(limit, client.login(username, password)).await {
            Ok(Ok(session)) => session,
            Ok(Err((e, _client))) => return Err(imap_err(e)),
            Err(_) => return Err(SessionError::Timeout(limit)),
        };

        let can_move = bounded(limit, async {
            let caps = session.capabilities().await?;
            Ok::<_, ImapError>(caps.has_str("MOVE"))
        })
        .await?;

        info!(host = %host, port = *port, can_move, "IMAP connected");
        self.can_move = can_move;
        self.session = Some(session);
        Ok(())
    }

    async fn close(&mut self, expunge: bool) -> Result<(), SessionError> {
        let limit = self.timeout();
        let Some(mut session) = self.session.take() else {
            return Ok(());
        };

        // CLOSE expunges \Deleted messages in the selected mailbox; it fails
        // harmlessly when nothing is selected.
        let closed = if expunge {
            bounded(limit, async { session.close().await.map_err(ImapError) }).await
        } else {
            Ok(())
        };
        if let Err(e) = &closed {
            debug!(error = %e, "IMAP CLOSE failed");
        }

        let logged_out = bounded(limit, async { session.logout().await.map_err(ImapError) }).await;
        if let Err(e) = &logged_out {
            warn!(error = %e, "IMAP LOGOUT failed");
        }
        logged_out
    }

    async fn list(
        &mut self,
        mailbox: &str,
        pattern: &str,
        include_seen: bool,
    ) -> Result<Vec<Candidate>, SessionError> {
        let limit = self.timeout();
        let session = self.session()?;

        match tokio::time::timeout(limit, session.select(wire_mailbox(mailbox))).await {
            Ok(Ok(_)) => {}
            Ok(Err(async_imap::error::Error::No(msg))) => {
                debug!(mailbox = mailbox, response = %msg, "SELECT refused");
                return Err(SessionError::NoMailbox(mailbox.to_string()));
            }
            Ok(Err(e)) => return Err(imap_err(e)),
            Err(_) => return Err(SessionError::Timeout(limit)),
        }

        let query = search_query(pattern, include_seen);
        debug!(mailbox = mailbox, query = %query, "UID SEARCH");
        let found = bounded(limit, async { session.uid_search(&query).await.map_err(ImapError) }).await?;

        let mut uids: Vec<u32> = found.into_iter().collect();
        uids.sort_unstable();
        Ok(uids.into_iter().map(Candidate::from_uid).collect())
    }

    /// The library parses each response whole, so the message is held in
    /// memory once before it reaches `dst`.
    async fn read_body(
        &mut self,
        id: &Candidate,
        dst: &mut (dyn Write + Send),
    ) -> Result<u64, SessionError> {
        let uid = uid_of(id)?;
        let limit = self.timeout();
        let session = self.session()?;

        let fetches = bounded(limit, async {
            let stream = session.uid_fetch(uid.to_string(), "(UID BODY.PEEK[])").await?;
            let fetches = stream.try_collect::<Vec<Fetch>>().await?;
            Ok::<_, ImapError>(fetches)
        })
        .await?;

        let body = fetches
            .iter()
            .filter(|f| f.uid.is_none() || f.uid == Some(uid))
            .find_map(|f| f.body())
            .ok_or_else(|| SessionError::NotFound(id.clone()))?;

        dst.write_all(body)?;
        Ok(body.len() as u64)
    }

    async fn mark(&mut self, id: &Candidate, seen: bool) -> Result<(), SessionError> {
        let uid = uid_of(id)?;
        self.store_flag(uid, if seen { "+" } else { "-" }).await
    }

    async fn move_to(&mut self, id: &Candidate, dest_mailbox: &str) -> Result<(), SessionError> {
        let uid = uid_of(id)?;
        let limit = self.timeout();
        let can_move = self.can_move;
        let session = self.session()?;
        let dest = wire_mailbox(dest_mailbox);

        // uid_mv quotes the name itself; uid_copy sends it verbatim
        if can_move {
            return bounded(limit, async {
                session.uid_mv(uid.to_string(), &dest).await.map_err(ImapError)
            })
            .await;
        }

        bounded(limit, async {
            session.uid_copy(uid.to_string(), quote(&dest)).await?;
            let updates = session.uid_store(uid.to_string(), "+FLAGS.SILENT (\\Deleted)").await?;
            updates.try_collect::<Vec<Fetch>>().await?;
            Ok::<_, ImapError>(())
        })
        .await
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
