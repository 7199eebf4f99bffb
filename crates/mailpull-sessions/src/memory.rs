//! In-memory mailbox backend.
//!
//! A `MemoryStore` holds named mailboxes of raw RFC822 messages with IMAP-like
//! UIDs and seen/deleted flags. `MemorySession` is a `MailboxSession` over a
//! shared store, so tests can drive a round and then inspect what happened.
//! Faults can be injected per operation.

use std::collections::{BTreeMap, HashSet};
use std::io::Write;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use mailparse::MailHeaderMap;
use tracing::debug;

use mailpull_core::{Candidate, MailboxSession, SessionError};

/// Bytes written per `write` call while streaming a body.
const STREAM_CHUNK: usize = 64;

#[derive(Clone, Debug)]
struct StoredMessage {
    uid: u32,
    raw: Vec<u8>,
    seen: bool,
    deleted: bool,
}

impl StoredMessage {
    fn subject(&self) -> Option<String> {
        let (headers, _) = mailparse::parse_headers(&self.raw).ok()?;
        headers.get_first_value("Subject")
    }

    fn matches(&self, pattern: &str) -> bool {
        if pattern.is_empty() {
            return true;
        }
        self.subject()
            .map(|s| s.to_lowercase().contains(&pattern.to_lowercase()))
            .unwrap_or(false)
    }
}

/// Operation counters, for assertions.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub connects: usize,
    pub closes: usize,
    pub lists: usize,
    pub reads: usize,
    pub marks: usize,
    pub moves: usize,
}

#[derive(Debug, Default)]
struct Faults {
    connect: bool,
    list: bool,
    read: HashSet<u32>,
    mark: HashSet<u32>,
    moves: HashSet<u32>,
}

#[derive(Debug, Default)]
struct StoreInner {
    mailboxes: BTreeMap<String, Vec<StoredMessage>>,
    next_uid: u32,
    faults: Faults,
    stats: MemoryStats,
}

impl StoreInner {
    fn alloc_uid(&mut self) -> u32 {
        self.next_uid += 1;
        self.next_uid
    }

    fn find(&self, mailbox: &str, uid: u32) -> Option<&StoredMessage> {
        self.mailboxes
            .get(mailbox)?
            .iter()
            .find(|m| m.uid == uid && !m.deleted)
    }

    fn find_mut(&mut self, mailbox: &str, uid: u32) -> Option<&mut StoredMessage> {
        self.mailboxes
            .get_mut(mailbox)?
            .iter_mut()
            .find(|m| m.uid == uid && !m.deleted)
    }
}

// ─────────────────────────────────────────────
// MemoryStore
// ─────────────────────────────────────────────

/// Shared state behind any number of `MemorySession`s.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<StoreInner>>,
}

impl MemoryStore {
    /// An empty store with an `INBOX`.
    pub fn new() -> Self {
        let store = Self::default();
        store.create_mailbox(mailpull_core::DEFAULT_MAILBOX);
        store
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// A new, disconnected session over this store.
    pub fn session(&self) -> MemorySession {
        MemorySession {
            store: self.clone(),
            connected: false,
            selected: None,
        }
    }

    pub fn create_mailbox(&self, name: &str) {
        self.lock().mailboxes.entry(name.to_string()).or_default();
    }

    /// Append an unseen message, creating the mailbox if needed. Returns its UID.
    pub fn append(&self, mailbox: &str, raw: impl Into<Vec<u8>>) -> u32 {
        self.append_with_flags(mailbox, raw.into(), false)
    }

    /// Append a message that is already seen.
    pub fn append_seen(&self, mailbox: &str, raw: impl Into<Vec<u8>>) -> u32 {
        self.append_with_flags(mailbox, raw.into(), true)
    }

    fn append_with_flags(&self, mailbox: &str, raw: Vec<u8>, seen: bool) -> u32 {
        let mut inner = self.lock();
        let uid = inner.alloc_uid();
        inner
            .mailboxes
            .entry(mailbox.to_string())
            .or_default()
            .push(StoredMessage {
                uid,
                raw,
                seen,
                deleted: false,
            });
        uid
    }

    /// UIDs currently in `mailbox`, in arrival order.
    pub fn uids(&self, mailbox: &str) -> Vec<u32> {
        self.lock()
            .mailboxes
            .get(mailbox)
            .map(|msgs| msgs.iter().filter(|m| !m.deleted).map(|m| m.uid).collect())
            .unwrap_or_default()
    }

    /// Raw bodies currently in `mailbox`, in arrival order.
    pub fn messages(&self, mailbox: &str) -> Vec<Vec<u8>> {
        self.lock()
            .mailboxes
            .get(mailbox)
            .map(|msgs| {
                msgs.iter()
                    .filter(|m| !m.deleted)
                    .map(|m| m.raw.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Seen flag of a message, or `None` if it is not in `mailbox`.
    pub fn is_seen(&self, mailbox: &str, uid: u32) -> Option<bool> {
        self.lock().find(mailbox, uid).map(|m| m.seen)
    }

    pub fn stats(&self) -> MemoryStats {
        self.lock().stats.clone()
    }

    pub fn fail_connect(&self, fail: bool) {
        self.lock().faults.connect = fail;
    }

    pub fn fail_list(&self, fail: bool) {
        self.lock().faults.list = fail;
    }

    /// Make `read_body` fail for this UID.
    pub fn fail_read(&self, uid: u32) {
        self.lock().faults.read.insert(uid);
    }

    /// Make `mark` fail for this UID.
    pub fn fail_mark(&self, uid: u32) {
        self.lock().faults.mark.insert(uid);
    }

    /// Make `move_to` fail for this UID.
    pub fn fail_move(&self, uid: u32) {
        self.lock().faults.moves.insert(uid);
    }
}

// ─────────────────────────────────────────────
// MemorySession
// ─────────────────────────────────────────────

/// `MailboxSession` over a `MemoryStore`. `list` selects the mailbox that
/// later `read_body` / `mark` / `move_to` calls refer to.
#[derive(Debug)]
pub struct MemorySession {
    store: MemoryStore,
    connected: bool,
    selected: Option<String>,
}

impl MemorySession {
    fn selected(&self) -> Result<String, SessionError> {
        if !self.connected {
            return Err(SessionError::NotConnected);
        }
        self.selected
            .clone()
            .ok_or_else(|| SessionError::backend("no mailbox selected"))
    }

    fn uid_of(id: &Candidate) -> Result<u32, SessionError> {
        id.uid().ok_or_else(|| SessionError::NotFound(id.clone()))
    }
}

#[async_trait]
impl MailboxSession for MemorySession {
    fn describe(&self) -> String {
        "memory".to_string()
    }

    async fn connect(&mut self) -> Result<(), SessionError> {
        let mut inner = self.store.lock();
        inner.stats.connects += 1;
        if inner.faults.connect {
            return Err(SessionError::backend("connection refused"));
        }
        self.connected = true;
        Ok(())
    }

    async fn close(&mut self, expunge: bool) -> Result<(), SessionError> {
        let mut inner = self.store.lock();
        inner.stats.closes += 1;
        if expunge {
            for msgs in inner.mailboxes.values_mut() {
                msgs.retain(|m| !m.deleted);
            }
        }
        self.connected = false;
        self.selected = None;
        Ok(())
    }

    async fn list(
        &mut self,
        mailbox: &str,
        pattern: &str,
        include_seen: bool,
    ) -> Result<Vec<Candidate>, SessionError> {
        if !self.connected {
            return Err(SessionError::NotConnected);
        }
        let ids = {
            let mut inner = self.store.lock();
            inner.stats.lists += 1;
            if inner.faults.list {
                return Err(SessionError::backend("SEARCH failed"));
            }
            let msgs = inner
                .mailboxes
                .get(mailbox)
                .ok_or_else(|| SessionError::NoMailbox(mailbox.to_string()))?;
            msgs.iter()
                .filter(|m| !m.deleted)
                .filter(|m| include_seen || !m.seen)
                .filter(|m| m.matches(pattern))
                .map(|m| Candidate::from_uid(m.uid))
                .collect::<Vec<_>>()
        };
        debug!(mailbox = mailbox, count = ids.len(), "memory list");
        self.selected = Some(mailbox.to_string());
        Ok(ids)
    }

    async fn read_body(
        &mut self,
        id: &Candidate,
        dst: &mut (dyn Write + Send),
    ) -> Result<u64, SessionError> {
        let mailbox = self.selected()?;
        let uid = Self::uid_of(id)?;
        let raw = {
            let mut inner = self.store.lock();
            inner.stats.reads += 1;
            if inner.faults.read.contains(&uid) {
                return Err(SessionError::backend(format!("FETCH {} failed", uid)));
            }
            inner
                .find(&mailbox, uid)
                .map(|m| m.raw.clone())
                .ok_or_else(|| SessionError::NotFound(id.clone()))?
        };
        for chunk in raw.chunks(STREAM_CHUNK) {
            dst.write_all(chunk)?;
        }
        Ok(raw.len() as u64)
    }

    async fn mark(&mut self, id: &Candidate, seen: bool) -> Result<(), SessionError> {
        let mailbox = self.selected()?;
        let uid = Self::uid_of(id)?;
        let mut inner = self.store.lock();
        inner.stats.marks += 1;
        if inner.faults.mark.contains(&uid) {
            return Err(SessionError::backend(format!("STORE {} failed", uid)));
        }
        let msg = inner
            .find_mut(&mailbox, uid)
            .ok_or_else(|| SessionError::NotFound(id.clone()))?;
        msg.seen = seen;
        Ok(())
    }

    async fn move_to(&mut self, id: &Candidate, dest_mailbox: &str) -> Result<(), SessionError> {
        let mailbox = self.selected()?;
        let uid = Self::uid_of(id)?;
        let mut inner = self.store.lock();
        inner.stats.moves += 1;
        if inner.faults.moves.contains(&uid) {
            return Err(SessionError::backend(format!("MOVE {} failed", uid)));
        }
        if !inner.mailboxes.contains_key(dest_mailbox) {
            return Err(SessionError::NoMailbox(dest_mailbox.to_string()));
        }
        let msg = inner
            .find_mut(&mailbox, uid)
            .ok_or_else(|| SessionError::NotFound(id.clone()))?;
        msg.deleted = true;
        let (raw, seen) = (msg.raw.clone(), msg.seen);

        let new_uid = inner.alloc_uid();
        if let Some(dest) = inner.mailboxes.get_mut(dest_mailbox) {
            dest.push(StoredMessage {
                uid: new_uid,
                raw,
                seen,
                deleted: false,
            });
        }
        if let Some(src) = inner.mailboxes.get_mut(&mailbox) {
            src.retain(|m| m.uid != uid);
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
