//! Message staging — spool a streamed body into a re-readable buffer while
//! hashing it.
//!
//! The session writes into a [`StageWriter`], which appends every byte to a
//! spooled buffer (memory up to a threshold, then an anonymous temp file) and
//! feeds the very same bytes into a SHA-1 accumulator. The digest handed to the
//! delivery callback therefore always covers exactly what the callback reads.

use std::fmt;
use std::io::{self, Read, Seek, SeekFrom, Write};

use sha1::{Digest, Sha1};
use tempfile::SpooledTempFile;
use tracing::{debug, warn};

use crate::error::SessionError;
use crate::session::MailboxSession;
use crate::types::Candidate;

/// Bodies up to this size stay in memory.
pub const DEFAULT_SPILL_THRESHOLD: usize = 1024 * 1024;

// ─────────────────────────────────────────────
// MessageStage
// ─────────────────────────────────────────────

/// Factory for staged message buffers.
#[derive(Clone, Debug)]
pub struct MessageStage {
    spill_threshold: usize,
}

impl Default for MessageStage {
    fn default() -> Self {
        Self::new(DEFAULT_SPILL_THRESHOLD)
    }
}

impl MessageStage {
    /// Create a stage that spills bodies larger than `spill_threshold` bytes
    /// to temporary storage.
    pub fn new(spill_threshold: usize) -> Self {
        Self { spill_threshold }
    }

    pub fn spill_threshold(&self) -> usize {
        self.spill_threshold
    }

    /// A fresh, empty write target.
    pub fn writer(&self) -> StageWriter {
        StageWriter {
            body: SpooledTempFile::new(self.spill_threshold),
            hasher: Sha1::new(),
            written: 0,
        }
    }

    /// Stream `id` from the session into a new staged buffer.
    ///
    /// On error the partial buffer is dropped before returning.
    pub async fn stage<S>(&self, session: &mut S, id: &Candidate) -> Result<StagedMessage, SessionError>
    where
        S: MailboxSession + ?Sized,
    {
        let mut writer = self.writer();
        let reported = session.read_body(id, &mut writer).await?;
        if reported != writer.written() {
            warn!(
                uid = %id,
                reported = reported,
                written = writer.written(),
                "session byte count differs from staged length"
            );
        }
        let staged = writer.finish()?;
        debug!(
            uid = %id,
            bytes = staged.len(),
            spilled = staged.is_spilled(),
            "message staged"
        );
        Ok(staged)
    }
}

// ─────────────────────────────────────────────
// StageWriter
// ─────────────────────────────────────────────

/// Write target that buffers and hashes on the same path.
pub struct StageWriter {
    body: SpooledTempFile,
    hasher: Sha1,
    written: u64,
}

impl StageWriter {
    /// Bytes accepted so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Finalize the digest and rewind the buffer for reading.
    pub fn finish(mut self) -> io::Result<StagedMessage> {
        self.body.flush()?;
        self.body.seek(SeekFrom::Start(0))?;
        Ok(StagedMessage {
            body: self.body,
            digest: self.hasher.finalize().to_vec(),
            len: self.written,
        })
    }
}

impl Write for StageWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.body.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.body.flush()
    }
}

// ─────────────────────────────────────────────
// StagedMessage
// ─────────────────────────────────────────────

/// One fully buffered message body plus the SHA-1 of exactly those bytes.
///
/// Readable and seekable from offset zero. The buffer (and any temp file
/// behind it) is freed by [`StagedMessage::release`], or on drop if the
/// owner unwinds first.
pub struct StagedMessage {
    body: SpooledTempFile,
    digest: Vec<u8>,
    len: u64,
}

impl StagedMessage {
    /// Raw SHA-1 digest (20 bytes).
    pub fn digest(&self) -> &[u8] {
        &self.digest
    }

    /// Lowercase hex form of the digest.
    pub fn digest_hex(&self) -> String {
        hex::encode(&self.digest)
    }

    /// Body length in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether the body outgrew the in-memory threshold.
    pub fn is_spilled(&self) -> bool {
        self.body.is_rolled()
    }

    /// Seek back to the first byte.
    pub fn rewind(&mut self) -> io::Result<()> {
        self.body.seek(SeekFrom::Start(0)).map(|_| ())
    }

    /// Read the whole body from the start, regardless of the current offset.
    pub fn read_all(&mut self) -> io::Result<Vec<u8>> {
        self.rewind()?;
        let mut out = Vec::with_capacity(self.len as usize);
        self.body.read_to_end(&mut out)?;
        Ok(out)
    }

    /// Free the buffer now.
    pub fn release(self) {
        debug!(bytes = self.len, spilled = self.is_spilled(), "staged message released");
    }
}

impl Read for StagedMessage {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.body.read(buf)
    }
}

impl Seek for StagedMessage {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.body.seek(pos)
    }
}

impl fmt::Debug for StagedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StagedMessage")
            .field("len", &self.len)
            .field("digest", &self.digest_hex())
            .field("spilled", &self.is_spilled())
            .finish()
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    /// Writes a fixed body in small chunks, or fails halfway.
    struct ChunkedSession {
        body: Vec<u8>,
        chunk: usize,
        fail_after: Option<usize>,
    }

    #[async_trait]
    impl MailboxSession for ChunkedSession {
        fn describe(&self) -> String {
            "chunked".into()
        }

        async fn connect(&mut self) -> Result<(), SessionError> {
            Ok(())
        }

        async fn close(&mut self, _expunge: bool) -> Result<(), SessionError> {
            Ok(())
        }

        async fn list(
            &mut self,
            _mailbox: &str,
            _pattern: &str,
            _include_seen: bool,
        ) -> Result<Vec<Candidate>, SessionError> {
            Ok(vec![Candidate::from_uid(1)])
        }

        async fn read_body(
            &mut self,
            _id: &Candidate,
            dst: &mut (dyn Write + Send),
        ) -> Result<u64, SessionError> {
            let mut n = 0u64;
            for (i, part) in self.body.chunks(self.chunk).enumerate() {
                if self.fail_after == Some(i) {
                    return Err(SessionError::backend("connection reset"));
                }
                dst.write_all(part)?;
                n += part.len() as u64;
            }
            Ok(n)
        }

        async fn mark(&mut self, _id: &Candidate, _seen: bool) -> Result<(), SessionError> {
            Ok(())
        }

        async fn move_to(&mut self, _id: &Candidate, _dest: &str) -> Result<(), SessionError> {
            Ok(())
        }
    }

    fn staged_from(bytes: &[u8], threshold: usize) -> StagedMessage {
        let mut w = MessageStage::new(threshold).writer();
        w.write_all(bytes).unwrap();
        w.finish().unwrap()
    }

    #[test]
    fn test_digest_known_vector() {
        let staged = staged_from(b"abc", 1024);
        assert_eq!(
            staged.digest_hex(),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
        assert_eq!(staged.digest().len(), 20);
        assert_eq!(staged.len(), 3);
    }

    #[test]
    fn test_digest_is_deterministic() {
        let body = b"From: a@example.com\r\nSubject: x\r\n\r\nhello\r\n";
        let first = staged_from(body, 1024);
        let second = staged_from(body, 8);
        assert_eq!(first.digest(), second.digest());
    }

    #[test]
    fn test_reread_after_partial_consumption() {
        let body = b"0123456789abcdef";
        let mut staged = staged_from(body, 1024);

        let mut head = [0u8; 4];
        staged.read_exact(&mut head).unwrap();
        assert_eq!(&head, b"0123");

        staged.seek(SeekFrom::Start(0)).unwrap();
        let mut all = Vec::new();
        staged.read_to_end(&mut all).unwrap();
        assert_eq!(all, body);

        assert_eq!(staged.read_all().unwrap(), body);
    }

    #[test]
    fn test_spills_past_threshold() {
        let body = vec![b'x'; 4096];
        let mut staged = staged_from(&body, 64);
        assert!(staged.is_spilled());
        assert_eq!(staged.read_all().unwrap(), body);
        staged.release();
    }

    #[test]
    fn test_small_body_stays_in_memory() {
        let staged = staged_from(b"tiny", 64);
        assert!(!staged.is_spilled());
    }

    #[test]
    fn test_empty_body() {
        let mut staged = staged_from(b"", 64);
        assert!(staged.is_empty());
        assert!(staged.read_all().unwrap().is_empty());
        assert_eq!(
            staged.digest_hex(),
            "da39a3ee5e6b4b0d3255bfef95601890afd80709"
        );
    }

    #[tokio::test]
    async fn test_stage_hashes_chunked_stream() {
        let body: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        let mut session = ChunkedSession {
            body: body.clone(),
            chunk: 7,
            fail_after: None,
        };
        let stage = MessageStage::new(128);
        let mut staged = stage
            .stage(&mut session, &Candidate::from_uid(1))
            .await
            .unwrap();

        let whole = staged_from(&body, 4096);
        assert_eq!(staged.digest(), whole.digest());
        assert_eq!(staged.read_all().unwrap(), body);
    }

    #[tokio::test]
    async fn test_stage_propagates_stream_failure() {
        let mut session = ChunkedSession {
            body: vec![1u8; 100],
            chunk: 10,
            fail_after: Some(3),
        };
        let stage = MessageStage::default();
        let err = stage
            .stage(&mut session, &Candidate::from_uid(1))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("connection reset"));
    }
}
