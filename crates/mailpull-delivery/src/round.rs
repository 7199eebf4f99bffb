//! Round executor — one connect → list → stage → deliver → relocate cycle.
//!
//! Per-candidate failures never escape a round: an unreadable body, a
//! rejected delivery, or a failed mark/move is logged and the next candidate
//! is processed. Only connecting and listing can fail the round as a whole.

use tracing::{debug, error, info, warn};

use mailpull_core::config::schema::DeliveryConfig;
use mailpull_core::utils::non_empty;
use mailpull_core::{
    Candidate, DeliveryOutcome, MailboxSession, MessageStage, RoundError, DEFAULT_MAILBOX,
};

use crate::deliver::Deliver;

// ─────────────────────────────────────────────
// RoundResult
// ─────────────────────────────────────────────

/// Summary of one round.
#[derive(Debug, Default)]
pub struct RoundResult {
    /// Candidates whose callback returned `Ok`.
    pub delivered: usize,
    /// Candidates whose callback returned an error.
    pub rejected: usize,
    /// Candidates that could not be staged.
    pub unreadable: usize,
    /// Connect or list failure; when set, no candidate was processed.
    pub error: Option<RoundError>,
}

impl RoundResult {
    fn failed(err: RoundError) -> Self {
        Self {
            error: Some(err),
            ..Default::default()
        }
    }

    fn record(&mut self, outcome: DeliveryOutcome) {
        match outcome {
            DeliveryOutcome::Delivered => self.delivered += 1,
            DeliveryOutcome::Rejected => self.rejected += 1,
            DeliveryOutcome::Unreadable => self.unreadable += 1,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// Candidates attempted this round.
    pub fn processed(&self) -> usize {
        self.delivered + self.rejected + self.unreadable
    }
}

// ─────────────────────────────────────────────
// RoundExecutor
// ─────────────────────────────────────────────

/// What to poll and where processed messages go.
#[derive(Clone, Debug)]
pub struct RoundExecutor {
    mailbox: String,
    pattern: String,
    outbox: Option<String>,
    errbox: Option<String>,
    stage: MessageStage,
}

impl RoundExecutor {
    /// Poll `mailbox` (blank = "INBOX") for subjects containing `pattern`.
    pub fn new(mailbox: &str, pattern: &str) -> Self {
        Self {
            mailbox: non_empty(mailbox).unwrap_or(DEFAULT_MAILBOX).to_string(),
            pattern: pattern.to_string(),
            outbox: None,
            errbox: None,
            stage: MessageStage::default(),
        }
    }

    pub fn from_config(config: &DeliveryConfig) -> Self {
        Self {
            mailbox: config.mailbox().to_string(),
            pattern: config.pattern.clone(),
            outbox: config.outbox().map(String::from),
            errbox: config.errbox().map(String::from),
            stage: MessageStage::new(config.spill_threshold_bytes),
        }
    }

    /// Move delivered messages here. Blank disables.
    pub fn with_outbox(mut self, outbox: &str) -> Self {
        self.outbox = non_empty(outbox).map(String::from);
        self
    }

    /// Move rejected messages here. Blank disables.
    pub fn with_errbox(mut self, errbox: &str) -> Self {
        self.errbox = non_empty(errbox).map(String::from);
        self
    }

    pub fn with_stage(mut self, stage: MessageStage) -> Self {
        self.stage = stage;
        self
    }

    pub fn mailbox(&self) -> &str {
        &self.mailbox
    }

    /// Seen messages are candidates only when both relocation targets are
    /// set; relocation then keeps processed messages out of the mailbox.
    pub fn include_seen(&self) -> bool {
        self.outbox.is_some() && self.errbox.is_some()
    }

    /// Run one round. The session is connected on entry and closed (with
    /// expunge) before returning, whatever happened in between.
    pub async fn run_round<S, D>(&self, session: &mut S, deliver: &D) -> RoundResult
    where
        S: MailboxSession + ?Sized,
        D: Deliver + ?Sized,
    {
        let name = session.describe();
        info!(session = %name, mailbox = %self.mailbox, pattern = %self.pattern, "round started");
        if let Err(e) = session.connect().await {
            error!(session = %name, error = %e, "connect failed");
            return RoundResult::failed(RoundError::Connect {
                session: name,
                source: e,
            });
        }

        let result = self.list_and_deliver(session, deliver, &name).await;

        if let Err(e) = session.close(true).await {
            warn!(session = %name, error = %e, "close failed");
        }
        result
    }

    async fn list_and_deliver<S, D>(&self, session: &mut S, deliver: &D, name: &str) -> RoundResult
    where
        S: MailboxSession + ?Sized,
        D: Deliver + ?Sized,
    {
        let ids = match session
            .list(&self.mailbox, &self.pattern, self.include_seen())
            .await
        {
            Ok(ids) => ids,
            Err(e) => {
                error!(session = %name, mailbox = %self.mailbox, error = %e, "list failed");
                return RoundResult::failed(RoundError::List {
                    session: name.to_string(),
                    mailbox: self.mailbox.clone(),
                    source: e,
                });
            }
        };
        debug!(mailbox = %self.mailbox, count = ids.len(), "candidates listed");

        let mut result = RoundResult::default();
        for id in &ids {
            let outcome = self.process(session, deliver, id).await;
            debug!(uid = %id, outcome = %outcome, "candidate processed");
            result.record(outcome);
        }
        result
    }

    async fn process<S, D>(&self, session: &mut S, deliver: &D, id: &Candidate) -> DeliveryOutcome
    where
        S: MailboxSession + ?Sized,
        D: Deliver + ?Sized,
    {
        let mut staged = match self.stage.stage(session, id).await {
            Ok(staged) => staged,
            Err(e) => {
                error!(uid = %id, error = %e, "read failed");
                return DeliveryOutcome::Unreadable;
            }
        };

        let digest = staged.digest().to_vec();
        let delivered = deliver.deliver(&mut staged, id, &digest).await;
        staged.release();

        if let Err(e) = delivered {
            error!(uid = %id, error = %e, "deliver failed");
            if let Some(errbox) = &self.errbox {
                if let Err(e) = session.move_to(id, errbox).await {
                    error!(uid = %id, errbox = %errbox, error = %e, "move to errbox failed");
                }
            }
            return DeliveryOutcome::Rejected;
        }

        if let Err(e) = session.mark(id, true).await {
            warn!(uid = %id, error = %e, "mark seen failed");
        }
        if let Some(outbox) = &self.outbox {
            if let Err(e) = session.move_to(id, outbox).await {
                warn!(uid = %id, outbox = %outbox, error = %e, "move to outbox failed");
            }
        }
        DeliveryOutcome::Delivered
    }
}

/// One round without a loop, for callers that schedule rounds themselves.
/// A blank mailbox in `config` means "INBOX".
pub async fn deliver_once<S, D>(session: &mut S, config: &DeliveryConfig, deliver: &D) -> RoundResult
where
    S: MailboxSession + ?Sized,
    D: Deliver + ?Sized,
{
    let result = RoundExecutor::from_config(config)
        .run_round(session, deliver)
        .await;
    match &result.error {
        Some(e) => error!(delivered = result.delivered, error = %e, "single round failed"),
        None => info!(delivered = result.delivered, "single round complete"),
    }
    result
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek, SeekFrom, Write};
    use std::sync::{Arc, Mutex};

    use mailpull_core::StagedMessage;
    use mailpull_sessions::memory::MemoryStore;

    fn raw(subject: &str) -> String {
        format!("From: a@example.com\r\nSubject: {subject}\r\n\r\nbody of {subject}\r\n")
    }

    /// Records every delivery; rejects bodies whose subject is listed.
    #[derive(Default)]
    struct Recorder {
        reject: Vec<String>,
        seen: Mutex<Vec<(Candidate, Vec<u8>, Vec<u8>)>>,
    }

    impl Recorder {
        fn rejecting(subjects: &[&str]) -> Self {
            Self {
                reject: subjects.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            }
        }

        fn bodies(&self) -> Vec<String> {
            self.seen
                .lock()
                .unwrap()
                .iter()
                .map(|(_, body, _)| String::from_utf8_lossy(body).into_owned())
                .collect()
        }
    }

    #[async_trait::async_trait]
    impl Deliver for Recorder {
        async fn deliver(
            &self,
            body: &mut StagedMessage,
            id: &Candidate,
            digest: &[u8],
        ) -> anyhow::Result<()> {
            let raw = body.read_all()?;
            self.seen
                .lock()
                .unwrap()
                .push((id.clone(), raw.clone(), digest.to_vec()));
            let text = String::from_utf8_lossy(&raw);
            for subject in &self.reject {
                if text.contains(&format!("Subject: {subject}\r\n")) {
                    anyhow::bail!("rejected {subject}");
                }
            }
            Ok(())
        }
    }

    fn expected_digest(bytes: &[u8]) -> Vec<u8> {
        let mut w = MessageStage::default().writer();
        w.write_all(bytes).unwrap();
        w.finish().unwrap().digest().to_vec()
    }

    #[tokio::test]
    async fn test_outbox_only_scenario() {
        let store = MemoryStore::new();
        store.create_mailbox("Processed");
        let a = store.append("INBOX", raw("A"));
        let b = store.append("INBOX", raw("B"));
        let c = store.append("INBOX", raw("C"));

        let executor = RoundExecutor::new("", "").with_outbox("Processed");
        let recorder = Recorder::rejecting(&["B"]);
        let mut session = store.session();

        let result = executor.run_round(&mut session, &recorder).await;
        assert!(result.is_ok());
        assert_eq!(result.delivered, 2);
        assert_eq!(result.rejected, 1);

        // B stays, unseen; A and C moved and seen
        assert_eq!(store.uids("INBOX"), vec![b]);
        assert_eq!(store.is_seen("INBOX", b), Some(false));
        let processed = store.uids("Processed");
        assert_eq!(processed.len(), 2);
        for uid in processed {
            assert_eq!(store.is_seen("Processed", uid), Some(true));
        }
        let moved: Vec<_> = store
            .messages("Processed")
            .into_iter()
            .map(|m| String::from_utf8(m).unwrap())
            .collect();
        assert_eq!(moved, vec![raw("A"), raw("C")]);

        // Delivered in listing order
        let ids: Vec<_> = recorder
            .seen
            .lock()
            .unwrap()
            .iter()
            .map(|(id, _, _)| id.clone())
            .collect();
        assert_eq!(
            ids,
            vec![Candidate::from_uid(a), Candidate::from_uid(b), Candidate::from_uid(c)]
        );

        // B comes back next round
        let again = Recorder::rejecting(&["B"]);
        let result = executor.run_round(&mut store.session(), &again).await;
        assert_eq!(result.delivered, 0);
        assert_eq!(result.rejected, 1);
        assert_eq!(again.bodies(), vec![raw("B")]);
    }

    #[tokio::test]
    async fn test_connect_failure() {
        let store = MemoryStore::new();
        store.append("INBOX", raw("A"));
        store.fail_connect(true);

        let recorder = Recorder::default();
        let result = RoundExecutor::new("INBOX", "")
            .run_round(&mut store.session(), &recorder)
            .await;

        assert_eq!(result.delivered, 0);
        assert!(matches!(result.error, Some(RoundError::Connect { .. })));
        assert_eq!(store.stats().lists, 0);
        assert!(recorder.bodies().is_empty());
    }

    #[tokio::test]
    async fn test_list_failure_processes_nothing_and_closes() {
        let store = MemoryStore::new();
        store.append("INBOX", raw("A"));
        store.fail_list(true);

        let recorder = Recorder::default();
        let result = RoundExecutor::new("INBOX", "")
            .run_round(&mut store.session(), &recorder)
            .await;

        assert_eq!(result.delivered, 0);
        assert_eq!(result.processed(), 0);
        match result.error {
            Some(RoundError::List { mailbox, .. }) => assert_eq!(mailbox, "INBOX"),
            other => panic!("expected list error, got {:?}", other),
        }
        assert!(recorder.bodies().is_empty());
        assert_eq!(store.stats().closes, 1);
        assert_eq!(store.stats().reads, 0);
    }

    #[tokio::test]
    async fn test_missing_mailbox_is_list_error() {
        let store = MemoryStore::new();
        let result = RoundExecutor::new("Orders", "")
            .run_round(&mut store.session(), &Recorder::default())
            .await;
        assert!(matches!(result.error, Some(RoundError::List { .. })));
    }

    #[tokio::test]
    async fn test_empty_mailbox() {
        let store = MemoryStore::new();
        let result = RoundExecutor::new("INBOX", "")
            .run_round(&mut store.session(), &Recorder::default())
            .await;
        assert!(result.is_ok());
        assert_eq!(result.delivered, 0);
        assert_eq!(store.stats().connects, 1);
        assert_eq!(store.stats().closes, 1);
    }

    #[tokio::test]
    async fn test_rejected_goes_to_errbox_unseen() {
        let store = MemoryStore::new();
        store.create_mailbox("Failed");
        store.append("INBOX", raw("bad"));

        let result = RoundExecutor::new("INBOX", "")
            .with_errbox("Failed")
            .run_round(&mut store.session(), &Recorder::rejecting(&["bad"]))
            .await;

        assert_eq!(result.delivered, 0);
        assert_eq!(result.rejected, 1);
        assert!(store.uids("INBOX").is_empty());
        let failed = store.uids("Failed");
        assert_eq!(failed.len(), 1);
        assert_eq!(store.is_seen("Failed", failed[0]), Some(false));
        assert_eq!(store.stats().marks, 0);
    }

    #[tokio::test]
    async fn test_errbox_move_failure_leaves_message_unseen() {
        let store = MemoryStore::new();
        let bad = store.append("INBOX", raw("bad"));
        let good = store.append("INBOX", raw("good"));

        // "Failed" does not exist, so the relocation fails
        let result = RoundExecutor::new("INBOX", "")
            .with_errbox("Failed")
            .run_round(&mut store.session(), &Recorder::rejecting(&["bad"]))
            .await;

        assert!(result.is_ok());
        assert_eq!(result.delivered, 1);
        assert_eq!(store.is_seen("INBOX", bad), Some(false));
        assert_eq!(store.is_seen("INBOX", good), Some(true));
    }

    #[tokio::test]
    async fn test_mark_failure_still_counts_and_moves() {
        let store = MemoryStore::new();
        store.create_mailbox("Done");
        let uid = store.append("INBOX", raw("A"));
        store.fail_mark(uid);

        let result = RoundExecutor::new("INBOX", "")
            .with_outbox("Done")
            .run_round(&mut store.session(), &Recorder::default())
            .await;

        assert_eq!(result.delivered, 1);
        assert!(store.uids("INBOX").is_empty());
        assert_eq!(store.uids("Done").len(), 1);
    }

    #[tokio::test]
    async fn test_outbox_move_failure_keeps_mark_and_count() {
        let store = MemoryStore::new();
        let uid = store.append("INBOX", raw("A"));

        let result = RoundExecutor::new("INBOX", "")
            .with_outbox("Nowhere")
            .run_round(&mut store.session(), &Recorder::default())
            .await;

        assert!(result.is_ok());
        assert_eq!(result.delivered, 1);
        assert_eq!(store.is_seen("INBOX", uid), Some(true));
        assert_eq!(store.stats().marks, 1);
    }

    #[tokio::test]
    async fn test_unreadable_candidate_is_skipped() {
        let store = MemoryStore::new();
        let broken = store.append("INBOX", raw("broken"));
        let fine = store.append("INBOX", raw("fine"));
        store.fail_read(broken);

        let recorder = Recorder::default();
        let result = RoundExecutor::new("INBOX", "")
            .run_round(&mut store.session(), &recorder)
            .await;

        assert!(result.is_ok());
        assert_eq!(result.delivered, 1);
        assert_eq!(result.unreadable, 1);
        assert_eq!(recorder.bodies(), vec![raw("fine")]);
        assert_eq!(store.is_seen("INBOX", broken), Some(false));
        assert_eq!(store.is_seen("INBOX", fine), Some(true));
    }

    #[tokio::test]
    async fn test_both_boxes_include_seen_messages() {
        let store = MemoryStore::new();
        store.create_mailbox("Done");
        store.create_mailbox("Failed");
        store.append_seen("INBOX", raw("old"));
        store.append("INBOX", raw("new"));

        let executor = RoundExecutor::new("INBOX", "")
            .with_outbox("Done")
            .with_errbox("Failed");
        assert!(executor.include_seen());

        let result = executor
            .run_round(&mut store.session(), &Recorder::default())
            .await;
        assert_eq!(result.delivered, 2);
        assert!(store.uids("INBOX").is_empty());
        assert_eq!(store.uids("Done").len(), 2);
    }

    #[tokio::test]
    async fn test_seen_messages_skipped_without_both_boxes() {
        let store = MemoryStore::new();
        store.create_mailbox("Done");
        store.append_seen("INBOX", raw("old"));

        let executor = RoundExecutor::new("INBOX", "").with_outbox("Done");
        assert!(!executor.include_seen());
        let result = executor
            .run_round(&mut store.session(), &Recorder::default())
            .await;
        assert_eq!(result.delivered, 0);
        assert_eq!(store.uids("INBOX").len(), 1);
    }

    #[tokio::test]
    async fn test_pattern_filters_candidates() {
        let store = MemoryStore::new();
        store.append("INBOX", raw("newsletter"));
        store.append("INBOX", raw("Invoice #12"));

        let recorder = Recorder::default();
        let result = RoundExecutor::new("INBOX", "invoice")
            .run_round(&mut store.session(), &recorder)
            .await;
        assert_eq!(result.delivered, 1);
        assert_eq!(recorder.bodies(), vec![raw("Invoice #12")]);
    }

    #[tokio::test]
    async fn test_callback_sees_rereadable_body_and_digest() {
        let store = MemoryStore::new();
        let body = format!("Subject: big\r\n\r\n{}", "y".repeat(5000));
        store.append("INBOX", body.clone());

        let checks = Arc::new(Mutex::new(Vec::new()));
        let sink = checks.clone();
        let deliver = move |staged: &mut StagedMessage, _: &Candidate, digest: &[u8]| -> anyhow::Result<()> {
            let mut head = [0u8; 8];
            staged.read_exact(&mut head)?;
            staged.seek(SeekFrom::Start(0))?;
            let mut all = Vec::new();
            staged.read_to_end(&mut all)?;
            sink.lock().unwrap().push((head.to_vec(), all, digest.to_vec(), staged.is_spilled()));
            Ok(())
        };

        let executor = RoundExecutor::new("INBOX", "").with_stage(MessageStage::new(256));
        let result = executor.run_round(&mut store.session(), &deliver).await;
        assert_eq!(result.delivered, 1);

        let checks = checks.lock().unwrap();
        let (head, all, digest, spilled) = &checks[0];
        assert_eq!(head.as_slice(), b"Subject:");
        assert_eq!(all, body.as_bytes());
        assert_eq!(digest, &expected_digest(body.as_bytes()));
        assert!(*spilled);
    }

    #[tokio::test]
    async fn test_digest_reproducible_across_rounds() {
        let store = MemoryStore::new();
        let uid = store.append("INBOX", raw("same"));
        store.fail_mark(uid);

        let first = Recorder::default();
        RoundExecutor::new("INBOX", "")
            .run_round(&mut store.session(), &first)
            .await;
        let second = Recorder::default();
        RoundExecutor::new("INBOX", "")
            .run_round(&mut store.session(), &second)
            .await;

        let d1 = first.seen.lock().unwrap()[0].2.clone();
        let d2 = second.seen.lock().unwrap()[0].2.clone();
        assert_eq!(d1, d2);
        assert_eq!(d1, expected_digest(raw("same").as_bytes()));
    }

    #[tokio::test]
    async fn test_deliver_once_defaults_mailbox() {
        let store = MemoryStore::new();
        store.append("INBOX", raw("A"));
        let config = DeliveryConfig {
            mailbox: String::new(),
            ..Default::default()
        };
        let result = deliver_once(&mut store.session(), &config, &Recorder::default()).await;
        assert_eq!(result.delivered, 1);
    }

    #[test]
    fn test_from_config() {
        let config = DeliveryConfig {
            mailbox: "Orders".into(),
            pattern: "PO".into(),
            outbox: "Orders/Done".into(),
            errbox: " ".into(),
            ..Default::default()
        };
        let executor = RoundExecutor::from_config(&config);
        assert_eq!(executor.mailbox(), "Orders");
        assert_eq!(executor.outbox.as_deref(), Some("Orders/Done"));
        assert_eq!(executor.errbox, None);
        assert!(!executor.include_seen());
    }
}
