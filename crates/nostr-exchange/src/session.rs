//! Exchange sessions.
//!
//! A session is one outstanding request. It owns a relay subscription, a
//! deadline and a single-fire result slot, and moves through
//! `Pending -> {Resolved, TimedOut, Cancelled}` exactly once.

use crate::correlation::{
    CorrelationKey, KindSet, Mismatch, Reply, Verdict, correlate, select_winner,
};
use crate::error::{ExchangeError, Result};
use crate::event::Event;
use crate::filter::Filter;
use crate::manager::ManagerInner;
use crate::transport::Decryptor;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

/// Identifier of a live session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a fresh random id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Subscription id used with the relay for this session.
    pub fn subscription_id(&self) -> String {
        format!("exchange-{}", self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Subscription active, timer running
    Pending,
    /// A matching reply was accepted
    Resolved,
    /// Deadline elapsed with no match
    TimedOut,
    /// Caller aborted before resolution
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionState::Pending)
    }
}

/// What a session listens for.
#[derive(Debug, Clone)]
pub struct SessionSpec {
    pub(crate) key: CorrelationKey,
    pub(crate) kinds: KindSet,
    pub(crate) timeout: Option<Duration>,
    pub(crate) decrypt: bool,
    pub(crate) recipient: Option<String>,
    pub(crate) since: Option<u64>,
}

impl SessionSpec {
    /// Listen for replies of `kinds` correlated by `key`.
    pub fn new(key: CorrelationKey, kinds: impl IntoIterator<Item = u16>) -> Self {
        Self {
            key,
            kinds: kinds.into_iter().collect(),
            timeout: None,
            decrypt: false,
            recipient: None,
            since: None,
        }
    }

    /// Deadline relative to open; the manager default applies otherwise.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Run the decryption hook on every candidate before correlation.
    pub fn decrypt(mut self, decrypt: bool) -> Self {
        self.decrypt = decrypt;
        self
    }

    /// Only accept replies tagging this pubkey (`#p`).
    pub fn recipient(mut self, pubkey: impl Into<String>) -> Self {
        self.recipient = Some(pubkey.into());
        self
    }

    /// Ignore stored events older than this timestamp.
    pub fn since(mut self, timestamp: u64) -> Self {
        self.since = Some(timestamp);
        self
    }

    pub fn key(&self) -> &CorrelationKey {
        &self.key
    }

    /// Relay filter covering the replies this session can accept.
    ///
    /// Relays only index single-letter tags, so longer reference tag names are
    /// left to local correlation.
    pub fn filter(&self) -> Filter {
        let mut filter = Filter::new().kinds(self.kinds.iter().copied());
        if let CorrelationKey::BackReference { request_id, tag } = &self.key
            && tag.chars().count() == 1
        {
            filter = filter.tag(tag.clone(), vec![request_id.clone()]);
        }
        if let Some(recipient) = &self.recipient {
            filter = filter.pubkey_refs(vec![recipient.clone()]);
        }
        if let Some(since) = self.since {
            filter = filter.since(since);
        }
        filter
    }
}

/// Single-fire result slot.
pub(crate) struct ResultSlot {
    session_id: SessionId,
    sender: Option<oneshot::Sender<Result<Reply>>>,
}

impl ResultSlot {
    pub(crate) fn new(session_id: SessionId, sender: oneshot::Sender<Result<Reply>>) -> Self {
        Self {
            session_id,
            sender: Some(sender),
        }
    }

    /// Write the outcome. A second write is an invariant violation.
    pub(crate) fn fill(&mut self, outcome: Result<Reply>) -> Result<()> {
        let Some(sender) = self.sender.take() else {
            return Err(ExchangeError::DuplicateResolution(
                self.session_id.to_string(),
            ));
        };
        // The caller may have stopped listening.
        let _ = sender.send(outcome);
        Ok(())
    }

    pub(crate) fn fill_or_report(&mut self, outcome: Result<Reply>) {
        if let Err(e) = self.fill(outcome) {
            error!("Session result written twice: {}", e);
            debug_assert!(false, "{}", e);
        }
    }
}

/// Terminal outcome produced by a session driver.
#[derive(Debug)]
pub(crate) enum Outcome {
    Resolved(Reply),
    TimedOut(Duration),
}

/// Per-session delivery loop: drains the subscription in batches until a
/// reply wins or the deadline passes.
pub(crate) struct Driver {
    pub(crate) session_id: SessionId,
    pub(crate) key: CorrelationKey,
    pub(crate) kinds: KindSet,
    pub(crate) decryptor: Option<Arc<dyn Decryptor>>,
    /// Pubkey every reply must tag with `p`, checked even if the relay ignores the filter.
    pub(crate) recipient: Option<String>,
    pub(crate) deadline: Instant,
    pub(crate) timeout: Duration,
    pub(crate) max_batch: usize,
}

impl Driver {
    pub(crate) async fn run(self, mut events: mpsc::Receiver<Event>) -> Outcome {
        let mut seen = HashSet::new();
        let sleep = tokio::time::sleep_until(self.deadline);
        tokio::pin!(sleep);
        let mut open = true;

        loop {
            tokio::select! {
                biased;

                received = events.recv(), if open => {
                    let Some(first) = received else {
                        warn!(
                            "Subscription for session {} ended before a reply",
                            self.session_id
                        );
                        open = false;
                        continue;
                    };

                    let mut batch = vec![first];
                    while batch.len() < self.max_batch {
                        match events.try_recv() {
                            Ok(event) => batch.push(event),
                            Err(_) => break,
                        }
                    }

                    if let Some(reply) = self.correlate_batch(batch, &mut seen) {
                        return Outcome::Resolved(reply);
                    }
                    // Unrelated traffic must not hold a session past its deadline.
                    if Instant::now() >= self.deadline {
                        return Outcome::TimedOut(self.timeout);
                    }
                }
                _ = &mut sleep => return Outcome::TimedOut(self.timeout),
            }
        }
    }

    fn correlate_batch(&self, batch: Vec<Event>, seen: &mut HashSet<String>) -> Option<Reply> {
        let mut matched = Vec::new();

        for event in batch {
            if let Err(e) = event.validate() {
                debug!("Session {} dropping event: {}", self.session_id, e);
                continue;
            }
            if !seen.insert(event.id.clone()) {
                trace!(
                    "Session {} ignoring duplicate event {}",
                    self.session_id, event.id
                );
                continue;
            }
            if let Some(recipient) = &self.recipient
                && !event.references("p", recipient)
            {
                trace!(
                    "Session {} event {} not addressed to {}",
                    self.session_id, event.id, recipient
                );
                continue;
            }

            match correlate(&event, &self.key, &self.kinds, self.decryptor.as_deref()) {
                Verdict::Match(reply) => matched.push(reply),
                Verdict::NoMatch(Mismatch::Decryption(reason)) => {
                    debug!(
                        "Session {} could not decrypt event {}: {}",
                        self.session_id, event.id, reason
                    );
                }
                Verdict::NoMatch(reason) => {
                    trace!(
                        "Session {} event {} not a reply: {:?}",
                        self.session_id, event.id, reason
                    );
                }
            }
        }

        if matched.len() > 1 {
            debug!(
                "Session {} received {} replies in one batch",
                self.session_id,
                matched.len()
            );
        }
        select_winner(matched)
    }
}

/// Caller's handle on a session.
///
/// Dropping a handle while the session is still pending cancels it.
pub struct SessionHandle {
    pub(crate) id: SessionId,
    pub(crate) subscription_id: String,
    pub(crate) request_id: Option<String>,
    pub(crate) timeout: Duration,
    pub(crate) result: Option<oneshot::Receiver<Result<Reply>>>,
    pub(crate) state: watch::Receiver<SessionState>,
    pub(crate) inner: Arc<ManagerInner>,
}

impl SessionHandle {
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn subscription_id(&self) -> &str {
        &self.subscription_id
    }

    /// Id of the published request, if this session answers one.
    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Wait for the terminal outcome.
    ///
    /// Returns the winning reply, `Timeout`, or `Cancelled`.
    pub async fn wait(mut self) -> Result<Reply> {
        let Some(result) = self.result.take() else {
            return Err(ExchangeError::Cancelled);
        };
        result.await.unwrap_or(Err(ExchangeError::Cancelled))
    }

    /// Cancel the session, releasing its subscription before returning.
    ///
    /// Returns false if the session had already reached a terminal state.
    pub async fn cancel(&self) -> bool {
        self.inner.cancel(&self.id).await
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if self.state() == SessionState::Pending {
            self.inner.cancel_detached(&self.id);
        }
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("subscription_id", &self.subscription_id)
            .field("request_id", &self.request_id)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_ids_unique() {
        let a = SessionId::generate();
        let b = SessionId::generate();
        assert_ne!(a, b);
        assert_ne!(a.subscription_id(), b.subscription_id());
        assert!(a.subscription_id().starts_with("exchange-"));
    }

    #[test]
    fn test_terminal_states() {
        assert!(!SessionState::Pending.is_terminal());
        assert!(SessionState::Resolved.is_terminal());
        assert!(SessionState::TimedOut.is_terminal());
        assert!(SessionState::Cancelled.is_terminal());
    }

    #[test]
    fn test_spec_filter_back_reference() {
        let spec = SessionSpec::new(CorrelationKey::back_reference("r1"), [6000]);
        let filter = spec.filter();
        assert_eq!(filter.kinds, Some(vec![6000]));
        assert_eq!(filter.tags.get("#e"), Some(&vec!["r1".to_string()]));
        assert!(filter.since.is_none());
    }

    #[test]
    fn test_spec_filter_long_tag_not_indexed() {
        let key = CorrelationKey::BackReference {
            request_id: "r1".to_string(),
            tag: "request".to_string(),
        };
        let filter = SessionSpec::new(key, [6000]).filter();
        assert!(filter.tags.is_empty());
    }

    #[test]
    fn test_spec_filter_payload_secret() {
        let filter = SessionSpec::new(CorrelationKey::payload_secret("s"), [24133])
            .recipient("me")
            .since(1000)
            .filter();
        assert_eq!(filter.tags.get("#p"), Some(&vec!["me".to_string()]));
        assert_eq!(filter.since, Some(1000));
        assert!(!filter.tags.contains_key("#e"));
    }

    #[test]
    fn test_result_slot_single_write() {
        let (tx, mut rx) = oneshot::channel();
        let mut slot = ResultSlot::new(SessionId::generate(), tx);
        assert!(slot.fill(Err(ExchangeError::Cancelled)).is_ok());
        assert!(matches!(
            slot.fill(Err(ExchangeError::Cancelled)),
            Err(ExchangeError::DuplicateResolution(_))
        ));
        assert!(matches!(rx.try_recv(), Ok(Err(ExchangeError::Cancelled))));
    }

    fn ack(id_char: char, tags: Vec<Vec<&str>>) -> Event {
        Event {
            id: id_char.to_string().repeat(64),
            pubkey: "remote".to_string(),
            created_at: 100,
            kind: 24133,
            tags: tags
                .into_iter()
                .map(|t| t.into_iter().map(String::from).collect())
                .collect(),
            content: r#"{"result":"s"}"#.to_string(),
            sig: String::new(),
        }
    }

    fn addressed_driver(timeout: Duration) -> Driver {
        Driver {
            session_id: SessionId::generate(),
            key: CorrelationKey::payload_secret("s"),
            kinds: [24133].into_iter().collect(),
            decryptor: None,
            recipient: Some("me".to_string()),
            deadline: Instant::now() + timeout,
            timeout,
            max_batch: 16,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_driver_skips_reply_not_addressed_to_recipient() {
        let (tx, rx) = mpsc::channel(8);
        tx.send(ack('a', vec![])).await.unwrap();
        tx.send(ack('b', vec![vec!["p", "someone-else"]])).await.unwrap();
        tx.send(ack('c', vec![vec!["p", "me"]])).await.unwrap();

        match addressed_driver(Duration::from_millis(500)).run(rx).await {
            Outcome::Resolved(reply) => assert_eq!(reply.event.id, "c".repeat(64)),
            other => panic!("expected resolution, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_driver_untagged_reply_times_out() {
        let (tx, rx) = mpsc::channel(8);
        tx.send(ack('a', vec![])).await.unwrap();

        let outcome = addressed_driver(Duration::from_millis(500)).run(rx).await;
        assert!(matches!(outcome, Outcome::TimedOut(t) if t == Duration::from_millis(500)));
        drop(tx);
    }

    #[test]
    fn test_result_slot_receiver_gone() {
        let (tx, rx) = oneshot::channel();
        drop(rx);
        let mut slot = ResultSlot::new(SessionId::generate(), tx);
        assert!(slot.fill(Err(ExchangeError::Cancelled)).is_ok());
    }
}
