//! Exchange manager.
//!
//! Owns every live session, opens their subscriptions before requests are
//! published, and guarantees each session reaches exactly one terminal state.

use crate::config::ExchangeConfig;
use crate::correlation::{CorrelationKey, CorrelationStrategy, KindSet, Reply};
use crate::error::{ExchangeError, Result};
use crate::event::EventTemplate;
use crate::session::{
    Driver, Outcome, ResultSlot, SessionHandle, SessionId, SessionSpec, SessionState,
};
use crate::transport::{Decryptor, EventSigner, RelayTransport};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// A request to publish and the replies that answer it.
#[derive(Debug, Clone)]
pub struct ExchangeRequest {
    template: EventTemplate,
    strategy: CorrelationStrategy,
    reply_kinds: KindSet,
    timeout: Option<Duration>,
    decrypt: bool,
    recipient: Option<String>,
}

impl ExchangeRequest {
    /// Request correlated by back-reference, with no reply kinds yet.
    pub fn new(template: EventTemplate) -> Self {
        Self {
            template,
            strategy: CorrelationStrategy::BackReference,
            reply_kinds: KindSet::new(),
            timeout: None,
            decrypt: false,
            recipient: None,
        }
    }

    /// Accept replies of these kinds.
    pub fn reply_kinds(mut self, kinds: impl IntoIterator<Item = u16>) -> Self {
        self.reply_kinds.extend(kinds);
        self
    }

    pub fn strategy(mut self, strategy: CorrelationStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Decrypt reply content before correlating it.
    pub fn decrypt(mut self, decrypt: bool) -> Self {
        self.decrypt = decrypt;
        self
    }

    /// Only accept replies tagging this pubkey.
    pub fn recipient(mut self, pubkey: impl Into<String>) -> Self {
        self.recipient = Some(pubkey.into());
        self
    }
}

/// Live session bookkeeping. Removing an entry from the map is what makes a
/// caller the session's terminal writer.
pub(crate) struct SessionEntry {
    subscription_id: String,
    slot: ResultSlot,
    state: watch::Sender<SessionState>,
    driver: Option<JoinHandle<()>>,
}

pub(crate) struct ManagerInner {
    transport: Arc<dyn RelayTransport>,
    signer: Arc<dyn EventSigner>,
    decryptor: Option<Arc<dyn Decryptor>>,
    config: ExchangeConfig,
    sessions: Mutex<HashMap<SessionId, SessionEntry>>,
    closed: AtomicBool,
}

/// Coordinates request/reply exchanges over a relay.
#[derive(Clone)]
pub struct ExchangeManager {
    inner: Arc<ManagerInner>,
}

impl ExchangeManager {
    /// Create a manager over the given collaborators.
    pub fn new(
        transport: Arc<dyn RelayTransport>,
        signer: Arc<dyn EventSigner>,
        config: ExchangeConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                transport,
                signer,
                decryptor: None,
                config,
                sessions: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Install the decryption hook used by sessions that request it.
    ///
    /// Fails if the manager has already been cloned or has open sessions.
    pub fn with_decryptor(mut self, decryptor: Arc<dyn Decryptor>) -> Result<Self> {
        let Some(inner) = Arc::get_mut(&mut self.inner) else {
            return Err(ExchangeError::InvalidRequest(
                "decryptor must be installed before the manager is shared".to_string(),
            ));
        };
        inner.decryptor = Some(decryptor);
        Ok(self)
    }

    pub fn config(&self) -> &ExchangeConfig {
        &self.inner.config
    }

    /// Public key of the signing identity.
    pub fn public_key(&self) -> Result<String> {
        self.inner.signer.public_key()
    }

    /// Number of sessions still pending.
    pub fn live_sessions(&self) -> usize {
        self.inner.lock().len()
    }

    /// Sign, open a session and publish the request.
    ///
    /// The subscription is active before the request leaves, so a fast reply
    /// can't be missed. If publishing fails the session is torn down and
    /// `PublishFailed` returned without waiting.
    pub async fn submit(&self, request: ExchangeRequest) -> Result<SessionHandle> {
        let ExchangeRequest {
            template,
            strategy,
            reply_kinds,
            timeout,
            decrypt,
            recipient,
        } = request;

        self.inner.ensure_open()?;
        let event = self.inner.signer.sign(template)?;

        let key = match strategy {
            CorrelationStrategy::BackReference => CorrelationKey::BackReference {
                request_id: event.id.clone(),
                tag: self.inner.config.reference_tag.clone(),
            },
            CorrelationStrategy::PayloadSecret { secret } => CorrelationKey::PayloadSecret {
                secret,
                field: self.inner.config.secret_field.clone(),
            },
        };

        let mut spec = SessionSpec::new(key, reply_kinds).decrypt(decrypt);
        spec.timeout = timeout;
        spec.recipient = recipient;

        let mut handle = self.inner.open(spec).await?;
        handle.request_id = Some(event.id.clone());

        let event_id = event.id.clone();
        let kind = event.kind;
        if let Err(e) = self.inner.transport.publish(event).await {
            warn!("Publishing request {} failed: {}", event_id, e);
            self.inner.abandon(handle.id()).await;
            return Err(ExchangeError::PublishFailed(e));
        }

        info!(
            "Dispatched kind {} request {} as session {} (timeout {:?})",
            kind,
            event_id,
            handle.id(),
            handle.timeout()
        );
        Ok(handle)
    }

    /// Submit a request and wait for its outcome.
    pub async fn dispatch(&self, request: ExchangeRequest) -> Result<Reply> {
        self.submit(request).await?.wait().await
    }

    /// Open a session without publishing anything, for exchanges where the
    /// counterparty speaks first.
    pub async fn listen(&self, spec: SessionSpec) -> Result<SessionHandle> {
        self.inner.ensure_open()?;
        let handle = self.inner.open(spec).await?;
        info!(
            "Listening as session {} (timeout {:?})",
            handle.id(),
            handle.timeout()
        );
        Ok(handle)
    }

    /// Cancel a pending session. Returns false if it was already terminal.
    pub async fn cancel(&self, id: &SessionId) -> bool {
        self.inner.cancel(id).await
    }

    /// Cancel every pending session and refuse new ones.
    pub async fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let ids: Vec<SessionId> = self.inner.lock().keys().cloned().collect();
        info!("Shutting down exchange, cancelling {} sessions", ids.len());
        futures::future::join_all(ids.iter().map(|id| self.inner.cancel(id))).await;
    }
}

impl ManagerInner {
    fn lock(&self) -> MutexGuard<'_, HashMap<SessionId, SessionEntry>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ExchangeError::InvalidRequest(
                "exchange manager is shut down".to_string(),
            ));
        }
        Ok(())
    }

    fn take(&self, id: &SessionId) -> Option<SessionEntry> {
        self.lock().remove(id)
    }

    /// Subscribe, arm the deadline and start the session driver.
    pub(crate) async fn open(self: &Arc<Self>, spec: SessionSpec) -> Result<SessionHandle> {
        if spec.kinds.is_empty() {
            return Err(ExchangeError::InvalidRequest(
                "no reply kinds given".to_string(),
            ));
        }
        let decryptor = match (spec.decrypt, &self.decryptor) {
            (false, _) => None,
            (true, Some(decryptor)) => Some(Arc::clone(decryptor)),
            (true, None) => {
                return Err(ExchangeError::InvalidRequest(
                    "decryption requested but no decryptor configured".to_string(),
                ));
            }
        };

        let id = {
            let sessions = self.lock();
            let mut id = SessionId::generate();
            while sessions.contains_key(&id) {
                id = SessionId::generate();
            }
            id
        };
        let subscription_id = id.subscription_id();

        let events = self
            .transport
            .subscribe(&subscription_id, &[spec.filter()])
            .await
            .map_err(ExchangeError::Subscription)?;

        let timeout = spec.timeout.unwrap_or_else(|| self.config.default_timeout());
        let deadline = Instant::now() + timeout;
        let (result_tx, result_rx) = oneshot::channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Pending);

        let driver = Driver {
            session_id: id.clone(),
            key: spec.key,
            kinds: spec.kinds,
            decryptor,
            recipient: spec.recipient,
            deadline,
            timeout,
            max_batch: self.config.max_batch.max(1),
        };

        let registered = {
            let mut sessions = self.lock();
            // Shutdown may have run while the subscription was being opened.
            if self.closed.load(Ordering::SeqCst) {
                false
            } else {
                sessions.insert(
                    id.clone(),
                    SessionEntry {
                        subscription_id: subscription_id.clone(),
                        slot: ResultSlot::new(id.clone(), result_tx),
                        state: state_tx,
                        driver: None,
                    },
                );

                let inner = Arc::clone(self);
                let session_id = id.clone();
                let task = tokio::spawn(async move {
                    let outcome = driver.run(events).await;
                    inner.finish(&session_id, outcome).await;
                });
                if let Some(entry) = sessions.get_mut(&id) {
                    entry.driver = Some(task);
                }
                true
            }
        };
        if !registered {
            self.release(&subscription_id).await;
            return Err(ExchangeError::InvalidRequest(
                "exchange manager is shut down".to_string(),
            ));
        }

        debug!(
            "Opened session {} on subscription {}",
            id, subscription_id
        );

        Ok(SessionHandle {
            id,
            subscription_id,
            request_id: None,
            timeout,
            result: Some(result_rx),
            state: state_rx,
            inner: Arc::clone(self),
        })
    }

    /// Record a driver's outcome, unless a cancel got there first.
    async fn finish(&self, id: &SessionId, outcome: Outcome) {
        let Some(mut entry) = self.take(id) else {
            debug!("Session {} already terminal, discarding outcome", id);
            return;
        };

        let (state, result) = match outcome {
            Outcome::Resolved(reply) => {
                info!("Session {} resolved by event {}", id, reply.event.id);
                (SessionState::Resolved, Ok(reply))
            }
            Outcome::TimedOut(after) => {
                warn!("Session {} timed out after {:?}", id, after);
                (SessionState::TimedOut, Err(ExchangeError::Timeout { after }))
            }
        };

        entry.state.send_replace(state);
        self.release(&entry.subscription_id).await;
        entry.slot.fill_or_report(result);
    }

    /// Cancel a pending session, releasing its subscription before returning.
    pub(crate) async fn cancel(&self, id: &SessionId) -> bool {
        let Some(mut entry) = self.take(id) else {
            return false;
        };

        entry.state.send_replace(SessionState::Cancelled);
        if let Some(driver) = entry.driver.take() {
            driver.abort();
        }
        self.release(&entry.subscription_id).await;
        entry.slot.fill_or_report(Err(ExchangeError::Cancelled));
        info!("Session {} cancelled", id);
        true
    }

    /// Cancel from a synchronous context; the unsubscribe runs on the runtime.
    pub(crate) fn cancel_detached(&self, id: &SessionId) {
        let Some(mut entry) = self.take(id) else {
            return;
        };

        entry.state.send_replace(SessionState::Cancelled);
        if let Some(driver) = entry.driver.take() {
            driver.abort();
        }
        entry.slot.fill_or_report(Err(ExchangeError::Cancelled));
        info!("Session {} cancelled on drop", id);

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let transport = Arc::clone(&self.transport);
                let subscription_id = entry.subscription_id;
                runtime.spawn(async move {
                    if let Err(e) = transport.unsubscribe(&subscription_id).await {
                        warn!("Failed to close subscription {}: {}", subscription_id, e);
                    }
                });
            }
            Err(_) => warn!(
                "No runtime to close subscription {}",
                entry.subscription_id
            ),
        }
    }

    /// Tear down a session whose request never went out.
    async fn abandon(&self, id: &SessionId) {
        let Some(mut entry) = self.take(id) else {
            return;
        };

        entry.state.send_replace(SessionState::Cancelled);
        if let Some(driver) = entry.driver.take() {
            driver.abort();
        }
        self.release(&entry.subscription_id).await;
        debug!("Session {} abandoned", id);
    }

    async fn release(&self, subscription_id: &str) {
        if let Err(e) = self.transport.unsubscribe(subscription_id).await {
            warn!("Failed to close subscription {}: {}", subscription_id, e);
        }
    }
}
