//! In-process collaborators.
//!
//! `MemoryRelay` routes events between subscriptions inside one process,
//! `InMemorySigner` derives a deterministic identity from a name and
//! `SharedKeyCipher` is a symmetric stand-in for NIP-04/44 payload encryption.
//! None of them provide real cryptographic security.

use crate::error::{ExchangeError, Result};
use crate::event::{Event, EventTemplate, UnsignedEvent, get_event_hash, sort_replies};
use crate::filter::Filter;
use crate::transport::{Decryptor, EventSigner, RelayTransport};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, trace};

const SUBSCRIPTION_CAPACITY: usize = 1024;

struct MemorySubscription {
    filters: Vec<Filter>,
    sender: mpsc::Sender<Event>,
}

#[derive(Default)]
struct RelayState {
    events: Vec<Event>,
    subscriptions: HashMap<String, MemorySubscription>,
}

/// Relay that keeps events in memory and fans them out to matching
/// subscriptions. Stored events are replayed to new subscriptions.
#[derive(Default)]
pub struct MemoryRelay {
    state: Mutex<RelayState>,
    fail_publish: AtomicBool,
    subscribes: AtomicUsize,
    unsubscribes: AtomicUsize,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RelayState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make every following publish fail.
    pub fn set_fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    /// Store and route several events at once, so subscribers see them as one
    /// burst.
    pub fn publish_batch(&self, events: impl IntoIterator<Item = Event>) {
        let mut state = self.lock();
        for event in events {
            Self::route(&mut state, event);
        }
    }

    /// Every event accepted so far, in arrival order.
    pub fn published(&self) -> Vec<Event> {
        self.lock().events.clone()
    }

    /// Subscriptions currently open.
    pub fn open_subscriptions(&self) -> usize {
        self.lock().subscriptions.len()
    }

    pub fn subscribe_count(&self) -> usize {
        self.subscribes.load(Ordering::SeqCst)
    }

    pub fn unsubscribe_count(&self) -> usize {
        self.unsubscribes.load(Ordering::SeqCst)
    }

    fn route(state: &mut RelayState, event: Event) {
        for (id, subscription) in &state.subscriptions {
            if subscription.filters.iter().any(|f| f.matches(&event))
                && subscription.sender.try_send(event.clone()).is_err()
            {
                debug!("Subscription {} not accepting events", id);
            }
        }
        state.events.push(event);
    }
}

#[async_trait]
impl RelayTransport for MemoryRelay {
    async fn publish(&self, event: Event) -> std::result::Result<(), String> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err("relay unavailable".to_string());
        }
        trace!("Relay accepted event {} kind {}", event.id, event.kind);
        Self::route(&mut self.lock(), event);
        Ok(())
    }

    async fn subscribe(
        &self,
        subscription_id: &str,
        filters: &[Filter],
    ) -> std::result::Result<mpsc::Receiver<Event>, String> {
        let (sender, receiver) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        let mut state = self.lock();
        if state.subscriptions.contains_key(subscription_id) {
            return Err(format!("duplicate subscription id {}", subscription_id));
        }

        // Stored events replay oldest first.
        let mut stored: Vec<Event> = state
            .events
            .iter()
            .filter(|event| filters.iter().any(|f| f.matches(event)))
            .cloned()
            .collect();
        sort_replies(&mut stored);
        for event in stored {
            let _ = sender.try_send(event);
        }

        state.subscriptions.insert(
            subscription_id.to_string(),
            MemorySubscription {
                filters: filters.to_vec(),
                sender,
            },
        );
        self.subscribes.fetch_add(1, Ordering::SeqCst);
        Ok(receiver)
    }

    async fn unsubscribe(&self, subscription_id: &str) -> std::result::Result<(), String> {
        if self.lock().subscriptions.remove(subscription_id).is_some() {
            self.unsubscribes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Deterministic signer whose identity is derived from a name.
#[derive(Debug, Clone)]
pub struct InMemorySigner {
    pubkey: Option<String>,
}

impl InMemorySigner {
    /// Identity derived from `name`.
    pub fn new(name: &str) -> Self {
        Self {
            pubkey: Some(derive_pubkey(name)),
        }
    }

    /// Signer with no identity; every call fails with `SigningUnavailable`.
    pub fn unconfigured() -> Self {
        Self { pubkey: None }
    }

    /// Cipher bound to this identity.
    pub fn cipher(&self) -> Result<SharedKeyCipher> {
        Ok(SharedKeyCipher::new(self.public_key()?))
    }

    /// Check an event's id and signature.
    pub fn verify(event: &Event) -> bool {
        let unsigned = UnsignedEvent {
            pubkey: event.pubkey.clone(),
            created_at: event.created_at,
            kind: event.kind,
            tags: event.tags.clone(),
            content: event.content.clone(),
        };
        match get_event_hash(&unsigned) {
            Ok(id) => id == event.id && event.sig == signature(&event.pubkey, &id),
            Err(_) => false,
        }
    }
}

impl EventSigner for InMemorySigner {
    fn public_key(&self) -> Result<String> {
        self.pubkey
            .clone()
            .ok_or_else(|| ExchangeError::SigningUnavailable("no identity configured".to_string()))
    }

    fn sign(&self, template: EventTemplate) -> Result<Event> {
        let pubkey = self.public_key()?;
        let unsigned = UnsignedEvent {
            pubkey,
            created_at: template.created_at,
            kind: template.kind,
            tags: template.tags,
            content: template.content,
        };
        let id = get_event_hash(&unsigned)?;
        let sig = signature(&unsigned.pubkey, &id);

        Ok(Event {
            id,
            pubkey: unsigned.pubkey,
            created_at: unsigned.created_at,
            kind: unsigned.kind,
            tags: unsigned.tags,
            content: unsigned.content,
            sig,
        })
    }
}

fn derive_pubkey(name: &str) -> String {
    hex::encode(Sha256::digest(name.as_bytes()))
}

fn signature(pubkey: &str, id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(pubkey.as_bytes());
    hasher.update(id.as_bytes());
    hex::encode(hasher.finalize())
}

/// XOR cipher keyed on the two parties' pubkeys. Ciphertext is hex.
#[derive(Debug, Clone)]
pub struct SharedKeyCipher {
    pubkey: String,
}

impl SharedKeyCipher {
    pub fn new(pubkey: impl Into<String>) -> Self {
        Self {
            pubkey: pubkey.into(),
        }
    }

    /// Encrypt `plaintext` for `recipient`.
    pub fn encrypt(&self, plaintext: &str, recipient: &str) -> String {
        let key = shared_key(&self.pubkey, recipient);
        hex::encode(xor(plaintext.as_bytes(), &key))
    }

    fn open(&self, content: &str, counterparty: &str) -> Result<String> {
        let ciphertext = hex::decode(content)
            .map_err(|e| ExchangeError::DecryptionFailed(format!("ciphertext not hex: {}", e)))?;
        let key = shared_key(&self.pubkey, counterparty);
        String::from_utf8(xor(&ciphertext, &key))
            .map_err(|_| ExchangeError::DecryptionFailed("plaintext not utf-8".to_string()))
    }
}

impl Decryptor for SharedKeyCipher {
    fn decrypt(&self, content: &str, counterparty: &str) -> Result<String> {
        self.open(content, counterparty)
    }
}

fn shared_key(a: &str, b: &str) -> Vec<u8> {
    let (left, right) = if a <= b { (a, b) } else { (b, a) };
    let mut hasher = Sha256::new();
    hasher.update(left.as_bytes());
    hasher.update(right.as_bytes());
    hasher.finalize().to_vec()
}

fn xor(data: &[u8], key: &[u8]) -> Vec<u8> {
    data.iter()
        .enumerate()
        .map(|(idx, byte)| byte ^ key[idx % key.len()])
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signer_is_deterministic() {
        let alice = InMemorySigner::new("alice");
        assert_eq!(alice.public_key().unwrap(), InMemorySigner::new("alice").public_key().unwrap());
        assert_ne!(alice.public_key().unwrap(), InMemorySigner::new("bob").public_key().unwrap());

        let event = alice
            .sign(EventTemplate::new(5000, "hello").created_at(10))
            .unwrap();
        assert!(event.validate().is_ok());
        assert!(InMemorySigner::verify(&event));

        let mut tampered = event.clone();
        tampered.content = "bye".to_string();
        assert!(!InMemorySigner::verify(&tampered));
    }

    #[test]
    fn test_unconfigured_signer() {
        let signer = InMemorySigner::unconfigured();
        assert!(matches!(signer.public_key(), Err(ExchangeError::SigningUnavailable(_))));
        assert!(matches!(
            signer.sign(EventTemplate::new(1, "")),
            Err(ExchangeError::SigningUnavailable(_))
        ));
    }

    #[test]
    fn test_cipher_roundtrip_between_parties() {
        let alice = InMemorySigner::new("alice").cipher().unwrap();
        let bob = InMemorySigner::new("bob").cipher().unwrap();
        let alice_pk = InMemorySigner::new("alice").public_key().unwrap();
        let bob_pk = InMemorySigner::new("bob").public_key().unwrap();

        let sealed = alice.encrypt(r#"{"result":"ack"}"#, &bob_pk);
        assert_ne!(sealed, r#"{"result":"ack"}"#);
        assert_eq!(bob.decrypt(&sealed, &alice_pk).unwrap(), r#"{"result":"ack"}"#);
    }

    #[test]
    fn test_cipher_rejects_garbage() {
        let bob = SharedKeyCipher::new("bob");
        assert!(matches!(
            bob.decrypt("not hex", "alice"),
            Err(ExchangeError::DecryptionFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_relay_routes_and_replays() {
        let relay = MemoryRelay::new();
        let signer = InMemorySigner::new("alice");
        let stored = signer.sign(EventTemplate::new(6000, "old")).unwrap();
        relay.publish(stored.clone()).await.unwrap();

        let mut rx = relay
            .subscribe("sub", &[Filter::new().kinds([6000])])
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap().id, stored.id);

        let other = signer.sign(EventTemplate::new(1, "note")).unwrap();
        let live = signer.sign(EventTemplate::new(6000, "new")).unwrap();
        relay.publish_batch([other, live.clone()]);
        assert_eq!(rx.recv().await.unwrap().id, live.id);
        assert!(rx.try_recv().is_err());

        assert_eq!(relay.open_subscriptions(), 1);
        relay.unsubscribe("sub").await.unwrap();
        assert_eq!(relay.open_subscriptions(), 0);
        assert_eq!(relay.unsubscribe_count(), 1);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_relay_replays_oldest_first() {
        let relay = MemoryRelay::new();
        let signer = InMemorySigner::new("alice");
        let newer = signer.sign(EventTemplate::new(6000, "b").created_at(20)).unwrap();
        let older = signer.sign(EventTemplate::new(6000, "a").created_at(10)).unwrap();
        relay.publish_batch([newer.clone(), older.clone()]);

        let mut rx = relay
            .subscribe("sub", &[Filter::new().kinds([6000])])
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap().id, older.id);
        assert_eq!(rx.recv().await.unwrap().id, newer.id);
    }

    #[tokio::test]
    async fn test_relay_publish_failure() {
        let relay = MemoryRelay::new();
        relay.set_fail_publish(true);
        let event = InMemorySigner::new("a").sign(EventTemplate::new(1, "")).unwrap();
        assert!(relay.publish(event).await.is_err());
        assert!(relay.published().is_empty());
    }
}
