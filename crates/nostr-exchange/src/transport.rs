//! Collaborator seams.
//!
//! The exchange never owns relay connections, keys or ciphers. Callers inject
//! them when building an [`ExchangeManager`](crate::ExchangeManager).

use crate::error::Result;
use crate::event::{Event, EventTemplate};
use crate::filter::Filter;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Relay publish/subscribe surface.
#[async_trait]
pub trait RelayTransport: Send + Sync {
    /// Broadcast an event.
    async fn publish(&self, event: Event) -> std::result::Result<(), String>;

    /// Open a subscription; events matching any filter arrive on the receiver.
    async fn subscribe(
        &self,
        subscription_id: &str,
        filters: &[Filter],
    ) -> std::result::Result<mpsc::Receiver<Event>, String>;

    /// Close a subscription.
    async fn unsubscribe(&self, subscription_id: &str) -> std::result::Result<(), String>;
}

/// Signing identity.
pub trait EventSigner: Send + Sync {
    /// Public key of the configured identity.
    fn public_key(&self) -> Result<String>;

    /// Sign a template. Fails with `SigningUnavailable` when no identity is configured.
    fn sign(&self, template: EventTemplate) -> Result<Event>;
}

/// Payload decryption hook.
pub trait Decryptor: Send + Sync {
    /// Decrypt `content` sent by `counterparty`. Fails with `DecryptionFailed`.
    fn decrypt(&self, content: &str, counterparty: &str) -> Result<String>;
}
