//! Correlated request/reply exchanges over Nostr relays.
//!
//! This crate provides:
//! - Exchange sessions that subscribe before a request is published and
//!   resolve on the first matching reply, a deadline, or cancellation
//! - Reply correlation by back-reference tag or by payload secret
//! - NIP-90 text-process jobs (customer and service provider)
//! - NIP-46 remote-signer pairing
//! - In-memory relay, signer and cipher for local use
//!
//! # Example
//!
//! ```rust,no_run
//! use nostr_exchange::{
//!     DvmClient, DvmWorker, ExchangeConfig, ExchangeManager, InMemorySigner, MemoryRelay,
//!     TextProcessRequest,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> nostr_exchange::Result<()> {
//!     let relay = Arc::new(MemoryRelay::new());
//!
//!     // A service provider answering jobs
//!     let worker = DvmWorker::new(relay.clone(), Arc::new(InMemorySigner::new("provider")));
//!     tokio::spawn(async move { worker.run(std::future::pending()).await });
//!
//!     // A customer publishing one
//!     let manager = ExchangeManager::new(
//!         relay,
//!         Arc::new(InMemorySigner::new("customer")),
//!         ExchangeConfig::default(),
//!     );
//!     let client = DvmClient::new(manager);
//!     let response = client
//!         .submit_text(&TextProcessRequest::new("hello").uppercase(true), None)
//!         .await?;
//!     println!("{}", response.output);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connect;
pub mod correlation;
pub mod dvm;
mod error;
pub mod event;
pub mod filter;
mod manager;
pub mod memory;
mod session;
pub mod transport;

// Re-export main types
pub use config::ExchangeConfig;
pub use connect::{BunkerUri, ConnectUri, KIND_NOSTR_CONNECT, generate_secret, pair};
pub use correlation::{
    CorrelationKey, CorrelationStrategy, KindSet, Mismatch, Reply, Verdict, correlate, matches,
    select_winner,
};
pub use dvm::{
    DvmClient, DvmWorker, KIND_JOB_RESULT_TEXT_PROCESS, KIND_JOB_TEXT_PROCESS,
    TextProcessRequest, TextProcessResponse, process_text,
};
pub use error::{ExchangeError, Result};
pub use event::{Event, EventTemplate, UnsignedEvent};
pub use filter::Filter;
pub use manager::{ExchangeManager, ExchangeRequest};
pub use memory::{InMemorySigner, MemoryRelay, SharedKeyCipher};
pub use session::{SessionHandle, SessionId, SessionSpec, SessionState};
pub use transport::{Decryptor, EventSigner, RelayTransport};
