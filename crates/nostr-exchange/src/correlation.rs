//! Reply correlation.
//!
//! Decides whether an inbound event answers one outstanding request. The
//! predicate is pure: malformed or undecryptable content is a non-match, never
//! an error, so an unrelated broadcaster cannot disrupt an exchange.

use crate::event::{Event, reply_order};
use crate::transport::Decryptor;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeSet;

/// Acceptable reply kinds for one session.
pub type KindSet = BTreeSet<u16>;

/// How the caller wants replies recognised, chosen before the request is signed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorrelationStrategy {
    /// Reply carries a tag referencing the request id.
    BackReference,
    /// Reply payload carries a shared secret.
    PayloadSecret { secret: String },
}

/// The value a reply must reference to answer a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorrelationKey {
    /// Reply must carry a `tag` whose value is `request_id`.
    BackReference { request_id: String, tag: String },
    /// Reply payload, parsed as JSON, must have `field` equal to `secret`.
    PayloadSecret { secret: String, field: String },
}

impl CorrelationKey {
    /// Back-reference on the standard `e` tag.
    pub fn back_reference(request_id: impl Into<String>) -> Self {
        CorrelationKey::BackReference {
            request_id: request_id.into(),
            tag: "e".to_string(),
        }
    }

    /// Secret carried in the `result` field.
    pub fn payload_secret(secret: impl Into<String>) -> Self {
        CorrelationKey::PayloadSecret {
            secret: secret.into(),
            field: "result".to_string(),
        }
    }
}

/// A reply accepted by correlation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// The reply event as observed
    pub event: Event,
    /// Content after the decryption hook (raw content when no hook ran)
    pub content: String,
}

impl Reply {
    /// Parse the reply content as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> crate::Result<T> {
        Ok(serde_json::from_str(&self.content)?)
    }
}

/// Why a candidate was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mismatch {
    Kind(u16),
    MissingReference,
    Decryption(String),
    Payload,
    Secret,
}

/// Result of testing one candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Match(Reply),
    NoMatch(Mismatch),
}

impl Verdict {
    pub fn is_match(&self) -> bool {
        matches!(self, Verdict::Match(_))
    }
}

/// Test a candidate against a session's key and kind set.
pub fn correlate(
    candidate: &Event,
    key: &CorrelationKey,
    kinds: &KindSet,
    decryptor: Option<&dyn Decryptor>,
) -> Verdict {
    if !kinds.contains(&candidate.kind) {
        return Verdict::NoMatch(Mismatch::Kind(candidate.kind));
    }

    if let CorrelationKey::BackReference { request_id, tag } = key
        && !candidate.references(tag, request_id)
    {
        return Verdict::NoMatch(Mismatch::MissingReference);
    }

    let content = match decryptor {
        Some(decryptor) => match decryptor.decrypt(&candidate.content, &candidate.pubkey) {
            Ok(plaintext) => plaintext,
            Err(e) => return Verdict::NoMatch(Mismatch::Decryption(e.to_string())),
        },
        None => candidate.content.clone(),
    };

    if let CorrelationKey::PayloadSecret { secret, field } = key {
        let Ok(payload) = serde_json::from_str::<Value>(&content) else {
            return Verdict::NoMatch(Mismatch::Payload);
        };
        match payload.get(field).and_then(Value::as_str) {
            Some(value) if value == secret => {}
            Some(_) => return Verdict::NoMatch(Mismatch::Secret),
            None => return Verdict::NoMatch(Mismatch::Payload),
        }
    }

    Verdict::Match(Reply {
        event: candidate.clone(),
        content,
    })
}

/// Whether `candidate` answers the request identified by `key`.
pub fn matches(
    candidate: &Event,
    key: &CorrelationKey,
    kinds: &KindSet,
    decryptor: Option<&dyn Decryptor>,
) -> bool {
    correlate(candidate, key, kinds, decryptor).is_match()
}

/// Pick the preferred reply out of one delivery batch.
pub fn select_winner(batch: Vec<Reply>) -> Option<Reply> {
    batch
        .into_iter()
        .min_by(|a, b| reply_order(&a.event, &b.event))
}
