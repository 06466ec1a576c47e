//! Signed event model.
//!
//! Events follow the NIP-01 structure (id, pubkey, created_at, kind, tags,
//! content, sig). The exchange never mutates an observed event; it only
//! validates, hashes and orders them.

use crate::error::{ExchangeError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};

/// A signed Nostr event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// 32-bytes lowercase hex-encoded sha256 of the serialized event data
    pub id: String,
    /// Public identifier of the event creator
    pub pubkey: String,
    /// Unix timestamp in seconds
    pub created_at: u64,
    /// Event kind (integer between 0 and 65535)
    pub kind: u16,
    /// Array of arrays of strings (tags)
    pub tags: Vec<Vec<String>>,
    /// Arbitrary string content
    pub content: String,
    /// Signature over the id
    pub sig: String,
}

/// An unsigned event (before signing).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedEvent {
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

/// A draft handed to the signing collaborator.
///
/// The pubkey comes from the signer, so templates don't include it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventTemplate {
    /// Unix timestamp in seconds
    pub created_at: u64,
    /// Event kind
    pub kind: u16,
    /// Array of arrays of strings (tags)
    pub tags: Vec<Vec<String>>,
    /// Arbitrary string content
    pub content: String,
}

impl EventTemplate {
    /// Create a template stamped with the current time.
    pub fn new(kind: u16, content: impl Into<String>) -> Self {
        Self {
            created_at: now(),
            kind,
            tags: Vec::new(),
            content: content.into(),
        }
    }

    /// Append a tag.
    pub fn tag<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.push(values.into_iter().map(Into::into).collect());
        self
    }

    /// Override the timestamp.
    pub fn created_at(mut self, created_at: u64) -> Self {
        self.created_at = created_at;
        self
    }
}

impl Event {
    /// Parse an event from relay JSON and validate it.
    pub fn from_json(json: &str) -> Result<Self> {
        let event: Event = serde_json::from_str(json)
            .map_err(|e| ExchangeError::MalformedEvent(e.to_string()))?;
        event.validate()?;
        Ok(event)
    }

    /// Check the structural invariants the exchange relies on.
    pub fn validate(&self) -> Result<()> {
        if !is_event_id(&self.id) {
            return Err(ExchangeError::MalformedEvent(format!(
                "id must be 64 lowercase hex characters, got {:?}",
                self.id
            )));
        }

        for (index, tag) in self.tags.iter().enumerate() {
            match tag.first() {
                Some(name) if !name.is_empty() => {}
                _ => {
                    return Err(ExchangeError::MalformedEvent(format!(
                        "tag {} has no name",
                        index
                    )));
                }
            }
        }

        Ok(())
    }

    /// Values (second element) of every tag with the given name.
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags
            .iter()
            .filter(move |tag| tag.first().is_some_and(|n| n == name))
            .filter_map(|tag| tag.get(1).map(String::as_str))
    }

    /// Value of the first tag with the given name.
    pub fn first_tag_value<'a>(&'a self, name: &'a str) -> Option<&'a str> {
        self.tag_values(name).next()
    }

    /// Whether a tag `name` carries exactly `value`.
    pub fn references(&self, name: &str, value: &str) -> bool {
        self.tag_values(name).any(|v| v == value)
    }
}

fn is_event_id(id: &str) -> bool {
    id.len() == 64
        && id
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}

/// Serialize an unsigned event for hashing.
///
/// Format: `[0, pubkey, created_at, kind, tags, content]`
pub fn serialize_event(event: &UnsignedEvent) -> Result<String> {
    if event.pubkey.is_empty() {
        return Err(ExchangeError::MalformedEvent(
            "can't serialize event without pubkey".to_string(),
        ));
    }

    let serialized = serde_json::to_string(&(
        0,
        &event.pubkey,
        event.created_at,
        event.kind,
        &event.tags,
        &event.content,
    ))?;

    Ok(serialized)
}

/// Get the event hash (id) from an unsigned event.
pub fn get_event_hash(event: &UnsignedEvent) -> Result<String> {
    let serialized = serialize_event(event)?;
    let hash = Sha256::digest(serialized.as_bytes());
    Ok(hex::encode(hash))
}

/// Order in which competing replies are preferred: earliest `created_at`,
/// then lexicographically smallest `id`.
pub fn reply_order(a: &Event, b: &Event) -> Ordering {
    a.created_at
        .cmp(&b.created_at)
        .then_with(|| a.id.cmp(&b.id))
}

/// Sort events in reply preference order.
pub fn sort_replies(events: &mut [Event]) {
    events.sort_by(reply_order);
}

/// Current unix time in seconds.
pub fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(id: &str, created_at: u64) -> Event {
        Event {
            id: id.to_string(),
            pubkey: "pk".to_string(),
            created_at,
            kind: 6000,
            tags: vec![vec!["e".to_string(), "r1".to_string()]],
            content: String::new(),
            sig: String::new(),
        }
    }

    fn hex_id(fill: char) -> String {
        fill.to_string().repeat(64)
    }

    #[test]
    fn test_validate_accepts_well_formed() {
        assert!(event(&hex_id('a'), 10).validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_id() {
        assert!(event("r1", 10).validate().is_err());
        assert!(event(&hex_id('A'), 10).validate().is_err());
        assert!(event(&hex_id('g'), 10).validate().is_err());
        assert!(event(&"a".repeat(63), 10).validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unnamed_tags() {
        let mut e = event(&hex_id('b'), 10);
        e.tags.push(vec![]);
        assert!(matches!(e.validate(), Err(ExchangeError::MalformedEvent(_))));

        let mut e = event(&hex_id('b'), 10);
        e.tags.push(vec![String::new(), "value".to_string()]);
        assert!(e.validate().is_err());
    }

    #[test]
    fn test_from_json_negative_timestamp_is_malformed() {
        let json = format!(
            r#"{{"id":"{}","pubkey":"pk","created_at":-5,"kind":1,"tags":[],"content":"","sig":""}}"#,
            hex_id('c')
        );
        assert!(matches!(
            Event::from_json(&json),
            Err(ExchangeError::MalformedEvent(_))
        ));
    }

    #[test]
    fn test_from_json_roundtrip_fields() {
        let json = format!(
            r#"{{"id":"{}","pubkey":"pk","created_at":5,"kind":6000,"tags":[["e","r1"],["p","x"]],"content":"hi","sig":"s"}}"#,
            hex_id('d')
        );
        let e = Event::from_json(&json).unwrap();
        assert_eq!(e.kind, 6000);
        assert_eq!(e.first_tag_value("p"), Some("x"));
        assert!(e.references("e", "r1"));
        assert!(!e.references("e", "r2"));
    }

    #[test]
    fn test_tag_values_skips_nameless_and_short_tags() {
        let mut e = event(&hex_id('e'), 1);
        e.tags = vec![
            vec!["e".to_string()],
            vec!["e".to_string(), "first".to_string(), "wss://relay".to_string()],
            vec!["p".to_string(), "other".to_string()],
            vec!["e".to_string(), "second".to_string()],
        ];
        let values: Vec<&str> = e.tag_values("e").collect();
        assert_eq!(values, vec!["first", "second"]);
    }

    #[test]
    fn test_event_hash_is_deterministic() {
        let unsigned = UnsignedEvent {
            pubkey: "ab".repeat(32),
            created_at: 1_700_000_000,
            kind: 5000,
            tags: vec![],
            content: "{}".to_string(),
        };
        let a = get_event_hash(&unsigned).unwrap();
        let b = get_event_hash(&unsigned).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);

        let mut changed = unsigned.clone();
        changed.content = "{ }".to_string();
        assert_ne!(a, get_event_hash(&changed).unwrap());
    }

    #[test]
    fn test_serialize_requires_pubkey() {
        let unsigned = UnsignedEvent {
            pubkey: String::new(),
            created_at: 1,
            kind: 1,
            tags: vec![],
            content: String::new(),
        };
        assert!(serialize_event(&unsigned).is_err());
    }

    #[test]
    fn test_sort_replies_earliest_then_smallest_id() {
        let mut events = vec![
            event(&hex_id('f'), 20),
            event(&hex_id('b'), 10),
            event(&hex_id('a'), 10),
        ];
        sort_replies(&mut events);
        assert_eq!(events[0].id, hex_id('a'));
        assert_eq!(events[1].id, hex_id('b'));
        assert_eq!(events[2].id, hex_id('f'));
    }

    #[test]
    fn test_first_tag_value_with_owned_name() {
        let e = event(&hex_id('a'), 1);
        let name = String::from("e");
        let value = e.first_tag_value(&name).map(str::to_string);
        drop(name);
        assert_eq!(value.as_deref(), Some("r1"));
        assert_eq!(e.first_tag_value("p"), None);
    }

    #[test]
    fn test_template_builder() {
        let t = EventTemplate::new(5000, "x")
            .tag(["p", "provider"])
            .created_at(42);
        assert_eq!(t.created_at, 42);
        assert_eq!(t.tags, vec![vec!["p".to_string(), "provider".to_string()]]);
    }
}
