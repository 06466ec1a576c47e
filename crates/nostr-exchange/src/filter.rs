//! Subscription filters.
//!
//! The exchange only issues the subset of NIP-01 filters it needs to listen for
//! replies: kinds, `#e`/`#p` tag references, `since` and `limit`.

use crate::event::Event;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Filter for subscription requests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    /// Event kinds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u16>>,

    /// Events since timestamp
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,

    /// Maximum number of stored events
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,

    /// Generic tag queries keyed as `#e`, `#p`
    #[serde(flatten, skip_serializing_if = "HashMap::is_empty")]
    pub tags: HashMap<String, Vec<String>>,
}

impl Filter {
    /// Create a new empty filter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter by kinds.
    pub fn kinds(mut self, kinds: impl IntoIterator<Item = u16>) -> Self {
        self.kinds = Some(kinds.into_iter().collect());
        self
    }

    /// Filter by events since timestamp.
    pub fn since(mut self, timestamp: u64) -> Self {
        self.since = Some(timestamp);
        self
    }

    /// Limit number of stored results.
    pub fn limit(mut self, n: u64) -> Self {
        self.limit = Some(n);
        self
    }

    /// Add a tag filter. The key should be the tag letter (e.g., "e", "p").
    pub fn tag(mut self, key: impl Into<String>, values: Vec<String>) -> Self {
        self.tags.insert(format!("#{}", key.into()), values);
        self
    }

    /// Filter by #p (pubkey reference) tags.
    pub fn pubkey_refs(self, pubkeys: Vec<String>) -> Self {
        self.tag("p", pubkeys)
    }

    /// Check if an event matches this filter.
    ///
    /// `limit` only bounds stored events on the relay and is not checked here.
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ref kinds) = self.kinds
            && !kinds.contains(&event.kind)
        {
            return false;
        }

        if let Some(since) = self.since
            && event.created_at < since
        {
            return false;
        }

        self.tags.iter().all(|(key, values)| {
            let name = key.trim_start_matches('#');
            event
                .tag_values(name)
                .any(|value| values.iter().any(|wanted| wanted == value))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(kind: u16, created_at: u64, tags: Vec<Vec<&str>>) -> Event {
        Event {
            id: "0".repeat(64),
            pubkey: "pk".to_string(),
            created_at,
            kind,
            tags: tags
                .into_iter()
                .map(|t| t.into_iter().map(String::from).collect())
                .collect(),
            content: String::new(),
            sig: String::new(),
        }
    }

    #[test]
    fn test_serialize_tag_filter() {
        let filter = Filter::new()
            .kinds([6000])
            .tag("e", vec!["r1".to_string()])
            .limit(1);
        let json = serde_json::to_value(&filter).unwrap();
        assert_eq!(json["kinds"], serde_json::json!([6000]));
        assert_eq!(json["#e"], serde_json::json!(["r1"]));
        assert_eq!(json["limit"], serde_json::json!(1));
        assert!(json.get("since").is_none());
    }

    #[test]
    fn test_matches_kind_and_reference() {
        let filter = Filter::new()
            .kinds([6000])
            .tag("e", vec!["r1".to_string()]);
        assert!(filter.matches(&reply(6000, 1, vec![vec!["e", "r1"]])));
        assert!(!filter.matches(&reply(6001, 1, vec![vec!["e", "r1"]])));
        assert!(!filter.matches(&reply(6000, 1, vec![vec!["e", "r2"]])));
        assert!(!filter.matches(&reply(6000, 1, vec![])));
    }

    #[test]
    fn test_tag_match_is_exact() {
        let filter = Filter::new().tag("e", vec!["r1".to_string()]);
        assert!(!filter.matches(&reply(1, 1, vec![vec!["e", "r10"]])));
    }

    #[test]
    fn test_matches_since() {
        let filter = Filter::new().since(100);
        assert!(filter.matches(&reply(1, 100, vec![])));
        assert!(!filter.matches(&reply(1, 99, vec![])));
    }

    #[test]
    fn test_all_tag_groups_required() {
        let filter = Filter::new()
            .tag("e", vec!["r1".to_string()])
            .pubkey_refs(vec!["me".to_string()]);
        assert!(filter.matches(&reply(1, 1, vec![vec!["e", "r1"], vec!["p", "me"]])));
        assert!(!filter.matches(&reply(1, 1, vec![vec!["e", "r1"]])));
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        assert!(Filter::new().matches(&reply(42, 0, vec![])));
    }
}
