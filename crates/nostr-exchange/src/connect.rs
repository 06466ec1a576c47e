//! NIP-46 remote-signer pairing.
//!
//! The client advertises a `nostrconnect://` URI carrying a one-time secret and
//! listens for the remote signer's encrypted kind 24133 acknowledgement. An
//! acknowledgement whose `result` equals the secret yields a `bunker://` URI
//! for the remote signer.

use crate::correlation::CorrelationKey;
use crate::error::{ExchangeError, Result};
use crate::event::{Event, now};
use crate::manager::ExchangeManager;
use crate::session::SessionSpec;
use rand::Rng;
use std::fmt;
use std::time::Duration;
use tracing::info;
use url::Url;
use url::form_urlencoded;

/// Nostr Connect request/response kind
pub const KIND_NOSTR_CONNECT: u16 = 24133;

const SECRET_LEN: usize = 13;
const SECRET_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Generate a one-time pairing secret.
pub fn generate_secret() -> String {
    let mut rng = rand::rng();
    (0..SECRET_LEN)
        .map(|_| SECRET_CHARSET[rng.random_range(0..SECRET_CHARSET.len())] as char)
        .collect()
}

/// Acknowledgement payload a remote signer sends back.
pub fn ack_payload(secret: &str) -> String {
    serde_json::json!({
        "id": uuid::Uuid::new_v4().to_string(),
        "result": secret,
    })
    .to_string()
}

/// `nostrconnect://` pairing offer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectUri {
    pub client_pubkey: String,
    pub relay: String,
    pub name: String,
    pub url: Option<String>,
    pub secret: String,
}

impl ConnectUri {
    /// Offer with a freshly generated secret.
    pub fn new(client_pubkey: impl Into<String>, relay: impl Into<String>) -> Self {
        Self {
            client_pubkey: client_pubkey.into(),
            relay: relay.into(),
            name: "nostr-exchange".to_string(),
            url: None,
            secret: generate_secret(),
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Parse a `nostrconnect://` URI.
    pub fn parse(uri: &str) -> Result<Self> {
        let (client_pubkey, params) = parse_uri(uri, "nostrconnect")?;
        let get = |key: &str| {
            params
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
        };
        Ok(Self {
            client_pubkey,
            relay: get("relay").ok_or_else(|| missing("relay"))?,
            name: get("name").unwrap_or_default(),
            url: get("url"),
            secret: get("secret").ok_or_else(|| missing("secret"))?,
        })
    }
}

impl fmt::Display for ConnectUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut query = form_urlencoded::Serializer::new(String::new());
        query.append_pair("relay", &self.relay);
        query.append_pair("name", &self.name);
        if let Some(url) = &self.url {
            query.append_pair("url", url);
        }
        query.append_pair("secret", &self.secret);
        write!(f, "nostrconnect://{}?{}", self.client_pubkey, query.finish())
    }
}

/// `bunker://` connection to a paired remote signer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BunkerUri {
    pub remote_pubkey: String,
    pub relay: String,
    pub secret: String,
}

impl BunkerUri {
    /// Build from the signer's acknowledgement event.
    pub fn from_reply(event: &Event, relay: &str, secret: &str) -> Result<Self> {
        if event.first_tag_value("p").is_none_or(str::is_empty) {
            return Err(ExchangeError::InvalidRequest(
                "no pubkey in p tag".to_string(),
            ));
        }
        Ok(Self {
            remote_pubkey: event.pubkey.clone(),
            relay: relay.to_string(),
            secret: secret.to_string(),
        })
    }

    /// Parse a `bunker://` URI.
    pub fn parse(uri: &str) -> Result<Self> {
        let (remote_pubkey, params) = parse_uri(uri, "bunker")?;
        let get = |key: &str| {
            params
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
        };
        Ok(Self {
            remote_pubkey,
            relay: get("relay").ok_or_else(|| missing("relay"))?,
            secret: get("secret").unwrap_or_default(),
        })
    }
}

impl fmt::Display for BunkerUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let query = form_urlencoded::Serializer::new(String::new())
            .append_pair("relay", &self.relay)
            .append_pair("secret", &self.secret)
            .finish();
        write!(f, "bunker://{}?{}", self.remote_pubkey, query)
    }
}

fn parse_uri(uri: &str, scheme: &str) -> Result<(String, Vec<(String, String)>)> {
    let parsed = Url::parse(uri)
        .map_err(|e| ExchangeError::InvalidRequest(format!("invalid {} uri: {}", scheme, e)))?;
    if parsed.scheme() != scheme {
        return Err(ExchangeError::InvalidRequest(format!(
            "expected {}:// uri, got {}://",
            scheme,
            parsed.scheme()
        )));
    }
    let pubkey = parsed
        .host_str()
        .filter(|host| !host.is_empty())
        .ok_or_else(|| missing("pubkey"))?
        .to_string();
    let params = parsed.query_pairs().into_owned().collect();
    Ok((pubkey, params))
}

fn missing(field: &str) -> ExchangeError {
    ExchangeError::InvalidRequest(format!("uri has no {}", field))
}

/// Wait for a remote signer to acknowledge `uri`.
///
/// Requires a manager with a decryptor bound to the client identity.
pub async fn pair(
    manager: &ExchangeManager,
    uri: &ConnectUri,
    timeout: Option<Duration>,
) -> Result<BunkerUri> {
    let key = CorrelationKey::PayloadSecret {
        secret: uri.secret.clone(),
        field: manager.config().secret_field.clone(),
    };
    let mut spec = SessionSpec::new(key, [KIND_NOSTR_CONNECT])
        .recipient(uri.client_pubkey.clone())
        .since(now())
        .decrypt(true);
    if let Some(timeout) = timeout {
        spec = spec.timeout(timeout);
    }

    let reply = manager.listen(spec).await?.wait().await?;
    let bunker = BunkerUri::from_reply(&reply.event, &uri.relay, &uri.secret)?;
    info!("Paired with remote signer {}", bunker.remote_pubkey);
    Ok(bunker)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ack(tags: Vec<Vec<&str>>) -> Event {
        Event {
            id: "a".repeat(64),
            pubkey: "remote".to_string(),
            created_at: 1,
            kind: KIND_NOSTR_CONNECT,
            tags: tags
                .into_iter()
                .map(|t| t.into_iter().map(String::from).collect())
                .collect(),
            content: String::new(),
            sig: String::new(),
        }
    }

    #[test]
    fn test_generate_secret() {
        let secret = generate_secret();
        assert_eq!(secret.len(), 13);
        assert!(secret.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        assert_ne!(secret, generate_secret());
    }

    #[test]
    fn test_connect_uri_format() {
        let mut uri = ConnectUri::new("abc", "ws://localhost:3002")
            .name("WaveFunc")
            .url("http://localhost");
        uri.secret = "s3cr3t".to_string();
        assert_eq!(
            uri.to_string(),
            "nostrconnect://abc?relay=ws%3A%2F%2Flocalhost%3A3002&name=WaveFunc&url=http%3A%2F%2Flocalhost&secret=s3cr3t"
        );
        assert_eq!(ConnectUri::parse(&uri.to_string()).unwrap(), uri);
    }

    #[test]
    fn test_connect_uri_parse_errors() {
        assert!(ConnectUri::parse("bunker://abc?relay=x&secret=y").is_err());
        assert!(ConnectUri::parse("nostrconnect://abc?relay=x").is_err());
        assert!(ConnectUri::parse("not a uri").is_err());
    }

    #[test]
    fn test_bunker_from_reply() {
        let bunker = BunkerUri::from_reply(&ack(vec![vec!["p", "client"]]), "ws://r", "s").unwrap();
        assert_eq!(bunker.remote_pubkey, "remote");
        assert_eq!(bunker.to_string(), "bunker://remote?relay=ws%3A%2F%2Fr&secret=s");
        assert_eq!(BunkerUri::parse(&bunker.to_string()).unwrap(), bunker);
    }

    #[test]
    fn test_bunker_requires_p_tag() {
        for tags in [vec![], vec![vec!["p"]], vec![vec!["e", "x"]]] {
            match BunkerUri::from_reply(&ack(tags), "ws://r", "s") {
                Err(ExchangeError::InvalidRequest(msg)) => assert_eq!(msg, "no pubkey in p tag"),
                other => panic!("expected InvalidRequest, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_ack_payload_carries_secret() {
        let payload: serde_json::Value = serde_json::from_str(&ack_payload("s")).unwrap();
        assert_eq!(payload["result"], "s");
    }
}
