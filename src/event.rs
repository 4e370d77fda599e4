//! Nostr event model, kind classification, hashing and signing.

use std::time::{SystemTime, UNIX_EPOCH};

use secp256k1::{schnorr::Signature, Keypair, Message, Secp256k1, SecretKey, XOnlyPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Kind used for NIP-42 authentication responses.
pub const KIND_CLIENT_AUTH: u32 = 22242;

/// Wrapper for a Nostr tag expressed as an array of strings.
///
/// Tags appear as small arrays where the first element denotes the type and the
/// following elements hold data. Common examples include:
///
/// - `p` – references another author's public key
/// - `e` – links to another event ID
/// - `d` – unique identifier for parameterized replaceable events
/// - `t` – hashtag
/// - `expiration` – unix timestamp after which the event may be evicted
///
/// Each tag is stored verbatim so uncommon or custom tags are preserved.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Tag(pub Vec<String>);

impl Tag {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Tag(fields.into_iter().map(Into::into).collect())
    }

    /// Tag name (first element), if any.
    pub fn name(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    /// First value after the name, if any.
    pub fn value(&self) -> Option<&str> {
        self.0.get(1).map(String::as_str)
    }
}

/// Signed Nostr event as received from relays, gateways, or a local publish.
///
/// ```json
/// {
///   "id": "aa11",
///   "pubkey": "79be...",
///   "kind": 34236,
///   "created_at": 1700000000,
///   "tags": [["d", "clip-1"], ["t", "dance"]],
///   "content": "hello",
///   "sig": "deadbeef"
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    /// Event identifier (hex of SHA-256 hash).
    pub id: String,
    /// Author public key (hex).
    pub pubkey: String,
    /// Unix timestamp of creation.
    pub created_at: u64,
    /// Kind number, e.g. `1` or `34236`.
    pub kind: u32,
    pub tags: Vec<Tag>,
    pub content: String,
    /// Schnorr signature over the event hash.
    pub sig: String,
}

/// How the cache treats an event of a given kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindClass {
    /// Keyed by id only.
    Regular,
    /// At most one event per `(pubkey, kind)`.
    Replaceable,
    /// At most one event per `(pubkey, kind, d-tag)`.
    ParameterizedReplaceable,
}

impl KindClass {
    pub fn of(kind: u32) -> Self {
        match kind {
            0 | 3 | 10_000..=19_999 => KindClass::Replaceable,
            30_000..=39_999 => KindClass::ParameterizedReplaceable,
            _ => KindClass::Regular,
        }
    }
}

impl Event {
    pub fn kind_class(&self) -> KindClass {
        KindClass::of(self.kind)
    }

    /// Values of every tag named `name`, in order.
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags
            .iter()
            .filter(move |t| t.name() == Some(name))
            .filter_map(Tag::value)
    }

    /// Identifier of the first `d` tag, empty when absent.
    pub fn d_tag(&self) -> &str {
        self.tag_values("d").next().unwrap_or("")
    }

    /// NIP-40 expiration timestamp, if the event carries one.
    pub fn expiration(&self) -> Option<u64> {
        self.tag_values("expiration")
            .next()
            .and_then(|v| v.parse().ok())
    }

    /// Integer value of the first tag named `name`, used for engagement metrics.
    pub fn metric(&self, name: &str) -> Option<i64> {
        self.tag_values(name).next().and_then(|v| v.parse().ok())
    }

    /// Verify the event's ID and Schnorr signature.
    pub fn verify(&self) -> Result<()> {
        let hash = event_hash(&self.pubkey, self.created_at, self.kind, &self.tags, &self.content)?;
        if hex::encode(hash) != self.id {
            return Err(Error::Signature("id mismatch".into()));
        }
        let sig = Signature::from_slice(&hex::decode(&self.sig)?)?;
        let pk = XOnlyPublicKey::from_slice(&hex::decode(&self.pubkey)?)?;
        let secp = Secp256k1::verification_only();
        let msg = Message::from_digest(hash);
        secp.verify_schnorr(&sig, &msg, &pk)?;
        Ok(())
    }
}

/// Recompute the Nostr event hash from its fields.
pub fn event_hash(
    pubkey: &str,
    created_at: u64,
    kind: u32,
    tags: &[Tag],
    content: &str,
) -> Result<[u8; 32]> {
    let arr = serde_json::json!([0, pubkey, created_at, kind, tags, content]);
    let data = serde_json::to_vec(&arr)?;
    Ok(Sha256::digest(&data).into())
}

/// Current unix time in seconds.
pub fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Event content awaiting a signature.
#[derive(Debug, Clone, PartialEq)]
pub struct UnsignedEvent {
    pub created_at: u64,
    pub kind: u32,
    pub tags: Vec<Tag>,
    pub content: String,
}

impl UnsignedEvent {
    pub fn new(kind: u32, tags: Vec<Tag>, content: impl Into<String>) -> Self {
        Self {
            created_at: now(),
            kind,
            tags,
            content: content.into(),
        }
    }

    /// NIP-42 authentication event answering `challenge` from `relay_url`.
    pub fn auth(relay_url: &str, challenge: &str) -> Self {
        Self::new(
            KIND_CLIENT_AUTH,
            vec![
                Tag::new(["relay", relay_url]),
                Tag::new(["challenge", challenge]),
            ],
            "",
        )
    }
}

/// Capability that turns an unsigned event into a signed one.
///
/// Key storage lives outside this crate; callers hand in whatever holds the key.
pub trait Signer: Send + Sync {
    /// Hex-encoded x-only public key of the signing identity.
    fn public_key(&self) -> String;

    fn sign(&self, unsigned: UnsignedEvent) -> Result<Event>;
}

/// In-memory secp256k1 keypair signer.
pub struct Keys {
    keypair: Keypair,
}

impl Keys {
    pub fn from_secret_hex(secret: &str) -> Result<Self> {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&hex::decode(secret.trim())?)?;
        Ok(Self {
            keypair: Keypair::from_secret_key(&secp, &sk),
        })
    }

    pub fn generate() -> Self {
        let secp = Secp256k1::new();
        let (sk, _) = secp.generate_keypair(&mut rand::thread_rng());
        Self {
            keypair: Keypair::from_secret_key(&secp, &sk),
        }
    }
}

impl Signer for Keys {
    fn public_key(&self) -> String {
        hex::encode(self.keypair.x_only_public_key().0.serialize())
    }

    fn sign(&self, unsigned: UnsignedEvent) -> Result<Event> {
        let pubkey = self.public_key();
        let hash = event_hash(
            &pubkey,
            unsigned.created_at,
            unsigned.kind,
            &unsigned.tags,
            &unsigned.content,
        )?;
        let secp = Secp256k1::signing_only();
        let sig = secp.sign_schnorr_no_aux_rand(&Message::from_digest(hash), &self.keypair);
        Ok(Event {
            id: hex::encode(hash),
            pubkey,
            created_at: unsigned.created_at,
            kind: unsigned.kind,
            tags: unsigned.tags,
            content: unsigned.content,
            sig: hex::encode(sig.as_ref()),
        })
    }
}
