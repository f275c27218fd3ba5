//! Relay event model, canonical hashing, and signature checks.

use anyhow::{anyhow, Result};
use secp256k1::{schnorr::Signature, Keypair, Message, Secp256k1, XOnlyPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Wrapper for an event tag expressed as an array of strings.
///
/// Tags appear as small arrays where the first element denotes the type and
/// the following elements hold data. The ones this crate cares about:
///
/// - `challenge` – echoes the AUTH challenge issued to a connection
/// - `url` / `imeta` – may reference hosted content eligible for replication
///
/// Each tag is stored verbatim so uncommon or custom tags are preserved.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tag(pub Vec<String>);

impl Tag {
    /// Tag name (first element), if any.
    pub fn name(&self) -> Option<&str> {
        self.0.first().map(|s| s.as_str())
    }

    /// First value after the name, if any.
    pub fn value(&self) -> Option<&str> {
        self.0.get(1).map(|s| s.as_str())
    }
}

/// Core event persisted on disk and exchanged over relay connections.
///
/// ```json
/// {
///   "id": "aa11…",
///   "pubkey": "7f00…",
///   "kind": 1,
///   "created_at": 1700000000,
///   "tags": [["room", "alpha"]],
///   "content": "hello",
///   "sig": "deadbeef…"
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Event identifier (hex of SHA-256 over the canonical fields).
    pub id: String,
    /// Author public key (hex, x-only).
    pub pubkey: String,
    /// Kind number, e.g. `1`.
    pub kind: u32,
    /// Unix timestamp of creation.
    pub created_at: u64,
    /// Arbitrary tags.
    pub tags: Vec<Tag>,
    /// Event content body.
    pub content: String,
    /// Schnorr signature over the event hash.
    pub sig: String,
}

impl Event {
    /// First value of the named tag, if the event carries it.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.name() == Some(name))
            .and_then(|t| t.value())
    }

    /// All values of every tag with the given name.
    pub fn tag_values<'a>(&'a self, name: &str) -> Vec<&'a str> {
        self.tags
            .iter()
            .filter(|t| t.name() == Some(name))
            .flat_map(|t| t.0.iter().skip(1).map(|s| s.as_str()))
            .collect()
    }
}

/// Recompute the canonical event hash from its fields.
pub fn event_hash(ev: &Event) -> Result<[u8; 32]> {
    let arr = serde_json::json!([0, ev.pubkey, ev.created_at, ev.kind, ev.tags, ev.content]);
    let data = serde_json::to_vec(&arr)?;
    let hash = Sha256::digest(&data);
    Ok(hash.into())
}

/// Verify an event's ID and Schnorr signature.
pub fn verify_event(ev: &Event) -> Result<()> {
    let hash = event_hash(ev)?;
    let calc_id = hex::encode(hash);
    if calc_id != ev.id {
        return Err(anyhow!("id mismatch"));
    }
    let sig = Signature::from_slice(&hex::decode(&ev.sig)?)?;
    let pk = XOnlyPublicKey::from_slice(&hex::decode(&ev.pubkey)?)?;
    let secp = Secp256k1::verification_only();
    let msg = Message::from_digest_slice(&hash)?;
    secp.verify_schnorr(&sig, &msg, &pk)?;
    Ok(())
}

/// Unsigned event fields handed to a [`Signer`].
#[derive(Debug, Clone)]
pub struct EventDraft {
    pub kind: u32,
    pub created_at: u64,
    pub tags: Vec<Tag>,
    pub content: String,
}

/// Signing collaborator seam. The relay core never holds private keys;
/// whoever constructs a signer owns the key material.
pub trait Signer {
    /// Hex public key events will be attributed to.
    fn public_key(&self) -> String;
    /// Produce a signed event from the draft, or fail.
    fn sign(&self, draft: EventDraft) -> Result<Event>;
}

/// Signer backed by a caller-supplied secp256k1 keypair.
pub struct KeypairSigner {
    keypair: Keypair,
}

impl KeypairSigner {
    /// Build a signer from a hex-encoded secret key.
    pub fn from_secret_hex(secret: &str) -> Result<Self> {
        let secp = Secp256k1::new();
        let bytes = hex::decode(secret)?;
        let keypair = Keypair::from_seckey_slice(&secp, &bytes)?;
        Ok(Self { keypair })
    }
}

impl Signer for KeypairSigner {
    fn public_key(&self) -> String {
        hex::encode(self.keypair.x_only_public_key().0.serialize())
    }

    fn sign(&self, draft: EventDraft) -> Result<Event> {
        let mut ev = Event {
            id: String::new(),
            pubkey: self.public_key(),
            kind: draft.kind,
            created_at: draft.created_at,
            tags: draft.tags,
            content: draft.content,
            sig: String::new(),
        };
        let hash = event_hash(&ev)?;
        ev.id = hex::encode(hash);
        let secp = Secp256k1::new();
        let msg = Message::from_digest_slice(&hash)?;
        let sig = secp.sign_schnorr_no_aux_rand(&msg, &self.keypair);
        ev.sig = hex::encode(sig.as_ref());
        Ok(ev)
    }
}
