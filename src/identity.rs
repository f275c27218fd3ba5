//! Key material and callsign handling for operators and stations.
//!
//! A callsign is derived from the bech32 `npub`: a two-character role prefix
//! followed by the first six data characters, uppercased. Stations use `X3`,
//! clients use `X1`, so the prefix alone tells the two roles apart on the
//! wire and in the station directory.

use anyhow::{anyhow, bail, Result};
use bech32::{FromBase32, ToBase32, Variant};
use rand::thread_rng;
use secp256k1::{Keypair, Secp256k1};
use serde::{Deserialize, Serialize};

/// Role encoded in a callsign prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityRole {
    Client,
    Station,
}

impl IdentityRole {
    /// Two-character callsign prefix for this role.
    pub fn prefix(self) -> &'static str {
        match self {
            IdentityRole::Client => "X1",
            IdentityRole::Station => "X3",
        }
    }
}

/// Public half of an identity: key, encoded key, and derived callsign.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Identity {
    /// Hex-encoded 32-byte x-only public key.
    pub public_key: String,
    /// Bech32 `npub` encoding of the public key.
    pub npub: String,
    /// Derived callsign, e.g. `X3ABC123`.
    pub callsign: String,
    /// Role the callsign prefix encodes.
    pub role: IdentityRole,
}

impl Identity {
    /// Build an identity from a hex public key.
    pub fn from_public_key(public_key: &str, role: IdentityRole) -> Result<Self> {
        let npub = npub_encode(public_key)?;
        let callsign = derive_callsign(&npub, role)?;
        Ok(Self {
            public_key: public_key.to_string(),
            npub,
            callsign,
            role,
        })
    }
}

/// Generate a fresh keypair, returning the identity and the hex secret key.
///
/// The secret key is handed straight back to the caller; nothing in this
/// crate retains it.
pub fn generate(role: IdentityRole) -> Result<(Identity, String)> {
    let secp = Secp256k1::new();
    let keypair = Keypair::new(&secp, &mut thread_rng());
    let public_key = hex::encode(keypair.x_only_public_key().0.serialize());
    let secret = hex::encode(keypair.secret_bytes());
    Ok((Identity::from_public_key(&public_key, role)?, secret))
}

/// Encode a hex public key as a bech32 `npub`.
pub fn npub_encode(public_key_hex: &str) -> Result<String> {
    let bytes = hex::decode(public_key_hex)?;
    if bytes.len() != 32 {
        bail!("public key must be 32 bytes");
    }
    Ok(bech32::encode("npub", bytes.to_base32(), Variant::Bech32)?)
}

/// Decode a bech32 `npub` back to a hex public key.
pub fn npub_decode(npub: &str) -> Result<String> {
    let (hrp, data, _) = bech32::decode(npub)?;
    if hrp != "npub" {
        bail!("expected npub, got {hrp}");
    }
    let bytes = Vec::<u8>::from_base32(&data)?;
    if bytes.len() != 32 {
        bail!("npub payload must be 32 bytes");
    }
    Ok(hex::encode(bytes))
}

/// Derive the callsign for an `npub` under the given role.
pub fn derive_callsign(npub: &str, role: IdentityRole) -> Result<String> {
    let data = npub
        .strip_prefix("npub1")
        .ok_or_else(|| anyhow!("npub must start with npub1"))?;
    if data.len() < 6 {
        bail!("npub too short for callsign derivation");
    }
    let tail: String = data.chars().take(6).collect::<String>().to_uppercase();
    Ok(format!("{}{}", role.prefix(), tail))
}

/// Whether a callsign carries the station-role prefix.
pub fn is_station_callsign(callsign: &str) -> bool {
    callsign.starts_with(IdentityRole::Station.prefix())
}

/// Whether a callsign carries the client-role prefix.
pub fn is_client_callsign(callsign: &str) -> bool {
    callsign.starts_with(IdentityRole::Client.prefix())
}
