//! Nickname registry binding names to public keys.
//!
//! A binding lasts 365 days and renews when the same key reclaims it. A
//! live binding held by another key can never be overwritten, and reserved
//! names only yield to the configured owner key. Expired entries are
//! invisible immediately but only swept from disk by the purge pass.

use std::{fs, path::PathBuf};

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::relay::now_unix;

/// How long a registration lasts, in seconds.
pub const REGISTRATION_TTL_SECS: u64 = 365 * 24 * 60 * 60;

/// One nickname binding.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NicknameRegistration {
    pub nickname: String,
    pub npub: String,
    #[serde(rename = "registeredAt")]
    pub registered_at: u64,
    #[serde(rename = "expiresAt")]
    pub expires_at: u64,
}

impl NicknameRegistration {
    fn expired_at(&self, now: u64) -> bool {
        now >= self.expires_at
    }
}

#[derive(Serialize, Deserialize, Default)]
struct RegistryFile {
    registrations: Vec<NicknameRegistration>,
}

/// Persistent nickname registry.
pub struct NicknameRegistry {
    path: PathBuf,
    reserved: Vec<String>,
    reserved_owner: Option<String>,
    registrations: Vec<NicknameRegistration>,
}

impl NicknameRegistry {
    /// Load the registry eagerly, purging expired entries on the way in.
    /// A corrupt file falls back to an empty registry.
    pub fn load(path: PathBuf, reserved: Vec<String>, reserved_owner: Option<String>) -> Self {
        let registrations = match fs::read_to_string(&path) {
            Ok(data) => match serde_json::from_str::<RegistryFile>(&data) {
                Ok(file) => file.registrations,
                Err(e) => {
                    log::warn!("nickname registry unreadable, starting empty: {e}");
                    vec![]
                }
            },
            Err(_) => vec![],
        };
        let mut registry = Self {
            path,
            reserved: reserved.into_iter().map(|r| r.to_lowercase()).collect(),
            reserved_owner,
            registrations,
        };
        if let Err(e) = registry.purge_expired() {
            log::warn!("nickname purge at load failed: {e}");
        }
        registry
    }

    /// Claim or renew a nickname for a key.
    pub fn register(&mut self, nickname: &str, npub: &str) -> Result<()> {
        self.register_at(nickname, npub, now_unix())
    }

    fn register_at(&mut self, nickname: &str, npub: &str, now: u64) -> Result<()> {
        let nickname = nickname.trim().to_lowercase();
        if nickname.is_empty() {
            return Err(anyhow!("nickname cannot be empty"));
        }
        if self.reserved.contains(&nickname) && self.reserved_owner.as_deref() != Some(npub) {
            return Err(anyhow!("nickname is reserved: {nickname}"));
        }
        if let Some(existing) = self.lookup_at(&nickname, now) {
            if existing.npub != npub {
                return Err(anyhow!("nickname already registered: {nickname}"));
            }
        }
        self.registrations.retain(|r| r.nickname != nickname);
        self.registrations.push(NicknameRegistration {
            nickname,
            npub: npub.to_string(),
            registered_at: now,
            expires_at: now + REGISTRATION_TTL_SECS,
        });
        self.save()
    }

    /// Current binding for a nickname, if present and not expired. Expired
    /// entries are treated as absent; the purge pass removes them later.
    pub fn get(&self, nickname: &str) -> Option<&NicknameRegistration> {
        self.lookup_at(&nickname.trim().to_lowercase(), now_unix())
    }

    fn lookup_at(&self, nickname: &str, now: u64) -> Option<&NicknameRegistration> {
        self.registrations
            .iter()
            .find(|r| r.nickname == nickname && !r.expired_at(now))
    }

    /// Pre-flight check before accepting a connection under a claimed
    /// nickname: returns the conflicting key, if any.
    pub fn check_collision(&self, nickname: &str, npub: &str) -> Option<String> {
        self.get(nickname)
            .filter(|r| r.npub != npub)
            .map(|r| r.npub.clone())
    }

    /// All live registrations.
    pub fn registrations(&self) -> &[NicknameRegistration] {
        &self.registrations
    }

    /// Sweep expired entries, persisting only when something changed.
    pub fn purge_expired(&mut self) -> Result<usize> {
        self.purge_expired_at(now_unix())
    }

    fn purge_expired_at(&mut self, now: u64) -> Result<usize> {
        let before = self.registrations.len();
        self.registrations.retain(|r| !r.expired_at(now));
        let removed = before - self.registrations.len();
        if removed > 0 {
            self.save()?;
        }
        Ok(removed)
    }

    fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
            let file = RegistryFile {
                registrations: self.registrations.clone(),
            };
            let data = serde_json::to_string_pretty(&file)?;
            let tmp = tempfile::NamedTempFile::new_in(parent)?;
            fs::write(tmp.path(), data)?;
            tmp.persist(&self.path)?;
        }
        Ok(())
    }
}
