//! State of outstanding requests, carried across the IdP round-trip in
//! cookie-like name/value pairs.
//!
//! Each entry is named `<base><ordinal>`. Ordinals only grow, so the entry
//! with the smallest ordinal is the oldest one regardless of the order the
//! transport hands entries back in. Values are sealed with AES-256-GCM with
//! the entry name as associated data, so a value moved to another name no
//! longer opens.

use std::{collections::BTreeMap, fmt};

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use base64::{prelude::BASE64_URL_SAFE_NO_PAD, Engine};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::error::{SamlError, SamlResult};

const KEY_LENGTH: usize = 32;
const NONCE_LENGTH: usize = 12;
/// Larger or non-canonical suffixes are not ours.
const MAX_ORDINAL: u64 = 999_999_999;

pub const DEFAULT_COOKIE_NAME_BASE: &str = "Saml2.RequestState.";
pub const DEFAULT_MAX_OUTSTANDING: usize = 3;

/// What is remembered about one outstanding AuthnRequest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRequestState {
    /// ID of the AuthnRequest, expected back as InResponseTo.
    pub message_id: String,
    /// Entity id of the IdP the request was sent to.
    pub idp_entity_id: String,
    pub return_url: Option<String>,
    /// Opaque caller data, handed back on sign-in.
    pub relay_data: BTreeMap<String, String>,
    #[serde(with = "time::serde::timestamp")]
    pub created: OffsetDateTime,
}

/// Seals and opens stored state.
#[derive(Clone)]
pub struct RequestStateProtector {
    key: [u8; KEY_LENGTH],
}

impl fmt::Debug for RequestStateProtector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestStateProtector").finish_non_exhaustive()
    }
}

impl RequestStateProtector {
    pub fn new(key: [u8; KEY_LENGTH]) -> Self {
        RequestStateProtector { key }
    }

    /// A protector with a random key. State sealed by it can only be opened
    /// by the same process.
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LENGTH];
        OsRng.fill_bytes(&mut key);
        Self::new(key)
    }

    pub fn from_base64(encoded: &str) -> SamlResult<Self> {
        let bytes = base64::prelude::BASE64_STANDARD
            .decode(encoded.trim())
            .map_err(|e| SamlError::Configuration(format!("invalid state protection key: {e}")))?;
        let key: [u8; KEY_LENGTH] = bytes.try_into().map_err(|bytes: Vec<u8>| {
            SamlError::Configuration(format!(
                "state protection key must be {KEY_LENGTH} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self::new(key))
    }

    fn cipher(&self) -> SamlResult<Aes256Gcm> {
        Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| SamlError::Crypto(format!("failed to create cipher: {e}")))
    }

    /// Serializes and seals `state` for storage under `name`.
    pub fn protect(&self, name: &str, state: &StoredRequestState) -> SamlResult<String> {
        let plaintext =
            serde_json::to_vec(state).map_err(|e| SamlError::Serialization(e.to_string()))?;
        let mut nonce = [0u8; NONCE_LENGTH];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher()?
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &plaintext,
                    aad: name.as_bytes(),
                },
            )
            .map_err(|e| SamlError::Crypto(format!("failed to seal request state: {e}")))?;

        let mut sealed = Vec::with_capacity(NONCE_LENGTH + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(BASE64_URL_SAFE_NO_PAD.encode(sealed))
    }

    /// Opens a value stored under `name`. Anything that fails to open,
    /// for whatever reason, yields `None`.
    pub fn unprotect(&self, name: &str, value: &str) -> Option<StoredRequestState> {
        let sealed = BASE64_URL_SAFE_NO_PAD.decode(value).ok()?;
        if sealed.len() <= NONCE_LENGTH {
            return None;
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LENGTH);
        let plaintext = self
            .cipher()
            .ok()?
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: name.as_bytes(),
                },
            )
            .ok()?;
        serde_json::from_slice(&plaintext).ok()
    }
}

/// Result of [`RequestStateStore::store`]: what the transport must do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntry {
    /// Entry name; also the token that retrieves the state.
    pub name: String,
    /// Sealed value.
    pub value: String,
    /// Names of older entries that must be deleted, oldest first.
    pub evicted: Vec<String>,
}

/// Bounded view over the entries one client currently carries.
#[derive(Debug, Clone)]
pub struct RequestStateStore {
    protector: RequestStateProtector,
    name_base: String,
    max_outstanding: usize,
    entries: BTreeMap<u64, String>,
}

impl RequestStateStore {
    pub fn new(protector: RequestStateProtector, name_base: &str, max_outstanding: usize) -> Self {
        RequestStateStore {
            protector,
            name_base: name_base.to_string(),
            max_outstanding: max_outstanding.max(1),
            entries: BTreeMap::new(),
        }
    }

    /// Loads the entries found among `cookies`. Names that do not follow the
    /// `<base><ordinal>` pattern are not ours and are skipped.
    pub fn from_cookies<'a>(
        protector: RequestStateProtector,
        name_base: &str,
        max_outstanding: usize,
        cookies: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Self {
        let mut store = Self::new(protector, name_base, max_outstanding);
        for (name, value) in cookies {
            if let Some(ordinal) = store.ordinal(name) {
                store.entries.insert(ordinal, value.to_string());
            }
        }
        store
    }

    fn ordinal(&self, name: &str) -> Option<u64> {
        let suffix = name.strip_prefix(&self.name_base)?;
        if suffix.is_empty()
            || suffix.starts_with('0')
            || !suffix.bytes().all(|b| b.is_ascii_digit())
        {
            return None;
        }
        suffix.parse().ok().filter(|&ordinal| ordinal <= MAX_ORDINAL)
    }

    fn name(&self, ordinal: u64) -> String {
        format!("{}{ordinal}", self.name_base)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entry names, oldest first.
    pub fn names(&self) -> Vec<String> {
        self.entries.keys().map(|&ordinal| self.name(ordinal)).collect()
    }

    /// Seals `state` under a fresh name, evicting the oldest entries so at
    /// most `max_outstanding` remain including the new one.
    pub fn store(&mut self, state: &StoredRequestState) -> SamlResult<StoredEntry> {
        let ordinal = match self.entries.keys().next_back() {
            None => 1,
            Some(&last) if last < MAX_ORDINAL => last + 1,
            Some(_) => {
                return Err(SamlError::Binding(
                    "request state ordinals are exhausted".into(),
                ))
            }
        };
        let name = self.name(ordinal);
        let value = self.protector.protect(&name, state)?;

        let mut evicted = Vec::new();
        while self.entries.len() >= self.max_outstanding {
            match self.entries.pop_first() {
                Some((oldest, _)) => evicted.push(self.name(oldest)),
                None => break,
            }
        }
        if !evicted.is_empty() {
            debug!(?evicted, "evicting oldest request states");
        }
        self.entries.insert(ordinal, value.clone());
        Ok(StoredEntry {
            name,
            value,
            evicted,
        })
    }

    /// State stored under `token`, if it is present and opens intact.
    pub fn retrieve(&self, token: &str) -> Option<StoredRequestState> {
        let value = self.entries.get(&self.ordinal(token)?)?;
        let state = self.protector.unprotect(token, value);
        if state.is_none() {
            warn!(token, "request state failed integrity check");
        }
        state
    }

    /// The outstanding state whose request had the given ID.
    pub fn find_by_message_id(&self, message_id: &str) -> Option<(String, StoredRequestState)> {
        self.entries.keys().rev().find_map(|&ordinal| {
            let name = self.name(ordinal);
            self.retrieve(&name)
                .filter(|state| state.message_id == message_id)
                .map(|state| (name, state))
        })
    }

    pub fn remove(&mut self, token: &str) -> bool {
        match self.ordinal(token) {
            Some(ordinal) => self.entries.remove(&ordinal).is_some(),
            None => false,
        }
    }
}
