//! Room-key derivation and authenticated encryption for chat payloads.
//!
//! Every participant derives the same 256-bit AES-GCM key from the room
//! code alone; the key never crosses the wire. Envelopes carry a fresh
//! random 96-bit IV per message and decrypt identically whether they
//! arrived over the direct data channel or the signaling relay.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use pbkdf2::pbkdf2_hmac;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

/// Application-wide derivation salt. Deliberately a constant rather than a
/// per-room random value: both participants must arrive at the same key
/// from the room code alone, with no prior exchange.
pub const KEY_DERIVATION_SALT: &[u8] = b"ParleyRoomKeyV1";

/// PBKDF2-HMAC-SHA256 iteration count.
pub const KEY_DERIVATION_ITERATIONS: u32 = 100_000;

const IV_LEN: usize = 12;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("no room key has been derived yet")]
    KeyUnavailable,
    #[error("failed to decrypt envelope")]
    DecryptionFailed,
    #[error("failed to encrypt message: {0}")]
    Encryption(String),
}

/// A symmetric key bound 1:1 to a room code. Never serialized.
#[derive(Clone)]
pub struct RoomKey([u8; 32]);

impl RoomKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for RoomKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RoomKey(..)")
    }
}

/// Derive the shared room key from a room code.
///
/// Deterministic: the code is trimmed and uppercased first, so every
/// participant holding the same code computes the same key regardless of
/// how it was typed.
pub fn derive_room_key(room_code: &str) -> RoomKey {
    let normalized = room_code.trim().to_ascii_uppercase();
    let mut key = [0u8; 32];
    pbkdf2_hmac::<Sha256>(
        normalized.as_bytes(),
        KEY_DERIVATION_SALT,
        KEY_DERIVATION_ITERATIONS,
        &mut key,
    );
    RoomKey(key)
}

/// Wire shape of an encrypted chat payload: base64 IV + base64 ciphertext.
/// Identical on the relay path and the direct channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Envelope {
    pub iv: String,
    pub data: String,
}

/// Authenticated encrypt/decrypt of structured chat messages.
///
/// Starts without a key; `Encrypt` before `install` fails with
/// `KeyUnavailable`. The key is dropped with the cipher when the session
/// ends.
#[derive(Default)]
pub struct MessageCipher {
    cipher: Option<Aes256Gcm>,
}

impl MessageCipher {
    pub fn empty() -> Self {
        Self { cipher: None }
    }

    pub fn with_key(key: &RoomKey) -> Self {
        let mut cipher = Self::empty();
        cipher.install(key);
        cipher
    }

    pub fn install(&mut self, key: &RoomKey) {
        self.cipher = Some(Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes())));
    }

    pub fn is_ready(&self) -> bool {
        self.cipher.is_some()
    }

    /// Encrypt a serializable message under a fresh random IV.
    pub fn encrypt<T: Serialize>(&self, message: &T) -> Result<Envelope, CryptoError> {
        let cipher = self.cipher.as_ref().ok_or(CryptoError::KeyUnavailable)?;

        let plaintext =
            serde_json::to_vec(message).map_err(|err| CryptoError::Encryption(err.to_string()))?;

        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&iv), plaintext.as_ref())
            .map_err(|err| CryptoError::Encryption(err.to_string()))?;

        Ok(Envelope {
            iv: STANDARD.encode(iv),
            data: STANDARD.encode(ciphertext),
        })
    }

    /// Decrypt and deserialize an envelope. Any failure, from bad base64 to
    /// an authentication-tag mismatch, yields `DecryptionFailed`; no partial
    /// data is ever returned.
    pub fn decrypt<T: DeserializeOwned>(&self, envelope: &Envelope) -> Result<T, CryptoError> {
        let cipher = self.cipher.as_ref().ok_or(CryptoError::KeyUnavailable)?;

        let iv = STANDARD
            .decode(&envelope.iv)
            .map_err(|_| CryptoError::DecryptionFailed)?;
        if iv.len() != IV_LEN {
            return Err(CryptoError::DecryptionFailed);
        }
        let ciphertext = STANDARD
            .decode(&envelope.data)
            .map_err(|_| CryptoError::DecryptionFailed)?;

        let plaintext = cipher
            .decrypt(Nonce::from_slice(&iv), ciphertext.as_ref())
            .map_err(|_| CryptoError::DecryptionFailed)?;

        serde_json::from_slice(&plaintext).map_err(|_| CryptoError::DecryptionFailed)
    }
}
