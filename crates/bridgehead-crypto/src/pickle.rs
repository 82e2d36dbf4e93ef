//! Pickle sealing using `XChaCha20-Poly1305`

use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit, Payload},
};
use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroize;

use crate::PickleError;

/// Size of the `XChaCha20` nonce (24 bytes)
pub const NONCE_SIZE: usize = 24;

/// Poly1305 tag size (16 bytes)
const TAG_SIZE: usize = 16;

/// Label used for pickle key derivation
const PICKLE_KEY_LABEL: &[u8] = b"bridgeheadPickleV1";

/// Symmetric key protecting one account's pickles.
///
/// Zeroized on drop.
#[derive(Clone)]
pub struct PickleKey([u8; 32]);

impl PickleKey {
    /// Derive the key for `account_scope` from the configured pickle key.
    ///
    /// Different scopes sharing one configured key get unrelated keys, so a
    /// database holding several accounts never reuses key material.
    pub fn derive(configured: &[u8], account_scope: &str) -> Self {
        let hkdf = Hkdf::<Sha256>::new(Some(account_scope.as_bytes()), configured);

        let mut key = [0u8; 32];
        let Ok(()) = hkdf.expand(PICKLE_KEY_LABEL, &mut key) else {
            unreachable!("32 bytes is a valid HKDF-SHA256 output length");
        };
        Self(key)
    }

    /// Wrap raw key bytes.
    pub fn from_bytes(key: [u8; 32]) -> Self {
        Self(key)
    }

    fn cipher(&self) -> XChaCha20Poly1305 {
        XChaCha20Poly1305::new((&self.0).into())
    }
}

impl Drop for PickleKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl std::fmt::Debug for PickleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PickleKey(..)")
    }
}

/// A sealed pickle: nonce followed by ciphertext and tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedPickle {
    /// The 24-byte `XChaCha20` nonce
    pub nonce: [u8; NONCE_SIZE],
    /// The ciphertext including 16-byte Poly1305 tag
    pub ciphertext: Vec<u8>,
}

impl SealedPickle {
    /// Storage encoding: `nonce || ciphertext`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(NONCE_SIZE + self.ciphertext.len());
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    /// Parse the storage encoding.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PickleError> {
        if bytes.len() < NONCE_SIZE + TAG_SIZE {
            return Err(PickleError::Truncated { len: bytes.len() });
        }
        let (nonce_bytes, ciphertext) = bytes.split_at(NONCE_SIZE);
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(nonce_bytes);
        Ok(Self { nonce, ciphertext: ciphertext.to_vec() })
    }
}

/// Seal `pickle` for the row identified by `row_key`.
///
/// Caller MUST provide cryptographically secure random bytes in production.
pub fn seal(
    key: &PickleKey,
    row_key: &[u8],
    pickle: &[u8],
    nonce: [u8; NONCE_SIZE],
) -> SealedPickle {
    let payload = Payload { msg: pickle, aad: row_key };
    let Ok(ciphertext) = key.cipher().encrypt(XNonce::from_slice(&nonce), payload) else {
        unreachable!("XChaCha20-Poly1305 encryption cannot fail with valid inputs");
    };
    SealedPickle { nonce, ciphertext }
}

/// Open a pickle sealed for `row_key`.
///
/// # Errors
///
/// - `AuthenticationFailed`: wrong key, wrong row, or tampered bytes
pub fn open(
    key: &PickleKey,
    row_key: &[u8],
    sealed: &SealedPickle,
) -> Result<Vec<u8>, PickleError> {
    let payload = Payload { msg: sealed.ciphertext.as_slice(), aad: row_key };
    key.cipher()
        .decrypt(XNonce::from_slice(&sealed.nonce), payload)
        .map_err(|_| PickleError::AuthenticationFailed)
}
