//! Bridgehead pickle protection
//!
//! Encryption session material (Olm accounts, Olm sessions, Megolm inbound
//! sessions) is persisted as opaque "pickles". Pickles share a database with
//! the rest of the bridge, so they are sealed before they hit disk.
//!
//! Pure functions only. Callers provide random bytes so tests stay
//! deterministic.
//!
//! ```text
//! configured pickle key
//!        │
//!        ▼
//! HKDF-SHA256 (salt = account scope) → PickleKey
//!        │
//!        ▼
//! XChaCha20-Poly1305 (aad = row key) → SealedPickle
//! ```
//!
//! The row key is bound as associated data, so a sealed pickle copied to a
//! different row fails to open.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod error;
pub mod pickle;

pub use error::PickleError;
pub use pickle::{NONCE_SIZE, PickleKey, SealedPickle, open, seal};
