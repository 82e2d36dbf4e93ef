//! Pickle error types

use thiserror::Error;

/// Errors from opening sealed pickles.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PickleError {
    /// Sealed bytes are shorter than a nonce plus a tag.
    #[error("sealed pickle truncated: {len} bytes")]
    Truncated {
        /// Length of the rejected input
        len: usize,
    },

    /// Wrong key, wrong row, or tampered ciphertext.
    #[error("pickle authentication failed")]
    AuthenticationFailed,
}
