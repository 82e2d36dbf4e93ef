//! Production Environment implementation using system time and RNG.
//!
//! - Wall clock from `SystemTime`
//! - OS cryptographic RNG (getrandom), used for tokens and pickle nonces
//! - Tokio async sleep for actual wall-clock delays

use std::time::Duration;

use bridgehead_core::Environment;

/// Production environment using system time and cryptographic RNG.
///
/// # Panics
///
/// Panics if the OS RNG fails. Without working randomness the bridge cannot
/// generate tokens or seal session material, and RNG failure indicates an
/// OS-level problem.
#[derive(Clone, Default)]
pub struct SystemEnv;

impl SystemEnv {
    /// Create a new system environment.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Environment for SystemEnv {
    #[allow(clippy::expect_used, clippy::disallowed_methods)]
    fn wall_clock_secs(&self) -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("invariant: system clock is after Unix epoch (1970-01-01)")
            .as_secs() as i64
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    #[allow(clippy::expect_used)]
    fn random_bytes(&self, buffer: &mut [u8]) {
        getrandom::fill(buffer).expect("invariant: OS RNG failure is unrecoverable");
    }
}
