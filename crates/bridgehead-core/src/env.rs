//! Environment abstraction for deterministic testing.
//!
//! Decouples bridge logic from system resources (wall clock, sleeping,
//! randomness). Production code uses real system resources; the harness uses
//! a virtual clock so retry loops can be exercised without waiting.

use std::time::Duration;

/// Abstract environment providing time, randomness, and async sleeping.
///
/// # Invariants
///
/// - `wall_clock_secs()` is Unix time in seconds and never goes backwards
///   within a single execution context
/// - `random_bytes()` uses cryptographically secure entropy in production
pub trait Environment: Clone + Send + Sync + 'static {
    /// Current Unix time in whole seconds.
    fn wall_clock_secs(&self) -> i64;

    /// Sleeps for the specified duration.
    ///
    /// Only driver code (retry loops, schedulers) should sleep; pure logic
    /// takes time as an argument instead.
    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send;

    /// Fills the provided buffer with random bytes.
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Generates a random `u64`.
    fn random_u64(&self) -> u64 {
        let mut bytes = [0u8; 8];
        self.random_bytes(&mut bytes);
        u64::from_be_bytes(bytes)
    }
}
