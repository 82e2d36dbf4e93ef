//! Simulated environment.
//!
//! Sleeping advances a virtual clock instead of waiting, and every sleep is
//! recorded, so retry loops run instantly and their delays can be asserted.

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use bridgehead_core::Environment;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::trace;

/// Default virtual start time (2024-01-01T00:00:00Z).
pub const DEFAULT_START_SECS: i64 = 1_704_067_200;

struct State {
    now_secs: i64,
    rng: ChaCha8Rng,
    sleeps: Vec<Duration>,
}

/// Deterministic [`Environment`] with a virtual clock and seeded RNG.
///
/// Clones share the clock, the RNG and the sleep log.
#[derive(Clone)]
pub struct SimEnv {
    state: Arc<Mutex<State>>,
}

impl std::fmt::Debug for SimEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimEnv").field("now_secs", &self.now_secs()).finish_non_exhaustive()
    }
}

impl SimEnv {
    /// Environment seeded with `seed`, starting at [`DEFAULT_START_SECS`].
    pub fn with_seed(seed: u64) -> Self {
        Self::starting_at(seed, DEFAULT_START_SECS)
    }

    /// Environment seeded with `seed`, starting at `now_secs`.
    pub fn starting_at(seed: u64, now_secs: i64) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                now_secs,
                rng: ChaCha8Rng::seed_from_u64(seed),
                sleeps: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current virtual time.
    pub fn now_secs(&self) -> i64 {
        self.lock().now_secs
    }

    /// Move the clock forward.
    pub fn advance(&self, duration: Duration) {
        self.lock().now_secs += duration.as_secs() as i64;
    }

    /// Every sleep so far, in order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.lock().sleeps.clone()
    }
}

impl Environment for SimEnv {
    fn wall_clock_secs(&self) -> i64 {
        self.now_secs()
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        let now_secs = {
            let mut state = self.lock();
            state.sleeps.push(duration);
            state.now_secs += duration.as_secs() as i64;
            state.now_secs
        };
        trace!(?duration, now_secs, "virtual sleep");
        tokio::task::yield_now()
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        self.lock().rng.fill_bytes(buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sleep_advances_clock_without_waiting() {
        let env = SimEnv::with_seed(1);
        env.sleep(Duration::from_secs(10)).await;
        env.sleep(Duration::from_secs(5)).await;
        assert_eq!(env.now_secs(), DEFAULT_START_SECS + 15);
        assert_eq!(env.sleeps(), [Duration::from_secs(10), Duration::from_secs(5)]);
    }

    #[test]
    fn same_seed_same_bytes() {
        let (a, b) = (SimEnv::with_seed(7), SimEnv::with_seed(7));
        assert_eq!(a.random_u64(), b.random_u64());
        assert_ne!(a.random_u64(), SimEnv::with_seed(8).random_u64());
    }

    #[test]
    fn clones_share_state() {
        let env = SimEnv::with_seed(1);
        env.clone().advance(Duration::from_secs(3));
        assert_eq!(env.now_secs(), DEFAULT_START_SECS + 3);
    }
}
