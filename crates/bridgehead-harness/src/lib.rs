//! Deterministic test doubles for the bridgehead runtime.
//!
//! Everything the lifecycle talks to can be replaced here: [`SimEnv`] for
//! time and randomness, [`MockIntentSource`] for the homeserver,
//! [`TestChild`] for the network backend, [`MockCrypto`] for the encryption
//! engine and [`RecordingSink`] for bridge-state pushes.
//!
//! Backend-side calls are appended to one shared [`Recorder`] so tests can
//! assert on their relative order.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod mock_crypto;
pub mod mock_intent;
pub mod record;
pub mod sim_env;
pub mod test_child;

pub use fixtures::{EXAMPLE_CONFIG, TestConfig, test_info};
pub use mock_crypto::MockCrypto;
pub use mock_intent::{IntentCall, MockIntent, MockIntentSource};
pub use record::{Record, Recorder, RecordingSink};
pub use sim_env::SimEnv;
pub use test_child::{Capabilities, TestChild, TestGhost, TestPortal, TestUser};
