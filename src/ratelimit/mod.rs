//! Rate limiting logic and state management.

mod file_store;
mod fingerprint;
mod limiter;
mod memory_store;
mod policy;
mod rules;
mod store;
mod sweeper;
mod window;

pub use file_store::FileStore;
pub use fingerprint::{Fingerprint, Identity, DEFAULT_KEY_PREFIX, UNKNOWN};
pub use limiter::RateLimiter;
pub use memory_store::MemoryStore;
pub use policy::{Decision, Policy};
pub use rules::{PolicyRules, RulesOverlay};
pub use store::{StoredEntry, WindowStore};
pub use sweeper::{SweepReport, Sweeper, DEFAULT_MAX_AGE, DEFAULT_MAX_RECORDS};
pub use window::{unix_now, Window};
