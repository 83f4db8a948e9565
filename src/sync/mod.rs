pub mod versioned_lock;

pub use versioned_lock::{Generation, StateChanged, VersionedGuard, VersionedLock};
