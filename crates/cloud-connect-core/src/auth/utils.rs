use std::sync::{Mutex, MutexGuard};

use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};

pub fn random_state(len: usize) -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

pub(crate) trait MutexExt<T> {
    /// Lock, recovering the data if a previous holder panicked.
    fn lock_or_recover(&self) -> MutexGuard<'_, T>;
}

impl<T> MutexExt<T> for Mutex<T> {
    #[track_caller]
    fn lock_or_recover(&self) -> MutexGuard<'_, T> {
        match self.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                let loc = std::panic::Location::caller();
                tracing::error!(
                    file = loc.file(),
                    line = loc.line(),
                    "mutex poisoned; continuing with recovered state"
                );
                poisoned.into_inner()
            }
        }
    }
}
