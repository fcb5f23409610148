//! Environment helpers for unit tests that read process variables.

use std::env;

use tokio::sync::{Mutex, MutexGuard};

static ENV_LOCK: Mutex<()> = Mutex::const_new(());

/// Holds the environment lock and restores overridden variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<String>)>,
    _guard: MutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets `key` to `value`, or removes it when `value` is `None`, while
    /// holding the process-wide environment lock.
    pub async fn with_var(key: &str, value: Option<&str>) -> Self {
        let guard = ENV_LOCK.lock().await;
        let previous = vec![(key.to_owned(), env::var(key).ok())];
        match value {
            Some(value) => unsafe { env::set_var(key, value) },
            None => unsafe { env::remove_var(key) },
        }
        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, value) in &self.previous {
            match value {
                Some(value) => unsafe { env::set_var(key, value) },
                None => unsafe { env::remove_var(key) },
            }
        }
    }
}
