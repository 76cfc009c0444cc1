// Copyright 2024 The Kubernetes Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! A mutex keyed by string ids.
//!
//! Keys hash onto a fixed set of mutexes, so two different keys may share a
//! lock. Holders must not take a second key while holding one.

use std::sync::{Mutex, MutexGuard, OnceLock};
use std::thread;
use tracing::debug;

/// HashedKeyMutex serializes callers that use the same key.
pub struct HashedKeyMutex {
    mutexes: Vec<Mutex<()>>,
}

/// KeyGuard releases its key when dropped.
pub struct KeyGuard<'a> {
    id: String,
    _guard: MutexGuard<'a, ()>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        debug!("UnlockKey(...) for id {:?} completed", self.id);
    }
}

impl HashedKeyMutex {
    /// Create a mutex with `n` buckets. Zero selects the number of CPUs.
    pub fn new(n: usize) -> Self {
        let n = if n == 0 {
            thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
        } else {
            n
        };
        Self {
            mutexes: (0..n).map(|_| Mutex::new(())).collect(),
        }
    }

    /// Block until `id` is free and take it.
    pub fn lock_key(&self, id: &str) -> KeyGuard<'_> {
        debug!("LockKey(...) called for id {:?}", id);
        let bucket = &self.mutexes[self.hash(id)];
        let guard = bucket.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        debug!("LockKey(...) for id {:?} completed", id);
        KeyGuard {
            id: id.to_string(),
            _guard: guard,
        }
    }

    fn hash(&self, id: &str) -> usize {
        (fnv32a(id.as_bytes()) as usize) % self.mutexes.len()
    }
}

impl Default for HashedKeyMutex {
    fn default() -> Self {
        Self::new(0)
    }
}

fn fnv32a(data: &[u8]) -> u32 {
    data.iter()
        .fold(2_166_136_261u32, |hash, b| (hash ^ u32::from(*b)).wrapping_mul(16_777_619))
}

/// Returns the process-wide mutex used to serialize disk attach operations
/// per instance.
pub fn instance_mutex() -> &'static HashedKeyMutex {
    static MUTEX: OnceLock<HashedKeyMutex> = OnceLock::new();
    MUTEX.get_or_init(HashedKeyMutex::default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_fnv32a() {
        assert_eq!(fnv32a(b""), 0x811c9dc5);
        assert_eq!(fnv32a(b"a"), 0xe40c292c);
    }

    #[test]
    fn test_same_key_is_exclusive() {
        let km = Arc::new(HashedKeyMutex::new(4));
        let active = Arc::new(AtomicUsize::new(0));
        let max_active = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let km = km.clone();
                let active = active.clone();
                let max_active = max_active.clone();
                thread::spawn(move || {
                    let _guard = km.lock_key("instance-1");
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    max_active.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(10));
                    active.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(max_active.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let km = HashedKeyMutex::new(1);
        drop(km.lock_key("a"));
        // A single bucket means every key shares the lock.
        let _guard = km.lock_key("b");
    }
}
