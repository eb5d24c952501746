//! The connection authority flag: the single answer to "is this call connected".
//!
//! Single writer (the monitor, plus override paths), many lock-free readers.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

const NO_TIMESTAMP: u64 = u64::MAX;

#[derive(Debug)]
pub struct AuthorityFlag {
    connected: AtomicBool,
    connected_at_millis: AtomicU64,
    failed_at_millis: AtomicU64,
}

impl Default for AuthorityFlag {
    fn default() -> Self {
        Self::new()
    }
}

fn load_timestamp(slot: &AtomicU64) -> Option<u64> {
    match slot.load(Ordering::Acquire) {
        NO_TIMESTAMP => None,
        millis => Some(millis),
    }
}

impl AuthorityFlag {
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
            connected_at_millis: AtomicU64::new(NO_TIMESTAMP),
            failed_at_millis: AtomicU64::new(NO_TIMESTAMP),
        }
    }

    pub fn get(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// True when no call is authoritatively connected.
    pub fn can_start_new_connection(&self) -> bool {
        !self.get()
    }

    /// Privileged write. Returns whether the value changed.
    ///
    /// Setting `true` while already `true` changes nothing, including `connected_at`.
    /// Setting `false` always stamps `failed_at`.
    pub fn set(&self, connected: bool, now_millis: u64) -> bool {
        if connected {
            let changed = self
                .connected
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok();
            if changed {
                self.connected_at_millis.store(now_millis, Ordering::Release);
            }
            changed
        } else {
            let changed = self
                .connected
                .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
                .is_ok();
            self.failed_at_millis.store(now_millis, Ordering::Release);
            changed
        }
    }

    pub fn connected_at(&self) -> Option<u64> {
        load_timestamp(&self.connected_at_millis)
    }

    pub fn failed_at(&self) -> Option<u64> {
        load_timestamp(&self.failed_at_millis)
    }
}
