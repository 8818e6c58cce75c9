//! Process-wide latching signals.
//!
//! `shutdown` and `leak_detected` are the only globals in the system. Both are
//! write-once-per-run: `set()` latches true and is never cleared during a run.
//! Every actor polls its flag once per loop iteration.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// A latching boolean flag, safe to share across threads without a mutex.
#[derive(Clone, Default)]
pub struct LatchFlag(Arc<AtomicBool>);

impl LatchFlag {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    /// Latches the flag. Idempotent.
    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Process-wide signaling flags shared by every actor.
#[derive(Clone, Default)]
pub struct SystemFlags {
    pub shutdown: LatchFlag,
    pub leak_detected: LatchFlag,
}

impl SystemFlags {
    pub fn new() -> Self {
        Self {
            shutdown: LatchFlag::new(),
            leak_detected: LatchFlag::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latch_flag_is_sticky() {
        let flag = LatchFlag::new();
        assert!(!flag.is_set());
        flag.set();
        assert!(flag.is_set());
        flag.set();
        assert!(flag.is_set());
    }

    #[test]
    fn latch_flag_shares_state_across_clones() {
        let flag = LatchFlag::new();
        let clone = flag.clone();
        clone.set();
        assert!(flag.is_set());
    }
}
