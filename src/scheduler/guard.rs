use std::sync::atomic::{AtomicBool, Ordering};

/// Holds a per-job-type in-flight flag for the lifetime of one cycle.
///
/// Acquisition is a single compare-and-swap; the flag is cleared on drop, so
/// an early return or a panic inside the cycle still releases it.
pub(super) struct InFlightGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> InFlightGuard<'a> {
    pub(super) fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}
