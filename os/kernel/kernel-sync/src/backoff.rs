use core::hint::spin_loop;

/// Exponent cap: at most `2^SPIN_LIMIT` pause hints per [`Backoff::spin`].
const SPIN_LIMIT: u32 = 6;

/// Exponential backoff for contended atomics.
///
/// Each call to [`spin`](Self::spin) issues twice as many pause hints as the
/// previous one, up to a fixed cap. Retry loops create one `Backoff` per
/// operation and spin after every failed compare-and-swap.
///
/// ```
/// use core::sync::atomic::{AtomicU32, Ordering};
/// use kernel_sync::Backoff;
///
/// let counter = AtomicU32::new(0);
/// let mut backoff = Backoff::new();
/// let mut cur = counter.load(Ordering::Relaxed);
/// while let Err(seen) =
///     counter.compare_exchange_weak(cur, cur + 1, Ordering::AcqRel, Ordering::Relaxed)
/// {
///     cur = seen;
///     backoff.spin();
/// }
/// assert_eq!(counter.load(Ordering::Relaxed), 1);
/// ```
#[derive(Debug, Default)]
pub struct Backoff {
    step: u32,
}

impl Backoff {
    #[must_use]
    pub const fn new() -> Self {
        Self { step: 0 }
    }

    /// Pause for the current step and grow the next one.
    #[inline]
    pub fn spin(&mut self) {
        for _ in 0..(1u32 << self.step) {
            spin_loop();
        }
        if self.step < SPIN_LIMIT {
            self.step += 1;
        }
    }

    /// `true` once the step has reached its cap.
    #[inline]
    #[must_use]
    pub const fn is_saturated(&self) -> bool {
        self.step >= SPIN_LIMIT
    }

    #[inline]
    pub const fn reset(&mut self) {
        self.step = 0;
    }
}
