//! Virtual time for pacing tests. Pausing advances the clock instantly.

use std::sync::{
    Mutex, PoisonError,
    atomic::{AtomicU64, Ordering},
};

use crate::pacing::{BusClock, BusDuration, BusInstant};

#[derive(Debug, Default)]
pub struct MockClock {
    now_ms: AtomicU64,
    pauses: Mutex<Vec<BusDuration>>,
}

impl MockClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every pause taken so far, in order.
    pub fn pauses(&self) -> Vec<BusDuration> {
        self.pauses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl BusClock for MockClock {
    fn now(&self) -> BusInstant {
        BusInstant::from_ticks(self.now_ms.load(Ordering::SeqCst))
    }

    fn pause(&self, duration: BusDuration) {
        self.pauses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(duration);
        self.now_ms.fetch_add(duration.ticks(), Ordering::SeqCst);
    }
}
