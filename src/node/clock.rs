use std::sync::atomic::{AtomicU64, Ordering};

/// Per-node Lamport clock. Every update strictly increases the value; an
/// update that would pass `u64::MAX` leaves the clock unchanged and
/// returns None.
#[derive(Debug, Default)]
pub struct LamportClock {
    time: AtomicU64,
}

impl LamportClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> u64 {
        self.time.load(Ordering::SeqCst)
    }

    /// Local event: `clock += 1`
    pub fn tick(&self) -> Option<u64> {
        self.advance(|current| current.checked_add(1))
    }

    /// Receive rule: `clock = max(clock, received) + 1`
    pub fn observe(&self, received: u64) -> Option<u64> {
        self.advance(|current| current.max(received).checked_add(1))
    }

    fn advance<F>(&self, step: F) -> Option<u64>
    where
        F: Fn(u64) -> Option<u64>,
    {
        let mut current = self.time.load(Ordering::SeqCst);
        loop {
            let next = step(current)?;
            match self
                .time
                .compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return Some(next),
                Err(actual) => current = actual,
            }
        }
    }
}
