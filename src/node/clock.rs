/// Lamport logical clock.
///
/// Advanced on local events with [`LamportClock::tick`] and resynchronised on
/// every inbound message with [`LamportClock::observe`]. The value never
/// decreases. Callers serialise access through the node lock.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LamportClock {
    value: u64,
}

impl LamportClock {
    pub fn new() -> Self {
        Self { value: 0 }
    }

    /// Increment the clock for a local event and return the new timestamp
    pub fn tick(&mut self) -> u64 {
        self.value = self.value.saturating_add(1);
        self.value
    }

    /// Merge a remote timestamp: `clock = max(clock, remote) + 1`
    pub fn observe(&mut self, remote: u64) -> u64 {
        self.value = self.value.max(remote).saturating_add(1);
        self.value
    }

    pub fn now(&self) -> u64 {
        self.value
    }
}
