//! Session time in milliseconds.
//!
//! Clock tick counters wrap. The engine measures every deadline against a 64-bit millisecond
//! count that accumulates the ticks elapsed between successive clock readings, so a counter
//! overflow is invisible to the keep-alive and retransmission timers.
use embedded_time::{Clock, Instant};

pub(crate) struct Uptime<C: Clock> {
    last: Option<Instant<C>>,
    ticks: u64,
}

impl<C: Clock> Uptime<C>
where
    C::T: Into<u64>,
{
    pub fn new() -> Self {
        Self {
            last: None,
            ticks: 0,
        }
    }

    /// Account for a new clock reading and return the milliseconds elapsed since the first one.
    ///
    /// # Note
    /// Readings must be taken more often than half the counter range. A reading earlier than
    /// the previous one is ignored.
    pub fn update(&mut self, now: Instant<C>) -> u64 {
        match self.last {
            None => self.last = Some(now),
            Some(last) => {
                if let Some(elapsed) = now.checked_duration_since(&last) {
                    self.ticks = self.ticks.saturating_add(elapsed.integer().into());
                    self.last = Some(now);
                }
            }
        }

        let scaling = C::SCALING_FACTOR;
        let millis = u128::from(self.ticks) * u128::from(*scaling.numerator()) * 1000
            / u128::from(*scaling.denominator());
        millis as u64
    }
}
