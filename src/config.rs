use crate::seq;

use std::time::Duration;

/// Parameters used to configure either endpoint of a `duolane` link. Both peers must
/// agree on `window_size`.
#[derive(Clone, Debug)]
pub struct Config {
    /// The number of reliable packets the sender may have outstanding, and the number of
    /// sequence numbers the receiver accepts ahead of its delivery cursor.
    ///
    /// Must be at least 1 and at most 2¹⁵ (half the sequence space), so that the
    /// in-window and already-delivered regions stay disjoint under wrap-around.
    pub window_size: u16,

    /// The retransmit timer period for each unacknowledged reliable packet. Also the
    /// per-attempt wait for the session-summary acknowledgement during
    /// [`Client::close`](crate::Client::close).
    ///
    /// Must be non-zero.
    pub resend_timeout: Duration,

    /// The total retransmission budget per packet. The sender stops resending a packet
    /// after `stop_threshold / resend_timeout` resends and drops it; the receiver uses
    /// the same duration as its gap-skip timeout, so both ends give up on a lost packet
    /// on the same schedule.
    pub stop_threshold: Duration,
}

impl Default for Config {
    /// Creates a configuration with the following parameters:
    ///   * Window size: 16 packets
    ///   * Retransmit timer period: 50 ms
    ///   * Retransmission stop threshold: 200 ms (4 resends per packet)
    fn default() -> Self {
        Self {
            window_size: 16,
            resend_timeout: Duration::from_millis(50),
            stop_threshold: Duration::from_millis(200),
        }
    }
}

impl Config {
    /// Returns `true` if each parameter has a valid value.
    pub fn is_valid(&self) -> bool {
        self.window_size >= 1 && self.window_size <= seq::HALF_SPACE && !self.resend_timeout.is_zero()
    }

    /// The number of times a reliable packet is resent before it is dropped.
    pub fn max_resend_count(&self) -> u32 {
        (self.stop_threshold.as_millis() / self.resend_timeout.as_millis().max(1)) as u32
    }
}
