// ── Runtime controller configuration ──
//
// These types describe *how* the state manager talks to the driver: bounded
// waits, poll cadence, and the hardware-supported ACA channel range.
// They never touch disk; `moca-config` builds one and hands it in.

use std::time::Duration;

use crate::error::InvalidArgument;

/// Channels accepted by `AcaController::start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelRange {
    pub min: u32,
    pub max: u32,
}

impl ChannelRange {
    pub fn new(min: u32, max: u32) -> Result<Self, InvalidArgument> {
        if min > max {
            return Err(InvalidArgument::field(
                "aca_channels",
                format!("min {min} is greater than max {max}"),
            ));
        }
        Ok(Self { min, max })
    }

    pub fn contains(&self, channel: u32) -> bool {
        (self.min..=self.max).contains(&channel)
    }
}

impl Default for ChannelRange {
    /// One bit per channel in the 64-bit frequency capability mask.
    fn default() -> Self {
        Self { min: 0, max: 63 }
    }
}

/// Tunables for one [`Controller`](crate::Controller).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Bound on every plain gateway read or write.
    pub gateway_timeout: Duration,
    /// How long `start` waits for the gateway to acknowledge an ACA request.
    pub aca_ack_timeout: Duration,
    /// How long `cancel` waits for the gateway to acknowledge an abort
    /// before forcing the local transition.
    pub aca_cancel_timeout: Duration,
    /// Status poll cadence while a session is `Running`.
    pub aca_poll_interval: Duration,
    /// Overall bound on a `Running` session before it is failed.
    pub aca_deadline: Duration,
    /// Consecutive failed status polls tolerated before failing the session.
    pub aca_poll_retries: u32,
    /// Hardware-supported channel range for ACA.
    pub aca_channels: ChannelRange,
    /// Per-observer notification bound; slower observers are dropped.
    pub observer_timeout: Duration,
    /// Maximum age of a cached dynamic-info read. Zero disables caching.
    pub dynamic_info_max_age: Duration,
    /// Background topology refresh period. Zero disables it.
    pub refresh_interval: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            gateway_timeout: Duration::from_secs(2),
            aca_ack_timeout: Duration::from_secs(5),
            aca_cancel_timeout: Duration::from_secs(2),
            aca_poll_interval: Duration::from_millis(500),
            aca_deadline: Duration::from_secs(120),
            aca_poll_retries: 3,
            aca_channels: ChannelRange::default(),
            observer_timeout: Duration::from_secs(1),
            dynamic_info_max_age: Duration::from_secs(1),
            refresh_interval: Duration::from_secs(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_range_bounds_are_inclusive() {
        let range = ChannelRange::default();
        assert!(range.contains(0));
        assert!(range.contains(63));
        assert!(!range.contains(64));
    }

    #[test]
    fn channel_range_rejects_inverted_bounds() {
        assert!(ChannelRange::new(10, 2).is_err());
    }
}
