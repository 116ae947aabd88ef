use std::time::Duration;

/// Lower bound for every configurable timeout. Values below this are clamped, not rejected.
pub const MIN_TIMEOUT: Duration = Duration::from_millis(1000);

/// Resend budget for one handshake phase. `Forever` is the "resend until the peer answers
///  or the standby-wait expires" sentinel and is not recommended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReSends {
    Limited(u32),
    Forever,
}

impl ReSends {
    pub fn allows(&self, attempts_used: u32) -> bool {
        match self {
            ReSends::Forever => true,
            ReSends::Limited(max) => attempts_used < *max,
        }
    }
}

impl From<i32> for ReSends {
    fn from(raw: i32) -> ReSends {
        if raw < 0 {
            ReSends::Forever
        }
        else {
            ReSends::Limited(raw as u32)
        }
    }
}

/// Timeout and resend budget for one phase that awaits a specific reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseProfile {
    pub timeout: Duration,
    pub re_sends: ReSends,
}

impl PhaseProfile {
    pub fn new(timeout: Duration, re_sends: ReSends) -> PhaseProfile {
        PhaseProfile { timeout, re_sends }
    }

    fn normalized(self) -> PhaseProfile {
        PhaseProfile {
            timeout: self.timeout.max(MIN_TIMEOUT),
            re_sends: self.re_sends,
        }
    }
}

/// Per-phase timeout configuration of one delivery instance.
///
/// The short per-phase timeouts drive resends of the last frame; the `*_wait` timeouts
///  bound the total time spent waiting for the peer's application to commit while it keeps
///  sending standby liveness pings. `connection_timeout` and `keep_alive_delay` govern the
///  established phase.
#[derive(Debug, Clone)]
pub struct TimeoutProfile {
    pub connect_request: PhaseProfile,
    pub public_key_offer: PhaseProfile,
    pub start_session: PhaseProfile,
    pub connection_establish: PhaseProfile,

    pub public_key_offer_wait: Duration,
    pub start_session_wait: Duration,

    pub connection_timeout: Duration,
    pub keep_alive_delay: Duration,

    pub pre_request_re_sends: u32,
}

impl Default for TimeoutProfile {
    fn default() -> TimeoutProfile {
        TimeoutProfile {
            connect_request: PhaseProfile::new(Duration::from_secs(10), ReSends::Limited(3)),
            public_key_offer: PhaseProfile::new(Duration::from_secs(10), ReSends::Limited(10)),
            start_session: PhaseProfile::new(Duration::from_secs(10), ReSends::Limited(15)),
            connection_establish: PhaseProfile::new(Duration::from_secs(10), ReSends::Limited(5)),
            public_key_offer_wait: Duration::from_secs(600),
            start_session_wait: Duration::from_secs(600),
            connection_timeout: Duration::from_secs(20),
            keep_alive_delay: Duration::from_secs(5),
            pre_request_re_sends: 20,
        }
    }
}

impl TimeoutProfile {
    /// Returns the profile with all timeouts clamped to [`MIN_TIMEOUT`]. Applied once when
    ///  a delivery instance is constructed.
    pub fn normalized(self) -> TimeoutProfile {
        TimeoutProfile {
            connect_request: self.connect_request.normalized(),
            public_key_offer: self.public_key_offer.normalized(),
            start_session: self.start_session.normalized(),
            connection_establish: self.connection_establish.normalized(),
            public_key_offer_wait: self.public_key_offer_wait.max(MIN_TIMEOUT),
            start_session_wait: self.start_session_wait.max(MIN_TIMEOUT),
            connection_timeout: self.connection_timeout.max(MIN_TIMEOUT),
            keep_alive_delay: self.keep_alive_delay.max(MIN_TIMEOUT),
            pre_request_re_sends: self.pre_request_re_sends,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::below_minimum(Duration::from_millis(1), MIN_TIMEOUT)]
    #[case::at_minimum(Duration::from_millis(1000), Duration::from_millis(1000))]
    #[case::above_minimum(Duration::from_secs(30), Duration::from_secs(30))]
    fn test_normalize_clamps_timeouts(#[case] timeout: Duration, #[case] expected: Duration) {
        let profile = TimeoutProfile {
            connect_request: PhaseProfile::new(timeout, ReSends::Limited(3)),
            public_key_offer_wait: timeout,
            connection_timeout: timeout,
            keep_alive_delay: timeout,
            ..TimeoutProfile::default()
        }
        .normalized();

        assert_eq!(profile.connect_request.timeout, expected);
        assert_eq!(profile.public_key_offer_wait, expected);
        assert_eq!(profile.connection_timeout, expected);
        assert_eq!(profile.keep_alive_delay, expected);
    }

    #[rstest]
    #[case::forever(-1, ReSends::Forever)]
    #[case::zero(0, ReSends::Limited(0))]
    #[case::limited(7, ReSends::Limited(7))]
    fn test_re_sends_from_raw(#[case] raw: i32, #[case] expected: ReSends) {
        assert_eq!(ReSends::from(raw), expected);
    }

    #[rstest]
    #[case::first_attempt(ReSends::Limited(3), 0, true)]
    #[case::last_attempt(ReSends::Limited(3), 2, true)]
    #[case::exhausted(ReSends::Limited(3), 3, false)]
    #[case::none_allowed(ReSends::Limited(0), 0, false)]
    #[case::forever(ReSends::Forever, u32::MAX, true)]
    fn test_re_sends_allows(#[case] re_sends: ReSends, #[case] used: u32, #[case] expected: bool) {
        assert_eq!(re_sends.allows(used), expected);
    }
}
