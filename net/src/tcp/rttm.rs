//! Round-trip time measurement and retransmission timeout (RFC 6298).

use core::time::Duration;

/// Lower bound on the RTO (RFC 6298 2.4).
pub const RTO_MIN: Duration = Duration::from_secs(1);
/// Upper bound on the RTO and its back-off.
pub const RTO_MAX: Duration = Duration::from_secs(60);
/// RTO before the first sample.
pub const RTO_INITIAL: Duration = Duration::from_secs(1);
/// RTO while waiting for the SYN to be acknowledged (RFC 6298 5.7).
pub const RTO_SYN: Duration = Duration::from_secs(3);
/// Clock granularity G.
const CLOCK_G: Duration = Duration::from_millis(1);

#[derive(Clone, Debug)]
pub struct Rttm {
    srtt: Option<Duration>,
    rttvar: Duration,
    rto: Duration,
    /// Start of the measurement in progress, and the sequence number whose
    /// acknowledgement ends it.
    timing: Option<(Duration, u32)>,
    samples: u32,
}

impl Rttm {
    pub const fn new() -> Self {
        Self {
            srtt: None,
            rttvar: Duration::ZERO,
            rto: RTO_INITIAL,
            timing: None,
            samples: 0,
        }
    }

    #[inline]
    pub fn rto(&self) -> Duration {
        self.rto
    }

    #[inline]
    pub fn srtt(&self) -> Option<Duration> {
        self.srtt
    }

    #[inline]
    pub fn rttvar(&self) -> Duration {
        self.rttvar
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.timing.is_some()
    }

    #[inline]
    pub fn samples(&self) -> u32 {
        self.samples
    }

    /// Start timing a segment ending at `end_seq`, unless one is in flight.
    pub fn start(&mut self, now: Duration, end_seq: u32) {
        if self.timing.is_none() {
            self.timing = Some((now, end_seq));
        }
    }

    /// Throw away the running measurement (Karn: never sample a
    /// retransmitted segment).
    pub fn cancel(&mut self) {
        self.timing = None;
    }

    /// An ACK for `ack` arrived at `now`; finish the measurement if it covers
    /// the timed segment. Returns the sample taken, if any.
    pub fn on_ack(&mut self, now: Duration, ack: u32) -> Option<Duration> {
        let (started, end_seq) = self.timing?;
        if super::header::seq_lt(ack, end_seq) {
            return None;
        }
        self.timing = None;
        let r = now.saturating_sub(started);
        self.sample(r);
        Some(r)
    }

    /// Fold one RTT sample into SRTT/RTTVAR and recompute the RTO.
    pub fn sample(&mut self, r: Duration) {
        match self.srtt {
            None => {
                self.srtt = Some(r);
                self.rttvar = r / 2;
            }
            Some(srtt) => {
                let delta = if srtt > r { srtt - r } else { r - srtt };
                self.rttvar = (self.rttvar * 3 + delta) / 4;
                self.srtt = Some((srtt * 7 + r) / 8);
            }
        }
        self.samples += 1;
        let srtt = self.srtt.unwrap_or(r);
        self.rto = (srtt + CLOCK_G.max(self.rttvar * 4)).clamp(RTO_MIN, RTO_MAX);
    }

    /// Double the RTO after a timeout, capped at [`RTO_MAX`].
    pub fn backoff(&mut self) {
        self.rto = (self.rto * 2).min(RTO_MAX);
    }

    /// Force the RTO (used for the SYN rule).
    pub fn set_rto(&mut self, rto: Duration) {
        self.rto = rto.clamp(RTO_MIN, RTO_MAX);
    }
}

impl Default for Rttm {
    fn default() -> Self {
        Self::new()
    }
}
