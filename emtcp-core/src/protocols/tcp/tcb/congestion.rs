//! Congestion window management and round trip estimation.
//!
//! Windows are counted in segments of the negotiated MSS. The round trip
//! estimator works in ticks with the fixed point scaling from "Congestion
//! Avoidance and Control" (Jacobson and Karels, 1988): the smoothed average
//! is kept times eight and the mean deviation times four.

/// The slow start threshold used before any loss has been seen
const INITIAL_SSTHRESH_BYTES: u32 = 65535;
/// Upper bound for the congestion window in segments
const MAX_CWND: u16 = 1024;
/// Duplicate acknowledgements that trigger a fast retransmit
const DUPACK_THRESHOLD: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Congestion {
    /// Congestion window in segments
    pub cwnd: u16,
    /// Slow start threshold in segments
    pub ssthresh: u16,
    /// Consecutive duplicate acknowledgements
    pub dupacks: u8,
    /// Set between a fast retransmit and the next new acknowledgement
    pub recovering: bool,
}

impl Congestion {
    /// Fresh state for a connection that just became established. A
    /// retransmitted handshake already hints at loss, so the threshold then
    /// starts at its floor.
    pub fn new(mss: u16, handshake_retransmitted: bool) -> Self {
        let ssthresh = if handshake_retransmitted {
            2
        } else {
            (INITIAL_SSTHRESH_BYTES / mss.max(1) as u32).clamp(2, MAX_CWND as u32) as u16
        };
        Self {
            cwnd: 1,
            ssthresh,
            dupacks: 0,
            recovering: false,
        }
    }

    /// The bytes that may be in flight given the peer's advertised window
    pub fn usable_window(&self, peer_window: u16, mss: u16) -> u32 {
        (peer_window as u32).min(self.cwnd as u32 * mss as u32)
    }

    /// Records an acknowledgement that covers everything in flight.
    pub fn on_new_ack(&mut self) {
        self.dupacks = 0;
        if self.recovering {
            self.recovering = false;
            self.cwnd = self.ssthresh;
        } else if self.cwnd < self.ssthresh {
            self.cwnd = self.cwnd.saturating_mul(2).min(self.ssthresh);
        } else {
            self.cwnd = self.cwnd.saturating_add(1).min(MAX_CWND);
        }
    }

    /// Records a duplicate acknowledgement. Returns whether the outstanding
    /// segment should be fast retransmitted now.
    pub fn on_duplicate_ack(&mut self) -> bool {
        self.dupacks = self.dupacks.saturating_add(1);
        if self.dupacks == DUPACK_THRESHOLD {
            self.ssthresh = (self.cwnd / 2).max(2);
            self.cwnd = self.ssthresh + DUPACK_THRESHOLD as u16;
            self.recovering = true;
            true
        } else {
            if self.dupacks > DUPACK_THRESHOLD && self.recovering {
                self.cwnd = self.cwnd.saturating_add(1).min(MAX_CWND);
            }
            false
        }
    }

    /// Records a retransmission timeout.
    pub fn on_timeout(&mut self) {
        self.ssthresh = (self.cwnd / 2).max(2);
        self.cwnd = 1;
        self.dupacks = 0;
        self.recovering = false;
    }
}

/// Smoothed round trip time and deviation, in ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RttEstimator {
    /// Smoothed round trip time, scaled by 8
    sa: i32,
    /// Mean deviation, scaled by 4
    sv: i32,
    min_rto: u16,
}

impl RttEstimator {
    /// Starts out with a timeout of `initial_rto` ticks.
    pub fn new(initial_rto: u16, min_rto: u16) -> Self {
        Self {
            sa: 0,
            sv: initial_rto as i32,
            min_rto,
        }
    }

    /// Folds in a round trip measurement of `ticks`.
    pub fn sample(&mut self, ticks: u32) {
        let mut m = ticks.min(i16::MAX as u32) as i32;
        m -= self.sa >> 3;
        self.sa += m;
        m = m.abs();
        m -= self.sv >> 2;
        self.sv += m;
    }

    /// The current retransmission timeout, never below the configured floor
    pub fn rto(&self) -> u16 {
        ((self.sa >> 3) + self.sv).clamp(self.min_rto as i32, u16::MAX as i32) as u16
    }

    /// The smoothed round trip time in ticks
    pub fn srtt(&self) -> u16 {
        (self.sa >> 3).clamp(0, u16::MAX as i32) as u16
    }
}
