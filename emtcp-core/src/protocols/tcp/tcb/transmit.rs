use crate::{config::Tick, pool::PoolBuffer};

/// The largest exponent applied to the retransmission timeout
const MAX_BACKOFF_SHIFT: u8 = 7;

/// The send buffer that is waiting for acknowledgement.
#[derive(Debug)]
pub struct Transmit {
    /// Sequence number of the first byte of the buffer
    pub seq: u32,
    pub buffer: PoolBuffer,
    /// When the buffer was first sent. Cleared once it is retransmitted so
    /// that an ambiguous acknowledgement is never used as a round trip
    /// sample.
    pub sent_at: Option<Tick>,
}

impl Transmit {
    /// The sequence number following the last byte of the buffer
    pub fn end(&self) -> u32 {
        self.seq.wrapping_add(self.buffer.len() as u32)
    }
}

/// Retransmission state for one control block.
///
/// At most one data buffer is outstanding at a time. The timer also paces
/// the retransmission of SYN and FIN segments, which are rebuilt from the
/// connection state instead of being stored, and it measures the TIME-WAIT
/// hold.
#[derive(Debug, Default)]
pub struct Retransmission {
    pending: Option<Transmit>,
    /// Ticks until expiry, zero while disarmed
    timer: u16,
    /// Retransmissions since the last acknowledgement of new data
    retries: u8,
}

impl Retransmission {
    /// Stores a newly sent buffer. The caller has already checked that no
    /// other buffer is outstanding.
    pub fn push(&mut self, transmit: Transmit) {
        debug_assert!(self.pending.is_none());
        self.pending = Some(transmit);
    }

    pub fn pending(&self) -> Option<&Transmit> {
        self.pending.as_ref()
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Releases the outstanding buffer, for example once it is acknowledged.
    pub fn take(&mut self) -> Option<Transmit> {
        self.pending.take()
    }

    /// Forgets the round trip start of the outstanding buffer.
    pub fn mark_retransmitted(&mut self) {
        if let Some(transmit) = &mut self.pending {
            transmit.sent_at = None;
        }
    }

    /// Starts the timer so that it expires after `ticks` calls to
    /// [`expired`](Self::expired).
    pub fn arm(&mut self, ticks: u16) {
        self.timer = ticks.max(1);
    }

    pub fn disarm(&mut self) {
        self.timer = 0;
    }

    pub fn is_armed(&self) -> bool {
        self.timer > 0
    }

    /// Advances the timer by one tick and reports whether it ran out.
    pub fn expired(&mut self) -> bool {
        match self.timer {
            0 => false,
            1 => {
                self.timer = 0;
                true
            }
            _ => {
                self.timer -= 1;
                false
            }
        }
    }

    pub fn retries(&self) -> u8 {
        self.retries
    }

    /// Counts one more retransmission and returns the new count.
    pub fn record_retry(&mut self) -> u8 {
        self.retries = self.retries.saturating_add(1);
        self.retries
    }

    pub fn reset_retries(&mut self) {
        self.retries = 0;
    }

    /// Drops the buffer and stops the timer.
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// The timeout for the `retries`-th retransmission given the current base
/// timeout. Doubles with every retry, with the shift capped at seven.
pub fn backoff(rto: u16, retries: u8) -> u16 {
    let shifted = (rto as u32) << retries.min(MAX_BACKOFF_SHIFT);
    shifted.min(u16::MAX as u32) as u16
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::BufferPool;

    #[test]
    fn timer_counts_down() {
        let mut retransmission = Retransmission::default();
        assert!(!retransmission.expired());
        retransmission.arm(3);
        assert!(!retransmission.expired());
        assert!(!retransmission.expired());
        assert!(retransmission.expired());
        assert!(!retransmission.is_armed());
        assert!(!retransmission.expired());
    }

    #[test]
    fn backoff_strictly_increases() {
        let timeouts: Vec<_> = (0..=5).map(|n| backoff(4, n)).collect();
        assert_eq!(timeouts, [4, 8, 16, 32, 64, 128]);
        assert_eq!(backoff(4, 12), 4 << 7);
        assert_eq!(backoff(40_000, 3), u16::MAX);
    }

    #[test]
    fn buffer_returns_to_pool() {
        let pool = BufferPool::new(64);
        let mut retransmission = Retransmission::default();
        retransmission.push(Transmit {
            seq: u32::MAX - 1,
            buffer: pool.alloc_from(b"four").unwrap(),
            sent_at: Some(7),
        });
        assert_eq!(pool.available(), 60);
        assert_eq!(retransmission.pending().map(Transmit::end), Some(2));

        retransmission.mark_retransmitted();
        assert_eq!(retransmission.pending().unwrap().sent_at, None);

        retransmission.clear();
        assert_eq!(pool.available(), 64);
    }
}
