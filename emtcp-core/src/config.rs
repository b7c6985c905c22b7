//! Stack-wide tunables.

use thiserror::Error as ThisError;

/// A count of protocol timer steps. One tick is nominally 100 ms.
pub type Tick = u32;

/// The number of ticks in one second.
pub const TICKS_PER_SECOND: u16 = 10;

/// The segment size assumed for a peer that does not send an MSS option.
pub const DEFAULT_MSS: u16 = 536;

/// The largest segment the engine sends or advertises.
pub const MAX_MSS: u16 = 1440;

/// Configuration shared by every socket of a [`Tcp`](crate::Tcp) stack.
///
/// Durations are given in ticks unless the field says otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TcpConfig {
    /// The number of control blocks in the socket table
    pub num_sockets: usize,
    /// How many times a data segment or FIN is retransmitted before the
    /// connection is aborted
    pub max_retries: u8,
    /// The retransmission timeout before any round trip has been measured
    pub retry_timeout: u16,
    /// The interval between SYN+ACK retransmissions
    pub syn_retry_timeout: u16,
    /// The interval between SYN retransmissions of an active open
    pub initial_retry_timeout: u16,
    /// How many times a SYN is retransmitted before the open fails
    pub connect_retries: u8,
    /// Seconds a connection may sit idle before keep-alive probing starts or,
    /// without keep-alive, before it is closed. Used by sockets whose own
    /// timeout is unset or zero. Zero here disables the timer.
    pub default_timeout: u16,
    /// The MSS advertised in our SYN segments
    pub max_segment_size: u16,
    /// The receive window advertised to peers
    pub receive_window: u16,
    /// The smallest retransmission timeout the estimator may produce
    pub min_rto: u16,
    /// How long a connection lingers in TIME-WAIT
    pub time_wait: u16,
    /// How long received data may wait for a piggybacked acknowledgement
    pub delayed_ack: u16,
    /// First port of the ephemeral range
    pub dynamic_port_start: u16,
    /// Last port of the ephemeral range
    pub dynamic_port_end: u16,
    /// Total bytes of send buffers that may be allocated at once
    pub pool_size: usize,
    /// Seed for initial sequence numbers. `None` seeds from entropy.
    pub seed: Option<u64>,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            num_sockets: 8,
            max_retries: 5,
            retry_timeout: 4 * TICKS_PER_SECOND,
            syn_retry_timeout: 2 * TICKS_PER_SECOND,
            initial_retry_timeout: TICKS_PER_SECOND,
            connect_retries: 3,
            default_timeout: 120,
            max_segment_size: MAX_MSS,
            receive_window: 4320,
            min_rto: 2,
            time_wait: 2,
            delayed_ack: 2,
            dynamic_port_start: 49152,
            dynamic_port_end: 65535,
            pool_size: 16 * 1024,
            seed: None,
        }
    }
}

impl TcpConfig {
    /// Checks that the values can be used together.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_sockets == 0 {
            Err(ConfigError::NoSockets)?
        }
        if !(DEFAULT_MSS..=MAX_MSS).contains(&self.max_segment_size) {
            Err(ConfigError::SegmentSize(self.max_segment_size))?
        }
        if self.receive_window < self.max_segment_size {
            Err(ConfigError::ReceiveWindow {
                window: self.receive_window,
                mss: self.max_segment_size,
            })?
        }
        if self.dynamic_port_start == 0 || self.dynamic_port_start > self.dynamic_port_end {
            Err(ConfigError::PortRange {
                start: self.dynamic_port_start,
                end: self.dynamic_port_end,
            })?
        }
        if self.retry_timeout == 0 || self.syn_retry_timeout == 0 || self.initial_retry_timeout == 0
        {
            Err(ConfigError::ZeroTimeout)?
        }
        Ok(())
    }

    /// The idle period in ticks for a socket whose timeout option is
    /// `seconds`. `None` and zero both mean the configured default.
    pub fn idle_ticks(&self, seconds: Option<u16>) -> u32 {
        let seconds = seconds
            .filter(|&seconds| seconds != 0)
            .unwrap_or(self.default_timeout);
        seconds as u32 * TICKS_PER_SECOND as u32
    }
}

/// A configuration that the stack cannot run with
#[derive(Debug, ThisError, PartialEq, Eq, Clone, Copy)]
pub enum ConfigError {
    #[error("The socket table must have at least one entry")]
    NoSockets,
    #[error("Segment size {0} is outside of 536..=1440")]
    SegmentSize(u16),
    #[error("Receive window {window} is smaller than the segment size {mss}")]
    ReceiveWindow { window: u16, mss: u16 },
    #[error("Dynamic port range {start}..={end} is empty or includes port zero")]
    PortRange { start: u16, end: u16 },
    #[error("Retransmission timeouts must be at least one tick")]
    ZeroTimeout,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert_eq!(TcpConfig::default().validate(), Ok(()));
    }

    #[test]
    fn rejects_bad_values() {
        let config = TcpConfig {
            max_segment_size: 1500,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::SegmentSize(1500)));

        let config = TcpConfig {
            receive_window: 1000,
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::ReceiveWindow {
                window: 1000,
                mss: MAX_MSS
            })
        );

        let config = TcpConfig {
            num_sockets: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::NoSockets));
    }

    #[test]
    fn idle_ticks_uses_default() {
        let config = TcpConfig::default();
        assert_eq!(config.idle_ticks(None), 1200);
        assert_eq!(config.idle_ticks(Some(3)), 30);
        assert_eq!(config.idle_ticks(Some(0)), 1200);

        let config = TcpConfig {
            default_timeout: 0,
            ..Default::default()
        };
        assert_eq!(config.idle_ticks(Some(0)), 0);
        assert_eq!(config.idle_ticks(Some(3)), 30);
    }
}
