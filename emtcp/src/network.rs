//! Simulated links between workers.

use emtcp_core::protocols::tap::Frame;
use rand::{rngs::SmallRng, Rng, SeedableRng};
use std::time::Duration;
use tokio::{sync::mpsc, task::JoinHandle};

/// One direction of a point-to-point link.
///
/// Frames may be lost with a fixed probability and arrive after a fixed
/// latency. A link never reorders or duplicates frames.
#[derive(Debug, Clone)]
pub struct Link {
    /// A random number generator to determine delivery success
    rng: SmallRng,
    /// A number in the range [0, 1] giving the frequency of successful
    /// delivery
    success_rate: f64,
    /// The time between when a frame is sent and when it is delivered
    latency: Duration,
}

impl Link {
    /// A link that delivers every frame immediately.
    pub fn reliable() -> Self {
        Self::unreliable(1.0, 0)
    }

    /// A link that delivers frames with a success rate in the range [0, 1].
    pub fn unreliable(success_rate: f64, seed: u64) -> Self {
        Self {
            rng: SmallRng::seed_from_u64(seed),
            success_rate: success_rate.clamp(0.0, 1.0),
            latency: Duration::ZERO,
        }
    }

    /// Delays every frame by `latency`.
    pub fn latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Whether the next frame gets through
    fn delivers(&mut self) -> bool {
        self.rng.gen_bool(self.success_rate)
    }

    /// Carries frames from `from` to `to` until either side goes away.
    pub fn spawn(
        mut self,
        mut from: mpsc::UnboundedReceiver<Frame>,
        to: mpsc::UnboundedSender<Frame>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(frame) = from.recv().await {
                if !self.delivers() {
                    tracing::debug!(
                        local = %frame.local,
                        remote = %frame.remote,
                        len = frame.bytes.len(),
                        "Link lost frame"
                    );
                    continue;
                }
                if !self.latency.is_zero() {
                    tokio::time::sleep(self.latency).await;
                }
                // The receiver closing is part of a normal shutdown
                if to.send(frame).is_err() {
                    break;
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use emtcp_core::protocols::{ip::TCP_PROTOCOL, Ipv4Address};

    fn frame(n: u8) -> Frame {
        Frame {
            local: Ipv4Address::new([10, 0, 0, 1]).into(),
            remote: Ipv4Address::new([10, 0, 0, 2]).into(),
            protocol: TCP_PROTOCOL,
            tos: 0,
            bytes: vec![n],
        }
    }

    async fn carry(link: Link, count: u8) -> Vec<u8> {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let task = link.spawn(in_rx, out_tx);
        for n in 0..count {
            in_tx.send(frame(n)).unwrap();
        }
        drop(in_tx);
        task.await.unwrap();
        let mut delivered = vec![];
        while let Ok(frame) = out_rx.try_recv() {
            delivered.push(frame.bytes[0]);
        }
        delivered
    }

    #[tokio::test]
    async fn reliable_link_keeps_order() {
        let delivered = carry(Link::reliable().latency(Duration::from_millis(1)), 50).await;
        assert_eq!(delivered, (0..50).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn unreliable_link_loses_some_frames() {
        let delivered = carry(Link::unreliable(0.5, 0xBAD5EED), 200).await;
        assert!(!delivered.is_empty());
        assert!(delivered.len() < 200);
        assert!(delivered.windows(2).all(|pair| pair[0] < pair[1]));
        assert!(carry(Link::unreliable(0.0, 1), 20).await.is_empty());
    }
}
