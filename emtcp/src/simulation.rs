//! Wiring shared by the prebuilt simulations.

use crate::{
    network::Link,
    worker::{Stack, Worker, WorkerError},
};
use emtcp_core::{
    protocols::{
        tcp::{AbortReason, Notification, TcpEvent},
        Ipv4Address,
    },
    ConfigError, TcpConfig,
};
use std::time::Duration;
use thiserror::Error as ThisError;
use tokio::{
    sync::mpsc,
    task::{JoinError, JoinHandle},
    time::Instant,
};

pub const CLIENT_ADDRESS: Ipv4Address = Ipv4Address::new([10, 0, 0, 1]);
pub const SERVER_ADDRESS: Ipv4Address = Ipv4Address::new([10, 0, 0, 2]);
pub const SERVER_PORT: u16 = 0xbeef;

/// Knobs for a simulation run
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimulationOptions {
    /// Configuration of both stacks
    pub config: TcpConfig,
    /// Wall-clock length of one protocol tick
    pub tick: Duration,
    /// Probability that a frame survives the link, in the range [0, 1]
    pub success_rate: f64,
    pub latency: Duration,
    /// Seeds the links and both stacks
    pub seed: u64,
    /// Bytes moved by the transfer simulation
    pub bytes: usize,
    /// How long a simulation may wait for any single event
    pub patience: Duration,
}

impl Default for SimulationOptions {
    fn default() -> Self {
        Self {
            config: TcpConfig::default(),
            tick: Duration::from_millis(100),
            success_rate: 1.0,
            latency: Duration::ZERO,
            seed: 0xBAD5EED,
            bytes: 16 * 1024,
            patience: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, ThisError)]
pub enum SimulationError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Worker(#[from] WorkerError),
    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("Connection aborted: {0:?}")]
    Aborted(AbortReason),
    #[error("Received {received} bytes that differ from the {sent} bytes sent")]
    Mismatch { sent: usize, received: usize },
    #[error("{0}")]
    Unexpected(String),
    #[error(transparent)]
    Join(#[from] JoinError),
}

/// A client and a server joined by a link in each direction
#[derive(Debug)]
pub struct Pair {
    pub client: Worker,
    pub server: Worker,
    links: [JoinHandle<()>; 2],
}

impl Pair {
    /// Starts both workers and both links.
    pub fn new(options: &SimulationOptions) -> Result<Self, SimulationError> {
        let (client_out_tx, client_out_rx) = mpsc::unbounded_channel();
        let (client_in_tx, client_in_rx) = mpsc::unbounded_channel();
        let (server_out_tx, server_out_rx) = mpsc::unbounded_channel();
        let (server_in_tx, server_in_rx) = mpsc::unbounded_channel();

        let links = [
            Link::unreliable(options.success_rate, options.seed)
                .latency(options.latency)
                .spawn(client_out_rx, server_in_tx),
            Link::unreliable(options.success_rate, options.seed.wrapping_add(1))
                .latency(options.latency)
                .spawn(server_out_rx, client_in_tx),
        ];
        let client = Worker::spawn(
            TcpConfig {
                seed: Some(options.seed.wrapping_add(2)),
                ..options.config
            },
            CLIENT_ADDRESS.into(),
            options.tick,
            client_in_rx,
            client_out_tx,
        )?;
        let server = Worker::spawn(
            TcpConfig {
                seed: Some(options.seed.wrapping_add(3)),
                ..options.config
            },
            SERVER_ADDRESS.into(),
            options.tick,
            server_in_rx,
            server_out_tx,
        )?;
        Ok(Self {
            client,
            server,
            links,
        })
    }

    /// Stops both workers and returns their stacks, client first.
    pub async fn shutdown(self) -> Result<(Stack, Stack), SimulationError> {
        let Self {
            client,
            server,
            links,
        } = self;
        drop(client.handle);
        drop(server.handle);
        let client = client.task.await?;
        let server = server.task.await?;
        for link in links {
            link.abort();
        }
        Ok((client, server))
    }
}

/// Waits up to `patience` for the first notification that `accept` takes.
/// Notifications it passes over are discarded, except that an abort ends the
/// wait early.
pub async fn wait_for(
    notifications: &mut mpsc::UnboundedReceiver<Notification>,
    patience: Duration,
    waiting_for: &'static str,
    mut accept: impl FnMut(&Notification) -> bool,
) -> Result<Notification, SimulationError> {
    let deadline = Instant::now() + patience;
    loop {
        let notification = tokio::time::timeout_at(deadline, notifications.recv())
            .await
            .map_err(|_| SimulationError::Timeout(waiting_for))?
            .ok_or(SimulationError::Worker(WorkerError::Stopped))?;
        if accept(&notification) {
            return Ok(notification);
        }
        if let TcpEvent::Aborted(reason) = notification.event {
            Err(SimulationError::Aborted(reason))?
        }
        tracing::trace!(?notification, waiting_for, "Skipping notification");
    }
}
