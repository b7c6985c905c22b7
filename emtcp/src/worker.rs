//! A tokio task that drives one TCP stack.
//!
//! The worker owns its [`Tcp`] outright. Inbound frames, application
//! commands and timer ticks all arrive as messages and each one runs to
//! completion before the next is taken, so the stack never sees two steps at
//! once. Notifications the stack produces are forwarded to the application
//! after every step.

use emtcp_core::{
    protocols::{
        ip::{RouteError, SendError, TCP_PROTOCOL},
        tap::Frame,
        tcp::{Notification, TcpError},
        IpAddress, IpLayer,
    },
    ConfigError, Tcp, TcpConfig,
};
use std::time::Duration;
use thiserror::Error as ThisError;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::MissedTickBehavior,
};

/// A stack as owned by a worker
pub type Stack = Tcp<ChannelIp>;

type Command = Box<dyn FnOnce(&mut Stack) + Send>;

/// An [`IpLayer`] with a single interface that hands every segment to a
/// channel.
#[derive(Debug, Clone)]
pub struct ChannelIp {
    local: IpAddress,
    outbound: mpsc::UnboundedSender<Frame>,
}

impl ChannelIp {
    pub fn new(local: IpAddress, outbound: mpsc::UnboundedSender<Frame>) -> Self {
        Self { local, outbound }
    }

    pub fn local(&self) -> IpAddress {
        self.local
    }
}

impl IpLayer for ChannelIp {
    fn resolve_route(&self, remote: IpAddress) -> Result<IpAddress, RouteError> {
        if self.local.same_family(&remote) {
            Ok(self.local)
        } else {
            Err(RouteError(remote))
        }
    }

    fn send(
        &mut self,
        local: IpAddress,
        remote: IpAddress,
        protocol: u8,
        tos: u8,
        segment: Vec<u8>,
    ) -> Result<(), SendError> {
        debug_assert_eq!(protocol, TCP_PROTOCOL);
        self.outbound
            .send(Frame {
                local,
                remote,
                protocol,
                tos,
                bytes: segment,
            })
            .map_err(|_| SendError::LinkDown)
    }
}

/// Why a call into a worker failed
#[derive(Debug, ThisError, PartialEq, Eq, Clone, Copy)]
pub enum WorkerError {
    #[error("The worker has stopped")]
    Stopped,
    #[error(transparent)]
    Tcp(#[from] TcpError),
}

/// Lets the application reach the stack of a running worker.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    commands: mpsc::Sender<Command>,
}

impl WorkerHandle {
    /// Runs `f` against the stack on the worker task and returns its result.
    pub async fn call<R, F>(&self, f: F) -> Result<R, WorkerError>
    where
        F: FnOnce(&mut Stack) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let command: Command = Box::new(move |tcp| {
            // The caller may have given up waiting
            let _ = tx.send(f(tcp));
        });
        self.commands
            .send(command)
            .await
            .map_err(|_| WorkerError::Stopped)?;
        rx.await.map_err(|_| WorkerError::Stopped)
    }

    /// Like [`WorkerHandle::call`], for the stack operations that can fail.
    pub async fn try_call<R, F>(&self, f: F) -> Result<R, WorkerError>
    where
        F: FnOnce(&mut Stack) -> Result<R, TcpError> + Send + 'static,
        R: Send + 'static,
    {
        Ok(self.call(f).await??)
    }
}

/// A running worker
#[derive(Debug)]
pub struct Worker {
    pub handle: WorkerHandle,
    /// Every notification of the stack, in order
    pub notifications: mpsc::UnboundedReceiver<Notification>,
    /// Resolves to the stack once every [`WorkerHandle`] is dropped or the
    /// inbound channel closes
    pub task: JoinHandle<Stack>,
}

impl Worker {
    /// Starts a worker for a host with the address `local`. Frames arriving
    /// on `inbound` are processed by the stack and frames it transmits go to
    /// `outbound`. The stack's timers advance once per `tick`.
    pub fn spawn(
        config: TcpConfig,
        local: IpAddress,
        tick: Duration,
        inbound: mpsc::UnboundedReceiver<Frame>,
        outbound: mpsc::UnboundedSender<Frame>,
    ) -> Result<Self, ConfigError> {
        let tcp = Tcp::new(config, ChannelIp::new(local, outbound))?;
        let (commands_tx, commands_rx) = mpsc::channel(32);
        let (notifications_tx, notifications_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(tcp, tick, inbound, commands_rx, notifications_tx));
        Ok(Self {
            handle: WorkerHandle {
                commands: commands_tx,
            },
            notifications: notifications_rx,
            task,
        })
    }
}

async fn run(
    mut tcp: Stack,
    tick: Duration,
    mut inbound: mpsc::UnboundedReceiver<Frame>,
    mut commands: mpsc::Receiver<Command>,
    notifications: mpsc::UnboundedSender<Notification>,
) -> Stack {
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let local = tcp.ip().local();
    tracing::debug!(%local, "Worker started");

    loop {
        tokio::select! {
            frame = inbound.recv() => match frame {
                Some(frame) => tcp.process(frame.local, frame.remote, &frame.bytes),
                None => break,
            },
            command = commands.recv() => match command {
                Some(command) => command(&mut tcp),
                None => break,
            },
            _ = interval.tick() => tcp.tick(),
        }
        while let Some(notification) = tcp.poll_event() {
            // Nobody listening is not an error, the stack keeps running
            let _ = notifications.send(notification);
        }
    }

    tracing::debug!(%local, sockets = tcp.sockets_in_use(), "Worker stopped");
    tcp
}
