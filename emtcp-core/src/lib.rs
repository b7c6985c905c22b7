//! A TCP connection engine for small networked devices.
//!
//! The engine turns raw TCP segments handed up by an IP layer into
//! connection events for applications, and turns application calls into
//! segments handed back down. It keeps no threads and no clocks of its own:
//! the owner drives it with three kinds of discrete steps.
//!
//! - [`Tcp::process`](protocols::Tcp::process) consumes one inbound frame
//! - [`Tcp::tick`](protocols::Tcp::tick) advances every protocol timer by one
//!   tick of roughly 100 ms
//! - application calls such as [`Tcp::send`](protocols::Tcp::send) act on a
//!   single socket
//!
//! # Organization
//!
//! - [`protocols::tcp`] holds the connection state machine, the segment
//!   codec, congestion control and the socket table
//! - [`protocols::ip`] defines the addresses and the [`IpLayer`] seam the
//!   engine transmits through
//! - [`BufferPool`] is the byte-budgeted allocator send buffers come from
//! - [`TcpConfig`] carries the stack-wide tunables
//!
//! Events are never pushed into application code. They are queued as
//! [`Notification`](protocols::tcp::Notification)s and drained with
//! [`Tcp::poll_event`](protocols::Tcp::poll_event), so an application can
//! never re-enter a control block that is halfway through an update.

mod logging;

pub mod config;
pub use config::{ConfigError, TcpConfig, Tick};

pub mod pool;
pub use pool::{AllocError, BufferPool, PoolBuffer};

pub mod protocols;
pub use protocols::{IpLayer, Tcp};
