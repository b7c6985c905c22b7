//! An implementation of the [Transmission Control
//! Protocol](https://www.rfc-editor.org/rfc/rfc9293.html) for small devices.
//!
//! [`Tcp`] owns every socket of the stack. It is driven from the outside by
//! three kinds of steps: inbound frames through [`Tcp::process`], timer ticks
//! through [`Tcp::tick`], and application calls such as [`Tcp::send`]. Each
//! step runs to completion and queues whatever it produced: segments go
//! straight to the [`IpLayer`], events wait in a queue drained with
//! [`Tcp::poll_event`].

use self::{
    socket_table::{Entry, Lookup, SocketTable},
    tcb::{segment_arrives_closed, segment_arrives_listen, ListenResult, Segment, Tcb},
    tcp_parsing::TcpHeader,
};
pub use self::{
    socket_table::SocketHandle,
    tcb::{SegmentError, State},
};
use crate::{
    config::{TcpConfig, Tick},
    logging::{self, Direction},
    pool::{AllocError, BufferPool, PoolBuffer},
    protocols::{
        ip::{IpAddress, IpLayer, RouteError, TCP_PROTOCOL},
        utility::{Endpoint, Endpoints},
    },
    ConfigError,
};
use rand::{rngs::SmallRng, Rng, SeedableRng};
use std::collections::VecDeque;
use thiserror::Error as ThisError;

mod socket_table;
mod tcb;
pub mod tcp_parsing;

/// Both endpoints of a connection
pub type ConnectionId = Endpoints;

/// A TCP stack. See the module-level documentation for more details.
#[derive(Debug)]
pub struct Tcp<N: IpLayer> {
    config: TcpConfig,
    table: SocketTable,
    ip: N,
    pool: BufferPool,
    notifications: VecDeque<Notification>,
    /// Ticks since the stack was created
    now: Tick,
    rng: SmallRng,
    /// Where the search for the next ephemeral port starts
    next_port: u16,
}

impl<N: IpLayer> Tcp<N> {
    /// Creates a stack that transmits through `ip`.
    pub fn new(config: TcpConfig, ip: N) -> Result<Self, ConfigError> {
        config.validate()?;
        let mut rng = config
            .seed
            .map_or_else(SmallRng::from_entropy, SmallRng::seed_from_u64);
        let next_port = rng.gen_range(config.dynamic_port_start..=config.dynamic_port_end);
        Ok(Self {
            config,
            table: SocketTable::new(config.num_sockets),
            ip,
            pool: BufferPool::new(config.pool_size),
            notifications: Default::default(),
            now: 0,
            rng,
            next_port,
        })
    }

    pub fn config(&self) -> &TcpConfig {
        &self.config
    }

    /// The IP layer the stack transmits through
    pub fn ip(&self) -> &N {
        &self.ip
    }

    pub fn ip_mut(&mut self) -> &mut N {
        &mut self.ip
    }

    /// The pool that send buffers are allocated from
    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Ticks since the stack was created
    pub fn now(&self) -> Tick {
        self.now
    }

    /// The number of allocated sockets, accepted connections included
    pub fn sockets_in_use(&self) -> usize {
        self.table.len()
    }

    pub fn socket_capacity(&self) -> usize {
        self.table.capacity()
    }

    /// Allocates a socket in the CLOSED state.
    pub fn get_socket(&mut self, options: SocketOptions) -> Result<SocketHandle, TcpError> {
        let handle = self
            .table
            .insert(Tcb::new(self.config, options), None)
            .ok_or(TcpError::NoSocketAvailable)?;
        tracing::debug!(%handle, "Allocated socket");
        Ok(handle)
    }

    /// Frees a socket. It must be CLOSED with no timer running.
    pub fn release_socket(&mut self, handle: SocketHandle) -> Result<(), TcpError> {
        let tcb = &self.entry(handle)?.tcb;
        if !tcb.is_quiescent() {
            Err(TcpError::WrongState(tcb.state()))?
        }
        self.table.remove(handle);
        tracing::debug!(%handle, "Released socket");
        Ok(())
    }

    /// Opens a connection to `remote`, from `local_port` when given or from
    /// an ephemeral port otherwise.
    pub fn connect(
        &mut self,
        handle: SocketHandle,
        remote: Endpoint,
        local_port: Option<u16>,
    ) -> Result<(), TcpError> {
        if remote.port == 0 || remote.address.is_unspecified() || local_port == Some(0) {
            Err(TcpError::InvalidParameter)?
        }
        let state = self.entry(handle)?.tcb.state();
        if state != State::Closed {
            Err(TcpError::WrongState(state))?
        }
        let local_address = self.ip.resolve_route(remote.address)?;
        let port = match local_port {
            Some(port) => {
                if self.table.connection_exists(port, remote) {
                    Err(TcpError::InvalidParameter)?
                }
                port
            }
            None => self.ephemeral_port()?,
        };

        let iss = self.rng.gen();
        let id = ConnectionId::new(Endpoint::new(local_address, port), remote);
        self.entry_mut(handle)?.tcb.open(id, iss)?;
        tracing::info!(%handle, local = %id.local, remote = %id.remote, "Connecting");
        self.flush(handle);
        Ok(())
    }

    /// Waits for connection requests on `port`. Every request that arrives
    /// creates a new socket, announced with [`TcpEvent::Connect`].
    pub fn listen(&mut self, handle: SocketHandle, port: u16) -> Result<(), TcpError> {
        if port == 0 {
            Err(TcpError::InvalidParameter)?
        }
        let state = self.entry(handle)?.tcb.state();
        if state != State::Closed {
            Err(TcpError::WrongState(state))?
        }
        if matches!(self.table.lookup(port, Endpoint::default()), Lookup::Listener(_)) {
            Err(TcpError::InvalidParameter)?
        }
        self.entry_mut(handle)?.tcb.listen(port)?;
        tracing::info!(%handle, port, "Listening");
        Ok(())
    }

    /// Allocates a send buffer of `len` bytes from the pool.
    pub fn get_buffer(&self, len: usize) -> Result<PoolBuffer, TcpError> {
        if len == 0 {
            Err(TcpError::InvalidParameter)?
        }
        Ok(self.pool.alloc(len)?)
    }

    /// Sends the buffer as one segment. The buffer is held until it is
    /// acknowledged; no further send is accepted before then.
    pub fn send(&mut self, handle: SocketHandle, buffer: PoolBuffer) -> Result<(), TcpError> {
        let now = self.now;
        self.entry_mut(handle)?.tcb.send(buffer, now)?;
        self.flush(handle);
        Ok(())
    }

    /// Copies `data` into a pool buffer and sends it.
    pub fn send_slice(&mut self, handle: SocketHandle, data: &[u8]) -> Result<(), TcpError> {
        if data.is_empty() {
            Err(TcpError::InvalidParameter)?
        }
        let buffer = self.pool.alloc_from(data)?;
        self.send(handle, buffer)
    }

    /// Closes the sending side of the connection.
    pub fn close(&mut self, handle: SocketHandle) -> Result<(), TcpError> {
        self.entry_mut(handle)?.tcb.close()?;
        self.flush(handle);
        Ok(())
    }

    /// Resets the connection and returns the socket to CLOSED.
    pub fn abort(&mut self, handle: SocketHandle) -> Result<(), TcpError> {
        self.entry_mut(handle)?.tcb.abort();
        self.flush(handle);
        Ok(())
    }

    pub fn state(&self, handle: SocketHandle) -> Result<State, TcpError> {
        Ok(self.entry(handle)?.tcb.state())
    }

    /// Whether a send of one full segment would be accepted now
    pub fn send_ready(&self, handle: SocketHandle) -> Result<bool, TcpError> {
        Ok(self.entry(handle)?.tcb.send_ready())
    }

    /// The largest send accepted right now
    pub fn send_window(&self, handle: SocketHandle) -> Result<u32, TcpError> {
        let tcb = &self.entry(handle)?.tcb;
        Ok(if tcb.send_ready() {
            tcb.usable_window()
        } else {
            0
        })
    }

    /// Reopens the receive window of a flow controlled socket once the
    /// application has consumed the data delivered so far.
    pub fn reset_window(&mut self, handle: SocketHandle) -> Result<(), TcpError> {
        self.entry_mut(handle)?.tcb.reset_window()?;
        self.flush(handle);
        Ok(())
    }

    /// Changes one socket option. Delayed acknowledgement and flow control
    /// can only change before the socket connects.
    pub fn set_option(&mut self, handle: SocketHandle, option: TcpOption) -> Result<(), TcpError> {
        let tcb = &mut self.entry_mut(handle)?.tcb;
        let state = tcb.state();
        let unconnected = matches!(state, State::Closed | State::Listen);
        let options = tcb.options_mut();
        match option {
            TcpOption::KeepAlive(enabled) => options.keep_alive = enabled,
            TcpOption::Timeout(seconds) => options.timeout = (seconds != 0).then_some(seconds),
            TcpOption::Tos(tos) => options.tos = tos,
            TcpOption::TrafficClass(class) => options.traffic_class = class,
            TcpOption::DelayedAck(_) | TcpOption::FlowControl(_) if !unconnected => {
                Err(TcpError::WrongState(state))?
            }
            TcpOption::DelayedAck(enabled) => options.delayed_ack = enabled,
            TcpOption::FlowControl(enabled) => options.flow_control = enabled,
        }
        Ok(())
    }

    /// The current options of a socket
    pub fn option(&self, handle: SocketHandle) -> Result<SocketOptions, TcpError> {
        Ok(self.entry(handle)?.tcb.options())
    }

    /// The remote endpoint of a connected socket
    pub fn peer(&self, handle: SocketHandle) -> Result<Endpoint, TcpError> {
        let tcb = &self.entry(handle)?.tcb;
        if !tcb.state().is_connected() {
            Err(TcpError::SocketNotConnected)?
        }
        Ok(tcb.id().remote)
    }

    /// The local port a socket is bound to, zero when unbound
    pub fn local_port(&self, handle: SocketHandle) -> Result<u16, TcpError> {
        Ok(self.entry(handle)?.tcb.id().local.port)
    }

    /// The largest buffer a single send on this socket may carry
    pub fn mss(&self, handle: SocketHandle) -> Result<u16, TcpError> {
        Ok(self.entry(handle)?.tcb.mss())
    }

    /// Seconds left until a connected socket counts as idle, zero for a
    /// socket that is not connected
    pub fn idle_timer(&self, handle: SocketHandle) -> Result<u32, TcpError> {
        let tcb = &self.entry(handle)?.tcb;
        Ok(if tcb.state().is_connected() {
            tcb.idle_remaining()
        } else {
            0
        })
    }

    /// Restarts the idle timeout of an established connection, keeping it
    /// from closing or being probed for another full period.
    pub fn reset_timeout(&mut self, handle: SocketHandle) -> Result<(), TcpError> {
        self.entry_mut(handle)?.tcb.reset_timeout()
    }

    /// Sets the function a listening socket asks before it accepts a
    /// connection request. Requests it turns down are answered with a reset
    /// and never allocate a socket. `None` accepts everything.
    pub fn set_accept_filter(
        &mut self,
        handle: SocketHandle,
        filter: Option<AcceptFilter>,
    ) -> Result<(), TcpError> {
        self.entry_mut(handle)?.accept_filter = filter;
        Ok(())
    }

    /// Finds the socket a segment with these endpoints would be delivered
    /// to, preferring an established connection over a listener.
    pub fn map_segment(
        &self,
        local_port: u16,
        remote_address: IpAddress,
        remote_port: u16,
    ) -> Option<SocketHandle> {
        match self
            .table
            .lookup(local_port, Endpoint::new(remote_address, remote_port))
        {
            Lookup::Connection(handle) | Lookup::Listener(handle) => Some(handle),
            Lookup::Unmatched => None,
        }
    }

    /// Processes one TCP segment that the IP layer received from `remote`
    /// for the local address `local`. Malformed segments are logged and
    /// dropped.
    pub fn process(&mut self, remote: IpAddress, local: IpAddress, bytes: &[u8]) {
        let (header, text) = match TcpHeader::from_bytes(bytes, remote, local) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!("Dropping segment from {remote}: {e}");
                logging::drop_event(local, remote, &e.to_string());
                return;
            }
        };
        let id = ConnectionId::new(
            Endpoint::new(local, header.dst_port),
            Endpoint::new(remote, header.src_port),
        );
        logging::segment_event(id, Direction::Inbound, &header, text.len());
        let segment = Segment::new(header, text);

        match self.table.lookup(header.dst_port, id.remote) {
            Lookup::Connection(handle) => {
                let now = self.now;
                if let Some(entry) = self.table.get_mut(handle) {
                    if let Err(e) = entry.tcb.segment_arrives(segment, now) {
                        tracing::debug!(%handle, "Segment dropped: {e}");
                        logging::drop_event(id.local, id.remote, &e.to_string());
                    }
                }
                self.flush(handle);
            }
            Lookup::Listener(listener) => self.accept(listener, segment, id),
            Lookup::Unmatched => {
                tracing::debug!(local = %id.local, remote = %id.remote, "No socket for segment");
                if let Some(reset) =
                    segment_arrives_closed(&segment.header, segment.text.len(), local, remote)
                {
                    self.transmit(id, reset, 0);
                }
            }
        }
    }

    fn accept(&mut self, listener: SocketHandle, segment: Segment, id: ConnectionId) {
        let Some((options, accept_filter)) = self
            .table
            .get(listener)
            .map(|entry| (entry.tcb.options(), entry.accept_filter))
        else {
            return;
        };
        let tos = options.tos_for(id.remote.address);
        let rejected = segment.header.ctl.is_connection_request()
            && accept_filter.map_or(false, |accepts| !accepts(id.remote));
        if rejected {
            tracing::info!(%listener, remote = %id.remote, "Connection request rejected");
            if let Some(reset) = segment_arrives_closed(
                &segment.header,
                segment.text.len(),
                id.local.address,
                id.remote.address,
            ) {
                self.transmit(id, reset, tos);
            }
            return;
        }

        let iss = self.rng.gen();
        match segment_arrives_listen(
            &segment,
            id.local.address,
            id.remote.address,
            iss,
            self.config,
            options,
        ) {
            Some(ListenResult::Response(reply)) => self.transmit(id, reply, tos),
            Some(ListenResult::Tcb(tcb)) => match self.table.insert(tcb, Some(listener)) {
                Some(child) => {
                    tracing::info!(%listener, %child, remote = %id.remote, "Accepted connection");
                    self.flush(child);
                }
                None => tracing::warn!(
                    %listener,
                    remote = %id.remote,
                    "No socket available, dropping connection request"
                ),
            },
            None => logging::drop_event(id.local, id.remote, "Not a connection request"),
        }
    }

    /// Advances every protocol timer by one tick.
    pub fn tick(&mut self) {
        self.now = self.now.wrapping_add(1);
        for handle in self.table.handles() {
            if let Some(entry) = self.table.get_mut(handle) {
                entry.tcb.advance_time();
            }
            self.flush(handle);
        }
    }

    /// Takes the oldest pending notification.
    pub fn poll_event(&mut self) -> Option<Notification> {
        self.notifications.pop_front()
    }

    /// Transmits what the socket queued, moves its events to the
    /// notification queue and releases accepted sockets that closed.
    fn flush(&mut self, handle: SocketHandle) {
        let Some(entry) = self.table.get_mut(handle) else {
            return;
        };
        let id = entry.tcb.id();
        let tos = entry.tcb.options().tos_for(id.remote.address);
        let listener = entry.listener;
        let segments = entry.tcb.segments();
        let events = entry.tcb.events();
        let release = listener.is_some() && entry.tcb.state() == State::Closed;

        for segment in segments {
            self.transmit(id, segment, tos);
        }
        self.notifications
            .extend(events.into_iter().map(|event| Notification {
                socket: handle,
                listener,
                event,
            }));
        if release {
            self.table.remove(handle);
            tracing::debug!(%handle, "Released accepted socket");
        }
    }

    fn transmit(&mut self, id: ConnectionId, segment: Segment, tos: u8) {
        logging::segment_event(id, Direction::Outbound, &segment.header, segment.text.len());
        if let Err(e) = self.ip.send(
            id.local.address,
            id.remote.address,
            TCP_PROTOCOL,
            tos,
            segment.serialize(),
        ) {
            tracing::warn!(remote = %id.remote, "Could not transmit segment: {e}");
        }
    }

    fn ephemeral_port(&mut self) -> Result<u16, TcpError> {
        let start = self.config.dynamic_port_start;
        let end = self.config.dynamic_port_end;
        let span = (end - start) as u32 + 1;
        for _ in 0..span {
            let port = self.next_port;
            self.next_port = if port >= end { start } else { port + 1 };
            if !self.table.port_in_use(port) {
                return Ok(port);
            }
        }
        Err(TcpError::NoPortAvailable)
    }

    fn entry(&self, handle: SocketHandle) -> Result<&Entry, TcpError> {
        self.table.get(handle).ok_or(TcpError::SocketNotValid)
    }

    fn entry_mut(&mut self, handle: SocketHandle) -> Result<&mut Entry, TcpError> {
        self.table.get_mut(handle).ok_or(TcpError::SocketNotValid)
    }
}

/// Per-socket behavior switches. Sockets accepted by a listener inherit the
/// listener's options.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketOptions {
    /// Probe an idle peer instead of closing the connection
    pub keep_alive: bool,
    /// Hold acknowledgements of received data for a short while
    pub delayed_ack: bool,
    /// Shrink the receive window as data is delivered, until the
    /// application calls [`Tcp::reset_window`]
    pub flow_control: bool,
    /// Idle timeout in seconds. `None` uses the configured default.
    pub timeout: Option<u16>,
    /// Type of service byte for segments sent over IPv4
    pub tos: u8,
    /// Traffic class byte for segments sent over IPv6
    pub traffic_class: u8,
}

impl SocketOptions {
    /// The type of service or traffic class byte for segments to `remote`
    pub fn tos_for(&self, remote: IpAddress) -> u8 {
        match remote {
            IpAddress::V4(_) => self.tos,
            IpAddress::V6(_) => self.traffic_class,
        }
    }
}

/// Decides whether a listener accepts a connection request from the given
/// remote endpoint
pub type AcceptFilter = fn(Endpoint) -> bool;

/// A single socket option, as passed to [`Tcp::set_option`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TcpOption {
    KeepAlive(bool),
    DelayedAck(bool),
    FlowControl(bool),
    /// Idle timeout in seconds. Zero restores the configured default.
    Timeout(u16),
    Tos(u8),
    TrafficClass(u8),
}

/// Something that happened on a socket
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TcpEvent {
    /// A listener accepted a connection request from the endpoint
    Connect(Endpoint),
    /// The handshake completed
    Established,
    /// In-order data arrived
    DataReceived(Vec<u8>),
    /// The peer closed its sending side
    Closed,
    /// The connection was torn down without an orderly close
    Aborted(AbortReason),
    /// The outstanding send buffer was acknowledged and a new send may go out
    AckReceived,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AbortReason {
    /// The peer reset the connection
    Reset,
    /// The peer stopped answering retransmissions or keep-alive probes
    NoRetriesLeft,
}

/// An event together with the socket it happened on
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Notification {
    pub socket: SocketHandle,
    /// The listener that accepted the socket, if any
    pub listener: Option<SocketHandle>,
    pub event: TcpEvent,
}

/// Why an application call failed
#[derive(Debug, ThisError, PartialEq, Eq, Clone, Copy)]
pub enum TcpError {
    #[error("Invalid parameter")]
    InvalidParameter,
    #[error("Not allowed in state {0:?}")]
    WrongState(State),
    #[error("The socket is not connected")]
    SocketNotConnected,
    #[error("The socket handle is stale or was never allocated")]
    SocketNotValid,
    #[error("The previous send is not yet acknowledged")]
    DataUnacked,
    #[error("{len} bytes exceed the segment size of {mss}")]
    MssExceeded { len: usize, mss: u16 },
    #[error("{len} bytes exceed the usable send window of {window}")]
    WindowExhausted { len: usize, window: u32 },
    /// A send or close reached a control block while it was processing an
    /// arriving segment. Events are only handed out once processing is over,
    /// so calls made through [`Tcp`] never see this. It guards direct use of
    /// a control block.
    #[error("The socket is busy processing a segment")]
    ReenteredCall,
    #[error("Every socket is in use")]
    NoSocketAvailable,
    #[error("Every dynamic port is in use")]
    NoPortAvailable,
    #[error(transparent)]
    OutOfMemory(#[from] AllocError),
    #[error(transparent)]
    NoRouteFound(#[from] RouteError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::{
        ip::{Ipv4Address, Ipv6Address},
        tap::{Frame, Tap},
    };
    use tracing_test::traced_test;

    const LOCAL: Ipv4Address = Ipv4Address::new([10, 0, 0, 1]);
    const REMOTE: Ipv4Address = Ipv4Address::new([203, 0, 113, 5]);

    fn stack() -> Tcp<Tap> {
        let config = TcpConfig {
            num_sockets: 2,
            seed: Some(7),
            ..Default::default()
        };
        Tcp::new(config, Tap::new(LOCAL)).unwrap()
    }

    fn parse(frame: &Frame) -> (TcpHeader, Vec<u8>) {
        let (header, text) = TcpHeader::from_bytes(&frame.bytes, frame.local, frame.remote).unwrap();
        (header, text.to_vec())
    }

    #[test]
    fn connect_sends_one_syn() {
        let mut tcp = stack();
        let socket = tcp.get_socket(SocketOptions::default()).unwrap();
        tcp.connect(socket, Endpoint::new(REMOTE.into(), 80), None)
            .unwrap();

        assert_eq!(tcp.state(socket), Ok(State::SynSent));
        let frames = tcp.ip_mut().frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].protocol, TCP_PROTOCOL);
        assert_eq!(frames[0].remote, REMOTE.into());
        let (syn, text) = parse(&frames[0]);
        assert!(syn.ctl.syn());
        assert!(!syn.ctl.ack());
        assert_eq!(syn.mss, Some(1440));
        assert_eq!(syn.dst_port, 80);
        assert!((49152..=65535).contains(&syn.src_port));
        assert!(text.is_empty());
        assert_eq!(tcp.local_port(socket), Ok(syn.src_port));
        assert_eq!(tcp.peer(socket), Ok(Endpoint::new(REMOTE.into(), 80)));
    }

    #[test]
    fn connect_checks_arguments() {
        let mut tcp = stack();
        let socket = tcp.get_socket(SocketOptions::default()).unwrap();
        assert_eq!(
            tcp.connect(socket, Endpoint::new(REMOTE.into(), 0), None),
            Err(TcpError::InvalidParameter)
        );
        assert_eq!(
            tcp.connect(socket, Endpoint::new(IpAddress::default(), 80), None),
            Err(TcpError::InvalidParameter)
        );
        assert_eq!(tcp.peer(socket), Err(TcpError::SocketNotConnected));

        let mut unrouted = Tcp::new(TcpConfig::default(), Tap::new(LOCAL).unreachable(REMOTE))
            .unwrap();
        let socket = unrouted.get_socket(SocketOptions::default()).unwrap();
        assert_eq!(
            unrouted.connect(socket, Endpoint::new(REMOTE.into(), 80), None),
            Err(TcpError::NoRouteFound(RouteError(REMOTE.into())))
        );
        assert_eq!(unrouted.state(socket), Ok(State::Closed));
        assert!(unrouted.ip().is_empty());
    }

    #[test]
    fn socket_table_exhaustion_and_stale_handles() {
        let mut tcp = stack();
        assert_eq!(tcp.socket_capacity(), 2);
        let a = tcp.get_socket(SocketOptions::default()).unwrap();
        let _b = tcp.get_socket(SocketOptions::default()).unwrap();
        assert_eq!(
            tcp.get_socket(SocketOptions::default()),
            Err(TcpError::NoSocketAvailable)
        );

        tcp.release_socket(a).unwrap();
        assert_eq!(tcp.state(a), Err(TcpError::SocketNotValid));
        assert_eq!(tcp.release_socket(a), Err(TcpError::SocketNotValid));
        let c = tcp.get_socket(SocketOptions::default()).unwrap();
        assert_eq!(c.index(), a.index());
        assert_eq!(tcp.state(a), Err(TcpError::SocketNotValid));
        assert_eq!(tcp.state(c), Ok(State::Closed));
    }

    #[test]
    fn release_requires_closed() {
        let mut tcp = stack();
        let socket = tcp.get_socket(SocketOptions::default()).unwrap();
        tcp.listen(socket, 80).unwrap();
        assert_eq!(
            tcp.release_socket(socket),
            Err(TcpError::WrongState(State::Listen))
        );
        assert_eq!(tcp.listen(socket, 81), Err(TcpError::WrongState(State::Listen)));
        tcp.close(socket).unwrap();
        tcp.release_socket(socket).unwrap();
    }

    #[test]
    fn unmatched_segment_is_reset() {
        let mut tcp = stack();
        let stray = tcp_parsing::TcpHeaderBuilder::new(4000, 80, 1000)
            .ack(555)
            .wnd(100)
            .build(REMOTE.into(), LOCAL.into(), b"hi")
            .unwrap();
        let mut bytes = stray.serialize();
        bytes.extend_from_slice(b"hi");
        tcp.process(REMOTE.into(), LOCAL.into(), &bytes);

        assert_eq!(tcp.sockets_in_use(), 0);
        let frames = tcp.ip_mut().frames();
        assert_eq!(frames.len(), 1);
        let (reset, _) = parse(&frames[0]);
        assert!(reset.ctl.rst());
        assert_eq!(reset.seq, 555);
        assert_eq!((reset.src_port, reset.dst_port), (80, 4000));
        assert_eq!(frames[0].tos, 0);
        assert!(tcp.poll_event().is_none());
    }

    fn syn_from(port: u16) -> Vec<u8> {
        tcp_parsing::TcpHeaderBuilder::new(port, 80, 1000)
            .syn()
            .mss(1440)
            .build(REMOTE.into(), LOCAL.into(), &[])
            .unwrap()
            .serialize()
    }

    #[test]
    #[traced_test]
    fn accepting_needs_a_free_socket() {
        let mut tcp = stack();
        let listener = tcp.get_socket(SocketOptions::default()).unwrap();
        tcp.listen(listener, 80).unwrap();
        let other = tcp.get_socket(SocketOptions::default()).unwrap();
        assert_eq!(tcp.listen(other, 80), Err(TcpError::InvalidParameter));
        tcp.release_socket(other).unwrap();

        tcp.process(REMOTE.into(), LOCAL.into(), &syn_from(4000));
        tcp.process(REMOTE.into(), LOCAL.into(), &syn_from(4001));

        assert_eq!(tcp.sockets_in_use(), 2);
        let frames = tcp.ip_mut().frames();
        assert_eq!(frames.len(), 1);
        let (syn_ack, _) = parse(&frames[0]);
        assert!(syn_ack.ctl.syn() && syn_ack.ctl.ack());
        assert_eq!(syn_ack.ack, 1001);
        assert_eq!(syn_ack.dst_port, 4000);

        let accepted = tcp.poll_event().unwrap();
        assert_eq!(accepted.listener, Some(listener));
        assert_eq!(
            accepted.event,
            TcpEvent::Connect(Endpoint::new(REMOTE.into(), 4000))
        );
        assert_eq!(tcp.state(accepted.socket), Ok(State::SynReceived));
        assert!(tcp.poll_event().is_none());
        assert!(logs_contain("No socket available"));
    }

    #[test]
    fn ephemeral_ports_run_out() {
        let config = TcpConfig {
            num_sockets: 3,
            seed: Some(7),
            dynamic_port_start: 50000,
            dynamic_port_end: 50001,
            ..Default::default()
        };
        let mut tcp = Tcp::new(config, Tap::new(LOCAL)).unwrap();
        let remote = Endpoint::new(REMOTE.into(), 80);
        let mut ports = vec![];
        for _ in 0..2 {
            let socket = tcp.get_socket(SocketOptions::default()).unwrap();
            tcp.connect(socket, remote, None).unwrap();
            ports.push(tcp.local_port(socket).unwrap());
        }
        ports.sort();
        assert_eq!(ports, [50000, 50001]);

        let third = tcp.get_socket(SocketOptions::default()).unwrap();
        assert_eq!(
            tcp.connect(third, remote, None),
            Err(TcpError::NoPortAvailable)
        );
        assert_eq!(tcp.state(third), Ok(State::Closed));
    }

    #[test]
    fn corrupt_segment_is_dropped() {
        let mut tcp = stack();
        let header = tcp_parsing::TcpHeaderBuilder::new(4000, 80, 1000)
            .syn()
            .build(REMOTE.into(), LOCAL.into(), &[])
            .unwrap();
        let mut bytes = header.serialize();
        bytes[4] ^= 0xff;
        tcp.process(REMOTE.into(), LOCAL.into(), &bytes);
        tcp.process(REMOTE.into(), LOCAL.into(), &bytes[..12]);
        assert!(tcp.ip().is_empty());
    }

    #[test]
    fn options_follow_state() {
        let mut tcp = stack();
        let socket = tcp.get_socket(SocketOptions::default()).unwrap();
        tcp.set_option(socket, TcpOption::DelayedAck(true)).unwrap();
        tcp.set_option(socket, TcpOption::Timeout(30)).unwrap();
        tcp.connect(socket, Endpoint::new(REMOTE.into(), 80), None)
            .unwrap();
        assert_eq!(
            tcp.set_option(socket, TcpOption::FlowControl(true)),
            Err(TcpError::WrongState(State::SynSent))
        );
        tcp.set_option(socket, TcpOption::KeepAlive(true)).unwrap();
        tcp.set_option(socket, TcpOption::Tos(0xb8)).unwrap();
        assert_eq!(
            tcp.option(socket),
            Ok(SocketOptions {
                keep_alive: true,
                delayed_ack: true,
                flow_control: false,
                timeout: Some(30),
                tos: 0xb8,
                traffic_class: 0,
            })
        );

        // Zero goes back to the configured timeout
        tcp.set_option(socket, TcpOption::Timeout(0)).unwrap();
        assert_eq!(tcp.option(socket).unwrap().timeout, None);
    }

    #[test]
    fn tos_follows_address_family() {
        let mut tcp = stack();
        let options = SocketOptions {
            tos: 0x10,
            traffic_class: 0x20,
            ..Default::default()
        };
        let socket = tcp.get_socket(options).unwrap();
        tcp.connect(socket, Endpoint::new(REMOTE.into(), 80), None)
            .unwrap();
        assert_eq!(tcp.ip_mut().frames()[0].tos, 0x10);

        // The retransmitted SYN picks up the new value
        tcp.set_option(socket, TcpOption::Tos(0xb8)).unwrap();
        for _ in 0..tcp.config().initial_retry_timeout {
            tcp.tick();
        }
        let frames = tcp.ip_mut().frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].tos, 0xb8);

        let remote = Ipv6Address::new([0xfe, 0x80, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 2]);
        let mut tcp = Tcp::new(TcpConfig::default(), Tap::new(Ipv6Address::LOCALHOST)).unwrap();
        let socket = tcp.get_socket(options).unwrap();
        tcp.connect(socket, Endpoint::new(remote.into(), 80), None)
            .unwrap();
        assert_eq!(tcp.ip_mut().frames()[0].tos, 0x20);
    }

    fn only_port_4000(remote: Endpoint) -> bool {
        remote.port == 4000
    }

    #[test]
    #[traced_test]
    fn accept_filter_refuses_requests() {
        let mut tcp = stack();
        let listener = tcp.get_socket(SocketOptions::default()).unwrap();
        tcp.set_accept_filter(listener, Some(only_port_4000 as AcceptFilter))
            .unwrap();
        tcp.listen(listener, 80).unwrap();

        tcp.process(REMOTE.into(), LOCAL.into(), &syn_from(4001));
        assert_eq!(tcp.sockets_in_use(), 1);
        assert!(tcp.poll_event().is_none());
        let frames = tcp.ip_mut().frames();
        assert_eq!(frames.len(), 1);
        let (reset, _) = parse(&frames[0]);
        assert!(reset.ctl.rst() && reset.ctl.ack());
        assert_eq!(reset.ack, 1001);
        assert_eq!(reset.dst_port, 4001);
        assert!(logs_contain("Connection request rejected"));

        tcp.process(REMOTE.into(), LOCAL.into(), &syn_from(4000));
        assert_eq!(tcp.sockets_in_use(), 2);
        let frames = tcp.ip_mut().frames();
        let (syn_ack, _) = parse(&frames[0]);
        assert!(syn_ack.ctl.syn() && syn_ack.ctl.ack());
        assert_eq!(
            tcp.poll_event().map(|notification| notification.event),
            Some(TcpEvent::Connect(Endpoint::new(REMOTE.into(), 4000)))
        );

        // Without the filter the request gets as far as the full table and is
        // dropped silently instead of being reset
        tcp.set_accept_filter(listener, None).unwrap();
        tcp.process(REMOTE.into(), LOCAL.into(), &syn_from(4001));
        assert!(tcp.ip().is_empty());
        assert!(logs_contain("No socket available"));
    }

    #[test]
    fn buffers_come_from_the_pool() {
        let tcp = stack();
        assert_eq!(tcp.get_buffer(0).unwrap_err(), TcpError::InvalidParameter);
        let buffer = tcp.get_buffer(1000).unwrap();
        assert_eq!(tcp.pool().available(), 16 * 1024 - 1000);
        drop(buffer);
        assert!(matches!(
            tcp.get_buffer(1 << 20),
            Err(TcpError::OutOfMemory(_))
        ));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = TcpConfig {
            max_segment_size: 100,
            ..Default::default()
        };
        assert_eq!(
            Tcp::new(config, Tap::new(LOCAL)).unwrap_err(),
            ConfigError::SegmentSize(100)
        );
    }
}
