use self::{
    congestion::{Congestion, RttEstimator},
    modular_cmp::{mod_ge, mod_gt, mod_in_window, mod_le, mod_lt},
    receive_sequence_space::ReceiveSequenceSpace,
    send_sequence_space::SendSequenceSpace,
    transmit::{backoff, Retransmission, Transmit},
};
pub use self::{segment::Segment, state::State};
use super::{
    tcp_parsing::{TcpHeader, TcpHeaderBuilder},
    AbortReason, ConnectionId, SocketOptions, TcpError, TcpEvent,
};
use crate::{
    config::{TcpConfig, Tick, DEFAULT_MSS, MAX_MSS, TICKS_PER_SECOND},
    logging,
    pool::PoolBuffer,
    protocols::{ip::IpAddress, utility::Endpoint},
};
use std::collections::VecDeque;
use thiserror::Error as ThisError;

mod congestion;
mod modular_cmp;
mod receive_sequence_space;
mod segment;
mod send_sequence_space;
mod state;
mod transmit;


/// A connection control block: the complete state of one TCP endpoint.
///
/// The block never transmits anything itself. Segments it wants sent are
/// queued and collected with [`segments`](Tcb::segments), and events for the
/// application are collected with [`events`](Tcb::events).
#[derive(Debug)]
pub struct Tcb {
    id: ConnectionId,
    state: State,
    config: TcpConfig,
    options: SocketOptions,
    snd: SendSequenceSpace,
    rcv: ReceiveSequenceSpace,
    /// The largest segment the peer accepts
    mss: u16,
    congestion: Congestion,
    rtt: RttEstimator,
    retransmission: Retransmission,
    flags: Flags,
    /// Ticks until an owed acknowledgement is sent, zero when none is owed
    ack_timer: u16,
    /// Ticks until the idle period ends or the next keep-alive probe is due,
    /// zero when disabled
    alive_timer: u32,
    /// Unanswered keep-alive probes
    probes: u8,
    /// Raised while an arriving segment is being processed
    dispatching: bool,
    outgoing: VecDeque<Segment>,
    events: VecDeque<TcpEvent>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Flags {
    /// The application closed while data was still unacknowledged
    closing: bool,
    /// A SYN or SYN+ACK had to be sent more than once
    handshake_retransmitted: bool,
}

/// How an arriving segment relates to the receive window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Arrival {
    /// Starts exactly at RCV.NXT
    InOrder,
    /// Starts before RCV.NXT but carries some new text past it
    Overlap { skip: u32 },
    /// Entirely old, already acknowledged
    Duplicate,
    /// A keep-alive probe, one below RCV.NXT
    KeepAlive,
    /// Inside the window but beyond RCV.NXT
    Future,
    OutOfWindow,
}

impl Tcb {
    /// Creates a block in the CLOSED state.
    pub fn new(config: TcpConfig, options: SocketOptions) -> Self {
        Self {
            id: ConnectionId::default(),
            state: State::Closed,
            config,
            options,
            snd: SendSequenceSpace::default(),
            rcv: ReceiveSequenceSpace {
                wnd: config.receive_window,
                ..Default::default()
            },
            mss: DEFAULT_MSS,
            congestion: Congestion::new(DEFAULT_MSS, false),
            rtt: RttEstimator::new(config.retry_timeout, config.min_rto),
            retransmission: Retransmission::default(),
            flags: Flags::default(),
            ack_timer: 0,
            alive_timer: 0,
            probes: 0,
            dispatching: false,
            outgoing: Default::default(),
            events: Default::default(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn options(&self) -> SocketOptions {
        self.options
    }

    pub fn options_mut(&mut self) -> &mut SocketOptions {
        &mut self.options
    }

    /// Whether the block holds no timers and no buffer
    pub fn is_quiescent(&self) -> bool {
        self.state == State::Closed
            && !self.retransmission.is_pending()
            && !self.retransmission.is_armed()
            && self.ack_timer == 0
            && self.alive_timer == 0
    }

    /// The largest segment the peer accepts, the default of 536 until its SYN
    /// says otherwise
    pub fn mss(&self) -> u16 {
        self.mss
    }

    /// Seconds left until the connection counts as idle, rounded up. Zero
    /// when the idle timer is not running.
    pub fn idle_remaining(&self) -> u32 {
        let per_second = TICKS_PER_SECOND as u32;
        (self.alive_timer + per_second - 1) / per_second
    }

    /// Starts the idle period over as if the peer had just been heard from.
    pub fn reset_timeout(&mut self) -> Result<(), TcpError> {
        if self.state != State::Established {
            Err(TcpError::WrongState(self.state))?
        }
        self.restart_idle_timer();
        Ok(())
    }

    /// Whether a call to [`send`](Self::send) with a full segment would be
    /// accepted
    pub fn send_ready(&self) -> bool {
        matches!(self.state, State::Established | State::CloseWait)
            && !self.flags.closing
            && !self.retransmission.is_pending()
            && self.usable_window() > 0
    }

    /// The largest send the congestion and peer windows allow right now
    pub fn usable_window(&self) -> u32 {
        self.congestion
            .usable_window(self.snd.wnd, self.mss)
            .min(self.mss as u32)
    }

    /// Takes the segments queued for transmission.
    pub fn segments(&mut self) -> Vec<Segment> {
        self.outgoing.drain(..).collect()
    }

    /// Takes the events queued for the application.
    pub fn events(&mut self) -> Vec<TcpEvent> {
        self.events.drain(..).collect()
    }

    /// Binds the block to `port` and waits for connection requests.
    pub fn listen(&mut self, port: u16) -> Result<(), TcpError> {
        if self.state != State::Closed {
            Err(TcpError::WrongState(self.state))?
        }
        self.id = ConnectionId {
            local: Endpoint::new(IpAddress::default(), port),
            remote: Endpoint::default(),
        };
        self.transition(State::Listen);
        Ok(())
    }

    /// Starts an active open towards `id.remote` with initial sequence
    /// number `iss`.
    pub fn open(&mut self, id: ConnectionId, iss: u32) -> Result<(), TcpError> {
        // see 3.10.1
        if self.state != State::Closed {
            Err(TcpError::WrongState(self.state))?
        }
        self.id = id;
        self.snd = SendSequenceSpace::new(iss);
        self.rcv = ReceiveSequenceSpace {
            wnd: self.config.receive_window,
            ..Default::default()
        };
        self.mss = DEFAULT_MSS;
        self.rtt = RttEstimator::new(self.config.retry_timeout, self.config.min_rto);
        self.transition(State::SynSent);
        self.send_syn();
        Ok(())
    }

    /// Queues `buffer` as the single outstanding data segment.
    pub fn send(&mut self, buffer: PoolBuffer, now: Tick) -> Result<(), TcpError> {
        if self.dispatching {
            Err(TcpError::ReenteredCall)?
        }
        if !matches!(self.state, State::Established | State::CloseWait) {
            Err(TcpError::SocketNotConnected)?
        }
        if self.flags.closing {
            Err(TcpError::WrongState(self.state))?
        }
        if buffer.is_empty() {
            Err(TcpError::InvalidParameter)?
        }
        if self.retransmission.is_pending() {
            Err(TcpError::DataUnacked)?
        }
        if buffer.len() > self.mss as usize {
            Err(TcpError::MssExceeded {
                len: buffer.len(),
                mss: self.mss,
            })?
        }
        let window = self.congestion.usable_window(self.snd.wnd, self.mss);
        if buffer.len() as u32 > window {
            Err(TcpError::WindowExhausted {
                len: buffer.len(),
                window,
            })?
        }

        let seq = self.snd.nxt;
        self.snd.nxt = seq.wrapping_add(buffer.len() as u32);
        self.retransmission.push(Transmit {
            seq,
            buffer,
            sent_at: Some(now),
        });
        self.transmit_pending();
        self.retransmission.reset_retries();
        self.retransmission.arm(self.rtt.rto());
        self.restart_idle_timer();
        Ok(())
    }

    /// Starts an orderly close. With data still unacknowledged the FIN waits
    /// until the acknowledgement arrives.
    pub fn close(&mut self) -> Result<(), TcpError> {
        if self.dispatching {
            Err(TcpError::ReenteredCall)?
        }
        match self.state {
            State::Listen | State::SynSent => self.transition(State::Closed),
            State::SynReceived => self.finish_close(),
            State::Established | State::CloseWait => {
                if self.retransmission.is_pending() {
                    self.flags.closing = true;
                } else {
                    self.finish_close();
                }
            }
            State::Closed
            | State::FinWait1
            | State::FinWait2
            | State::Closing
            | State::LastAck
            | State::TimeWait => {}
        }
        Ok(())
    }

    /// Drops the connection at once, resetting the peer if it could still
    /// be waiting on us.
    pub fn abort(&mut self) {
        if self.state.peer_synchronized() {
            self.send_rst();
        }
        if self.state != State::Closed {
            self.transition(State::Closed);
        }
    }

    /// Reopens a receive window that shrank under flow control and tells
    /// the peer about it.
    pub fn reset_window(&mut self) -> Result<(), TcpError> {
        if !self.state.is_connected() {
            Err(TcpError::WrongState(self.state))?
        }
        if self.options.flow_control && self.rcv.wnd != self.config.receive_window {
            self.rcv.wnd = self.config.receive_window;
            if self.state.accepts_text() {
                self.send_ack();
            }
        }
        Ok(())
    }

    /// Processes a segment addressed to this connection.
    pub fn segment_arrives(&mut self, seg: Segment, now: Tick) -> Result<(), SegmentError> {
        self.dispatching = true;
        let result = match self.state {
            State::Closed | State::Listen => Err(SegmentError::NotConnected),
            State::SynSent => self.syn_sent_arrives(seg),
            State::SynReceived => self.syn_received_arrives(seg, now),
            _ => self.synchronized_arrives(seg, now),
        };
        self.dispatching = false;
        result
    }

    // 3.10.7.3
    fn syn_sent_arrives(&mut self, seg: Segment) -> Result<(), SegmentError> {
        let seg = seg.header;

        // First:
        if seg.ctl.ack() && seg.ack != self.snd.nxt {
            if !seg.ctl.rst() {
                let reset = self.header_builder(seg.ack).rst();
                self.enqueue(reset, &[]);
            }
            return Err(if seg.ctl.syn() {
                SegmentError::WrongSynAck {
                    ack: seg.ack,
                    expected: self.snd.nxt,
                }
            } else {
                SegmentError::WrongAck {
                    ack: seg.ack,
                    expected: self.snd.nxt,
                }
            });
        }

        // Second:
        if seg.ctl.rst() {
            if !seg.ctl.ack() {
                return Err(SegmentError::BlindReset);
            }
            self.reset(AbortReason::Reset);
            return Ok(());
        }

        // Fourth:
        if !seg.ctl.syn() {
            return Err(SegmentError::Unexpected);
        }
        self.rcv.irs = seg.seq;
        self.rcv.nxt = seg.seq.wrapping_add(1);
        self.mss = negotiate_mss(seg.mss, self.config.max_segment_size);
        self.snd.wnd = seg.wnd;
        self.snd.wl1 = seg.seq;
        self.snd.wl2 = seg.ack;

        if seg.ctl.ack() {
            self.snd.una = seg.ack;
            self.establish();
            self.send_ack();
        } else {
            // Simultaneous open
            self.transition(State::SynReceived);
            self.send_syn_ack();
        }
        Ok(())
    }

    fn syn_received_arrives(&mut self, seg: Segment, now: Tick) -> Result<(), SegmentError> {
        let header = seg.header;

        if header.ctl.rst() {
            if !self.rst_acceptable(header.seq) {
                return Err(SegmentError::BlindReset);
            }
            self.reset(AbortReason::Reset);
            return Ok(());
        }

        if header.ctl.syn() && !header.ctl.ack() {
            if header.seq == self.rcv.irs {
                // Our SYN+ACK went missing
                self.send_syn_ack();
                return Ok(());
            }
            return Err(SegmentError::Unexpected);
        }

        if !header.ctl.ack() {
            return Err(SegmentError::MissingAck);
        }

        if header.ack != self.snd.nxt {
            let reset = self.header_builder(header.ack).rst();
            self.enqueue(reset, &[]);
            return Err(if header.ctl.syn() {
                SegmentError::WrongSynAck {
                    ack: header.ack,
                    expected: self.snd.nxt,
                }
            } else {
                SegmentError::WrongAck {
                    ack: header.ack,
                    expected: self.snd.nxt,
                }
            });
        }

        if header.ctl.syn() && header.seq != self.rcv.irs {
            return Err(SegmentError::Unexpected);
        }

        self.snd.una = header.ack;
        self.snd.wnd = header.wnd;
        self.snd.wl1 = header.seq;
        self.snd.wl2 = header.ack;
        self.establish();

        if !header.ctl.syn() && (!seg.text.is_empty() || header.ctl.fin()) {
            return self.synchronized_arrives(seg, now);
        }
        Ok(())
    }

    // 3.10.7.4
    fn synchronized_arrives(&mut self, seg: Segment, now: Tick) -> Result<(), SegmentError> {
        let header = seg.header;
        let text_len = seg.text.len() as u32;

        if header.ctl.rst() {
            if !self.rst_acceptable(header.seq) {
                return Err(SegmentError::BlindReset);
            }
            match self.state {
                State::Closing | State::LastAck | State::TimeWait => {
                    self.transition(State::Closed)
                }
                _ => self.reset(AbortReason::Reset),
            }
            return Ok(());
        }

        if header.ctl.syn() {
            if header.seq == self.rcv.irs {
                // A repeat of the SYN or SYN+ACK that opened the connection.
                // The peer did not hear our acknowledgement of it.
                self.send_ack();
                return Ok(());
            }
            return Err(SegmentError::Unexpected);
        }

        if !header.ctl.ack() {
            return Err(SegmentError::MissingAck);
        }

        let arrival = self.classify(&header, text_len);
        if arrival == Arrival::OutOfWindow {
            return Err(SegmentError::OutOfWindow {
                seq: header.seq,
                expected: self.rcv.nxt,
            });
        }

        self.restart_idle_timer();
        self.process_ack(&header, text_len, now)?;
        if self.state == State::Closed {
            return Ok(());
        }

        match arrival {
            Arrival::InOrder => self.process_text(seg.text, header.ctl.fin()),
            Arrival::Overlap { skip } => {
                let mut text = seg.text;
                text.drain(..skip as usize);
                self.process_text(text, header.ctl.fin())
            }
            Arrival::Duplicate => {
                if header.ctl.fin() {
                    match self.state {
                        State::TimeWait => self.retransmission.arm(self.config.time_wait),
                        State::LastAck => {
                            self.resend_fin();
                            return Ok(());
                        }
                        _ => {}
                    }
                }
                self.send_ack();
            }
            Arrival::KeepAlive | Arrival::Future => self.send_ack(),
            Arrival::OutOfWindow => {}
        }
        Ok(())
    }

    fn classify(&self, header: &TcpHeader, text_len: u32) -> Arrival {
        let nxt = self.rcv.nxt;
        if header.seq == nxt {
            return Arrival::InOrder;
        }
        if header.seq.wrapping_add(1) == nxt && text_len <= 1 && !header.ctl.fin() {
            return Arrival::KeepAlive;
        }
        let history = self.config.receive_window as u32;
        if mod_in_window(header.seq, nxt.wrapping_sub(history), history) {
            let text_end = header.seq.wrapping_add(text_len);
            return if mod_gt(text_end, nxt) {
                Arrival::Overlap {
                    skip: nxt.wrapping_sub(header.seq),
                }
            } else {
                Arrival::Duplicate
            };
        }
        if mod_in_window(header.seq, nxt, (self.rcv.wnd as u32).max(1)) {
            return Arrival::Future;
        }
        Arrival::OutOfWindow
    }

    fn process_ack(
        &mut self,
        header: &TcpHeader,
        text_len: u32,
        now: Tick,
    ) -> Result<(), SegmentError> {
        if mod_gt(header.ack, self.snd.nxt) {
            self.send_ack();
            return Err(SegmentError::AckOfUnsent {
                ack: header.ack,
                nxt: self.snd.nxt,
            });
        }
        if mod_lt(header.ack, self.snd.una) {
            // Old acknowledgement
            return Ok(());
        }

        let window_changed = header.wnd != self.snd.wnd;
        if mod_lt(self.snd.wl1, header.seq)
            || (self.snd.wl1 == header.seq && mod_le(self.snd.wl2, header.ack))
        {
            self.snd.wnd = header.wnd;
            self.snd.wl1 = header.seq;
            self.snd.wl2 = header.ack;
        }

        if header.ack == self.snd.una {
            let duplicate = self.retransmission.is_pending()
                && text_len == 0
                && !header.ctl.fin()
                && !window_changed
                && matches!(self.state, State::Established | State::CloseWait);
            if duplicate && self.congestion.on_duplicate_ack() {
                self.fast_retransmit();
            }
            return Ok(());
        }

        self.snd.una = header.ack;
        self.acknowledged(now);
        Ok(())
    }

    /// Reacts to SND.UNA moving forward.
    fn acknowledged(&mut self, now: Tick) {
        let covered = self
            .retransmission
            .pending()
            .map_or(false, |transmit| mod_ge(self.snd.una, transmit.end()));
        if covered {
            if let Some(Transmit {
                sent_at: Some(sent_at),
                ..
            }) = self.retransmission.take()
            {
                self.rtt.sample(now.wrapping_sub(sent_at));
            }
            self.retransmission.reset_retries();
            self.retransmission.disarm();
            self.congestion.on_new_ack();
            logging::congestion_event(
                self.id,
                "ack",
                self.congestion.cwnd,
                self.congestion.ssthresh,
                self.rtt.srtt(),
                self.rtt.rto(),
            );
            self.events.push_back(TcpEvent::AckReceived);
            if self.flags.closing {
                self.finish_close();
            }
        }

        if self.snd.una == self.snd.nxt && self.state.fin_sent() {
            match self.state {
                State::FinWait1 => self.transition(State::FinWait2),
                State::Closing => self.transition(State::TimeWait),
                State::LastAck => self.transition(State::Closed),
                _ => {}
            }
        }
    }

    /// Delivers in-order text and a FIN that follows it.
    ///
    /// Under flow control only the part of the text that fits the advertised
    /// window is taken. Anything past it, a FIN included, is left for the peer
    /// to send again, and the acknowledgement goes out at once so the peer
    /// learns the window. A closed window turns every data segment into a
    /// zero window probe.
    fn process_text(&mut self, mut text: Vec<u8>, mut fin: bool) {
        let mut owe_ack = false;
        let mut trimmed = false;
        if self.options.flow_control && text.len() > self.rcv.wnd as usize {
            tracing::debug!(
                id = ?self.id,
                len = text.len(),
                wnd = self.rcv.wnd,
                "Text beyond the receive window ignored"
            );
            text.truncate(self.rcv.wnd as usize);
            fin = false;
            trimmed = true;
        }

        if !text.is_empty() && self.state.accepts_text() {
            let len = text.len();
            self.rcv.nxt = self.rcv.nxt.wrapping_add(len as u32);
            if self.options.flow_control {
                self.rcv.wnd = self.rcv.wnd.saturating_sub(len as u16);
            }
            self.events.push_back(TcpEvent::DataReceived(text));
            owe_ack = true;
        }

        if fin {
            self.rcv.nxt = self.rcv.nxt.wrapping_add(1);
            match self.state {
                State::Established => self.transition(State::CloseWait),
                State::FinWait1 => self.transition(State::Closing),
                State::FinWait2 => self.transition(State::TimeWait),
                _ => {}
            }
            self.events.push_back(TcpEvent::Closed);
            self.send_ack();
        } else if trimmed {
            self.send_ack();
        } else if owe_ack {
            if self.options.delayed_ack && self.ack_timer == 0 {
                self.ack_timer = self.config.delayed_ack.max(1);
            } else {
                self.send_ack();
            }
        }
    }

    /// Advances every timer of the block by one tick.
    pub fn advance_time(&mut self) {
        if !self.state.is_connected() {
            return;
        }

        if self.ack_timer > 0 {
            self.ack_timer -= 1;
            if self.ack_timer == 0 {
                self.send_ack();
            }
        }

        let expired = self.retransmission.expired();
        match self.state {
            State::SynSent if expired => {
                if self.retransmission.record_retry() > self.config.connect_retries {
                    self.give_up();
                    return;
                }
                self.flags.handshake_retransmitted = true;
                self.send_syn();
                self.retransmission.arm(self.config.initial_retry_timeout);
            }
            State::SynReceived if expired => {
                if self.retransmission.record_retry() > self.config.max_retries {
                    self.give_up();
                    return;
                }
                self.flags.handshake_retransmitted = true;
                self.send_syn_ack();
                self.retransmission.arm(self.config.syn_retry_timeout);
            }
            State::Established | State::CloseWait => {
                if expired && self.retransmission.is_pending() {
                    let retries = self.retransmission.record_retry();
                    if retries > self.config.max_retries {
                        self.give_up();
                        return;
                    }
                    self.congestion.on_timeout();
                    self.retransmission.mark_retransmitted();
                    self.transmit_pending();
                    let timeout = backoff(self.rtt.rto(), retries);
                    self.retransmission.arm(timeout);
                    logging::retransmit_event(self.id, retries, timeout);
                }
                if !self.retransmission.is_pending() {
                    self.idle_tick();
                }
            }
            State::FinWait1 | State::Closing | State::LastAck if expired => {
                let retries = self.retransmission.record_retry();
                if retries > self.config.max_retries {
                    self.give_up();
                    return;
                }
                self.resend_fin();
                self.retransmission.arm(backoff(self.rtt.rto(), retries));
            }
            State::FinWait2 if expired => {
                if self.retransmission.record_retry() > self.config.max_retries {
                    self.give_up();
                    return;
                }
                self.retransmission.arm(self.config.retry_timeout);
            }
            State::TimeWait if expired => self.transition(State::Closed),
            _ => {}
        }
    }

    fn idle_tick(&mut self) {
        if self.alive_timer == 0 {
            return;
        }
        self.alive_timer -= 1;
        if self.alive_timer > 0 {
            return;
        }

        if self.options.keep_alive {
            if self.probes >= self.config.max_retries {
                self.give_up();
                return;
            }
            self.probes += 1;
            let probe = self
                .header_builder(self.snd.nxt.wrapping_sub(1))
                .ack(self.rcv.nxt);
            self.enqueue(probe, &[]);
            self.alive_timer = self.config.retry_timeout as u32;
        } else if !self.flags.closing {
            tracing::debug!(id = ?self.id, "Closing idle connection");
            if self.state == State::Established {
                self.events.push_back(TcpEvent::Closed);
            }
            self.finish_close();
        }
    }

    fn restart_idle_timer(&mut self) {
        self.probes = 0;
        self.alive_timer = self.config.idle_ticks(self.options.timeout);
    }

    fn establish(&mut self) {
        self.congestion = Congestion::new(self.mss, self.flags.handshake_retransmitted);
        self.transition(State::Established);
        self.events.push_back(TcpEvent::Established);
    }

    fn finish_close(&mut self) {
        self.flags.closing = false;
        let next = if self.state == State::CloseWait {
            State::LastAck
        } else {
            State::FinWait1
        };
        let fin = self.header_builder(self.snd.nxt).fin().ack(self.rcv.nxt);
        self.enqueue(fin, &[]);
        self.snd.nxt = self.snd.nxt.wrapping_add(1);
        self.transition(next);
    }

    fn give_up(&mut self) {
        tracing::error!(
            id = ?self.id,
            state = ?self.state,
            retries = self.retransmission.retries(),
            probes = self.probes,
            "Retries exhausted, aborting connection"
        );
        if self.state.peer_synchronized() {
            self.send_rst();
        }
        self.reset(AbortReason::NoRetriesLeft);
    }

    fn reset(&mut self, reason: AbortReason) {
        self.transition(State::Closed);
        self.events.push_back(TcpEvent::Aborted(reason));
    }

    fn fast_retransmit(&mut self) {
        self.retransmission.mark_retransmitted();
        self.transmit_pending();
        self.retransmission.arm(self.rtt.rto());
        logging::congestion_event(
            self.id,
            "fast retransmit",
            self.congestion.cwnd,
            self.congestion.ssthresh,
            self.rtt.srtt(),
            self.rtt.rto(),
        );
    }

    fn transition(&mut self, next: State) {
        logging::state_event(self.id, self.state, next);
        self.state = next;
        match next {
            State::Closed | State::Listen => {
                self.retransmission.clear();
                self.flags = Flags::default();
                self.ack_timer = 0;
                self.alive_timer = 0;
                self.probes = 0;
            }
            State::SynSent => {
                self.retransmission.reset_retries();
                self.retransmission.arm(self.config.initial_retry_timeout);
            }
            State::SynReceived => {
                self.retransmission.reset_retries();
                self.retransmission.arm(self.config.syn_retry_timeout);
            }
            State::Established => {
                self.retransmission.reset_retries();
                self.retransmission.disarm();
                self.restart_idle_timer();
            }
            State::CloseWait => {}
            State::FinWait1 | State::Closing | State::LastAck => {
                self.retransmission.reset_retries();
                self.retransmission.arm(self.rtt.rto());
                self.alive_timer = 0;
            }
            State::FinWait2 => {
                self.retransmission.reset_retries();
                self.retransmission.arm(self.config.retry_timeout);
            }
            State::TimeWait => {
                self.retransmission.clear();
                self.ack_timer = 0;
                self.alive_timer = 0;
                self.retransmission.arm(self.config.time_wait);
            }
        }
    }

    fn rst_acceptable(&self, seq: u32) -> bool {
        mod_in_window(seq, self.rcv.nxt, (self.rcv.wnd as u32).max(1))
    }

    fn header_builder(&self, seq: u32) -> TcpHeaderBuilder {
        TcpHeaderBuilder::new(self.id.local.port, self.id.remote.port, seq)
    }

    fn enqueue(&mut self, header_builder: TcpHeaderBuilder, text: &[u8]) {
        match header_builder.wnd(self.rcv.wnd).build(
            self.id.local.address,
            self.id.remote.address,
            text,
        ) {
            Ok(header) => {
                if header.ctl.ack() {
                    self.ack_timer = 0;
                }
                self.outgoing.push_back(Segment::new(header, text));
            }
            Err(e) => tracing::error!(id = ?self.id, "Could not build segment: {e}"),
        }
    }

    fn send_syn(&mut self) {
        let syn = self
            .header_builder(self.snd.iss)
            .syn()
            .mss(self.config.max_segment_size);
        self.enqueue(syn, &[]);
    }

    fn send_syn_ack(&mut self) {
        let syn_ack = self
            .header_builder(self.snd.iss)
            .syn()
            .ack(self.rcv.nxt)
            .mss(self.config.max_segment_size);
        self.enqueue(syn_ack, &[]);
    }

    fn send_ack(&mut self) {
        let ack = self.header_builder(self.snd.nxt).ack(self.rcv.nxt);
        self.enqueue(ack, &[]);
    }

    fn send_rst(&mut self) {
        let rst = self.header_builder(self.snd.nxt).rst().ack(self.rcv.nxt);
        self.enqueue(rst, &[]);
    }

    fn resend_fin(&mut self) {
        let fin = self
            .header_builder(self.snd.nxt.wrapping_sub(1))
            .fin()
            .ack(self.rcv.nxt);
        self.enqueue(fin, &[]);
    }

    fn transmit_pending(&mut self) {
        let Some((seq, text)) = self
            .retransmission
            .pending()
            .map(|transmit| (transmit.seq, transmit.buffer.to_vec()))
        else {
            return;
        };
        let data = self.header_builder(seq).ack(self.rcv.nxt).psh();
        self.enqueue(data, &text);
    }
}

/// The segment size to use towards a peer that advertised `peer`
fn negotiate_mss(peer: Option<u16>, ours: u16) -> u16 {
    peer.map_or(DEFAULT_MSS, |mss| mss.clamp(DEFAULT_MSS, MAX_MSS))
        .min(ours.max(DEFAULT_MSS))
}

/// A segment that was dropped rather than processed
#[derive(Debug, ThisError, PartialEq, Eq, Clone, Copy)]
pub enum SegmentError {
    #[error("The control block is not connected")]
    NotConnected,
    #[error("SYN+ACK acknowledges {ack} but {expected} was expected")]
    WrongSynAck { ack: u32, expected: u32 },
    #[error("ACK acknowledges {ack} but {expected} was expected")]
    WrongAck { ack: u32, expected: u32 },
    #[error("ACK {ack} is for data beyond SND.NXT {nxt}")]
    AckOfUnsent { ack: u32, nxt: u32 },
    #[error("Sequence number {seq} is outside the receive window at {expected}")]
    OutOfWindow { seq: u32, expected: u32 },
    #[error("RST outside the receive window")]
    BlindReset,
    #[error("Segment without ACK in a synchronized state")]
    MissingAck,
    #[error("Segment does not fit the connection state")]
    Unexpected,
}

/// The outcome of a segment arriving on a listening socket
#[derive(Debug)]
pub enum ListenResult {
    /// A reply to send without creating a connection
    Response(Segment),
    /// A new control block in SYN-RECEIVED
    Tcb(Tcb),
}

#[cfg(test)]
impl ListenResult {
    pub fn response(self) -> Option<Segment> {
        match self {
            ListenResult::Response(response) => Some(response),
            ListenResult::Tcb(_) => None,
        }
    }

    pub fn tcb(self) -> Option<Tcb> {
        match self {
            ListenResult::Response(_) => None,
            ListenResult::Tcb(tcb) => Some(tcb),
        }
    }
}

/// Produces the reply to a segment that matched no socket at all.
pub fn segment_arrives_closed(
    seg: &TcpHeader,
    // Specifically the length of the text. Does not count the header.
    text_len: usize,
    local: IpAddress,
    remote: IpAddress,
) -> Option<Segment> {
    // 3.10.7.1
    if seg.ctl.rst() {
        return None;
    }

    let seg_len = text_len as u32 + seg.ctl.syn() as u32 + seg.ctl.fin() as u32;
    let reply = if seg.ctl.ack() {
        TcpHeaderBuilder::new(seg.dst_port, seg.src_port, seg.ack).rst()
    } else {
        TcpHeaderBuilder::new(seg.dst_port, seg.src_port, 0)
            .rst()
            .ack(seg.seq.wrapping_add(seg_len))
    };
    reply
        .build(local, remote, &[])
        .ok()
        .map(|header| Segment::new(header, []))
}

/// Handles a segment that reached a listening socket. A connection request
/// produces a new control block for the connection.
pub fn segment_arrives_listen(
    seg: &Segment,
    local: IpAddress,
    remote: IpAddress,
    iss: u32,
    config: TcpConfig,
    options: SocketOptions,
) -> Option<ListenResult> {
    // 3.10.7.2
    let header = seg.header;
    if header.ctl.rst() {
        // First:
        // Could not be valid, ignore
        return None;
    }

    if header.ctl.ack() {
        // Second:
        // Bad acknowledgement, reset
        return TcpHeaderBuilder::new(header.dst_port, header.src_port, header.ack)
            .rst()
            .build(local, remote, &[])
            .ok()
            .map(|header| ListenResult::Response(Segment::new(header, [])));
    }

    if !header.ctl.is_connection_request() {
        // Fourth:
        // Any other control or data-bearing segment should be discarded
        return None;
    }

    // Third:
    let mut tcb = Tcb::new(config, options);
    tcb.id = ConnectionId {
        local: Endpoint::new(local, header.dst_port),
        remote: Endpoint::new(remote, header.src_port),
    };
    tcb.snd = SendSequenceSpace {
        wnd: header.wnd,
        wl1: header.seq,
        wl2: header.ack,
        ..SendSequenceSpace::new(iss)
    };
    tcb.rcv.irs = header.seq;
    tcb.rcv.nxt = header.seq.wrapping_add(1);
    tcb.mss = negotiate_mss(header.mss, config.max_segment_size);
    tcb.transition(State::SynReceived);
    tcb.send_syn_ack();
    tcb.events.push_back(TcpEvent::Connect(tcb.id.remote));
    Some(ListenResult::Tcb(tcb))
}
