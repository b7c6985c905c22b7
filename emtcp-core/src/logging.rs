//! Wrapper functions for the structured events the engine records.
//!
//! Each function corresponds to one kind of event (segments, state changes,
//! congestion updates and so on). They are called from inside the engine
//! and never install a subscriber themselves; the owning application decides
//! where events go.

use crate::protocols::tcp::{tcp_parsing::TcpHeader, ConnectionId, State};
use tracing::{event, Level};

/// Which way a segment travelled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Segment event handler.
/// Captures the endpoints, the sequence numbers, the control bits and the
/// text length of every segment handed to or received from the IP layer.
pub fn segment_event(id: ConnectionId, direction: Direction, header: &TcpHeader, text_len: usize) {
    event!(
        target: "SEGMENT",
        Level::TRACE,
        local = %id.local,
        remote = %id.remote,
        direction = ?direction,
        seq = header.seq,
        ack = header.ack,
        wnd = header.wnd,
        ctl = ?header.ctl,
        len = text_len,
    );
}

/// State change event handler.
pub fn state_event(id: ConnectionId, from: State, to: State) {
    if from == to {
        return;
    }
    event!(
        target: "STATE",
        Level::DEBUG,
        local = %id.local,
        remote = %id.remote,
        from = ?from,
        to = ?to,
    );
}

/// Congestion event handler.
/// Used whenever the congestion window moves because of an acknowledgement
/// or a fast retransmit.
pub fn congestion_event(
    id: ConnectionId,
    cause: &str,
    cwnd: u16,
    ssthresh: u16,
    srtt: u16,
    rto: u16,
) {
    event!(
        target: "CONGESTION",
        Level::DEBUG,
        local = %id.local,
        remote = %id.remote,
        cause,
        cwnd,
        ssthresh,
        srtt,
        rto,
    );
}

/// Retransmission timeout event handler.
pub fn retransmit_event(id: ConnectionId, retries: u8, timeout: u16) {
    event!(
        target: "RETRANSMIT",
        Level::INFO,
        local = %id.local,
        remote = %id.remote,
        retries,
        timeout,
    );
}

/// Dropped segment event handler.
/// Used when a segment fails to parse or is rejected by a control block.
pub fn drop_event(local: impl std::fmt::Display, remote: impl std::fmt::Display, reason: &str) {
    event!(
        target: "DROP",
        Level::DEBUG,
        local = %local,
        remote = %remote,
        reason,
    );
}
